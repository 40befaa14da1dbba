use std::net::SocketAddr;

use axum::{routing::get, Extension, Router};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use pgstat_exporter::{log_filter::LogFilter, source::postgres::PgConnector, Exporter};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
struct Opts {
    #[clap(short, long, default_value = "config.yaml")]
    config: String,

    #[clap(short, long, default_value = "127.0.0.1:9890")]
    address: String,

    #[clap(long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();

    tracing_subscriber::registry()
        .with(tracing_logfmt::layer().with_filter(LogFilter::new(opts.log_level)))
        .init();

    if let Err(err) = run(opts).await {
        error!(error = %err, "exporter terminated");
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> Result<(), Box<dyn std::error::Error>> {
    let prometheus_handler = PrometheusBuilder::new().install_recorder()?;
    pgstat_exporter::init_metrics();

    let config = pgstat_exporter::config::parse(&opts.config)?;
    let exporter = Exporter::from_config(config)?;

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(collect_metrics))
        .layer(Extension(exporter))
        .layer(Extension(prometheus_handler))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = opts.address.parse()?;
    info!(address = %addr, "listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "OK"
}

async fn collect_metrics(
    exporter: Extension<Exporter<PgConnector>>,
    prometheus_handler: Extension<PrometheusHandle>,
) -> String {
    let mut body = exporter.collect().await;
    body.push_str(&prometheus_handler.render());
    body
}
