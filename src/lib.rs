pub mod collector;
pub mod config;
pub mod descriptor;
pub mod log_filter;
pub mod mapper;
pub mod sink;
pub mod source;
pub mod subsystems;
pub mod units;

use std::sync::Arc;
use std::time::{Duration, Instant};

use collector::{settings::SettingsCollector, Collector, Sampler};
use config::{Config, ConfigError, Subsystems};
use futures::StreamExt;
use metrics::{describe_counter, describe_gauge, gauge, increment_counter};
use sink::PrometheusSink;
use source::{postgres::PgConnector, Connector};
use tracing::{debug, info, warn};

const COLLECT_FAILURES: &str = "pgstat_exporter_collect_failures_total";
const COLLECT_SUCCESSES: &str = "pgstat_exporter_collect_successes_total";
const QUERY_FAILURES: &str = "pgstat_exporter_query_failures_total";
const SCRAPE_DURATION: &str = "pgstat_exporter_scrape_duration_seconds";

const SAMPLER_CONCURRENCY: usize = 4;

pub fn init_metrics() {
    describe_counter!(COLLECT_FAILURES, "Number of failed sampler runs");
    describe_counter!(COLLECT_SUCCESSES, "Number of succeeded sampler runs");
    describe_counter!(
        QUERY_FAILURES,
        "Number of subsystem queries skipped because of connection or query errors"
    );
    describe_gauge!(SCRAPE_DURATION, "Duration of the last sampler run in seconds");
}

pub struct Exporter<C> {
    samplers: Arc<Vec<Sampler>>,
    connector: Arc<C>,
    scrape_timeout: Duration,
}

impl<C> Clone for Exporter<C> {
    fn clone(&self) -> Self {
        Exporter {
            samplers: self.samplers.clone(),
            connector: self.connector.clone(),
            scrape_timeout: self.scrape_timeout,
        }
    }
}

impl Exporter<PgConnector> {
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        let connector = PgConnector::new(&config.dsn, config.connect_timeout()?)?;
        let scrape_timeout = config.scrape_timeout()?;

        let builtin = if config.disable_builtin {
            Subsystems::new()
        } else {
            subsystems::builtin()?
        };

        let settings = if config.disable_settings {
            None
        } else {
            match SettingsCollector::new(
                &config.namespace,
                &config.constant_labels,
                config.no_track_mode,
            ) {
                Ok(settings) => Some(settings),
                Err(err) => {
                    warn!(error = %err, "skipping settings sampler");
                    None
                }
            }
        };
        let reserved = settings.as_ref().map(|s| s.names()).unwrap_or_default();

        let collector = Collector::compile(
            &config.namespace,
            &builtin,
            config.subsystems.clone(),
            &config.constant_labels,
            &reserved,
        )
        .with_database_filter(config.database_filter()?);
        info!(subsystems = collector.sets().len(), "subsystems compiled");

        let mut samplers = vec![Sampler::Subsystems(collector)];
        samplers.extend(settings.map(Sampler::Settings));

        Ok(Exporter::new(samplers, connector, scrape_timeout))
    }
}

impl<C: Connector> Exporter<C> {
    pub fn new(samplers: Vec<Sampler>, connector: C, scrape_timeout: Duration) -> Self {
        Exporter {
            samplers: Arc::new(samplers),
            connector: Arc::new(connector),
            scrape_timeout,
        }
    }

    /// Runs every sampler and renders the points in the Prometheus text format.
    pub async fn collect(&self) -> String {
        let runs: Vec<_> = self.samplers.iter().map(|sampler| self.run(sampler)).collect();
        let sinks: Vec<PrometheusSink> = futures::stream::iter(runs)
            .buffer_unordered(SAMPLER_CONCURRENCY)
            .collect()
            .await;

        sink::render_all(&sinks)
    }

    async fn run(&self, sampler: &Sampler) -> PrometheusSink {
        let mut sink = PrometheusSink::new();
        let start = Instant::now();

        let outcome = tokio::time::timeout(
            self.scrape_timeout,
            sampler.collect(self.connector.as_ref(), &mut sink),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                increment_counter!(COLLECT_SUCCESSES, "sampler" => sampler.name());
            }
            Ok(Err(err)) => {
                increment_counter!(COLLECT_FAILURES, "sampler" => sampler.name());
                warn!(sampler = sampler.name(), error = %err, "collect failed");
            }
            Err(_) => {
                increment_counter!(COLLECT_FAILURES, "sampler" => sampler.name());
                warn!(
                    sampler = sampler.name(),
                    timeout = ?self.scrape_timeout,
                    "collect timed out, serving partial data"
                );
            }
        }

        gauge!(SCRAPE_DURATION, start.elapsed().as_secs_f64(), "sampler" => sampler.name());
        if sink.dropped() > 0 {
            debug!(sampler = sampler.name(), dropped = sink.dropped(), "points rejected by the sink");
        }
        sink
    }
}
