use tracing::{metadata::LevelFilter, Level, Metadata};
use tracing_subscriber::layer::{Context, Filter};

pub struct LogFilter {
    level: Level,
}

impl LogFilter {
    pub fn new(level: Level) -> Self {
        LogFilter { level }
    }
}

impl<S> Filter<S> for LogFilter {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        let target = meta.target();

        // the exporter itself, and tower_http response logs
        meta.level() <= &self.level
            && (target.starts_with("pgstat_exporter")
                || target.starts_with("tower_http::trace::on_response"))
    }

    fn max_level_hint(&self) -> Option<LevelFilter> {
        Some(LevelFilter::from(self.level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, subscriber::with_default, warn};
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct Count(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for Count {
        fn on_event(&self, _event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_filters_by_target_and_level() {
        let seen = Arc::new(AtomicUsize::new(0));
        let subscriber = Registry::default()
            .with(Count(seen.clone()).with_filter(LogFilter::new(Level::INFO)));

        with_default(subscriber, || {
            info!(target: "pgstat_exporter::collector", "kept");
            warn!(target: "pgstat_exporter", "kept");
            debug!(target: "pgstat_exporter::mapper", "too verbose");
            info!(target: "tokio_postgres::connection", "other crate");
        });

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
