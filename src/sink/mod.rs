use std::collections::{BTreeMap, HashSet};

use prometheus::core::Collector;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, TextEncoder};
use tracing::{debug, warn};

use crate::descriptor::{MetricDescriptor, MetricKind};
use crate::mapper::MetricPoint;

/// Receives points as they are produced.
pub trait Sink {
    fn emit(&mut self, descriptor: &MetricDescriptor, point: MetricPoint);
}

impl Sink for Vec<MetricPoint> {
    fn emit(&mut self, _descriptor: &MetricDescriptor, point: MetricPoint) {
        self.push(point);
    }
}

enum Family {
    Counter(CounterVec),
    Gauge(GaugeVec),
}

impl Family {
    fn new(descriptor: &MetricDescriptor) -> prometheus::Result<Family> {
        let opts = Opts::new(descriptor.name.clone(), descriptor.help.clone())
            .const_labels(descriptor.const_labels.clone().into_iter().collect());
        let label_names: Vec<&str> = descriptor.label_names.iter().map(String::as_str).collect();

        Ok(match descriptor.kind {
            MetricKind::Counter => Family::Counter(CounterVec::new(opts, &label_names)?),
            MetricKind::Gauge => Family::Gauge(GaugeVec::new(opts, &label_names)?),
        })
    }

    fn kind(&self) -> MetricKind {
        match self {
            Family::Counter(_) => MetricKind::Counter,
            Family::Gauge(_) => MetricKind::Gauge,
        }
    }

    fn set(&self, labels: &[&str], value: f64) -> prometheus::Result<()> {
        match self {
            Family::Counter(vec) => {
                let counter = vec.get_metric_with_label_values(labels)?;
                // Fresh per scrape, so this sets the absolute value.
                counter.reset();
                counter.inc_by(value);
            }
            Family::Gauge(vec) => vec.get_metric_with_label_values(labels)?.set(value),
        }
        Ok(())
    }

    fn collect(&self) -> Vec<prometheus::proto::MetricFamily> {
        match self {
            Family::Counter(vec) => vec.collect(),
            Family::Gauge(vec) => vec.collect(),
        }
    }
}

/// Builds the Prometheus text exposition of a single scrape.
#[derive(Default)]
pub struct PrometheusSink {
    families: BTreeMap<String, Family>,
    dropped: usize,
}

impl PrometheusSink {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.families.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Points rejected since the sink was created.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn render(&self) -> String {
        render_all([self])
    }

    fn try_emit(&mut self, descriptor: &MetricDescriptor, point: &MetricPoint) -> prometheus::Result<()> {
        if descriptor.kind == MetricKind::Counter && (point.value.is_nan() || point.value < 0.0) {
            return Err(prometheus::Error::Msg(format!(
                "invalid counter value {}",
                point.value
            )));
        }

        let labels: Vec<&str> = point.labels.iter().map(String::as_str).collect();

        if let Some(family) = self.families.get(&point.name) {
            if family.kind() != descriptor.kind {
                return Err(prometheus::Error::Msg(format!(
                    "{} already registered as {:?}",
                    point.name,
                    family.kind()
                )));
            }
            return family.set(&labels, point.value);
        }

        // Only keep families that hold at least one series; the text encoder
        // rejects empty ones.
        let family = Family::new(descriptor)?;
        family.set(&labels, point.value)?;
        self.families.insert(point.name.clone(), family);
        Ok(())
    }
}

impl Sink for PrometheusSink {
    fn emit(&mut self, descriptor: &MetricDescriptor, point: MetricPoint) {
        if let Err(err) = self.try_emit(descriptor, &point) {
            self.dropped += 1;
            debug!(metric = %point.name, labels = ?point.labels, error = %err, "dropping point");
        }
    }
}

/// Merges the rendered output of several sinks.
pub fn render_all<'a>(sinks: impl IntoIterator<Item = &'a PrometheusSink>) -> String {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut families = Vec::new();
    for sink in sinks {
        for (name, family) in &sink.families {
            if !seen.insert(name.as_str()) {
                warn!(metric = %name, "metric produced by more than one sampler, keeping the first");
                continue;
            }
            families.extend(family.collect());
        }
    }
    families.sort_by(|a, b| a.get_name().cmp(b.get_name()));

    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&families, &mut buffer) {
        warn!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ValueSelection;

    fn descriptor(name: &str, kind: MetricKind, labels: &[&str]) -> MetricDescriptor {
        MetricDescriptor {
            name: name.into(),
            help: "help text".into(),
            kind,
            factor: 1.0,
            label_names: labels.iter().map(|l| l.to_string()).collect(),
            const_labels: BTreeMap::from([("env".to_string(), "test".to_string())]),
            selection: ValueSelection {
                value: None,
                labels: vec![],
                groups: vec![],
                database: false,
            },
        }
    }

    fn point(name: &str, labels: &[&str], value: f64) -> MetricPoint {
        MetricPoint {
            name: name.into(),
            value,
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn test_render_counter_and_gauge() {
        let counter = descriptor("pg_calls_total", MetricKind::Counter, &["database"]);
        let gauge = descriptor("pg_size_bytes", MetricKind::Gauge, &[]);

        let mut sink = PrometheusSink::new();
        sink.emit(&counter, point("pg_calls_total", &["shop"], 12.5));
        sink.emit(&counter, point("pg_calls_total", &["billing"], 3.0));
        sink.emit(&gauge, point("pg_size_bytes", &[], 8192.0));

        let text = sink.render();
        assert!(text.contains("# TYPE pg_calls_total counter"));
        assert!(text.contains(r#"pg_calls_total{database="shop",env="test"} 12.5"#));
        assert!(text.contains(r#"pg_calls_total{database="billing",env="test"} 3"#));
        assert!(text.contains("# TYPE pg_size_bytes gauge"));
        assert!(text.contains(r#"pg_size_bytes{env="test"} 8192"#));
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_repeated_series_keeps_last_value() {
        let counter = descriptor("pg_calls_total", MetricKind::Counter, &[]);

        let mut sink = PrometheusSink::new();
        sink.emit(&counter, point("pg_calls_total", &[], 1.0));
        sink.emit(&counter, point("pg_calls_total", &[], 5.0));

        assert!(sink.render().contains(r#"pg_calls_total{env="test"} 5"#));
    }

    #[test]
    fn test_invalid_points_are_dropped() {
        let counter = descriptor("pg_calls_total", MetricKind::Counter, &["a"]);
        let mut sink = PrometheusSink::new();

        sink.emit(&counter, point("pg_calls_total", &["x", "y"], 1.0));
        sink.emit(&counter, point("pg_calls_total", &["x"], -1.0));

        assert!(sink.is_empty());
        assert_eq!(sink.dropped(), 2);
        assert_eq!(sink.render(), "");
    }

    #[test]
    fn test_nan_counter_is_dropped() {
        let counter = descriptor("pg_calls_total", MetricKind::Counter, &[]);
        let gauge = descriptor("pg_ratio", MetricKind::Gauge, &[]);
        let mut sink = PrometheusSink::new();

        sink.emit(&counter, point("pg_calls_total", &[], "NaN".parse().unwrap()));
        assert!(sink.is_empty());
        assert_eq!(sink.dropped(), 1);

        sink.emit(&gauge, point("pg_ratio", &[], f64::NAN));
        assert_eq!(sink.len(), 1);
        assert!(sink.render().contains(r#"pg_ratio{env="test"} NaN"#));
    }

    #[test]
    fn test_render_all_merges_sinks() {
        let a = descriptor("pg_a", MetricKind::Gauge, &[]);
        let b = descriptor("pg_b", MetricKind::Gauge, &[]);

        let mut first = PrometheusSink::new();
        first.emit(&b, point("pg_b", &[], 2.0));
        let mut second = PrometheusSink::new();
        second.emit(&a, point("pg_a", &[], 1.0));
        second.emit(&b, point("pg_b", &[], 9.0));

        let text = render_all([&first, &second]);
        assert!(text.find("pg_a").unwrap() < text.find("pg_b").unwrap());
        assert!(text.contains(r#"pg_b{env="test"} 2"#));
        assert!(!text.contains(r#"pg_b{env="test"} 9"#));
    }
}
