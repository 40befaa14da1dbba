//! Compilation of declarative subsystem definitions into immutable metric
//! descriptors.

use std::collections::BTreeMap;

use regex::Regex;

use crate::config::{MetricSpec, SubsystemDefinition};
use crate::units::{Unit, UnitError};

/// Label injected in front of every label list of a per-database subsystem.
pub const DATABASE_LABEL: &str = "database";

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("invalid databases pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("metric {metric}: unknown usage {usage:?}, expected COUNTER or GAUGE")]
    UnknownKind { metric: String, usage: String },
    #[error("metric {metric}: {source}")]
    Unit { metric: String, source: UnitError },
    #[error("metric {metric}: neither value nor labeled_values is set")]
    NoValue { metric: String },
    #[error("metric {metric}: label {label:?} is defined more than once")]
    LabelConflict { metric: String, label: String },
    #[error("metric {0} is already defined")]
    Duplicate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    fn from_usage(usage: &str) -> Option<MetricKind> {
        if usage.eq_ignore_ascii_case("COUNTER") {
            Some(MetricKind::Counter)
        } else if usage.eq_ignore_ascii_case("GAUGE") {
            Some(MetricKind::Gauge)
        } else {
            None
        }
    }
}

/// Which columns of a row feed a descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSelection {
    /// Column holding the value in plain mode.
    pub value: Option<String>,
    /// Columns supplying label values, in label order, without the injected
    /// database label.
    pub labels: Vec<String>,
    /// Labeled-value groups: extra label name -> columns pivoted into points.
    pub groups: Vec<(String, Vec<String>)>,
    /// The database name is injected as the first label value.
    pub database: bool,
}

#[derive(Debug, Clone)]
pub struct MetricDescriptor {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub factor: f64,
    /// Final label names: injected database label, plain labels, group keys.
    pub label_names: Vec<String>,
    pub const_labels: BTreeMap<String, String>,
    pub selection: ValueSelection,
}

impl MetricDescriptor {
    pub fn has_database_label(&self) -> bool {
        self.selection.database
    }
}

#[derive(Debug, Clone)]
pub struct DescriptorSet {
    pub subsystem: String,
    pub query: String,
    /// `None` means the set runs once against the base database.
    pub databases: Option<Regex>,
    pub descriptors: Vec<MetricDescriptor>,
}

impl DescriptorSet {
    pub fn matches(&self, database: &str) -> bool {
        self.databases
            .as_ref()
            .map_or(false, |re| re.is_match(database))
    }
}

/// Joins the non-empty parts with `_`.
pub fn fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

pub fn compile(
    namespace: &str,
    subsystem: &str,
    definition: &SubsystemDefinition,
    const_labels: &BTreeMap<String, String>,
) -> Result<DescriptorSet, DefinitionError> {
    let databases = definition
        .databases
        .as_deref()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| DefinitionError::Pattern {
                pattern: pattern.to_string(),
                source,
            })
        })
        .transpose()?;

    let descriptors = definition
        .metrics
        .iter()
        .map(|spec| {
            compile_metric(
                namespace,
                subsystem,
                spec,
                databases.is_some(),
                const_labels,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DescriptorSet {
        subsystem: subsystem.to_string(),
        query: definition.query.clone(),
        databases,
        descriptors,
    })
}

fn compile_metric(
    namespace: &str,
    subsystem: &str,
    spec: &MetricSpec,
    per_database: bool,
    const_labels: &BTreeMap<String, String>,
) -> Result<MetricDescriptor, DefinitionError> {
    let kind = MetricKind::from_usage(&spec.usage).ok_or_else(|| DefinitionError::UnknownKind {
        metric: spec.name.clone(),
        usage: spec.usage.clone(),
    })?;

    if spec.value.is_none() && spec.labeled_values.values().all(Vec::is_empty) {
        return Err(DefinitionError::NoValue {
            metric: spec.name.clone(),
        });
    }

    let factor = match &spec.unit {
        Some(unit) => {
            Unit::parse(unit)
                .map_err(|source| DefinitionError::Unit {
                    metric: spec.name.clone(),
                    source,
                })?
                .factor
        }
        None => 1.0,
    };

    let mut label_names: Vec<String> = Vec::new();
    if per_database {
        label_names.push(DATABASE_LABEL.to_string());
    }

    let mut labels = Vec::new();
    for label in &spec.labels {
        if !label_names.contains(label) {
            label_names.push(label.clone());
            labels.push(label.clone());
        }
    }

    let mut groups = Vec::new();
    for (key, columns) in &spec.labeled_values {
        if label_names.contains(key) {
            return Err(DefinitionError::LabelConflict {
                metric: spec.name.clone(),
                label: key.clone(),
            });
        }
        label_names.push(key.clone());

        let mut unique: Vec<String> = Vec::with_capacity(columns.len());
        for column in columns {
            if !unique.contains(column) {
                unique.push(column.clone());
            }
        }
        groups.push((key.clone(), unique));
    }

    check_const_labels(&spec.name, &label_names, const_labels)?;

    let name = fq_name(namespace, subsystem, &spec.name);
    let help = if spec.description.is_empty() {
        name.clone()
    } else {
        spec.description.clone()
    };

    Ok(MetricDescriptor {
        name,
        help,
        kind,
        factor,
        label_names,
        const_labels: const_labels.clone(),
        selection: ValueSelection {
            value: spec.value.clone(),
            labels,
            groups,
            database: per_database,
        },
    })
}

/// Constant labels may not reuse a variable label name.
pub fn check_const_labels(
    metric: &str,
    label_names: &[String],
    const_labels: &BTreeMap<String, String>,
) -> Result<(), DefinitionError> {
    match label_names.iter().find(|l| const_labels.contains_key(*l)) {
        Some(label) => Err(DefinitionError::LabelConflict {
            metric: metric.to_string(),
            label: label.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Subsystems;

    fn definition(yaml: &str) -> SubsystemDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    const TABLES: &str = r#"
query: "SELECT schemaname AS schema, relname AS table, n_live_tup AS live, n_dead_tup AS dead FROM pg_stat_user_tables"
databases: "^app_.*$"
metrics:
  - name: tuples
    usage: GAUGE
    description: Tuples by state.
    labels: [schema, table]
    labeled_values:
      state: [live, dead]
  - name: live_total
    usage: COUNTER
    labels: [schema, table, schema]
    value: live
"#;

    #[test]
    fn test_compile_per_database_set() {
        let set = compile("postgres", "table", &definition(TABLES), &BTreeMap::new()).unwrap();

        assert_eq!(set.subsystem, "table");
        assert!(set.query.starts_with("SELECT schemaname AS schema"));
        assert!(set.matches("app_shop"));
        assert!(!set.matches("postgres"));
        assert_eq!(set.descriptors.len(), 2);

        let tuples = &set.descriptors[0];
        assert_eq!(tuples.name, "postgres_table_tuples");
        assert_eq!(tuples.kind, MetricKind::Gauge);
        assert_eq!(tuples.factor, 1.0);
        assert_eq!(tuples.label_names, vec!["database", "schema", "table", "state"]);
        assert!(tuples.has_database_label());
        assert_eq!(
            tuples.selection.groups,
            vec![("state".to_string(), vec!["live".to_string(), "dead".to_string()])]
        );

        let live = &set.descriptors[1];
        assert_eq!(live.help, "postgres_table_live_total");
        assert_eq!(live.label_names, vec!["database", "schema", "table"]);
        assert_eq!(live.selection.labels, vec!["schema", "table"]);
    }

    #[test]
    fn test_label_count_matches_distinct_sources() {
        let builtin = crate::subsystems::builtin().unwrap();
        let user: Subsystems = Subsystems::from([("table".to_string(), definition(TABLES))]);

        for (name, def) in builtin.iter().chain(user.iter()) {
            let set = compile("postgres", name, def, &BTreeMap::new()).unwrap();
            for (descriptor, spec) in set.descriptors.iter().zip(&def.metrics) {
                let mut sources: Vec<&str> = spec.labels.iter().map(String::as_str).collect();
                sources.extend(spec.labeled_values.keys().map(String::as_str));
                if def.databases.is_some() {
                    sources.push(DATABASE_LABEL);
                }
                sources.sort_unstable();
                sources.dedup();

                assert_eq!(descriptor.label_names.len(), sources.len(), "{}", descriptor.name);
            }
        }
    }

    #[test]
    fn test_compile_is_deterministic() {
        let def = definition(TABLES);
        let labels = BTreeMap::from([("env".to_string(), "prod".to_string())]);

        let a = compile("postgres", "table", &def, &labels).unwrap();
        let b = compile("postgres", "table", &def, &labels).unwrap();

        assert_eq!(a.query, b.query);
        for (x, y) in a.descriptors.iter().zip(&b.descriptors) {
            assert_eq!(x.name, y.name);
            assert_eq!(x.label_names, y.label_names);
            assert_eq!(x.const_labels, y.const_labels);
        }
    }

    #[test]
    fn test_single_database_set_has_no_database_label() {
        let def = definition(
            r#"
query: "SELECT 1 AS one"
metrics:
  - name: one
    usage: gauge
    value: one
    unit: ms
"#,
        );
        let set = compile("", "check", &def, &BTreeMap::new()).unwrap();

        assert!(set.databases.is_none());
        assert!(!set.matches("postgres"));
        let one = &set.descriptors[0];
        assert_eq!(one.name, "check_one");
        assert!(one.label_names.is_empty());
        assert!(!one.has_database_label());
        assert_eq!(one.factor, 0.001);
    }

    #[test]
    fn test_definition_errors() {
        let bad_pattern = definition(
            "query: x\ndatabases: \"[\"\nmetrics: [{name: a, usage: GAUGE, value: a}]\n",
        );
        assert!(matches!(
            compile("p", "s", &bad_pattern, &BTreeMap::new()),
            Err(DefinitionError::Pattern { .. })
        ));

        let bad_kind = definition("query: x\nmetrics: [{name: a, usage: HISTOGRAM, value: a}]\n");
        assert!(matches!(
            compile("p", "s", &bad_kind, &BTreeMap::new()),
            Err(DefinitionError::UnknownKind { .. })
        ));

        let bad_unit =
            definition("query: x\nmetrics: [{name: a, usage: GAUGE, value: a, unit: furlong}]\n");
        assert!(matches!(
            compile("p", "s", &bad_unit, &BTreeMap::new()),
            Err(DefinitionError::Unit { .. })
        ));

        let no_value = definition("query: x\nmetrics: [{name: a, usage: GAUGE, labels: [b]}]\n");
        assert!(matches!(
            compile("p", "s", &no_value, &BTreeMap::new()),
            Err(DefinitionError::NoValue { .. })
        ));
    }

    #[test]
    fn test_group_key_reusing_a_label_is_rejected() {
        let def = definition(
            r#"
query: x
metrics:
  - name: tuples
    usage: GAUGE
    labels: [state]
    labeled_values:
      state: [live, dead]
"#,
        );
        assert!(matches!(
            compile("p", "s", &def, &BTreeMap::new()),
            Err(DefinitionError::LabelConflict { label, .. }) if label == "state"
        ));

        let per_database = definition(
            "query: x\ndatabases: \".*\"\nmetrics: [{name: a, usage: GAUGE, labeled_values: {database: [a]}}]\n",
        );
        assert!(matches!(
            compile("p", "s", &per_database, &BTreeMap::new()),
            Err(DefinitionError::LabelConflict { label, .. }) if label == DATABASE_LABEL
        ));
    }

    #[test]
    fn test_const_label_clash_is_rejected() {
        let labels = BTreeMap::from([("database".to_string(), "x".to_string())]);

        let err = compile("postgres", "table", &definition(TABLES), &labels).unwrap_err();
        assert!(matches!(err, DefinitionError::LabelConflict { label, .. } if label == "database"));

        let unrelated = BTreeMap::from([("env".to_string(), "prod".to_string())]);
        assert!(compile("postgres", "table", &definition(TABLES), &unrelated).is_ok());
    }

    #[test]
    fn test_fq_name() {
        assert_eq!(fq_name("postgres", "bgwriter", "checkpoints_total"), "postgres_bgwriter_checkpoints_total");
        assert_eq!(fq_name("", "bgwriter", "x"), "bgwriter_x");
        assert_eq!(fq_name("postgres", "", "up"), "postgres_up");
    }
}
