//! Server configuration from `pg_settings`, normalised to bytes and seconds.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::CollectError;
use crate::descriptor::{
    check_const_labels, fq_name, DefinitionError, MetricDescriptor, MetricKind, ValueSelection,
};
use crate::mapper::{MetricPoint, Row};
use crate::sink::Sink;
use crate::source::{Connection, Connector};
use crate::units::Unit;

const SETTINGS_QUERY: &str =
    "SELECT name, setting, coalesce(unit, '') AS unit, vartype FROM pg_settings";

const REDACTED: &str = "<redacted>";

fn descriptor(
    name: String,
    help: &str,
    labels: &[&str],
    const_labels: &BTreeMap<String, String>,
) -> Result<MetricDescriptor, DefinitionError> {
    let label_names: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
    check_const_labels(&name, &label_names, const_labels)?;

    Ok(MetricDescriptor {
        name,
        help: help.to_string(),
        kind: MetricKind::Gauge,
        factor: 1.0,
        label_names,
        const_labels: const_labels.clone(),
        selection: ValueSelection {
            value: None,
            labels: vec![],
            groups: vec![],
            database: false,
        },
    })
}

pub struct SettingsCollector {
    info: MetricDescriptor,
    value: MetricDescriptor,
    no_track_mode: bool,
}

impl SettingsCollector {
    pub fn new(
        namespace: &str,
        const_labels: &BTreeMap<String, String>,
        no_track_mode: bool,
    ) -> Result<Self, DefinitionError> {
        Ok(SettingsCollector {
            info: descriptor(
                fq_name(namespace, "service", "settings_info"),
                "Labeled information about Postgres configuration settings.",
                &["name", "setting", "unit", "vartype"],
                const_labels,
            )?,
            value: descriptor(
                fq_name(namespace, "service", "settings_value"),
                "Numeric value of Postgres configuration settings, in bytes or seconds where a unit applies.",
                &["name", "unit"],
                const_labels,
            )?,
            no_track_mode,
        })
    }

    /// Fully-qualified names this collector emits.
    pub fn names(&self) -> [&str; 2] {
        [self.info.name.as_str(), self.value.name.as_str()]
    }

    pub async fn collect<C, S>(&self, connector: &C, sink: &mut S) -> Result<(), CollectError>
    where
        C: Connector,
        S: Sink + Send,
    {
        let result = {
            let mut conn = connector
                .connect(None)
                .await
                .map_err(CollectError::Bootstrap)?;

            match conn.query(SETTINGS_QUERY).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(error = %err, "failed to read settings");
                    return Ok(());
                }
            }
        };

        for row in result.rows() {
            self.map_setting(&row, sink);
        }

        Ok(())
    }

    fn map_setting<S: Sink>(&self, row: &Row<'_>, sink: &mut S) {
        let (Some(name), Some(setting)) = (row.get("name"), row.get("setting")) else {
            return;
        };
        let unit = row.get("unit").unwrap_or_default();
        let vartype = row.get("vartype").unwrap_or_default();

        let shown = if self.no_track_mode && matches!(vartype, "string" | "enum") {
            REDACTED
        } else {
            setting
        };
        sink.emit(
            &self.info,
            MetricPoint {
                name: self.info.name.clone(),
                value: 1.0,
                labels: vec![name.into(), shown.into(), unit.into(), vartype.into()],
            },
        );

        let raw = match vartype {
            "bool" => match setting {
                "on" => 1.0,
                "off" => 0.0,
                _ => return,
            },
            "integer" | "real" => match setting.parse::<f64>() {
                Ok(v) => v,
                Err(err) => {
                    debug!(setting = %name, value = %setting, error = %err, "non-numeric setting");
                    return;
                }
            },
            _ => return,
        };

        let (value, base) = if unit.is_empty() {
            (raw, "")
        } else {
            match Unit::parse(unit) {
                Ok(u) => (u.normalize(raw), u.base.as_str()),
                Err(err) => {
                    warn!(setting = %name, unit = %unit, error = %err, "skipping setting with unknown unit");
                    return;
                }
            }
        };

        sink.emit(
            &self.value,
            MetricPoint {
                name: self.value.name.clone(),
                value,
                labels: vec![name.into(), base.into()],
            },
        );
    }
}
