use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::units::{self, UnitError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not open config file {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid database pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("invalid dsn: {0}")]
    Dsn(#[from] tokio_postgres::Error),
    #[error("invalid duration for {field}: {source}")]
    Duration {
        field: &'static str,
        source: UnitError,
    },
}

/// One metric inside a subsystem definition.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetricSpec {
    #[serde(alias = "short_name")]
    pub name: String,
    pub usage: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Extra label name -> source columns; each column becomes one point
    /// labelled with the column's own name.
    #[serde(default)]
    pub labeled_values: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubsystemDefinition {
    pub query: String,
    #[serde(default)]
    pub databases: Option<String>,
    pub metrics: Vec<MetricSpec>,
}

/// Subsystem definitions keyed by subsystem name.
pub type Subsystems = BTreeMap<String, SubsystemDefinition>;

fn default_namespace() -> String {
    "postgres".into()
}

fn default_scrape_timeout() -> String {
    "10s".into()
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub dsn: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Global allow pattern applied to discovered database names.
    #[serde(default)]
    pub databases: Option<String>,
    #[serde(default)]
    pub no_track_mode: bool,
    #[serde(default)]
    pub constant_labels: BTreeMap<String, String>,
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout: String,
    #[serde(default)]
    pub connect_timeout: Option<String>,
    #[serde(default)]
    pub disable_builtin: bool,
    #[serde(default)]
    pub disable_settings: bool,
    #[serde(default)]
    pub subsystems: Subsystems,
}

impl Config {
    pub fn from_yaml(data: &str) -> Result<Config, ConfigError> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn scrape_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("scrape_timeout", &self.scrape_timeout)
    }

    pub fn connect_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        self.connect_timeout
            .as_deref()
            .map(|s| parse_duration("connect_timeout", s))
            .transpose()
    }

    pub fn database_filter(&self) -> Result<Option<regex::Regex>, ConfigError> {
        self.databases
            .as_deref()
            .map(|pattern| {
                regex::Regex::new(pattern).map_err(|source| ConfigError::Pattern {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .transpose()
    }
}

fn parse_duration(field: &'static str, s: &str) -> Result<Duration, ConfigError> {
    units::parse_seconds(s)
        .map(Duration::from_secs_f64)
        .map_err(|source| ConfigError::Duration { field, source })
}

pub fn parse(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ConfigError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);

    Ok(serde_yaml::from_reader(reader)?)
}
