//! Per-scrape orchestration of descriptor sets against one or many databases.
//!
//! Sets without a databases pattern run once over a connection to the base
//! target. Sets with a pattern fan out: databases are discovered over a
//! bootstrap connection, then every (database, set) pair that matches gets
//! its own short-lived connection. Connections are opened and closed one at a
//! time.

use std::collections::{BTreeMap, HashSet};

use metrics::increment_counter;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::Subsystems;
use crate::descriptor::{self, DefinitionError, DescriptorSet};
use crate::mapper::ColumnPlan;
use crate::sink::Sink;
use crate::source::{Connection, Connector, SourceError};
use crate::subsystems;

pub mod settings;

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("bootstrap connection failed: {0}")]
    Bootstrap(#[source] SourceError),
}

pub struct Collector {
    sets: Vec<DescriptorSet>,
    /// Global allow pattern for discovered databases.
    databases: Option<Regex>,
}

impl Collector {
    pub fn new(sets: Vec<DescriptorSet>) -> Self {
        Collector {
            sets,
            databases: None,
        }
    }

    /// Resolves collisions between built-in and user subsystems and compiles
    /// the survivors. Subsystems that fail to compile, or that reuse one of
    /// the `reserved` names emitted by other samplers, are logged and skipped.
    pub fn compile(
        namespace: &str,
        builtin: &Subsystems,
        mut user: Subsystems,
        const_labels: &BTreeMap<String, String>,
        reserved: &[&str],
    ) -> Self {
        subsystems::resolve_collisions(builtin, &mut user);

        let mut names: HashSet<String> = reserved.iter().map(|n| n.to_string()).collect();
        let mut sets = Vec::new();
        for (name, definition) in builtin.iter().chain(user.iter()) {
            let compiled = descriptor::compile(namespace, name, definition, const_labels)
                .and_then(|set| claim_names(&mut names, set));

            match compiled {
                Ok(set) => sets.push(set),
                Err(err) => warn!(subsystem = %name, error = %err, "skipping subsystem"),
            }
        }

        Collector::new(sets)
    }

    pub fn with_database_filter(mut self, databases: Option<Regex>) -> Self {
        self.databases = databases;
        self
    }

    pub fn sets(&self) -> &[DescriptorSet] {
        &self.sets
    }

    pub fn needs_multi_db(&self) -> bool {
        self.sets.iter().any(|s| s.databases.is_some())
    }

    fn allowed(&self, database: &str) -> bool {
        self.databases
            .as_ref()
            .map_or(true, |re| re.is_match(database))
    }

    /// Runs every set once. Only a failed bootstrap connection is returned as
    /// an error; narrower failures are logged and skipped. Points already
    /// pushed into `sink` stay there whatever the outcome.
    pub async fn collect<C, S>(&self, connector: &C, sink: &mut S) -> Result<(), CollectError>
    where
        C: Connector,
        S: Sink + Send,
    {
        let multi = if self.needs_multi_db() {
            self.collect_databases(connector, sink).await
        } else {
            Ok(())
        };

        let single = if self.sets.iter().any(|s| s.databases.is_none()) {
            self.collect_default(connector, sink).await
        } else {
            Ok(())
        };

        multi.and(single)
    }

    async fn collect_databases<C, S>(&self, connector: &C, sink: &mut S) -> Result<(), CollectError>
    where
        C: Connector,
        S: Sink + Send,
    {
        let candidates = {
            let mut bootstrap = connector
                .connect(None)
                .await
                .map_err(CollectError::Bootstrap)?;

            match bootstrap.databases().await {
                Ok(databases) => databases,
                Err(err) => {
                    warn!(error = %err, "failed to list databases, skipping per-database subsystems");
                    return Ok(());
                }
            }
        };

        for database in candidates.iter().map(String::as_str).filter(|db| self.allowed(db)) {
            for set in self.sets.iter().filter(|s| s.matches(database)) {
                let mut conn = match connector.connect(Some(database)).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        increment_counter!(crate::QUERY_FAILURES, "subsystem" => set.subsystem.clone());
                        warn!(database = %database, subsystem = %set.subsystem, error = %err, "connect failed");
                        continue;
                    }
                };

                if let Err(err) = run_set(&mut conn, set, Some(database), sink).await {
                    increment_counter!(crate::QUERY_FAILURES, "subsystem" => set.subsystem.clone());
                    warn!(database = %database, subsystem = %set.subsystem, error = %err, "query failed");
                }
            }
        }

        Ok(())
    }

    async fn collect_default<C, S>(&self, connector: &C, sink: &mut S) -> Result<(), CollectError>
    where
        C: Connector,
        S: Sink + Send,
    {
        let mut conn = connector
            .connect(None)
            .await
            .map_err(CollectError::Bootstrap)?;

        for set in self.sets.iter().filter(|s| s.databases.is_none()) {
            if let Err(err) = run_set(&mut conn, set, None, sink).await {
                increment_counter!(crate::QUERY_FAILURES, "subsystem" => set.subsystem.clone());
                warn!(subsystem = %set.subsystem, error = %err, "query failed");
            }
        }

        Ok(())
    }
}

/// Rejects a set that would reuse a metric name already taken.
fn claim_names(
    names: &mut HashSet<String>,
    set: DescriptorSet,
) -> Result<DescriptorSet, DefinitionError> {
    let mut claimed = HashSet::new();
    for d in &set.descriptors {
        if names.contains(&d.name) || !claimed.insert(d.name.clone()) {
            return Err(DefinitionError::Duplicate(d.name.clone()));
        }
    }
    names.extend(claimed);
    Ok(set)
}

async fn run_set<Conn, S>(
    conn: &mut Conn,
    set: &DescriptorSet,
    database: Option<&str>,
    sink: &mut S,
) -> Result<(), SourceError>
where
    Conn: Connection,
    S: Sink,
{
    let result = conn.query(&set.query).await?;

    let plans: Vec<ColumnPlan<'_>> = set
        .descriptors
        .iter()
        .map(|d| ColumnPlan::new(d, &result.columns))
        .collect();

    let mut emitted = 0usize;
    for row in result.rows() {
        for plan in &plans {
            plan.map(&row, database, |point| {
                sink.emit(plan.descriptor(), point);
                emitted += 1;
            });
        }
    }

    debug!(
        subsystem = %set.subsystem,
        database = database.unwrap_or_default(),
        rows = result.rows.len(),
        emitted,
        "subsystem collected"
    );
    Ok(())
}

/// A unit of collection with its own connections.
pub enum Sampler {
    Subsystems(Collector),
    Settings(settings::SettingsCollector),
}

impl Sampler {
    pub fn name(&self) -> &'static str {
        match self {
            Sampler::Subsystems(_) => "subsystems",
            Sampler::Settings(_) => "settings",
        }
    }

    pub async fn collect<C, S>(&self, connector: &C, sink: &mut S) -> Result<(), CollectError>
    where
        C: Connector,
        S: Sink + Send,
    {
        match self {
            Sampler::Subsystems(collector) => collector.collect(connector, sink).await,
            Sampler::Settings(collector) => collector.collect(connector, sink).await,
        }
    }
}
