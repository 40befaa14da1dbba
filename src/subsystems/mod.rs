//! Built-in subsystem catalogue and collision handling between built-in and
//! user-defined subsystems.

use std::collections::HashSet;

use tracing::warn;

use crate::config::Subsystems;

const BUILTIN: &str = include_str!("builtin.yaml");

/// Subsystems shipped with the exporter.
pub fn builtin() -> Result<Subsystems, serde_yaml::Error> {
    serde_yaml::from_str(BUILTIN)
}

/// Drops every user subsystem that shares its name with a built-in subsystem
/// and defines at least one metric with the same short name. The whole user
/// subsystem goes, not just the colliding metric. Built-ins are never touched.
///
/// Returns the names of the removed subsystems.
pub fn resolve_collisions(builtin: &Subsystems, user: &mut Subsystems) -> Vec<String> {
    let colliding: Vec<String> = user
        .iter()
        .filter_map(|(name, definition)| {
            let builtin = builtin.get(name)?;
            let builtin_names: HashSet<&str> =
                builtin.metrics.iter().map(|m| m.name.as_str()).collect();

            let metric = definition
                .metrics
                .iter()
                .find(|m| builtin_names.contains(m.name.as_str()))?;

            warn!(
                subsystem = %name,
                metric = %metric.name,
                "user-defined subsystem collides with built-in metric, skipping it"
            );
            Some(name.clone())
        })
        .collect();

    for name in &colliding {
        user.remove(name);
    }

    colliding
}
