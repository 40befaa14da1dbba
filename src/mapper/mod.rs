//! Turns tabular query results into metric points.
//!
//! Column lookups are resolved once per (descriptor, result set) into a
//! [`ColumnPlan`]; mapping a row is then a handful of index reads.

use tracing::debug;

use crate::descriptor::MetricDescriptor;

/// Column names plus rows of nullable text cells, as returned by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(|cells| Row {
            columns: &self.columns,
            cells,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    pub columns: &'a [String],
    pub cells: &'a [Option<String>],
}

impl<'a> Row<'a> {
    fn cell(&self, index: usize) -> Option<&'a str> {
        self.cells.get(index).and_then(|c| c.as_deref())
    }

    /// Cell of the first column called `column`.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.cell(i))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    pub labels: Vec<String>,
}

#[derive(Debug)]
struct GroupColumn<'d> {
    /// Position of the group key among the descriptor's group keys.
    slot: usize,
    column: &'d str,
    indexes: Vec<usize>,
}

#[derive(Debug)]
pub struct ColumnPlan<'d> {
    descriptor: &'d MetricDescriptor,
    /// `None` when a label column is missing from the result.
    labels: Option<Vec<usize>>,
    value: Vec<usize>,
    groups: Vec<GroupColumn<'d>>,
}

fn positions(columns: &[String], name: &str) -> Vec<usize> {
    columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.as_str() == name)
        .map(|(i, _)| i)
        .collect()
}

impl<'d> ColumnPlan<'d> {
    pub fn new(descriptor: &'d MetricDescriptor, columns: &[String]) -> Self {
        let selection = &descriptor.selection;

        let labels = selection
            .labels
            .iter()
            .map(|label| columns.iter().position(|c| c == label))
            .collect::<Option<Vec<_>>>();

        if labels.is_none() {
            debug!(
                metric = %descriptor.name,
                labels = ?selection.labels,
                "label columns missing from query result"
            );
        }

        let value = selection
            .value
            .as_deref()
            .map(|v| positions(columns, v))
            .unwrap_or_default();

        let groups = selection
            .groups
            .iter()
            .enumerate()
            .flat_map(|(slot, (_, group_columns))| {
                group_columns.iter().map(move |column| GroupColumn {
                    slot,
                    column: column.as_str(),
                    indexes: positions(columns, column),
                })
            })
            .collect();

        ColumnPlan {
            descriptor,
            labels,
            value,
            groups,
        }
    }

    pub fn descriptor(&self) -> &'d MetricDescriptor {
        self.descriptor
    }

    /// Maps one row, calling `emit` for every point it yields.
    pub fn map(&self, row: &Row<'_>, database: Option<&str>, mut emit: impl FnMut(MetricPoint)) {
        let Some(label_indexes) = &self.labels else {
            return;
        };

        let mut labels = Vec::with_capacity(self.descriptor.label_names.len());
        if self.descriptor.has_database_label() {
            match database {
                Some(database) => labels.push(database.to_string()),
                None => return,
            }
        }
        labels.extend(
            label_indexes
                .iter()
                .map(|&i| row.cell(i).unwrap_or_default().to_string()),
        );

        let group_count = self.descriptor.selection.groups.len();

        if let Some(value) = self.first_value(row, &self.value, self.value_column()) {
            let mut point_labels = labels.clone();
            point_labels.resize(labels.len() + group_count, String::new());
            emit(self.point(point_labels, value));
        }

        for group in &self.groups {
            let Some(value) = self.first_value(row, &group.indexes, group.column) else {
                continue;
            };

            let mut point_labels = labels.clone();
            point_labels.extend((0..group_count).map(|slot| {
                if slot == group.slot {
                    group.column.to_string()
                } else {
                    String::new()
                }
            }));
            emit(self.point(point_labels, value));
        }
    }

    #[cfg(test)]
    fn map_to_vec(&self, row: &Row<'_>, database: Option<&str>) -> Vec<MetricPoint> {
        let mut points = Vec::new();
        self.map(row, database, |p| points.push(p));
        points
    }

    fn value_column(&self) -> &str {
        self.descriptor.selection.value.as_deref().unwrap_or_default()
    }

    /// First non-empty cell among `indexes` that parses as a number.
    fn first_value(&self, row: &Row<'_>, indexes: &[usize], column: &str) -> Option<f64> {
        let raw = indexes
            .iter()
            .filter_map(|&i| row.cell(i))
            .find(|cell| !cell.is_empty())?;

        match raw.trim().parse::<f64>() {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(
                    metric = %self.descriptor.name,
                    column,
                    value = raw,
                    error = %err,
                    "dropping non-numeric value"
                );
                None
            }
        }
    }

    fn point(&self, labels: Vec<String>, value: f64) -> MetricPoint {
        MetricPoint {
            name: self.descriptor.name.clone(),
            value: value * self.descriptor.factor,
            labels,
        }
    }
}
