//! Load statistics

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, CellAlignment, Table};
use fanload_common::TaskKind;
use serde::Serialize;

use crate::job::QualifiedName;

/// Receives per-task timing and row counts during the drain phase
pub trait StatsReporter: Send + Sync {
    fn report(&self, kind: TaskKind, table: &QualifiedName, seconds: f64, rows: u64);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableStats {
    pub rows: u64,
    /// Sum of writer task durations
    pub seconds: f64,
    pub tasks: usize,
}

/// Per-table totals, safe to share with the orchestrator
#[derive(Debug, Default)]
pub struct LoadStats {
    tables: Mutex<BTreeMap<QualifiedName, TableStats>>,
}

impl LoadStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<QualifiedName, TableStats> {
        self.lock().clone()
    }

    pub fn table(&self, table: &QualifiedName) -> Option<TableStats> {
        self.lock().get(table).cloned()
    }

    pub fn total_rows(&self) -> u64 {
        self.lock().values().map(|t| t.rows).sum()
    }

    pub fn render_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec!["Table", "Rows", "Writers", "Seconds", "Rows/s"]);

        for (name, stats) in self.lock().iter() {
            let rate = if stats.seconds > 0.0 {
                format!("{:.0}", stats.rows as f64 / stats.seconds)
            } else {
                "-".to_string()
            };
            table.add_row(vec![
                Cell::new(name),
                Cell::new(stats.rows).set_alignment(CellAlignment::Right),
                Cell::new(stats.tasks).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.3}", stats.seconds)).set_alignment(CellAlignment::Right),
                Cell::new(rate).set_alignment(CellAlignment::Right),
            ]);
        }
        table.to_string()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let tables: BTreeMap<String, TableStats> = self
            .lock()
            .iter()
            .map(|(name, stats)| (name.to_string(), stats.clone()))
            .collect();
        serde_json::json!({
            "total_rows": self.total_rows(),
            "tables": tables,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<QualifiedName, TableStats>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StatsReporter for LoadStats {
    fn report(&self, kind: TaskKind, table: &QualifiedName, seconds: f64, rows: u64) {
        // Readers re-count the rows their writers load
        if kind != TaskKind::Writer {
            return;
        }
        let mut tables = self.lock();
        let stats = tables.entry(table.clone()).or_default();
        stats.rows += rows;
        stats.seconds += seconds;
        stats.tasks += 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_only_writers_are_tallied() {
        let stats = LoadStats::new();
        let table = QualifiedName::new(Some("public"), "orders");
        stats.report(TaskKind::Writer, &table, 1.5, 100);
        stats.report(TaskKind::Writer, &table, 0.5, 50);
        stats.report(TaskKind::Reader, &table, 2.0, 150);

        assert_eq!(
            stats.table(&table),
            Some(TableStats {
                rows: 150,
                seconds: 2.0,
                tasks: 2
            })
        );
        assert_eq!(stats.total_rows(), 150);
    }

    #[test]
    fn test_render_and_json() {
        let stats = LoadStats::new();
        let table = QualifiedName::new(None, "items");
        stats.report(TaskKind::Writer, &table, 2.0, 10);

        let rendered = stats.render_table();
        assert!(rendered.contains("items"));
        assert!(rendered.contains("Rows/s"));

        let json = stats.to_json();
        assert_eq!(json["total_rows"], 10);
        assert_eq!(json["tables"]["items"]["tasks"], 1);
    }
}
