//! In-process target used by tests and dry runs

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use fanload_common::{FanloadError, Result};
use futures::StreamExt;

use super::{RowBatchStream, TargetConnection, TargetStore};
use crate::job::{IndexDefinition, QualifiedName};
use crate::Row;

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<Row>,
    indexes: Vec<IndexDefinition>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<QualifiedName, MemoryTable>,
    fail_marker: Option<String>,
    fail_truncate: bool,
    fail_recreate: bool,
    connects: usize,
    truncates: usize,
    index_drops: usize,
    index_recreates: usize,
}

/// Shared in-memory tables. Clones see the same data.
///
/// Each `bulk_write` commits all of its rows or none of them.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create a table with the given indexes
    pub fn with_table(self, table: QualifiedName, indexes: Vec<IndexDefinition>) -> Self {
        self.lock().tables.entry(table).or_default().indexes = indexes;
        self
    }

    /// Reject any write that contains a value equal to `marker`
    pub fn fail_rows_containing(self, marker: impl Into<String>) -> Self {
        self.lock().fail_marker = Some(marker.into());
        self
    }

    pub fn fail_truncate(self) -> Self {
        self.lock().fail_truncate = true;
        self
    }

    pub fn fail_recreate_indexes(self) -> Self {
        self.lock().fail_recreate = true;
        self
    }

    pub fn rows(&self, table: &QualifiedName) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &QualifiedName) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Column list of the last write
    pub fn columns(&self, table: &QualifiedName) -> Vec<String> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }

    pub fn indexes(&self, table: &QualifiedName) -> Vec<IndexDefinition> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.indexes.clone())
            .unwrap_or_default()
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connects
    }

    pub fn truncate_calls(&self) -> usize {
        self.lock().truncates
    }

    pub fn drop_index_calls(&self) -> usize {
        self.lock().index_drops
    }

    pub fn recreate_index_calls(&self) -> usize {
        self.lock().index_recreates
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn TargetConnection>> {
        self.lock().connects += 1;
        Ok(Box::new(MemoryConnection {
            store: self.clone(),
        }))
    }
}

struct MemoryConnection {
    store: MemoryStore,
}

#[async_trait]
impl TargetConnection for MemoryConnection {
    async fn truncate(&mut self, table: &QualifiedName) -> Result<()> {
        let mut state = self.store.lock();
        state.truncates += 1;
        if state.fail_truncate {
            return Err(FanloadError::target(format!("permission denied for table {}", table)));
        }
        state.tables.entry(table.clone()).or_default().rows.clear();
        Ok(())
    }

    async fn drop_indexes(&mut self, table: &QualifiedName) -> Result<Vec<IndexDefinition>> {
        let mut state = self.store.lock();
        state.index_drops += 1;
        let entry = state.tables.entry(table.clone()).or_default();
        Ok(std::mem::take(&mut entry.indexes))
    }

    async fn recreate_indexes(
        &mut self,
        table: &QualifiedName,
        indexes: &[IndexDefinition],
    ) -> Result<()> {
        let mut state = self.store.lock();
        state.index_recreates += 1;
        if state.fail_recreate {
            return Err(FanloadError::target(format!(
                "could not create unique index on {}: duplicate key",
                table
            )));
        }
        state
            .tables
            .entry(table.clone())
            .or_default()
            .indexes
            .extend(indexes.iter().cloned());
        Ok(())
    }

    async fn bulk_write(
        &mut self,
        table: &QualifiedName,
        columns: &[String],
        mut rows: RowBatchStream,
    ) -> Result<u64> {
        let marker = self.store.lock().fail_marker.clone();
        let mut pending: Vec<Row> = Vec::new();

        while let Some(batch) = rows.next().await {
            for row in batch? {
                if row.len() != columns.len() {
                    return Err(FanloadError::target(format!(
                        "row has {} values for {} columns",
                        row.len(),
                        columns.len()
                    )));
                }
                if let Some(marker) = &marker {
                    if row.iter().flatten().any(|value| value == marker) {
                        return Err(FanloadError::target(format!(
                            "invalid input value '{}' for {}",
                            marker, table
                        )));
                    }
                }
                pending.push(row);
            }
        }

        let written = pending.len() as u64;
        let mut state = self.store.lock();
        let entry = state.tables.entry(table.clone()).or_default();
        entry.columns = columns.to_vec();
        entry.rows.extend(pending);
        Ok(written)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::stream;

    fn table() -> QualifiedName {
        QualifiedName::new(None, "items")
    }

    fn batches(items: Vec<Result<Vec<Row>>>) -> RowBatchStream {
        stream::iter(items).boxed()
    }

    fn columns() -> Vec<String> {
        vec!["\"id\"".to_string()]
    }

    #[tokio::test]
    async fn test_write_is_all_or_nothing() {
        let store = MemoryStore::new().fail_rows_containing("bad");
        let mut conn = store.connect().await.unwrap();

        let ok = batches(vec![Ok(vec![vec![Some("1".to_string())], vec![None]])]);
        assert_eq!(conn.bulk_write(&table(), &columns(), ok).await.unwrap(), 2);

        let failing = batches(vec![
            Ok(vec![vec![Some("2".to_string())]]),
            Ok(vec![vec![Some("bad".to_string())]]),
        ]);
        assert!(conn.bulk_write(&table(), &columns(), failing).await.is_err());
        assert_eq!(store.row_count(&table()), 2);
    }

    #[tokio::test]
    async fn test_reader_error_aborts_write() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();
        let items = batches(vec![
            Ok(vec![vec![Some("1".to_string())]]),
            Err(FanloadError::Parse("broken".to_string())),
        ]);
        let err = conn.bulk_write(&table(), &columns(), items).await.unwrap_err();
        assert!(matches!(err, FanloadError::Parse(_)));
        assert_eq!(store.row_count(&table()), 0);
    }

    #[tokio::test]
    async fn test_index_drop_and_recreate() {
        let index = IndexDefinition::new("items_pkey", "CREATE UNIQUE INDEX items_pkey ON items (id)");
        let store = MemoryStore::new().with_table(table(), vec![index.clone()]);
        let mut conn = store.connect().await.unwrap();

        let dropped = conn.drop_indexes(&table()).await.unwrap();
        assert_eq!(dropped, vec![index.clone()]);
        assert!(store.indexes(&table()).is_empty());

        conn.recreate_indexes(&table(), &dropped).await.unwrap();
        assert_eq!(store.indexes(&table()), vec![index]);
        assert_eq!(store.drop_index_calls(), 1);
        assert_eq!(store.recreate_index_calls(), 1);
    }
}
