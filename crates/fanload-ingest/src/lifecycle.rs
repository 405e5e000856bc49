//! Once-per-load table operations around the fan-out
//!
//! Truncation and index handling belong to the whole load, never to a single
//! file. The once-only state lives on the shared [`TargetTable`], so running
//! the coordinator for any clone of a job has the same effect as running it
//! for the original.

use std::sync::Arc;

use fanload_common::{FanloadError, Result};
use tracing::{debug, info};

use crate::config::LoadOptions;
use crate::job::{LoadJob, TargetTable};
use crate::target::{TargetConnection, TargetStore};

pub struct TableLifecycleCoordinator {
    target: Arc<TargetTable>,
    store: Arc<dyn TargetStore>,
    truncate: bool,
    drop_indexes: bool,
}

impl TableLifecycleCoordinator {
    pub fn new(job: &LoadJob, options: &LoadOptions) -> Self {
        Self {
            target: Arc::clone(job.target()),
            store: Arc::clone(job.store()),
            truncate: options.truncate,
            drop_indexes: options.drop_indexes,
        }
    }

    /// Drop indexes (capturing them) and truncate, each at most once.
    ///
    /// Each step uses a connection of its own, separate from any writer's.
    pub async fn pre(&self) -> Result<()> {
        let table = self.target.name();

        if self.drop_indexes && !self.target.indexes_dropped() {
            let mut conn = self.connect("drop indexes").await?;
            let indexes = conn
                .drop_indexes(table)
                .await
                .map_err(|e| self.failure("drop indexes", e))?;
            info!(table = %table, count = indexes.len(), "Dropped indexes");
            self.target.record_dropped_indexes(indexes);
        }

        if self.truncate && self.target.claim_truncate() {
            if let Err(e) = self.truncate_table().await {
                self.target.release_truncate();
                return Err(e);
            }
            info!(table = %table, "Truncated table");
        }

        Ok(())
    }

    async fn truncate_table(&self) -> Result<()> {
        let mut conn = self.connect("truncate").await?;
        conn.truncate(self.target.name())
            .await
            .map_err(|e| self.failure("truncate", e))
    }

    /// Recreate the indexes captured by [`pre`](Self::pre) and end the run's
    /// once-only state. Index recreation is a no-op when index dropping was
    /// not requested or nothing was captured.
    pub async fn post(&self) -> Result<()> {
        self.target.release_truncate();
        if !self.drop_indexes {
            return Ok(());
        }
        let table = self.target.name();
        let Some(indexes) = self.target.take_dropped_indexes() else {
            debug!(table = %table, "No captured indexes to recreate");
            return Ok(());
        };
        if indexes.is_empty() {
            return Ok(());
        }

        let mut conn = self.connect("recreate indexes").await?;
        conn.recreate_indexes(table, &indexes)
            .await
            .map_err(|e| self.failure("recreate indexes", e))?;
        info!(table = %table, count = indexes.len(), "Recreated indexes");
        Ok(())
    }

    async fn connect(&self, step: &'static str) -> Result<Box<dyn TargetConnection>> {
        self.store
            .connect()
            .await
            .map_err(|e| self.failure(step, e))
    }

    fn failure(&self, step: &'static str, err: FanloadError) -> FanloadError {
        FanloadError::Lifecycle {
            step,
            table: self.target.name().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::format::CsvFormat;
    use crate::job::{IndexDefinition, QualifiedName};
    use crate::source::{DataSource, SourceSpec};
    use crate::target::memory::MemoryStore;

    fn table() -> QualifiedName {
        QualifiedName::new(Some("public"), "orders")
    }

    fn job(store: &MemoryStore) -> LoadJob {
        LoadJob::builder(
            DataSource::new(
                SourceSpec::Files(vec!["a.csv".into(), "b.csv".into()]),
                Arc::new(CsvFormat::new()),
            ),
            table(),
            Arc::new(store.clone()),
        )
        .fields(["id"])
        .build()
        .unwrap()
    }

    fn options(truncate: bool, drop_indexes: bool) -> LoadOptions {
        LoadOptions {
            truncate,
            drop_indexes,
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn test_truncate_once_across_clones() {
        let store = MemoryStore::new();
        let job = job(&store);
        let options = options(true, false);

        for path in ["a.csv", "b.csv", "c.csv"] {
            let clone = job.clone_for(path);
            TableLifecycleCoordinator::new(&clone, &options).pre().await.unwrap();
        }
        TableLifecycleCoordinator::new(&job, &options).pre().await.unwrap();

        assert_eq!(store.truncate_calls(), 1);
        assert!(job.target().is_truncated());
    }

    #[tokio::test]
    async fn test_next_run_truncates_again() {
        let store = MemoryStore::new();
        let job = job(&store);
        let coordinator = TableLifecycleCoordinator::new(&job, &options(true, false));

        coordinator.pre().await.unwrap();
        coordinator.pre().await.unwrap();
        coordinator.post().await.unwrap();
        assert!(!job.target().is_truncated());

        coordinator.pre().await.unwrap();
        assert_eq!(store.truncate_calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_truncate_is_not_claimed() {
        let store = MemoryStore::new().fail_truncate();
        let job = job(&store);
        let coordinator = TableLifecycleCoordinator::new(&job, &options(true, false));

        assert!(coordinator.pre().await.is_err());
        assert!(!job.target().is_truncated());
        // a retry within the same run attempts the truncate again
        assert!(coordinator.pre().await.is_err());
        assert_eq!(store.truncate_calls(), 2);
    }

    #[tokio::test]
    async fn test_drop_and_recreate_round_trip() {
        let indexes = vec![
            IndexDefinition::new("orders_pkey", "ALTER TABLE orders ADD PRIMARY KEY (id)")
                .with_constraint("orders_pkey"),
            IndexDefinition::new("orders_date_idx", "CREATE INDEX orders_date_idx ON orders (date)"),
        ];
        let store = MemoryStore::new().with_table(table(), indexes.clone());
        let job = job(&store);
        let coordinator = TableLifecycleCoordinator::new(&job, &options(false, true));

        coordinator.pre().await.unwrap();
        assert!(store.indexes(&table()).is_empty());

        coordinator.post().await.unwrap();
        coordinator.post().await.unwrap();
        assert_eq!(store.indexes(&table()), indexes);
        assert_eq!(store.drop_index_calls(), 1);
        assert_eq!(store.recreate_index_calls(), 1);
    }

    #[tokio::test]
    async fn test_post_is_noop_without_drop_indexes() {
        let store = MemoryStore::new()
            .with_table(table(), vec![IndexDefinition::new("i", "CREATE INDEX i ON orders (id)")]);
        let job = job(&store);
        let coordinator = TableLifecycleCoordinator::new(&job, &options(true, false));

        coordinator.pre().await.unwrap();
        coordinator.post().await.unwrap();
        assert_eq!(store.drop_index_calls(), 0);
        assert_eq!(store.recreate_index_calls(), 0);
        assert_eq!(store.indexes(&table()).len(), 1);
    }

    #[tokio::test]
    async fn test_failures_name_the_step() {
        let store = MemoryStore::new().fail_truncate();
        let job = job(&store);
        let err = TableLifecycleCoordinator::new(&job, &options(true, false))
            .pre()
            .await
            .unwrap_err();
        match err {
            FanloadError::Lifecycle { step, table, .. } => {
                assert_eq!(step, "truncate");
                assert_eq!(table, "public.orders");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_recreate_failure_is_reported_once() {
        let store = MemoryStore::new()
            .with_table(table(), vec![IndexDefinition::new("u", "CREATE UNIQUE INDEX u ON orders (id)")])
            .fail_recreate_indexes();
        let job = job(&store);
        let coordinator = TableLifecycleCoordinator::new(&job, &options(false, true));

        coordinator.pre().await.unwrap();
        assert!(coordinator.post().await.is_err());
        // the captured list was consumed; no second attempt
        coordinator.post().await.unwrap();
        assert_eq!(store.recreate_index_calls(), 1);
    }
}
