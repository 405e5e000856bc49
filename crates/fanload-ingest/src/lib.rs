//! Fanload Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Parallel bulk loading of one logical, possibly multi-file, source into a
//! single target table.
//!
//! # Pipeline
//!
//! 1. The [`FanoutOrchestrator`] expands the job's source into physical paths
//!    and clones the [`LoadJob`] once per path.
//! 2. Each clone contributes `concurrency` load units to a shared
//!    [`WorkerPool`]; a unit is one reader task and one writer task.
//! 3. Readers run the [`RowStreamReader`] (skip lines, optional header) and the
//!    [`FieldProjector`] (field-to-column mapping and transforms); writers
//!    bulk-write the projected rows through a [`TargetStore`] connection.
//! 4. The [`TableLifecycleCoordinator`] truncates and drops/recreates indexes
//!    once around the whole fan-out.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fanload_ingest::config::JobConfig;
//! use fanload_ingest::format::FormatRegistry;
//! use fanload_ingest::target::memory::MemoryStore;
//! use fanload_ingest::transform::TransformRegistry;
//! use fanload_ingest::run_load;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = JobConfig::from_file("orders.toml")?;
//!     let job = config.into_job(
//!         &FormatRegistry::with_defaults(),
//!         &TransformRegistry::with_builtins(),
//!         Arc::new(MemoryStore::new()),
//!     )?;
//!     let tasks = run_load(&job, &config.options).await?;
//!     println!("{} tasks completed", tasks);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod format;
pub mod job;
pub mod lifecycle;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod projector;
pub mod reader;
pub mod source;
pub mod stats;
pub mod target;
pub mod transform;

/// One row of raw or projected values; `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

// Re-export commonly used types
pub use config::{JobConfig, LoadOptions};
pub use job::{ColumnSpec, IndexDefinition, LoadJob, QualifiedName, TargetTable};
pub use lifecycle::TableLifecycleCoordinator;
pub use orchestrator::{run_load, FanoutOrchestrator, LoadPhase};
pub use pipeline::{TaskLayout, TaskResult};
pub use pool::WorkerPool;
pub use projector::{copy_column_list, FieldProjector};
pub use reader::RowStreamReader;
pub use source::{DataSource, Encoding, SourceSpec};
pub use stats::{LoadStats, StatsReporter};
pub use target::{TargetConnection, TargetStore};
