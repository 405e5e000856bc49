//! Error types for fanload

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::TaskKind;

/// Result type alias for fanload operations
pub type Result<T> = std::result::Result<T, FanloadError>;

/// Main error type for fanload
#[derive(Error, Debug)]
pub enum FanloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Reading or opening one physical source file failed
    #[error("IO error on '{}': {source}", path.display())]
    SourceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A concrete source format lacks a capability the job asked for
    #[error("{operation} is not supported by the '{format}' format")]
    UnsupportedOperation {
        operation: &'static str,
        format: String,
    },

    /// Truncate, index drop or index recreate failed on the target table
    #[error("Lifecycle step '{step}' failed on {table}: {message}")]
    Lifecycle {
        step: &'static str,
        table: String,
        message: String,
    },

    #[error("Projection error: {0}")]
    Projection(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Target error: {0}")]
    Target(String),

    #[error("Worker pool is shut down and no longer accepts tasks")]
    PoolClosed,

    #[error("{0}")]
    LoadFailed(Box<LoadFailure>),
}

impl FanloadError {
    pub fn source_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FanloadError::SourceIo {
            path: path.into(),
            source,
        }
    }

    pub fn target(message: impl fmt::Display) -> Self {
        FanloadError::Target(message.to_string())
    }
}

/// One failed worker-pool task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub kind: TaskKind,
    pub table: String,
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} task for {} ({}): {}",
            self.kind,
            self.table,
            self.path.display(),
            self.message
        )
    }
}

/// Aggregated outcome of a load that finished with failures.
///
/// Every dispatched task has reported by the time this is built.
#[derive(Debug, Default)]
pub struct LoadFailure {
    pub dispatched: usize,
    pub task_failures: Vec<TaskFailure>,
    pub lifecycle_failures: Vec<FanloadError>,
    /// Source expansion or completion-channel errors
    pub dispatch_failures: Vec<FanloadError>,
}

impl LoadFailure {
    pub fn is_empty(&self) -> bool {
        self.task_failures.is_empty()
            && self.lifecycle_failures.is_empty()
            && self.dispatch_failures.is_empty()
    }
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Load failed: {} of {} tasks failed, {} lifecycle error(s)",
            self.task_failures.len(),
            self.dispatched,
            self.lifecycle_failures.len()
        )?;
        for failure in &self.task_failures {
            write!(f, "\n  - {}", failure)?;
        }
        for failure in self.lifecycle_failures.iter().chain(&self.dispatch_failures) {
            write!(f, "\n  - {}", failure)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_load_failure_lists_every_failure() {
        let failure = LoadFailure {
            dispatched: 6,
            task_failures: vec![TaskFailure {
                kind: TaskKind::Writer,
                table: "public.orders".to_string(),
                path: PathBuf::from("/data/b.csv"),
                message: "connection reset".to_string(),
            }],
            lifecycle_failures: vec![FanloadError::Lifecycle {
                step: "recreate indexes",
                table: "public.orders".to_string(),
                message: "duplicate key".to_string(),
            }],
            dispatch_failures: Vec::new(),
        };

        let rendered = FanloadError::LoadFailed(Box::new(failure)).to_string();
        assert!(rendered.contains("1 of 6 tasks failed"));
        assert!(rendered.contains("writer task for public.orders (/data/b.csv): connection reset"));
        assert!(rendered.contains("recreate indexes"));
    }

    #[test]
    fn test_unsupported_operation_names_format() {
        let err = FanloadError::UnsupportedOperation {
            operation: "header parsing",
            format: "fixed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "header parsing is not supported by the 'fixed' format"
        );
    }
}
