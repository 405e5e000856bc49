//! Fanload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging setup, and error handling for the fanload workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the [`FanloadError`] taxonomy and the aggregated
//!   [`LoadFailure`] returned when a fan-out load finishes with failures
//! - **Logging**: `tracing` subscriber initialisation driven by [`logging::LogConfig`]
//! - **Types**: small domain types shared by the loader and its callers
//!
//! # Example
//!
//! ```no_run
//! use fanload_common::{FanloadError, Result};
//!
//! fn check_workers(count: usize) -> Result<usize> {
//!     if count == 0 {
//!         return Err(FanloadError::Config("worker_count must be at least 1".into()));
//!     }
//!     Ok(count)
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{FanloadError, LoadFailure, Result, TaskFailure};
pub use types::TaskKind;
