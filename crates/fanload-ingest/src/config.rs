//! Load options and job files
//!
//! A job file is TOML:
//!
//! ```toml
//! [source]
//! format = "csv"
//! directory = "exports"
//! pattern = 'orders_\d+\.csv'
//! header = true
//!
//! [source.options]
//! delimiter = ";"
//!
//! [target]
//! url = "postgres://loader@localhost/shop"
//! table = "public.orders"
//!
//! [[columns]]
//! name = "customer"
//! field = "customer_name"
//! transform = "trim"
//!
//! [options]
//! worker_count = 8
//! truncate = true
//! drop_indexes = true
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use fanload_common::{FanloadError, Result};
use serde::{Deserialize, Serialize};

use crate::format::{FormatConfig, FormatRegistry};
use crate::job::{ColumnSpec, LoadJob, QualifiedName};
use crate::source::{DataSource, Encoding, SourceSpec};
use crate::target::TargetStore;
use crate::transform::TransformRegistry;

/// Options for one `run_load` invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadOptions {
    /// Size of the shared worker pool
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Load units per physical path
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub truncate: bool,
    #[serde(default)]
    pub drop_indexes: bool,
    /// Rows per batch handed from a reader to its writer
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
}

fn default_worker_count() -> usize {
    4
}

fn default_concurrency() -> usize {
    1
}

fn default_batch_rows() -> usize {
    25_000
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            concurrency: default_concurrency(),
            truncate: false,
            drop_indexes: false,
            batch_rows: default_batch_rows(),
        }
    }
}

impl LoadOptions {
    /// Defaults overridden by `FANLOAD_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Apply `FANLOAD_WORKER_COUNT`, `FANLOAD_CONCURRENCY`, `FANLOAD_TRUNCATE`,
    /// `FANLOAD_DROP_INDEXES` and `FANLOAD_BATCH_ROWS` when set
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(value) = env_value("FANLOAD_WORKER_COUNT")? {
            self.worker_count = value;
        }
        if let Some(value) = env_value("FANLOAD_CONCURRENCY")? {
            self.concurrency = value;
        }
        if let Some(value) = env_flag("FANLOAD_TRUNCATE")? {
            self.truncate = value;
        }
        if let Some(value) = env_flag("FANLOAD_DROP_INDEXES")? {
            self.drop_indexes = value;
        }
        if let Some(value) = env_value("FANLOAD_BATCH_ROWS")? {
            self.batch_rows = value;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(FanloadError::Config(
                "worker_count must be greater than 0".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(FanloadError::Config(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.batch_rows == 0 {
            return Err(FanloadError::Config(
                "batch_rows must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| FanloadError::Config(format!("{}='{}': {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

fn env_flag(name: &str) -> Result<Option<bool>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    parse_flag(&raw)
        .map(Some)
        .ok_or_else(|| FanloadError::Config(format!("{}='{}' is not a boolean", name, raw)))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub format: String,
    /// One file
    pub path: Option<PathBuf>,
    /// Explicit list of files
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Directory searched with `pattern`
    pub directory: Option<PathBuf>,
    /// Regex matched against paths relative to `directory`
    pub pattern: Option<String>,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub skip_lines: u64,
    #[serde(default)]
    pub header: bool,
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub options: FormatConfig,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// `postgres://...` or `memory://`; may also come from the command line
    pub url: Option<String>,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnConfig {
    pub name: String,
    pub field: Option<String>,
    pub transform: Option<String>,
}

/// A job file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub source: SourceConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub options: LoadOptions,
}

impl JobConfig {
    /// Read a job file. Relative source paths resolve against its directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| FanloadError::source_io(path, e))?;
        let mut config: Self = toml::from_str(&text)
            .map_err(|e| FanloadError::Config(format!("{}: {}", path.display(), e)))?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| FanloadError::Config(e.to_string()))
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &Path| {
            if p.is_relative() {
                base.join(p)
            } else {
                p.to_path_buf()
            }
        };
        let source = &mut self.source;
        source.path = source.path.as_deref().map(resolve);
        source.paths = source.paths.iter().map(|p| resolve(p)).collect();
        source.directory = source.directory.as_deref().map(resolve);
    }

    /// Exactly one of `path`, `paths` or `directory` + `pattern`
    pub fn source_spec(&self) -> Result<SourceSpec> {
        let source = &self.source;
        match (&source.path, source.paths.is_empty(), &source.directory, &source.pattern) {
            (Some(path), true, None, None) => Ok(SourceSpec::File(path.clone())),
            (None, false, None, None) => Ok(SourceSpec::Files(source.paths.clone())),
            (None, true, Some(directory), Some(pattern)) => Ok(SourceSpec::Matching {
                directory: directory.clone(),
                pattern: pattern.clone(),
            }),
            (None, true, Some(_), None) => Err(FanloadError::Config(
                "source.directory needs a source.pattern".to_string(),
            )),
            _ => Err(FanloadError::Config(
                "source needs exactly one of path, paths, or directory with pattern".to_string(),
            )),
        }
    }

    pub fn encoding(&self) -> Result<Encoding> {
        self.source.encoding.parse()
    }

    pub fn table(&self) -> Result<QualifiedName> {
        QualifiedName::parse(&self.target.table)
    }

    pub fn validate(&self) -> Result<()> {
        self.source_spec()?;
        self.encoding()?;
        self.table()?;
        self.options.validate()?;

        if !self.source.header
            && self.source.fields.as_ref().is_none_or(Vec::is_empty)
            && self.source.format.to_lowercase() != "fixed"
        {
            return Err(FanloadError::Config(
                "source needs a field list or header = true".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the job, resolving the format and every transform by name
    pub fn into_job(
        &self,
        formats: &FormatRegistry,
        transforms: &TransformRegistry,
        store: Arc<dyn TargetStore>,
    ) -> Result<LoadJob> {
        self.validate()?;

        let format = formats.build(&self.source.format, &self.source.options)?;
        let columns = self
            .columns
            .iter()
            .map(|column| -> Result<ColumnSpec> {
                let mut spec = ColumnSpec::new(&column.name);
                spec.field = column.field.clone();
                if let Some(name) = &column.transform {
                    spec.transform = Some(transforms.get(name)?);
                }
                Ok(spec)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut builder = LoadJob::builder(
            DataSource::new(self.source_spec()?, format),
            self.table()?,
            store,
        )
        .columns(columns)
        .encoding(self.encoding()?)
        .skip_lines(self.source.skip_lines)
        .header(self.source.header);

        if let Some(fields) = &self.source.fields {
            builder = builder.fields(fields.iter().cloned());
        }
        builder.build()
    }
}
