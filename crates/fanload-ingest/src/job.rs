//! Load jobs, their per-path clones and the shared target table

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use fanload_common::{FanloadError, Result};
use serde::{Deserialize, Serialize};

use crate::format::LineFormat;
use crate::projector::quote_identifier;
use crate::source::{DataSource, Encoding};
use crate::target::TargetStore;
use crate::transform::Transform;

/// One target column and where its value comes from
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    /// Source field; defaults to the field with the column's name
    pub field: Option<String>,
    pub transform: Option<Transform>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: None,
            transform: None,
        }
    }

    pub fn from_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }
}

/// Optionally schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub table: String,
}

impl QualifiedName {
    pub fn new(schema: Option<&str>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.map(str::to_string),
            table: table.into(),
        }
    }

    /// Parse `table` or `schema.table`
    pub fn parse(name: &str) -> Result<Self> {
        let parts: Vec<&str> = name.split('.').map(str::trim).collect();
        match parts.as_slice() {
            [table] if !table.is_empty() => Ok(Self::new(None, *table)),
            [schema, table] if !schema.is_empty() && !table.is_empty() => {
                Ok(Self::new(Some(schema), *table))
            }
            _ => Err(FanloadError::Config(format!(
                "invalid table name '{}', expected table or schema.table",
                name
            ))),
        }
    }

    /// Identifier form for SQL statements
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(&self.table)),
            None => quote_identifier(&self.table),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

/// A captured index, enough to recreate it after the load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    /// Statement that recreates the index
    pub create_sql: String,
    /// Backing constraint (primary key, unique), dropped instead of the index
    pub constraint: Option<String>,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, create_sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            create_sql: create_sql.into(),
            constraint: None,
        }
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }
}

/// Destination table shared by a job and every one of its clones.
///
/// Holds the once-per-run lifecycle state: whether the table was truncated and
/// which indexes were dropped. The lifecycle coordinator clears both when a
/// run ends, so the next run on the same job prepares the table again.
#[derive(Debug)]
pub struct TargetTable {
    name: QualifiedName,
    truncated: AtomicBool,
    dropped_indexes: Mutex<Option<Vec<IndexDefinition>>>,
}

impl TargetTable {
    pub fn new(name: QualifiedName) -> Self {
        Self {
            name,
            truncated: AtomicBool::new(false),
            dropped_indexes: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &QualifiedName {
        &self.name
    }

    /// True for the first caller only, until [`release_truncate`](Self::release_truncate)
    pub fn claim_truncate(&self) -> bool {
        !self.truncated.swap(true, Ordering::SeqCst)
    }

    /// Give the truncate claim back, after a failed truncate or at the end of a run
    pub fn release_truncate(&self) {
        self.truncated.store(false, Ordering::SeqCst);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated.load(Ordering::SeqCst)
    }

    /// Store the indexes captured by the drop step. Returns false if a list
    /// was already recorded, in which case the new one is ignored.
    pub fn record_dropped_indexes(&self, indexes: Vec<IndexDefinition>) -> bool {
        let mut slot = self.lock_indexes();
        if slot.is_some() {
            return false;
        }
        *slot = Some(indexes);
        true
    }

    pub fn indexes_dropped(&self) -> bool {
        self.lock_indexes().is_some()
    }

    /// Hand the captured list to the recreate step. Later calls get `None`.
    pub fn take_dropped_indexes(&self) -> Option<Vec<IndexDefinition>> {
        self.lock_indexes().take()
    }

    fn lock_indexes(&self) -> MutexGuard<'_, Option<Vec<IndexDefinition>>> {
        self.dropped_indexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One logical bulk load: a source, its row rules and the target table.
pub struct LoadJob {
    source: DataSource,
    target: Arc<TargetTable>,
    store: Arc<dyn TargetStore>,
    fields: Vec<String>,
    columns: Arc<Vec<ColumnSpec>>,
    encoding: Encoding,
    skip_lines: u64,
    header: bool,
    parsed_fields: OnceLock<Vec<String>>,
}

impl LoadJob {
    pub fn builder(source: DataSource, target: QualifiedName, store: Arc<dyn TargetStore>) -> LoadJobBuilder {
        LoadJobBuilder {
            source,
            target,
            store,
            fields: None,
            columns: Vec::new(),
            encoding: Encoding::default(),
            skip_lines: 0,
            header: false,
        }
    }

    /// Independent job for one physical path.
    ///
    /// The source is rebound to `path` and the parsed field list starts empty.
    /// Columns, transforms, the target table and the store are shared.
    pub fn clone_for(&self, path: impl Into<PathBuf>) -> LoadJob {
        LoadJob {
            source: self.source.bound_to(path),
            target: Arc::clone(&self.target),
            store: Arc::clone(&self.store),
            fields: self.fields.clone(),
            columns: Arc::clone(&self.columns),
            encoding: self.encoding,
            skip_lines: self.skip_lines,
            header: self.header,
            parsed_fields: OnceLock::new(),
        }
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    pub fn format(&self) -> &Arc<dyn LineFormat> {
        self.source.format()
    }

    /// Physical path of a per-path clone
    pub fn path(&self) -> Option<&Path> {
        self.source.path()
    }

    pub fn target(&self) -> &Arc<TargetTable> {
        &self.target
    }

    pub fn table(&self) -> &QualifiedName {
        self.target.name()
    }

    pub fn store(&self) -> &Arc<dyn TargetStore> {
        &self.store
    }

    /// Declared fields
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn columns(&self) -> &Arc<Vec<ColumnSpec>> {
        &self.columns
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn skip_lines(&self) -> u64 {
        self.skip_lines
    }

    pub fn header(&self) -> bool {
        self.header
    }

    /// Record the field list resolved at run time. The first call wins.
    pub fn set_parsed_fields(&self, fields: Vec<String>) {
        let _ = self.parsed_fields.set(fields);
    }

    pub fn parsed_fields(&self) -> Option<&[String]> {
        self.parsed_fields.get().map(Vec::as_slice)
    }

    /// Parsed fields when available, otherwise the declared ones
    pub fn resolved_fields(&self) -> &[String] {
        self.parsed_fields().unwrap_or(&self.fields)
    }
}

impl fmt::Debug for LoadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadJob")
            .field("source", &self.source.spec())
            .field("format", &self.source.format_name())
            .field("target", &self.target.name())
            .field("store", &self.store.kind())
            .field("fields", &self.fields)
            .field("columns", &self.columns.len())
            .field("encoding", &self.encoding)
            .field("skip_lines", &self.skip_lines)
            .field("header", &self.header)
            .finish()
    }
}

pub struct LoadJobBuilder {
    source: DataSource,
    target: QualifiedName,
    store: Arc<dyn TargetStore>,
    fields: Option<Vec<String>>,
    columns: Vec<ColumnSpec>,
    encoding: Encoding,
    skip_lines: u64,
    header: bool,
}

impl LoadJobBuilder {
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn columns(mut self, columns: Vec<ColumnSpec>) -> Self {
        self.columns = columns;
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn skip_lines(mut self, skip_lines: u64) -> Self {
        self.skip_lines = skip_lines;
        self
    }

    pub fn header(mut self, header: bool) -> Self {
        self.header = header;
        self
    }

    /// Fields fall back to the format's own layout when none are declared.
    pub fn build(self) -> Result<LoadJob> {
        let fields = self
            .fields
            .unwrap_or_else(|| self.source.format().default_fields());

        let mut seen = std::collections::HashSet::new();
        if let Some(duplicate) = self.columns.iter().find(|c| !seen.insert(c.name.as_str())) {
            return Err(FanloadError::Config(format!(
                "column '{}' is declared more than once",
                duplicate.name
            )));
        }

        Ok(LoadJob {
            source: self.source,
            target: Arc::new(TargetTable::new(self.target)),
            store: self.store,
            fields,
            columns: Arc::new(self.columns),
            encoding: self.encoding,
            skip_lines: self.skip_lines,
            header: self.header,
            parsed_fields: OnceLock::new(),
        })
    }
}
