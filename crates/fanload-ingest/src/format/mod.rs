//! Line formats
//!
//! A format turns one decoded source line into a row of raw field values.
//! Header parsing is a separate capability: only formats that can name their
//! fields from a header line expose a [`HeaderParser`].

pub mod csv;
pub mod fixed;
pub mod text;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use fanload_common::{FanloadError, Result};
use serde::{Deserialize, Serialize};

use crate::Row;

pub use self::csv::CsvFormat;
pub use self::fixed::{FixedColumn, FixedFormat};
pub use self::text::TextFormat;

/// Column-splitting rules for one concrete source format
pub trait LineFormat: fmt::Debug + Send + Sync {
    /// Format tag, e.g. "csv"
    fn name(&self) -> &str;

    /// Split one line (without its line terminator) into raw values
    fn split(&self, line: &str) -> Result<Row>;

    /// Header parsing capability, if the format has one
    fn header_parser(&self) -> Option<&dyn HeaderParser> {
        None
    }

    /// Field names the format defines by itself (fixed-width layouts)
    fn default_fields(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether an empty line is blank padding rather than a row
    fn skips_empty_lines(&self) -> bool {
        true
    }
}

/// Parses a header line into the ordered field-name list
pub trait HeaderParser: Send + Sync {
    fn parse_header(&self, line: &str) -> Result<Vec<String>>;
}

/// Format options as written in a job file. Each format reads the keys it
/// understands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatConfig {
    pub delimiter: Option<String>,
    pub quote: Option<String>,
    pub escape: Option<String>,
    /// Raw value that loads as NULL
    pub null_if: Option<String>,
    #[serde(default)]
    pub trim: bool,
    /// Fixed-width layout
    #[serde(default)]
    pub columns: Vec<FixedColumn>,
}

pub type FormatBuilder = fn(&FormatConfig) -> Result<Arc<dyn LineFormat>>;

/// Maps format tags to format builders
pub struct FormatRegistry {
    builders: BTreeMap<String, FormatBuilder>,
}

impl FormatRegistry {
    pub fn empty() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    /// Registry with the csv, text and fixed formats
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("csv", CsvFormat::from_config);
        registry.register("text", TextFormat::from_config);
        registry.register("fixed", FixedFormat::from_config);
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, builder: FormatBuilder) {
        self.builders.insert(tag.into().to_lowercase(), builder);
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    pub fn build(&self, tag: &str, config: &FormatConfig) -> Result<Arc<dyn LineFormat>> {
        let builder = self.builders.get(&tag.to_lowercase()).ok_or_else(|| {
            FanloadError::Config(format!(
                "unknown source format '{}' (known: {})",
                tag,
                self.tags().collect::<Vec<_>>().join(", ")
            ))
        })?;
        builder(config)
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Read a single-byte option such as a delimiter. Accepts "tab" and "\t".
pub(crate) fn single_byte(value: Option<&str>, option: &str, default: u8) -> Result<u8> {
    let Some(value) = value else {
        return Ok(default);
    };

    match value {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        _ if value.len() == 1 => Ok(value.as_bytes()[0]),
        _ => Err(FanloadError::Config(format!(
            "{} must be a single ASCII character, got '{}'",
            option, value
        ))),
    }
}
