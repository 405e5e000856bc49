//! Fixed-width lines. Field names come from the layout, never from a header.

use std::sync::Arc;

use fanload_common::{FanloadError, Result};
use serde::{Deserialize, Serialize};

use super::{FormatConfig, LineFormat};
use crate::Row;

/// One fixed-width field, in characters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedColumn {
    pub name: String,
    /// Zero-based character offset
    pub start: usize,
    pub length: usize,
}

impl FixedColumn {
    pub fn new(name: impl Into<String>, start: usize, length: usize) -> Self {
        Self {
            name: name.into(),
            start,
            length,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixedFormat {
    columns: Vec<FixedColumn>,
}

impl FixedFormat {
    pub fn new(columns: Vec<FixedColumn>) -> Result<Self> {
        if columns.is_empty() {
            return Err(FanloadError::Config(
                "fixed format requires at least one column".to_string(),
            ));
        }
        if let Some(column) = columns.iter().find(|c| c.length == 0) {
            return Err(FanloadError::Config(format!(
                "fixed column '{}' has zero length",
                column.name
            )));
        }
        Ok(Self { columns })
    }

    pub fn from_config(config: &FormatConfig) -> Result<Arc<dyn LineFormat>> {
        Ok(Arc::new(Self::new(config.columns.clone())?))
    }
}

impl LineFormat for FixedFormat {
    fn name(&self) -> &str {
        "fixed"
    }

    fn split(&self, line: &str) -> Result<Row> {
        let chars: Vec<char> = line.chars().collect();
        Ok(self
            .columns
            .iter()
            .map(|column| {
                let start = column.start.min(chars.len());
                let end = (column.start + column.length).min(chars.len());
                let value: String = chars[start..end].iter().collect();
                let value = value.trim();
                if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            })
            .collect())
    }

    fn default_fields(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}
