//! PostgreSQL COPY text lines: tab separated, `\N` for NULL, backslash escapes

use std::sync::Arc;

use fanload_common::Result;

use super::{single_byte, FormatConfig, LineFormat};
use crate::Row;

#[derive(Debug, Clone)]
pub struct TextFormat {
    delimiter: char,
    null_marker: String,
}

impl TextFormat {
    pub fn new() -> Self {
        Self {
            delimiter: '\t',
            null_marker: "\\N".to_string(),
        }
    }

    pub fn from_config(config: &FormatConfig) -> Result<Arc<dyn LineFormat>> {
        let delimiter = single_byte(config.delimiter.as_deref(), "delimiter", b'\t')? as char;
        Ok(Arc::new(Self {
            delimiter,
            null_marker: config.null_if.clone().unwrap_or_else(|| "\\N".to_string()),
        }))
    }

    fn finish_field(&self, raw: &str, value: String, row: &mut Row) {
        if raw == self.null_marker {
            row.push(None);
        } else {
            row.push(Some(value));
        }
    }
}

impl Default for TextFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFormat for TextFormat {
    fn name(&self) -> &str {
        "text"
    }

    fn split(&self, line: &str) -> Result<Row> {
        let mut row = Vec::new();
        let mut value = String::new();
        let mut field_start = 0;
        let mut chars = line.char_indices().peekable();

        while let Some((offset, c)) = chars.next() {
            if c == self.delimiter {
                self.finish_field(&line[field_start..offset], std::mem::take(&mut value), &mut row);
                field_start = offset + c.len_utf8();
                continue;
            }
            if c != '\\' {
                value.push(c);
                continue;
            }
            match chars.next() {
                Some((_, 't')) => value.push('\t'),
                Some((_, 'n')) => value.push('\n'),
                Some((_, 'r')) => value.push('\r'),
                Some((_, 'b')) => value.push('\u{8}'),
                Some((_, 'f')) => value.push('\u{c}'),
                Some((_, 'v')) => value.push('\u{b}'),
                Some((_, other)) => value.push(other),
                // trailing backslash is kept as-is
                None => value.push('\\'),
            }
        }
        self.finish_field(&line[field_start..], value, &mut row);

        Ok(row)
    }

    /// An empty line is one empty value
    fn skips_empty_lines(&self) -> bool {
        false
    }
}
