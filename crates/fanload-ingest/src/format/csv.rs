//! CSV lines, split with the `csv` crate

use std::sync::Arc;

use csv::{ReaderBuilder, StringRecord, Trim};
use fanload_common::{FanloadError, Result};

use super::{single_byte, FormatConfig, HeaderParser, LineFormat};
use crate::Row;

#[derive(Debug, Clone)]
pub struct CsvFormat {
    delimiter: u8,
    quote: u8,
    escape: Option<u8>,
    trim: bool,
    null_if: Option<String>,
}

impl CsvFormat {
    pub fn new() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
            escape: None,
            trim: false,
            null_if: None,
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_null_if(mut self, marker: impl Into<String>) -> Self {
        self.null_if = Some(marker.into());
        self
    }

    pub fn from_config(config: &FormatConfig) -> Result<Arc<dyn LineFormat>> {
        let escape = match config.escape.as_deref() {
            Some(value) => Some(single_byte(Some(value), "escape", b'\\')?),
            None => None,
        };

        Ok(Arc::new(Self {
            delimiter: single_byte(config.delimiter.as_deref(), "delimiter", b',')?,
            quote: single_byte(config.quote.as_deref(), "quote", b'"')?,
            escape,
            trim: config.trim,
            null_if: config.null_if.clone(),
        }))
    }

    fn record(&self, line: &str) -> Result<StringRecord> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .quote(self.quote)
            .escape(self.escape)
            .double_quote(self.escape.is_none())
            .trim(if self.trim { Trim::All } else { Trim::None })
            .from_reader(line.as_bytes());

        let mut record = StringRecord::new();
        reader
            .read_record(&mut record)
            .map_err(|e| FanloadError::Parse(format!("malformed csv line: {}", e)))?;
        Ok(record)
    }
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFormat for CsvFormat {
    fn name(&self) -> &str {
        "csv"
    }

    fn split(&self, line: &str) -> Result<Row> {
        let record = self.record(line)?;
        Ok(record
            .iter()
            .map(|value| match &self.null_if {
                Some(marker) if marker == value => None,
                _ => Some(value.to_string()),
            })
            .collect())
    }

    fn header_parser(&self) -> Option<&dyn HeaderParser> {
        Some(self)
    }
}

impl HeaderParser for CsvFormat {
    fn parse_header(&self, line: &str) -> Result<Vec<String>> {
        let record = self.record(line)?;
        record
            .iter()
            .enumerate()
            .map(|(position, name)| {
                let name = name.trim();
                if name.is_empty() {
                    Err(FanloadError::Parse(format!(
                        "empty field name at header position {}",
                        position + 1
                    )))
                } else {
                    Ok(name.to_string())
                }
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_split_handles_quotes_and_embedded_delimiters() {
        let format = CsvFormat::new();
        let row = format.split(r#"1,"Smith, John","say ""hi""""#).unwrap();
        assert_eq!(
            row,
            vec![
                Some("1".to_string()),
                Some("Smith, John".to_string()),
                Some(r#"say "hi""#.to_string()),
            ]
        );
    }

    #[test]
    fn test_null_marker() {
        let format = CsvFormat::new().with_delimiter(b';').with_null_if("NULL");
        let row = format.split("a;NULL;").unwrap();
        assert_eq!(row, vec![Some("a".to_string()), None, Some(String::new())]);
    }

    #[test]
    fn test_header_fields_are_trimmed() {
        let format = CsvFormat::new();
        let fields = format.parse_header(r#" id ,"Order Date", amount"#).unwrap();
        assert_eq!(fields, vec!["id", "Order Date", "amount"]);
    }

    #[test]
    fn test_header_rejects_empty_names() {
        let format = CsvFormat::new();
        let err = format.parse_header("id,,amount").unwrap_err();
        assert!(err.to_string().contains("position 2"));
    }

    #[test]
    fn test_from_config_reads_options() {
        let config = FormatConfig {
            delimiter: Some("|".to_string()),
            trim: true,
            ..FormatConfig::default()
        };
        let format = CsvFormat::from_config(&config).unwrap();
        let row = format.split(" a | b ").unwrap();
        assert_eq!(row, vec![Some("a".to_string()), Some("b".to_string())]);
    }
}
