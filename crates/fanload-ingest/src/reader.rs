//! Line stream to raw rows: skip lines, optional header, then one callback per row

use std::sync::Arc;

use fanload_common::{FanloadError, Result};
use tokio::io::AsyncBufRead;
use tracing::{debug, trace};

use crate::format::LineFormat;
use crate::job::LoadJob;
use crate::source::LineStream;
use crate::Row;

#[derive(Debug, Clone)]
pub struct RowStreamReader {
    format: Arc<dyn LineFormat>,
    skip_lines: u64,
    header: bool,
}

impl RowStreamReader {
    pub fn new(format: Arc<dyn LineFormat>, skip_lines: u64, header: bool) -> Self {
        Self {
            format,
            skip_lines,
            header,
        }
    }

    pub fn for_job(job: &LoadJob) -> Self {
        Self::new(Arc::clone(job.format()), job.skip_lines(), job.header())
    }

    /// Consume skipped lines and the header, returning the field list rows
    /// will be read with.
    ///
    /// A missing header capability is reported before any line is read.
    pub async fn prepare<R>(&self, lines: &mut LineStream<R>, declared: &[String]) -> Result<Vec<String>>
    where
        R: AsyncBufRead + Unpin,
    {
        let parser = match (self.header, self.format.header_parser()) {
            (true, None) => {
                return Err(FanloadError::UnsupportedOperation {
                    operation: "header parsing",
                    format: self.format.name().to_string(),
                })
            }
            (true, Some(parser)) => Some(parser),
            (false, _) => None,
        };

        let mut skipped = 0;
        while skipped < self.skip_lines {
            if lines.next_line().await?.is_none() {
                break;
            }
            skipped += 1;
        }
        if skipped > 0 {
            debug!(path = %lines.path().display(), skipped, "Skipped leading lines");
        }

        let fields = match parser {
            Some(parser) => {
                let line = lines.next_line().await?.ok_or_else(|| {
                    FanloadError::Parse(format!(
                        "{}: expected a header line, found end of file",
                        lines.path().display()
                    ))
                })?;
                let fields = parser.parse_header(&line).map_err(|e| {
                    with_position(e, lines.path().display(), lines.line_number())
                })?;
                debug!(path = %lines.path().display(), fields = ?fields, "Parsed header");
                fields
            }
            None => declared.to_vec(),
        };

        if fields.is_empty() {
            return Err(FanloadError::Config(format!(
                "no fields for {}: declare them or enable the header line",
                lines.path().display()
            )));
        }
        Ok(fields)
    }

    /// Split the next line into a row. Empty lines are skipped when the
    /// format treats them as padding, and are not counted as rows.
    pub async fn next_row<R>(&self, lines: &mut LineStream<R>) -> Result<Option<Row>>
    where
        R: AsyncBufRead + Unpin,
    {
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() && self.format.skips_empty_lines() {
                continue;
            }
            let row = self
                .format
                .split(&line)
                .map_err(|e| with_position(e, lines.path().display(), lines.line_number()))?;
            trace!(line = lines.line_number(), values = row.len(), "Read row");
            return Ok(Some(row));
        }
        Ok(None)
    }

    /// Hand every remaining row to `on_row`, in file order
    pub async fn read_rows<R, F>(&self, lines: &mut LineStream<R>, mut on_row: F) -> Result<u64>
    where
        R: AsyncBufRead + Unpin,
        F: FnMut(Row) -> Result<()>,
    {
        let mut rows = 0;
        while let Some(row) = self.next_row(lines).await? {
            on_row(row)?;
            rows += 1;
        }
        Ok(rows)
    }

    /// Prepare the stream, store the resolved fields on `job`, then read every
    /// row through the callback `make_on_row` builds for those fields.
    pub async fn process<R, M, F>(
        &self,
        lines: &mut LineStream<R>,
        job: &LoadJob,
        make_on_row: M,
    ) -> Result<u64>
    where
        R: AsyncBufRead + Unpin,
        M: FnOnce(&[String]) -> Result<F>,
        F: FnMut(Row) -> Result<()>,
    {
        let fields = self.prepare(lines, job.fields()).await?;
        let on_row = make_on_row(&fields)?;
        job.set_parsed_fields(fields);
        self.read_rows(lines, on_row).await
    }
}

fn with_position(err: FanloadError, path: impl std::fmt::Display, line: u64) -> FanloadError {
    match err {
        FanloadError::Parse(message) => FanloadError::Parse(format!("{}:{}: {}", path, line, message)),
        other => other,
    }
}
