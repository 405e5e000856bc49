//! Source files: path expansion, decoding and line streaming

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use fanload_common::{FanloadError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use walkdir::WalkDir;

use crate::format::LineFormat;

/// Character encoding of a source file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    /// ISO-8859-1, every byte maps to the code point of the same value
    Latin1,
}

impl Encoding {
    fn decode(&self, bytes: &[u8]) -> std::result::Result<String, String> {
        match self {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| format!("invalid UTF-8: {}", e.utf8_error())),
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

impl FromStr for Encoding {
    type Err = FanloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "utf8" => Ok(Encoding::Utf8),
            "latin1" | "iso88591" => Ok(Encoding::Latin1),
            _ => Err(FanloadError::Config(format!("unknown encoding '{}'", s))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Utf8 => write!(f, "utf-8"),
            Encoding::Latin1 => write!(f, "latin-1"),
        }
    }
}

/// Decoded lines of one physical file, without terminators
pub struct LineStream<R> {
    reader: R,
    encoding: Encoding,
    path: PathBuf,
    line_number: u64,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineStream<R> {
    pub fn new(reader: R, encoding: Encoding, path: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            encoding,
            path: path.into(),
            line_number: 0,
            buf: Vec::new(),
        }
    }

    /// Next line, or `None` at end of file
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|e| FanloadError::source_io(&self.path, e))?;
        if read == 0 {
            return Ok(None);
        }
        self.line_number += 1;

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }

        let mut bytes = self.buf.as_slice();
        if self.line_number == 1 && self.encoding == Encoding::Utf8 {
            bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        }

        self.encoding.decode(bytes).map(Some).map_err(|message| {
            FanloadError::Parse(format!(
                "{}:{}: {}",
                self.path.display(),
                self.line_number,
                message
            ))
        })
    }

    /// Number of lines returned so far
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open one physical file for line streaming
pub async fn open_stream(path: &Path, encoding: Encoding) -> Result<LineStream<BufReader<File>>> {
    let file = File::open(path)
        .await
        .map_err(|e| FanloadError::source_io(path, e))?;
    Ok(LineStream::new(BufReader::new(file), encoding, path))
}

/// Where a job's rows come from
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    File(PathBuf),
    Files(Vec<PathBuf>),
    /// Every file under `directory` whose relative path matches `pattern`
    Matching { directory: PathBuf, pattern: String },
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::File(path) => write!(f, "{}", path.display()),
            SourceSpec::Files(paths) => write!(f, "{} files", paths.len()),
            SourceSpec::Matching { directory, pattern } => {
                write!(f, "{}/{}", directory.display(), pattern)
            }
        }
    }
}

/// Expand a source into its ordered list of physical paths.
///
/// Pattern matches are sorted by file name so the fan-out order is stable.
pub fn expand_source(spec: &SourceSpec) -> Result<Vec<PathBuf>> {
    match spec {
        SourceSpec::File(path) => Ok(vec![path.clone()]),
        SourceSpec::Files(paths) => Ok(paths.clone()),
        SourceSpec::Matching { directory, pattern } => {
            let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                FanloadError::Config(format!("invalid source pattern '{}': {}", pattern, e))
            })?;

            let mut paths = Vec::new();
            for entry in WalkDir::new(directory).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    let path = e.path().unwrap_or(directory.as_path()).to_path_buf();
                    match e.into_io_error() {
                        Some(io) => FanloadError::source_io(path, io),
                        None => FanloadError::Config(format!(
                            "filesystem loop under {}",
                            directory.display()
                        )),
                    }
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(directory)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                if regex.is_match(&relative) {
                    paths.push(entry.into_path());
                }
            }
            Ok(paths)
        }
    }
}

/// A source bound to its format. Path-specific clones carry a single file.
#[derive(Debug, Clone)]
pub struct DataSource {
    spec: SourceSpec,
    format: Arc<dyn LineFormat>,
}

impl DataSource {
    pub fn new(spec: SourceSpec, format: Arc<dyn LineFormat>) -> Self {
        Self { spec, format }
    }

    /// Same format, narrowed to one physical path
    pub fn bound_to(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            spec: SourceSpec::File(path.into()),
            format: Arc::clone(&self.format),
        }
    }

    pub fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    /// The physical path, when the source is a single file
    pub fn path(&self) -> Option<&Path> {
        match &self.spec {
            SourceSpec::File(path) => Some(path),
            _ => None,
        }
    }

    pub fn format(&self) -> &Arc<dyn LineFormat> {
        &self.format
    }

    pub fn format_name(&self) -> &str {
        self.format.name()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::format::CsvFormat;
    use std::fs;

    async fn collect_lines(bytes: &[u8], encoding: Encoding) -> Vec<String> {
        let mut stream = LineStream::new(bytes, encoding, "mem.csv");
        let mut lines = Vec::new();
        while let Some(line) = stream.next_line().await.unwrap() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_line_terminators_and_bom() {
        let lines = collect_lines(b"\xEF\xBB\xBFid,name\r\n1,a\n2,b", Encoding::Utf8).await;
        assert_eq!(lines, vec!["id,name", "1,a", "2,b"]);
    }

    #[tokio::test]
    async fn test_latin1_decoding() {
        let lines = collect_lines(b"M\xfcller\n", Encoding::Latin1).await;
        assert_eq!(lines, vec!["Müller"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_reports_line() {
        let mut stream = LineStream::new(&b"ok\nbad\xff\n"[..], Encoding::Utf8, "x.csv");
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("ok"));
        let err = stream.next_line().await.unwrap_err();
        assert!(err.to_string().contains("x.csv:2"));
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("UTF-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("iso-8859-1".parse::<Encoding>().unwrap(), Encoding::Latin1);
        assert!("ebcdic".parse::<Encoding>().is_err());
    }

    #[test]
    fn test_expand_matching_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("2024")).unwrap();
        fs::write(dir.path().join("b.csv"), "x").unwrap();
        fs::write(dir.path().join("a.csv"), "x").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("2024").join("c.csv"), "x").unwrap();

        let spec = SourceSpec::Matching {
            directory: dir.path().to_path_buf(),
            pattern: r".*\.csv".to_string(),
        };
        let paths = expand_source(&spec).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(names, vec!["2024/c.csv", "a.csv", "b.csv"]);
    }

    #[test]
    fn test_expand_rejects_bad_pattern() {
        let spec = SourceSpec::Matching {
            directory: PathBuf::from("."),
            pattern: "(".to_string(),
        };
        assert!(matches!(expand_source(&spec), Err(FanloadError::Config(_))));
    }

    #[test]
    fn test_bound_to_shares_format() {
        let source = DataSource::new(
            SourceSpec::Files(vec!["a.csv".into(), "b.csv".into()]),
            Arc::new(CsvFormat::new()),
        );
        assert!(source.path().is_none());

        let bound = source.bound_to("b.csv");
        assert_eq!(bound.path(), Some(Path::new("b.csv")));
        assert!(Arc::ptr_eq(bound.format(), source.format()));
        assert_eq!(bound.format_name(), "csv");
    }
}
