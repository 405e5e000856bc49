//! Reader and writer tasks for one load unit
//!
//! Each physical path is loaded by `concurrency` units. A unit is one reader
//! task and one writer task:
//!
//! - the reader opens the file, runs the [`RowStreamReader`], projects the
//!   rows it owns and sends them in batches to its writer
//! - the writer opens its own target connection and bulk-writes the batches
//!
//! Unit `k` of `n` owns the data rows whose zero-based index `i` satisfies
//! `i % n == k`. Every task posts exactly one [`TaskResult`], whether it
//! succeeds, fails or panics.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use fanload_common::{FanloadError, Result, TaskFailure, TaskKind};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::{debug, info_span, warn, Instrument};

use crate::job::{LoadJob, QualifiedName};
use crate::projector::FieldProjector;
use crate::reader::RowStreamReader;
use crate::source::open_stream;
use crate::target::{RowBatch, RowBatchStream};
use crate::Row;

/// How many tasks one unit of concurrency expands into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLayout {
    pub readers_per_unit: usize,
    pub writers_per_unit: usize,
}

impl TaskLayout {
    /// One reader feeding one writer
    pub const READER_WRITER: TaskLayout = TaskLayout {
        readers_per_unit: 1,
        writers_per_unit: 1,
    };

    pub fn tasks_per_unit(&self) -> usize {
        self.readers_per_unit + self.writers_per_unit
    }

    /// Tasks one physical path contributes at the given concurrency
    pub fn tasks_per_path(&self, concurrency: usize) -> usize {
        concurrency * self.tasks_per_unit()
    }
}

impl Default for TaskLayout {
    fn default() -> Self {
        Self::READER_WRITER
    }
}

/// Outcome of one pool task
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub kind: TaskKind,
    pub table: QualifiedName,
    pub path: PathBuf,
    pub unit: usize,
    pub seconds: f64,
    /// Rows sent (reader) or written (writer)
    pub rows: u64,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl TaskResult {
    /// Result for a task that never ran
    pub fn failed(kind: TaskKind, job: &LoadJob, unit: usize, error: impl ToString) -> Self {
        Self {
            kind,
            table: job.table().clone(),
            path: job_path(job),
            unit,
            seconds: 0.0,
            rows: 0,
            finished_at: Utc::now(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn to_failure(&self) -> Option<TaskFailure> {
        self.error.as_ref().map(|message| TaskFailure {
            kind: self.kind,
            table: self.table.to_string(),
            path: self.path.clone(),
            message: message.clone(),
        })
    }
}

/// Position of a unit among the units of one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadUnit {
    pub index: usize,
    pub count: usize,
}

impl LoadUnit {
    pub fn new(index: usize, count: usize) -> Self {
        Self {
            index,
            count: count.max(1),
        }
    }

    /// Whether the data row at `row_index` belongs to this unit
    pub fn owns(&self, row_index: u64) -> bool {
        row_index % self.count as u64 == self.index as u64
    }
}

/// The two futures of one unit, ready for the pool
pub struct UnitTasks {
    pub reader: BoxFuture<'static, ()>,
    pub writer: BoxFuture<'static, ()>,
}

/// Capacity of the row channel between a reader and its writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChannel {
    /// At most this many batches in flight; the reader waits for its writer
    Bounded(usize),
    /// The reader never waits. Needed when its writer cannot run until the
    /// reader has finished, as with a single pool worker.
    Unbounded,
}

impl RowChannel {
    /// Batches a bounded channel holds
    pub const DEFAULT_BATCHES: usize = 4;

    /// Channel for a pool of `workers`.
    ///
    /// The pool starts tasks in submission order and every reader is
    /// submitted right before its writer, so with two or more workers a
    /// blocked reader always has its writer running or next in line.
    pub fn for_workers(workers: usize) -> Self {
        if workers >= 2 {
            RowChannel::Bounded(Self::DEFAULT_BATCHES)
        } else {
            RowChannel::Unbounded
        }
    }

    fn open(self) -> (BatchSender, BatchReceiver) {
        match self {
            RowChannel::Bounded(batches) => {
                let (tx, rx) = mpsc::channel(batches.max(1));
                (BatchSender::Bounded(tx), BatchReceiver::Bounded(rx))
            }
            RowChannel::Unbounded => {
                let (tx, rx) = mpsc::unbounded_channel();
                (BatchSender::Unbounded(tx), BatchReceiver::Unbounded(rx))
            }
        }
    }
}

enum BatchSender {
    Bounded(mpsc::Sender<Result<RowBatch>>),
    Unbounded(mpsc::UnboundedSender<Result<RowBatch>>),
}

impl BatchSender {
    /// Fails once the writer has dropped its receiver
    async fn send(&self, batch: Result<RowBatch>) -> Result<()> {
        let sent = match self {
            BatchSender::Bounded(tx) => tx.send(batch).await.is_ok(),
            BatchSender::Unbounded(tx) => tx.send(batch).is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(FanloadError::target("writer stopped receiving rows"))
        }
    }
}

enum BatchReceiver {
    Bounded(mpsc::Receiver<Result<RowBatch>>),
    Unbounded(mpsc::UnboundedReceiver<Result<RowBatch>>),
}

impl BatchReceiver {
    fn into_stream(self) -> RowBatchStream {
        match self {
            BatchReceiver::Bounded(rx) => ReceiverStream::new(rx).boxed(),
            BatchReceiver::Unbounded(rx) => UnboundedReceiverStream::new(rx).boxed(),
        }
    }
}

/// Wire a reader and a writer for `unit` of a per-path job.
///
/// The reader must be submitted before its writer. A bounded `channel` is
/// only safe when the writer can get a pool slot while its reader runs.
pub fn build_unit(
    job: Arc<LoadJob>,
    unit: LoadUnit,
    batch_rows: usize,
    channel: RowChannel,
    results: mpsc::UnboundedSender<TaskResult>,
) -> UnitTasks {
    let (columns_tx, columns_rx) = oneshot::channel();
    let (rows_tx, rows_rx) = channel.open();

    let reader = {
        let job = Arc::clone(&job);
        let results = results.clone();
        async move {
            let span = task_span(TaskKind::Reader, &job, unit);
            let outcome = timed(
                async {
                    let mut sink = BatchSink::new(rows_tx, batch_rows);
                    let outcome = catch_panic(run_reader(&job, unit, columns_tx, &mut sink)).await;
                    if let Err(e) = &outcome {
                        let _ = sink
                            .tx
                            .send(Err(FanloadError::target(format!("reader failed: {}", e))))
                            .await;
                    }
                    outcome
                }
                .instrument(span),
            )
            .await;
            post(TaskKind::Reader, &job, unit, outcome, &results);
        }
    };

    let writer = async move {
        let span = task_span(TaskKind::Writer, &job, unit);
        let outcome = timed(catch_panic(run_writer(&job, columns_rx, rows_rx)).instrument(span)).await;
        post(TaskKind::Writer, &job, unit, outcome, &results);
    };

    UnitTasks {
        reader: reader.boxed(),
        writer: writer.boxed(),
    }
}

async fn run_reader(
    job: &LoadJob,
    unit: LoadUnit,
    columns_tx: oneshot::Sender<Vec<String>>,
    sink: &mut BatchSink,
) -> Result<u64> {
    let path = job.path().ok_or_else(|| {
        FanloadError::Config(format!(
            "reader for {} needs a job bound to a single file",
            job.table()
        ))
    })?;

    let mut lines = open_stream(path, job.encoding()).await?;
    let reader = RowStreamReader::for_job(job);

    let fields = reader.prepare(&mut lines, job.fields()).await?;
    let projector = FieldProjector::preprocess(&fields, job.columns(), job.table())?;
    job.set_parsed_fields(fields);
    // The writer starts its bulk write once it knows the columns
    let _ = columns_tx.send(projector.copy_columns());

    let mut row_index = 0u64;
    while let Some(row) = reader.next_row(&mut lines).await? {
        if unit.owns(row_index) {
            sink.push(projector.project(&row)).await?;
        }
        row_index += 1;
    }

    let sent = sink.finish().await?;
    debug!(lines = row_index, rows = sent, "Reader finished");
    Ok(sent)
}

async fn run_writer(
    job: &LoadJob,
    columns_rx: oneshot::Receiver<Vec<String>>,
    rows_rx: BatchReceiver,
) -> Result<u64> {
    let mut rows = rows_rx.into_stream();
    let columns = match columns_rx.await {
        Ok(columns) => columns,
        Err(_) => {
            // The reader failed before projecting; its error is in the channel
            return Err(match rows.next().await {
                Some(Err(e)) => e,
                _ => FanloadError::target("reader stopped before the column list was known"),
            });
        }
    };

    let mut conn = job.store().connect().await?;
    let written = conn.bulk_write(job.table(), &columns, rows).await?;
    debug!(rows = written, "Writer finished");
    Ok(written)
}

/// Collects projected rows and forwards them to the writer in batches
struct BatchSink {
    tx: BatchSender,
    batch: RowBatch,
    batch_rows: usize,
    sent: u64,
}

impl BatchSink {
    fn new(tx: BatchSender, batch_rows: usize) -> Self {
        let batch_rows = batch_rows.max(1);
        Self {
            tx,
            batch: Vec::with_capacity(batch_rows.min(4096)),
            batch_rows,
            sent: 0,
        }
    }

    async fn push(&mut self, row: Row) -> Result<()> {
        self.batch.push(row);
        if self.batch.len() >= self.batch_rows {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let rows = batch.len() as u64;
        self.tx.send(Ok(batch)).await?;
        self.sent += rows;
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64> {
        self.flush().await?;
        Ok(self.sent)
    }
}

struct Timed {
    seconds: f64,
    outcome: Result<u64>,
}

async fn timed<F>(body: F) -> Timed
where
    F: Future<Output = Result<u64>>,
{
    let start = Instant::now();
    let outcome = body.await;
    Timed {
        seconds: start.elapsed().as_secs_f64(),
        outcome,
    }
}

async fn catch_panic<F>(body: F) -> Result<u64>
where
    F: Future<Output = Result<u64>>,
{
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(FanloadError::target(format!(
            "task panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn post(
    kind: TaskKind,
    job: &LoadJob,
    unit: LoadUnit,
    timed: Timed,
    results: &mpsc::UnboundedSender<TaskResult>,
) {
    let (rows, error) = match timed.outcome {
        Ok(rows) => (rows, None),
        Err(e) => {
            warn!(
                kind = %kind,
                table = %job.table(),
                path = %job_path(job).display(),
                unit = unit.index,
                error = %e,
                "Task failed"
            );
            (0, Some(e.to_string()))
        }
    };

    let result = TaskResult {
        kind,
        table: job.table().clone(),
        path: job_path(job),
        unit: unit.index,
        seconds: timed.seconds,
        rows,
        finished_at: Utc::now(),
        error,
    };
    if results.send(result).is_err() {
        warn!(kind = %kind, table = %job.table(), "Completion channel closed before result was posted");
    }
}

fn task_span(kind: TaskKind, job: &LoadJob, unit: LoadUnit) -> tracing::Span {
    info_span!(
        "task",
        kind = %kind,
        table = %job.table(),
        path = %job_path(job).display(),
        unit = unit.index
    )
}

fn job_path(job: &LoadJob) -> PathBuf {
    job.path().map(Path::to_path_buf).unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::format::CsvFormat;
    use crate::job::ColumnSpec;
    use crate::source::{DataSource, SourceSpec};
    use crate::target::memory::MemoryStore;
    use std::fs;

    fn job_for(path: &Path, store: &MemoryStore, columns: Vec<ColumnSpec>) -> Arc<LoadJob> {
        let base = LoadJob::builder(
            DataSource::new(SourceSpec::File(path.to_path_buf()), Arc::new(CsvFormat::new())),
            QualifiedName::new(None, "items"),
            Arc::new(store.clone()),
        )
        .header(true)
        .columns(columns)
        .build()
        .unwrap();
        Arc::new(base.clone_for(path))
    }

    async fn run_unit(job: &Arc<LoadJob>, unit: LoadUnit, batch_rows: usize) -> Vec<TaskResult> {
        run_unit_with(job, unit, batch_rows, RowChannel::Unbounded).await
    }

    async fn run_unit_with(
        job: &Arc<LoadJob>,
        unit: LoadUnit,
        batch_rows: usize,
        channel: RowChannel,
    ) -> Vec<TaskResult> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tasks = build_unit(Arc::clone(job), unit, batch_rows, channel, tx);
        let reader = tokio::spawn(tasks.reader);
        let writer = tokio::spawn(tasks.writer);
        reader.await.unwrap();
        writer.await.unwrap();

        let mut results = Vec::new();
        while let Ok(result) = rx.try_recv() {
            results.push(result);
        }
        results
    }

    #[test]
    fn test_task_layout() {
        let layout = TaskLayout::default();
        assert_eq!(layout.tasks_per_unit(), 2);
        assert_eq!(layout.tasks_per_path(1), 2);
        assert_eq!(layout.tasks_per_path(3), 6);
    }

    #[test]
    fn test_units_partition_rows() {
        let units: Vec<_> = (0..3).map(|i| LoadUnit::new(i, 3)).collect();
        for row in 0..30u64 {
            assert_eq!(units.iter().filter(|u| u.owns(row)).count(), 1);
        }
        assert!(LoadUnit::new(0, 1).owns(7));
    }

    #[test]
    fn test_row_channel_for_workers() {
        assert_eq!(RowChannel::for_workers(1), RowChannel::Unbounded);
        assert_eq!(
            RowChannel::for_workers(2),
            RowChannel::Bounded(RowChannel::DEFAULT_BATCHES)
        );
    }

    #[tokio::test]
    async fn test_bounded_channel_loads_file_larger_than_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.csv");
        let mut content = String::from("id\n");
        for i in 0..50 {
            content.push_str(&format!("{}\n", i));
        }
        fs::write(&path, content).unwrap();

        let store = MemoryStore::new();
        let job = job_for(&path, &store, Vec::new());
        let results = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            run_unit_with(&job, LoadUnit::new(0, 1), 1, RowChannel::Bounded(1)),
        )
        .await
        .expect("bounded unit hung");

        assert!(results.iter().all(TaskResult::is_success));
        let reader = results.iter().find(|r| r.kind == TaskKind::Reader).unwrap();
        assert_eq!(reader.rows, 50);
        assert_eq!(store.row_count(&QualifiedName::new(None, "items")), 50);
    }

    #[tokio::test]
    async fn test_reader_fails_when_writer_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.csv");
        fs::write(&path, "id\n1\n2\n3\n").unwrap();

        let store = MemoryStore::new();
        let job = job_for(&path, &store, Vec::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tasks = build_unit(Arc::clone(&job), LoadUnit::new(0, 1), 1, RowChannel::Bounded(1), tx);
        drop(tasks.writer);
        tasks.reader.await;

        let reader = rx.try_recv().unwrap();
        assert_eq!(reader.kind, TaskKind::Reader);
        assert!(reader.error.unwrap().contains("writer stopped receiving rows"));
    }

    #[tokio::test]
    async fn test_unit_loads_projected_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.csv");
        fs::write(&path, "id,name,price\n1,apple,3\n2,pear,4\n3,plum,5\n").unwrap();

        let store = MemoryStore::new();
        let job = job_for(&path, &store, vec![ColumnSpec::new("name"), ColumnSpec::new("id")]);
        let results = run_unit(&job, LoadUnit::new(0, 1), 2).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(TaskResult::is_success));
        let writer = results.iter().find(|r| r.kind == TaskKind::Writer).unwrap();
        assert_eq!(writer.rows, 3);
        assert_eq!(writer.path, path);

        let table = QualifiedName::new(None, "items");
        assert_eq!(store.columns(&table), vec![r#""name""#, r#""id""#]);
        assert_eq!(
            store.rows(&table)[0],
            vec![Some("apple".to_string()), Some("1".to_string())]
        );
        assert_eq!(job.resolved_fields(), ["id", "name", "price"].map(String::from));
    }

    #[tokio::test]
    async fn test_two_units_split_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.csv");
        let mut content = String::from("id\n");
        for i in 0..10 {
            content.push_str(&format!("{}\n", i));
        }
        fs::write(&path, content).unwrap();

        let store = MemoryStore::new();
        let job = job_for(&path, &store, Vec::new());
        let first = run_unit(&job, LoadUnit::new(0, 2), 100).await;
        let second = run_unit(&job, LoadUnit::new(1, 2), 100).await;

        let written: u64 = first
            .iter()
            .chain(&second)
            .filter(|r| r.kind == TaskKind::Writer)
            .map(|r| r.rows)
            .sum();
        assert_eq!(written, 10);
        assert_eq!(store.row_count(&QualifiedName::new(None, "items")), 10);
    }

    #[tokio::test]
    async fn test_missing_file_fails_both_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let job = job_for(&dir.path().join("absent.csv"), &store, Vec::new());

        let results = run_unit(&job, LoadUnit::new(0, 1), 10).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.is_success()));
        let failure = results[0].to_failure().unwrap();
        assert!(failure.message.contains("absent.csv"));
        assert_eq!(store.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_writer_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.csv");
        fs::write(&path, "id\n1\nbad\n3\n").unwrap();

        let store = MemoryStore::new().fail_rows_containing("bad");
        let job = job_for(&path, &store, Vec::new());
        let results = run_unit(&job, LoadUnit::new(0, 1), 1).await;

        let writer = results.iter().find(|r| r.kind == TaskKind::Writer).unwrap();
        assert!(writer.error.as_deref().unwrap().contains("invalid input value"));
        assert_eq!(store.row_count(&QualifiedName::new(None, "items")), 0);
    }
}
