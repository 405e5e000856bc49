//! Bounded worker pool shared by every per-path clone of one load
//!
//! A fixed number of tokio tasks pull boxed futures from one FIFO queue, so at
//! most `size` submitted tasks run at a time and the rest wait in order.
//! Shutdown is two separate steps: [`WorkerPool::request_shutdown`] stops
//! accepting work without waiting, [`WorkerPool::await_shutdown`] waits for
//! every worker to exit.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fanload_common::{FanloadError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type PoolTask = BoxFuture<'static, ()>;

pub struct WorkerPool {
    size: usize,
    sender: Mutex<Option<mpsc::UnboundedSender<PoolTask>>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers on the current tokio runtime
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(FanloadError::Config(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel::<PoolTask>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..size)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(task) = next else {
                            break;
                        };
                        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                            warn!(worker, "Pool task panicked");
                        }
                    }
                    debug!(worker, "Pool worker stopped");
                })
            })
            .collect();

        debug!(size, "Worker pool started");
        Ok(Self {
            size,
            sender: Mutex::new(Some(sender)),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a task. Fails with `PoolClosed` once shutdown was requested.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.lock_sender();
        let sender = sender.as_ref().ok_or(FanloadError::PoolClosed)?;
        sender
            .send(task.boxed())
            .map_err(|_| FanloadError::PoolClosed)
    }

    pub fn is_accepting(&self) -> bool {
        self.lock_sender().is_some()
    }

    /// Stop accepting tasks. Queued and running tasks still complete.
    /// Returns false if shutdown had already been requested.
    pub fn request_shutdown(&self) -> bool {
        let closed = self.lock_sender().take().is_some();
        if closed {
            debug!(size = self.size, "Worker pool shutdown requested");
        }
        closed
    }

    /// Wait until every worker has drained the queue and exited
    pub async fn await_shutdown(self) {
        self.request_shutdown();
        for (worker, handle) in self.workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                warn!(worker, error = %e, "Pool worker ended abnormally");
            }
        }
        debug!(size = self.size, "Worker pool terminated");
    }

    fn lock_sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<PoolTask>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_every_queued_task() {
        let pool = WorkerPool::new(2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let done = Arc::clone(&done);
            pool.submit(async move {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(pool.request_shutdown());
        assert!(!pool.request_shutdown());
        pool.await_shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new(1).unwrap();
        assert!(pool.is_accepting());
        pool.request_shutdown();
        assert!(!pool.is_accepting());
        assert!(matches!(pool.submit(async {}), Err(FanloadError::PoolClosed)));
        pool.await_shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded_by_size() {
        let pool = WorkerPool::new(2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.await_shutdown().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stop_worker() {
        let pool = WorkerPool::new(1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        pool.submit(async {
            panic!("task blew up");
        })
        .unwrap();
        let counter = Arc::clone(&done);
        pool.submit(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.await_shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(FanloadError::Config(_))));
    }
}
