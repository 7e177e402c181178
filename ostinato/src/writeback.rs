//! Write-behind persistence queue.
//!
//! The insert path never awaits storage. Long-tier samples are pushed onto a
//! bounded channel with `try_send` and committed by a single background task
//! in `put_many` batches. Janitor prune requests and flush barriers travel on
//! the same channel, so they observe every write enqueued before them.
//!
//! # Design
//!
//! - A full queue drops the write and counts it; memory stays authoritative
//! - Storage failures are logged and counted, never returned to producers
//! - Batches are grouped per `(stream_id, series_name)` before committing
//! - [`WriteBehind::flush`] resolves once everything enqueued before it has
//!   been committed or has failed

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, StorageError};
use crate::janitor::{self, PruneRequest};
use crate::ring::Sample;
use crate::store::{PersistedSample, SampleStore};

/// Messages handled by the background writer.
#[derive(Debug)]
pub(crate) enum Command {
    Write(PersistedSample),
    Prune(PruneRequest),
    Flush(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of the write-behind counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBehindStats {
    /// Samples accepted onto the queue.
    pub enqueued: u64,
    /// Samples committed to the store.
    pub written: u64,
    /// Samples whose commit failed.
    pub failed: u64,
    /// Samples refused because the queue was full or the writer had stopped.
    pub dropped: u64,
}

impl WriteBehindStats {
    /// Samples accepted but not yet committed or failed.
    pub fn pending(&self) -> u64 {
        self.enqueued.saturating_sub(self.written + self.failed)
    }
}

/// Handle to the background writer.
///
/// Cloning is cheap; every clone feeds the same queue and counters.
#[derive(Debug, Clone)]
pub struct WriteBehind {
    tx: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WriteBehind {
    /// Spawns the background writer on the current Tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `store` - Destination of every committed sample
    /// * `capacity` - Queue length; writes beyond it are dropped
    /// * `batch_size` - Most samples committed per batch
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn(store: Arc<dyn SampleStore>, capacity: usize, batch_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let task = tokio::spawn(run(store, rx, Arc::clone(&counters), batch_size.max(1)));

        Self {
            tx,
            counters,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Queues one sample without waiting.
    ///
    /// Returns `false` if the sample was dropped.
    pub fn enqueue(&self, stream_id: &str, series_name: &str, sample: Sample) -> bool {
        let row = PersistedSample::new(stream_id, series_name, sample);
        match self.tx.try_send(Command::Write(row)) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped.is_multiple_of(1024) {
                    let reason = match e {
                        mpsc::error::TrySendError::Full(_) => "queue full",
                        mpsc::error::TrySendError::Closed(_) => "writer stopped",
                    };
                    tracing::warn!(
                        stream_id,
                        series = series_name,
                        dropped,
                        reason,
                        "dropping persisted sample",
                    );
                }
                false
            }
        }
    }

    /// Queues a prune request without waiting. Returns `false` if the queue
    /// refused it.
    pub(crate) fn request_prune(&self, request: PruneRequest) -> bool {
        self.tx.try_send(Command::Prune(request)).is_ok()
    }

    /// Waits until every sample enqueued before this call has been committed
    /// or has failed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`] if the writer has stopped.
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Flush(done))
            .await
            .map_err(|_| writer_stopped())?;
        wait.await.map_err(|_| writer_stopped())?;
        Ok(())
    }

    /// Commits everything queued, then stops the writer. Later enqueues are
    /// dropped. Calling this twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TaskFailed`] if the writer task panicked.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };

        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Stop(done)).await.is_ok() {
            let _ = wait.await;
        }
        task.await.map_err(StorageError::from)?;
        Ok(())
    }

    /// Current counter values.
    pub fn stats(&self) -> WriteBehindStats {
        WriteBehindStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

fn writer_stopped() -> StorageError {
    StorageError::Unavailable {
        reason: "write-behind task stopped".to_string(),
    }
}

async fn run(
    store: Arc<dyn SampleStore>,
    mut rx: mpsc::Receiver<Command>,
    counters: Arc<Counters>,
    batch_size: usize,
) {
    let mut batch: Vec<PersistedSample> = Vec::with_capacity(batch_size);

    while let Some(first) = rx.recv().await {
        let mut next = Some(first);

        // Drain without blocking until the batch is full or the queue is empty.
        while let Some(command) = next.take() {
            match command {
                Command::Write(row) => {
                    batch.push(row);
                    if batch.len() < batch_size {
                        next = rx.try_recv().ok();
                    }
                }
                Command::Prune(request) => {
                    commit(store.as_ref(), &mut batch, &counters).await;
                    janitor::execute(store.as_ref(), request).await;
                    next = rx.try_recv().ok();
                }
                Command::Flush(done) => {
                    commit(store.as_ref(), &mut batch, &counters).await;
                    let _ = done.send(());
                    next = rx.try_recv().ok();
                }
                Command::Stop(done) => {
                    commit(store.as_ref(), &mut batch, &counters).await;
                    let _ = done.send(());
                    tracing::debug!("write-behind task stopped");
                    return;
                }
            }
        }

        commit(store.as_ref(), &mut batch, &counters).await;
    }

    tracing::debug!("write-behind channel closed");
}

async fn commit(store: &dyn SampleStore, batch: &mut Vec<PersistedSample>, counters: &Counters) {
    if batch.is_empty() {
        return;
    }

    let mut groups: BTreeMap<(String, String), Vec<Sample>> = BTreeMap::new();
    for row in batch.drain(..) {
        let sample = row.sample();
        groups
            .entry((row.stream_id, row.series_name))
            .or_default()
            .push(sample);
    }

    for ((stream_id, series_name), samples) in groups {
        let count = samples.len() as u64;
        match store.put_many(&stream_id, &series_name, &samples).await {
            Ok(()) => {
                counters.written.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(count, Ordering::Relaxed);
                tracing::error!(
                    stream_id = %stream_id,
                    series = %series_name,
                    count,
                    error = %e,
                    "failed to persist samples",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_enqueue_and_flush() {
        let store = Arc::new(MemoryStore::new());
        let writer = WriteBehind::spawn(store.clone(), 16, 4);

        for ts in 0..10 {
            assert!(writer.enqueue("s1", "temp", Sample::new(ts, 1.0)));
        }
        writer.flush().await.unwrap();

        let stats = writer.stats();
        assert_eq!(stats.enqueued, 10);
        assert_eq!(stats.written, 10);
        assert_eq!(stats.pending(), 0);
        assert_eq!(store.row_count().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_failed_writes_are_counted() {
        let store = Arc::new(MemoryStore::with_quota(2));
        let writer = WriteBehind::spawn(store.clone(), 16, 16);

        for ts in 0..5 {
            writer.enqueue("s1", "temp", Sample::new(ts, 1.0));
        }
        writer.flush().await.unwrap();

        let stats = writer.stats();
        assert_eq!(stats.enqueued, 5);
        assert_eq!(stats.written + stats.failed, 5);
        assert!(stats.failed > 0);
        assert!(store.row_count().unwrap() <= 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops() {
        let store = Arc::new(MemoryStore::new());
        let writer = WriteBehind::spawn(store.clone(), 2, 1);

        // the writer task cannot run until this task yields
        let accepted = (0..5)
            .filter(|&ts| writer.enqueue("s1", "temp", Sample::new(ts, 1.0)))
            .count();

        assert_eq!(accepted, 2);
        assert_eq!(writer.stats().dropped, 3);

        writer.flush().await.unwrap();
        assert_eq!(store.row_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_commits_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let writer = WriteBehind::spawn(store.clone(), 16, 16);

        writer.enqueue("s1", "temp", Sample::new(1, 1.0));
        writer.shutdown().await.unwrap();
        assert_eq!(store.row_count().unwrap(), 1);

        assert!(!writer.enqueue("s1", "temp", Sample::new(2, 1.0)));
        assert!(writer.flush().await.is_err());
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_batches_group_by_series() {
        let store = Arc::new(MemoryStore::new());
        let writer = WriteBehind::spawn(store.clone(), 64, 64);

        writer.enqueue("a", "x", Sample::new(1, 1.0));
        writer.enqueue("b", "x", Sample::new(1, 2.0));
        writer.enqueue("a", "y", Sample::new(1, 3.0));
        writer.enqueue("a", "x", Sample::new(2, 4.0));
        writer.flush().await.unwrap();

        let rows = store.query_range("a", "x", None, None).await.unwrap();
        assert_eq!(rows, vec![Sample::new(1, 1.0), Sample::new(2, 4.0)]);
        assert_eq!(store.list_streams().await.unwrap(), vec!["a", "b"]);
        assert_eq!(writer.stats().written, 4);
    }
}
