//! Interval-gated retention pruning of persisted samples.
//!
//! There is no timer. Every insert into a persisted series asks its
//! [`RetentionJanitor`] whether a run is due; if so a prune request is queued
//! on the write-behind channel and the insert returns immediately.
//!
//! ```text
//!            now - last_cleanup >= cleanup_interval
//!   Idle  ------------------------------------------->  Cleaning
//!    ^                                                      |
//!    +------------------------------------------------------+
//!         prune finished (last_cleanup = now on success only)
//! ```
//!
//! A failed prune leaves `last_cleanup` untouched, so the next insert retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::error::Result;
use crate::schema::PersistenceConfig;
use crate::store::SampleStore;
use crate::writeback::WriteBehind;

/// Whether a prune is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JanitorState {
    /// No prune in flight.
    Idle,
    /// A prune has been queued or is running.
    Cleaning,
}

#[derive(Debug)]
pub(crate) struct Shared {
    cleaning: AtomicBool,
    last_cleanup_ms: AtomicI64,
    runs: AtomicU64,
    failures: AtomicU64,
}

impl Shared {
    fn finish(&self, completed_at: Option<i64>) {
        match completed_at {
            Some(now_ms) => {
                self.last_cleanup_ms.store(now_ms, Ordering::Release);
                self.runs.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.cleaning.store(false, Ordering::Release);
    }
}

/// A queued prune of one series.
#[derive(Debug)]
pub(crate) struct PruneRequest {
    stream_id: String,
    series_name: String,
    now_ms: i64,
    cutoff: i64,
    shared: Arc<Shared>,
}

/// Retention state machine for one persisted series.
#[derive(Debug, Clone)]
pub struct RetentionJanitor {
    stream_id: String,
    series_name: String,
    max_retention_ms: i64,
    cleanup_interval_ms: i64,
    shared: Arc<Shared>,
}

impl RetentionJanitor {
    /// Creates an idle janitor whose first run is due one cleanup interval
    /// after `created_at_ms`.
    pub fn new(
        stream_id: &str,
        series_name: &str,
        config: &PersistenceConfig,
        created_at_ms: i64,
    ) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            series_name: series_name.to_string(),
            max_retention_ms: config.max_retention_ms(),
            cleanup_interval_ms: config.cleanup_interval_ms(),
            shared: Arc::new(Shared {
                cleaning: AtomicBool::new(false),
                last_cleanup_ms: AtomicI64::new(created_at_ms),
                runs: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> JanitorState {
        if self.shared.cleaning.load(Ordering::Acquire) {
            JanitorState::Cleaning
        } else {
            JanitorState::Idle
        }
    }

    /// Time of the last successful prune, or of creation if none succeeded.
    pub fn last_cleanup_ms(&self) -> i64 {
        self.shared.last_cleanup_ms.load(Ordering::Acquire)
    }

    /// Successful prunes so far.
    pub fn runs(&self) -> u64 {
        self.shared.runs.load(Ordering::Relaxed)
    }

    /// Failed prunes so far.
    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    /// Rows older than this are pruned by a run at `now_ms`.
    pub fn cutoff(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.max_retention_ms)
    }

    /// Returns `true` once a full cleanup interval has passed since the last
    /// successful run.
    pub fn is_due(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_cleanup_ms()) >= self.cleanup_interval_ms
    }

    /// Queues a prune if one is due and none is in flight.
    ///
    /// Returns `true` if a request was queued. A full queue leaves the janitor
    /// idle so the next insert tries again.
    pub(crate) fn maybe_trigger(&self, now_ms: i64, writer: &WriteBehind) -> bool {
        if !self.is_due(now_ms) {
            return false;
        }
        if self
            .shared
            .cleaning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let request = PruneRequest {
            stream_id: self.stream_id.clone(),
            series_name: self.series_name.clone(),
            now_ms,
            cutoff: self.cutoff(now_ms),
            shared: Arc::clone(&self.shared),
        };
        if writer.request_prune(request) {
            true
        } else {
            self.shared.cleaning.store(false, Ordering::Release);
            false
        }
    }

    /// Prunes immediately, bypassing the interval gate and the queue.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`](crate::error::StorageError) if the delete
    /// fails; `last_cleanup` is left untouched in that case.
    pub async fn run_once(&self, store: &dyn SampleStore, now_ms: i64) -> Result<usize> {
        match store
            .delete_before(&self.stream_id, &self.series_name, self.cutoff(now_ms))
            .await
        {
            Ok(removed) => {
                self.shared.last_cleanup_ms.store(now_ms, Ordering::Release);
                self.shared.runs.fetch_add(1, Ordering::Relaxed);
                Ok(removed)
            }
            Err(e) => {
                self.shared.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

/// Runs a queued prune on the write-behind task.
pub(crate) async fn execute(store: &dyn SampleStore, request: PruneRequest) {
    match store
        .delete_before(&request.stream_id, &request.series_name, request.cutoff)
        .await
    {
        Ok(removed) => {
            tracing::debug!(
                stream_id = %request.stream_id,
                series = %request.series_name,
                cutoff = request.cutoff,
                removed,
                "retention prune finished",
            );
            request.shared.finish(Some(request.now_ms));
        }
        Err(e) => {
            tracing::warn!(
                stream_id = %request.stream_id,
                series = %request.series_name,
                error = %e,
                "retention prune failed, will retry",
            );
            request.shared.finish(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ring::Sample;
    use crate::store::MemoryStore;

    fn config() -> PersistenceConfig {
        PersistenceConfig {
            enabled: true,
            max_retention: Duration::from_millis(10_000),
            cleanup_interval: Duration::from_millis(1_000),
            initial_load_window: None,
        }
    }

    #[test]
    fn test_due_after_interval_from_creation() {
        let janitor = RetentionJanitor::new("s1", "temp", &config(), 5_000);

        assert_eq!(janitor.state(), JanitorState::Idle);
        assert_eq!(janitor.last_cleanup_ms(), 5_000);
        assert!(!janitor.is_due(5_999));
        assert!(janitor.is_due(6_000));
        assert_eq!(janitor.cutoff(20_000), 10_000);
    }

    #[tokio::test]
    async fn test_run_once_records_success() {
        let store = MemoryStore::new();
        store
            .put_many("s1", "temp", &[Sample::new(1_000, 1.0), Sample::new(15_000, 2.0)])
            .await
            .unwrap();
        let janitor = RetentionJanitor::new("s1", "temp", &config(), 0);

        let removed = janitor.run_once(&store, 20_000).await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(janitor.last_cleanup_ms(), 20_000);
        assert_eq!(janitor.runs(), 1);
        assert_eq!(store.stats("s1", "temp").await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_trigger_through_writer() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_many("s1", "temp", &[Sample::new(1_000, 1.0), Sample::new(15_000, 2.0)])
            .await
            .unwrap();
        let writer = WriteBehind::spawn(store.clone(), 16, 16);
        let janitor = RetentionJanitor::new("s1", "temp", &config(), 0);

        assert!(!janitor.maybe_trigger(500, &writer));
        assert!(janitor.maybe_trigger(20_000, &writer));
        assert_eq!(janitor.state(), JanitorState::Cleaning);
        // a second trigger while in flight is ignored
        assert!(!janitor.maybe_trigger(20_001, &writer));

        writer.flush().await.unwrap();

        assert_eq!(janitor.state(), JanitorState::Idle);
        assert_eq!(janitor.last_cleanup_ms(), 20_000);
        assert_eq!(store.stats("s1", "temp").await.unwrap().count, 1);
        assert!(!janitor.maybe_trigger(20_500, &writer));
    }
}
