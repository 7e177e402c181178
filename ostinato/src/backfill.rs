//! Cold-start backfill of long tiers from the persisted store.
//!
//! When a stream is created its series start empty and live inserts may begin
//! at once. Meanwhile a background task pulls each persisted series' recent
//! history, re-decimates it through [`SeriesBuffer::insert`] (the same rule
//! live inserts use) and hands the result back through the [`Backfill`]
//! future. The producer then installs it with
//! [`StreamSeries::apply_backfill`](crate::registry::StreamSeries::apply_backfill).
//!
//! # Degradation
//!
//! Backfill never fails. A series whose query errors or exceeds the timeout is
//! simply absent from the resulting [`StreamHistory`], which leaves it empty.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};

use crate::error::{BackfillError, Result};
use crate::ring::Sample;
use crate::series::SeriesBuffer;
use crate::store::SampleStore;

/// Pulls `[now - window, now]` of one series and drops unusable rows.
///
/// Non-finite values are filtered. If the series held rows but none were
/// usable, it is cleared so later starts do not trip over the same data.
///
/// # Errors
///
/// Returns [`StorageError`](crate::error::StorageError) if the query fails.
/// A failed clear is only logged.
pub async fn load_history(
    store: &dyn SampleStore,
    stream_id: &str,
    series_name: &str,
    window_ms: i64,
    now_ms: i64,
) -> Result<Vec<Sample>> {
    let raw = store
        .query_range(
            stream_id,
            series_name,
            Some(now_ms.saturating_sub(window_ms)),
            Some(now_ms),
        )
        .await?;
    let raw_len = raw.len();

    let valid: Vec<Sample> = raw.into_iter().filter(|s| s.value.is_finite()).collect();
    if raw_len > 0 && valid.is_empty() {
        tracing::warn!(
            stream_id,
            series = series_name,
            rows = raw_len,
            "every persisted sample was invalid, clearing series",
        );
        if let Err(e) = store.clear_series(stream_id, series_name).await {
            tracing::error!(
                stream_id,
                series = series_name,
                error = %e,
                "failed to clear invalid series",
            );
        }
    }

    Ok(valid)
}

/// Replays `history` into `buffer` in timestamp order.
///
/// The result is indistinguishable from live-inserting the same samples:
/// one sample per bucket, only the most recent `capacity` buckets kept.
pub fn populate_from_history(buffer: &mut SeriesBuffer, mut history: Vec<Sample>) {
    history.sort_by_key(|s| s.timestamp);
    for sample in history {
        buffer.insert(sample);
    }
}

/// Backfilled long tiers of one stream, keyed by series name.
#[derive(Debug, Default)]
pub struct StreamHistory {
    long: BTreeMap<String, SeriesBuffer>,
    failures: Vec<BackfillError>,
}

impl StreamHistory {
    /// The backfilled long tier of `series_name`, if it loaded.
    pub fn long(&self, series_name: &str) -> Option<&SeriesBuffer> {
        self.long.get(series_name)
    }

    /// Names of the series that loaded, sorted.
    pub fn series_names(&self) -> impl Iterator<Item = &str> {
        self.long.keys().map(String::as_str)
    }

    /// Series that fell back to empty state, and why.
    pub fn failures(&self) -> &[BackfillError] {
        &self.failures
    }

    /// Returns `true` if no series loaded.
    pub fn is_empty(&self) -> bool {
        self.long.is_empty()
    }

    pub(crate) fn into_parts(self) -> BTreeMap<String, SeriesBuffer> {
        self.long
    }
}

/// One series to backfill.
#[derive(Debug)]
pub(crate) struct BackfillPlan {
    pub(crate) series_name: String,
    pub(crate) empty_long: SeriesBuffer,
    pub(crate) window_ms: i64,
}

/// Resolves once every planned series has been loaded, has failed or has
/// timed out.
///
/// Awaiting is optional; dropping the future does not cancel the load.
#[derive(Debug)]
#[must_use = "the backfilled history is only delivered through this future"]
pub struct Backfill {
    handle: JoinHandle<StreamHistory>,
}

impl Backfill {
    /// Spawns the loader for `plans` on the current Tokio runtime.
    ///
    /// Series load concurrently, each under its own `timeout`, so a slow
    /// store delays the whole stream by at most one timeout.
    pub(crate) fn spawn(
        store: Arc<dyn SampleStore>,
        stream_id: String,
        plans: Vec<BackfillPlan>,
        timeout: Duration,
        now_ms: i64,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let stream_id: Arc<str> = stream_id.into();
            let mut loads = JoinSet::new();
            for (index, plan) in plans.into_iter().enumerate() {
                let store = Arc::clone(&store);
                let stream_id = Arc::clone(&stream_id);
                loads.spawn(async move {
                    let outcome = load_series(store.as_ref(), &stream_id, plan, timeout, now_ms).await;
                    (index, outcome)
                });
            }

            let mut outcomes = Vec::new();
            while let Some(joined) = loads.join_next().await {
                match joined {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        tracing::warn!(
                            stream_id = %stream_id,
                            error = %e,
                            "backfill load failed, keeping empty state",
                        );
                    }
                }
            }

            // failures are reported in plan order
            outcomes.sort_unstable_by_key(|(index, _)| *index);
            let mut history = StreamHistory::default();
            for (_, outcome) in outcomes {
                match outcome {
                    Ok((series_name, long)) => {
                        history.long.insert(series_name, long);
                    }
                    Err(error) => history.failures.push(error),
                }
            }
            history
        });
        Self { handle }
    }
}

async fn load_series(
    store: &dyn SampleStore,
    stream_id: &str,
    plan: BackfillPlan,
    timeout: Duration,
    now_ms: i64,
) -> std::result::Result<(String, SeriesBuffer), BackfillError> {
    let BackfillPlan {
        series_name,
        mut empty_long,
        window_ms,
    } = plan;

    let query = load_history(store, stream_id, &series_name, window_ms, now_ms);
    let error = match tokio::time::timeout(timeout, query).await {
        Ok(Ok(samples)) => {
            let loaded = samples.len();
            populate_from_history(&mut empty_long, samples);
            tracing::debug!(
                stream_id,
                series = %series_name,
                loaded,
                retained = empty_long.len(),
                "backfilled long tier",
            );
            return Ok((series_name, empty_long));
        }
        Ok(Err(e)) => BackfillError::Query {
            stream_id: stream_id.to_string(),
            series_name,
            source: Box::new(e),
        },
        Err(_) => BackfillError::TimedOut {
            stream_id: stream_id.to_string(),
            series_name,
            after: timeout,
        },
    };

    tracing::warn!(stream_id, error = %error, "backfill degraded to empty state");
    Err(error)
}

impl Future for Backfill {
    type Output = StreamHistory;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(history)) => Poll::Ready(history),
            Poll::Ready(Err(e)) => {
                tracing::warn!(error = %e, "backfill task failed, keeping empty state");
                Poll::Ready(StreamHistory::default())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::store::MemoryStore;

    fn empty_long(capacity: usize) -> SeriesBuffer {
        SeriesBuffer::with_capacity(NonZeroUsize::new(capacity).unwrap(), 1_000)
    }

    #[test]
    fn test_populate_matches_live_insertion() {
        let history = vec![
            Sample::new(5_100, 6.0),
            Sample::new(0, 1.0),
            Sample::new(2_500, 4.0),
            Sample::new(500, 2.0),
            Sample::new(3_600, 5.0),
            Sample::new(1_000, 3.0),
        ];

        let mut backfilled = empty_long(5);
        populate_from_history(&mut backfilled, history.clone());

        let mut live = empty_long(5);
        let mut sorted = history;
        sorted.sort_by_key(|s| s.timestamp);
        for sample in sorted {
            live.insert(sample);
        }

        assert_eq!(backfilled, live);
        assert_eq!(backfilled.ring().write_index(), live.ring().write_index());
        let retained: Vec<(i64, f64)> = backfilled.iter().map(|s| (s.timestamp, s.value)).collect();
        assert_eq!(
            retained,
            vec![(0, 1.0), (1_000, 3.0), (2_000, 4.0), (3_000, 5.0), (5_000, 6.0)]
        );
    }

    #[test]
    fn test_populate_keeps_most_recent() {
        let history: Vec<Sample> = (0..20).map(|i| Sample::new(i * 1_000, i as f64)).collect();
        let mut buffer = empty_long(5);
        populate_from_history(&mut buffer, history);

        assert_eq!(buffer.len(), 5);
        let timestamps: Vec<i64> = buffer.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![15_000, 16_000, 17_000, 18_000, 19_000]);
    }

    #[tokio::test]
    async fn test_load_history_filters_non_finite() {
        let store = MemoryStore::new();
        store
            .put_many(
                "s1",
                "temp",
                &[
                    Sample::new(1_000, 1.0),
                    Sample::new(2_000, f64::NAN),
                    Sample::new(3_000, f64::INFINITY),
                    Sample::new(4_000, 4.0),
                ],
            )
            .await
            .unwrap();

        let loaded = load_history(&store, "s1", "temp", 10_000, 5_000).await.unwrap();
        assert_eq!(loaded, vec![Sample::new(1_000, 1.0), Sample::new(4_000, 4.0)]);
        assert_eq!(store.stats("s1", "temp").await.unwrap().count, 4);
    }

    #[tokio::test]
    async fn test_load_history_clears_all_invalid_series() {
        let store = MemoryStore::new();
        store
            .put_many("s1", "temp", &[Sample::new(1_000, f64::NAN)])
            .await
            .unwrap();

        let loaded = load_history(&store, "s1", "temp", 10_000, 5_000).await.unwrap();
        assert!(loaded.is_empty());
        assert_eq!(store.stats("s1", "temp").await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_load_history_respects_window() {
        let store = MemoryStore::new();
        store
            .put_many(
                "s1",
                "temp",
                &[Sample::new(1_000, 1.0), Sample::new(8_000, 8.0), Sample::new(12_000, 12.0)],
            )
            .await
            .unwrap();

        let loaded = load_history(&store, "s1", "temp", 5_000, 10_000).await.unwrap();
        assert_eq!(loaded, vec![Sample::new(8_000, 8.0)]);
    }

    #[tokio::test]
    async fn test_backfill_future_resolves() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_many("s1", "temp", &[Sample::new(1_000, 1.0), Sample::new(2_000, 2.0)])
            .await
            .unwrap();

        let plans = vec![
            BackfillPlan {
                series_name: "temp".to_string(),
                empty_long: empty_long(5),
                window_ms: 10_000,
            },
            BackfillPlan {
                series_name: "empty".to_string(),
                empty_long: empty_long(5),
                window_ms: 10_000,
            },
        ];
        let history =
            Backfill::spawn(store, "s1".to_string(), plans, Duration::from_secs(1), 5_000).await;

        assert!(history.failures().is_empty());
        assert_eq!(history.series_names().collect::<Vec<_>>(), vec!["empty", "temp"]);
        assert_eq!(history.long("temp").map(SeriesBuffer::len), Some(2));
        assert_eq!(history.long("empty").map(SeriesBuffer::len), Some(0));
    }
}
