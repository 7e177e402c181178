//! Persisted long-tier storage.
//!
//! The [`SampleStore`] trait is the seam between in-memory series and durable
//! storage. It models one logical table keyed by
//! `(stream_id, series_name, timestamp)` with secondary access by stream and by
//! `(stream_id, series_name)`. A later write with the same key overwrites the
//! earlier value.
//!
//! Two backends ship with the crate:
//!
//! - [`SqliteStore`](crate::sqlite::SqliteStore) - durable, file or in-memory
//! - [`MemoryStore`] - nested ordered maps with an optional row quota
//!
//! Every method surfaces failures as [`StorageError`]. Callers on the
//! write-behind path log and drop them; everything else propagates them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::ring::Sample;

/// One row of the persisted table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSample {
    /// Stream the sample belongs to.
    pub stream_id: String,
    /// Series within the stream.
    pub series_name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// The reading.
    pub value: f64,
}

impl PersistedSample {
    /// Builds a row from its key parts and a sample.
    pub fn new(stream_id: &str, series_name: &str, sample: Sample) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            series_name: series_name.to_string(),
            timestamp: sample.timestamp,
            value: sample.value,
        }
    }

    /// The `(timestamp, value)` part of the row.
    pub fn sample(&self) -> Sample {
        Sample::new(self.timestamp, self.value)
    }
}

/// Aggregate statistics for one persisted series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of rows.
    pub count: usize,
    /// Smallest stored timestamp.
    pub oldest_timestamp: Option<i64>,
    /// Largest stored timestamp.
    pub newest_timestamp: Option<i64>,
}

/// Durable storage for long-tier samples.
///
/// Implementations must be shareable across tasks; the registry holds one
/// behind an `Arc` and calls it from the write-behind task, from backfill and
/// from the janitor concurrently.
#[async_trait]
pub trait SampleStore: Send + Sync + fmt::Debug {
    /// Upserts one sample.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the write fails.
    async fn put(&self, stream_id: &str, series_name: &str, sample: Sample) -> Result<()> {
        self.put_many(stream_id, series_name, &[sample]).await
    }

    /// Upserts samples in one transaction; either all are written or none.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the write fails.
    async fn put_many(&self, stream_id: &str, series_name: &str, samples: &[Sample])
    -> Result<()>;

    /// Samples with `start <= timestamp <= end`, ascending. A `None` bound is
    /// unbounded.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails.
    async fn query_range(
        &self,
        stream_id: &str,
        series_name: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Sample>>;

    /// The `count` most recent samples, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails.
    async fn query_latest(
        &self,
        stream_id: &str,
        series_name: &str,
        count: usize,
    ) -> Result<Vec<Sample>>;

    /// Deletes samples with `timestamp < cutoff` and returns how many were
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the delete fails.
    async fn delete_before(&self, stream_id: &str, series_name: &str, cutoff: i64)
    -> Result<usize>;

    /// Deletes every sample of one series and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the delete fails.
    async fn clear_series(&self, stream_id: &str, series_name: &str) -> Result<usize>;

    /// Deletes every sample of every series of a stream and returns how many
    /// were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the delete fails.
    async fn clear_stream(&self, stream_id: &str) -> Result<usize>;

    /// Row count and timestamp bounds of one series.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails.
    async fn stats(&self, stream_id: &str, series_name: &str) -> Result<StoreStats>;

    /// Every stream with at least one stored sample, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails.
    async fn list_streams(&self) -> Result<Vec<String>>;

    /// Every series of `stream_id` with at least one stored sample, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails.
    async fn list_series(&self, stream_id: &str) -> Result<Vec<String>>;
}

type Series = BTreeMap<i64, f64>;
type Streams = BTreeMap<String, BTreeMap<String, Series>>;

/// In-process [`SampleStore`] backed by ordered maps.
///
/// Useful for tests, simulations and deployments that only need the
/// persistence semantics within one process lifetime. An optional row quota
/// makes writes fail with [`StorageError::QuotaExceeded`] once reached.
///
/// # Examples
///
/// ```rust
/// use ostinato::ring::Sample;
/// use ostinato::store::{MemoryStore, SampleStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryStore::new();
/// store.put("press-1", "temperature", Sample::new(1_000, 180.5)).await?;
///
/// let rows = store.query_range("press-1", "temperature", None, None).await?;
/// assert_eq!(rows, vec![Sample::new(1_000, 180.5)]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    streams: Mutex<Streams>,
    max_rows: Option<usize>,
}

impl MemoryStore {
    /// Creates an empty, unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that refuses writes beyond `max_rows` rows.
    pub fn with_quota(max_rows: usize) -> Self {
        Self {
            streams: Mutex::new(BTreeMap::new()),
            max_rows: Some(max_rows),
        }
    }

    /// Total rows across every stream.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockPoisoned`] if a writer panicked.
    pub fn row_count(&self) -> Result<usize> {
        let streams = self.lock()?;
        Ok(total_rows(&streams))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Streams>> {
        self.streams
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }
}

fn total_rows(streams: &Streams) -> usize {
    streams
        .values()
        .flat_map(BTreeMap::values)
        .map(BTreeMap::len)
        .sum()
}

/// Drops a series map once empty, and the stream map once it has no series.
fn prune_empty(streams: &mut Streams, stream_id: &str, series_name: &str) {
    if let Some(series) = streams.get_mut(stream_id) {
        if series.get(series_name).is_some_and(BTreeMap::is_empty) {
            series.remove(series_name);
        }
        if series.is_empty() {
            streams.remove(stream_id);
        }
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn put_many(
        &self,
        stream_id: &str,
        series_name: &str,
        samples: &[Sample],
    ) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut streams = self.lock()?;

        if let Some(limit) = self.max_rows {
            let rows = total_rows(&streams);
            let existing = streams.get(stream_id).and_then(|s| s.get(series_name));
            let mut fresh: Vec<i64> = samples
                .iter()
                .map(|s| s.timestamp)
                .filter(|ts| existing.is_none_or(|series| !series.contains_key(ts)))
                .collect();
            fresh.sort_unstable();
            fresh.dedup();
            if rows + fresh.len() > limit {
                return Err(StorageError::QuotaExceeded { rows, limit }.into());
            }
        }

        let series = streams
            .entry(stream_id.to_string())
            .or_default()
            .entry(series_name.to_string())
            .or_default();
        for sample in samples {
            series.insert(sample.timestamp, sample.value);
        }
        Ok(())
    }

    async fn query_range(
        &self,
        stream_id: &str,
        series_name: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Sample>> {
        let start = start.unwrap_or(i64::MIN);
        let end = end.unwrap_or(i64::MAX);
        if start > end {
            return Ok(Vec::new());
        }

        let streams = self.lock()?;
        Ok(streams
            .get(stream_id)
            .and_then(|s| s.get(series_name))
            .map(|series| {
                series
                    .range(start..=end)
                    .map(|(&ts, &value)| Sample::new(ts, value))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_latest(
        &self,
        stream_id: &str,
        series_name: &str,
        count: usize,
    ) -> Result<Vec<Sample>> {
        let streams = self.lock()?;
        let Some(series) = streams.get(stream_id).and_then(|s| s.get(series_name)) else {
            return Ok(Vec::new());
        };

        let mut latest: Vec<Sample> = series
            .iter()
            .rev()
            .take(count)
            .map(|(&ts, &value)| Sample::new(ts, value))
            .collect();
        latest.reverse();
        Ok(latest)
    }

    async fn delete_before(
        &self,
        stream_id: &str,
        series_name: &str,
        cutoff: i64,
    ) -> Result<usize> {
        let mut streams = self.lock()?;
        let Some(series) = streams
            .get_mut(stream_id)
            .and_then(|s| s.get_mut(series_name))
        else {
            return Ok(0);
        };

        let kept = series.split_off(&cutoff);
        let removed = series.len();
        *series = kept;
        prune_empty(&mut streams, stream_id, series_name);
        Ok(removed)
    }

    async fn clear_series(&self, stream_id: &str, series_name: &str) -> Result<usize> {
        let mut streams = self.lock()?;
        let removed = streams
            .get_mut(stream_id)
            .and_then(|s| s.remove(series_name))
            .map_or(0, |series| series.len());
        prune_empty(&mut streams, stream_id, series_name);
        Ok(removed)
    }

    async fn clear_stream(&self, stream_id: &str) -> Result<usize> {
        let mut streams = self.lock()?;
        Ok(streams
            .remove(stream_id)
            .map_or(0, |series| series.values().map(BTreeMap::len).sum()))
    }

    async fn stats(&self, stream_id: &str, series_name: &str) -> Result<StoreStats> {
        let streams = self.lock()?;
        Ok(streams
            .get(stream_id)
            .and_then(|s| s.get(series_name))
            .map(|series| StoreStats {
                count: series.len(),
                oldest_timestamp: series.keys().next().copied(),
                newest_timestamp: series.keys().next_back().copied(),
            })
            .unwrap_or_default())
    }

    async fn list_streams(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    async fn list_series(&self, stream_id: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .get(stream_id)
            .map(|series| series.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OstinatoError;

    fn samples(timestamps: &[i64]) -> Vec<Sample> {
        timestamps
            .iter()
            .map(|&ts| Sample::new(ts, ts as f64 / 10.0))
            .collect()
    }

    #[tokio::test]
    async fn test_put_and_query_range() {
        let store = MemoryStore::new();
        store
            .put_many("s1", "temp", &samples(&[3_000, 1_000, 2_000]))
            .await
            .unwrap();

        let all = store.query_range("s1", "temp", None, None).await.unwrap();
        assert_eq!(all, samples(&[1_000, 2_000, 3_000]));

        let bounded = store
            .query_range("s1", "temp", Some(2_000), Some(3_000))
            .await
            .unwrap();
        assert_eq!(bounded, samples(&[2_000, 3_000]));

        let inverted = store
            .query_range("s1", "temp", Some(3_000), Some(1_000))
            .await
            .unwrap();
        assert!(inverted.is_empty());

        let missing = store.query_range("s1", "other", None, None).await.unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_put_overwrites_same_key() {
        let store = MemoryStore::new();
        store.put("s1", "temp", Sample::new(1_000, 1.0)).await.unwrap();
        store.put("s1", "temp", Sample::new(1_000, 2.0)).await.unwrap();

        let rows = store.query_range("s1", "temp", None, None).await.unwrap();
        assert_eq!(rows, vec![Sample::new(1_000, 2.0)]);
        assert_eq!(store.row_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_latest() {
        let store = MemoryStore::new();
        store
            .put_many("s1", "temp", &samples(&[1, 2, 3, 4, 5]))
            .await
            .unwrap();

        let latest = store.query_latest("s1", "temp", 2).await.unwrap();
        assert_eq!(latest, samples(&[4, 5]));

        let all = store.query_latest("s1", "temp", 100).await.unwrap();
        assert_eq!(all.len(), 5);

        assert!(store.query_latest("s1", "temp", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_before_and_stats() {
        let store = MemoryStore::new();
        store
            .put_many("s1", "temp", &samples(&[10, 20, 30, 40]))
            .await
            .unwrap();

        let before = store.stats("s1", "temp").await.unwrap();
        assert_eq!(before.count, 4);
        assert_eq!(before.oldest_timestamp, Some(10));
        assert_eq!(before.newest_timestamp, Some(40));

        let removed = store.delete_before("s1", "temp", 30).await.unwrap();
        assert_eq!(removed, 2);

        let after = store.stats("s1", "temp").await.unwrap();
        assert_eq!(after.count, before.count - removed);
        assert_eq!(after.oldest_timestamp, Some(30));

        assert_eq!(store.delete_before("s1", "temp", 30).await.unwrap(), 0);
        assert_eq!(store.delete_before("nope", "temp", 30).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_and_listing() {
        let store = MemoryStore::new();
        store.put_many("a", "x", &samples(&[1, 2])).await.unwrap();
        store.put_many("a", "y", &samples(&[1])).await.unwrap();
        store.put_many("b", "x", &samples(&[1])).await.unwrap();

        assert_eq!(store.list_streams().await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.list_series("a").await.unwrap(), vec!["x", "y"]);

        assert_eq!(store.clear_series("a", "x").await.unwrap(), 2);
        assert_eq!(store.list_series("a").await.unwrap(), vec!["y"]);

        assert_eq!(store.clear_stream("a").await.unwrap(), 1);
        assert_eq!(store.list_streams().await.unwrap(), vec!["b"]);
        assert_eq!(store.stats("a", "y").await.unwrap(), StoreStats::default());
    }

    #[tokio::test]
    async fn test_delete_everything_removes_stream() {
        let store = MemoryStore::new();
        store.put_many("a", "x", &samples(&[1, 2])).await.unwrap();
        store.delete_before("a", "x", 100).await.unwrap();

        assert!(store.list_streams().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quota_rejects_whole_batch() {
        let store = MemoryStore::with_quota(3);
        store.put_many("a", "x", &samples(&[1, 2])).await.unwrap();

        let err = store
            .put_many("a", "x", &samples(&[3, 4]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OstinatoError::Storage(StorageError::QuotaExceeded { rows: 2, limit: 3 })
        ));
        assert_eq!(store.row_count().unwrap(), 2);

        // overwrites do not count against the quota
        store.put_many("a", "x", &samples(&[1, 2, 3])).await.unwrap();
        assert_eq!(store.row_count().unwrap(), 3);
    }
}
