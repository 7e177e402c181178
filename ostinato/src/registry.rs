//! Stream registry: binds named series to one logical stream.
//!
//! A [`StreamSeriesRegistry`] owns what is shared by every stream: the
//! [`SampleStore`], the write-behind queue and the clock. Each call to
//! [`create`](StreamSeriesRegistry::create) returns a [`StreamSeries`] whose
//! buffers are empty and usable at once, plus a [`Backfill`] future that
//! delivers persisted history for its long tiers.
//!
//! # Insert Flow
//!
//! 1. `current` is replaced, short and long tiers are bucketed
//! 2. If the long tier advanced and the series is persisted, the sample is
//!    queued for write-behind (never awaited)
//! 3. If the series is persisted and its cleanup interval has elapsed, a
//!    retention prune is queued
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ostinato::registry::StreamSeriesRegistry;
//! use ostinato::ring::Sample;
//! use ostinato::schema::{RegistryConfig, SeriesConfig};
//! use ostinato::store::MemoryStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = StreamSeriesRegistry::new(Arc::new(MemoryStore::new()), RegistryConfig::default())?;
//!
//! let (mut stream, ready) = registry.create(
//!     "extruder-1",
//!     [("pullerSpeed", SeriesConfig::default()), ("temperature", SeriesConfig::default())],
//! )?;
//!
//! // Inserts work before history has arrived.
//! let speed = stream.handle("pullerSpeed")?;
//! stream.record(speed, Sample::new(1_700_000_000_000, 12.5))?;
//!
//! // Install history once it is ready.
//! stream.apply_backfill(ready.await);
//!
//! assert_eq!(stream.get("pullerSpeed").and_then(|s| s.current()).map(|s| s.value), Some(12.5));
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backfill::{Backfill, BackfillPlan, StreamHistory};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, Result, StreamError};
use crate::janitor::RetentionJanitor;
use crate::ring::Sample;
use crate::schema::{RegistryConfig, SeriesConfig};
use crate::store::SampleStore;
use crate::timeseries::{TierOutcomes, TimeSeries};
use crate::writeback::{WriteBehind, WriteBehindStats};

/// Pre-resolved reference to one series of a [`StreamSeries`].
///
/// Handles are `Copy` and skip the name lookup on the hot path. They are only
/// meaningful for the stream that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeriesHandle {
    index: usize,
}

impl SeriesHandle {
    /// Position of the series within its stream.
    pub fn index(self) -> usize {
        self.index
    }
}

/// Factory for [`StreamSeries`] sharing one store and write-behind queue.
#[derive(Debug)]
pub struct StreamSeriesRegistry {
    store: Arc<dyn SampleStore>,
    writer: WriteBehind,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

impl StreamSeriesRegistry {
    /// Creates a registry using the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(store: Arc<dyn SampleStore>, config: RegistryConfig) -> Result<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Creates a registry reading "now" from `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn with_clock(
        store: Arc<dyn SampleStore>,
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let writer = WriteBehind::spawn(
            Arc::clone(&store),
            config.write_queue_capacity,
            config.write_batch_size,
        );
        Ok(Self {
            store,
            writer,
            clock,
            config,
        })
    }

    /// Creates a stream with one series per definition.
    ///
    /// The returned [`StreamSeries`] is empty and ready for inserts. The
    /// [`Backfill`] resolves with the persisted history of every series that
    /// has persistence enabled; series whose load fails or times out are left
    /// out of it.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Identifier of the stream, the partition key in the store
    /// * `definitions` - `(series name, config)` pairs; a repeated name keeps
    ///   the last config
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an empty stream id or series name, an empty
    /// definition set, or any invalid series config.
    pub fn create<I, N>(&self, stream_id: &str, definitions: I) -> Result<(StreamSeries, Backfill)>
    where
        I: IntoIterator<Item = (N, SeriesConfig)>,
        N: Into<String>,
    {
        if stream_id.is_empty() {
            return Err(ConfigError::EmptyStreamId.into());
        }

        let definitions: BTreeMap<String, SeriesConfig> = definitions
            .into_iter()
            .map(|(name, config)| (name.into(), config))
            .collect();
        if definitions.is_empty() {
            return Err(ConfigError::NoSeries {
                stream_id: stream_id.to_string(),
            }
            .into());
        }

        let now_ms = self.clock.now_ms();
        let mut entries = Vec::with_capacity(definitions.len());
        let mut plans = Vec::new();

        for (name, config) in definitions {
            if name.is_empty() {
                return Err(ConfigError::EmptySeriesName.into());
            }
            let series = TimeSeries::new(&config)?;
            let janitor = config
                .persistence
                .enabled
                .then(|| RetentionJanitor::new(stream_id, &name, &config.persistence, now_ms));

            if let Some(window_ms) = config.backfill_window_ms() {
                plans.push(BackfillPlan {
                    series_name: name.clone(),
                    empty_long: series.empty_long(),
                    window_ms,
                });
            }

            entries.push(SeriesEntry {
                name,
                config,
                series,
                janitor,
            });
        }

        tracing::debug!(
            stream_id,
            series = entries.len(),
            backfilled = plans.len(),
            "created stream",
        );

        let ready = Backfill::spawn(
            Arc::clone(&self.store),
            stream_id.to_string(),
            plans,
            self.config.backfill_timeout,
            now_ms,
        );
        let stream = StreamSeries {
            stream_id: stream_id.to_string(),
            entries,
            writer: self.writer.clone(),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        };

        Ok((stream, ready))
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<dyn SampleStore> {
        &self.store
    }

    /// Registry settings.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Write-behind counters across every stream of this registry.
    pub fn write_stats(&self) -> WriteBehindStats {
        self.writer.stats()
    }

    /// Waits until every write queued so far has been committed or failed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`](crate::error::StorageError::Unavailable)
    /// if the writer has been shut down.
    pub async fn flush(&self) -> Result<()> {
        self.writer.flush().await
    }

    /// Commits pending writes and stops the background writer. Streams
    /// created from this registry keep working in memory; their writes are
    /// dropped and counted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TaskFailed`](crate::error::StorageError::TaskFailed)
    /// if the writer task panicked.
    pub async fn shutdown(&self) -> Result<()> {
        self.writer.shutdown().await
    }
}

#[derive(Debug)]
struct SeriesEntry {
    name: String,
    config: SeriesConfig,
    series: TimeSeries,
    /// Present iff persistence is enabled.
    janitor: Option<RetentionJanitor>,
}

/// The named series of one stream.
///
/// Owned by the single producer that feeds the stream; `insert` and `record`
/// take `&mut self`. Use [`snapshot`](Self::snapshot) for a stable copy.
#[derive(Debug)]
pub struct StreamSeries {
    stream_id: String,
    entries: Vec<SeriesEntry>,
    writer: WriteBehind,
    store: Arc<dyn SampleStore>,
    clock: Arc<dyn Clock>,
}

impl StreamSeries {
    /// The stream identifier.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Series names, sorted.
    pub fn series_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Resolves a series name to a handle.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnknownSeries`] if no such series was defined.
    pub fn handle(&self, series_name: &str) -> Result<SeriesHandle> {
        self.position(series_name)
            .map(|index| SeriesHandle { index })
            .ok_or_else(|| self.unknown(series_name))
    }

    /// Records a sample for the series behind `handle`.
    ///
    /// Never waits on storage. Persistence and retention work is queued.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidHandle`] if the handle was issued by a
    /// different stream with more series.
    #[inline]
    pub fn record(&mut self, handle: SeriesHandle, sample: Sample) -> Result<TierOutcomes> {
        let Some(entry) = self.entries.get_mut(handle.index) else {
            return Err(StreamError::InvalidHandle {
                stream_id: self.stream_id.clone(),
                index: handle.index,
            }
            .into());
        };

        let outcomes = entry.series.insert(sample);
        if let Some(janitor) = &entry.janitor {
            if outcomes.long.advanced() {
                self.writer.enqueue(&self.stream_id, &entry.name, sample);
            }
            janitor.maybe_trigger(self.clock.now_ms(), &self.writer);
        }
        Ok(outcomes)
    }

    /// Records one sample for each `(handle, value)` pair at a shared
    /// timestamp, as delivered by a multi-field telemetry message.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidHandle`] on the first foreign handle;
    /// earlier entries stay recorded.
    pub fn record_batch(&mut self, entries: &[(SeriesHandle, f64)], timestamp: i64) -> Result<()> {
        for &(handle, value) in entries {
            self.record(handle, Sample::new(timestamp, value))?;
        }
        Ok(())
    }

    /// Records a sample by series name.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnknownSeries`] if no such series was defined.
    pub fn insert(&mut self, series_name: &str, sample: Sample) -> Result<TierOutcomes> {
        let handle = self.handle(series_name)?;
        self.record(handle, sample)
    }

    /// The current state of a series.
    pub fn get(&self, series_name: &str) -> Option<&TimeSeries> {
        self.position(series_name).map(|i| &self.entries[i].series)
    }

    /// The current state of the series behind `handle`.
    pub fn series(&self, handle: SeriesHandle) -> Option<&TimeSeries> {
        self.entries.get(handle.index).map(|e| &e.series)
    }

    /// Configuration of a series.
    pub fn config(&self, series_name: &str) -> Option<&SeriesConfig> {
        self.position(series_name).map(|i| &self.entries[i].config)
    }

    /// Retention janitor of a persisted series.
    pub fn janitor(&self, series_name: &str) -> Option<&RetentionJanitor> {
        self.position(series_name)
            .and_then(|i| self.entries[i].janitor.as_ref())
    }

    /// Clones every series.
    pub fn snapshot(&self) -> BTreeMap<String, TimeSeries> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.series.clone()))
            .collect()
    }

    /// Installs backfilled long tiers.
    ///
    /// Live long-tier samples newer than a series' history are replayed on
    /// top of it. Series absent from `history` are untouched. Returns the
    /// number of series updated.
    pub fn apply_backfill(&mut self, history: StreamHistory) -> usize {
        let mut applied = 0;
        for (name, long) in history.into_parts() {
            if let Some(index) = self.position(&name) {
                self.entries[index].series.merge_long_history(long);
                applied += 1;
            }
        }
        applied
    }

    /// Prunes persisted rows older than each series' `max_retention` right
    /// away and returns how many rows were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`](crate::error::StorageError) from the first
    /// failing series.
    pub async fn cleanup(&self) -> Result<usize> {
        let now_ms = self.clock.now_ms();
        let mut removed = 0;
        for janitor in self.entries.iter().filter_map(|e| e.janitor.as_ref()) {
            removed += janitor.run_once(self.store.as_ref(), now_ms).await?;
        }
        Ok(removed)
    }

    /// Write-behind counters of the registry this stream belongs to.
    pub fn write_stats(&self) -> WriteBehindStats {
        self.writer.stats()
    }

    /// Waits until every write queued so far has been committed or failed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`](crate::error::StorageError::Unavailable)
    /// if the writer has been shut down.
    pub async fn flush(&self) -> Result<()> {
        self.writer.flush().await
    }

    /// Tears the stream down.
    ///
    /// Pending writes of persisted series are flushed first. With `purge`,
    /// every stored row of the stream is then deleted, including rows left by
    /// earlier runs when no series is persisted now. Returns the number of
    /// rows purged. A memory-only stream closed without `purge` never touches
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`](crate::error::StorageError) if the flush or
    /// the purge fails.
    pub async fn close(self, purge: bool) -> Result<usize> {
        let persisted = self.entries.iter().any(|e| e.janitor.is_some());
        if persisted {
            self.writer.flush().await?;
        }
        if !purge {
            return Ok(0);
        }

        let purged = self.store.clear_stream(&self.stream_id).await?;
        tracing::debug!(stream_id = %self.stream_id, purged, "purged stream");
        Ok(purged)
    }

    fn position(&self, series_name: &str) -> Option<usize> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(series_name))
            .ok()
    }

    fn unknown(&self, series_name: &str) -> crate::error::OstinatoError {
        StreamError::UnknownSeries {
            stream_id: self.stream_id.clone(),
            series_name: series_name.to_string(),
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::OstinatoError;
    use crate::schema::{PersistenceConfig, TierConfig};
    use crate::store::MemoryStore;

    fn config() -> SeriesConfig {
        SeriesConfig {
            short: TierConfig {
                interval: Duration::from_millis(100),
                retention: Duration::from_millis(1_000),
            },
            long: TierConfig {
                interval: Duration::from_millis(1_000),
                retention: Duration::from_millis(5_000),
            },
            persistence: PersistenceConfig {
                cleanup_interval: Duration::from_millis(60_000),
                ..PersistenceConfig::default()
            },
        }
    }

    fn registry(store: Arc<MemoryStore>, now_ms: i64) -> StreamSeriesRegistry {
        StreamSeriesRegistry::with_clock(
            store,
            RegistryConfig::default(),
            Arc::new(ManualClock::new(now_ms)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_validates_definitions() {
        let registry = registry(Arc::new(MemoryStore::new()), 0);

        assert!(matches!(
            registry.create("", [("a", config())]),
            Err(OstinatoError::Config(ConfigError::EmptyStreamId))
        ));
        assert!(matches!(
            registry.create("s1", Vec::<(String, SeriesConfig)>::new()),
            Err(OstinatoError::Config(ConfigError::NoSeries { .. }))
        ));
        assert!(matches!(
            registry.create("s1", [("", config())]),
            Err(OstinatoError::Config(ConfigError::EmptySeriesName))
        ));

        let mut invalid = config();
        invalid.long.interval = Duration::ZERO;
        assert!(registry.create("s1", [("a", invalid)]).is_err());
    }

    #[tokio::test]
    async fn test_handles_and_names() {
        let registry = registry(Arc::new(MemoryStore::new()), 0);
        let (mut stream, _ready) = registry
            .create("s1", [("b", config()), ("a", config())])
            .unwrap();

        assert_eq!(stream.stream_id(), "s1");
        assert_eq!(stream.series_names().collect::<Vec<_>>(), vec!["a", "b"]);

        let b = stream.handle("b").unwrap();
        stream.record(b, Sample::new(1_000, 2.0)).unwrap();
        assert_eq!(stream.series(b).and_then(TimeSeries::current), Some(Sample::new(1_000, 2.0)));
        assert_eq!(stream.get("a").and_then(TimeSeries::current), None);

        assert!(matches!(
            stream.handle("missing"),
            Err(OstinatoError::Stream(StreamError::UnknownSeries { .. }))
        ));
        assert!(matches!(
            stream.record(SeriesHandle { index: 9 }, Sample::new(0, 0.0)),
            Err(OstinatoError::Stream(StreamError::InvalidHandle { index: 9, .. }))
        ));
    }

    #[tokio::test]
    async fn test_record_batch() {
        let registry = registry(Arc::new(MemoryStore::new()), 0);
        let (mut stream, _ready) = registry
            .create("s1", [("speed", config()), ("temp", config())])
            .unwrap();
        let speed = stream.handle("speed").unwrap();
        let temp = stream.handle("temp").unwrap();

        stream.record_batch(&[(speed, 1.5), (temp, 80.0)], 2_000).unwrap();

        assert_eq!(stream.get("speed").and_then(TimeSeries::current), Some(Sample::new(2_000, 1.5)));
        assert_eq!(stream.get("temp").and_then(TimeSeries::current), Some(Sample::new(2_000, 80.0)));
    }

    #[tokio::test]
    async fn test_long_advances_are_persisted() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone(), 0);
        let (mut stream, _ready) = registry.create("s1", [("temp", config())]).unwrap();

        for ts in [0, 500, 1_000, 1_200, 2_500] {
            stream.insert("temp", Sample::new(ts, ts as f64)).unwrap();
        }
        stream.flush().await.unwrap();

        let rows = store.query_range("s1", "temp", None, None).await.unwrap();
        let timestamps: Vec<i64> = rows.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![0, 1_000, 2_500]);
        assert_eq!(stream.write_stats().written, 3);
    }

    #[tokio::test]
    async fn test_close_with_purge() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone(), 0);
        let (mut stream, _ready) = registry.create("s1", [("temp", config())]).unwrap();
        stream.insert("temp", Sample::new(0, 1.0)).unwrap();
        stream.insert("temp", Sample::new(1_000, 2.0)).unwrap();

        let purged = stream.close(true).await.unwrap();

        assert_eq!(purged, 2);
        assert!(store.list_streams().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_without_purge_keeps_rows() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone(), 0);
        let (mut stream, _ready) = registry.create("s1", [("temp", config())]).unwrap();
        stream.insert("temp", Sample::new(0, 1.0)).unwrap();

        assert_eq!(stream.close(false).await.unwrap(), 0);
        assert_eq!(store.row_count().unwrap(), 1);
    }
}
