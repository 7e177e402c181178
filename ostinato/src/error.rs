//! Error types for the ostinato telemetry buffer.

use std::time::Duration;

use thiserror::Error;

/// The main error type for all ostinato operations.
///
/// Storage failures raised on the write-behind path never reach callers as
/// this type; they are logged by the background writer. Everything a caller
/// invokes explicitly (queries, clears, exports, stats) surfaces them here.
#[derive(Error, Debug)]
pub enum OstinatoError {
    /// Invalid series or registry configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error from the persisted tier.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Error while loading history for a freshly created stream.
    #[error("backfill error: {0}")]
    Backfill(#[from] BackfillError),

    /// Error addressing a stream's series.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Error during export or import.
    #[error("export error: {0}")]
    Export(#[from] ExportError),
}

/// Errors raised while validating configuration.
///
/// These are reported eagerly at construction, never at first insert.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A tier's sample interval is zero.
    #[error("{tier} tier: sample interval must be positive")]
    NonPositiveInterval {
        /// Which tier ("short" or "long").
        tier: &'static str,
    },

    /// A tier's retention window is zero.
    #[error("{tier} tier: retention must be positive")]
    NonPositiveRetention {
        /// Which tier ("short" or "long").
        tier: &'static str,
    },

    /// A tier's retention window cannot hold a single bucket.
    #[error("{tier} tier: retention {retention:?} is smaller than one interval {interval:?}")]
    WindowSmallerThanInterval {
        /// Which tier ("short" or "long").
        tier: &'static str,
        /// The configured retention.
        retention: Duration,
        /// The configured sample interval.
        interval: Duration,
    },

    /// Tier durations would result in too many slots.
    #[error("{tier} tier would have {slot_count} slots (max {max_slots}): retention {retention:?} / interval {interval:?}")]
    TooManySlots {
        /// Which tier ("short" or "long").
        tier: &'static str,
        /// The computed slot count.
        slot_count: u128,
        /// The maximum allowed slots.
        max_slots: u128,
        /// The retention duration.
        retention: Duration,
        /// The sample interval.
        interval: Duration,
    },

    /// Persisted retention horizon is zero.
    #[error("max retention must be positive")]
    NonPositiveMaxRetention,

    /// Janitor cleanup interval is zero.
    #[error("cleanup interval must be positive")]
    NonPositiveCleanupInterval,

    /// Stream identifiers must be non-empty.
    #[error("stream id must not be empty")]
    EmptyStreamId,

    /// Series names must be non-empty.
    #[error("series name must not be empty")]
    EmptySeriesName,

    /// A stream needs at least one series definition.
    #[error("stream '{stream_id}' has no series definitions")]
    NoSeries {
        /// The stream being created.
        stream_id: String,
    },

    /// A registry option is out of range.
    #[error("invalid registry option {option}: {reason}")]
    InvalidRegistryOption {
        /// The option name.
        option: &'static str,
        /// Why it is invalid.
        reason: String,
    },
}

/// Errors raised by a [`SampleStore`](crate::store::SampleStore) backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The SQLite backend reported a failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database file could not be opened.
    #[error("failed to open store at '{path}': {source}")]
    Open {
        /// The database path.
        path: String,
        /// The underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },

    /// A thread panicked while holding the connection lock.
    #[error("store connection lock poisoned")]
    LockPoisoned,

    /// The blocking I/O task was cancelled or panicked.
    #[error("storage task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),

    /// The store refused a write because its row quota is exhausted.
    #[error("storage quota exceeded: {rows} rows stored, limit {limit}")]
    QuotaExceeded {
        /// Rows currently stored.
        rows: usize,
        /// The configured row limit.
        limit: usize,
    },

    /// The backend cannot be reached.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Description of the outage.
        reason: String,
    },
}

/// Errors raised while loading history at stream creation.
///
/// These never fail stream creation; the affected series starts empty.
#[derive(Error, Debug)]
pub enum BackfillError {
    /// The history query failed.
    #[error("history query for {stream_id}/{series_name} failed: {source}")]
    Query {
        /// The stream being backfilled.
        stream_id: String,
        /// The series being backfilled.
        series_name: String,
        /// The underlying error.
        #[source]
        source: Box<OstinatoError>,
    },

    /// The history query did not finish in time.
    #[error("history query for {stream_id}/{series_name} timed out after {after:?}")]
    TimedOut {
        /// The stream being backfilled.
        stream_id: String,
        /// The series being backfilled.
        series_name: String,
        /// The timeout that elapsed.
        after: Duration,
    },
}

/// Errors raised when addressing the series of a stream.
#[derive(Error, Debug)]
pub enum StreamError {
    /// No series with that name was defined for the stream.
    #[error("stream '{stream_id}' has no series named '{series_name}'")]
    UnknownSeries {
        /// The stream.
        stream_id: String,
        /// The requested series.
        series_name: String,
    },

    /// A [`SeriesHandle`](crate::registry::SeriesHandle) was used with a
    /// stream that did not issue it.
    #[error("stream '{stream_id}' has no series at handle index {index}")]
    InvalidHandle {
        /// The stream.
        stream_id: String,
        /// The handle's index.
        index: usize,
    },
}

/// Errors raised by export and import helpers.
#[derive(Error, Debug)]
pub enum ExportError {
    /// Serializing or parsing JSON failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// The import document is structurally invalid.
    #[error("invalid import document: {reason}")]
    InvalidDocument {
        /// What was missing or malformed.
        reason: String,
    },

    /// A data point in the import document is malformed.
    #[error("invalid data point at index {index}: {reason}")]
    InvalidPoint {
        /// Position of the point in the document.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },
}

/// Type alias for `Result<T, OstinatoError>`.
pub type Result<T> = std::result::Result<T, OstinatoError>;
