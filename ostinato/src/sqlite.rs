//! SQLite-backed [`SampleStore`].
//!
//! One table holds every persisted sample:
//!
//! ```text
//! samples(stream_id TEXT, series_name TEXT, timestamp INTEGER, value REAL)
//!   PRIMARY KEY (stream_id, series_name, timestamp)
//!   INDEX samples_by_stream (stream_id)
//!   INDEX samples_by_series (stream_id, series_name)
//! ```
//!
//! # Design
//!
//! - File stores run in WAL mode with `synchronous=NORMAL`
//! - The connection sits behind a mutex; every operation runs on tokio's
//!   blocking pool so async callers never stall the runtime on disk I/O
//! - SQLite stores NaN as NULL; NULL reads back as NaN

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Result, StorageError};
use crate::ring::Sample;
use crate::store::{SampleStore, StoreStats};

/// DDL for the samples table and its secondary indexes.
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS samples (
    stream_id   TEXT    NOT NULL,
    series_name TEXT    NOT NULL,
    timestamp   INTEGER NOT NULL,
    value       REAL,
    PRIMARY KEY (stream_id, series_name, timestamp)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS samples_by_stream ON samples (stream_id);
CREATE INDEX IF NOT EXISTS samples_by_series ON samples (stream_id, series_name);
";

/// Durable [`SampleStore`] on a SQLite database.
///
/// # Examples
///
/// ```rust,no_run
/// use ostinato::ring::Sample;
/// use ostinato::sqlite::SqliteStore;
/// use ostinato::store::SampleStore;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = SqliteStore::open("./telemetry.db")?;
/// store.put("press-1", "temperature", Sample::new(1_000, 180.5)).await?;
/// println!("{:?}", store.stats("press-1", "temperature").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Opens or creates a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be opened, or
    /// [`StorageError::Sqlite`] if the schema cannot be created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|source| StorageError::Open {
            path: path.display().to_string(),
            source,
        })?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(StorageError::from)?;
        conn.execute_batch(SCHEMA).map_err(StorageError::from)?;

        tracing::debug!(path = %path.display(), "opened sqlite sample store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Sqlite`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        conn.execute_batch(SCHEMA).map_err(StorageError::from)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file, or `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Total rows across every stream.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails.
    pub async fn row_count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))?;
            Ok(to_usize(count))
        })
        .await
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StorageError::LockPoisoned)?;
            f(&mut conn).map_err(StorageError::from)
        })
        .await
        .map_err(StorageError::from)?;
        Ok(result?)
    }
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn to_usize(count: i64) -> usize {
    usize::try_from(count).unwrap_or(0)
}

fn read_sample(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sample> {
    let timestamp: i64 = row.get(0)?;
    let value: Option<f64> = row.get(1)?;
    Ok(Sample::new(timestamp, value.unwrap_or(f64::NAN)))
}

#[async_trait]
impl SampleStore for SqliteStore {
    async fn put_many(
        &self,
        stream_id: &str,
        series_name: &str,
        samples: &[Sample],
    ) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let stream_id = stream_id.to_string();
        let series_name = series_name.to_string();
        let samples = samples.to_vec();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO samples (stream_id, series_name, timestamp, value) \
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for sample in &samples {
                    stmt.execute(params![stream_id, series_name, sample.timestamp, sample.value])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn query_range(
        &self,
        stream_id: &str,
        series_name: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Sample>> {
        let stream_id = stream_id.to_string();
        let series_name = series_name.to_string();
        let start = start.unwrap_or(i64::MIN);
        let end = end.unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp, value FROM samples \
                 WHERE stream_id = ?1 AND series_name = ?2 \
                   AND timestamp >= ?3 AND timestamp <= ?4 \
                 ORDER BY timestamp",
            )?;
            let rows = stmt.query_map(params![stream_id, series_name, start, end], read_sample)?;
            rows.collect()
        })
        .await
    }

    async fn query_latest(
        &self,
        stream_id: &str,
        series_name: &str,
        count: usize,
    ) -> Result<Vec<Sample>> {
        let stream_id = stream_id.to_string();
        let series_name = series_name.to_string();
        let limit = i64::try_from(count).unwrap_or(i64::MAX);

        let mut latest = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT timestamp, value FROM samples \
                     WHERE stream_id = ?1 AND series_name = ?2 \
                     ORDER BY timestamp DESC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![stream_id, series_name, limit], read_sample)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        latest.reverse();
        Ok(latest)
    }

    async fn delete_before(
        &self,
        stream_id: &str,
        series_name: &str,
        cutoff: i64,
    ) -> Result<usize> {
        let stream_id = stream_id.to_string();
        let series_name = series_name.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM samples WHERE stream_id = ?1 AND series_name = ?2 AND timestamp < ?3",
                params![stream_id, series_name, cutoff],
            )
        })
        .await
    }

    async fn clear_series(&self, stream_id: &str, series_name: &str) -> Result<usize> {
        let stream_id = stream_id.to_string();
        let series_name = series_name.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM samples WHERE stream_id = ?1 AND series_name = ?2",
                params![stream_id, series_name],
            )
        })
        .await
    }

    async fn clear_stream(&self, stream_id: &str) -> Result<usize> {
        let stream_id = stream_id.to_string();

        self.with_conn(move |conn| {
            conn.execute("DELETE FROM samples WHERE stream_id = ?1", params![stream_id])
        })
        .await
    }

    async fn stats(&self, stream_id: &str, series_name: &str) -> Result<StoreStats> {
        let stream_id = stream_id.to_string();
        let series_name = series_name.to_string();

        self.with_conn(move |conn| {
            let stats = conn
                .query_row(
                    "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM samples \
                     WHERE stream_id = ?1 AND series_name = ?2",
                    params![stream_id, series_name],
                    |row| {
                        Ok(StoreStats {
                            count: to_usize(row.get(0)?),
                            oldest_timestamp: row.get(1)?,
                            newest_timestamp: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(stats.unwrap_or_default())
        })
        .await
    }

    async fn list_streams(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT DISTINCT stream_id FROM samples ORDER BY stream_id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    async fn list_series(&self, stream_id: &str) -> Result<Vec<String>> {
        let stream_id = stream_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT series_name FROM samples WHERE stream_id = ?1 ORDER BY series_name",
            )?;
            let rows = stmt.query_map(params![stream_id], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_put_and_query_in_memory() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.path().is_none());

        store
            .put_many(
                "s1",
                "temp",
                &[Sample::new(3, 3.0), Sample::new(1, 1.0), Sample::new(2, 2.0)],
            )
            .await
            .unwrap();

        let rows = store.query_range("s1", "temp", None, None).await.unwrap();
        let timestamps: Vec<i64> = rows.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);

        let bounded = store
            .query_range("s1", "temp", Some(2), None)
            .await
            .unwrap();
        assert_eq!(bounded.len(), 2);

        let latest = store.query_latest("s1", "temp", 2).await.unwrap();
        assert_eq!(latest, vec![Sample::new(2, 2.0), Sample::new(3, 3.0)]);
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("s1", "temp", Sample::new(1, 1.0)).await.unwrap();
        store.put("s1", "temp", Sample::new(1, 5.0)).await.unwrap();

        let rows = store.query_range("s1", "temp", None, None).await.unwrap();
        assert_eq!(rows, vec![Sample::new(1, 5.0)]);
        assert_eq!(store.row_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nan_reads_back_as_nan() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("s1", "temp", Sample::new(1, f64::NAN)).await.unwrap();

        let rows = store.query_range("s1", "temp", None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].value.is_nan());
    }

    #[tokio::test]
    async fn test_stats_on_empty_series() {
        let store = SqliteStore::open_in_memory().unwrap();
        let stats = store.stats("none", "none").await.unwrap();
        assert_eq!(stats, StoreStats::default());
    }

    #[tokio::test]
    async fn test_delete_clear_and_list() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put_many("a", "x", &[Sample::new(1, 1.0), Sample::new(5, 5.0)])
            .await
            .unwrap();
        store.put("a", "y", Sample::new(1, 1.0)).await.unwrap();
        store.put("b", "x", Sample::new(1, 1.0)).await.unwrap();

        assert_eq!(store.list_streams().await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.list_series("a").await.unwrap(), vec!["x", "y"]);

        assert_eq!(store.delete_before("a", "x", 5).await.unwrap(), 1);
        let stats = store.stats("a", "x").await.unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.oldest_timestamp, Some(5));
        assert_eq!(stats.newest_timestamp, Some(5));

        assert_eq!(store.clear_series("a", "y").await.unwrap(), 1);
        assert_eq!(store.clear_stream("a").await.unwrap(), 1);
        assert_eq!(store.list_streams().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_reopen_file_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("telemetry.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .put_many("s1", "temp", &[Sample::new(1, 1.0), Sample::new(2, 2.0)])
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        let rows = store.query_range("s1", "temp", None, None).await.unwrap();
        assert_eq!(rows, vec![Sample::new(1, 1.0), Sample::new(2, 2.0)]);
    }

    #[test]
    fn test_open_invalid_path_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("nested").join("db.sqlite");

        let err = SqliteStore::open(&path).unwrap_err();
        assert!(err.to_string().contains("failed to open store"));
    }
}
