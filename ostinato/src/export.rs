//! Export, import and storage reporting over a [`SampleStore`].
//!
//! These are operator-facing projections of the persisted tier: CSV and JSON
//! dumps of a series' range query, a validating JSON importer that accepts
//! what the exporter produces, and per-stream storage usage.
//!
//! # Formats
//!
//! CSV has a `timestamp,value,datetime` header and one row per sample, where
//! `datetime` is the ISO-8601 UTC rendering of the millisecond timestamp.
//!
//! JSON is an [`ExportDocument`]:
//!
//! ```text
//! {
//!   "stream_id": "extruder-1",
//!   "series_name": "temperature",
//!   "export_timestamp": 1700000000000,
//!   "start_time": null,
//!   "end_time": null,
//!   "data_points": [
//!     { "timestamp": 1699999999000, "value": 181.5, "datetime": "2023-11-14T22:13:19.000Z" }
//!   ]
//! }
//! ```

use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::ring::Sample;
use crate::store::{SampleStore, StoreStats};

/// Estimated on-disk cost of one persisted row, used by storage reports.
pub const ESTIMATED_BYTES_PER_ROW: u64 = 40;

/// ISO-8601 UTC rendering of a millisecond timestamp, e.g.
/// `2023-11-14T22:13:20.000Z`. `None` if out of range.
pub fn iso_datetime(timestamp_ms: i64) -> Option<String> {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// One exported sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportPoint {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// The reading. Non-finite values are written as `null` and read back
    /// as NaN.
    #[serde(deserialize_with = "nullable_f64")]
    pub value: f64,
    /// ISO-8601 rendering of `timestamp`.
    pub datetime: String,
}

fn nullable_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// JSON export of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    /// The stream.
    pub stream_id: String,
    /// The series.
    pub series_name: String,
    /// When the export was taken, in milliseconds since the Unix epoch.
    pub export_timestamp: i64,
    /// Lower bound of the range query, if any.
    pub start_time: Option<i64>,
    /// Upper bound of the range query, if any.
    pub end_time: Option<i64>,
    /// Exported samples, ascending.
    pub data_points: Vec<ExportPoint>,
}

impl ExportDocument {
    /// Builds a document from already-queried samples.
    pub fn new(
        stream_id: &str,
        series_name: &str,
        range: (Option<i64>, Option<i64>),
        samples: &[Sample],
        export_timestamp: i64,
    ) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            series_name: series_name.to_string(),
            export_timestamp,
            start_time: range.0,
            end_time: range.1,
            data_points: samples
                .iter()
                .map(|s| ExportPoint {
                    timestamp: s.timestamp,
                    value: s.value,
                    datetime: iso_datetime(s.timestamp).unwrap_or_default(),
                })
                .collect(),
        }
    }
}

/// Renders samples as CSV with a `timestamp,value,datetime` header.
pub fn to_csv(samples: &[Sample]) -> String {
    let mut csv = String::from("timestamp,value,datetime\n");
    for sample in samples {
        let datetime = iso_datetime(sample.timestamp).unwrap_or_default();
        // writing to a String cannot fail
        let _ = writeln!(csv, "{},{},{}", sample.timestamp, sample.value, datetime);
    }
    csv
}

/// Exports `[start, end]` of a series as CSV.
///
/// # Errors
///
/// Returns [`StorageError`](crate::error::StorageError) if the query fails.
pub async fn export_csv(
    store: &dyn SampleStore,
    stream_id: &str,
    series_name: &str,
    start: Option<i64>,
    end: Option<i64>,
) -> Result<String> {
    let samples = store.query_range(stream_id, series_name, start, end).await?;
    Ok(to_csv(&samples))
}

/// Exports `[start, end]` of a series as a pretty-printed [`ExportDocument`].
///
/// # Errors
///
/// Returns [`StorageError`](crate::error::StorageError) if the query fails,
/// or [`ExportError::Json`] if serialization fails.
pub async fn export_json(
    store: &dyn SampleStore,
    stream_id: &str,
    series_name: &str,
    start: Option<i64>,
    end: Option<i64>,
    now_ms: i64,
) -> Result<String> {
    let samples = store.query_range(stream_id, series_name, start, end).await?;
    let document = ExportDocument::new(stream_id, series_name, (start, end), &samples, now_ms);
    serde_json::to_string_pretty(&document).map_err(|e| ExportError::Json(e).into())
}

/// A validated import document.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedSeries {
    /// Target stream.
    pub stream_id: String,
    /// Target series.
    pub series_name: String,
    /// Samples in document order.
    pub samples: Vec<Sample>,
}

/// Parses and validates an import document.
///
/// The document needs non-empty `stream_id` and `series_name` strings and a
/// `data_points` array. Every point needs an integer `timestamp` and a numeric
/// or `null` `value`; `null` imports as NaN. Other fields such as `datetime`
/// are ignored.
///
/// # Errors
///
/// Returns [`ExportError::Json`] for malformed JSON,
/// [`ExportError::InvalidDocument`] for missing top-level fields and
/// [`ExportError::InvalidPoint`] for the first bad data point.
pub fn parse_import(json: &str) -> Result<ImportedSeries> {
    let document: serde_json::Value = serde_json::from_str(json).map_err(ExportError::Json)?;

    let stream_id = required_str(&document, "stream_id")?;
    let series_name = required_str(&document, "series_name")?;
    let points = document
        .get("data_points")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| invalid_document("data_points must be an array"))?;

    let samples = points
        .iter()
        .enumerate()
        .map(|(index, point)| parse_point(index, point))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ImportedSeries {
        stream_id,
        series_name,
        samples,
    })
}

fn required_str(document: &serde_json::Value, field: &str) -> Result<String> {
    match document.get(field).and_then(serde_json::Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(invalid_document(&format!("{field} must be a non-empty string")).into()),
    }
}

fn invalid_document(reason: &str) -> ExportError {
    ExportError::InvalidDocument {
        reason: reason.to_string(),
    }
}

fn parse_point(index: usize, point: &serde_json::Value) -> std::result::Result<Sample, ExportError> {
    let invalid = |reason: &str| ExportError::InvalidPoint {
        index,
        reason: reason.to_string(),
    };

    let timestamp = point
        .get("timestamp")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| invalid("timestamp must be an integer"))?;
    let value = match point.get("value") {
        Some(serde_json::Value::Null) => f64::NAN,
        Some(value) => value
            .as_f64()
            .ok_or_else(|| invalid("value must be a number or null"))?,
        None => return Err(invalid("value is missing")),
    };

    Ok(Sample::new(timestamp, value))
}

/// Writes an imported series to the store in one transaction and returns the
/// number of samples written.
///
/// # Errors
///
/// Returns [`StorageError`](crate::error::StorageError) if the write fails.
pub async fn import(store: &dyn SampleStore, imported: &ImportedSeries) -> Result<usize> {
    store
        .put_many(&imported.stream_id, &imported.series_name, &imported.samples)
        .await?;
    tracing::info!(
        stream_id = %imported.stream_id,
        series = %imported.series_name,
        samples = imported.samples.len(),
        "imported series",
    );
    Ok(imported.samples.len())
}

/// Storage usage of one persisted series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesStorage {
    /// The series.
    pub series_name: String,
    /// Row count and timestamp bounds.
    #[serde(flatten)]
    pub stats: StoreStats,
    /// `count * ESTIMATED_BYTES_PER_ROW`.
    pub estimated_size_bytes: u64,
}

/// Storage usage of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStorage {
    /// The stream.
    pub stream_id: String,
    /// Per-series usage, sorted by name.
    pub series: Vec<SeriesStorage>,
    /// Rows across every series.
    pub total_rows: usize,
    /// Estimated bytes across every series.
    pub estimated_total_size_bytes: u64,
}

/// Storage usage of every series of one stream.
///
/// # Errors
///
/// Returns [`StorageError`](crate::error::StorageError) if a read fails.
pub async fn storage_report(store: &dyn SampleStore, stream_id: &str) -> Result<StreamStorage> {
    let mut series = Vec::new();
    for series_name in store.list_series(stream_id).await? {
        let stats = store.stats(stream_id, &series_name).await?;
        series.push(SeriesStorage {
            estimated_size_bytes: stats.count as u64 * ESTIMATED_BYTES_PER_ROW,
            series_name,
            stats,
        });
    }

    let total_rows = series.iter().map(|s| s.stats.count).sum();
    let estimated_total_size_bytes = series.iter().map(|s| s.estimated_size_bytes).sum();
    Ok(StreamStorage {
        stream_id: stream_id.to_string(),
        series,
        total_rows,
        estimated_total_size_bytes,
    })
}

/// Storage usage of every stream in the store.
///
/// # Errors
///
/// Returns [`StorageError`](crate::error::StorageError) if a read fails.
pub async fn storage_report_all(store: &dyn SampleStore) -> Result<Vec<StreamStorage>> {
    let mut reports = Vec::new();
    for stream_id in store.list_streams().await? {
        reports.push(storage_report(store, &stream_id).await?);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OstinatoError;
    use crate::store::MemoryStore;

    #[test]
    fn test_iso_datetime() {
        assert_eq!(iso_datetime(0).as_deref(), Some("1970-01-01T00:00:00.000Z"));
        assert_eq!(
            iso_datetime(1_700_000_000_123).as_deref(),
            Some("2023-11-14T22:13:20.123Z")
        );
        assert_eq!(iso_datetime(i64::MAX), None);
    }

    #[test]
    fn test_to_csv() {
        let csv = to_csv(&[Sample::new(0, 1.5), Sample::new(1_000, -2.0)]);
        assert_eq!(
            csv,
            "timestamp,value,datetime\n\
             0,1.5,1970-01-01T00:00:00.000Z\n\
             1000,-2,1970-01-01T00:00:01.000Z\n"
        );
        assert_eq!(to_csv(&[]), "timestamp,value,datetime\n");
    }

    #[tokio::test]
    async fn test_export_json_round_trips_through_import() {
        let store = MemoryStore::new();
        store
            .put_many("s1", "temp", &[Sample::new(1_000, 1.0), Sample::new(2_000, 2.5)])
            .await
            .unwrap();

        let json = export_json(&store, "s1", "temp", None, None, 9_000).await.unwrap();
        let document: ExportDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(document.export_timestamp, 9_000);
        assert_eq!(document.data_points[1].datetime, "1970-01-01T00:00:02.000Z");

        let imported = parse_import(&json).unwrap();
        assert_eq!(imported.stream_id, "s1");
        assert_eq!(imported.samples, vec![Sample::new(1_000, 1.0), Sample::new(2_000, 2.5)]);

        let target = MemoryStore::new();
        assert_eq!(import(&target, &imported).await.unwrap(), 2);
        assert_eq!(target.stats("s1", "temp").await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_export_csv_respects_range() {
        let store = MemoryStore::new();
        store
            .put_many(
                "s1",
                "temp",
                &[Sample::new(1_000, 1.0), Sample::new(2_000, 2.0), Sample::new(3_000, 3.0)],
            )
            .await
            .unwrap();

        let csv = export_csv(&store, "s1", "temp", Some(2_000), Some(2_000)).await.unwrap();
        assert_eq!(csv.lines().count(), 2);
        assert!(csv.contains("2000,2,"));
    }

    #[test]
    fn test_parse_import_rejects_bad_documents() {
        assert!(matches!(
            parse_import("not json"),
            Err(OstinatoError::Export(ExportError::Json(_)))
        ));
        assert!(matches!(
            parse_import(r#"{"series_name": "x", "data_points": []}"#),
            Err(OstinatoError::Export(ExportError::InvalidDocument { .. }))
        ));
        assert!(matches!(
            parse_import(r#"{"stream_id": "", "series_name": "x", "data_points": []}"#),
            Err(OstinatoError::Export(ExportError::InvalidDocument { .. }))
        ));
        assert!(matches!(
            parse_import(r#"{"stream_id": "s", "series_name": "x", "data_points": {}}"#),
            Err(OstinatoError::Export(ExportError::InvalidDocument { .. }))
        ));
        assert!(matches!(
            parse_import(
                r#"{"stream_id": "s", "series_name": "x",
                    "data_points": [{"timestamp": 1, "value": 1}, {"timestamp": "2", "value": 2}]}"#
            ),
            Err(OstinatoError::Export(ExportError::InvalidPoint { index: 1, .. }))
        ));
        assert!(matches!(
            parse_import(
                r#"{"stream_id": "s", "series_name": "x", "data_points": [{"timestamp": 1}]}"#
            ),
            Err(OstinatoError::Export(ExportError::InvalidPoint { index: 0, .. }))
        ));
        assert!(matches!(
            parse_import(
                r#"{"stream_id": "s", "series_name": "x",
                    "data_points": [{"timestamp": 1, "value": "1.5"}]}"#
            ),
            Err(OstinatoError::Export(ExportError::InvalidPoint { index: 0, .. }))
        ));
    }

    #[tokio::test]
    async fn test_storage_report() {
        let store = MemoryStore::new();
        store
            .put_many("a", "x", &[Sample::new(1, 1.0), Sample::new(2, 2.0)])
            .await
            .unwrap();
        store.put("a", "y", Sample::new(5, 1.0)).await.unwrap();
        store.put("b", "x", Sample::new(1, 1.0)).await.unwrap();

        let report = storage_report(&store, "a").await.unwrap();
        assert_eq!(report.series.len(), 2);
        assert_eq!(report.series[0].series_name, "x");
        assert_eq!(report.series[0].estimated_size_bytes, 80);
        assert_eq!(report.total_rows, 3);
        assert_eq!(report.estimated_total_size_bytes, 120);

        let all = storage_report_all(&store).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].stream_id, "b");

        let json = serde_json::to_value(&report.series[1]).unwrap();
        assert_eq!(json["count"], 1);
        assert_eq!(json["oldest_timestamp"], 5);
    }
}
