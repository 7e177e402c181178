//! # ostinato
//!
//! Multi-resolution telemetry buffers with write-behind persistence.
//!
//! ostinato keeps the recent history of many named numeric signals per
//! telemetry stream (a machine, a line, a vehicle) in bounded in-memory ring
//! buffers at two resolutions, and mirrors the coarse resolution to a durable
//! store so it survives restarts.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Bounded memory: each tier holds `ceil(retention / interval)` slots
//! - Time-bucketed decimation at insert: one sample per interval bucket
//! - Inserts never wait on storage; persistence is queued and batched
//! - Cold-start backfill runs in the background and degrades to empty state
//! - Interval-gated retention pruning, no background timer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ostinato::{RegistryConfig, Sample, SeriesConfig, SqliteStore, StreamSeriesRegistry};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteStore::open("./telemetry.db")?);
//! let registry = StreamSeriesRegistry::new(store, RegistryConfig::default())?;
//!
//! let (mut stream, ready) = registry.create(
//!     "extruder-1",
//!     [("temperature", SeriesConfig::default())],
//! )?;
//!
//! let temperature = stream.handle("temperature")?;
//! stream.record(temperature, Sample::new(1_700_000_000_000, 181.5))?;
//!
//! stream.apply_backfill(ready.await);
//!
//! let series = stream.series(temperature).ok_or("missing series")?;
//! let (min, max) = series.long().min_max(None);
//! println!("long tier: {} buckets, min {min}, max {max}", series.long().len());
//!
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`StreamSeriesRegistry`] - Shared store, write-behind queue and clock
//! - [`StreamSeries`] - Named series of one stream, owned by its producer
//! - [`TimeSeries`] - `current` plus short and long [`SeriesBuffer`] tiers
//! - [`SampleStore`] - Persisted long tier; [`SqliteStore`] and [`MemoryStore`]
//! - [`Backfill`] - Future delivering persisted history after creation
//!
//! ## Modules
//!
//! - [`registry`] - Stream creation, insert fan-out, teardown
//! - [`timeseries`] - Three-tier series
//! - [`series`] - Bucketed buffer and its read views
//! - [`ring`] - Fixed-capacity circular buffer
//! - [`schema`] - Tier, persistence and registry configuration
//! - [`store`] - Storage trait and in-memory backend
//! - [`sqlite`] - SQLite backend
//! - [`writeback`] - Bounded write-behind queue
//! - [`backfill`] - Cold-start history loading
//! - [`janitor`] - Retention pruning state machine
//! - [`export`] - CSV/JSON export, import, storage reports
//! - [`clock`] - Time source
//! - [`error`] - Error types

pub mod backfill;
pub mod clock;
pub mod error;
pub mod export;
pub mod janitor;
pub mod registry;
pub mod ring;
pub mod schema;
pub mod series;
pub mod sqlite;
pub mod store;
pub mod timeseries;
pub mod writeback;

// Re-export primary API types at crate root for convenience.
pub use backfill::{Backfill, StreamHistory};
pub use error::{OstinatoError, Result};
pub use registry::{SeriesHandle, StreamSeries, StreamSeriesRegistry};
pub use ring::Sample;
pub use schema::{PersistenceConfig, RegistryConfig, SeriesConfig, TierConfig};
pub use series::SeriesBuffer;
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, SampleStore};
pub use timeseries::TimeSeries;
