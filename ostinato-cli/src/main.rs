//! CLI for ostinato telemetry stores.
//!
//! Provides commands for inspecting, exporting, maintaining and exercising
//! SQLite-backed sample stores.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use ostinato::clock::{Clock, ManualClock, SystemClock};
use ostinato::export;
use ostinato::store::MemoryStore;
use ostinato::{
    RegistryConfig, SampleStore, SeriesConfig, SeriesHandle, SqliteStore, StreamSeriesRegistry,
};
use tracing_subscriber::EnvFilter;

/// Inspect and maintain ostinato telemetry stores.
#[derive(Parser)]
#[command(name = "ostinato", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display per-stream and per-series storage usage.
    Info {
        /// Path to the SQLite database.
        db: PathBuf,

        /// Only report this stream.
        #[arg(long)]
        stream: Option<String>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Export persisted samples of one series.
    Query {
        /// Path to the SQLite database.
        db: PathBuf,

        /// Stream identifier.
        stream: String,

        /// Series name.
        series: String,

        /// Only samples newer than this (e.g., "1h", "30m", "7d").
        #[arg(long)]
        range: Option<String>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Print the most recent persisted samples of one series.
    Latest {
        /// Path to the SQLite database.
        db: PathBuf,

        /// Stream identifier.
        stream: String,

        /// Series name.
        series: String,

        /// Number of samples.
        #[arg(long, default_value = "10")]
        count: usize,
    },

    /// Delete persisted samples older than a maximum age.
    Prune {
        /// Path to the SQLite database.
        db: PathBuf,

        /// Maximum age to keep (e.g., "7d").
        #[arg(long, default_value = "7d")]
        max_age: String,

        /// Only prune this stream.
        #[arg(long)]
        stream: Option<String>,
    },

    /// Delete every persisted sample of a stream or one of its series.
    Clear {
        /// Path to the SQLite database.
        db: PathBuf,

        /// Stream identifier.
        stream: String,

        /// Series name; the whole stream if omitted.
        series: Option<String>,
    },

    /// Import a JSON export into the store.
    Import {
        /// Path to the SQLite database.
        db: PathBuf,

        /// Path to a JSON document produced by `query --format json`.
        file: PathBuf,
    },

    /// Feed synthetic telemetry through a stream and report throughput.
    Simulate {
        /// Persist to this SQLite database instead of an in-memory store.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Stream identifier.
        #[arg(long, default_value = "sim")]
        stream: String,

        /// Number of series in the stream.
        #[arg(long, default_value = "30")]
        series: usize,

        /// Messages per second of simulated time.
        #[arg(long, default_value = "50")]
        rate: u32,

        /// Simulated time span ending now (e.g., "10m").
        #[arg(long, default_value = "10m")]
        duration: String,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// Pretty-printed JSON document.
    Json,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { db, stream, json } => cmd_info(&db, stream.as_deref(), json).await,
        Commands::Query {
            db,
            stream,
            series,
            range,
            format,
        } => cmd_query(&db, &stream, &series, range.as_deref(), &format).await,
        Commands::Latest {
            db,
            stream,
            series,
            count,
        } => cmd_latest(&db, &stream, &series, count).await,
        Commands::Prune {
            db,
            max_age,
            stream,
        } => cmd_prune(&db, &max_age, stream.as_deref()).await,
        Commands::Clear { db, stream, series } => cmd_clear(&db, &stream, series.as_deref()).await,
        Commands::Import { db, file } => cmd_import(&db, &file).await,
        Commands::Simulate {
            db,
            stream,
            series,
            rate,
            duration,
        } => cmd_simulate(db.as_deref(), &stream, series, rate, &duration).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Opens an existing database; refuses to create one by accident.
fn open_existing(db: &Path) -> Result<SqliteStore, Box<dyn std::error::Error>> {
    if !db.exists() {
        return Err(format!("No store found at '{}'", db.display()).into());
    }
    tracing::debug!(path = %db.display(), "opening store");
    Ok(SqliteStore::open(db)?)
}

/// Implements `ostinato info <db>`.
async fn cmd_info(
    db: &Path,
    stream: Option<&str>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(db)?;
    let reports = match stream {
        Some(stream_id) => vec![export::storage_report(&store, stream_id).await?],
        None => export::storage_report_all(&store).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    println!("Store: {}", db.display());
    println!("Streams: {}", reports.len());
    println!();

    for report in &reports {
        println!("  Stream \"{}\"", report.stream_id);
        for series in &report.series {
            let span = match (series.stats.oldest_timestamp, series.stats.newest_timestamp) {
                (Some(oldest), Some(newest)) => format!(
                    "{} .. {}",
                    export::iso_datetime(oldest).unwrap_or_else(|| oldest.to_string()),
                    export::iso_datetime(newest).unwrap_or_else(|| newest.to_string()),
                ),
                _ => "empty".to_string(),
            };
            println!(
                "    - {}: {} rows, ~{}, {span}",
                series.series_name,
                series.stats.count,
                format_bytes(series.estimated_size_bytes),
            );
        }
        println!(
            "    Total: {} rows, ~{}",
            report.total_rows,
            format_bytes(report.estimated_total_size_bytes),
        );
        println!();
    }

    let file_size = std::fs::metadata(db)?.len();
    println!("Database file: {} ({file_size} bytes)", format_bytes(file_size));

    Ok(())
}

/// Implements `ostinato query <db> <stream> <series>`.
async fn cmd_query(
    db: &Path,
    stream_id: &str,
    series_name: &str,
    range: Option<&str>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(db)?;
    let now_ms = SystemClock.now_ms();
    let start = range
        .map(|r| parse_duration(r).map(|ms| now_ms.saturating_sub(ms)))
        .transpose()?;

    let output = match format {
        OutputFormat::Csv => {
            export::export_csv(&store, stream_id, series_name, start, None).await?
        }
        OutputFormat::Json => {
            export::export_json(&store, stream_id, series_name, start, None, now_ms).await?
        }
    };
    print!("{output}");
    if matches!(format, OutputFormat::Json) {
        println!();
    }

    Ok(())
}

/// Implements `ostinato latest <db> <stream> <series>`.
async fn cmd_latest(
    db: &Path,
    stream_id: &str,
    series_name: &str,
    count: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(db)?;
    let samples = store.query_latest(stream_id, series_name, count).await?;

    println!("# stream={stream_id}, series={series_name}, points={}", samples.len());
    print!("{}", export::to_csv(&samples));

    Ok(())
}

/// Implements `ostinato prune <db>`.
async fn cmd_prune(
    db: &Path,
    max_age: &str,
    stream: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(db)?;
    let cutoff = SystemClock.now_ms().saturating_sub(parse_duration(max_age)?);

    let streams = match stream {
        Some(stream_id) => vec![stream_id.to_string()],
        None => store.list_streams().await?,
    };

    let mut total = 0;
    for stream_id in &streams {
        for series_name in store.list_series(stream_id).await? {
            let removed = store.delete_before(stream_id, &series_name, cutoff).await?;
            if removed > 0 {
                println!("  {stream_id}/{series_name}: removed {removed} rows");
            }
            total += removed;
        }
    }

    let cutoff_str = export::iso_datetime(cutoff).unwrap_or_else(|| cutoff.to_string());
    println!("Pruned {total} rows older than {cutoff_str}");

    Ok(())
}

/// Implements `ostinato clear <db> <stream> [series]`.
async fn cmd_clear(
    db: &Path,
    stream_id: &str,
    series_name: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(db)?;
    let removed = match series_name {
        Some(series_name) => store.clear_series(stream_id, series_name).await?,
        None => store.clear_stream(stream_id).await?,
    };
    println!("Removed {removed} rows");

    Ok(())
}

/// Implements `ostinato import <db> <file>`.
async fn cmd_import(db: &Path, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let document = std::fs::read_to_string(file)?;
    let imported = export::parse_import(&document)?;

    let store = SqliteStore::open(db)?;
    let written = export::import(&store, &imported).await?;
    println!(
        "Imported {written} samples into {}/{}",
        imported.stream_id, imported.series_name
    );

    Ok(())
}

/// Implements `ostinato simulate`.
#[allow(clippy::cast_precision_loss)] // Simulated signals and stats are fine with f64 precision
async fn cmd_simulate(
    db: Option<&Path>,
    stream_id: &str,
    series_count: usize,
    rate_hz: u32,
    duration: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if rate_hz == 0 || series_count == 0 {
        return Err("rate and series must be positive".into());
    }
    let duration_ms = parse_duration(duration)?;
    let step_ms = i64::from((1000 / rate_hz).max(1));
    let messages = duration_ms / step_ms;

    let store: Arc<dyn SampleStore> = match db {
        Some(path) => Arc::new(SqliteStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };
    let start_ms = SystemClock.now_ms().saturating_sub(duration_ms);
    let clock = Arc::new(ManualClock::new(start_ms));
    let registry = StreamSeriesRegistry::with_clock(store, RegistryConfig::default(), clock.clone())?;

    println!("ostinato stream simulation");
    println!("  Stream: {stream_id}");
    println!("  Series: {series_count}");
    println!("  Rate: {rate_hz} Hz ({messages} messages over {duration})");
    println!();

    let names: Vec<String> = (0..series_count).map(|i| format!("signal_{i}")).collect();
    let (mut stream, ready) = registry.create(
        stream_id,
        names.iter().map(|name| (name.clone(), SeriesConfig::default())),
    )?;

    let history = ready.await;
    let restored = history
        .series_names()
        .filter_map(|name| history.long(name))
        .filter(|long| !long.is_empty())
        .count();
    for failure in history.failures() {
        println!("  Backfill degraded: {failure}");
    }
    stream.apply_backfill(history);
    println!("Restored history for {restored} series");

    let handles: Vec<SeriesHandle> = names
        .iter()
        .map(|name| stream.handle(name))
        .collect::<Result<_, _>>()?;
    let mut entries: Vec<(SeriesHandle, f64)> = handles.iter().map(|h| (*h, 0.0)).collect();

    let start = Instant::now();
    for m in 0..messages {
        let ts = start_ms + m * step_ms;
        clock.set(ts);
        let phase = ts as f64 / 10_000.0;
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.1 = (phase + i as f64).sin() * 100.0;
        }
        stream.record_batch(&entries, ts)?;
    }
    let elapsed = start.elapsed();

    registry.flush().await?;
    let flushed = start.elapsed();

    let total_inserts = messages as f64 * series_count as f64;
    let ns_per_insert = elapsed.as_nanos() as f64 / total_inserts.max(1.0);
    let inserts_per_sec = total_inserts / elapsed.as_secs_f64().max(f64::EPSILON);
    let stats = registry.write_stats();

    println!();
    println!("Results:");
    println!("  Total inserts: {total_inserts:.0}");
    println!("  Insert time: {elapsed:.3?}");
    println!("  Insert + flush time: {flushed:.3?}");
    println!("  Avg latency: {ns_per_insert:.1} ns/insert");
    println!("  Throughput: {inserts_per_sec:.0} inserts/sec");
    println!(
        "  Write-behind: {} enqueued, {} written, {} failed, {} dropped",
        stats.enqueued, stats.written, stats.failed, stats.dropped
    );

    if let Some(series) = handles.first().and_then(|h| stream.series(*h)) {
        let (min, max) = series.long().min_max(None);
        println!(
            "  {}: short {}/{} slots, long {}/{} slots, long min {min:.2}, max {max:.2}",
            names[0],
            series.short().len(),
            series.short().capacity(),
            series.long().len(),
            series.long().capacity(),
        );
    }
    println!();

    registry.shutdown().await?;
    Ok(())
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d") to
/// milliseconds.
fn parse_duration(s: &str) -> Result<i64, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    let (num_str, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else {
        let (split, unit) = s.char_indices().next_back().ok_or("Empty duration string")?;
        let num = &s[..split];
        let unit_ms = match unit {
            's' => 1_000,
            'm' => 60_000,
            'h' => 3_600_000,
            'd' => 86_400_000,
            _ => {
                return Err(
                    format!("Unknown duration unit: '{unit}'. Use ms, s, m, h, or d.").into(),
                );
            }
        };
        (num, unit_ms)
    };

    let num: i64 = num_str.parse()?;
    if num < 0 {
        return Err(format!("Negative duration: '{s}'").into());
    }
    num.checked_mul(unit_ms)
        .ok_or_else(|| format!("Duration out of range: '{s}'").into())
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
