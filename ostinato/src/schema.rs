//! Configuration types for ostinato series and registries.
//!
//! A [`SeriesConfig`] decides the shape of one named series: the resolution and
//! retention of its two in-memory tiers and whether (and for how long) its
//! long tier is persisted. A [`RegistryConfig`] holds the knobs shared by every
//! stream created from one [`StreamSeriesRegistry`](crate::registry::StreamSeriesRegistry).
//!
//! All durations are serialized as whole milliseconds, the unit used for
//! sample timestamps. Configuration is validated eagerly; nothing is rejected
//! at first insert.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Maximum number of slots allowed in any single tier.
///
/// A slot is 16 bytes, so this caps one tier at roughly 1.6GB.
pub const MAX_SLOTS_PER_TIER: u128 = 100_000_000;

/// Resolution and retention of one in-memory tier.
///
/// The ring buffer backing the tier has `ceil(retention / interval)` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TierConfig {
    /// Width of one time bucket. At most one sample is retained per bucket.
    #[serde(with = "duration_ms")]
    pub interval: Duration,

    /// How much history the tier keeps in memory.
    #[serde(with = "duration_ms")]
    pub retention: Duration,
}

impl TierConfig {
    /// Creates a validated tier configuration.
    ///
    /// # Arguments
    ///
    /// * `interval` - Bucket width
    /// * `retention` - Time span held in memory
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if either duration rounds to zero milliseconds,
    /// the retention is shorter than one interval, or the tier would need more
    /// than [`MAX_SLOTS_PER_TIER`] slots.
    pub fn new(interval: Duration, retention: Duration) -> Result<Self> {
        let config = Self {
            interval,
            retention,
        };
        config.validate("tier")?;
        Ok(config)
    }

    /// Validates this tier, naming it `tier` in any error.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if validation fails.
    pub fn validate(&self, tier: &'static str) -> Result<()> {
        if self.interval_ms() == 0 {
            return Err(ConfigError::NonPositiveInterval { tier }.into());
        }
        if self.retention_ms() == 0 {
            return Err(ConfigError::NonPositiveRetention { tier }.into());
        }
        if self.retention < self.interval {
            return Err(ConfigError::WindowSmallerThanInterval {
                tier,
                retention: self.retention,
                interval: self.interval,
            }
            .into());
        }

        let slot_count = self.slot_count();
        if slot_count > MAX_SLOTS_PER_TIER {
            return Err(ConfigError::TooManySlots {
                tier,
                slot_count,
                max_slots: MAX_SLOTS_PER_TIER,
                retention: self.retention,
                interval: self.interval,
            }
            .into());
        }

        Ok(())
    }

    /// Bucket width in milliseconds.
    #[allow(clippy::cast_possible_truncation)] // intervals beyond i64::MAX ms are rejected as too many slots anyway
    pub fn interval_ms(&self) -> i64 {
        self.interval.as_millis().min(i64::MAX as u128) as i64
    }

    /// Retention in milliseconds.
    #[allow(clippy::cast_possible_truncation)] // clamped to i64::MAX
    pub fn retention_ms(&self) -> i64 {
        self.retention.as_millis().min(i64::MAX as u128) as i64
    }

    /// Number of slots, `ceil(retention / interval)`, computed in whole
    /// milliseconds. Returns 0 for a zero interval.
    pub fn slot_count(&self) -> u128 {
        let interval = self.interval.as_millis();
        if interval == 0 {
            return 0;
        }
        self.retention.as_millis().div_ceil(interval)
    }

    /// Slot count as a ring capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the tier is invalid.
    pub fn capacity(&self, tier: &'static str) -> Result<NonZeroUsize> {
        self.validate(tier)?;
        usize::try_from(self.slot_count())
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| {
                ConfigError::TooManySlots {
                    tier,
                    slot_count: self.slot_count(),
                    max_slots: MAX_SLOTS_PER_TIER,
                    retention: self.retention,
                    interval: self.interval,
                }
                .into()
            })
    }
}

/// Durability settings for a series' long tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Persist long-tier samples and backfill them at stream creation.
    pub enabled: bool,

    /// Persisted rows older than `now - max_retention` are pruned.
    #[serde(with = "duration_ms")]
    pub max_retention: Duration,

    /// Minimum time between two janitor runs.
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,

    /// How much history to pull at stream creation.
    ///
    /// `None` loads the whole long-tier window. The effective window is never
    /// longer than the long tier's retention; zero skips backfill entirely.
    #[serde(with = "duration_ms::option")]
    pub initial_load_window: Option<Duration>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retention: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            initial_load_window: None,
        }
    }
}

impl PersistenceConfig {
    /// Persistence switched off; every other field keeps its default.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Validates the durations. Disabled configs are always valid.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a duration is zero.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_retention.as_millis() == 0 {
            return Err(ConfigError::NonPositiveMaxRetention.into());
        }
        if self.cleanup_interval.as_millis() == 0 {
            return Err(ConfigError::NonPositiveCleanupInterval.into());
        }
        Ok(())
    }

    /// Maximum persisted age in milliseconds.
    #[allow(clippy::cast_possible_truncation)] // clamped to i64::MAX
    pub fn max_retention_ms(&self) -> i64 {
        self.max_retention.as_millis().min(i64::MAX as u128) as i64
    }

    /// Janitor interval in milliseconds.
    #[allow(clippy::cast_possible_truncation)] // clamped to i64::MAX
    pub fn cleanup_interval_ms(&self) -> i64 {
        self.cleanup_interval.as_millis().min(i64::MAX as u128) as i64
    }
}

/// Full configuration of one named series.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use ostinato::schema::{PersistenceConfig, SeriesConfig, TierConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = SeriesConfig {
///     // 50 ms resolution for the last 10 seconds, memory only
///     short: TierConfig::new(Duration::from_millis(50), Duration::from_secs(10))?,
///     // 1 s resolution for the last hour, persisted
///     long: TierConfig::new(Duration::from_secs(1), Duration::from_secs(3600))?,
///     persistence: PersistenceConfig::default(),
/// };
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesConfig {
    /// High-resolution tier, never persisted.
    pub short: TierConfig,
    /// Low-resolution tier, persisted when enabled.
    pub long: TierConfig,
    /// Durability of the long tier.
    pub persistence: PersistenceConfig,
}

impl Default for SeriesConfig {
    /// Short 20 ms / 5 s, long 1 s / 1 h, persisted for 7 days with an hourly
    /// janitor.
    fn default() -> Self {
        Self {
            short: TierConfig {
                interval: Duration::from_millis(20),
                retention: Duration::from_secs(5),
            },
            long: TierConfig {
                interval: Duration::from_secs(1),
                retention: Duration::from_secs(60 * 60),
            },
            persistence: PersistenceConfig::default(),
        }
    }
}

impl SeriesConfig {
    /// Memory-only configuration with default tiers.
    pub fn in_memory() -> Self {
        Self {
            persistence: PersistenceConfig::disabled(),
            ..Self::default()
        }
    }

    /// Validates both tiers and the persistence settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.short.validate("short")?;
        self.long.validate("long")?;
        self.persistence.validate()
    }

    /// Effective backfill window in milliseconds, or `None` when backfill is
    /// skipped (persistence disabled or a zero load window).
    #[allow(clippy::cast_possible_truncation)] // clamped to i64::MAX
    pub fn backfill_window_ms(&self) -> Option<i64> {
        if !self.persistence.enabled {
            return None;
        }
        let long_window = self.long.retention_ms();
        let window = match self.persistence.initial_load_window {
            Some(load) => (load.as_millis().min(i64::MAX as u128) as i64).min(long_window),
            None => long_window,
        };
        (window > 0).then_some(window)
    }
}

/// Settings shared by every stream of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Upper bound on one series' history query at stream creation. A query
    /// that takes longer leaves that series empty.
    #[serde(with = "duration_ms")]
    pub backfill_timeout: Duration,

    /// Capacity of the write-behind queue. When full, new writes are dropped
    /// and counted.
    pub write_queue_capacity: usize,

    /// Most samples the background writer commits in one `put_many` batch.
    pub write_batch_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backfill_timeout: Duration::from_secs(10),
            write_queue_capacity: 4096,
            write_batch_size: 256,
        }
    }
}

impl RegistryConfig {
    /// Validates the registry options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRegistryOption`] for a zero timeout,
    /// queue capacity or batch size.
    pub fn validate(&self) -> Result<()> {
        if self.backfill_timeout.is_zero() {
            return Err(ConfigError::InvalidRegistryOption {
                option: "backfill_timeout",
                reason: "must be positive".to_string(),
            }
            .into());
        }
        if self.write_queue_capacity == 0 {
            return Err(ConfigError::InvalidRegistryOption {
                option: "write_queue_capacity",
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.write_batch_size == 0 {
            return Err(ConfigError::InvalidRegistryOption {
                option: "write_batch_size",
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Serde support for Duration fields as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[allow(clippy::cast_possible_truncation)] // u64 ms covers ~584 million years
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis().min(u128::from(u64::MAX)) as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        #[allow(clippy::cast_possible_truncation)] // see the parent module
        #[allow(clippy::ref_option)] // signature required by serde(with)
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration
                .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
                .serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
