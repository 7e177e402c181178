//! Multi-resolution time series.
//!
//! A [`TimeSeries`] is what a dashboard reads for one named signal: the latest
//! raw sample plus a high-resolution *short* tier and a low-resolution *long*
//! tier. Only the long tier is ever persisted; that is handled one layer up by
//! [`StreamSeries`](crate::registry::StreamSeries), which reacts to the
//! [`TierOutcomes`] returned here.

use crate::error::Result;
use crate::ring::Sample;
use crate::schema::SeriesConfig;
use crate::series::{InsertOutcome, SeriesBuffer};

/// Per-tier result of [`TimeSeries::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierOutcomes {
    /// Outcome for the short tier.
    pub short: InsertOutcome,
    /// Outcome for the long tier.
    pub long: InsertOutcome,
}

/// Latest sample plus short and long tier buffers.
///
/// # Thread Safety
///
/// `insert` takes `&mut self`; a single producer owns each series. Readers
/// that need a stable view while the producer keeps inserting should clone.
///
/// # Examples
///
/// ```rust
/// use ostinato::ring::Sample;
/// use ostinato::schema::SeriesConfig;
/// use ostinato::timeseries::TimeSeries;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut series = TimeSeries::new(&SeriesConfig::in_memory())?;
/// series.insert(Sample::new(1_000, 21.5));
/// series.insert(Sample::new(1_010, 21.6));
///
/// assert_eq!(series.current(), Some(Sample::new(1_010, 21.6)));
/// assert_eq!(series.short().len(), 1); // 20 ms buckets
/// assert_eq!(series.long().len(), 1); // 1 s buckets
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    current: Option<Sample>,
    short: SeriesBuffer,
    long: SeriesBuffer,
}

impl TimeSeries {
    /// Creates an empty series shaped by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::error::ConfigError) if the configuration
    /// is invalid.
    pub fn new(config: &SeriesConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            current: None,
            short: SeriesBuffer::with_capacity(
                config.short.capacity("short")?,
                config.short.interval_ms(),
            ),
            long: SeriesBuffer::with_capacity(
                config.long.capacity("long")?,
                config.long.interval_ms(),
            ),
        })
    }

    /// Records a sample.
    ///
    /// `current` is always replaced. Each tier retains the sample only if it
    /// opens a new bucket for that tier.
    #[inline]
    pub fn insert(&mut self, sample: Sample) -> TierOutcomes {
        self.current = Some(sample);
        TierOutcomes {
            short: self.short.insert(sample),
            long: self.long.insert(sample),
        }
    }

    /// The most recently inserted raw sample.
    pub fn current(&self) -> Option<Sample> {
        self.current
    }

    /// High-resolution tier.
    pub fn short(&self) -> &SeriesBuffer {
        &self.short
    }

    /// Low-resolution tier.
    pub fn long(&self) -> &SeriesBuffer {
        &self.long
    }

    /// An empty long tier with the same shape as this series' long tier.
    pub(crate) fn empty_long(&self) -> SeriesBuffer {
        let mut long = self.long.clone();
        long.reset();
        long
    }

    /// Installs a backfilled long tier.
    ///
    /// Live long-tier samples newer than the history's last bucket are
    /// replayed on top of it so that nothing inserted while the history was
    /// loading is lost. `current` and the short tier are left alone.
    pub fn merge_long_history(&mut self, mut history: SeriesBuffer) {
        let cutoff = history.last_bucket_timestamp();
        for sample in self.long.iter() {
            if cutoff.is_none_or(|last| sample.timestamp > last) {
                history.insert(sample);
            }
        }
        self.long = history;
    }

    /// Empties every tier and forgets `current`.
    pub fn reset(&mut self) {
        self.current = None;
        self.short.reset();
        self.long.reset();
    }
}
