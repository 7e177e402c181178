//! Time-bucketed series buffer.
//!
//! A [`SeriesBuffer`] is one [`RingBuffer`] plus a sample interval. Inserts
//! are bucketed to `floor(timestamp / interval) * interval`; only the first
//! sample landing in a bucket is retained, so input arriving faster than the
//! interval is decimated to the buffer's resolution.
//!
//! # Bucketing
//!
//! ```text
//! interval = 1000 ms, capacity = 5
//!
//! insert t=0    -> bucket 0     advanced   ring: (0)
//! insert t=500  -> bucket 0     unchanged  ring: (0)
//! insert t=1000 -> bucket 1000  advanced   ring: (0) (1000)
//! insert t=2500 -> bucket 2000  advanced   ring: (0) (1000) (2000)
//! ```
//!
//! Samples older than the last bucket are not rejected: they advance the
//! bucket and land in the write slot, out of chronological order.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ring::{RingBuffer, RingIter, Sample};
use crate::schema::TierConfig;

/// Result of [`SeriesBuffer::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The sample opened a new bucket and was written to the ring.
    BucketAdvanced,
    /// The sample fell in the current bucket; the ring is untouched.
    BucketUnchanged,
}

impl InsertOutcome {
    /// Returns `true` for [`InsertOutcome::BucketAdvanced`].
    pub fn advanced(self) -> bool {
        matches!(self, Self::BucketAdvanced)
    }
}

/// Inclusive `[start, end]` span of timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// First timestamp.
    pub start: i64,
    /// Last timestamp.
    pub end: i64,
}

/// Aggregate view over the samples of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesSummary {
    /// Smallest finite value, or 0 when there is none.
    pub min: f64,
    /// Largest finite value, or 0 when there is none.
    pub max: f64,
    /// Number of retained samples.
    pub count: usize,
    /// Most recently written sample.
    pub latest: Option<Sample>,
    /// Timestamps of the oldest and newest retained samples, in ring order.
    pub time_range: Option<TimeRange>,
}

/// Ring buffer of bucketed samples at a fixed resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesBuffer {
    ring: RingBuffer,
    interval_ms: i64,
    last_bucket_timestamp: Option<i64>,
}

impl SeriesBuffer {
    /// Creates an empty buffer sized for the given tier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::error::ConfigError) if the tier is
    /// invalid.
    pub fn new(tier: &TierConfig) -> Result<Self> {
        let capacity = tier.capacity("tier")?;
        Ok(Self::with_capacity(capacity, tier.interval_ms()))
    }

    /// Creates an empty buffer from an already validated capacity and a
    /// positive interval.
    pub(crate) fn with_capacity(capacity: NonZeroUsize, interval_ms: i64) -> Self {
        debug_assert!(interval_ms > 0);
        Self {
            ring: RingBuffer::new(capacity),
            interval_ms,
            last_bucket_timestamp: None,
        }
    }

    /// Start of the bucket `timestamp` falls in.
    ///
    /// Rounds towards negative infinity, so pre-epoch timestamps bucket the
    /// same way as positive ones.
    #[inline]
    pub fn bucket_of(&self, timestamp: i64) -> i64 {
        timestamp.saturating_sub(timestamp.rem_euclid(self.interval_ms))
    }

    /// Inserts a sample, retaining it only if it opens a new bucket.
    ///
    /// A retained sample is stored with its timestamp replaced by the bucket
    /// start.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use ostinato::ring::Sample;
    /// use ostinato::schema::TierConfig;
    /// use ostinato::series::{InsertOutcome, SeriesBuffer};
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let tier = TierConfig::new(Duration::from_secs(1), Duration::from_secs(5))?;
    /// let mut buffer = SeriesBuffer::new(&tier)?;
    ///
    /// assert_eq!(buffer.insert(Sample::new(1_200, 1.0)), InsertOutcome::BucketAdvanced);
    /// assert_eq!(buffer.insert(Sample::new(1_700, 2.0)), InsertOutcome::BucketUnchanged);
    /// assert_eq!(buffer.latest(), Some(Sample::new(1_000, 1.0)));
    /// # Ok(())
    /// # }
    /// ```
    #[inline]
    pub fn insert(&mut self, sample: Sample) -> InsertOutcome {
        let bucket = self.bucket_of(sample.timestamp);
        if self.last_bucket_timestamp == Some(bucket) {
            return InsertOutcome::BucketUnchanged;
        }

        self.ring.push(Sample::new(bucket, sample.value));
        self.last_bucket_timestamp = Some(bucket);
        InsertOutcome::BucketAdvanced
    }

    /// The underlying ring.
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Retained samples, oldest slot first.
    pub fn iter(&self) -> RingIter<'_> {
        self.ring.iter_chronological()
    }

    /// Most recently written sample.
    pub fn latest(&self) -> Option<Sample> {
        self.ring.latest()
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when nothing has been retained.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Returns `true` once every slot holds a sample.
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Bucket width in milliseconds.
    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// Start of the most recent bucket written, if any.
    pub fn last_bucket_timestamp(&self) -> Option<i64> {
        self.last_bucket_timestamp
    }

    /// Span covered by a full buffer: `capacity * interval`.
    pub fn time_window_ms(&self) -> i64 {
        i64::try_from(self.capacity())
            .unwrap_or(i64::MAX)
            .saturating_mul(self.interval_ms)
    }

    /// Empties the buffer, forgetting the last bucket.
    pub fn reset(&mut self) {
        self.ring.clear();
        self.last_bucket_timestamp = None;
    }

    /// Samples at or after `last_bucket - window`, in ring order.
    ///
    /// `None` yields every retained sample.
    fn windowed(&self, window_ms: Option<i64>) -> impl Iterator<Item = Sample> + '_ {
        let cutoff = match (window_ms, self.last_bucket_timestamp) {
            (Some(window), Some(last)) => last.saturating_sub(window),
            _ => i64::MIN,
        };
        self.iter().filter(move |s| s.timestamp >= cutoff)
    }

    /// Splits the samples into parallel timestamp and value columns, the
    /// shape chart libraries consume.
    ///
    /// # Arguments
    ///
    /// * `window_ms` - Only include samples within this distance of the last
    ///   bucket; `None` includes everything
    pub fn to_columns(&self, window_ms: Option<i64>) -> (Vec<i64>, Vec<f64>) {
        self.windowed(window_ms).map(|s| (s.timestamp, s.value)).unzip()
    }

    /// Smallest and largest finite value within the window, `(0.0, 0.0)` when
    /// there is none.
    pub fn min_max(&self, window_ms: Option<i64>) -> (f64, f64) {
        let (min, max) = self
            .windowed(window_ms)
            .map(|s| s.value)
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });

        if min > max { (0.0, 0.0) } else { (min, max) }
    }

    /// Aggregate view over every retained sample.
    pub fn summary(&self) -> SeriesSummary {
        let (min, max) = self.min_max(None);
        let mut iter = self.iter();
        let time_range = match (iter.next(), iter.next_back()) {
            (Some(first), Some(last)) => Some(TimeRange {
                start: first.timestamp,
                end: last.timestamp,
            }),
            (Some(only), None) => Some(TimeRange {
                start: only.timestamp,
                end: only.timestamp,
            }),
            _ => None,
        };

        SeriesSummary {
            min,
            max,
            count: self.len(),
            latest: self.latest(),
            time_range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(interval_ms: i64, capacity: usize) -> SeriesBuffer {
        SeriesBuffer::with_capacity(NonZeroUsize::new(capacity).unwrap(), interval_ms)
    }

    fn retained(buffer: &SeriesBuffer) -> Vec<(i64, f64)> {
        buffer.iter().map(|s| (s.timestamp, s.value)).collect()
    }

    #[test]
    fn test_new_from_tier() {
        let tier = TierConfig::new(
            std::time::Duration::from_millis(20),
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        let buffer = SeriesBuffer::new(&tier).unwrap();

        assert_eq!(buffer.capacity(), 250);
        assert_eq!(buffer.interval_ms(), 20);
        assert_eq!(buffer.time_window_ms(), 5_000);
        assert_eq!(buffer.last_bucket_timestamp(), None);
    }

    #[test]
    fn test_same_bucket_insert_is_noop() {
        let mut buffer = buffer(1_000, 5);
        assert!(buffer.insert(Sample::new(1_000, 1.0)).advanced());

        let write_index = buffer.ring().write_index();
        let outcome = buffer.insert(Sample::new(1_999, 2.0));

        assert_eq!(outcome, InsertOutcome::BucketUnchanged);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.ring().write_index(), write_index);
        assert_eq!(retained(&buffer), vec![(1_000, 1.0)]);
    }

    #[test]
    fn test_first_sample_at_zero_is_retained() {
        let mut buffer = buffer(1_000, 5);
        assert!(buffer.insert(Sample::new(0, 7.0)).advanced());
        assert_eq!(buffer.last_bucket_timestamp(), Some(0));
        assert_eq!(retained(&buffer), vec![(0, 7.0)]);
    }

    #[test]
    fn test_bucket_timestamps_are_aligned() {
        let mut buffer = buffer(1_000, 5);
        buffer.insert(Sample::new(2_500, 1.0));
        buffer.insert(Sample::new(3_600, 2.0));

        assert_eq!(retained(&buffer), vec![(2_000, 1.0), (3_000, 2.0)]);
        assert_eq!(buffer.bucket_of(-1), -1_000);
        assert_eq!(buffer.bucket_of(-1_000), -1_000);
    }

    #[test]
    fn test_capacity_and_chronological_order() {
        let mut buffer = buffer(10, 4);
        for i in 0..10 {
            buffer.insert(Sample::new(i * 10, i as f64));
            assert!(buffer.len() <= buffer.capacity());
        }

        assert!(buffer.is_full());
        let timestamps: Vec<i64> = buffer.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![60, 70, 80, 90]);
    }

    #[test]
    fn test_out_of_order_sample_written_at_write_slot() {
        let mut buffer = buffer(1_000, 5);
        buffer.insert(Sample::new(1_000, 1.0));
        buffer.insert(Sample::new(3_000, 3.0));

        let outcome = buffer.insert(Sample::new(2_000, 2.0));

        assert_eq!(outcome, InsertOutcome::BucketAdvanced);
        assert_eq!(buffer.last_bucket_timestamp(), Some(2_000));
        assert_eq!(retained(&buffer), vec![(1_000, 1.0), (3_000, 3.0), (2_000, 2.0)]);
    }

    #[test]
    fn test_to_columns_with_window() {
        let mut buffer = buffer(1_000, 10);
        for i in 0..6 {
            buffer.insert(Sample::new(i * 1_000, i as f64));
        }

        let (timestamps, values) = buffer.to_columns(None);
        assert_eq!(timestamps.len(), 6);
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

        // cutoff is measured from the last bucket, inclusive
        let (timestamps, values) = buffer.to_columns(Some(2_000));
        assert_eq!(timestamps, vec![3_000, 4_000, 5_000]);
        assert_eq!(values, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_min_max() {
        let mut buffer = buffer(1_000, 10);
        assert_eq!(buffer.min_max(None), (0.0, 0.0));

        buffer.insert(Sample::new(0, 5.0));
        buffer.insert(Sample::new(1_000, -2.0));
        buffer.insert(Sample::new(2_000, f64::NAN));
        buffer.insert(Sample::new(3_000, 9.0));

        assert_eq!(buffer.min_max(None), (-2.0, 9.0));
        assert_eq!(buffer.min_max(Some(1_000)), (9.0, 9.0));
    }

    #[test]
    fn test_summary() {
        let mut buffer = buffer(1_000, 3);
        assert_eq!(buffer.summary().time_range, None);
        assert_eq!(buffer.summary().latest, None);

        buffer.insert(Sample::new(1_000, 4.0));
        let summary = buffer.summary();
        assert_eq!(
            summary.time_range,
            Some(TimeRange {
                start: 1_000,
                end: 1_000
            })
        );

        for i in 2..=5 {
            buffer.insert(Sample::new(i * 1_000, i as f64));
        }
        let summary = buffer.summary();
        assert_eq!(summary.count, 3);
        assert_eq!((summary.min, summary.max), (3.0, 5.0));
        assert_eq!(summary.latest, Some(Sample::new(5_000, 5.0)));
        assert_eq!(
            summary.time_range,
            Some(TimeRange {
                start: 3_000,
                end: 5_000
            })
        );
    }

    #[test]
    fn test_reset_forgets_last_bucket() {
        let mut buffer = buffer(1_000, 3);
        buffer.insert(Sample::new(1_000, 1.0));
        buffer.reset();

        assert!(buffer.is_empty());
        assert_eq!(buffer.last_bucket_timestamp(), None);
        assert!(buffer.insert(Sample::new(1_500, 2.0)).advanced());
    }
}
