//! Fixed-capacity ring buffer of telemetry samples.
//!
//! This is the memory-management primitive shared by every resolution tier.
//! Capacity is fixed at construction and the backing slice is never
//! reallocated, so memory use per series is bounded by configuration rather
//! than by how long a stream has been running.
//!
//! # Design
//!
//! - `write_index` is the next slot to write, modulo capacity
//! - `valid_count` is `min(samples ever written, capacity)`
//! - When full, the oldest sample sits at `write_index`; otherwise at slot 0
//! - Pushing never fails and overwrites the oldest slot once full

use std::iter::FusedIterator;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// A single `(timestamp, value)` reading.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// The reading.
    pub value: f64,
}

impl Sample {
    /// Creates a sample.
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

const EMPTY_SLOT: Sample = Sample::new(0, 0.0);

/// Circular array of [`Sample`]s with a write cursor and valid-count.
///
/// # Thread Safety
///
/// RingBuffer is designed for a single writer. Readers that need a stable
/// view while the owner keeps writing should clone it.
#[derive(Debug, Clone, PartialEq)]
pub struct RingBuffer {
    slots: Box<[Sample]>,
    write_index: usize,
    valid_count: usize,
}

impl RingBuffer {
    /// Creates an empty ring buffer holding at most `capacity` samples.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::num::NonZeroUsize;
    /// use ostinato::ring::{RingBuffer, Sample};
    ///
    /// let mut ring = RingBuffer::new(NonZeroUsize::new(2).unwrap());
    /// ring.push(Sample::new(1, 1.0));
    /// ring.push(Sample::new(2, 2.0));
    /// ring.push(Sample::new(3, 3.0));
    ///
    /// let kept: Vec<i64> = ring.iter_chronological().map(|s| s.timestamp).collect();
    /// assert_eq!(kept, vec![2, 3]);
    /// ```
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            slots: vec![EMPTY_SLOT; capacity.get()].into_boxed_slice(),
            write_index: 0,
            valid_count: 0,
        }
    }

    /// Writes a sample into the next slot, overwriting the oldest when full.
    #[inline]
    pub fn push(&mut self, sample: Sample) {
        let capacity = self.slots.len();
        self.slots[self.write_index] = sample;
        self.write_index = (self.write_index + 1) % capacity;
        if self.valid_count < capacity {
            self.valid_count += 1;
        }
    }

    /// Returns a lazy iterator over valid samples, oldest first.
    ///
    /// The iterator borrows the buffer; a fresh one can be requested at any
    /// time and yields exactly [`len`](Self::len) items.
    pub fn iter_chronological(&self) -> RingIter<'_> {
        let start = if self.is_full() { self.write_index } else { 0 };
        RingIter {
            ring: self,
            front: 0,
            back: self.valid_count,
            start,
        }
    }

    /// Returns the most recently written sample.
    pub fn latest(&self) -> Option<Sample> {
        if self.valid_count == 0 {
            return None;
        }
        let capacity = self.slots.len();
        Some(self.slots[(self.write_index + capacity - 1) % capacity])
    }

    /// Returns the sample that will be overwritten next once the buffer is full.
    pub fn oldest(&self) -> Option<Sample> {
        self.iter_chronological().next()
    }

    /// Index of the next slot to write.
    pub fn write_index(&self) -> usize {
        self.write_index
    }

    /// Number of valid samples.
    pub fn len(&self) -> usize {
        self.valid_count
    }

    /// Returns `true` if nothing has been written since construction or the
    /// last [`clear`](Self::clear).
    pub fn is_empty(&self) -> bool {
        self.valid_count == 0
    }

    /// Returns `true` once every slot holds a valid sample.
    pub fn is_full(&self) -> bool {
        self.valid_count == self.slots.len()
    }

    /// Fixed number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Forgets every sample without releasing the backing storage.
    pub fn clear(&mut self) {
        self.slots.fill(EMPTY_SLOT);
        self.write_index = 0;
        self.valid_count = 0;
    }
}

/// Chronological iterator over a [`RingBuffer`].
#[derive(Debug, Clone)]
pub struct RingIter<'a> {
    ring: &'a RingBuffer,
    front: usize,
    back: usize,
    start: usize,
}

impl RingIter<'_> {
    #[inline]
    fn slot(&self, offset: usize) -> Sample {
        self.ring.slots[(self.start + offset) % self.ring.slots.len()]
    }
}

impl Iterator for RingIter<'_> {
    type Item = Sample;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let sample = self.slot(self.front);
        self.front += 1;
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl DoubleEndedIterator for RingIter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(self.slot(self.back))
    }
}

impl ExactSizeIterator for RingIter<'_> {}

impl FusedIterator for RingIter<'_> {}
