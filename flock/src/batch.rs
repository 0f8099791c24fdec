//! Batch partitioning.
//!
//! Rows are split into contiguous, order-preserving chunks of at most `batch_size` rows. A chunk is the unit of
//! provider invocation: one chunk, one model call. Partitioning is a pure function of the input length and the
//! batch size, so a fixed input always yields the same chunks.
//!
//! [`Partitioner`] adds the adaptive behaviour used by scalar functions, `llm_reduce` and the first pass of
//! `llm_rerank`: when a provider reports that a chunk overflowed its output budget, the rows not yet consumed are
//! re-planned with a smaller batch size.

use serde::{Deserialize, Serialize};
use std::{fmt, num::NonZeroUsize, ops::Range};

use crate::error::{Error, Result};

/// Factor applied to the batch size after an output-token overflow.
pub const SHRINK_FACTOR: f64 = 0.9;

/// A validated, strictly positive batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct BatchSize(NonZeroUsize);

impl BatchSize {
    pub const ONE: BatchSize = BatchSize(NonZeroUsize::MIN);

    /// Smallest chunk a selection round can make progress with.
    pub const TWO: BatchSize = match NonZeroUsize::new(2) {
        Some(size) => BatchSize(size),
        None => BatchSize::ONE,
    };

    /// Rows per scalar execution fragment unless configured otherwise.
    pub const DEFAULT_VECTOR_SIZE: BatchSize = match NonZeroUsize::new(2048) {
        Some(size) => BatchSize(size),
        None => BatchSize::ONE,
    };

    pub fn new(size: usize) -> Result<Self> {
        NonZeroUsize::new(size)
            .map(BatchSize)
            .ok_or_else(|| Error::invalid("batch_size must be a positive integer"))
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }

    /// The next smaller size after an overflow, or `None` once it would reach zero.
    pub fn shrink(&self) -> Option<BatchSize> {
        let next = (self.get() as f64 * SHRINK_FACTOR).floor() as usize;
        NonZeroUsize::new(next).map(BatchSize)
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        Self::ONE
    }
}

impl TryFrom<usize> for BatchSize {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self> {
        Self::new(value)
    }
}

impl From<BatchSize> for usize {
    fn from(value: BatchSize) -> Self {
        value.get()
    }
}

impl fmt::Display for BatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of chunks `partition` produces for `len` rows.
pub fn chunk_count(len: usize, batch_size: BatchSize) -> usize {
    len.div_ceil(batch_size.get())
}

/// Split `0..len` into ordered index ranges of at most `batch_size`.
pub fn partition(len: usize, batch_size: BatchSize) -> Vec<Range<usize>> {
    let size = batch_size.get();
    (0..chunk_count(len, batch_size))
        .map(|i| {
            let start = i * size;
            start..(start + size).min(len)
        })
        .collect()
}

/// Slice-level convenience over [`partition`].
pub fn chunks<T>(rows: &[T], batch_size: BatchSize) -> impl Iterator<Item = &[T]> {
    rows.chunks(batch_size.get())
}

/// Cursor over a row sequence that hands out one chunk at a time.
///
/// The cursor only moves forward when a chunk is committed, so a chunk that failed with an output overflow can be
/// re-issued with fewer rows.
#[derive(Debug, Clone)]
pub struct Partitioner {
    len: usize,
    position: usize,
    batch_size: BatchSize,
    issued: usize,
}

impl Partitioner {
    pub fn new(len: usize, batch_size: BatchSize) -> Self {
        Self {
            len,
            position: 0,
            batch_size,
            issued: 0,
        }
    }

    /// The next chunk to execute, or `None` when every row has been consumed.
    pub fn next_chunk(&mut self) -> Option<Range<usize>> {
        if self.position >= self.len {
            return None;
        }
        self.issued += 1;
        Some(self.position..(self.position + self.batch_size.get()).min(self.len))
    }

    /// Mark `chunk` as done and advance past it.
    pub fn commit(&mut self, chunk: &Range<usize>) {
        debug_assert_eq!(chunk.start, self.position);
        self.position = chunk.end;
    }

    /// Re-plan the remaining rows with a smaller batch size.
    ///
    /// Fails with the overflow error once the batch size cannot shrink any further.
    pub fn shrink(&mut self, provider: &str) -> Result<BatchSize> {
        match self.batch_size.shrink() {
            Some(smaller) => {
                tracing::debug!(
                    from = self.batch_size.get(),
                    to = smaller.get(),
                    remaining = self.remaining(),
                    "Shrinking batch size after output overflow"
                );
                self.batch_size = smaller;
                Ok(smaller)
            }
            None => Err(Error::ExceededMaxOutputTokens {
                provider: provider.to_string(),
            }),
        }
    }

    pub fn batch_size(&self) -> BatchSize {
        self.batch_size
    }

    pub fn remaining(&self) -> usize {
        self.len - self.position
    }

    /// Chunks handed out so far, including re-issued ones.
    pub fn issued(&self) -> usize {
        self.issued
    }
}
