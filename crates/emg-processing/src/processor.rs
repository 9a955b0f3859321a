//! Chunk processor contract and the fallback wrapper used on the live path

use emg_core::{EmgError, EmgResult, SignalMatrix};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Output of one filtering pass; both matrices share the input's shape
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredChunk {
    pub raw: SignalMatrix,
    pub env: SignalMatrix,
}

impl FilteredChunk {
    /// Input passed through with a zero envelope
    pub fn fallback(chunk: &SignalMatrix) -> Self {
        Self {
            raw: chunk.clone(),
            env: SignalMatrix::zeros(chunk.rows(), chunk.channel_count()),
        }
    }
}

/// Stateless transform from a raw chunk to (cleaned, envelope)
pub trait ChunkFilter: Send + Sync {
    fn filter(&self, chunk: &SignalMatrix, sample_rate: f64) -> EmgResult<FilteredChunk>;

    fn name(&self) -> &str;
}

/// Counters exposed through the health endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub chunks_processed: u64,
    pub failures: u64,
}

/// Never lets a filter error or panic escape.
///
/// A failing chunk is replaced by [`FilteredChunk::fallback`] and counted.
pub struct SafeFilter<T: ChunkFilter> {
    inner: T,
    processed: AtomicU64,
    failures: AtomicU64,
}

impl<T: ChunkFilter> SafeFilter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            processed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn process(&self, chunk: &SignalMatrix, sample_rate: f64) -> FilteredChunk {
        self.processed.fetch_add(1, Ordering::Relaxed);

        let result = catch_unwind(AssertUnwindSafe(|| self.inner.filter(chunk, sample_rate)))
            .unwrap_or_else(|_| {
                Err(EmgError::filter(format!("{} panicked", self.inner.name())))
            });

        match result {
            Ok(filtered) => filtered,
            Err(err) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    filter = self.inner.name(),
                    error = %err,
                    failures,
                    "Filtering failed, sending unfiltered chunk"
                );
                FilteredChunk::fallback(chunk)
            }
        }
    }

    pub fn stats(&self) -> FilterStats {
        FilterStats {
            chunks_processed: self.processed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
