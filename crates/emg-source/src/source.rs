//! Capability contract for acquisition hardware
//!
//! The streaming server only needs three things from a board: its sample
//! rate, its channel list and a non-destructive read of the newest samples.
//! Boards are shared by every connected client, so implementations must be
//! safe to call concurrently.

use emg_core::{EmgResult, SignalMatrix};

/// Board-level channel identifier
pub type ChannelId = usize;

/// Streaming signal source
pub trait SignalSource: Send + Sync {
    /// Sampling rate in Hz
    fn sample_rate(&self) -> f64;

    /// Ordered channel identifiers
    fn channels(&self) -> Vec<ChannelId>;

    /// The most recent `n` samples per channel, `channel_count × n`.
    ///
    /// Does not remove data from the source. When fewer than `n` samples have
    /// been acquired the front of each channel is zero-padded.
    fn read_latest(&self, n: usize) -> EmgResult<Vec<Vec<f64>>>;

    /// Stop acquiring new samples
    fn stop(&self) -> EmgResult<()>;

    /// Stop and give the device back; later reads fail
    fn release(&self) -> EmgResult<()>;

    fn channel_count(&self) -> usize {
        self.channels().len()
    }

    /// Newest `n` samples as a time × channel matrix
    fn read_chunk(&self, n: usize) -> EmgResult<SignalMatrix> {
        let channels = self.read_latest(n)?;
        SignalMatrix::from_channels(&channels)
    }
}
