//! EMG-Processing: chunk filtering for the live stream
//!
//! Every channel of a chunk is detrended, notch-filtered at the mains
//! frequency and band-limited with a Butterworth cascade. The envelope is
//! the rectified, moving-average-smoothed result.
//!
//! ```
//! use emg_core::SignalMatrix;
//! use emg_processing::{FilterPipeline, FilterSettings, SafeFilter};
//!
//! let filter = SafeFilter::new(FilterPipeline::new(FilterSettings::default()));
//! let chunk = SignalMatrix::zeros(20, 2);
//! let out = filter.process(&chunk, 200.0);
//! assert_eq!(out.env.shape(), (20, 2));
//! ```

pub mod config;
pub mod filters;
pub mod pipeline;
pub mod processor;

pub use config::{FilterDesign, FilterSettings};
pub use filters::{BiquadCoeffs, ButterworthFilter, NotchFilter, SosFilter};
pub use pipeline::FilterPipeline;
pub use processor::{ChunkFilter, FilterStats, FilteredChunk, SafeFilter};
