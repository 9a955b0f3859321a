//! EMG-Source: signal source contract and a synthetic board
//!
//! The streaming server talks to acquisition hardware only through
//! [`SignalSource`]. [`SyntheticSource`] generates realistic EMG for
//! development and testing.

pub mod signal_patterns;
pub mod source;
pub mod synthetic;

pub use signal_patterns::SignalPattern;
pub use source::{ChannelId, SignalSource};
pub use synthetic::{EmgSimulator, SourceSettings, SyntheticSource};
