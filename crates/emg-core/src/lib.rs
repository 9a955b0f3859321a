//! EMG-Core: Foundation types for the EMG streaming framework
//!
//! Sample matrices, session identity and the shared error type.

pub mod error;
pub mod matrix;
pub mod session;

pub use error::{EmgError, EmgResult};
pub use matrix::SignalMatrix;
pub use session::{SessionId, SessionMetadata, SessionState, SessionSummary};
