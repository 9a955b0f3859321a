//! EMG-Server: live streaming, session capture and replay
//!
//! A [`dispatcher::AppState`] ties a [`emg_source::SignalSource`], the
//! filter pipeline, the pending-session table and the on-disk store
//! together; [`dispatcher::router`] exposes them over HTTP and WebSocket.

pub mod config;
pub mod dispatcher;
pub mod npy;
pub mod session_table;
pub mod store;
pub mod streaming;

pub use config::{Cli, OrphanPolicy, ServerConfig};
pub use dispatcher::{router, AppState};
pub use session_table::SessionTable;
pub use store::SessionStore;
pub use streaming::{FrameSink, StreamFrame, StreamingSession};
