//! Error handling for the EMG streaming framework
//!
//! One error type is shared by every crate in the workspace so that source,
//! filter and storage failures can be told apart where they are handled.

/// Result type alias for framework operations
pub type EmgResult<T> = Result<T, EmgError>;

/// Error type for all framework operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum EmgError {
    /// Signal source cannot be read (stopped, released or disconnected)
    #[error("Signal source unavailable: {reason}")]
    SourceUnavailable {
        /// Why the source could not be read
        reason: String,
    },

    /// A single chunk could not be filtered
    #[error("Filter failure: {reason}")]
    FilterFailure {
        /// Description of the failing stage
        reason: String,
    },

    /// Session id is unknown or already finalized
    #[error("Session not found: {session_id}")]
    NotFound {
        /// Requested session id
        session_id: String,
    },

    /// Durable store read or write failed
    #[error("Storage failure: {reason}")]
    StorageFailure {
        /// Description of the storage problem
        reason: String,
    },

    /// Session id contains characters that are not allowed in file names
    #[error("Invalid session id: {session_id:?}")]
    InvalidSessionId {
        /// Offending id
        session_id: String,
    },

    /// Matrix dimensions do not line up
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected shape description
        expected: String,
        /// Actual shape description
        actual: String,
    },

    /// Client connection went away mid-stream
    #[error("Client disconnected: {reason}")]
    Disconnected {
        /// Transport error description
        reason: String,
    },

    /// Configuration value out of range
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error
        reason: String,
    },
}

impl EmgError {
    pub fn not_found(session_id: impl Into<String>) -> Self {
        EmgError::NotFound {
            session_id: session_id.into(),
        }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        EmgError::StorageFailure {
            reason: reason.into(),
        }
    }

    pub fn source_unavailable(reason: impl Into<String>) -> Self {
        EmgError::SourceUnavailable {
            reason: reason.into(),
        }
    }

    pub fn filter(reason: impl Into<String>) -> Self {
        EmgError::FilterFailure {
            reason: reason.into(),
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        EmgError::Disconnected {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        EmgError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for EmgError {
    fn from(err: std::io::Error) -> Self {
        EmgError::storage(err.to_string())
    }
}

/// Convenience macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::EmgError::InvalidConfig {
            reason: format!($($arg)*),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = EmgError::ShapeMismatch {
            expected: "20x2".to_string(),
            actual: "20x3".to_string(),
        };
        let display = format!("{}", error);
        assert!(display.contains("Shape mismatch"));
        assert!(display.contains("20x2"));
        assert!(display.contains("20x3"));
    }

    #[test]
    fn test_config_error_macro() {
        let error = config_error!("chunk size {} too small", 0);
        assert_eq!(error, EmgError::config("chunk size 0 too small"));
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        match EmgError::from(io) {
            EmgError::StorageFailure { reason } => assert!(reason.contains("read-only")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
