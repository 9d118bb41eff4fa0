//! Coordination Error Types
//!
//! Recoverable failures of the coordination layer. Contract violations
//! (re-entrant barrier waits, double readiness announcements, cohort
//! overflow, page-capability misuse) are deliberately *not* represented
//! here: those panic, because the layer's invariants are cheap to state and
//! expensive to violate silently.

use thiserror::Error;

/// Main coordination error type
#[derive(Debug, Error)]
pub enum IpcError {
    /// Datagram transport errors
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Frame encode/decode errors
    #[error("codec error: {0}")]
    Codec(#[from] wire::WireError),

    /// Registration with the Coordinator failed; fatal to the process
    #[error("registration failed: {message}")]
    Registration { message: String },

    /// An awaited exchange did not complete in time
    #[error("timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Another live instance already owns the PID file
    #[error("instance already running (pid {pid})")]
    AlreadyRunning { pid: i32 },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A peer answered with something this process cannot accept
    #[error("protocol error: {message}")]
    Protocol { message: String },
}

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, IpcError>;

impl IpcError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn registration(message: impl Into<String>) -> Self {
        Self::Registration {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}
