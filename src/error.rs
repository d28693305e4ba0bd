//! Error types for meshwire.

use thiserror::Error;

/// Main error type for all meshwire operations.
#[derive(Debug, Error)]
pub enum MeshwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (malformed frame, reserved bits set, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Fork length outside the valid range for the slice.
    #[error("Invalid slice length {requested} (available: {available})")]
    InvalidLength {
        /// Length the caller asked for.
        requested: usize,
        /// Bytes actually available for the requested fork direction.
        available: usize,
    },

    /// Listener queried for its address before a successful bind.
    #[error("Listener is not bound")]
    NotBound,

    /// Listener operation attempted after shutdown.
    #[error("Listener is shut down")]
    ListenerShutdown,

    /// Dialog type was never registered: protocol bug or version mismatch.
    #[error("Unknown dialog type: {0}")]
    UnknownDialogType(u16),

    /// Dialog type was registered once but is no longer active.
    #[error("Dialog type {0} is no longer active")]
    DialogTypeInactive(u16),

    /// Default call timeout must be positive.
    #[error("Default timeout must be positive")]
    InvalidTimeout,

    /// A remote call exceeded its deadline.
    #[error("Dialog call timed out")]
    DialogTimeout,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using MeshwireError.
pub type Result<T> = std::result::Result<T, MeshwireError>;
