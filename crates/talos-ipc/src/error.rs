//! Error types for the IPC surface.

use thiserror::Error;

/// Result type alias for IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;

/// Errors that can occur on the IPC surface.
#[derive(Error, Debug)]
pub enum IpcError {
    /// Socket or stream error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeded the protocol's size cap.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The peer closed the stream mid-frame.
    #[error("connection closed mid-frame")]
    Truncated,

    /// A frame body failed to decode.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The first request was not a valid authentication.
    #[error("authentication failed: {reason}")]
    Unauthenticated {
        /// Why the handshake was rejected.
        reason: String,
    },

    /// The requested operation needs a subscription that does not exist.
    #[error("service '{service}' is not subscribed to {subscription}")]
    NotSubscribed {
        /// Service name.
        service: String,
        /// Subscription kind.
        subscription: String,
    },
}
