//! Error types for compositor IPC operations

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when communicating with the compositor
#[derive(Debug, Error)]
pub enum CompositorError {
    /// None of the known compositor socket variables are set
    #[error("No compositor socket found (checked {checked}) - is a supported compositor running?")]
    NoBackendDetected { checked: String },

    /// The socket environment variable of a pinned backend is not set
    #[error("{var} environment variable not set - is the compositor running?")]
    SocketNotSet { var: &'static str },

    /// The socket path does not exist
    #[error("Compositor socket not found at {path}")]
    SocketNotFound { path: PathBuf },

    /// Failed to connect to the compositor socket
    #[error("Failed to connect to compositor socket at {path}: {source}")]
    ConnectionFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to send a request to the compositor
    #[error("Failed to send request to compositor: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Failed to receive a message from the compositor
    #[error("Failed to receive message from compositor: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Failed to serialize a request to JSON
    #[error("Failed to serialize request: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// Failed to deserialize a message from JSON
    #[error("Failed to deserialize compositor message: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// The compositor sent a frame header we cannot make sense of
    #[error("Malformed frame from compositor: {message}")]
    MalformedFrame { message: String },

    /// The compositor answered with an error
    #[error("Compositor returned error: {message}")]
    Compositor { message: String },

    /// The compositor answered with a reply of the wrong shape
    #[error("Unexpected reply to {request}")]
    UnexpectedReply { request: &'static str },

    /// The backend has no equivalent of the requested operation
    #[error("{backend} does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// The request cannot be expressed in the backend's model
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Connection was closed by the compositor
    #[error("Connection to compositor closed unexpectedly")]
    ConnectionClosed,

    /// An operation was attempted while no connection is established
    #[error("Not connected to the compositor")]
    NotConnected,
}

impl CompositorError {
    /// Whether this error means the compositor link is severed
    ///
    /// Transport errors put the facade into the disconnected state. The
    /// remaining variants are per-request failures on a healthy link.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::SendFailed(_)
                | Self::ReceiveFailed(_)
                | Self::ConnectionClosed
                | Self::ConnectionFailed { .. }
                | Self::MalformedFrame { .. }
                | Self::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let broken = CompositorError::SendFailed(std::io::Error::from(
            std::io::ErrorKind::BrokenPipe,
        ));
        assert!(broken.is_transport());
        assert!(CompositorError::ConnectionClosed.is_transport());

        let refused = CompositorError::Compositor {
            message: "no such view".to_string(),
        };
        assert!(!refused.is_transport());
        assert!(!CompositorError::UnexpectedReply { request: "Windows" }.is_transport());

        let unsupported = CompositorError::Unsupported {
            backend: "niri",
            operation: "set_view_minimized",
        };
        assert!(!unsupported.is_transport());
        assert_eq!(unsupported.to_string(), "niri does not support set_view_minimized");
    }

    #[test]
    fn test_error_messages_name_the_socket() {
        let err = CompositorError::SocketNotSet { var: "SWAYSOCK" };
        assert!(err.to_string().contains("SWAYSOCK"));

        let err = CompositorError::SocketNotFound {
            path: PathBuf::from("/run/user/1000/wayfire.sock"),
        };
        assert!(err.to_string().contains("/run/user/1000/wayfire.sock"));
    }
}
