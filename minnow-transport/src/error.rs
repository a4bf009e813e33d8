//! Error types for transport operations.

use std::io;
use thiserror::Error;

use crate::wire::WireError;

/// Errors that can occur on the proxy connection.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The proxy URI could not be parsed.
    #[error("Invalid proxy URI '{0}'")]
    InvalidUri(String),

    /// Connection could not be established within the configured timeout.
    #[error("Connection timeout")]
    Timeout,

    /// The client is not connected.
    #[error("Transport is disconnected")]
    Disconnected,

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// The join handshake was refused or malformed.
    #[error("Join failed: {0}")]
    JoinFailed(String),

    /// Framing error on the byte stream.
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::Io(error.to_string())
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
