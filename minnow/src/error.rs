//! Error types for the minnow runtime.

use minnow_core::{CapacityError, CodecError, FifoError, TokenError};
use minnow_transport::TransportError;
use thiserror::Error;

/// Errors related to port construction and connection.
#[derive(Debug, Error)]
pub enum PortError {
    /// Port descriptor is malformed.
    #[error("Invalid port descriptor: {0}")]
    Descriptor(String),

    /// Routing other than `default` or `fanout`.
    #[error("Unsupported routing '{0}'")]
    UnsupportedRouting(String),

    /// Ports connect to exactly one peer.
    #[error("Unsupported number of peers: {0}")]
    PeerCount(u64),

    /// Queue state could not be restored.
    #[error("Queue error: {0}")]
    Fifo(#[from] FifoError),

    /// Field access failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors related to actor construction and lifecycle.
#[derive(Debug, Error)]
pub enum ActorError {
    /// No behavior registered under this type name.
    #[error("Unknown actor type '{0}'")]
    UnknownType(String),

    /// Actor descriptor is malformed.
    #[error("Invalid actor descriptor: {0}")]
    Descriptor(String),

    /// The type's init or set_state hook refused the attributes.
    #[error("Actor init failed: {0}")]
    InitFailed(String),

    /// A managed attribute is missing or has the wrong type.
    #[error("Invalid attribute '{0}'")]
    Attribute(String),

    /// An actor with the same id already exists, or the actor table is full.
    #[error("Actor table: {0}")]
    Capacity(#[from] CapacityError),

    /// Port construction failed.
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    /// Field access failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors raised while encoding or dispatching protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame could not be encoded or a field could not be decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The pending-message table is full.
    #[error("Pending table: {0}")]
    Pending(#[from] CapacityError),

    /// Token payload rejected.
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// The storage tunnel is not usable yet.
    #[error("Storage tunnel not enabled")]
    StorageUnavailable,

    /// The node has no joined proxy.
    #[error("No proxy")]
    NoProxy,
}

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Underlying I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] CodecError),
}

/// Errors in node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for [`NodeConfig`](crate::NodeConfig).
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A proxy URI is malformed.
    #[error("Invalid proxy URI: {0}")]
    Uri(#[from] TransportError),

    /// A value is out of range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level runtime errors.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Actor error.
    #[error(transparent)]
    Actor(#[from] ActorError),

    /// Protocol error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// State store error.
    #[error(transparent)]
    StateStore(#[from] StateStoreError),

    /// Transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
