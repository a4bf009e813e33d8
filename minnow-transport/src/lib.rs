//! # minnow-transport
//!
//! The physical link between a minnow node and its proxy runtime.
//!
//! A node keeps exactly one connection open. Every logical conversation
//! (links, tunnels, token streams) is multiplexed on top of it by the runtime,
//! so this crate only deals with:
//!
//! - [`wire`]: 4-byte big-endian length-prefixed frames
//! - [`NetworkProvider`]: how the byte stream is opened (Tokio TCP or an
//!   in-memory pipe for tests)
//! - [`TransportClient`]: connect with join handshake, send, receive,
//!   disconnect
//! - [`ProxyUri`]: `calvinip://host:port` addresses

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod client;
mod config;
mod error;
pub mod handshake;
mod network;
mod uri;
pub mod wire;

pub use client::TransportClient;
pub use config::TransportConfig;
pub use error::{TransportError, TransportResult};
pub use handshake::{JoinReply, JoinRequest};
pub use network::{MemoryListener, MemoryNetworkProvider, NetworkProvider, TokioNetworkProvider};
pub use uri::ProxyUri;
pub use wire::{FrameDecoder, WireError};
