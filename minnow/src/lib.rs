//! # minnow
//!
//! A dataflow actor runtime for constrained nodes. A minnow node hosts a
//! handful of actors and takes part in a larger actor system through one
//! connection to a full-featured *proxy* runtime:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  minnow (this crate)                                         │
//! │  • Scheduler: connect, tick, send, wait                      │
//! │  • Node: links, tunnels, actors, pending requests            │
//! │  • Ports: token FIFOs with sequence-gated delivery           │
//! │  • Registry publication and state persistence                │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │  minnow-transport            │  minnow-core                  │
//! │  • Proxy join handshake      │  • Token, Fifo                │
//! │  • Length-prefixed frames    │  • MessagePack/JSON codecs    │
//! │  • TCP / in-memory networks  │  • BoundedTable, ids          │
//! └──────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! ## Running a node
//!
//! ```ignore
//! use minnow::{ActorRegistry, Node, NodeConfig, Scheduler};
//! use minnow_transport::TokioNetworkProvider;
//!
//! let config = NodeConfig::builder()
//!     .name("sensor")
//!     .proxy_uri("calvinip://127.0.0.1:5000")
//!     .build()?;
//! let node = Node::new(config, ActorRegistry::with_builtins());
//! Scheduler::new(node, TokioNetworkProvider::new()).run().await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod actor;
pub mod config;
pub mod error;
pub mod link;
pub mod node;
pub mod persist;
pub mod port;
pub mod proto;
pub mod scheduler;
pub mod storage;
pub mod timer;
pub mod tunnel;

pub use actor::{Actor, ActorBehavior, ActorContext, ActorRegistry, InitMode, ManagedAttributes};
pub use config::{NodeConfig, NodeConfigBuilder};
pub use error::{ActorError, ConfigError, NodeError, PortError, ProtocolError, StateStoreError};
pub use link::{Link, LinkState};
pub use node::{Node, NodeState, PendingKind};
pub use persist::{FileStateStore, MemoryStateStore, NodeSnapshot, StateStore};
pub use port::{Port, PortDirection, PortState, QueueSizes};
pub use scheduler::{Scheduler, StopHandle};
pub use tunnel::{Tunnel, TunnelKind, TunnelState};
