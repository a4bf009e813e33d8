//! Actor ports.
//!
//! A port is one directional endpoint of an actor with exactly one peer
//! port, possibly on another runtime. It owns the token queue and tracks how
//! far its connection has progressed:
//!
//! ```text
//!   Disconnected ──lookup / tunnel / PORT_CONNECT──► Pending ──200──► Connected
//!        ▲                                              │                │
//!        └──────────── refused / disconnect ────────────┴────────────────┘
//! ```
//!
//! The state machine itself is driven by the node, which owns the tunnels;
//! this module holds the port data, its descriptor format and the transitions
//! that only touch the port.

use std::fmt;

use minnow_core::{map_of, str_or_nil, Fifo, Value, ValueExt};

use crate::error::PortError;

/// Direction of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    /// Tokens flow into the actor.
    In,
    /// Tokens flow out of the actor.
    Out,
}

impl PortDirection {
    /// Wire name (`"in"` / `"out"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            PortDirection::In => "in",
            PortDirection::Out => "out",
        }
    }
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Connection in progress.
    Pending,
    /// No usable connection.
    Disconnected,
    /// Tokens may flow.
    Connected,
}

/// Routing policies accepted on a single-peer port.
const ROUTINGS: [&str; 2] = ["default", "fanout"];

/// Queue sizes applied when ports are built from descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSizes {
    /// Size of a fresh queue when the descriptor carries none.
    pub default: u32,
    /// Largest size a descriptor may ask for.
    pub max: u32,
}

impl QueueSizes {
    /// Sizes with the given default and limit.
    pub fn new(default: u32, max: u32) -> Self {
        Self { default, max }
    }
}

/// One endpoint of an actor.
#[derive(Debug)]
pub struct Port {
    id: String,
    name: String,
    direction: PortDirection,
    routing: String,
    peer_id: Option<String>,
    peer_port_id: String,
    state: PortState,
    fifo: Fifo,
    tunnel: Option<String>,
    is_local: bool,
    awaiting: Option<String>,
}

impl Port {
    /// Build a port from its serialized descriptor.
    ///
    /// `prev_connections` is the direction's map of `port_id -> [[peer_rt,
    /// peer_port_id]]`. A queue description without a size falls back to an
    /// empty queue of `sizes.default` slots; one larger than `sizes.max` is
    /// refused.
    pub fn from_descriptor(
        desc: &Value,
        direction: PortDirection,
        prev_connections: &Value,
        sizes: QueueSizes,
    ) -> Result<Self, PortError> {
        let id = desc.get_str("id")?.to_string();
        let name = desc.get_str("name")?.to_string();

        let properties = desc.get_value("properties")?;
        let routing = properties.get_str("routing")?;
        if !ROUTINGS.contains(&routing) {
            return Err(PortError::UnsupportedRouting(routing.to_string()));
        }
        let nbr_peers = properties.get_uint("nbr_peers")?;
        if nbr_peers != 1 {
            return Err(PortError::PeerCount(nbr_peers));
        }

        let peers = prev_connections.get_array(&id)?;
        let [peer] = peers else {
            return Err(PortError::PeerCount(peers.len() as u64));
        };
        let (peer_id, peer_port_id) = match peer.as_array().map(Vec::as_slice) {
            Some([rt, port]) => (
                rt.as_str().map(str::to_string),
                port.as_str()
                    .ok_or_else(|| PortError::Descriptor(format!("port '{}' has no peer port id", id)))?
                    .to_string(),
            ),
            _ => {
                return Err(PortError::Descriptor(format!(
                    "port '{}' peer is not a [runtime, port] pair",
                    id
                )))
            }
        };

        let fifo = match desc.get("queue") {
            Some(queue) if queue.has_key("N") => Fifo::from_value(queue, sizes.max)?,
            _ => Fifo::new(sizes.default)?,
        };

        tracing::debug!(port = %id, name = %name, %direction, "created port");
        Ok(Self {
            id,
            name,
            direction,
            routing: routing.to_string(),
            peer_id,
            peer_port_id,
            state: PortState::Disconnected,
            fifo,
            tunnel: None,
            is_local: false,
            awaiting: None,
        })
    }

    /// Serialize the port descriptor, including queue contents.
    pub fn to_descriptor(&self) -> Result<Value, PortError> {
        // In-ports read their own queue; out-ports are read by the peer.
        let reader = match self.direction {
            PortDirection::In => &self.id,
            PortDirection::Out => &self.peer_port_id,
        };
        Ok(map_of([
            ("id", Value::from(self.id.as_str())),
            ("name", Value::from(self.name.as_str())),
            ("queue", self.fifo.to_value(reader)?),
            (
                "properties",
                map_of([
                    ("direction", Value::from(self.direction.as_str())),
                    ("routing", Value::from(self.routing.as_str())),
                    ("nbr_peers", Value::from(1u32)),
                ]),
            ),
        ]))
    }

    /// Serialize the `[[peer_rt, peer_port_id]]` entry for `prev_connections`.
    pub fn prev_connection(&self, node_id: &str) -> Value {
        let peer_rt = if self.is_local {
            Some(node_id)
        } else {
            self.peer_id.as_deref()
        };
        Value::Array(vec![Value::Array(vec![
            str_or_nil(peer_rt),
            Value::from(self.peer_port_id.as_str()),
        ])])
    }

    /// Port id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Port name, unique per actor and direction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direction.
    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    /// Runtime hosting the peer port, when known.
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// Id of the peer port.
    pub fn peer_port_id(&self) -> &str {
        &self.peer_port_id
    }

    /// Connection state.
    pub fn state(&self) -> PortState {
        self.state
    }

    /// Whether tokens may flow.
    pub fn is_connected(&self) -> bool {
        self.state == PortState::Connected
    }

    /// Whether the peer lives on this node.
    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// Peer runtime of the token tunnel this port holds a reference on.
    pub fn tunnel(&self) -> Option<&str> {
        self.tunnel.as_deref()
    }

    /// Message id of the outstanding request for this port.
    pub fn awaiting(&self) -> Option<&str> {
        self.awaiting.as_deref()
    }

    /// Token queue.
    pub fn fifo(&self) -> &Fifo {
        &self.fifo
    }

    /// Token queue, mutably.
    pub fn fifo_mut(&mut self) -> &mut Fifo {
        &mut self.fifo
    }

    pub(crate) fn set_state(&mut self, state: PortState) {
        if self.state != state {
            tracing::debug!(port = %self.id, from = ?self.state, to = ?state, "port state");
            self.state = state;
        }
    }

    pub(crate) fn set_peer_id(&mut self, peer_id: Option<String>) {
        self.peer_id = peer_id;
    }

    pub(crate) fn set_awaiting(&mut self, msg_uuid: Option<String>) {
        self.awaiting = msg_uuid;
    }

    /// Take the tunnel reference out of the port; the caller releases it.
    pub(crate) fn take_tunnel(&mut self) -> Option<String> {
        self.tunnel.take()
    }

    pub(crate) fn set_tunnel(&mut self, peer_id: String) {
        self.is_local = false;
        self.tunnel = Some(peer_id);
    }

    /// Connect to a peer port on this node.
    pub(crate) fn connect_local(&mut self, node_id: &str) {
        self.is_local = true;
        self.peer_id = Some(node_id.to_string());
        self.awaiting = None;
        self.set_state(PortState::Connected);
    }

    /// Drop the connection and roll back unacknowledged reads.
    ///
    /// Returns the tunnel reference the port held, for the caller to release.
    pub(crate) fn disconnect(&mut self) -> Option<String> {
        self.fifo.cancel_commit();
        self.is_local = false;
        self.awaiting = None;
        self.set_state(PortState::Disconnected);
        self.tunnel.take()
    }
}
