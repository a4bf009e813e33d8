//! Correlation of outbound requests with their replies.
//!
//! Every request that expects a reply is registered under its `msg_uuid`
//! together with a [`PendingKind`] naming the continuation and the context it
//! needs. The table is bounded: a full table refuses the request instead of
//! evicting, so callers see it as backpressure and retry on a later tick.

use minnow_core::{BoundedTable, CapacityError};

use crate::tunnel::TunnelKind;

/// Continuation of an outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKind {
    /// `PROXY_CONFIG` sent while starting.
    ProxyConfig,
    /// `ROUTE_REQUEST` for a link.
    RouteRequest {
        /// Peer the link leads to.
        peer_id: String,
    },
    /// `TUNNEL_NEW` for a tunnel we initiated.
    TunnelNew {
        /// Peer of the tunnel.
        peer_id: String,
        /// Storage or token.
        kind: TunnelKind,
    },
    /// `TUNNEL_DESTROY` for an idle tunnel.
    TunnelDestroy {
        /// Tunnel being torn down.
        tunnel_id: String,
    },
    /// `PORT_CONNECT` for a remote port.
    PortConnect {
        /// Owning actor.
        actor_id: String,
        /// Connecting port.
        port_id: String,
    },
    /// `PORT_DISCONNECT` for a remote port.
    PortDisconnect {
        /// Disconnected port.
        port_id: String,
    },
    /// `GET port-<peer>` to learn where a peer port lives.
    PortLookup {
        /// Owning actor.
        actor_id: String,
        /// Port whose peer is looked up.
        port_id: String,
    },
    /// `ACTOR_NEW` carrying a migrating actor.
    ActorNew {
        /// Migrating actor.
        actor_id: String,
    },
    /// Registry `SET`.
    StorageSet {
        /// Registry key written.
        key: String,
    },
}

impl PendingKind {
    /// Whether the request holds a reference on the storage tunnel.
    pub fn uses_storage(&self) -> bool {
        matches!(self, PendingKind::PortLookup { .. } | PendingKind::StorageSet { .. })
    }
}

/// Outstanding requests keyed by `msg_uuid`.
#[derive(Debug)]
pub struct PendingTable {
    entries: BoundedTable<String, PendingKind>,
}

impl PendingTable {
    /// Empty table holding at most `capacity` requests.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BoundedTable::new(capacity),
        }
    }

    /// Whether another request can be registered.
    pub fn has_room(&self) -> bool {
        self.entries.has_room()
    }

    /// Register a request.
    pub fn add(&mut self, msg_uuid: String, kind: PendingKind) -> Result<(), CapacityError> {
        tracing::trace!(msg_uuid = %msg_uuid, ?kind, "pending added");
        self.entries.insert(msg_uuid, kind)
    }

    /// Continuation of `msg_uuid`.
    pub fn get(&self, msg_uuid: &str) -> Option<&PendingKind> {
        self.entries.get(msg_uuid)
    }

    /// Remove `msg_uuid`, returning its continuation.
    pub fn remove(&mut self, msg_uuid: &str) -> Option<PendingKind> {
        self.entries.remove(msg_uuid)
    }

    /// Continuations still outstanding.
    pub fn kinds(&self) -> impl Iterator<Item = &PendingKind> {
        self.entries.values()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every outstanding request.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!(count = self.entries.len(), "discarding pending messages");
        }
        self.entries.clear();
    }
}
