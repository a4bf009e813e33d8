//! Tunnels: reference-counted logical channels over a link.
//!
//! ```text
//!   DoConnect ──TUNNEL_NEW──► Pending ──200──► Enabled ──refs hit 0──► DoDisconnect
//!                                │                                        │
//!                                └──error──► ConnectFailed     TUNNEL_DESTROY, freed on reply
//! ```
//!
//! A tunnel is never destroyed while it has references. Dropping the last
//! reference only marks it idle; the node's transmit pass moves an idle,
//! enabled tunnel to `DoDisconnect` on the following tick.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a tunnel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelKind {
    /// Registry `GET`/`SET` with the proxy.
    Storage,
    /// Tokens between ports.
    Token,
}

impl TunnelKind {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Storage => "storage",
            TunnelKind::Token => "token",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "storage" => Some(TunnelKind::Storage),
            "token" => Some(TunnelKind::Token),
            _ => None,
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelState {
    /// `TUNNEL_NEW` to be sent once the link is enabled.
    DoConnect,
    /// Request sent, waiting for the reply.
    Pending,
    /// Usable.
    Enabled,
    /// `TUNNEL_DESTROY` to be sent.
    DoDisconnect,
    /// Peer refused the tunnel.
    ConnectFailed,
}

/// Logical channel to a peer runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    id: String,
    peer_id: String,
    kind: TunnelKind,
    state: TunnelState,
    ref_count: u32,
    idle: bool,
}

impl Tunnel {
    /// New tunnel without references.
    pub fn new(id: impl Into<String>, peer_id: impl Into<String>, kind: TunnelKind, state: TunnelState) -> Self {
        let tunnel = Self {
            id: id.into(),
            peer_id: peer_id.into(),
            kind,
            state,
            ref_count: 0,
            idle: false,
        };
        tracing::debug!(tunnel = %tunnel.id, peer = %tunnel.peer_id, kind = %kind, state = ?state, "tunnel created");
        tunnel
    }

    /// Tunnel id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Peer runtime.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// What the tunnel carries.
    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    /// Current state.
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Number of consumers.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Whether the tunnel can carry traffic.
    pub fn is_enabled(&self) -> bool {
        self.state == TunnelState::Enabled
    }

    /// Register a consumer. A tunnel scheduled for teardown is kept.
    pub fn add_ref(&mut self) {
        self.ref_count += 1;
        self.idle = false;
        if self.state == TunnelState::DoDisconnect {
            self.set_state(TunnelState::Enabled);
        }
        tracing::trace!(tunnel = %self.id, refs = self.ref_count, "tunnel ref added");
    }

    /// Drop a consumer. Reaching zero only marks the tunnel idle.
    pub fn remove_ref(&mut self) {
        if self.ref_count == 0 {
            tracing::warn!(tunnel = %self.id, "tunnel ref released twice");
            return;
        }
        self.ref_count -= 1;
        if self.ref_count == 0 {
            self.idle = true;
        }
        tracing::trace!(tunnel = %self.id, refs = self.ref_count, "tunnel ref removed");
    }

    /// Whether the last consumer left an enabled tunnel.
    pub fn should_disconnect(&self) -> bool {
        self.state == TunnelState::Enabled && self.ref_count == 0 && self.idle
    }

    pub(crate) fn set_state(&mut self, state: TunnelState) {
        if self.state == state {
            return;
        }
        match state {
            TunnelState::Enabled => tracing::info!(tunnel = %self.id, peer = %self.peer_id, kind = %self.kind, "tunnel enabled"),
            TunnelState::ConnectFailed => tracing::warn!(tunnel = %self.id, peer = %self.peer_id, "tunnel failed"),
            _ => tracing::debug!(tunnel = %self.id, from = ?self.state, to = ?state, "tunnel state"),
        }
        self.state = state;
    }

    pub(crate) fn set_id(&mut self, id: String) {
        if self.id != id {
            tracing::debug!(from = %self.id, to = %id, "tunnel renamed");
            self.id = id;
        }
    }

    pub(crate) fn mark_idle(&mut self) {
        self.idle = self.ref_count == 0;
    }

    /// Revert an in-flight request so it is sent again.
    pub(crate) fn revert_pending(&mut self) {
        if self.state == TunnelState::Pending {
            let next = if self.ref_count == 0 && self.idle {
                TunnelState::DoDisconnect
            } else {
                TunnelState::DoConnect
            };
            self.set_state(next);
        }
    }
}
