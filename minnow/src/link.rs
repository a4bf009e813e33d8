//! Links: logical connections to one peer runtime.
//!
//! No socket is opened per link; every link rides on the single proxy
//! connection. A link to a runtime other than the proxy is established with a
//! `ROUTE_REQUEST` asking the proxy to relay for that peer.

use serde::{Deserialize, Serialize};

/// State of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// `ROUTE_REQUEST` sent, waiting for the reply.
    Pending,
    /// Traffic may flow.
    Enabled,
    /// The proxy refused to route; terminal until the link is recreated.
    ConnectFailed,
    /// `ROUTE_REQUEST` to be sent on the next transmit pass.
    DoConnect,
}

/// Logical connection to a peer runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    peer_id: String,
    state: LinkState,
    is_proxy: bool,
}

impl Link {
    /// Link to the proxy itself; usable immediately.
    pub fn proxy(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            state: LinkState::Enabled,
            is_proxy: true,
        }
    }

    /// Link to another runtime, routed through the proxy.
    pub fn routed(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            state: LinkState::DoConnect,
            is_proxy: false,
        }
    }

    /// Link created on behalf of a peer that already reached us.
    pub fn inbound(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            state: LinkState::Enabled,
            is_proxy: false,
        }
    }

    /// Peer runtime id.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Whether this is the link to the proxy.
    pub fn is_proxy(&self) -> bool {
        self.is_proxy
    }

    pub(crate) fn set_state(&mut self, state: LinkState) {
        if self.state == state {
            return;
        }
        match state {
            LinkState::Enabled => tracing::info!(peer = %self.peer_id, "link enabled"),
            LinkState::ConnectFailed => tracing::warn!(peer = %self.peer_id, "link failed"),
            _ => tracing::debug!(peer = %self.peer_id, from = ?self.state, to = ?state, "link state"),
        }
        self.state = state;
    }

    /// Revert an in-flight request so it is sent again.
    pub(crate) fn revert_pending(&mut self) {
        if self.state == LinkState::Pending {
            self.set_state(LinkState::DoConnect);
        }
    }
}
