//! The node: owner of every actor, link, tunnel and outstanding request.
//!
//! ```text
//!   DoStart ──PROXY_CONFIG──► Pending ──200──► Started
//!      ▲                        │                 │
//!      └──── error / disconnect ┴─────────────────┘        stop() ──► Stop
//! ```
//!
//! The node performs no I/O. Inbound frames are fed to [`Node::handle_frame`],
//! [`Node::tick`] fires actors and advances every link, tunnel and port state
//! machine, and encoded outbound frames accumulate in an outbox drained by the
//! scheduler. All state is owned here and mutated from a single task.

mod handlers;
pub mod pending;

use std::collections::VecDeque;

use minnow_core::{
    encode_value, gen_uuid, BoundedTable, CapacityError, Token, Value, MSG_PREFIX, TUNNEL_PREFIX,
};
use tokio::time::Instant;

pub use pending::{PendingKind, PendingTable};

use crate::actor::{Actor, ActorRegistry, Migration};
use crate::config::NodeConfig;
use crate::error::{ActorError, NodeError, ProtocolError};
use crate::link::{Link, LinkState};
use crate::persist::NodeSnapshot;
use crate::port::{PortDirection, PortState};
use crate::proto;
use crate::storage::{actor_key, node_key, port_key, ActorRecord, NodeRecord, PortRecord};
use crate::timer::Timers;
use crate::tunnel::{Tunnel, TunnelKind, TunnelState};

/// Top-level state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// `PROXY_CONFIG` to be sent.
    DoStart,
    /// Waiting for the proxy to accept the configuration.
    Pending,
    /// Actors run and connections are driven.
    Started,
    /// Terminal.
    Stop,
}

/// Aggregate runtime state of one constrained node.
pub struct Node {
    id: String,
    name: String,
    config: NodeConfig,
    state: NodeState,
    proxy_id: Option<String>,
    links: BoundedTable<String, Link>,
    tunnels: BoundedTable<String, Tunnel>,
    actors: BoundedTable<String, Actor>,
    pending: PendingTable,
    registry: ActorRegistry,
    timers: Timers,
    outbox: VecDeque<Vec<u8>>,
    unpublished: Vec<(String, Option<String>)>,
    dirty: bool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("proxy_id", &self.proxy_id)
            .field("links", &self.links.len())
            .field("tunnels", &self.tunnels.len())
            .field("actors", &self.actors.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Fresh node; the id comes from the config or is generated.
    pub fn new(config: NodeConfig, registry: ActorRegistry) -> Self {
        let id = config
            .node_id()
            .map(str::to_string)
            .unwrap_or_else(|| gen_uuid(""));
        let name = config.name().to_string();
        tracing::info!(node = %id, name = %name, "node created");
        Self {
            links: BoundedTable::new(config.max_links()),
            tunnels: BoundedTable::new(config.max_tunnels()),
            actors: BoundedTable::new(config.max_actors()),
            pending: PendingTable::new(config.max_pending_msgs()),
            id,
            name,
            config,
            state: NodeState::DoStart,
            proxy_id: None,
            registry,
            timers: Timers::new(),
            outbox: VecDeque::new(),
            unpublished: Vec::new(),
            dirty: false,
        }
    }

    /// Node resumed from a snapshot.
    ///
    /// Identity and actors are kept; actors come back disconnected. Links and
    /// tunnels are re-requested from the proxy before use, and restored
    /// tunnels nobody claims are torn down again.
    pub fn restore(
        config: NodeConfig,
        registry: ActorRegistry,
        snapshot: NodeSnapshot,
    ) -> Result<Self, NodeError> {
        let mut node = Node::new(config, registry);
        node.id = snapshot.id;
        node.name = snapshot.name;
        node.proxy_id = snapshot.proxy_id;

        for link in snapshot.links {
            if link.is_proxy() {
                continue;
            }
            let link = Link::routed(link.peer_id());
            node.links.insert(link.peer_id().to_string(), link).map_err(ActorError::from)?;
        }
        for tunnel in snapshot.tunnels {
            if tunnel.kind() != TunnelKind::Token {
                continue;
            }
            let mut tunnel = Tunnel::new(tunnel.id(), tunnel.peer_id(), TunnelKind::Token, TunnelState::DoConnect);
            tunnel.mark_idle();
            node.tunnels.insert(tunnel.id().to_string(), tunnel).map_err(ActorError::from)?;
        }
        for state in &snapshot.actors {
            let actor = Actor::from_state(state, &node.registry, node.config.queue_sizes())?;
            node.actors.insert(actor.id().to_string(), actor).map_err(ActorError::from)?;
        }
        tracing::info!(
            node = %node.id,
            actors = node.actors.len(),
            tunnels = node.tunnels.len(),
            "node restored"
        );
        Ok(node)
    }

    /// Runtime id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration the node was built with.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Proxy the node is (or was last) attached to.
    pub fn proxy_id(&self) -> Option<&str> {
        self.proxy_id.as_deref()
    }

    /// Hosted actor by id.
    pub fn actor(&self, actor_id: &str) -> Option<&Actor> {
        self.actors.get(actor_id)
    }

    /// Hosted actors.
    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.actors.values()
    }

    /// Link to `peer_id`.
    pub fn link(&self, peer_id: &str) -> Option<&Link> {
        self.links.get(peer_id)
    }

    /// All links.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Tunnel by id.
    pub fn tunnel(&self, tunnel_id: &str) -> Option<&Tunnel> {
        self.tunnels.get(tunnel_id)
    }

    /// All tunnels.
    pub fn tunnels(&self) -> impl Iterator<Item = &Tunnel> {
        self.tunnels.values()
    }

    /// The registry tunnel to the proxy.
    pub fn storage_tunnel(&self) -> Option<&Tunnel> {
        self.tunnels.values().find(|t| t.kind() == TunnelKind::Storage)
    }

    /// Token tunnel to `peer_id`.
    pub fn token_tunnel(&self, peer_id: &str) -> Option<&Tunnel> {
        self.tunnels
            .values()
            .find(|t| t.kind() == TunnelKind::Token && t.peer_id() == peer_id)
    }

    /// Outstanding correlated requests.
    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Earliest armed actor timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Whether encoded frames are waiting to be sent.
    pub fn has_outbound(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Take every encoded frame waiting to be sent, in order.
    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        self.outbox.drain(..).collect()
    }

    /// Whether durable state changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// The transport joined proxy `proxy_id`.
    ///
    /// A proxy other than the previous one invalidates every link, tunnel and
    /// request: actors are disconnected and everything else is dropped.
    pub fn on_connected(&mut self, proxy_id: &str) {
        if self.state == NodeState::Stop {
            return;
        }
        if let Some(previous) = self.proxy_id.as_deref() {
            if previous != proxy_id {
                tracing::info!(previous = %previous, proxy = %proxy_id, "proxy changed, resetting");
                self.soft_reset();
            }
        }
        self.proxy_id = Some(proxy_id.to_string());

        if self.links.get(proxy_id).is_some_and(Link::is_proxy) {
            if let Some(link) = self.links.get_mut(proxy_id) {
                link.set_state(LinkState::Enabled);
            }
        } else {
            self.links.remove(proxy_id);
            if let Err(e) = self.links.insert(proxy_id.to_string(), Link::proxy(proxy_id)) {
                tracing::error!(error = %e, "no room for proxy link");
            }
        }

        if self.storage_tunnel().is_none() {
            let mut tunnel = Tunnel::new(
                gen_uuid(TUNNEL_PREFIX),
                proxy_id,
                TunnelKind::Storage,
                TunnelState::DoConnect,
            );
            tunnel.add_ref();
            if let Err(e) = self.tunnels.insert(tunnel.id().to_string(), tunnel) {
                tracing::error!(error = %e, "no room for storage tunnel");
            }
        }

        self.state = NodeState::DoStart;
    }

    /// The transport connection dropped.
    ///
    /// In-flight requests are forgotten and everything that was waiting on
    /// one goes back to the state that sends it again.
    pub fn on_disconnected(&mut self) {
        tracing::info!(node = %self.id, pending = self.pending.len(), "disconnected from proxy");
        self.drop_pending();
        self.outbox.clear();
        for link in self.links.values_mut() {
            link.revert_pending();
        }
        for tunnel in self.tunnels.values_mut() {
            tunnel.revert_pending();
        }
        for actor in self.actors.values_mut() {
            if let Some(migration) = actor.migration_mut() {
                migration.sent = false;
            }
            for port in actor.ports_mut() {
                port.set_awaiting(None);
                if port.state() == PortState::Pending {
                    port.set_state(PortState::Disconnected);
                }
                port.fifo_mut().cancel_commit();
            }
        }
        if self.state != NodeState::Stop {
            self.state = NodeState::DoStart;
        }
    }

    /// Request a stop; the node keeps its state for a final snapshot.
    pub fn stop(&mut self) {
        if self.state != NodeState::Stop {
            tracing::info!(node = %self.id, "stopping");
            self.state = NodeState::Stop;
        }
    }

    /// Stop and delete everything, actors included.
    pub fn shutdown(&mut self) {
        self.stop();
        self.soft_reset();
        for actor in self.actors.values_mut() {
            actor.free();
        }
        self.actors.clear();
        self.timers.clear();
        self.proxy_id = None;
        self.dirty = true;
        tracing::info!(node = %self.id, "node shut down");
    }

    fn soft_reset(&mut self) {
        self.drop_pending();
        self.outbox.clear();
        self.unpublished.clear();
        self.links.clear();
        self.tunnels.clear();
        for actor in self.actors.values_mut() {
            actor.set_migration(None);
            for port in actor.ports_mut() {
                // Tunnels are gone; the reference is dropped with them.
                let _ = port.disconnect();
            }
            actor.refresh_enabled();
        }
        self.dirty = true;
    }

    /// Decode and dispatch one inbound frame.
    pub fn handle_frame(&mut self, payload: &[u8]) -> Result<(), NodeError> {
        let frame = minnow_core::decode_value(payload).map_err(ProtocolError::from)?;
        self.handle_message(&frame)?;
        self.dirty = true;
        Ok(())
    }

    /// One scheduler pass: fire every enabled actor once, then drive links,
    /// tunnels, ports and migrations. Returns whether any actor did work.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.state {
            NodeState::DoStart => {
                self.send_proxy_config();
                return false;
            }
            NodeState::Pending | NodeState::Stop => return false,
            NodeState::Started => {}
        }

        let mut fired = false;
        for actor in self.actors.values_mut() {
            fired |= actor.fire(&mut self.timers, now);
        }
        if fired {
            self.dirty = true;
        }
        self.transmit();
        fired
    }

    /// Host an actor described by `state` (the `ACTOR_NEW` payload format).
    pub fn create_actor(&mut self, state: &Value) -> Result<String, ActorError> {
        let actor = Actor::from_state(state, &self.registry, self.config.queue_sizes())?;
        let id = actor.id().to_string();
        if self.actors.contains_key(id.as_str()) {
            return Err(CapacityError::Duplicate(id).into());
        }
        self.actors.insert(id.clone(), actor)?;
        self.dirty = true;
        Ok(id)
    }

    /// Move `actor_id` to runtime `dest`.
    ///
    /// The actor stops firing and its ports are disconnected at once; the
    /// actor itself is sent when a link to `dest` is usable.
    pub fn migrate_actor(&mut self, actor_id: &str, dest: &str) -> Result<(), ActorError> {
        if !self.actors.contains_key(actor_id) {
            return Err(ActorError::Descriptor(format!("no actor '{}'", actor_id)));
        }
        tracing::info!(actor = %actor_id, dest = %dest, "migrating actor");
        self.disconnect_actor(actor_id);
        if let Some(actor) = self.actors.get_mut(actor_id) {
            actor.set_migration(Some(Migration {
                dest: dest.to_string(),
                sent: false,
            }));
            actor.refresh_enabled();
        }
        if self.proxy_id.as_deref() != Some(dest) {
            self.ensure_link(dest);
        }
        self.dirty = true;
        Ok(())
    }

    /// Delete `actor_id` and clear its registry keys.
    pub fn destroy_actor(&mut self, actor_id: &str) -> bool {
        let Some(actor) = self.actors.get(actor_id) else {
            return false;
        };
        let keys: Vec<String> = std::iter::once(actor_key(actor_id))
            .chain(actor.ports().map(|p| port_key(p.id())))
            .collect();
        self.disconnect_actor(actor_id);
        for key in keys {
            self.publish(key, None);
        }
        self.free_actor(actor_id);
        tracing::info!(actor = %actor_id, "actor destroyed");
        true
    }

    /// Snapshot of durable state.
    pub fn snapshot(&self) -> Result<NodeSnapshot, ActorError> {
        let mut actors = Vec::with_capacity(self.actors.len());
        for actor in self.actors.values() {
            actors.push(actor.serialize(&self.id)?);
        }
        Ok(NodeSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            proxy_id: self.proxy_id.clone(),
            links: self.links.values().filter(|l| !l.is_proxy()).cloned().collect(),
            tunnels: self
                .tunnels
                .values()
                .filter(|t| t.kind() == TunnelKind::Token)
                .cloned()
                .collect(),
            actors,
        })
    }

    // ---- outbound plumbing ----

    fn push_frame(&mut self, frame: &Value) -> Result<(), ProtocolError> {
        self.outbox.push_back(encode_value(frame)?);
        Ok(())
    }

    /// Queue a correlated request. Nothing is sent when the pending table is
    /// full.
    fn request(&mut self, msg_uuid: String, frame: &Value, kind: PendingKind) -> Result<(), ProtocolError> {
        let bytes = encode_value(frame)?;
        self.pending.add(msg_uuid, kind)?;
        self.outbox.push_back(bytes);
        Ok(())
    }

    fn send_proxy_config(&mut self) {
        let Some(proxy) = self.proxy_id.clone() else {
            return;
        };
        let msg_uuid = gen_uuid(MSG_PREFIX);
        let frame = proto::proxy_config(
            &msg_uuid,
            &self.id,
            &proxy,
            &self.name,
            self.config.vid(),
            self.config.pid(),
        );
        match self.request(msg_uuid, &frame, PendingKind::ProxyConfig) {
            Ok(()) => {
                tracing::debug!(proxy = %proxy, "PROXY_CONFIG sent");
                self.state = NodeState::Pending;
            }
            Err(e) => tracing::warn!(error = %e, "failed to send PROXY_CONFIG"),
        }
    }

    /// Queue a registry write; `None` removes the key.
    fn publish(&mut self, key: String, value: Option<String>) {
        match self.unpublished.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.unpublished.push((key, value)),
        }
    }

    fn storage_set(&mut self, key: &str, value: Option<&str>) -> Result<(), ProtocolError> {
        let tunnel_id = self.enabled_storage_tunnel()?;
        let proxy = self.proxy_id.clone().ok_or(ProtocolError::NoProxy)?;
        let msg_uuid = gen_uuid(MSG_PREFIX);
        let frame = proto::storage_set(&self.id, &proxy, &tunnel_id, &msg_uuid, key, value);
        self.request(msg_uuid, &frame, PendingKind::StorageSet { key: key.to_string() })?;
        self.retain_storage();
        Ok(())
    }

    fn storage_get(&mut self, key: &str, kind: PendingKind) -> Result<String, ProtocolError> {
        let tunnel_id = self.enabled_storage_tunnel()?;
        let proxy = self.proxy_id.clone().ok_or(ProtocolError::NoProxy)?;
        let msg_uuid = gen_uuid(MSG_PREFIX);
        let frame = proto::storage_get(&self.id, &proxy, &tunnel_id, &msg_uuid, key);
        self.request(msg_uuid.clone(), &frame, kind)?;
        self.retain_storage();
        Ok(msg_uuid)
    }

    fn enabled_storage_tunnel(&self) -> Result<String, ProtocolError> {
        match self.storage_tunnel() {
            Some(t) if t.is_enabled() => Ok(t.id().to_string()),
            _ => Err(ProtocolError::StorageUnavailable),
        }
    }

    fn retain_storage(&mut self) {
        if let Some(t) = self.tunnels.values_mut().find(|t| t.kind() == TunnelKind::Storage) {
            t.add_ref();
        }
    }

    fn release_storage(&mut self) {
        if let Some(t) = self.tunnels.values_mut().find(|t| t.kind() == TunnelKind::Storage) {
            t.remove_ref();
        }
    }

    /// Forget every in-flight request and give back the storage tunnel
    /// references held by registry operations.
    fn drop_pending(&mut self) {
        let storage_refs = self.pending.kinds().filter(|k| k.uses_storage()).count();
        for _ in 0..storage_refs {
            self.release_storage();
        }
        self.pending.clear();
    }

    // ---- links and tunnels ----

    fn ensure_link(&mut self, peer_id: &str) {
        if self.links.contains_key(peer_id) {
            return;
        }
        if let Err(e) = self.links.insert(peer_id.to_string(), Link::routed(peer_id)) {
            tracing::warn!(peer = %peer_id, error = %e, "cannot create link");
        }
    }

    /// Add a reference on the token tunnel to `peer_id`, creating it (and
    /// its link) when missing.
    fn acquire_token_tunnel(&mut self, peer_id: &str) -> Result<(), CapacityError> {
        if let Some(tunnel) = self
            .tunnels
            .values_mut()
            .find(|t| t.kind() == TunnelKind::Token && t.peer_id() == peer_id)
        {
            tunnel.add_ref();
            return Ok(());
        }
        if !self.tunnels.has_room() {
            return Err(CapacityError::Full {
                capacity: self.tunnels.capacity(),
            });
        }
        self.ensure_link(peer_id);
        let mut tunnel = Tunnel::new(gen_uuid(TUNNEL_PREFIX), peer_id, TunnelKind::Token, TunnelState::DoConnect);
        tunnel.add_ref();
        self.tunnels.insert(tunnel.id().to_string(), tunnel)
    }

    fn release_token_tunnel(&mut self, peer_id: &str) {
        if let Some(tunnel) = self
            .tunnels
            .values_mut()
            .find(|t| t.kind() == TunnelKind::Token && t.peer_id() == peer_id)
        {
            tunnel.remove_ref();
        }
    }

    fn rename_tunnel(&mut self, old: &str, new: &str) {
        if old == new {
            return;
        }
        if self.tunnels.contains_key(new) {
            tracing::warn!(from = %old, to = %new, "tunnel id already taken");
            return;
        }
        if let Some(mut tunnel) = self.tunnels.remove(old) {
            tunnel.set_id(new.to_string());
            // Removal freed the slot.
            let _ = self.tunnels.insert(new.to_string(), tunnel);
        }
    }

    /// Remove a tunnel and, when it was the last one over a routed link, the
    /// link too.
    fn free_tunnel(&mut self, tunnel_id: &str) {
        let Some(tunnel) = self.tunnels.remove(tunnel_id) else {
            return;
        };
        tracing::info!(tunnel = %tunnel_id, peer = %tunnel.peer_id(), "tunnel removed");
        let peer = tunnel.peer_id();
        let unused = !self.tunnels.values().any(|t| t.peer_id() == peer);
        let migrating_to = self
            .actors
            .values()
            .any(|a| a.migration().is_some_and(|m| m.dest == peer));
        if unused && !migrating_to && self.links.get(peer).is_some_and(|l| !l.is_proxy()) {
            self.links.remove(peer);
            tracing::debug!(peer = %peer, "link removed");
        }
    }

    // ---- actors and ports ----

    fn find_port_owner(&self, port_id: &str) -> Option<String> {
        self.actors
            .values()
            .find(|a| a.port(port_id).is_some())
            .map(|a| a.id().to_string())
    }

    /// Disconnect every port of an actor, telling remote peers.
    fn disconnect_actor(&mut self, actor_id: &str) {
        let Some(actor) = self.actors.get(actor_id) else {
            return;
        };
        let ports: Vec<(String, bool, bool, String)> = actor
            .ports()
            .map(|p| (p.id().to_string(), p.is_connected(), p.is_local(), p.peer_port_id().to_string()))
            .collect();

        for (port_id, connected, local, peer_port_id) in ports {
            if connected && !local {
                self.send_port_disconnect(actor_id, &port_id);
            }
            if local {
                if let Some(owner) = self.find_port_owner(&peer_port_id) {
                    let released = self
                        .actors
                        .get_mut(&owner)
                        .and_then(|a| a.port_mut(&peer_port_id))
                        .and_then(|p| p.disconnect());
                    if let Some(peer) = released {
                        self.release_token_tunnel(&peer);
                    }
                }
            }
            let released = self
                .actors
                .get_mut(actor_id)
                .and_then(|a| a.port_mut(&port_id))
                .and_then(|p| p.disconnect());
            if let Some(peer) = released {
                self.release_token_tunnel(&peer);
            }
        }
    }

    fn send_port_disconnect(&mut self, actor_id: &str, port_id: &str) {
        let Some(port) = self.actors.get(actor_id).and_then(|a| a.port(port_id)) else {
            return;
        };
        let Some(peer) = port.tunnel() else {
            return;
        };
        let Some(tunnel) = self.token_tunnel(peer) else {
            return;
        };
        let msg_uuid = gen_uuid(MSG_PREFIX);
        let frame = proto::port_disconnect(&msg_uuid, &self.id, peer, tunnel.id(), port);
        let kind = PendingKind::PortDisconnect {
            port_id: port_id.to_string(),
        };
        if let Err(e) = self.request(msg_uuid, &frame, kind) {
            tracing::warn!(port = %port_id, error = %e, "failed to send PORT_DISCONNECT");
        }
    }

    fn free_actor(&mut self, actor_id: &str) {
        if let Some(mut actor) = self.actors.remove(actor_id) {
            actor.free();
        }
        self.timers.cancel(actor_id);
        self.dirty = true;
    }

    // ---- transmit pass ----

    fn transmit(&mut self) {
        self.transmit_links();
        self.transmit_tunnels();
        self.transmit_ports();
        self.transmit_migrations();
        self.transmit_tokens();
        self.refresh_actors();
        self.flush_registry();
    }

    fn transmit_links(&mut self) {
        let Some(proxy) = self.proxy_id.clone() else {
            return;
        };
        let due: Vec<String> = self
            .links
            .values()
            .filter(|l| !l.is_proxy() && l.state() == LinkState::DoConnect)
            .map(|l| l.peer_id().to_string())
            .collect();
        for peer in due {
            let msg_uuid = gen_uuid(MSG_PREFIX);
            let frame = proto::route_request(&msg_uuid, &self.id, &proxy, &peer);
            match self.request(msg_uuid, &frame, PendingKind::RouteRequest { peer_id: peer.clone() }) {
                Ok(()) => {
                    if let Some(link) = self.links.get_mut(peer.as_str()) {
                        link.set_state(LinkState::Pending);
                    }
                }
                Err(e) => tracing::debug!(peer = %peer, error = %e, "ROUTE_REQUEST deferred"),
            }
        }
    }

    fn transmit_tunnels(&mut self) {
        let snapshot: Vec<(String, String, TunnelKind, TunnelState, bool, u32)> = self
            .tunnels
            .values()
            .map(|t| {
                (
                    t.id().to_string(),
                    t.peer_id().to_string(),
                    t.kind(),
                    t.state(),
                    t.should_disconnect(),
                    t.ref_count(),
                )
            })
            .collect();

        for (id, peer, kind, state, idle, refs) in snapshot {
            match state {
                TunnelState::DoConnect => {
                    let link_state = self.links.get(peer.as_str()).map(Link::state);
                    match link_state {
                        Some(LinkState::Enabled) => {
                            let msg_uuid = gen_uuid(MSG_PREFIX);
                            let frame = proto::tunnel_new(&msg_uuid, &self.id, &peer, &id, kind);
                            let pending = PendingKind::TunnelNew {
                                peer_id: peer.clone(),
                                kind,
                            };
                            match self.request(msg_uuid, &frame, pending) {
                                Ok(()) => self.set_tunnel_state(&id, TunnelState::Pending),
                                Err(e) => tracing::debug!(tunnel = %id, error = %e, "TUNNEL_NEW deferred"),
                            }
                        }
                        Some(LinkState::ConnectFailed) => self.set_tunnel_state(&id, TunnelState::ConnectFailed),
                        Some(_) => {}
                        None => self.ensure_link(&peer),
                    }
                }
                TunnelState::DoDisconnect => {
                    let msg_uuid = gen_uuid(MSG_PREFIX);
                    let frame = proto::tunnel_destroy(&msg_uuid, &self.id, &peer, &id);
                    let pending = PendingKind::TunnelDestroy { tunnel_id: id.clone() };
                    match self.request(msg_uuid, &frame, pending) {
                        Ok(()) => self.set_tunnel_state(&id, TunnelState::Pending),
                        Err(e) => tracing::debug!(tunnel = %id, error = %e, "TUNNEL_DESTROY deferred"),
                    }
                }
                TunnelState::Enabled if idle && kind == TunnelKind::Token => {
                    self.set_tunnel_state(&id, TunnelState::DoDisconnect);
                }
                TunnelState::ConnectFailed => {
                    if kind == TunnelKind::Storage {
                        self.set_tunnel_state(&id, TunnelState::DoConnect);
                    } else if refs == 0 {
                        self.free_tunnel(&id);
                    }
                }
                _ => {}
            }
        }
    }

    fn set_tunnel_state(&mut self, tunnel_id: &str, state: TunnelState) {
        if let Some(t) = self.tunnels.get_mut(tunnel_id) {
            t.set_state(state);
        }
    }

    fn transmit_ports(&mut self) {
        let due: Vec<(String, String)> = self
            .actors
            .values()
            .filter(|a| !a.is_migrating())
            .flat_map(|a| {
                a.ports()
                    .filter(|p| !p.is_connected() && p.awaiting().is_none())
                    .map(move |p| (a.id().to_string(), p.id().to_string()))
            })
            .collect();
        for (actor_id, port_id) in due {
            self.port_connect_step(&actor_id, &port_id);
        }
    }

    /// Advance the connection of one port by at most one step.
    fn port_connect_step(&mut self, actor_id: &str, port_id: &str) {
        let Some(port) = self.actors.get(actor_id).and_then(|a| a.port(port_id)) else {
            return;
        };
        if port.is_connected() || port.awaiting().is_some() {
            return;
        }
        let peer_port_id = port.peer_port_id().to_string();
        let peer_id = port.peer_id().map(str::to_string);
        let held = port.tunnel().map(str::to_string);
        let state = port.state();

        // Holding a tunnel reference: connect over it once it is usable.
        if let Some(tunnel_peer) = held {
            let tunnel = self.token_tunnel(&tunnel_peer).map(|t| (t.id().to_string(), t.state()));
            match tunnel {
                Some((tunnel_id, TunnelState::Enabled)) => {
                    self.send_port_connect(actor_id, port_id, &tunnel_peer, &tunnel_id);
                }
                Some((_, TunnelState::DoConnect | TunnelState::Pending)) => {}
                _ => {
                    let port = self.actors.get_mut(actor_id).and_then(|a| a.port_mut(port_id));
                    if let Some(port) = port {
                        port.take_tunnel();
                        port.set_peer_id(None);
                        port.set_state(PortState::Disconnected);
                    }
                    self.release_token_tunnel(&tunnel_peer);
                }
            }
            return;
        }

        // Peer port on this node.
        if let Some(owner) = self.find_port_owner(&peer_port_id) {
            self.connect_local(actor_id, port_id, &owner, &peer_port_id);
            return;
        }

        match peer_id {
            Some(peer) if peer != self.id => {
                if let Err(e) = self.acquire_token_tunnel(&peer) {
                    tracing::warn!(port = %port_id, peer = %peer, error = %e, "no token tunnel");
                    return;
                }
                if let Some(port) = self.actors.get_mut(actor_id).and_then(|a| a.port_mut(port_id)) {
                    port.set_tunnel(peer);
                    port.set_state(PortState::Pending);
                }
            }
            Some(_) => {
                // Registered here, but the peer port is gone.
                if let Some(port) = self.actors.get_mut(actor_id).and_then(|a| a.port_mut(port_id)) {
                    port.set_peer_id(None);
                    port.set_state(PortState::Disconnected);
                }
            }
            None if state == PortState::Disconnected => {
                let kind = PendingKind::PortLookup {
                    actor_id: actor_id.to_string(),
                    port_id: port_id.to_string(),
                };
                match self.storage_get(&port_key(&peer_port_id), kind) {
                    Ok(msg_uuid) => {
                        if let Some(port) = self.actors.get_mut(actor_id).and_then(|a| a.port_mut(port_id)) {
                            port.set_awaiting(Some(msg_uuid));
                            port.set_state(PortState::Pending);
                        }
                    }
                    Err(e) => tracing::trace!(port = %port_id, error = %e, "peer lookup deferred"),
                }
            }
            None => {}
        }
    }

    fn send_port_connect(&mut self, actor_id: &str, port_id: &str, peer: &str, tunnel_id: &str) {
        let Some(port) = self.actors.get(actor_id).and_then(|a| a.port(port_id)) else {
            return;
        };
        let msg_uuid = gen_uuid(MSG_PREFIX);
        let frame = proto::port_connect(&msg_uuid, &self.id, peer, tunnel_id, port);
        let kind = PendingKind::PortConnect {
            actor_id: actor_id.to_string(),
            port_id: port_id.to_string(),
        };
        match self.request(msg_uuid.clone(), &frame, kind) {
            Ok(()) => {
                if let Some(port) = self.actors.get_mut(actor_id).and_then(|a| a.port_mut(port_id)) {
                    port.set_awaiting(Some(msg_uuid));
                    port.set_state(PortState::Pending);
                }
            }
            Err(e) => tracing::debug!(port = %port_id, error = %e, "PORT_CONNECT deferred"),
        }
    }

    fn connect_local(&mut self, actor_id: &str, port_id: &str, peer_actor: &str, peer_port_id: &str) {
        let node_id = self.id.clone();
        let mut released = Vec::new();
        for (owner, id) in [(actor_id, port_id), (peer_actor, peer_port_id)] {
            if let Some(port) = self.actors.get_mut(owner).and_then(|a| a.port_mut(id)) {
                if let Some(peer) = port.take_tunnel() {
                    released.push(peer);
                }
                let newly = !port.is_connected();
                port.connect_local(&node_id);
                if newly {
                    self.publish_port(owner, id);
                }
            }
        }
        for peer in released {
            self.release_token_tunnel(&peer);
        }
        tracing::debug!(port = %port_id, peer_port = %peer_port_id, "connected locally");
    }

    fn publish_port(&mut self, actor_id: &str, port_id: &str) {
        let Some(port) = self.actors.get(actor_id).and_then(|a| a.port(port_id)) else {
            return;
        };
        match serde_json::to_string(&PortRecord::new(port, actor_id, &self.id)) {
            Ok(json) => self.publish(port_key(port_id), Some(json)),
            Err(e) => tracing::error!(port = %port_id, error = %e, "failed to encode port record"),
        }
    }

    fn transmit_migrations(&mut self) {
        let due: Vec<(String, String)> = self
            .actors
            .values()
            .filter_map(|a| {
                a.migration()
                    .filter(|m| !m.sent)
                    .map(|m| (a.id().to_string(), m.dest.clone()))
            })
            .collect();

        for (actor_id, dest) in due {
            let via_proxy = self.proxy_id.as_deref() == Some(dest.as_str());
            let link_state = self.links.get(dest.as_str()).map(Link::state);
            if !via_proxy {
                match link_state {
                    Some(LinkState::Enabled) => {}
                    Some(LinkState::ConnectFailed) => {
                        tracing::warn!(actor = %actor_id, dest = %dest, "migration aborted, no route");
                        if let Some(actor) = self.actors.get_mut(actor_id.as_str()) {
                            actor.set_migration(None);
                        }
                        continue;
                    }
                    Some(_) => continue,
                    None => {
                        self.ensure_link(&dest);
                        continue;
                    }
                }
            }

            let state = match self.actors.get(actor_id.as_str()).map(|a| a.serialize(&self.id)) {
                Some(Ok(state)) => state,
                Some(Err(e)) => {
                    tracing::error!(actor = %actor_id, error = %e, "failed to serialize actor");
                    if let Some(actor) = self.actors.get_mut(actor_id.as_str()) {
                        actor.set_migration(None);
                    }
                    continue;
                }
                None => continue,
            };
            let msg_uuid = gen_uuid(MSG_PREFIX);
            let frame = proto::actor_new(&msg_uuid, &self.id, &dest, state);
            let kind = PendingKind::ActorNew {
                actor_id: actor_id.clone(),
            };
            match self.request(msg_uuid, &frame, kind) {
                Ok(()) => {
                    if let Some(m) = self.actors.get_mut(actor_id.as_str()).and_then(|a| a.migration_mut()) {
                        m.sent = true;
                    }
                    tracing::debug!(actor = %actor_id, dest = %dest, "ACTOR_NEW sent");
                }
                Err(e) => tracing::debug!(actor = %actor_id, error = %e, "ACTOR_NEW deferred"),
            }
        }
    }

    fn transmit_tokens(&mut self) {
        let due: Vec<(String, String, bool)> = self
            .actors
            .values()
            .filter(|a| a.is_enabled())
            .flat_map(|a| {
                a.outports()
                    .iter()
                    .filter(|p| p.is_connected() && p.fifo().tokens_available(1))
                    .map(move |p| (a.id().to_string(), p.id().to_string(), p.is_local()))
            })
            .collect();
        for (actor_id, port_id, local) in due {
            if local {
                self.move_local_token(&actor_id, &port_id);
            } else {
                self.send_token(&actor_id, &port_id);
            }
        }
    }

    fn send_token(&mut self, actor_id: &str, port_id: &str) {
        let Some(peer) = self
            .actors
            .get(actor_id)
            .and_then(|a| a.port(port_id))
            .and_then(|p| p.tunnel())
            .map(str::to_string)
        else {
            return;
        };
        let Some(tunnel_id) = self
            .token_tunnel(&peer)
            .filter(|t| t.is_enabled())
            .map(|t| t.id().to_string())
        else {
            return;
        };
        let node_id = self.id.clone();
        let Some(port) = self.actors.get_mut(actor_id).and_then(|a| a.port_mut(port_id)) else {
            return;
        };
        let Some((seq, token)) = port.fifo_mut().com_peek() else {
            return;
        };
        let frame = proto::token(&node_id, &peer, &tunnel_id, port_id, port.peer_port_id(), seq, &token)
            .map_err(ProtocolError::from)
            .and_then(|frame| Ok(encode_value(&frame)?));
        match frame {
            Ok(bytes) => {
                tracing::trace!(port = %port_id, seq, "token sent");
                self.outbox.push_back(bytes);
            }
            Err(e) => {
                tracing::error!(port = %port_id, seq, error = %e, "failed to encode token");
                if let Err(e) = port.fifo_mut().com_cancel_read(seq) {
                    tracing::error!(port = %port_id, error = %e, "cancel failed");
                }
            }
        }
    }

    fn move_local_token(&mut self, actor_id: &str, port_id: &str) {
        let Some(port) = self.actors.get_mut(actor_id).and_then(|a| a.port_mut(port_id)) else {
            return;
        };
        let peer_port_id = port.peer_port_id().to_string();
        let Some((seq, token)) = port.fifo_mut().com_peek() else {
            return;
        };
        let written = self.write_local(&peer_port_id, token);
        let Some(port) = self.actors.get_mut(actor_id).and_then(|a| a.port_mut(port_id)) else {
            return;
        };
        let result = if written {
            port.fifo_mut().com_commit_read(seq)
        } else {
            port.fifo_mut().com_cancel_read(seq)
        };
        if let Err(e) = result {
            tracing::error!(port = %port_id, seq, error = %e, "local transfer out of sequence");
        }
    }

    fn write_local(&mut self, port_id: &str, token: Token) -> bool {
        let Some(owner) = self.find_port_owner(port_id) else {
            return false;
        };
        let Some(port) = self.actors.get_mut(&owner).and_then(|a| a.port_mut(port_id)) else {
            return false;
        };
        if port.direction() != PortDirection::In {
            return false;
        }
        port.fifo_mut().write(token).is_ok()
    }

    fn refresh_actors(&mut self) {
        let newly_enabled: Vec<String> = self
            .actors
            .values_mut()
            .filter_map(|a| (a.refresh_enabled() == Some(true)).then(|| a.id().to_string()))
            .collect();
        for actor_id in newly_enabled {
            let Some(actor) = self.actors.get(actor_id.as_str()) else {
                continue;
            };
            match serde_json::to_string(&ActorRecord::new(actor, &self.id)) {
                Ok(json) => self.publish(actor_key(&actor_id), Some(json)),
                Err(e) => tracing::error!(actor = %actor_id, error = %e, "failed to encode actor record"),
            }
        }
    }

    fn flush_registry(&mut self) {
        while !self.unpublished.is_empty() {
            if !self.pending.has_room() || self.enabled_storage_tunnel().is_err() {
                return;
            }
            let (key, value) = self.unpublished.remove(0);
            if let Err(e) = self.storage_set(&key, value.as_deref()) {
                tracing::debug!(key = %key, error = %e, "registry write deferred");
                self.unpublished.insert(0, (key, value));
                return;
            }
        }
    }

    fn on_started(&mut self) {
        let Some(proxy) = self.proxy_id.clone() else {
            return;
        };
        self.state = NodeState::Started;
        tracing::info!(node = %self.id, proxy = %proxy, "node started");
        let record = NodeRecord {
            name: self.name.clone(),
            node_id: self.id.clone(),
            proxy_id: proxy,
        };
        match serde_json::to_string(&record) {
            Ok(json) => self.publish(node_key(&self.id), Some(json)),
            Err(e) => tracing::error!(error = %e, "failed to encode node record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::tests::identity_state;
    use minnow_core::{decode_value, ValueExt};

    fn node() -> Node {
        let config = NodeConfig::builder()
            .node_id("rt-1")
            .max_pending_msgs(4)
            .build()
            .expect("config");
        Node::new(config, ActorRegistry::with_builtins())
    }

    fn outbound(node: &mut Node) -> Vec<Value> {
        node.take_outbox()
            .iter()
            .map(|b| decode_value(b).expect("frame"))
            .collect()
    }

    #[test]
    fn test_connect_creates_proxy_link_and_storage_tunnel() {
        let mut node = node();
        node.on_connected("proxy");
        assert_eq!(node.state(), NodeState::DoStart);
        assert!(node.link("proxy").expect("link").is_proxy());
        let storage = node.storage_tunnel().expect("storage");
        assert_eq!(storage.state(), TunnelState::DoConnect);
        assert_eq!(storage.ref_count(), 1);

        node.tick(Instant::now());
        assert_eq!(node.state(), NodeState::Pending);
        let frames = outbound(&mut node);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].get_str("cmd").expect("cmd"), proto::PROXY_CONFIG);
        assert_eq!(node.pending().len(), 1);
    }

    #[test]
    fn test_full_pending_table_defers_requests() {
        let mut node = node();
        for i in 0..4 {
            node.pending
                .add(format!("m{}", i), PendingKind::ProxyConfig)
                .expect("add");
        }
        node.on_connected("proxy");
        node.tick(Instant::now());
        assert_eq!(node.state(), NodeState::DoStart);
        assert!(!node.has_outbound());
    }

    #[test]
    fn test_disconnect_reverts_in_flight_requests() {
        let mut node = node();
        node.on_connected("proxy");
        node.tick(Instant::now());
        node.on_disconnected();
        assert!(node.pending().is_empty());
        assert!(!node.has_outbound());
        assert_eq!(node.state(), NodeState::DoStart);
    }

    #[test]
    fn test_create_actor_rejects_duplicate() {
        let mut node = node();
        let state = identity_state("a1", (Some("rt-2"), "src"), (Some("rt-2"), "dst"), true);
        assert_eq!(node.create_actor(&state).expect("create"), "a1");
        assert!(matches!(
            node.create_actor(&state),
            Err(ActorError::Capacity(CapacityError::Duplicate(_)))
        ));
        assert!(node.take_dirty());
        assert!(!node.take_dirty());
    }

    #[test]
    fn test_shutdown_deletes_actors() {
        let mut node = node();
        let state = identity_state("a1", (None, "src"), (None, "dst"), true);
        node.create_actor(&state).expect("create");
        node.on_connected("proxy");
        node.shutdown();
        assert_eq!(node.state(), NodeState::Stop);
        assert_eq!(node.actors().count(), 0);
        assert_eq!(node.tunnels().count(), 0);

        node.on_connected("proxy");
        assert_eq!(node.state(), NodeState::Stop);
    }
}
