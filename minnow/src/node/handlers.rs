//! Inbound dispatch: replies to our requests, token traffic and requests
//! from the proxy or peer runtimes.

use minnow_core::{encode_value, map_of, CodecError, FifoError, Token, Value, ValueExt};

use super::{Node, NodeState, PendingKind};
use crate::error::ProtocolError;
use crate::link::{Link, LinkState};
use crate::port::PortState;
use crate::proto::{self, TokenReply};
use crate::storage::port_node_id;
use crate::tunnel::{Tunnel, TunnelKind, TunnelState};

impl Node {
    pub(super) fn handle_message(&mut self, frame: &Value) -> Result<(), ProtocolError> {
        let cmd = frame.get_str("cmd")?;
        tracing::trace!(cmd = %cmd, "received");
        match cmd {
            proto::REPLY => {
                let msg_uuid = frame.get_str("msg_uuid")?;
                self.dispatch_reply(msg_uuid, frame);
                Ok(())
            }
            proto::TUNNEL_DATA => self.handle_tunnel_data(frame),
            _ => {
                let result = self.handle_request(cmd, frame);
                let (status, data) = match result {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::warn!(cmd = %cmd, error = %e, "request failed");
                        (proto::STATUS_INTERNAL_ERROR, Value::Nil)
                    }
                };
                self.send_reply(frame, status, data)
            }
        }
    }

    fn send_reply(&mut self, request: &Value, status: u64, data: Value) -> Result<(), ProtocolError> {
        let (Some(msg_uuid), Some(to)) = (request.opt_str("msg_uuid"), request.opt_str("from_rt_uuid")) else {
            tracing::debug!(status, "request without msg_uuid, no reply sent");
            return Ok(());
        };
        let frame = proto::reply(msg_uuid, &self.id, to, status, data);
        self.push_frame(&frame)
    }

    /// Run the continuation of `msg_uuid`, then forget it.
    fn dispatch_reply(&mut self, msg_uuid: &str, frame: &Value) {
        let Some(kind) = self.pending.get(msg_uuid).cloned() else {
            tracing::debug!(msg_uuid = %msg_uuid, "reply to unknown request");
            return;
        };
        self.on_reply(kind, frame);
        self.pending.remove(msg_uuid);
    }

    fn handle_tunnel_data(&mut self, frame: &Value) -> Result<(), ProtocolError> {
        let value = frame.get_value("value")?;
        if let Some(msg_uuid) = value.opt_str("msg_uuid") {
            if self.pending.get(msg_uuid).is_some() {
                self.dispatch_reply(msg_uuid, frame);
                return Ok(());
            }
        }
        match value.opt_str("cmd") {
            Some(proto::TOKEN) => self.on_token(frame, value),
            Some(proto::TOKEN_REPLY) => self.on_token_reply(value),
            other => {
                tracing::warn!(cmd = ?other, "unexpected tunnel data");
                Ok(())
            }
        }
    }

    fn handle_request(&mut self, cmd: &str, frame: &Value) -> Result<(u64, Value), ProtocolError> {
        match cmd {
            proto::ACTOR_NEW => Ok(self.on_actor_new(frame)),
            proto::ACTOR_MIGRATE => self.on_actor_migrate(frame),
            proto::APP_DESTROY => self.on_app_destroy(frame),
            proto::PORT_CONNECT => self.on_port_connect(frame),
            proto::PORT_DISCONNECT => self.on_port_disconnect(frame),
            proto::TUNNEL_NEW => self.on_tunnel_new(frame),
            proto::TUNNEL_DESTROY => self.on_tunnel_destroy(frame),
            proto::ROUTE_REQUEST => self.on_route_request(frame),
            _ => {
                tracing::warn!(cmd = %cmd, "unsupported command");
                Ok((proto::STATUS_NOT_IMPLEMENTED, Value::Nil))
            }
        }
    }

    // ---- continuations ----

    fn on_reply(&mut self, kind: PendingKind, frame: &Value) {
        let status = proto::reply_status(frame);
        let ok = status == Some(proto::STATUS_OK);
        match kind {
            PendingKind::ProxyConfig => {
                if self.state != NodeState::Pending {
                    return;
                }
                if ok {
                    self.on_started();
                } else {
                    tracing::warn!(?status, "proxy refused configuration");
                    self.state = NodeState::DoStart;
                }
            }
            PendingKind::RouteRequest { peer_id } => {
                if let Some(link) = self.links.get_mut(peer_id.as_str()) {
                    link.set_state(if ok { LinkState::Enabled } else { LinkState::ConnectFailed });
                }
            }
            PendingKind::TunnelNew { peer_id, kind } => {
                let Some(current) = self
                    .tunnels
                    .values()
                    .find(|t| t.kind() == kind && (kind == TunnelKind::Storage || t.peer_id() == peer_id))
                    .map(|t| t.id().to_string())
                else {
                    return;
                };
                let mut id = current.clone();
                if let Some(assigned) = proto::reply_data(frame).and_then(|d| d.opt_str("tunnel_id")) {
                    self.rename_tunnel(&current, assigned);
                    if self.tunnels.contains_key(assigned) {
                        id = assigned.to_string();
                    }
                }
                let state = if ok { TunnelState::Enabled } else { TunnelState::ConnectFailed };
                self.set_tunnel_state(&id, state);
            }
            PendingKind::TunnelDestroy { tunnel_id } => {
                let refs = self.tunnels.get(tunnel_id.as_str()).map(Tunnel::ref_count);
                match refs {
                    // Claimed again while the destroy was in flight.
                    Some(n) if n > 0 => self.set_tunnel_state(&tunnel_id, TunnelState::DoConnect),
                    Some(_) => {
                        if !ok {
                            tracing::warn!(tunnel = %tunnel_id, ?status, "peer refused tunnel teardown");
                        }
                        self.free_tunnel(&tunnel_id);
                    }
                    None => {}
                }
            }
            PendingKind::PortConnect { actor_id, port_id } => {
                let Some(port) = self.actors.get_mut(actor_id.as_str()).and_then(|a| a.port_mut(&port_id)) else {
                    return;
                };
                port.set_awaiting(None);
                if ok {
                    port.set_state(PortState::Connected);
                    tracing::debug!(port = %port_id, "port connected");
                    self.publish_port(&actor_id, &port_id);
                } else {
                    tracing::debug!(port = %port_id, ?status, "port connect refused");
                    let released = port.take_tunnel();
                    port.set_peer_id(None);
                    port.set_state(PortState::Disconnected);
                    if let Some(peer) = released {
                        self.release_token_tunnel(&peer);
                    }
                }
            }
            PendingKind::PortDisconnect { port_id } => {
                tracing::debug!(port = %port_id, ?status, "port disconnect acknowledged");
            }
            PendingKind::PortLookup { actor_id, port_id } => {
                self.release_storage();
                let node_id = proto::storage_get_value(frame).and_then(port_node_id);
                let Some(port) = self.actors.get_mut(actor_id.as_str()).and_then(|a| a.port_mut(&port_id)) else {
                    return;
                };
                port.set_awaiting(None);
                match node_id {
                    Some(peer) => {
                        tracing::debug!(port = %port_id, peer = %peer, "peer port located");
                        port.set_peer_id(Some(peer));
                    }
                    None => port.set_state(PortState::Disconnected),
                }
            }
            PendingKind::ActorNew { actor_id } => {
                if ok {
                    tracing::info!(actor = %actor_id, "actor migrated");
                    self.free_actor(&actor_id);
                } else {
                    tracing::warn!(actor = %actor_id, ?status, "migration refused");
                    if let Some(actor) = self.actors.get_mut(actor_id.as_str()) {
                        actor.set_migration(None);
                    }
                }
            }
            PendingKind::StorageSet { key } => {
                self.release_storage();
                if !proto::storage_set_ok(frame) {
                    tracing::warn!(key = %key, "registry write failed");
                }
            }
        }
    }

    // ---- tokens ----

    /// Every token that names its sending port and sequence number gets a
    /// reply. Without those the sender cannot match one, so the token is
    /// dropped as a protocol error.
    fn on_token(&mut self, frame: &Value, value: &Value) -> Result<(), ProtocolError> {
        let from = frame.get_str("from_rt_uuid")?;
        let tunnel_id = frame.get_str("tunnel_id")?;
        let (sender_port, seq) = match (value.get_str("port_id"), value.get_u32("sequencenbr")) {
            (Ok(port), Ok(seq)) => (port, seq),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(peer = %from, tunnel = %tunnel_id, error = %e, "unanswerable token dropped");
                return Err(e.into());
            }
        };

        let (port_id, reply) = match value.get_str("peer_port_id") {
            Ok(port_id) => (port_id, self.accept_token(port_id, seq, value.get("token"))),
            Err(e) => {
                tracing::warn!(peer = %from, sender = %sender_port, seq, error = %e, "token without destination port");
                ("", TokenReply::Nack)
            }
        };
        let frame = proto::token_reply(&self.id, from, tunnel_id, port_id, sender_port, seq, reply);
        self.push_frame(&frame)
    }

    fn accept_token(&mut self, port_id: &str, seq: u32, token: Option<&Value>) -> TokenReply {
        let limit = self.config.max_token_size();
        let Some(owner) = self.find_port_owner(port_id) else {
            tracing::debug!(port = %port_id, seq, "token for unknown port");
            return TokenReply::Nack;
        };
        let Some(actor) = self.actors.get_mut(owner.as_str()) else {
            return TokenReply::Nack;
        };
        if !actor.is_enabled() {
            tracing::debug!(port = %port_id, seq, "token for disabled actor");
            return TokenReply::Nack;
        }
        let token = match decode_token(token, limit) {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(port = %port_id, seq, error = %e, "rejected token");
                return TokenReply::Nack;
            }
        };
        let Some(port) = actor.port_mut(port_id) else {
            return TokenReply::Nack;
        };
        match port.fifo_mut().com_write(token, seq) {
            Ok(()) => TokenReply::Ack,
            Err(FifoError::Stale { .. }) => {
                tracing::debug!(port = %port_id, seq, "duplicate token");
                TokenReply::Ack
            }
            Err(e) => {
                tracing::debug!(port = %port_id, seq, error = %e, "token refused");
                TokenReply::Nack
            }
        }
    }

    fn on_token_reply(&mut self, value: &Value) -> Result<(), ProtocolError> {
        let port_id = value.get_str("port_id")?;
        let seq = value.get_u32("sequencenbr")?;
        let reply = value.get_str("value")?;

        let Some(owner) = self.find_port_owner(port_id) else {
            tracing::debug!(port = %port_id, seq, "token reply for unknown port");
            return Ok(());
        };
        let Some(port) = self.actors.get_mut(owner.as_str()).and_then(|a| a.port_mut(port_id)) else {
            return Ok(());
        };
        let result = match TokenReply::parse(reply) {
            Some(TokenReply::Ack) => port.fifo_mut().com_commit_read(seq),
            Some(TokenReply::Nack | TokenReply::Abort) => port.fifo_mut().com_cancel_read(seq),
            None => {
                tracing::warn!(port = %port_id, reply = %reply, "unknown token reply");
                return Ok(());
            }
        };
        if let Err(e) = result {
            tracing::error!(port = %port_id, seq, error = %e, "token reply out of sequence");
        }
        Ok(())
    }

    // ---- requests ----

    fn on_actor_new(&mut self, frame: &Value) -> (u64, Value) {
        let Some(state) = frame.get("state") else {
            return (proto::STATUS_INTERNAL_ERROR, Value::Nil);
        };
        match self.create_actor(state) {
            Ok(id) => {
                tracing::info!(actor = %id, "actor received");
                (proto::STATUS_OK, Value::Nil)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to create actor");
                (proto::STATUS_INTERNAL_ERROR, Value::Nil)
            }
        }
    }

    fn on_actor_migrate(&mut self, frame: &Value) -> Result<(u64, Value), ProtocolError> {
        let actor_id = frame.get_str("actor_id")?;
        let dest = frame
            .opt_str("dest_peer_id")
            .map_or_else(|| frame.get_str("from_rt_uuid"), Ok)?;
        match self.migrate_actor(actor_id, dest) {
            Ok(()) => Ok((proto::STATUS_OK, Value::Nil)),
            Err(e) => {
                tracing::warn!(actor = %actor_id, error = %e, "cannot migrate");
                Ok((proto::STATUS_NOT_FOUND, Value::Nil))
            }
        }
    }

    fn on_app_destroy(&mut self, frame: &Value) -> Result<(u64, Value), ProtocolError> {
        let ids: Vec<String> = frame
            .get_array("actor_uuids")?
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        for id in ids {
            if !self.destroy_actor(&id) {
                tracing::debug!(actor = %id, "not hosted here");
            }
        }
        Ok((proto::STATUS_OK, Value::Nil))
    }

    fn on_port_connect(&mut self, frame: &Value) -> Result<(u64, Value), ProtocolError> {
        let from = frame.get_str("from_rt_uuid")?;
        let tunnel_id = frame.get_str("tunnel_id")?;
        let port_id = frame.get_str("peer_port_id")?;

        let owner = self
            .find_port_owner(port_id)
            .filter(|owner| self.actors.get(owner.as_str()).is_some_and(|a| !a.is_migrating()));
        let Some(owner) = owner else {
            tracing::debug!(port = %port_id, "connect for unknown port");
            return Ok((proto::STATUS_NOT_FOUND, Value::Nil));
        };

        let known = self
            .tunnels
            .get(tunnel_id)
            .is_some_and(|t| t.kind() == TunnelKind::Token && t.peer_id() == from);
        if !known {
            if self.token_tunnel(from).is_none() {
                tracing::debug!(tunnel = %tunnel_id, "connect over unknown tunnel");
                return Ok((proto::STATUS_NOT_FOUND, Value::Nil));
            }
            tracing::debug!(tunnel = %tunnel_id, peer = %from, "connect over renamed tunnel");
        }

        let Some(port) = self.actors.get_mut(owner.as_str()).and_then(|a| a.port_mut(port_id)) else {
            return Ok((proto::STATUS_NOT_FOUND, Value::Nil));
        };
        let previous = port.tunnel().map(str::to_string);
        let newly = !port.is_connected();
        port.set_peer_id(Some(from.to_string()));
        port.set_tunnel(from.to_string());
        port.set_state(PortState::Connected);

        match previous.as_deref() {
            Some(peer) if peer == from => {}
            Some(other) => {
                self.release_token_tunnel(other);
                self.retain_token_tunnel(from);
            }
            None => self.retain_token_tunnel(from),
        }
        if newly {
            tracing::debug!(port = %port_id, peer = %from, "port connected by peer");
            self.publish_port(&owner, port_id);
        }
        Ok((proto::STATUS_OK, map_of([("port_id", Value::from(port_id))])))
    }

    fn retain_token_tunnel(&mut self, peer_id: &str) {
        if let Some(tunnel) = self
            .tunnels
            .values_mut()
            .find(|t| t.kind() == TunnelKind::Token && t.peer_id() == peer_id)
        {
            tunnel.add_ref();
        }
    }

    fn on_port_disconnect(&mut self, frame: &Value) -> Result<(u64, Value), ProtocolError> {
        let port_id = frame.get_str("peer_port_id")?;
        let Some(owner) = self.find_port_owner(port_id) else {
            return Ok((proto::STATUS_INTERNAL_ERROR, Value::Nil));
        };
        let released = self
            .actors
            .get_mut(owner.as_str())
            .and_then(|a| a.port_mut(port_id))
            .and_then(|p| p.disconnect());
        if let Some(peer) = released {
            self.release_token_tunnel(&peer);
        }
        tracing::debug!(port = %port_id, "port disconnected by peer");
        Ok((proto::STATUS_OK, map_of([("remaining_tokens", Value::Map(Vec::new()))])))
    }

    fn on_tunnel_new(&mut self, frame: &Value) -> Result<(u64, Value), ProtocolError> {
        let from = frame.get_str("from_rt_uuid")?;
        let remote_id = frame.get_str("tunnel_id")?;
        if TunnelKind::parse(frame.get_str("type")?) != Some(TunnelKind::Token) {
            return Ok((proto::STATUS_NOT_IMPLEMENTED, Value::Nil));
        }

        // The peer reached us, so a route exists.
        match self.links.get_mut(from) {
            Some(link) => link.set_state(LinkState::Enabled),
            None => {
                if let Err(e) = self.links.insert(from.to_string(), Link::inbound(from)) {
                    tracing::warn!(peer = %from, error = %e, "no room for link");
                    return Ok((proto::STATUS_INTERNAL_ERROR, Value::Nil));
                }
            }
        }

        let existing = self.token_tunnel(from).map(|t| (t.id().to_string(), t.state()));
        let id = match existing {
            Some((id, TunnelState::Enabled)) => id,
            Some((id, _)) => {
                let winner = if minnow_core::uuid_is_higher(remote_id, &id) {
                    remote_id.to_string()
                } else {
                    id.clone()
                };
                self.rename_tunnel(&id, &winner);
                self.set_tunnel_state(&winner, TunnelState::Enabled);
                winner
            }
            None => {
                let tunnel = Tunnel::new(remote_id, from, TunnelKind::Token, TunnelState::Enabled);
                if let Err(e) = self.tunnels.insert(remote_id.to_string(), tunnel) {
                    tracing::warn!(peer = %from, error = %e, "no room for tunnel");
                    return Ok((proto::STATUS_INTERNAL_ERROR, Value::Nil));
                }
                remote_id.to_string()
            }
        };
        Ok((proto::STATUS_OK, map_of([("tunnel_id", Value::from(id))])))
    }

    fn on_tunnel_destroy(&mut self, frame: &Value) -> Result<(u64, Value), ProtocolError> {
        let tunnel_id = frame.get_str("tunnel_id")?;
        let Some(peer) = self
            .tunnels
            .get(tunnel_id)
            .filter(|t| t.kind() == TunnelKind::Token)
            .map(|t| t.peer_id().to_string())
        else {
            return Ok((proto::STATUS_NOT_FOUND, Value::Nil));
        };
        for actor in self.actors.values_mut() {
            for port in actor.ports_mut() {
                if port.tunnel() == Some(peer.as_str()) {
                    // The tunnel goes away with its references.
                    let _ = port.disconnect();
                }
            }
        }
        self.free_tunnel(tunnel_id);
        Ok((proto::STATUS_OK, Value::Nil))
    }

    fn on_route_request(&mut self, frame: &Value) -> Result<(u64, Value), ProtocolError> {
        let dest = frame.get_str("dest_peer_id")?;
        if dest == self.id {
            Ok((proto::STATUS_OK, map_of([("peer_id", Value::from(self.id.as_str()))])))
        } else {
            Ok((proto::STATUS_NOT_FOUND, Value::Nil))
        }
    }
}

fn decode_token(token: Option<&Value>, limit: usize) -> Result<Token, ProtocolError> {
    let token = token.ok_or_else(|| CodecError::Field {
        key: "token".to_string(),
        expected: "map",
    })?;
    let data = token.get("data").unwrap_or(token);
    Ok(Token::with_limit(encode_value(data)?, limit)?)
}
