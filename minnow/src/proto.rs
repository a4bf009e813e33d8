//! Protocol frames exchanged with the proxy and peer runtimes.
//!
//! Every frame is a MessagePack map with `cmd`, `from_rt_uuid` and
//! `to_rt_uuid`; correlated requests add `msg_uuid`. Replies carry
//! `value: {status, data, success_list}`. Token and registry traffic is
//! wrapped in `TUNNEL_DATA` frames whose `value` holds the inner command.
//!
//! Builders here only shape values; the node decides when to send them and
//! registers the pending continuation.

use minnow_core::{map_of, str_or_nil, Token, TokenError, Value, ValueExt};

use crate::port::{Port, PortDirection};
use crate::tunnel::TunnelKind;

/// Reply to a correlated request.
pub const REPLY: &str = "REPLY";
/// Traffic carried inside a tunnel.
pub const TUNNEL_DATA: &str = "TUNNEL_DATA";
/// Node registration with the proxy.
pub const PROXY_CONFIG: &str = "PROXY_CONFIG";
/// Route to a peer runtime through the proxy.
pub const ROUTE_REQUEST: &str = "ROUTE_REQUEST";
/// Open a tunnel.
pub const TUNNEL_NEW: &str = "TUNNEL_NEW";
/// Close a tunnel.
pub const TUNNEL_DESTROY: &str = "TUNNEL_DESTROY";
/// Connect two ports.
pub const PORT_CONNECT: &str = "PORT_CONNECT";
/// Disconnect two ports.
pub const PORT_DISCONNECT: &str = "PORT_DISCONNECT";
/// Deploy an actor.
pub const ACTOR_NEW: &str = "ACTOR_NEW";
/// Move an actor elsewhere.
pub const ACTOR_MIGRATE: &str = "ACTOR_MIGRATE";
/// Delete the actors of an application.
pub const APP_DESTROY: &str = "APP_DESTROY";
/// Token on a port connection (inside `TUNNEL_DATA`).
pub const TOKEN: &str = "TOKEN";
/// Acknowledgement of a token (inside `TUNNEL_DATA`).
pub const TOKEN_REPLY: &str = "TOKEN_REPLY";
/// Registry write (inside `TUNNEL_DATA`).
pub const SET: &str = "SET";
/// Registry read (inside `TUNNEL_DATA`).
pub const GET: &str = "GET";

/// Success.
pub const STATUS_OK: u64 = 200;
/// Unknown target.
pub const STATUS_NOT_FOUND: u64 = 404;
/// Request failed.
pub const STATUS_INTERNAL_ERROR: u64 = 500;
/// Unsupported command or variant.
pub const STATUS_NOT_IMPLEMENTED: u64 = 501;

const SUCCESS_LIST: [u64; 7] = [200, 201, 202, 203, 204, 205, 206];
const PORT_PROPERTY_CAPABILITY: &str = "runtime.constrained.1";

/// Outcome of a token delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenReply {
    /// Written (or already written) at the receiver.
    Ack,
    /// Refused; the sender retries from this sequence number.
    Nack,
    /// Refused for good.
    Abort,
}

impl TokenReply {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenReply::Ack => "ACK",
            TokenReply::Nack => "NACK",
            TokenReply::Abort => "ABORT",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACK" => Some(TokenReply::Ack),
            "NACK" => Some(TokenReply::Nack),
            "ABORT" => Some(TokenReply::Abort),
            _ => None,
        }
    }
}

/// Status of a `REPLY` frame.
pub fn reply_status(frame: &Value) -> Option<u64> {
    frame.get("value")?.get("status")?.as_u64()
}

/// `data` of a `REPLY` frame, when it is not nil.
pub fn reply_data(frame: &Value) -> Option<&Value> {
    frame.get("value")?.get("data").filter(|d| !d.is_nil())
}

fn header<'a>(cmd: &'a str, from: &'a str, to: &'a str) -> Vec<(&'a str, Value)> {
    vec![
        ("cmd", Value::from(cmd)),
        ("from_rt_uuid", Value::from(from)),
        ("to_rt_uuid", Value::from(to)),
    ]
}

fn request<'a>(cmd: &'a str, msg_uuid: &'a str, from: &'a str, to: &'a str) -> Vec<(&'a str, Value)> {
    let mut entries = vec![("msg_uuid", Value::from(msg_uuid))];
    entries.extend(header(cmd, from, to));
    entries
}

fn port_properties(direction: PortDirection) -> Value {
    map_of([
        ("direction", Value::from(direction.as_str())),
        ("routing", Value::from("default")),
        ("nbr_peers", Value::from(1u32)),
    ])
}

/// `PROXY_CONFIG`: register with the proxy.
pub fn proxy_config(msg_uuid: &str, from: &str, to: &str, name: &str, vid: u32, pid: u32) -> Value {
    let mut entries = request(PROXY_CONFIG, msg_uuid, from, to);
    entries.extend([
        ("name", Value::from(name)),
        ("capabilities", Value::Array(Vec::new())),
        ("port_property_capability", Value::from(PORT_PROPERTY_CAPABILITY)),
        ("redeploy", Value::from(false)),
        ("vid", Value::from(vid)),
        ("pid", Value::from(pid)),
    ]);
    map_of(entries)
}

/// `ROUTE_REQUEST`: ask the proxy to route to `dest`.
pub fn route_request(msg_uuid: &str, from: &str, proxy: &str, dest: &str) -> Value {
    let mut entries = request(ROUTE_REQUEST, msg_uuid, from, proxy);
    entries.extend([
        ("dest_peer_id", Value::from(dest)),
        ("org_peer_id", Value::from(from)),
    ]);
    map_of(entries)
}

/// `TUNNEL_NEW`.
pub fn tunnel_new(msg_uuid: &str, from: &str, to: &str, tunnel_id: &str, kind: TunnelKind) -> Value {
    let mut entries = request(TUNNEL_NEW, msg_uuid, from, to);
    entries.extend([
        ("tunnel_id", Value::from(tunnel_id)),
        ("type", Value::from(kind.as_str())),
        ("policy", Value::Map(Vec::new())),
    ]);
    map_of(entries)
}

/// `TUNNEL_DESTROY`.
pub fn tunnel_destroy(msg_uuid: &str, from: &str, to: &str, tunnel_id: &str) -> Value {
    let mut entries = request(TUNNEL_DESTROY, msg_uuid, from, to);
    entries.push(("tunnel_id", Value::from(tunnel_id)));
    map_of(entries)
}

/// `REPLY` to `msg_uuid` with `status` and optional `data`.
pub fn reply(msg_uuid: &str, from: &str, to: &str, status: u64, data: Value) -> Value {
    map_of([
        ("msg_uuid", Value::from(msg_uuid)),
        ("to_rt_uuid", Value::from(to)),
        ("from_rt_uuid", Value::from(from)),
        ("cmd", Value::from(REPLY)),
        (
            "value",
            map_of([
                ("status", Value::from(status)),
                ("data", data),
                (
                    "success_list",
                    Value::Array(SUCCESS_LIST.iter().map(|s| Value::from(*s)).collect()),
                ),
            ]),
        ),
    ])
}

/// `PORT_CONNECT` for `port` over `tunnel_id`.
pub fn port_connect(msg_uuid: &str, from: &str, to: &str, tunnel_id: &str, port: &Port) -> Value {
    let mut entries = request(PORT_CONNECT, msg_uuid, from, to);
    entries.extend([
        ("tunnel_id", Value::from(tunnel_id)),
        ("peer_port_name", Value::Nil),
        ("peer_actor_id", Value::Nil),
        ("peer_port_id", Value::from(port.peer_port_id())),
        ("port_id", Value::from(port.id())),
        ("peer_port_properties", Value::Nil),
        ("port_properties", port_properties(port.direction())),
    ]);
    map_of(entries)
}

/// `PORT_DISCONNECT` for `port` over `tunnel_id`.
pub fn port_disconnect(msg_uuid: &str, from: &str, to: &str, tunnel_id: &str, port: &Port) -> Value {
    let mut entries = request(PORT_DISCONNECT, msg_uuid, from, to);
    entries.extend([
        ("tunnel_id", Value::from(tunnel_id)),
        ("peer_port_name", Value::Nil),
        ("peer_actor_id", Value::Nil),
        ("peer_port_id", Value::from(port.peer_port_id())),
        ("port_id", Value::from(port.id())),
        ("peer_port_dir", Value::Nil),
    ]);
    map_of(entries)
}

/// `ACTOR_NEW` carrying a serialized actor.
pub fn actor_new(msg_uuid: &str, from: &str, to: &str, state: Value) -> Value {
    let mut entries = request(ACTOR_NEW, msg_uuid, from, to);
    entries.push(("state", state));
    map_of(entries)
}

fn tunnel_data(from: &str, to: &str, tunnel_id: &str, value: Value) -> Value {
    let mut entries = header(TUNNEL_DATA, from, to);
    entries.extend([("tunnel_id", Value::from(tunnel_id)), ("value", value)]);
    map_of(entries)
}

/// `TOKEN` with sequence number `seq` from `port_id` to `peer_port_id`.
pub fn token(
    from: &str,
    to: &str,
    tunnel_id: &str,
    port_id: &str,
    peer_port_id: &str,
    seq: u32,
    token: &Token,
) -> Result<Value, TokenError> {
    let value = map_of([
        ("cmd", Value::from(TOKEN)),
        ("sequencenbr", Value::from(seq)),
        ("port_id", Value::from(port_id)),
        ("peer_port_id", Value::from(peer_port_id)),
        (
            "token",
            map_of([("type", Value::from("Token")), ("data", token.to_value()?)]),
        ),
    ]);
    Ok(tunnel_data(from, to, tunnel_id, value))
}

/// `TOKEN_REPLY` from the receiving `port_id` to the sending `peer_port_id`.
pub fn token_reply(
    from: &str,
    to: &str,
    tunnel_id: &str,
    port_id: &str,
    peer_port_id: &str,
    seq: u32,
    reply: TokenReply,
) -> Value {
    let value = map_of([
        ("cmd", Value::from(TOKEN_REPLY)),
        ("sequencenbr", Value::from(seq)),
        ("peer_port_id", Value::from(port_id)),
        ("port_id", Value::from(peer_port_id)),
        ("value", Value::from(reply.as_str())),
    ]);
    tunnel_data(from, to, tunnel_id, value)
}

/// Registry `SET`; `None` removes the key.
pub fn storage_set(from: &str, to: &str, tunnel_id: &str, msg_uuid: &str, key: &str, value: Option<&str>) -> Value {
    let inner = map_of([
        ("cmd", Value::from(SET)),
        ("key", Value::from(key)),
        ("value", str_or_nil(value)),
        ("msg_uuid", Value::from(msg_uuid)),
    ]);
    tunnel_data(from, to, tunnel_id, inner)
}

/// Registry `GET`.
pub fn storage_get(from: &str, to: &str, tunnel_id: &str, msg_uuid: &str, key: &str) -> Value {
    let inner = map_of([
        ("cmd", Value::from(GET)),
        ("key", Value::from(key)),
        ("msg_uuid", Value::from(msg_uuid)),
    ]);
    tunnel_data(from, to, tunnel_id, inner)
}

/// Whether a registry `SET` reply reports success.
pub fn storage_set_ok(frame: &Value) -> bool {
    let Some(value) = frame.get("value") else {
        return false;
    };
    if value.get("value").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    value.get("response").and_then(|r| r.get("status")).and_then(Value::as_u64) == Some(STATUS_OK)
}

/// Value of a registry `GET` reply, when present.
pub fn storage_get_value(frame: &Value) -> Option<&str> {
    let value = frame.get("value")?;
    if let Some(status) = value.get("status").and_then(Value::as_u64) {
        if status != STATUS_OK {
            return None;
        }
    }
    value.opt_str("value")
}
