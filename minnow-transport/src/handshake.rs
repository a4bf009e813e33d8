//! Join handshake performed right after the physical connect.
//!
//! The node announces its id and the serializers it speaks; the proxy answers
//! with its own runtime id and the serializer chosen for the session. Both
//! messages are JSON, framed like every other message.

use serde::{Deserialize, Serialize};

/// Serializer used for every message after the handshake.
pub const SERIALIZER: &str = "msgpack";

/// Command name of the join request.
pub const JOIN_REQUEST: &str = "JOIN_REQUEST";
/// Command name of the join reply.
pub const JOIN_REPLY: &str = "JOIN_REPLY";

/// First message sent by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Always [`JOIN_REQUEST`].
    pub cmd: String,
    /// Node runtime id.
    pub id: String,
    /// Session id.
    pub sid: String,
    /// Serializers offered by the node.
    pub serializers: Vec<String>,
}

impl JoinRequest {
    /// Join request offering [`SERIALIZER`].
    pub fn new(node_id: &str, sid: &str) -> Self {
        Self {
            cmd: JOIN_REQUEST.to_string(),
            id: node_id.to_string(),
            sid: sid.to_string(),
            serializers: vec![SERIALIZER.to_string()],
        }
    }
}

/// Proxy answer to a [`JoinRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReply {
    /// Always [`JOIN_REPLY`].
    pub cmd: String,
    /// Proxy runtime id.
    pub id: String,
    /// Serializer selected by the proxy.
    pub serializer: String,
    /// Session id echoed back.
    #[serde(default)]
    pub sid: Option<String>,
}

impl JoinReply {
    /// Accepting reply from proxy `proxy_id`.
    pub fn accept(proxy_id: &str, sid: &str) -> Self {
        Self {
            cmd: JOIN_REPLY.to_string(),
            id: proxy_id.to_string(),
            serializer: SERIALIZER.to_string(),
            sid: Some(sid.to_string()),
        }
    }
}
