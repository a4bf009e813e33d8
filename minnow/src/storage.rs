//! Registry records published through the storage tunnel.
//!
//! The proxy keeps a key/value registry shared by every runtime. Values are
//! JSON strings; keys are `node-<id>`, `actor-<id>` and `port-<id>`.

use serde::{Deserialize, Serialize};

use crate::actor::Actor;
use crate::port::Port;

/// Registry key of a node.
pub fn node_key(node_id: &str) -> String {
    format!("node-{}", node_id)
}

/// Registry key of an actor.
pub fn actor_key(actor_id: &str) -> String {
    format!("actor-{}", actor_id)
}

/// Registry key of a port.
pub fn port_key(port_id: &str) -> String {
    format!("port-{}", port_id)
}

/// `node-<id>` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node name.
    pub name: String,
    /// Runtime id.
    pub node_id: String,
    /// Proxy the node is attached to.
    pub proxy_id: String,
}

/// Port properties as published in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortProperties {
    /// `in` or `out`.
    pub direction: String,
    /// Routing policy.
    pub routing: String,
    /// Always 1.
    pub nbr_peers: u32,
}

/// `port-<id>` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    /// `[[peer_rt, peer_port]]`.
    pub peers: Vec<(Option<String>, String)>,
    /// Port properties.
    pub properties: PortProperties,
    /// Port name.
    pub name: String,
    /// Runtime hosting the port.
    pub node_id: String,
    /// Whether the port is connected.
    pub connected: bool,
    /// Owning actor.
    pub actor_id: String,
}

impl PortRecord {
    /// Record for `port` of `actor_id` hosted on `node_id`.
    pub fn new(port: &Port, actor_id: &str, node_id: &str) -> Self {
        let peer_rt = if port.is_local() {
            Some(node_id.to_string())
        } else {
            port.peer_id().map(str::to_string)
        };
        Self {
            peers: vec![(peer_rt, port.peer_port_id().to_string())],
            properties: PortProperties {
                direction: port.direction().as_str().to_string(),
                routing: "default".to_string(),
                nbr_peers: 1,
            },
            name: port.name().to_string(),
            node_id: node_id.to_string(),
            connected: port.is_connected(),
            actor_id: actor_id.to_string(),
        }
    }
}

/// Port reference inside an [`ActorRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRef {
    /// Port id.
    pub id: String,
    /// Port name.
    pub name: String,
}

/// `actor-<id>` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    /// Always false on this runtime.
    pub is_shadow: bool,
    /// Actor name.
    pub name: String,
    /// Runtime hosting the actor.
    pub node_id: String,
    /// Actor type.
    #[serde(rename = "type")]
    pub type_name: String,
    /// In-ports.
    pub inports: Vec<PortRef>,
    /// Out-ports.
    pub outports: Vec<PortRef>,
}

impl ActorRecord {
    /// Record for `actor` hosted on `node_id`.
    pub fn new(actor: &Actor, node_id: &str) -> Self {
        let refs = |ports: &[Port]| {
            ports
                .iter()
                .map(|p| PortRef {
                    id: p.id().to_string(),
                    name: p.name().to_string(),
                })
                .collect()
        };
        Self {
            is_shadow: false,
            name: actor.name().to_string(),
            node_id: node_id.to_string(),
            type_name: actor.type_name().to_string(),
            inports: refs(actor.inports()),
            outports: refs(actor.outports()),
        }
    }
}

/// Runtime id found in a `port-<id>` value.
///
/// Only `node_id` is required, so records published by other runtimes with
/// extra or missing fields still resolve.
pub fn port_node_id(json: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Lookup {
        node_id: Option<String>,
    }
    match serde_json::from_str::<Lookup>(json) {
        Ok(lookup) => lookup.node_id.filter(|id| !id.is_empty()),
        Err(e) => {
            tracing::warn!(error = %e, "unparsable port record");
            None
        }
    }
}
