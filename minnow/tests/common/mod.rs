//! Shared fixtures: actor descriptors, a scripted proxy and an in-process
//! world that shuttles encoded frames between nodes.

#![allow(dead_code)]

use std::collections::HashMap;

use minnow::proto::{self, TokenReply};
use minnow::{ActorRegistry, Node, NodeConfig};
use minnow_core::{decode_value, encode_value, map_of, str_or_nil, Value, ValueExt};
use tokio::time::Instant;

pub const PROXY: &str = "proxy-rt";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("minnow=debug")
        .with_test_writer()
        .try_init();
}

pub fn config(node_id: &str) -> NodeConfig {
    NodeConfig::builder()
        .node_id(node_id)
        .name(format!("{}-name", node_id))
        .proxy_uri("calvinip://proxy:5000")
        .build()
        .expect("config")
}

pub fn node(node_id: &str) -> Node {
    Node::new(config(node_id), ActorRegistry::with_builtins())
}

fn port_descriptor(id: &str, name: &str, direction: &str) -> Value {
    map_of([
        ("id", Value::from(id)),
        ("name", Value::from(name)),
        (
            "properties",
            map_of([
                ("direction", Value::from(direction)),
                ("routing", Value::from("default")),
                ("nbr_peers", Value::from(1u32)),
            ]),
        ),
    ])
}

fn peer(rt: Option<&str>, port: &str) -> Value {
    Value::Array(vec![Value::Array(vec![str_or_nil(rt), Value::from(port)])])
}

fn actor_state(
    type_name: &str,
    id: &str,
    managed: Value,
    inports: Vec<(&str, String, (Option<&str>, &str))>,
    outports: Vec<(&str, String, (Option<&str>, &str))>,
) -> Value {
    let descriptors = |ports: &[(&str, String, (Option<&str>, &str))], direction: &str| {
        Value::Map(
            ports
                .iter()
                .map(|(name, id, _)| (Value::from(*name), port_descriptor(id, name, direction)))
                .collect(),
        )
    };
    let prev = |ports: &[(&str, String, (Option<&str>, &str))]| {
        Value::Map(
            ports
                .iter()
                .map(|(_, id, (rt, port))| (Value::from(id.as_str()), peer(*rt, port)))
                .collect(),
        )
    };
    map_of([
        ("actor_type", Value::from(type_name)),
        (
            "prev_connections",
            map_of([("inports", prev(&inports)), ("outports", prev(&outports))]),
        ),
        (
            "actor_state",
            map_of([
                ("security", map_of([("_subject_attributes", Value::Nil)])),
                ("custom", Value::Map(Vec::new())),
                ("managed", managed),
                (
                    "private",
                    map_of([
                        ("_id", Value::from(id)),
                        ("_name", Value::from(format!("{}-name", id))),
                        ("inports", descriptors(&inports, "in")),
                        ("outports", descriptors(&outports, "out")),
                    ]),
                ),
            ]),
        ),
    ])
}

/// `std.Identity` with in-port `<id>-in` fed by `inpeer` and out-port
/// `<id>-out` feeding `outpeer`.
pub fn identity(id: &str, inpeer: (Option<&str>, &str), outpeer: (Option<&str>, &str)) -> Value {
    actor_state(
        "std.Identity",
        id,
        map_of([("_shadow_args", map_of([("dump", Value::from(false))]))]),
        vec![("token", format!("{}-in", id), inpeer)],
        vec![("token", format!("{}-out", id), outpeer)],
    )
}

/// `std.CountTimer` emitting `steps` tokens back to back on `<id>-out`.
pub fn counter(id: &str, steps: u32, outpeer: (Option<&str>, &str)) -> Value {
    actor_state(
        "std.CountTimer",
        id,
        map_of([(
            "_shadow_args",
            map_of([
                ("sleep", Value::from(0u32)),
                ("steps", Value::from(steps)),
            ]),
        )]),
        Vec::new(),
        vec![("integer", format!("{}-out", id), outpeer)],
    )
}

pub fn cmd_of(frame: &Value) -> &str {
    let cmd = frame.get_str("cmd").expect("cmd");
    if cmd == proto::TUNNEL_DATA {
        frame
            .get("value")
            .and_then(|v| v.opt_str("cmd"))
            .unwrap_or(cmd)
    } else {
        cmd
    }
}

fn tunnel_data(from: &str, to: &str, tunnel_id: &str, value: Value) -> Value {
    map_of([
        ("cmd", Value::from(proto::TUNNEL_DATA)),
        ("from_rt_uuid", Value::from(from)),
        ("to_rt_uuid", Value::from(to)),
        ("tunnel_id", Value::from(tunnel_id)),
        ("value", value),
    ])
}

/// Plays the proxy and every runtime not hosted in the test.
///
/// Requests are accepted unless their command is listed in `refuse`;
/// registry commands go to `registry`; tokens are acknowledged.
#[derive(Debug, Default)]
pub struct ProxyScript {
    pub registry: HashMap<String, String>,
    pub refuse: HashMap<String, u64>,
}

impl ProxyScript {
    pub fn answer(&mut self, frame: &Value) -> Option<Value> {
        let cmd = frame.get_str("cmd").expect("cmd");
        let from = frame.get_str("from_rt_uuid").expect("from");
        let to = frame.get_str("to_rt_uuid").expect("to");
        match cmd {
            proto::REPLY => None,
            proto::TUNNEL_DATA => {
                let tunnel_id = frame.get_str("tunnel_id").expect("tunnel_id");
                let value = frame.get_value("value").expect("value");
                match value.opt_str("cmd") {
                    Some(proto::SET) => {
                        let key = value.get_str("key").expect("key").to_string();
                        match value.opt_str("value") {
                            Some(v) => {
                                self.registry.insert(key.clone(), v.to_string());
                            }
                            None => {
                                self.registry.remove(&key);
                            }
                        }
                        let msg_uuid = value.get_str("msg_uuid").expect("msg_uuid");
                        let inner = map_of([
                            ("msg_uuid", Value::from(msg_uuid)),
                            ("key", Value::from(key)),
                            ("value", Value::from(true)),
                        ]);
                        Some(tunnel_data(to, from, tunnel_id, inner))
                    }
                    Some(proto::GET) => {
                        let key = value.get_str("key").expect("key");
                        let found = self.registry.get(key).map(String::as_str);
                        let status = if found.is_some() {
                            proto::STATUS_OK
                        } else {
                            proto::STATUS_NOT_FOUND
                        };
                        let msg_uuid = value.get_str("msg_uuid").expect("msg_uuid");
                        let inner = map_of([
                            ("msg_uuid", Value::from(msg_uuid)),
                            ("key", Value::from(key)),
                            ("value", str_or_nil(found)),
                            ("status", Value::from(status)),
                        ]);
                        Some(tunnel_data(to, from, tunnel_id, inner))
                    }
                    Some(proto::TOKEN) => Some(proto::token_reply(
                        to,
                        from,
                        tunnel_id,
                        value.get_str("peer_port_id").expect("peer_port_id"),
                        value.get_str("port_id").expect("port_id"),
                        value.get_u32("sequencenbr").expect("seq"),
                        TokenReply::Ack,
                    )),
                    _ => None,
                }
            }
            _ => {
                let msg_uuid = frame.opt_str("msg_uuid")?;
                let status = self.refuse.get(cmd).copied().unwrap_or(proto::STATUS_OK);
                let data = match cmd {
                    _ if status != proto::STATUS_OK => Value::Nil,
                    proto::TUNNEL_NEW => map_of([(
                        "tunnel_id",
                        Value::from(frame.get_str("tunnel_id").expect("tunnel_id")),
                    )]),
                    proto::PORT_CONNECT => map_of([(
                        "port_id",
                        Value::from(frame.get_str("peer_port_id").expect("peer_port_id")),
                    )]),
                    _ => Value::Nil,
                };
                Some(proto::reply(msg_uuid, to, from, status, data))
            }
        }
    }
}

/// Hosted nodes plus a [`ProxyScript`] for everyone else.
///
/// Frames between hosted nodes are delivered directly; every other frame is
/// recorded in `seen` and answered by the script.
pub struct World {
    pub nodes: Vec<Node>,
    pub proxy: ProxyScript,
    pub seen: Vec<Value>,
    /// Frames sent during [`World::tick_all`], not yet delivered.
    pub held: Vec<(usize, Vec<u8>)>,
}

impl World {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            proxy: ProxyScript::default(),
            seen: Vec::new(),
            held: Vec::new(),
        }
    }

    /// Join every node to the proxy.
    pub fn connect(&mut self) {
        for node in &mut self.nodes {
            node.on_connected(PROXY);
        }
    }

    pub fn node(&self, id: &str) -> &Node {
        self.nodes.iter().find(|n| n.id() == id).expect("hosted node")
    }

    pub fn node_mut(&mut self, id: &str) -> &mut Node {
        self.nodes.iter_mut().find(|n| n.id() == id).expect("hosted node")
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id() == id)
    }

    /// One tick of every node, delivering what it sent.
    pub fn step(&mut self) {
        for i in 0..self.nodes.len() {
            self.nodes[i].tick(Instant::now());
            self.flush(i);
        }
    }

    /// Tick every node, holding what they send so that frames cross.
    pub fn tick_all(&mut self) {
        for i in 0..self.nodes.len() {
            self.nodes[i].tick(Instant::now());
            for bytes in self.nodes[i].take_outbox() {
                self.held.push((i, bytes));
            }
        }
    }

    /// Route the frames held by [`World::tick_all`].
    pub fn deliver_held(&mut self) {
        for (i, bytes) in std::mem::take(&mut self.held) {
            self.route(i, &bytes);
        }
    }

    /// Deliver whatever any node has queued, without ticking.
    pub fn flush_all(&mut self) {
        for i in 0..self.nodes.len() {
            self.flush(i);
        }
    }

    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Step until `done` holds, at most `max` times.
    pub fn run_until(&mut self, max: usize, done: impl Fn(&World) -> bool) -> bool {
        for _ in 0..max {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Hand `frame` to node `id` and deliver whatever it answers.
    pub fn inject(&mut self, id: &str, frame: Value) {
        let i = self.index_of(id).expect("hosted node");
        let bytes = encode_value(&frame).expect("encode");
        self.nodes[i].handle_frame(&bytes).expect("handle frame");
        self.flush(i);
    }

    pub fn flush(&mut self, i: usize) {
        for bytes in self.nodes[i].take_outbox() {
            self.route(i, &bytes);
        }
    }

    fn route(&mut self, from: usize, bytes: &[u8]) {
        let frame = decode_value(bytes).expect("decode frame");
        let to = frame.get_str("to_rt_uuid").expect("to").to_string();
        if let Some(j) = self.index_of(&to) {
            self.nodes[j].handle_frame(bytes).expect("handle frame");
            return;
        }
        let answer = self.proxy.answer(&frame);
        self.seen.push(frame);
        if let Some(answer) = answer {
            let bytes = encode_value(&answer).expect("encode");
            self.nodes[from].handle_frame(&bytes).expect("handle answer");
        }
    }

    /// Recorded frames whose (inner) command is `cmd`.
    pub fn sent(&self, cmd: &str) -> Vec<&Value> {
        self.seen.iter().filter(|f| cmd_of(f) == cmd).collect()
    }

    /// Integer payloads of the tokens delivered to external port `port_id`.
    pub fn tokens_to(&self, port_id: &str) -> Vec<u64> {
        self.sent(proto::TOKEN)
            .into_iter()
            .filter_map(|f| f.get("value"))
            .filter(|v| v.opt_str("peer_port_id") == Some(port_id))
            .filter_map(|v| v.get("token")?.get("data")?.as_u64())
            .collect()
    }

    /// Replies recorded for requests sent to hosted nodes.
    pub fn replies(&self) -> Vec<(String, u64)> {
        self.sent(proto::REPLY)
            .into_iter()
            .filter_map(|f| {
                Some((
                    f.opt_str("msg_uuid")?.to_string(),
                    proto::reply_status(f)?,
                ))
            })
            .collect()
    }
}

/// A request as a remote runtime `from` would send it to `to`.
pub fn request(cmd: &str, msg_uuid: &str, from: &str, to: &str, fields: Vec<(&str, Value)>) -> Value {
    let mut entries = vec![
        ("cmd", Value::from(cmd)),
        ("msg_uuid", Value::from(msg_uuid)),
        ("from_rt_uuid", Value::from(from)),
        ("to_rt_uuid", Value::from(to)),
    ];
    entries.extend(fields);
    map_of(entries)
}

/// Status of the recorded reply to `msg_uuid`.
pub fn reply_status(world: &World, msg_uuid: &str) -> Option<u64> {
    world
        .replies()
        .into_iter()
        .find(|(id, _)| id == msg_uuid)
        .map(|(_, status)| status)
}
