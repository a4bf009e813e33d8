//! End-to-end node behavior, driven by shuttling encoded frames between
//! nodes and a scripted proxy.

mod common;

use common::{counter, identity, node, reply_status, request, World, PROXY};
use minnow::proto::{self, TokenReply};
use minnow::{
    ActorRegistry, Link, LinkState, Node, NodeSnapshot, NodeState, PendingKind, PortState, Tunnel,
    TunnelKind, TunnelState,
};
use minnow_core::{encode_value, map_of, Fifo, Token, Value, ValueExt, QUEUE_TYPE};
use tokio::time::Instant;

fn enabled(world: &World, node_id: &str, actor_id: &str) -> bool {
    world
        .node(node_id)
        .actor(actor_id)
        .is_some_and(|a| a.is_enabled())
}

/// rt-1 hosting `a1`, connected to `src`/`dst` on rt-2.
fn running_identity() -> World {
    common::init_tracing();
    let mut n = node("rt-1");
    n.create_actor(&identity("a1", (Some("rt-2"), "src"), (Some("rt-2"), "dst")))
        .expect("create");
    let mut world = World::new(vec![n]);
    world.connect();
    assert!(world.run_until(20, |w| enabled(w, "rt-1", "a1")));
    // Registry writes for the actor go out on the next pass.
    world.run(2);
    world
}

fn token_frame(tunnel_id: &str, seq: u32, value: u64) -> Value {
    let token = Token::from_uint(value).expect("token");
    proto::token("rt-2", "rt-1", tunnel_id, "src", "a1-in", seq, &token).expect("frame")
}

/// Mutable access to `path` inside nested maps.
fn field_mut<'a>(value: &'a mut Value, path: &[&str]) -> &'a mut Value {
    path.iter().fold(value, |v, key| match v {
        Value::Map(entries) => entries
            .iter_mut()
            .find(|(k, _)| k.as_str() == Some(*key))
            .map(|(_, v)| v)
            .unwrap_or_else(|| panic!("no field {}", key)),
        _ => panic!("{} is not inside a map", key),
    })
}

fn set_field(value: &mut Value, path: &[&str], key: &str, field: Value) {
    if let Value::Map(entries) = field_mut(value, path) {
        entries.retain(|(k, _)| k.as_str() != Some(key));
        entries.push((Value::from(key), field));
    }
}

fn remove_field(value: &mut Value, path: &[&str], key: &str) {
    if let Value::Map(entries) = field_mut(value, path) {
        entries.retain(|(k, _)| k.as_str() != Some(key));
    }
}

fn storage_refs(node: &Node) -> u32 {
    node.storage_tunnel().expect("storage tunnel").ref_count()
}

fn storage_requests(node: &Node) -> u32 {
    node.pending().kinds().filter(|k| k.uses_storage()).count() as u32
}

fn last_token_reply(world: &World) -> TokenReply {
    let frame = world.sent(proto::TOKEN_REPLY).pop().expect("token reply");
    let value = frame.get_value("value").expect("value");
    TokenReply::parse(value.get_str("value").expect("reply")).expect("known reply")
}

#[test]
fn test_proxy_config_starts_node() {
    let mut world = World::new(vec![node("rt-1")]);
    world.connect();
    assert_eq!(world.node("rt-1").state(), NodeState::DoStart);

    world.step();
    let config = world.sent(proto::PROXY_CONFIG);
    assert_eq!(config.len(), 1);
    assert_eq!(config[0].get_str("name").expect("name"), "rt-1-name");
    assert_eq!(config[0].get_str("to_rt_uuid").expect("to"), PROXY);
    assert_eq!(world.node("rt-1").state(), NodeState::Started);

    // The node registers itself once the storage tunnel is up.
    world.run(3);
    let record = world.proxy.registry.get("node-rt-1").expect("node record");
    assert!(record.contains("\"rt-1-name\""));
    assert!(world.node("rt-1").storage_tunnel().expect("storage").is_enabled());
}

#[test]
fn test_refused_proxy_config_is_retried() {
    let mut world = World::new(vec![node("rt-1")]);
    world.proxy.refuse.insert(proto::PROXY_CONFIG.to_string(), 500);
    world.connect();
    world.step();
    assert_eq!(world.node("rt-1").state(), NodeState::DoStart);
    assert!(world.node("rt-1").pending().is_empty());

    world.proxy.refuse.clear();
    world.step();
    assert_eq!(world.sent(proto::PROXY_CONFIG).len(), 2);
    assert_eq!(world.node("rt-1").state(), NodeState::Started);
}

#[test]
fn test_fifo_of_five_holds_four_tokens() {
    let mut fifo = Fifo::new(5).expect("fifo");
    for i in 0..4 {
        assert!(fifo.slots_available(1));
        fifo.write(Token::from_uint(i).expect("token")).expect("write");
    }
    assert!(!fifo.slots_available(1));
    assert!(fifo.write(Token::from_uint(4).expect("token")).is_err());
}

#[test]
fn test_port_connect_replies_enable_actor() {
    let world = running_identity();
    let node = world.node("rt-1");

    let connects = world.sent(proto::PORT_CONNECT);
    assert_eq!(connects.len(), 2);
    let tunnel = node.token_tunnel("rt-2").expect("token tunnel");
    assert_eq!(tunnel.ref_count(), 2);
    for frame in connects {
        assert_eq!(frame.get_str("to_rt_uuid").expect("to"), "rt-2");
        assert_eq!(frame.get_str("tunnel_id").expect("tunnel"), tunnel.id());
    }
    assert_eq!(node.link("rt-2").expect("link").state(), LinkState::Enabled);

    let registry = &world.proxy.registry;
    assert!(registry.get("actor-a1").expect("actor record").contains("std.Identity"));
    assert!(registry.get("port-a1-in").expect("port record").contains("\"connected\":true"));
    assert!(registry.contains_key("port-a1-out"));
    assert!(node.pending().is_empty());
}

#[test]
fn test_token_sequence_numbers() {
    let mut world = running_identity();
    let tunnel_id = world
        .node("rt-1")
        .token_tunnel("rt-2")
        .expect("tunnel")
        .id()
        .to_string();

    world.inject("rt-1", token_frame(&tunnel_id, 0, 42));
    assert_eq!(last_token_reply(&world), TokenReply::Ack);
    let inport = |w: &World| w.node("rt-1").actor("a1").expect("a1").port("a1-in").expect("in").fifo().write_pos();
    assert_eq!(inport(&world), 1);

    // A retransmission is acknowledged but not written twice.
    world.inject("rt-1", token_frame(&tunnel_id, 0, 42));
    assert_eq!(last_token_reply(&world), TokenReply::Ack);
    assert_eq!(inport(&world), 1);

    world.inject("rt-1", token_frame(&tunnel_id, 5, 43));
    assert_eq!(last_token_reply(&world), TokenReply::Nack);
    assert_eq!(inport(&world), 1);

    world.inject("rt-1", token_frame(&tunnel_id, 1, 44));
    assert_eq!(last_token_reply(&world), TokenReply::Ack);
    assert_eq!(inport(&world), 2);

    assert!(world.run_until(10, |w| w.tokens_to("dst").len() == 2));
    assert_eq!(world.tokens_to("dst"), vec![42, 44]);
}

#[test]
fn test_duplicate_tunnels_converge_on_higher_id() {
    let snapshot = |id: &str, peer: &str, tunnel: &str| NodeSnapshot {
        id: id.to_string(),
        name: id.to_string(),
        proxy_id: Some(PROXY.to_string()),
        links: vec![Link::routed(peer)],
        tunnels: vec![Tunnel::new(tunnel, peer, TunnelKind::Token, TunnelState::Enabled)],
        actors: Vec::new(),
    };
    let restore = |snapshot| {
        Node::restore(common::config("unused"), ActorRegistry::with_builtins(), snapshot).expect("restore")
    };
    let mut world = World::new(vec![
        restore(snapshot("rt-1", "rt-2", "TUNNEL_aaa")),
        restore(snapshot("rt-2", "rt-1", "TUNNEL_bbb")),
    ]);
    let tunnel_new = |from: &str, to: &str, tunnel: &str| {
        request(
            proto::TUNNEL_NEW,
            &format!("m-{}", tunnel),
            from,
            to,
            vec![
                ("tunnel_id", Value::from(tunnel)),
                ("type", Value::from(TunnelKind::Token.as_str())),
            ],
        )
    };

    world.inject("rt-1", tunnel_new("rt-2", "rt-1", "TUNNEL_bbb"));
    world.inject("rt-2", tunnel_new("rt-1", "rt-2", "TUNNEL_aaa"));

    for (node_id, peer) in [("rt-1", "rt-2"), ("rt-2", "rt-1")] {
        let tunnel = world.node(node_id).token_tunnel(peer).expect("tunnel");
        assert_eq!(tunnel.id(), "TUNNEL_bbb");
        assert_eq!(tunnel.state(), TunnelState::Enabled);
        assert_eq!(world.node(node_id).tunnels().count(), 1);
    }
}

#[test]
fn test_tokens_flow_between_nodes() {
    common::init_tracing();
    let mut source = node("rt-1");
    source.create_actor(&counter("c1", 3, (Some("rt-2"), "a2-in"))).expect("counter");
    let mut relay = node("rt-2");
    relay
        .create_actor(&identity("a2", (Some("rt-1"), "c1-out"), (Some("rt-3"), "sink")))
        .expect("identity");

    let mut world = World::new(vec![source, relay]);
    world.connect();
    assert!(world.run_until(60, |w| w.tokens_to("sink").len() >= 3));
    assert_eq!(world.tokens_to("sink"), vec![1, 2, 3]);

    // Both sides opened a tunnel to the other and settled on one id.
    let forward = world.node("rt-1").token_tunnel("rt-2").expect("tunnel").id().to_string();
    let backward = world.node("rt-2").token_tunnel("rt-1").expect("tunnel").id().to_string();
    assert_eq!(forward, backward);
    assert_eq!(world.node("rt-1").tunnels().count(), 2);
}

#[test]
fn test_local_connection_moves_tokens_without_tunnel() {
    let mut n = node("rt-1");
    n.create_actor(&counter("c1", 3, (Some("rt-1"), "a1-in"))).expect("counter");
    n.create_actor(&identity("a1", (Some("rt-1"), "c1-out"), (Some("rt-3"), "sink")))
        .expect("identity");
    let mut world = World::new(vec![n]);
    world.connect();

    assert!(world.run_until(40, |w| w.tokens_to("sink").len() >= 3));
    assert_eq!(world.tokens_to("sink"), vec![1, 2, 3]);

    let node = world.node("rt-1");
    let out = node.actor("c1").expect("c1").port("c1-out").expect("out");
    assert!(out.is_local());
    assert_eq!(out.state(), PortState::Connected);
    assert!(node.token_tunnel("rt-1").is_none());
    assert!(world.proxy.registry.get("port-c1-out").expect("record").contains("\"rt-1\""));
}

#[test]
fn test_peer_port_lookup() {
    let mut n = node("rt-1");
    n.create_actor(&identity("a1", (None, "src"), (Some("rt-2"), "dst"))).expect("create");
    let mut world = World::new(vec![n]);
    world
        .proxy
        .registry
        .insert("port-src".to_string(), r#"{"node_id":"rt-5","name":"token"}"#.to_string());
    world.connect();

    assert!(world.run_until(30, |w| enabled(w, "rt-1", "a1")));
    let node = world.node("rt-1");
    assert_eq!(node.actor("a1").expect("a1").port("a1-in").expect("in").peer_id(), Some("rt-5"));
    assert!(node.token_tunnel("rt-5").is_some());
    assert_eq!(world.sent(proto::GET).len(), 1);
}

#[test]
fn test_missing_peer_port_stays_disconnected() {
    let mut n = node("rt-1");
    n.create_actor(&identity("a1", (None, "src"), (Some("rt-2"), "dst"))).expect("create");
    let mut world = World::new(vec![n]);
    world.connect();
    world.run(10);

    let state = world.node("rt-1").actor("a1").expect("a1").port("a1-in").expect("in").state();
    assert_ne!(state, PortState::Connected);
    assert!(!enabled(&world, "rt-1", "a1"));
    assert!(world.sent(proto::GET).len() > 1);
}

#[test]
fn test_migration_moves_actor() {
    let mut world = running_identity();
    world.inject(
        "rt-1",
        request(proto::ACTOR_MIGRATE, "m-migrate", "rt-9", "rt-1", vec![("actor_id", Value::from("a1"))]),
    );
    assert_eq!(reply_status(&world, "m-migrate"), Some(proto::STATUS_OK));
    assert_eq!(world.sent(proto::PORT_DISCONNECT).len(), 2);
    assert!(!enabled(&world, "rt-1", "a1"));

    assert!(world.run_until(20, |w| w.node("rt-1").actor("a1").is_none()));
    let sent = world.sent(proto::ACTOR_NEW);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].get_str("to_rt_uuid").expect("to"), "rt-9");
    let state = sent[0].get_value("state").expect("state");
    assert_eq!(state.get_str("actor_type").expect("type"), "std.Identity");
    let prev = state
        .get_value("prev_connections")
        .and_then(|p| p.get_value("inports"))
        .and_then(|p| p.get_array("a1-in"))
        .expect("prev connection");
    assert_eq!(prev[0].as_array().expect("pair")[0].as_str(), Some("rt-2"));

    // Nothing holds the token tunnel any more.
    assert!(world.run_until(10, |w| w.node("rt-1").token_tunnel("rt-2").is_none()));
    assert!(world.node("rt-1").link("rt-2").is_none());
    assert_eq!(world.sent(proto::TUNNEL_DESTROY).len(), 1);
}

#[test]
fn test_refused_migration_reconnects_actor() {
    let mut world = running_identity();
    world.proxy.refuse.insert(proto::ACTOR_NEW.to_string(), 500);
    world.inject(
        "rt-1",
        request(
            proto::ACTOR_MIGRATE,
            "m-migrate",
            "rt-2",
            "rt-1",
            vec![("actor_id", Value::from("a1")), ("dest_peer_id", Value::from("rt-9"))],
        ),
    );
    assert!(world.run_until(40, |w| {
        !w.sent(proto::ACTOR_NEW).is_empty() && enabled(w, "rt-1", "a1")
    }));
    let actor = world.node("rt-1").actor("a1").expect("a1 stays");
    assert!(!actor.is_migrating());
}

#[test]
fn test_app_destroy_clears_registry() {
    let mut world = running_identity();
    assert!(world.proxy.registry.contains_key("actor-a1"));

    world.inject(
        "rt-1",
        request(
            proto::APP_DESTROY,
            "m-destroy",
            "rt-2",
            "rt-1",
            vec![("actor_uuids", Value::Array(vec![Value::from("a1"), Value::from("ghost")]))],
        ),
    );
    assert_eq!(reply_status(&world, "m-destroy"), Some(proto::STATUS_OK));
    assert!(world.node("rt-1").actor("a1").is_none());
    assert_eq!(world.sent(proto::PORT_DISCONNECT).len(), 2);

    world.run(3);
    for key in ["actor-a1", "port-a1-in", "port-a1-out"] {
        assert!(!world.proxy.registry.contains_key(key), "{} still registered", key);
    }
}

#[test]
fn test_tunnel_released_on_next_tick() {
    let mut world = running_identity();
    assert!(world.node_mut("rt-1").destroy_actor("a1"));

    let tunnel = world.node("rt-1").token_tunnel("rt-2").expect("still there");
    assert_eq!(tunnel.ref_count(), 0);
    assert_eq!(tunnel.state(), TunnelState::Enabled);

    world.step();
    let tunnel = world.node("rt-1").token_tunnel("rt-2").expect("still there");
    assert_eq!(tunnel.state(), TunnelState::DoDisconnect);

    world.step();
    assert!(world.node("rt-1").token_tunnel("rt-2").is_none());
}

#[test]
fn test_request_status_codes() {
    let mut world = running_identity();
    let cases = [
        request("NOT_A_COMMAND", "m-1", "rt-2", "rt-1", vec![]),
        request(
            proto::PORT_CONNECT,
            "m-2",
            "rt-2",
            "rt-1",
            vec![("tunnel_id", Value::from("TUNNEL_x")), ("peer_port_id", Value::from("nope"))],
        ),
        request(
            proto::TUNNEL_NEW,
            "m-3",
            "rt-2",
            "rt-1",
            vec![("tunnel_id", Value::from("TUNNEL_x")), ("type", Value::from("storage"))],
        ),
        request(proto::TUNNEL_DESTROY, "m-4", "rt-2", "rt-1", vec![("tunnel_id", Value::from("TUNNEL_x"))]),
        request(proto::ACTOR_MIGRATE, "m-5", "rt-2", "rt-1", vec![("actor_id", Value::from("ghost"))]),
        request(proto::PORT_DISCONNECT, "m-6", "rt-2", "rt-1", vec![("peer_port_id", Value::from("nope"))]),
        request(proto::ROUTE_REQUEST, "m-7", PROXY, "rt-1", vec![("dest_peer_id", Value::from("rt-1"))]),
        request(proto::ROUTE_REQUEST, "m-8", PROXY, "rt-1", vec![("dest_peer_id", Value::from("rt-7"))]),
        request(proto::ACTOR_NEW, "m-9", "rt-2", "rt-1", vec![("state", Value::Nil)]),
    ];
    for frame in cases {
        world.inject("rt-1", frame);
    }
    let expected = [
        ("m-1", proto::STATUS_NOT_IMPLEMENTED),
        ("m-2", proto::STATUS_NOT_FOUND),
        ("m-3", proto::STATUS_NOT_IMPLEMENTED),
        ("m-4", proto::STATUS_NOT_FOUND),
        ("m-5", proto::STATUS_NOT_FOUND),
        ("m-6", proto::STATUS_INTERNAL_ERROR),
        ("m-7", proto::STATUS_OK),
        ("m-8", proto::STATUS_NOT_FOUND),
        ("m-9", proto::STATUS_INTERNAL_ERROR),
    ];
    for (msg_uuid, status) in expected {
        assert_eq!(reply_status(&world, msg_uuid), Some(status), "{}", msg_uuid);
    }
    assert!(enabled(&world, "rt-1", "a1"));
}

#[test]
fn test_inbound_port_connect_and_disconnect() {
    let mut n = node("rt-1");
    n.create_actor(&identity("a1", (Some("rt-2"), "src"), (Some("rt-2"), "dst"))).expect("create");
    let mut world = World::new(vec![n]);

    world.inject(
        "rt-1",
        request(
            proto::TUNNEL_NEW,
            "m-tunnel",
            "rt-5",
            "rt-1",
            vec![("tunnel_id", Value::from("TUNNEL_zzz")), ("type", Value::from("token"))],
        ),
    );
    assert_eq!(reply_status(&world, "m-tunnel"), Some(proto::STATUS_OK));
    assert_eq!(world.node("rt-1").link("rt-5").expect("link").state(), LinkState::Enabled);

    world.inject(
        "rt-1",
        request(
            proto::PORT_CONNECT,
            "m-connect",
            "rt-5",
            "rt-1",
            vec![
                ("tunnel_id", Value::from("TUNNEL_zzz")),
                ("peer_port_id", Value::from("a1-in")),
                ("port_id", Value::from("src5")),
            ],
        ),
    );
    assert_eq!(reply_status(&world, "m-connect"), Some(proto::STATUS_OK));
    let node = world.node("rt-1");
    let port = node.actor("a1").expect("a1").port("a1-in").expect("in");
    assert!(port.is_connected());
    assert_eq!(port.peer_id(), Some("rt-5"));
    assert_eq!(node.token_tunnel("rt-5").expect("tunnel").ref_count(), 1);

    world.inject(
        "rt-1",
        request(proto::PORT_DISCONNECT, "m-disconnect", "rt-5", "rt-1", vec![("peer_port_id", Value::from("a1-in"))]),
    );
    assert_eq!(reply_status(&world, "m-disconnect"), Some(proto::STATUS_OK));
    let node = world.node("rt-1");
    assert!(!node.actor("a1").expect("a1").port("a1-in").expect("in").is_connected());
    assert_eq!(node.token_tunnel("rt-5").expect("tunnel").ref_count(), 0);
}

#[test]
fn test_reconnect_to_same_proxy_keeps_connections() {
    let mut world = running_identity();
    let node = world.node_mut("rt-1");
    node.on_disconnected();
    assert_eq!(node.state(), NodeState::DoStart);
    assert!(node.pending().is_empty());
    assert!(node.actor("a1").expect("a1").is_enabled());

    node.on_connected(PROXY);
    assert!(node.token_tunnel("rt-2").is_some());
    world.step();
    assert_eq!(world.node("rt-1").state(), NodeState::Started);
    assert!(enabled(&world, "rt-1", "a1"));
}

#[test]
fn test_new_proxy_resets_connections() {
    let mut world = running_identity();
    let node = world.node_mut("rt-1");
    node.on_disconnected();
    node.on_connected("proxy-2");

    assert!(node.link("rt-2").is_none());
    assert!(node.token_tunnel("rt-2").is_none());
    assert!(node.link("proxy-2").expect("proxy link").is_proxy());
    let actor = node.actor("a1").expect("actors survive");
    assert!(actor.ports().all(|p| p.state() == PortState::Disconnected));

    assert!(world.run_until(20, |w| enabled(w, "rt-1", "a1")));
    assert_eq!(world.node("rt-1").proxy_id(), Some("proxy-2"));
}

#[test]
fn test_late_duplicate_reply_is_ignored() {
    let mut world = running_identity();
    world.run(2);
    assert!(world.node("rt-1").pending().is_empty());

    let msg_uuid = world.sent(proto::PORT_CONNECT)[0]
        .get_str("msg_uuid")
        .expect("msg_uuid")
        .to_string();
    world.inject("rt-1", proto::reply(&msg_uuid, "rt-2", "rt-1", 500, Value::Nil));
    assert!(enabled(&world, "rt-1", "a1"));
    assert!(world.node("rt-1").pending().is_empty());
}

#[test]
fn test_restore_resumes_queued_tokens() {
    let mut world = running_identity();
    let tunnel_id = world.node("rt-1").token_tunnel("rt-2").expect("tunnel").id().to_string();
    world.inject("rt-1", token_frame(&tunnel_id, 0, 7));
    let snapshot = world.node("rt-1").snapshot().expect("snapshot");
    let bytes = snapshot.encode().expect("encode");

    let restored = Node::restore(
        common::config("rt-1"),
        ActorRegistry::with_builtins(),
        NodeSnapshot::decode(&bytes).expect("decode"),
    )
    .expect("restore");
    assert_eq!(restored.id(), "rt-1");
    let actor = restored.actor("a1").expect("a1");
    assert!(!actor.is_enabled());
    assert!(actor.port("a1-in").expect("in").fifo().tokens_available(1));
    assert_eq!(restored.link("rt-2").expect("link").state(), LinkState::DoConnect);
    assert_eq!(restored.tunnel(&tunnel_id).expect("tunnel").state(), TunnelState::DoConnect);

    let mut world = World::new(vec![restored]);
    world.connect();
    assert!(world.run_until(30, |w| w.tokens_to("dst") == vec![7]));
    assert_eq!(world.node("rt-1").token_tunnel("rt-2").expect("tunnel").id(), tunnel_id);
}

#[test]
fn test_frame_without_command_is_an_error() {
    let mut n = node("rt-1");
    let frame = encode_value(&map_of([("value", Value::Nil)])).expect("encode");
    assert!(n.handle_frame(&frame).is_err());
    assert!(n.handle_frame(b"\xc1").is_err());
}

#[test]
fn test_actor_new_with_oversized_queue_is_refused() {
    let mut world = running_identity();
    let mut state = identity("a9", (Some("rt-2"), "x"), (Some("rt-2"), "y"));
    let queue = map_of([
        ("queuetype", Value::from(QUEUE_TYPE)),
        ("N", Value::from(u32::MAX)),
        ("fifo", Value::Array(Vec::new())),
        ("write_pos", Value::from(0u32)),
        ("readers", Value::Array(Vec::new())),
    ]);
    set_field(&mut state, &["actor_state", "private", "inports", "token"], "queue", queue);

    world.inject(
        "rt-1",
        request(proto::ACTOR_NEW, "m-big", "rt-2", "rt-1", vec![("state", state)]),
    );
    assert_eq!(reply_status(&world, "m-big"), Some(proto::STATUS_INTERNAL_ERROR));
    assert!(world.node("rt-1").actor("a9").is_none());
    assert!(enabled(&world, "rt-1", "a1"));
}

#[test]
fn test_actor_new_with_unrepresentable_sleep_is_refused() {
    let mut world = running_identity();
    let mut state = counter("c9", 1, (Some("rt-2"), "y"));
    set_field(
        &mut state,
        &["actor_state", "managed", "_shadow_args"],
        "sleep",
        Value::F64(1e30),
    );

    world.inject(
        "rt-1",
        request(proto::ACTOR_NEW, "m-sleep", "rt-2", "rt-1", vec![("state", state)]),
    );
    assert_eq!(reply_status(&world, "m-sleep"), Some(proto::STATUS_INTERNAL_ERROR));
    assert!(world.node("rt-1").actor("c9").is_none());
    assert!(enabled(&world, "rt-1", "a1"));
}

#[test]
fn test_disconnect_returns_storage_references() {
    let mut world = running_identity();
    let baseline = storage_refs(world.node("rt-1"));
    assert_eq!(storage_requests(world.node("rt-1")), 0);

    // Lookups and registry writes for a2 go out and are never answered.
    let n = world.node_mut("rt-1");
    n.create_actor(&identity("a2", (None, "x"), (None, "y"))).expect("create");
    for _ in 0..3 {
        n.tick(Instant::now());
        n.take_outbox();
    }
    let in_flight = storage_requests(n);
    assert!(in_flight > 0);
    assert_eq!(storage_refs(n), baseline + in_flight);

    n.on_disconnected();
    assert!(n.pending().is_empty());
    assert_eq!(storage_refs(n), baseline);

    // Each reconnect keeps one reference per outstanding registry request.
    for _ in 0..3 {
        world.connect();
        world.run(4);
        let n = world.node_mut("rt-1");
        assert_eq!(storage_refs(n), baseline + storage_requests(n));
        n.on_disconnected();
        assert_eq!(storage_refs(n), baseline);
    }
}

#[test]
fn test_token_without_destination_port_is_refused() {
    let mut world = running_identity();
    let tunnel_id = world.node("rt-1").token_tunnel("rt-2").expect("tunnel").id().to_string();
    let mut frame = token_frame(&tunnel_id, 0, 42);
    remove_field(&mut frame, &["value"], "peer_port_id");

    world.inject("rt-1", frame);
    assert_eq!(last_token_reply(&world), TokenReply::Nack);
    let reply = world.sent(proto::TOKEN_REPLY).pop().expect("token reply");
    let value = reply.get_value("value").expect("value");
    assert_eq!(value.get_str("port_id").expect("sender port"), "src");
    assert_eq!(value.get_u32("sequencenbr").expect("seq"), 0);
}

#[test]
fn test_token_without_sequence_number_is_dropped() {
    let mut world = running_identity();
    let tunnel_id = world.node("rt-1").token_tunnel("rt-2").expect("tunnel").id().to_string();
    let mut frame = token_frame(&tunnel_id, 0, 42);
    remove_field(&mut frame, &["value"], "sequencenbr");
    let replies = world.sent(proto::TOKEN_REPLY).len();

    let bytes = encode_value(&frame).expect("encode");
    assert!(world.node_mut("rt-1").handle_frame(&bytes).is_err());
    world.flush_all();
    assert_eq!(world.sent(proto::TOKEN_REPLY).len(), replies);
    let fifo = world.node("rt-1").actor("a1").expect("a1").port("a1-in").expect("in").fifo();
    assert_eq!(fifo.write_pos(), 0);
}

#[test]
fn test_crossing_tunnel_requests_converge_on_higher_id() {
    common::init_tracing();
    let snapshot = |id: &str, peer: &str, tunnel: &str| NodeSnapshot {
        id: id.to_string(),
        name: id.to_string(),
        proxy_id: Some(PROXY.to_string()),
        links: vec![Link::routed(peer)],
        tunnels: vec![Tunnel::new(tunnel, peer, TunnelKind::Token, TunnelState::Enabled)],
        actors: Vec::new(),
    };
    let restore = |snapshot| {
        Node::restore(common::config("unused"), ActorRegistry::with_builtins(), snapshot).expect("restore")
    };
    let mut world = World::new(vec![
        restore(snapshot("rt-1", "rt-2", "TUNNEL_aaa")),
        restore(snapshot("rt-2", "rt-1", "TUNNEL_bbb")),
    ]);
    world.connect();

    let in_flight = |w: &World, node_id: &str, peer: &str| {
        w.node(node_id).token_tunnel(peer).expect("tunnel").state() == TunnelState::Pending
    };
    let mut crossed = false;
    for _ in 0..10 {
        world.tick_all();
        if in_flight(&world, "rt-1", "rt-2") || in_flight(&world, "rt-2", "rt-1") {
            crossed = true;
            break;
        }
        world.deliver_held();
    }
    assert!(crossed);
    // Both requests are on the wire before either side sees the other's.
    assert!(in_flight(&world, "rt-1", "rt-2"));
    assert!(in_flight(&world, "rt-2", "rt-1"));
    let held_tunnel_news = world
        .held
        .iter()
        .filter(|(_, bytes)| {
            let frame = minnow_core::decode_value(bytes).expect("decode");
            common::cmd_of(&frame) == proto::TUNNEL_NEW && frame.opt_str("to_rt_uuid") != Some(PROXY)
        })
        .count();
    assert_eq!(held_tunnel_news, 2);

    world.deliver_held();
    world.flush_all();
    world.flush_all();

    for (node_id, peer) in [("rt-1", "rt-2"), ("rt-2", "rt-1")] {
        let node = world.node(node_id);
        let tunnel = node.token_tunnel(peer).expect("tunnel");
        assert_eq!(tunnel.id(), "TUNNEL_bbb");
        assert_eq!(tunnel.state(), TunnelState::Enabled);
        assert_eq!(node.tunnels().filter(|t| t.kind() == TunnelKind::Token).count(), 1);
        assert!(!node.pending().kinds().any(|k| matches!(k, PendingKind::TunnelNew { .. })));
    }
}
