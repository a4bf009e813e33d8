//! Actors: typed units of computation owning ports and managed attributes.
//!
//! The generic half of an actor lives here: building ports from a serialized
//! descriptor, keeping private and managed attributes, the enable rule and
//! serialization for migration and snapshots. The per-type half is an
//! [`ActorBehavior`] resolved through the [`ActorRegistry`].
//!
//! # Descriptor format
//!
//! ```text
//! { actor_type,
//!   prev_connections: { inports: {port_id: [[rt, peer_port]]}, outports: {...} },
//!   actor_state: { security, custom,
//!                  managed: { name: value, ..., _shadow_args?: {...} },
//!                  private: { _id, _name, ..., inports: {name: port}, outports: {...} } } }
//! ```
//!
//! A descriptor carrying `_shadow_args` is a first placement: the arguments
//! are merged into the managed attributes and the behavior is built with
//! [`InitMode::Fresh`]. Anything else is a migration or restart.

pub mod behavior;
pub mod builtin;
pub mod registry;

use minnow_core::{map_of, Value, ValueExt};
use tokio::time::Instant;

pub use behavior::{ActorBehavior, ActorContext, InitMode, ManagedAttributes};
pub use registry::{ActorFactory, ActorRegistry};

use crate::error::ActorError;
use crate::port::{Port, PortDirection, QueueSizes};
use crate::timer::Timers;

const SHADOW_ARGS: &str = "_shadow_args";

/// Outstanding move of an actor to another runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Migration {
    pub(crate) dest: String,
    pub(crate) sent: bool,
}

/// A scheduled unit of computation.
pub struct Actor {
    id: String,
    name: String,
    type_name: String,
    enabled: bool,
    inports: Vec<Port>,
    outports: Vec<Port>,
    private: Vec<(String, Value)>,
    behavior: Box<dyn ActorBehavior>,
    migration: Option<Migration>,
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("enabled", &self.enabled)
            .field("inports", &self.inports)
            .field("outports", &self.outports)
            .field("migration", &self.migration)
            .finish_non_exhaustive()
    }
}

impl Actor {
    /// Build an actor from the `state` map of an `ACTOR_NEW` or a snapshot.
    ///
    /// On error nothing is kept: ports built so far are dropped with the
    /// partially constructed value.
    pub fn from_state(
        state: &Value,
        registry: &ActorRegistry,
        sizes: QueueSizes,
    ) -> Result<Self, ActorError> {
        let type_name = state.get_str("actor_type")?.to_string();
        let actor_state = state.get_value("actor_state")?;
        let private_map = actor_state.get_value("private")?;
        let managed_map = actor_state.get_value("managed")?;

        let id = private_map.get_str("_id")?.to_string();
        let name = private_map
            .opt_str("_name")
            .or_else(|| managed_map.opt_str("_name"))
            .unwrap_or_default()
            .to_string();

        // Private attributes are the `_`-prefixed keys; ports are rebuilt below.
        let private = private_map
            .as_map()
            .into_iter()
            .flatten()
            .filter_map(|(k, v)| {
                let key = k.as_str()?;
                key.starts_with('_').then(|| (key.to_string(), v.clone()))
            })
            .collect();

        let prev = state.get_value("prev_connections")?;
        let inports = build_ports(
            private_map.get_value("inports")?,
            prev.get_value("inports")?,
            PortDirection::In,
            sizes,
        )?;
        let outports = build_ports(
            private_map.get_value("outports")?,
            prev.get_value("outports")?,
            PortDirection::Out,
            sizes,
        )?;

        let entries = managed_map
            .as_map()
            .ok_or_else(|| ActorError::Descriptor("'managed' is not a map".to_string()))?;
        let mut managed = ManagedAttributes::from_map(
            &entries
                .iter()
                .filter(|(k, _)| k.as_str() != Some(SHADOW_ARGS))
                .cloned()
                .collect::<Vec<_>>(),
        )?;
        let mode = match managed_map.get(SHADOW_ARGS) {
            Some(shadow) => {
                let args = shadow
                    .as_map()
                    .ok_or_else(|| ActorError::Descriptor("'_shadow_args' is not a map".to_string()))?;
                managed.merge(&ManagedAttributes::from_map(args)?);
                InitMode::Fresh
            }
            None => InitMode::Restore,
        };

        let behavior = registry.create(&type_name, &managed, mode)?;

        tracing::info!(actor = %id, actor_type = %type_name, ?mode, "actor created");
        Ok(Self {
            id,
            name,
            type_name,
            enabled: false,
            inports,
            outports,
            private,
            behavior,
            migration: None,
        })
    }

    /// Serialize into the `state` map accepted by [`Actor::from_state`].
    ///
    /// Queue contents are included; `node_id` is written as the peer runtime
    /// of local connections.
    pub fn serialize(&self, node_id: &str) -> Result<Value, ActorError> {
        let managed = self.behavior.serialize_state()?.to_value()?;

        let mut private: Vec<(Value, Value)> = self
            .private
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
            .collect();
        private.push((Value::from("inports"), port_descriptors(&self.inports)?));
        private.push((Value::from("outports"), port_descriptors(&self.outports)?));

        Ok(map_of([
            ("actor_type", Value::from(self.type_name.as_str())),
            (
                "prev_connections",
                map_of([
                    ("inports", prev_connections(&self.inports, node_id)),
                    ("outports", prev_connections(&self.outports, node_id)),
                ]),
            ),
            (
                "actor_state",
                map_of([
                    ("security", map_of([("_subject_attributes", Value::Nil)])),
                    ("custom", Value::Map(Vec::new())),
                    ("managed", managed),
                    ("private", Value::Map(private)),
                ]),
            ),
        ]))
    }

    /// Actor id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Actor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Whether the actor is scheduled: every port connected, not migrating.
    pub fn is_enabled(&self) -> bool {
        self.migration.is_none() && self.ports().all(Port::is_connected)
    }

    /// In-ports in declaration order.
    pub fn inports(&self) -> &[Port] {
        &self.inports
    }

    /// Out-ports in declaration order.
    pub fn outports(&self) -> &[Port] {
        &self.outports
    }

    /// All ports, in-ports first.
    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.inports.iter().chain(self.outports.iter())
    }

    pub(crate) fn ports_mut(&mut self) -> impl Iterator<Item = &mut Port> {
        self.inports.iter_mut().chain(self.outports.iter_mut())
    }

    /// Port with id `port_id`.
    pub fn port(&self, port_id: &str) -> Option<&Port> {
        self.ports().find(|p| p.id() == port_id)
    }

    pub(crate) fn port_mut(&mut self, port_id: &str) -> Option<&mut Port> {
        self.ports_mut().find(|p| p.id() == port_id)
    }

    /// Whether the actor is being moved to another runtime.
    pub fn is_migrating(&self) -> bool {
        self.migration.is_some()
    }

    pub(crate) fn migration(&self) -> Option<&Migration> {
        self.migration.as_ref()
    }

    pub(crate) fn migration_mut(&mut self) -> Option<&mut Migration> {
        self.migration.as_mut()
    }

    pub(crate) fn set_migration(&mut self, migration: Option<Migration>) {
        self.migration = migration;
    }

    /// Re-evaluate the enable rule; returns `Some(enabled)` when it changed.
    pub(crate) fn refresh_enabled(&mut self) -> Option<bool> {
        let enabled = self.is_enabled();
        if enabled == self.enabled {
            return None;
        }
        self.enabled = enabled;
        if enabled {
            tracing::info!(actor = %self.id, "actor enabled");
        } else {
            tracing::debug!(actor = %self.id, "actor disabled");
        }
        Some(enabled)
    }

    /// Run one unit of work if the actor is enabled.
    pub(crate) fn fire(&mut self, timers: &mut Timers, now: Instant) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut ctx = ActorContext::new(&self.id, &mut self.inports, &mut self.outports, timers, now);
        self.behavior.fire(&mut ctx)
    }

    /// Let the behavior release its resources before the actor is dropped.
    pub(crate) fn free(&mut self) {
        self.behavior.free_state();
    }
}

fn build_ports(
    descriptors: &Value,
    prev_connections: &Value,
    direction: PortDirection,
    sizes: QueueSizes,
) -> Result<Vec<Port>, ActorError> {
    let entries = descriptors
        .as_map()
        .ok_or_else(|| ActorError::Descriptor(format!("{}ports is not a map", direction)))?;
    let mut ports = Vec::with_capacity(entries.len());
    for (_, desc) in entries {
        ports.push(Port::from_descriptor(desc, direction, prev_connections, sizes)?);
    }
    Ok(ports)
}

fn port_descriptors(ports: &[Port]) -> Result<Value, ActorError> {
    let mut entries = Vec::with_capacity(ports.len());
    for port in ports {
        entries.push((Value::from(port.name()), port.to_descriptor()?));
    }
    Ok(Value::Map(entries))
}

fn prev_connections(ports: &[Port], node_id: &str) -> Value {
    Value::Map(
        ports
            .iter()
            .map(|p| (Value::from(p.id()), p.prev_connection(node_id)))
            .collect(),
    )
}
