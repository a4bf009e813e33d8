//! Actor-type registry.
//!
//! Maps a type name to the factory building its behavior. Types are resolved
//! once, when an actor is constructed; an unknown name fails construction.

use std::collections::HashMap;

use crate::actor::behavior::{ActorBehavior, InitMode, ManagedAttributes};
use crate::actor::builtin;
use crate::error::ActorError;

/// Builds the behavior of one actor type from its managed attributes.
pub type ActorFactory = fn(&ManagedAttributes, InitMode) -> Result<Box<dyn ActorBehavior>, ActorError>;

/// Registered actor types, keyed by exact type name.
#[derive(Clone, Default)]
pub struct ActorRegistry {
    factories: HashMap<String, ActorFactory>,
}

impl ActorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `std.*` types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin::IDENTITY, builtin::Identity::create);
        registry.register(builtin::COUNT_TIMER, builtin::CountTimer::create);
        registry
    }

    /// Register `factory` under `type_name`, replacing any previous one.
    pub fn register(&mut self, type_name: &str, factory: ActorFactory) {
        if self.factories.insert(type_name.to_string(), factory).is_some() {
            tracing::warn!(actor_type = %type_name, "actor type registered twice");
        }
    }

    /// Whether `type_name` is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Build a behavior of `type_name`.
    pub fn create(
        &self,
        type_name: &str,
        managed: &ManagedAttributes,
        mode: InitMode,
    ) -> Result<Box<dyn ActorBehavior>, ActorError> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| ActorError::UnknownType(type_name.to_string()))?;
        factory(managed, mode)
    }
}

impl std::fmt::Debug for ActorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ActorRegistry").field("types", &names).finish()
    }
}
