//! The per-type half of an actor: behavior trait, fire context and managed
//! attributes.

use std::time::Duration;

use bytes::Bytes;
use minnow_core::{decode_value, encode_value, CodecError, Fifo, Value};
use tokio::time::Instant;

use crate::error::ActorError;
use crate::port::Port;
use crate::timer::Timers;

/// How a behavior is being constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// First placement; attributes come from the deployment arguments.
    Fresh,
    /// Migration or restart; attributes are a previous `serialize_state`.
    Restore,
}

/// Behavior supplied by an actor type.
///
/// `fire` runs once per scheduler pass while the actor is enabled. It must
/// not block and should do at most one bounded unit of work, using
/// peek/commit/cancel on its queues so a failed step leaves them untouched.
pub trait ActorBehavior {
    /// Attempt one unit of work; returns whether anything happened.
    fn fire(&mut self, ctx: &mut ActorContext<'_>) -> bool;

    /// Durable state, written into the actor's `managed` attributes.
    fn serialize_state(&self) -> Result<ManagedAttributes, ActorError>;

    /// Release anything held outside the actor before it is dropped.
    fn free_state(&mut self) {}
}

/// Ordered list of named, encoded attribute values.
///
/// Values are kept in their encoded form so attributes a behavior does not
/// understand round-trip byte for byte.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagedAttributes {
    entries: Vec<(String, Bytes)>,
}

impl ManagedAttributes {
    /// Empty attribute list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a decoded map, keeping key order.
    pub fn from_map(entries: &[(Value, Value)]) -> Result<Self, ActorError> {
        let mut attrs = Self::new();
        for (key, value) in entries {
            let name = key
                .as_str()
                .ok_or_else(|| ActorError::Descriptor("managed attribute name is not a string".to_string()))?;
            attrs.set_value(name, value)?;
        }
        Ok(attrs)
    }

    /// Decode every attribute into a map value.
    pub fn to_value(&self) -> Result<Value, CodecError> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (name, raw) in &self.entries {
            entries.push((Value::from(name.as_str()), decode_value(raw)?));
        }
        Ok(Value::Map(entries))
    }

    /// Store an already encoded value, replacing one with the same name.
    pub fn set_raw(&mut self, name: &str, raw: Bytes) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = raw,
            None => self.entries.push((name.to_string(), raw)),
        }
    }

    /// Encode and store a value.
    pub fn set_value(&mut self, name: &str, value: &Value) -> Result<(), CodecError> {
        self.set_raw(name, Bytes::from(encode_value(value)?));
        Ok(())
    }

    /// Encoded value of `name`.
    pub fn get_raw(&self, name: &str) -> Option<&Bytes> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Decoded value of `name`.
    pub fn get_value(&self, name: &str) -> Result<Option<Value>, CodecError> {
        self.get_raw(name).map(|raw| decode_value(raw)).transpose()
    }

    /// Unsigned integer attribute, or `default` when absent.
    pub fn uint_or(&self, name: &str, default: u64) -> Result<u64, ActorError> {
        match self.get_value(name)? {
            None | Some(Value::Nil) => Ok(default),
            Some(v) => v.as_u64().ok_or_else(|| ActorError::Attribute(name.to_string())),
        }
    }

    /// Numeric attribute as seconds, or `default` when absent.
    ///
    /// Negative, non-finite and out-of-range values are attribute errors.
    pub fn seconds_or(&self, name: &str, default: Duration) -> Result<Duration, ActorError> {
        match self.get_value(name)? {
            None | Some(Value::Nil) => Ok(default),
            Some(v) => v
                .as_f64()
                .or_else(|| v.as_u64().map(|n| n as f64))
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .ok_or_else(|| ActorError::Attribute(name.to_string())),
        }
    }

    /// Boolean attribute, or `default` when absent.
    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool, ActorError> {
        match self.get_value(name)? {
            None | Some(Value::Nil) => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| ActorError::Attribute(name.to_string())),
        }
    }

    /// Copy every attribute of `other` over this list.
    pub fn merge(&mut self, other: &ManagedAttributes) {
        for (name, raw) in &other.entries {
            self.set_raw(name, raw.clone());
        }
    }

    /// Attribute names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a behavior can touch while firing.
pub struct ActorContext<'a> {
    actor_id: &'a str,
    inports: &'a mut [Port],
    outports: &'a mut [Port],
    timers: &'a mut Timers,
    now: Instant,
}

impl<'a> ActorContext<'a> {
    pub(crate) fn new(
        actor_id: &'a str,
        inports: &'a mut [Port],
        outports: &'a mut [Port],
        timers: &'a mut Timers,
        now: Instant,
    ) -> Self {
        Self {
            actor_id,
            inports,
            outports,
            timers,
            now,
        }
    }

    /// Id of the firing actor.
    pub fn actor_id(&self) -> &str {
        self.actor_id
    }

    /// Time of the current scheduler pass.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Queue of the in-port called `name`.
    pub fn inport(&mut self, name: &str) -> Option<&mut Fifo> {
        self.inports
            .iter_mut()
            .find(|p| p.name() == name)
            .map(Port::fifo_mut)
    }

    /// Queue of the out-port called `name`.
    pub fn outport(&mut self, name: &str) -> Option<&mut Fifo> {
        self.outports
            .iter_mut()
            .find(|p| p.name() == name)
            .map(Port::fifo_mut)
    }

    /// Arm this actor's timer, replacing any previous one.
    pub fn arm_timer(&mut self, delay: Duration) {
        self.timers.arm(self.actor_id, self.now, delay);
    }

    /// Whether this actor has a timer armed (expired or not).
    pub fn timer_armed(&self) -> bool {
        self.timers.is_armed(self.actor_id)
    }

    /// Consume this actor's timer if it has expired.
    pub fn timer_expired(&mut self) -> bool {
        self.timers.take_expired(self.actor_id, self.now)
    }

    /// Disarm this actor's timer.
    pub fn cancel_timer(&mut self) {
        self.timers.cancel(self.actor_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minnow_core::map_of;

    #[test]
    fn test_unknown_attributes_round_trip() {
        let map = map_of([
            ("sleep", Value::F64(0.5)),
            ("opaque", Value::Array(vec![Value::from(1), Value::from("x")])),
        ]);
        let attrs = ManagedAttributes::from_map(map.as_map().expect("map")).expect("attrs");
        assert_eq!(attrs.to_value().expect("value"), map);
        assert_eq!(attrs.names().collect::<Vec<_>>(), vec!["sleep", "opaque"]);
    }

    #[test]
    fn test_typed_accessors() {
        let mut attrs = ManagedAttributes::new();
        attrs.set_value("count", &Value::from(3u64)).expect("set");
        attrs.set_value("sleep", &Value::from(2u64)).expect("set");
        attrs.set_value("dump", &Value::from(true)).expect("set");

        assert_eq!(attrs.uint_or("count", 0).expect("count"), 3);
        assert_eq!(attrs.uint_or("missing", 7).expect("default"), 7);
        assert_eq!(
            attrs.seconds_or("sleep", Duration::ZERO).expect("sleep"),
            Duration::from_secs(2)
        );
        assert!(attrs.bool_or("dump", false).expect("dump"));
        assert!(matches!(attrs.uint_or("dump", 0), Err(ActorError::Attribute(_))));
    }

    #[test]
    fn test_seconds_out_of_range() {
        let mut attrs = ManagedAttributes::new();
        attrs.set_value("huge", &Value::F64(1e30)).expect("set");
        attrs.set_value("max", &Value::from(u64::MAX)).expect("set");
        attrs.set_value("negative", &Value::F64(-1.0)).expect("set");
        attrs.set_value("nan", &Value::F64(f64::NAN)).expect("set");
        attrs.set_value("half", &Value::F64(0.5)).expect("set");

        for name in ["huge", "max", "negative", "nan"] {
            assert!(
                matches!(attrs.seconds_or(name, Duration::ZERO), Err(ActorError::Attribute(_))),
                "{}",
                name
            );
        }
        assert_eq!(
            attrs.seconds_or("half", Duration::ZERO).expect("half"),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_merge_overrides_in_place() {
        let mut base = ManagedAttributes::new();
        base.set_value("a", &Value::from(1)).expect("set");
        base.set_value("b", &Value::from(2)).expect("set");
        let mut shadow = ManagedAttributes::new();
        shadow.set_value("b", &Value::from(20)).expect("set");
        shadow.set_value("c", &Value::from(30)).expect("set");

        base.merge(&shadow);
        assert_eq!(base.names().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(base.uint_or("b", 0).expect("b"), 20);
    }
}
