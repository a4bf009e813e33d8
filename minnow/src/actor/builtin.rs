//! Actor types shipped with the runtime.

use std::time::Duration;

use minnow_core::{Token, Value};

use crate::actor::behavior::{ActorBehavior, ActorContext, InitMode, ManagedAttributes};
use crate::error::ActorError;

/// Type name of [`Identity`].
pub const IDENTITY: &str = "std.Identity";
/// Type name of [`CountTimer`].
pub const COUNT_TIMER: &str = "std.CountTimer";

/// Forwards every token from in-port `token` to out-port `token`.
#[derive(Debug)]
pub struct Identity {
    dump: bool,
    managed: ManagedAttributes,
}

impl Identity {
    /// Factory registered as `std.Identity`.
    pub fn create(managed: &ManagedAttributes, _mode: InitMode) -> Result<Box<dyn ActorBehavior>, ActorError> {
        Ok(Box::new(Self {
            dump: managed.bool_or("dump", false)?,
            managed: managed.clone(),
        }))
    }
}

impl ActorBehavior for Identity {
    fn fire(&mut self, ctx: &mut ActorContext<'_>) -> bool {
        let ready = match ctx.inport("token") {
            Some(inport) => inport.tokens_available(1),
            None => false,
        };
        let room = match ctx.outport("token") {
            Some(outport) => outport.slots_available(1),
            None => false,
        };
        if !ready || !room {
            return false;
        }

        let Some(token) = ctx.inport("token").and_then(|f| f.peek()) else {
            return false;
        };
        if self.dump {
            tracing::info!(actor = %ctx.actor_id(), value = ?token.to_value().ok(), "identity");
        }

        let written = match ctx.outport("token") {
            Some(outport) => outport.write(token),
            None => return false,
        };
        match written {
            Ok(()) => ctx
                .inport("token")
                .is_some_and(|inport| inport.commit_read().is_ok()),
            Err(e) => {
                tracing::warn!(actor = %ctx.actor_id(), error = %e, "identity write failed");
                if let Some(inport) = ctx.inport("token") {
                    inport.cancel_commit();
                }
                false
            }
        }
    }

    fn serialize_state(&self) -> Result<ManagedAttributes, ActorError> {
        let mut managed = self.managed.clone();
        managed.set_value("dump", &Value::from(self.dump))?;
        Ok(managed)
    }
}

/// Emits `1, 2, 3, ...` on out-port `integer`, one token every `sleep`
/// seconds.
///
/// Managed attributes: `sleep` (seconds), `start` (delay before the first
/// token, defaults to `sleep`), `steps` (number of tokens, 0 for no limit)
/// and `count` (tokens emitted so far).
#[derive(Debug)]
pub struct CountTimer {
    sleep: Duration,
    start: Duration,
    steps: u64,
    count: u64,
    started: bool,
    managed: ManagedAttributes,
}

impl CountTimer {
    /// Factory registered as `std.CountTimer`.
    pub fn create(managed: &ManagedAttributes, mode: InitMode) -> Result<Box<dyn ActorBehavior>, ActorError> {
        let sleep = managed.seconds_or("sleep", Duration::from_secs(1))?;
        let start = managed.seconds_or("start", sleep)?;
        Ok(Box::new(Self {
            sleep,
            start,
            steps: managed.uint_or("steps", 0)?,
            count: managed.uint_or("count", 0)?,
            // A restored timer continues at its period.
            started: mode == InitMode::Restore,
            managed: managed.clone(),
        }))
    }

    fn done(&self) -> bool {
        self.steps != 0 && self.count >= self.steps
    }
}

impl ActorBehavior for CountTimer {
    fn fire(&mut self, ctx: &mut ActorContext<'_>) -> bool {
        if self.done() {
            return false;
        }
        if !ctx.timer_armed() {
            let delay = if self.started { self.sleep } else { self.start };
            self.started = true;
            ctx.arm_timer(delay);
            return false;
        }
        if !ctx.timer_expired() {
            return false;
        }

        let next = self.count + 1;
        let written = match (Token::from_uint(next), ctx.outport("integer")) {
            (Ok(token), Some(outport)) => outport.write(token).is_ok(),
            _ => false,
        };
        if written {
            self.count = next;
            tracing::debug!(actor = %ctx.actor_id(), count = next, "count timer tick");
        }
        if !self.done() {
            ctx.arm_timer(self.sleep);
        }
        written
    }

    fn serialize_state(&self) -> Result<ManagedAttributes, ActorError> {
        let mut managed = self.managed.clone();
        managed.set_value("count", &Value::from(self.count))?;
        Ok(managed)
    }
}
