//! The `Agent` contract: the narrow trait boundary through which the
//! runtime kernel reaches into the (out-of-scope) object model.
//!
//! Spec §1 explicitly keeps the object model itself — schemas, property
//! imputation, the object proxy — outside the core. What the kernel needs
//! from an agent is exactly: `start`/`stop`/`restart`/`background`
//! lifecycle hooks, a per-`(role, command)` dispatch table (spec §9's
//! "tagged dispatch"), `ttl`, and `concurrent`.

use crate::error::SchematError;
use crate::ids::{Fid, ObjectId, Role};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

/// Opaque transaction descriptor re-entered at the call target (spec §5
/// "Transactions"). The transaction engine itself is out of scope; the
/// kernel only threads this value through.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TxHandle(pub Option<JsonValue>);

/// Context available to a running command: the caller's app/database id,
/// the transaction to re-enter, and a sink for object-mutation records the
/// caller should refresh (spec §4.4: a response's `records` field).
#[derive(Debug)]
pub struct CallContext {
    /// Database/app id the call should run against.
    pub ctx: Option<JsonValue>,
    /// Transaction descriptor inherited from the caller.
    pub tx: TxHandle,
    records: Mutex<Vec<JsonValue>>,
    visiting: Mutex<HashSet<Fid>>,
}

impl CallContext {
    /// Builds a context with no transaction and no app scope.
    #[must_use]
    pub fn new(ctx: Option<JsonValue>, tx: TxHandle) -> Self {
        Self {
            ctx,
            tx,
            records: Mutex::new(Vec::new()),
            visiting: Mutex::new(HashSet::new()),
        }
    }

    /// Marks `fid` as being executed within this call chain. A frame that
    /// calls back into itself (directly or via a cycle of other frames)
    /// while already on this chain would deadlock on its own exclusivity
    /// lock; this is how [`crate::frame::Frame::exec`] detects that case
    /// up front instead.
    ///
    /// # Errors
    ///
    /// Returns [`SchematError::NestedLock`] if `fid`'s agent is already on
    /// this call chain. The `agent` argument is only used for the error
    /// message.
    pub fn enter(&self, fid: Fid, agent: ObjectId) -> Result<(), SchematError> {
        let mut visiting = self.visiting.lock().expect("visiting mutex poisoned");
        if !visiting.insert(fid) {
            return Err(SchematError::NestedLock(agent));
        }
        Ok(())
    }

    /// Removes `fid` from this call chain once its call has returned.
    pub fn leave(&self, fid: Fid) {
        self.visiting.lock().expect("visiting mutex poisoned").remove(&fid);
    }

    /// Record a mutated object so the caller can refresh its registry.
    pub fn record(&self, mutated: JsonValue) {
        self.records
            .lock()
            .expect("records mutex poisoned")
            .push(mutated);
    }

    /// Drain the accumulated mutation records.
    #[must_use]
    pub fn take_records(&self) -> Vec<JsonValue> {
        std::mem::take(&mut self.records.lock().expect("records mutex poisoned"))
    }
}

/// A web object that runs as a long-lived microservice on a worker.
///
/// Implementors are the out-of-scope object model's concern in a real
/// deployment; the kernel is generic over this trait so it can be built
/// and tested without a database.
#[async_trait]
pub trait Agent: Send + Sync + std::fmt::Debug {
    /// The agent's numeric object id.
    fn id(&self) -> ObjectId;

    /// Scheduled-restart period. `Duration::ZERO` during boot uses the
    /// short "boot" interval (spec §4.6) to converge quickly.
    fn ttl(&self) -> Duration;

    /// Whether a frame may interleave calls to this agent.
    fn concurrent(&self) -> bool {
        false
    }

    /// Whether `role.command` (or the `$agent` fallback) exists on this
    /// agent's dispatch table, without running it. Used by `Frame::exec`
    /// step (1)/(5) to resolve and re-resolve the method.
    fn has_command(&self, role: &Role, command: &str) -> bool;

    /// Runs inside the agent's app context when a frame is first started.
    /// Returns the initial frame state.
    async fn start(&self) -> Result<JsonValue, SchematError> {
        Ok(JsonValue::Null)
    }

    /// Runs when a frame is stopped; `state` is the frame's current state.
    async fn stop(&self, _state: JsonValue) -> Result<(), SchematError> {
        Ok(())
    }

    /// Runs after the agent reference has been reloaded; receives the
    /// frame's previous state and a handle to the agent it is replacing.
    /// Default keeps the previous state unchanged.
    async fn restart(
        &self,
        prev_state: JsonValue,
        _prev_agent: &(dyn Agent),
    ) -> Result<JsonValue, SchematError> {
        Ok(prev_state)
    }

    /// Periodic background tick. Returning `Some(interval)` adopts a new
    /// period for the next tick (spec §4.6 Recurrent scheduler); `None`
    /// keeps the previous interval.
    async fn background(&self, _state: &JsonValue) -> Option<Duration> {
        None
    }

    /// Executes `role.command`, falling back to `$agent.command` is the
    /// caller's (the `Frame`'s) responsibility via [`Agent::has_command`];
    /// by the time `call` runs, `role` has already been resolved to the
    /// role the method actually lives under.
    async fn call(
        &self,
        role: &Role,
        command: &str,
        state: &JsonValue,
        args: Vec<JsonValue>,
        ctx: &CallContext,
    ) -> Result<JsonValue, SchematError>;
}

/// Resolves `{role}.{command}` with fallback to `{$agent}.{command}`, per
/// spec §4.6 `exec` step (1)/(5).
#[must_use]
pub fn resolve_role<'a>(agent: &dyn Agent, role: &'a Role, command: &str) -> Option<&'a Role> {
    if agent.has_command(role, command) {
        Some(role)
    } else {
        None
    }
}

/// A minimal echo agent used in tests and the single-node demo (spec §8
/// scenario S1): `$agent.ping(_, x)` returns `x`, `$agent.sleep(_, ms)`
/// sleeps for `ms` milliseconds and returns `ms`.
#[derive(Debug)]
pub struct EchoAgent {
    id: ObjectId,
    ttl: Duration,
    concurrent: bool,
}

impl EchoAgent {
    /// Builds an echo agent with the given id and ttl.
    #[must_use]
    pub fn new(id: ObjectId, ttl: Duration) -> Self {
        Self {
            id,
            ttl,
            concurrent: false,
        }
    }

    /// Builds an echo agent that allows overlapping calls.
    #[must_use]
    pub fn concurrent(id: ObjectId, ttl: Duration) -> Self {
        Self {
            id,
            ttl,
            concurrent: true,
        }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    fn concurrent(&self) -> bool {
        self.concurrent
    }

    fn has_command(&self, role: &Role, command: &str) -> bool {
        *role == Role::agent() && matches!(command, "ping" | "sleep")
    }

    async fn call(
        &self,
        _role: &Role,
        command: &str,
        _state: &JsonValue,
        mut args: Vec<JsonValue>,
        _ctx: &CallContext,
    ) -> Result<JsonValue, SchematError> {
        match command {
            "ping" => Ok(args.drain(..).next().unwrap_or(JsonValue::Null)),
            "sleep" => {
                let ms = args
                    .first()
                    .and_then(JsonValue::as_u64)
                    .ok_or_else(|| SchematError::SchemaValue("sleep requires ms: u64".into()))?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(JsonValue::from(ms))
            }
            other => Err(SchematError::NotFound(format!("command {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_agent_ping_returns_argument() {
        let agent = EchoAgent::new(ObjectId::new(100), Duration::from_secs(60));
        let ctx = CallContext::new(None, TxHandle::default());
        let out = agent
            .call(
                &Role::agent(),
                "ping",
                &JsonValue::Null,
                vec![JsonValue::from("hello")],
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out, JsonValue::from("hello"));
    }

    #[tokio::test]
    async fn echo_agent_unknown_command_not_found() {
        let agent = EchoAgent::new(ObjectId::new(100), Duration::from_secs(60));
        let ctx = CallContext::new(None, TxHandle::default());
        let err = agent
            .call(&Role::agent(), "missing", &JsonValue::Null, vec![], &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SchematError::NotFound(_)));
    }
}
