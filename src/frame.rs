//! Frame supervisor (C6, spec §4.6): the state machine that owns one
//! running instance of an agent under a single role.
//!
//! `New → Starting → Running ⇄ Paused → Stopping → Stopped`. A frame
//! drives two independent [`Recurrent`] schedules off the same agent: a
//! scheduled restart tied to [`Agent::ttl`], and the `background` tick.
//! Calls into a non-[`Agent::concurrent`] agent are serialized by an
//! exclusive gate; a call chain that loops back into a frame already on
//! its own stack is rejected as [`SchematError::NestedLock`] rather than
//! deadlocking on that gate.

use crate::agent::{resolve_role, Agent, CallContext};
use crate::error::SchematError;
use crate::ids::{Fid, ObjectId, Role};
use crate::recurrent::Recurrent;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, instrument, warn};

/// Boot-time restart interval, used until an agent's first successful
/// start, to converge quickly instead of waiting out a long `ttl` (spec
/// §4.6 "boot interval").
const BOOT_RESTART_INTERVAL: Duration = Duration::from_millis(500);

/// Default `background` tick period, adopted until the agent's
/// `background` hook returns a different interval (spec §4.6: "schedules
/// a `Recurrent` background task with default period 5 s").
const DEFAULT_BACKGROUND_INTERVAL: Duration = Duration::from_secs(5);

/// The restart scheduler's nominal period: `ttl` itself, or the boot
/// interval while `ttl <= 0` (spec §4.6).
fn restart_period_for(ttl: Duration) -> Duration {
    if ttl.is_zero() {
        BOOT_RESTART_INTERVAL
    } else {
        ttl
    }
}

/// A frame's lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Constructed but not yet started.
    New,
    /// Running the agent's `start` hook.
    Starting,
    /// Accepting calls normally.
    Running,
    /// Accepting no new calls; in-flight calls still complete (entered
    /// cooperatively, via [`Frame::pause`]).
    Paused,
    /// Draining: rejects new calls with [`SchematError::StoppingNow`],
    /// runs the agent's `stop` hook once drained.
    Stopping,
    /// Fully stopped; the frame is inert and should be dropped.
    Stopped,
}

/// One running instance of an agent under a single role.
pub struct Frame {
    fid: Fid,
    agent: RwLock<Arc<dyn Agent>>,
    role: Role,
    state: RwLock<FrameState>,
    frame_state: RwLock<JsonValue>,
    stopping: AtomicBool,
    pause_notify: Notify,
    exclusive: AsyncMutex<()>,
    restart_scheduler: Recurrent,
    background_scheduler: Recurrent,
    /// Frame-unique ids of calls currently running the agent's method body
    /// (spec §3 Frame's `calls`: "set of in-flight call handles; every
    /// tracked call removes itself on completion").
    calls: Mutex<HashSet<u64>>,
    next_call_id: AtomicU64,
    calls_drained: Notify,
    /// Set while a [`Frame::lock`] guard is alive; new calls wait behind
    /// it (spec §4.6 `lock`).
    locked: AtomicBool,
    lock_notify: Notify,
}

impl Frame {
    /// Constructs a new, unstarted frame for `agent` under `role`.
    #[must_use]
    pub fn new(agent: Arc<dyn Agent>, role: Role) -> Arc<Self> {
        let ttl = agent.ttl();
        Arc::new(Self {
            fid: Fid::generate(),
            restart_scheduler: Recurrent::new(restart_period_for(ttl)),
            background_scheduler: Recurrent::new(DEFAULT_BACKGROUND_INTERVAL),
            agent: RwLock::new(agent),
            role,
            state: RwLock::new(FrameState::New),
            frame_state: RwLock::new(JsonValue::Null),
            stopping: AtomicBool::new(false),
            pause_notify: Notify::new(),
            exclusive: AsyncMutex::new(()),
            calls: Mutex::new(HashSet::new()),
            next_call_id: AtomicU64::new(0),
            calls_drained: Notify::new(),
            locked: AtomicBool::new(false),
            lock_notify: Notify::new(),
        })
    }

    /// Registers a new in-flight call, returning its handle id.
    fn begin_call(&self) -> u64 {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().expect("calls lock poisoned").insert(id);
        id
    }

    /// Deregisters an in-flight call, waking anything draining on an empty
    /// `calls` set.
    fn end_call(&self, id: u64) {
        let mut calls = self.calls.lock().expect("calls lock poisoned");
        calls.remove(&id);
        if calls.is_empty() {
            drop(calls);
            self.calls_drained.notify_waiters();
        }
    }

    /// Awaits every currently in-flight call's completion.
    async fn drain_calls(&self) {
        loop {
            let notified = self.calls_drained.notified();
            if self.calls.lock().expect("calls lock poisoned").is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// This frame's id.
    #[must_use]
    pub fn fid(&self) -> Fid {
        self.fid
    }

    /// Clones out the currently-installed agent reference.
    #[must_use]
    pub fn current_agent(&self) -> Arc<dyn Agent> {
        Arc::clone(&self.agent.read().expect("frame agent lock poisoned"))
    }

    /// The agent's object id.
    #[must_use]
    pub fn object_id(&self) -> ObjectId {
        self.current_agent().id()
    }

    /// The role this frame serves.
    #[must_use]
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn state(&self) -> FrameState {
        *self.state.read().expect("frame state lock poisoned")
    }

    fn set_state(&self, state: FrameState) {
        *self.state.write().expect("frame state lock poisoned") = state;
    }

    /// Runs the agent's `start` hook and transitions `New -> Starting ->
    /// Running`, then spawns the restart/background schedulers.
    ///
    /// # Errors
    ///
    /// Propagates the agent's `start` error; the frame stays `Starting`
    /// (never reaches `Running`) so a caller can retry or tear it down.
    #[instrument(skip(self), fields(fid = %self.fid, agent = %self.object_id()))]
    pub async fn start(self: &Arc<Self>) -> Result<(), SchematError> {
        self.set_state(FrameState::Starting);
        let initial = self.current_agent().start().await?;
        *self.frame_state.write().expect("frame state lock poisoned") = initial;
        self.set_state(FrameState::Running);
        self.spawn_schedulers();
        info!("frame started");
        Ok(())
    }

    fn spawn_schedulers(self: &Arc<Self>) {
        let restart_frame = Arc::clone(self);
        tokio::spawn(async move {
            restart_frame
                .restart_scheduler
                .run(|| {
                    let frame = Arc::clone(&restart_frame);
                    async move { frame.scheduled_restart_tick().await }
                })
                .await;
        });

        let background_frame = Arc::clone(self);
        tokio::spawn(async move {
            background_frame
                .background_scheduler
                .run(|| {
                    let frame = Arc::clone(&background_frame);
                    async move { frame.background_tick().await }
                })
                .await;
        });
    }

    async fn scheduled_restart_tick(self: &Arc<Self>) -> Option<Duration> {
        if self.stopping.load(Ordering::Acquire) {
            return None;
        }
        // Re-runs `restart` against the currently-installed agent; a
        // full hot-swap to a *different* agent reference is driven by
        // `Kernel::refresh_agent` via `Frame::hot_swap`, not by this tick.
        let agent = self.current_agent();
        let prev_state = self
            .frame_state
            .read()
            .expect("frame state lock poisoned")
            .clone();
        match agent.restart(prev_state, agent.as_ref()).await {
            Ok(new_state) => {
                *self.frame_state.write().expect("frame state lock poisoned") = new_state;
            }
            Err(e) => warn!(error = %e, "scheduled restart hook failed"),
        }
        Some(restart_period_for(agent.ttl()))
    }

    async fn background_tick(self: &Arc<Self>) -> Option<Duration> {
        if self.stopping.load(Ordering::Acquire) || self.state() == FrameState::Paused {
            return None;
        }
        let snapshot = self.frame_state.read().expect("frame state lock poisoned").clone();
        self.current_agent().background(&snapshot).await
    }

    /// Swaps in `new_agent`, running its `restart` hook against the
    /// outgoing agent and the frame's current state (spec §4.7 hot
    /// reload: "the frame, its `fid`, and its routing record all survive
    /// a reload — only the agent reference underneath changes").
    ///
    /// # Errors
    ///
    /// Propagates the new agent's `restart` error; the old agent stays
    /// installed if `restart` fails.
    #[instrument(skip(self, new_agent), fields(fid = %self.fid))]
    pub async fn hot_swap(self: &Arc<Self>, new_agent: Arc<dyn Agent>) -> Result<(), SchematError> {
        let old_agent = self.current_agent();
        let prev_state = self.frame_state.read().expect("frame state lock poisoned").clone();
        let new_state = new_agent.restart(prev_state, old_agent.as_ref()).await?;
        *self.frame_state.write().expect("frame state lock poisoned") = new_state;
        *self.agent.write().expect("frame agent lock poisoned") = new_agent;
        info!("frame hot-swapped to new agent reference");
        Ok(())
    }

    /// Cooperatively pauses the frame: new calls to [`Frame::exec`] wait
    /// until [`Frame::resume`]; the returned future resolves once every
    /// call already running has completed (spec §4.6 `pause`: "returns a
    /// promise that resolves when currently running calls finish").
    pub async fn pause(&self) {
        self.set_state(FrameState::Paused);
        self.drain_calls().await;
    }

    /// Resumes a paused frame, waking any calls parked in `exec`.
    pub fn resume(&self) {
        self.set_state(FrameState::Running);
        self.pause_notify.notify_waiters();
    }

    /// Begins draining the frame: new calls are rejected with
    /// [`SchematError::StoppingNow`], schedulers are cancelled, and once
    /// the exclusivity gate is free the agent's `stop` hook runs.
    ///
    /// Spec's "stopping wins" Open Question: a scheduled restart racing a
    /// `stop` never re-arms — `stopping` is checked at the top of every
    /// scheduler tick, so the restart quietly no-ops instead of reviving a
    /// frame mid-teardown.
    ///
    /// # Errors
    ///
    /// Propagates the agent's `stop` error; the frame still transitions to
    /// `Stopped` regardless; `stop` is not retried.
    #[instrument(skip(self), fields(fid = %self.fid, agent = %self.object_id()))]
    pub async fn stop(self: &Arc<Self>) -> Result<(), SchematError> {
        self.stopping.store(true, Ordering::Release);
        self.set_state(FrameState::Stopping);
        self.restart_scheduler.stop();
        self.background_scheduler.stop();
        self.pause_notify.notify_waiters();
        self.lock_notify.notify_waiters();

        // Awaits every in-flight call, concurrent or serialized, so
        // `agent.stop` never races a still-running method body.
        self.drain_calls().await;
        let final_state = self.frame_state.read().expect("frame state lock poisoned").clone();
        let result = self.current_agent().stop(final_state).await;
        self.set_state(FrameState::Stopped);
        info!("frame stopped");
        result
    }

    /// Drain-then-exclusive lock (spec §4.6 `lock`): awaits every
    /// currently in-flight call, then returns a guard that blocks new
    /// calls from starting until it is dropped. A call chain that is
    /// already holding this frame's lock is rejected rather than
    /// deadlocking on itself.
    ///
    /// # Errors
    ///
    /// [`SchematError::NestedLock`] if the frame is already locked.
    pub async fn lock(self: &Arc<Self>) -> Result<FrameLock, SchematError> {
        if self.locked.swap(true, Ordering::AcqRel) {
            return Err(SchematError::NestedLock(self.object_id()));
        }
        self.drain_calls().await;
        Ok(FrameLock { frame: Arc::clone(self) })
    }

    /// Executes `command` on this frame. Resolution order (spec §4.6):
    /// 1. resolve `role.command`, falling back to `$agent.command`;
    /// 2. reject with `StoppingNow` if the frame is draining;
    /// 3. detect a call chain looping back into this frame;
    /// 4. cooperatively wait out a `Paused` state;
    /// 5. acquire the exclusivity gate (skipped for concurrent agents)
    ///    and invoke the agent.
    ///
    /// # Errors
    ///
    /// [`SchematError::NotFound`] if no role resolves the command,
    /// [`SchematError::StoppingNow`] if the frame is draining,
    /// [`SchematError::NestedLock`] on a self-referential call chain, or
    /// whatever the agent's `call` returns.
    pub async fn exec(
        self: &Arc<Self>,
        command: &str,
        args: Vec<JsonValue>,
        ctx: &CallContext,
    ) -> Result<JsonValue, SchematError> {
        // Step 1: resolve role, falling back to $agent.
        let agent = self.current_agent();
        let fallback = Role::agent();
        let resolved = resolve_role(agent.as_ref(), &self.role, command)
            .or_else(|| resolve_role(agent.as_ref(), &fallback, command))
            .cloned()
            .ok_or_else(|| SchematError::NotFound(format!("command {command} on {}", self.role)))?;

        // Step 2: reject new calls once draining.
        if self.stopping.load(Ordering::Acquire) {
            return Err(SchematError::StoppingNow);
        }

        // Step 3: guard against this call chain looping back into self.
        ctx.enter(self.fid, agent.id())?;
        let _guard = CallGuard { ctx, fid: self.fid };

        // Step 4: cooperative pause.
        while self.state() == FrameState::Paused {
            self.pause_notify.notified().await;
        }
        if self.stopping.load(Ordering::Acquire) {
            return Err(SchematError::StoppingNow);
        }

        // Step 4.5: honor an in-progress lock() (spec §4.6 property 5:
        // "while a lock(fn) is in progress, no new call's body begins
        // until fn resolves").
        while self.locked.load(Ordering::Acquire) {
            self.lock_notify.notified().await;
        }
        if self.stopping.load(Ordering::Acquire) {
            return Err(SchematError::StoppingNow);
        }

        // Step 5: exclusivity gate, then invoke, tracked as in-flight.
        debug!(command, role = %resolved, "frame exec");
        if agent.concurrent() {
            let call_id = self.begin_call();
            let _call_guard = ActiveCallGuard { frame: self, id: call_id };
            let snapshot = self.frame_state.read().expect("frame state lock poisoned").clone();
            agent.call(&resolved, command, &snapshot, args, ctx).await
        } else {
            let _exclusive = self.exclusive.lock().await;
            if self.stopping.load(Ordering::Acquire) {
                return Err(SchematError::StoppingNow);
            }
            let call_id = self.begin_call();
            let _call_guard = ActiveCallGuard { frame: self, id: call_id };
            let snapshot = self.frame_state.read().expect("frame state lock poisoned").clone();
            agent.call(&resolved, command, &snapshot, args, ctx).await
        }
    }
}

/// RAII guard returned by [`Frame::lock`]: while alive, new [`Frame::exec`]
/// calls wait behind it. Releasing (on drop) wakes anything parked in
/// `exec`'s step 4.5.
pub struct FrameLock {
    frame: Arc<Frame>,
}

impl Drop for FrameLock {
    fn drop(&mut self) {
        self.frame.locked.store(false, Ordering::Release);
        self.frame.lock_notify.notify_waiters();
    }
}

/// Tracks one call in [`Frame::calls`] for the duration of its method
/// body, removing itself on drop so [`Frame::drain_calls`] always
/// observes an accurate count even if the call panics or is cancelled.
struct ActiveCallGuard<'a> {
    frame: &'a Frame,
    id: u64,
}

impl Drop for ActiveCallGuard<'_> {
    fn drop(&mut self) {
        self.frame.end_call(self.id);
    }
}

struct CallGuard<'a> {
    ctx: &'a CallContext,
    fid: Fid,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.ctx.leave(self.fid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{EchoAgent, TxHandle};

    #[tokio::test]
    async fn start_transitions_to_running_and_serves_calls() {
        let agent = Arc::new(EchoAgent::new(ObjectId::new(1), Duration::from_secs(60)));
        let frame = Frame::new(agent, Role::agent());
        frame.start().await.unwrap();
        assert_eq!(frame.state(), FrameState::Running);

        let ctx = CallContext::new(None, TxHandle::default());
        let out = frame.exec("ping", vec![JsonValue::from(7)], &ctx).await.unwrap();
        assert_eq!(out, JsonValue::from(7));
    }

    #[tokio::test]
    async fn stop_rejects_subsequent_calls() {
        let agent = Arc::new(EchoAgent::new(ObjectId::new(2), Duration::from_secs(60)));
        let frame = Frame::new(agent, Role::agent());
        frame.start().await.unwrap();
        frame.stop().await.unwrap();
        assert_eq!(frame.state(), FrameState::Stopped);

        let ctx = CallContext::new(None, TxHandle::default());
        let err = frame.exec("ping", vec![], &ctx).await.unwrap_err();
        assert!(matches!(err, SchematError::StoppingNow));
    }

    #[tokio::test]
    async fn unknown_command_is_not_found() {
        let agent = Arc::new(EchoAgent::new(ObjectId::new(3), Duration::from_secs(60)));
        let frame = Frame::new(agent, Role::agent());
        frame.start().await.unwrap();
        let ctx = CallContext::new(None, TxHandle::default());
        let err = frame.exec("missing", vec![], &ctx).await.unwrap_err();
        assert!(matches!(err, SchematError::NotFound(_)));
    }

    #[tokio::test]
    async fn self_referential_call_chain_is_nested_lock() {
        let agent = Arc::new(EchoAgent::new(ObjectId::new(4), Duration::from_secs(60)));
        let frame = Frame::new(agent, Role::agent());
        frame.start().await.unwrap();

        let ctx = CallContext::new(None, TxHandle::default());
        ctx.enter(frame.fid(), frame.object_id()).unwrap();
        let err = frame.exec("ping", vec![], &ctx).await.unwrap_err();
        assert!(matches!(err, SchematError::NestedLock(_)));
    }

    #[tokio::test]
    async fn pause_blocks_exec_until_resume() {
        let agent = Arc::new(EchoAgent::new(ObjectId::new(5), Duration::from_secs(60)));
        let frame = Frame::new(agent, Role::agent());
        frame.start().await.unwrap();
        frame.pause().await;
        assert_eq!(frame.state(), FrameState::Paused);

        let frame2 = Arc::clone(&frame);
        let call = tokio::spawn(async move {
            let ctx = CallContext::new(None, TxHandle::default());
            frame2.exec("ping", vec![JsonValue::from(1)], &ctx).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!call.is_finished());
        frame.resume();
        let result = tokio::time::timeout(Duration::from_secs(1), call).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), JsonValue::from(1));
    }

    #[tokio::test]
    async fn hot_swap_preserves_fid_and_installs_new_agent() {
        let agent = Arc::new(EchoAgent::new(ObjectId::new(6), Duration::from_secs(60)));
        let frame = Frame::new(agent, Role::agent());
        frame.start().await.unwrap();
        let fid_before = frame.fid();

        let concurrent_agent = Arc::new(EchoAgent::concurrent(ObjectId::new(6), Duration::from_secs(60)));
        frame.hot_swap(concurrent_agent).await.unwrap();

        assert_eq!(frame.fid(), fid_before);
        assert!(frame.current_agent().concurrent());
    }

    #[tokio::test]
    async fn pause_waits_for_an_in_flight_call_to_finish() {
        let agent = Arc::new(EchoAgent::new(ObjectId::new(7), Duration::from_secs(60)));
        let frame = Frame::new(agent, Role::agent());
        frame.start().await.unwrap();

        let frame2 = Arc::clone(&frame);
        let call = tokio::spawn(async move {
            let ctx = CallContext::new(None, TxHandle::default());
            frame2.exec("sleep", vec![JsonValue::from(30u64)], &ctx).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::timeout(Duration::from_secs(1), frame.pause())
            .await
            .expect("pause should resolve once the in-flight call drains");
        assert!(call.is_finished(), "pause must not resolve before the running call completes");
    }

    #[tokio::test]
    async fn lock_rejects_nested_acquisition() {
        let agent = Arc::new(EchoAgent::new(ObjectId::new(8), Duration::from_secs(60)));
        let frame = Frame::new(agent, Role::agent());
        frame.start().await.unwrap();

        let _guard = frame.lock().await.unwrap();
        let err = frame.lock().await.unwrap_err();
        assert!(matches!(err, SchematError::NestedLock(_)));
    }

    #[tokio::test]
    async fn lock_blocks_new_concurrent_calls_until_released() {
        let agent = Arc::new(EchoAgent::concurrent(ObjectId::new(9), Duration::from_secs(60)));
        let frame = Frame::new(agent, Role::agent());
        frame.start().await.unwrap();

        let guard = frame.lock().await.unwrap();
        let frame2 = Arc::clone(&frame);
        let call = tokio::spawn(async move {
            let ctx = CallContext::new(None, TxHandle::default());
            frame2.exec("ping", vec![JsonValue::from(1)], &ctx).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!call.is_finished(), "a new call must not start body execution while locked");
        drop(guard);

        let result = tokio::time::timeout(Duration::from_secs(1), call).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), JsonValue::from(1));
    }
}
