//! The `Recurrent` scheduler (spec §4.6): a single jittered-interval
//! primitive shared by both of [`crate::frame::Frame`]'s periodic
//! behaviors — the scheduled restart tied to an agent's `ttl`, and the
//! `background` tick. Each tick is jittered to `[0.9, 1.1]` of the
//! nominal period so a cluster of frames with identical ttls does not
//! restart in lockstep.

use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::Notify;

/// A cancellable, re-targetable periodic timer.
pub struct Recurrent {
    period: RwLock<Duration>,
    wake: Notify,
    stopped: AtomicBool,
}

impl Recurrent {
    /// Builds a scheduler with the given nominal period. A zero period is
    /// valid and fires immediately on every loop iteration (used for the
    /// "boot" interval before an agent's first successful start, per spec
    /// §4.6).
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period: RwLock::new(period),
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Runs `tick` forever at the jittered period, until [`Recurrent::stop`]
    /// is called. `tick` may return `Some(new_period)` to adopt a new
    /// nominal period for subsequent iterations (e.g. an agent's
    /// `background` returning a different cadence).
    pub async fn run<F, Fut>(&self, mut tick: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<Duration>>,
    {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            let nominal = *self.period.read().expect("period lock poisoned");
            let sleep = jittered(nominal);
            tokio::select! {
                () = tokio::time::sleep(sleep) => {}
                () = self.wake.notified() => continue,
            }
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            if let Some(new_period) = tick().await {
                *self.period.write().expect("period lock poisoned") = new_period;
            }
        }
    }

    /// Stops the scheduler; a concurrently running [`Recurrent::run`]
    /// returns promptly rather than waiting out its current sleep.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    /// Re-targets the nominal period immediately, waking a sleeping
    /// `run` so the new period takes effect without waiting out the old
    /// one.
    pub fn set_period(&self, period: Duration) {
        *self.period.write().expect("period lock poisoned") = period;
        self.wake.notify_waiters();
    }
}

/// Scales `period` by a uniformly random factor in `[0.9, 1.1]`.
fn jittered(period: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_secs_f64((period.as_secs_f64() * factor).max(0.0))
}
