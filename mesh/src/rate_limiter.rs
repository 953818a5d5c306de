//! Trailing-edge rate limiter
//!
//! Runs an action at most once per `1 / max_rate` seconds. The first
//! activation after a quiet period runs the action immediately; any number of
//! activations during the following cooldown collapse into exactly one run at
//! the end of the window.
//!
//! State machine, with a single scheduled wake-up timer:
//!
//! ```text
//!            activate (runs)                 timer, pending (runs)
//!   Idle ───────────────────► Cooldown{no} ◄──────────────────────┐
//!    ▲                          │      │ activate                 │
//!    │ timer, not pending       │      ▼                          │
//!    └──────────────────────────┘  Cooldown{pending} ─────────────┘
//!
//!   any state ── cancel ──► Cancelled
//! ```
//!
//! The timer is tagged with a generation number. Rescheduling or cancelling
//! bumps the generation, so a wake-up that lost the race never runs the action.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::trace;

use crate::{config::validate_rate, error::EdgeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterState {
    Idle,
    Cooldown { pending: bool },
    Cancelled,
}

type Action = Box<dyn Fn() + Send + Sync>;

struct LimiterInner {
    state: LimiterState,
    max_rate: f64,
    last_run: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

struct Shared {
    inner: Mutex<LimiterInner>,
    action: Action,
}

/// Rate limiter handle. Dropping it cancels any scheduled run.
///
/// Must be used from within a Tokio runtime; deferred runs are driven by a
/// spawned timer task.
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("RateLimiter")
            .field("state", &inner.state)
            .field("max_rate", &inner.max_rate)
            .finish()
    }
}

fn interval_for(max_rate: f64) -> Duration {
    Duration::from_secs_f64(1.0 / max_rate)
}

impl RateLimiter {
    /// Create a limiter running `action` at most `max_rate` times per second.
    pub fn new<F>(max_rate: f64, action: F) -> EdgeResult<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        validate_rate("max_rate", max_rate)?;
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(LimiterInner {
                    state: LimiterState::Idle,
                    max_rate,
                    last_run: None,
                    timer: None,
                    generation: 0,
                }),
                action: Box::new(action),
            }),
        })
    }

    /// Request a run of the action as soon as the rate allows.
    pub fn activate(&self) {
        let run_now = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                LimiterState::Cancelled => false,
                LimiterState::Cooldown { .. } => {
                    inner.state = LimiterState::Cooldown { pending: true };
                    false
                }
                LimiterState::Idle => {
                    let now = Instant::now();
                    inner.last_run = Some(now);
                    inner.state = LimiterState::Cooldown { pending: false };
                    let deadline = now + interval_for(inner.max_rate);
                    schedule(&self.shared, &mut inner, deadline);
                    true
                }
            }
        };

        if run_now {
            (self.shared.action)();
        }
    }

    /// Permanently disable the limiter. A scheduled run will not fire.
    pub fn cancel(&self) {
        let mut inner = self.shared.inner.lock();
        inner.state = LimiterState::Cancelled;
        inner.generation = inner.generation.wrapping_add(1);
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }

    /// Change the rate. A cooldown in progress is re-timed against the new
    /// rate, keeping any pending run.
    pub fn set_max_rate(&self, max_rate: f64) -> EdgeResult<()> {
        validate_rate("max_rate", max_rate)?;
        let mut inner = self.shared.inner.lock();
        inner.max_rate = max_rate;
        if let (LimiterState::Cooldown { .. }, Some(last_run)) = (inner.state, inner.last_run) {
            let deadline = last_run + interval_for(max_rate);
            schedule(&self.shared, &mut inner, deadline);
        }
        Ok(())
    }

    pub fn max_rate(&self) -> f64 {
        self.shared.inner.lock().max_rate
    }

    pub fn state(&self) -> LimiterState {
        self.shared.inner.lock().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == LimiterState::Cancelled
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.cancel();
    }
}

// Replaces any existing timer; there is never more than one per limiter.
fn schedule(shared: &Arc<Shared>, inner: &mut LimiterInner, deadline: Instant) {
    if let Some(timer) = inner.timer.take() {
        timer.abort();
    }
    inner.generation = inner.generation.wrapping_add(1);
    let generation = inner.generation;
    let weak: Weak<Shared> = Arc::downgrade(shared);
    inner.timer = Some(tokio::spawn(async move {
        sleep_until(deadline).await;
        if let Some(shared) = weak.upgrade() {
            on_timer(&shared, generation);
        }
    }));
}

fn on_timer(shared: &Arc<Shared>, generation: u64) {
    let run = {
        let mut inner = shared.inner.lock();
        if inner.generation != generation {
            trace!(generation, "Stale limiter wake-up ignored");
            return;
        }
        // The handle belongs to the task running this; detach instead of aborting.
        inner.timer = None;
        match inner.state {
            LimiterState::Cooldown { pending: true } => {
                let now = Instant::now();
                inner.last_run = Some(now);
                inner.state = LimiterState::Cooldown { pending: false };
                let deadline = now + interval_for(inner.max_rate);
                schedule(shared, &mut inner, deadline);
                true
            }
            LimiterState::Cooldown { pending: false } => {
                inner.state = LimiterState::Idle;
                false
            }
            LimiterState::Idle | LimiterState::Cancelled => false,
        }
    };

    if run {
        (shared.action)();
    }
}
