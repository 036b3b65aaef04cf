//! Per-session timers
//!
//! Each timer is a small tokio task that sleeps and then reports a
//! [`TimerFired`] back to the manager. The session owns the task handles;
//! disarming aborts the task and forgets the kind, so a fire that was already
//! queued is recognised as stale when it is handled.

use crate::types::CallId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// Timers a session can arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// No accept/reject within the dial window
    Dial,
    /// Periodic progress while dialing
    DialProgress,
    /// Media link not connected within the negotiation window
    ConnectTimeout,
    /// Periodic tick while connected
    Duration,
}

/// A timer went off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    /// Call that armed the timer
    pub call_id: CallId,
    /// Which timer
    pub kind: TimerKind,
    /// 1-based tick count for periodic timers, 0 for one-shot timers
    pub tick: u32,
}

type Notify = dyn Fn(TimerFired) + Send + Sync;

/// Timers owned by one call session
pub struct SessionTimers {
    call_id: CallId,
    notify: Arc<Notify>,
    armed: HashMap<TimerKind, JoinHandle<()>>,
}

impl SessionTimers {
    /// No timers armed yet
    pub fn new(call_id: CallId, notify: impl Fn(TimerFired) + Send + Sync + 'static) -> Self {
        Self {
            call_id,
            notify: Arc::new(notify),
            armed: HashMap::new(),
        }
    }

    /// Fire once after `after`
    ///
    /// Re-arming a kind replaces the previous timer of that kind.
    pub fn arm_once(&mut self, kind: TimerKind, after: Duration) {
        let call_id = self.call_id;
        let notify = self.notify.clone();
        let handle = tokio::spawn(async move {
            sleep(after).await;
            notify(TimerFired {
                call_id,
                kind,
                tick: 0,
            });
        });
        self.install(kind, handle);
    }

    /// Fire every `period` until disarmed
    pub fn arm_periodic(&mut self, kind: TimerKind, period: Duration) {
        let call_id = self.call_id;
        let notify = self.notify.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tick: u32 = 0;
            loop {
                ticker.tick().await;
                tick = tick.saturating_add(1);
                notify(TimerFired {
                    call_id,
                    kind,
                    tick,
                });
            }
        });
        self.install(kind, handle);
    }

    fn install(&mut self, kind: TimerKind, handle: JoinHandle<()>) {
        if let Some(previous) = self.armed.insert(kind, handle) {
            previous.abort();
        }
        tracing::trace!(call_id = %self.call_id, timer = ?kind, "Timer armed");
    }

    /// Abort a timer; returns whether it was armed
    pub fn disarm(&mut self, kind: TimerKind) -> bool {
        match self.armed.remove(&kind) {
            Some(handle) => {
                handle.abort();
                tracing::trace!(call_id = %self.call_id, timer = ?kind, "Timer disarmed");
                true
            }
            None => false,
        }
    }

    /// Abort every timer
    pub fn disarm_all(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.abort();
        }
    }

    /// Whether a fire of `kind` should still be honored
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Number of armed timers
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        self.disarm_all();
    }
}

impl std::fmt::Debug for SessionTimers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTimers")
            .field("call_id", &self.call_id)
            .field("armed", &self.armed.keys().collect::<Vec<_>>())
            .finish()
    }
}
