use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use ulid::Ulid;

use crate::engine::{Engine, TickOutcome};

const TICK: Duration = Duration::from_secs(1);

/// Countdown tasks for pending holds, one per reservation.
#[derive(Default)]
pub struct HoldTimers {
    running: DashMap<Ulid, CancellationToken>,
}

impl HoldTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the 1-second countdown for `id`. The first tick lands one period
    /// after the call. Restarting a running timer replaces it.
    pub fn start(&self, engine: Arc<Engine>, id: Ulid) {
        let token = CancellationToken::new();
        match self.running.entry(id) {
            Entry::Occupied(mut slot) => {
                slot.get().cancel();
                slot.insert(token.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + TICK, TICK);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => match engine.tick(id).await {
                        Ok(TickOutcome::Running(_)) => {}
                        Ok(TickOutcome::Expired(_)) => break,
                        Err(e) => {
                            debug!("timer for {id} stopped: {e}");
                            engine.timers.finish(&id, &token);
                            break;
                        }
                    },
                }
            }
        });
    }

    /// Cancel the countdown for `id`. Returns false if none was running.
    pub fn stop(&self, id: &Ulid) -> bool {
        match self.running.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the entry of a task that ended by itself. A token cancelled by a
    /// restart or `stop` no longer owns the entry.
    fn finish(&self, id: &Ulid, token: &CancellationToken) {
        self.running.remove_if(id, |_, _| !token.is_cancelled());
    }

    pub fn stop_all(&self) {
        self.running.retain(|_, token| {
            token.cancel();
            false
        });
    }

    pub fn is_running(&self, id: &Ulid) -> bool {
        self.running.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

impl Engine {
    /// Start the countdown for a freshly placed hold.
    pub fn start_hold_timer(self: &Arc<Self>, id: Ulid) {
        self.timers.start(Arc::clone(self), id);
    }

    pub fn stop_hold_timer(&self, id: &Ulid) -> bool {
        self.timers.stop(id)
    }

    pub fn hold_timer_running(&self, id: &Ulid) -> bool {
        self.timers.is_running(id)
    }

    /// Cancel every countdown, e.g. at shutdown.
    pub fn stop_all_hold_timers(&self) {
        self.timers.stop_all();
    }
}
