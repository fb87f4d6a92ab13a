mod availability;
mod conflict;
mod error;
mod intervals;
mod mutations;
mod queries;
mod status;

pub use availability::{merge_availability, MergeContext};
pub use error::EngineError;
pub use intervals::{generate_intervals, DEFAULT_STEP_MINUTES};
pub use mutations::TickOutcome;
pub use status::{resolve_slot_status, tooltip, SlotPolicy, SlotVerdict};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::timer::HoldTimers;
use crate::wal::Wal;

pub type SharedDayState = Arc<RwLock<DayState>>;

/// Tunables for slot computation and holds.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Hold duration in seconds.
    pub hold_seconds: u32,
    pub lead_time_ms: Ms,
    pub step_minutes: u32,
    /// Used when a query does not name a timezone.
    pub default_timezone: Tz,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_seconds: 1800,
            lead_time_ms: SlotPolicy::DEFAULT_LEAD_TIME_MS,
            step_minutes: DEFAULT_STEP_MINUTES,
            default_timezone: chrono_tz::America::Los_Angeles,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that arrive while a batch is being collected share a
/// single fsync; any other command flushes the open batch first.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch: Vec<Pending> = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes never join the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    /// Windows and active reservations, sharded by date.
    pub days: DashMap<NaiveDate, SharedDayState>,
    pub providers: DashMap<Ulid, ProviderInfo>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → date it lives on.
    pub(super) reservation_dates: DashMap<Ulid, NaiveDate>,
    pub config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) timers: HoldTimers,
}

/// Seconds left until `expires_at`, rounded up.
pub(crate) fn seconds_left(expires_at: Ms, now: Ms) -> u32 {
    let ms = (expires_at - now).max(0);
    ((ms + 999) / 1000).min(u32::MAX as Ms) as u32
}

/// Apply an event to one day (no locking, caller holds the lock).
fn apply_to_day(day: &mut DayState, event: &Event, index: &DashMap<Ulid, NaiveDate>, now: Ms) {
    match event {
        Event::AvailabilityPublished {
            provider_id,
            date,
            span,
            timezone,
        } => {
            day.windows.insert(
                *provider_id,
                AvailabilityWindow {
                    provider_id: *provider_id,
                    date: *date,
                    span: *span,
                    timezone: *timezone,
                },
            );
        }
        Event::AvailabilityWithdrawn { provider_id, .. } => {
            day.windows.remove(provider_id);
        }
        Event::HoldPlaced {
            id,
            client_id,
            provider_id,
            date,
            slot,
            expires_at,
            eligible,
        } => {
            day.insert_reservation(Reservation {
                id: *id,
                client_id: *client_id,
                provider_id: *provider_id,
                date: *date,
                slot: *slot,
                status: ReservationStatus::Reserved,
                timer: Some(seconds_left(*expires_at, now)),
                expires_at: *expires_at,
                eligible: eligible.clone(),
            });
            index.insert(*id, *date);
        }
        Event::ProviderChosen { id, provider_id, .. } => {
            if let Some(r) = day.reservation_mut(id) {
                r.provider_id = Some(*provider_id);
            }
        }
        Event::ReservationConfirmed { id, .. } => {
            if let Some(r) = day.reservation_mut(id) {
                r.status = ReservationStatus::Booked;
                r.timer = None;
            }
        }
        Event::ReservationCancelled { id, .. } | Event::HoldExpired { id, .. } => {
            day.remove_reservation(*id);
            index.remove(id);
        }
        // Provider registration lives on the engine, not on a day.
        Event::ProviderRegistered { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            days: DashMap::new(),
            providers: DashMap::new(),
            wal_tx,
            notify,
            reservation_dates: DashMap::new(),
            config,
            clock,
            timers: HoldTimers::new(),
        };

        // Sole owner of every Arc here, so try_write never contends. Never
        // blocking_write: this may run inside an async context.
        let now = engine.clock.now_ms();
        for event in &events {
            match event {
                Event::ProviderRegistered { id, name } => {
                    engine.providers.insert(
                        *id,
                        ProviderInfo {
                            id: *id,
                            name: name.clone(),
                        },
                    );
                }
                other => {
                    if let Some(date) = other.date() {
                        let day = engine.day(date);
                        let mut guard = day.try_write().expect("replay: uncontended write");
                        apply_to_day(&mut guard, other, &engine.reservation_dates, now);
                    }
                }
            }
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events: {} providers, {} active reservations",
                events.len(),
                engine.providers.len(),
                engine.reservation_dates.len()
            );
        }

        Ok(engine)
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// The state for `date`, created empty on first touch.
    pub fn day(&self, date: NaiveDate) -> SharedDayState {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .value()
            .clone()
    }

    pub fn existing_day(&self, date: &NaiveDate) -> Option<SharedDayState> {
        self.days.get(date).map(|e| e.value().clone())
    }

    pub fn date_of_reservation(&self, id: &Ulid) -> Option<NaiveDate> {
        self.reservation_dates.get(id).map(|e| *e.value())
    }

    /// WAL-append, apply and notify. Nothing changes in memory unless the append
    /// succeeded.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut DayState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_day(day, event, &self.reservation_dates, self.clock.now_ms());
        self.notify.send(day.date, event);
        Ok(())
    }

    /// Lookup reservation → date, acquire that day's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DayState>, EngineError> {
        let date = self
            .date_of_reservation(id)
            .ok_or(EngineError::NotFound(*id))?;
        let day = self.existing_day(&date).ok_or(EngineError::NotFound(*id))?;
        let guard = day.write_owned().await;
        if guard.reservation(id).is_none() {
            // Removed between the index lookup and the lock.
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    /// Slot computation inputs for a query in `timezone`.
    pub(super) fn merge_context(&self, filter: ProviderFilter, timezone: Option<Tz>) -> MergeContext {
        MergeContext {
            filter,
            policy: SlotPolicy {
                lead_time_ms: self.config.lead_time_ms,
                timezone: timezone.unwrap_or(self.config.default_timezone),
            },
            step_minutes: self.config.step_minutes,
            now: self.clock.now_ms(),
        }
    }
}
