use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::merge_availability;
use super::conflict::{provider_covers, provider_occupied, validate_date, validate_name};
use super::intervals::generate_intervals;
use super::{Engine, EngineError, WalCommand};

/// Result of one timer decrement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Seconds left after this tick.
    Running(u32),
    /// The hold ran out and was removed; carries its final state.
    Expired(Reservation),
}

impl Engine {
    // ── Providers & availability ─────────────────────────────

    pub async fn register_provider(&self, id: Ulid, name: String) -> Result<ProviderInfo, EngineError> {
        validate_name(&name)?;
        if self.providers.len() >= MAX_PROVIDERS {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        if self.providers.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ProviderRegistered {
            id,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        let info = ProviderInfo { id, name };
        self.providers.insert(id, info.clone());
        info!("registered provider {id} ({})", info.name);
        Ok(info)
    }

    /// Publish `provider_id`'s window for `date`, replacing any earlier one.
    /// Returns the provider's windows after the change.
    pub async fn publish_availability(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        timezone: Tz,
    ) -> Result<Vec<AvailabilityWindow>, EngineError> {
        validate_date(date)?;
        if !self.providers.contains_key(&provider_id) {
            return Err(EngineError::NotFound(provider_id));
        }
        generate_intervals(start, end, self.config.step_minutes)?;

        let day = self.day(date);
        let mut guard = day.write().await;
        let event = Event::AvailabilityPublished {
            provider_id,
            date,
            span: Span::new(start, end),
            timezone,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);
        self.get_availability(provider_id).await
    }

    pub async fn withdraw_availability(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
    ) -> Result<AvailabilityWindow, EngineError> {
        let day = self
            .existing_day(&date)
            .ok_or(EngineError::NotFound(provider_id))?;
        let mut guard = day.write().await;
        let window = guard
            .windows
            .get(&provider_id)
            .cloned()
            .ok_or(EngineError::NotFound(provider_id))?;
        let event = Event::AvailabilityWithdrawn { provider_id, date };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(window)
    }

    // ── Reservation lifecycle ─────────────────────────────────

    /// Hold `slot` on `date` for `client_id`.
    ///
    /// The slot list is recomputed under the date's write lock, so two clients
    /// racing for the last provider cannot both succeed.
    pub async fn create_hold(
        &self,
        client_id: Ulid,
        date: NaiveDate,
        slot: Span,
        filter: ProviderFilter,
    ) -> Result<Reservation, EngineError> {
        self.create_hold_in(client_id, date, slot, filter, None).await
    }

    /// `create_hold` for a caller viewing slots in `timezone`. Lead time is
    /// judged there, as in `compute_slots`; `None` is the configured default.
    pub async fn create_hold_in(
        &self,
        client_id: Ulid,
        date: NaiveDate,
        slot: Span,
        filter: ProviderFilter,
        timezone: Option<Tz>,
    ) -> Result<Reservation, EngineError> {
        validate_date(date)?;
        let day = self
            .existing_day(&date)
            .ok_or(EngineError::SlotUnavailable { date, slot })?;
        let mut guard = day.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many reservations on date"));
        }

        let ctx = self.merge_context(filter, timezone);
        let slots = merge_availability(guard.windows.values(), date, &guard.reservations, &ctx)?;
        let open = slots
            .into_iter()
            .find(|s| s.span == slot && s.status == SlotStatus::Available)
            .ok_or(EngineError::SlotUnavailable { date, slot })?;

        let id = Ulid::new();
        let provider_id = match open.providers.as_slice() {
            [only] => Some(*only),
            _ => None,
        };
        let expires_at = ctx.now + self.config.hold_seconds as Ms * 1000;
        let event = Event::HoldPlaced {
            id,
            client_id,
            provider_id,
            date,
            slot,
            expires_at,
            eligible: open.providers,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::HOLDS_PLACED_TOTAL).increment(1);
        debug!("hold {id} on {date} {slot} for client {client_id}");

        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Pick the provider for a hold placed while several could serve it.
    pub async fn choose_provider(&self, id: Ulid, provider_id: Ulid) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let r = guard.reservation(&id).ok_or(EngineError::NotFound(id))?;
        if r.status != ReservationStatus::Reserved {
            return Err(EngineError::InvalidTransition {
                id,
                status: r.status,
                reason: "only a pending hold can take a provider",
            });
        }
        if r.provider_id.is_some() {
            return Err(EngineError::InvalidTransition {
                id,
                status: r.status,
                reason: "provider already chosen",
            });
        }
        if !r.eligible.contains(&provider_id) {
            return Err(EngineError::InvalidProvider {
                reservation_id: id,
                provider_id,
            });
        }
        let (date, slot) = (r.date, r.slot);
        if !provider_covers(&guard, provider_id, &slot)
            || provider_occupied(&guard, provider_id, &slot, id)
        {
            return Err(EngineError::SlotUnavailable { date, slot });
        }

        let event = Event::ProviderChosen { id, date, provider_id };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Turn a hold into a booking and stop its countdown.
    pub async fn confirm(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let r = guard.reservation(&id).ok_or(EngineError::NotFound(id))?;
        if r.status != ReservationStatus::Reserved {
            return Err(EngineError::InvalidTransition {
                id,
                status: r.status,
                reason: "only a pending hold can be confirmed",
            });
        }
        if r.provider_id.is_none() {
            return Err(EngineError::InvalidTransition {
                id,
                status: r.status,
                reason: "choose a provider first",
            });
        }

        let event = Event::ReservationConfirmed { id, date: r.date };
        self.persist_and_apply(&mut guard, &event).await?;
        self.timers.stop(&id);
        metrics::counter!(observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
        info!("reservation {id} booked");
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Delete a hold or booking. Returns it as it was before removal.
    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let r = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !r.status.is_active() {
            return Err(EngineError::InvalidTransition {
                id,
                status: r.status,
                reason: "already released",
            });
        }

        let event = Event::ReservationCancelled { id, date: r.date };
        self.persist_and_apply(&mut guard, &event).await?;
        self.timers.stop(&id);
        metrics::counter!(observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        info!("reservation {id} cancelled");
        Ok(r)
    }

    /// One second of a hold's countdown. Not logged: `expires_at` already is.
    pub async fn tick(&self, id: Ulid) -> Result<TickOutcome, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let r = guard.reservation_mut(&id).ok_or(EngineError::NotFound(id))?;
        let left = match (r.status, r.timer) {
            (ReservationStatus::Reserved, Some(left)) => left.saturating_sub(1),
            (status, _) => {
                return Err(EngineError::InvalidTransition {
                    id,
                    status,
                    reason: "no running timer",
                });
            }
        };
        r.timer = Some(left);
        if left > 0 {
            return Ok(TickOutcome::Running(left));
        }

        let mut expired = r.clone();
        let event = Event::HoldExpired { id, date: r.date };
        self.persist_and_apply(&mut guard, &event).await?;
        self.timers.stop(&id);
        metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(1);
        info!("hold {id} expired");
        expired.status = ReservationStatus::Expired;
        Ok(TickOutcome::Expired(expired))
    }

    /// Expire a hold whose `expires_at` has passed.
    pub async fn expire_hold(&self, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let r = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if r.status != ReservationStatus::Reserved || r.expires_at > now {
            return Err(EngineError::InvalidTransition {
                id,
                status: r.status,
                reason: "hold has not run out",
            });
        }

        let event = Event::HoldExpired { id, date: r.date };
        self.persist_and_apply(&mut guard, &event).await?;
        self.timers.stop(&id);
        metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(1);
        Ok(Reservation {
            status: ReservationStatus::Expired,
            timer: Some(0),
            ..r
        })
    }

    /// Pending holds whose `expires_at` is at or before `now`. Skips days that
    /// are locked right now; the next sweep picks them up.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<Ulid> {
        let mut expired = Vec::new();
        for entry in self.days.iter() {
            if let Ok(guard) = entry.value().try_read() {
                expired.extend(
                    guard
                        .reservations
                        .iter()
                        .filter(|r| r.status == ReservationStatus::Reserved && r.expires_at <= now)
                        .map(|r| r.id),
                );
            }
        }
        expired
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the shortest event list that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events: Vec<Event> = self
            .providers
            .iter()
            .map(|p| Event::ProviderRegistered {
                id: p.id,
                name: p.name.clone(),
            })
            .collect();

        let days: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        for day in days {
            let guard = day.read().await;
            for w in guard.windows.values() {
                events.push(Event::AvailabilityPublished {
                    provider_id: w.provider_id,
                    date: w.date,
                    span: w.span,
                    timezone: w.timezone,
                });
            }
            for r in &guard.reservations {
                events.push(Event::HoldPlaced {
                    id: r.id,
                    client_id: r.client_id,
                    provider_id: r.provider_id,
                    date: r.date,
                    slot: r.slot,
                    expires_at: r.expires_at,
                    eligible: r.eligible.clone(),
                });
                if r.status == ReservationStatus::Booked {
                    events.push(Event::ReservationConfirmed { id: r.id, date: r.date });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
