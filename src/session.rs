use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::{AuthError, Directory};
use crate::engine::{Engine, EngineError};
use crate::model::*;

/// Per-client booking state: who is asking, what they are looking at and the
/// hold they are sitting on. One per connection.
pub struct BookingSession {
    engine: Arc<Engine>,
    user: User,
    filter: ProviderFilter,
    date: Option<NaiveDate>,
    timezone: Tz,
    slots: Vec<Slot>,
    /// Unconfirmed hold placed through this session.
    hold: Option<Ulid>,
}

impl BookingSession {
    pub fn new(engine: Arc<Engine>, user: User) -> Self {
        let timezone = engine.config.default_timezone;
        Self {
            engine,
            user,
            filter: ProviderFilter::All,
            date: None,
            timezone,
            slots: Vec::new(),
            hold: None,
        }
    }

    pub fn login(
        engine: Arc<Engine>,
        directory: &Directory,
        name: &str,
        password: &str,
    ) -> Result<Self, AuthError> {
        let user = directory.login(name, password)?;
        debug!("{} logged in as {:?}", user.name, user.role);
        Ok(Self::new(engine, user))
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn filter(&self) -> ProviderFilter {
        self.filter
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Slot list as of the last refresh.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn current_hold(&self) -> Option<Ulid> {
        self.hold
    }

    // ── View state ───────────────────────────────────────────

    pub async fn select_provider(&mut self, filter: ProviderFilter) -> Result<&[Slot], EngineError> {
        self.filter = filter;
        self.refresh_slots().await
    }

    pub async fn select_date(&mut self, date: NaiveDate) -> Result<&[Slot], EngineError> {
        self.date = Some(date);
        self.refresh_slots().await
    }

    /// Switch date, filter and optionally timezone with a single refresh.
    pub async fn view(
        &mut self,
        date: NaiveDate,
        filter: ProviderFilter,
        timezone: Option<Tz>,
    ) -> Result<&[Slot], EngineError> {
        self.date = Some(date);
        self.filter = filter;
        if let Some(tz) = timezone {
            self.timezone = tz;
        }
        self.refresh_slots().await
    }

    pub async fn set_timezone(&mut self, timezone: Tz) -> Result<&[Slot], EngineError> {
        self.timezone = timezone;
        self.refresh_slots().await
    }

    /// Recompute the slot list for the selected date. Empty until a date is picked.
    pub async fn refresh_slots(&mut self) -> Result<&[Slot], EngineError> {
        self.slots = match self.date {
            Some(date) => {
                self.engine
                    .compute_slots(date, self.filter, Some(self.timezone))
                    .await?
            }
            None => Vec::new(),
        };
        Ok(&self.slots)
    }

    // ── Client actions ───────────────────────────────────────

    /// Hold `slot` on the selected date and start its countdown.
    ///
    /// Checked against the cached list first, then again by the engine under
    /// the date lock, both in the session's timezone. A still-pending earlier
    /// hold of this session is released once the new hold is in place.
    pub async fn hold(&mut self, slot: Span) -> Result<Reservation, EngineError> {
        self.require(Role::Client, "only clients can hold slots")?;
        let date = self
            .date
            .ok_or(EngineError::Forbidden("select a date first"))?;

        let cached_open = self
            .slots
            .iter()
            .any(|s| s.span == slot && s.status == SlotStatus::Available);
        if !cached_open {
            return Err(EngineError::SlotUnavailable { date, slot });
        }

        let result = self
            .engine
            .create_hold_in(self.user.id, date, slot, self.filter, Some(self.timezone))
            .await;
        let reservation = match result {
            Ok(r) => r,
            Err(e) => {
                // Someone else got there first; show the fresh picture.
                if let Err(refresh) = self.refresh_slots().await {
                    warn!("slot refresh after failed hold: {refresh}");
                }
                return Err(e);
            }
        };
        // Release the earlier hold only after the new one exists.
        if let Err(e) = self.release_pending_hold().await {
            warn!("previous hold not released: {e}");
        }
        self.engine.start_hold_timer(reservation.id);
        self.hold = Some(reservation.id);
        self.refresh_slots().await?;
        Ok(reservation)
    }

    pub async fn choose_provider(&mut self, id: Ulid, provider_id: Ulid) -> Result<Reservation, EngineError> {
        self.require_owner(&id).await?;
        let r = self.engine.choose_provider(id, provider_id).await?;
        self.refresh_slots().await?;
        Ok(r)
    }

    pub async fn confirm(&mut self, id: Ulid) -> Result<Reservation, EngineError> {
        self.require_owner(&id).await?;
        let r = self.engine.confirm(id).await?;
        if self.hold == Some(id) {
            self.hold = None;
        }
        self.refresh_slots().await?;
        Ok(r)
    }

    /// Clients cancel their own reservations; providers cancel the ones
    /// assigned to them.
    pub async fn cancel(&mut self, id: Ulid) -> Result<Reservation, EngineError> {
        let r = self
            .engine
            .get_reservation(&id)
            .await
            .ok_or(EngineError::NotFound(id))?;
        let allowed = match self.user.role {
            Role::Client => r.client_id == self.user.id,
            Role::Provider => r.provider_id == Some(self.user.id),
        };
        if !allowed {
            return Err(EngineError::Forbidden("not your reservation"));
        }
        let r = self.engine.cancel(id).await?;
        if self.hold == Some(id) {
            self.hold = None;
        }
        self.refresh_slots().await?;
        Ok(r)
    }

    /// Reservations the user is party to, optionally for one date.
    pub async fn my_reservations(&self, date: Option<NaiveDate>) -> Vec<Reservation> {
        let mut all = self.engine.list_reservations(date).await;
        all.retain(|r| match self.user.role {
            Role::Client => r.client_id == self.user.id,
            Role::Provider => r.provider_id == Some(self.user.id),
        });
        all
    }

    // ── Provider actions ─────────────────────────────────────

    /// Register the calling provider account under a display name.
    pub async fn register_provider(&mut self, id: Ulid, name: String) -> Result<ProviderInfo, EngineError> {
        self.require_self(id)?;
        self.engine.register_provider(id, name).await
    }

    pub async fn publish_availability(
        &mut self,
        provider_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        timezone: Tz,
    ) -> Result<Vec<AvailabilityWindow>, EngineError> {
        self.require_self(provider_id)?;
        let windows = self
            .engine
            .publish_availability(provider_id, date, start, end, timezone)
            .await?;
        self.refresh_slots().await?;
        Ok(windows)
    }

    pub async fn withdraw_availability(
        &mut self,
        provider_id: Ulid,
        date: NaiveDate,
    ) -> Result<AvailabilityWindow, EngineError> {
        self.require_self(provider_id)?;
        let window = self.engine.withdraw_availability(provider_id, date).await?;
        self.refresh_slots().await?;
        Ok(window)
    }

    // ── Internals ────────────────────────────────────────────

    fn require(&self, role: Role, msg: &'static str) -> Result<(), EngineError> {
        if self.user.role != role {
            return Err(EngineError::Forbidden(msg));
        }
        Ok(())
    }

    fn require_self(&self, provider_id: Ulid) -> Result<(), EngineError> {
        self.require(Role::Provider, "provider account required")?;
        if provider_id != self.user.id {
            return Err(EngineError::Forbidden("cannot act for another provider"));
        }
        Ok(())
    }

    async fn require_owner(&self, id: &Ulid) -> Result<(), EngineError> {
        let r = self
            .engine
            .get_reservation(id)
            .await
            .ok_or(EngineError::NotFound(*id))?;
        if r.client_id != self.user.id {
            return Err(EngineError::Forbidden("not your reservation"));
        }
        Ok(())
    }

    /// Drop this session's earlier hold if it was never confirmed.
    async fn release_pending_hold(&mut self) -> Result<(), EngineError> {
        let Some(previous) = self.hold.take() else {
            return Ok(());
        };
        let pending = self
            .engine
            .get_reservation(&previous)
            .await
            .is_some_and(|r| r.status == ReservationStatus::Reserved);
        if !pending {
            // Expired or confirmed meanwhile.
            return Ok(());
        }
        match self.engine.cancel(previous).await {
            Ok(_) => debug!("released previous hold {previous}"),
            Err(EngineError::NotFound(_)) => {}
            Err(e) => {
                self.hold = Some(previous);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for BookingSession {
    fn drop(&mut self) {
        if let Some(id) = self.hold {
            self.engine.stop_hold_timer(&id);
        }
    }
}
