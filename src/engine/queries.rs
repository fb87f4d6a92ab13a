use chrono::NaiveDate;
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;

use super::availability::merge_availability;
use super::{Engine, EngineError};

impl Engine {
    /// All providers, ascending by id.
    pub fn list_providers(&self) -> Vec<ProviderInfo> {
        let mut out: Vec<ProviderInfo> = self.providers.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|p| p.id);
        out
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<ProviderInfo> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    /// One provider's windows, ascending by date.
    pub async fn get_availability(&self, provider_id: Ulid) -> Result<Vec<AvailabilityWindow>, EngineError> {
        if !self.providers.contains_key(&provider_id) {
            return Err(EngineError::NotFound(provider_id));
        }
        let mut out = Vec::new();
        for day in self.snapshot_days() {
            let guard = day.read().await;
            if let Some(w) = guard.windows.get(&provider_id) {
                out.push(w.clone());
            }
        }
        out.sort_by_key(|w| w.date);
        Ok(out)
    }

    /// Bookable slots for `date`, viewed from `timezone` (engine default if `None`).
    pub async fn compute_slots(
        &self,
        date: NaiveDate,
        filter: ProviderFilter,
        timezone: Option<Tz>,
    ) -> Result<Vec<Slot>, EngineError> {
        if let ProviderFilter::Only(id) = filter
            && !self.providers.contains_key(&id)
        {
            return Err(EngineError::NotFound(id));
        }
        let Some(day) = self.existing_day(&date) else {
            return Ok(Vec::new());
        };
        let guard = day.read().await;
        let ctx = self.merge_context(filter, timezone);
        merge_availability(guard.windows.values(), date, &guard.reservations, &ctx)
    }

    /// Active reservations, by date then start time.
    pub async fn list_reservations(&self, date: Option<NaiveDate>) -> Vec<Reservation> {
        let days = match date {
            Some(d) => self.existing_day(&d).into_iter().collect(),
            None => self.snapshot_days(),
        };
        let mut out = Vec::new();
        for day in days {
            out.extend(day.read().await.reservations.iter().cloned());
        }
        out.sort_by_key(|r| (r.date, r.slot.start, r.id));
        out
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        let date = self.date_of_reservation(id)?;
        let day = self.existing_day(&date)?;
        let guard = day.read().await;
        guard.reservation(id).cloned()
    }

    /// Clone out the day handles so no DashMap guard is held across an await.
    fn snapshot_days(&self) -> Vec<super::SharedDayState> {
        self.days.iter().map(|e| e.value().clone()).collect()
    }
}
