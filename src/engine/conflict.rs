use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_date(date: NaiveDate) -> Result<(), EngineError> {
    if !(MIN_YEAR..=MAX_YEAR).contains(&date.year()) {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::LimitExceeded("provider name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("provider name too long"));
    }
    Ok(())
}

/// An active reservation other than `except` holds `provider` for part of `span`.
pub(crate) fn provider_occupied(day: &DayState, provider: Ulid, span: &Span, except: Ulid) -> bool {
    day.overlapping(span)
        .any(|r| r.id != except && r.status.is_active() && r.provider_id == Some(provider))
}

/// `provider` still has a window on this day covering `span`.
pub(crate) fn provider_covers(day: &DayState, provider: Ulid, span: &Span) -> bool {
    day.windows
        .get(&provider)
        .is_some_and(|w| w.span.contains_span(span))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day_with(provider: Ulid, booked: Span) -> (DayState, Ulid) {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let mut day = DayState::new(date);
        day.windows.insert(
            provider,
            AvailabilityWindow {
                provider_id: provider,
                date,
                span: Span::hm("08:00", "10:00"),
                timezone: chrono_tz::UTC,
            },
        );
        let id = Ulid::new();
        day.insert_reservation(Reservation {
            id,
            client_id: Ulid::new(),
            provider_id: Some(provider),
            date,
            slot: booked,
            status: ReservationStatus::Booked,
            timer: None,
            expires_at: 0,
            eligible: vec![provider],
        });
        (day, id)
    }

    #[test]
    fn occupied_by_overlapping_reservation() {
        let p = Ulid::new();
        let (day, id) = day_with(p, Span::hm("08:15", "08:30"));
        assert!(provider_occupied(&day, p, &Span::hm("08:15", "08:30"), Ulid::new()));
        assert!(!provider_occupied(&day, p, &Span::hm("08:30", "08:45"), Ulid::new()));
        assert!(!provider_occupied(&day, Ulid::new(), &Span::hm("08:15", "08:30"), Ulid::new()));
        // A reservation never blocks itself.
        assert!(!provider_occupied(&day, p, &Span::hm("08:15", "08:30"), id));
    }

    #[test]
    fn covers_requires_whole_slot() {
        let p = Ulid::new();
        let (day, _) = day_with(p, Span::hm("08:15", "08:30"));
        assert!(provider_covers(&day, p, &Span::hm("09:45", "10:00")));
        assert!(!provider_covers(&day, p, &Span::hm("09:50", "10:05")));
        assert!(!provider_covers(&day, Ulid::new(), &Span::hm("08:00", "08:15")));
    }

    #[test]
    fn date_and_name_limits() {
        assert!(validate_date(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()).is_ok());
        assert!(validate_date(NaiveDate::from_ymd_opt(1900, 1, 1).unwrap()).is_err());
        assert!(validate_name("Dr. A").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
