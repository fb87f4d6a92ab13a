use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";

/// Half-open time-of-day interval `[start, end)` on a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Span {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build from `HH:MM` strings. Panics on malformed input; meant for literals.
    #[cfg(test)]
    pub fn hm(start: &str, end: &str) -> Self {
        Self::new(parse_time(start).unwrap(), parse_time(end).unwrap())
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format(TIME_FORMAT),
            self.end.format(TIME_FORMAT)
        )
    }
}

pub fn parse_date(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
}

pub fn parse_time(s: &str) -> Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(s.trim(), TIME_FORMAT)
}

pub fn format_time(t: NaiveTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Instant at which `time` on `date` begins in `tz`.
///
/// Ambiguous local times (DST fall-back) resolve to the earlier instant; times
/// inside a DST gap are read as UTC wall time.
pub fn local_instant_ms(date: NaiveDate, time: NaiveTime, tz: Tz) -> Ms {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.timestamp_millis(),
        None => naive.and_utc().timestamp_millis(),
    }
}

// ── Providers & users ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Provider,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub role: Role,
}

/// Which providers a client wants to book with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderFilter {
    #[default]
    All,
    Only(Ulid),
}

impl ProviderFilter {
    pub fn admits(&self, provider_id: &Ulid) -> bool {
        match self {
            ProviderFilter::All => true,
            ProviderFilter::Only(id) => id == provider_id,
        }
    }
}

// ── Availability ────────────────────────────────────────────────

/// A provider's open hours on one date. One per (provider, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub provider_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub timezone: Tz,
}

// ── Slots ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Available,
    Reserved,
    Booked,
    Disabled,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Reserved => "reserved",
            SlotStatus::Booked => "booked",
            SlotStatus::Disabled => "disabled",
        }
    }
}

/// A derived 15-minute unit. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub span: Span,
    pub status: SlotStatus,
    pub tooltip: &'static str,
    /// Providers who can still take this slot, ascending by id.
    pub providers: Vec<Ulid>,
}

// ── Reservations ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Reserved,
    Booked,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Booked => "booked",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Reserved | ReservationStatus::Booked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub client_id: Ulid,
    /// `None` until the client picks one of `eligible`.
    pub provider_id: Option<Ulid>,
    pub date: NaiveDate,
    pub slot: Span,
    pub status: ReservationStatus,
    /// Seconds left on the hold; `None` once booked.
    pub timer: Option<u32>,
    pub expires_at: Ms,
    /// Providers able to serve the slot when the hold was placed.
    pub eligible: Vec<Ulid>,
}

/// Everything stored for one calendar date. The unit of locking.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    /// provider id → that provider's window on this date.
    pub windows: BTreeMap<Ulid, AvailabilityWindow>,
    /// Active reservations, sorted by `slot.start`.
    pub reservations: Vec<Reservation>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            windows: BTreeMap::new(),
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by slot start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.slot.start <= reservation.slot.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose slot overlaps `query`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.slot.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.slot.end > query.start)
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty() && self.reservations.is_empty()
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderRegistered {
        id: Ulid,
        name: String,
    },
    AvailabilityPublished {
        provider_id: Ulid,
        date: NaiveDate,
        span: Span,
        timezone: Tz,
    },
    AvailabilityWithdrawn {
        provider_id: Ulid,
        date: NaiveDate,
    },
    HoldPlaced {
        id: Ulid,
        client_id: Ulid,
        provider_id: Option<Ulid>,
        date: NaiveDate,
        slot: Span,
        expires_at: Ms,
        eligible: Vec<Ulid>,
    },
    ProviderChosen {
        id: Ulid,
        date: NaiveDate,
        provider_id: Ulid,
    },
    ReservationConfirmed {
        id: Ulid,
        date: NaiveDate,
    },
    ReservationCancelled {
        id: Ulid,
        date: NaiveDate,
    },
    HoldExpired {
        id: Ulid,
        date: NaiveDate,
    },
}

impl Event {
    /// The date an event touches; `None` for provider-level events.
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            Event::ProviderRegistered { .. } => None,
            Event::AvailabilityPublished { date, .. }
            | Event::AvailabilityWithdrawn { date, .. }
            | Event::HoldPlaced { date, .. }
            | Event::ProviderChosen { date, .. }
            | Event::ReservationConfirmed { date, .. }
            | Event::ReservationCancelled { date, .. }
            | Event::HoldExpired { date, .. } => Some(*date),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::ProviderRegistered { .. } => "provider_registered",
            Event::AvailabilityPublished { .. } => "availability_published",
            Event::AvailabilityWithdrawn { .. } => "availability_withdrawn",
            Event::HoldPlaced { .. } => "hold_placed",
            Event::ProviderChosen { .. } => "provider_chosen",
            Event::ReservationConfirmed { .. } => "reservation_confirmed",
            Event::ReservationCancelled { .. } => "reservation_cancelled",
            Event::HoldExpired { .. } => "hold_expired",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(start: &str, end: &str) -> Reservation {
        Reservation {
            id: Ulid::new(),
            client_id: Ulid::new(),
            provider_id: None,
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            slot: Span::hm(start, end),
            status: ReservationStatus::Reserved,
            timer: Some(1800),
            expires_at: 0,
            eligible: vec![],
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::hm("08:00", "08:15");
        assert_eq!(s.duration_minutes(), 15);
        assert_eq!(s.to_string(), "08:00-08:15");
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::hm("08:00", "08:30");
        let b = Span::hm("08:15", "08:45");
        let c = Span::hm("08:30", "09:00");
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::hm("08:00", "12:00");
        assert!(outer.contains_span(&Span::hm("08:00", "08:15")));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::hm("11:45", "12:15")));
    }

    #[test]
    fn parse_and_format_wire_strings() {
        let d = parse_date("2024-06-01").unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(format_time(parse_time("08:15").unwrap()), "08:15");
        assert!(parse_time("8h15").is_err());
        assert!(parse_date("06/01/2024").is_err());
    }

    #[test]
    fn local_instant_respects_timezone() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let t = parse_time("08:00").unwrap();
        let utc = local_instant_ms(date, t, chrono_tz::UTC);
        let la = local_instant_ms(date, t, chrono_tz::America::Los_Angeles);
        // PDT is UTC-7 in June.
        assert_eq!(la - utc, 7 * 3_600_000);
    }

    #[test]
    fn reservations_stay_sorted() {
        let mut day = DayState::new(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        day.insert_reservation(reservation("09:00", "09:15"));
        day.insert_reservation(reservation("08:00", "08:15"));
        day.insert_reservation(reservation("08:30", "08:45"));
        let starts: Vec<_> = day.reservations.iter().map(|r| r.slot.to_string()).collect();
        assert_eq!(starts, vec!["08:00-08:15", "08:30-08:45", "09:00-09:15"]);
    }

    #[test]
    fn remove_reservation_by_id() {
        let mut day = DayState::new(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        let r = reservation("08:00", "08:15");
        let id = r.id;
        day.insert_reservation(r);
        assert!(day.remove_reservation(Ulid::new()).is_none());
        assert_eq!(day.remove_reservation(id).map(|r| r.id), Some(id));
        assert!(day.reservations.is_empty());
    }

    #[test]
    fn overlapping_skips_adjacent() {
        let mut day = DayState::new(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        day.insert_reservation(reservation("08:00", "08:15"));
        day.insert_reservation(reservation("08:15", "08:30"));
        day.insert_reservation(reservation("08:30", "08:45"));
        let hits: Vec<_> = day
            .overlapping(&Span::hm("08:15", "08:30"))
            .map(|r| r.slot)
            .collect();
        assert_eq!(hits, vec![Span::hm("08:15", "08:30")]);
    }

    #[test]
    fn event_date_and_kind() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let e = Event::ReservationConfirmed { id: Ulid::new(), date };
        assert_eq!(e.date(), Some(date));
        assert_eq!(e.kind(), "reservation_confirmed");
        let p = Event::ProviderRegistered { id: Ulid::new(), name: "A".into() };
        assert_eq!(p.date(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AvailabilityPublished {
            provider_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            span: Span::hm("08:00", "09:00"),
            timezone: chrono_tz::America::Los_Angeles,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
