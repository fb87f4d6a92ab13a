use chrono::NaiveDate;
use chrono_tz::Tz;

use crate::model::*;

/// Inputs that decide whether a slot can still be booked.
#[derive(Debug, Clone, Copy)]
pub struct SlotPolicy {
    /// Minimum notice between now and slot start.
    pub lead_time_ms: Ms,
    /// Timezone the slot's naive start is read in.
    pub timezone: Tz,
}

impl SlotPolicy {
    pub const DEFAULT_LEAD_TIME_MS: Ms = 24 * 3_600_000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotVerdict {
    pub status: SlotStatus,
    pub tooltip: &'static str,
}

pub fn tooltip(status: SlotStatus) -> &'static str {
    match status {
        SlotStatus::Disabled => "It's not allowed to book earlier than 24 hours ahead",
        SlotStatus::Reserved => "This slot is already reserved",
        SlotStatus::Booked => "This slot is already booked",
        SlotStatus::Available => "Click to book",
    }
}

/// Status of one slot. First match wins:
/// lead time → booked → reserved → available.
///
/// `blocking` holds the active reservations that leave no provider free for the
/// slot; the merger passes an empty slice when someone can still serve it.
pub fn resolve_slot_status(
    date: NaiveDate,
    slot: &Span,
    blocking: &[&Reservation],
    policy: &SlotPolicy,
    now: Ms,
) -> SlotVerdict {
    let starts_at = local_instant_ms(date, slot.start, policy.timezone);
    let status = if starts_at < now + policy.lead_time_ms {
        SlotStatus::Disabled
    } else if blocking
        .iter()
        .any(|r| r.date == date && r.slot.overlaps(slot) && r.status == ReservationStatus::Booked)
    {
        SlotStatus::Booked
    } else if blocking
        .iter()
        .any(|r| r.date == date && r.slot.overlaps(slot) && r.status == ReservationStatus::Reserved)
    {
        SlotStatus::Reserved
    } else {
        SlotStatus::Available
    };
    SlotVerdict {
        status,
        tooltip: tooltip(status),
    }
}
