use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::intervals::generate_intervals;
use super::status::{resolve_slot_status, SlotPolicy};
use super::EngineError;

/// Everything besides windows and reservations that a slot listing depends on.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext {
    pub filter: ProviderFilter,
    pub policy: SlotPolicy,
    pub step_minutes: u32,
    pub now: Ms,
}

// ── Availability Merger ───────────────────────────────────────────

/// Merge provider windows and active reservations for `date` into one slot list.
///
/// The grid is the union of every participating window's intervals. Candidates
/// are taken in `(start, end)` order and dropped when they overlap a slot that
/// was already accepted, so misaligned windows still yield disjoint slots.
///
/// A provider serves a slot when its window contains it and it has no active
/// reservation overlapping it. Unassigned holds take one unit of capacity each:
/// once they use up every remaining provider the slot is fully taken.
pub fn merge_availability<'a, W>(
    windows: W,
    date: NaiveDate,
    reservations: &[Reservation],
    ctx: &MergeContext,
) -> Result<Vec<Slot>, EngineError>
where
    W: IntoIterator<Item = &'a AvailabilityWindow>,
{
    let windows: Vec<&AvailabilityWindow> = windows
        .into_iter()
        .filter(|w| w.date == date && ctx.filter.admits(&w.provider_id))
        .collect();
    if windows.is_empty() {
        return Ok(Vec::new());
    }

    let mut candidates = Vec::new();
    for w in &windows {
        candidates.extend(generate_intervals(w.span.start, w.span.end, ctx.step_minutes)?);
    }
    let grid = union_grid(candidates);

    let active: Vec<&Reservation> = reservations
        .iter()
        .filter(|r| r.date == date && r.status.is_active())
        .collect();

    let mut slots = Vec::with_capacity(grid.len());
    for span in grid {
        let serving: Vec<Ulid> = windows
            .iter()
            .filter(|w| w.span.contains_span(&span))
            .map(|w| w.provider_id)
            .collect();

        let overlapping: Vec<&Reservation> = active
            .iter()
            .copied()
            .filter(|r| r.slot.overlaps(&span) && touches(r, &serving))
            .collect();

        let mut providers: Vec<Ulid> = serving
            .iter()
            .copied()
            .filter(|p| !overlapping.iter().any(|r| r.provider_id == Some(*p)))
            .collect();
        providers.sort();

        let unassigned = overlapping.iter().filter(|r| r.provider_id.is_none()).count();
        if unassigned >= providers.len() {
            providers.clear();
        }

        let blocking: &[&Reservation] = if providers.is_empty() { &overlapping } else { &[] };
        let verdict = resolve_slot_status(date, &span, blocking, &ctx.policy, ctx.now);

        if !providers.is_empty() || verdict.status != SlotStatus::Available {
            slots.push(Slot {
                span,
                status: verdict.status,
                tooltip: verdict.tooltip,
                providers,
            });
        }
    }
    Ok(slots)
}

/// Sorted, disjoint subset of `candidates`, greedy by start time.
fn union_grid(mut candidates: Vec<Span>) -> Vec<Span> {
    candidates.sort();
    candidates.dedup();
    let mut grid: Vec<Span> = Vec::with_capacity(candidates.len());
    for span in candidates {
        match grid.last() {
            Some(last) if span.start < last.end => {}
            _ => grid.push(span),
        }
    }
    grid
}

/// Whether a reservation competes for any of `serving`.
fn touches(r: &Reservation, serving: &[Ulid]) -> bool {
    match r.provider_id {
        Some(p) => serving.contains(&p),
        None => r.eligible.is_empty() || r.eligible.iter().any(|p| serving.contains(p)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn window(provider: Ulid, start: &str, end: &str) -> AvailabilityWindow {
        AvailabilityWindow {
            provider_id: provider,
            date: date(),
            span: Span::hm(start, end),
            timezone: chrono_tz::UTC,
        }
    }

    fn held(provider: Option<Ulid>, start: &str, end: &str, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            client_id: Ulid::new(),
            provider_id: provider,
            date: date(),
            slot: Span::hm(start, end),
            status,
            timer: Some(1800),
            expires_at: 0,
            eligible: provider.into_iter().collect(),
        }
    }

    fn midnight_ms() -> Ms {
        date().and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis()
    }

    /// Two days before the start of `date()` in UTC.
    fn ctx(filter: ProviderFilter) -> MergeContext {
        MergeContext {
            filter,
            policy: SlotPolicy {
                lead_time_ms: SlotPolicy::DEFAULT_LEAD_TIME_MS,
                timezone: chrono_tz::UTC,
            },
            step_minutes: 15,
            now: midnight_ms() - 48 * H,
        }
    }

    fn rendered(slots: &[Slot]) -> Vec<String> {
        slots.iter().map(|s| s.span.to_string()).collect()
    }

    #[test]
    fn single_provider_hour() {
        let a = Ulid::new();
        let windows = [window(a, "08:00", "09:00")];
        let slots = merge_availability(&windows, date(), &[], &ctx(ProviderFilter::All)).unwrap();
        assert_eq!(
            rendered(&slots),
            vec!["08:00-08:15", "08:15-08:30", "08:30-08:45", "08:45-09:00"]
        );
        for slot in &slots {
            assert_eq!(slot.status, SlotStatus::Available);
            assert_eq!(slot.providers, vec![a]);
            assert_eq!(slot.tooltip, "Click to book");
        }
    }

    #[test]
    fn held_slot_shows_reserved() {
        let a = Ulid::new();
        let windows = [window(a, "08:00", "09:00")];
        let hold = held(Some(a), "08:15", "08:30", ReservationStatus::Reserved);
        let slots = merge_availability(&windows, date(), &[hold], &ctx(ProviderFilter::All)).unwrap();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[1].status, SlotStatus::Reserved);
        assert!(slots[1].providers.is_empty());
        for i in [0, 2, 3] {
            assert_eq!(slots[i].status, SlotStatus::Available);
        }
    }

    #[test]
    fn one_of_two_providers_reserved_stays_available() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let windows = [window(a, "08:00", "08:15"), window(b, "08:00", "08:15")];
        let hold = held(Some(a), "08:00", "08:15", ReservationStatus::Reserved);
        let slots = merge_availability(&windows, date(), &[hold], &ctx(ProviderFilter::All)).unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].status, SlotStatus::Available);
        assert_eq!(slots[0].providers, vec![b]);
    }

    #[test]
    fn booked_slot_remains_visible() {
        let a = Ulid::new();
        let windows = [window(a, "08:00", "08:30")];
        let booking = held(Some(a), "08:00", "08:15", ReservationStatus::Booked);
        let slots = merge_availability(&windows, date(), &[booking], &ctx(ProviderFilter::All)).unwrap();
        assert_eq!(slots[0].status, SlotStatus::Booked);
        assert_eq!(slots[0].tooltip, "This slot is already booked");
        assert_eq!(slots[1].status, SlotStatus::Available);
    }

    #[test]
    fn unassigned_holds_consume_capacity() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let windows = [window(a, "08:00", "08:15"), window(b, "08:00", "08:15")];
        let mut first = held(None, "08:00", "08:15", ReservationStatus::Reserved);
        first.eligible = vec![a, b];
        let slots =
            merge_availability(&windows, date(), &[first.clone()], &ctx(ProviderFilter::All)).unwrap();
        assert_eq!(slots[0].status, SlotStatus::Available);
        assert_eq!(slots[0].providers.len(), 2);

        let mut second = first.clone();
        second.id = Ulid::new();
        let slots =
            merge_availability(&windows, date(), &[first, second], &ctx(ProviderFilter::All)).unwrap();
        assert_eq!(slots[0].status, SlotStatus::Reserved);
        assert!(slots[0].providers.is_empty());
    }

    #[test]
    fn filter_limits_providers() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let windows = [window(a, "08:00", "08:30"), window(b, "09:00", "09:30")];
        let slots =
            merge_availability(&windows, date(), &[], &ctx(ProviderFilter::Only(b))).unwrap();
        assert_eq!(rendered(&slots), vec!["09:00-09:15", "09:15-09:30"]);
        assert!(slots.iter().all(|s| s.providers == vec![b]));
    }

    #[test]
    fn other_providers_reservations_do_not_leak_through_filter() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let windows = [window(a, "08:00", "08:15"), window(b, "08:00", "08:15")];
        let booking = held(Some(a), "08:00", "08:15", ReservationStatus::Booked);
        let slots =
            merge_availability(&windows, date(), &[booking], &ctx(ProviderFilter::Only(b))).unwrap();
        assert_eq!(slots[0].status, SlotStatus::Available);
        assert_eq!(slots[0].providers, vec![b]);
    }

    #[test]
    fn union_grid_of_misaligned_windows_is_disjoint() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let windows = [window(a, "08:00", "08:30"), window(b, "08:10", "08:40")];
        let slots = merge_availability(&windows, date(), &[], &ctx(ProviderFilter::All)).unwrap();
        assert_eq!(rendered(&slots), vec!["08:00-08:15", "08:15-08:30"]);
        for pair in slots.windows(2) {
            assert!(pair[0].span.end <= pair[1].span.start);
        }
    }

    #[test]
    fn union_covers_disjoint_windows() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let windows = [window(b, "10:00", "10:15"), window(a, "08:00", "08:15")];
        let slots = merge_availability(&windows, date(), &[], &ctx(ProviderFilter::All)).unwrap();
        assert_eq!(rendered(&slots), vec!["08:00-08:15", "10:00-10:15"]);
        assert_eq!(slots[0].providers, vec![a]);
        assert_eq!(slots[1].providers, vec![b]);
    }

    #[test]
    fn no_windows_is_empty() {
        let slots = merge_availability(&Vec::<AvailabilityWindow>::new(), date(), &[], &ctx(ProviderFilter::All)).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn windows_on_other_dates_ignored() {
        let a = Ulid::new();
        let mut w = window(a, "08:00", "09:00");
        w.date = date().succ_opt().unwrap();
        let slots = merge_availability(&[w], date(), &[], &ctx(ProviderFilter::All)).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn expired_reservations_ignored() {
        let a = Ulid::new();
        let windows = [window(a, "08:00", "08:15")];
        let gone = held(Some(a), "08:00", "08:15", ReservationStatus::Expired);
        let slots = merge_availability(&windows, date(), &[gone], &ctx(ProviderFilter::All)).unwrap();
        assert_eq!(slots[0].status, SlotStatus::Available);
    }

    #[test]
    fn within_lead_time_slots_disabled() {
        let a = Ulid::new();
        let windows = [window(a, "08:00", "08:30")];
        let mut c = ctx(ProviderFilter::All);
        c.now = midnight_ms() + 8 * H - 12 * H;
        let slots = merge_availability(&windows, date(), &[], &c).unwrap();
        assert!(slots.iter().all(|s| s.status == SlotStatus::Disabled));
        assert_eq!(slots[0].providers, vec![a]);
    }

    #[test]
    fn union_grid_drops_overlapping_candidates() {
        let grid = union_grid(vec![
            Span::hm("08:10", "08:25"),
            Span::hm("08:00", "08:15"),
            Span::hm("08:00", "08:15"),
            Span::hm("08:15", "08:30"),
        ]);
        assert_eq!(grid, vec![Span::hm("08:00", "08:15"), Span::hm("08:15", "08:30")]);
    }
}
