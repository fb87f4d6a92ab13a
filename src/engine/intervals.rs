use chrono::{Duration, NaiveTime};

use crate::limits::{MAX_STEP_MINUTES, MIN_STEP_MINUTES};
use crate::model::Span;

use super::EngineError;

pub const DEFAULT_STEP_MINUTES: u32 = 15;

/// Tile `[start, end)` into consecutive `step_minutes` intervals.
///
/// Only full-length intervals are emitted: a trailing remainder shorter than the
/// step is dropped.
pub fn generate_intervals(
    start: NaiveTime,
    end: NaiveTime,
    step_minutes: u32,
) -> Result<Vec<Span>, EngineError> {
    if start >= end || !(MIN_STEP_MINUTES..=MAX_STEP_MINUTES).contains(&step_minutes) {
        return Err(EngineError::InvalidRange {
            start,
            end,
            step_minutes,
        });
    }
    let step = Duration::minutes(step_minutes as i64);
    let total = (end - start).num_minutes() / step_minutes as i64;

    let mut intervals = Vec::with_capacity(total as usize);
    let mut current = start;
    for _ in 0..total {
        // Cannot wrap: `current + step <= end` for every counted interval.
        let next = current + step;
        intervals.push(Span::new(current, next));
        current = next;
    }
    Ok(intervals)
}
