use chrono::{FixedOffset, NaiveDate};

use crate::model::*;

use super::calendar::{local_datetime, opening_span};
use super::EngineError;

// ── Slot Algorithm ───────────────────────────────────────────────

/// Fixed grid for candidate start times, measured from opening time.
pub const STEP_MINUTES: Ms = 15;
pub const STEP_MS: Ms = STEP_MINUTES * MINUTE_MS;

/// Bookable start instants on `day` for a service lasting `duration` ms.
///
/// Walks the opening window in `STEP_MS` increments and rejects a candidate when it
/// runs past closing, is not strictly after `now`, or overlaps any `busy` span.
/// Ascending by construction. A closed day yields nothing.
pub fn open_starts(
    hours: &DayHours,
    day: NaiveDate,
    offset: FixedOffset,
    duration: Ms,
    busy: &[Span],
    now: Ms,
) -> Vec<Ms> {
    let Some(window) = opening_span(hours, day, offset) else {
        return Vec::new();
    };
    if duration <= 0 {
        return Vec::new();
    }

    let mut accepted = Vec::new();
    let mut start = window.start;
    while start < window.end {
        let candidate = Span::new(start, start + duration);
        // Every later candidate ends later still.
        if candidate.end > window.end {
            break;
        }
        if start > now && !busy.iter().any(|b| b.overlaps(&candidate)) {
            accepted.push(start);
        }
        start += STEP_MS;
    }
    accepted
}

/// Check that a single requested interval is one `open_starts` could have offered,
/// ignoring `now` and existing appointments.
pub fn check_within_hours(
    hours: &DayHours,
    day: NaiveDate,
    offset: FixedOffset,
    candidate: &Span,
) -> Result<(), EngineError> {
    let window = opening_span(hours, day, offset)
        .ok_or_else(|| EngineError::OutsideBusinessHours(format!("closed on {day}")))?;
    if candidate.start < window.start {
        return Err(EngineError::OutsideBusinessHours(format!(
            "starts before opening at {}",
            hours.opens_at.format("%H:%M")
        )));
    }
    if candidate.end > window.end {
        return Err(EngineError::OutsideBusinessHours(format!(
            "ends after closing at {}",
            hours.closes_at.format("%H:%M")
        )));
    }
    if (candidate.start - window.start) % STEP_MS != 0 {
        return Err(EngineError::OutsideBusinessHours(format!(
            "start is not on the {STEP_MINUTES}-minute grid"
        )));
    }
    Ok(())
}

/// `HH:MM` in the canonical offset.
pub fn format_slot(start: Ms, offset: FixedOffset) -> String {
    match local_datetime(start, offset) {
        Some(dt) => dt.time().format("%H:%M").to_string(),
        None => start.to_string(),
    }
}
