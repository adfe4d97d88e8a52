use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::catalog::Catalog;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// A requested start must be a sane instant strictly in the future.
pub(crate) fn validate_start(start: Ms, now: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::InvalidInput("timestamp out of range".into()));
    }
    if start <= now {
        return Err(EngineError::InvalidInput("start must be in the future".into()));
    }
    Ok(())
}

/// The booking horizon, counted in local calendar days. Slot listing and booking
/// both go through here, so every listed slot stays bookable.
pub(crate) fn check_horizon(date: NaiveDate, today: NaiveDate) -> Result<(), EngineError> {
    use crate::limits::MAX_BOOKING_HORIZON_DAYS;
    if (date - today).num_days() > MAX_BOOKING_HORIZON_DAYS {
        return Err(EngineError::InvalidInput(format!(
            "date is more than {MAX_BOOKING_HORIZON_DAYS} days ahead"
        )));
    }
    Ok(())
}

/// `[start, end)` of each appointment, with `end` recomputed from its service's duration.
pub(crate) fn busy_intervals<'a>(
    appointments: impl Iterator<Item = &'a Appointment>,
    catalog: &Catalog,
) -> Result<Vec<(Ulid, Span)>, EngineError> {
    appointments
        .map(|a| {
            let duration = catalog.service_duration_ms(&a.service_id)?;
            Ok((a.id, Span::new(a.start, a.start + duration)))
        })
        .collect()
}

pub(crate) fn check_no_conflict(busy: &[(Ulid, Span)], candidate: &Span) -> Result<(), EngineError> {
    match busy.iter().find(|(_, span)| span.overlaps(candidate)) {
        Some((id, _)) => Err(EngineError::SlotConflict(*id)),
        None => Ok(()),
    }
}
