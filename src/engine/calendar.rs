use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use dashmap::DashMap;

use crate::model::*;

use super::EngineError;

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Weekday → opening hours. Every weekday must have a row once the business is configured.
pub struct BusinessCalendar {
    days: DashMap<Weekday, DayHours>,
}

impl Default for BusinessCalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl BusinessCalendar {
    pub fn new() -> Self {
        Self {
            days: DashMap::new(),
        }
    }

    /// A missing row is a configuration bug, never a closed day.
    pub fn hours_for(&self, weekday: Weekday) -> Result<DayHours, EngineError> {
        self.days
            .get(&weekday)
            .map(|e| *e.value())
            .ok_or(EngineError::MissingBusinessHours(weekday))
    }

    pub fn set(&self, weekday: Weekday, hours: DayHours) {
        self.days.insert(weekday, hours);
    }

    /// Configured rows, Monday first.
    pub fn rows(&self) -> Vec<HoursInfo> {
        WEEK.iter()
            .filter_map(|day| {
                self.days.get(day).map(|h| HoursInfo {
                    weekday: *day,
                    hours: *h.value(),
                })
            })
            .collect()
    }
}

pub(crate) fn validate_hours(hours: &DayHours) -> Result<(), EngineError> {
    if hours.open && hours.opens_at >= hours.closes_at {
        return Err(EngineError::InvalidInput(format!(
            "opens_at {} must be before closes_at {}",
            hours.opens_at.format("%H:%M"),
            hours.closes_at.format("%H:%M")
        )));
    }
    Ok(())
}

// ── Canonical clock ─────────────────────────────────────────────

/// Instant of a local wall-clock time in the canonical offset.
pub fn local_ms(date: NaiveDate, time: NaiveTime, offset: FixedOffset) -> Ms {
    date.and_time(time).and_utc().timestamp_millis() - offset.local_minus_utc() as Ms * 1000
}

/// Wall-clock reading of an instant in the canonical offset.
pub fn local_datetime(ms: Ms, offset: FixedOffset) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.with_timezone(&offset).naive_local())
}

/// The whole calendar day `[00:00, next 00:00)` in the canonical offset.
pub fn day_span(date: NaiveDate, offset: FixedOffset) -> Span {
    let start = local_ms(date, NaiveTime::default(), offset);
    Span::new(start, start + DAY_MS)
}

/// The day's opening window, or `None` when closed.
pub fn opening_span(hours: &DayHours, date: NaiveDate, offset: FixedOffset) -> Option<Span> {
    if !hours.open || hours.opens_at >= hours.closes_at {
        return None;
    }
    Some(Span::new(
        local_ms(date, hours.opens_at, offset),
        local_ms(date, hours.closes_at, offset),
    ))
}

/// RFC 3339 rendering in the canonical offset.
pub fn format_instant(ms: Ms, offset: FixedOffset) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.with_timezone(&offset).to_rfc3339(),
        None => ms.to_string(),
    }
}

/// Parse an ISO-8601 instant. Offset-less input is read in the canonical offset.
pub fn parse_instant(s: &str, offset: FixedOffset) -> Result<Ms, EngineError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(local_ms(naive.date(), naive.time(), offset));
        }
    }
    Err(EngineError::InvalidInput(format!("not an ISO-8601 instant: {s}")))
}
