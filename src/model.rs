use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 24 * 60 * MINUTE_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    /// Minutes. Fixed once the service is registered.
    pub duration_min: u32,
    pub price_cents: i64,
    pub active: bool,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        self.duration_min as Ms * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Professional {
    pub id: Ulid,
    pub name: String,
    pub specialty: Option<String>,
}

/// Opening hours for one weekday. `opens_at`/`closes_at` are ignored when closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub open: bool,
    pub opens_at: NaiveTime,
    pub closes_at: NaiveTime,
}

impl DayHours {
    pub fn closed() -> Self {
        Self {
            open: false,
            opens_at: NaiveTime::default(),
            closes_at: NaiveTime::default(),
        }
    }

    pub fn open(opens_at: NaiveTime, closes_at: NaiveTime) -> Self {
        Self {
            open: true,
            opens_at,
            closes_at,
        }
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "PENDING",
            AppointmentStatus::Confirmed => "CONFIRMED",
            AppointmentStatus::Cancelled => "CANCELLED",
            AppointmentStatus::Completed => "COMPLETED",
        }
    }

    /// Case-insensitive. Returns `None` for anything outside the four states.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(AppointmentStatus::Pending),
            "CONFIRMED" => Some(AppointmentStatus::Confirmed),
            "CANCELLED" | "CANCELED" => Some(AppointmentStatus::Cancelled),
            "COMPLETED" => Some(AppointmentStatus::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::Completed)
    }

    /// Everything except CANCELLED keeps its interval reserved.
    pub fn occupies_slot(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Completed)
        )
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resource an appointment occupies for conflict purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    Global,
    Professional(Ulid),
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Professional(id) => write!(f, "professional:{id}"),
        }
    }
}

/// Deployment-wide choice of resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeMode {
    /// One implicit resource shared by every appointment.
    #[default]
    Global,
    /// Every appointment names a professional; conflicts are per professional.
    PerProfessional,
}

impl std::str::FromStr for ScopeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(ScopeMode::Global),
            "professional" | "per_professional" | "per-professional" => Ok(ScopeMode::PerProfessional),
            other => Err(format!("unknown scope mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub client_id: String,
    pub service_id: Ulid,
    pub professional_id: Option<Ulid>,
    pub scope: Scope,
    pub start: Ms,
    pub status: AppointmentStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// All appointments of one scope, sorted by `start`.
#[derive(Debug, Clone)]
pub struct ScopeState {
    pub scope: Scope,
    pub appointments: Vec<Appointment>,
}

impl ScopeState {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.start <= appointment.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Appointments whose start falls inside `window`, any status.
    pub fn starting_within(&self, window: &Span) -> impl Iterator<Item = &Appointment> {
        let lo = self.appointments.partition_point(|a| a.start < window.start);
        let hi = self.appointments.partition_point(|a| a.start < window.end);
        self.appointments[lo..hi].iter()
    }

    /// Appointments starting inside `window` that still hold their slot.
    pub fn active_within(&self, window: &Span) -> impl Iterator<Item = &Appointment> {
        self.starting_within(window)
            .filter(|a| a.status.occupies_slot())
    }
}

/// Flat event records. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceUpserted {
        id: Ulid,
        name: String,
        duration_min: u32,
        price_cents: i64,
        active: bool,
    },
    ProfessionalUpserted {
        id: Ulid,
        name: String,
        specialty: Option<String>,
    },
    BusinessHoursSet {
        weekday: Weekday,
        hours: DayHours,
    },
    AppointmentCreated {
        id: Ulid,
        client_id: String,
        service_id: Ulid,
        professional_id: Option<Ulid>,
        scope: Scope,
        start: Ms,
        created_at: Ms,
    },
    AppointmentStatusChanged {
        id: Ulid,
        scope: Scope,
        status: AppointmentStatus,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

/// An appointment joined with the catalog records it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentInfo {
    pub id: Ulid,
    pub client_id: String,
    pub service_id: Ulid,
    pub service_name: String,
    pub duration_min: u32,
    pub price_cents: i64,
    pub professional_id: Option<Ulid>,
    pub professional_name: Option<String>,
    pub start: Ms,
    /// Derived from the service duration, never stored.
    pub end: Ms,
    pub status: AppointmentStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoursInfo {
    pub weekday: Weekday,
    pub hours: DayHours,
}
