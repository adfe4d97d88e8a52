use chrono::Weekday;
use ulid::Ulid;

use crate::model::AppointmentStatus;

#[derive(Debug)]
pub enum EngineError {
    ServiceNotFound(Ulid),
    ProfessionalNotFound(Ulid),
    AppointmentNotFound(Ulid),
    InvalidInput(String),
    OutsideBusinessHours(String),
    SlotConflict(Ulid),
    Forbidden(String),
    InvalidTransition {
        from: AppointmentStatus,
        to: String,
    },
    MissingBusinessHours(Weekday),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ServiceNotFound(_)
            | EngineError::ProfessionalNotFound(_)
            | EngineError::AppointmentNotFound(_) => "not_found",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::OutsideBusinessHours(_) => "outside_business_hours",
            EngineError::SlotConflict(_) => "slot_conflict",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::MissingBusinessHours(_) => "configuration",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ServiceNotFound(id) => write!(f, "service not found: {id}"),
            EngineError::ProfessionalNotFound(id) => write!(f, "professional not found: {id}"),
            EngineError::AppointmentNotFound(id) => write!(f, "appointment not found: {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::OutsideBusinessHours(msg) => {
                write!(f, "outside business hours: {msg}")
            }
            EngineError::SlotConflict(id) => {
                write!(f, "slot conflicts with appointment: {id}")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::MissingBusinessHours(day) => {
                write!(f, "configuration error: no business hours for {day}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
