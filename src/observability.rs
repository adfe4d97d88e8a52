use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "agenda_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "agenda_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: appointments committed.
pub const APPOINTMENTS_CREATED_TOTAL: &str = "agenda_appointments_created_total";

/// Counter: bookings refused because the interval was already taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "agenda_booking_conflicts_total";

/// Counter: lifecycle transitions applied. Labels: status.
pub const APPOINTMENT_TRANSITIONS_TOTAL: &str = "agenda_appointment_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "agenda_connections_active";

pub const CONNECTIONS_TOTAL: &str = "agenda_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "agenda_connections_rejected_total";

/// Gauge: number of loaded businesses.
pub const TENANTS_ACTIVE: &str = "agenda_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "agenda_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "agenda_wal_flush_batch_size";

/// Counter: background WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "agenda_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertService { .. } => "upsert_service",
        Command::UpsertProfessional { .. } => "upsert_professional",
        Command::SetBusinessHours { .. } => "set_business_hours",
        Command::InsertAppointment { .. } => "create_appointment",
        Command::DeleteAppointment { .. } => "cancel_appointment",
        Command::SetAppointmentStatus { .. } => "set_status",
        Command::SelectSlots { .. } => "list_slots",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectServices => "select_services",
        Command::SelectProfessionals => "select_professionals",
        Command::SelectBusinessHours => "select_business_hours",
    }
}
