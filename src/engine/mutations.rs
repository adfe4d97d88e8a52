use chrono::{Datelike, Weekday};
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::check_within_hours;
use super::calendar::{day_span, format_instant, local_datetime, parse_instant, validate_hours};
use super::conflict::{busy_intervals, check_horizon, check_no_conflict, now_ms, validate_start};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Catalog and calendar ─────────────────────────────────────

    pub async fn upsert_service(
        &self,
        id: Ulid,
        name: String,
        duration_min: u32,
        price_cents: i64,
        active: bool,
    ) -> Result<Service, EngineError> {
        validate_name(&name)?;
        if duration_min == 0 || duration_min > MAX_SERVICE_DURATION_MIN {
            return Err(EngineError::InvalidInput(format!(
                "duration must be between 1 and {MAX_SERVICE_DURATION_MIN} minutes"
            )));
        }
        if price_cents < 0 {
            return Err(EngineError::InvalidInput("price must not be negative".into()));
        }

        let _admin = self.admin_lock.lock().await;
        match self.catalog.service(&id) {
            Some(existing) if existing.duration_min != duration_min => {
                return Err(EngineError::InvalidInput(format!(
                    "duration of service {id} is fixed at {} minutes",
                    existing.duration_min
                )));
            }
            Some(_) => {}
            None if self.catalog.service_count() >= MAX_SERVICES => {
                return Err(EngineError::LimitExceeded("too many services"));
            }
            None => {}
        }

        let event = Event::ServiceUpserted {
            id,
            name: name.clone(),
            duration_min,
            price_cents,
            active,
        };
        self.persist_admin(&event).await?;
        Ok(Service {
            id,
            name,
            duration_min,
            price_cents,
            active,
        })
    }

    pub async fn upsert_professional(
        &self,
        id: Ulid,
        name: String,
        specialty: Option<String>,
    ) -> Result<Professional, EngineError> {
        validate_name(&name)?;
        if let Some(ref s) = specialty
            && s.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("specialty too long"));
        }

        let _admin = self.admin_lock.lock().await;
        if self.catalog.professional(&id).is_err()
            && self.catalog.professional_count() >= MAX_PROFESSIONALS
        {
            return Err(EngineError::LimitExceeded("too many professionals"));
        }

        let event = Event::ProfessionalUpserted {
            id,
            name: name.clone(),
            specialty: specialty.clone(),
        };
        self.persist_admin(&event).await?;
        Ok(Professional { id, name, specialty })
    }

    pub async fn set_business_hours(
        &self,
        weekday: Weekday,
        hours: DayHours,
    ) -> Result<HoursInfo, EngineError> {
        validate_hours(&hours)?;
        let _admin = self.admin_lock.lock().await;
        let event = Event::BusinessHoursSet { weekday, hours };
        self.persist_admin(&event).await?;
        Ok(HoursInfo { weekday, hours })
    }

    // ── Booking coordinator ──────────────────────────────────────

    /// Validate and atomically book `requested_start` for `client_id`.
    ///
    /// The scope's write lock is held from the conflict re-check until the
    /// appointment is durable, so two overlapping requests in one scope
    /// serialize and the second sees the first.
    pub async fn create_appointment(
        &self,
        client_id: &str,
        service_id: Ulid,
        professional_id: Option<Ulid>,
        requested_start: &str,
    ) -> Result<AppointmentInfo, EngineError> {
        if client_id.is_empty() {
            return Err(EngineError::InvalidInput("client id is required".into()));
        }
        if client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(EngineError::LimitExceeded("client id too long"));
        }

        let service = self.catalog.bookable_service(&service_id)?;
        let scope = self.scope_for(professional_id)?;

        let offset = self.offset();
        let start = parse_instant(requested_start, offset)?;
        let now = now_ms();
        validate_start(start, now)?;

        let day = local_datetime(start, offset)
            .ok_or_else(|| EngineError::InvalidInput("timestamp out of range".into()))?
            .date();
        let today = local_datetime(now, offset)
            .ok_or_else(|| EngineError::InvalidInput("clock out of range".into()))?
            .date();
        check_horizon(day, today)?;
        let hours = self.calendar.hours_for(day.weekday())?;
        let candidate = Span::new(start, start + service.duration_ms());
        check_within_hours(&hours, day, offset, &candidate)?;

        let shared = self.store.scope_state(scope);
        let mut guard = shared.write().await;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_SCOPE {
            return Err(EngineError::LimitExceeded("too many appointments in scope"));
        }

        let busy = busy_intervals(guard.active_within(&day_span(day, offset)), &self.catalog)?;
        if let Err(e) = check_no_conflict(&busy, &candidate) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let id = Ulid::new();
        let event = Event::AppointmentCreated {
            id,
            client_id: client_id.to_string(),
            service_id,
            professional_id,
            scope,
            start,
            created_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let appointment = guard
            .get(&id)
            .cloned()
            .ok_or(EngineError::AppointmentNotFound(id))?;
        drop(guard);

        metrics::counter!(crate::observability::APPOINTMENTS_CREATED_TOTAL).increment(1);
        tracing::info!(
            "appointment {id} booked for {client_id} in {scope} at {}",
            format_instant(start, offset)
        );
        self.describe(&appointment)
    }

    /// Client-initiated cancellation of an appointment the client owns.
    pub async fn cancel_appointment(
        &self,
        id: Ulid,
        requesting_client: &str,
    ) -> Result<AppointmentInfo, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let current = guard
            .get(&id)
            .cloned()
            .ok_or(EngineError::AppointmentNotFound(id))?;
        if current.client_id != requesting_client {
            return Err(EngineError::Forbidden(format!(
                "appointment {id} belongs to another client"
            )));
        }
        self.transition(&mut guard, current, AppointmentStatus::Cancelled)
            .await
    }

    /// Staff-driven status change along the appointment lifecycle.
    pub async fn set_status(
        &self,
        id: Ulid,
        new_status: &str,
    ) -> Result<AppointmentInfo, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let current = guard
            .get(&id)
            .cloned()
            .ok_or(EngineError::AppointmentNotFound(id))?;
        let Some(next) = AppointmentStatus::parse(new_status) else {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: new_status.to_string(),
            });
        };
        self.transition(&mut guard, current, next).await
    }

    async fn transition(
        &self,
        guard: &mut ScopeState,
        current: Appointment,
        next: AppointmentStatus,
    ) -> Result<AppointmentInfo, EngineError> {
        if !current.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: next.as_str().to_string(),
            });
        }

        let event = Event::AppointmentStatusChanged {
            id: current.id,
            scope: current.scope,
            status: next,
            at: now_ms(),
        };
        self.persist_and_apply(guard, &event).await?;
        metrics::counter!(
            crate::observability::APPOINTMENT_TRANSITIONS_TOTAL,
            "status" => next.as_str()
        )
        .increment(1);
        tracing::info!("appointment {} {} -> {next}", current.id, current.status);

        let updated = guard
            .get(&current.id)
            .cloned()
            .ok_or(EngineError::AppointmentNotFound(current.id))?;
        self.describe(&updated)
    }

    // ── WAL maintenance ──────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Holds the admin lock and every scope's write lock until the new file is in
    /// place, so no event can land in the old log after the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _admin = self.admin_lock.lock().await;

        let mut events = Vec::new();
        for service in self.catalog.services() {
            events.push(Event::ServiceUpserted {
                id: service.id,
                name: service.name,
                duration_min: service.duration_min,
                price_cents: service.price_cents,
                active: service.active,
            });
        }
        for professional in self.catalog.professionals() {
            events.push(Event::ProfessionalUpserted {
                id: professional.id,
                name: professional.name,
                specialty: professional.specialty,
            });
        }
        for row in self.calendar.rows() {
            events.push(Event::BusinessHoursSet {
                weekday: row.weekday,
                hours: row.hours,
            });
        }

        // Fixed lock order across scopes.
        let mut scopes = self.store.scopes();
        scopes.sort_by_key(|(scope, _)| *scope);

        let mut guards = Vec::with_capacity(scopes.len());
        for (_, shared) in scopes {
            guards.push(shared.write_owned().await);
        }
        for guard in &guards {
            for a in &guard.appointments {
                events.push(Event::AppointmentCreated {
                    id: a.id,
                    client_id: a.client_id.clone(),
                    service_id: a.service_id,
                    professional_id: a.professional_id,
                    scope: a.scope,
                    start: a.start,
                    created_at: a.created_at,
                });
                if a.status != AppointmentStatus::Pending {
                    events.push(Event::AppointmentStatusChanged {
                        id: a.id,
                        scope: a.scope,
                        status: a.status,
                        at: a.updated_at,
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        tracing::debug!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}
