use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::availability::{format_slot, open_starts};
use super::calendar::{day_span, local_datetime};
use super::conflict::{busy_intervals, check_horizon, now_ms};
use super::{Engine, EngineError};

impl Engine {
    /// Bookable `HH:MM` start times for `service_id` on `date`, ascending.
    ///
    /// Read-only: takes the scope's read lock once to snapshot the day's busy
    /// intervals, then walks the grid without holding it.
    pub async fn list_slots(
        &self,
        date: NaiveDate,
        service_id: Ulid,
        professional_id: Option<Ulid>,
    ) -> Result<Vec<String>, EngineError> {
        let service = self.catalog.bookable_service(&service_id)?;
        let scope = self.scope_for(professional_id)?;
        let offset = self.offset();

        let now = now_ms();
        let today = local_datetime(now, offset)
            .map(|dt| dt.date())
            .ok_or_else(|| EngineError::InvalidInput("clock out of range".into()))?;
        check_horizon(date, today)?;

        let hours = self.calendar.hours_for(date.weekday())?;
        if !hours.open {
            return Ok(Vec::new());
        }

        let day = day_span(date, offset);
        let booked = self.store.find_active_on_day(&day, scope).await;
        let busy: Vec<Span> = busy_intervals(booked.iter(), &self.catalog)?
            .into_iter()
            .map(|(_, span)| span)
            .collect();

        let starts = open_starts(&hours, date, offset, service.duration_ms(), &busy, now);
        Ok(starts.into_iter().map(|s| format_slot(s, offset)).collect())
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<AppointmentInfo, EngineError> {
        let appointment = self
            .store
            .find_by_id(&id)
            .await
            .ok_or(EngineError::AppointmentNotFound(id))?;
        self.describe(&appointment)
    }

    pub async fn list_client_appointments(
        &self,
        client_id: &str,
    ) -> Result<Vec<AppointmentInfo>, EngineError> {
        self.store
            .find_by_client(client_id)
            .await
            .iter()
            .map(|a| self.describe(a))
            .collect()
    }

    /// Every appointment in every scope, ascending by start.
    pub async fn list_appointments(&self) -> Result<Vec<AppointmentInfo>, EngineError> {
        self.store
            .all()
            .await
            .iter()
            .map(|a| self.describe(a))
            .collect()
    }

    pub fn list_services(&self, include_inactive: bool) -> Vec<Service> {
        self.catalog
            .services()
            .into_iter()
            .filter(|s| include_inactive || s.active)
            .collect()
    }

    pub fn list_professionals(&self) -> Vec<Professional> {
        self.catalog.professionals()
    }

    pub fn business_hours(&self) -> Vec<HoursInfo> {
        self.calendar.rows()
    }

    /// Attach the service and professional snapshot to an appointment.
    pub(super) fn describe(&self, a: &Appointment) -> Result<AppointmentInfo, EngineError> {
        let service = self
            .catalog
            .service(&a.service_id)
            .ok_or(EngineError::ServiceNotFound(a.service_id))?;
        let professional_name = match a.professional_id {
            Some(pid) => Some(self.catalog.professional(&pid)?.name),
            None => None,
        };
        Ok(AppointmentInfo {
            id: a.id,
            client_id: a.client_id.clone(),
            service_id: a.service_id,
            service_name: service.name.clone(),
            duration_min: service.duration_min,
            price_cents: service.price_cents,
            professional_id: a.professional_id,
            professional_name,
            start: a.start,
            end: a.start + service.duration_ms(),
            status: a.status,
            created_at: a.created_at,
            updated_at: a.updated_at,
        })
    }
}
