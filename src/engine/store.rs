use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedScopeState;

/// Durable-in-memory home of every appointment, partitioned by scope.
///
/// Each scope sits behind its own `RwLock`: slot listing takes read locks, the booking
/// path holds the write lock across conflict re-check, WAL append and apply.
pub struct AppointmentStore {
    scopes: DashMap<Scope, SharedScopeState>,
    appointment_scope: DashMap<Ulid, Scope>,
    by_client: DashMap<String, Vec<Ulid>>,
}

impl Default for AppointmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AppointmentStore {
    pub fn new() -> Self {
        Self {
            scopes: DashMap::new(),
            appointment_scope: DashMap::new(),
            by_client: DashMap::new(),
        }
    }

    // ── Scopes ───────────────────────────────────────────────

    /// Get the scope's state, creating an empty one on first use.
    pub fn scope_state(&self, scope: Scope) -> SharedScopeState {
        self.scopes
            .entry(scope)
            .or_insert_with(|| Arc::new(RwLock::new(ScopeState::new(scope))))
            .value()
            .clone()
    }

    pub fn existing_scope(&self, scope: &Scope) -> Option<SharedScopeState> {
        self.scopes.get(scope).map(|e| e.value().clone())
    }

    pub fn scopes(&self) -> Vec<(Scope, SharedScopeState)> {
        self.scopes
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    // ── Indexes ──────────────────────────────────────────────

    pub fn scope_of(&self, appointment_id: &Ulid) -> Option<Scope> {
        self.appointment_scope.get(appointment_id).map(|e| *e.value())
    }

    pub fn client_appointments(&self, client_id: &str) -> Vec<Ulid> {
        self.by_client
            .get(client_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn appointment_count(&self) -> usize {
        self.appointment_scope.len()
    }

    // ── Lookups ──────────────────────────────────────────────

    pub async fn find_by_id(&self, id: &Ulid) -> Option<Appointment> {
        let scope = self.scope_of(id)?;
        let shared = self.existing_scope(&scope)?;
        let guard = shared.read().await;
        guard.get(id).cloned()
    }

    /// Appointments starting on the day `window` covers that still hold their slot.
    pub async fn find_active_on_day(&self, window: &Span, scope: Scope) -> Vec<Appointment> {
        let Some(shared) = self.existing_scope(&scope) else {
            return Vec::new();
        };
        let guard = shared.read().await;
        guard.active_within(window).cloned().collect()
    }

    /// Ascending by start.
    pub async fn find_by_client(&self, client_id: &str) -> Vec<Appointment> {
        let mut found = Vec::new();
        for id in self.client_appointments(client_id) {
            if let Some(appointment) = self.find_by_id(&id).await {
                found.push(appointment);
            }
        }
        found.sort_by_key(|a| (a.start, a.id));
        found
    }

    /// Ascending by start.
    pub async fn all(&self) -> Vec<Appointment> {
        let mut found = Vec::new();
        for (_, shared) in self.scopes() {
            let guard = shared.read().await;
            found.extend(guard.appointments.iter().cloned());
        }
        found.sort_by_key(|a| (a.start, a.id));
        found
    }

    // ── Event application ────────────────────────────────────

    /// Apply an appointment event to its scope (caller holds the write lock).
    pub fn apply_event(&self, ss: &mut ScopeState, event: &Event) {
        match event {
            Event::AppointmentCreated {
                id,
                client_id,
                service_id,
                professional_id,
                scope,
                start,
                created_at,
            } => {
                ss.insert_appointment(Appointment {
                    id: *id,
                    client_id: client_id.clone(),
                    service_id: *service_id,
                    professional_id: *professional_id,
                    scope: *scope,
                    start: *start,
                    status: AppointmentStatus::Pending,
                    created_at: *created_at,
                    updated_at: *created_at,
                });
                self.appointment_scope.insert(*id, *scope);
                self.by_client.entry(client_id.clone()).or_default().push(*id);
            }
            Event::AppointmentStatusChanged { id, status, at, .. } => {
                if let Some(appointment) = ss.get_mut(id) {
                    appointment.status = *status;
                    appointment.updated_at = *at;
                }
            }
            // Catalog and calendar events never reach a scope.
            Event::ServiceUpserted { .. }
            | Event::ProfessionalUpserted { .. }
            | Event::BusinessHoursSet { .. } => {}
        }
    }
}
