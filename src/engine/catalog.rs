use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Services and professionals, looked up by id. Records are upserted, never removed.
pub struct Catalog {
    services: DashMap<Ulid, Service>,
    professionals: DashMap<Ulid, Professional>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            professionals: DashMap::new(),
        }
    }

    pub fn service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    /// Only active services can be listed or booked.
    pub fn bookable_service(&self, id: &Ulid) -> Result<Service, EngineError> {
        self.service(id)
            .filter(|s| s.active)
            .ok_or(EngineError::ServiceNotFound(*id))
    }

    /// Inactive services still describe the appointments already made with them.
    pub fn service_duration_ms(&self, id: &Ulid) -> Result<Ms, EngineError> {
        self.services
            .get(id)
            .map(|s| s.duration_ms())
            .ok_or(EngineError::ServiceNotFound(*id))
    }

    pub fn professional(&self, id: &Ulid) -> Result<Professional, EngineError> {
        self.professionals
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::ProfessionalNotFound(*id))
    }

    pub fn put_service(&self, service: Service) {
        self.services.insert(service.id, service);
    }

    pub fn put_professional(&self, professional: Professional) {
        self.professionals.insert(professional.id, professional);
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn professional_count(&self) -> usize {
        self.professionals.len()
    }

    /// Sorted by name.
    pub fn services(&self) -> Vec<Service> {
        let mut all: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        all
    }

    /// Sorted by name.
    pub fn professionals(&self) -> Vec<Professional> {
        let mut all: Vec<Professional> = self
            .professionals
            .iter()
            .map(|e| e.value().clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        all
    }
}
