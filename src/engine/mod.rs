mod availability;
mod calendar;
mod catalog;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{STEP_MINUTES, format_slot};
pub use calendar::{format_instant, local_ms, parse_instant};
pub use error::EngineError;

use calendar::BusinessCalendar;
use catalog::Catalog;
use store::AppointmentStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, Offset, Utc};
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedScopeState = Arc<RwLock<ScopeState>>;

/// Deployment-time knobs fixed for the life of an engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub scope_mode: ScopeMode,
    /// The single canonical clock: day boundaries, weekdays and `HH:MM` labels use it.
    pub utc_offset: FixedOffset,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scope_mode: ScopeMode::Global,
            utc_offset: Utc.fix(),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync and answers every sender with its result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Flush what we have before compaction or stats.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.stage(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.commit().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One business: its calendar, catalog and appointment book, persisted through one WAL.
pub struct Engine {
    pub(super) settings: EngineSettings,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) calendar: BusinessCalendar,
    pub(super) catalog: Catalog,
    pub(super) store: AppointmentStore,
    /// Serializes catalog and calendar writes (validate → append → apply).
    pub(super) admin_lock: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, settings: EngineSettings) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            settings,
            wal_tx,
            calendar: BusinessCalendar::new(),
            catalog: Catalog::new(),
            store: AppointmentStore::new(),
            admin_lock: Mutex::new(()),
        };
        if settings.scope_mode == ScopeMode::Global {
            engine.store.scope_state(Scope::Global);
        }

        // Nothing else holds the engine yet, so try_write cannot contend. Blocking
        // lock calls are off-limits: this may run inside a runtime.
        for event in &events {
            match event_scope(event) {
                Some(scope) => {
                    let shared = engine.store.scope_state(scope);
                    let mut guard = shared.try_write().map_err(|_| {
                        io::Error::other(format!("scope {scope} locked during replay"))
                    })?;
                    engine.store.apply_event(&mut guard, event);
                }
                None => engine.apply_admin_event(event),
            }
        }
        tracing::debug!(
            "replayed {} events from {}: {} appointments",
            events.len(),
            wal_path.display(),
            engine.store.appointment_count()
        );

        Ok(engine)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn offset(&self) -> FixedOffset {
        self.settings.utc_offset
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply to the scope whose write lock the caller holds.
    pub(super) async fn persist_and_apply(
        &self,
        ss: &mut ScopeState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(ss, event);
        Ok(())
    }

    /// WAL-append then apply a catalog or calendar event. Caller holds `admin_lock`.
    pub(super) async fn persist_admin(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_admin_event(event);
        Ok(())
    }

    /// The scope a booking competes in. In global mode a named professional is
    /// recorded on the appointment but does not partition conflicts.
    pub(super) fn scope_for(&self, professional_id: Option<Ulid>) -> Result<Scope, EngineError> {
        if let Some(pid) = professional_id {
            self.catalog.professional(&pid)?;
        }
        match (self.settings.scope_mode, professional_id) {
            (ScopeMode::Global, _) => Ok(Scope::Global),
            (ScopeMode::PerProfessional, Some(pid)) => Ok(Scope::Professional(pid)),
            (ScopeMode::PerProfessional, None) => Err(EngineError::InvalidInput(
                "professional_id is required".into(),
            )),
        }
    }

    /// Find the scope holding `appointment_id` and take its write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ScopeState>, EngineError> {
        let scope = self
            .store
            .scope_of(appointment_id)
            .ok_or(EngineError::AppointmentNotFound(*appointment_id))?;
        let shared = self
            .store
            .existing_scope(&scope)
            .ok_or(EngineError::AppointmentNotFound(*appointment_id))?;
        Ok(shared.write_owned().await)
    }

    fn apply_admin_event(&self, event: &Event) {
        match event {
            Event::ServiceUpserted {
                id,
                name,
                duration_min,
                price_cents,
                active,
            } => self.catalog.put_service(Service {
                id: *id,
                name: name.clone(),
                duration_min: *duration_min,
                price_cents: *price_cents,
                active: *active,
            }),
            Event::ProfessionalUpserted { id, name, specialty } => {
                self.catalog.put_professional(Professional {
                    id: *id,
                    name: name.clone(),
                    specialty: specialty.clone(),
                });
                // Every scope a booking can land in exists before the first booking.
                if self.settings.scope_mode == ScopeMode::PerProfessional {
                    self.store.scope_state(Scope::Professional(*id));
                }
            }
            Event::BusinessHoursSet { weekday, hours } => self.calendar.set(*weekday, *hours),
            Event::AppointmentCreated { .. } | Event::AppointmentStatusChanged { .. } => {}
        }
    }
}

/// The scope an appointment event belongs to; `None` for catalog/calendar events.
fn event_scope(event: &Event) -> Option<Scope> {
    match event {
        Event::AppointmentCreated { scope, .. } | Event::AppointmentStatusChanged { scope, .. } => {
            Some(*scope)
        }
        Event::ServiceUpserted { .. }
        | Event::ProfessionalUpserted { .. }
        | Event::BusinessHoursSet { .. } => None,
    }
}
