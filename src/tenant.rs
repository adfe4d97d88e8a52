use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor;
use crate::engine::{Engine, EngineSettings};
use crate::limits::{MAX_TENANT_NAME_LEN, MAX_TENANTS};

/// Engines keyed by business. A business is the database name a client connects
/// to; each one replays its own `<name>.wal` under the data dir and gets its own
/// compactor task.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    settings: EngineSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, settings: EngineSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            settings,
        }
    }

    /// The engine for `business`, opening it on first use.
    pub fn get_or_create(&self, business: &str) -> io::Result<Arc<Engine>> {
        if let Some(open) = self.engines.get(business) {
            return Ok(Arc::clone(open.value()));
        }
        let file_name = wal_file_name(business)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many businesses"));
        }

        // Holding the entry keeps a second first-connection from replaying the same WAL.
        let vacant = match self.engines.entry(business.to_string()) {
            Entry::Occupied(open) => return Ok(Arc::clone(open.get())),
            Entry::Vacant(vacant) => vacant,
        };
        let engine = Arc::new(Engine::new(self.data_dir.join(&file_name), self.settings)?);
        tokio::spawn(compactor::run_compactor(
            Arc::clone(&engine),
            self.compact_threshold,
        ));
        vacant.insert(Arc::clone(&engine));

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("opened business {business} ({file_name})");
        Ok(engine)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

/// File name for a business's WAL. Names are used as-is, so only `[A-Za-z0-9_-]`
/// is accepted and distinct businesses never share a file.
fn wal_file_name(business: &str) -> io::Result<String> {
    if business.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "business name too long",
        ));
    }
    if business.is_empty()
        || !business
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("business name {business:?} may only use letters, digits, '_' and '-'"),
        ));
    }
    Ok(format!("{business}.wal"))
}
