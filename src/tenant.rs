use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::reaper;

/// Per-tenant engines, keyed by the database name of the connection. Each
/// tenant has its own engine, WAL file and background tasks.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    engine_config: EngineConfig,
    compact_threshold: u64,
    reaper_interval: Duration,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        engine_config: EngineConfig,
        compact_threshold: u64,
        reaper_interval: Duration,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            engine_config,
            compact_threshold,
            reaper_interval,
        }
    }

    /// Get or lazily create the engine for `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Tenant names become file names.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let entry = self.engines.entry(tenant.to_string());
        let engine = match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, self.engine_config.clone())?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));
        if !self.reaper_interval.is_zero() {
            tokio::spawn(reaper::run_reaper(engine.clone(), self.reaper_interval));
        }

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("tenant {tenant} opened ({safe_name}.wal)");
        Ok(engine)
    }
}
