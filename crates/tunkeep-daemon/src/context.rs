//! Process-wide runtime context, constructed once at startup and shared by
//! every component that reads or mutates runtime state.

use std::path::Path;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use tunkeep_core::RuntimeConfig;

use crate::events::EventBroadcaster;
use crate::identity::IdentityRegistry;
use crate::store::{ConfigStore, StoreError};

/// Version reported in status snapshots.
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared runtime state.
///
/// `settings` holds every persisted field except the identity list, which is
/// owned by the registry. All saves go through [`RuntimeContext::persist`].
#[derive(Debug)]
pub struct RuntimeContext {
    store: ConfigStore,
    settings: RwLock<RuntimeConfig>,
    registry: IdentityRegistry,
    events: EventBroadcaster,
    started: Instant,
    save_lock: Mutex<()>,
}

impl RuntimeContext {
    pub fn new(store: ConfigStore, mut config: RuntimeConfig, events: EventBroadcaster) -> Self {
        let registry = IdentityRegistry::from_records(std::mem::take(&mut config.identities));
        Self {
            store,
            settings: RwLock::new(config),
            registry,
            events,
            started: Instant::now(),
            save_lock: Mutex::new(()),
        }
    }

    pub const fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Directory holding the config file and credential files.
    pub fn config_dir(&self) -> &Path {
        self.store.dir()
    }

    pub const fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub const fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    /// Copy of the current settings (identity list empty).
    pub async fn settings(&self) -> RuntimeConfig {
        self.settings.read().await.clone()
    }

    /// Mutate settings in place. Does not persist.
    pub async fn update_settings<R>(&self, f: impl FnOnce(&mut RuntimeConfig) -> R) -> R {
        let mut settings = self.settings.write().await;
        f(&mut settings)
    }

    /// Milliseconds since the runtime started.
    pub fn uptime_millis(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    /// Status snapshot with computed fields filled in.
    pub async fn status(&self, only_loaded: bool) -> RuntimeConfig {
        let mut snapshot = self.settings().await;
        snapshot.identities = self.registry.records(only_loaded).await;
        snapshot.duration = self.uptime_millis();
        SERVICE_VERSION.clone_into(&mut snapshot.service_version);
        snapshot
    }

    /// Save settings and identities. Saves are serialized; a snapshot is
    /// taken after acquiring the save lock so the newest state always wins.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.save_lock.lock().await;
        let mut snapshot = self.settings().await;
        snapshot.identities = self.registry.persisted_records().await;
        snapshot.duration = self.uptime_millis();
        SERVICE_VERSION.clone_into(&mut snapshot.service_version);

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        debug!("Runtime state persisted");
        Ok(())
    }
}
