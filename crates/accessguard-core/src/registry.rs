//! Process-wide lookup of guards by id.

use crate::config::AccessGuardConfig;
use crate::guard::AccessGuard;
use crate::store::{AccessCodeStore, SecretStore};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Hands out exactly one [`AccessGuard`] per id, all sharing one store.
pub struct GuardRegistry {
    config: Arc<AccessGuardConfig>,
    store: AccessCodeStore,
    guards: Mutex<HashMap<String, Arc<AccessGuard>>>,
}

impl GuardRegistry {
    pub fn new(config: Arc<AccessGuardConfig>, backend: Arc<dyn SecretStore>) -> Self {
        let store = AccessCodeStore::new(backend, config.store_timeout());
        Self {
            config,
            store,
            guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AccessGuardConfig {
        &self.config
    }

    /// Return the guard for `guard_id`, creating and syncing it on first use.
    ///
    /// The sync runs outside the registry lock so a slow store only delays
    /// callers of this id. A failed initial sync is logged and left for the
    /// guard's next operation to retry.
    pub async fn instance(&self, guard_id: &str) -> Arc<AccessGuard> {
        let guard = {
            let mut guards = self.guards.lock().await;
            if let Some(guard) = guards.get(guard_id) {
                return guard.clone();
            }
            let settings = self.config.settings_for(guard_id);
            let guard = Arc::new(AccessGuard::new(guard_id, settings, self.store.clone()));
            guards.insert(guard_id.to_string(), guard.clone());
            guard
        };

        debug!("registered guard {guard_id}");
        if let Err(err) = guard.refresh().await {
            warn!("[{}] initial sync of guard {guard_id} failed: {err}", err.code());
        }
        guard
    }

    /// Ids of guards created so far.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.guards.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Lock every guard, e.g. when the host session ends.
    pub async fn lock_all(&self) {
        let guards: Vec<Arc<AccessGuard>> = self.guards.lock().await.values().cloned().collect();
        for guard in guards {
            guard.lock().await;
        }
    }
}
