//! Configuration cache backed by the durable store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::binding::BindingTracker;
use crate::configuration::Configuration;
use crate::error::Result;
use crate::filter::Filter;
use crate::persistence::PersistenceManager;
use crate::properties::SERVICE_PID;

/// Cache of live configurations. At most one instance exists per PID.
pub struct ConfigurationStore {
    cache: Mutex<HashMap<String, Arc<Configuration>>>,
    persistence: Arc<dyn PersistenceManager>,
    bindings: Arc<BindingTracker>,
}

impl ConfigurationStore {
    pub fn new(persistence: Arc<dyn PersistenceManager>, bindings: Arc<BindingTracker>) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            persistence,
            bindings,
        }
    }

    pub fn get_cached(&self, pid: &str) -> Option<Arc<Configuration>> {
        self.cache.lock().get(pid).cloned()
    }

    /// Insert unless another instance with the same PID is already cached,
    /// in which case that instance wins and is returned.
    pub fn cache(&self, config: Arc<Configuration>) -> Arc<Configuration> {
        let mut cache = self.cache.lock();
        cache
            .entry(config.pid().to_string())
            .or_insert(config)
            .clone()
    }

    pub fn remove(&self, pid: &str) -> Option<Arc<Configuration>> {
        self.cache.lock().remove(pid)
    }

    pub fn cached_all(&self) -> Vec<Arc<Configuration>> {
        self.cache.lock().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    /// Cached instance, else load from the durable store. Store failures
    /// are logged and reported as not found.
    pub async fn get_configuration(&self, pid: &str) -> Option<Arc<Configuration>> {
        if let Some(config) = self.get_cached(pid) {
            return Some(config);
        }

        match self.persistence.exists(pid).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                error!(pid = %pid, error = %e, "Failed to check for configuration");
                return None;
            }
        }

        let dict = match self.persistence.load(pid).await {
            Ok(Some(dict)) => dict,
            Ok(None) => return None,
            Err(e) => {
                error!(pid = %pid, error = %e, "Failed to load configuration");
                return None;
            }
        };

        let Some(config) = Configuration::from_persisted(&dict) else {
            debug!(pid = %pid, "Stored dictionary has no PID, ignoring");
            return None;
        };
        Some(self.adopt(config).await)
    }

    /// Configurations whose stored dictionary matches `filter`. Cached
    /// instances are reused and new configurations are left out.
    pub async fn list(&self, filter: Option<&Filter>) -> Result<Vec<Arc<Configuration>>> {
        let dicts = self.persistence.list_matching(filter).await?;
        let mut result = Vec::with_capacity(dicts.len());
        for dict in dicts {
            let Some(pid) = dict.get_str(SERVICE_PID) else {
                continue;
            };
            let config = match self.get_cached(pid) {
                Some(config) => config,
                None => match Configuration::from_persisted(&dict) {
                    Some(config) => self.adopt(config).await,
                    None => continue,
                },
            };
            if !config.is_new() && !config.is_deleted() {
                result.push(config);
            }
        }
        Ok(result)
    }

    async fn adopt(&self, config: Configuration) -> Arc<Configuration> {
        config.restore_dynamic(self.bindings.get(config.pid()).await);
        self.cache(Arc::new(config))
    }
}
