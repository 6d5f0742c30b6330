//! Dynamic location bindings.
//!
//! A configuration without an explicit owner is bound to the first target
//! that receives it. Those bindings are persisted as one dictionary under a
//! reserved PID so they survive restarts.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::configuration::Configuration;
use crate::error::Result;
use crate::persistence::PersistenceManager;
use crate::properties::Properties;
use crate::registry::TargetRegistry;

/// Persisted map of PID to dynamically bound owner location.
pub struct BindingTracker {
    bindings: Mutex<BTreeMap<String, String>>,
    persistence: Arc<dyn PersistenceManager>,
    store_pid: String,
}

impl BindingTracker {
    /// Load persisted bindings. When `prune` is set, entries whose owner no
    /// longer exists are dropped silently and the map is written back.
    pub async fn load(
        persistence: Arc<dyn PersistenceManager>,
        store_pid: impl Into<String>,
        registry: &dyn TargetRegistry,
        prune: bool,
    ) -> Result<Self> {
        let store_pid = store_pid.into();
        let mut bindings = BTreeMap::new();
        if let Some(dict) = persistence.load(&store_pid).await? {
            for (pid, location) in dict.iter() {
                if let Some(location) = location.as_str() {
                    bindings.insert(pid.to_string(), location.to_string());
                }
            }
        }

        let mut pruned = 0usize;
        if prune {
            let mut live = BTreeMap::new();
            for (pid, location) in bindings {
                if registry.owner_exists(&location).await {
                    live.insert(pid, location);
                } else {
                    pruned += 1;
                }
            }
            bindings = live;
        }

        let tracker = Self {
            bindings: Mutex::new(bindings),
            persistence,
            store_pid,
        };

        if pruned > 0 {
            let guard = tracker.bindings.lock().await;
            tracker.persist(&guard).await;
            debug!(pruned, "Pruned stale dynamic bindings");
        }

        Ok(tracker)
    }

    pub async fn get(&self, pid: &str) -> Option<String> {
        self.bindings.lock().await.get(pid).cloned()
    }

    /// Record (or with `None`, clear) the dynamic binding of `pid`.
    pub async fn put(&self, pid: &str, location: Option<&str>) {
        let mut bindings = self.bindings.lock().await;
        let changed = match location {
            Some(location) => {
                bindings.insert(pid.to_string(), location.to_string()).as_deref() != Some(location)
            }
            None => bindings.remove(pid).is_some(),
        };
        if changed {
            self.persist(&bindings).await;
        }
    }

    /// Forget every binding to `location`, returning the affected PIDs.
    pub async fn remove_owner(&self, location: &str) -> Vec<String> {
        let mut bindings = self.bindings.lock().await;
        let pids: Vec<String> = bindings
            .iter()
            .filter(|(_, l)| l.as_str() == location)
            .map(|(pid, _)| pid.clone())
            .collect();
        if !pids.is_empty() {
            for pid in &pids {
                bindings.remove(pid);
            }
            self.persist(&bindings).await;
        }
        pids
    }

    /// Bind `config` to `location` unless it already has an owner.
    pub async fn try_bind(&self, config: &Configuration, location: &str) -> bool {
        if !config.try_bind_dynamic(location) {
            return false;
        }
        self.put(config.pid(), Some(location)).await;
        info!(pid = %config.pid(), location = %location, "Configuration dynamically bound");
        true
    }

    async fn persist(&self, bindings: &BTreeMap<String, String>) {
        let dict: Properties = bindings
            .iter()
            .map(|(pid, location)| (pid.clone(), location.clone()))
            .collect();
        if let Err(e) = self.persistence.save(&self.store_pid, &dict).await {
            error!(store_pid = %self.store_pid, error = %e, "Failed to persist dynamic bindings");
        }
    }
}
