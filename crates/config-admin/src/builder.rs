//! Builder for ConfigurationManager
//!
//! Collects the host-provided collaborators, then starts the delivery
//! workers and loads the persisted dynamic bindings.

use std::sync::Arc;

use tracing::info;

use crate::binding::BindingTracker;
use crate::config::ConfigAdminConfig;
use crate::engine::DeliveryEngine;
use crate::error::{ConfigAdminError, Result};
use crate::event::{EventDispatch, EventDispatcher};
use crate::manager::ConfigurationManager;
use crate::persistence::PersistenceManager;
use crate::queue::DeliveryQueue;
use crate::registry::TargetRegistry;
use crate::store::ConfigurationStore;
use crate::task::DeliveryTask;
use crate::visibility::{PermissionCheck, VisibilityGuard};

/// Builder for constructing a ConfigurationManager with all dependencies
#[derive(Default)]
pub struct ConfigurationManagerBuilder {
    persistence: Option<Arc<dyn PersistenceManager>>,
    registry: Option<Arc<dyn TargetRegistry>>,
    permission: Option<Arc<dyn PermissionCheck>>,
    config: Option<ConfigAdminConfig>,
}

impl ConfigurationManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the durable store
    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the target registry
    pub fn with_registry(mut self, registry: Arc<dyn TargetRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Install a permission check for multi-owner locations
    pub fn with_permission_check(mut self, permission: Arc<dyn PermissionCheck>) -> Self {
        self.permission = Some(permission);
        self
    }

    /// Set the runtime settings
    pub fn with_config(mut self, config: ConfigAdminConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Load runtime settings from a file layered under the environment
    pub fn with_config_file(self, path: &str) -> Result<Self> {
        let config = ConfigAdminConfig::load(Some(path))?;
        Ok(self.with_config(config))
    }

    /// Load bindings and start both delivery queues. Must run inside a
    /// tokio runtime.
    pub async fn start(self) -> Result<ConfigurationManager> {
        let config = self.config.unwrap_or_default();
        let persistence = self
            .persistence
            .ok_or_else(|| ConfigAdminError::Setup("persistence manager required".into()))?;
        let registry = self
            .registry
            .ok_or_else(|| ConfigAdminError::Setup("target registry required".into()))?;

        let bindings = Arc::new(
            BindingTracker::load(
                persistence.clone(),
                &config.bindings.store_pid,
                registry.as_ref(),
                config.bindings.prune_on_start,
            )
            .await?,
        );
        let store = Arc::new(ConfigurationStore::new(persistence.clone(), bindings.clone()));

        let engine = Arc::new(DeliveryEngine::new(
            store.clone(),
            bindings.clone(),
            VisibilityGuard::new(self.permission),
            registry,
        ));
        let updates: Arc<DeliveryQueue<DeliveryTask>> = Arc::new(DeliveryQueue::start(
            config.delivery.update_queue_name.clone(),
            engine,
        ));
        let events: Arc<DeliveryQueue<EventDispatch>> = Arc::new(DeliveryQueue::start(
            config.delivery.event_queue_name.clone(),
            Arc::new(EventDispatcher),
        ));

        info!(
            update_queue = %updates.name(),
            event_queue = %events.name(),
            "Configuration manager started"
        );

        Ok(ConfigurationManager::assemble(
            config,
            store,
            persistence,
            bindings,
            updates,
            events,
        ))
    }
}
