//! The configuration manager.
//!
//! Entry point for administrative changes. Every change is persisted
//! synchronously, announced to listeners, and turned into a delivery task
//! that the update queue executes in order. Passing a [`Coordination`]
//! defers the task (and the asynchronous events) until it ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::binding::BindingTracker;
use crate::builder::ConfigurationManagerBuilder;
use crate::config::ConfigAdminConfig;
use crate::configuration::Configuration;
use crate::coordination::{Coordination, CoordinationBatcher};
use crate::error::{ConfigAdminError, Result};
use crate::event::{
    ConfigurationEvent, ConfigurationEventKind, ConfigurationListener, EventDispatch, ListenerId,
    ListenerRegistry, SynchronousConfigurationListener,
};
use crate::filter::Filter;
use crate::persistence::PersistenceManager;
use crate::properties::Properties;
use crate::queue::DeliveryQueue;
use crate::store::ConfigurationStore;
use crate::target::Target;
use crate::task::{ConfigurationChange, DeliveryTask};

/// Separator between factory PID and instance name for named factory
/// configurations.
pub const NAMED_FACTORY_SEPARATOR: char = '~';

/// Orchestrates storage, binding and delivery of configurations.
pub struct ConfigurationManager {
    id: Uuid,
    config: ConfigAdminConfig,
    store: Arc<ConfigurationStore>,
    persistence: Arc<dyn PersistenceManager>,
    bindings: Arc<BindingTracker>,
    listeners: ListenerRegistry,
    updates: Arc<DeliveryQueue<DeliveryTask>>,
    events: Arc<DeliveryQueue<EventDispatch>>,
    active: AtomicBool,
}

impl ConfigurationManager {
    pub fn builder() -> ConfigurationManagerBuilder {
        ConfigurationManagerBuilder::new()
    }

    pub(crate) fn assemble(
        config: ConfigAdminConfig,
        store: Arc<ConfigurationStore>,
        persistence: Arc<dyn PersistenceManager>,
        bindings: Arc<BindingTracker>,
        updates: Arc<DeliveryQueue<DeliveryTask>>,
        events: Arc<DeliveryQueue<EventDispatch>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            store,
            persistence,
            bindings,
            listeners: ListenerRegistry::new(),
            updates,
            events,
            active: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &ConfigAdminConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ConfigAdminError::Inactive)
        }
    }

    fn validate_pid(&self, pid: &str) -> Result<()> {
        if pid.trim().is_empty() || pid == self.config.bindings.store_pid {
            return Err(ConfigAdminError::InvalidPid(pid.to_string()));
        }
        Ok(())
    }

    // ---- lookup and creation ----

    /// Cached or stored configuration, `None` if it does not exist.
    pub async fn get_configuration(&self, pid: &str) -> Result<Option<Arc<Configuration>>> {
        self.ensure_active()?;
        Ok(self.store.get_configuration(pid).await)
    }

    /// Existing configuration for `pid`, or a new one explicitly bound to
    /// `location`. New configurations are not stored until updated.
    pub async fn create_configuration(
        &self,
        pid: &str,
        location: Option<&str>,
    ) -> Result<Arc<Configuration>> {
        self.ensure_active()?;
        self.validate_pid(pid)?;
        if let Some(existing) = self.store.get_configuration(pid).await {
            return Ok(existing);
        }
        let config = Configuration::new(pid, None, location.map(str::to_string));
        debug!(pid = %pid, "Created new configuration");
        Ok(self.store.cache(Arc::new(config)))
    }

    /// New factory instance with a generated PID `<factoryPid>.<uuid>`.
    pub async fn create_factory_configuration(
        &self,
        factory_pid: &str,
        location: Option<&str>,
    ) -> Result<Arc<Configuration>> {
        self.ensure_active()?;
        self.validate_pid(factory_pid)?;
        let pid = format!("{}.{}", factory_pid, Uuid::new_v4());
        let config = Configuration::new(
            pid.clone(),
            Some(factory_pid.to_string()),
            location.map(str::to_string),
        );
        debug!(pid = %pid, factory_pid = %factory_pid, "Created new factory configuration");
        Ok(self.store.cache(Arc::new(config)))
    }

    /// Factory instance addressed by name, PID `<factoryPid>~<name>`.
    pub async fn get_factory_configuration(
        &self,
        factory_pid: &str,
        name: &str,
        location: Option<&str>,
    ) -> Result<Arc<Configuration>> {
        self.ensure_active()?;
        self.validate_pid(factory_pid)?;
        if name.is_empty() {
            return Err(ConfigAdminError::InvalidPid(format!(
                "{}{}",
                factory_pid, NAMED_FACTORY_SEPARATOR
            )));
        }
        let pid = format!("{}{}{}", factory_pid, NAMED_FACTORY_SEPARATOR, name);
        if let Some(existing) = self.store.get_configuration(&pid).await {
            return Ok(existing);
        }
        let config = Configuration::new(
            pid,
            Some(factory_pid.to_string()),
            location.map(str::to_string),
        );
        Ok(self.store.cache(Arc::new(config)))
    }

    /// Stored configurations matching an LDAP-style filter, or all of them.
    pub async fn list_configurations(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<Arc<Configuration>>> {
        self.ensure_active()?;
        let filter = filter.map(Filter::parse).transpose()?;
        self.store.list(filter.as_ref()).await
    }

    // ---- mutation ----

    /// Persist the new properties, then apply them with the next revision
    /// and schedule delivery. A failed write leaves the configuration
    /// untouched. Returns the new revision.
    pub async fn update(
        &self,
        config: &Arc<Configuration>,
        properties: Properties,
        fire_event: bool,
        coordination: Option<&Coordination>,
    ) -> Result<u64> {
        self.ensure_active()?;
        let prepared = config.prepare_update(properties)?;
        if let Err(e) = self.persistence.save(config.pid(), prepared.persisted()).await {
            error!(pid = %config.pid(), error = %e, "Failed to persist configuration");
            return Err(e);
        }
        let snapshot = config.commit_update(prepared)?;
        self.store.cache(config.clone());
        info!(pid = %config.pid(), revision = snapshot.revision, "Configuration updated");

        if fire_event {
            self.fire(ConfigurationEventKind::Updated, config, coordination);
        }
        let revision = snapshot.revision;
        self.schedule(
            DeliveryTask::Update(ConfigurationChange {
                config: config.clone(),
                snapshot,
            }),
            coordination,
        );
        Ok(revision)
    }

    /// Delete the configuration and revoke it from its targets.
    pub async fn delete(
        &self,
        config: &Arc<Configuration>,
        coordination: Option<&Coordination>,
    ) -> Result<()> {
        self.ensure_active()?;
        if config.is_deleted() {
            return Err(ConfigAdminError::Deleted(config.pid().to_string()));
        }
        let change = ConfigurationChange::capture(config);
        let was_new = config.is_new();

        self.persistence.delete(config.pid()).await?;
        if !config.mark_deleted() {
            return Err(ConfigAdminError::Deleted(config.pid().to_string()));
        }
        self.store.remove(config.pid());
        if config.dynamic_location().is_some() {
            self.bindings.put(config.pid(), None).await;
        }
        info!(pid = %config.pid(), "Configuration deleted");

        self.fire(ConfigurationEventKind::Deleted, config, coordination);
        if !was_new {
            self.schedule(DeliveryTask::Delete(change), coordination);
        }
        Ok(())
    }

    /// Explicitly bind the configuration to `location` (or unbind it),
    /// replacing any dynamic binding.
    pub async fn set_bundle_location(
        &self,
        config: &Arc<Configuration>,
        location: Option<&str>,
        coordination: Option<&Coordination>,
    ) -> Result<()> {
        self.ensure_active()?;
        let (old_location, had_dynamic) =
            config.set_static_location(location.map(str::to_string))?;
        if had_dynamic {
            self.bindings.put(config.pid(), None).await;
        }
        if !config.is_new() {
            self.persistence
                .save(config.pid(), &config.to_persisted())
                .await?;
        }
        info!(pid = %config.pid(), old = ?old_location, new = ?location, "Configuration location set");
        self.location_changed(config, old_location, coordination);
        Ok(())
    }

    /// Announce an owner change and, if targets may be affected, schedule
    /// a visibility re-evaluation.
    pub fn location_changed(
        &self,
        config: &Arc<Configuration>,
        old_location: Option<String>,
        coordination: Option<&Coordination>,
    ) {
        self.fire(ConfigurationEventKind::LocationChanged, config, coordination);
        if old_location.is_some() && !config.is_new() {
            self.schedule(
                DeliveryTask::LocationChanged {
                    change: ConfigurationChange::capture(config),
                    old_location,
                },
                coordination,
            );
        }
    }

    // ---- targets and owners ----

    /// Provide current configurations for `pids` to a target.
    pub fn provide_to_target(
        &self,
        target: &Arc<Target>,
        pids: &[String],
        coordination: Option<&Coordination>,
    ) {
        if pids.is_empty() {
            return;
        }
        self.schedule(
            DeliveryTask::InitialProvide {
                target: target.clone(),
                pids: pids.to_vec(),
            },
            coordination,
        );
    }

    /// A target was registered: provide every PID it asked for.
    pub fn target_registered(&self, target: &Arc<Target>, coordination: Option<&Coordination>) {
        self.provide_to_target(target, target.pids(), coordination);
    }

    /// An owner went away: drop dynamic bindings pointing at it.
    pub async fn owner_removed(&self, location: &str) {
        if !self.is_active() {
            debug!(location = %location, "Ignoring owner removal during shutdown");
            return;
        }
        for config in self.store.cached_all() {
            if config.clear_dynamic(location) {
                debug!(pid = %config.pid(), location = %location, "Dynamic binding released");
                self.location_changed(&config, Some(location.to_string()), None);
            }
        }
        let released = self.bindings.remove_owner(location).await;
        if !released.is_empty() {
            info!(location = %location, count = released.len(), "Released dynamic bindings of removed owner");
        }
    }

    // ---- listeners ----

    pub fn add_listener(&self, listener: Arc<dyn ConfigurationListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn add_sync_listener(
        &self,
        listener: Arc<dyn SynchronousConfigurationListener>,
    ) -> ListenerId {
        self.listeners.add_sync(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    fn fire(
        &self,
        kind: ConfigurationEventKind,
        config: &Configuration,
        coordination: Option<&Coordination>,
    ) {
        let event = ConfigurationEvent::new(
            kind,
            config.pid(),
            config.factory_pid().map(str::to_string),
        );
        self.listeners.notify_sync(&event);
        let Some(dispatch) = self.listeners.dispatch(event) else {
            return;
        };
        match coordination.and_then(|c| self.batcher(c)) {
            Some(batcher) => batcher.add_event(dispatch),
            None => {
                self.events.schedule(dispatch);
            }
        }
    }

    // ---- scheduling ----

    fn batcher(&self, coordination: &Coordination) -> Option<Arc<CoordinationBatcher>> {
        let updates = self.updates.clone();
        let events = self.events.clone();
        match coordination.participant(self.id, move || CoordinationBatcher::new(updates, events)) {
            Ok(batcher) => Some(batcher),
            Err(e) => {
                debug!(error = %e, "Coordination not usable, scheduling directly");
                None
            }
        }
    }

    fn schedule(&self, task: DeliveryTask, coordination: Option<&Coordination>) {
        match coordination.and_then(|c| self.batcher(c)) {
            Some(batcher) => {
                debug!(task = %task, "Adding task to coordination");
                batcher.add_task(task);
            }
            None => {
                self.updates.schedule(task);
            }
        }
    }

    /// Wait until both queues have run everything submitted so far.
    pub async fn sync(&self) {
        futures::join!(self.updates.sync(), self.events.sync());
    }

    /// Stop handling owner events, shut the queues down and clear the
    /// cache. Further operations fail with [`ConfigAdminError::Inactive`].
    pub async fn shutdown(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let grace = Duration::from_millis(self.config.delivery.shutdown_timeout_ms);
        futures::join!(self.updates.shutdown(grace), self.events.shutdown(grace));
        self.store.clear();
        info!("Configuration manager stopped");
    }
}

impl std::fmt::Debug for ConfigurationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationManager")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::RecordingListener;
    use crate::persistence::InMemoryPersistenceManager;
    use crate::properties::{SERVICE_BUNDLELOCATION, SERVICE_FACTORYPID};
    use crate::registry::InMemoryTargetRegistry;
    use serde_json::json;

    async fn manager() -> (ConfigurationManager, Arc<InMemoryPersistenceManager>) {
        let persistence = Arc::new(InMemoryPersistenceManager::new());
        let manager = ConfigurationManager::builder()
            .with_persistence(persistence.clone())
            .with_registry(Arc::new(InMemoryTargetRegistry::new()))
            .start()
            .await
            .unwrap();
        (manager, persistence)
    }

    fn props(a: i64) -> Properties {
        [("a", a)].into_iter().collect()
    }

    #[tokio::test]
    async fn new_configuration_is_not_persisted() {
        let (manager, persistence) = manager().await;
        let config = manager.create_configuration("svc", None).await.unwrap();
        assert!(config.is_new());
        assert!(persistence.load("svc").await.unwrap().is_none());

        let again = manager.get_configuration("svc").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&config, &again));
        assert!(manager.list_configurations(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_persists_with_revision() {
        let (manager, persistence) = manager().await;
        let config = manager
            .create_configuration("svc", Some("loc:a"))
            .await
            .unwrap();
        assert_eq!(manager.update(&config, props(1), true, None).await.unwrap(), 1);
        assert_eq!(manager.update(&config, props(2), true, None).await.unwrap(), 2);

        let stored = persistence.load("svc").await.unwrap().unwrap();
        assert_eq!(stored.get("a"), Some(&json!(2)));
        assert_eq!(stored.get_str(SERVICE_BUNDLELOCATION), Some("loc:a"));
    }

    #[tokio::test]
    async fn delete_removes_everywhere() {
        let (manager, persistence) = manager().await;
        let config = manager.create_configuration("svc", None).await.unwrap();
        manager.update(&config, props(1), true, None).await.unwrap();
        manager.delete(&config, None).await.unwrap();

        assert!(config.is_deleted());
        assert!(manager.get_configuration("svc").await.unwrap().is_none());
        assert!(persistence.load("svc").await.unwrap().is_none());
        assert!(matches!(
            manager.delete(&config, None).await,
            Err(ConfigAdminError::Deleted(_))
        ));
        assert!(matches!(
            manager.update(&config, props(2), true, None).await,
            Err(ConfigAdminError::Deleted(_))
        ));

        let recreated = manager.create_configuration("svc", None).await.unwrap();
        assert!(!Arc::ptr_eq(&config, &recreated));
        assert_eq!(recreated.revision(), 0);
    }

    #[tokio::test]
    async fn factory_pids() {
        let (manager, _) = manager().await;
        let generated = manager
            .create_factory_configuration("svc.Factory", None)
            .await
            .unwrap();
        assert!(generated.pid().starts_with("svc.Factory."));
        assert_eq!(generated.factory_pid(), Some("svc.Factory"));

        let named = manager
            .get_factory_configuration("svc.Factory", "primary", None)
            .await
            .unwrap();
        assert_eq!(named.pid(), "svc.Factory~primary");
        let same = manager
            .get_factory_configuration("svc.Factory", "primary", None)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&named, &same));
    }

    #[tokio::test]
    async fn list_configurations_with_filter() {
        let (manager, _) = manager().await;
        for name in ["one", "two"] {
            let config = manager
                .get_factory_configuration("svc.Factory", name, None)
                .await
                .unwrap();
            manager.update(&config, props(1), false, None).await.unwrap();
        }
        let plain = manager.create_configuration("svc.Plain", None).await.unwrap();
        manager.update(&plain, props(5), false, None).await.unwrap();

        let filter = format!("({}=svc.Factory)", SERVICE_FACTORYPID);
        let listed = manager.list_configurations(Some(&filter)).await.unwrap();
        assert_eq!(listed.len(), 2);

        let listed = manager.list_configurations(Some("(a>=3)")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(Arc::ptr_eq(&listed[0], &plain));

        assert!(matches!(
            manager.list_configurations(Some("(broken")).await,
            Err(ConfigAdminError::InvalidFilter { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_pids_are_rejected() {
        let (manager, _) = manager().await;
        assert!(matches!(
            manager.create_configuration("  ", None).await,
            Err(ConfigAdminError::InvalidPid(_))
        ));
        let reserved = manager.config().bindings.store_pid.clone();
        assert!(matches!(
            manager.create_configuration(&reserved, None).await,
            Err(ConfigAdminError::InvalidPid(_))
        ));
    }

    #[tokio::test]
    async fn set_bundle_location_bumps_revision_and_fires() {
        let (manager, persistence) = manager().await;
        let listener = Arc::new(RecordingListener::default());
        manager.add_sync_listener(listener.clone());

        let config = manager.create_configuration("svc", None).await.unwrap();
        manager.update(&config, props(1), true, None).await.unwrap();
        manager
            .set_bundle_location(&config, Some("loc:b"), None)
            .await
            .unwrap();

        assert_eq!(config.revision(), 2);
        let stored = persistence.load("svc").await.unwrap().unwrap();
        assert_eq!(stored.get_str(SERVICE_BUNDLELOCATION), Some("loc:b"));
        let kinds: Vec<_> = listener.events.lock().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ConfigurationEventKind::Updated,
                ConfigurationEventKind::LocationChanged
            ]
        );
    }

    #[tokio::test]
    async fn operations_fail_after_shutdown() {
        let (manager, _) = manager().await;
        let config = manager.create_configuration("svc", None).await.unwrap();
        manager.shutdown().await;
        manager.shutdown().await;

        assert!(!manager.is_active());
        assert!(matches!(
            manager.get_configuration("svc").await,
            Err(ConfigAdminError::Inactive)
        ));
        assert!(matches!(
            manager.update(&config, props(1), true, None).await,
            Err(ConfigAdminError::Inactive)
        ));
        manager.owner_removed("loc:a").await;
    }
}
