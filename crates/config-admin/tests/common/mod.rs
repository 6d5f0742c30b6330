#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use maple_config_admin::{
    ConfigAdminError, ConfigurationEvent, ConfigurationListener, ConfigurationManager, Filter,
    InMemoryPersistenceManager, InMemoryTargetRegistry, ListenerError, PermissionCheck,
    PersistenceManager, Properties, Result, SynchronousConfigurationListener, Target,
    TargetError, TargetHandle, TargetIdentity,
};
use parking_lot::Mutex;
use semver::Version;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Update {
        pid: String,
        factory_pid: Option<String>,
        properties: Option<Properties>,
        revision: u64,
    },
    Remove {
        pid: String,
        factory_pid: Option<String>,
    },
}

/// Target handle that records every callback.
#[derive(Default)]
pub struct RecordingHandle {
    calls: Mutex<Vec<Call>>,
    fail: bool,
}

impl RecordingHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records calls but rejects every update.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// `(pid, a, revision)` per update, `a` being the test property.
    pub fn updates(&self) -> Vec<(String, Option<i64>, u64)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Update {
                    pid,
                    properties,
                    revision,
                    ..
                } => Some((
                    pid.clone(),
                    properties
                        .as_ref()
                        .and_then(|p| p.get("a"))
                        .and_then(Value::as_i64),
                    *revision,
                )),
                Call::Remove { .. } => None,
            })
            .collect()
    }

    pub fn removals(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Remove { pid, .. } => Some(pid.clone()),
                Call::Update { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl TargetHandle for RecordingHandle {
    async fn update(
        &self,
        pid: &str,
        factory_pid: Option<&str>,
        properties: Option<&Properties>,
        revision: u64,
    ) -> std::result::Result<(), TargetError> {
        self.calls.lock().push(Call::Update {
            pid: pid.to_string(),
            factory_pid: factory_pid.map(str::to_string),
            properties: properties.cloned(),
            revision,
        });
        if self.fail {
            return Err(TargetError("consumer rejected configuration".into()));
        }
        Ok(())
    }

    async fn remove(
        &self,
        pid: &str,
        factory_pid: Option<&str>,
    ) -> std::result::Result<(), TargetError> {
        self.calls.lock().push(Call::Remove {
            pid: pid.to_string(),
            factory_pid: factory_pid.map(str::to_string),
        });
        Ok(())
    }
}

/// Listener recording events of both flavors.
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<ConfigurationEvent>>,
}

impl RecordingListener {
    pub fn kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.kind.to_string())
            .collect()
    }
}

#[async_trait]
impl ConfigurationListener for RecordingListener {
    async fn configuration_event(
        &self,
        event: &ConfigurationEvent,
    ) -> std::result::Result<(), ListenerError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

impl SynchronousConfigurationListener for RecordingListener {
    fn configuration_event(&self, event: &ConfigurationEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Grants multi-location access to a fixed set of target locations.
pub struct AllowList(pub Vec<String>);

impl PermissionCheck for AllowList {
    fn is_location_visible(&self, target_location: &str, _multi_location: &str) -> bool {
        self.0.iter().any(|l| l == target_location)
    }
}

/// Store that fails every operation on PIDs starting with `broken.`.
#[derive(Default)]
pub struct FlakyPersistence {
    inner: InMemoryPersistenceManager,
}

impl FlakyPersistence {
    fn check(pid: &str) -> Result<()> {
        if pid.starts_with("broken.") {
            return Err(ConfigAdminError::persistence(pid, "disk unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceManager for FlakyPersistence {
    async fn exists(&self, pid: &str) -> Result<bool> {
        Self::check(pid)?;
        self.inner.exists(pid).await
    }

    async fn load(&self, pid: &str) -> Result<Option<Properties>> {
        Self::check(pid)?;
        self.inner.load(pid).await
    }

    async fn save(&self, pid: &str, properties: &Properties) -> Result<()> {
        Self::check(pid)?;
        self.inner.save(pid, properties).await
    }

    async fn delete(&self, pid: &str) -> Result<()> {
        Self::check(pid)?;
        self.inner.delete(pid).await
    }

    async fn list_matching(&self, filter: Option<&Filter>) -> Result<Vec<Properties>> {
        self.inner.list_matching(filter).await
    }
}

pub struct Harness {
    pub manager: ConfigurationManager,
    pub persistence: Arc<dyn PersistenceManager>,
    pub registry: Arc<InMemoryTargetRegistry>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(Arc::new(InMemoryPersistenceManager::new()), None).await
    }

    pub async fn start_with(
        persistence: Arc<dyn PersistenceManager>,
        permission: Option<Arc<dyn PermissionCheck>>,
    ) -> Self {
        let registry = Arc::new(InMemoryTargetRegistry::new());
        Self::start_on(persistence, registry, permission).await
    }

    pub async fn start_on(
        persistence: Arc<dyn PersistenceManager>,
        registry: Arc<InMemoryTargetRegistry>,
        permission: Option<Arc<dyn PermissionCheck>>,
    ) -> Self {
        let mut builder = ConfigurationManager::builder()
            .with_persistence(persistence.clone())
            .with_registry(registry.clone());
        if let Some(permission) = permission {
            builder = builder.with_permission_check(permission);
        }
        let manager = builder.start().await.unwrap();
        Self {
            manager,
            persistence,
            registry,
        }
    }

    /// Register a plain target and ask for its initial configuration.
    pub fn plain(
        &self,
        pid: &str,
        identity: TargetIdentity,
        handle: Arc<RecordingHandle>,
    ) -> Arc<Target> {
        let target = Arc::new(Target::plain([pid], identity, handle));
        self.registry.register(target.clone());
        self.manager.target_registered(&target, None);
        target
    }

    pub fn factory(
        &self,
        factory_pid: &str,
        identity: TargetIdentity,
        handle: Arc<RecordingHandle>,
    ) -> Arc<Target> {
        let target = Arc::new(Target::factory([factory_pid], identity, handle));
        self.registry.register(target.clone());
        self.manager.target_registered(&target, None);
        target
    }
}

pub fn identity(location: &str) -> TargetIdentity {
    TargetIdentity::new("org.sample", Version::new(1, 0, 0), location)
}

pub fn props(a: i64) -> Properties {
    [("a", a)].into_iter().collect()
}
