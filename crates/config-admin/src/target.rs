//! Configuration targets.
//!
//! A [`Target`] is a registered consumer of configurations: either a plain
//! target receiving one configuration per service PID, or a factory target
//! receiving every instance of a factory PID. The host supplies the
//! [`TargetHandle`] that is actually called. The target wrapper keeps the
//! delivery ledger that makes delivery at-most-once per revision.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::configuration::ConfigurationSnapshot;
use crate::error::TargetError;
use crate::properties::Properties;
use crate::targeted::{service_pid, TargetIdentity, TargetedPid};

/// Target identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(pub Uuid);

impl TargetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability of a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    /// Receives one configuration per registered PID.
    Plain,
    /// Receives every configuration instance of its factory PIDs.
    Factory,
}

/// Callbacks implemented by the consumer behind a target.
#[async_trait]
pub trait TargetHandle: Send + Sync {
    /// Deliver a configuration. `properties` is `None` when no configuration
    /// exists for a plain target's PID.
    async fn update(
        &self,
        pid: &str,
        factory_pid: Option<&str>,
        properties: Option<&Properties>,
        revision: u64,
    ) -> Result<(), TargetError>;

    /// Revoke a previously delivered configuration.
    async fn remove(&self, pid: &str, factory_pid: Option<&str>) -> Result<(), TargetError>;
}

/// Ledger entry: what was last handed to the target for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Delivered {
    /// `None` records an explicit "no configuration" delivery.
    config_pid: Option<String>,
    instance: Option<Uuid>,
    revision: u64,
}

/// A registered configuration consumer.
pub struct Target {
    id: TargetId,
    kind: TargetKind,
    pids: Vec<String>,
    identity: RwLock<Option<TargetIdentity>>,
    handle: Arc<dyn TargetHandle>,
    ledger: Mutex<HashMap<String, Delivered>>,
}

impl Target {
    /// Plain target for the given service PIDs.
    pub fn plain(
        pids: impl IntoIterator<Item = impl Into<String>>,
        identity: TargetIdentity,
        handle: Arc<dyn TargetHandle>,
    ) -> Self {
        Self::with_kind(TargetKind::Plain, pids, identity, handle)
    }

    /// Factory target for the given factory PIDs.
    pub fn factory(
        factory_pids: impl IntoIterator<Item = impl Into<String>>,
        identity: TargetIdentity,
        handle: Arc<dyn TargetHandle>,
    ) -> Self {
        Self::with_kind(TargetKind::Factory, factory_pids, identity, handle)
    }

    fn with_kind(
        kind: TargetKind,
        pids: impl IntoIterator<Item = impl Into<String>>,
        identity: TargetIdentity,
        handle: Arc<dyn TargetHandle>,
    ) -> Self {
        Self {
            id: TargetId::new(),
            kind,
            pids: pids.into_iter().map(Into::into).collect(),
            identity: RwLock::new(Some(identity)),
            handle,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn pids(&self) -> &[String] {
        &self.pids
    }

    /// Identity, or `None` once the target has been withdrawn.
    pub fn identity(&self) -> Option<TargetIdentity> {
        self.identity.read().clone()
    }

    pub fn location(&self) -> Option<String> {
        self.identity.read().as_ref().and_then(|i| i.location.clone())
    }

    pub fn is_withdrawn(&self) -> bool {
        self.identity.read().is_none()
    }

    /// Revoke the target. Queued tasks skip it from now on.
    pub fn withdraw(&self) {
        *self.identity.write() = None;
    }

    fn ledger_key(&self, snapshot: &ConfigurationSnapshot) -> String {
        match self.kind {
            TargetKind::Plain => service_pid(&snapshot.pid).to_string(),
            TargetKind::Factory => snapshot.pid.clone(),
        }
    }

    fn shall_take(&self, key: &str, snapshot: &ConfigurationSnapshot) -> bool {
        let ledger = self.ledger.lock();
        let Some(held) = ledger.get(key) else {
            return true;
        };
        match &held.config_pid {
            None => true,
            // a recreated configuration restarts its revisions
            Some(pid) if *pid == snapshot.pid => {
                held.instance != Some(snapshot.instance) || snapshot.revision > held.revision
            }
            Some(pid) => {
                TargetedPid::parse(&snapshot.pid).binds_stronger(&TargetedPid::parse(pid))
            }
        }
    }

    /// Hand a configuration to the target. Returns `Ok(false)` when the
    /// ledger shows this revision (or a more specific configuration) was
    /// already delivered. `forced` bypasses the ledger check.
    pub(crate) async fn deliver(
        &self,
        snapshot: &ConfigurationSnapshot,
        forced: bool,
    ) -> Result<bool, TargetError> {
        let key = self.ledger_key(snapshot);
        if !forced && !self.shall_take(&key, snapshot) {
            return Ok(false);
        }

        self.handle
            .update(
                &snapshot.pid,
                snapshot.factory_pid.as_deref(),
                snapshot.properties.as_ref(),
                snapshot.revision,
            )
            .await?;

        self.ledger.lock().insert(
            key,
            Delivered {
                config_pid: Some(snapshot.pid.clone()),
                instance: Some(snapshot.instance),
                revision: snapshot.revision,
            },
        );
        Ok(true)
    }

    /// Tell a plain target there is no configuration for `pid`. Sent once
    /// until a configuration is delivered again.
    pub(crate) async fn deliver_none(&self, pid: &str) -> Result<bool, TargetError> {
        let already = matches!(
            self.ledger.lock().get(pid),
            Some(Delivered { config_pid: None, .. })
        );
        if already {
            return Ok(false);
        }

        self.handle.update(pid, None, None, 0).await?;

        self.ledger.lock().insert(
            pid.to_string(),
            Delivered {
                config_pid: None,
                instance: None,
                revision: 0,
            },
        );
        Ok(true)
    }

    /// Revoke `pid` if it is the configuration this target currently holds.
    pub(crate) async fn remove(
        &self,
        pid: &str,
        factory_pid: Option<&str>,
    ) -> Result<bool, TargetError> {
        let key = match self.kind {
            TargetKind::Plain => service_pid(pid).to_string(),
            TargetKind::Factory => pid.to_string(),
        };
        let holds = matches!(
            self.ledger.lock().get(&key),
            Some(Delivered { config_pid: Some(held), .. }) if held == pid
        );
        if !holds {
            return Ok(false);
        }

        self.handle.remove(pid, factory_pid).await?;
        self.ledger.lock().remove(&key);
        Ok(true)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("pids", &self.pids)
            .field("identity", &*self.identity.read())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use semver::Version;

    /// Recorded handle call.
    #[derive(Clone, Debug, PartialEq)]
    pub(crate) enum Call {
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

    #[derive(Default)]
    pub(crate) struct RecordingHandle {
        pub calls: Mutex<Vec<Call>>,
    }

    impl RecordingHandle {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
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
        ) -> Result<(), TargetError> {
            self.calls.lock().push(Call::Update {
                pid: pid.to_string(),
                factory_pid: factory_pid.map(str::to_string),
                properties: properties.cloned(),
                revision,
            });
            Ok(())
        }

        async fn remove(&self, pid: &str, factory_pid: Option<&str>) -> Result<(), TargetError> {
            self.calls.lock().push(Call::Remove {
                pid: pid.to_string(),
                factory_pid: factory_pid.map(str::to_string),
            });
            Ok(())
        }
    }

    fn identity() -> TargetIdentity {
        TargetIdentity::new("org.sample", Version::new(1, 0, 0), "loc:a")
    }

    fn snapshot(pid: &str, revision: u64) -> ConfigurationSnapshot {
        ConfigurationSnapshot {
            pid: pid.to_string(),
            factory_pid: None,
            properties: Some(Properties::new()),
            revision,
            location: None,
            instance: Uuid::nil(),
        }
    }

    #[tokio::test]
    async fn ledger_skips_stale_revisions() {
        let handle = Arc::new(RecordingHandle::default());
        let target = Target::plain(["svc"], identity(), handle.clone());

        assert!(target.deliver(&snapshot("svc", 2), false).await.unwrap());
        assert!(!target.deliver(&snapshot("svc", 2), false).await.unwrap());
        assert!(!target.deliver(&snapshot("svc", 1), false).await.unwrap());
        assert!(target.deliver(&snapshot("svc", 1), true).await.unwrap());
        assert_eq!(handle.calls().len(), 2);
    }

    #[tokio::test]
    async fn recreated_configuration_restarts_revisions() {
        let handle = Arc::new(RecordingHandle::default());
        let target = Target::plain(["svc"], identity(), handle.clone());

        assert!(target.deliver(&snapshot("svc", 3), false).await.unwrap());
        let recreated = ConfigurationSnapshot {
            instance: Uuid::new_v4(),
            ..snapshot("svc", 1)
        };
        assert!(target.deliver(&recreated, false).await.unwrap());
        assert!(!target.deliver(&recreated, false).await.unwrap());
        assert_eq!(handle.calls().len(), 2);
    }

    #[tokio::test]
    async fn less_specific_pid_does_not_displace_targeted() {
        let handle = Arc::new(RecordingHandle::default());
        let target = Target::plain(["svc"], identity(), handle.clone());

        assert!(target.deliver(&snapshot("svc|org.sample", 1), false).await.unwrap());
        assert!(!target.deliver(&snapshot("svc", 5), false).await.unwrap());
        assert!(target
            .deliver(&snapshot("svc|org.sample|1.0.0", 1), false)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn none_is_delivered_once() {
        let handle = Arc::new(RecordingHandle::default());
        let target = Target::plain(["svc"], identity(), handle.clone());

        assert!(target.deliver_none("svc").await.unwrap());
        assert!(!target.deliver_none("svc").await.unwrap());
        assert!(target.deliver(&snapshot("svc", 1), false).await.unwrap());
        assert!(target.deliver_none("svc").await.unwrap());
        assert_eq!(handle.calls().len(), 3);
    }

    #[tokio::test]
    async fn remove_only_what_is_held() {
        let handle = Arc::new(RecordingHandle::default());
        let target = Target::plain(["svc"], identity(), handle.clone());

        assert!(!target.remove("svc", None).await.unwrap());
        target.deliver(&snapshot("svc|org.sample", 1), false).await.unwrap();
        assert!(!target.remove("svc", None).await.unwrap());
        assert!(target.remove("svc|org.sample", None).await.unwrap());
        assert_eq!(
            handle.calls().last(),
            Some(&Call::Remove {
                pid: "svc|org.sample".into(),
                factory_pid: None
            })
        );
    }

    #[test]
    fn withdraw_clears_identity() {
        let target = Target::factory(["f"], identity(), Arc::new(RecordingHandle::default()));
        assert_eq!(target.kind(), TargetKind::Factory);
        assert_eq!(target.location().as_deref(), Some("loc:a"));
        target.withdraw();
        assert!(target.is_withdrawn());
        assert!(target.location().is_none());
    }
}
