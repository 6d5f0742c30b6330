//! Delivery tasks.
//!
//! Tasks are frozen at submission: the properties and revision a task
//! delivers never change, even if the configuration is updated while the
//! task waits in the queue.

use std::fmt;
use std::sync::Arc;

use crate::configuration::{Configuration, ConfigurationSnapshot};
use crate::target::{Target, TargetKind};
use crate::targeted::service_pid;

/// A configuration change captured for delivery.
#[derive(Debug, Clone)]
pub struct ConfigurationChange {
    pub config: Arc<Configuration>,
    pub snapshot: ConfigurationSnapshot,
}

impl ConfigurationChange {
    pub fn capture(config: &Arc<Configuration>) -> Self {
        Self {
            config: config.clone(),
            snapshot: config.snapshot(),
        }
    }

    pub fn pid(&self) -> &str {
        &self.snapshot.pid
    }

    pub fn factory_pid(&self) -> Option<&str> {
        self.snapshot.factory_pid.as_deref()
    }

    pub fn revision(&self) -> u64 {
        self.snapshot.revision
    }

    /// The (possibly targeted) PID targets register for: the factory PID
    /// for factory instances, the configuration PID otherwise.
    pub fn targeted_pid(&self) -> &str {
        self.factory_pid().unwrap_or(&self.snapshot.pid)
    }

    /// Untargeted form of [`Self::targeted_pid`].
    pub fn service_pid(&self) -> &str {
        service_pid(self.targeted_pid())
    }

    pub fn target_kind(&self) -> TargetKind {
        if self.snapshot.factory_pid.is_some() {
            TargetKind::Factory
        } else {
            TargetKind::Plain
        }
    }
}

/// Unit of work for the configuration update queue.
#[derive(Debug, Clone)]
pub enum DeliveryTask {
    /// Deliver a new revision to every matching, visible target.
    Update(ConfigurationChange),
    /// Revoke a deleted configuration. The snapshot keeps the owner as it
    /// was at deletion time.
    Delete(ConfigurationChange),
    /// Re-evaluate visibility after the owner location changed.
    LocationChanged {
        change: ConfigurationChange,
        old_location: Option<String>,
    },
    /// Provide the current configurations to a freshly registered target.
    /// The target kind decides plain or factory provisioning.
    InitialProvide {
        target: Arc<Target>,
        pids: Vec<String>,
    },
}

impl DeliveryTask {
    /// Configuration PID for update and delete tasks.
    pub(crate) fn change_pid(&self) -> Option<(&str, bool)> {
        match self {
            DeliveryTask::Update(change) => Some((change.pid(), false)),
            DeliveryTask::Delete(change) => Some((change.pid(), true)),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryTask::Update(c) => {
                write!(f, "Update: pid={}, revision={}", c.pid(), c.revision())
            }
            DeliveryTask::Delete(c) => write!(f, "Delete: pid={}", c.pid()),
            DeliveryTask::LocationChanged { change, old_location } => write!(
                f,
                "LocationChanged: pid={}, old={:?}, new={:?}",
                change.pid(),
                old_location,
                change.snapshot.location
            ),
            DeliveryTask::InitialProvide { target, pids } => write!(
                f,
                "InitialProvide({:?}): target={}, pids={:?}",
                target.kind(),
                target.id(),
                pids
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_routes_by_factory_pid() {
        let config = Arc::new(Configuration::new(
            "svc.Foo.1",
            Some("svc.Foo|org.sample".into()),
            None,
        ));
        let change = ConfigurationChange::capture(&config);
        assert_eq!(change.targeted_pid(), "svc.Foo|org.sample");
        assert_eq!(change.service_pid(), "svc.Foo");
        assert_eq!(change.target_kind(), TargetKind::Factory);

        let plain = ConfigurationChange::capture(&Arc::new(Configuration::new("svc.Bar", None, None)));
        assert_eq!(plain.service_pid(), "svc.Bar");
        assert_eq!(plain.target_kind(), TargetKind::Plain);
    }

    #[test]
    fn snapshot_is_frozen_at_capture() {
        let config = Arc::new(Configuration::new("svc", None, None));
        config.apply_update([("a", 1)].into_iter().collect()).unwrap();
        let task = DeliveryTask::Update(ConfigurationChange::capture(&config));
        config.apply_update([("a", 2)].into_iter().collect()).unwrap();

        let DeliveryTask::Update(change) = &task else {
            panic!("expected update");
        };
        assert_eq!(change.revision(), 1);
        assert_eq!(config.revision(), 2);
        assert_eq!(task.to_string(), "Update: pid=svc, revision=1");
    }
}
