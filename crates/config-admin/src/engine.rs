//! Execution of delivery tasks.
//!
//! Runs on the configuration update queue. Every task re-checks target
//! liveness and visibility at execution time, so a task queued before a
//! target was withdrawn or an owner changed does the right thing.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::binding::BindingTracker;
use crate::configuration::{Configuration, ConfigurationSnapshot};
use crate::filter::Filter;
use crate::properties::SERVICE_FACTORYPID;
use crate::queue::TaskRunner;
use crate::registry::TargetRegistry;
use crate::store::ConfigurationStore;
use crate::target::{Target, TargetKind};
use crate::targeted::{candidates, TargetedPid};
use crate::task::{ConfigurationChange, DeliveryTask};
use crate::visibility::VisibilityGuard;

/// Runs [`DeliveryTask`]s against registered targets.
pub struct DeliveryEngine {
    store: Arc<ConfigurationStore>,
    bindings: Arc<BindingTracker>,
    guard: VisibilityGuard,
    registry: Arc<dyn TargetRegistry>,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<ConfigurationStore>,
        bindings: Arc<BindingTracker>,
        guard: VisibilityGuard,
        registry: Arc<dyn TargetRegistry>,
    ) -> Self {
        Self {
            store,
            bindings,
            guard,
            registry,
        }
    }

    /// First candidate for `raw_pid` that exists, is live and is visible
    /// to the target. The target is dynamically bound to the result.
    pub async fn targeted_configuration(
        &self,
        raw_pid: &str,
        target: &Target,
    ) -> Option<Arc<Configuration>> {
        let Some(identity) = target.identity() else {
            info!(pid = %raw_pid, target_id = %target.id(), "Target withdrawn, not resolving configuration");
            return None;
        };
        let location = identity.location.clone().unwrap_or_default();

        for candidate in candidates(raw_pid, &identity) {
            let Some(config) = self.store.get_configuration(&candidate).await else {
                continue;
            };
            if config.is_deleted() || config.is_new() {
                continue;
            }
            if self
                .guard
                .can_receive(config.bundle_location().as_deref(), &location)
            {
                self.bindings.try_bind(&config, &location).await;
                return Some(config);
            }
            debug!(
                pid = %candidate,
                target_id = %target.id(),
                owner = ?config.bundle_location(),
                "Configuration not visible to target, treating as absent"
            );
        }
        None
    }

    async fn deliver(&self, target: &Target, snapshot: &ConfigurationSnapshot, forced: bool) {
        match target.deliver(snapshot, forced).await {
            Ok(true) => debug!(
                pid = %snapshot.pid,
                revision = snapshot.revision,
                target_id = %target.id(),
                "Configuration delivered"
            ),
            Ok(false) => debug!(
                pid = %snapshot.pid,
                revision = snapshot.revision,
                target_id = %target.id(),
                "Target already has this configuration"
            ),
            Err(e) => error!(
                pid = %snapshot.pid,
                revision = snapshot.revision,
                target_id = %target.id(),
                error = %e,
                "Target failed to accept configuration"
            ),
        }
    }

    async fn revoke(&self, target: &Target, change: &ConfigurationChange) {
        match target.remove(change.pid(), change.factory_pid()).await {
            Ok(true) => debug!(pid = %change.pid(), target_id = %target.id(), "Configuration revoked"),
            Ok(false) => debug!(pid = %change.pid(), target_id = %target.id(), "Target did not hold configuration"),
            Err(e) => error!(
                pid = %change.pid(),
                target_id = %target.id(),
                error = %e,
                "Target failed to remove configuration"
            ),
        }
    }

    /// Offer the next best configuration to a plain target that is losing
    /// the one in `change`. Returns `false` if there is none, including
    /// when the store cannot be read.
    async fn provide_replacement(&self, target: &Target, change: &ConfigurationChange) -> bool {
        if change.target_kind() != TargetKind::Plain {
            return false;
        }
        let Some(replacement) = self
            .targeted_configuration(change.service_pid(), target)
            .await
        else {
            return false;
        };
        if replacement.pid() == change.pid() {
            return false;
        }
        debug!(
            pid = %change.pid(),
            replacement = %replacement.pid(),
            target_id = %target.id(),
            "Providing replacement configuration"
        );
        self.deliver(target, &replacement.snapshot(), true).await;
        true
    }

    async fn targets(&self, change: &ConfigurationChange) -> Vec<Arc<Target>> {
        self.registry
            .targets_for(change.service_pid(), change.target_kind())
            .await
    }

    async fn run_update(&self, change: ConfigurationChange) {
        debug!(pid = %change.pid(), revision = change.revision(), "Updating configuration");
        let targets = self.targets(&change).await;
        if targets.is_empty() {
            debug!(pid = %change.pid(), "No targets registered for configuration");
            return;
        }
        let targeted = TargetedPid::parse(change.targeted_pid());

        // only a target the PID is aimed at may become its owner
        let first_match = targets.iter().find_map(|t| {
            t.identity()
                .filter(|identity| targeted.matches_target(identity))
                .and_then(|identity| identity.location)
        });
        if let Some(location) = first_match {
            self.bindings.try_bind(&change.config, &location).await;
        }
        let owner = change.config.bundle_location();

        for target in &targets {
            let Some(identity) = target.identity() else {
                debug!(pid = %change.pid(), target_id = %target.id(), "Target withdrawn, skipping");
                continue;
            };
            if !targeted.matches_target(&identity) {
                debug!(pid = %change.pid(), target_id = %target.id(), "Targeted PID does not match target");
                continue;
            }
            let location = identity.location.unwrap_or_default();
            if self.guard.can_receive(owner.as_deref(), &location) {
                self.deliver(target, &change.snapshot, false).await;
            } else {
                error!(
                    pid = %change.pid(),
                    target_id = %target.id(),
                    owner = ?owner,
                    "Cannot use configuration: not visible to target"
                );
            }
        }
    }

    async fn run_delete(&self, change: ConfigurationChange) {
        let owner = change.snapshot.location.clone();
        let targeted = TargetedPid::parse(change.targeted_pid());

        for target in self.targets(&change).await {
            let Some(identity) = target.identity() else {
                debug!(pid = %change.pid(), target_id = %target.id(), "Target withdrawn, skipping");
                continue;
            };
            if !targeted.matches_target(&identity) {
                continue;
            }
            let location = identity.location.unwrap_or_default();
            if !self.guard.can_receive(owner.as_deref(), &location) {
                error!(
                    pid = %change.pid(),
                    target_id = %target.id(),
                    owner = ?owner,
                    "Cannot remove configuration: not visible to target"
                );
                continue;
            }
            if !self.provide_replacement(&target, &change).await {
                self.revoke(&target, &change).await;
            }
        }
    }

    async fn run_location_changed(&self, change: ConfigurationChange, old_location: Option<String>) {
        let targeted = TargetedPid::parse(change.targeted_pid());

        for target in self.targets(&change).await {
            let Some(identity) = target.identity() else {
                debug!(pid = %change.pid(), target_id = %target.id(), "Target withdrawn, skipping");
                continue;
            };
            if !targeted.matches_target(&identity) {
                continue;
            }
            let location = identity.location.unwrap_or_default();
            let was_visible = self.guard.can_receive(old_location.as_deref(), &location);
            let is_visible = self
                .guard
                .can_receive(change.config.bundle_location().as_deref(), &location);

            if is_visible {
                self.bindings.try_bind(&change.config, &location).await;
            }

            if was_visible && !is_visible {
                if !self.provide_replacement(&target, &change).await {
                    self.revoke(&target, &change).await;
                    debug!(pid = %change.pid(), target_id = %target.id(), "Configuration revoked, no more visibility");
                }
            } else if !was_visible && is_visible {
                self.deliver(&target, &change.snapshot, false).await;
                debug!(pid = %change.pid(), target_id = %target.id(), "Configuration provided, new visibility");
            } else {
                debug!(pid = %change.pid(), target_id = %target.id(), "Unmodified visibility");
            }
        }
    }

    async fn provide_plain(&self, target: &Target, pids: &[String]) {
        if target.is_withdrawn() {
            info!(target_id = %target.id(), "Target withdrawn before configuration could be provided");
            return;
        }
        for pid in pids {
            match self.targeted_configuration(pid, target).await {
                Some(config) => {
                    let snapshot = config.snapshot();
                    debug!(pid = %pid, config = %snapshot.pid, revision = snapshot.revision, "Providing configuration");
                    self.deliver(target, &snapshot, false).await;
                }
                None => match target.deliver_none(pid).await {
                    Ok(_) => debug!(pid = %pid, target_id = %target.id(), "No configuration available"),
                    Err(e) => error!(
                        pid = %pid,
                        target_id = %target.id(),
                        error = %e,
                        "Target failed to accept missing configuration"
                    ),
                },
            }
        }
    }

    async fn provide_factory(&self, target: &Target, factory_pids: &[String]) {
        let Some(identity) = target.identity() else {
            info!(target_id = %target.id(), "Factory target withdrawn before configurations could be provided");
            return;
        };
        let location = identity.location.clone().unwrap_or_default();

        for factory_pid in factory_pids {
            let filter = Filter::Or(
                candidates(factory_pid, &identity)
                    .into_iter()
                    .map(|c| Filter::equal(SERVICE_FACTORYPID, c))
                    .collect(),
            );
            let instances = match self.store.list(Some(&filter)).await {
                Ok(instances) => instances,
                Err(e) => {
                    error!(factory_pid = %factory_pid, error = %e, "Cannot list factory configurations");
                    continue;
                }
            };

            for config in instances {
                if target.is_withdrawn() {
                    info!(factory_pid = %factory_pid, target_id = %target.id(), "Factory target withdrawn, not providing");
                    return;
                }
                let owner = config.bundle_location();
                if !self.guard.can_receive(owner.as_deref(), &location) {
                    error!(
                        pid = %config.pid(),
                        target_id = %target.id(),
                        owner = ?owner,
                        "Cannot use configuration: not visible to target"
                    );
                    continue;
                }
                self.bindings.try_bind(&config, &location).await;
                self.deliver(target, &config.snapshot(), false).await;
            }
        }
    }
}

#[async_trait]
impl TaskRunner<DeliveryTask> for DeliveryEngine {
    async fn run(&self, task: DeliveryTask) {
        match task {
            DeliveryTask::Update(change) => self.run_update(change).await,
            DeliveryTask::Delete(change) => self.run_delete(change).await,
            DeliveryTask::LocationChanged {
                change,
                old_location,
            } => self.run_location_changed(change, old_location).await,
            DeliveryTask::InitialProvide { target, pids } => match target.kind() {
                TargetKind::Plain => self.provide_plain(&target, &pids).await,
                TargetKind::Factory => self.provide_factory(&target, &pids).await,
            },
        }
    }
}
