//! Target registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::target::{Target, TargetId, TargetKind};

/// Lookup of registered targets and owner liveness.
#[async_trait]
pub trait TargetRegistry: Send + Sync {
    /// Targets of the given kind registered for a service (or factory) PID,
    /// in registration order.
    async fn targets_for(&self, service_pid: &str, kind: TargetKind) -> Vec<Arc<Target>>;

    /// Does an owner with this location still exist?
    async fn owner_exists(&self, location: &str) -> bool;
}

/// In-memory target registry
pub struct InMemoryTargetRegistry {
    targets: DashMap<TargetId, (u64, Arc<Target>)>,
    owners: DashSet<String>,
    sequence: AtomicU64,
}

impl InMemoryTargetRegistry {
    pub fn new() -> Self {
        Self {
            targets: DashMap::new(),
            owners: DashSet::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Register a target. Its location is recorded as a live owner.
    pub fn register(&self, target: Arc<Target>) {
        if let Some(location) = target.location() {
            self.owners.insert(location);
        }
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        debug!(target_id = %target.id(), kind = ?target.kind(), pids = ?target.pids(), "Target registered");
        self.targets.insert(target.id(), (seq, target));
    }

    /// Remove and withdraw a target.
    pub fn unregister(&self, id: TargetId) -> Option<Arc<Target>> {
        let (_, (_, target)) = self.targets.remove(&id)?;
        target.withdraw();
        debug!(target_id = %id, "Target unregistered");
        Some(target)
    }

    pub fn install_owner(&self, location: impl Into<String>) {
        self.owners.insert(location.into());
    }

    pub fn uninstall_owner(&self, location: &str) -> bool {
        self.owners.remove(location).is_some()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Default for InMemoryTargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetRegistry for InMemoryTargetRegistry {
    async fn targets_for(&self, service_pid: &str, kind: TargetKind) -> Vec<Arc<Target>> {
        let mut found: Vec<(u64, Arc<Target>)> = self
            .targets
            .iter()
            .filter(|entry| {
                let target = &entry.value().1;
                target.kind() == kind && target.pids().iter().any(|p| p == service_pid)
            })
            .map(|entry| (entry.value().0, entry.value().1.clone()))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, target)| target).collect()
    }

    async fn owner_exists(&self, location: &str) -> bool {
        self.owners.contains(location)
    }
}
