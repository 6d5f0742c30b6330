//! Owner visibility rules.

use std::sync::Arc;

use tracing::debug;

/// Prefix marking a multi-owner location such as `?region`.
pub const MULTI_LOCATION_PREFIX: char = '?';

/// Host-provided permission predicate for multi-owner locations.
pub trait PermissionCheck: Send + Sync {
    /// May the target at `target_location` receive configurations bound to
    /// `multi_location`?
    fn is_location_visible(&self, target_location: &str, multi_location: &str) -> bool;
}

/// Decides whether a configuration owner is visible to a target.
#[derive(Clone, Default)]
pub struct VisibilityGuard {
    permission: Option<Arc<dyn PermissionCheck>>,
}

impl VisibilityGuard {
    pub fn new(permission: Option<Arc<dyn PermissionCheck>>) -> Self {
        Self { permission }
    }

    /// Unbound configurations are visible to everyone. Multi-owner
    /// locations defer to the permission check, if one is installed.
    /// Anything else must match the target location exactly.
    pub fn can_receive(&self, owner: Option<&str>, target_location: &str) -> bool {
        let Some(owner) = owner else {
            return true;
        };

        if owner.starts_with(MULTI_LOCATION_PREFIX) {
            return match &self.permission {
                Some(check) => {
                    let visible = check.is_location_visible(target_location, owner);
                    if !visible {
                        debug!(
                            owner = %owner,
                            target = %target_location,
                            "Permission check denied multi-location"
                        );
                    }
                    visible
                }
                None => true,
            };
        }

        owner == target_location
    }
}

impl std::fmt::Debug for VisibilityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibilityGuard")
            .field("permission", &self.permission.is_some())
            .finish()
    }
}
