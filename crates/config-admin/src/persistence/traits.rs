//! Durable store trait definition.

use async_trait::async_trait;

use crate::error::Result;
use crate::filter::Filter;
use crate::properties::Properties;

/// Trait for durable configuration dictionary stores.
///
/// Dictionaries are keyed by PID and carry the synthetic `service.pid`
/// attribute, so filters can select on it.
#[async_trait]
pub trait PersistenceManager: Send + Sync {
    /// Check if a dictionary is stored under the PID.
    async fn exists(&self, pid: &str) -> Result<bool>;

    /// Load a dictionary by PID.
    async fn load(&self, pid: &str) -> Result<Option<Properties>>;

    /// Store a dictionary, replacing any previous one.
    async fn save(&self, pid: &str, properties: &Properties) -> Result<()>;

    /// Delete a dictionary. Deleting a missing PID is not an error.
    async fn delete(&self, pid: &str) -> Result<()>;

    /// List dictionaries matching the filter, or all of them.
    async fn list_matching(&self, filter: Option<&Filter>) -> Result<Vec<Properties>>;
}
