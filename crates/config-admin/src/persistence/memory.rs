//! In-memory durable store.

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::PersistenceManager;
use crate::error::Result;
use crate::filter::Filter;
use crate::properties::Properties;

/// In-memory dictionary store, suitable for embedding and testing.
pub struct InMemoryPersistenceManager {
    dictionaries: DashMap<String, Properties>,
}

impl InMemoryPersistenceManager {
    pub fn new() -> Self {
        Self {
            dictionaries: DashMap::new(),
        }
    }

    /// Number of stored dictionaries.
    pub fn len(&self) -> usize {
        self.dictionaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dictionaries.is_empty()
    }
}

impl Default for InMemoryPersistenceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceManager for InMemoryPersistenceManager {
    async fn exists(&self, pid: &str) -> Result<bool> {
        Ok(self.dictionaries.contains_key(pid))
    }

    async fn load(&self, pid: &str) -> Result<Option<Properties>> {
        Ok(self.dictionaries.get(pid).map(|d| d.clone()))
    }

    async fn save(&self, pid: &str, properties: &Properties) -> Result<()> {
        self.dictionaries.insert(pid.to_string(), properties.clone());
        Ok(())
    }

    async fn delete(&self, pid: &str) -> Result<()> {
        self.dictionaries.remove(pid);
        Ok(())
    }

    async fn list_matching(&self, filter: Option<&Filter>) -> Result<Vec<Properties>> {
        let mut result: Vec<(String, Properties)> = self
            .dictionaries
            .iter()
            .filter(|entry| filter.map_or(true, |f| f.matches(entry.value())))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result.into_iter().map(|(_, d)| d).collect())
    }
}
