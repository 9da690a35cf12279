use crate::domain::ports::StateStore;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Volatile store for tests and dry runs. Keys are ordered so prefix listing
/// behaves like the durable store.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
