// File: portal-sync/src/cache.rs
// Purpose: Local copy of entity state that screens read while offline

use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::{self, KeyValueStore};

const CACHE_PREFIX: &str = "cache:";

/// Last known field values per entity
#[derive(Clone)]
pub struct EntityCache {
    store: Arc<dyn KeyValueStore>,
}

impl EntityCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(entity_type: &str, entity_id: &str) -> String {
        format!("{}{}:{}", CACHE_PREFIX, entity_type, entity_id)
    }

    pub async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>> {
        let key = Self::key(entity_type, entity_id);
        Ok(storage::get_json(self.store.as_ref(), &key).await?)
    }

    /// Replace the whole cached record; `Null` removes it
    pub async fn put(&self, entity_type: &str, entity_id: &str, data: &Value) -> Result<()> {
        let key = Self::key(entity_type, entity_id);
        if data.is_null() {
            self.store.remove(&key).await?;
        } else {
            storage::put_json(self.store.as_ref(), &key, data).await?;
        }
        Ok(())
    }

    /// Take the server's value for a single field
    pub async fn adopt_field(&self, entity_type: &str, entity_id: &str, field: &str, value: &Value) -> Result<()> {
        let mut record = match self.get(entity_type, entity_id).await? {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        record.insert(field.to_string(), value.clone());

        tracing::debug!("Cache adopted server value for {}:{}.{}", entity_type, entity_id, field);
        self.put(entity_type, entity_id, &Value::Object(record)).await
    }

    pub async fn remove(&self, entity_type: &str, entity_id: &str) -> Result<()> {
        self.store.remove(&Self::key(entity_type, entity_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_adopt_field_merges_into_record() {
        let cache = EntityCache::new(Arc::new(MemoryStore::new()));
        cache
            .put("student", "1", &json!({"name": "Ada", "grade": "B"}))
            .await
            .unwrap();

        cache.adopt_field("student", "1", "grade", &json!("A")).await.unwrap();

        assert_eq!(
            cache.get("student", "1").await.unwrap(),
            Some(json!({"name": "Ada", "grade": "A"}))
        );
    }

    #[tokio::test]
    async fn test_put_null_removes() {
        let cache = EntityCache::new(Arc::new(MemoryStore::new()));
        cache.put("student", "1", &json!({"name": "Ada"})).await.unwrap();
        cache.put("student", "1", &Value::Null).await.unwrap();

        assert!(cache.get("student", "1").await.unwrap().is_none());
    }
}
