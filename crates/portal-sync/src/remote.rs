// File: portal-sync/src/remote.rs
// Purpose: Contract required of the backing store, plus an in-memory implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::RemoteError;
use crate::models::Operation;

/// Current server-side state of one entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub entity_type: String,
    pub entity_id: String,
    /// Incremented by the store on every successful write
    pub version: i64,
    pub data: Value,
    pub modified_at: DateTime<Utc>,
}

/// Precondition of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expectation {
    /// The entity must not exist yet
    Absent,
    /// The entity must currently be at exactly this version
    Version(i64),
}

/// One write sent to the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalWrite {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub expected: Expectation,
}

/// Backing store reachable over a request/response channel
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Current state of an entity, `None` if it does not exist
    async fn fetch(&self, entity_type: &str, entity_id: &str) -> Result<Option<RemoteRecord>, RemoteError>;

    /// Apply a write only if its expectation holds; returns the new state
    /// (`None` after a delete) or `VersionMismatch` with the current state
    async fn write(&self, write: ConditionalWrite) -> Result<Option<RemoteRecord>, RemoteError>;
}

#[derive(Default)]
struct RemoteState {
    records: HashMap<(String, String), RemoteRecord>,
    scripted_failures: VecDeque<RemoteError>,
    applied: Vec<ConditionalWrite>,
}

/// Backing store held in memory
///
/// Useful as a local stand-in during development and in tests, where
/// `fail_next` scripts transient failures and `edit_elsewhere` simulates a
/// concurrent edit from another client.
#[derive(Clone, Default)]
pub struct InMemoryRemote {
    state: Arc<RwLock<RemoteState>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite an entity directly, bumping its version
    pub async fn seed(&self, entity_type: &str, entity_id: &str, data: Value) -> RemoteRecord {
        let mut state = self.state.write().await;
        let key = (entity_type.to_string(), entity_id.to_string());
        let version = state.records.get(&key).map_or(1, |r| r.version + 1);
        let record = RemoteRecord {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            version,
            data,
            modified_at: Utc::now(),
        };
        state.records.insert(key, record.clone());
        record
    }

    /// Merge `fields` into an existing entity as another client would
    pub async fn edit_elsewhere(&self, entity_type: &str, entity_id: &str, fields: Value) -> Option<RemoteRecord> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get_mut(&(entity_type.to_string(), entity_id.to_string()))?;
        merge_fields(&mut record.data, &fields);
        record.version += 1;
        record.modified_at = Utc::now();
        Some(record.clone())
    }

    /// Make the next call (fetch or write) fail with `error`
    pub async fn fail_next(&self, error: RemoteError) {
        self.state.write().await.scripted_failures.push_back(error);
    }

    pub async fn get(&self, entity_type: &str, entity_id: &str) -> Option<RemoteRecord> {
        self.state
            .read()
            .await
            .records
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned()
    }

    /// Writes that succeeded, in the order they were applied
    pub async fn applied_writes(&self) -> Vec<ConditionalWrite> {
        self.state.read().await.applied.clone()
    }
}

fn merge_fields(target: &mut Value, fields: &Value) {
    if let (Value::Object(target), Value::Object(fields)) = (target, fields) {
        for (field, value) in fields {
            target.insert(field.clone(), value.clone());
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn fetch(&self, entity_type: &str, entity_id: &str) -> Result<Option<RemoteRecord>, RemoteError> {
        let mut state = self.state.write().await;
        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }
        Ok(state
            .records
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned())
    }

    async fn write(&self, write: ConditionalWrite) -> Result<Option<RemoteRecord>, RemoteError> {
        let mut state = self.state.write().await;
        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }

        let key = (write.entity_type.clone(), write.entity_id.clone());
        let current = state.records.get(&key).cloned();

        let holds = match (write.expected, &current) {
            (Expectation::Absent, None) => true,
            (Expectation::Version(v), Some(record)) => record.version == v,
            _ => false,
        };
        if !holds {
            return Err(RemoteError::VersionMismatch { current });
        }

        let result = match write.operation {
            Operation::Delete => {
                state.records.remove(&key);
                None
            }
            Operation::Insert | Operation::Update => {
                let mut data = current
                    .as_ref()
                    .map(|r| r.data.clone())
                    .unwrap_or_else(|| Value::Object(Default::default()));
                merge_fields(&mut data, &write.payload);
                let record = RemoteRecord {
                    entity_type: write.entity_type.clone(),
                    entity_id: write.entity_id.clone(),
                    version: current.map_or(1, |r| r.version + 1),
                    data,
                    modified_at: Utc::now(),
                };
                state.records.insert(key, record.clone());
                Some(record)
            }
        };

        state.applied.push(write);
        Ok(result)
    }
}
