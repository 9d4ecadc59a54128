// File: portal-sync/src/models.rs
// Purpose: Queue item records and the write intents that create them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Write performed on an entity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Insert => write!(f, "insert"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Drain priority; `High` sorts first
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// Lifecycle of a queued item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting to be applied (possibly after a backoff)
    #[default]
    Pending,
    /// Retry ceiling reached or rejected by the server; needs manual retry or discard
    Failed,
    /// Waiting for a human decision
    Conflicted,
}

/// Remote state captured when a conflict was detected
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSnapshot {
    /// Remote version at detection time; `None` when the entity was gone
    pub version: Option<i64>,
    /// Remote field values (`Null` when the entity was gone)
    pub data: Value,
    pub modified_at: Option<DateTime<Utc>>,
    /// Disputed field names, in payload order
    pub fields: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

/// One pending write
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MutationQueueItem {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    /// Remote version the writer saw when making the edit
    pub base_version: Option<i64>,
    pub enqueued_at: DateTime<Utc>,
    /// Original enqueue order; never changes
    pub seq: u64,
    /// Order inside the priority bucket; moves to the tail on retry
    pub position: u64,
    pub retry_count: u32,
    pub priority: Priority,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_with: Option<ConflictSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Fields whose version check is skipped on the next attempt
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub force_fields: BTreeSet<String>,
}

impl MutationQueueItem {
    /// `entity_type:entity_id`
    pub fn entity_key(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }

    pub fn same_entity(&self, other: &MutationQueueItem) -> bool {
        self.entity_type == other.entity_type && self.entity_id == other.entity_id
    }

    /// Ready to be handed out by the queue at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ItemStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Payload as a field map (empty for non-object payloads)
    pub fn payload_fields(&self) -> serde_json::Map<String, Value> {
        match &self.payload {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }
}

/// A write intent handed to `MutationQueue::enqueue`
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub base_version: Option<i64>,
    pub priority: Priority,
}

impl NewMutation {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            payload,
            base_version: None,
            priority: Priority::default(),
        }
    }

    pub fn insert(entity_type: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
        Self::new(entity_type, entity_id, Operation::Insert, payload)
    }

    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        base_version: Option<i64>,
    ) -> Self {
        Self::new(entity_type, entity_id, Operation::Update, payload).with_base_version(base_version)
    }

    pub fn delete(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        base_version: Option<i64>,
    ) -> Self {
        Self::new(entity_type, entity_id, Operation::Delete, Value::Null)
            .with_base_version(base_version)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_base_version(mut self, base_version: Option<i64>) -> Self {
        self.base_version = base_version;
        self
    }

    /// Reject intents that must never reach the queue
    pub fn validate(&self) -> Result<()> {
        if self.entity_type.trim().is_empty() {
            return Err(SyncError::Validation("entity type cannot be empty".into()));
        }
        if self.entity_id.trim().is_empty() {
            return Err(SyncError::Validation("entity id cannot be empty".into()));
        }

        match self.operation {
            Operation::Insert | Operation::Update => match &self.payload {
                Value::Object(map) if !map.is_empty() => Ok(()),
                Value::Object(_) => Err(SyncError::Validation(format!(
                    "{} of {}:{} has no fields",
                    self.operation, self.entity_type, self.entity_id
                ))),
                _ => Err(SyncError::Validation(format!(
                    "{} payload must be an object",
                    self.operation
                ))),
            },
            Operation::Delete => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_orders_high_first() {
        let mut priorities = vec![Priority::Low, Priority::High, Priority::Normal];
        priorities.sort();
        assert_eq!(priorities, vec![Priority::High, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_value(Priority::High).unwrap(), json!("HIGH"));
        assert_eq!(serde_json::to_value(Operation::Delete).unwrap(), json!("delete"));
    }

    #[test]
    fn test_validation_rules() {
        assert!(NewMutation::update("student", "1", json!({"grade": "B"}), Some(1))
            .validate()
            .is_ok());
        assert!(NewMutation::delete("student", "1", Some(1)).validate().is_ok());

        let empty_id = NewMutation::insert("student", " ", json!({"name": "Ada"}));
        assert!(matches!(empty_id.validate(), Err(SyncError::Validation(_))));

        let no_fields = NewMutation::update("student", "1", json!({}), None);
        assert!(matches!(no_fields.validate(), Err(SyncError::Validation(_))));

        let not_object = NewMutation::insert("student", "1", json!(["Ada"]));
        assert!(matches!(not_object.validate(), Err(SyncError::Validation(_))));
    }
}
