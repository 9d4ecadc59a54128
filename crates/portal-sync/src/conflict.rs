// File: portal-sync/src/conflict.rs
// Purpose: Conflict detection and human-mediated resolution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::EntityCache;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::models::{ConflictSnapshot, MutationQueueItem, Operation};
use crate::queue::MutationQueue;
use crate::remote::{ConditionalWrite, Expectation, RemoteRecord};

/// Field name used when the dispute is about the entity as a whole
/// (updating something deleted elsewhere, deleting something edited elsewhere)
pub const WHOLE_ENTITY: &str = "*";

/// One disputed field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// `entity_type:entity_id:field`
    pub id: String,
    pub field: String,
    pub local_value: Value,
    pub server_value: Value,
    pub local_timestamp: DateTime<Utc>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// Every disputed field of one entity; resolved as a unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSet {
    pub item_id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub server_version: Option<i64>,
    pub detected_at: DateTime<Utc>,
    pub records: Vec<ConflictRecord>,
}

impl ConflictSet {
    /// Rebuild the set from a conflicted queue item
    pub fn from_item(item: &MutationQueueItem) -> Option<Self> {
        let snapshot = item.conflict_with.as_ref()?;
        let payload = item.payload_fields();

        let records = snapshot
            .fields
            .iter()
            .map(|field| {
                let (local_value, server_value) = if field == WHOLE_ENTITY {
                    let local = match item.operation {
                        Operation::Delete => Value::Null,
                        _ => item.payload.clone(),
                    };
                    (local, snapshot.data.clone())
                } else {
                    (
                        payload.get(field).cloned().unwrap_or(Value::Null),
                        snapshot.data.get(field).cloned().unwrap_or(Value::Null),
                    )
                };

                ConflictRecord {
                    id: format!("{}:{}", item.entity_key(), field),
                    field: field.clone(),
                    local_value,
                    server_value,
                    local_timestamp: item.enqueued_at,
                    server_timestamp: snapshot.modified_at,
                }
            })
            .collect();

        Some(Self {
            item_id: item.id,
            entity_type: item.entity_type.clone(),
            entity_id: item.entity_id.clone(),
            operation: item.operation,
            server_version: snapshot.version,
            detected_at: snapshot.detected_at,
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when every field `other` writes was shown in this set
    fn covers(&self, other: &MutationQueueItem) -> bool {
        if self.records.iter().any(|record| record.field == WHOLE_ENTITY) {
            return true;
        }
        let fields = other.payload_fields();
        !fields.is_empty()
            && fields
                .keys()
                .all(|field| self.records.iter().any(|record| &record.field == field))
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Decision for one conflict record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "choice", content = "value", rename_all = "lowercase")]
pub enum FieldChoice {
    /// Keep the queued value and push it past the version check once
    Local,
    /// Drop the queued value and take the server's
    Server,
    /// Write this value instead of either side
    Override(Value),
}

/// One choice for every record in a set
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BulkChoice {
    AllLocal,
    AllServer,
}

/// Conflict record id -> decision
pub type ResolutionMap = HashMap<String, FieldChoice>;

/// What happened to the queued item after resolution
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// The item is pending again with the chosen values
    Resubmitted(MutationQueueItem),
    /// Nothing of the local write survived; the item was dropped
    Discarded,
}

/// How the engine should treat an item given the remote state
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Assessment {
    Apply(ConditionalWrite),
    /// The remote already reflects the write
    AlreadyApplied,
    Conflict(Vec<String>),
}

/// Compare a queued item with the current remote record
///
/// Unchanged means `current.version == base_version`. When the version moved,
/// only payload fields whose remote value now differs are disputed; fields
/// forced by a `local` resolution are skipped. With no disputed field the
/// write is rebased onto the current version.
pub(crate) fn assess(item: &MutationQueueItem, current: Option<&RemoteRecord>) -> Assessment {
    let forced_whole = item.force_fields.contains(WHOLE_ENTITY);

    match (item.operation, current) {
        (Operation::Insert, None) => Assessment::Apply(conditional(item, Operation::Insert, Expectation::Absent)),
        (Operation::Insert, Some(record)) => {
            let fields = disputed_fields(item, record);
            if fields.is_empty() {
                Assessment::AlreadyApplied
            } else {
                Assessment::Conflict(fields)
            }
        }
        (Operation::Update, None) if forced_whole => {
            Assessment::Apply(conditional(item, Operation::Insert, Expectation::Absent))
        }
        (Operation::Update, None) => Assessment::Conflict(vec![WHOLE_ENTITY.to_string()]),
        (Operation::Update, Some(record)) => match item.base_version {
            Some(base) if base != record.version => {
                let fields = disputed_fields(item, record);
                if fields.is_empty() {
                    Assessment::Apply(conditional(item, Operation::Update, Expectation::Version(record.version)))
                } else {
                    Assessment::Conflict(fields)
                }
            }
            _ => Assessment::Apply(conditional(item, Operation::Update, Expectation::Version(record.version))),
        },
        (Operation::Delete, None) => Assessment::AlreadyApplied,
        (Operation::Delete, Some(record)) => match item.base_version {
            Some(base) if base != record.version && !forced_whole => {
                Assessment::Conflict(vec![WHOLE_ENTITY.to_string()])
            }
            _ => Assessment::Apply(conditional(item, Operation::Delete, Expectation::Version(record.version))),
        },
    }
}

fn conditional(item: &MutationQueueItem, operation: Operation, expected: Expectation) -> ConditionalWrite {
    ConditionalWrite {
        entity_type: item.entity_type.clone(),
        entity_id: item.entity_id.clone(),
        operation,
        payload: item.payload.clone(),
        expected,
    }
}

fn disputed_fields(item: &MutationQueueItem, record: &RemoteRecord) -> Vec<String> {
    item.payload_fields()
        .iter()
        .filter(|(field, _)| !item.force_fields.contains(field.as_str()))
        .filter(|(field, local)| record.data.get(field.as_str()).unwrap_or(&Value::Null) != *local)
        .map(|(field, _)| field.clone())
        .collect()
}

/// Capture the remote side of a conflict for the queue record
pub(crate) fn snapshot(current: Option<&RemoteRecord>, fields: Vec<String>, now: DateTime<Utc>) -> ConflictSnapshot {
    ConflictSnapshot {
        version: current.map(|r| r.version),
        data: current.map(|r| r.data.clone()).unwrap_or(Value::Null),
        modified_at: current.map(|r| r.modified_at),
        fields,
        detected_at: now,
    }
}

/// Presents open conflicts and applies the user's decisions
///
/// Conflicts live on the queued items themselves, so the set for an entity
/// survives a restart along with the queue.
#[derive(Clone)]
pub struct ConflictResolver {
    queue: Arc<MutationQueue>,
    cache: Option<EntityCache>,
    events: EventBus,
}

impl ConflictResolver {
    pub fn new(queue: Arc<MutationQueue>, cache: Option<EntityCache>, events: EventBus) -> Self {
        Self { queue, cache, events }
    }

    /// Every open conflict set, in drain order
    pub async fn conflicts(&self) -> Vec<ConflictSet> {
        self.queue
            .conflicted_items()
            .await
            .iter()
            .filter_map(ConflictSet::from_item)
            .collect()
    }

    pub async fn conflict_set(&self, item_id: &Uuid) -> Result<ConflictSet> {
        let item = self
            .queue
            .get(item_id)
            .await
            .ok_or(SyncError::ItemNotFound(*item_id))?;
        ConflictSet::from_item(&item).ok_or(SyncError::NoConflict(*item_id))
    }

    pub async fn conflict_for_entity(&self, entity_type: &str, entity_id: &str) -> Option<ConflictSet> {
        self.conflicts()
            .await
            .into_iter()
            .find(|set| set.entity_type == entity_type && set.entity_id == entity_id)
    }

    /// Apply one choice to every record of the set
    pub async fn resolve_all(&self, item_id: &Uuid, choice: BulkChoice) -> Result<ResolutionOutcome> {
        let set = self.conflict_set(item_id).await?;
        let field_choice = match choice {
            BulkChoice::AllLocal => FieldChoice::Local,
            BulkChoice::AllServer => FieldChoice::Server,
        };
        let resolution = set
            .records
            .iter()
            .map(|record| (record.id.clone(), field_choice.clone()))
            .collect();

        self.resolve(item_id, &resolution).await
    }

    /// Resolve a conflict set; the map must name every record and nothing else
    pub async fn resolve(&self, item_id: &Uuid, resolution: &ResolutionMap) -> Result<ResolutionOutcome> {
        let item = self
            .queue
            .get(item_id)
            .await
            .ok_or(SyncError::ItemNotFound(*item_id))?;
        let set = ConflictSet::from_item(&item).ok_or(SyncError::NoConflict(*item_id))?;

        let covered = set
            .records
            .iter()
            .filter(|record| resolution.contains_key(&record.id))
            .count();
        if covered != set.len() || resolution.len() != set.len() {
            return Err(SyncError::PartialResolution {
                expected: set.len(),
                provided: covered,
            });
        }

        let mut resolved = item.clone();
        let mut payload = item.payload_fields();
        let mut discard = false;
        let mut adopted: Vec<(&ConflictRecord, bool)> = Vec::new();

        for record in &set.records {
            let choice = &resolution[&record.id];

            if record.field == WHOLE_ENTITY {
                match choice {
                    FieldChoice::Server => {
                        discard = true;
                        adopted.push((record, true));
                    }
                    FieldChoice::Local => {
                        resolved.force_fields.insert(WHOLE_ENTITY.to_string());
                    }
                    FieldChoice::Override(value) => {
                        if item.operation != Operation::Delete {
                            let Value::Object(fields) = value else {
                                return Err(SyncError::Validation(
                                    "whole-entity override must be an object".into(),
                                ));
                            };
                            payload = fields.clone();
                        }
                        resolved.force_fields.insert(WHOLE_ENTITY.to_string());
                    }
                }
                continue;
            }

            match choice {
                FieldChoice::Server => {
                    payload.remove(&record.field);
                    adopted.push((record, false));
                }
                FieldChoice::Local => {
                    resolved.force_fields.insert(record.field.clone());
                }
                FieldChoice::Override(value) => {
                    payload.insert(record.field.clone(), value.clone());
                    resolved.force_fields.insert(record.field.clone());
                }
            }
        }

        if let Some(cache) = &self.cache {
            for (record, whole) in &adopted {
                if *whole {
                    cache.put(&set.entity_type, &set.entity_id, &record.server_value).await?;
                } else {
                    cache
                        .adopt_field(&set.entity_type, &set.entity_id, &record.field, &record.server_value)
                        .await?;
                }
            }
        }

        // The entity exists remotely now, so a surviving insert becomes an update
        if resolved.operation == Operation::Insert {
            resolved.operation = Operation::Update;
        }
        if resolved.operation != Operation::Delete && payload.is_empty() {
            discard = true;
        }

        let outcome = if discard {
            self.queue.discard(item_id).await?;
            ResolutionOutcome::Discarded
        } else {
            resolved.payload = Value::Object(payload);
            resolved.base_version = set.server_version;
            let resubmitted = self.queue.resubmit(resolved).await?;

            // A follower moves onto the reviewed version only if the user saw the
            // server value of every field it writes
            if let (Some(old), Some(new)) = (item.base_version, set.server_version) {
                if old != new {
                    self.queue
                        .rebase_entity(&set.entity_type, &set.entity_id, old, new, |follower| {
                            set.covers(follower)
                        })
                        .await?;
                }
            }
            ResolutionOutcome::Resubmitted(resubmitted)
        };

        tracing::info!(
            "Resolved conflict on {}:{} ({} fields, {})",
            set.entity_type,
            set.entity_id,
            set.len(),
            if discard { "discarded" } else { "resubmitted" }
        );
        self.events.emit(SyncEvent::ConflictResolved {
            item_id: *item_id,
            entity_type: set.entity_type.clone(),
            entity_id: set.entity_id.clone(),
            resubmitted: !discard,
        });

        Ok(outcome)
    }
}
