// File: portal-sync/src/action_log.rs
// Purpose: Time-limited undo for destructive actions

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{to_std, Clock};
use crate::config::UndoConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::models::{NewMutation, Priority};
use crate::queue::MutationQueue;
use crate::storage::{self, KeyValueStore};

const ENTRY_PREFIX: &str = "actions:entry:";

fn entry_key(id: &Uuid) -> String {
    format!("{}{}", ENTRY_PREFIX, id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Delete,
    Update,
    BulkDelete,
}

/// A recorded, possibly reversible action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    pub id: Uuid,
    pub actor_id: String,
    pub operation_kind: OperationKind,
    pub entity_type: String,
    pub entity_ids: Vec<String>,
    /// State before the action; for several entities an object keyed by id
    pub previous_snapshot: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub undo_timeout_ms: u64,
    pub description: String,
    #[serde(default)]
    pub consumed: bool,
    /// Recording order
    pub seq: u64,
}

impl ActionLogEntry {
    fn timeout(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(i64::try_from(self.undo_timeout_ms).unwrap_or(i64::MAX))
    }

    /// Undo window still open at `now`; the deadline itself is already closed
    pub fn is_undoable_at(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && now - self.created_at < self.timeout()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + self.timeout()
    }

    /// Snapshot for one of the entities
    pub fn snapshot_for(&self, entity_id: &str) -> Option<&Value> {
        let snapshot = self.previous_snapshot.as_ref()?;
        if self.operation_kind != OperationKind::BulkDelete && self.entity_ids.len() == 1 {
            Some(snapshot)
        } else {
            snapshot.get(entity_id)
        }
    }
}

/// Description of an action about to be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub actor_id: String,
    pub kind: OperationKind,
    pub entity_type: String,
    pub entity_ids: Vec<String>,
    pub previous_snapshot: Option<Value>,
    pub description: String,
    /// Falls back to the configured default
    pub undo_timeout: Option<Duration>,
}

impl NewAction {
    pub fn new(
        actor_id: impl Into<String>,
        kind: OperationKind,
        entity_type: impl Into<String>,
        entity_ids: Vec<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            kind,
            entity_type: entity_type.into(),
            entity_ids,
            previous_snapshot: None,
            description: description.into(),
            undo_timeout: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Value) -> Self {
        self.previous_snapshot = Some(snapshot);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.undo_timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.entity_ids.is_empty() {
            return Err(SyncError::Validation("action must name at least one entity".into()));
        }
        if self.entity_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(SyncError::Validation("entity id cannot be empty".into()));
        }

        // A multi-entity snapshot must cover every entity, or undo could only restore some
        let keyed = self.kind == OperationKind::BulkDelete || self.entity_ids.len() > 1;
        if let (true, Some(snapshot)) = (keyed, &self.previous_snapshot) {
            let missing: Vec<&String> = self
                .entity_ids
                .iter()
                .filter(|id| snapshot.get(id.as_str()).is_none())
                .collect();
            if !missing.is_empty() {
                return Err(SyncError::Validation(format!(
                    "snapshot is missing entities {:?}",
                    missing
                )));
            }
        }
        Ok(())
    }
}

/// Reverses a recorded action
///
/// Implementations must be all-or-none: on `Err` nothing may have been
/// applied, because the entry stays undoable.
#[async_trait]
pub trait UndoExecutor: Send + Sync {
    async fn restore(&self, entry: &ActionLogEntry) -> anyhow::Result<()>;
}

/// Undo by queueing compensating writes at high priority
pub struct QueueUndoExecutor {
    queue: Arc<MutationQueue>,
}

impl QueueUndoExecutor {
    pub fn new(queue: Arc<MutationQueue>) -> Self {
        Self { queue }
    }

    fn compensating(entry: &ActionLogEntry) -> anyhow::Result<Vec<NewMutation>> {
        entry
            .entity_ids
            .iter()
            .map(|entity_id| -> anyhow::Result<NewMutation> {
                let snapshot = entry.snapshot_for(entity_id).ok_or_else(|| {
                    anyhow::anyhow!("action {} has no snapshot for {}", entry.id, entity_id)
                })?;

                let mutation = match entry.operation_kind {
                    OperationKind::Delete | OperationKind::BulkDelete => {
                        NewMutation::insert(&entry.entity_type, entity_id, snapshot.clone())
                    }
                    OperationKind::Update => {
                        NewMutation::update(&entry.entity_type, entity_id, snapshot.clone(), None)
                    }
                };
                Ok(mutation.with_priority(Priority::High))
            })
            .collect()
    }
}

#[async_trait]
impl UndoExecutor for QueueUndoExecutor {
    async fn restore(&self, entry: &ActionLogEntry) -> anyhow::Result<()> {
        let mutations = Self::compensating(entry)?;
        // Validated as a batch: either every entity is queued or none is
        self.queue.enqueue_batch(mutations).await?;
        Ok(())
    }
}

struct LogState {
    entries: VecDeque<ActionLogEntry>,
    next_seq: u64,
}

impl LogState {
    fn position(&self, id: &Uuid) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == *id)
    }
}

/// Bounded, persistent history of reversible actions
pub struct ActionLog {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    default_timeout: Duration,
    capacity: usize,
    state: Mutex<LogState>,
}

impl ActionLog {
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: &UndoConfig,
    ) -> Result<Self> {
        let mut entries: Vec<ActionLogEntry> = storage::load_all(store.as_ref(), ENTRY_PREFIX).await?;
        entries.sort_by_key(|entry| entry.seq);
        let next_seq = entries.last().map_or(0, |entry| entry.seq + 1);

        tracing::info!("Action log opened with {} entries", entries.len());

        Ok(Self {
            store,
            clock,
            events,
            default_timeout: config.default_timeout(),
            capacity: config.history_capacity.max(1),
            state: Mutex::new(LogState {
                entries: entries.into(),
                next_seq,
            }),
        })
    }

    /// Record an action, evicting the oldest entries beyond capacity
    pub async fn record_action(&self, action: NewAction) -> Result<ActionLogEntry> {
        action.validate()?;

        let timeout = action.undo_timeout.unwrap_or(self.default_timeout);
        let mut state = self.state.lock().await;

        let entry = ActionLogEntry {
            id: Uuid::new_v4(),
            actor_id: action.actor_id,
            operation_kind: action.kind,
            entity_type: action.entity_type,
            entity_ids: action.entity_ids,
            previous_snapshot: action.previous_snapshot,
            created_at: self.clock.now(),
            undo_timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            description: action.description,
            consumed: false,
            seq: state.next_seq,
        };

        storage::put_json(self.store.as_ref(), &entry_key(&entry.id), &entry).await?;
        state.next_seq += 1;
        state.entries.push_back(entry.clone());

        let mut evicted = Vec::new();
        while state.entries.len() > self.capacity {
            let Some(oldest) = state.entries.front().map(|entry| entry.id) else {
                break;
            };
            self.store.remove(&entry_key(&oldest)).await?;
            state.entries.pop_front();
            evicted.push(oldest);
        }
        drop(state);

        for action_id in evicted {
            tracing::debug!("Evicted action {} from history", action_id);
            self.events.emit(SyncEvent::ActionEvicted { action_id });
        }

        tracing::info!("Recorded action '{}' ({:?})", entry.description, entry.operation_kind);
        self.events.emit(SyncEvent::ActionRecorded {
            action_id: entry.id,
            description: entry.description.clone(),
            entity_ids: entry.entity_ids.clone(),
            undo_timeout_ms: entry.undo_timeout_ms,
        });
        Ok(entry)
    }

    pub async fn can_undo(&self, id: &Uuid) -> bool {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .position(id)
            .map_or(false, |index| state.entries[index].is_undoable_at(now))
    }

    /// Time left in the undo window; zero once it has closed
    pub async fn time_remaining(&self, id: &Uuid) -> Option<Duration> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let entry = &state.entries[state.position(id)?];
        if entry.consumed {
            return Some(Duration::ZERO);
        }
        Some(to_std(entry.expires_at() - now))
    }

    /// Reverse an action through `executor`
    ///
    /// The log stays locked while the executor runs, so two concurrent undo
    /// calls for one entry cannot both succeed. The entry is stored as
    /// consumed before the executor runs and reopened if it fails; a restore
    /// is never left behind an entry that can be undone again.
    pub async fn undo(&self, id: &Uuid, executor: &dyn UndoExecutor) -> Result<ActionLogEntry> {
        let mut state = self.state.lock().await;
        let index = state.position(id).ok_or(SyncError::ActionNotFound(*id))?;
        let entry = state.entries[index].clone();

        if entry.consumed {
            return Err(SyncError::UndoAlreadyConsumed(*id));
        }
        if !entry.is_undoable_at(self.clock.now()) {
            return Err(SyncError::UndoExpired(*id));
        }

        let mut consumed = entry.clone();
        consumed.consumed = true;
        storage::put_json(self.store.as_ref(), &entry_key(id), &consumed).await?;

        if let Err(e) = executor.restore(&entry).await {
            match storage::put_json(self.store.as_ref(), &entry_key(id), &entry).await {
                Ok(()) => tracing::warn!("Undo of '{}' failed, still undoable: {}", entry.description, e),
                Err(reopen) => {
                    // Stays consumed on disk; mirror that rather than offer a second try
                    tracing::error!(
                        "Undo of '{}' failed and could not be reopened: {}",
                        entry.description,
                        reopen
                    );
                    state.entries[index] = consumed;
                }
            }
            return Err(SyncError::Storage(e.context(format!("undo of action {} failed", id))));
        }

        state.entries[index] = consumed.clone();
        drop(state);

        tracing::info!("Undid action '{}'", consumed.description);
        self.events.emit(SyncEvent::ActionUndone { action_id: *id });
        Ok(consumed)
    }

    /// Drop entries that were undone or whose window closed
    pub async fn prune_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let stale: Vec<Uuid> = state
            .entries
            .iter()
            .filter(|entry| !entry.is_undoable_at(now))
            .map(|entry| entry.id)
            .collect();
        for id in &stale {
            self.store.remove(&entry_key(id)).await?;
        }
        state.entries.retain(|entry| !stale.contains(&entry.id));

        if !stale.is_empty() {
            tracing::debug!("Pruned {} expired actions", stale.len());
        }
        Ok(stale.len())
    }

    pub async fn get(&self, id: &Uuid) -> Option<ActionLogEntry> {
        let state = self.state.lock().await;
        state.position(id).map(|index| state.entries[index].clone())
    }

    /// Every entry, oldest first
    pub async fn entries(&self) -> Vec<ActionLogEntry> {
        self.state.lock().await.entries.iter().cloned().collect()
    }

    /// Entries that can still be undone, newest first
    pub async fn undoable(&self) -> Vec<ActionLogEntry> {
        let now = self.clock.now();
        self.state
            .lock()
            .await
            .entries
            .iter()
            .rev()
            .filter(|entry| entry.is_undoable_at(now))
            .cloned()
            .collect()
    }
}
