// File: portal-sync/src/queue.rs
// Purpose: Durable, priority-ordered queue of pending writes

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{from_std, Clock};
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::models::{ConflictSnapshot, ItemStatus, MutationQueueItem, NewMutation, Priority};
use crate::retry::RetryPolicy;
use crate::storage::{self, KeyValueStore};

const ITEM_PREFIX: &str = "queue:item:";

fn item_key(id: &Uuid) -> String {
    format!("{}{}", ITEM_PREFIX, id)
}

#[derive(Default)]
struct QueueState {
    items: HashMap<Uuid, MutationQueueItem>,
    /// Drain order: priority bucket, then position inside the bucket
    order: BTreeMap<(Priority, u64), Uuid>,
    in_flight: HashSet<Uuid>,
    next_seq: u64,
    next_position: u64,
}

impl QueueState {
    fn from_items(items: Vec<MutationQueueItem>) -> Self {
        let mut state = QueueState::default();
        for item in items {
            state.next_seq = state.next_seq.max(item.seq + 1);
            state.next_position = state.next_position.max(item.position + 1);
            state.insert(item);
        }
        state
    }

    fn insert(&mut self, item: MutationQueueItem) {
        self.order.insert((item.priority, item.position), item.id);
        self.items.insert(item.id, item);
    }

    fn remove(&mut self, id: &Uuid) -> Option<MutationQueueItem> {
        let item = self.items.remove(id)?;
        self.order.remove(&(item.priority, item.position));
        self.in_flight.remove(id);
        Some(item)
    }

    /// Swap in a full replacement record
    fn replace(&mut self, item: MutationQueueItem) {
        if let Some(old) = self.items.get(&item.id) {
            self.order.remove(&(old.priority, old.position));
        }
        self.insert(item);
    }

    fn get(&self, id: &Uuid) -> Result<&MutationQueueItem> {
        self.items.get(id).ok_or(SyncError::ItemNotFound(*id))
    }

    /// Lowest `seq` still queued for each entity
    fn entity_heads(&self) -> HashMap<(&str, &str), u64> {
        let mut heads: HashMap<(&str, &str), u64> = HashMap::new();
        for item in self.items.values() {
            let key = (item.entity_type.as_str(), item.entity_id.as_str());
            heads
                .entry(key)
                .and_modify(|seq| *seq = (*seq).min(item.seq))
                .or_insert(item.seq);
        }
        heads
    }

    /// Items the drain may pick: pending, not in flight, first of their entity
    fn candidates(&self) -> impl Iterator<Item = &MutationQueueItem> {
        let heads = self.entity_heads();
        self.order.values().filter_map(move |id| {
            let item = self.items.get(id)?;
            let head = heads.get(&(item.entity_type.as_str(), item.entity_id.as_str()));
            let eligible = item.status == ItemStatus::Pending
                && !self.in_flight.contains(id)
                && head == Some(&item.seq);
            eligible.then_some(item)
        })
    }

    fn ordered(&self) -> Vec<MutationQueueItem> {
        self.order
            .values()
            .filter_map(|id| self.items.get(id).cloned())
            .collect()
    }

    fn count(&self, status: ItemStatus) -> usize {
        self.items.values().filter(|i| i.status == status).count()
    }
}

/// Persistent write queue
///
/// Items drain HIGH before NORMAL before LOW and FIFO inside a bucket. An
/// item is only handed out while it is the oldest queued item of its entity,
/// so writes to one entity are applied in the order they were made, even
/// when an earlier one is backing off, failed or waiting on a conflict.
pub struct MutationQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    retry: RetryPolicy,
    state: Mutex<QueueState>,
}

impl MutationQueue {
    /// Open the queue, reloading whatever the store holds
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let items: Vec<MutationQueueItem> = storage::load_all(store.as_ref(), ITEM_PREFIX).await?;
        let state = QueueState::from_items(items);

        tracing::info!(
            "Mutation queue opened on {} backend with {} items",
            store.name(),
            state.items.len()
        );

        Ok(Self {
            store,
            clock,
            events,
            retry,
            state: Mutex::new(state),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Validate and append a write
    pub async fn enqueue(&self, mutation: NewMutation) -> Result<MutationQueueItem> {
        mutation.validate()?;

        let mut state = self.state.lock().await;
        let item = self.append(&mut state, mutation).await?;
        drop(state);

        self.announce(&item);
        Ok(item)
    }

    /// Append several writes; nothing is queued if any is invalid or fails to persist
    pub async fn enqueue_batch(&self, mutations: Vec<NewMutation>) -> Result<Vec<MutationQueueItem>> {
        for mutation in &mutations {
            mutation.validate()?;
        }

        let mut state = self.state.lock().await;
        let mut items = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            match self.append(&mut state, mutation).await {
                Ok(item) => items.push(item),
                Err(e) => {
                    self.roll_back(&mut state, &items).await;
                    return Err(e);
                }
            }
        }
        drop(state);

        for item in &items {
            self.announce(item);
        }
        Ok(items)
    }

    /// Undo a partially written batch
    async fn roll_back(&self, state: &mut QueueState, items: &[MutationQueueItem]) {
        for item in items {
            if let Err(e) = self.store.remove(&item_key(&item.id)).await {
                tracing::error!("Could not roll back queued write {}: {}", item.id, e);
            }
            state.remove(&item.id);
        }
        if !items.is_empty() {
            tracing::warn!("Batch enqueue failed, rolled back {} writes", items.len());
        }
    }

    async fn append(&self, state: &mut QueueState, mutation: NewMutation) -> Result<MutationQueueItem> {
        let seq = state.next_seq;
        let position = state.next_position;

        let item = MutationQueueItem {
            id: Uuid::new_v4(),
            entity_type: mutation.entity_type,
            entity_id: mutation.entity_id,
            operation: mutation.operation,
            payload: mutation.payload,
            base_version: mutation.base_version,
            enqueued_at: self.clock.now(),
            seq,
            position,
            retry_count: 0,
            priority: mutation.priority,
            status: ItemStatus::Pending,
            conflict_with: None,
            next_attempt_at: None,
            last_error: None,
            force_fields: Default::default(),
        };

        storage::put_json(self.store.as_ref(), &item_key(&item.id), &item).await?;

        state.next_seq += 1;
        state.next_position += 1;
        state.insert(item.clone());
        Ok(item)
    }

    fn announce(&self, item: &MutationQueueItem) {
        tracing::debug!(
            "Enqueued {} of {} ({:?})",
            item.operation,
            item.entity_key(),
            item.priority
        );
        self.events.emit(SyncEvent::ItemEnqueued {
            item_id: item.id,
            entity_type: item.entity_type.clone(),
            entity_id: item.entity_id.clone(),
            operation: item.operation,
            priority: item.priority,
        });
    }

    /// Hand out the next item to apply, marking it in flight
    pub async fn dequeue_next(&self) -> Option<MutationQueueItem> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let item = state.candidates().find(|item| item.is_due(now)).cloned()?;
        state.in_flight.insert(item.id);
        Some(item)
    }

    /// Earliest time at which a currently blocked-by-backoff item becomes due
    pub async fn next_due_at(&self) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .candidates()
            .map(|item| item.next_attempt_at.unwrap_or(now))
            .min()
    }

    /// Return an in-flight item to the queue untouched
    pub async fn release(&self, id: &Uuid) {
        self.state.lock().await.in_flight.remove(id);
    }

    /// The write reached the backing store; drop it
    pub async fn mark_succeeded(&self, id: &Uuid) -> Result<MutationQueueItem> {
        let mut state = self.state.lock().await;
        state.get(id)?;

        self.store.remove(&item_key(id)).await?;
        state.remove(id).ok_or(SyncError::ItemNotFound(*id))
    }

    /// Record a transient failure: count it, move to the bucket tail and
    /// schedule the next attempt, or park the item once retries run out
    pub async fn mark_failed(&self, id: &Uuid, error: impl Into<String>) -> Result<MutationQueueItem> {
        let error = error.into();
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let mut item = state.get(id)?.clone();
        item.retry_count += 1;
        item.last_error = Some(error.clone());
        item.position = state.next_position;

        if self.retry.is_exhausted(item.retry_count) {
            item.status = ItemStatus::Failed;
            item.next_attempt_at = None;
        } else {
            let delay = self.retry.delay_for(item.retry_count);
            item.next_attempt_at = Some(now + from_std(delay));
        }

        self.persist(&mut state, item.clone()).await?;
        state.next_position += 1;
        state.in_flight.remove(id);
        drop(state);

        match item.next_attempt_at {
            Some(next_attempt_at) => {
                tracing::warn!(
                    "Attempt {} for {} failed ({}), retrying at {}",
                    item.retry_count,
                    item.entity_key(),
                    error,
                    next_attempt_at
                );
                self.events.emit(SyncEvent::ItemRetryScheduled {
                    item_id: item.id,
                    retry_count: item.retry_count,
                    next_attempt_at,
                    error,
                });
            }
            None => {
                tracing::warn!(
                    "Giving up on {} after {} attempts: {}",
                    item.entity_key(),
                    item.retry_count,
                    error
                );
                self.events.emit(SyncEvent::ItemFailed {
                    item_id: item.id,
                    retry_count: item.retry_count,
                    error,
                });
            }
        }

        Ok(item)
    }

    /// Park an item the server refused outright; no automatic retry
    pub async fn mark_rejected(&self, id: &Uuid, error: impl Into<String>) -> Result<MutationQueueItem> {
        let error = error.into();
        let mut state = self.state.lock().await;

        let mut item = state.get(id)?.clone();
        item.status = ItemStatus::Failed;
        item.last_error = Some(error.clone());
        item.next_attempt_at = None;

        self.persist(&mut state, item.clone()).await?;
        state.in_flight.remove(id);
        drop(state);

        tracing::warn!("Write to {} rejected: {}", item.entity_key(), error);
        self.events.emit(SyncEvent::ItemFailed {
            item_id: item.id,
            retry_count: item.retry_count,
            error,
        });
        Ok(item)
    }

    /// Hold an item for a human decision
    pub async fn mark_conflicted(&self, id: &Uuid, snapshot: ConflictSnapshot) -> Result<MutationQueueItem> {
        let mut state = self.state.lock().await;

        let mut item = state.get(id)?.clone();
        item.status = ItemStatus::Conflicted;
        item.conflict_with = Some(snapshot);
        item.next_attempt_at = None;
        // A new conflict consumes any pending bypass
        item.force_fields.clear();

        self.persist(&mut state, item.clone()).await?;
        state.in_flight.remove(id);
        Ok(item)
    }

    /// Store a resolved item back as pending; keeps its place in the queue
    pub(crate) async fn resubmit(&self, item: MutationQueueItem) -> Result<MutationQueueItem> {
        let mut state = self.state.lock().await;
        state.get(&item.id)?;

        let mut item = item;
        item.status = ItemStatus::Pending;
        item.conflict_with = None;
        item.next_attempt_at = None;

        self.persist(&mut state, item.clone()).await?;
        Ok(item)
    }

    /// Move queued writes to an entity from version `from` onto `to`
    ///
    /// Only valid when every change between the two versions is known to the
    /// caller: our own write, or remote values a user has reviewed. `accept`
    /// narrows which followers qualify.
    pub(crate) async fn rebase_entity<F>(
        &self,
        entity_type: &str,
        entity_id: &str,
        from: i64,
        to: i64,
        accept: F,
    ) -> Result<usize>
    where
        F: Fn(&MutationQueueItem) -> bool + Send,
    {
        let mut state = self.state.lock().await;
        let followers: Vec<MutationQueueItem> = state
            .ordered()
            .into_iter()
            .filter(|item| item.entity_type == entity_type && item.entity_id == entity_id)
            .filter(|item| item.base_version == Some(from) && accept(item))
            .collect();

        for mut item in followers.iter().cloned() {
            item.base_version = Some(to);
            self.persist(&mut state, item).await?;
        }

        if !followers.is_empty() {
            tracing::debug!(
                "Rebased {} queued writes to {}:{} onto version {}",
                followers.len(),
                entity_type,
                entity_id,
                to
            );
        }
        Ok(followers.len())
    }

    /// Manually retry a failed item, starting its retry budget afresh
    pub async fn retry(&self, id: &Uuid) -> Result<MutationQueueItem> {
        let mut state = self.state.lock().await;
        let current = state.get(id)?;

        if current.status == ItemStatus::Conflicted {
            return Err(SyncError::VersionConflict {
                entity_type: current.entity_type.clone(),
                entity_id: current.entity_id.clone(),
            });
        }

        let mut item = current.clone();
        item.status = ItemStatus::Pending;
        item.retry_count = 0;
        item.next_attempt_at = None;
        item.last_error = None;
        item.position = state.next_position;

        self.persist(&mut state, item.clone()).await?;
        state.next_position += 1;
        Ok(item)
    }

    /// Retry every failed item; returns how many were requeued
    pub async fn retry_all_failed(&self) -> Result<usize> {
        let failed = self.ids_with_status(ItemStatus::Failed).await;
        for id in &failed {
            self.retry(id).await?;
        }
        Ok(failed.len())
    }

    /// Drop an item without applying it
    pub async fn discard(&self, id: &Uuid) -> Result<MutationQueueItem> {
        let mut state = self.state.lock().await;
        state.get(id)?;

        self.store.remove(&item_key(id)).await?;
        let item = state.remove(id).ok_or(SyncError::ItemNotFound(*id))?;
        drop(state);

        tracing::info!("Discarded {} of {}", item.operation, item.entity_key());
        self.events.emit(SyncEvent::ItemDiscarded { item_id: item.id });
        Ok(item)
    }

    /// Drop every failed item; returns how many were removed
    pub async fn discard_failed(&self) -> Result<usize> {
        let failed = self.ids_with_status(ItemStatus::Failed).await;
        for id in &failed {
            self.discard(id).await?;
        }
        Ok(failed.len())
    }

    async fn ids_with_status(&self, status: ItemStatus) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state
            .ordered()
            .into_iter()
            .filter(|item| item.status == status)
            .map(|item| item.id)
            .collect()
    }

    /// Write the full record, then swap it into memory
    async fn persist(&self, state: &mut QueueState, item: MutationQueueItem) -> Result<()> {
        storage::put_json(self.store.as_ref(), &item_key(&item.id), &item).await?;
        state.replace(item);
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> Option<MutationQueueItem> {
        self.state.lock().await.items.get(id).cloned()
    }

    /// Snapshot of every item in drain order
    pub async fn items(&self) -> Vec<MutationQueueItem> {
        self.state.lock().await.ordered()
    }

    pub async fn conflicted_items(&self) -> Vec<MutationQueueItem> {
        self.state
            .lock()
            .await
            .ordered()
            .into_iter()
            .filter(|item| item.status == ItemStatus::Conflicted)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.count(ItemStatus::Pending)
    }

    pub async fn failed_count(&self) -> usize {
        self.state.lock().await.count(ItemStatus::Failed)
    }

    pub async fn conflict_count(&self) -> usize {
        self.state.lock().await.count(ItemStatus::Conflicted)
    }
}
