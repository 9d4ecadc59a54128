// File: portal-sync/src/engine.rs
// Purpose: Drains the mutation queue against the backing store

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::EntityCache;
use crate::clock::{to_std, Clock, SystemClock};
use crate::config::PortalSyncConfig;
use crate::conflict::{self, Assessment, ConflictResolver};
use crate::error::{RemoteError, Result};
use crate::events::{EventBus, SyncEvent};
use crate::models::{ItemStatus, MutationQueueItem, Operation};
use crate::offline::{ConnectivityStatus, OfflineDetector};
use crate::queue::MutationQueue;
use crate::rate_limiter::{RateLimitRule, RateLimiter};
use crate::remote::{Expectation, RemoteRecord, RemoteStore};

const SYNC_RATE_KEY: &str = "sync:drain";

/// Read-only aggregate for status surfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub pending_count: usize,
    pub failed_count: usize,
    pub conflict_count: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Outcome of one drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another drain was already running; nothing was done
    pub skipped: bool,
    pub applied: usize,
    pub conflicts: usize,
    /// Transient failures that were rescheduled
    pub retried: usize,
    /// Items that ended up failed (retries exhausted or rejected)
    pub failed: usize,
    /// The drain stopped because connectivity was lost
    pub halted_offline: bool,
}

#[derive(Default)]
struct EngineState {
    last_sync_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct EngineInner {
    queue: Arc<MutationQueue>,
    remote: Arc<dyn RemoteStore>,
    detector: OfflineDetector,
    limiter: Arc<RateLimiter>,
    cache: Option<EntityCache>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    sync_rule: RateLimitRule,
    syncing: AtomicBool,
    state: RwLock<EngineState>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the syncing flag however the drain ends
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngineBuilder {
    queue: Arc<MutationQueue>,
    remote: Arc<dyn RemoteStore>,
    detector: OfflineDetector,
    limiter: Arc<RateLimiter>,
    cache: Option<EntityCache>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    sync_rule: RateLimitRule,
}

impl SyncEngineBuilder {
    pub fn cache(mut self, cache: EntityCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sync_rule(mut self, rule: RateLimitRule) -> Self {
        self.sync_rule = rule;
        self
    }

    /// Take the drain throttle from configuration
    pub fn config(self, config: &PortalSyncConfig) -> Self {
        self.sync_rule(config.rate_limit.sync)
    }

    pub fn build(self) -> SyncEngine {
        SyncEngine {
            inner: Arc::new(EngineInner {
                queue: self.queue,
                remote: self.remote,
                detector: self.detector,
                limiter: self.limiter,
                cache: self.cache,
                events: self.events,
                clock: self.clock,
                sync_rule: self.sync_rule,
                syncing: AtomicBool::new(false),
                state: RwLock::new(EngineState::default()),
                auto_sync: Mutex::new(None),
            }),
        }
    }
}

/// Applies queued writes when connectivity allows
///
/// Only one drain runs at a time; a trigger that arrives while a drain is in
/// progress is a no-op. Conflicts park the affected item and block further
/// writes to that entity only.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn builder(
        queue: Arc<MutationQueue>,
        remote: Arc<dyn RemoteStore>,
        detector: OfflineDetector,
        limiter: Arc<RateLimiter>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            queue,
            remote,
            detector,
            limiter,
            cache: None,
            events: EventBus::new(),
            clock: Arc::new(SystemClock),
            sync_rule: PortalSyncConfig::default().rate_limit.sync,
        }
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.inner.queue
    }

    /// Resolver sharing this engine's queue, cache and events
    pub fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(
            self.inner.queue.clone(),
            self.inner.cache.clone(),
            self.inner.events.clone(),
        )
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    pub async fn status(&self) -> SyncStatus {
        let queue = &self.inner.queue;
        let (last_sync_at, last_error) = {
            let state = self.inner.state.read();
            (state.last_sync_at, state.last_error.clone())
        };

        SyncStatus {
            is_syncing: self.is_syncing(),
            pending_count: queue.pending_count().await,
            failed_count: queue.failed_count().await,
            conflict_count: queue.conflict_count().await,
            last_sync_at,
            last_error,
        }
    }

    /// Run one drain cycle now
    pub async fn sync_now(&self) -> Result<DrainReport> {
        let inner = &self.inner;
        if inner
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Drain already running, ignoring trigger");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        }
        let _guard = SyncingGuard(&inner.syncing);

        tracing::info!("Sync started ({} queued)", inner.queue.len().await);
        inner.events.emit(SyncEvent::SyncStarted);

        let mut report = DrainReport::default();
        let result = self.drain(&mut report).await;

        if let Err(e) = &result {
            tracing::error!("Sync aborted: {}", e);
            inner.state.write().last_error = Some(e.to_string());
        } else if !report.halted_offline {
            let no_failures = inner.queue.failed_count().await == 0;
            let mut state = inner.state.write();
            state.last_sync_at = Some(inner.clock.now());
            if no_failures {
                state.last_error = None;
            }
        }

        tracing::info!(
            "Sync finished: {} applied, {} conflicts, {} retried, {} failed{}",
            report.applied,
            report.conflicts,
            report.retried,
            report.failed,
            if report.halted_offline { " (halted offline)" } else { "" }
        );
        inner.events.emit(SyncEvent::SyncFinished {
            applied: report.applied,
            conflicts: report.conflicts,
            failed: report.failed,
            halted_offline: report.halted_offline,
        });

        result.map(|_| report)
    }

    async fn drain(&self, report: &mut DrainReport) -> Result<()> {
        let inner = &self.inner;

        loop {
            if !inner.detector.is_online() {
                report.halted_offline = true;
                return Ok(());
            }

            let Some(item) = inner.queue.dequeue_next().await else {
                // Only items that are backing off may be left
                let Some(due) = inner.queue.next_due_at().await else {
                    return Ok(());
                };
                self.wait_until(due).await;
                continue;
            };

            if !self.throttle().await {
                inner.queue.release(&item.id).await;
                report.halted_offline = true;
                return Ok(());
            }

            self.process(item, report).await?;
        }
    }

    /// Sleep until `due` or until connectivity changes
    async fn wait_until(&self, due: DateTime<Utc>) {
        let wait = to_std(due - self.inner.clock.now()).max(Duration::from_millis(1));
        let mut connectivity = self.inner.detector.watch();

        tracing::debug!("Next queued write is backing off, waiting {:?}", wait);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = connectivity.changed() => {}
        }
    }

    /// Wait for the drain rate limit; false if connectivity was lost meanwhile
    async fn throttle(&self) -> bool {
        let inner = &self.inner;
        loop {
            let decision = inner.limiter.check(SYNC_RATE_KEY, inner.sync_rule);
            if decision.allowed {
                return true;
            }

            tracing::debug!("Drain throttled for {:?}", decision.reset_in);
            tokio::time::sleep(decision.reset_in).await;
            if !inner.detector.is_online() {
                return false;
            }
        }
    }

    async fn process(&self, item: MutationQueueItem, report: &mut DrainReport) -> Result<()> {
        let remote = &self.inner.remote;

        let current = match remote.fetch(&item.entity_type, &item.entity_id).await {
            Ok(current) => current,
            Err(e) => return self.fail(&item, e, report).await,
        };

        let write = match conflict::assess(&item, current.as_ref()) {
            Assessment::Apply(write) => write,
            Assessment::AlreadyApplied => return self.applied(&item, current, report).await,
            Assessment::Conflict(fields) => return self.conflict(&item, current, fields, report).await,
        };

        let expected = write.expected;
        let operation = write.operation;
        match remote.write(write).await {
            Ok(record) => {
                // Only our write sits between `previous` and the new version, so
                // followers built on `previous` move with it. Followers on an older
                // base still face whatever changed remotely in between.
                if let (Expectation::Version(previous), Some(record)) = (expected, &record) {
                    self.inner
                        .queue
                        .rebase_entity(
                            &item.entity_type,
                            &item.entity_id,
                            previous,
                            record.version,
                            |_| true,
                        )
                        .await?;
                }
                if operation == Operation::Delete {
                    self.applied(&item, None, report).await
                } else {
                    self.applied(&item, record, report).await
                }
            }
            Err(RemoteError::VersionMismatch { current }) => {
                // The entity moved between fetch and write
                match conflict::assess(&item, current.as_ref()) {
                    Assessment::Conflict(fields) => self.conflict(&item, current, fields, report).await,
                    _ => {
                        let error = RemoteError::Transient("entity changed during write".into());
                        self.fail(&item, error, report).await
                    }
                }
            }
            Err(e) => self.fail(&item, e, report).await,
        }
    }

    async fn applied(
        &self,
        item: &MutationQueueItem,
        record: Option<RemoteRecord>,
        report: &mut DrainReport,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.queue.mark_succeeded(&item.id).await?;

        if let Some(cache) = &inner.cache {
            match &record {
                Some(record) => cache.put(&item.entity_type, &item.entity_id, &record.data).await?,
                None => cache.remove(&item.entity_type, &item.entity_id).await?,
            }
        }

        report.applied += 1;
        tracing::debug!("Applied {} of {}", item.operation, item.entity_key());
        inner.events.emit(SyncEvent::ItemApplied {
            item_id: item.id,
            entity_type: item.entity_type.clone(),
            entity_id: item.entity_id.clone(),
            version: record.map(|r| r.version),
        });
        Ok(())
    }

    async fn conflict(
        &self,
        item: &MutationQueueItem,
        current: Option<RemoteRecord>,
        fields: Vec<String>,
        report: &mut DrainReport,
    ) -> Result<()> {
        let inner = &self.inner;
        let snapshot = conflict::snapshot(current.as_ref(), fields.clone(), inner.clock.now());
        inner.queue.mark_conflicted(&item.id, snapshot).await?;

        report.conflicts += 1;
        tracing::info!(
            "Conflict on {} ({}), holding its writes for review",
            item.entity_key(),
            fields.join(", ")
        );
        inner.events.emit(SyncEvent::ConflictDetected {
            item_id: item.id,
            entity_type: item.entity_type.clone(),
            entity_id: item.entity_id.clone(),
            fields,
        });
        Ok(())
    }

    async fn fail(&self, item: &MutationQueueItem, error: RemoteError, report: &mut DrainReport) -> Result<()> {
        let inner = &self.inner;
        let updated = match error {
            RemoteError::Rejected(reason) => inner.queue.mark_rejected(&item.id, reason).await?,
            other => inner.queue.mark_failed(&item.id, other.to_string()).await?,
        };

        if updated.status == ItemStatus::Failed {
            report.failed += 1;
            inner.state.write().last_error = updated.last_error.clone();
        } else {
            report.retried += 1;
        }
        Ok(())
    }

    /// Drain automatically whenever connectivity comes back
    pub fn start(&self) {
        let mut auto_sync = self.inner.auto_sync.lock();
        if auto_sync.is_some() {
            return;
        }

        let engine = self.clone();
        let mut connectivity = self.inner.detector.watch();
        *auto_sync = Some(tokio::spawn(async move {
            if engine.inner.detector.is_online() {
                engine.sync_logged().await;
            }
            while connectivity.changed().await.is_ok() {
                let status = *connectivity.borrow_and_update();
                if status == ConnectivityStatus::Online {
                    tracing::info!("Back online, draining queued writes");
                    engine.sync_logged().await;
                }
            }
        }));
    }

    async fn sync_logged(&self) {
        if let Err(e) = self.sync_now().await {
            tracing::error!("Automatic sync failed: {}", e);
        }
    }

    /// Stop automatic syncing
    pub fn dispose(&self) {
        if let Some(handle) = self.inner.auto_sync.lock().take() {
            handle.abort();
        }
    }

    pub async fn retry_all_failed(&self) -> Result<usize> {
        self.inner.queue.retry_all_failed().await
    }

    pub async fn discard_failed(&self) -> Result<usize> {
        self.inner.queue.discard_failed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectivityConfig;
    use crate::conflict::BulkChoice;
    use crate::models::NewMutation;
    use crate::offline::ReachabilityProbe;
    use crate::remote::{ConditionalWrite, InMemoryRemote};
    use crate::retry::RetryPolicy;
    use crate::storage::memory::MemoryStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::Notify;

    struct FlagProbe(Arc<AtomicBool>);

    #[async_trait]
    impl ReachabilityProbe for FlagProbe {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        engine: SyncEngine,
        queue: Arc<MutationQueue>,
        remote: InMemoryRemote,
        detector: OfflineDetector,
        reachable: Arc<AtomicBool>,
        cache: EntityCache,
    }

    fn quick_retries(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5), max_retries)
    }

    async fn harness_with(remote: Arc<dyn RemoteStore>, backing: InMemoryRemote, retry: RetryPolicy) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue = Arc::new(
            MutationQueue::open(store.clone(), clock.clone(), events.clone(), retry)
                .await
                .unwrap(),
        );
        let reachable = Arc::new(AtomicBool::new(true));
        let probe: Arc<dyn ReachabilityProbe> = Arc::new(FlagProbe(reachable.clone()));
        let detector = OfflineDetector::new(
            ConnectivityStatus::Online,
            &ConnectivityConfig::default(),
            Some(probe),
            events.clone(),
        );
        let cache = EntityCache::new(store);
        let engine = SyncEngine::builder(queue.clone(), remote, detector.clone(), Arc::new(RateLimiter::new(clock.clone())))
            .cache(cache.clone())
            .events(events)
            .clock(clock)
            .sync_rule(RateLimitRule::new(1000, 1000))
            .build();

        Harness {
            engine,
            queue,
            remote: backing,
            detector,
            reachable,
            cache,
        }
    }

    async fn harness(retry: RetryPolicy) -> Harness {
        let remote = InMemoryRemote::new();
        harness_with(Arc::new(remote.clone()), remote, retry).await
    }

    #[tokio::test]
    async fn test_applies_in_priority_order() {
        let h = harness(RetryPolicy::default()).await;
        h.remote.seed("student", "1", json!({"grade": "B"})).await;
        h.queue
            .enqueue(NewMutation::update("student", "1", json!({"grade": "A"}), Some(1)))
            .await
            .unwrap();
        h.queue
            .enqueue(NewMutation::insert("student", "2", json!({"name": "Bo"})).with_priority(crate::Priority::High))
            .await
            .unwrap();

        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.applied, 2);
        let order: Vec<String> = h
            .remote
            .applied_writes()
            .await
            .into_iter()
            .map(|w: ConditionalWrite| w.entity_id)
            .collect();
        assert_eq!(order, vec!["2", "1"]);
        assert_eq!(h.cache.get("student", "1").await.unwrap(), Some(json!({"grade": "A"})));
        assert!(h.queue.is_empty().await);

        let status = h.engine.status().await;
        assert!(status.last_sync_at.is_some());
        assert!(!status.is_syncing);
    }

    #[tokio::test]
    async fn test_chained_edits_do_not_conflict_with_each_other() {
        let h = harness(RetryPolicy::default()).await;
        h.remote.seed("student", "1", json!({"grade": "B", "name": "Ada"})).await;
        h.queue
            .enqueue(NewMutation::update("student", "1", json!({"grade": "A"}), Some(1)))
            .await
            .unwrap();
        h.queue
            .enqueue(NewMutation::update("student", "1", json!({"name": "Ada L."}), Some(1)))
            .await
            .unwrap();

        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.conflicts, 0);
        let record = h.remote.get("student", "1").await.unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.data, json!({"grade": "A", "name": "Ada L."}));
    }

    #[tokio::test]
    async fn test_conflict_blocks_only_that_entity() {
        let h = harness(RetryPolicy::default()).await;
        h.remote.seed("student", "1", json!({"grade": "B"})).await;
        h.remote.seed("student", "2", json!({"grade": "B"})).await;
        let disputed = h
            .queue
            .enqueue(NewMutation::update("student", "1", json!({"grade": "A"}), Some(1)))
            .await
            .unwrap();
        h.queue
            .enqueue(NewMutation::update("student", "1", json!({"grade": "A+"}), Some(1)))
            .await
            .unwrap();
        h.queue
            .enqueue(NewMutation::update("student", "2", json!({"grade": "C"}), Some(1)))
            .await
            .unwrap();
        h.remote.edit_elsewhere("student", "1", json!({"grade": "D"})).await;

        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(h.queue.len().await, 2);
        assert_eq!(h.engine.status().await.conflict_count, 1);
        assert_eq!(h.remote.get("student", "1").await.unwrap().data, json!({"grade": "D"}));

        // Keep ours; the held-back follower goes out after it
        h.engine
            .resolver()
            .resolve_all(&disputed.id, BulkChoice::AllLocal)
            .await
            .unwrap();
        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.applied, 2);
        assert!(h.queue.is_empty().await);
        assert_eq!(h.remote.get("student", "1").await.unwrap().data, json!({"grade": "A+"}));
    }

    #[tokio::test]
    async fn test_follower_still_checked_after_write_lands_on_newer_version() {
        let h = harness(RetryPolicy::default()).await;
        h.remote.seed("student", "1", json!({"grade": "B", "name": "Ada"})).await;
        h.queue
            .enqueue(NewMutation::update("student", "1", json!({"grade": "A"}), Some(1)))
            .await
            .unwrap();
        let follower = h
            .queue
            .enqueue(NewMutation::update("student", "1", json!({"name": "Ada L."}), Some(1)))
            .await
            .unwrap();
        // Agrees with our grade, but renames
        h.remote
            .edit_elsewhere("student", "1", json!({"grade": "A", "name": "Adele"}))
            .await;

        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.conflicts, 1);
        assert_eq!(h.remote.get("student", "1").await.unwrap().data["name"], json!("Adele"));

        let set = h.engine.resolver().conflict_set(&follower.id).await.unwrap();
        assert_eq!(set.records.len(), 1);
        assert_eq!(set.records[0].field, "name");
        assert_eq!(set.records[0].server_value, json!("Adele"));
    }

    #[tokio::test]
    async fn test_resolving_one_conflict_does_not_wave_through_followers() {
        let h = harness(RetryPolicy::default()).await;
        h.remote.seed("student", "1", json!({"grade": "B", "name": "Ada"})).await;
        let first = h
            .queue
            .enqueue(NewMutation::update("student", "1", json!({"grade": "A"}), Some(1)))
            .await
            .unwrap();
        let follower = h
            .queue
            .enqueue(NewMutation::update("student", "1", json!({"name": "Ada L."}), Some(1)))
            .await
            .unwrap();
        h.remote
            .edit_elsewhere("student", "1", json!({"grade": "C", "name": "Adele"}))
            .await;

        let report = h.engine.sync_now().await.unwrap();
        assert_eq!(report.conflicts, 1);

        h.engine
            .resolver()
            .resolve_all(&first.id, BulkChoice::AllLocal)
            .await
            .unwrap();
        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.conflicts, 1);
        assert_eq!(
            h.remote.get("student", "1").await.unwrap().data,
            json!({"grade": "A", "name": "Adele"})
        );
        let set = h.engine.resolver().conflict_set(&follower.id).await.unwrap();
        assert_eq!(set.records[0].field, "name");
        assert_eq!(set.records[0].local_value, json!("Ada L."));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_in_same_drain() {
        let h = harness(quick_retries(5)).await;
        h.remote.fail_next(RemoteError::Transient("502".into())).await;
        h.queue
            .enqueue(NewMutation::insert("student", "1", json!({"name": "Ada"})))
            .await
            .unwrap();

        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.retried, 1);
        assert_eq!(report.applied, 1);
        assert!(h.remote.get("student", "1").await.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_as_failed() {
        let h = harness(quick_retries(2)).await;
        h.remote.fail_next(RemoteError::Transient("timeout".into())).await;
        h.remote.fail_next(RemoteError::Transient("timeout".into())).await;
        h.queue
            .enqueue(NewMutation::insert("student", "1", json!({"name": "Ada"})))
            .await
            .unwrap();

        let report = h.engine.sync_now().await.unwrap();
        assert_eq!(report.failed, 1);

        let status = h.engine.status().await;
        assert_eq!(status.failed_count, 1);
        assert_eq!(status.pending_count, 0);
        assert!(status.last_error.unwrap().contains("timeout"));

        // Bulk retry then succeeds
        assert_eq!(h.engine.retry_all_failed().await.unwrap(), 1);
        let report = h.engine.sync_now().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(h.engine.status().await.last_error, None);
    }

    #[tokio::test]
    async fn test_rejected_write_is_not_retried() {
        let h = harness(quick_retries(5)).await;
        h.remote.fail_next(RemoteError::Rejected("grade out of range".into())).await;
        h.queue
            .enqueue(NewMutation::insert("student", "1", json!({"grade": "Z"})))
            .await
            .unwrap();

        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(h.engine.discard_failed().await.unwrap(), 1);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_offline_halts_drain() {
        let h = harness(RetryPolicy::default()).await;
        h.queue
            .enqueue(NewMutation::insert("student", "1", json!({"name": "Ada"})))
            .await
            .unwrap();

        h.reachable.store(false, Ordering::SeqCst);
        h.detector.probe_now().await;
        let report = h.engine.sync_now().await.unwrap();

        assert!(report.halted_offline);
        assert_eq!(report.applied, 0);
        assert_eq!(h.queue.pending_count().await, 1);
        assert!(h.engine.status().await.last_sync_at.is_none());
    }

    #[tokio::test]
    async fn test_delete_of_missing_entity_counts_as_applied() {
        let h = harness(RetryPolicy::default()).await;
        h.queue
            .enqueue(NewMutation::delete("student", "404", Some(3)))
            .await
            .unwrap();

        let report = h.engine.sync_now().await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(h.remote.applied_writes().await.is_empty());
    }

    #[tokio::test]
    async fn test_throttled_drain_still_completes() {
        let h = harness(RetryPolicy::default()).await;
        let engine = SyncEngine::builder(
            h.queue.clone(),
            Arc::new(h.remote.clone()),
            h.detector.clone(),
            Arc::new(RateLimiter::new(Arc::new(SystemClock))),
        )
        .sync_rule(RateLimitRule::new(2, 100))
        .build();

        for id in ["1", "2", "3"] {
            h.queue
                .enqueue(NewMutation::insert("student", id, json!({"name": id})))
                .await
                .unwrap();
        }

        let started = std::time::Instant::now();
        let report = engine.sync_now().await.unwrap();

        assert_eq!(report.applied, 3);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    /// Remote whose first fetch waits until released
    struct GatedRemote {
        inner: InMemoryRemote,
        entered: Notify,
        release: Notify,
        gated: AtomicBool,
    }

    #[async_trait]
    impl RemoteStore for GatedRemote {
        async fn fetch(&self, entity_type: &str, entity_id: &str) -> std::result::Result<Option<RemoteRecord>, RemoteError> {
            if self.gated.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.fetch(entity_type, entity_id).await
        }

        async fn write(&self, write: ConditionalWrite) -> std::result::Result<Option<RemoteRecord>, RemoteError> {
            self.inner.write(write).await
        }
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_ignored() {
        let backing = InMemoryRemote::new();
        let gated = Arc::new(GatedRemote {
            inner: backing.clone(),
            entered: Notify::new(),
            release: Notify::new(),
            gated: AtomicBool::new(true),
        });
        let h = harness_with(gated.clone(), backing, RetryPolicy::default()).await;
        h.queue
            .enqueue(NewMutation::insert("student", "1", json!({"name": "Ada"})))
            .await
            .unwrap();

        let engine = h.engine.clone();
        let first = tokio::spawn(async move { engine.sync_now().await.unwrap() });
        gated.entered.notified().await;

        assert!(h.engine.is_syncing());
        let second = h.engine.sync_now().await.unwrap();
        assert!(second.skipped);

        gated.release.notify_one();
        let first = first.await.unwrap();
        assert_eq!(first.applied, 1);
        assert_eq!(h.remote.applied_writes().await.len(), 1);
        assert!(!h.engine.is_syncing());
    }

    #[tokio::test]
    async fn test_reconnect_triggers_drain() {
        let h = harness(RetryPolicy::default()).await;
        h.reachable.store(false, Ordering::SeqCst);
        h.detector.probe_now().await;

        let mut events = h.engine.inner.events.subscribe();
        h.engine.start();
        h.queue
            .enqueue(NewMutation::insert("student", "1", json!({"name": "Ada"})))
            .await
            .unwrap();

        h.reachable.store(true, Ordering::SeqCst);
        h.detector.probe_now().await;

        loop {
            if let SyncEvent::SyncFinished { applied, .. } = events.recv().await.unwrap() {
                assert_eq!(applied, 1);
                break;
            }
        }
        h.engine.dispose();
    }
}
