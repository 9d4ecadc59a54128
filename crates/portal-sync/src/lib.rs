// File: portal-sync/src/lib.rs
// Purpose: Main entry point for the portal-sync library

//! # portal-sync
//!
//! Offline write queue for the teacher portal: writes are queued locally,
//! drained against the backing store when connectivity allows, and version
//! conflicts are handed to a human through the [`ConflictResolver`].
//! Reversible actions go through the [`ActionLog`] and sensitive operations
//! are throttled by the [`RateLimiter`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use portal_sync::{
//!     ConnectivityStatus, EventBus, InMemoryRemote, MutationQueue, NewMutation,
//!     OfflineDetector, PortalSyncConfig, Priority, RateLimiter, SyncEngine,
//!     SystemClock,
//! };
//!
//! let config = PortalSyncConfig::load_default()?;
//! let store = config.storage.open().await?;
//! let clock = Arc::new(SystemClock);
//! let events = EventBus::new();
//!
//! let queue = Arc::new(
//!     MutationQueue::open(store.clone(), clock.clone(), events.clone(), config.retry.policy()).await?,
//! );
//! queue
//!     .enqueue(NewMutation::update("student", "1", json!({"grade": "A"}), Some(3)).with_priority(Priority::High))
//!     .await?;
//!
//! let detector = OfflineDetector::new(ConnectivityStatus::Online, &config.connectivity, None, events.clone());
//! let limiter = Arc::new(RateLimiter::with_rules(clock.clone(), config.rate_limit.clone()));
//! let remote = Arc::new(InMemoryRemote::new());
//! let engine = SyncEngine::builder(queue, remote, detector, limiter)
//!     .events(events)
//!     .config(&config)
//!     .build();
//! engine.start();
//! let report = engine.sync_now().await?;
//! ```

pub mod action_log;
pub mod cache;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod offline;
pub mod queue;
pub mod rate_limiter;
pub mod remote;
pub mod retry;
pub mod storage;

// Re-export main types
pub use action_log::{
    ActionLog, ActionLogEntry, NewAction, OperationKind, QueueUndoExecutor, UndoExecutor,
};
pub use cache::EntityCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConnectivityConfig, PortalSyncConfig, RateLimitConfig, RetryConfig, StorageConfig, UndoConfig,
};
pub use conflict::{
    BulkChoice, ConflictRecord, ConflictResolver, ConflictSet, FieldChoice, ResolutionMap,
    ResolutionOutcome, WHOLE_ENTITY,
};
pub use engine::{DrainReport, SyncEngine, SyncEngineBuilder, SyncStatus};
pub use error::{RemoteError, Result, SyncError};
pub use events::{EventBus, SyncEvent};
pub use models::{ConflictSnapshot, ItemStatus, MutationQueueItem, NewMutation, Operation, Priority};
pub use offline::{ConnectivityStatus, OfflineDetector, ReachabilityProbe, Subscription};
pub use queue::MutationQueue;
pub use rate_limiter::{RateLimitDecision, RateLimitRule, RateLimiter};
pub use remote::{ConditionalWrite, Expectation, InMemoryRemote, RemoteRecord, RemoteStore};
pub use retry::RetryPolicy;
pub use storage::{filesystem::FileStore, memory::MemoryStore, KeyValueStore};
