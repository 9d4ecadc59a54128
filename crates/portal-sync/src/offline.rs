// File: portal-sync/src/offline.rs
// Purpose: Debounced connectivity tracking with an optional reachability probe

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ConnectivityConfig;
use crate::events::{EventBus, SyncEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Online,
    Offline,
}

impl ConnectivityStatus {
    pub fn from_flag(online: bool) -> Self {
        if online {
            ConnectivityStatus::Online
        } else {
            ConnectivityStatus::Offline
        }
    }
}

/// Confirms that the backing store can actually be reached
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

type Callback = Arc<dyn Fn(ConnectivityStatus) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: HashMap<u64, Callback>,
}

struct DetectorInner {
    status: watch::Sender<ConnectivityStatus>,
    subscribers: Mutex<Subscribers>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    debounce: Duration,
    probe_interval: Duration,
    /// Bumped by every platform report; a debounced report only lands if
    /// nothing newer arrived in the meantime
    generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: EventBus,
}

impl DetectorInner {
    fn set_status(&self, status: ConnectivityStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if !changed {
            return;
        }

        tracing::info!("Connectivity changed: {:?}", status);
        self.events.emit(SyncEvent::ConnectivityChanged { status });

        // Callbacks run outside the lock so they may unsubscribe
        let callbacks: Vec<Callback> = self.subscribers.lock().callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(status);
        }
    }

    async fn confirm(&self, reported: ConnectivityStatus) -> ConnectivityStatus {
        match &self.probe {
            Some(probe) => ConnectivityStatus::from_flag(probe.probe().await),
            None => reported,
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

/// Tracks whether the backing store is reachable
///
/// Platform online/offline reports are debounced so flapping networks do
/// not cause a burst of transitions. When a probe is configured it has the
/// final say, both after a report and on a fixed interval; without one the
/// platform flag is trusted as-is. Must be used inside a tokio runtime.
#[derive(Clone)]
pub struct OfflineDetector {
    inner: Arc<DetectorInner>,
}

impl OfflineDetector {
    pub fn new(
        initial: ConnectivityStatus,
        config: &ConnectivityConfig,
        probe: Option<Arc<dyn ReachabilityProbe>>,
        events: EventBus,
    ) -> Self {
        let (status, _) = watch::channel(initial);
        Self {
            inner: Arc::new(DetectorInner {
                status,
                subscribers: Mutex::new(Subscribers::default()),
                probe,
                debounce: config.debounce(),
                probe_interval: config.probe_interval(),
                generation: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
                events,
            }),
        }
    }

    pub fn status(&self) -> ConnectivityStatus {
        *self.inner.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status() == ConnectivityStatus::Online
    }

    /// Receiver that observes every transition
    pub fn watch(&self) -> watch::Receiver<ConnectivityStatus> {
        self.inner.status.subscribe()
    }

    /// Register a callback invoked on each transition
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectivityStatus) + Send + Sync + 'static,
    {
        let mut subscribers = self.inner.subscribers.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.callbacks.insert(id, Arc::new(callback));

        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Feed a platform online/offline signal; applied after the debounce
    pub fn report_platform_status(&self, online: bool) {
        let reported = ConnectivityStatus::from_flag(online);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();

        tracing::debug!("Platform reported {:?}", reported);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let status = inner.confirm(reported).await;
            if inner.generation.load(Ordering::SeqCst) == generation {
                inner.set_status(status);
            }
        });
        self.inner.track(handle);
    }

    /// Run the probe immediately; `None` when no probe is configured
    pub async fn probe_now(&self) -> Option<ConnectivityStatus> {
        let probe = self.inner.probe.as_ref()?;
        let status = ConnectivityStatus::from_flag(probe.probe().await);
        self.inner.set_status(status);
        Some(status)
    }

    /// Start periodic probing
    pub fn start(&self) {
        let Some(probe) = self.inner.probe.clone() else {
            tracing::warn!("No reachability probe configured, trusting platform connectivity reports");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.probe_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let reachable = probe.probe().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.set_status(ConnectivityStatus::from_flag(reachable));
            }
        });
        self.inner.track(handle);
        tracing::info!("Reachability probe running every {:?}", period);
    }

    /// Stop background work and drop all subscribers
    pub fn dispose(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.subscribers.lock().callbacks.clear();
    }
}

/// Handle returned by `OfflineDetector::subscribe`
#[must_use = "dropping the handle keeps the callback registered; call unsubscribe() to remove it"]
pub struct Subscription {
    id: u64,
    inner: Weak<DetectorInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.lock().callbacks.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct FlagProbe(Arc<AtomicBool>);

    #[async_trait]
    impl ReachabilityProbe for FlagProbe {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn config() -> ConnectivityConfig {
        ConnectivityConfig {
            debounce_ms: 500,
            probe_interval_ms: 30_000,
        }
    }

    fn counting(detector: &OfflineDetector) -> (Arc<AtomicUsize>, Subscription) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let subscription = detector.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (calls, subscription)
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_applies_after_debounce() {
        let detector = OfflineDetector::new(ConnectivityStatus::Online, &config(), None, EventBus::new());
        let (calls, _subscription) = counting(&detector);

        detector.report_platform_status(false);
        sleep_ms(100).await;
        assert!(detector.is_online());

        sleep_ms(500).await;
        assert_eq!(detector.status(), ConnectivityStatus::Offline);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_is_ignored() {
        let detector = OfflineDetector::new(ConnectivityStatus::Online, &config(), None, EventBus::new());
        let (calls, _subscription) = counting(&detector);

        detector.report_platform_status(false);
        sleep_ms(200).await;
        detector.report_platform_status(true);
        sleep_ms(1000).await;

        assert!(detector.is_online());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_overrides_platform_flag() {
        let reachable = Arc::new(AtomicBool::new(true));
        let probe: Arc<dyn ReachabilityProbe> = Arc::new(FlagProbe(reachable.clone()));
        let detector = OfflineDetector::new(ConnectivityStatus::Online, &config(), Some(probe), EventBus::new());

        // Platform claims offline but the server answers
        detector.report_platform_status(false);
        sleep_ms(600).await;
        assert!(detector.is_online());

        // Platform claims online but the server does not answer
        reachable.store(false, Ordering::SeqCst);
        detector.report_platform_status(true);
        sleep_ms(600).await;
        assert!(!detector.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_probe() {
        let reachable = Arc::new(AtomicBool::new(true));
        let probe: Arc<dyn ReachabilityProbe> = Arc::new(FlagProbe(reachable.clone()));
        let detector = OfflineDetector::new(ConnectivityStatus::Online, &config(), Some(probe), EventBus::new());
        let mut rx = detector.watch();

        detector.start();
        reachable.store(false, Ordering::SeqCst);
        sleep_ms(30_100).await;

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectivityStatus::Offline);
        detector.dispose();
    }

    #[tokio::test]
    async fn test_unsubscribe_and_probe_now() {
        let reachable = Arc::new(AtomicBool::new(false));
        let probe: Arc<dyn ReachabilityProbe> = Arc::new(FlagProbe(reachable.clone()));
        let detector = OfflineDetector::new(ConnectivityStatus::Online, &config(), Some(probe), EventBus::new());
        let (calls, subscription) = counting(&detector);

        assert_eq!(detector.probe_now().await, Some(ConnectivityStatus::Offline));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        reachable.store(true, Ordering::SeqCst);
        assert_eq!(detector.probe_now().await, Some(ConnectivityStatus::Online));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_now_without_probe() {
        let detector = OfflineDetector::new(ConnectivityStatus::Offline, &config(), None, EventBus::new());
        assert_eq!(detector.probe_now().await, None);
        assert!(!detector.is_online());
    }

    #[tokio::test]
    async fn test_transition_emits_event() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let probe: Arc<dyn ReachabilityProbe> = Arc::new(FlagProbe(Arc::new(AtomicBool::new(false))));
        let detector = OfflineDetector::new(ConnectivityStatus::Online, &config(), Some(probe), events);

        detector.probe_now().await;
        detector.probe_now().await;

        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::ConnectivityChanged {
                status: ConnectivityStatus::Offline
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
