use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use valet_domain::Result;

use crate::event::{Event, EventKind};

/// Identifies a subscription for later removal.
pub type SubscriptionId = u64;

type Listener = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    /// `None` subscribes to every event kind.
    filter: Option<EventKind>,
    listener: Listener,
}

/// Snapshot counters exposed for operator inspection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BusStats {
    pub events_published: u64,
    pub delivery_errors: u64,
    pub listeners: usize,
    pub wildcard_listeners: usize,
}

/// Process-wide pub/sub with typed events and wildcard subscribers.
///
/// The subscription list is copy-on-write: `publish` snapshots an
/// `Arc<Vec<_>>`, so registering a listener never blocks an in-flight
/// publish and never observes a partial delivery. Publishes themselves are
/// serialized so listeners see events in `publish` order.
pub struct EventBus {
    subscriptions: RwLock<Arc<Vec<Subscription>>>,
    publish_lock: Mutex<()>,
    next_id: AtomicU64,
    events_published: AtomicU64,
    delivery_errors: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Arc::new(Vec::new())),
            publish_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
            delivery_errors: AtomicU64::new(0),
        }
    }

    /// Subscribe to one event kind, or to all kinds with `None`.
    ///
    /// The listener is boxed to async here so the bus deals with a single
    /// dispatch style regardless of what the caller hands in.
    pub fn subscribe<F, Fut>(&self, filter: Option<EventKind>, listener: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let boxed: Listener = Arc::new(move |event| listener(event).boxed());

        let mut subs = self.subscriptions.write();
        let mut next = (**subs).clone();
        next.push(Subscription {
            id,
            filter,
            listener: boxed,
        });
        *subs = Arc::new(next);
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        if !subs.iter().any(|s| s.id == id) {
            return false;
        }
        let mut next = (**subs).clone();
        next.retain(|s| s.id != id);
        *subs = Arc::new(next);
        true
    }

    /// Deliver an event to every matching subscriber.
    ///
    /// Awaits each listener in registration order. A listener error or
    /// panic increments the error counter and delivery continues.
    pub async fn publish(&self, event: Event) {
        // Serialize publishes so no listener observes two events interleaved.
        let _guard = self.publish_lock.lock().await;
        let snapshot = self.subscriptions.read().clone();
        self.events_published.fetch_add(1, Ordering::Relaxed);

        for sub in snapshot.iter() {
            let matches = match sub.filter {
                Some(kind) => kind == event.kind,
                None => true,
            };
            if !matches {
                continue;
            }

            let fut = (sub.listener)(event.clone());
            match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.delivery_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        kind = %event.kind,
                        subscription = sub.id,
                        error = %e,
                        "event listener failed"
                    );
                }
                Err(_) => {
                    self.delivery_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        kind = %event.kind,
                        subscription = sub.id,
                        "event listener panicked"
                    );
                }
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        let subs = self.subscriptions.read();
        BusStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
            listeners: subs.iter().filter(|s| s.filter.is_some()).count(),
            wildcard_listeners: subs.iter().filter(|s| s.filter.is_none()).count(),
        }
    }
}
