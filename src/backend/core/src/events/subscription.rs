//! Live event delivery to subscribers.
//!
//! Delivery is best-effort. Each subscriber owns a bounded queue; when the
//! queue is full the event is dropped for that subscriber so appends never
//! wait on slow readers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::event::{Event, EventFilter};
use crate::telemetry::metrics::SUBSCRIPTION_DROPPED;

/// Default per-subscriber queue capacity.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

struct Subscriber {
    id: u64,
    filter: EventFilter,
    sender: mpsc::Sender<Event>,
}

#[derive(Default)]
struct HubInner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl HubInner {
    fn remove(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }
}

/// Fan-out of appended events to matching subscriptions.
#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
    buffer: usize,
}

impl std::fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHub")
            .field("subscribers", &self.len())
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIPTION_BUFFER)
    }
}

impl SubscriptionHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner::default()),
            buffer: buffer.max(1),
        }
    }

    /// Register a subscriber. It is removed when `cancel` fires, when the
    /// subscription is closed or dropped, or when the hub is shut down.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, filter: EventFilter, cancel: CancellationToken) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer);
        self.inner.subscribers.lock().push(Subscriber { id, filter, sender });

        let token = cancel.child_token();
        let watcher = token.clone();
        let hub = Arc::downgrade(&self.inner);
        let watched = hub.clone();
        tokio::spawn(async move {
            watcher.cancelled().await;
            if let Some(hub) = watched.upgrade() {
                hub.remove(id);
            }
        });

        debug!(subscription_id = id, "subscription opened");
        Subscription {
            id,
            receiver,
            hub,
            token,
            closed: false,
        }
    }

    /// Deliver events to every matching subscriber without blocking.
    pub fn publish(&self, events: &[Event]) {
        let mut subscribers = self.inner.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }

        subscribers.retain(|subscriber| {
            for event in events.iter().filter(|e| subscriber.filter.matches(e)) {
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        counter!(SUBSCRIPTION_DROPPED).increment(1);
                        debug!(
                            subscription_id = subscriber.id,
                            stream_id = %event.stream_id,
                            version = event.version,
                            "subscriber queue full, event dropped"
                        );
                    }
                    Err(TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
    }

    /// Drop every subscriber; their queues end after draining.
    pub fn close_all(&self) {
        self.inner.subscribers.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live feed of newly appended events.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Event>,
    hub: Weak<HubInner>,
    token: CancellationToken,
    closed: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the subscription has ended and its queue is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// Stop delivery. Already queued events can still be received. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.token.cancel();
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
        self.receiver.close();
        debug!(subscription_id = self.id, "subscription closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn event(stream: &str, version: i64) -> Event {
        let mut e = Event::new(stream, "Happened", json!({}));
        e.version = version;
        e
    }

    #[tokio::test]
    async fn test_filtered_delivery() {
        let hub = SubscriptionHub::new(8);
        let mut sub = hub.subscribe(EventFilter::new().stream("a"), CancellationToken::new());

        hub.publish(&[event("a", 0), event("b", 0), event("a", 1)]);

        assert_eq!(sub.recv().await.unwrap().version, 0);
        assert_eq!(sub.recv().await.unwrap().version, 1);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_buffer_drops() {
        let hub = SubscriptionHub::new(2);
        let mut sub = hub.subscribe(EventFilter::new(), CancellationToken::new());

        hub.publish(&[event("a", 0), event("a", 1), event("a", 2)]);

        assert_eq!(sub.try_recv().unwrap().version, 0);
        assert_eq!(sub.try_recv().unwrap().version, 1);
        assert!(sub.try_recv().is_none());
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_unregisters() {
        let hub = SubscriptionHub::new(4);
        let cancel = CancellationToken::new();
        let mut sub = hub.subscribe(EventFilter::new(), cancel.clone());
        assert_eq!(hub.len(), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !hub.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(sub.is_closed());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let hub = SubscriptionHub::new(4);
        let mut sub = hub.subscribe(EventFilter::new(), CancellationToken::new());
        hub.publish(&[event("a", 0)]);

        sub.close();
        sub.close();
        assert_eq!(hub.len(), 0);
        assert_eq!(sub.recv().await.unwrap().version, 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let hub = SubscriptionHub::new(4);
        let sub = hub.subscribe(EventFilter::new(), CancellationToken::new());
        drop(sub);
        assert!(hub.is_empty());
    }
}
