//! In-process event bus with lossy bounded fan-out.
//!
//! Each subscriber owns a bounded queue. `publish` performs a non-blocking
//! try-enqueue per subscriber: a full queue drops the event and bumps that
//! subscriber's drop counter, so a slow SSE consumer can never stall the
//! write path or the scheduler. Filters run on the publisher side, which
//! keeps uninteresting events from ever occupying queue slots.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::ResourceEvent;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Handle identifying a subscription.
pub type SubscriberId = Uuid;

/// Publisher-side predicate deciding which events a subscriber receives.
pub type EventFilter = Box<dyn Fn(&ResourceEvent) -> bool + Send + Sync>;

struct Subscriber {
    sender: mpsc::Sender<ResourceEvent>,
    filter: Option<EventFilter>,
    dropped: Arc<AtomicU64>,
}

/// Counters for observability.
#[derive(Debug, Clone, Copy)]
pub struct BusStats {
    pub published: u64,
    pub dropped: u64,
    pub subscribers: usize,
}

/// Process-wide pub/sub for resource events.
pub struct EventBus {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    queue_capacity: usize,
    published: AtomicU64,
    dropped_total: AtomicU64,
}

impl EventBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            published: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Publish an event to every matching subscriber without blocking.
    pub fn publish(&self, event: &ResourceEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut closed: Vec<SubscriberId> = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if let Some(filter) = &subscriber.filter {
                    if !filter(event) {
                        continue;
                    }
                }
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                        self.dropped_total.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscriber = %id,
                            event_type = %event.event_type,
                            "Dropped event: subscriber queue full"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    /// Register a subscriber, returning its id and the event sequence.
    pub fn subscribe(&self, filter: Option<EventFilter>) -> (SubscriberId, EventStream) {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        self.subscribers.write().insert(
            id,
            Subscriber {
                sender,
                filter,
                dropped: dropped.clone(),
            },
        );

        debug!(subscriber = %id, "New event subscriber");
        (id, EventStream { receiver, dropped })
    }

    /// Remove a subscriber; its stream ends once the queue drains.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers.write().remove(&id).is_some() {
            debug!(subscriber = %id, "Unsubscribed");
        }
    }

    /// Drop every subscriber, closing all streams with end-of-sequence.
    pub fn shutdown(&self) {
        let count = {
            let mut subscribers = self.subscribers.write();
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        if count > 0 {
            debug!(subscribers = count, "Event bus drained at shutdown");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped_total.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Receiving half of a subscription.
///
/// Yields events that passed the subscription filter, in publish order.
/// Ends when the subscriber is unsubscribed or the bus shuts down.
pub struct EventStream {
    receiver: mpsc::Receiver<ResourceEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// Receive the next event; `None` means the subscription ended.
    pub async fn recv(&mut self) -> Option<ResourceEvent> {
        self.receiver.recv().await
    }

    /// How many events were dropped for this subscriber so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl futures::Stream for EventStream {
    type Item = ResourceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use chrono::Utc;
    use serde_json::Value;

    fn event(event_type: EventType, resource_id: i64, type_name: &str) -> ResourceEvent {
        ResourceEvent {
            event_type,
            resource_id,
            resource_name: format!("r{resource_id}"),
            resource_type_name: type_name.to_string(),
            resource_type_version: "v1".to_string(),
            resource_data: Value::Null,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn events_reach_subscribers_in_publish_order() {
        let bus = EventBus::default();
        let (_, mut stream) = bus.subscribe(None);

        for i in 0..10 {
            bus.publish(&event(EventType::Created, i, "Bucket"));
        }

        for i in 0..10 {
            let received = stream.recv().await.unwrap();
            assert_eq!(received.resource_id, i);
        }
    }

    #[tokio::test]
    async fn filters_run_on_the_publisher_side() {
        let bus = EventBus::new(2);
        let (_, mut stream) =
            bus.subscribe(Some(Box::new(|e| e.resource_type_name == "Bucket")));

        // Uninteresting events must not occupy queue slots.
        for i in 0..100 {
            bus.publish(&event(EventType::Created, i, "Queue"));
        }
        bus.publish(&event(EventType::Created, 777, "Bucket"));

        assert_eq!(stream.recv().await.unwrap().resource_id, 777);
        assert_eq!(stream.dropped(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_and_counts_without_blocking() {
        let bus = EventBus::new(4);
        let (_, mut slow) = bus.subscribe(None);
        let (_, mut fast) = bus.subscribe(None);

        // Fast subscriber drains concurrently; slow one never reads.
        let drain = tokio::spawn(async move {
            let mut seen = 0u64;
            let mut last = -1i64;
            while let Some(e) = fast.recv().await {
                assert!(e.resource_id > last, "events must arrive in order");
                last = e.resource_id;
                seen += 1;
                if seen == 64 {
                    break;
                }
            }
            seen
        });

        for i in 0..64 {
            bus.publish(&event(EventType::Modified, i, "Bucket"));
            tokio::task::yield_now().await;
        }

        assert_eq!(drain.await.unwrap(), 64);

        // The slow queue holds only its capacity; the rest were dropped.
        let mut received = 0u64;
        while slow.receiver.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);
        assert_eq!(slow.dropped(), 60);
        assert_eq!(bus.stats().dropped, 60);
    }

    #[tokio::test]
    async fn unsubscribe_ends_the_stream() {
        let bus = EventBus::default();
        let (id, mut stream) = bus.subscribe(None);
        bus.publish(&event(EventType::Created, 1, "Bucket"));
        bus.unsubscribe(id);

        // Already-queued event is still delivered, then end-of-sequence.
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_every_stream() {
        let bus = EventBus::default();
        let (_, mut a) = bus.subscribe(None);
        let (_, mut b) = bus.subscribe(None);
        bus.shutdown();
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn publishing_to_closed_subscriber_cleans_it_up() {
        let bus = EventBus::default();
        let (_, stream) = bus.subscribe(None);
        drop(stream);
        bus.publish(&event(EventType::Deleted, 1, "Bucket"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
