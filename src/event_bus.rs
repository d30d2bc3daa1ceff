//! Event Bus (C12).
//!
//! Topic-keyed publish/subscribe. Delivery is synchronous on publish
//! when a topic's subscriber list is small (< `sync_threshold`,
//! default 32); above that, each subscriber gets its own bounded,
//! drop-oldest queue drained by a background task, so one slow
//! subscriber never blocks the publisher or its peers. No ordering is
//! guaranteed across topics, and subscribers are expected to be
//! idempotent (`spec.md §4.12`) since a dropped or redelivered message
//! is an accepted cost of best-effort delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};

use crate::types::Event;

pub type SubscriptionId = u64;

/// A topic subscriber. Implementors should be cheap and non-blocking;
/// the synchronous delivery path calls this directly on the publisher's
/// task.
pub trait Subscriber: Send + Sync {
    fn handle(&self, topic: &str, event: &Event);
}

/// Adapts a plain closure into a [`Subscriber`], for callers that don't
/// want to name a type.
pub struct FnSubscriber<F>(F);

impl<F> FnSubscriber<F>
where
    F: Fn(&str, &Event) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnSubscriber(f)
    }
}

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&str, &Event) + Send + Sync,
{
    fn handle(&self, topic: &str, event: &Event) {
        (self.0)(topic, event)
    }
}

/// A bounded, drop-oldest queue feeding one subscriber's background
/// delivery task. Built on `Notify` rather than `tokio::sync::mpsc`
/// because `mpsc` has no way to evict the oldest queued item on
/// overflow; this crate's drop-oldest requirement needs that.
struct DropOldestQueue {
    capacity: usize,
    items: Mutex<std::collections::VecDeque<Event>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl DropOldestQueue {
    fn new(capacity: usize) -> Self {
        DropOldestQueue {
            capacity,
            items: Mutex::new(std::collections::VecDeque::new()),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn push(&self, event: Event) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(event);
        drop(items);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Event> {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(event) = items.pop_front() {
                    return Some(event);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

struct Registration {
    id: SubscriptionId,
    subscriber: Arc<dyn Subscriber>,
    queue: Option<Arc<DropOldestQueue>>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

pub struct EventBus {
    sync_threshold: usize,
    queue_capacity: usize,
    topics: RwLock<HashMap<String, Vec<Registration>>>,
    seq: AtomicU64,
}

impl EventBus {
    pub fn new(sync_threshold: usize, queue_capacity: usize) -> Self {
        EventBus {
            sync_threshold,
            queue_capacity,
            topics: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Subscribes `subscriber` to `topic`. Whether delivery is
    /// synchronous or queued is decided per-publish from the topic's
    /// current subscriber count, not fixed at subscribe time.
    pub async fn subscribe(&self, topic: impl Into<String>, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        let id = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut topics = self.topics.write().await;
        topics.entry(topic.into()).or_default().push(Registration {
            id,
            subscriber,
            queue: None,
            worker: None,
        });
        id
    }

    pub async fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let mut topics = self.topics.write().await;
        if let Some(registrations) = topics.get_mut(topic) {
            if let Some(pos) = registrations.iter().position(|r| r.id == id) {
                let registration = registrations.remove(pos);
                if let Some(queue) = &registration.queue {
                    queue.close();
                }
                if let Some(worker) = registration.worker {
                    worker.abort();
                }
            }
        }
    }

    /// Publishes `event` on `topic`. Below `sync_threshold` subscribers,
    /// every handler runs inline on the caller's task, in registration
    /// order. At or above it, the event is pushed onto each
    /// subscriber's drop-oldest queue and a background task (spawned
    /// lazily, once per subscriber) drains it.
    pub async fn publish(&self, topic: &str, event: Event) {
        let mut topics = self.topics.write().await;
        let Some(registrations) = topics.get_mut(topic) else {
            return;
        };
        if registrations.is_empty() {
            return;
        }

        if registrations.len() < self.sync_threshold {
            for registration in registrations.iter() {
                registration.subscriber.handle(topic, &event);
            }
            return;
        }

        for registration in registrations.iter_mut() {
            if registration.queue.is_none() {
                let queue = Arc::new(DropOldestQueue::new(self.queue_capacity));
                let subscriber = registration.subscriber.clone();
                let worker_queue = queue.clone();
                let topic_owned = topic.to_string();
                let worker = tokio::spawn(async move {
                    while let Some(event) = worker_queue.pop().await {
                        subscriber.handle(&topic_owned, &event);
                    }
                });
                registration.queue = Some(queue);
                registration.worker = Some(worker);
            }
            registration.queue.as_ref().unwrap().push(event.clone()).await;
        }
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().await.get(topic).map(|r| r.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct Recorder(Arc<StdMutex<Vec<String>>>);

    impl Subscriber for Recorder {
        fn handle(&self, topic: &str, event: &Event) {
            self.0.lock().unwrap().push(format!("{topic}:{}", event.kind));
        }
    }

    #[tokio::test]
    async fn synchronous_delivery_below_threshold() {
        let bus = EventBus::new(32, 16);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe("combat", Arc::new(Recorder(seen.clone()))).await;
        bus.publish("combat", Event::new("attack", None)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["combat:attack"]);
    }

    #[tokio::test]
    async fn unsubscribed_topics_are_dropped_silently() {
        let bus = EventBus::new(32, 16);
        bus.publish("nobody-listening", Event::new("move", None)).await;
    }

    #[tokio::test]
    async fn queued_delivery_at_or_above_threshold() {
        let bus = EventBus::new(1, 16);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe("combat", Arc::new(Recorder(seen.clone()))).await;
        bus.subscribe("combat", Arc::new(Recorder(seen.clone()))).await;
        bus.publish("combat", Event::new("attack", None)).await;

        for _ in 0..50 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn drop_oldest_queue_evicts_under_pressure() {
        let queue = DropOldestQueue::new(2);
        queue.push(Event::new("a", None)).await;
        queue.push(Event::new("b", None)).await;
        queue.push(Event::new("c", None)).await;
        let first = queue.pop().await.unwrap();
        let second = queue.pop().await.unwrap();
        assert_eq!(first.kind, "b");
        assert_eq!(second.kind, "c");
    }
}
