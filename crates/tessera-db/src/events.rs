//! In-process event fan-out.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: if a
//! subscriber's queue is full the event is dropped for that subscriber only,
//! and subscribers whose receiver is gone are removed.

use crate::config::BrokerConfig;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::DocId;
use tessera_merkle::Cid;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// A store event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A local write produced a new composite head.
    Update {
        collection: String,
        doc_id: DocId,
        cid: Cid,
        priority: u64,
    },
    /// A remote block was merged.
    Merged {
        collection: String,
        doc_id: DocId,
        cid: Cid,
    },
    /// A remote block was stored but its delta could not be decoded yet.
    BlockPending { doc_id: DocId, cid: Cid },
}

impl Event {
    pub fn doc_id(&self) -> &DocId {
        match self {
            Event::Update { doc_id, .. }
            | Event::Merged { doc_id, .. }
            | Event::BlockPending { doc_id, .. } => doc_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// Receiving end of a broker subscription.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Events dropped because this subscriber's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Event> {
        async_stream::stream! {
            while let Some(event) = self.rx.recv().await {
                yield event;
            }
        }
    }
}

/// Single-process publish/subscribe.
pub struct EventBroker {
    config: BrokerConfig,
    subscribers: Mutex<BTreeMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
}

impl EventBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.lock().insert(
            id,
            Subscriber {
                tx,
                dropped: dropped.clone(),
            },
        );
        Subscription { id, rx, dropped }
    }

    /// Close a subscription; its receiver drains what is queued then ends.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().remove(&id);
    }

    /// Deliver to every subscriber without blocking. Returns how many received it.
    pub fn publish(&self, event: Event) -> usize {
        let mut subscribers = self.subscribers.lock();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, sub) in subscribers.iter() {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(subscriber = id.0, "subscriber queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            subscribers.remove(&id);
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tessera_core::Fields;

    fn event(n: u8) -> Event {
        Event::Merged {
            collection: "Users".to_string(),
            doc_id: DocId::derive("Users", &Fields::new()),
            cid: Cid::of(&[n]),
        }
    }

    #[tokio::test]
    async fn test_fanout_in_publish_order() {
        let broker = EventBroker::default();
        let mut a = broker.subscribe();
        let mut b = broker.subscribe();

        assert_eq!(broker.publish(event(1)), 2);
        assert_eq!(broker.publish(event(2)), 2);

        assert_eq!(a.recv().await, Some(event(1)));
        assert_eq!(a.recv().await, Some(event(2)));
        assert_eq!(b.recv().await, Some(event(1)));
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let broker = EventBroker::new(BrokerConfig {
            subscriber_buffer: 2,
        });
        let slow = broker.subscribe();
        let mut fast = broker.subscribe();

        for n in 0..5 {
            broker.publish(event(n));
            assert_eq!(fast.recv().await, Some(event(n)));
        }
        assert_eq!(slow.dropped(), 3);
        assert_eq!(fast.dropped(), 0);
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_removed() {
        let broker = EventBroker::default();
        let sub = broker.subscribe();
        let _keep = broker.subscribe();
        drop(sub);

        assert_eq!(broker.publish(event(0)), 1);
        assert_eq!(broker.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let broker = EventBroker::default();
        let sub = broker.subscribe();
        let id = sub.id();
        broker.publish(event(7));
        broker.unsubscribe(id);

        let events: Vec<Event> = sub.into_stream().collect().await;
        assert_eq!(events, vec![event(7)]);
    }
}
