//! Snapshot notification bus.
//!
//! Each subscriber owns an unbounded channel receiver. The engine publishes
//! once per committed transaction, always a full immutable snapshot, so a
//! subscriber only ever replaces its view and never patches it.
//!
//! Dropping a [`Subscription`] unsubscribes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

struct BusInner<T> {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<T>>,
}

fn lock<T>(inner: &Mutex<BusInner<T>>) -> MutexGuard<'_, BusInner<T>> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fan-out of values to any number of subscribers.
pub struct NotificationBus<T> {
    inner: Arc<Mutex<BusInner<T>>>,
}

impl<T: Clone> NotificationBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                subscribers: HashMap::new(),
            })),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);

        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `value` to every live subscriber. Returns how many got it.
    pub fn publish(&self, value: T) -> usize {
        let mut inner = lock(&self.inner);
        inner
            .subscribers
            .retain(|_, tx| tx.send(value.clone()).is_ok());
        inner.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    /// Disconnect every subscriber; their receivers see end-of-stream.
    pub fn close(&self) {
        lock(&self.inner).subscribers.clear();
    }
}

impl<T: Clone> Default for NotificationBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation handle and receiving end of one subscription.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    bus: Weak<Mutex<BusInner<T>>>,
}

impl<T> Subscription<T> {
    /// Next notification, waiting for it. `None` once the bus closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next notification if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drain everything queued and keep only the newest value.
    pub fn latest(&mut self) -> Option<T> {
        let mut last = None;
        while let Ok(value) = self.rx.try_recv() {
            last = Some(value);
        }
        last
    }

    /// Number of queued notifications.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Explicitly unsubscribe.
    pub fn cancel(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            lock(&inner).subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = NotificationBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(7u32), 2);
        assert_eq!(a.try_recv(), Some(7));
        assert_eq!(b.try_recv(), Some(7));
        assert_eq!(a.try_recv(), None);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus: NotificationBus<u32> = NotificationBus::new();
        let a = bus.subscribe();
        let _b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(a);
        assert_eq!(bus.subscriber_count(), 1);

        let c = bus.subscribe();
        c.cancel();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_latest_keeps_newest() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe();
        bus.publish(1u32);
        bus.publish(2u32);
        bus.publish(3u32);

        assert_eq!(sub.pending(), 3);
        assert_eq!(sub.latest(), Some(3));
        assert_eq!(sub.pending(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let bus: NotificationBus<u32> = NotificationBus::new();
        let mut sub = bus.subscribe();
        bus.close();
        assert_eq!(sub.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe();
        bus.publish(5u32);
        drop(bus);
        assert_eq!(sub.try_recv(), Some(5));
        drop(sub);
    }
}
