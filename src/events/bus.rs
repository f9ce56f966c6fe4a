//! ST-010: In-process event bus.
//!
//! Publishing never blocks. Each subscriber owns a bounded queue; when it is
//! full the event is dropped for that subscriber and counted, both on the
//! subscription and on the bus.

use super::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct Subscriber {
    id: u64,
    prefix: String,
    sender: SyncSender<Event>,
    dropped: Arc<AtomicU64>,
}

type Registry = Mutex<Vec<Subscriber>>;

/// Snapshot of bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

pub struct EventBus {
    registry: Arc<Registry>,
    next_id: AtomicU64,
    counters: Counters,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(registry: &Registry) -> MutexGuard<'_, Vec<Subscriber>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// Subscribe to every event whose category starts with `prefix`
    /// (`""` matches everything).
    pub fn subscribe(&self, prefix: &str, capacity: usize) -> Subscription {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        lock(&self.registry).push(Subscriber {
            id,
            prefix: prefix.to_string(),
            sender,
            dropped: Arc::clone(&dropped),
        });
        Subscription {
            receiver,
            handle: SubscriptionHandle {
                id,
                registry: Arc::downgrade(&self.registry),
                dropped,
            },
        }
    }

    /// Deliver an event to every matching subscriber without blocking.
    pub fn publish(&self, event: Event) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let category = event.category();
        let mut subscribers = lock(&self.registry);
        subscribers.retain(|sub| {
            if !category.starts_with(sub.prefix.as_str()) {
                return true;
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                // receiver gone
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Receiving end of a subscription. Dropping it cancels the subscription.
pub struct Subscription {
    receiver: Receiver<Event>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub fn receiver(&self) -> &Receiver<Event> {
        &self.receiver
    }

    /// Events queued so far, without waiting.
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }

    pub fn dropped(&self) -> u64 {
        self.handle.dropped()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Split so the receiver can move to a consumer thread while the handle
    /// stays with the owner.
    pub fn into_parts(self) -> (Receiver<Event>, SubscriptionHandle) {
        (self.receiver, self.handle)
    }
}

/// Cancels its subscription on [`cancel`](Self::cancel) or drop.
pub struct SubscriptionHandle {
    id: u64,
    registry: Weak<Registry>,
    dropped: Arc<AtomicU64>,
}

impl SubscriptionHandle {
    /// Remove the subscriber; its receiver sees disconnection once drained.
    pub fn cancel(&self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).retain(|sub| sub.id != self.id);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn compiled(task: &str) -> Event {
        Event::new(
            None,
            EventKind::TaskCompiled {
                task: task.to_string(),
                commands: 1,
            },
        )
    }

    fn started() -> Event {
        Event::new(
            Some("h"),
            EventKind::HostStarted {
                tasks: 1,
                dry_run: false,
            },
        )
    }

    #[test]
    fn test_st010_prefix_filter() {
        let bus = EventBus::new();
        let tasks = bus.subscribe("task.", 16);
        let all = bus.subscribe("", 16);
        bus.publish(compiled("a"));
        bus.publish(started());
        assert_eq!(tasks.drain().len(), 1);
        assert_eq!(all.drain().len(), 2);
    }

    #[test]
    fn test_st010_full_queue_drops_and_counts() {
        let bus = EventBus::new();
        let sub = bus.subscribe("", 2);
        for i in 0..5 {
            bus.publish(compiled(&format!("t{i}")));
        }
        assert_eq!(sub.dropped(), 3);
        let stats = bus.stats();
        assert_eq!(stats.published, 5);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dropped, 3);
        let got = sub.drain();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_st010_drop_cancels() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe("", 4);
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(started());
        assert_eq!(bus.stats().delivered, 0);
    }

    #[test]
    fn test_st010_cancel_disconnects_receiver() {
        let bus = EventBus::new();
        let (rx, handle) = bus.subscribe("host.", 4).into_parts();
        bus.publish(started());
        handle.cancel();
        bus.publish(started());
        let got: Vec<_> = rx.iter().collect();
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn test_st010_dropped_receiver_is_pruned() {
        let bus = EventBus::new();
        let (rx, handle) = bus.subscribe("", 4).into_parts();
        drop(rx);
        bus.publish(started());
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(handle.dropped(), 0);
    }

    #[test]
    fn test_st010_handle_outlives_bus() {
        let sub = {
            let bus = EventBus::new();
            bus.subscribe("", 1)
        };
        sub.cancel();
        assert_eq!(sub.dropped(), 0);
    }
}
