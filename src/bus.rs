use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A single consumer's bounded, drop-oldest queue. `publish` never blocks;
/// on overflow the oldest queued item is evicted and `drops` is
/// incremented, matching spec.md 4.D's "producers never block, slow
/// consumers drop" contract. Grounded in the teacher's `SensorState`
/// (`Arc<RwLock<VecDeque<_>>>` with a manual length-check-then-pop_front in
/// `main.rs`), generalized into one reusable type per the "one canonical
/// implementation" note in spec.md 9.
struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    drops: std::sync::atomic::AtomicU64,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            drops: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn push(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            items.pop_front();
            self.drops
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
    }

    fn drop_count(&self) -> u64 {
        self.drops.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// The consumer-side handle returned by `Bus::subscribe`. Holds only the
/// reader end of its `BoundedQueue`; the bus itself owns the writer side,
/// per spec.md 9's ownership note ("consumers hold only the reader end").
pub struct Subscriber<T> {
    queue: Arc<BoundedQueue<T>>,
}

impl<T> Subscriber<T> {
    /// Drain everything currently queued, in FIFO order. Non-blocking.
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.queue.items.lock();
        items.drain(..).collect()
    }

    /// Wait until at least one item is available, then drain. Used by
    /// filter workers so they don't busy-poll; a `tokio::select!` against
    /// the stop signal keeps this responsive to shutdown.
    pub async fn recv_batch(&self) -> Vec<T> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let items = self.queue.items.lock();
                if !items.is_empty() {
                    drop(items);
                    return self.drain();
                }
            }
            notified.await;
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.queue.drop_count()
    }
}

/// Fans a stream of `T` out to N independent consumers, each with its own
/// bounded, drop-oldest queue. Per-producer FIFO to each consumer is
/// preserved; there is no cross-producer ordering guarantee (spec.md 4.D) —
/// consumers must use timestamps as the sole ordering truth when a `Bus<T>`
/// is fed by more than one producer.
pub struct Bus<T> {
    consumers: Mutex<Vec<Arc<BoundedQueue<T>>>>,
    default_capacity: usize,
}

impl<T> Bus<T> {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            consumers: Mutex::new(Vec::new()),
            default_capacity,
        }
    }

    /// Register a new consumer with its own capacity (defaults to the
    /// bus's `default_capacity` when `capacity` is `None`).
    pub fn subscribe(&self, capacity: Option<usize>) -> Subscriber<T>
    where
        T: Send + 'static,
    {
        let queue = Arc::new(BoundedQueue::new(capacity.unwrap_or(self.default_capacity)));
        self.consumers.lock().push(queue.clone());
        Subscriber { queue }
    }
}

impl<T: Clone> Bus<T> {
    /// Replicate `item` into every subscribed consumer's queue. Never
    /// blocks; a full consumer queue drops its oldest element.
    pub fn publish(&self, item: T) {
        let consumers = self.consumers.lock();
        for consumer in consumers.iter() {
            consumer.push(item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest_on_overflow_evicts_exactly_one() {
        let bus: Bus<u32> = Bus::new(3);
        let sub = bus.subscribe(None);
        bus.publish(1);
        bus.publish(2);
        bus.publish(3);
        bus.publish(4); // overflow: 1 should be dropped

        let drained = sub.drain();
        assert_eq!(drained, vec![2, 3, 4]);
        assert_eq!(sub.drop_count(), 1);
    }

    #[test]
    fn independent_consumers_each_get_every_item() {
        let bus: Bus<u32> = Bus::new(10);
        let sub_a = bus.subscribe(None);
        let sub_b = bus.subscribe(Some(2));

        bus.publish(1);
        bus.publish(2);
        bus.publish(3);

        assert_eq!(sub_a.drain(), vec![1, 2, 3]);
        // sub_b has capacity 2: 1 is dropped, one eviction recorded.
        assert_eq!(sub_b.drain(), vec![2, 3]);
        assert_eq!(sub_b.drop_count(), 1);
    }

    #[tokio::test]
    async fn recv_batch_wakes_on_publish() {
        let bus: Bus<u32> = Bus::new(10);
        let sub = bus.subscribe(None);
        bus.publish(42);
        let batch = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv_batch())
            .await
            .expect("recv_batch should not time out");
        assert_eq!(batch, vec![42]);
    }
}
