//! Publish/subscribe wrapper over [`BlockingQueue`] with poison-pill shutdown.
//!
//! Producers bracket their lifetime with `publish`/`unpublish`, consumers
//! with `subscribe`/`unsubscribe`. When the last publisher leaves it drops a
//! single [`Signal::Poison`] into the queue. Every consumer that pops the
//! poison puts it back at the front before exiting, so each remaining
//! subscriber sees it exactly once and the pill is never lost.

use super::BlockingQueue;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Item travelling through a [`BroadcastQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal<T> {
    /// Regular work item.
    Message(T),
    /// Shutdown marker relayed between consumers.
    Poison,
}

/// Broadcast-shutdown queue.
pub struct BroadcastQueue<T> {
    queue: Arc<BlockingQueue<Signal<T>>>,
    alive: AtomicBool,
    publishers: AtomicU32,
    subscribers: AtomicU32,
}

impl<T> BroadcastQueue<T> {
    /// Wrap an existing queue.
    pub fn new(queue: Arc<BlockingQueue<Signal<T>>>) -> Self {
        Self {
            queue,
            alive: AtomicBool::new(true),
            publishers: AtomicU32::new(0),
            subscribers: AtomicU32::new(0),
        }
    }

    /// Create a wrapper around a fresh queue of the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(Arc::new(BlockingQueue::new(capacity)))
    }

    /// The underlying queue.
    #[cfg(test)]
    pub fn queue(&self) -> &Arc<BlockingQueue<Signal<T>>> {
        &self.queue
    }

    /// Register a producer. Must happen before that producer pushes.
    pub fn publish(&self) {
        self.publishers.fetch_add(1, Ordering::AcqRel);
    }

    /// Deregister a producer.
    ///
    /// If this was the last publisher and `send_poison` is set, a poison
    /// item is queued and the queue is marked dead. Returns whether the
    /// poison was sent. Publishing again afterwards is not supported.
    pub fn unpublish(&self, send_poison: bool) -> bool {
        let previous = self.publishers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unpublish without matching publish");
        if previous == 1 && send_poison {
            self.alive.store(false, Ordering::Release);
            self.queue.push_back_force(Signal::Poison);
            return true;
        }
        false
    }

    /// Register a consumer.
    pub fn subscribe(&self) {
        self.subscribers.fetch_add(1, Ordering::AcqRel);
    }

    /// Deregister a consumer.
    pub fn unsubscribe(&self) {
        self.subscribers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Queue a message, blocking while the queue is full.
    pub fn push(&self, item: T) {
        debug_assert!(self.publishers() > 0, "push from an unpublished producer");
        self.queue.push_back(Signal::Message(item));
    }

    /// Queue a message regardless of capacity.
    pub fn push_force(&self, item: T) {
        self.queue.push_back_force(Signal::Message(item));
    }

    /// Take the next signal, blocking while the queue is empty.
    pub fn pop(&self) -> Signal<T> {
        self.queue.pop_back()
    }

    /// Put a consumed poison back for the next subscriber.
    pub fn relay_poison(&self) {
        self.queue.push_front_force(Signal::Poison);
    }

    /// False once the last publisher has sent the poison.
    #[cfg(test)]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Current number of publishers.
    pub fn publishers(&self) -> u32 {
        self.publishers.load(Ordering::Acquire)
    }

    /// Current number of subscribers.
    #[cfg(test)]
    pub fn subscribers(&self) -> u32 {
        self.subscribers.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_only_last_publisher_poisons() {
        let q: BroadcastQueue<u32> = BroadcastQueue::with_capacity(0);
        q.publish();
        q.publish();
        assert_eq!(q.publishers(), 2);

        assert!(!q.unpublish(true));
        assert!(q.is_alive());
        assert!(q.queue().is_empty());

        assert!(q.unpublish(true));
        assert!(!q.is_alive());
        assert_eq!(q.pop(), Signal::Poison);
    }

    #[test]
    fn test_unpublish_without_poison() {
        let q: BroadcastQueue<u32> = BroadcastQueue::with_capacity(0);
        q.publish();
        assert!(!q.unpublish(false));
        assert!(q.is_alive());
        assert!(q.queue().is_empty());
    }

    #[test]
    fn test_poison_reaches_every_subscriber_once() {
        const WORKERS: usize = 6;
        let q = Arc::new(BroadcastQueue::with_capacity(2));
        let processed = Arc::new(AtomicUsize::new(0));
        let poisoned = Arc::new(AtomicUsize::new(0));
        q.publish();

        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let q = Arc::clone(&q);
                let processed = Arc::clone(&processed);
                let poisoned = Arc::clone(&poisoned);
                q.subscribe();
                thread::spawn(move || loop {
                    match q.pop() {
                        Signal::Message(_) => {
                            processed.fetch_add(1, Ordering::SeqCst);
                        }
                        Signal::Poison => {
                            poisoned.fetch_add(1, Ordering::SeqCst);
                            q.unsubscribe();
                            q.relay_poison();
                            break;
                        }
                    }
                })
            })
            .collect();

        for i in 0..100u32 {
            q.push(i);
        }
        assert!(q.unpublish(true));

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(processed.load(Ordering::SeqCst), 100);
        assert_eq!(poisoned.load(Ordering::SeqCst), WORKERS);
        assert_eq!(q.subscribers(), 0);
        // The pill is relayed, never consumed.
        assert_eq!(q.queue().len(), 1);
        assert_eq!(q.pop(), Signal::Poison);
    }
}
