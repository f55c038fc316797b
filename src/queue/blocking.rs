//! Blocking double-ended queue with optional capacity.
//!
//! Producers block while the queue is full (capacity 0 means unbounded),
//! consumers block while it is empty. The `*_force` pushes ignore capacity
//! and are meant for control items that must never wait.

#![allow(dead_code)] // Front/batch operations are part of the queue API but unused by the servers

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct State<T> {
    items: VecDeque<T>,
    /// Consumers currently parked in `pop_*_n`.
    batch_waiters: usize,
}

/// Thread-safe double-ended queue with capacity-based backpressure.
pub struct BlockingQueue<T> {
    state: Mutex<State<T>>,
    /// Signalled when items are added.
    published: Condvar,
    /// Signalled when items are removed.
    received: Condvar,
    capacity: usize,
}

impl<T> BlockingQueue<T> {
    /// Create a queue holding at most `capacity` items (0 = unbounded).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                batch_waiters: 0,
            }),
            published: Condvar::new(),
            received: Condvar::new(),
            capacity,
        }
    }

    /// Create a queue that never blocks producers.
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Append an item, blocking while the queue is full.
    pub fn push_back(&self, item: T) {
        self.push(item, false, true);
    }

    /// Prepend an item, blocking while the queue is full.
    pub fn push_front(&self, item: T) {
        self.push(item, true, true);
    }

    /// Append an item regardless of capacity.
    pub fn push_back_force(&self, item: T) {
        self.push(item, false, false);
    }

    /// Prepend an item regardless of capacity.
    pub fn push_front_force(&self, item: T) {
        self.push(item, true, false);
    }

    /// Remove the first item, blocking while the queue is empty.
    pub fn pop_front(&self) -> T {
        self.pop(true)
    }

    /// Remove the last item, blocking while the queue is empty.
    pub fn pop_back(&self) -> T {
        self.pop(false)
    }

    /// Remove the first `n` items at once, in queue order.
    ///
    /// Blocks until at least `n` items are queued. A bounded queue only
    /// reaches more than `capacity` items through the `*_force` pushes.
    pub fn pop_front_n(&self, n: usize) -> Vec<T> {
        self.pop_n(n, true)
    }

    /// Remove the last `n` items at once, in queue order.
    ///
    /// Blocks until at least `n` items are queued.
    pub fn pop_back_n(&self, n: usize) -> Vec<T> {
        self.pop_n(n, false)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Maximum number of items (0 = unbounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn push(&self, item: T, front: bool, respect_capacity: bool) {
        let capacity = self.capacity;
        let mut state = self.state.lock();
        if respect_capacity && capacity > 0 {
            self.received
                .wait_while(&mut state, |s| s.items.len() >= capacity);
        }
        if front {
            state.items.push_front(item);
        } else {
            state.items.push_back(item);
        }
        // A single wake could land on a batch consumer that still lacks
        // items while a plain consumer keeps sleeping.
        let wake_all = state.batch_waiters > 0;
        drop(state);
        if wake_all {
            self.published.notify_all();
        } else {
            self.published.notify_one();
        }
    }

    fn pop(&self, front: bool) -> T {
        let mut state = self.state.lock();
        let item = loop {
            let next = if front {
                state.items.pop_front()
            } else {
                state.items.pop_back()
            };
            match next {
                Some(item) => break item,
                None => self.published.wait(&mut state),
            }
        };
        drop(state);
        self.received.notify_one();
        item
    }

    fn pop_n(&self, n: usize, front: bool) -> Vec<T> {
        if n == 0 {
            return Vec::new();
        }

        let mut state = self.state.lock();
        state.batch_waiters += 1;
        self.published.wait_while(&mut state, |s| s.items.len() < n);
        state.batch_waiters -= 1;

        let batch: Vec<T> = if front {
            state.items.drain(..n).collect()
        } else {
            let start = state.items.len() - n;
            state.items.drain(start..).collect()
        };
        drop(state);
        self.received.notify_all();
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_deque_order() {
        let q = BlockingQueue::unbounded();
        q.push_back(2);
        q.push_back(3);
        q.push_front(1);

        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_front(), 1);
        assert_eq!(q.pop_back(), 3);
        assert_eq!(q.pop_back(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_pop_n_preserves_order() {
        let q = BlockingQueue::unbounded();
        for i in 0..6 {
            q.push_back(i);
        }

        assert_eq!(q.pop_front_n(2), vec![0, 1]);
        assert_eq!(q.pop_back_n(3), vec![3, 4, 5]);
        assert_eq!(q.pop_front_n(0), Vec::<i32>::new());
        assert_eq!(q.pop_front(), 2);
    }

    #[test]
    fn test_push_blocks_at_capacity() {
        let q = Arc::new(BlockingQueue::new(1));
        let pushed = Arc::new(AtomicBool::new(false));
        q.push_back(1);

        let handle = {
            let q = Arc::clone(&q);
            let pushed = Arc::clone(&pushed);
            thread::spawn(move || {
                q.push_back(2);
                pushed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!pushed.load(Ordering::SeqCst));

        assert_eq!(q.pop_front(), 1);
        handle.join().unwrap();
        assert!(pushed.load(Ordering::SeqCst));
        assert_eq!(q.pop_front(), 2);
    }

    #[test]
    fn test_force_push_ignores_capacity() {
        let q = BlockingQueue::new(1);
        q.push_back(1);
        q.push_back_force(2);
        q.push_front_force(0);

        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_front(), 0);
        assert_eq!(q.pop_front(), 1);
        assert_eq!(q.pop_front(), 2);
    }

    #[test]
    fn test_batch_larger_than_capacity() {
        let q = BlockingQueue::new(1);
        q.push_back(1);
        q.push_back_force(2);
        q.push_back_force(3);

        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_front_n(3), vec![1, 2, 3]);
        assert!(q.is_empty());

        q.push_back(4);
        q.push_back_force(5);
        assert_eq!(q.pop_back_n(2), vec![4, 5]);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let q = Arc::new(BlockingQueue::unbounded());
        let handle = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop_front())
        };

        thread::sleep(Duration::from_millis(20));
        q.push_back(7u32);
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn test_batch_and_single_consumers_both_wake() {
        let q = Arc::new(BlockingQueue::unbounded());
        let batch = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop_front_n(3))
        };
        let single = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop_back())
        };

        thread::sleep(Duration::from_millis(20));
        for i in 0..4 {
            q.push_back(i);
        }

        let mut taken = batch.join().unwrap();
        taken.push(single.join().unwrap());
        taken.sort_unstable();
        assert_eq!(taken, vec![0, 1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_many_producers_many_consumers() {
        let q = Arc::new(BlockingQueue::new(4));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..250 {
                        q.push_back(p * 1000 + i);
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || (0..250).map(|_| q.pop_front()).collect::<Vec<_>>())
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let mut all: Vec<i32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        let mut expected: Vec<i32> = (0..4)
            .flat_map(|p| (0..250).map(move |i| p * 1000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(all, expected);
    }

    #[derive(Debug, Clone)]
    enum Op {
        PushBack(u8),
        PushFront(u8),
        PopBack,
        PopFront,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u8>().prop_map(Op::PushBack),
            any::<u8>().prop_map(Op::PushFront),
            Just(Op::PopBack),
            Just(Op::PopFront),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_vecdeque(ops in proptest::collection::vec(op(), 0..64)) {
            let q = BlockingQueue::unbounded();
            let mut model = VecDeque::new();
            for op in ops {
                match op {
                    Op::PushBack(v) => { q.push_back(v); model.push_back(v); }
                    Op::PushFront(v) => { q.push_front(v); model.push_front(v); }
                    // Only pop when the model says an item exists, so nothing blocks.
                    Op::PopBack => if let Some(v) = model.pop_back() {
                        prop_assert_eq!(q.pop_back(), v);
                    },
                    Op::PopFront => if let Some(v) = model.pop_front() {
                        prop_assert_eq!(q.pop_front(), v);
                    },
                }
                prop_assert_eq!(q.len(), model.len());
            }
        }
    }
}
