//! Pending-message queue shared by producers and the dispatch loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Unbounded FIFO mailbox: many producers push, one consumer peeks and pops.
///
/// The length is mirrored into an atomic so emptiness checks never touch
/// the lock. No lock is held across an await point; every operation takes
/// and releases the mutex inside a single call.
#[derive(Debug)]
pub struct PendingQueue<T> {
    items: Mutex<VecDeque<T>>,
    len: AtomicUsize,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Appends an item and returns the queue depth after the append.
    pub fn push(&self, item: T) -> usize {
        let mut items = self.lock();
        items.push_back(item);
        let depth = items.len();
        self.len.store(depth, Ordering::Release);
        depth
    }

    /// Removes and returns the oldest item.
    pub fn pop(&self) -> Option<T> {
        let mut items = self.lock();
        let item = items.pop_front();
        self.len.store(items.len(), Ordering::Release);
        item
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    // A panicking producer cannot leave the deque half-updated, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> PendingQueue<T> {
    /// Returns a copy of the oldest item, leaving it at the head.
    pub fn peek(&self) -> Option<T> {
        self.lock().front().cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn preserves_insertion_order() {
        let queue = PendingQueue::new();
        for i in 0..5 {
            queue.push(i);
        }

        assert_eq!(queue.len(), 5);
        let drained: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn peek_keeps_the_head_in_place() {
        let queue = PendingQueue::new();
        queue.push("first");
        queue.push("second");

        assert_eq!(queue.peek(), Some("first"));
        assert_eq!(queue.peek(), Some("first"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some("first"));
        assert_eq!(queue.peek(), Some("second"));
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let queue: PendingQueue<u8> = PendingQueue::default();
        assert!(queue.is_empty());
        assert_eq!(queue.peek(), None);
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn concurrent_producers_keep_their_own_order() {
        let queue = Arc::new(PendingQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for seq in 0..250 {
                        queue.push((producer, seq));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(queue.len(), 1000);
        let mut last_seen = [None; 4];
        while let Some((producer, seq)) = queue.pop() {
            if let Some(previous) = last_seen[producer] {
                assert!(seq > previous, "producer {producer} reordered");
            }
            last_seen[producer] = Some(seq);
        }
        assert_eq!(last_seen, [Some(249); 4]);
    }
}
