//! Bounded queue with backpressure for the replay pipeline.
//!
//! Uses `crossbeam-queue::ArrayQueue` for a lock-free, bounded queue.
//! When the queue is full, `try_push` returns the item back to the caller
//! to signal backpressure; the reader stage turns that into a counted
//! retry rather than unbounded buffering.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;

/// Sleep slice while spinning on a full or empty queue.
const SPIN_SLEEP: Duration = Duration::from_millis(1);

/// Result of attempting to push to a full queue.
#[derive(Debug)]
pub enum PushResult<T> {
    /// Item was successfully enqueued.
    Ok,
    /// Queue is full. Returns the item for the caller to handle.
    Backpressure(T),
}

/// A bounded, lock-free queue with backpressure signaling.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: ArrayQueue<T>,
}

impl<T> BoundedQueue<T> {
    /// Creates a new bounded queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Attempts to push an item onto the queue.
    pub fn try_push(&self, item: T) -> PushResult<T> {
        match self.inner.push(item) {
            Ok(()) => PushResult::Ok,
            Err(item) => PushResult::Backpressure(item),
        }
    }

    /// Attempts to pop an item from the queue.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Pops an item, sleeping in small slices for up to `timeout`.
    pub fn pop_wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.inner.pop() {
                return Some(item);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(SPIN_SLEEP);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_push_pop() {
        let q = BoundedQueue::new(3);
        assert!(matches!(q.try_push(1), PushResult::Ok));
        assert!(matches!(q.try_push(2), PushResult::Ok));
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn backpressure_when_full() {
        let q = BoundedQueue::new(2);
        assert!(matches!(q.try_push(1), PushResult::Ok));
        assert!(matches!(q.try_push(2), PushResult::Ok));
        match q.try_push(3) {
            PushResult::Backpressure(v) => assert_eq!(v, 3),
            PushResult::Ok => panic!("expected backpressure"),
        }
    }

    #[test]
    fn pop_wait_times_out_empty() {
        let q: BoundedQueue<i32> = BoundedQueue::new(2);
        assert_eq!(q.pop_wait(Duration::from_millis(10)), None);
    }

    #[test]
    fn pop_wait_returns_produced_item() {
        use std::sync::Arc;
        let q = Arc::new(BoundedQueue::new(2));
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                let _ = q.try_push(7);
            })
        };
        assert_eq!(q.pop_wait(Duration::from_secs(1)), Some(7));
        producer.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "queue capacity must be positive")]
    fn zero_capacity_panics() {
        let _q: BoundedQueue<i32> = BoundedQueue::new(0);
    }
}
