//! Memory-bounded FIFO between record delegation and the drainers.
//!
//! Pushers block while the queue holds more than its byte capacity. Poppers
//! free memory but only wake blocked pushers once at least `notify_delta`
//! bytes have been freed since the last wakeup, so a stream of small records
//! cannot starve a large one waiting for room.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[derive(Debug)]
struct State<T> {
    items: VecDeque<(T, usize)>,
    used_bytes: usize,
    freed_since_notify: usize,
}

/// Bounded, memory-accounted FIFO.
#[derive(Debug)]
pub struct MemoryBoundedQueue<T> {
    capacity: usize,
    notify_delta: usize,
    state: Mutex<State<T>>,
    space_available: Notify,
    items_available: Notify,
}

impl<T> MemoryBoundedQueue<T> {
    /// Create a queue holding up to `capacity` accounted bytes.
    ///
    /// # Panics
    ///
    /// Panics if `notify_delta >= capacity`; pushers waiting for more room
    /// than will ever be signalled would block forever.
    pub fn new(capacity: usize, notify_delta: usize) -> Self {
        assert!(
            notify_delta < capacity,
            "notify delta {notify_delta} must be below capacity {capacity}"
        );
        Self {
            capacity,
            notify_delta,
            state: Mutex::new(State {
                items: VecDeque::new(),
                used_bytes: 0,
                freed_since_notify: 0,
            }),
            space_available: Notify::new(),
            items_available: Notify::new(),
        }
    }

    /// Append `item`, blocking while the queue is over capacity. Items larger
    /// than the whole capacity are admitted alone.
    pub async fn push(&self, item: T, bytes: usize) {
        let bytes = bytes.min(self.capacity);
        let mut item = Some(item);
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);

            {
                let mut state = self.state.lock();
                if state.used_bytes + bytes <= self.capacity {
                    if let Some(item) = item.take() {
                        state.items.push_back((item, bytes));
                        state.used_bytes += bytes;
                    }
                    drop(state);
                    self.items_available.notify_one();
                    return;
                }
            }

            notified.await;
        }
    }

    /// Remove the oldest item, waiting for one if the queue is empty.
    pub async fn pop(&self) -> (T, usize) {
        loop {
            let notified = self.items_available.notified();
            tokio::pin!(notified);

            {
                let mut state = self.state.lock();
                if let Some((item, bytes)) = state.items.pop_front() {
                    state.used_bytes -= bytes;
                    state.freed_since_notify += bytes;
                    let wake = state.freed_since_notify >= self.notify_delta;
                    if wake {
                        state.freed_since_notify = 0;
                    }
                    drop(state);
                    if wake {
                        self.space_available.notify_waiters();
                    }
                    return (item, bytes);
                }
            }

            notified.await;
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Accounted bytes currently held.
    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_order() {
        let queue = MemoryBoundedQueue::new(100, 10);
        queue.push("a", 1).await;
        queue.push("b", 1).await;
        queue.push("c", 1).await;

        assert_eq!(queue.pop().await.0, "a");
        assert_eq!(queue.pop().await.0, "b");
        assert_eq!(queue.pop().await.0, "c");
        assert!(queue.is_empty());
        assert_eq!(queue.used_bytes(), 0);
    }

    #[tokio::test]
    async fn push_blocks_until_enough_freed() {
        let queue = Arc::new(MemoryBoundedQueue::new(100, 40));
        queue.push("big", 90).await;

        let blocked = Arc::clone(&queue);
        let pusher = tokio::spawn(async move { blocked.push("second", 50).await });

        // still blocked: nothing freed yet
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        // freeing 90 >= notify delta wakes the pusher
        queue.pop().await;
        tokio::time::timeout(Duration::from_secs(1), pusher)
            .await
            .expect("pusher must unblock")
            .unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn small_frees_accumulate_to_notify_delta() {
        let queue = Arc::new(MemoryBoundedQueue::new(10, 4));
        for _ in 0..10 {
            queue.push((), 1).await;
        }

        let blocked = Arc::clone(&queue);
        let pusher = tokio::spawn(async move { blocked.push((), 4).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pusher.is_finished());

        // three pops free 3 bytes: below the delta, no wakeup
        for _ in 0..3 {
            queue.pop().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pusher.is_finished());

        // the fourth pop crosses the delta
        queue.pop().await;
        tokio::time::timeout(Duration::from_secs(1), pusher)
            .await
            .expect("pusher must unblock")
            .unwrap();
    }

    #[tokio::test]
    async fn oversized_item_is_admitted_alone() {
        let queue = MemoryBoundedQueue::new(10, 4);
        queue.push("huge", 1_000_000).await;
        let (item, bytes) = queue.pop().await;
        assert_eq!(item, "huge");
        assert_eq!(bytes, 10);
    }

    #[tokio::test]
    async fn pop_waits_for_items() {
        let queue = Arc::new(MemoryBoundedQueue::<&str>::new(10, 4));
        let popper = Arc::clone(&queue);
        let handle = tokio::spawn(async move { popper.pop().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        queue.push("x", 1).await;
        let (item, _) = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("popper must wake")
            .unwrap();
        assert_eq!(item, "x");
    }

    #[test]
    #[should_panic(expected = "notify delta")]
    fn notify_delta_must_be_below_capacity() {
        MemoryBoundedQueue::<()>::new(10, 10);
    }
}
