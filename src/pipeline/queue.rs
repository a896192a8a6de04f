//! Bounded queue with drop-oldest backpressure.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Multi-producer queue that never blocks on push.
///
/// When full, the oldest item is evicted to make room. The queue keeps its
/// own receiver so the producer side can do the eviction.
#[derive(Debug)]
pub struct DropOldestQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for DropOldestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Push `item`, evicting the oldest entries while the queue is full.
    pub fn push(&self, item: T) {
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    item = returned;
                }
                // both ends are owned here, so this cannot happen
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Oldest item, if any, without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for an item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }

    /// Items evicted by `push` since the queue was created, across all clones.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard queued items. Does not count them as dropped.
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_keeps_newest_items() {
        let queue = DropOldestQueue::new(3);
        for i in 0..10 {
            queue.push(i);
            assert!(queue.len() <= 3);
        }

        assert_eq!(queue.dropped(), 7);
        let items: Vec<i32> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(items, vec![7, 8, 9]);
    }

    #[test]
    fn test_pop_timeout_on_empty() {
        let queue: DropOldestQueue<u8> = DropOldestQueue::new(2);
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), None);
        queue.push(4);
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), Some(4));
    }

    #[test]
    fn test_fast_producer_never_overfills() {
        let queue = DropOldestQueue::new(3);
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..5_000u32 {
                    queue.push(i);
                }
            })
        };

        let mut last = None;
        while !producer.is_finished() {
            assert!(queue.len() <= queue.capacity());
            if let Some(item) = queue.try_pop() {
                // order is preserved even with eviction
                if let Some(previous) = last {
                    assert!(item > previous);
                }
                last = Some(item);
            }
        }
        producer.join().unwrap();

        let tail: Vec<u32> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert!(tail.len() <= 3);
        assert_eq!(tail.last().copied().or(last), Some(4_999));
    }
}
