//! Bounded, ownership-transferring hand-off queue between one producer and one consumer.
//!
//! [`bounded`] returns a [`HandoffProducer`] / [`HandoffConsumer`] pair sharing a
//! fixed-capacity FIFO. Items move through the queue by value, so every item has
//! exactly one owner at any instant.
//!
//! The failure contract is about the *peer*, not about space:
//!
//! - [`HandoffProducer::put`] blocks while the queue is full and fails only once
//!   the consumer has been dropped.
//! - [`HandoffConsumer::get`] blocks while the queue is empty and fails only once
//!   the producer has been dropped **and** every queued item has been taken.
//!
//! Callers running on a real-time device thread must not call the blocking
//! methods blindly. They check [`HandoffConsumer::data_ready`] first, which is a
//! single atomic load.
//!
//! # Example
//!
//! ```
//! use replay_pipeline::handoff;
//!
//! let (tx, rx) = handoff::bounded::<u32>(4);
//! tx.put(1).unwrap();
//! tx.put(2).unwrap();
//! assert!(rx.data_ready());
//! assert_eq!(rx.get().unwrap(), 1);
//! drop(tx);
//! assert_eq!(rx.get().unwrap(), 2);
//! assert!(rx.get().is_err());
//! ```

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

/// Returned by [`HandoffProducer::put`] when the consumer is gone.
///
/// The rejected item is handed back so the producer still owns it.
#[derive(PartialEq, Eq)]
pub struct PeerGone<T>(pub T);

impl<T> fmt::Debug for PeerGone<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PeerGone(..)")
    }
}

impl<T> fmt::Display for PeerGone<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("hand-off consumer has been dropped")
    }
}

impl<T> std::error::Error for PeerGone<T> {}

/// Returned by [`HandoffConsumer::get`] once the producer is gone and the queue is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

impl fmt::Display for Disconnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("hand-off producer has been dropped and the queue is drained")
    }
}

impl std::error::Error for Disconnected {}

/// Outcome of a failed [`HandoffProducer::try_put`].
#[derive(PartialEq, Eq)]
pub enum TryPutError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> TryPutError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TryPutError::Full(item) | TryPutError::Disconnected(item) => item,
        }
    }
}

impl<T> fmt::Debug for TryPutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryPutError::Full(_) => f.write_str("Full(..)"),
            TryPutError::Disconnected(_) => f.write_str("Disconnected(..)"),
        }
    }
}

/// Outcome of a failed [`HandoffConsumer::try_get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryGetError {
    Empty,
    Disconnected,
}

/// Outcome of a failed [`HandoffConsumer::get_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetTimeoutError {
    Timeout,
    Disconnected,
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    // Mirrors queue.len() so readiness checks never touch the mutex.
    len: AtomicUsize,
    producer_alive: AtomicBool,
    consumer_alive: AtomicBool,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self, queue: &mut VecDeque<T>) -> Option<T> {
        let item = queue.pop_front()?;
        self.len.store(queue.len(), Ordering::Release);
        self.not_full.notify_one();
        Some(item)
    }

    fn push(&self, queue: &mut VecDeque<T>, item: T) {
        queue.push_back(item);
        self.len.store(queue.len(), Ordering::Release);
        self.not_empty.notify_one();
    }
}

/// Creates a hand-off queue holding at most `capacity` items.
///
/// # Panics
///
/// Panics if `capacity` is zero. Option builders validate capacities before
/// reaching this point.
pub fn bounded<T>(capacity: usize) -> (HandoffProducer<T>, HandoffConsumer<T>) {
    assert!(capacity > 0, "hand-off queue capacity must be non-zero");

    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
        len: AtomicUsize::new(0),
        producer_alive: AtomicBool::new(true),
        consumer_alive: AtomicBool::new(true),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
    });

    (
        HandoffProducer {
            shared: Arc::clone(&shared),
        },
        HandoffConsumer { shared },
    )
}

/// Sending half of a hand-off queue. Not `Clone`: there is exactly one producer.
pub struct HandoffProducer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> HandoffProducer<T> {
    /// Moves `item` into the queue, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the item inside [`PeerGone`] if the consumer has been dropped.
    /// This is peer death, not backpressure.
    pub fn put(&self, item: T) -> Result<(), PeerGone<T>> {
        let mut queue = self.shared.lock();
        loop {
            if !self.shared.consumer_alive.load(Ordering::Acquire) {
                return Err(PeerGone(item));
            }
            if queue.len() < self.shared.capacity {
                self.shared.push(&mut queue, item);
                return Ok(());
            }
            queue = self
                .shared
                .not_full
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Moves `item` into the queue if there is room, without blocking.
    pub fn try_put(&self, item: T) -> Result<(), TryPutError<T>> {
        let mut queue = self.shared.lock();
        if !self.shared.consumer_alive.load(Ordering::Acquire) {
            return Err(TryPutError::Disconnected(item));
        }
        if queue.len() >= self.shared.capacity {
            return Err(TryPutError::Full(item));
        }
        self.shared.push(&mut queue, item);
        Ok(())
    }

    pub fn is_consumer_alive(&self) -> bool {
        self.shared.consumer_alive.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Drop for HandoffProducer<T> {
    fn drop(&mut self) {
        // Flip the flag under the lock so a consumer between its emptiness
        // check and its wait cannot miss the wakeup.
        let _queue = self.shared.lock();
        self.shared.producer_alive.store(false, Ordering::Release);
        self.shared.not_empty.notify_all();
    }
}

impl<T> fmt::Debug for HandoffProducer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffProducer")
            .field("len", &self.len())
            .field("capacity", &self.shared.capacity)
            .field("consumer_alive", &self.is_consumer_alive())
            .finish()
    }
}

/// Receiving half of a hand-off queue. Not `Clone`: there is exactly one consumer.
pub struct HandoffConsumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> HandoffConsumer<T> {
    /// Returns true if at least one item is queued.
    ///
    /// Lock-free; safe to call from a real-time device callback.
    pub fn data_ready(&self) -> bool {
        self.shared.len.load(Ordering::Acquire) > 0
    }

    /// Takes the oldest item, blocking while the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] once the producer has been dropped and every
    /// item it queued has already been taken. Never fails while items remain.
    pub fn get(&self) -> Result<T, Disconnected> {
        let mut queue = self.shared.lock();
        loop {
            if let Some(item) = self.shared.pop(&mut queue) {
                return Ok(item);
            }
            if !self.shared.producer_alive.load(Ordering::Acquire) {
                return Err(Disconnected);
            }
            queue = self
                .shared
                .not_empty
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Takes the oldest item if one is queued, without blocking.
    pub fn try_get(&self) -> Result<T, TryGetError> {
        let mut queue = self.shared.lock();
        match self.shared.pop(&mut queue) {
            Some(item) => Ok(item),
            None if self.shared.producer_alive.load(Ordering::Acquire) => {
                Err(TryGetError::Empty)
            }
            None => Err(TryGetError::Disconnected),
        }
    }

    /// Like [`get`](Self::get) but gives up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, GetTimeoutError> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.lock();
        loop {
            if let Some(item) = self.shared.pop(&mut queue) {
                return Ok(item);
            }
            if !self.shared.producer_alive.load(Ordering::Acquire) {
                return Err(GetTimeoutError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(GetTimeoutError::Timeout);
            }
            let (guard, _) = self
                .shared
                .not_empty
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }
    }

    pub fn is_producer_alive(&self) -> bool {
        self.shared.producer_alive.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        !self.data_ready()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Drop for HandoffConsumer<T> {
    fn drop(&mut self) {
        let _queue = self.shared.lock();
        self.shared.consumer_alive.store(false, Ordering::Release);
        self.shared.not_full.notify_all();
    }
}

impl<T> fmt::Debug for HandoffConsumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffConsumer")
            .field("len", &self.len())
            .field("capacity", &self.shared.capacity)
            .field("producer_alive", &self.is_producer_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_order_within_capacity() {
        let (tx, rx) = bounded(8);
        for i in 0..8 {
            tx.put(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(rx.get().unwrap(), i);
        }
    }

    #[test]
    fn test_data_ready_tracks_queued_count() {
        let (tx, rx) = bounded(3);
        assert!(!rx.data_ready());
        tx.put('a').unwrap();
        assert!(rx.data_ready());
        tx.put('b').unwrap();
        assert_eq!(rx.len(), 2);
        rx.get().unwrap();
        assert!(rx.data_ready());
        rx.get().unwrap();
        assert!(!rx.data_ready());
        assert!(rx.is_empty());
    }

    #[test]
    fn test_interleaved_put_get_keeps_fifo() {
        let (tx, rx) = bounded(2);
        let mut expected = 0;
        let mut next = 0;
        for step in 0..20 {
            if step % 3 != 2 && tx.len() < 2 {
                tx.put(next).unwrap();
                next += 1;
            } else if rx.data_ready() {
                assert_eq!(rx.get().unwrap(), expected);
                expected += 1;
            }
            assert_eq!(rx.data_ready(), rx.len() >= 1);
        }
    }

    #[test]
    fn test_producer_drop_drains_before_disconnect() {
        let (tx, rx) = bounded(4);
        tx.put(10).unwrap();
        tx.put(11).unwrap();
        drop(tx);
        assert!(!rx.is_producer_alive());
        assert_eq!(rx.get(), Ok(10));
        assert_eq!(rx.get(), Ok(11));
        assert_eq!(rx.get(), Err(Disconnected));
        assert_eq!(rx.get(), Err(Disconnected));
    }

    #[test]
    fn test_consumer_drop_fails_put_and_returns_item() {
        let (tx, rx) = bounded(4);
        drop(rx);
        match tx.put(String::from("frame")) {
            Err(PeerGone(item)) => assert_eq!(item, "frame"),
            Ok(()) => panic!("put must fail with a dead consumer"),
        }
    }

    #[test]
    fn test_try_put_full_and_try_get_empty() {
        let (tx, rx) = bounded(1);
        assert_eq!(rx.try_get(), Err(TryGetError::Empty));
        tx.try_put(1).unwrap();
        assert_eq!(tx.try_put(2).unwrap_err().into_inner(), 2);
        assert_eq!(rx.try_get(), Ok(1));
        drop(tx);
        assert_eq!(rx.try_get(), Err(TryGetError::Disconnected));
    }

    #[test]
    fn test_blocked_get_wakes_on_producer_drop() {
        let (tx, rx) = bounded::<u8>(2);
        let handle = thread::spawn(move || rx.get());
        thread::sleep(Duration::from_millis(20));
        drop(tx);
        assert_eq!(handle.join().unwrap(), Err(Disconnected));
    }

    #[test]
    fn test_blocked_put_wakes_on_consumer_drop() {
        let (tx, rx) = bounded(1);
        tx.put(1).unwrap();
        let handle = thread::spawn(move || tx.put(2).map_err(|PeerGone(v)| v));
        thread::sleep(Duration::from_millis(20));
        drop(rx);
        assert_eq!(handle.join().unwrap(), Err(2));
    }

    #[test]
    fn test_get_timeout_expires() {
        let (tx, rx) = bounded::<u8>(1);
        assert_eq!(
            rx.get_timeout(Duration::from_millis(10)),
            Err(GetTimeoutError::Timeout)
        );
        drop(tx);
        assert_eq!(
            rx.get_timeout(Duration::from_millis(10)),
            Err(GetTimeoutError::Disconnected)
        );
    }

    #[test]
    fn test_threaded_transfer_never_exceeds_capacity() {
        const N: usize = 2_000;
        let (tx, rx) = bounded(4);
        let producer = thread::spawn(move || {
            for i in 0..N {
                tx.put(i).unwrap();
                assert!(tx.len() <= 4);
            }
        });

        let mut received = Vec::with_capacity(N);
        while let Ok(item) = rx.get() {
            assert!(rx.len() <= 4);
            received.push(item);
        }
        producer.join().unwrap();
        assert_eq!(received, (0..N).collect::<Vec<_>>());
    }
}
