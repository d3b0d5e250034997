//! Async runtime integration for Tokio and async-std.
//!
//! Decoding and hand-off queue operations block, so these wrappers run them on
//! the runtime's blocking pool with `spawn_blocking`. The device callbacks are
//! untouched: they keep using the synchronous, lock-light queue API.
//!
//! # Features
//!
//! - `tokio` - Enable Tokio runtime support
//! - `async-std` - Enable async-std runtime support
//!
//! # Example with Tokio
//!
//! ```no_run
//! # #[cfg(feature = "tokio")]
//! # {
//! use std::sync::Arc;
//! use replay_pipeline::{
//!     source::{DecodeRuntime, MediaBackend, SourceDecodeLoop, SourceOptions},
//!     tokio::AsyncSourceReader,
//!     Rational,
//! };
//!
//! # async fn run(backend: Arc<dyn MediaBackend>) -> replay_pipeline::Result<()> {
//! let runtime = DecodeRuntime::new(backend);
//! let source = SourceDecodeLoop::open(&runtime, "clip.mov", &SourceOptions::default())?;
//! let reader = AsyncSourceReader::new(source);
//!
//! while let Some(frame) = reader.read_frame(Rational::ONE).await? {
//!     println!("frame {}", frame.position);
//! }
//! # Ok(())
//! # }
//! # }
//! ```

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    handoff::{GetTimeoutError, HandoffConsumer, HandoffProducer},
    source::{SourceDecodeLoop, SyncedFrame},
    timing::Rational,
    Error, Result,
};

fn read_blocking(source: &Mutex<SourceDecodeLoop>, speed: Rational) -> Result<Option<SyncedFrame>> {
    source
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .read_frame(speed)
}

fn get_blocking<T>(consumer: &HandoffConsumer<T>, timeout: Duration) -> Result<Option<T>> {
    match consumer.get_timeout(timeout) {
        Ok(item) => Ok(Some(item)),
        Err(GetTimeoutError::Timeout) => Ok(None),
        Err(GetTimeoutError::Disconnected) => {
            Err(Error::PeerDeath("hand-off producer is gone".into()))
        }
    }
}

fn put_blocking<T>(producer: &HandoffProducer<T>, item: T) -> Result<()> {
    producer
        .put(item)
        .map_err(|_| Error::PeerDeath("hand-off consumer is gone".into()))
}

#[cfg(feature = "tokio")]
fn task_failed(what: &str, err: impl std::fmt::Display) -> Error {
    Error::PeerDeath(format!("{what} task failed: {err}"))
}

#[cfg(feature = "tokio")]
pub mod tokio {
    //! Tokio async runtime integration.
    //!
    //! Wrappers use `tokio::task::spawn_blocking` so decoding and queue waits
    //! never stall the Tokio workers.

    use super::*;

    /// Async wrapper around a [`SourceDecodeLoop`] for the Tokio runtime.
    ///
    /// Clones share the same decode loop; concurrent reads are serialized.
    pub struct AsyncSourceReader {
        inner: Arc<Mutex<SourceDecodeLoop>>,
    }

    impl AsyncSourceReader {
        pub fn new(source: SourceDecodeLoop) -> Self {
            Self {
                inner: Arc::new(Mutex::new(source)),
            }
        }

        /// Async version of [`SourceDecodeLoop::read_frame`].
        ///
        /// Returns `Ok(None)` once the file is exhausted.
        pub async fn read_frame(&self, speed: Rational) -> Result<Option<SyncedFrame>> {
            let source = Arc::clone(&self.inner);
            ::tokio::task::spawn_blocking(move || read_blocking(&source, speed))
                .await
                .map_err(|e| task_failed("decode", e))?
        }
    }

    impl Clone for AsyncSourceReader {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }

    /// Async receiving half of a hand-off queue.
    pub struct AsyncFrameConsumer<T> {
        inner: Arc<HandoffConsumer<T>>,
    }

    impl<T: Send + 'static> AsyncFrameConsumer<T> {
        pub fn new(consumer: HandoffConsumer<T>) -> Self {
            Self {
                inner: Arc::new(consumer),
            }
        }

        /// Waits up to `timeout` for the next item.
        ///
        /// # Returns
        ///
        /// * `Ok(Some(item))` - The oldest queued item
        /// * `Ok(None)` - Nothing arrived within `timeout`
        /// * `Err(Error::PeerDeath)` - The producer is gone and the queue is drained
        pub async fn get_timeout(&self, timeout: Duration) -> Result<Option<T>> {
            let consumer = Arc::clone(&self.inner);
            ::tokio::task::spawn_blocking(move || get_blocking(&consumer, timeout))
                .await
                .map_err(|e| task_failed("hand-off get", e))?
        }

        pub fn data_ready(&self) -> bool {
            self.inner.data_ready()
        }
    }

    /// Async sending half of a hand-off queue.
    pub struct AsyncFrameProducer<T> {
        inner: Arc<HandoffProducer<T>>,
    }

    impl<T: Send + 'static> AsyncFrameProducer<T> {
        pub fn new(producer: HandoffProducer<T>) -> Self {
            Self {
                inner: Arc::new(producer),
            }
        }

        /// Queues `item`, waiting while the queue is full.
        pub async fn put(&self, item: T) -> Result<()> {
            let producer = Arc::clone(&self.inner);
            ::tokio::task::spawn_blocking(move || put_blocking(&producer, item))
                .await
                .map_err(|e| task_failed("hand-off put", e))?
        }

        pub fn is_consumer_alive(&self) -> bool {
            self.inner.is_consumer_alive()
        }
    }
}

#[cfg(feature = "async-std")]
pub mod async_std {
    //! async-std runtime integration.
    //!
    //! Wrappers use `async_std::task::spawn_blocking` so decoding and queue
    //! waits never stall the executor.

    use super::*;

    /// Async wrapper around a [`SourceDecodeLoop`] for the async-std runtime.
    pub struct AsyncSourceReader {
        inner: Arc<Mutex<SourceDecodeLoop>>,
    }

    impl AsyncSourceReader {
        pub fn new(source: SourceDecodeLoop) -> Self {
            Self {
                inner: Arc::new(Mutex::new(source)),
            }
        }

        /// Async version of [`SourceDecodeLoop::read_frame`].
        pub async fn read_frame(&self, speed: Rational) -> Result<Option<SyncedFrame>> {
            let source = Arc::clone(&self.inner);
            ::async_std::task::spawn_blocking(move || read_blocking(&source, speed)).await
        }
    }

    impl Clone for AsyncSourceReader {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }

    /// Async receiving half of a hand-off queue.
    pub struct AsyncFrameConsumer<T> {
        inner: Arc<HandoffConsumer<T>>,
    }

    impl<T: Send + 'static> AsyncFrameConsumer<T> {
        pub fn new(consumer: HandoffConsumer<T>) -> Self {
            Self {
                inner: Arc::new(consumer),
            }
        }

        /// Waits up to `timeout` for the next item; `Ok(None)` on timeout.
        pub async fn get_timeout(&self, timeout: Duration) -> Result<Option<T>> {
            let consumer = Arc::clone(&self.inner);
            ::async_std::task::spawn_blocking(move || get_blocking(&consumer, timeout)).await
        }

        pub fn data_ready(&self) -> bool {
            self.inner.data_ready()
        }
    }

    /// Async sending half of a hand-off queue.
    pub struct AsyncFrameProducer<T> {
        inner: Arc<HandoffProducer<T>>,
    }

    impl<T: Send + 'static> AsyncFrameProducer<T> {
        pub fn new(producer: HandoffProducer<T>) -> Self {
            Self {
                inner: Arc::new(producer),
            }
        }

        pub async fn put(&self, item: T) -> Result<()> {
            let producer = Arc::clone(&self.inner);
            ::async_std::task::spawn_blocking(move || put_blocking(&producer, item)).await
        }

        pub fn is_consumer_alive(&self) -> bool {
            self.inner.is_consumer_alive()
        }
    }
}

#[cfg(all(test, feature = "tokio"))]
mod tests {
    use super::tokio::*;
    use crate::handoff;

    #[::tokio::test]
    async fn test_async_handoff_round_trip() {
        let (tx, rx) = handoff::bounded::<u32>(2);
        let producer = AsyncFrameProducer::new(tx);
        let consumer = AsyncFrameConsumer::new(rx);

        producer.put(7).await.unwrap();
        assert!(consumer.data_ready());
        assert_eq!(
            consumer.get_timeout(std::time::Duration::from_secs(1)).await.unwrap(),
            Some(7)
        );
        assert_eq!(
            consumer.get_timeout(std::time::Duration::from_millis(10)).await.unwrap(),
            None
        );
    }

    #[::tokio::test]
    async fn test_async_consumer_reports_dead_producer() {
        let (tx, rx) = handoff::bounded::<u32>(1);
        drop(tx);
        let consumer = AsyncFrameConsumer::new(rx);
        let err = consumer
            .get_timeout(std::time::Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::PeerDeath(_)));
    }
}
