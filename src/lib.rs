//! Real-time media core for a live instant-replay server.
//!
//! This crate moves video frames and audio packets between three kinds of
//! producer/consumer: capture cards delivering live input, playout cards
//! demanding frames on a fixed broadcast clock, and file decoders reading
//! recorded clips. Every hand-off crosses a bounded blocking queue so that a
//! slow stage applies backpressure instead of losing data.
//!
//! # Quick Start
//!
//! ```
//! use replay_pipeline::{
//!     loopback::LoopbackCard,
//!     playout::{PlayoutOptions, PlayoutScheduler},
//!     Frame, PixelFormat,
//! };
//!
//! # fn main() -> Result<(), replay_pipeline::Error> {
//! let card = LoopbackCard::new();
//! let options = PlayoutOptions::builder().preroll_frames(2).build()?;
//! let mut playout = PlayoutScheduler::open(&card, &options)?;
//!
//! let frames = playout.take_video_input().expect("video input");
//! let mode = options.display_mode;
//! frames
//!     .put(Frame::new(mode.width, mode.height, PixelFormat::CbYCrY8422))
//!     .ok();
//!
//! // Each tick stands in for one hardware frame interval.
//! card.output().tick();
//! assert!(playout.check().is_ok());
//! # Ok(())
//! # }
//! ```
//!
//! # Core Concepts
//!
//! ## Hand-off queues
//!
//! [`handoff::bounded`] creates a single-producer/single-consumer queue with a
//! fixed capacity. Dropping either end wakes the other, which then reports the
//! peer as gone.
//!
//! ## Playout
//!
//! [`playout::PlayoutScheduler`] prerolls a card, then refills each frame the
//! card hands back. If no fresh frame is queued the last one is shown again,
//! so the output never stalls.
//!
//! ## Capture
//!
//! [`capture::CaptureAdapter`] turns input callbacks into canonical frames and
//! audio packets. When the card's layout already matches the canonical one,
//! frames borrow the device buffer instead of copying it.
//!
//! ## Decoding
//!
//! [`source::SourceDecodeLoop`] reads a clip through a pluggable
//! [`source::MediaBackend`] and yields one video frame per call, paired with
//! exactly the audio that plays during it.
//!
//! # Errors
//!
//! Every [`Error`] belongs to an [`ErrorCategory`]. Errors raised inside device
//! callbacks cannot be returned to the caller, so the adapters latch the first
//! one and expose it through `fault()` and `check()`.
//!
//! # Logging
//!
//! Diagnostics go through [`tracing`]. Install any subscriber to see them.

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

// Internal modules
mod error;

// Public modules
pub mod audio_sync;
pub mod capture;
pub mod convert;
pub mod device;
pub mod frames;
pub mod handoff;
pub mod loopback;
pub mod playout;
pub mod preroll;
pub mod source;
pub mod timing;

#[cfg(any(feature = "tokio", feature = "async-std"))]
mod async_runtime;

#[cfg(feature = "async-std")]
pub use async_runtime::async_std;
#[cfg(feature = "tokio")]
pub use async_runtime::tokio;

// Re-exports
pub use {
    audio_sync::AudioSyncBuffer,
    capture::{CaptureAdapter, CaptureOptions, CaptureOptionsBuilder, CaptureStats},
    convert::{Converter, NativePixelFormat},
    error::*,
    frames::{calculate_line_stride, AudioFormat, AudioPacket, Frame, PixelFormat},
    handoff::{HandoffConsumer, HandoffProducer},
    playout::{PlayoutOptions, PlayoutOptionsBuilder, PlayoutScheduler, PlayoutState, PlayoutStats},
    preroll::PrerollSignal,
    source::{DecodeRuntime, SourceDecodeLoop, SourceOptions, SyncedFrame},
    timing::{AudioCadence, DisplayMode, Rational, VideoConnection},
};

#[cfg(feature = "image-encoding")]
pub use frames::ImageFormat;

/// Alias for Result with our Error type
pub type Result<T> = std::result::Result<T, crate::error::Error>;

// Tests
#[cfg(test)]
#[path = "tests.rs"]
mod tests;
