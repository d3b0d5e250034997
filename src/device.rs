//! Capture/output device capability surface.
//!
//! The adapters in this crate never talk to a vendor SDK directly. They consume
//! the traits below, which a vendor binding (or the software [`loopback`]
//! device) implements. The callback side is split into narrow observer traits,
//! one capability each, so that video completion, audio rendering and input
//! arrival can be served by independent objects.
//!
//! [`loopback`]: crate::loopback

use std::{fmt, sync::Arc};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    convert::NativePixelFormat,
    error::DeviceResult,
    frames::AudioFormat,
    timing::{DisplayMode, VideoConnection},
    Error, Result,
};

/// Result of a scheduled frame's presentation, as reported by the device.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CompletionResult {
    Completed = 0,
    DisplayedLate = 1,
    Dropped = 2,
    Flushed = 3,
}

/// Flags attached to an input video frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u32);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);
    /// The device has no signal on the selected input; the buffer holds filler.
    pub const NO_INPUT_SOURCE: FrameFlags = FrameFlags(1 << 31);

    pub const fn from_bits(bits: u32) -> Self {
        FrameFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Boolean device configuration keys used by the adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFlag {
    LowLatencyVideoOutput,
}

/// Audio input connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioConnection {
    Embedded,
    Analog,
}

/// A device-owned output frame buffer.
///
/// Output frames are created once during preroll and then recycled: the device
/// hands each one back through [`VideoCompletionObserver::scheduled_frame_completed`]
/// after display, and the scheduler refills and reschedules it.
pub trait OutputVideoFrame: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn row_bytes(&self) -> usize;
    fn pixel_format(&self) -> NativePixelFormat;
    fn bytes(&self) -> DeviceResult<&[u8]>;
    fn bytes_mut(&mut self) -> DeviceResult<&mut [u8]>;
}

/// A device-owned input frame delivered by a capture callback.
///
/// The device keeps its own reference count on the underlying buffer and only
/// recycles it once every `add_ref` has been matched by a `release`. Use
/// [`DeviceFrameGuard`](crate::capture::DeviceFrameGuard) rather than calling
/// these directly.
pub trait InputVideoFrame: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn row_bytes(&self) -> usize;
    /// Raw native pixel format code.
    fn pixel_format(&self) -> u32;
    fn flags(&self) -> FrameFlags;
    fn bytes(&self) -> &[u8];
    fn add_ref(&self);
    fn release(&self);
}

/// A burst of interleaved audio delivered alongside (or instead of) a video frame.
pub trait InputAudioPacket {
    fn sample_frame_count(&self) -> usize;
    fn bytes(&self) -> DeviceResult<&[u8]>;
}

/// Receives displayed output frames back from the device.
pub trait VideoCompletionObserver: Send + Sync {
    fn scheduled_frame_completed(&self, frame: Box<dyn OutputVideoFrame>, result: CompletionResult);

    fn scheduled_playback_stopped(&self) {}
}

/// Asked by the device for more audio.
pub trait AudioRenderObserver: Send + Sync {
    fn render_audio_samples(&self, preroll: bool);
}

/// Receives captured frames from an input device.
pub trait InputFrameObserver: Send + Sync {
    fn frame_arrived(
        &self,
        video: Option<Arc<dyn InputVideoFrame>>,
        audio: Option<&dyn InputAudioPacket>,
    );

    fn format_changed(&self, _mode_code: u32) {}
}

/// Playout side of a device.
pub trait OutputDevice: Send + Sync {
    fn set_config_flag(&self, flag: ConfigFlag, value: bool) -> DeviceResult<()>;

    fn set_completion_observer(&self, observer: Arc<dyn VideoCompletionObserver>)
        -> DeviceResult<()>;
    fn set_audio_observer(&self, observer: Arc<dyn AudioRenderObserver>) -> DeviceResult<()>;
    /// Drops every registered observer. Called only after playback is stopped.
    fn clear_observers(&self);

    fn enable_video_output(&self, mode: &DisplayMode) -> DeviceResult<()>;
    fn disable_video_output(&self) -> DeviceResult<()>;
    fn create_video_frame(
        &self,
        width: u32,
        height: u32,
        row_bytes: usize,
        format: NativePixelFormat,
    ) -> DeviceResult<Box<dyn OutputVideoFrame>>;
    /// Queues `frame` for display at `display_time` (in `time_scale` units).
    fn schedule_video_frame(
        &self,
        frame: Box<dyn OutputVideoFrame>,
        display_time: i64,
        duration: i64,
        time_scale: i64,
    ) -> DeviceResult<()>;

    fn enable_audio_output(&self, format: AudioFormat) -> DeviceResult<()>;
    fn disable_audio_output(&self) -> DeviceResult<()>;
    fn begin_audio_preroll(&self) -> DeviceResult<()>;
    fn end_audio_preroll(&self) -> DeviceResult<()>;
    /// Offers `frame_count` interleaved sample frames; returns how many the device accepted.
    fn schedule_audio_samples(&self, samples: &[u8], frame_count: usize) -> DeviceResult<usize>;

    fn start_scheduled_playback(&self, start_time: i64, time_scale: i64, speed: f64)
        -> DeviceResult<()>;
    fn stop_scheduled_playback(&self) -> DeviceResult<()>;
}

/// Capture side of a device.
pub trait InputDevice: Send + Sync {
    fn set_video_connection(&self, connection: VideoConnection) -> DeviceResult<()>;
    fn set_audio_connection(&self, connection: AudioConnection) -> DeviceResult<()>;

    fn enable_video_input(&self, mode: &DisplayMode, format: NativePixelFormat)
        -> DeviceResult<()>;
    fn disable_video_input(&self) -> DeviceResult<()>;
    fn enable_audio_input(&self, format: AudioFormat) -> DeviceResult<()>;
    fn disable_audio_input(&self) -> DeviceResult<()>;

    fn set_input_observer(&self, observer: Arc<dyn InputFrameObserver>) -> DeviceResult<()>;
    fn clear_input_observer(&self);

    fn start_streams(&self) -> DeviceResult<()>;
    fn stop_streams(&self) -> DeviceResult<()>;
}

/// Enumerates the cards installed in the machine.
pub trait DeviceDiscovery {
    fn device_count(&self) -> usize;
    fn open_output(&self, index: usize) -> DeviceResult<Arc<dyn OutputDevice>>;
    fn open_input(&self, index: usize) -> DeviceResult<Arc<dyn InputDevice>>;
}

fn check_index(discovery: &dyn DeviceDiscovery, index: usize) -> Result<()> {
    let available = discovery.device_count();
    if index >= available {
        return Err(Error::DeviceNotFound { index, available });
    }
    Ok(())
}

/// Finds card `index` and opens its playout side.
pub(crate) fn open_output_card(
    discovery: &dyn DeviceDiscovery,
    index: usize,
) -> Result<Arc<dyn OutputDevice>> {
    check_index(discovery, index)?;
    discovery
        .open_output(index)
        .map_err(|e| Error::device("open_output", e))
}

/// Finds card `index` and opens its capture side.
pub(crate) fn open_input_card(
    discovery: &dyn DeviceDiscovery,
    index: usize,
) -> Result<Arc<dyn InputDevice>> {
    check_index(discovery, index)?;
    discovery
        .open_input(index)
        .map_err(|e| Error::device("open_input", e))
}

impl fmt::Debug for dyn OutputVideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputVideoFrame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("row_bytes", &self.row_bytes())
            .field("pixel_format", &self.pixel_format())
            .finish()
    }
}
