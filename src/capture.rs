//! Device-driven capture: input callbacks feed hand-off queues.
//!
//! The [`CaptureAdapter`] configures an input device and registers an observer
//! that turns each captured video frame and audio burst into canonical
//! [`Frame`]s and [`AudioPacket`]s. When the device already delivers the
//! canonical layout, frames are wrapped zero-copy in a [`DeviceFrameGuard`]
//! that keeps the device buffer alive until the last consumer drops it.
//!
//! # Example
//!
//! ```
//! use replay_pipeline::{
//!     capture::{CaptureAdapter, CaptureOptions},
//!     loopback::{LoopbackCard, LoopbackInputFrame},
//!     PixelFormat,
//! };
//!
//! let card = LoopbackCard::new();
//! let options = CaptureOptions::builder().audio(false).build()?;
//! let mut capture = CaptureAdapter::open(&card, &options)?;
//! let frames = capture.take_video_output().unwrap();
//!
//! card.input().deliver(Some(LoopbackInputFrame::yuv(1920, 1080, 0x10)), None);
//! let frame = frames.get().unwrap();
//! assert_eq!(frame.pixel_format(), PixelFormat::CbYCrY8422);
//! assert!(frame.is_borrowed());
//! # Ok::<(), replay_pipeline::Error>(())
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    convert::{Converter, NativePixelFormat},
    device::{
        self, AudioConnection, DeviceDiscovery, FrameFlags, InputAudioPacket, InputDevice,
        InputFrameObserver, InputVideoFrame,
    },
    error::{FaultLatch, TransientCondition},
    frames::{AudioFormat, AudioPacket, Frame, PixelFormat},
    handoff::{self, HandoffConsumer, HandoffProducer},
    timing::{DisplayMode, VideoConnection},
    Error, Result,
};

/// Default depth of the capture output queues.
pub const DEFAULT_CAPTURE_QUEUE: usize = 16;

/// RAII reference on a device input frame.
///
/// Construction takes a device reference (`add_ref`); drop releases it,
/// on every path including errors. The buffer is read-only.
pub struct DeviceFrameGuard {
    frame: Arc<dyn InputVideoFrame>,
}

impl DeviceFrameGuard {
    pub fn new(frame: Arc<dyn InputVideoFrame>) -> Self {
        frame.add_ref();
        Self { frame }
    }

    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    pub fn height(&self) -> u32 {
        self.frame.height()
    }

    pub fn row_bytes(&self) -> usize {
        self.frame.row_bytes()
    }

    pub fn bytes(&self) -> &[u8] {
        self.frame.bytes()
    }
}

impl Drop for DeviceFrameGuard {
    fn drop(&mut self) {
        self.frame.release();
    }
}

impl fmt::Debug for DeviceFrameGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFrameGuard")
            .field("width", &self.frame.width())
            .field("height", &self.frame.height())
            .field("row_bytes", &self.frame.row_bytes())
            .finish()
    }
}

/// Options for opening a [`CaptureAdapter`].
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub card_index: usize,
    pub display_mode: DisplayMode,
    pub connection: VideoConnection,
    pub pixel_format: PixelFormat,
    /// Pin the device-side format; `None` picks the registry's preferred one.
    pub native_format: Option<NativePixelFormat>,
    pub audio: bool,
    pub video_queue_capacity: usize,
    pub audio_queue_capacity: usize,
}

impl CaptureOptions {
    /// Create a builder for configuring capture options
    pub fn builder() -> CaptureOptionsBuilder {
        CaptureOptionsBuilder::new()
    }
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            card_index: 0,
            display_mode: DisplayMode::default(),
            connection: VideoConnection::Sdi,
            pixel_format: PixelFormat::CbYCrY8422,
            native_format: None,
            audio: true,
            video_queue_capacity: DEFAULT_CAPTURE_QUEUE,
            audio_queue_capacity: DEFAULT_CAPTURE_QUEUE,
        }
    }
}

/// Builder for [`CaptureOptions`].
#[derive(Debug, Clone, Default)]
pub struct CaptureOptionsBuilder {
    options: CaptureOptions,
}

impl CaptureOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the card by its enumeration index
    #[must_use]
    pub fn card_index(mut self, index: usize) -> Self {
        self.options.card_index = index;
        self
    }

    #[must_use]
    pub fn display_mode(mut self, mode: DisplayMode) -> Self {
        self.options.display_mode = mode;
        self
    }

    #[must_use]
    pub fn connection(mut self, connection: VideoConnection) -> Self {
        self.options.connection = connection;
        self
    }

    #[must_use]
    pub fn pixel_format(mut self, format: PixelFormat) -> Self {
        self.options.pixel_format = format;
        self
    }

    #[must_use]
    pub fn native_format(mut self, format: NativePixelFormat) -> Self {
        self.options.native_format = Some(format);
        self
    }

    /// Capture embedded audio alongside video
    #[must_use]
    pub fn audio(mut self, enabled: bool) -> Self {
        self.options.audio = enabled;
        self
    }

    #[must_use]
    pub fn video_queue_capacity(mut self, capacity: usize) -> Self {
        self.options.video_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn audio_queue_capacity(mut self, capacity: usize) -> Self {
        self.options.audio_queue_capacity = capacity;
        self
    }

    /// Build the `CaptureOptions`
    ///
    /// # Errors
    ///
    /// Returns an error if a queue capacity is zero or the pixel format has no
    /// native mapping.
    pub fn build(self) -> Result<CaptureOptions> {
        if self.options.video_queue_capacity == 0 || self.options.audio_queue_capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "capture queue capacities must be non-zero".into(),
            ));
        }
        Converter::resolve(self.options.pixel_format, self.options.native_format)?;
        Ok(self.options)
    }
}

/// Snapshot of capture counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_without_signal: u64,
    pub audio_packets: u64,
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_without_signal: AtomicU64,
    audio_packets: AtomicU64,
}

struct CaptureObserver {
    converter: Converter,
    video_tx: HandoffProducer<Frame>,
    audio_tx: Option<HandoffProducer<AudioPacket>>,
    faults: FaultLatch,
    counters: Counters,
}

impl CaptureObserver {
    fn on_video(&self, video: Arc<dyn InputVideoFrame>) -> Result<()> {
        if video.flags().contains(FrameFlags::NO_INPUT_SOURCE) {
            let n = self.counters.frames_without_signal.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(frames_without_signal = n, "{}", TransientCondition::NoInputSignal);
            return Ok(());
        }

        let code = video.pixel_format();
        let native = NativePixelFormat::try_from(code).map_err(|_| {
            Error::ContractViolation(format!("device delivered unknown pixel format {code:#010x}"))
        })?;
        if native != self.converter.native() {
            return Err(Error::ContractViolation(format!(
                "device delivered {native:?}, input was enabled for {:?}",
                self.converter.native()
            )));
        }

        let frame = if self.converter.is_identity() {
            Frame::from_guard(DeviceFrameGuard::new(video), self.converter.canonical())?
        } else {
            self.converter.pack(
                video.bytes(),
                video.row_bytes(),
                video.width(),
                video.height(),
            )?
        };

        self.video_tx
            .put(frame)
            .map_err(|_| Error::PeerDeath("capture video consumer is gone".into()))?;
        let n = self.counters.frames_captured.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(frames_captured = n, "captured video frame");
        Ok(())
    }

    fn on_audio(&self, tx: &HandoffProducer<AudioPacket>, audio: &dyn InputAudioPacket) -> Result<()> {
        let format = AudioFormat::SYSTEM;
        let count = audio.sample_frame_count();
        let bytes = audio
            .bytes()
            .map_err(|e| Error::device_fault("InputAudioPacket::bytes", e))?;
        let len = count * format.frame_bytes();
        let Some(samples) = bytes.get(..len) else {
            return Err(Error::ContractViolation(format!(
                "audio packet reports {count} sample frames but holds {} bytes",
                bytes.len()
            )));
        };

        let packet = AudioPacket::from_bytes(format, samples.to_vec())?;
        tx.put(packet)
            .map_err(|_| Error::PeerDeath("capture audio consumer is gone".into()))?;
        self.counters.audio_packets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl InputFrameObserver for CaptureObserver {
    fn frame_arrived(
        &self,
        video: Option<Arc<dyn InputVideoFrame>>,
        audio: Option<&dyn InputAudioPacket>,
    ) {
        if self.faults.is_tripped() {
            return;
        }
        if let Some(video) = video {
            if let Err(e) = self.on_video(video) {
                self.faults.latch("capture video", e);
                return;
            }
        }
        if let (Some(audio), Some(tx)) = (audio, self.audio_tx.as_ref()) {
            if let Err(e) = self.on_audio(tx, audio) {
                self.faults.latch("capture audio", e);
            }
        }
    }

    fn format_changed(&self, mode_code: u32) {
        tracing::warn!(mode_code = format_args!("{mode_code:#010x}"), "input format changed");
    }
}

/// Capture side of a card, producing canonical frames into hand-off queues.
///
/// Dropping the adapter stops the device streams, disables audio then video
/// input and unregisters the observer before the queues are released.
pub struct CaptureAdapter {
    device: Arc<dyn InputDevice>,
    observer: Arc<CaptureObserver>,
    video_rx: Option<HandoffConsumer<Frame>>,
    audio_rx: Option<HandoffConsumer<AudioPacket>>,
    options: CaptureOptions,
}

impl CaptureAdapter {
    /// Configures card `options.card_index` for capture and starts its streams.
    ///
    /// # Errors
    ///
    /// Configuration errors: missing card, unmapped pixel format, or any
    /// rejected device call (named in the error).
    pub fn open(discovery: &dyn DeviceDiscovery, options: &CaptureOptions) -> Result<Self> {
        let device = device::open_input_card(discovery, options.card_index)?;
        let converter = Converter::resolve(options.pixel_format, options.native_format)?;

        let (video_tx, video_rx) = handoff::bounded(options.video_queue_capacity);
        let (audio_tx, audio_rx) = if options.audio {
            let (tx, rx) = handoff::bounded(options.audio_queue_capacity);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let observer = Arc::new(CaptureObserver {
            converter,
            video_tx,
            audio_tx,
            faults: FaultLatch::new(),
            counters: Counters::default(),
        });

        if let Err(e) = configure(&*device, &observer, converter, options) {
            shutdown(&*device, options.audio);
            return Err(e);
        }

        tracing::info!(
            card = options.card_index,
            mode = options.display_mode.name,
            connection = options.connection.name(),
            native = ?converter.native(),
            audio = options.audio,
            "capture started"
        );

        Ok(Self {
            device,
            observer,
            video_rx: Some(video_rx),
            audio_rx,
            options: options.clone(),
        })
    }

    /// Takes the consumer end of the video queue. Returns `None` after the first call.
    pub fn take_video_output(&mut self) -> Option<HandoffConsumer<Frame>> {
        self.video_rx.take()
    }

    /// Takes the consumer end of the audio queue, if audio capture is enabled.
    pub fn take_audio_output(&mut self) -> Option<HandoffConsumer<AudioPacket>> {
        self.audio_rx.take()
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    /// The first fault raised on the capture callback, if any.
    pub fn fault(&self) -> Option<&Error> {
        self.observer.faults.get()
    }

    /// `Err` with the latched fault once the adapter has gone inert.
    pub fn check(&self) -> std::result::Result<(), &Error> {
        match self.fault() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> CaptureStats {
        let c = &self.observer.counters;
        CaptureStats {
            frames_captured: c.frames_captured.load(Ordering::Relaxed),
            frames_without_signal: c.frames_without_signal.load(Ordering::Relaxed),
            audio_packets: c.audio_packets.load(Ordering::Relaxed),
        }
    }
}

fn configure(
    device: &dyn InputDevice,
    observer: &Arc<CaptureObserver>,
    converter: Converter,
    options: &CaptureOptions,
) -> Result<()> {
    device
        .set_video_connection(options.connection)
        .map_err(|e| Error::device("set_video_connection", e))?;
    device
        .enable_video_input(&options.display_mode, converter.native())
        .map_err(|e| Error::device("enable_video_input", e))?;

    if options.audio {
        device
            .set_audio_connection(AudioConnection::Embedded)
            .map_err(|e| Error::device("set_audio_connection", e))?;
        device
            .enable_audio_input(AudioFormat::SYSTEM)
            .map_err(|e| Error::device("enable_audio_input", e))?;
    }

    let observer: Arc<dyn InputFrameObserver> = observer.clone();
    device
        .set_input_observer(observer)
        .map_err(|e| Error::device("set_input_observer", e))?;
    device
        .start_streams()
        .map_err(|e| Error::device("start_streams", e))
}

fn shutdown(device: &dyn InputDevice, audio: bool) {
    if let Err(e) = device.stop_streams() {
        tracing::warn!("stop_streams failed during capture teardown: {e}");
    }
    if audio {
        if let Err(e) = device.disable_audio_input() {
            tracing::warn!("disable_audio_input failed during capture teardown: {e}");
        }
    }
    if let Err(e) = device.disable_video_input() {
        tracing::warn!("disable_video_input failed during capture teardown: {e}");
    }
    device.clear_input_observer();
}

impl Drop for CaptureAdapter {
    fn drop(&mut self) {
        shutdown(&*self.device, self.options.audio);
        let stats = self.stats();
        tracing::info!(
            frames_captured = stats.frames_captured,
            frames_without_signal = stats.frames_without_signal,
            "capture stopped"
        );
    }
}

impl fmt::Debug for CaptureAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureAdapter")
            .field("options", &self.options)
            .field("stats", &self.stats())
            .field("fault", &self.fault())
            .finish()
    }
}
