//! Hardware-paced playout: device callbacks pull frames from hand-off queues.
//!
//! The [`PlayoutScheduler`] prerolls a small ring of device output frames and
//! then lets the device drive everything. Each time a frame finishes
//! displaying, the device returns it through the video completion observer,
//! which refills it and schedules it one frame period after the previous one.
//! Audio is pushed from the device's render callback, one packet at a time.
//!
//! Video and audio are served by two independent observer objects. Neither
//! callback ever blocks on an empty queue: both check
//! [`HandoffConsumer::data_ready`] first. When no new video frame is ready the
//! last displayed frame is shown again.
//!
//! # Example
//!
//! ```
//! use replay_pipeline::{
//!     loopback::LoopbackCard,
//!     playout::{PlayoutOptions, PlayoutScheduler, PlayoutState},
//!     Frame, PixelFormat,
//! };
//!
//! let card = LoopbackCard::new();
//! let options = PlayoutOptions::builder().audio(false).build()?;
//! let mut playout = PlayoutScheduler::open(&card, &options)?;
//! assert_eq!(playout.state(), PlayoutState::Playing);
//!
//! let frames = playout.take_video_input().unwrap();
//! frames.put(Frame::new(1920, 1080, PixelFormat::CbYCrY8422)).unwrap();
//! card.output().tick();
//! # Ok::<(), replay_pipeline::Error>(())
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    convert::{Converter, NativePixelFormat},
    device::{
        self, AudioRenderObserver, CompletionResult, ConfigFlag, DeviceDiscovery, OutputDevice,
        OutputVideoFrame, VideoCompletionObserver,
    },
    error::{FaultLatch, TransientCondition},
    frames::{AudioFormat, AudioPacket, Frame, PixelFormat},
    handoff::{self, HandoffConsumer, HandoffProducer},
    preroll::{PrerollSignal, DEFAULT_PREROLL_TIMEOUT},
    timing::DisplayMode,
    Error, Result,
};

/// Default depth of the playout video input queue.
pub const DEFAULT_PLAYOUT_QUEUE: usize = 4;
/// Default depth of the playout audio input queue.
pub const DEFAULT_AUDIO_QUEUE: usize = 4;
/// Device frames scheduled before playback starts.
pub const DEFAULT_PREROLL_FRAMES: usize = 4;
/// Sample frames of silence handed to the device during audio preroll.
pub const DEFAULT_PREROLL_AUDIO_FRAMES: usize = 6404;

/// Lifecycle of a [`PlayoutScheduler`].
///
/// `Init -> Configured -> PrerollingVideo -> [PrerollingAudio] -> Playing`.
/// `Playing` lasts until the scheduler is dropped.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PlayoutState {
    Init = 0,
    Configured = 1,
    PrerollingVideo = 2,
    PrerollingAudio = 3,
    Playing = 4,
}

/// Options for opening a [`PlayoutScheduler`].
#[derive(Debug, Clone)]
pub struct PlayoutOptions {
    pub card_index: usize,
    pub display_mode: DisplayMode,
    pub pixel_format: PixelFormat,
    pub native_format: Option<NativePixelFormat>,
    pub audio: bool,
    pub video_queue_capacity: usize,
    pub audio_queue_capacity: usize,
    pub preroll_frames: usize,
    pub preroll_audio_frames: usize,
    pub preroll_timeout: Duration,
    pub low_latency: bool,
}

impl PlayoutOptions {
    /// Create a builder for configuring playout options
    pub fn builder() -> PlayoutOptionsBuilder {
        PlayoutOptionsBuilder::new()
    }
}

impl Default for PlayoutOptions {
    fn default() -> Self {
        Self {
            card_index: 0,
            display_mode: DisplayMode::default(),
            pixel_format: PixelFormat::CbYCrY8422,
            native_format: None,
            audio: true,
            video_queue_capacity: DEFAULT_PLAYOUT_QUEUE,
            audio_queue_capacity: DEFAULT_AUDIO_QUEUE,
            preroll_frames: DEFAULT_PREROLL_FRAMES,
            preroll_audio_frames: DEFAULT_PREROLL_AUDIO_FRAMES,
            preroll_timeout: DEFAULT_PREROLL_TIMEOUT,
            low_latency: true,
        }
    }
}

/// Builder for [`PlayoutOptions`].
#[derive(Debug, Clone, Default)]
pub struct PlayoutOptionsBuilder {
    options: PlayoutOptions,
}

impl PlayoutOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

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
    pub fn pixel_format(mut self, format: PixelFormat) -> Self {
        self.options.pixel_format = format;
        self
    }

    #[must_use]
    pub fn native_format(mut self, format: NativePixelFormat) -> Self {
        self.options.native_format = Some(format);
        self
    }

    /// Play out audio alongside video
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

    /// Number of device frames kept in flight
    #[must_use]
    pub fn preroll_frames(mut self, frames: usize) -> Self {
        self.options.preroll_frames = frames;
        self
    }

    /// Length of the silent audio preroll, in sample frames
    #[must_use]
    pub fn preroll_audio_frames(mut self, frames: usize) -> Self {
        self.options.preroll_audio_frames = frames;
        self
    }

    #[must_use]
    pub fn preroll_timeout(mut self, timeout: Duration) -> Self {
        self.options.preroll_timeout = timeout;
        self
    }

    /// Request the device's low-latency output mode
    #[must_use]
    pub fn low_latency(mut self, enabled: bool) -> Self {
        self.options.low_latency = enabled;
        self
    }

    /// Build the `PlayoutOptions`
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A queue capacity or the preroll frame count is zero
    /// - The pixel format has no native mapping
    pub fn build(self) -> Result<PlayoutOptions> {
        let o = &self.options;
        if o.video_queue_capacity == 0 || o.audio_queue_capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "playout queue capacities must be non-zero".into(),
            ));
        }
        if o.preroll_frames == 0 {
            return Err(Error::InvalidConfiguration(
                "at least one preroll frame is required".into(),
            ));
        }
        if o.display_mode.width == 0 || o.display_mode.height == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "display mode {} has an empty {}x{} raster",
                o.display_mode.name, o.display_mode.width, o.display_mode.height
            )));
        }
        Converter::resolve(o.pixel_format, o.native_format)?;
        Ok(self.options)
    }
}

/// Snapshot of playout counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayoutStats {
    /// Frames scheduled so far; the next one is displayed at this counter.
    pub frame_counter: u64,
    pub fresh_frames: u64,
    pub repeated_frames: u64,
    pub no_content: u64,
    pub displayed_late: u64,
    pub dropped: u64,
    pub flushed: u64,
    pub audio_frames_submitted: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct VideoCounters {
    fresh: AtomicU64,
    repeated: AtomicU64,
    no_content: AtomicU64,
    displayed_late: AtomicU64,
    dropped: AtomicU64,
    flushed: AtomicU64,
}

struct VideoState {
    input: HandoffConsumer<Frame>,
    /// The frame most recently written into a device buffer.
    last_frame: Option<Frame>,
    frame_counter: u64,
}

/// Video completion observer: refills and reschedules returned device frames.
struct VideoPlayout {
    device: Arc<dyn OutputDevice>,
    mode: DisplayMode,
    converter: Converter,
    state: Mutex<VideoState>,
    faults: FaultLatch,
    counters: VideoCounters,
}

impl VideoPlayout {
    /// Fills `out` with the next frame and schedules it at the current counter.
    fn fill_and_schedule(&self, state: &mut VideoState, mut out: Box<dyn OutputVideoFrame>) -> Result<()> {
        let fresh = if state.input.data_ready() {
            let frame = state
                .input
                .get()
                .map_err(|_| Error::PeerDeath("playout video producer is gone".into()))?;
            Some(frame)
        } else {
            None
        };

        match fresh.as_ref().or(state.last_frame.as_ref()) {
            Some(frame) => {
                let (width, height, row_bytes) = (out.width(), out.height(), out.row_bytes());
                let dst = out
                    .bytes_mut()
                    .map_err(|e| Error::device_fault("OutputVideoFrame::bytes_mut", e))?;
                self.converter.unpack(frame, dst, row_bytes, width, height)?;
                if fresh.is_some() {
                    self.counters.fresh.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.repeated.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                self.counters.no_content.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    frame_counter = state.frame_counter,
                    "{}; output is on fire",
                    TransientCondition::NoContentAvailable
                );
            }
        }

        // Only a newly dequeued frame replaces the retained one; a repeat
        // leaves it untouched.
        if let Some(frame) = fresh {
            state.last_frame = Some(frame);
        }

        let display_time = self.mode.display_time(state.frame_counter);
        self.device
            .schedule_video_frame(
                out,
                display_time,
                self.mode.frame_duration,
                self.mode.time_scale,
            )
            .map_err(|e| Error::device_fault("schedule_video_frame", e))?;
        tracing::trace!(frame_counter = state.frame_counter, display_time, "scheduled frame");
        state.frame_counter += 1;
        Ok(())
    }

    fn classify(&self, result: CompletionResult) {
        let (condition, counter) = match result {
            CompletionResult::Completed => return,
            CompletionResult::DisplayedLate => {
                (TransientCondition::DisplayedLate, &self.counters.displayed_late)
            }
            CompletionResult::Dropped => (TransientCondition::Dropped, &self.counters.dropped),
            CompletionResult::Flushed => (TransientCondition::Flushed, &self.counters.flushed),
        };
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(count = n, "{condition}");
    }
}

impl VideoCompletionObserver for VideoPlayout {
    fn scheduled_frame_completed(&self, frame: Box<dyn OutputVideoFrame>, result: CompletionResult) {
        if self.faults.is_tripped() {
            return;
        }
        self.classify(result);
        let mut state = lock(&self.state);
        if let Err(e) = self.fill_and_schedule(&mut state, frame) {
            self.faults.latch("video completion", e);
        }
    }

    fn scheduled_playback_stopped(&self) {
        tracing::info!("scheduled playback stopped");
    }
}

struct AudioState {
    input: HandoffConsumer<AudioPacket>,
    current: Option<AudioPacket>,
    /// Sample frames of `current` already accepted by the device.
    offset: usize,
}

/// Audio render observer: feeds packets to the device as it asks for more.
struct AudioPlayout {
    device: Arc<dyn OutputDevice>,
    state: Mutex<AudioState>,
    preroll: PrerollSignal,
    faults: FaultLatch,
    frames_submitted: AtomicU64,
}

impl AudioPlayout {
    /// Offers the unconsumed tail of the current packet to the device and
    /// returns how many sample frames it accepted.
    fn drain_current(&self, state: &mut AudioState) -> Result<usize> {
        let Some(packet) = state.current.as_ref() else {
            return Ok(0);
        };
        let remaining = packet.n_frames().saturating_sub(state.offset);
        let accepted = self
            .device
            .schedule_audio_samples(packet.samples_from(state.offset), remaining)
            .map_err(|e| Error::device_fault("schedule_audio_samples", e))?;

        if accepted > remaining {
            return Err(Error::ContractViolation(format!(
                "device accepted {accepted} sample frames but only {remaining} were offered"
            )));
        }
        if accepted == remaining {
            state.current = None;
            state.offset = 0;
        } else {
            state.offset += accepted;
        }
        self.frames_submitted
            .fetch_add(accepted as u64, Ordering::Relaxed);
        tracing::trace!(accepted, remaining, "audio samples scheduled");
        Ok(accepted)
    }

    fn render(&self, preroll: bool) -> Result<()> {
        let mut state = lock(&self.state);
        if preroll {
            if state.current.is_some() {
                self.drain_current(&mut state)?;
            }
            if state.current.is_none() && self.preroll.signal() {
                tracing::debug!("audio preroll packet fully accepted");
            }
            return Ok(());
        }

        loop {
            if state.current.is_some() {
                let accepted = self.drain_current(&mut state)?;
                // Nothing taken and the packet is still pending: the device is full.
                if accepted == 0 && state.current.is_some() {
                    break;
                }
            } else if state.input.data_ready() {
                let packet = state
                    .input
                    .get()
                    .map_err(|_| Error::PeerDeath("playout audio producer is gone".into()))?;
                state.current = Some(packet);
                state.offset = 0;
            } else {
                break;
            }
        }
        Ok(())
    }
}

impl AudioRenderObserver for AudioPlayout {
    fn render_audio_samples(&self, preroll: bool) {
        if self.faults.is_tripped() {
            return;
        }
        if let Err(e) = self.render(preroll) {
            self.faults.latch("audio render", e);
        }
    }
}

/// Playout side of a card, consuming canonical frames from hand-off queues.
///
/// Dropping the scheduler stops scheduled playback, disables audio then video
/// output and unregisters both observers before frames and queues are released.
pub struct PlayoutScheduler {
    device: Arc<dyn OutputDevice>,
    video: Arc<VideoPlayout>,
    audio: Option<Arc<AudioPlayout>>,
    state: AtomicU8,
    audio_output_enabled: bool,
    video_tx: Option<HandoffProducer<Frame>>,
    audio_tx: Option<HandoffProducer<AudioPacket>>,
    options: PlayoutOptions,
}

impl PlayoutScheduler {
    /// Opens card `options.card_index` for playout, creating the input queues.
    ///
    /// Take the producer ends with [`take_video_input`](Self::take_video_input)
    /// and [`take_audio_input`](Self::take_audio_input).
    ///
    /// # Errors
    ///
    /// Configuration errors: missing card, unmapped pixel format, a rejected
    /// device call, or an audio preroll that does not complete in time.
    pub fn open(discovery: &dyn DeviceDiscovery, options: &PlayoutOptions) -> Result<Self> {
        let (video_tx, video_rx) = handoff::bounded(options.video_queue_capacity);
        let (audio_tx, audio_rx) = if options.audio {
            let (tx, rx) = handoff::bounded(options.audio_queue_capacity);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let mut scheduler = Self::start(discovery, options, video_rx, audio_rx)?;
        scheduler.video_tx = Some(video_tx);
        scheduler.audio_tx = audio_tx;
        Ok(scheduler)
    }

    /// Opens card `options.card_index` for playout from existing queues.
    ///
    /// Frames already waiting in `video` are used for the video preroll.
    /// `audio` must be given exactly when `options.audio` is set.
    pub fn open_with_inputs(
        discovery: &dyn DeviceDiscovery,
        options: &PlayoutOptions,
        video: HandoffConsumer<Frame>,
        audio: Option<HandoffConsumer<AudioPacket>>,
    ) -> Result<Self> {
        if options.audio != audio.is_some() {
            return Err(Error::InvalidConfiguration(format!(
                "audio is {} but an audio queue was {}",
                if options.audio { "enabled" } else { "disabled" },
                if audio.is_some() { "given" } else { "not given" }
            )));
        }
        Self::start(discovery, options, video, audio)
    }

    fn start(
        discovery: &dyn DeviceDiscovery,
        options: &PlayoutOptions,
        video_rx: HandoffConsumer<Frame>,
        audio_rx: Option<HandoffConsumer<AudioPacket>>,
    ) -> Result<Self> {
        let mut scheduler = Self::prepare(discovery, options, video_rx, audio_rx)?;
        scheduler.configure()?;
        Ok(scheduler)
    }

    /// Opens the card and builds the observers without touching the device.
    fn prepare(
        discovery: &dyn DeviceDiscovery,
        options: &PlayoutOptions,
        video_rx: HandoffConsumer<Frame>,
        audio_rx: Option<HandoffConsumer<AudioPacket>>,
    ) -> Result<Self> {
        let device = device::open_output_card(discovery, options.card_index)?;
        let converter = Converter::resolve(options.pixel_format, options.native_format)?;

        let video = Arc::new(VideoPlayout {
            device: Arc::clone(&device),
            mode: options.display_mode,
            converter,
            state: Mutex::new(VideoState {
                input: video_rx,
                last_frame: None,
                frame_counter: 0,
            }),
            faults: FaultLatch::new(),
            counters: VideoCounters::default(),
        });

        let audio = audio_rx.map(|input| {
            Arc::new(AudioPlayout {
                device: Arc::clone(&device),
                state: Mutex::new(AudioState {
                    input,
                    current: Some(AudioPacket::silent(
                        AudioFormat::SYSTEM,
                        options.preroll_audio_frames,
                    )),
                    offset: 0,
                }),
                preroll: PrerollSignal::new(),
                faults: FaultLatch::new(),
                frames_submitted: AtomicU64::new(0),
            })
        });

        // Once `configure` starts, an early return drops the scheduler, which
        // tears down whatever was enabled so far.
        Ok(Self {
            device,
            video,
            audio,
            state: AtomicU8::new(PlayoutState::Init.into()),
            audio_output_enabled: false,
            video_tx: None,
            audio_tx: None,
            options: options.clone(),
        })
    }

    fn set_state(&self, state: PlayoutState) {
        self.state.store(state.into(), Ordering::Release);
        tracing::debug!(?state, "playout state");
    }

    fn configure(&mut self) -> Result<()> {
        let options = self.options.clone();
        let mode = options.display_mode;

        if options.low_latency {
            if let Err(e) = self
                .device
                .set_config_flag(ConfigFlag::LowLatencyVideoOutput, true)
            {
                tracing::warn!("could not enable low-latency video output: {e}");
            }
        }

        let observer: Arc<dyn VideoCompletionObserver> = self.video.clone();
        self.device
            .set_completion_observer(observer)
            .map_err(|e| Error::device("set_completion_observer", e))?;
        self.device
            .enable_video_output(&mode)
            .map_err(|e| Error::device("enable_video_output", e))?;
        self.set_state(PlayoutState::Configured);

        let native = self.video.converter.native();
        let row_bytes = native.min_row_bytes(mode.width);
        self.set_state(PlayoutState::PrerollingVideo);
        for _ in 0..options.preroll_frames {
            let frame = self
                .device
                .create_video_frame(mode.width, mode.height, row_bytes, native)
                .map_err(|e| Error::device("create_video_frame", e))?;
            let mut state = lock(&self.video.state);
            self.video.fill_and_schedule(&mut state, frame)?;
        }

        if let Some(audio) = &self.audio {
            let observer: Arc<dyn AudioRenderObserver> = audio.clone();
            self.device
                .set_audio_observer(observer)
                .map_err(|e| Error::device("set_audio_observer", e))?;
            self.device
                .enable_audio_output(AudioFormat::SYSTEM)
                .map_err(|e| Error::device("enable_audio_output", e))?;
            self.audio_output_enabled = true;
            self.set_state(PlayoutState::PrerollingAudio);
            self.device
                .begin_audio_preroll()
                .map_err(|e| Error::device("begin_audio_preroll", e))?;
            audio.preroll.wait_timeout(options.preroll_timeout)?;
            self.device
                .end_audio_preroll()
                .map_err(|e| Error::device("end_audio_preroll", e))?;
        }

        self.device
            .start_scheduled_playback(0, mode.time_scale, 1.0)
            .map_err(|e| Error::device("start_scheduled_playback", e))?;
        self.set_state(PlayoutState::Playing);

        tracing::info!(
            card = options.card_index,
            mode = mode.name,
            native = ?native,
            audio = options.audio,
            preroll_frames = options.preroll_frames,
            "playout started"
        );
        Ok(())
    }

    pub fn state(&self) -> PlayoutState {
        PlayoutState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(PlayoutState::Init)
    }

    /// Takes the producer end of the video queue created by [`open`](Self::open).
    pub fn take_video_input(&mut self) -> Option<HandoffProducer<Frame>> {
        self.video_tx.take()
    }

    /// Takes the producer end of the audio queue created by [`open`](Self::open).
    pub fn take_audio_input(&mut self) -> Option<HandoffProducer<AudioPacket>> {
        self.audio_tx.take()
    }

    pub fn options(&self) -> &PlayoutOptions {
        &self.options
    }

    /// The first fault raised on either device callback, if any.
    pub fn fault(&self) -> Option<&Error> {
        self.video
            .faults
            .get()
            .or_else(|| self.audio.as_ref().and_then(|a| a.faults.get()))
    }

    /// `Err` with the latched fault once a callback has gone inert.
    pub fn check(&self) -> std::result::Result<(), &Error> {
        match self.fault() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> PlayoutStats {
        let c = &self.video.counters;
        PlayoutStats {
            frame_counter: lock(&self.video.state).frame_counter,
            fresh_frames: c.fresh.load(Ordering::Relaxed),
            repeated_frames: c.repeated.load(Ordering::Relaxed),
            no_content: c.no_content.load(Ordering::Relaxed),
            displayed_late: c.displayed_late.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
            audio_frames_submitted: self
                .audio
                .as_ref()
                .map_or(0, |a| a.frames_submitted.load(Ordering::Relaxed)),
        }
    }
}

impl Drop for PlayoutScheduler {
    fn drop(&mut self) {
        let state = self.state();
        if state == PlayoutState::Playing {
            if let Err(e) = self.device.stop_scheduled_playback() {
                tracing::warn!("stop_scheduled_playback failed during playout teardown: {e}");
            }
        }
        if self.audio_output_enabled {
            if let Err(e) = self.device.disable_audio_output() {
                tracing::warn!("disable_audio_output failed during playout teardown: {e}");
            }
        }
        if state >= PlayoutState::Configured {
            if let Err(e) = self.device.disable_video_output() {
                tracing::warn!("disable_video_output failed during playout teardown: {e}");
            }
        }
        self.device.clear_observers();
        tracing::info!(frame_counter = self.stats().frame_counter, "playout stopped");
    }
}

impl fmt::Debug for PlayoutScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayoutScheduler")
            .field("state", &self.state())
            .field("options", &self.options)
            .field("stats", &self.stats())
            .field("fault", &self.fault())
            .finish()
    }
}
