//! Software capture/playout card.
//!
//! [`LoopbackCard`] implements the [`device`](crate::device) traits in memory so
//! the adapters can run without hardware. Nothing here runs on its own clock:
//! the output side advances one frame per [`LoopbackOutput::tick`], and the
//! input side delivers exactly what is passed to [`LoopbackInput::deliver`].
//! Every scheduled frame and every accepted audio sample is recorded for
//! inspection.
//!
//! The one exception is audio preroll, where a real card calls the render
//! observer repeatedly from its own thread. The loopback output does the same
//! between `begin_audio_preroll` and `end_audio_preroll`.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    convert::NativePixelFormat,
    device::{
        AudioConnection, AudioRenderObserver, CompletionResult, ConfigFlag, DeviceDiscovery,
        FrameFlags, InputAudioPacket, InputDevice, InputFrameObserver, InputVideoFrame,
        OutputDevice, OutputVideoFrame, VideoCompletionObserver,
    },
    error::{DeviceError, DeviceResult},
    frames::AudioFormat,
    timing::{DisplayMode, VideoConnection},
};

const PREROLL_PUMP_INTERVAL: Duration = Duration::from_millis(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Call log plus injected failures, shared by both halves of the card.
#[derive(Default)]
struct CallLog {
    calls: Vec<&'static str>,
    failing: HashSet<&'static str>,
}

impl CallLog {
    fn enter(&mut self, call: &'static str) -> DeviceResult<()> {
        self.calls.push(call);
        if self.failing.contains(call) {
            return Err(DeviceError::new(-1, format!("{call}: injected failure")));
        }
        Ok(())
    }
}

/// One in-memory card with an output and an input side.
///
/// # Examples
///
/// ```
/// use replay_pipeline::{device::DeviceDiscovery, loopback::LoopbackCard};
///
/// let card = LoopbackCard::new();
/// assert_eq!(card.device_count(), 1);
/// assert!(card.open_output(1).is_err());
/// ```
#[derive(Clone)]
pub struct LoopbackCard {
    output: Arc<LoopbackOutput>,
    input: Arc<LoopbackInput>,
}

impl LoopbackCard {
    /// A card whose audio buffer holds one second and drains 1602 sample frames per tick.
    pub fn new() -> Self {
        Self::with_audio_buffer(48_000, 1602)
    }

    /// A card whose audio buffer holds `capacity` sample frames and plays
    /// `drain_per_tick` of them on each [`LoopbackOutput::tick`].
    pub fn with_audio_buffer(capacity: usize, drain_per_tick: usize) -> Self {
        Self {
            output: Arc::new(LoopbackOutput::new(capacity, drain_per_tick)),
            input: Arc::new(LoopbackInput::default()),
        }
    }

    pub fn output(&self) -> &Arc<LoopbackOutput> {
        &self.output
    }

    pub fn input(&self) -> &Arc<LoopbackInput> {
        &self.input
    }
}

impl Default for LoopbackCard {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDiscovery for LoopbackCard {
    fn device_count(&self) -> usize {
        1
    }

    fn open_output(&self, index: usize) -> DeviceResult<Arc<dyn OutputDevice>> {
        if index != 0 {
            return Err(DeviceError::new(-2, format!("no card {index}")));
        }
        Ok(self.output.clone())
    }

    fn open_input(&self, index: usize) -> DeviceResult<Arc<dyn InputDevice>> {
        if index != 0 {
            return Err(DeviceError::new(-2, format!("no card {index}")));
        }
        Ok(self.input.clone())
    }
}

impl fmt::Debug for LoopbackCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackCard").finish_non_exhaustive()
    }
}

/// Device-owned output frame.
pub struct LoopbackVideoFrame {
    width: u32,
    height: u32,
    row_bytes: usize,
    format: NativePixelFormat,
    data: Vec<u8>,
}

impl OutputVideoFrame for LoopbackVideoFrame {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    fn pixel_format(&self) -> NativePixelFormat {
        self.format
    }

    fn bytes(&self) -> DeviceResult<&[u8]> {
        Ok(&self.data)
    }

    fn bytes_mut(&mut self) -> DeviceResult<&mut [u8]> {
        Ok(&mut self.data)
    }
}

/// A frame as it was when scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRecord {
    pub display_time: i64,
    pub duration: i64,
    pub time_scale: i64,
    pub data: Vec<u8>,
}

struct OutputState {
    log: CallLog,
    completion: Option<Arc<dyn VideoCompletionObserver>>,
    audio: Option<Arc<dyn AudioRenderObserver>>,
    video_mode: Option<DisplayMode>,
    audio_format: Option<AudioFormat>,
    low_latency: bool,
    playing: bool,
    pending: VecDeque<Box<dyn OutputVideoFrame>>,
    history: Vec<ScheduledRecord>,
    audio_buffered: usize,
    audio_played: Vec<u8>,
    over_accept: bool,
    next_result: VecDeque<CompletionResult>,
}

/// Output side of a [`LoopbackCard`].
pub struct LoopbackOutput {
    state: Mutex<OutputState>,
    audio_capacity: usize,
    audio_drain_per_tick: usize,
    pumping: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackOutput {
    fn new(audio_capacity: usize, audio_drain_per_tick: usize) -> Self {
        Self {
            state: Mutex::new(OutputState {
                log: CallLog::default(),
                completion: None,
                audio: None,
                video_mode: None,
                audio_format: None,
                low_latency: false,
                playing: false,
                pending: VecDeque::new(),
                history: Vec::new(),
                audio_buffered: 0,
                audio_played: Vec::new(),
                over_accept: false,
                next_result: VecDeque::new(),
            }),
            audio_capacity,
            audio_drain_per_tick,
            pumping: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
        }
    }

    /// Makes every later call to the method named `call` fail.
    pub fn fail(&self, call: &'static str) {
        lock(&self.state).log.failing.insert(call);
    }

    /// Makes the device report one more accepted sample frame than offered.
    pub fn over_accept_audio(&self, enabled: bool) {
        lock(&self.state).over_accept = enabled;
    }

    /// Result reported for the next completed frame instead of `Completed`.
    pub fn queue_completion_result(&self, result: CompletionResult) {
        lock(&self.state).next_result.push_back(result);
    }

    /// Completes the oldest scheduled frame and plays one tick of audio.
    ///
    /// Returns false if nothing was scheduled.
    pub fn tick(&self) -> bool {
        let (frame, result, completion, audio) = {
            let mut state = lock(&self.state);
            let Some(frame) = state.pending.pop_front() else {
                return false;
            };
            let result = state
                .next_result
                .pop_front()
                .unwrap_or(CompletionResult::Completed);
            state.audio_buffered = state.audio_buffered.saturating_sub(self.audio_drain_per_tick);
            (frame, result, state.completion.clone(), state.audio.clone())
        };

        if let Some(observer) = completion {
            observer.scheduled_frame_completed(frame, result);
        }
        if let Some(observer) = audio {
            observer.render_audio_samples(false);
        }
        true
    }

    /// Every frame scheduled so far, in scheduling order.
    pub fn scheduled(&self) -> Vec<ScheduledRecord> {
        lock(&self.state).history.clone()
    }

    pub fn pending_frames(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// All audio bytes the device has accepted.
    pub fn audio_accepted(&self) -> Vec<u8> {
        lock(&self.state).audio_played.clone()
    }

    pub fn audio_buffered(&self) -> usize {
        lock(&self.state).audio_buffered
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.state).playing
    }

    pub fn low_latency(&self) -> bool {
        lock(&self.state).low_latency
    }

    pub fn has_observers(&self) -> bool {
        let state = lock(&self.state);
        state.completion.is_some() || state.audio.is_some()
    }

    /// Names of the device methods called so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.state).log.calls.clone()
    }

    fn stop_pump(&self) {
        self.pumping.store(false, Ordering::Release);
        if let Some(handle) = lock(&self.pump).take() {
            let _ = handle.join();
        }
    }
}

impl OutputDevice for LoopbackOutput {
    fn set_config_flag(&self, flag: ConfigFlag, value: bool) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("set_config_flag")?;
        match flag {
            ConfigFlag::LowLatencyVideoOutput => state.low_latency = value,
        }
        Ok(())
    }

    fn set_completion_observer(
        &self,
        observer: Arc<dyn VideoCompletionObserver>,
    ) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("set_completion_observer")?;
        state.completion = Some(observer);
        Ok(())
    }

    fn set_audio_observer(&self, observer: Arc<dyn AudioRenderObserver>) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("set_audio_observer")?;
        state.audio = Some(observer);
        Ok(())
    }

    fn clear_observers(&self) {
        self.stop_pump();
        let mut state = lock(&self.state);
        state.log.calls.push("clear_observers");
        state.completion = None;
        state.audio = None;
        state.pending.clear();
    }

    fn enable_video_output(&self, mode: &DisplayMode) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("enable_video_output")?;
        state.video_mode = Some(*mode);
        Ok(())
    }

    fn disable_video_output(&self) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("disable_video_output")?;
        state.video_mode = None;
        Ok(())
    }

    fn create_video_frame(
        &self,
        width: u32,
        height: u32,
        row_bytes: usize,
        format: NativePixelFormat,
    ) -> DeviceResult<Box<dyn OutputVideoFrame>> {
        let mut state = lock(&self.state);
        state.log.enter("create_video_frame")?;
        Ok(Box::new(LoopbackVideoFrame {
            width,
            height,
            row_bytes,
            format,
            data: vec![0; row_bytes * height as usize],
        }))
    }

    fn schedule_video_frame(
        &self,
        frame: Box<dyn OutputVideoFrame>,
        display_time: i64,
        duration: i64,
        time_scale: i64,
    ) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("schedule_video_frame")?;
        if state.video_mode.is_none() {
            return Err(DeviceError::new(-3, "video output is not enabled"));
        }
        let data = frame.bytes()?.to_vec();
        state.history.push(ScheduledRecord {
            display_time,
            duration,
            time_scale,
            data,
        });
        state.pending.push_back(frame);
        Ok(())
    }

    fn enable_audio_output(&self, format: AudioFormat) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("enable_audio_output")?;
        state.audio_format = Some(format);
        Ok(())
    }

    fn disable_audio_output(&self) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("disable_audio_output")?;
        state.audio_format = None;
        Ok(())
    }

    fn begin_audio_preroll(&self) -> DeviceResult<()> {
        let observer = {
            let mut state = lock(&self.state);
            state.log.enter("begin_audio_preroll")?;
            state.audio.clone()
        };
        let Some(observer) = observer else {
            return Err(DeviceError::new(-3, "no audio observer registered"));
        };

        self.pumping.store(true, Ordering::Release);
        let pumping = Arc::clone(&self.pumping);
        let handle = thread::Builder::new()
            .name("loopback-preroll".into())
            .spawn(move || {
                while pumping.load(Ordering::Acquire) {
                    observer.render_audio_samples(true);
                    thread::sleep(PREROLL_PUMP_INTERVAL);
                }
            })
            .map_err(|e| DeviceError::new(-4, format!("spawn preroll thread: {e}")))?;
        *lock(&self.pump) = Some(handle);
        Ok(())
    }

    fn end_audio_preroll(&self) -> DeviceResult<()> {
        self.stop_pump();
        lock(&self.state).log.enter("end_audio_preroll")
    }

    fn schedule_audio_samples(&self, samples: &[u8], frame_count: usize) -> DeviceResult<usize> {
        let mut state = lock(&self.state);
        state.log.enter("schedule_audio_samples")?;
        let Some(format) = state.audio_format else {
            return Err(DeviceError::new(-3, "audio output is not enabled"));
        };
        let free = self.audio_capacity.saturating_sub(state.audio_buffered);
        let accepted = frame_count.min(free);
        let len = (accepted * format.frame_bytes()).min(samples.len());
        state.audio_played.extend_from_slice(&samples[..len]);
        state.audio_buffered += accepted;
        if state.over_accept {
            return Ok(frame_count + 1);
        }
        Ok(accepted)
    }

    fn start_scheduled_playback(
        &self,
        _start_time: i64,
        _time_scale: i64,
        _speed: f64,
    ) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("start_scheduled_playback")?;
        state.playing = true;
        Ok(())
    }

    fn stop_scheduled_playback(&self) -> DeviceResult<()> {
        let completion = {
            let mut state = lock(&self.state);
            state.log.enter("stop_scheduled_playback")?;
            state.playing = false;
            state.completion.clone()
        };
        if let Some(observer) = completion {
            observer.scheduled_playback_stopped();
        }
        Ok(())
    }
}

impl fmt::Debug for LoopbackOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("LoopbackOutput")
            .field("playing", &state.playing)
            .field("pending", &state.pending.len())
            .field("scheduled", &state.history.len())
            .field("audio_buffered", &state.audio_buffered)
            .finish()
    }
}

/// A captured frame handed to [`LoopbackInput::deliver`].
///
/// Counts outstanding `add_ref` calls so tests can check that every reference
/// taken by the pipeline is released.
pub struct LoopbackInputFrame {
    width: u32,
    height: u32,
    row_bytes: usize,
    format: u32,
    flags: FrameFlags,
    data: Vec<u8>,
    refs: AtomicUsize,
}

impl LoopbackInputFrame {
    pub fn new(
        width: u32,
        height: u32,
        row_bytes: usize,
        format: NativePixelFormat,
        data: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            row_bytes,
            format: format.into(),
            flags: FrameFlags::NONE,
            data,
            refs: AtomicUsize::new(0),
        })
    }

    /// 8-bit 4:2:2 frame with every byte set to `fill`.
    pub fn yuv(width: u32, height: u32, fill: u8) -> Arc<Self> {
        let format = NativePixelFormat::Yuv8Bit422;
        let row_bytes = format.min_row_bytes(width);
        Self::new(
            width,
            height,
            row_bytes,
            format,
            vec![fill; row_bytes * height as usize],
        )
    }

    /// ARGB frame with every pixel set to `argb`.
    pub fn argb(width: u32, height: u32, argb: [u8; 4]) -> Arc<Self> {
        let format = NativePixelFormat::Argb8Bit;
        let row_bytes = format.min_row_bytes(width);
        Self::new(
            width,
            height,
            row_bytes,
            format,
            argb.repeat(width as usize * height as usize),
        )
    }

    /// Filler frame flagged as having no input signal.
    pub fn no_signal(width: u32, height: u32) -> Arc<Self> {
        let format = NativePixelFormat::Yuv8Bit422;
        let row_bytes = format.min_row_bytes(width);
        Arc::new(Self {
            width,
            height,
            row_bytes,
            format: format.into(),
            flags: FrameFlags::NO_INPUT_SOURCE,
            data: vec![0; row_bytes * height as usize],
            refs: AtomicUsize::new(0),
        })
    }

    /// References taken by the pipeline and not yet released.
    pub fn outstanding_refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

impl InputVideoFrame for LoopbackInputFrame {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    fn pixel_format(&self) -> u32 {
        self.format
    }

    fn flags(&self) -> FrameFlags {
        self.flags
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Interleaved audio delivered with a captured frame.
#[derive(Debug, Clone)]
pub struct LoopbackAudioPacket {
    pub n_frames: usize,
    pub data: Vec<u8>,
}

impl LoopbackAudioPacket {
    /// `n_frames` of 48 kHz stereo S16 with every byte set to `fill`.
    pub fn filled(n_frames: usize, fill: u8) -> Self {
        Self {
            n_frames,
            data: vec![fill; n_frames * AudioFormat::SYSTEM.frame_bytes()],
        }
    }
}

impl InputAudioPacket for LoopbackAudioPacket {
    fn sample_frame_count(&self) -> usize {
        self.n_frames
    }

    fn bytes(&self) -> DeviceResult<&[u8]> {
        Ok(&self.data)
    }
}

#[derive(Default)]
struct InputState {
    log: CallLog,
    observer: Option<Arc<dyn InputFrameObserver>>,
    connection: Option<VideoConnection>,
    audio_connection: Option<AudioConnection>,
    video: Option<(DisplayMode, NativePixelFormat)>,
    audio: Option<AudioFormat>,
    streaming: bool,
}

/// Input side of a [`LoopbackCard`].
#[derive(Default)]
pub struct LoopbackInput {
    state: Mutex<InputState>,
}

impl LoopbackInput {
    /// Makes every later call to the method named `call` fail.
    pub fn fail(&self, call: &'static str) {
        lock(&self.state).log.failing.insert(call);
    }

    /// Invokes the registered observer as a capture callback would.
    ///
    /// Returns false, delivering nothing, unless streams are running.
    pub fn deliver(
        &self,
        video: Option<Arc<LoopbackInputFrame>>,
        audio: Option<LoopbackAudioPacket>,
    ) -> bool {
        let observer = {
            let state = lock(&self.state);
            if !state.streaming {
                return false;
            }
            state.observer.clone()
        };
        let Some(observer) = observer else {
            return false;
        };
        let video = video.map(|v| v as Arc<dyn InputVideoFrame>);
        observer.frame_arrived(video, audio.as_ref().map(|a| a as &dyn InputAudioPacket));
        true
    }

    /// Reports an input format change to the observer.
    pub fn change_format(&self, mode_code: u32) {
        let observer = lock(&self.state).observer.clone();
        if let Some(observer) = observer {
            observer.format_changed(mode_code);
        }
    }

    pub fn connection(&self) -> Option<VideoConnection> {
        lock(&self.state).connection
    }

    pub fn enabled_video(&self) -> Option<(DisplayMode, NativePixelFormat)> {
        lock(&self.state).video
    }

    pub fn enabled_audio(&self) -> Option<AudioFormat> {
        lock(&self.state).audio
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.state).streaming
    }

    pub fn has_observer(&self) -> bool {
        lock(&self.state).observer.is_some()
    }

    /// Names of the device methods called so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.state).log.calls.clone()
    }
}

impl InputDevice for LoopbackInput {
    fn set_video_connection(&self, connection: VideoConnection) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("set_video_connection")?;
        state.connection = Some(connection);
        Ok(())
    }

    fn set_audio_connection(&self, connection: AudioConnection) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("set_audio_connection")?;
        state.audio_connection = Some(connection);
        Ok(())
    }

    fn enable_video_input(&self, mode: &DisplayMode, format: NativePixelFormat) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("enable_video_input")?;
        state.video = Some((*mode, format));
        Ok(())
    }

    fn disable_video_input(&self) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("disable_video_input")?;
        state.video = None;
        Ok(())
    }

    fn enable_audio_input(&self, format: AudioFormat) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("enable_audio_input")?;
        state.audio = Some(format);
        Ok(())
    }

    fn disable_audio_input(&self) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("disable_audio_input")?;
        state.audio = None;
        Ok(())
    }

    fn set_input_observer(&self, observer: Arc<dyn InputFrameObserver>) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("set_input_observer")?;
        state.observer = Some(observer);
        Ok(())
    }

    fn clear_input_observer(&self) {
        let mut state = lock(&self.state);
        state.log.calls.push("clear_input_observer");
        state.observer = None;
    }

    fn start_streams(&self) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("start_streams")?;
        state.streaming = true;
        Ok(())
    }

    fn stop_streams(&self) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.log.enter("stop_streams")?;
        state.streaming = false;
        Ok(())
    }
}

impl fmt::Debug for LoopbackInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("LoopbackInput")
            .field("streaming", &state.streaming)
            .field("connection", &state.connection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injected_failure_is_reported() {
        let card = LoopbackCard::new();
        card.output().fail("enable_video_output");
        let err = card
            .output()
            .enable_video_output(&DisplayMode::default())
            .unwrap_err();
        assert!(err.message.contains("enable_video_output"));
        assert_eq!(card.output().calls(), vec!["enable_video_output"]);
    }

    #[test]
    fn test_audio_acceptance_is_bounded_by_capacity() {
        let card = LoopbackCard::with_audio_buffer(100, 10);
        let out = card.output();
        out.enable_audio_output(AudioFormat::SYSTEM).unwrap();
        assert_eq!(out.schedule_audio_samples(&[0; 240], 60).unwrap(), 60);
        assert_eq!(out.schedule_audio_samples(&[0; 240], 60).unwrap(), 40);
        assert_eq!(out.schedule_audio_samples(&[0; 240], 60).unwrap(), 0);
        assert_eq!(out.audio_accepted().len(), 400);
    }

    #[test]
    fn test_deliver_requires_streaming() {
        let card = LoopbackCard::new();
        assert!(!card.input().deliver(Some(LoopbackInputFrame::yuv(2, 2, 0)), None));
    }

    #[test]
    fn test_input_frame_refcount() {
        let frame = LoopbackInputFrame::yuv(2, 2, 0);
        frame.add_ref();
        assert_eq!(frame.outstanding_refs(), 1);
        frame.release();
        assert_eq!(frame.outstanding_refs(), 0);
    }
}
