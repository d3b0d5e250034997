//! Pull-based, audio/video synchronized decode of a media file.
//!
//! A [`SourceDecodeLoop`] reads compressed units from a container through the
//! [`MediaSource`] capability, decodes them, and hands out one [`SyncedFrame`]
//! per call to [`read_frame`](SourceDecodeLoop::read_frame): a canonical video
//! frame plus exactly one frame period of audio.
//!
//! The demux/decode library itself sits behind [`MediaBackend`]. Its one-time
//! global registration is owned by an explicit [`DecodeRuntime`] rather than a
//! process-wide flag.

use std::{
    collections::VecDeque,
    fmt,
    path::Path,
    sync::Arc,
};

use once_cell::sync::OnceCell;

use crate::{
    audio_sync::AudioSyncBuffer,
    convert::{pack_planar_422, Converter, Plane},
    error::DeviceResult,
    frames::{AudioFormat, AudioPacket, Frame, PixelFormat},
    timing::{AudioCadence, DisplayMode, Rational},
    Error, Result,
};

/// Name reported in every [`SyncedFrame`] unless overridden.
pub const DEFAULT_SOURCE_NAME: &str = "LAVF Rollout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Other,
}

/// Container-level description of one elementary stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: StreamKind,
    /// Frame count recorded in the container, if any.
    pub frame_count: Option<u64>,
    pub frame_rate: Option<Rational>,
}

/// One compressed packet read from the container.
#[derive(Debug, Clone)]
pub struct CompressedUnit {
    pub stream_index: usize,
    pub data: Vec<u8>,
}

/// Pixel layouts a video decoder may produce.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodedPixelFormat {
    /// Planar Y, Cb, Cr; chroma at half horizontal resolution.
    Yuv422Planar,
    /// As [`Yuv422Planar`](Self::Yuv422Planar), full-range.
    Yuvj422Planar,
    /// Packed, byte order Cb Y0 Cr Y1.
    Uyvy422,
    /// Anything else, by the decoder's name for it.
    Other(String),
}

#[derive(Debug, Clone)]
pub struct PicturePlane {
    pub data: Vec<u8>,
    pub stride: usize,
}

impl PicturePlane {
    fn as_plane(&self) -> Plane<'_> {
        Plane {
            data: &self.data,
            stride: self.stride,
        }
    }
}

/// A decoded video picture in the decoder's native layout.
#[derive(Debug, Clone)]
pub struct DecodedPicture {
    pub width: u32,
    pub height: u32,
    pub format: DecodedPixelFormat,
    pub planes: Vec<PicturePlane>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SampleFormat {
    S16,
    S32,
    F32,
    Other,
}

/// A decoded run of interleaved audio.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub n_frames: usize,
    pub data: Vec<u8>,
}

/// An opened container with its demuxer.
pub trait MediaSource: Send {
    fn streams(&self) -> Vec<StreamInfo>;
    fn open_decoder(&mut self, stream_index: usize) -> DeviceResult<()>;
    /// Next compressed unit, or `None` at end of stream.
    fn read_unit(&mut self) -> DeviceResult<Option<CompressedUnit>>;
    /// Feeds a unit to the video decoder; `None` if no picture completed.
    fn decode_video(&mut self, unit: &CompressedUnit) -> DeviceResult<Option<DecodedPicture>>;
    /// Feeds a unit to the audio decoder; `None` if no audio completed.
    fn decode_audio(&mut self, unit: &CompressedUnit) -> DeviceResult<Option<DecodedAudio>>;
}

/// Entry points of the demux/decode library.
pub trait MediaBackend: Send + Sync {
    /// One-time library registration.
    fn register(&self) -> DeviceResult<()>;
    fn open(&self, path: &Path) -> DeviceResult<Box<dyn MediaSource>>;
    /// Video frame count of the file at `path` without opening decoders.
    fn probe_frame_count(&self, path: &Path) -> DeviceResult<u64>;
}

/// Owner of the decode library's one-time registration.
///
/// [`initialize`](Self::initialize) is idempotent and thread-safe; every
/// entry point in this module calls it before touching the backend.
pub struct DecodeRuntime {
    backend: Arc<dyn MediaBackend>,
    registered: OnceCell<()>,
}

impl DecodeRuntime {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            registered: OnceCell::new(),
        }
    }

    /// Registers the backend on the first call; later calls return immediately.
    ///
    /// A failed registration is not remembered, so the next call retries.
    pub fn initialize(&self) -> Result<()> {
        self.registered
            .get_or_try_init(|| {
                self.backend
                    .register()
                    .map_err(|e| Error::device("MediaBackend::register", e))?;
                tracing::info!("decode backend registered");
                Ok::<(), Error>(())
            })
            .map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.registered.get().is_some()
    }

    pub fn backend(&self) -> &dyn MediaBackend {
        &*self.backend
    }
}

impl fmt::Debug for DecodeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeRuntime")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Video frame count of a file, without opening decoders.
pub fn probe_duration(runtime: &DecodeRuntime, path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    runtime.initialize()?;
    runtime
        .backend()
        .probe_frame_count(path)
        .map_err(|e| Error::SourceOpen(format!("{}: {e}", path.display())))
}

/// Options for [`SourceDecodeLoop::open`].
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub source_name: String,
    /// Frame rate used to size audio packets when the container has none.
    pub frame_rate: Option<Rational>,
}

impl SourceOptions {
    /// Create a builder for configuring source options
    pub fn builder() -> SourceOptionsBuilder {
        SourceOptionsBuilder::new()
    }
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            source_name: DEFAULT_SOURCE_NAME.into(),
            frame_rate: None,
        }
    }
}

/// Builder for [`SourceOptions`].
#[derive(Debug, Clone, Default)]
pub struct SourceOptionsBuilder {
    options: SourceOptions,
}

impl SourceOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn source_name<S: Into<String>>(mut self, name: S) -> Self {
        self.options.source_name = name.into();
        self
    }

    /// Override the container's frame rate for audio packet sizing
    #[must_use]
    pub fn frame_rate(mut self, rate: Rational) -> Self {
        self.options.frame_rate = Some(rate);
        self
    }

    /// Build the `SourceOptions`
    ///
    /// # Errors
    ///
    /// Returns an error if the source name is blank or the frame rate is not positive.
    pub fn build(self) -> Result<SourceOptions> {
        if self.options.source_name.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "source name cannot be empty or contain only whitespace".into(),
            ));
        }
        if let Some(rate) = self.options.frame_rate {
            if rate.num <= 0 || rate.den <= 0 {
                return Err(Error::InvalidConfiguration(format!(
                    "frame rate must be positive, got {rate}"
                )));
            }
        }
        Ok(self.options)
    }
}

/// One video frame with the audio that plays during it.
#[derive(Debug)]
pub struct SyncedFrame {
    pub video: Frame,
    pub audio: AudioPacket,
    /// Zero-based index of this frame in the stream.
    pub position: u64,
    pub source_name: Arc<str>,
}

/// Decodes a file into [`SyncedFrame`]s on demand.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use replay_pipeline::{
///     source::{DecodeRuntime, MediaBackend, SourceDecodeLoop, SourceOptions},
///     Rational,
/// };
///
/// # fn run(backend: Arc<dyn MediaBackend>) -> replay_pipeline::Result<()> {
/// let runtime = DecodeRuntime::new(backend);
/// let mut source = SourceDecodeLoop::open(&runtime, "clip.mov", &SourceOptions::default())?;
/// while let Some(frame) = source.read_frame(Rational::ONE)? {
///     println!("frame {} of {}", frame.position, source.duration());
/// }
/// # Ok(())
/// # }
/// ```
pub struct SourceDecodeLoop {
    source: Box<dyn MediaSource>,
    video_stream: usize,
    audio_stream: usize,
    duration: u64,
    pending_video: VecDeque<Frame>,
    pending_audio: AudioSyncBuffer,
    cadence: AudioCadence,
    frames_read: u64,
    source_name: Arc<str>,
}

impl SourceDecodeLoop {
    /// Opens `path`, selects its video and audio streams and opens both decoders.
    ///
    /// # Errors
    ///
    /// [`Error::SourceOpen`] if the file cannot be opened, lacks a video or an
    /// audio stream, or a decoder cannot be opened.
    pub fn open(
        runtime: &DecodeRuntime,
        path: impl AsRef<Path>,
        options: &SourceOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        runtime.initialize()?;

        let open_err = |what: &str| Error::SourceOpen(format!("{}: {what}", path.display()));

        let mut source = runtime
            .backend()
            .open(path)
            .map_err(|e| open_err(&e.to_string()))?;

        let streams = source.streams();
        // When a kind appears more than once the last stream of it wins.
        let video = streams
            .iter()
            .rev()
            .find(|s| s.kind == StreamKind::Video)
            .cloned()
            .ok_or_else(|| open_err("no video stream"))?;
        let audio_stream = streams
            .iter()
            .rev()
            .find(|s| s.kind == StreamKind::Audio)
            .map(|s| s.index)
            .ok_or_else(|| open_err("no audio stream"))?;

        source
            .open_decoder(video.index)
            .map_err(|e| open_err(&format!("video decoder: {e}")))?;
        source
            .open_decoder(audio_stream)
            .map_err(|e| open_err(&format!("audio decoder: {e}")))?;

        let frame_rate = options
            .frame_rate
            .or(video.frame_rate)
            .unwrap_or_else(|| DisplayMode::default().frame_rate());
        let cadence = AudioCadence::new(AudioFormat::SYSTEM.sample_rate, frame_rate)?;
        let duration = video.frame_count.unwrap_or(0);

        tracing::info!(
            path = %path.display(),
            video_stream = video.index,
            audio_stream,
            duration,
            %frame_rate,
            "media source opened"
        );

        Ok(Self {
            source,
            video_stream: video.index,
            audio_stream,
            duration,
            pending_video: VecDeque::new(),
            pending_audio: AudioSyncBuffer::new(AudioFormat::SYSTEM),
            cadence,
            frames_read: 0,
            source_name: Arc::from(options.source_name.as_str()),
        })
    }

    /// Frames delivered so far.
    pub fn position(&self) -> u64 {
        self.frames_read
    }

    /// Video frame count recorded in the container (0 if unknown).
    pub fn duration(&self) -> u64 {
        self.duration
    }

    /// Decodes until one video picture or one audio run completes.
    ///
    /// Returns `Ok(false)` at end of stream.
    pub fn run_decoder(&mut self) -> Result<bool> {
        loop {
            let Some(unit) = self
                .source
                .read_unit()
                .map_err(|e| Error::device_fault("MediaSource::read_unit", e))?
            else {
                return Ok(false);
            };

            if unit.stream_index == self.video_stream {
                let picture = self
                    .source
                    .decode_video(&unit)
                    .map_err(|e| Error::device_fault("MediaSource::decode_video", e))?;
                if let Some(picture) = picture {
                    self.pending_video.push_back(picture_to_frame(picture)?);
                    return Ok(true);
                }
            } else if unit.stream_index == self.audio_stream {
                let audio = self
                    .source
                    .decode_audio(&unit)
                    .map_err(|e| Error::device_fault("MediaSource::decode_audio", e))?;
                if let Some(audio) = audio {
                    check_audio(&audio)?;
                    self.pending_audio.add_samples(audio.n_frames, &audio.data)?;
                    return Ok(true);
                }
            }
        }
    }

    /// Next synchronized frame, or `None` at end of stream.
    ///
    /// `speed` is accepted for interface compatibility and currently unused;
    /// frames are always delivered at normal rate.
    pub fn read_frame(&mut self, speed: Rational) -> Result<Option<SyncedFrame>> {
        let _ = speed;
        let wanted = self.cadence.peek_packet_frames();

        while self.pending_video.is_empty() || self.pending_audio.samples() < wanted {
            if !self.run_decoder()? {
                tracing::debug!(
                    position = self.frames_read,
                    pending_video = self.pending_video.len(),
                    pending_audio = self.pending_audio.samples(),
                    "end of stream"
                );
                return Ok(None);
            }
        }

        let Some(video) = self.pending_video.pop_front() else {
            return Ok(None);
        };
        let mut audio = AudioPacket::silent(AudioFormat::SYSTEM, self.cadence.next_packet_frames());
        self.pending_audio.fill_packet(&mut audio)?;

        let position = self.frames_read;
        self.frames_read += 1;
        Ok(Some(SyncedFrame {
            video,
            audio,
            position,
            source_name: Arc::clone(&self.source_name),
        }))
    }
}

impl fmt::Debug for SourceDecodeLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDecodeLoop")
            .field("source_name", &self.source_name)
            .field("video_stream", &self.video_stream)
            .field("audio_stream", &self.audio_stream)
            .field("position", &self.frames_read)
            .field("duration", &self.duration)
            .field("pending_video", &self.pending_video.len())
            .field("pending_audio", &self.pending_audio.samples())
            .finish()
    }
}

fn check_audio(audio: &DecodedAudio) -> Result<()> {
    let want = AudioFormat::SYSTEM;
    if audio.sample_format != SampleFormat::S16 {
        return Err(Error::ContractViolation(format!(
            "decoded audio is {:?}, need signed 16-bit",
            audio.sample_format
        )));
    }
    if audio.sample_rate != want.sample_rate {
        return Err(Error::ContractViolation(format!(
            "decoded audio is {} Hz, need {} Hz",
            audio.sample_rate, want.sample_rate
        )));
    }
    if audio.channels != want.channels {
        return Err(Error::ContractViolation(format!(
            "decoded audio has {} channels, need {}",
            audio.channels, want.channels
        )));
    }
    Ok(())
}

fn picture_to_frame(picture: DecodedPicture) -> Result<Frame> {
    let plane = |i: usize| {
        picture.planes.get(i).ok_or_else(|| {
            Error::ContractViolation(format!(
                "{:?} picture has {} planes",
                picture.format,
                picture.planes.len()
            ))
        })
    };

    match &picture.format {
        DecodedPixelFormat::Yuv422Planar | DecodedPixelFormat::Yuvj422Planar => pack_planar_422(
            picture.width,
            picture.height,
            plane(0)?.as_plane(),
            plane(1)?.as_plane(),
            plane(2)?.as_plane(),
        ),
        DecodedPixelFormat::Uyvy422 => {
            let packed = plane(0)?;
            Converter::resolve(PixelFormat::CbYCrY8422, None)?.pack(
                &packed.data,
                packed.stride,
                picture.width,
                picture.height,
            )
        }
        DecodedPixelFormat::Other(name) => Err(Error::ContractViolation(format!(
            "cannot convert decoded pixel format {name}"
        ))),
    }
}
