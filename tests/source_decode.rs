/// Decode loop behavior with a synthetic media backend.
///
/// The backend fabricates a clip of planar 4:2:2 pictures at 29.97 fps with
/// audio in 1024-sample bursts, the way a typical AAC track arrives.
use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use replay_pipeline::{
    source::{
        probe_duration, CompressedUnit, DecodeRuntime, DecodedAudio, DecodedPicture,
        DecodedPixelFormat, MediaBackend, MediaSource, PicturePlane, SampleFormat, StreamInfo,
        StreamKind, SourceDecodeLoop, SourceOptions, DEFAULT_SOURCE_NAME,
    },
    DeviceError, DeviceResult, Error, ErrorCategory, PixelFormat, Rational,
};

const WIDTH: u32 = 4;
const HEIGHT: u32 = 2;
const BURST: usize = 1024;

struct SyntheticClip {
    streams: Vec<StreamInfo>,
    units: VecDeque<CompressedUnit>,
    main_audio: usize,
}

impl SyntheticClip {
    /// A clip with `audio_tracks` audio streams after the video stream. Every
    /// track but the last is a mono commentary track.
    fn new(frames: u64, audio_tracks: usize) -> Self {
        let mut streams = vec![StreamInfo {
            index: 0,
            kind: StreamKind::Video,
            frame_count: Some(frames),
            frame_rate: Some(Rational::new(30000, 1001)),
        }];
        for index in 1..=audio_tracks {
            streams.push(StreamInfo {
                index,
                kind: StreamKind::Audio,
                frame_count: None,
                frame_rate: None,
            });
        }

        // Enough audio to cover every frame, interleaved one burst per track after each picture.
        let total_samples = (frames as usize * 8008).div_ceil(5);
        let bursts = total_samples.div_ceil(BURST);
        let mut units = VecDeque::new();
        for i in 0..frames.max(bursts as u64) {
            if i < frames {
                units.push_back(CompressedUnit {
                    stream_index: 0,
                    data: vec![i as u8],
                });
            }
            if (i as usize) < bursts {
                for index in 1..=audio_tracks {
                    units.push_back(CompressedUnit {
                        stream_index: index,
                        data: vec![i as u8],
                    });
                }
            }
        }

        Self {
            streams,
            units,
            main_audio: audio_tracks,
        }
    }
}

impl MediaSource for SyntheticClip {
    fn streams(&self) -> Vec<StreamInfo> {
        self.streams.clone()
    }

    fn open_decoder(&mut self, stream_index: usize) -> DeviceResult<()> {
        match self.streams.get(stream_index) {
            Some(_) => Ok(()),
            None => Err(DeviceError::new(-22, format!("no stream {stream_index}"))),
        }
    }

    fn read_unit(&mut self) -> DeviceResult<Option<CompressedUnit>> {
        Ok(self.units.pop_front())
    }

    fn decode_video(&mut self, unit: &CompressedUnit) -> DeviceResult<Option<DecodedPicture>> {
        let luma = unit.data[0];
        let chroma_width = WIDTH.div_ceil(2) as usize;
        let plane = |value: u8, width: usize| PicturePlane {
            data: vec![value; width * HEIGHT as usize],
            stride: width,
        };
        Ok(Some(DecodedPicture {
            width: WIDTH,
            height: HEIGHT,
            format: DecodedPixelFormat::Yuv422Planar,
            planes: vec![
                plane(luma, WIDTH as usize),
                plane(0x80, chroma_width),
                plane(0x80, chroma_width),
            ],
        }))
    }

    fn decode_audio(&mut self, unit: &CompressedUnit) -> DeviceResult<Option<DecodedAudio>> {
        let channels = if unit.stream_index == self.main_audio { 2 } else { 1 };
        Ok(Some(DecodedAudio {
            sample_format: SampleFormat::S16,
            sample_rate: 48_000,
            channels,
            n_frames: BURST,
            data: vec![0; BURST * 2 * channels as usize],
        }))
    }
}

struct SyntheticBackend {
    frames: u64,
    audio_tracks: usize,
    registrations: AtomicUsize,
}

impl SyntheticBackend {
    fn new(frames: u64, audio_tracks: usize) -> Arc<Self> {
        Arc::new(Self {
            frames,
            audio_tracks,
            registrations: AtomicUsize::new(0),
        })
    }
}

impl MediaBackend for SyntheticBackend {
    fn register(&self) -> DeviceResult<()> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open(&self, path: &Path) -> DeviceResult<Box<dyn MediaSource>> {
        if path.extension().is_some_and(|ext| ext == "missing") {
            return Err(DeviceError::new(-2, "No such file or directory"));
        }
        Ok(Box::new(SyntheticClip::new(self.frames, self.audio_tracks)))
    }

    fn probe_frame_count(&self, _path: &Path) -> DeviceResult<u64> {
        Ok(self.frames)
    }
}

#[test]
fn test_frames_carry_cadenced_audio() -> Result<(), Error> {
    let backend = SyntheticBackend::new(10, 1);
    let runtime = DecodeRuntime::new(backend.clone());
    let mut source = SourceDecodeLoop::open(&runtime, "clip.mov", &SourceOptions::default())?;
    assert_eq!(source.duration(), 10);

    let mut sizes = Vec::new();
    while let Some(frame) = source.read_frame(Rational::ONE)? {
        assert_eq!(frame.position, sizes.len() as u64);
        assert_eq!(frame.video.pixel_format(), PixelFormat::CbYCrY8422);
        assert_eq!(frame.video.data()[1], frame.position as u8);
        assert_eq!(&*frame.source_name, DEFAULT_SOURCE_NAME);
        sizes.push(frame.audio.n_frames());
    }

    assert_eq!(sizes, vec![1601, 1602, 1601, 1602, 1602, 1601, 1602, 1601, 1602, 1602]);
    assert_eq!(sizes.iter().sum::<usize>(), 16016);
    assert_eq!(source.position(), 10);
    assert_eq!(backend.registrations.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_runtime_registers_once() -> Result<(), Error> {
    let backend = SyntheticBackend::new(2, 1);
    let runtime = DecodeRuntime::new(backend.clone());
    assert!(!runtime.is_initialized());
    let _a = SourceDecodeLoop::open(&runtime, "a.mov", &SourceOptions::default())?;
    let _b = SourceDecodeLoop::open(&runtime, "b.mov", &SourceOptions::default())?;
    assert!(runtime.is_initialized());
    assert_eq!(backend.registrations.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_missing_audio_stream_fails_open() {
    let runtime = DecodeRuntime::new(SyntheticBackend::new(2, 0));
    let err = SourceDecodeLoop::open(&runtime, "silent.mov", &SourceOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::SourceOpen(_)));
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("no audio stream"), "{err}");
}

#[test]
fn test_unopenable_file() {
    let runtime = DecodeRuntime::new(SyntheticBackend::new(2, 1));
    let err = SourceDecodeLoop::open(&runtime, "clip.missing", &SourceOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("clip.missing"), "{err}");
}

#[test]
fn test_probe_duration() -> Result<(), Error> {
    let runtime = DecodeRuntime::new(SyntheticBackend::new(1234, 1));
    assert_eq!(probe_duration(&runtime, "clip.mov")?, 1234);
    Ok(())
}

#[test]
fn test_custom_source_name() -> Result<(), Error> {
    let runtime = DecodeRuntime::new(SyntheticBackend::new(1, 1));
    let options = SourceOptions::builder().source_name("Replay A").build()?;
    let mut source = SourceDecodeLoop::open(&runtime, "clip.mov", &options)?;
    let frame = source.read_frame(Rational::ONE)?.expect("one frame");
    assert_eq!(&*frame.source_name, "Replay A");
    assert!(source.read_frame(Rational::ONE)?.is_none());
    Ok(())
}

#[test]
fn test_last_audio_stream_is_used() -> Result<(), Error> {
    let runtime = DecodeRuntime::new(SyntheticBackend::new(4, 2));
    let mut source = SourceDecodeLoop::open(&runtime, "dual.mov", &SourceOptions::default())?;

    let mut frames = 0;
    while let Some(frame) = source.read_frame(Rational::ONE)? {
        assert_eq!(frame.audio.format().channels, 2);
        frames += 1;
    }
    assert_eq!(frames, 4);
    Ok(())
}
