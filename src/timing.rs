//! Frame timing: rationals, display modes and per-frame audio cadence.

use std::fmt;

use crate::{Error, Result};

/// An exact fraction, used for frame rates and playback speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const ONE: Rational = Rational { num: 1, den: 1 };

    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl Default for Rational {
    fn default() -> Self {
        Rational::ONE
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// A video standard supported by the output and input adapters.
///
/// `time_scale` ticks make one second; one frame lasts `frame_duration` ticks.
/// Presentation time for frame `n` is therefore `n * frame_duration` in that
/// time scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub name: &'static str,
    pub time_scale: i64,
    pub frame_duration: i64,
    /// Device-specific mode code passed through to `enable_*` calls.
    pub mode_code: u32,
    pub width: u32,
    pub height: u32,
}

/// Display modes known to the adapters. This list is not exhaustive.
pub const DISPLAY_MODES: &[DisplayMode] = &[
    DisplayMode {
        name: "1080i 59.94",
        time_scale: 30000,
        frame_duration: 1001,
        mode_code: u32::from_be_bytes(*b"Hi59"),
        width: 1920,
        height: 1080,
    },
    DisplayMode {
        name: "NTSC",
        time_scale: 30000,
        frame_duration: 1001,
        mode_code: u32::from_be_bytes(*b"ntsc"),
        width: 720,
        height: 486,
    },
];

impl DisplayMode {
    /// Looks up a display mode by its index in [`DISPLAY_MODES`].
    pub fn by_index(index: usize) -> Result<DisplayMode> {
        DISPLAY_MODES.get(index).copied().ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "display mode index {index} out of range (0..{})",
                DISPLAY_MODES.len()
            ))
        })
    }

    /// Frames per second as an exact fraction.
    pub fn frame_rate(&self) -> Rational {
        Rational::new(self.time_scale, self.frame_duration)
    }

    /// Presentation time of frame `counter`, in `time_scale` units.
    pub fn display_time(&self, counter: u64) -> i64 {
        counter as i64 * self.frame_duration
    }
}

impl Default for DisplayMode {
    fn default() -> Self {
        DISPLAY_MODES[0]
    }
}

/// Physical video connectors an input adapter can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoConnection {
    Sdi,
    OpticalSdi,
    Hdmi,
    Component,
    SVideo,
    Composite,
}

impl VideoConnection {
    /// All connectors in the order used for numeric selection.
    pub const ALL: [VideoConnection; 6] = [
        VideoConnection::Sdi,
        VideoConnection::OpticalSdi,
        VideoConnection::Hdmi,
        VideoConnection::Component,
        VideoConnection::SVideo,
        VideoConnection::Composite,
    ];

    pub fn by_index(index: usize) -> Result<VideoConnection> {
        Self::ALL.get(index).copied().ok_or_else(|| {
            Error::InvalidConfiguration(format!("video connection index {index} out of range"))
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            VideoConnection::Sdi => "SD/HD-SDI (copper)",
            VideoConnection::OpticalSdi => "SD/HD-SDI (fiber)",
            VideoConnection::Hdmi => "HDMI",
            VideoConnection::Component => "Analog Component",
            VideoConnection::SVideo => "Analog S-Video",
            VideoConnection::Composite => "Analog Composite",
        }
    }
}

/// Splits a continuous audio stream into per-video-frame packet sizes.
///
/// For 48 kHz at 30000/1001 fps a frame holds 1601.6 samples; the cadence hands
/// out 1601 or 1602 so the running total never drifts from the exact value.
/// Integral rates (48 kHz at 25 fps) give a constant size.
#[derive(Debug, Clone)]
pub struct AudioCadence {
    sample_rate: u32,
    frame_rate: Rational,
    frames_issued: u64,
}

impl AudioCadence {
    pub fn new(sample_rate: u32, frame_rate: Rational) -> Result<Self> {
        if frame_rate.num <= 0 || frame_rate.den <= 0 {
            return Err(Error::InvalidConfiguration(format!(
                "frame rate must be positive, got {frame_rate}"
            )));
        }
        if sample_rate == 0 {
            return Err(Error::InvalidConfiguration(
                "sample rate must be non-zero".into(),
            ));
        }
        Ok(Self {
            sample_rate,
            frame_rate,
            frames_issued: 0,
        })
    }

    fn samples_before(&self, frame: u64) -> u64 {
        let num = self.frame_rate.num as u128;
        let den = self.frame_rate.den as u128;
        (frame as u128 * self.sample_rate as u128 * den / num) as u64
    }

    /// Number of sample frames in the next video frame's audio packet.
    pub fn next_packet_frames(&mut self) -> usize {
        let n = self.frames_issued;
        self.frames_issued += 1;
        (self.samples_before(n + 1) - self.samples_before(n)) as usize
    }

    /// Size of the next packet without advancing.
    pub fn peek_packet_frames(&self) -> usize {
        let n = self.frames_issued;
        (self.samples_before(n + 1) - self.samples_before(n)) as usize
    }
}
