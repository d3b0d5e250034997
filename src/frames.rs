//! Canonical video frames and audio packets.
//!
//! Everything that moves through a [`handoff`](crate::handoff) queue is one of
//! these two value types. Device-native layouts never leave the adapters; see
//! [`convert`](crate::convert) for the mapping between the two.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{capture::DeviceFrameGuard, Error, Result};

/// Canonical pixel layouts carried by a [`Frame`].
///
/// The set is closed for any given build but may grow, so it is marked
/// `#[non_exhaustive]`. Always use a wildcard pattern when matching.
///
/// # Examples
///
/// ```
/// use replay_pipeline::PixelFormat;
///
/// let format = PixelFormat::CbYCrY8422;
/// match format {
///     PixelFormat::CbYCrY8422 => println!("packed 4:2:2"),
///     PixelFormat::BGRAn8 => println!("32-bit BGRA"),
///     _ => println!("other"),
/// }
/// ```
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u32)]
pub enum PixelFormat {
    /// Packed 4:2:2, 8 bits per component, byte order Cb Y0 Cr Y1.
    CbYCrY8422 = u32::from_be_bytes(*b"UYVY"),
    /// 32 bits per pixel, byte order B G R A.
    BGRAn8 = u32::from_be_bytes(*b"BGRA"),
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::CbYCrY8422 => "CbYCrY 4:2:2 8-bit",
            PixelFormat::BGRAn8 => "BGRA 8-bit",
        };
        f.write_str(name)
    }
}

/// Upper bound on a single video frame buffer (8K BGRA is ~135 MB).
pub(crate) const MAX_VIDEO_BYTES: usize = 256 * 1024 * 1024;

/// Minimum bytes per row for `width` pixels of `format`.
///
/// Packed 4:2:2 stores pixels in pairs, so odd widths round up to the next pair.
pub fn calculate_line_stride(format: PixelFormat, width: u32) -> usize {
    let width = width as usize;
    match format {
        PixelFormat::CbYCrY8422 => width.div_ceil(2) * 4,
        PixelFormat::BGRAn8 => width * 4,
    }
}

/// Total buffer size of a frame with the given row pitch.
pub fn buffer_len(pitch: usize, height: u32) -> usize {
    pitch * height as usize
}

/// Pixel storage behind a [`Frame`].
pub enum FrameData {
    /// Exclusively owned heap buffer.
    Owned(Vec<u8>),
    /// Read-only view into a device input buffer, released when dropped.
    Borrowed(DeviceFrameGuard),
}

impl FrameData {
    fn as_slice(&self) -> &[u8] {
        match self {
            FrameData::Owned(buf) => buf,
            FrameData::Borrowed(guard) => guard.bytes(),
        }
    }
}

impl fmt::Debug for FrameData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameData::Owned(buf) => write!(f, "Owned({} bytes)", buf.len()),
            FrameData::Borrowed(guard) => write!(f, "Borrowed({guard:?})"),
        }
    }
}

/// One video frame in a canonical pixel layout.
///
/// Invariant: the buffer is exactly `pitch * height` bytes and
/// `pitch >= calculate_line_stride(format, width)`.
///
/// # Examples
///
/// ```
/// use replay_pipeline::{Frame, PixelFormat};
///
/// let mut frame = Frame::new(1920, 1080, PixelFormat::CbYCrY8422);
/// assert_eq!(frame.pitch(), 3840);
/// assert_eq!(frame.size(), 3840 * 1080);
/// frame.data_mut().unwrap()[0] = 0x80;
/// ```
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    pitch: usize,
    data: FrameData,
}

impl Frame {
    /// Allocates a zeroed owned frame with the minimum pitch.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let pitch = calculate_line_stride(format, width);
        Frame {
            width,
            height,
            format,
            pitch,
            data: FrameData::Owned(vec![0; buffer_len(pitch, height)]),
        }
    }

    /// Allocates a zeroed owned frame with an explicit (padded) row pitch.
    pub fn with_pitch(width: u32, height: u32, format: PixelFormat, pitch: usize) -> Result<Self> {
        validate_geometry(width, height, format, pitch)?;
        Ok(Frame {
            width,
            height,
            format,
            pitch,
            data: FrameData::Owned(vec![0; buffer_len(pitch, height)]),
        })
    }

    /// Takes ownership of an existing buffer.
    pub fn from_owned(
        width: u32,
        height: u32,
        format: PixelFormat,
        pitch: usize,
        data: Vec<u8>,
    ) -> Result<Self> {
        validate_geometry(width, height, format, pitch)?;
        let expected = buffer_len(pitch, height);
        if data.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "buffer holds {} bytes, {width}x{height} at pitch {pitch} needs {expected}",
                data.len()
            )));
        }
        Ok(Frame {
            width,
            height,
            format,
            pitch,
            data: FrameData::Owned(data),
        })
    }

    /// Wraps a device buffer without copying. The guard must already hold the
    /// canonical layout.
    pub(crate) fn from_guard(guard: DeviceFrameGuard, format: PixelFormat) -> Result<Self> {
        let width = guard.width();
        let height = guard.height();
        let pitch = guard.row_bytes();
        validate_geometry(width, height, format, pitch)?;
        let expected = buffer_len(pitch, height);
        if guard.bytes().len() < expected {
            return Err(Error::InvalidFrame(format!(
                "device buffer holds {} bytes, {width}x{height} at pitch {pitch} needs {expected}",
                guard.bytes().len()
            )));
        }
        Ok(Frame {
            width,
            height,
            format,
            pitch,
            data: FrameData::Borrowed(guard),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes per row, including any padding.
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Buffer size in bytes (`pitch * height`).
    pub fn size(&self) -> usize {
        buffer_len(self.pitch, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data.as_slice()[..self.size()]
    }

    /// Mutable access to the pixels. Returns `None` for a borrowed device
    /// buffer, which must be copied with [`Frame::to_owned_frame`] first.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.data {
            FrameData::Owned(buf) => Some(buf.as_mut_slice()),
            FrameData::Borrowed(_) => None,
        }
    }

    /// One row of pixels without its padding.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.pitch;
        let len = calculate_line_stride(self.format, self.width);
        Some(&self.data()[start..start + len])
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self.data, FrameData::Borrowed(_))
    }

    /// Copies the pixels into a new owned frame with the same geometry.
    pub fn to_owned_frame(&self) -> Frame {
        Frame {
            width: self.width,
            height: self.height,
            format: self.format,
            pitch: self.pitch,
            data: FrameData::Owned(self.data().to_vec()),
        }
    }

    /// Encode the frame as PNG bytes for an operator preview.
    ///
    /// Both canonical layouts are supported; 4:2:2 frames are converted to RGB
    /// with BT.709 coefficients. Row padding is dropped.
    #[cfg(feature = "image-encoding")]
    pub fn encode_png(&self) -> Result<Vec<u8>> {
        use png::{BitDepth, ColorType, Encoder};

        let rgba = self.to_rgba8();
        let mut png_data = Vec::new();
        let mut encoder = Encoder::new(&mut png_data, self.width, self.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);

        encoder
            .write_header()
            .and_then(|mut writer| writer.write_image_data(&rgba))
            .map_err(|e| Error::InvalidFrame(format!("PNG encoding failed: {e}")))?;

        Ok(png_data)
    }

    /// Encode the frame as JPEG bytes. `quality` ranges from 1 to 100.
    #[cfg(feature = "image-encoding")]
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        use jpeg_encoder::{ColorType as JpegColorType, Encoder as JpegEncoder};

        let width = u16::try_from(self.width)
            .map_err(|_| Error::InvalidFrame(format!("width {} too large for JPEG", self.width)))?;
        let height = u16::try_from(self.height).map_err(|_| {
            Error::InvalidFrame(format!("height {} too large for JPEG", self.height))
        })?;

        let rgb: Vec<u8> = self
            .to_rgba8()
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();

        let mut jpeg_data = Vec::new();
        JpegEncoder::new(&mut jpeg_data, quality)
            .encode(&rgb, width, height, JpegColorType::Rgb)
            .map_err(|e| Error::InvalidFrame(format!("JPEG encoding failed: {e}")))?;

        Ok(jpeg_data)
    }

    /// Encode the frame as a `data:` URL suitable for an `<img>` tag.
    #[cfg(feature = "image-encoding")]
    pub fn encode_data_url(&self, format: ImageFormat) -> Result<String> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let (mime_type, image_bytes) = match format {
            ImageFormat::Png => ("image/png", self.encode_png()?),
            ImageFormat::Jpeg(quality) => ("image/jpeg", self.encode_jpeg(quality)?),
        };

        let base64_data = STANDARD.encode(&image_bytes);
        Ok(format!("data:{mime_type};base64,{base64_data}"))
    }

    #[cfg(feature = "image-encoding")]
    fn to_rgba8(&self) -> Vec<u8> {
        let width = self.width as usize;
        let mut rgba = Vec::with_capacity(width * self.height as usize * 4);
        for y in 0..self.height {
            let Some(row) = self.row(y) else { break };
            match self.format {
                PixelFormat::BGRAn8 => {
                    for px in row.chunks_exact(4) {
                        rgba.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
                    }
                }
                PixelFormat::CbYCrY8422 => {
                    for (i, quad) in row.chunks_exact(4).enumerate() {
                        let (cb, y0, cr, y1) = (quad[0], quad[1], quad[2], quad[3]);
                        rgba.extend_from_slice(&ycbcr_to_rgba(y0, cb, cr));
                        if 2 * i + 1 < width {
                            rgba.extend_from_slice(&ycbcr_to_rgba(y1, cb, cr));
                        }
                    }
                }
            }
        }
        rgba
    }
}

#[cfg(feature = "image-encoding")]
fn ycbcr_to_rgba(y: u8, cb: u8, cr: u8) -> [u8; 4] {
    let y = 1.164 * (f32::from(y) - 16.0);
    let cb = f32::from(cb) - 128.0;
    let cr = f32::from(cr) - 128.0;
    let clamp = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    [
        clamp(y + 1.793 * cr),
        clamp(y - 0.213 * cb - 0.533 * cr),
        clamp(y + 2.112 * cb),
        255,
    ]
}

/// Image format for preview encoding.
#[cfg(feature = "image-encoding")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// PNG format (lossless compression)
    Png,
    /// JPEG format with quality setting (1-100, where 100 is highest quality)
    Jpeg(u8),
}

fn validate_geometry(width: u32, height: u32, format: PixelFormat, pitch: usize) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidFrame(format!(
            "empty {width}x{height} video frame"
        )));
    }
    let min = calculate_line_stride(format, width);
    if pitch < min {
        return Err(Error::InvalidFrame(format!(
            "pitch {pitch} below minimum {min} for {width} pixels of {format}"
        )));
    }
    let size = buffer_len(pitch, height);
    if size > MAX_VIDEO_BYTES {
        return Err(Error::InvalidFrame(format!(
            "video frame exceeds maximum size: {size} bytes > {MAX_VIDEO_BYTES} bytes"
        )));
    }
    Ok(())
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("pitch", &self.pitch)
            .field("data", &self.data)
            .finish()
    }
}

/// Sample layout shared by every audio path in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: u16,
}

impl AudioFormat {
    /// 48 kHz, signed 16-bit, 2 channels, interleaved.
    pub const SYSTEM: AudioFormat = AudioFormat {
        sample_rate: 48_000,
        channels: 2,
        bytes_per_sample: 2,
    };

    /// Bytes per interleaved sample frame.
    pub const fn frame_bytes(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        AudioFormat::SYSTEM
    }
}

/// A run of interleaved audio sample frames.
///
/// Invariant: `data.len() == n_frames * channels * bytes_per_sample`.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioPacket {
    format: AudioFormat,
    n_frames: usize,
    data: Vec<u8>,
}

impl AudioPacket {
    /// Allocates a packet of `n_frames` zeroed (silent) sample frames.
    pub fn silent(format: AudioFormat, n_frames: usize) -> Self {
        AudioPacket {
            format,
            n_frames,
            data: vec![0; n_frames * format.frame_bytes()],
        }
    }

    /// Takes ownership of interleaved sample bytes.
    pub fn from_bytes(format: AudioFormat, data: Vec<u8>) -> Result<Self> {
        let frame_bytes = format.frame_bytes();
        if frame_bytes == 0 || data.len() % frame_bytes != 0 {
            return Err(Error::InvalidFrame(format!(
                "{} audio bytes is not a whole number of {frame_bytes}-byte sample frames",
                data.len()
            )));
        }
        Ok(AudioPacket {
            format,
            n_frames: data.len() / frame_bytes,
            data,
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.format.channels
    }

    pub fn bytes_per_sample(&self) -> u16 {
        self.format.bytes_per_sample
    }

    /// Number of sample frames (one sample per channel) in the packet.
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The samples from frame `offset` to the end. Empty if `offset` is past the end.
    pub fn samples_from(&self, offset: usize) -> &[u8] {
        let start = offset.min(self.n_frames) * self.format.frame_bytes();
        &self.data[start..]
    }
}

impl fmt::Debug for AudioPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioPacket")
            .field("sample_rate", &self.format.sample_rate)
            .field("channels", &self.format.channels)
            .field("bytes_per_sample", &self.format.bytes_per_sample)
            .field("n_frames", &self.n_frames)
            .field("data", &format!("[{} bytes]", self.data.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_stride() {
        assert_eq!(calculate_line_stride(PixelFormat::CbYCrY8422, 1920), 3840);
        assert_eq!(calculate_line_stride(PixelFormat::CbYCrY8422, 721), 1444);
        assert_eq!(calculate_line_stride(PixelFormat::BGRAn8, 1920), 7680);
        assert_eq!(buffer_len(3840, 1080), 3840 * 1080);
    }

    #[test]
    fn test_new_frame_size_matches_pitch_times_height() {
        for format in [PixelFormat::CbYCrY8422, PixelFormat::BGRAn8] {
            let frame = Frame::new(720, 486, format);
            assert_eq!(frame.size(), frame.pitch() * 486);
            assert_eq!(frame.data().len(), frame.size());
            assert!(!frame.is_borrowed());
        }
    }

    #[test]
    fn test_padded_pitch() {
        let frame = Frame::with_pitch(720, 486, PixelFormat::CbYCrY8422, 1536).unwrap();
        assert_eq!(frame.size(), 1536 * 486);
        assert_eq!(frame.row(0).unwrap().len(), 1440);
        assert!(frame.row(486).is_none());
    }

    #[test]
    fn test_pitch_below_minimum_rejected() {
        let err = Frame::with_pitch(720, 486, PixelFormat::BGRAn8, 720).unwrap_err();
        assert!(matches!(err, Error::InvalidFrame(_)));
    }

    #[test]
    fn test_empty_geometry_rejected() {
        let err = Frame::with_pitch(0, 2, PixelFormat::CbYCrY8422, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidFrame(_)));
        assert!(Frame::from_owned(4, 0, PixelFormat::CbYCrY8422, 8, Vec::new()).is_err());
    }

    #[test]
    fn test_from_owned_checks_length() {
        assert!(Frame::from_owned(2, 2, PixelFormat::BGRAn8, 8, vec![0; 16]).is_ok());
        assert!(Frame::from_owned(2, 2, PixelFormat::BGRAn8, 8, vec![0; 15]).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let err = Frame::with_pitch(1, 1, PixelFormat::BGRAn8, MAX_VIDEO_BYTES + 1).unwrap_err();
        assert!(err.to_string().contains("maximum size"));
    }

    #[test]
    fn test_pixel_format_codes() {
        let raw: u32 = PixelFormat::CbYCrY8422.into();
        assert_eq!(raw, u32::from_be_bytes(*b"UYVY"));
        assert_eq!(
            PixelFormat::try_from(u32::from_be_bytes(*b"BGRA")).unwrap(),
            PixelFormat::BGRAn8
        );
    }

    #[test]
    fn test_audio_packet_sizes() {
        let packet = AudioPacket::silent(AudioFormat::SYSTEM, 1602);
        assert_eq!(packet.n_frames(), 1602);
        assert_eq!(packet.size(), 1602 * 4);
        assert!(packet.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_samples_from_offset() {
        let data: Vec<u8> = (0..40).collect();
        let packet = AudioPacket::from_bytes(AudioFormat::SYSTEM, data).unwrap();
        assert_eq!(packet.n_frames(), 10);
        assert_eq!(packet.samples_from(0).len(), 40);
        assert_eq!(packet.samples_from(3)[0], 12);
        assert_eq!(packet.samples_from(10).len(), 0);
        assert_eq!(packet.samples_from(99).len(), 0);
    }

    #[test]
    fn test_audio_packet_rejects_partial_frame() {
        assert!(AudioPacket::from_bytes(AudioFormat::SYSTEM, vec![0; 6]).is_err());
    }

    #[cfg(feature = "image-encoding")]
    #[test]
    fn test_encode_png_signature() {
        let frame = Frame::new(4, 2, PixelFormat::CbYCrY8422);
        let png = frame.encode_png().unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[cfg(feature = "image-encoding")]
    #[test]
    fn test_encode_data_url_jpeg() {
        let frame = Frame::new(8, 8, PixelFormat::BGRAn8);
        let url = frame.encode_data_url(ImageFormat::Jpeg(80)).unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,"));
    }
}
