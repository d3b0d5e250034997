//! Mapping between canonical pixel layouts and device-native ones.
//!
//! Each canonical [`PixelFormat`] maps to one or more [`NativePixelFormat`]s
//! through a fixed registry. Resolving a pair happens once, at adapter
//! construction; the resulting [`Converter`] then packs and unpacks frames on
//! the callback thread without any further format lookups.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    frames::{calculate_line_stride, Frame, PixelFormat},
    Error, Result,
};

/// Pixel formats as the capture/playout device names them.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u32)]
pub enum NativePixelFormat {
    /// 8-bit 4:2:2, byte order Cb Y0 Cr Y1.
    Yuv8Bit422 = u32::from_be_bytes(*b"2vuy"),
    /// 8-bit 4:4:4:4, byte order A R G B.
    Argb8Bit = 32,
    /// 8-bit 4:4:4:4, byte order B G R A.
    Bgra8Bit = u32::from_be_bytes(*b"BGRA"),
}

impl NativePixelFormat {
    /// Minimum bytes per row for `width` pixels.
    pub fn min_row_bytes(self, width: u32) -> usize {
        let width = width as usize;
        match self {
            NativePixelFormat::Yuv8Bit422 => width.div_ceil(2) * 4,
            NativePixelFormat::Argb8Bit | NativePixelFormat::Bgra8Bit => width * 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// Byte-identical rows; only the pitch may differ.
    Identity,
    /// Each 4-byte pixel is stored in reverse byte order.
    Reversed32,
}

struct Mapping {
    canonical: PixelFormat,
    native: NativePixelFormat,
    layout: Layout,
}

/// Canonical -> native registry. The first entry for a canonical format is its
/// preferred native layout.
const REGISTRY: &[Mapping] = &[
    Mapping {
        canonical: PixelFormat::CbYCrY8422,
        native: NativePixelFormat::Yuv8Bit422,
        layout: Layout::Identity,
    },
    Mapping {
        canonical: PixelFormat::BGRAn8,
        native: NativePixelFormat::Argb8Bit,
        layout: Layout::Reversed32,
    },
    Mapping {
        canonical: PixelFormat::BGRAn8,
        native: NativePixelFormat::Bgra8Bit,
        layout: Layout::Identity,
    },
];

/// Native formats a canonical format can be exchanged with, preferred first.
pub fn native_formats(canonical: PixelFormat) -> impl Iterator<Item = NativePixelFormat> {
    REGISTRY
        .iter()
        .filter(move |m| m.canonical == canonical)
        .map(|m| m.native)
}

/// A resolved canonical/native pair.
///
/// # Examples
///
/// ```
/// use replay_pipeline::{convert::{Converter, NativePixelFormat}, PixelFormat};
///
/// let conv = Converter::resolve(PixelFormat::BGRAn8, None)?;
/// assert_eq!(conv.native(), NativePixelFormat::Argb8Bit);
/// assert!(!conv.is_identity());
/// # Ok::<(), replay_pipeline::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Converter {
    canonical: PixelFormat,
    native: NativePixelFormat,
    layout: Layout,
}

impl Converter {
    /// Looks up the registry entry for `canonical`, optionally pinned to a
    /// particular native format. An unmapped pair is an
    /// [`Error::UnsupportedFormat`].
    pub fn resolve(canonical: PixelFormat, native: Option<NativePixelFormat>) -> Result<Self> {
        REGISTRY
            .iter()
            .find(|m| m.canonical == canonical && native.map_or(true, |n| n == m.native))
            .map(|m| Converter {
                canonical: m.canonical,
                native: m.native,
                layout: m.layout,
            })
            .ok_or_else(|| match native {
                Some(n) => Error::UnsupportedFormat(format!("{canonical} cannot map to {n:?}")),
                None => Error::UnsupportedFormat(format!("{canonical} has no native mapping")),
            })
    }

    pub fn canonical(&self) -> PixelFormat {
        self.canonical
    }

    pub fn native(&self) -> NativePixelFormat {
        self.native
    }

    /// True when native rows can be used as canonical rows without conversion.
    pub fn is_identity(&self) -> bool {
        self.layout == Layout::Identity
    }

    /// Writes `frame` into a `dst_width` x `dst_height` native device buffer
    /// with row pitch `dst_row_bytes`.
    ///
    /// The frame must match the device geometry exactly; a smaller frame would
    /// leave stale pixels from the buffer's previous use.
    pub fn unpack(
        &self,
        frame: &Frame,
        dst: &mut [u8],
        dst_row_bytes: usize,
        dst_width: u32,
        dst_height: u32,
    ) -> Result<()> {
        if frame.pixel_format() != self.canonical {
            return Err(Error::ContractViolation(format!(
                "frame is {} but the output is configured for {}",
                frame.pixel_format(),
                self.canonical
            )));
        }
        if (frame.width(), frame.height()) != (dst_width, dst_height) {
            return Err(Error::ContractViolation(format!(
                "frame is {}x{} but the output is {dst_width}x{dst_height}",
                frame.width(),
                frame.height()
            )));
        }
        if dst_width == 0 || dst_height == 0 {
            return Err(Error::ContractViolation(format!(
                "output geometry {dst_width}x{dst_height} is empty"
            )));
        }
        let row_len = calculate_line_stride(self.canonical, frame.width());
        let height = frame.height() as usize;
        let pitch = frame.pitch();
        check_extent(frame.data().len(), pitch, row_len, height, "canonical frame")?;
        check_extent(dst.len(), dst_row_bytes, row_len, height, "device output buffer")?;

        let src = frame.data();
        for y in 0..height {
            let src_row = &src[y * pitch..y * pitch + row_len];
            let dst_row = &mut dst[y * dst_row_bytes..y * dst_row_bytes + row_len];
            self.copy_row(src_row, dst_row);
        }
        Ok(())
    }

    /// Copies a native buffer into a new owned canonical frame.
    pub fn pack(&self, src: &[u8], src_row_bytes: usize, width: u32, height: u32) -> Result<Frame> {
        let row_len = calculate_line_stride(self.canonical, width);
        check_extent(src.len(), src_row_bytes, row_len, height as usize, "device input buffer")?;

        let mut frame = Frame::new(width, height, self.canonical);
        let pitch = frame.pitch();
        let dst = frame
            .data_mut()
            .ok_or_else(|| Error::InvalidFrame("new frame is not owned".into()))?;
        for y in 0..height as usize {
            let src_row = &src[y * src_row_bytes..y * src_row_bytes + row_len];
            self.copy_row(src_row, &mut dst[y * pitch..y * pitch + row_len]);
        }
        Ok(frame)
    }

    fn copy_row(&self, src: &[u8], dst: &mut [u8]) {
        match self.layout {
            Layout::Identity => dst.copy_from_slice(src),
            Layout::Reversed32 => {
                for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                    d.copy_from_slice(&[s[3], s[2], s[1], s[0]]);
                }
            }
        }
    }
}

fn check_extent(
    len: usize,
    row_bytes: usize,
    row_len: usize,
    height: usize,
    what: &str,
) -> Result<()> {
    if row_bytes < row_len {
        return Err(Error::ContractViolation(format!(
            "{what} row pitch {row_bytes} is below the {row_len} bytes a row needs"
        )));
    }
    let needed = if height == 0 {
        0
    } else {
        row_bytes * (height - 1) + row_len
    };
    if len < needed {
        return Err(Error::ContractViolation(format!(
            "{what} holds {len} bytes, {height} rows need {needed}"
        )));
    }
    Ok(())
}

/// One plane of a planar image.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    pub stride: usize,
}

/// Packs planar 4:2:2 (full-width luma, half-width chroma) into a
/// [`PixelFormat::CbYCrY8422`] frame.
///
/// For odd widths the last chroma pair carries a single luma sample, which is
/// duplicated into the unused slot.
pub fn pack_planar_422(
    width: u32,
    height: u32,
    luma: Plane<'_>,
    cb: Plane<'_>,
    cr: Plane<'_>,
) -> Result<Frame> {
    let w = width as usize;
    let cw = w.div_ceil(2);
    let h = height as usize;
    check_extent(luma.data.len(), luma.stride, w, h, "luma plane")?;
    check_extent(cb.data.len(), cb.stride, cw, h, "Cb plane")?;
    check_extent(cr.data.len(), cr.stride, cw, h, "Cr plane")?;

    let mut frame = Frame::new(width, height, PixelFormat::CbYCrY8422);
    let pitch = frame.pitch();
    let dst = frame
        .data_mut()
        .ok_or_else(|| Error::InvalidFrame("new frame is not owned".into()))?;

    for y in 0..h {
        let y_row = &luma.data[y * luma.stride..y * luma.stride + w];
        let cb_row = &cb.data[y * cb.stride..y * cb.stride + cw];
        let cr_row = &cr.data[y * cr.stride..y * cr.stride + cw];
        let out = &mut dst[y * pitch..y * pitch + cw * 4];
        for (i, quad) in out.chunks_exact_mut(4).enumerate() {
            let y0 = y_row[2 * i];
            let y1 = y_row.get(2 * i + 1).copied().unwrap_or(y0);
            quad.copy_from_slice(&[cb_row[i], y0, cr_row[i], y1]);
        }
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let natives: Vec<_> = native_formats(PixelFormat::BGRAn8).collect();
        assert_eq!(
            natives,
            vec![NativePixelFormat::Argb8Bit, NativePixelFormat::Bgra8Bit]
        );
        let conv = Converter::resolve(PixelFormat::CbYCrY8422, None).unwrap();
        assert_eq!(conv.native(), NativePixelFormat::Yuv8Bit422);
        assert!(conv.is_identity());
    }

    #[test]
    fn test_unmapped_pair_is_unsupported() {
        let err = Converter::resolve(PixelFormat::CbYCrY8422, Some(NativePixelFormat::Argb8Bit))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn test_native_codes() {
        assert_eq!(
            NativePixelFormat::try_from(u32::from_be_bytes(*b"2vuy")).unwrap(),
            NativePixelFormat::Yuv8Bit422
        );
        let raw: u32 = NativePixelFormat::Argb8Bit.into();
        assert_eq!(raw, 32);
    }

    #[test]
    fn test_bgra_to_argb_unpack() {
        let mut frame = Frame::new(2, 1, PixelFormat::BGRAn8);
        frame
            .data_mut()
            .unwrap()
            .copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let conv = Converter::resolve(PixelFormat::BGRAn8, None).unwrap();
        let mut out = vec![0u8; 8];
        conv.unpack(&frame, &mut out, 8, 2, 1).unwrap();
        assert_eq!(out, vec![4, 3, 2, 1, 8, 7, 6, 5]);
    }

    #[test]
    fn test_pack_strips_native_padding() {
        let conv = Converter::resolve(PixelFormat::CbYCrY8422, None).unwrap();
        // 2x2 pixels, 4 bytes per row plus 4 bytes padding.
        let src = [1, 2, 3, 4, 9, 9, 9, 9, 5, 6, 7, 8, 9, 9, 9, 9];
        let frame = conv.pack(&src, 8, 2, 2).unwrap();
        assert_eq!(frame.pitch(), 4);
        assert_eq!(frame.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_unpack_into_padded_device_buffer() {
        let mut frame = Frame::new(2, 2, PixelFormat::CbYCrY8422);
        frame
            .data_mut()
            .unwrap()
            .copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let conv = Converter::resolve(PixelFormat::CbYCrY8422, None).unwrap();
        let mut out = vec![0u8; 16];
        conv.unpack(&frame, &mut out, 8, 2, 2).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8, 0, 0, 0, 0]);
    }

    #[test]
    fn test_unpack_wrong_format_is_contract_violation() {
        let frame = Frame::new(2, 2, PixelFormat::BGRAn8);
        let conv = Converter::resolve(PixelFormat::CbYCrY8422, None).unwrap();
        let mut out = vec![0u8; 16];
        let err = conv.unpack(&frame, &mut out, 8, 2, 2).unwrap_err();
        assert!(matches!(err, Error::ContractViolation(_)));
    }

    #[test]
    fn test_unpack_short_buffer_rejected() {
        let frame = Frame::new(4, 4, PixelFormat::CbYCrY8422);
        let conv = Converter::resolve(PixelFormat::CbYCrY8422, None).unwrap();
        let mut out = vec![0u8; 10];
        assert!(conv.unpack(&frame, &mut out, 8, 4, 4).is_err());
    }

    #[test]
    fn test_unpack_smaller_frame_is_contract_violation() {
        let frame = Frame::from_owned(2, 1, PixelFormat::CbYCrY8422, 4, vec![0x77; 4]).unwrap();
        let conv = Converter::resolve(PixelFormat::CbYCrY8422, None).unwrap();
        let mut out = vec![0u8; 16];
        let err = conv.unpack(&frame, &mut out, 8, 4, 2).unwrap_err();
        assert!(matches!(err, Error::ContractViolation(_)));
        assert_eq!(out, vec![0u8; 16]);
    }

    #[test]
    fn test_unpack_empty_frame_is_contract_violation() {
        let frame = Frame::new(0, 2, PixelFormat::CbYCrY8422);
        let conv = Converter::resolve(PixelFormat::CbYCrY8422, None).unwrap();
        let mut out = vec![0u8; 16];
        let err = conv.unpack(&frame, &mut out, 8, 4, 2).unwrap_err();
        assert!(matches!(err, Error::ContractViolation(_)));
        let err = conv.unpack(&frame, &mut out, 0, 0, 2).unwrap_err();
        assert!(matches!(err, Error::ContractViolation(_)));
    }

    #[test]
    fn test_planar_422_pack() {
        let luma = [10, 11, 12, 13];
        let cb = [20, 21];
        let cr = [30, 31];
        let frame = pack_planar_422(
            4,
            1,
            Plane { data: &luma, stride: 4 },
            Plane { data: &cb, stride: 2 },
            Plane { data: &cr, stride: 2 },
        )
        .unwrap();
        assert_eq!(frame.data(), &[20, 10, 30, 11, 21, 12, 31, 13]);
    }

    #[test]
    fn test_planar_422_odd_width_duplicates_luma() {
        let luma = [10, 11, 12];
        let cb = [20, 21];
        let cr = [30, 31];
        let frame = pack_planar_422(
            3,
            1,
            Plane { data: &luma, stride: 3 },
            Plane { data: &cb, stride: 2 },
            Plane { data: &cr, stride: 2 },
        )
        .unwrap();
        assert_eq!(frame.data(), &[20, 10, 30, 11, 21, 12, 31, 12]);
    }

    #[test]
    fn test_planar_422_short_plane() {
        let luma = [0u8; 8];
        let chroma = [0u8; 2];
        let err = pack_planar_422(
            4,
            2,
            Plane { data: &luma, stride: 4 },
            Plane { data: &chroma, stride: 2 },
            Plane { data: &chroma, stride: 2 },
        )
        .unwrap_err();
        assert!(err.to_string().contains("Cb plane"));
    }
}
