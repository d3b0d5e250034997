//! Reshapes arbitrarily sized audio bursts into per-video-frame packets.

use std::collections::VecDeque;

use crate::{
    frames::{AudioFormat, AudioPacket},
    Error, Result,
};

/// FIFO accumulator of interleaved sample frames.
///
/// Decoders deliver audio in whatever burst size the codec uses; the playout
/// side wants one packet per video frame. Samples go in with
/// [`add_samples`](Self::add_samples) and come out, oldest first, through
/// [`fill_packet`](Self::fill_packet).
///
/// Invariant: `buffered bytes == samples() * channels * bytes_per_sample`.
///
/// # Examples
///
/// ```
/// use replay_pipeline::{AudioFormat, AudioPacket, AudioSyncBuffer};
///
/// let mut buf = AudioSyncBuffer::new(AudioFormat::SYSTEM);
/// buf.add_samples(1024, &[0u8; 1024 * 4])?;
/// buf.add_samples(1024, &[0u8; 1024 * 4])?;
///
/// let mut packet = AudioPacket::silent(AudioFormat::SYSTEM, 1602);
/// buf.fill_packet(&mut packet)?;
/// assert_eq!(buf.samples(), 2048 - 1602);
/// # Ok::<(), replay_pipeline::Error>(())
/// ```
#[derive(Debug)]
pub struct AudioSyncBuffer {
    format: AudioFormat,
    bytes: VecDeque<u8>,
    frames: usize,
}

impl AudioSyncBuffer {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            bytes: VecDeque::new(),
            frames: 0,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Appends `count` sample frames from `data`.
    ///
    /// `data` must hold at least `count` whole frames; extra trailing bytes are
    /// ignored.
    pub fn add_samples(&mut self, count: usize, data: &[u8]) -> Result<()> {
        let len = count * self.format.frame_bytes();
        let Some(src) = data.get(..len) else {
            return Err(Error::ContractViolation(format!(
                "{count} sample frames need {len} bytes, got {}",
                data.len()
            )));
        };
        self.bytes.extend(src);
        self.frames += count;
        Ok(())
    }

    /// Number of buffered sample frames.
    pub fn samples(&self) -> usize {
        self.frames
    }

    /// Moves exactly `packet.n_frames()` of the oldest frames into `packet`.
    ///
    /// # Errors
    ///
    /// [`Error::ContractViolation`] if fewer frames are buffered or the packet's
    /// sample layout differs from the buffer's. Nothing is consumed on error.
    pub fn fill_packet(&mut self, packet: &mut AudioPacket) -> Result<()> {
        if packet.format() != self.format {
            return Err(Error::ContractViolation(format!(
                "packet format {:?} does not match buffer format {:?}",
                packet.format(),
                self.format
            )));
        }
        let wanted = packet.n_frames();
        if self.frames < wanted {
            return Err(Error::ContractViolation(format!(
                "packet needs {wanted} sample frames but only {} are buffered",
                self.frames
            )));
        }

        let len = wanted * self.format.frame_bytes();
        for (dst, src) in packet.data_mut().iter_mut().zip(self.bytes.drain(..len)) {
            *dst = src;
        }
        self.frames -= wanted;
        Ok(())
    }

    /// Discards everything buffered.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.frames = 0;
    }
}
