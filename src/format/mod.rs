//! PCM stream parameters and buffer sizing.
//!
//! - [`SampleFormat`] and [`AudioStreamParams`] describe the negotiated stream
//! - [`span_capacity`] derives the buffer-queue span size
//! - the `convert` helpers move between byte-level PCM and `f32` samples

mod convert;

use std::time::Duration;

use crate::StreamError;

pub use convert::{apply_volume, f32_to_s16le, fill_silence, s16le_to_f32};

/// Sample rates a stream may be opened with.
pub const SUPPORTED_SAMPLE_RATES: [u32; 11] = [
    8000, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000, 96000, 192000,
];

/// Largest channel count a stream may be opened with.
pub const MAX_CHANNELS: u16 = 16;

/// PCM sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SampleFormat {
    /// Unsigned 8-bit.
    U8,
    /// Signed 16-bit little endian.
    #[default]
    S16Le,
    /// Signed 24-bit little endian, packed in 3 bytes.
    S24Le,
    /// Signed 32-bit little endian.
    S32Le,
    /// 32-bit float little endian.
    F32Le,
}

impl SampleFormat {
    /// Bytes of one sample of one channel.
    #[must_use]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16Le => 2,
            Self::S24Le => 3,
            Self::S32Le | Self::F32Le => 4,
        }
    }

    /// Byte value that encodes silence.
    #[must_use]
    pub fn silence_byte(self) -> u8 {
        match self {
            Self::U8 => 0x80,
            _ => 0,
        }
    }
}

/// Negotiated PCM parameters of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioStreamParams {
    /// Frames per second.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Sample encoding.
    pub format: SampleFormat,
}

impl AudioStreamParams {
    /// Creates parameters without validating them.
    pub fn new(sample_rate: u32, channels: u16, format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            format,
        }
    }

    /// 48kHz stereo S16LE.
    pub fn cd_quality() -> Self {
        Self::new(48000, 2, SampleFormat::S16Le)
    }

    /// Checks the parameters against what a stream can be opened with.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidParam`] for an unsupported sample rate
    /// or a channel count outside `1..=16`.
    pub fn validate(&self) -> Result<(), StreamError> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(StreamError::invalid_param(format!(
                "sample rate {}Hz not supported",
                self.sample_rate
            )));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(StreamError::invalid_param(format!(
                "channel count {} outside 1..={MAX_CHANNELS}",
                self.channels
            )));
        }
        Ok(())
    }

    /// Bytes of one interleaved frame.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * usize::from(self.channels)
    }

    /// Frames covering `duration`, rounded down.
    #[must_use]
    pub fn frames_for(&self, duration: Duration) -> u64 {
        (u128::from(self.sample_rate) * duration.as_nanos() / 1_000_000_000) as u64
    }

    /// Bytes covering `duration`, rounded down to whole frames.
    #[must_use]
    pub fn bytes_for(&self, duration: Duration) -> usize {
        self.frames_for(duration) as usize * self.frame_size()
    }

    /// Playback duration of `frames`.
    #[must_use]
    pub fn duration_of(&self, frames: u64) -> Duration {
        let nanos = u128::from(frames) * 1_000_000_000 / u128::from(self.sample_rate.max(1));
        Duration::from_nanos(nanos as u64)
    }

    /// Frames contained in `bytes`, ignoring a trailing partial frame.
    #[must_use]
    pub fn frames_in(&self, bytes: usize) -> u64 {
        (bytes / self.frame_size().max(1)) as u64
    }
}

impl Default for AudioStreamParams {
    fn default() -> Self {
        Self::cd_quality()
    }
}

/// Size in bytes of one buffer-queue span.
///
/// The larger of the transport's minimum buffer size and `min_duration` of
/// audio, rounded up to whole frames.
#[must_use]
pub fn span_capacity(
    params: &AudioStreamParams,
    min_transport_bytes: usize,
    min_duration: Duration,
) -> usize {
    let frame = params.frame_size().max(1);
    let bytes = min_transport_bytes.max(params.bytes_for(min_duration));
    bytes.div_ceil(frame) * frame
}
