//! Byte-level PCM conversion.

use super::SampleFormat;

/// Decodes S16LE bytes into f32 samples in [-1.0, 1.0).
///
/// A trailing odd byte is ignored.
pub fn s16le_to_f32(bytes: &[u8], out: &mut Vec<f32>) {
    out.extend(
        bytes
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0),
    );
}

/// Encodes f32 samples as S16LE bytes.
///
/// Values outside [-1.0, 1.0] are clamped. Uses × 32767 for symmetric
/// scaling, so -1.0 maps to -32767.
pub fn f32_to_s16le(samples: &[f32], out: &mut Vec<u8>) {
    for &sample in samples {
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Fills `buf` with the silence encoding of `format`.
pub fn fill_silence(buf: &mut [u8], format: SampleFormat) {
    buf.fill(format.silence_byte());
}

/// Scales S16LE samples in place by `volume`.
///
/// Only S16LE is scaled; other formats are left untouched.
pub fn apply_volume(buf: &mut [u8], format: SampleFormat, volume: f32) {
    if format != SampleFormat::S16Le || (volume - 1.0).abs() < f32::EPSILON {
        return;
    }
    for pair in buf.chunks_exact_mut(2) {
        let sample = f32::from(i16::from_le_bytes([pair[0], pair[1]]));
        let scaled = (sample * volume).clamp(-32768.0, 32767.0) as i16;
        pair.copy_from_slice(&scaled.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s16le_to_f32() {
        let bytes = [0x00, 0x00, 0xff, 0x7f, 0x00, 0x80, 0x01];
        let mut out = Vec::new();
        s16le_to_f32(&bytes, &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.99997).abs() < 0.001);
        assert_eq!(out[2], -1.0);
    }

    #[test]
    fn test_f32_to_s16le_clamping() {
        let mut out = Vec::new();
        f32_to_s16le(&[1.0, -2.0, 0.0], &mut out);
        assert_eq!(out, vec![0xff, 0x7f, 0x00, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_fill_silence() {
        let mut buf = [1u8; 4];
        fill_silence(&mut buf, SampleFormat::U8);
        assert_eq!(buf, [0x80; 4]);
        fill_silence(&mut buf, SampleFormat::F32Le);
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn test_apply_volume_halves_s16() {
        let mut buf = 1000i16.to_le_bytes().to_vec();
        buf.extend_from_slice(&(-1000i16).to_le_bytes());
        apply_volume(&mut buf, SampleFormat::S16Le, 0.5);
        assert_eq!(i16::from_le_bytes([buf[0], buf[1]]), 500);
        assert_eq!(i16::from_le_bytes([buf[2], buf[3]]), -500);
    }

    #[test]
    fn test_apply_volume_ignores_other_formats() {
        let mut buf = vec![10u8, 20, 30, 40];
        apply_volume(&mut buf, SampleFormat::F32Le, 0.0);
        assert_eq!(buf, vec![10, 20, 30, 40]);
    }
}
