//! WAV dump of rendered PCM.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::format::{AudioStreamParams, SampleFormat};
use crate::StreamError;

// WAV file format constants
// See: http://soundfile.sapp.org/doc/WaveFormat/

/// Byte offset of the file size field in WAV header (RIFF chunk size).
const WAV_FILE_SIZE_OFFSET: u64 = 4;

/// Byte offset of the data chunk size field in WAV header.
const WAV_DATA_SIZE_OFFSET: u64 = 40;

/// Size of the WAV header in bytes (RIFF + fmt + data chunk headers).
const WAV_HEADER_SIZE: usize = 44;

/// Size of the fmt chunk data (16 bytes for PCM).
const WAV_FMT_CHUNK_SIZE: u32 = 16;

/// Audio format code for integer PCM.
const WAV_FORMAT_PCM: u16 = 1;

/// Audio format code for IEEE float samples.
const WAV_FORMAT_IEEE_FLOAT: u16 = 3;

/// Appends everything a renderer plays to a WAV file.
///
/// The header is written with a zero data size on creation and patched by
/// [`finalize`](Self::finalize). A write error disables the dump for the
/// rest of the stream; playback is never affected.
pub(crate) struct PcmDump {
    path: PathBuf,
    state: Mutex<DumpState>,
}

struct DumpState {
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl PcmDump {
    pub fn create(path: impl AsRef<Path>, params: &AudioStreamParams) -> Result<Self, StreamError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        write_wav_header(&mut writer, params, 0)?;
        tracing::info!(path = %path.display(), "dumping rendered audio");
        Ok(Self {
            path,
            state: Mutex::new(DumpState {
                writer: Some(writer),
                bytes_written: 0,
            }),
        })
    }

    pub fn write(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        let Some(writer) = state.writer.as_mut() else {
            return;
        };
        if let Err(err) = writer.write_all(bytes) {
            tracing::warn!(path = %self.path.display(), %err, "disabling audio dump");
            state.writer = None;
            return;
        }
        state.bytes_written += bytes.len() as u64;
    }

    /// Patches the header sizes and closes the file. Later writes are dropped.
    pub fn finalize(&self) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        let data_size = u32::try_from(state.bytes_written).unwrap_or(u32::MAX);
        if let Some(mut writer) = state.writer.take() {
            update_wav_header(&mut writer, data_size)?;
            writer.flush()?;
            tracing::info!(path = %self.path.display(), bytes = data_size, "audio dump finalized");
        }
        Ok(())
    }
}

impl std::fmt::Debug for PcmDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmDump").field("path", &self.path).finish()
    }
}

/// Writes a complete WAV header (44 bytes) for `params`.
fn write_wav_header(
    writer: &mut BufWriter<File>,
    params: &AudioStreamParams,
    data_size: u32,
) -> std::io::Result<()> {
    let format_code = match params.format {
        SampleFormat::F32Le => WAV_FORMAT_IEEE_FLOAT,
        _ => WAV_FORMAT_PCM,
    };
    let bytes_per_sample = params.format.bytes_per_sample() as u16;

    // RIFF container header
    writer.write_all(b"RIFF")?;
    let file_size = WAV_HEADER_SIZE as u32 - 8 + data_size;
    writer.write_all(&file_size.to_le_bytes())?;
    writer.write_all(b"WAVE")?;

    // fmt subchunk
    writer.write_all(b"fmt ")?;
    writer.write_all(&WAV_FMT_CHUNK_SIZE.to_le_bytes())?;
    writer.write_all(&format_code.to_le_bytes())?;
    writer.write_all(&params.channels.to_le_bytes())?;
    writer.write_all(&params.sample_rate.to_le_bytes())?;

    let byte_rate =
        params.sample_rate * u32::from(params.channels) * u32::from(bytes_per_sample);
    writer.write_all(&byte_rate.to_le_bytes())?;

    let block_align = params.channels * bytes_per_sample;
    writer.write_all(&block_align.to_le_bytes())?;
    writer.write_all(&(bytes_per_sample * 8).to_le_bytes())?;

    // data subchunk header
    writer.write_all(b"data")?;
    writer.write_all(&data_size.to_le_bytes())?;

    Ok(())
}

/// Seeks back to fill in the RIFF and data chunk sizes.
fn update_wav_header(writer: &mut BufWriter<File>, data_size: u32) -> std::io::Result<()> {
    let file_size = (WAV_HEADER_SIZE as u32 - 8).saturating_add(data_size);
    writer.seek(SeekFrom::Start(WAV_FILE_SIZE_OFFSET))?;
    writer.write_all(&file_size.to_le_bytes())?;

    writer.seek(SeekFrom::Start(WAV_DATA_SIZE_OFFSET))?;
    writer.write_all(&data_size.to_le_bytes())?;

    writer.seek(SeekFrom::End(0))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_writes_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.wav");
        let dump = PcmDump::create(&path, &AudioStreamParams::cd_quality()).unwrap();
        dump.write(&[1, 2, 3, 4]);
        dump.write(&[5, 6, 7, 8]);
        dump.finalize().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), WAV_HEADER_SIZE + 8);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 36 + 8);
        assert_eq!(u32::from_le_bytes(bytes[40..44].try_into().unwrap()), 8);
        // 48kHz stereo 16-bit
        assert_eq!(u32::from_le_bytes(bytes[24..28].try_into().unwrap()), 48000);
        assert_eq!(u16::from_le_bytes(bytes[22..24].try_into().unwrap()), 2);
        assert_eq!(u16::from_le_bytes(bytes[34..36].try_into().unwrap()), 16);
    }

    #[test]
    fn test_float_format_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.wav");
        let params = AudioStreamParams::new(44100, 1, SampleFormat::F32Le);
        let dump = PcmDump::create(&path, &params).unwrap();
        dump.finalize().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(u16::from_le_bytes(bytes[20..22].try_into().unwrap()), 3);
        assert_eq!(u16::from_le_bytes(bytes[34..36].try_into().unwrap()), 32);
    }

    #[test]
    fn test_writes_after_finalize_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.wav");
        let dump = PcmDump::create(&path, &AudioStreamParams::cd_quality()).unwrap();
        dump.finalize().unwrap();
        dump.write(&[0; 16]);
        dump.finalize().unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), WAV_HEADER_SIZE);
    }

    #[test]
    fn test_invalid_path_error() {
        let err = PcmDump::create(
            "/nonexistent/dir/render.wav",
            &AudioStreamParams::cd_quality(),
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }
}
