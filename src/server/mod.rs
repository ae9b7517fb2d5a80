//! The audio server a stream's transport talks to.
//!
//! Two data paths are offered:
//! - [`ServerStream`]: a streaming connection with blocking `write`/`read`
//! - [`ServerProcess`]: a shared [`ProcessBuffer`] span ring driven by a
//!   client-side real-time loop (low latency)
//!
//! [`LoopbackServer`] runs both in-process at real-time cadence with fault
//! injection. With the `device` feature, [`DeviceServer`] plays through and
//! records from the system's default audio device.

#[cfg(feature = "device")]
mod device;
mod loopback;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::format::AudioStreamParams;
use crate::info::{AppInfo, Direction, EffectMode, PrivacyType, StreamType};
use crate::session::SessionId;
use crate::transport::ProcessBuffer;
use crate::ServerError;

#[cfg(feature = "device")]
pub use device::DeviceServer;
pub use loopback::{FaultInjection, LoopbackServer};

/// Everything the server needs to open a stream.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Data direction.
    pub direction: Direction,
    /// PCM parameters.
    pub params: AudioStreamParams,
    /// Focus class.
    pub stream_type: StreamType,
    /// Owning application.
    pub app: AppInfo,
    /// Capture privacy.
    pub privacy: PrivacyType,
    /// Effect processing.
    pub effect_mode: EffectMode,
    /// Where the server may cache offloaded audio.
    pub cache_path: Option<PathBuf>,
}

/// Span geometry requested for a process stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLayout {
    /// Frames per span.
    pub span_frames: u64,
    /// Spans in the ring.
    pub span_count: usize,
}

/// An audio server that opens streams for renderers and capturers.
pub trait AudioServer: Send + Sync {
    /// Opens a streaming-protocol stream.
    fn create_stream(&self, request: &StreamRequest) -> Result<Arc<dyn ServerStream>, ServerError>;

    /// Opens a low-latency process stream.
    fn create_process(
        &self,
        request: &StreamRequest,
        layout: ProcessLayout,
    ) -> Result<Arc<dyn ServerProcess>, ServerError>;

    /// Whether [`create_process`](Self::create_process) is available.
    fn supports_low_latency(&self) -> bool;
}

/// Server side of a streaming-protocol stream.
pub trait ServerStream: Send + Sync {
    /// Session assigned by the server.
    fn session_id(&self) -> SessionId;

    /// Smallest buffer, in bytes, the server works with.
    fn min_buffer_size(&self) -> usize;

    /// Starts moving data.
    fn start(&self) -> Result<(), ServerError>;

    /// Suspends data flow, keeping buffered data.
    fn pause(&self) -> Result<(), ServerError>;

    /// Stops data flow.
    fn stop(&self) -> Result<(), ServerError>;

    /// Discards buffered data.
    fn flush(&self) -> Result<(), ServerError>;

    /// Waits until buffered playback data has been played.
    fn drain(&self, timeout: Duration) -> Result<(), ServerError>;

    /// Closes the stream. Every later call fails.
    fn release(&self) -> Result<(), ServerError>;

    /// Queues playback data, blocking while the server buffer is full.
    ///
    /// Returns early with a short count when the stream stops running.
    fn write(&self, data: &[u8]) -> Result<usize, ServerError>;

    /// Reads captured data, waiting at most `timeout` for some to arrive.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, ServerError>;

    /// Frames played or captured so far, and the clock time of that count.
    fn position(&self) -> Result<(u64, i64), ServerError>;

    /// Audio buffered inside the server.
    fn latency(&self) -> Duration;

    /// Sets the stream volume in `0.0..=1.0`.
    fn set_volume(&self, volume: f32) -> Result<(), ServerError>;

    /// Consumes playback at `sample_rate` Hz instead of the stream's own rate.
    fn set_render_rate(&self, sample_rate: u32) -> Result<(), ServerError>;

    /// Lets the server batch playback into large, infrequent transfers.
    fn set_offload(&self, enabled: bool) -> Result<(), ServerError>;

    /// Re-establishes the stream after the policy service restarted.
    fn restore(&self) -> Result<(), ServerError>;

    /// Reports that reads keep timing out.
    fn report_stall(&self);
}

/// Server side of a process stream.
pub trait ServerProcess: Send + Sync {
    /// Session assigned by the server.
    fn session_id(&self) -> SessionId;

    /// The shared span ring.
    fn buffer(&self) -> Arc<ProcessBuffer>;

    /// Starts the server's handling loop.
    fn start(&self) -> Result<(), ServerError>;

    /// Suspends the server's handling loop.
    fn pause(&self) -> Result<(), ServerError>;

    /// Stops the server's handling loop.
    fn stop(&self) -> Result<(), ServerError>;

    /// Closes the stream. Every later call fails.
    fn release(&self) -> Result<(), ServerError>;

    /// Refreshes and returns the server's latest `(handle position, handle time)`.
    fn request_handle_info(&self) -> Result<(u64, i64), ServerError>;

    /// Sets the stream volume in `0.0..=1.0`.
    fn set_volume(&self, volume: f32) -> Result<(), ServerError>;

    /// Consumes playback at `sample_rate` Hz instead of the stream's own rate.
    fn set_render_rate(&self, sample_rate: u32) -> Result<(), ServerError>;

    /// Re-establishes the stream after the policy service restarted.
    fn restore(&self) -> Result<(), ServerError>;

    /// Reports that reads keep timing out.
    fn report_stall(&self);
}
