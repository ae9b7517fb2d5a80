//! Application-facing capture stream.

use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{BufferDesc, BufferQueueState};
use crate::builder::CapturerBuilder;
use crate::context::AudioContext;
use crate::event::{position_callback, DataCallback, EventCallback};
use crate::format::AudioStreamParams;
use crate::info::{CapturerInfo, InterruptMode, RenderMode, StreamInfo};
use crate::session::{SessionId, SessionStats};
use crate::state::StreamState;
use crate::stream::{AudioTimestamp, StreamCore};
use crate::transport::TransportClass;
use crate::StreamError;

/// A capture stream.
///
/// Same lifecycle as a [`Renderer`](crate::Renderer); data flows the other
/// way.
pub struct Capturer {
    core: Arc<StreamCore>,
}

impl Capturer {
    /// Starts building a capturer for `info` against `ctx`.
    pub fn builder(ctx: &AudioContext, info: CapturerInfo) -> CapturerBuilder {
        CapturerBuilder::new(ctx, info)
    }

    pub(crate) fn from_core(core: Arc<StreamCore>) -> Self {
        Self { core }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    /// Session of the backing transport.
    pub fn session_id(&self) -> Option<SessionId> {
        self.core.session_id()
    }

    /// Source and latency class.
    pub fn info(&self) -> Option<CapturerInfo> {
        match self.core.info() {
            StreamInfo::Capturer(info) => Some(*info),
            StreamInfo::Renderer(_) => None,
        }
    }

    /// Class of the backing transport, if any.
    pub fn transport_class(&self) -> Option<TransportClass> {
        self.core.transport_class()
    }

    /// Negotiates stream parameters with a new transport.
    pub fn set_params(&self, params: AudioStreamParams) -> Result<(), StreamError> {
        self.core.set_params(params)
    }

    /// Negotiated parameters.
    pub fn params(&self) -> Option<AudioStreamParams> {
        self.core.params()
    }

    /// Requests focus and starts capturing.
    pub fn start(&self) -> Result<(), StreamError> {
        self.core.start()
    }

    /// Pauses capturing.
    pub fn pause(&self) -> Result<(), StreamError> {
        self.core.pause()
    }

    /// Stops capturing.
    pub fn stop(&self) -> Result<(), StreamError> {
        self.core.stop()
    }

    /// Discards captured data not read yet.
    pub fn flush(&self) -> Result<(), StreamError> {
        self.core.flush()
    }

    /// Releases the transport and every policy registration.
    pub fn release(&self) -> Result<(), StreamError> {
        self.core.release()
    }

    /// Reads captured PCM, waiting up to the configured read timeout.
    ///
    /// # Errors
    ///
    /// Returns a timeout error when no data arrived in time; the next read
    /// may succeed.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.core.read(buf)
    }

    /// Frames captured and when.
    pub fn audio_time(&self) -> Result<AudioTimestamp, StreamError> {
        self.core.audio_time()
    }

    /// Time from the microphone to `read`.
    pub fn latency(&self) -> Result<Duration, StreamError> {
        self.core.latency()
    }

    /// Smallest buffer the transport works with, in bytes.
    pub fn min_buffer_size(&self) -> Result<usize, StreamError> {
        self.core.min_buffer_size()
    }

    /// Frames handed to the application.
    pub fn frames_read(&self) -> u64 {
        self.core.stats().frames_transferred
    }

    /// Data-path statistics.
    pub fn stats(&self) -> SessionStats {
        self.core.stats()
    }

    /// Blocking reads or buffer-queue callbacks. Only before the first
    /// start.
    pub fn set_capture_mode(&self, mode: RenderMode) -> Result<(), StreamError> {
        self.core.set_render_mode(mode)
    }

    /// Current capture mode.
    pub fn capture_mode(&self) -> RenderMode {
        self.core.render_mode()
    }

    /// Checks out the oldest captured span. Callback mode only; never blocks.
    pub fn get_buffer_desc(&self) -> Result<BufferDesc, StreamError> {
        self.core.buffer_queue()?.get_buffer_desc()
    }

    /// Hands a drained span back for reuse.
    pub fn enqueue(&self, desc: BufferDesc) -> Result<(), StreamError> {
        self.core.buffer_queue()?.enqueue(desc)?;
        Ok(())
    }

    /// Drops captured spans that were not read.
    pub fn clear_buffer_queue(&self) -> Result<(), StreamError> {
        self.core.buffer_queue()?.clear();
        Ok(())
    }

    /// Occupancy of the buffer queue.
    pub fn buffer_queue_state(&self) -> Result<BufferQueueState, StreamError> {
        Ok(self.core.buffer_queue()?.state())
    }

    /// Replaces the event callback.
    pub fn set_event_callback(&self, callback: Option<EventCallback>) {
        self.core.set_event_callback(callback);
    }

    /// Replaces the callback-mode read-data callback.
    pub fn set_read_callback(&self, callback: Option<DataCallback>) {
        self.core.set_data_callback(callback);
    }

    /// Calls `callback` once when `frame` frames have been read.
    pub fn set_mark_position<F>(&self, frame: u64, callback: F) -> Result<(), StreamError>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.core.set_mark(Some((frame, position_callback(callback))))
    }

    /// Calls `callback` every `frames` frames read.
    pub fn set_period_position<F>(&self, frames: u64, callback: F) -> Result<(), StreamError>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.core.set_period(Some((frames, position_callback(callback))))
    }

    /// Focus mode used from the next start.
    pub fn set_interrupt_mode(&self, mode: InterruptMode) {
        self.core.set_interrupt_mode(mode);
    }

    /// Moves the stream to the low-latency transport or back.
    pub fn switch_stream(&self, low_latency: bool) -> Result<(), StreamError> {
        self.core.switch_stream(low_latency)
    }

    /// Whether a forced interrupt paused the stream.
    pub fn is_force_paused(&self) -> bool {
        self.core.interrupt().is_force_paused()
    }
}

impl Drop for Capturer {
    fn drop(&mut self) {
        if matches!(self.state(), StreamState::New | StreamState::Released) {
            return;
        }
        if let Err(err) = self.core.release() {
            tracing::warn!(%err, "capturer dropped without release, cleanup failed");
        }
    }
}

impl std::fmt::Debug for Capturer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capturer").field("core", &self.core).finish()
    }
}
