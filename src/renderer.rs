//! Application-facing playback stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{BufferDesc, BufferQueueState};
use crate::builder::RendererBuilder;
use crate::context::AudioContext;
use crate::event::{position_callback, DataCallback, EventCallback};
use crate::format::AudioStreamParams;
use crate::info::{
    EffectMode, InterruptMode, PrivacyType, RenderMode, RenderRate, RendererInfo, StreamInfo,
};
use crate::session::{SessionId, SessionStats};
use crate::state::StreamState;
use crate::stream::{AudioTimestamp, StreamCore};
use crate::transport::TransportClass;
use crate::StreamError;

/// A playback stream.
///
/// Lifecycle calls may come from any thread. Dropping a renderer that was
/// prepared releases it.
///
/// # Example
///
/// ```
/// use audio_stream_client::policy::MockPolicy;
/// use audio_stream_client::server::LoopbackServer;
/// use audio_stream_client::{AudioContext, AudioStreamParams, Renderer, StreamState};
///
/// let ctx = AudioContext::new(LoopbackServer::new(), MockPolicy::new());
/// let renderer = Renderer::builder(&ctx)
///     .params(AudioStreamParams::cd_quality())
///     .build()?;
///
/// renderer.start()?;
/// let written = renderer.write(&[0u8; 1920])?;
/// assert_eq!(written, 1920);
/// renderer.stop()?;
/// renderer.release()?;
/// assert_eq!(renderer.state(), StreamState::Released);
/// # Ok::<(), audio_stream_client::StreamError>(())
/// ```
pub struct Renderer {
    core: Arc<StreamCore>,
}

impl Renderer {
    /// Starts building a renderer against `ctx`.
    pub fn builder(ctx: &AudioContext) -> RendererBuilder {
        RendererBuilder::new(ctx)
    }

    pub(crate) fn from_core(core: Arc<StreamCore>) -> Self {
        Self { core }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    /// Session of the backing transport. `None` until prepared and after
    /// release.
    pub fn session_id(&self) -> Option<SessionId> {
        self.core.session_id()
    }

    /// Content, usage and latency class.
    pub fn info(&self) -> RendererInfo {
        match self.core.info() {
            StreamInfo::Renderer(info) => *info,
            StreamInfo::Capturer(_) => RendererInfo::music(),
        }
    }

    /// Class of the backing transport, if any.
    pub fn transport_class(&self) -> Option<TransportClass> {
        self.core.transport_class()
    }

    /// Negotiates stream parameters with a new transport. NEW → PREPARED.
    pub fn set_params(&self, params: AudioStreamParams) -> Result<(), StreamError> {
        self.core.set_params(params)
    }

    /// Negotiated parameters.
    pub fn params(&self) -> Option<AudioStreamParams> {
        self.core.params()
    }

    /// Requests audio focus and starts playback.
    ///
    /// # Errors
    ///
    /// Fails with an illegal-state error outside PREPARED/PAUSED/STOPPED or
    /// while a transport switch is running, and with the policy error when
    /// focus is refused.
    pub fn start(&self) -> Result<(), StreamError> {
        self.core.start()
    }

    /// Pauses playback and gives up focus. RUNNING only.
    pub fn pause(&self) -> Result<(), StreamError> {
        self.core.pause()
    }

    /// Stops playback and gives up focus.
    pub fn stop(&self) -> Result<(), StreamError> {
        self.core.stop()
    }

    /// Waits until written audio has been played out.
    pub fn drain(&self) -> Result<(), StreamError> {
        self.core.drain()
    }

    /// Discards written audio that has not been played yet.
    pub fn flush(&self) -> Result<(), StreamError> {
        self.core.flush()
    }

    /// Releases the transport and every policy registration.
    pub fn release(&self) -> Result<(), StreamError> {
        self.core.release()
    }

    /// Writes PCM and blocks until the transport took it. Normal mode only.
    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        self.core.write(data)
    }

    /// Sets the stream volume, `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) -> Result<(), StreamError> {
        self.core.set_volume(volume)
    }

    /// Current stream volume, including any duck in effect.
    pub fn volume(&self) -> f32 {
        self.core.volume()
    }

    /// Plays faster or slower than the stream's sample rate.
    pub fn set_render_rate(&self, rate: RenderRate) -> Result<(), StreamError> {
        self.core.set_render_rate(rate)
    }

    /// Current playback speed.
    pub fn render_rate(&self) -> RenderRate {
        self.core.render_rate()
    }

    /// Offload mode buffers more audio ahead of the server and wakes less
    /// often, at the cost of latency.
    pub fn set_offload_mode(&self, enabled: bool) -> Result<(), StreamError> {
        self.core.set_offload_mode(enabled)
    }

    /// Whether offload mode is on.
    pub fn is_offload_mode(&self) -> bool {
        self.core.offload_mode()
    }

    /// Frames played and when. Never goes backwards, also across a
    /// transport switch.
    pub fn audio_time(&self) -> Result<AudioTimestamp, StreamError> {
        self.core.audio_time()
    }

    /// Frames played.
    pub fn audio_position(&self) -> Result<u64, StreamError> {
        self.core.audio_time().map(|ts| ts.frames)
    }

    /// Time from `write` to the speaker.
    pub fn latency(&self) -> Result<Duration, StreamError> {
        self.core.latency()
    }

    /// Smallest buffer the transport works with, in bytes.
    pub fn min_buffer_size(&self) -> Result<usize, StreamError> {
        self.core.min_buffer_size()
    }

    /// Frames handed to the transport.
    pub fn frames_written(&self) -> u64 {
        self.core.stats().frames_transferred
    }

    /// Spans played as silence because no data was ready.
    pub fn underflow_count(&self) -> u64 {
        self.core.stats().underflows
    }

    /// Data-path statistics.
    pub fn stats(&self) -> SessionStats {
        self.core.stats()
    }

    /// Blocking writes or buffer-queue callbacks. Only before the first
    /// start.
    pub fn set_render_mode(&self, mode: RenderMode) -> Result<(), StreamError> {
        self.core.set_render_mode(mode)
    }

    /// Current render mode.
    pub fn render_mode(&self) -> RenderMode {
        self.core.render_mode()
    }

    /// Checks out an empty span to fill. Callback mode only; never blocks.
    pub fn get_buffer_desc(&self) -> Result<BufferDesc, StreamError> {
        self.core.buffer_queue()?.get_buffer_desc()
    }

    /// Queues a filled span for playback.
    pub fn enqueue(&self, desc: BufferDesc) -> Result<(), StreamError> {
        self.core.buffer_queue()?.enqueue(desc)?;
        Ok(())
    }

    /// Drops queued spans back to the free queue.
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

    /// Replaces the callback-mode write-data callback.
    pub fn set_write_callback(&self, callback: Option<DataCallback>) {
        self.core.set_data_callback(callback);
    }

    /// Called once per start, when the first frame reaches the server, with
    /// the latency in milliseconds.
    pub fn set_first_frame_callback<F>(&self, callback: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.core.set_first_frame_callback(Some(Arc::new(callback)));
    }

    /// Calls `callback` once when `frame` frames have been written.
    pub fn set_mark_position<F>(&self, frame: u64, callback: F) -> Result<(), StreamError>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.core.set_mark(Some((frame, position_callback(callback))))
    }

    /// Removes the mark.
    pub fn unset_mark_position(&self) {
        let _ = self.core.set_mark(None);
    }

    /// Calls `callback` every `frames` frames written.
    pub fn set_period_position<F>(&self, frames: u64, callback: F) -> Result<(), StreamError>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.core.set_period(Some((frames, position_callback(callback))))
    }

    /// Removes the period callback.
    pub fn unset_period_position(&self) {
        let _ = self.core.set_period(None);
    }

    /// Server-side effect processing.
    pub fn set_effect_mode(&self, mode: EffectMode) {
        self.core.set_effect_mode(mode);
    }

    /// Current effect mode.
    pub fn effect_mode(&self) -> EffectMode {
        self.core.effect_mode()
    }

    /// Where the server may cache offloaded audio.
    pub fn set_cache_path(&self, path: Option<PathBuf>) {
        self.core.set_cache_path(path);
    }

    /// Whether other apps may capture this stream.
    pub fn set_privacy(&self, privacy: PrivacyType) {
        self.core.set_privacy(privacy);
    }

    /// Current privacy type.
    pub fn privacy(&self) -> PrivacyType {
        self.core.privacy()
    }

    /// Focus mode used from the next start.
    pub fn set_interrupt_mode(&self, mode: InterruptMode) {
        self.core.set_interrupt_mode(mode);
    }

    /// Current focus mode.
    pub fn interrupt_mode(&self) -> InterruptMode {
        self.core.interrupt_mode()
    }

    /// Play alongside other streams instead of interrupting them.
    pub fn set_parallel_play(&self, parallel: bool) {
        self.core.set_parallel_play(parallel);
    }

    /// Ask to be paused instead of ducked.
    pub fn set_pause_when_ducked(&self, pause: bool) {
        self.core.set_pause_when_ducked(pause);
    }

    /// Moves the stream to the low-latency transport or back.
    ///
    /// # Errors
    ///
    /// Refusals (nothing to switch, already on the target class, another
    /// switch running) return an error without touching the stream. A
    /// failure during the switch also emits one
    /// [`StreamEvent::Error`](crate::StreamEvent::Error).
    pub fn switch_stream(&self, low_latency: bool) -> Result<(), StreamError> {
        self.core.switch_stream(low_latency)
    }

    /// Whether a forced interrupt paused the stream.
    pub fn is_force_paused(&self) -> bool {
        self.core.interrupt().is_force_paused()
    }

    /// Whether a forced duck is in effect.
    pub fn is_ducked(&self) -> bool {
        self.core.interrupt().is_ducked()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if matches!(self.state(), StreamState::New | StreamState::Released) {
            return;
        }
        if let Err(err) = self.core.release() {
            tracing::warn!(%err, "renderer dropped without release, cleanup failed");
        }
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer").field("core", &self.core).finish()
    }
}
