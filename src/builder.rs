//! Builders for [`Renderer`] and [`Capturer`].

use std::sync::Arc;

use crate::capturer::Capturer;
use crate::context::AudioContext;
use crate::event::{event_callback, DataCallback, EventCallback, StreamEvent};
use crate::format::AudioStreamParams;
use crate::info::{AppInfo, CapturerInfo, RenderMode, RendererInfo, StreamInfo};
use crate::renderer::Renderer;
use crate::stream::StreamCore;
use crate::StreamError;

/// Settings both builders share.
struct StreamSetup {
    ctx: AudioContext,
    params: Option<AudioStreamParams>,
    app: AppInfo,
    render_mode: RenderMode,
    event_callback: Option<EventCallback>,
    data_callback: Option<DataCallback>,
}

impl StreamSetup {
    fn new(ctx: &AudioContext) -> Self {
        Self {
            ctx: ctx.clone(),
            params: None,
            app: AppInfo::default(),
            render_mode: RenderMode::default(),
            event_callback: None,
            data_callback: None,
        }
    }

    fn build(self, info: StreamInfo) -> Result<Arc<StreamCore>, StreamError> {
        if let Some(params) = &self.params {
            params.validate()?;
        }

        let core = StreamCore::new(self.ctx, info, self.app);
        core.set_event_callback(self.event_callback);
        if self.data_callback.is_some() {
            core.set_data_callback(self.data_callback);
        }
        if self.render_mode != RenderMode::Normal {
            core.set_render_mode(self.render_mode)?;
        }
        if let Some(params) = self.params {
            core.set_params(params)?;
        }
        tracing::debug!(direction = %info.direction(), state = %core.state(), "stream created");
        Ok(core)
    }
}

/// Builder for a [`Renderer`].
///
/// Use [`Renderer::builder()`] to create one.
///
/// # Example
///
/// ```
/// use audio_stream_client::policy::MockPolicy;
/// use audio_stream_client::server::LoopbackServer;
/// use audio_stream_client::{AudioContext, AudioStreamParams, Renderer, RendererInfo, StreamState};
///
/// let ctx = AudioContext::new(LoopbackServer::new(), MockPolicy::new());
/// let renderer = Renderer::builder(&ctx)
///     .info(RendererInfo::music())
///     .params(AudioStreamParams::cd_quality())
///     .on_event(|event| println!("{event:?}"))
///     .build()?;
/// assert_eq!(renderer.state(), StreamState::Prepared);
/// # Ok::<(), audio_stream_client::StreamError>(())
/// ```
#[must_use]
pub struct RendererBuilder {
    setup: StreamSetup,
    info: RendererInfo,
}

impl RendererBuilder {
    pub(crate) fn new(ctx: &AudioContext) -> Self {
        Self {
            setup: StreamSetup::new(ctx),
            info: RendererInfo::music(),
        }
    }

    /// Content, usage and latency class of the stream.
    ///
    /// Default: [`RendererInfo::music()`]
    pub fn info(mut self, info: RendererInfo) -> Self {
        self.info = info;
        self
    }

    /// Negotiate these parameters while building, leaving the renderer
    /// PREPARED. Without it the renderer stays NEW until
    /// [`Renderer::set_params`].
    pub fn params(mut self, params: AudioStreamParams) -> Self {
        self.setup.params = Some(params);
        self
    }

    /// Owning application.
    ///
    /// Default: the current process, uid 0
    pub fn app(mut self, app: AppInfo) -> Self {
        self.setup.app = app;
        self
    }

    /// Blocking writes or buffer-queue callbacks.
    ///
    /// Default: [`RenderMode::Normal`]
    pub fn render_mode(mut self, mode: RenderMode) -> Self {
        self.setup.render_mode = mode;
        self
    }

    /// Set a callback to receive runtime events.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(StreamEvent) + Send + Sync + 'static,
    {
        self.setup.event_callback = Some(event_callback(callback));
        self
    }

    /// Set an already shared event callback, e.g. from
    /// [`event_channel`](crate::event_channel).
    pub fn event_callback(mut self, callback: EventCallback) -> Self {
        self.setup.event_callback = Some(callback);
        self
    }

    /// Called in callback mode whenever spans are ready to be filled.
    pub fn on_write_data<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.setup.data_callback = Some(Arc::new(callback));
        self
    }

    /// Creates the renderer.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters are invalid or the transport
    /// cannot be created.
    pub fn build(self) -> Result<Renderer, StreamError> {
        let info = StreamInfo::Renderer(self.info);
        self.setup.build(info).map(Renderer::from_core)
    }
}

/// Builder for a [`Capturer`].
///
/// Use [`Capturer::builder()`] to create one.
#[must_use]
pub struct CapturerBuilder {
    setup: StreamSetup,
    info: CapturerInfo,
}

impl CapturerBuilder {
    pub(crate) fn new(ctx: &AudioContext, info: CapturerInfo) -> Self {
        Self {
            setup: StreamSetup::new(ctx),
            info,
        }
    }

    /// Request the low-latency transport.
    pub fn low_latency(mut self, low_latency: bool) -> Self {
        self.info = self.info.with_low_latency(low_latency);
        self
    }

    /// Negotiate these parameters while building.
    pub fn params(mut self, params: AudioStreamParams) -> Self {
        self.setup.params = Some(params);
        self
    }

    /// Owning application.
    pub fn app(mut self, app: AppInfo) -> Self {
        self.setup.app = app;
        self
    }

    /// Blocking reads or buffer-queue callbacks.
    pub fn capture_mode(mut self, mode: RenderMode) -> Self {
        self.setup.render_mode = mode;
        self
    }

    /// Set a callback to receive runtime events.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(StreamEvent) + Send + Sync + 'static,
    {
        self.setup.event_callback = Some(event_callback(callback));
        self
    }

    /// Set an already shared event callback.
    pub fn event_callback(mut self, callback: EventCallback) -> Self {
        self.setup.event_callback = Some(callback);
        self
    }

    /// Called in callback mode with the size of each captured span.
    pub fn on_read_data<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.setup.data_callback = Some(Arc::new(callback));
        self
    }

    /// Creates the capturer.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters are invalid or the transport
    /// cannot be created.
    pub fn build(self) -> Result<Capturer, StreamError> {
        let info = StreamInfo::Capturer(self.info);
        self.setup.build(info).map(Capturer::from_core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MockPolicy;
    use crate::server::LoopbackServer;
    use crate::state::StreamState;

    fn ctx() -> AudioContext {
        AudioContext::new(LoopbackServer::new(), MockPolicy::new())
    }

    #[test]
    fn test_builder_without_params_stays_new() {
        let renderer = Renderer::builder(&ctx()).build().unwrap();
        assert_eq!(renderer.state(), StreamState::New);
        assert!(renderer.session_id().is_none());
    }

    #[test]
    fn test_builder_rejects_invalid_params() {
        let params = AudioStreamParams {
            sample_rate: 0,
            ..AudioStreamParams::cd_quality()
        };
        let result = Renderer::builder(&ctx()).params(params).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_callback_mode_allocates_queue() {
        let renderer = Renderer::builder(&ctx())
            .render_mode(RenderMode::Callback)
            .params(AudioStreamParams::cd_quality())
            .build()
            .unwrap();
        assert_eq!(renderer.buffer_queue_state().unwrap().free, 4);
    }
}
