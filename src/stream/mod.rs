//! State machine driver shared by renderers and capturers.
//!
//! Lock order: `control` before the transport slot before any buffer-queue
//! lock. Data calls (`write`, `read`, position queries) and the buffer-queue
//! exchange only take a short read lock on the transport slot, so they
//! proceed while a lifecycle call holds `control`. Callback threads never
//! take `control`: lifecycle calls hold it while they join those threads.
//! Events are emitted after `control` is released.

mod switch;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::buffer::{BufferQueue, QueueRole};
use crate::context::AudioContext;
use crate::error::ErrorKind;
use crate::event::{
    DataCallback, EventCallback, EventHub, FirstFrameCallback, PositionCallback, StreamEvent,
};
use crate::format::{span_capacity, AudioStreamParams};
use crate::info::{
    AppInfo, Direction, EffectMode, InterruptMode, PrivacyType, RenderMode, RenderRate,
    StreamInfo,
};
use crate::interrupt::InterruptHandler;
use crate::policy::{DeviceChange, InterruptRecord, StreamChangeInfo};
use crate::recovery::{Attempt, Recovery};
use crate::session::{SessionId, SessionStats};
use crate::state::{AtomicState, ChangeSource, StateCommand, StreamState};
use crate::timing::{ClockTime, PositionTracker};
use crate::transport::{PcmDump, SwitchInfo, Transport, TransportClass, TransportDeps};
use crate::StreamError;

/// A frame position and the clock time it was reached at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTimestamp {
    /// Frames played (playback) or captured (capture) since the stream was
    /// first started. Never decreases.
    pub frames: u64,
    /// Monotonic clock time of `frames`.
    pub time: Duration,
}

/// Everything lifecycle calls serialize on.
struct Control {
    /// Settings applied to the next transport. Kept in step with the live
    /// transport by every setter.
    draft: SwitchInfo,
    interrupt_mode: InterruptMode,
    parallel_play: bool,
    pause_when_ducked: bool,
    dump: Option<Arc<PcmDump>>,
    /// Session the policy callbacks are registered under.
    registered: Option<SessionId>,
}

pub(crate) struct StreamCore {
    weak: Weak<StreamCore>,
    ctx: AudioContext,
    info: StreamInfo,
    app: AppInfo,
    state: AtomicState,
    control: Mutex<Control>,
    transport: RwLock<Option<Arc<Transport>>>,
    switching: AtomicBool,
    events: Arc<EventHub>,
    interrupt: Arc<InterruptHandler>,
    recovery: Recovery,
    tracker: PositionTracker,
    /// Frames reported by transports this stream already moved away from.
    position_base: AtomicU64,
}

impl StreamCore {
    pub fn new(ctx: AudioContext, info: StreamInfo, app: AppInfo) -> Arc<Self> {
        let recovery = Recovery::new(ctx.config().recovery.clone());
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            info,
            app,
            state: AtomicState::new(StreamState::New),
            control: Mutex::new(Control {
                draft: SwitchInfo::new(AudioStreamParams::default(), info, app),
                interrupt_mode: InterruptMode::default(),
                parallel_play: false,
                pause_when_ducked: false,
                dump: None,
                registered: None,
            }),
            transport: RwLock::new(None),
            switching: AtomicBool::new(false),
            events: Arc::new(EventHub::default()),
            interrupt: Arc::new(InterruptHandler::new(weak.clone())),
            recovery,
            tracker: PositionTracker::new(),
            position_base: AtomicU64::new(0),
            ctx,
        })
    }

    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock()
    }

    pub(crate) fn transport(&self) -> Option<Arc<Transport>> {
        self.transport.read().clone()
    }

    fn publish(&self, transport: Option<Arc<Transport>>) -> Option<Arc<Transport>> {
        let mut slot = self.transport.write();
        std::mem::replace(&mut *slot, transport)
    }

    fn deps<'a>(&'a self, control: &'a Control) -> TransportDeps<'a> {
        TransportDeps {
            server: &**self.ctx.server(),
            config: self.ctx.config(),
            events: &self.events,
            dump: control.dump.as_ref(),
        }
    }

    fn require_transport(&self, operation: &'static str) -> Result<Arc<Transport>, StreamError> {
        self.transport()
            .ok_or_else(|| StreamError::illegal_state(operation, self.state()))
    }

    fn ensure_not_switching(&self, operation: &'static str) -> Result<(), StreamError> {
        if self.switching.load(Ordering::SeqCst) {
            return Err(StreamError::SwitchInProgress { operation });
        }
        Ok(())
    }

    pub fn state(&self) -> StreamState {
        self.state.load()
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn direction(&self) -> Direction {
        self.info.direction()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.transport().map(|t| t.session_id())
    }

    pub fn has_transport(&self) -> bool {
        self.transport.read().is_some()
    }

    pub fn transport_class(&self) -> Option<TransportClass> {
        self.transport().map(|t| t.class())
    }

    pub fn is_switching(&self) -> bool {
        self.switching.load(Ordering::SeqCst)
    }

    pub fn interrupt(&self) -> &InterruptHandler {
        &self.interrupt
    }

    pub fn emit(&self, event: StreamEvent) {
        self.events.emit(event);
    }

    pub fn set_event_callback(&self, callback: Option<EventCallback>) {
        self.events.set(callback);
    }

    fn emit_state(&self, state: StreamState, source: ChangeSource) {
        tracing::info!(session = ?self.session_id(), %state, ?source, "stream state changed");
        self.emit(StreamEvent::StateChanged { state, source });
    }

    fn record(&self, control: &Control, session: SessionId) -> InterruptRecord {
        InterruptRecord {
            session_id: session,
            stream_type: self.info.stream_type(),
            mode: control.interrupt_mode,
            pause_when_ducked: control.pause_when_ducked,
            pid: self.app.pid,
            parallel_play: control.parallel_play,
        }
    }

    fn change_info(&self, session: SessionId, state: StreamState) -> StreamChangeInfo {
        StreamChangeInfo {
            session_id: session,
            direction: self.direction(),
            state,
            uid: self.app.uid,
            stream_type: self.info.stream_type(),
        }
    }

    fn update_tracker(&self, transport: &Transport, state: StreamState) {
        if !transport.tracker_registered() {
            return;
        }
        let info = self.change_info(transport.session_id(), state);
        if let Err(err) = self.ctx.policy().update_tracker(&info) {
            tracing::warn!(session = %info.session_id, %err, "tracker update failed");
        }
    }

    fn register_tracker(&self, transport: &Transport, state: StreamState) {
        let info = self.change_info(transport.session_id(), state);
        match self.ctx.policy().register_tracker(&info) {
            Ok(()) => transport.set_tracker_registered(true),
            Err(err) => tracing::warn!(session = %info.session_id, %err, "tracker registration failed"),
        }
    }

    fn deactivate_best_effort(&self, record: &InterruptRecord) {
        if let Err(err) = self.ctx.policy().deactivate_interrupt(record) {
            tracing::warn!(session = %record.session_id, %err, "focus deactivation failed");
        }
    }

    /// Routes interrupt, service-died and device-change callbacks for
    /// `session` to this stream, replacing any earlier registration.
    fn register_callbacks(&self, control: &mut Control, session: SessionId) {
        self.unregister_callbacks(control);
        let policy = self.ctx.policy();

        let handler = Arc::clone(&self.interrupt);
        if let Err(err) =
            policy.set_interrupt_callback(session, Arc::new(move |event| handler.handle(event)))
        {
            tracing::warn!(%session, %err, "could not set interrupt callback");
        }

        let weak = self.weak.clone();
        policy.register_service_died_callback(
            session,
            Arc::new(move || {
                if let Some(core) = weak.upgrade() {
                    core.on_service_died();
                }
            }),
        );

        let weak = self.weak.clone();
        policy.register_device_change_callback(
            session,
            Arc::new(move |change| {
                if let Some(core) = weak.upgrade() {
                    core.on_device_change(change);
                }
            }),
        );
        control.registered = Some(session);
    }

    fn unregister_callbacks(&self, control: &mut Control) {
        let Some(session) = control.registered.take() else {
            return;
        };
        let policy = self.ctx.policy();
        if let Err(err) = policy.unset_interrupt_callback(session) {
            tracing::debug!(%session, %err, "interrupt callback already gone");
        }
        policy.unregister_service_died_callback(session);
        policy.unregister_device_change_callback(session);
    }

    fn allocate_queue(&self, params: &AudioStreamParams, min_bytes: usize) -> Arc<BufferQueue> {
        let config = self.ctx.config();
        let (role, count) = match self.direction() {
            Direction::Playback => (QueueRole::Render, config.render_spans),
            Direction::Capture => (QueueRole::Capture, config.capture_spans),
        };
        let capacity = span_capacity(params, min_bytes, config.min_buffer_duration);
        tracing::debug!(?role, count, capacity, "allocating buffer queue");
        Arc::new(BufferQueue::new(role, count, capacity))
    }

    fn initial_class(&self) -> TransportClass {
        let wanted = self.info.low_latency();
        if wanted && !self.ctx.server().supports_low_latency() {
            tracing::info!("low latency not supported by the server, using stream transport");
            return TransportClass::Stream;
        }
        TransportClass::for_low_latency(wanted)
    }

    /// Negotiates `params` with a new transport. NEW → PREPARED.
    pub fn set_params(&self, params: AudioStreamParams) -> Result<(), StreamError> {
        params.validate()?;
        let mut control = self.lock_control();
        let state = self.state();
        if !state.allows(StateCommand::Prepare) {
            return Err(StreamError::illegal_state("set params", state));
        }

        control.draft.params = params;
        if control.dump.is_none() && self.direction() == Direction::Playback {
            if let Some(path) = &self.ctx.config().dump_path {
                match PcmDump::create(path, &params) {
                    Ok(dump) => control.dump = Some(Arc::new(dump)),
                    Err(err) => tracing::warn!(path = %path.display(), %err, "could not open PCM dump"),
                }
            }
        }

        let transport = Transport::create(self.initial_class(), &self.deps(&control), &control.draft)?;
        if control.draft.render_mode == RenderMode::Callback {
            let queue = self.allocate_queue(&params, transport.min_buffer_size());
            transport.set_render_mode(RenderMode::Callback, Some(Arc::clone(&queue)));
            control.draft.buffer_queue = Some(queue);
        }
        self.register_tracker(&transport, StreamState::Prepared);

        let session = transport.session_id();
        self.publish(Some(Arc::new(transport)));
        self.register_callbacks(&mut control, session);
        self.state.store(StreamState::Prepared);
        drop(control);

        tracing::info!(%session, rate = params.sample_rate, channels = params.channels, "stream prepared");
        self.emit_state(StreamState::Prepared, ChangeSource::Client);
        Ok(())
    }

    /// PREPARED/PAUSED/STOPPED → RUNNING. Focus is requested first.
    pub fn start(&self) -> Result<(), StreamError> {
        self.ensure_not_switching("start")?;
        let control = self.lock_control();
        let state = self.state();
        if !state.allows(StateCommand::Start) {
            return Err(StreamError::illegal_state("start", state));
        }
        let transport = self.require_transport("start")?;
        if !self.info.stream_type().is_valid() {
            return Err(StreamError::invalid_param("stream focus type is not set"));
        }

        let record = self.record(&control, transport.session_id());
        match self.ctx.policy().activate_interrupt(&record) {
            Ok(()) => {}
            Err(err) if self.info.is_voice_modem() => {
                tracing::warn!(session = %record.session_id, %err, "voice modem focus request failed");
            }
            Err(err) => {
                tracing::warn!(session = %record.session_id, %err, "focus request refused, not starting");
                return Err(err.into());
            }
        }

        if let Err(err) = transport.start() {
            tracing::error!(session = %record.session_id, %err, "transport start failed");
            self.deactivate_best_effort(&record);
            return Err(err);
        }
        self.interrupt.on_client_start();
        self.state.store(StreamState::Running);
        self.update_tracker(&transport, StreamState::Running);
        drop(control);

        self.emit_state(StreamState::Running, ChangeSource::Client);
        Ok(())
    }

    /// RUNNING → PAUSED.
    ///
    /// Voice-modem streams give up focus only; their transport keeps
    /// running and the state stays RUNNING.
    pub fn pause(&self) -> Result<(), StreamError> {
        self.ensure_not_switching("pause")?;
        let control = self.lock_control();
        let state = self.state();
        if !state.allows(StateCommand::Pause) {
            return Err(StreamError::illegal_state("pause", state));
        }
        let transport = self.require_transport("pause")?;
        let record = self.record(&control, transport.session_id());

        if self.info.is_voice_modem() {
            self.deactivate_best_effort(&record);
            tracing::info!(session = %record.session_id, "voice modem pause releases focus only");
            return Ok(());
        }

        transport.pause()?;
        self.deactivate_best_effort(&record);
        self.state.store(StreamState::Paused);
        self.update_tracker(&transport, StreamState::Paused);
        drop(control);

        self.emit_state(StreamState::Paused, ChangeSource::Client);
        Ok(())
    }

    /// RUNNING/PAUSED → STOPPED. Stops the transport, then gives up focus.
    pub fn stop(&self) -> Result<(), StreamError> {
        self.ensure_not_switching("stop")?;
        let control = self.lock_control();
        let state = self.state();
        if !state.allows(StateCommand::Stop) {
            return Err(StreamError::illegal_state("stop", state));
        }
        let transport = self.require_transport("stop")?;

        self.state.store(StreamState::Stopping);
        if let Err(err) = transport.stop() {
            tracing::error!(session = %transport.session_id(), %err, "transport stop failed");
            self.state.store(state);
            return Err(err);
        }
        self.deactivate_best_effort(&self.record(&control, transport.session_id()));
        self.interrupt.on_client_stop();
        self.state.store(StreamState::Stopped);
        self.update_tracker(&transport, StreamState::Stopped);
        drop(control);

        self.emit_state(StreamState::Stopped, ChangeSource::Client);
        Ok(())
    }

    /// Tears the stream down. Releasing twice is a no-op.
    pub fn release(&self) -> Result<(), StreamError> {
        // Before `control`: a restore attempt in flight holds it.
        self.recovery.abort();

        let mut control = self.lock_control();
        let state = self.state();
        if state == StreamState::Released {
            return Ok(());
        }
        if !state.allows(StateCommand::Release) {
            return Err(StreamError::illegal_state("release", state));
        }

        if let Some(transport) = self.transport() {
            transport.release()?;
            if state == StreamState::Running {
                self.deactivate_best_effort(&self.record(&control, transport.session_id()));
            }
            self.unregister_callbacks(&mut control);
            self.update_tracker(&transport, StreamState::Released);
        }
        self.publish(None);

        if let Some(dump) = control.dump.take() {
            if let Err(err) = dump.finalize() {
                tracing::warn!(%err, "could not finalize PCM dump");
            }
        }
        if let Some(queue) = control.draft.buffer_queue.take() {
            queue.clear();
        }
        self.interrupt.on_client_stop();
        self.state.store(StreamState::Released);
        drop(control);

        self.emit_state(StreamState::Released, ChangeSource::Client);
        Ok(())
    }

    /// Waits for queued playback to reach the server. RUNNING only.
    pub fn drain(&self) -> Result<(), StreamError> {
        let state = self.state();
        if state != StreamState::Running {
            return Err(StreamError::illegal_state("drain", state));
        }
        self.require_transport("drain")?
            .drain(self.ctx.config().drain_timeout)
    }

    /// Discards queued data. RUNNING, PAUSED or STOPPED.
    pub fn flush(&self) -> Result<(), StreamError> {
        let state = self.state();
        if !matches!(
            state,
            StreamState::Running | StreamState::Paused | StreamState::Stopped
        ) {
            return Err(StreamError::illegal_state("flush", state));
        }
        self.require_transport("flush")?.flush()
    }

    fn data_transport(&self, operation: &'static str, len: usize) -> Result<Arc<Transport>, StreamError> {
        if len == 0 {
            return Err(StreamError::invalid_param("buffer is empty"));
        }
        let state = self.state();
        if state != StreamState::Running {
            return Err(StreamError::illegal_state(operation, state));
        }
        let transport = self.require_transport(operation)?;
        if transport.render_mode() == RenderMode::Callback {
            return Err(StreamError::invalid_param(
                "blocking data calls are not available in callback mode",
            ));
        }
        Ok(transport)
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        self.data_transport("write", data.len())?.write(data)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.data_transport("read", buf.len())?.read(buf)
    }

    /// Sets the application volume, `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) -> Result<(), StreamError> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(StreamError::invalid_param(format!(
                "volume {volume} outside 0.0..=1.0"
            )));
        }
        let mut control = self.lock_control();
        if let Some(transport) = self.transport() {
            transport.set_volume(volume)?;
        }
        control.draft.volume = volume;
        Ok(())
    }

    pub fn volume(&self) -> f32 {
        match self.transport() {
            Some(transport) => transport.volume(),
            None => self.lock_control().draft.volume,
        }
    }

    /// Changes the transport volume without touching the application's
    /// setting. Used for ducking.
    pub fn set_transport_volume(&self, volume: f32) -> Result<(), StreamError> {
        self.require_transport("set volume")?.set_volume(volume)
    }

    /// Playback speed. Kept across a transport switch.
    pub fn set_render_rate(&self, rate: RenderRate) -> Result<(), StreamError> {
        if self.direction() != Direction::Playback {
            return Err(StreamError::invalid_param("render rate on a capture stream"));
        }
        let mut control = self.lock_control();
        if let Some(transport) = self.transport() {
            transport.set_render_rate(rate)?;
        }
        control.draft.render_rate = rate;
        tracing::debug!(%rate, "render rate set");
        Ok(())
    }

    pub fn render_rate(&self) -> RenderRate {
        match self.transport() {
            Some(transport) => transport.render_rate(),
            None => self.lock_control().draft.render_rate,
        }
    }

    /// Offload trades latency for fewer wake-ups. Kept across a transport
    /// switch.
    pub fn set_offload_mode(&self, enabled: bool) -> Result<(), StreamError> {
        if self.direction() != Direction::Playback {
            return Err(StreamError::invalid_param("offload on a capture stream"));
        }
        let mut control = self.lock_control();
        if let Some(transport) = self.transport() {
            transport.set_offload(enabled)?;
        }
        control.draft.offload = enabled;
        Ok(())
    }

    pub fn offload_mode(&self) -> bool {
        match self.transport() {
            Some(transport) => transport.offload(),
            None => self.lock_control().draft.offload,
        }
    }

    pub fn audio_time(&self) -> Result<AudioTimestamp, StreamError> {
        let transport = self.require_transport("get audio time")?;
        let (raw, time) = transport.position()?;
        let frames = self
            .tracker
            .observe(self.position_base.load(Ordering::SeqCst) + raw);
        Ok(AudioTimestamp {
            frames,
            time: ClockTime::to_duration(time),
        })
    }

    pub fn latency(&self) -> Result<Duration, StreamError> {
        Ok(self.require_transport("get latency")?.latency())
    }

    pub fn min_buffer_size(&self) -> Result<usize, StreamError> {
        Ok(self.require_transport("get buffer size")?.min_buffer_size())
    }

    pub fn stats(&self) -> SessionStats {
        match self.transport() {
            Some(transport) => transport.stats(),
            None => self.lock_control().draft.stats,
        }
    }

    pub fn params(&self) -> Option<AudioStreamParams> {
        self.transport().map(|t| t.params())
    }

    /// Normal or callback mode. Only before the first start.
    pub fn set_render_mode(&self, mode: RenderMode) -> Result<(), StreamError> {
        let mut control = self.lock_control();
        let state = self.state();
        if !matches!(state, StreamState::New | StreamState::Prepared) {
            return Err(StreamError::illegal_state("set render mode", state));
        }
        if control.draft.render_mode == mode {
            return Ok(());
        }
        control.draft.render_mode = mode;

        let transport = self.transport();
        match (mode, transport) {
            (RenderMode::Callback, Some(transport)) => {
                let queue = self.allocate_queue(&control.draft.params, transport.min_buffer_size());
                transport.set_render_mode(RenderMode::Callback, Some(Arc::clone(&queue)));
                control.draft.buffer_queue = Some(queue);
            }
            // Allocated once the transport exists.
            (RenderMode::Callback, None) => {}
            (RenderMode::Normal, transport) => {
                control.draft.buffer_queue = None;
                if let Some(transport) = transport {
                    transport.set_render_mode(RenderMode::Normal, None);
                }
            }
        }
        tracing::debug!(?mode, "render mode set");
        Ok(())
    }

    pub fn render_mode(&self) -> RenderMode {
        match self.transport() {
            Some(transport) => transport.render_mode(),
            None => self.lock_control().draft.render_mode,
        }
    }

    /// The span pool of a callback-mode stream. Safe to call from the data
    /// callback.
    pub fn buffer_queue(&self) -> Result<Arc<BufferQueue>, StreamError> {
        self.transport()
            .and_then(|t| t.buffer_queue())
            .ok_or(StreamError::NotFound {
                what: "buffer queue",
            })
    }

    /// Applies `update` to the draft settings and, when present, the live
    /// transport.
    fn configure(&self, update: impl Fn(&mut SwitchInfo, Option<&Transport>)) {
        let mut control = self.lock_control();
        let transport = self.transport();
        update(&mut control.draft, transport.as_deref());
    }

    pub fn set_data_callback(&self, callback: Option<DataCallback>) {
        self.configure(|draft, transport| {
            draft.data_callback = callback.clone();
            if let Some(transport) = transport {
                transport.set_data_callback(callback.clone());
            }
        });
    }

    pub fn set_first_frame_callback(&self, callback: Option<FirstFrameCallback>) {
        self.configure(|draft, transport| {
            draft.first_frame_callback = callback.clone();
            if let Some(transport) = transport {
                transport.set_first_frame_callback(callback.clone());
            }
        });
    }

    pub fn set_mark(&self, mark: Option<(u64, PositionCallback)>) -> Result<(), StreamError> {
        if matches!(mark, Some((0, _))) {
            return Err(StreamError::invalid_param("mark position must be positive"));
        }
        self.configure(|draft, transport| {
            draft.mark = mark.clone();
            if let Some(transport) = transport {
                transport.set_mark(mark.clone());
            }
        });
        Ok(())
    }

    pub fn set_period(&self, period: Option<(u64, PositionCallback)>) -> Result<(), StreamError> {
        if matches!(period, Some((0, _))) {
            return Err(StreamError::invalid_param("period length must be positive"));
        }
        self.configure(|draft, transport| {
            draft.period = period.clone();
            if let Some(transport) = transport {
                transport.set_period(period.clone());
            }
        });
        Ok(())
    }

    pub fn set_effect_mode(&self, mode: EffectMode) {
        self.configure(|draft, transport| {
            draft.effect_mode = mode;
            if let Some(transport) = transport {
                transport.set_effect_mode(mode);
            }
        });
    }

    pub fn effect_mode(&self) -> EffectMode {
        match self.transport() {
            Some(transport) => transport.settings().0,
            None => self.lock_control().draft.effect_mode,
        }
    }

    pub fn set_cache_path(&self, path: Option<PathBuf>) {
        self.configure(|draft, transport| {
            draft.cache_path = path.clone();
            if let Some(transport) = transport {
                transport.set_cache_path(path.clone());
            }
        });
    }

    pub fn set_privacy(&self, privacy: PrivacyType) {
        self.configure(|draft, transport| {
            draft.privacy = privacy;
            if let Some(transport) = transport {
                transport.set_privacy(privacy);
            }
        });
    }

    pub fn privacy(&self) -> PrivacyType {
        match self.transport() {
            Some(transport) => transport.settings().1,
            None => self.lock_control().draft.privacy,
        }
    }

    pub fn set_interrupt_mode(&self, mode: InterruptMode) {
        self.lock_control().interrupt_mode = mode;
    }

    pub fn interrupt_mode(&self) -> InterruptMode {
        self.lock_control().interrupt_mode
    }

    pub fn set_parallel_play(&self, parallel: bool) {
        self.lock_control().parallel_play = parallel;
    }

    pub fn set_pause_when_ducked(&self, pause: bool) {
        self.lock_control().pause_when_ducked = pause;
    }

    /// Forced pause from the arbitrator. Focus is already gone on its side.
    ///
    /// Returns `false` if the stream was not running.
    pub fn force_pause(&self) -> Result<bool, StreamError> {
        self.ensure_not_switching("pause")?;
        let control = self.lock_control();
        if self.state() != StreamState::Running {
            return Ok(false);
        }
        let transport = self.require_transport("pause")?;
        transport.pause()?;
        self.state.store(StreamState::Paused);
        self.update_tracker(&transport, StreamState::Paused);
        drop(control);

        self.emit_state(StreamState::Paused, ChangeSource::System);
        Ok(true)
    }

    /// Forced stop from the arbitrator.
    pub fn force_stop(&self) -> Result<(), StreamError> {
        self.ensure_not_switching("stop")?;
        let control = self.lock_control();
        let state = self.state();
        if !state.allows(StateCommand::Stop) {
            return Ok(());
        }
        let transport = self.require_transport("stop")?;
        self.state.store(StreamState::Stopping);
        if let Err(err) = transport.stop() {
            self.state.store(state);
            return Err(err);
        }
        self.state.store(StreamState::Stopped);
        self.update_tracker(&transport, StreamState::Stopped);
        drop(control);

        self.emit_state(StreamState::Stopped, ChangeSource::System);
        Ok(())
    }

    fn on_device_change(&self, change: DeviceChange) {
        match change {
            DeviceChange::OutputChanged(device) => {
                tracing::info!(session = ?self.session_id(), device = %device.name, "output device changed");
                self.emit(StreamEvent::DeviceChanged { device });
            }
            DeviceChange::RecreateStream { low_latency } => {
                if let Err(err) = self.switch_stream(low_latency) {
                    tracing::warn!(%err, low_latency, "stream recreation not done");
                }
            }
        }
    }

    fn on_service_died(&self) {
        tracing::warn!(session = ?self.session_id(), "policy service died, starting recovery");
        self.recovery.spawn(self.weak.clone());
    }

    /// One recovery attempt: reconnect the transport, then replay the
    /// interrupt registration and, if running, the focus request.
    pub(crate) fn try_restore(&self, attempt: u32) -> Attempt {
        let control = self.lock_control();
        let state = self.state();
        if state == StreamState::Released {
            return Attempt::Gone;
        }
        let Some(transport) = self.transport() else {
            return Attempt::Gone;
        };
        if let Err(err) = transport.restore() {
            tracing::debug!(attempt, %err, "transport restore failed");
            return Attempt::Failed;
        }

        let session = transport.session_id();
        let policy = self.ctx.policy();
        let handler = Arc::clone(&self.interrupt);
        if let Err(err) =
            policy.set_interrupt_callback(session, Arc::new(move |event| handler.handle(event)))
        {
            tracing::warn!(%session, %err, "could not set interrupt callback after restore");
        }
        if state == StreamState::Running {
            if let Err(err) = policy.activate_interrupt(&self.record(&control, session)) {
                tracing::warn!(%session, %err, "could not re-activate focus after restore");
            }
        }
        drop(control);

        tracing::info!(%session, attempts = attempt, "stream restored");
        self.emit(StreamEvent::Restored { attempts: attempt });
        Attempt::Restored
    }

    pub(crate) fn on_recovery_exhausted(&self, attempts: u32) {
        let control = self.lock_control();
        if self.state() == StreamState::Released {
            return;
        }
        tracing::error!(session = ?self.session_id(), attempts, "recovery gave up, stream unusable");
        self.state.store(StreamState::Invalid);
        drop(control);

        self.emit(StreamEvent::Error {
            kind: ErrorKind::ServiceDied,
            message: format!("stream not restored after {attempts} attempts"),
        });
        self.emit_state(StreamState::Invalid, ChangeSource::System);
    }
}

impl std::fmt::Debug for StreamCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCore")
            .field("direction", &self.direction())
            .field("state", &self.state())
            .field("transport", &self.transport())
            .field("switching", &self.is_switching())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::RendererInfo;
    use crate::policy::MockPolicy;
    use crate::server::LoopbackServer;

    fn core() -> (Arc<StreamCore>, LoopbackServer, MockPolicy) {
        let server = LoopbackServer::new();
        let policy = MockPolicy::new();
        let ctx = AudioContext::new(server.clone(), policy.clone());
        let core = StreamCore::new(
            ctx,
            StreamInfo::Renderer(RendererInfo::music()),
            AppInfo::default(),
        );
        (core, server, policy)
    }

    #[test]
    fn test_release_from_new_is_illegal() {
        let (core, _, _) = core();
        let err = core.release().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        assert_eq!(core.state(), StreamState::New);
    }

    #[test]
    fn test_playback_settings_before_prepare_reach_transport() {
        let (core, server, _) = core();
        core.set_render_rate(RenderRate::Double).unwrap();
        core.set_offload_mode(true).unwrap();
        assert!(core.offload_mode());
        core.set_params(AudioStreamParams::cd_quality()).unwrap();
        let session = core.session_id().unwrap();
        assert_eq!(server.render_rate_of(session), Some(96_000));
        assert!(server.is_offloaded(session));
        assert_eq!(core.render_rate(), RenderRate::Double);
        core.release().unwrap();
    }

    #[test]
    fn test_capture_rejects_playback_settings() {
        let ctx = AudioContext::new(LoopbackServer::new(), MockPolicy::new());
        let core = StreamCore::new(
            ctx,
            StreamInfo::Capturer(crate::info::CapturerInfo::new(crate::info::SourceType::Mic)),
            AppInfo::default(),
        );
        let err = core.set_offload_mode(true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
        assert!(core.set_render_rate(RenderRate::Half).is_err());
        assert!(!core.offload_mode());
    }

    #[test]
    fn test_switching_flag_gates_lifecycle() {
        let (core, _, _) = core();
        core.set_params(AudioStreamParams::cd_quality()).unwrap();
        core.switching.store(true, Ordering::SeqCst);
        assert!(matches!(core.start(), Err(StreamError::SwitchInProgress { .. })));
        assert!(matches!(core.pause(), Err(StreamError::SwitchInProgress { .. })));
        assert!(matches!(core.stop(), Err(StreamError::SwitchInProgress { .. })));
        core.switching.store(false, Ordering::SeqCst);
        assert_eq!(core.state(), StreamState::Prepared);
        core.release().unwrap();
    }

    #[test]
    fn test_set_params_registers_tracker_and_callbacks() {
        let (core, _, policy) = core();
        core.set_params(AudioStreamParams::cd_quality()).unwrap();
        let session = core.session_id().unwrap();
        assert_eq!(policy.tracker(session).map(|t| t.state), Some(StreamState::Prepared));
        assert!(policy.has_interrupt_callback(session));
        assert!(policy.has_service_died_callback(session));
        core.release().unwrap();
        assert!(!policy.has_interrupt_callback(session));
        assert_eq!(policy.tracker(session).map(|t| t.state), Some(StreamState::Released));
    }

    #[test]
    fn test_failed_activation_aborts_start() {
        let (core, _, policy) = core();
        core.set_params(AudioStreamParams::cd_quality()).unwrap();
        policy.set_fail_activate(true);
        assert!(core.start().is_err());
        assert_eq!(core.state(), StreamState::Prepared);
        core.release().unwrap();
    }

    #[test]
    fn test_failed_stop_keeps_state() {
        let (core, server, _) = core();
        core.set_params(AudioStreamParams::cd_quality()).unwrap();
        core.start().unwrap();
        server.faults().set_fail_stop(true);
        assert!(core.stop().is_err());
        assert_eq!(core.state(), StreamState::Running);
        server.faults().set_fail_stop(false);
        core.stop().unwrap();
        core.release().unwrap();
    }

    #[test]
    fn test_volume_range() {
        let (core, _, _) = core();
        assert!(core.set_volume(1.5).is_err());
        assert!(core.set_volume(f32::NAN).is_err());
        core.set_volume(0.25).unwrap();
        assert_eq!(core.volume(), 0.25);
    }
}
