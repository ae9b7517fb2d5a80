//! Data paths between a stream and the audio server.
//!
//! Two transport classes exist and the set is closed:
//! - [`TransportClass::Stream`]: blocking streaming protocol
//! - [`TransportClass::Process`]: shared [`ProcessBuffer`] span ring driven by
//!   a client-side real-time loop (low latency)
//!
//! A stream is backed by exactly one transport at a time. Moving to the other
//! class goes through a [`SwitchInfo`] snapshot of everything the stream has
//! configured on the transport.

mod callbacks;
mod dump;
mod process;
mod process_buffer;
mod stream;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use self::callbacks::{PositionCallbacks, StallDetector};
use self::process::ProcessTransport;
use self::stream::StreamTransport;
use crate::buffer::BufferQueue;
use crate::config::StreamConfig;
use crate::event::{
    DataCallback, EventHub, FirstFrameCallback, PositionCallback, StreamEvent,
};
use crate::format::AudioStreamParams;
use crate::info::{
    AppInfo, Direction, EffectMode, PrivacyType, RenderMode, RenderRate, StreamInfo,
};
use crate::server::{AudioServer, StreamRequest};
use crate::session::{SessionCounters, SessionId, SessionStats};
use crate::StreamError;

pub(crate) use dump::PcmDump;
pub use process_buffer::{ProcessBuffer, ProcessStatus, SpanStamp};

/// Which data path backs a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportClass {
    /// Blocking streaming protocol.
    Stream,
    /// Low-latency shared span ring.
    Process,
}

impl TransportClass {
    /// Class used for a stream asking for low latency or not.
    #[must_use]
    pub fn for_low_latency(low_latency: bool) -> Self {
        if low_latency {
            Self::Process
        } else {
            Self::Stream
        }
    }
}

impl fmt::Display for TransportClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => f.write_str("stream"),
            Self::Process => f.write_str("process"),
        }
    }
}

/// Everything a stream configured on its transport, as plain values.
///
/// Taken from the old transport and applied to the new one during a switch,
/// and built from the stream's options when the first transport is created.
#[derive(Clone)]
pub(crate) struct SwitchInfo {
    pub params: AudioStreamParams,
    pub info: StreamInfo,
    pub app: AppInfo,
    pub privacy: PrivacyType,
    pub cache_path: Option<PathBuf>,
    pub render_mode: RenderMode,
    pub effect_mode: EffectMode,
    pub volume: f32,
    pub render_rate: RenderRate,
    pub offload: bool,
    pub tracker_registered: bool,
    pub stats: SessionStats,
    pub buffer_queue: Option<Arc<BufferQueue>>,
    pub data_callback: Option<DataCallback>,
    pub first_frame_callback: Option<FirstFrameCallback>,
    pub mark: Option<(u64, PositionCallback)>,
    pub period: Option<(u64, PositionCallback)>,
}

impl SwitchInfo {
    pub fn new(params: AudioStreamParams, info: StreamInfo, app: AppInfo) -> Self {
        Self {
            params,
            info,
            app,
            privacy: PrivacyType::default(),
            cache_path: None,
            render_mode: RenderMode::default(),
            effect_mode: EffectMode::default(),
            volume: 1.0,
            render_rate: RenderRate::default(),
            offload: false,
            tracker_registered: false,
            stats: SessionStats::default(),
            buffer_queue: None,
            data_callback: None,
            first_frame_callback: None,
            mark: None,
            period: None,
        }
    }

    fn request(&self) -> StreamRequest {
        StreamRequest {
            direction: self.info.direction(),
            params: self.params,
            stream_type: self.info.stream_type(),
            app: self.app,
            privacy: self.privacy,
            effect_mode: self.effect_mode,
            cache_path: self.cache_path.clone(),
        }
    }
}

impl fmt::Debug for SwitchInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchInfo")
            .field("params", &self.params)
            .field("info", &self.info)
            .field("render_mode", &self.render_mode)
            .field("volume", &self.volume)
            .field("render_rate", &self.render_rate)
            .field("offload", &self.offload)
            .field("tracker_registered", &self.tracker_registered)
            .field("stats", &self.stats)
            .field("has_queue", &self.buffer_queue.is_some())
            .field("has_data_callback", &self.data_callback.is_some())
            .field("mark", &self.mark.as_ref().map(|(frame, _)| *frame))
            .field("period", &self.period.as_ref().map(|(frames, _)| *frames))
            .finish_non_exhaustive()
    }
}

/// What a transport needs from its stream at creation.
pub(crate) struct TransportDeps<'a> {
    pub server: &'a dyn AudioServer,
    pub config: &'a StreamConfig,
    pub events: &'a Arc<EventHub>,
    pub dump: Option<&'a Arc<PcmDump>>,
}

/// How the callback loop exchanges data with the application.
pub(crate) struct DataPath {
    pub mode: RenderMode,
    pub queue: Option<Arc<BufferQueue>>,
    pub offload: bool,
}

/// State both transport classes keep the same way.
pub(crate) struct TransportCommon {
    direction: Direction,
    session: SessionId,
    params: AudioStreamParams,
    settings: Mutex<SwitchInfo>,
    volume: AtomicU32,
    counters: SessionCounters,
    positions: Mutex<PositionCallbacks>,
    first_frame_pending: AtomicBool,
    stall: StallDetector,
    tracker_registered: AtomicBool,
    events: Arc<EventHub>,
    dump: Option<Arc<PcmDump>>,
}

impl TransportCommon {
    fn new(session: SessionId, info: &SwitchInfo, deps: &TransportDeps<'_>) -> Self {
        let common = Self {
            direction: info.info.direction(),
            session,
            params: info.params,
            settings: Mutex::new(info.clone()),
            volume: AtomicU32::new(info.volume.to_bits()),
            counters: SessionCounters::default(),
            positions: Mutex::new(PositionCallbacks::default()),
            first_frame_pending: AtomicBool::new(false),
            stall: StallDetector::new(deps.config.stall_limit),
            tracker_registered: AtomicBool::new(info.tracker_registered),
            events: Arc::clone(deps.events),
            dump: deps.dump.cloned(),
        };
        common.counters.restore(&info.stats);
        {
            let mut positions = common.lock_positions();
            if let Some((frame, callback)) = info.mark.clone() {
                positions.set_mark(frame, callback);
            }
            if let Some((frames, callback)) = info.period.clone() {
                positions.set_period(frames, callback, info.stats.frames_transferred);
            }
        }
        common
    }

    fn lock_settings(&self) -> MutexGuard<'_, SwitchInfo> {
        self.settings.lock()
    }

    fn lock_positions(&self) -> MutexGuard<'_, PositionCallbacks> {
        self.positions.lock()
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn params(&self) -> &AudioStreamParams {
        &self.params
    }

    pub fn data_path(&self) -> DataPath {
        let settings = self.lock_settings();
        DataPath {
            mode: settings.render_mode,
            queue: settings.buffer_queue.clone(),
            offload: settings.offload,
        }
    }

    /// Tells the application `bytes` are ready to fill or drain.
    pub fn notify_data(&self, bytes: usize) {
        let callback = self.lock_settings().data_callback.clone();
        if let Some(callback) = callback {
            callback(bytes);
        }
    }

    /// Arms the first-frame callback for a new run.
    pub fn on_start(&self) {
        self.first_frame_pending.store(true, Ordering::SeqCst);
    }

    /// Accounts application data handed to the server.
    pub fn on_rendered(&self, bytes: usize, latency: impl FnOnce() -> Duration) {
        if bytes == 0 {
            return;
        }
        if self.first_frame_pending.swap(false, Ordering::SeqCst) {
            let callback = self.lock_settings().first_frame_callback.clone();
            if let Some(callback) = callback {
                callback(latency().as_millis() as u64);
            }
        }
        self.on_transferred(bytes);
    }

    /// Accounts captured data handed to the application.
    pub fn on_captured(&self, bytes: usize) {
        if bytes > 0 {
            self.on_transferred(bytes);
        }
    }

    fn on_transferred(&self, bytes: usize) {
        let frames = self.params.frames_in(bytes);
        let total = self
            .counters
            .frames_transferred
            .fetch_add(frames, Ordering::SeqCst)
            + frames;
        let due = self.lock_positions().due(total);
        for (callback, position) in due {
            callback(position);
        }
    }

    pub fn on_span_processed(&self) {
        self.counters.spans_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Appends rendered PCM, including silence, to the dump file.
    pub fn dump(&self, bytes: &[u8]) {
        if let Some(dump) = &self.dump {
            dump.write(bytes);
        }
    }

    pub fn record_underflow(&self) {
        let count = self.counters.underflows.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 || count % 100 == 0 {
            tracing::debug!(session = %self.session, count, "played silence, no data ready");
        }
        self.events.emit(StreamEvent::Underflow { count });
    }

    pub fn on_read_success(&self) {
        self.stall.on_success();
    }

    /// Counts a timed-out read; `report` runs once per stalled run.
    pub fn on_read_timeout(&self, report: impl FnOnce()) {
        self.counters.read_timeouts.fetch_add(1, Ordering::SeqCst);
        if self.stall.on_timeout() {
            tracing::warn!(
                session = %self.session,
                consecutive = self.stall.consecutive(),
                "reads keep timing out, reporting stalled server"
            );
            report();
        }
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::SeqCst))
    }

    fn store_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::SeqCst);
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    fn snapshot(&self) -> SwitchInfo {
        let mut info = self.lock_settings().clone();
        info.volume = self.volume();
        info.tracker_registered = self.tracker_registered.load(Ordering::SeqCst);
        info.stats = self.counters.snapshot();
        let positions = self.lock_positions();
        info.mark = positions.mark();
        info.period = positions.period();
        info
    }
}

/// The active data path of a stream.
pub(crate) enum Transport {
    Stream(StreamTransport),
    Process(ProcessTransport),
}

impl Transport {
    /// Opens a transport of `class` and applies `info` to it.
    pub fn create(
        class: TransportClass,
        deps: &TransportDeps<'_>,
        info: &SwitchInfo,
    ) -> Result<Self, StreamError> {
        let request = info.request();
        let transport = match class {
            TransportClass::Stream => Self::Stream(StreamTransport::create(deps, &request, info)?),
            TransportClass::Process => {
                Self::Process(ProcessTransport::create(deps, &request, info)?)
            }
        };
        if (info.volume - 1.0).abs() > f32::EPSILON {
            if let Err(err) = transport.set_volume(info.volume) {
                tracing::warn!(session = %transport.session_id(), %err, "could not carry volume over");
            }
        }
        if info.render_rate != RenderRate::Normal {
            if let Err(err) = transport.set_render_rate(info.render_rate) {
                tracing::warn!(session = %transport.session_id(), %err, "could not carry render rate over");
            }
        }
        if info.offload {
            if let Err(err) = transport.set_offload(true) {
                tracing::warn!(session = %transport.session_id(), %err, "could not carry offload mode over");
            }
        }
        tracing::info!(
            session = %transport.session_id(),
            %class,
            direction = %request.direction,
            "transport created"
        );
        Ok(transport)
    }

    fn common(&self) -> &TransportCommon {
        match self {
            Self::Stream(t) => t.common(),
            Self::Process(t) => t.common(),
        }
    }

    pub fn class(&self) -> TransportClass {
        match self {
            Self::Stream(_) => TransportClass::Stream,
            Self::Process(_) => TransportClass::Process,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.common().session()
    }

    pub fn start(&self) -> Result<(), StreamError> {
        self.common().on_start();
        match self {
            Self::Stream(t) => t.start(),
            Self::Process(t) => t.start(),
        }
    }

    pub fn pause(&self) -> Result<(), StreamError> {
        match self {
            Self::Stream(t) => t.pause(),
            Self::Process(t) => t.pause(),
        }
    }

    pub fn stop(&self) -> Result<(), StreamError> {
        match self {
            Self::Stream(t) => t.stop(),
            Self::Process(t) => t.stop(),
        }
    }

    pub fn flush(&self) -> Result<(), StreamError> {
        if let Some(queue) = &self.common().data_path().queue {
            queue.clear();
        }
        match self {
            Self::Stream(t) => t.flush(),
            Self::Process(t) => t.flush(),
        }
    }

    pub fn drain(&self, timeout: Duration) -> Result<(), StreamError> {
        match self {
            Self::Stream(t) => t.drain(timeout),
            Self::Process(t) => t.drain(timeout),
        }
    }

    pub fn release(&self) -> Result<(), StreamError> {
        let result = match self {
            Self::Stream(t) => t.release(),
            Self::Process(t) => t.release(),
        };
        if result.is_ok() {
            tracing::info!(session = %self.session_id(), class = %self.class(), "transport released");
        }
        result
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        match self {
            Self::Stream(t) => t.write(data),
            Self::Process(t) => t.write(data),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        match self {
            Self::Stream(t) => t.read(buf),
            Self::Process(t) => t.read(buf),
        }
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), StreamError> {
        match self {
            Self::Stream(t) => t.set_volume(volume),
            Self::Process(t) => t.set_volume(volume),
        }?;
        self.common().store_volume(volume);
        Ok(())
    }

    pub fn volume(&self) -> f32 {
        self.common().volume()
    }

    pub fn set_render_rate(&self, rate: RenderRate) -> Result<(), StreamError> {
        let sample_rate = rate.apply(self.common().params().sample_rate);
        match self {
            Self::Stream(t) => t.set_render_rate(sample_rate),
            Self::Process(t) => t.set_render_rate(sample_rate),
        }?;
        self.common().lock_settings().render_rate = rate;
        Ok(())
    }

    pub fn render_rate(&self) -> RenderRate {
        self.common().lock_settings().render_rate
    }

    /// Offload batches playback into larger, less frequent transfers. The
    /// process loop does the batching itself.
    pub fn set_offload(&self, enabled: bool) -> Result<(), StreamError> {
        match self {
            Self::Stream(t) => t.set_offload(enabled)?,
            Self::Process(_) => {}
        }
        self.common().lock_settings().offload = enabled;
        tracing::info!(session = %self.session_id(), enabled, "offload mode");
        Ok(())
    }

    pub fn offload(&self) -> bool {
        self.common().data_path().offload
    }

    /// Frames played or captured by the server and the clock time of that count.
    pub fn position(&self) -> Result<(u64, i64), StreamError> {
        match self {
            Self::Stream(t) => t.position(),
            Self::Process(t) => Ok(t.position()),
        }
    }

    pub fn latency(&self) -> Duration {
        match self {
            Self::Stream(t) => t.latency(),
            Self::Process(t) => t.latency(),
        }
    }

    /// Smallest buffer, in bytes, the server works with.
    pub fn min_buffer_size(&self) -> usize {
        match self {
            Self::Stream(t) => t.min_buffer_size(),
            Self::Process(t) => t.min_buffer_size(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.common().stats()
    }

    pub fn restore(&self) -> Result<(), StreamError> {
        match self {
            Self::Stream(t) => t.restore(),
            Self::Process(t) => t.restore(),
        }
    }

    pub fn render_mode(&self) -> RenderMode {
        self.common().data_path().mode
    }

    pub fn buffer_queue(&self) -> Option<Arc<BufferQueue>> {
        self.common().data_path().queue
    }

    pub fn params(&self) -> AudioStreamParams {
        *self.common().params()
    }

    pub fn set_render_mode(&self, mode: RenderMode, queue: Option<Arc<BufferQueue>>) {
        let mut settings = self.common().lock_settings();
        settings.render_mode = mode;
        settings.buffer_queue = queue;
    }

    pub fn set_data_callback(&self, callback: Option<DataCallback>) {
        self.common().lock_settings().data_callback = callback;
    }

    pub fn set_first_frame_callback(&self, callback: Option<FirstFrameCallback>) {
        self.common().lock_settings().first_frame_callback = callback;
    }

    pub fn set_mark(&self, mark: Option<(u64, PositionCallback)>) {
        let mut positions = self.common().lock_positions();
        match mark {
            Some((frame, callback)) => positions.set_mark(frame, callback),
            None => positions.clear_mark(),
        }
    }

    pub fn set_period(&self, period: Option<(u64, PositionCallback)>) {
        let current = self.stats().frames_transferred;
        let mut positions = self.common().lock_positions();
        match period {
            Some((frames, callback)) => positions.set_period(frames, callback, current),
            None => positions.clear_period(),
        }
    }

    pub fn set_effect_mode(&self, mode: EffectMode) {
        self.common().lock_settings().effect_mode = mode;
    }

    pub fn set_cache_path(&self, path: Option<PathBuf>) {
        self.common().lock_settings().cache_path = path;
    }

    pub fn set_privacy(&self, privacy: PrivacyType) {
        self.common().lock_settings().privacy = privacy;
    }

    pub fn settings(&self) -> (EffectMode, PrivacyType, Option<PathBuf>) {
        let settings = self.common().lock_settings();
        (settings.effect_mode, settings.privacy, settings.cache_path.clone())
    }

    pub fn tracker_registered(&self) -> bool {
        self.common().tracker_registered.load(Ordering::SeqCst)
    }

    pub fn set_tracker_registered(&self, registered: bool) {
        self.common()
            .tracker_registered
            .store(registered, Ordering::SeqCst);
    }

    /// Everything needed to rebuild this transport elsewhere.
    pub fn snapshot(&self) -> SwitchInfo {
        self.common().snapshot()
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("class", &self.class())
            .field("session", &self.session_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::position_callback;
    use crate::info::RendererInfo;
    use crate::server::LoopbackServer;

    fn deps_for<'a>(
        server: &'a LoopbackServer,
        config: &'a StreamConfig,
        events: &'a Arc<EventHub>,
    ) -> TransportDeps<'a> {
        TransportDeps {
            server,
            config,
            events,
            dump: None,
        }
    }

    fn playback_info() -> SwitchInfo {
        SwitchInfo::new(
            AudioStreamParams::cd_quality(),
            StreamInfo::Renderer(RendererInfo::music()),
            AppInfo::default(),
        )
    }

    #[test]
    fn test_class_for_low_latency() {
        assert_eq!(TransportClass::for_low_latency(true), TransportClass::Process);
        assert_eq!(TransportClass::for_low_latency(false), TransportClass::Stream);
        assert_eq!(TransportClass::Process.to_string(), "process");
    }

    #[test]
    fn test_snapshot_carries_configuration() {
        let server = LoopbackServer::new();
        let config = StreamConfig::default();
        let events = Arc::new(EventHub::default());
        let deps = deps_for(&server, &config, &events);

        let transport = Transport::create(TransportClass::Stream, &deps, &playback_info()).unwrap();
        transport.set_volume(0.5).unwrap();
        transport.set_tracker_registered(true);
        transport.set_mark(Some((480, position_callback(|_| {}))));
        transport.set_period(Some((960, position_callback(|_| {}))));
        transport.set_effect_mode(EffectMode::None);
        transport.set_render_rate(RenderRate::Half).unwrap();
        transport.set_offload(true).unwrap();

        let snapshot = transport.snapshot();
        assert_eq!(snapshot.render_rate, RenderRate::Half);
        assert!(snapshot.offload);
        assert_eq!(snapshot.volume, 0.5);
        assert!(snapshot.tracker_registered);
        assert_eq!(snapshot.mark.as_ref().map(|(f, _)| *f), Some(480));
        assert_eq!(snapshot.period.as_ref().map(|(f, _)| *f), Some(960));
        assert_eq!(snapshot.effect_mode, EffectMode::None);

        let moved = Transport::create(TransportClass::Process, &deps, &snapshot).unwrap();
        assert_eq!(moved.class(), TransportClass::Process);
        assert_ne!(moved.session_id(), transport.session_id());
        assert_eq!(moved.volume(), 0.5);
        assert_eq!(server.volume_of(moved.session_id()), Some(0.5));
        assert!(moved.tracker_registered());
        assert_eq!(moved.render_rate(), RenderRate::Half);
        assert!(moved.offload());
        assert_eq!(server.render_rate_of(moved.session_id()), Some(24_000));

        transport.release().unwrap();
        moved.release().unwrap();
    }

    #[test]
    fn test_create_failure_is_transport_error() {
        let server = LoopbackServer::new();
        server.faults().set_fail_create_stream(true);
        let config = StreamConfig::default();
        let events = Arc::new(EventHub::default());
        let deps = deps_for(&server, &config, &events);
        let err = Transport::create(TransportClass::Stream, &deps, &playback_info()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TransportFailure);
    }
}
