//! In-process audio server.
//!
//! Playback streams are consumed at real-time cadence and recorded for
//! inspection; capture streams produce a 440Hz tone. Every server call can
//! be made to fail through [`FaultInjection`], so stream behavior is
//! testable without audio hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use super::{AudioServer, ProcessLayout, ServerProcess, ServerStream, StreamRequest};
use crate::buffer::SpanStatus;
use crate::format::{apply_volume, f32_to_s16le, fill_silence, AudioStreamParams, SampleFormat};
use crate::info::Direction;
use crate::session::SessionId;
use crate::timing::{nanos, ClockTime};
use crate::transport::{ProcessBuffer, ProcessStatus, SpanStamp};
use crate::ServerError;

const FIRST_SESSION_ID: u32 = 100_000;

/// Cadence of the streaming-protocol worker.
const STREAM_PERIOD: Duration = Duration::from_millis(10);

/// Server-side buffer of a streaming-protocol stream.
const STREAM_BUFFER_DURATION: Duration = Duration::from_millis(500);

/// Reported minimum buffer size, as audio duration.
const MIN_BUFFER_DURATION: Duration = Duration::from_millis(20);

/// Played audio kept for inspection.
const PLAYED_CAPACITY: usize = 8 * 1024 * 1024;

const TONE_HZ: f32 = 440.0;

/// Failure switches of a [`LoopbackServer`].
///
/// All switches start off. Changes apply to streams that already exist.
#[derive(Debug, Default)]
pub struct FaultInjection {
    fail_create_stream: AtomicBool,
    fail_create_process: AtomicBool,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    fail_release: AtomicBool,
    fail_set_volume: AtomicBool,
    fail_handle_info: AtomicBool,
    stall_reads: AtomicBool,
    restore_failures: AtomicU32,
}

impl FaultInjection {
    /// Makes `create_stream` fail.
    pub fn set_fail_create_stream(&self, fail: bool) {
        self.fail_create_stream.store(fail, Ordering::SeqCst);
    }

    /// Makes `create_process` fail.
    pub fn set_fail_create_process(&self, fail: bool) {
        self.fail_create_process.store(fail, Ordering::SeqCst);
    }

    /// Makes `start` fail on every stream.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Makes `stop` fail on every stream.
    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Makes `release` fail on every stream.
    pub fn set_fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Makes `set_volume` fail on every stream.
    pub fn set_fail_set_volume(&self, fail: bool) {
        self.fail_set_volume.store(fail, Ordering::SeqCst);
    }

    /// Makes `request_handle_info` fail on every process stream.
    pub fn set_fail_handle_info(&self, fail: bool) {
        self.fail_handle_info.store(fail, Ordering::SeqCst);
    }

    /// Stops capture streams from producing data, so reads time out.
    pub fn set_stall_reads(&self, stall: bool) {
        self.stall_reads.store(stall, Ordering::SeqCst);
    }

    /// Makes the next `count` `restore` calls fail.
    pub fn set_restore_failures(&self, count: u32) {
        self.restore_failures.store(count, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, operation: &'static str) -> Result<(), ServerError> {
        if flag.load(Ordering::SeqCst) {
            Err(ServerError::failed(operation, "injected fault"))
        } else {
            Ok(())
        }
    }

    fn take_restore_failure(&self) -> bool {
        self.restore_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Default)]
struct LoopbackInner {
    next_session: AtomicU32,
    no_low_latency: AtomicBool,
    faults: FaultInjection,
    played: Mutex<Vec<u8>>,
    played_bytes: AtomicU64,
    volumes: Mutex<HashMap<SessionId, f32>>,
    render_rates: Mutex<HashMap<SessionId, u32>>,
    offloaded: Mutex<HashMap<SessionId, bool>>,
    streams_created: AtomicU32,
    processes_created: AtomicU32,
    released: AtomicU32,
    restores: AtomicU32,
    stall_reports: AtomicU32,
}

impl LoopbackInner {
    fn allocate_session(&self) -> SessionId {
        SessionId::new(FIRST_SESSION_ID + self.next_session.fetch_add(1, Ordering::SeqCst))
    }

    fn record_played(&self, bytes: &[u8]) {
        self.played_bytes
            .fetch_add(bytes.len() as u64, Ordering::SeqCst);
        let mut played = self.played.lock();
        let room = PLAYED_CAPACITY.saturating_sub(played.len());
        played.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn record_volume(&self, session: SessionId, volume: f32) {
        self.volumes.lock().insert(session, volume);
    }

    fn record_render_rate(&self, session: SessionId, sample_rate: u32) {
        self.render_rates.lock().insert(session, sample_rate);
    }

    fn restore(&self, session: SessionId) -> Result<(), ServerError> {
        if self.faults.take_restore_failure() {
            tracing::debug!(%session, "loopback restore failing (injected)");
            return Err(ServerError::failed("restore", "injected fault"));
        }
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn report_stall(&self, session: SessionId) {
        self.stall_reports.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(%session, "client reports stalled reads");
    }
}

/// In-process [`AudioServer`] with fault injection.
///
/// Cloning yields another handle to the same server.
///
/// # Example
///
/// ```
/// use audio_stream_client::server::LoopbackServer;
///
/// let server = LoopbackServer::new();
/// server.faults().set_fail_start(true);
/// assert_eq!(server.streams_created(), 0);
/// ```
#[derive(Clone, Default)]
pub struct LoopbackServer {
    inner: Arc<LoopbackInner>,
}

impl LoopbackServer {
    /// Creates a server supporting both stream kinds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a server without the low-latency process path.
    pub fn without_low_latency() -> Self {
        let server = Self::default();
        server.inner.no_low_latency.store(true, Ordering::SeqCst);
        server
    }

    /// Failure switches.
    pub fn faults(&self) -> &FaultInjection {
        &self.inner.faults
    }

    /// Total playback bytes consumed by all streams.
    pub fn played_bytes(&self) -> u64 {
        self.inner.played_bytes.load(Ordering::SeqCst)
    }

    /// Takes the recorded playback audio (capped at 8 MiB).
    pub fn take_played(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.played.lock())
    }

    /// Last volume set on `session`.
    pub fn volume_of(&self, session: SessionId) -> Option<f32> {
        self.inner.volumes.lock().get(&session).copied()
    }

    /// Last render rate, in Hz, set on `session`.
    pub fn render_rate_of(&self, session: SessionId) -> Option<u32> {
        self.inner.render_rates.lock().get(&session).copied()
    }

    /// Whether `session` was last put into offload mode.
    pub fn is_offloaded(&self, session: SessionId) -> bool {
        self.inner
            .offloaded
            .lock()
            .get(&session)
            .copied()
            .unwrap_or(false)
    }

    /// Streaming-protocol streams opened so far.
    pub fn streams_created(&self) -> u32 {
        self.inner.streams_created.load(Ordering::SeqCst)
    }

    /// Process streams opened so far.
    pub fn processes_created(&self) -> u32 {
        self.inner.processes_created.load(Ordering::SeqCst)
    }

    /// Streams released so far.
    pub fn released_count(&self) -> u32 {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Successful `restore` calls.
    pub fn restore_calls(&self) -> u32 {
        self.inner.restores.load(Ordering::SeqCst)
    }

    /// Stalled-read reports received.
    pub fn stall_reports(&self) -> u32 {
        self.inner.stall_reports.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackServer")
            .field("streams_created", &self.streams_created())
            .field("processes_created", &self.processes_created())
            .field("played_bytes", &self.played_bytes())
            .finish_non_exhaustive()
    }
}

impl AudioServer for LoopbackServer {
    fn create_stream(&self, request: &StreamRequest) -> Result<Arc<dyn ServerStream>, ServerError> {
        FaultInjection::check(&self.inner.faults.fail_create_stream, "create stream")?;
        let session = self.inner.allocate_session();
        let stream = LoopbackStream::spawn(session, request, Arc::clone(&self.inner))?;
        self.inner.streams_created.fetch_add(1, Ordering::SeqCst);
        tracing::info!(%session, direction = %request.direction, "loopback stream created");
        Ok(Arc::new(stream))
    }

    fn create_process(
        &self,
        request: &StreamRequest,
        layout: ProcessLayout,
    ) -> Result<Arc<dyn ServerProcess>, ServerError> {
        if !self.supports_low_latency() {
            return Err(ServerError::Unsupported("low-latency streams".to_string()));
        }
        FaultInjection::check(&self.inner.faults.fail_create_process, "create process")?;
        let session = self.inner.allocate_session();
        let process = LoopbackProcess::spawn(session, request, layout, Arc::clone(&self.inner))?;
        self.inner.processes_created.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            %session,
            direction = %request.direction,
            span_frames = layout.span_frames,
            "loopback process created"
        );
        Ok(Arc::new(process))
    }

    fn supports_low_latency(&self) -> bool {
        !self.inner.no_low_latency.load(Ordering::SeqCst)
    }
}

/// Fills `out` with a tone, or silence for formats other than S16LE.
fn fill_tone(params: &AudioStreamParams, phase: &mut f32, out: &mut [u8]) {
    if params.format != SampleFormat::S16Le {
        fill_silence(out, params.format);
        return;
    }
    let channels = usize::from(params.channels);
    let frames = out.len() / params.frame_size().max(1);
    let step = std::f32::consts::TAU * TONE_HZ / params.sample_rate as f32;

    let mut samples = Vec::with_capacity(frames * channels);
    for _ in 0..frames {
        let value = phase.sin() * 0.5;
        samples.extend(std::iter::repeat(value).take(channels));
        *phase = (*phase + step) % std::f32::consts::TAU;
    }
    let mut bytes = Vec::with_capacity(out.len());
    f32_to_s16le(&samples, &mut bytes);
    out[..bytes.len()].copy_from_slice(&bytes);
}

fn load_volume(volume: &AtomicU32) -> f32 {
    f32::from_bits(volume.load(Ordering::SeqCst))
}

struct StreamShared {
    ring: Mutex<HeapRb<u8>>,
    changed: Condvar,
    status: AtomicU8,
    frames: AtomicU64,
    position_time: AtomicI64,
    volume: AtomicU32,
    sample_rate: AtomicU32,
}

impl StreamShared {
    fn lock_ring(&self) -> MutexGuard<'_, HeapRb<u8>> {
        self.ring.lock()
    }

    fn status(&self) -> ProcessStatus {
        match self.status.load(Ordering::SeqCst) {
            0 => ProcessStatus::Idle,
            2 => ProcessStatus::Running,
            4 => ProcessStatus::Paused,
            6 => ProcessStatus::Stopped,
            7 => ProcessStatus::Released,
            _ => ProcessStatus::Invalid,
        }
    }

    fn set_status(&self, status: ProcessStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
        self.changed.notify_all();
    }
}

/// Streaming-protocol stream of the loopback server.
struct LoopbackStream {
    session: SessionId,
    params: AudioStreamParams,
    server: Arc<LoopbackInner>,
    shared: Arc<StreamShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackStream {
    fn spawn(
        session: SessionId,
        request: &StreamRequest,
        server: Arc<LoopbackInner>,
    ) -> Result<Self, ServerError> {
        let params = request.params;
        let capacity = params.bytes_for(STREAM_BUFFER_DURATION).max(params.frame_size());
        let shared = Arc::new(StreamShared {
            ring: Mutex::new(HeapRb::new(capacity)),
            changed: Condvar::new(),
            status: AtomicU8::new(ProcessStatus::Idle as u8),
            frames: AtomicU64::new(0),
            position_time: AtomicI64::new(ClockTime::now_nanos()),
            volume: AtomicU32::new(1.0f32.to_bits()),
            sample_rate: AtomicU32::new(params.sample_rate),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_server = Arc::clone(&server);
        let direction = request.direction;
        let handle = std::thread::Builder::new()
            .name(format!("loopback-stream-{session}"))
            .spawn(move || run_stream_worker(&worker_shared, &worker_server, direction, params))
            .map_err(ServerError::backend)?;

        Ok(Self {
            session,
            params,
            server,
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    fn ensure_open(&self) -> Result<(), ServerError> {
        if self.shared.status() == ProcessStatus::Released {
            Err(ServerError::Released)
        } else {
            Ok(())
        }
    }

    fn shutdown(&self) {
        self.shared.set_status(ProcessStatus::Released);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run_stream_worker(
    shared: &StreamShared,
    server: &LoopbackInner,
    direction: Direction,
    params: AudioStreamParams,
) {
    let period_bytes = params.bytes_for(STREAM_PERIOD).max(params.frame_size());
    let period_nanos = nanos(STREAM_PERIOD);
    let frame_size = params.frame_size().max(1);
    let mut scratch = vec![0u8; period_bytes * 2];
    let mut phase = 0.0f32;
    let mut deadline = ClockTime::now_nanos();
    let mut periods = 0u64;

    loop {
        match shared.status() {
            ProcessStatus::Released => break,
            ProcessStatus::Running => {}
            _ => {
                std::thread::sleep(Duration::from_millis(1));
                deadline = ClockTime::now_nanos();
                continue;
            }
        }

        deadline += period_nanos;
        ClockTime::absolute_sleep(deadline);
        periods += 1;

        match direction {
            Direction::Playback => {
                let rate = u64::from(shared.sample_rate.load(Ordering::SeqCst));
                let base = u64::from(params.sample_rate.max(1));
                let frames = (period_bytes / frame_size) as u64 * rate / base;
                let wanted = (frames as usize * frame_size).clamp(frame_size, scratch.len());
                let n = shared.lock_ring().pop_slice(&mut scratch[..wanted]);
                if n > 0 {
                    apply_volume(&mut scratch[..n], params.format, load_volume(&shared.volume));
                    server.record_played(&scratch[..n]);
                    shared
                        .frames
                        .fetch_add((n / frame_size) as u64, Ordering::SeqCst);
                }
                if periods % 50 == 0 {
                    tracing::debug!(periods, consumed = n, "loopback playback period");
                }
            }
            Direction::Capture => {
                if server.faults.stall_reads.load(Ordering::SeqCst) {
                    continue;
                }
                let period = &mut scratch[..period_bytes];
                fill_tone(&params, &mut phase, period);
                let n = shared.lock_ring().push_slice(period);
                shared
                    .frames
                    .fetch_add((n / frame_size) as u64, Ordering::SeqCst);
            }
        }
        shared
            .position_time
            .store(ClockTime::now_nanos(), Ordering::SeqCst);
        shared.changed.notify_all();
    }
}

impl ServerStream for LoopbackStream {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn min_buffer_size(&self) -> usize {
        self.params.bytes_for(MIN_BUFFER_DURATION)
    }

    fn start(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        FaultInjection::check(&self.server.faults.fail_start, "start")?;
        self.shared.set_status(ProcessStatus::Running);
        Ok(())
    }

    fn pause(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.shared.set_status(ProcessStatus::Paused);
        Ok(())
    }

    fn stop(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        FaultInjection::check(&self.server.faults.fail_stop, "stop")?;
        self.shared.set_status(ProcessStatus::Stopped);
        Ok(())
    }

    fn flush(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.shared.lock_ring().clear();
        self.shared.changed.notify_all();
        Ok(())
    }

    fn drain(&self, timeout: Duration) -> Result<(), ServerError> {
        self.ensure_open()?;
        let started = Instant::now();
        let mut ring = self.shared.lock_ring();
        while !ring.is_empty() {
            let Some(remaining) = timeout.checked_sub(started.elapsed()) else {
                return Err(ServerError::Timeout(timeout));
            };
            self.shared.changed.wait_for(&mut ring, remaining);
        }
        Ok(())
    }

    fn release(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        FaultInjection::check(&self.server.faults.fail_release, "release")?;
        self.shutdown();
        self.server.released.fetch_add(1, Ordering::SeqCst);
        tracing::info!(session = %self.session, "loopback stream released");
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<usize, ServerError> {
        self.ensure_open()?;
        let mut written = 0;
        let mut ring = self.shared.lock_ring();
        loop {
            written += ring.push_slice(&data[written..]);
            if written == data.len() || self.shared.status() != ProcessStatus::Running {
                break;
            }
            self.shared.changed.wait_for(&mut ring, STREAM_PERIOD);
        }
        Ok(written)
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, ServerError> {
        self.ensure_open()?;
        let started = Instant::now();
        let mut ring = self.shared.lock_ring();
        while ring.is_empty() {
            let Some(remaining) = timeout.checked_sub(started.elapsed()) else {
                return Err(ServerError::Timeout(timeout));
            };
            self.shared.changed.wait_for(&mut ring, remaining);
        }
        Ok(ring.pop_slice(buf))
    }

    fn position(&self) -> Result<(u64, i64), ServerError> {
        self.ensure_open()?;
        Ok((
            self.shared.frames.load(Ordering::SeqCst),
            self.shared.position_time.load(Ordering::SeqCst),
        ))
    }

    fn latency(&self) -> Duration {
        let buffered = self.shared.lock_ring().occupied_len();
        self.params.duration_of(self.params.frames_in(buffered))
    }

    fn set_volume(&self, volume: f32) -> Result<(), ServerError> {
        self.ensure_open()?;
        FaultInjection::check(&self.server.faults.fail_set_volume, "set volume")?;
        self.shared.volume.store(volume.to_bits(), Ordering::SeqCst);
        self.server.record_volume(self.session, volume);
        Ok(())
    }

    fn set_render_rate(&self, sample_rate: u32) -> Result<(), ServerError> {
        self.ensure_open()?;
        if sample_rate == 0 {
            return Err(ServerError::Unsupported("a zero render rate".to_string()));
        }
        self.shared.sample_rate.store(sample_rate, Ordering::SeqCst);
        self.server.record_render_rate(self.session, sample_rate);
        Ok(())
    }

    fn set_offload(&self, enabled: bool) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.server.offloaded.lock().insert(self.session, enabled);
        tracing::debug!(session = %self.session, enabled, "loopback stream offload");
        Ok(())
    }

    fn restore(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.server.restore(self.session)
    }

    fn report_stall(&self) {
        self.server.report_stall(self.session);
    }
}

impl Drop for LoopbackStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ProcessShared {
    running: AtomicBool,
    released: AtomicBool,
    next_deadline: AtomicI64,
    volume: AtomicU32,
}

/// Process stream of the loopback server.
struct LoopbackProcess {
    session: SessionId,
    direction: Direction,
    span_nanos: i64,
    buffer: Arc<ProcessBuffer>,
    server: Arc<LoopbackInner>,
    shared: Arc<ProcessShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackProcess {
    fn spawn(
        session: SessionId,
        request: &StreamRequest,
        layout: ProcessLayout,
        server: Arc<LoopbackInner>,
    ) -> Result<Self, ServerError> {
        let params = request.params;
        let buffer = Arc::new(ProcessBuffer::new(
            layout.span_frames,
            layout.span_count,
            params.frame_size(),
        ));
        let shared = Arc::new(ProcessShared {
            running: AtomicBool::new(false),
            released: AtomicBool::new(false),
            next_deadline: AtomicI64::new(0),
            volume: AtomicU32::new(1.0f32.to_bits()),
        });
        let span_nanos = nanos(params.duration_of(buffer.span_frames()));

        let worker_buffer = Arc::clone(&buffer);
        let worker_shared = Arc::clone(&shared);
        let worker_server = Arc::clone(&server);
        let direction = request.direction;
        let handle = std::thread::Builder::new()
            .name(format!("loopback-process-{session}"))
            .spawn(move || {
                run_process_worker(
                    &worker_buffer,
                    &worker_shared,
                    &worker_server,
                    direction,
                    params,
                    span_nanos,
                );
            })
            .map_err(ServerError::backend)?;

        Ok(Self {
            session,
            direction,
            span_nanos,
            buffer,
            server,
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    fn ensure_open(&self) -> Result<(), ServerError> {
        if self.shared.released.load(Ordering::SeqCst) {
            Err(ServerError::Released)
        } else {
            Ok(())
        }
    }

    fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.released.store(true, Ordering::SeqCst);
        self.buffer.set_status(ProcessStatus::Released);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run_process_worker(
    buffer: &ProcessBuffer,
    shared: &ProcessShared,
    server: &LoopbackInner,
    direction: Direction,
    params: AudioStreamParams,
    span_nanos: i64,
) {
    let span_frames = buffer.span_frames();
    let mut scratch = vec![0u8; buffer.span_bytes()];
    let mut phase = 0.0f32;
    let mut skipped = 0u64;

    while !shared.released.load(Ordering::SeqCst) {
        if !shared.running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        let at = shared.next_deadline.load(Ordering::SeqCst);
        ClockTime::absolute_sleep(at);
        if !shared.running.load(Ordering::SeqCst) {
            continue;
        }
        let next_at = at + span_nanos;

        match direction {
            Direction::Playback => {
                let pos = buffer.cur_read_frame();
                if buffer.try_transition(pos, SpanStatus::Done, SpanStatus::Reading) {
                    buffer.stamp(pos, SpanStamp::ReadStart, ClockTime::now_nanos());
                    buffer.with_span(pos, |data| scratch.copy_from_slice(data));
                    apply_volume(&mut scratch, params.format, load_volume(&shared.volume));
                    server.record_played(&scratch);
                    buffer.stamp(pos, SpanStamp::ReadDone, ClockTime::now_nanos());
                    buffer.set_span_status(pos, SpanStatus::Free);
                } else {
                    skipped += 1;
                    if skipped % 50 == 1 {
                        tracing::debug!(pos, skipped, "loopback process: span not ready");
                    }
                }
                let next = pos + span_frames;
                buffer.set_cur_read_frame(next);
                buffer.set_handle_info(next, next_at);
            }
            Direction::Capture => {
                let pos = buffer.cur_write_frame();
                let stalled = server.faults.stall_reads.load(Ordering::SeqCst);
                let claimed = !stalled
                    && (buffer.try_transition(pos, SpanStatus::Free, SpanStatus::Writing)
                        || buffer.try_transition(pos, SpanStatus::Done, SpanStatus::Writing));
                if claimed {
                    buffer.stamp(pos, SpanStamp::WriteStart, ClockTime::now_nanos());
                    fill_tone(&params, &mut phase, &mut scratch);
                    buffer.with_span(pos, |data| data.copy_from_slice(&scratch));
                    buffer.stamp(pos, SpanStamp::WriteDone, ClockTime::now_nanos());
                    buffer.set_span_status(pos, SpanStatus::Done);
                    buffer.set_cur_write_frame(pos + span_frames);
                    buffer.set_handle_info(pos, at);
                }
            }
        }

        // A start() in between reschedules; keep its deadline.
        let _ = shared.next_deadline.compare_exchange(
            at,
            next_at,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl ServerProcess for LoopbackProcess {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn buffer(&self) -> Arc<ProcessBuffer> {
        Arc::clone(&self.buffer)
    }

    fn start(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        FaultInjection::check(&self.server.faults.fail_start, "start")?;
        let first = ClockTime::now_nanos() + self.span_nanos;
        self.shared.next_deadline.store(first, Ordering::SeqCst);
        if self.direction == Direction::Playback {
            self.buffer
                .set_handle_info(self.buffer.cur_read_frame(), first);
        }
        self.buffer.set_status(ProcessStatus::Running);
        self.shared.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.shared.running.store(false, Ordering::SeqCst);
        self.buffer.set_status(ProcessStatus::Paused);
        Ok(())
    }

    fn stop(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        FaultInjection::check(&self.server.faults.fail_stop, "stop")?;
        self.shared.running.store(false, Ordering::SeqCst);
        self.buffer.set_status(ProcessStatus::Stopped);
        Ok(())
    }

    fn release(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        FaultInjection::check(&self.server.faults.fail_release, "release")?;
        self.shutdown();
        self.server.released.fetch_add(1, Ordering::SeqCst);
        tracing::info!(session = %self.session, "loopback process released");
        Ok(())
    }

    fn request_handle_info(&self) -> Result<(u64, i64), ServerError> {
        self.ensure_open()?;
        FaultInjection::check(&self.server.faults.fail_handle_info, "request handle info")?;
        Ok(self.buffer.handle_info())
    }

    fn set_volume(&self, volume: f32) -> Result<(), ServerError> {
        self.ensure_open()?;
        FaultInjection::check(&self.server.faults.fail_set_volume, "set volume")?;
        self.shared.volume.store(volume.to_bits(), Ordering::SeqCst);
        self.server.record_volume(self.session, volume);
        Ok(())
    }

    fn set_render_rate(&self, sample_rate: u32) -> Result<(), ServerError> {
        self.ensure_open()?;
        if sample_rate == 0 {
            return Err(ServerError::Unsupported("a zero render rate".to_string()));
        }
        self.server.record_render_rate(self.session, sample_rate);
        Ok(())
    }

    fn restore(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.server.restore(self.session)
    }

    fn report_stall(&self) {
        self.server.report_stall(self.session);
    }
}

impl Drop for LoopbackProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{AppInfo, EffectMode, PrivacyType, StreamType};

    fn request(direction: Direction) -> StreamRequest {
        StreamRequest {
            direction,
            params: AudioStreamParams::cd_quality(),
            stream_type: StreamType::Music,
            app: AppInfo::default(),
            privacy: PrivacyType::Public,
            effect_mode: EffectMode::Default,
            cache_path: None,
        }
    }

    #[test]
    fn test_sessions_are_unique() {
        let server = LoopbackServer::new();
        let a = server.create_stream(&request(Direction::Playback)).unwrap();
        let b = server.create_stream(&request(Direction::Playback)).unwrap();
        assert_ne!(a.session_id(), b.session_id());
        assert_eq!(server.streams_created(), 2);
    }

    #[test]
    fn test_playback_is_consumed() {
        let server = LoopbackServer::new();
        let stream = server.create_stream(&request(Direction::Playback)).unwrap();
        stream.start().unwrap();
        let data = vec![1u8; 1920];
        assert_eq!(stream.write(&data).unwrap(), 1920);
        stream.drain(Duration::from_secs(2)).unwrap();
        assert_eq!(server.played_bytes(), 1920);
        let (frames, _) = stream.position().unwrap();
        assert_eq!(frames, 480);
        stream.release().unwrap();
        assert!(matches!(stream.start(), Err(ServerError::Released)));
    }

    #[test]
    fn test_capture_produces_tone() {
        let server = LoopbackServer::new();
        let stream = server.create_stream(&request(Direction::Capture)).unwrap();
        stream.start().unwrap();
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf, Duration::from_secs(1)).unwrap();
        assert!(n > 0);
        assert!(buf[..n].iter().any(|&b| b != 0));
    }

    #[test]
    fn test_stalled_read_times_out() {
        let server = LoopbackServer::new();
        server.faults().set_stall_reads(true);
        let stream = server.create_stream(&request(Direction::Capture)).unwrap();
        stream.start().unwrap();
        let mut buf = vec![0u8; 64];
        let err = stream.read(&mut buf, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, ServerError::Timeout(_)));
    }

    #[test]
    fn test_injected_faults() {
        let server = LoopbackServer::new();
        server.faults().set_fail_create_stream(true);
        assert!(server.create_stream(&request(Direction::Playback)).is_err());
        server.faults().set_fail_create_stream(false);

        let stream = server.create_stream(&request(Direction::Playback)).unwrap();
        server.faults().set_fail_start(true);
        assert!(stream.start().is_err());

        server.faults().set_restore_failures(2);
        assert!(stream.restore().is_err());
        assert!(stream.restore().is_err());
        assert!(stream.restore().is_ok());
        assert_eq!(server.restore_calls(), 1);
    }

    #[test]
    fn test_without_low_latency() {
        let server = LoopbackServer::without_low_latency();
        assert!(!server.supports_low_latency());
        let layout = ProcessLayout {
            span_frames: 240,
            span_count: 4,
        };
        let err = server
            .create_process(&request(Direction::Playback), layout)
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Unsupported(_)));
    }

    #[test]
    fn test_process_consumes_done_spans() {
        let server = LoopbackServer::new();
        let layout = ProcessLayout {
            span_frames: 240,
            span_count: 4,
        };
        let process = server
            .create_process(&request(Direction::Playback), layout)
            .unwrap();
        let buffer = process.buffer();
        buffer.with_span(0, |data| data.fill(7));
        buffer.set_span_status(0, SpanStatus::Done);
        process.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while buffer.cur_read_frame() < 240 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        // Give the worker a moment to finish the span it claimed.
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(buffer.span_status(0), SpanStatus::Free);
        assert!(server.played_bytes() >= 960);
        process.release().unwrap();
    }

    #[test]
    fn test_handle_info_fault() {
        let server = LoopbackServer::new();
        let layout = ProcessLayout {
            span_frames: 240,
            span_count: 4,
        };
        let process = server
            .create_process(&request(Direction::Capture), layout)
            .unwrap();
        assert!(process.request_handle_info().is_ok());
        server.faults().set_fail_handle_info(true);
        assert!(process.request_handle_info().is_err());
    }
}
