//! Low-latency process transport and its client-side span loop.
//!
//! The loop owns the client end of the [`ProcessBuffer`]: for playback it
//! claims the span at the write frame (`Free -> Writing`), fills it and
//! publishes it (`Done`); for capture it claims the span at the read frame
//! (`Done -> Reading`), drains it and frees it. Between spans it sleeps
//! until the time the [`WakeScheduler`] predicts for the next one.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use super::{ProcessBuffer, SpanStamp, SwitchInfo, TransportCommon, TransportDeps};
use crate::buffer::{BufferQueue, LoopSpan, SpanStatus};
use crate::format::{fill_silence, AudioStreamParams};
use crate::info::{Direction, RenderMode};
use crate::server::{ProcessLayout, ServerProcess, StreamRequest};
use crate::timing::{ClockTime, WakeScheduler};
use crate::{ServerError, StreamError};

/// Handle-info queries a capture resync makes before giving up for this span.
const RESYNC_ATTEMPTS: u32 = 3;

/// Poll interval of a drain.
const DRAIN_POLL: Duration = Duration::from_millis(2);

struct LoopControl {
    running: bool,
    released: bool,
    generation: u64,
}

enum KeepRunning {
    Exit,
    Idle,
    Run { restarted: bool },
}

/// State shared by the transport handle and its loop thread.
struct LoopShared {
    buffer: Arc<ProcessBuffer>,
    control: Mutex<LoopControl>,
    control_changed: Condvar,
    staging: Mutex<HeapRb<u8>>,
    staging_changed: Condvar,
}

impl LoopShared {
    fn lock_control(&self) -> MutexGuard<'_, LoopControl> {
        self.control.lock()
    }

    fn lock_staging(&self) -> MutexGuard<'_, HeapRb<u8>> {
        self.staging.lock()
    }

    fn is_running(&self) -> bool {
        self.lock_control().running
    }

    fn set_running(&self, running: bool) {
        {
            let mut control = self.lock_control();
            if running && !control.running {
                control.generation += 1;
            }
            control.running = running;
        }
        self.control_changed.notify_all();
        self.staging_changed.notify_all();
    }

    fn set_released(&self) {
        {
            let mut control = self.lock_control();
            control.running = false;
            control.released = true;
        }
        self.control_changed.notify_all();
        self.staging_changed.notify_all();
    }

    fn keep_running(&self, generation: &mut u64, idle_wait: Duration) -> KeepRunning {
        let mut control = self.lock_control();
        if control.released {
            return KeepRunning::Exit;
        }
        if !control.running {
            self.control_changed.wait_for(&mut control, idle_wait);
            return if control.released {
                KeepRunning::Exit
            } else {
                KeepRunning::Idle
            };
        }
        let restarted = control.generation != *generation;
        *generation = control.generation;
        KeepRunning::Run { restarted }
    }
}

pub(crate) struct ProcessTransport {
    common: Arc<TransportCommon>,
    server: Arc<dyn ServerProcess>,
    shared: Arc<LoopShared>,
    read_timeout: Duration,
    queue_wait: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessTransport {
    pub fn create(
        deps: &TransportDeps<'_>,
        request: &StreamRequest,
        info: &SwitchInfo,
    ) -> Result<Self, StreamError> {
        let config = deps.config;
        let layout = ProcessLayout {
            span_frames: request.params.frames_for(config.process_span_duration).max(1),
            span_count: config.process_spans.max(2),
        };
        let server = deps
            .server
            .create_process(request, layout)
            .map_err(|err| StreamError::transport("create process", err))?;
        let buffer = server.buffer();
        let common = Arc::new(TransportCommon::new(server.session_id(), info, deps));
        let staging_bytes = buffer.span_bytes() * buffer.span_count() * 2;
        let shared = Arc::new(LoopShared {
            buffer: Arc::clone(&buffer),
            control: Mutex::new(LoopControl {
                running: false,
                released: false,
                generation: 0,
            }),
            control_changed: Condvar::new(),
            staging: Mutex::new(HeapRb::new(staging_bytes.max(1))),
            staging_changed: Condvar::new(),
        });

        let direction = request.direction;
        let worker = ProcessLoop {
            scheduler: WakeScheduler::new(
                &config.timing,
                direction,
                buffer.span_frames(),
                request.params.sample_rate,
            ),
            common: Arc::clone(&common),
            server: Arc::clone(&server),
            shared: Arc::clone(&shared),
            direction,
            params: request.params,
            acquire_retries: config.span_acquire_retries.max(1),
            acquire_backoff: config.span_acquire_backoff,
            idle_wait: config.queue_wait_timeout,
            offload_spans: config
                .offload_spans
                .clamp(1, buffer.span_count().saturating_sub(1).max(1)) as u64,
            capture_offset: config.timing.capture_offset_nanos,
            pending: None,
            late_wakeups: 0,
            slow_spans: 0,
            missed_spans: 0,
        };
        let handle = std::thread::Builder::new()
            .name(format!("process-loop-{}", common.session()))
            .spawn(move || worker.run())
            .map_err(|err| StreamError::transport("spawn process loop", ServerError::backend(err)))?;

        tracing::debug!(
            session = %common.session(),
            span_frames = buffer.span_frames(),
            span_count = buffer.span_count(),
            "process transport ready"
        );

        Ok(Self {
            common,
            server,
            shared,
            read_timeout: config.read_timeout,
            queue_wait: config.queue_wait_timeout,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn common(&self) -> &TransportCommon {
        &self.common
    }

    pub fn start(&self) -> Result<(), StreamError> {
        let buffer = &self.shared.buffer;
        if self.common.direction() == Direction::Playback {
            buffer.reset_spans();
            buffer.set_cur_write_frame(buffer.cur_read_frame());
        }
        self.server
            .start()
            .map_err(|err| StreamError::transport("start", err))?;
        self.shared.set_running(true);
        Ok(())
    }

    pub fn pause(&self) -> Result<(), StreamError> {
        self.server
            .pause()
            .map_err(|err| StreamError::transport("pause", err))?;
        self.shared.set_running(false);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), StreamError> {
        self.server
            .stop()
            .map_err(|err| StreamError::transport("stop", err))?;
        self.shared.set_running(false);
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StreamError> {
        self.shared.lock_staging().clear();
        self.shared.staging_changed.notify_all();
        Ok(())
    }

    pub fn drain(&self, timeout: Duration) -> Result<(), StreamError> {
        if self.common.direction() == Direction::Capture {
            return Ok(());
        }
        let started = Instant::now();
        let queue = self.common.data_path().queue;
        let buffer = &self.shared.buffer;
        loop {
            let staged = self.shared.lock_staging().occupied_len();
            let queued = queue.as_ref().map_or(0, |queue| queue.pending());
            if staged == 0 && queued == 0 && buffer.cur_write_frame() <= buffer.cur_read_frame() {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(StreamError::Timeout {
                    operation: "drain",
                    waited: timeout,
                });
            }
            std::thread::sleep(DRAIN_POLL);
        }
    }

    /// Ends the loop even when the server refuses the release.
    pub fn release(&self) -> Result<(), StreamError> {
        let released = self
            .server
            .release()
            .map_err(|err| StreamError::transport("release", err));
        self.join_loop();
        released
    }

    fn join_loop(&self) {
        self.shared.set_released();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(session = %self.common.session(), "process loop panicked");
            }
        }
    }

    /// Queues playback data for the loop, blocking while the staging ring is full.
    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        let mut written = 0;
        let mut staging = self.shared.lock_staging();
        loop {
            written += staging.push_slice(&data[written..]);
            if written == data.len() || !self.shared.is_running() {
                break;
            }
            self.shared.staging_changed.wait_for(&mut staging, self.queue_wait);
        }
        Ok(written)
    }

    /// Takes captured data the loop staged, waiting at most the read timeout.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let started = Instant::now();
        let mut staging = self.shared.lock_staging();
        while staging.is_empty() {
            let Some(remaining) = self.read_timeout.checked_sub(started.elapsed()) else {
                return Err(StreamError::Timeout {
                    operation: "read",
                    waited: self.read_timeout,
                });
            };
            self.shared.staging_changed.wait_for(&mut staging, remaining);
        }
        let read = staging.pop_slice(buf);
        drop(staging);
        self.common.on_captured(read);
        Ok(read)
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), StreamError> {
        self.server
            .set_volume(volume)
            .map_err(|err| StreamError::transport("set volume", err))
    }

    pub fn set_render_rate(&self, sample_rate: u32) -> Result<(), StreamError> {
        self.server
            .set_render_rate(sample_rate)
            .map_err(|err| StreamError::transport("set render rate", err))
    }

    pub fn position(&self) -> (u64, i64) {
        (self.shared.buffer.cur_read_frame(), ClockTime::now_nanos())
    }

    pub fn latency(&self) -> Duration {
        let params = self.common.params();
        let buffer = &self.shared.buffer;
        match self.common.direction() {
            Direction::Playback => {
                let in_ring = buffer
                    .cur_write_frame()
                    .saturating_sub(buffer.cur_read_frame());
                let staged = params.frames_in(self.shared.lock_staging().occupied_len());
                params.duration_of(in_ring + staged)
            }
            Direction::Capture => params.duration_of(buffer.span_frames()),
        }
    }

    pub fn min_buffer_size(&self) -> usize {
        self.shared.buffer.span_bytes()
    }

    pub fn restore(&self) -> Result<(), StreamError> {
        self.server
            .restore()
            .map_err(|err| StreamError::transport("restore", err))
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.join_loop();
    }
}

/// The client-side span loop, run on its own thread.
struct ProcessLoop {
    common: Arc<TransportCommon>,
    server: Arc<dyn ServerProcess>,
    shared: Arc<LoopShared>,
    scheduler: WakeScheduler,
    direction: Direction,
    params: AudioStreamParams,
    acquire_retries: u32,
    acquire_backoff: Duration,
    idle_wait: Duration,
    /// Spans kept ahead of the server while offloaded.
    offload_spans: u64,
    capture_offset: i64,
    /// Partially played callback-mode span and its read offset.
    pending: Option<(LoopSpan, usize)>,
    late_wakeups: u64,
    slow_spans: u64,
    missed_spans: u64,
}

impl ProcessLoop {
    fn run(mut self) {
        let buffer = Arc::clone(&self.shared.buffer);
        let span_frames = buffer.span_frames();
        let mut generation = 0;
        let mut wake = ClockTime::now_nanos();
        let mut needs_resync = false;

        loop {
            match self.shared.keep_running(&mut generation, self.idle_wait) {
                KeepRunning::Exit => break,
                KeepRunning::Idle => continue,
                KeepRunning::Run { restarted } => {
                    if restarted {
                        self.on_restart();
                        wake = ClockTime::now_nanos();
                        needs_resync = self.direction == Direction::Capture;
                    }
                }
            }

            let now = ClockTime::now_nanos();
            if self.scheduler.is_late(wake, now) {
                self.late_wakeups += 1;
                if self.late_wakeups == 1 || self.late_wakeups % 100 == 0 {
                    tracing::warn!(
                        session = %self.common.session(),
                        late_us = (now - wake) / 1_000,
                        count = self.late_wakeups,
                        "process loop woke late"
                    );
                }
                wake = now;
            }

            let offload = self.direction == Direction::Playback && self.common.data_path().offload;
            let handled = match self.direction {
                Direction::Playback if offload => self.render_ahead(&buffer),
                Direction::Playback => self
                    .render_span(&buffer)
                    .map(|(position, cost)| (position + span_frames, cost)),
                Direction::Capture => {
                    if needs_resync && self.resync_capture(&buffer) {
                        needs_resync = false;
                        wake = ClockTime::now_nanos();
                        continue;
                    }
                    self.capture_span(&buffer)
                        .map(|(position, cost)| (position + span_frames, cost))
                }
            };
            // A span that could not be claimed is retried at once.
            let Some((target, cost)) = handled else {
                continue;
            };

            let now = ClockTime::now_nanos();
            let server = &self.server;
            wake = self
                .scheduler
                .next_wake(target, now, || server.request_handle_info());
            let absolute = if offload {
                let window = self.scheduler.span_nanos() * (self.offload_spans as i64 + 1);
                wake > now && wake - now <= window
            } else {
                self.scheduler.use_absolute_sleep(wake, now, cost)
            };
            if absolute {
                ClockTime::absolute_sleep(wake);
            } else {
                ClockTime::relative_sleep(self.scheduler.relative_sleep_nanos());
            }
        }

        self.return_pending();
        tracing::debug!(session = %self.common.session(), "process loop exiting");
    }

    fn callback_queue(&self) -> Option<Arc<BufferQueue>> {
        let path = self.common.data_path();
        match path.mode {
            RenderMode::Callback => path.queue,
            RenderMode::Normal => None,
        }
    }

    fn on_restart(&mut self) {
        self.scheduler.reset();
        tracing::debug!(session = %self.common.session(), direction = %self.direction, "process loop running");
        if self.direction == Direction::Playback {
            if let Some(queue) = self.callback_queue() {
                for _ in 0..queue.state().free {
                    self.common.notify_data(queue.span_capacity());
                }
            }
        }
    }

    fn return_pending(&mut self) {
        if let (Some((span, _)), Some(queue)) = (self.pending.take(), self.callback_queue()) {
            queue.complete_span(span);
        }
    }

    /// Claims the span at `position`, retrying while the other side holds it.
    fn acquire(&self, buffer: &ProcessBuffer, position: u64, from: SpanStatus, to: SpanStatus) -> bool {
        for attempt in 0..self.acquire_retries {
            if buffer.try_transition(position, from, to) {
                return true;
            }
            if !self.shared.is_running() {
                return false;
            }
            if attempt + 1 < self.acquire_retries {
                std::thread::sleep(self.acquire_backoff);
            }
        }
        false
    }

    fn render_span(&mut self, buffer: &ProcessBuffer) -> Option<(u64, i64)> {
        let span_frames = buffer.span_frames();
        let mut position = buffer.cur_write_frame();
        let read = buffer.cur_read_frame();
        if position < read {
            // The server played past us; catch up instead of writing behind it.
            position = read;
            buffer.set_cur_write_frame(read);
        }

        if !self.acquire(buffer, position, SpanStatus::Free, SpanStatus::Writing) {
            self.missed_spans += 1;
            if self.missed_spans == 1 || self.missed_spans % 100 == 0 {
                tracing::warn!(
                    session = %self.common.session(),
                    position,
                    count = self.missed_spans,
                    "playback span still held by server"
                );
            }
            return None;
        }
        buffer.stamp(position, SpanStamp::WriteStart, ClockTime::now_nanos());

        let queue = self.callback_queue();
        let format = self.params.format;
        let common = Arc::clone(&self.common);
        let shared = Arc::clone(&self.shared);
        let pending = &mut self.pending;
        let (filled, completed) = buffer.with_span(position, |span| {
            let (filled, completed) = match &queue {
                Some(queue) => fill_from_queue(queue, pending, span),
                None => (fill_from_staging(&shared, span), 0),
            };
            if filled < span.len() {
                fill_silence(&mut span[filled..], format);
            }
            common.dump(span);
            (filled, completed)
        });
        if filled < buffer.span_bytes() {
            self.common.record_underflow();
        }

        if buffer.span_status(position) == SpanStatus::Writing {
            buffer.set_cur_write_frame(position + span_frames);
            buffer.set_span_status(position, SpanStatus::Done);
            if buffer.cur_read_frame() > position
                && buffer.try_transition(position, SpanStatus::Done, SpanStatus::Free)
            {
                tracing::debug!(session = %self.common.session(), position, "span finished after server passed it");
            }
        }
        buffer.stamp(position, SpanStamp::WriteDone, ClockTime::now_nanos());
        let cost = buffer.write_cost(position);
        self.check_cost(position, cost);

        self.common.on_span_processed();
        let params = self.params;
        self.common.on_rendered(filled, || {
            params.duration_of(buffer.cur_write_frame().saturating_sub(buffer.cur_read_frame()))
        });
        if let Some(queue) = &queue {
            for _ in 0..completed {
                self.common.notify_data(queue.span_capacity());
            }
        }
        Some((position, cost))
    }

    /// Offload playback: tops the ring up to `offload_spans` spans ahead of
    /// the server and aims the next wake at the last span written, so the
    /// loop wakes once per batch instead of once per span.
    fn render_ahead(&mut self, buffer: &ProcessBuffer) -> Option<(u64, i64)> {
        let span_frames = buffer.span_frames();
        let window = self.offload_spans * span_frames;
        let mut last = None;
        while buffer.cur_write_frame().saturating_sub(buffer.cur_read_frame()) < window {
            match self.render_span(buffer) {
                Some(rendered) => last = Some(rendered),
                None => break,
            }
            if !self.shared.is_running() {
                break;
            }
        }
        match last {
            Some(rendered) => Some(rendered),
            None if buffer.cur_write_frame() > buffer.cur_read_frame() => {
                Some((buffer.cur_write_frame().saturating_sub(span_frames), 0))
            }
            None => None,
        }
    }

    /// Aligns the read frame with the first span the server captured.
    fn resync_capture(&self, buffer: &ProcessBuffer) -> bool {
        for attempt in 0..RESYNC_ATTEMPTS {
            match self.server.request_handle_info() {
                Ok((position, time)) if position > 0 => {
                    ClockTime::absolute_sleep(time + self.capture_offset);
                    buffer.set_cur_read_frame(position);
                    tracing::debug!(session = %self.common.session(), position, "capture aligned to server");
                    return true;
                }
                Ok(_) => {
                    if attempt + 1 < RESYNC_ATTEMPTS {
                        ClockTime::relative_sleep(self.scheduler.relative_sleep_nanos());
                    }
                }
                Err(err) => {
                    tracing::warn!(session = %self.common.session(), %err, "capture resync query failed");
                    return false;
                }
            }
        }
        false
    }

    fn capture_span(&mut self, buffer: &ProcessBuffer) -> Option<(u64, i64)> {
        let span_frames = buffer.span_frames();
        let position = buffer.cur_read_frame();
        if !self.acquire(buffer, position, SpanStatus::Done, SpanStatus::Reading) {
            let server = &self.server;
            self.common.on_read_timeout(|| server.report_stall());
            return None;
        }
        self.common.on_read_success();
        buffer.stamp(position, SpanStamp::ReadStart, ClockTime::now_nanos());

        let queue = self.callback_queue();
        let shared = Arc::clone(&self.shared);
        let session = self.common.session();
        let ready = buffer.with_span(position, |span| match &queue {
            Some(queue) => deliver_to_queue(queue, span),
            None => {
                let pushed = shared.lock_staging().push_slice(span);
                shared.staging_changed.notify_all();
                if pushed < span.len() {
                    tracing::debug!(%session, dropped = span.len() - pushed, "capture overrun");
                }
                Vec::new()
            }
        });

        if buffer.try_transition(position, SpanStatus::Reading, SpanStatus::Free) {
            buffer.set_cur_read_frame(position + span_frames);
        }
        buffer.stamp(position, SpanStamp::ReadDone, ClockTime::now_nanos());
        let cost = buffer.read_cost(position);
        self.check_cost(position, cost);

        self.common.on_span_processed();
        for bytes in ready {
            self.common.on_captured(bytes);
            self.common.notify_data(bytes);
        }
        Some((position, cost))
    }

    fn check_cost(&mut self, position: u64, cost: i64) {
        if cost > self.scheduler.max_handle_cost() {
            self.slow_spans += 1;
            if self.slow_spans == 1 || self.slow_spans % 100 == 0 {
                tracing::warn!(
                    session = %self.common.session(),
                    position,
                    cost_us = cost / 1_000,
                    count = self.slow_spans,
                    "span handling took too long"
                );
            }
        }
    }
}

fn fill_from_staging(shared: &LoopShared, out: &mut [u8]) -> usize {
    let popped = shared.lock_staging().pop_slice(out);
    shared.staging_changed.notify_all();
    popped
}

/// Copies queued application spans into `out`, returning the bytes copied
/// and the number of queue spans finished.
fn fill_from_queue(
    queue: &BufferQueue,
    pending: &mut Option<(LoopSpan, usize)>,
    out: &mut [u8],
) -> (usize, usize) {
    let mut filled = 0;
    let mut completed = 0;
    while filled < out.len() {
        if pending.is_none() {
            match queue.try_take_span() {
                Some(span) if span.len > 0 => *pending = Some((span, 0)),
                Some(span) => {
                    queue.complete_span(span);
                    completed += 1;
                    continue;
                }
                None => break,
            }
        }
        let Some((span, offset)) = pending.as_mut() else {
            break;
        };
        let n = (span.len - *offset).min(out.len() - filled);
        out[filled..filled + n].copy_from_slice(&span.data[*offset..*offset + n]);
        *offset += n;
        filled += n;
        if *offset >= span.len {
            if let Some((span, _)) = pending.take() {
                queue.complete_span(span);
                completed += 1;
            }
        }
    }
    (filled, completed)
}

/// Splits a captured span across free queue spans. Returns the byte count
/// of every span handed to the application.
fn deliver_to_queue(queue: &BufferQueue, data: &[u8]) -> Vec<usize> {
    let mut ready = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let Some(mut span) = queue.try_take_span() else {
            tracing::debug!(dropped = data.len() - offset, "capture queue full");
            break;
        };
        let n = span.data.len().min(data.len() - offset);
        if n == 0 {
            queue.abandon_span(span);
            break;
        }
        span.data[..n].copy_from_slice(&data[offset..offset + n]);
        span.len = n;
        queue.complete_span(span);
        ready.push(n);
        offset += n;
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::QueueRole;
    use crate::config::StreamConfig;
    use crate::event::EventHub;
    use crate::info::{AppInfo, CapturerInfo, RendererInfo, SourceType, StreamInfo};
    use crate::server::LoopbackServer;

    fn create(server: &LoopbackServer, info: &SwitchInfo) -> ProcessTransport {
        let config = StreamConfig::default();
        let events = Arc::new(EventHub::default());
        let deps = TransportDeps {
            server,
            config: &config,
            events: &events,
            dump: None,
        };
        ProcessTransport::create(&deps, &info.request(), info).unwrap()
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_playback_loop_feeds_server() {
        let server = LoopbackServer::new();
        let info = SwitchInfo::new(
            AudioStreamParams::cd_quality(),
            StreamInfo::Renderer(RendererInfo::music().with_low_latency(true)),
            AppInfo::default(),
        );
        let t = create(&server, &info);
        t.start().unwrap();
        let data = vec![1u8; 9600];
        assert_eq!(t.write(&data).unwrap(), 9600);
        assert!(wait_for(Duration::from_secs(2), || {
            t.common().stats().frames_transferred >= 2400
        }));
        assert!(t.common().stats().spans_processed > 0);
        assert!(server.played_bytes() > 0);
        t.stop().unwrap();
        t.release().unwrap();
    }

    #[test]
    fn test_playback_silence_counts_underflows() {
        let server = LoopbackServer::new();
        let info = SwitchInfo::new(
            AudioStreamParams::cd_quality(),
            StreamInfo::Renderer(RendererInfo::music().with_low_latency(true)),
            AppInfo::default(),
        );
        let t = create(&server, &info);
        t.start().unwrap();
        assert!(wait_for(Duration::from_secs(2), || t.common().stats().underflows >= 3));
        assert_eq!(t.common().stats().frames_transferred, 0);
        t.release().unwrap();
    }

    #[test]
    fn test_offload_playback_writes_ahead() {
        let server = LoopbackServer::new();
        let mut info = SwitchInfo::new(
            AudioStreamParams::cd_quality(),
            StreamInfo::Renderer(RendererInfo::music().with_low_latency(true)),
            AppInfo::default(),
        );
        info.offload = true;
        let t = create(&server, &info);
        assert!(t.common().data_path().offload);
        t.start().unwrap();
        assert_eq!(t.write(&vec![1u8; 19200]).unwrap(), 19200);

        let buffer = Arc::clone(&t.shared.buffer);
        let mut furthest = 0;
        assert!(wait_for(Duration::from_secs(2), || {
            let ahead = buffer.cur_write_frame().saturating_sub(buffer.cur_read_frame());
            furthest = furthest.max(ahead);
            t.common().stats().frames_transferred >= 4800
        }));
        assert!(furthest >= 2 * buffer.span_frames());
        assert!(server.played_bytes() > 0);
        t.stop().unwrap();
        t.release().unwrap();
    }

    #[test]
    fn test_capture_loop_stages_data() {
        let server = LoopbackServer::new();
        let info = SwitchInfo::new(
            AudioStreamParams::cd_quality(),
            StreamInfo::Capturer(CapturerInfo::new(SourceType::Mic).with_low_latency(true)),
            AppInfo::default(),
        );
        let t = create(&server, &info);
        t.start().unwrap();
        let mut buf = vec![0u8; 960];
        let mut total = 0;
        let start = Instant::now();
        while total < 4800 && start.elapsed() < Duration::from_secs(3) {
            if let Ok(n) = t.read(&mut buf) {
                total += n;
            }
        }
        assert!(total >= 4800);
        assert!(buf.iter().any(|&b| b != 0));
        t.stop().unwrap();
        t.release().unwrap();
    }

    #[test]
    fn test_fill_from_queue_spans_boundaries() {
        let queue = BufferQueue::new(QueueRole::Render, 3, 6);
        for value in [1u8, 2] {
            let mut desc = queue.get_buffer_desc().unwrap();
            desc.fill_from(&[value; 6]);
            queue.enqueue(desc).unwrap();
        }
        let mut pending = None;
        let mut out = [0u8; 4];
        assert_eq!(fill_from_queue(&queue, &mut pending, &mut out), (4, 0));
        assert_eq!(out, [1, 1, 1, 1]);
        assert_eq!(fill_from_queue(&queue, &mut pending, &mut out), (4, 1));
        assert_eq!(out, [1, 1, 2, 2]);
        let mut out = [0u8; 8];
        assert_eq!(fill_from_queue(&queue, &mut pending, &mut out), (4, 1));
        assert_eq!(queue.state().free, 3);
    }

    #[test]
    fn test_deliver_to_queue_splits_span() {
        let queue = BufferQueue::new(QueueRole::Capture, 3, 4);
        let ready = deliver_to_queue(&queue, &[7u8; 10]);
        assert_eq!(ready, vec![4, 4, 2]);
        assert_eq!(queue.state().filled, 3);
        // Full queue drops the rest.
        assert!(deliver_to_queue(&queue, &[1u8; 4]).is_empty());
    }
}
