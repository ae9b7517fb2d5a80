//! Streaming-protocol transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{SwitchInfo, TransportCommon, TransportDeps};
use crate::buffer::BufferQueue;
use crate::info::{Direction, RenderMode};
use crate::server::{ServerStream, StreamRequest};
use crate::{ServerError, StreamError};

/// Callback thread moving buffer-queue spans through a [`ServerStream`].
struct CallbackWorker {
    running: Arc<AtomicBool>,
    queue: Arc<BufferQueue>,
    handle: JoinHandle<()>,
}

pub(crate) struct StreamTransport {
    common: Arc<TransportCommon>,
    server: Arc<dyn ServerStream>,
    queue_wait: Duration,
    read_timeout: Duration,
    worker: Mutex<Option<CallbackWorker>>,
}

impl StreamTransport {
    pub fn create(
        deps: &TransportDeps<'_>,
        request: &StreamRequest,
        info: &SwitchInfo,
    ) -> Result<Self, StreamError> {
        let server = deps
            .server
            .create_stream(request)
            .map_err(|err| StreamError::transport("create stream", err))?;
        let common = Arc::new(TransportCommon::new(server.session_id(), info, deps));
        Ok(Self {
            common,
            server,
            queue_wait: deps.config.queue_wait_timeout,
            read_timeout: deps.config.read_timeout,
            worker: Mutex::new(None),
        })
    }

    pub fn common(&self) -> &TransportCommon {
        &self.common
    }

    pub fn start(&self) -> Result<(), StreamError> {
        self.server
            .start()
            .map_err(|err| StreamError::transport("start", err))?;
        let path = self.common.data_path();
        if path.mode == RenderMode::Callback {
            if let Some(queue) = path.queue {
                self.spawn_worker(queue)?;
            }
        }
        Ok(())
    }

    fn spawn_worker(&self, queue: Arc<BufferQueue>) -> Result<(), StreamError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let thread_queue = Arc::clone(&queue);
        let common = Arc::clone(&self.common);
        let server = Arc::clone(&self.server);
        let wait = self.queue_wait;
        let read_timeout = self.read_timeout;
        let direction = common.direction();

        let handle = std::thread::Builder::new()
            .name(format!("stream-callback-{}", common.session()))
            .spawn(move || match direction {
                Direction::Playback => {
                    run_render_worker(&common, &*server, &thread_queue, &thread_running, wait);
                }
                Direction::Capture => run_capture_worker(
                    &common,
                    &*server,
                    &thread_queue,
                    &thread_running,
                    wait,
                    read_timeout,
                ),
            })
            .map_err(|err| StreamError::transport("spawn callback thread", ServerError::backend(err)))?;

        *worker = Some(CallbackWorker {
            running,
            queue,
            handle,
        });
        Ok(())
    }

    fn stop_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.running.store(false, Ordering::SeqCst);
            worker.queue.wake();
            // Stopped from inside the data callback; the loop exits on its own.
            if worker.handle.thread().id() == std::thread::current().id() {
                return;
            }
            if worker.handle.join().is_err() {
                tracing::error!(session = %self.common.session(), "callback thread panicked");
            }
        }
    }

    pub fn pause(&self) -> Result<(), StreamError> {
        self.server
            .pause()
            .map_err(|err| StreamError::transport("pause", err))?;
        self.stop_worker();
        Ok(())
    }

    pub fn stop(&self) -> Result<(), StreamError> {
        self.server
            .stop()
            .map_err(|err| StreamError::transport("stop", err))?;
        self.stop_worker();
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StreamError> {
        self.server
            .flush()
            .map_err(|err| StreamError::transport("flush", err))
    }

    pub fn drain(&self, timeout: Duration) -> Result<(), StreamError> {
        let started = Instant::now();
        if let Some(queue) = self.common.data_path().queue {
            while queue.pending() > 0 {
                if started.elapsed() >= timeout {
                    return Err(StreamError::Timeout {
                        operation: "drain",
                        waited: timeout,
                    });
                }
                std::thread::sleep(self.queue_wait.min(Duration::from_millis(5)));
            }
        }
        let remaining = timeout.saturating_sub(started.elapsed());
        self.server
            .drain(remaining)
            .map_err(|err| StreamError::transport("drain", err))
    }

    pub fn release(&self) -> Result<(), StreamError> {
        self.stop_worker();
        self.server
            .release()
            .map_err(|err| StreamError::transport("release", err))
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        let written = self
            .server
            .write(data)
            .map_err(|err| StreamError::transport("write", err))?;
        self.common.dump(&data[..written]);
        self.common.on_rendered(written, || self.server.latency());
        Ok(written)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        match self.server.read(buf, self.read_timeout) {
            Ok(read) => {
                self.common.on_read_success();
                self.common.on_captured(read);
                Ok(read)
            }
            Err(err @ ServerError::Timeout(_)) => {
                self.common.on_read_timeout(|| self.server.report_stall());
                Err(StreamError::transport("read", err))
            }
            Err(err) => Err(StreamError::transport("read", err)),
        }
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

    pub fn set_offload(&self, enabled: bool) -> Result<(), StreamError> {
        self.server
            .set_offload(enabled)
            .map_err(|err| StreamError::transport("set offload", err))
    }

    pub fn position(&self) -> Result<(u64, i64), StreamError> {
        self.server
            .position()
            .map_err(|err| StreamError::transport("get position", err))
    }

    pub fn latency(&self) -> Duration {
        self.server.latency()
    }

    pub fn min_buffer_size(&self) -> usize {
        self.server.min_buffer_size()
    }

    pub fn restore(&self) -> Result<(), StreamError> {
        self.server
            .restore()
            .map_err(|err| StreamError::transport("restore", err))
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn run_render_worker(
    common: &TransportCommon,
    server: &dyn ServerStream,
    queue: &BufferQueue,
    running: &AtomicBool,
    wait: Duration,
) {
    let write_errors = AtomicU64::new(0);
    for _ in 0..queue.state().free {
        common.notify_data(queue.span_capacity());
    }

    while running.load(Ordering::SeqCst) {
        let Some(span) = queue.take_span(wait) else {
            continue;
        };
        match server.write(&span.data[..span.len]) {
            Ok(written) => {
                common.dump(&span.data[..written]);
                common.on_rendered(written, || server.latency());
            }
            Err(err) => {
                let count = write_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if count == 1 || count % 100 == 0 {
                    tracing::warn!(session = %common.session(), %err, count, "callback write failed");
                }
            }
        }
        queue.complete_span(span);
        common.notify_data(queue.span_capacity());
    }
    tracing::debug!(session = %common.session(), "render callback thread exiting");
}

fn run_capture_worker(
    common: &TransportCommon,
    server: &dyn ServerStream,
    queue: &BufferQueue,
    running: &AtomicBool,
    wait: Duration,
    read_timeout: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let Some(mut span) = queue.take_span(wait) else {
            continue;
        };
        match server.read(&mut span.data, read_timeout) {
            Ok(read) => {
                common.on_read_success();
                span.len = read;
                queue.complete_span(span);
                common.on_captured(read);
                common.notify_data(read);
            }
            Err(ServerError::Timeout(_)) => {
                queue.abandon_span(span);
                common.on_read_timeout(|| server.report_stall());
            }
            Err(err) => {
                queue.abandon_span(span);
                tracing::warn!(session = %common.session(), %err, "callback read failed");
                std::thread::sleep(wait);
            }
        }
    }
    tracing::debug!(session = %common.session(), "capture callback thread exiting");
}
