//! CPAL-backed audio server playing through the default system devices.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig as CpalStreamConfig};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::{AudioServer, ProcessLayout, ServerProcess, ServerStream, StreamRequest};
use crate::format::{AudioStreamParams, SampleFormat};
use crate::info::Direction;
use crate::session::SessionId;
use crate::timing::ClockTime;
use crate::transport::ProcessStatus;
use crate::ServerError;

/// Symmetric i16 max for audio conversion (avoids asymmetric clipping).
const I16_MAX_SYMMETRIC: f32 = i16::MAX as f32;

/// Device-side buffer, as audio duration.
const DEVICE_BUFFER_DURATION: Duration = Duration::from_millis(500);

const MIN_BUFFER_DURATION: Duration = Duration::from_millis(20);

/// Poll interval of blocking `write`/`read`/`drain`.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

const FIRST_SESSION_ID: u32 = 200_000;

/// [`AudioServer`] on the default CPAL host.
///
/// Only the streaming protocol with S16LE samples is supported; process
/// streams are refused.
#[derive(Debug, Default)]
pub struct DeviceServer {
    next_session: AtomicU32,
}

impl DeviceServer {
    /// Creates a server on the default host.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioServer for DeviceServer {
    fn create_stream(&self, request: &StreamRequest) -> Result<Arc<dyn ServerStream>, ServerError> {
        if request.params.format != SampleFormat::S16Le {
            return Err(ServerError::Unsupported(format!(
                "{:?} on audio devices",
                request.params.format
            )));
        }
        let session =
            SessionId::new(FIRST_SESSION_ID + self.next_session.fetch_add(1, Ordering::SeqCst));
        let stream = DeviceStream::open(session, request)?;
        tracing::info!(%session, direction = %request.direction, "device stream opened");
        Ok(Arc::new(stream))
    }

    fn create_process(
        &self,
        _request: &StreamRequest,
        _layout: ProcessLayout,
    ) -> Result<Arc<dyn ServerProcess>, ServerError> {
        Err(ServerError::Unsupported(
            "low-latency streams on audio devices".to_string(),
        ))
    }

    fn supports_low_latency(&self) -> bool {
        false
    }
}

enum Command {
    Play,
    Pause,
    Close,
}

struct DeviceShared {
    status: AtomicU8,
    volume: AtomicU32,
    frames: AtomicU64,
    position_time: AtomicI64,
    flush: AtomicBool,
}

impl DeviceShared {
    fn running(&self) -> bool {
        self.status.load(Ordering::SeqCst) == ProcessStatus::Running as u8
    }
}

enum Endpoint {
    Playback(Mutex<HeapProd<i16>>),
    Capture(Mutex<HeapCons<i16>>),
}

/// A CPAL stream owned by a dedicated thread.
///
/// CPAL streams are not `Send` on every platform, so the stream lives on
/// its own thread and is driven through [`Command`]s.
struct DeviceStream {
    session: SessionId,
    params: AudioStreamParams,
    shared: Arc<DeviceShared>,
    endpoint: Endpoint,
    commands: Mutex<mpsc::Sender<(Command, mpsc::Sender<Result<(), ServerError>>)>>,
    owner: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceStream {
    fn open(session: SessionId, request: &StreamRequest) -> Result<Self, ServerError> {
        let params = request.params;
        let capacity = (params.frames_for(DEVICE_BUFFER_DURATION) as usize
            * usize::from(params.channels))
        .max(1);
        let (producer, consumer) = HeapRb::<i16>::new(capacity).split();
        let shared = Arc::new(DeviceShared {
            status: AtomicU8::new(ProcessStatus::Idle as u8),
            volume: AtomicU32::new(1.0f32.to_bits()),
            frames: AtomicU64::new(0),
            position_time: AtomicI64::new(ClockTime::now_nanos()),
            flush: AtomicBool::new(false),
        });

        let (endpoint, callback_side) = match request.direction {
            Direction::Playback => (
                Endpoint::Playback(Mutex::new(producer)),
                CallbackSide::Playback(consumer),
            ),
            Direction::Capture => (
                Endpoint::Capture(Mutex::new(consumer)),
                CallbackSide::Capture(producer),
            ),
        };

        let (command_tx, command_rx) = mpsc::channel();
        let (built_tx, built_rx) = mpsc::channel();
        let thread_shared = Arc::clone(&shared);
        let owner = std::thread::Builder::new()
            .name(format!("device-stream-{session}"))
            .spawn(move || run_owner(params, callback_side, thread_shared, command_rx, built_tx))
            .map_err(ServerError::backend)?;

        match built_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = owner.join();
                return Err(err);
            }
            Err(_) => return Err(ServerError::Disconnected),
        }

        Ok(Self {
            session,
            params,
            shared,
            endpoint,
            commands: Mutex::new(command_tx),
            owner: Mutex::new(Some(owner)),
        })
    }

    fn ensure_open(&self) -> Result<(), ServerError> {
        if self.shared.status.load(Ordering::SeqCst) == ProcessStatus::Released as u8 {
            Err(ServerError::Released)
        } else {
            Ok(())
        }
    }

    fn send(&self, command: Command) -> Result<(), ServerError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .lock()
            .send((command, reply_tx))
            .map_err(|_| ServerError::Disconnected)?;
        reply_rx.recv().map_err(|_| ServerError::Disconnected)?
    }

    fn set_status(&self, status: ProcessStatus) {
        self.shared.status.store(status as u8, Ordering::SeqCst);
    }

    fn buffered_samples(&self) -> usize {
        match &self.endpoint {
            Endpoint::Playback(producer) => producer.lock().occupied_len(),
            Endpoint::Capture(consumer) => consumer.lock().occupied_len(),
        }
    }

    fn shutdown(&self) {
        self.set_status(ProcessStatus::Released);
        let _ = self.send(Command::Close);
        let owner = self.owner.lock().take();
        if let Some(owner) = owner {
            let _ = owner.join();
        }
    }
}

enum CallbackSide {
    Playback(HeapCons<i16>),
    Capture(HeapProd<i16>),
}

fn run_owner(
    params: AudioStreamParams,
    side: CallbackSide,
    shared: Arc<DeviceShared>,
    commands: mpsc::Receiver<(Command, mpsc::Sender<Result<(), ServerError>>)>,
    built: mpsc::Sender<Result<(), ServerError>>,
) {
    let stream = match build_stream(params, side, shared) {
        Ok(stream) => {
            let _ = built.send(Ok(()));
            stream
        }
        Err(err) => {
            let _ = built.send(Err(err));
            return;
        }
    };

    while let Ok((command, reply)) = commands.recv() {
        let result = match command {
            Command::Play => stream.play().map_err(ServerError::backend),
            Command::Pause => stream.pause().map_err(ServerError::backend),
            Command::Close => {
                let _ = reply.send(Ok(()));
                break;
            }
        };
        let _ = reply.send(result);
    }
}

fn build_stream(
    params: AudioStreamParams,
    side: CallbackSide,
    shared: Arc<DeviceShared>,
) -> Result<cpal::Stream, ServerError> {
    let host = cpal::default_host();
    let config = CpalStreamConfig {
        channels: params.channels,
        sample_rate: SampleRate(params.sample_rate),
        buffer_size: BufferSize::Default,
    };
    let channels = u64::from(params.channels.max(1));

    match side {
        CallbackSide::Playback(mut consumer) => {
            let device = host
                .default_output_device()
                .ok_or_else(|| ServerError::Backend("no default output device".to_string()))?;
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        if shared.flush.swap(false, Ordering::SeqCst) {
                            consumer.clear();
                        }
                        if !shared.running() {
                            data.fill(0.0);
                            return;
                        }
                        let volume = f32::from_bits(shared.volume.load(Ordering::Relaxed));
                        let mut played = 0u64;
                        for sample in data.iter_mut() {
                            *sample = match consumer.try_pop() {
                                Some(value) => {
                                    played += 1;
                                    f32::from(value) / I16_MAX_SYMMETRIC * volume
                                }
                                None => 0.0,
                            };
                        }
                        shared.frames.fetch_add(played / channels, Ordering::SeqCst);
                        shared
                            .position_time
                            .store(ClockTime::now_nanos(), Ordering::SeqCst);
                    },
                    |err| {
                        tracing::error!("Audio stream error: {}", err);
                    },
                    None,
                )
                .map_err(ServerError::backend)
        }
        CallbackSide::Capture(mut producer) => {
            let device = host
                .default_input_device()
                .ok_or_else(|| ServerError::Backend("no default input device".to_string()))?;
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !shared.running() {
                            return;
                        }
                        let mut captured = 0u64;
                        for &sample in data {
                            let converted = (sample * I16_MAX_SYMMETRIC)
                                .clamp(f32::from(i16::MIN), f32::from(i16::MAX))
                                as i16;
                            // Drops samples when the reader falls behind.
                            if producer.try_push(converted).is_ok() {
                                captured += 1;
                            }
                        }
                        shared.frames.fetch_add(captured / channels, Ordering::SeqCst);
                        shared
                            .position_time
                            .store(ClockTime::now_nanos(), Ordering::SeqCst);
                    },
                    |err| {
                        tracing::error!("Audio stream error: {}", err);
                    },
                    None,
                )
                .map_err(ServerError::backend)
        }
    }
}

impl ServerStream for DeviceStream {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn min_buffer_size(&self) -> usize {
        self.params.bytes_for(MIN_BUFFER_DURATION)
    }

    fn start(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.send(Command::Play)?;
        self.set_status(ProcessStatus::Running);
        Ok(())
    }

    fn pause(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.set_status(ProcessStatus::Paused);
        self.send(Command::Pause)
    }

    fn stop(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.set_status(ProcessStatus::Stopped);
        self.send(Command::Pause)
    }

    fn flush(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        match &self.endpoint {
            Endpoint::Playback(_) => self.shared.flush.store(true, Ordering::SeqCst),
            Endpoint::Capture(consumer) => {
                consumer.lock().clear();
            }
        }
        Ok(())
    }

    fn drain(&self, timeout: Duration) -> Result<(), ServerError> {
        self.ensure_open()?;
        let started = Instant::now();
        while self.buffered_samples() > 0 {
            if started.elapsed() >= timeout {
                return Err(ServerError::Timeout(timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn release(&self) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.shutdown();
        tracing::info!(session = %self.session, "device stream released");
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<usize, ServerError> {
        self.ensure_open()?;
        let Endpoint::Playback(producer) = &self.endpoint else {
            return Err(ServerError::Unsupported("write on a capture stream".to_string()));
        };
        let samples: Vec<i16> = data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let mut pushed = 0;
        loop {
            pushed += producer.lock().push_slice(&samples[pushed..]);
            if pushed == samples.len() || !self.shared.running() {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(pushed * 2)
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, ServerError> {
        self.ensure_open()?;
        let Endpoint::Capture(consumer) = &self.endpoint else {
            return Err(ServerError::Unsupported("read on a playback stream".to_string()));
        };
        let started = Instant::now();
        let mut samples = vec![0i16; buf.len() / 2];
        loop {
            let n = consumer.lock().pop_slice(&mut samples);
            if n > 0 {
                for (chunk, sample) in buf.chunks_exact_mut(2).zip(&samples[..n]) {
                    chunk.copy_from_slice(&sample.to_le_bytes());
                }
                return Ok(n * 2);
            }
            if started.elapsed() >= timeout {
                return Err(ServerError::Timeout(timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn position(&self) -> Result<(u64, i64), ServerError> {
        self.ensure_open()?;
        Ok((
            self.shared.frames.load(Ordering::SeqCst),
            self.shared.position_time.load(Ordering::SeqCst),
        ))
    }

    fn latency(&self) -> Duration {
        let frames = self.buffered_samples() / usize::from(self.params.channels.max(1));
        self.params.duration_of(frames as u64)
    }

    fn set_volume(&self, volume: f32) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.shared.volume.store(volume.to_bits(), Ordering::SeqCst);
        Ok(())
    }

    fn set_render_rate(&self, sample_rate: u32) -> Result<(), ServerError> {
        self.ensure_open()?;
        if sample_rate == self.params.sample_rate {
            return Ok(());
        }
        Err(ServerError::Unsupported(format!(
            "render rate {sample_rate} Hz on a {} Hz device stream",
            self.params.sample_rate
        )))
    }

    fn set_offload(&self, enabled: bool) -> Result<(), ServerError> {
        self.ensure_open()?;
        if enabled {
            return Err(ServerError::Unsupported("offload on a device stream".to_string()));
        }
        Ok(())
    }

    fn restore(&self) -> Result<(), ServerError> {
        self.ensure_open()
    }

    fn report_stall(&self) {
        tracing::warn!(session = %self.session, "client reports stalled device reads");
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        if self.owner.lock().is_some() {
            self.shutdown();
        }
    }
}
