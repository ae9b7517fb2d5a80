//! Configuration types for renderer and capturer streams.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for stream behavior.
///
/// Use [`StreamConfig::default()`] for sensible defaults, or customize as needed.
///
/// # Example
///
/// ```
/// use audio_stream_client::StreamConfig;
/// use std::time::Duration;
///
/// let config = StreamConfig {
///     read_timeout: Duration::from_millis(20),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Lower bound on the size of one buffer-queue span, as audio duration.
    ///
    /// Span capacity is the larger of the transport's minimum buffer size
    /// and this duration of audio.
    /// Default: 200ms
    pub min_buffer_duration: Duration,

    /// Number of spans in a renderer's callback-mode buffer queue.
    ///
    /// Default: 4
    pub render_spans: usize,

    /// Number of spans in a capturer's callback-mode buffer queue.
    ///
    /// Default: 3
    pub capture_spans: usize,

    /// How long the callback thread waits for a span before re-checking
    /// whether it should keep running.
    ///
    /// Default: 20ms
    pub queue_wait_timeout: Duration,

    /// How long a blocking read waits for captured data.
    ///
    /// Default: 100ms
    pub read_timeout: Duration,

    /// Consecutive read timeouts after which the transport is asked to
    /// diagnose a stalled server.
    ///
    /// Default: 60
    pub stall_limit: u32,

    /// Upper bound on how long `drain` waits for queued audio to play out.
    ///
    /// Default: 2s
    pub drain_timeout: Duration,

    /// Length of one span of the low-latency process transport.
    ///
    /// Default: 5ms
    pub process_span_duration: Duration,

    /// Number of spans in the process transport's shared ring.
    ///
    /// Default: 4
    pub process_spans: usize,

    /// Attempts to claim a process span that is still held by the server.
    ///
    /// Default: 10
    pub span_acquire_retries: u32,

    /// Sleep between span claim attempts.
    ///
    /// Default: 2ms
    pub span_acquire_backoff: Duration,

    /// Spans the process loop keeps written ahead of the server in offload
    /// mode. Capped at one less than `process_spans`.
    ///
    /// Default: 3
    pub offload_spans: usize,

    /// Wake scheduling of the process transport.
    pub timing: TimingConfig,

    /// Policy-service-died recovery.
    pub recovery: RecoveryConfig,

    /// When set, rendered PCM is also written to this WAV file.
    ///
    /// Default: None
    pub dump_path: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_buffer_duration: Duration::from_millis(200),
            render_spans: 4,
            capture_spans: 3,
            queue_wait_timeout: Duration::from_millis(20),
            read_timeout: Duration::from_millis(100),
            stall_limit: 60,
            drain_timeout: Duration::from_secs(2),
            process_span_duration: Duration::from_millis(5),
            process_spans: 4,
            span_acquire_retries: 10,
            span_acquire_backoff: Duration::from_millis(2),
            offload_spans: 3,
            timing: TimingConfig::default(),
            recovery: RecoveryConfig::default(),
            dump_path: None,
        }
    }
}

/// Tunables of the wake-time predictor.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Spans after start during which every wake re-anchors on the server.
    ///
    /// Default: 20
    pub bootstrap_spans: u64,

    /// After bootstrap, re-anchor on every span index divisible by this.
    ///
    /// Default: 40 (200ms at 5ms spans)
    pub resync_period_spans: u64,

    /// Offset applied to predicted playback wakes. Negative wakes early.
    ///
    /// Default: -1ms
    pub playback_offset_nanos: i64,

    /// Offset applied to predicted capture wakes. Positive wakes late.
    ///
    /// Default: +3ms
    pub capture_offset_nanos: i64,

    /// A wake that has already passed is moved to now plus this.
    /// Also the lateness beyond which a wake-up is logged as too late.
    ///
    /// Default: 1ms
    pub late_clamp: Duration,

    /// Longest expected client handling time for one span.
    ///
    /// Default: 5ms
    pub max_handle_cost: Duration,

    /// Consecutive failed handle-info queries before scheduling falls back
    /// to the wall clock.
    ///
    /// Default: 5
    pub handle_info_failure_limit: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            bootstrap_spans: 20,
            resync_period_spans: 40,
            playback_offset_nanos: -1_000_000,
            capture_offset_nanos: 3_000_000,
            late_clamp: Duration::from_millis(1),
            max_handle_cost: Duration::from_millis(5),
            handle_info_failure_limit: 5,
        }
    }
}

/// Bounded retry of the recovery loop.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Restore attempts before giving up.
    ///
    /// Default: 10
    pub max_attempts: u32,

    /// Sleep between attempts.
    ///
    /// Default: 100ms
    pub retry_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_interval: Duration::from_millis(100),
        }
    }
}
