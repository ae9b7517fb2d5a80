//! Next-wake prediction for the process callback loop.

use super::{nanos, LinearPosTimeModel};
use crate::config::TimingConfig;
use crate::info::Direction;
use crate::ServerError;

/// Predicts when the callback loop should wake to handle a span.
///
/// For the first `bootstrap_spans` spans after a reset, and on every
/// `resync_period_spans`-th span afterwards, the model is re-anchored on the
/// server's latest `(handle position, handle time)`. The prediction is
/// shifted by a direction-specific offset (early for playback, late for
/// capture) and never lies in the past.
///
/// A failed handle-info query keeps the last anchor. After
/// `handle_info_failure_limit` consecutive failures the scheduler falls
/// back to waking one span duration from now until a query succeeds again.
#[derive(Debug)]
pub struct WakeScheduler {
    bootstrap_spans: u64,
    resync_period_spans: u64,
    late_clamp: i64,
    max_handle_cost: i64,
    failure_limit: u32,
    offset: i64,
    span_frames: u64,
    span_nanos: i64,
    model: LinearPosTimeModel,
    failures: u32,
    degraded: bool,
}

impl WakeScheduler {
    /// Creates a scheduler for spans of `span_frames` frames.
    pub fn new(
        config: &TimingConfig,
        direction: Direction,
        span_frames: u64,
        sample_rate: u32,
    ) -> Self {
        let span_frames = span_frames.max(1);
        let sample_rate = sample_rate.max(1);
        let offset = match direction {
            Direction::Playback => config.playback_offset_nanos,
            Direction::Capture => config.capture_offset_nanos,
        };
        Self {
            bootstrap_spans: config.bootstrap_spans,
            resync_period_spans: config.resync_period_spans.max(1),
            late_clamp: nanos(config.late_clamp),
            max_handle_cost: nanos(config.max_handle_cost),
            failure_limit: config.handle_info_failure_limit.max(1),
            offset,
            span_frames,
            span_nanos: (i128::from(span_frames) * 1_000_000_000 / i128::from(sample_rate)) as i64,
            model: LinearPosTimeModel::new(sample_rate),
            failures: 0,
            degraded: false,
        }
    }

    /// Forgets the anchor and restarts the bootstrap phase.
    pub fn reset(&mut self) {
        self.model.reset();
        self.failures = 0;
        self.degraded = false;
    }

    /// Whether handling `position` should re-anchor on the server first.
    pub fn needs_resync(&self, position: u64) -> bool {
        let span = position / self.span_frames;
        span < self.bootstrap_spans || span % self.resync_period_spans == 0
    }

    /// Feeds the result of a handle-info query.
    pub fn resync(&mut self, handle_info: Result<(u64, i64), ServerError>) {
        match handle_info {
            Ok((position, time)) => {
                if let Err(err) = self.model.update(position, time) {
                    tracing::warn!(%err, "ignoring server handle info");
                }
                if self.degraded {
                    tracing::info!("handle info available again, leaving wall-clock scheduling");
                }
                self.failures = 0;
                self.degraded = false;
            }
            Err(err) => {
                self.failures += 1;
                tracing::warn!(%err, failures = self.failures, "handle info query failed");
                if self.failures >= self.failure_limit && !self.degraded {
                    tracing::warn!("falling back to wall-clock scheduling");
                    self.degraded = true;
                }
            }
        }
    }

    /// Predicts the wake time for handling `position`, querying the server
    /// through `handle_info` when a re-anchor is due.
    pub fn next_wake<F>(&mut self, position: u64, now: i64, handle_info: F) -> i64
    where
        F: FnOnce() -> Result<(u64, i64), ServerError>,
    {
        if self.needs_resync(position) {
            self.resync(handle_info());
        }

        let predicted = match self.model.time_of_pos(position) {
            Some(time) if !self.degraded => time + self.offset,
            _ => now + self.span_nanos,
        };

        if predicted < now {
            now + self.late_clamp
        } else {
            predicted
        }
    }

    /// Whether to sleep until `wake` exactly, as opposed to a bounded
    /// relative sleep when the prediction looks implausible.
    pub fn use_absolute_sleep(&self, wake: i64, now: i64, client_cost: i64) -> bool {
        wake > now && wake - now < self.max_handle_cost + client_cost
    }

    /// Length of the fallback relative sleep.
    pub fn relative_sleep_nanos(&self) -> i64 {
        self.max_handle_cost
    }

    /// Returns `true` when a wake-up at `now` for `wake` came too late.
    pub fn is_late(&self, wake: i64, now: i64) -> bool {
        now - wake > self.late_clamp
    }

    /// Nanoseconds in one span.
    pub fn span_nanos(&self) -> i64 {
        self.span_nanos
    }

    /// Handling cost beyond which a span is logged as slow.
    pub fn max_handle_cost(&self) -> i64 {
        self.max_handle_cost
    }

    /// Whether scheduling currently ignores the server anchor.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// The underlying position/time model.
    pub fn model(&self) -> &LinearPosTimeModel {
        &self.model
    }
}
