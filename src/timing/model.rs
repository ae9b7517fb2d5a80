//! Linear frame-position to clock-time mapping.

use std::sync::atomic::{AtomicU64, Ordering};

/// An anchor update that would move the position backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("position went backwards: {previous} -> {current}")]
pub struct PositionRegression {
    /// Anchor position before the update.
    pub previous: u64,
    /// Rejected position.
    pub current: u64,
}

/// Maps frame positions to clock times from one `(position, time)` anchor
/// and the sample rate.
#[derive(Debug, Clone)]
pub struct LinearPosTimeModel {
    sample_rate: u32,
    anchor: Option<(u64, i64)>,
}

impl LinearPosTimeModel {
    /// Creates an unanchored model.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            anchor: None,
        }
    }

    /// Drops the anchor, e.g. on start.
    pub fn reset(&mut self) {
        self.anchor = None;
    }

    /// Whether an anchor has been set since the last reset.
    pub fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }

    /// Current anchor.
    pub fn anchor(&self) -> Option<(u64, i64)> {
        self.anchor
    }

    /// Re-anchors on an authoritative `(position, time)` pair.
    ///
    /// # Errors
    ///
    /// Rejects a position smaller than the current anchor and keeps the
    /// existing anchor.
    pub fn update(&mut self, position: u64, time: i64) -> Result<(), PositionRegression> {
        if let Some((previous, _)) = self.anchor {
            if position < previous {
                return Err(PositionRegression {
                    previous,
                    current: position,
                });
            }
        }
        self.anchor = Some((position, time));
        Ok(())
    }

    /// Predicted clock time of `position`, or `None` before the first anchor.
    pub fn time_of_pos(&self, position: u64) -> Option<i64> {
        let (anchor_pos, anchor_time) = self.anchor?;
        let delta_frames = i128::from(position) - i128::from(anchor_pos);
        let delta_nanos = (delta_frames * 1_000_000_000 / i128::from(self.sample_rate))
            .clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
        Some(anchor_time.saturating_add(delta_nanos))
    }
}

/// Keeps a reported position from ever going backwards.
///
/// A raw value smaller than the last observed one is replaced by the last
/// observed one and logged.
#[derive(Debug, Default)]
pub struct PositionTracker {
    last: AtomicU64,
}

impl PositionTracker {
    /// Creates a tracker starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a raw position and returns the value to report.
    pub fn observe(&self, raw: u64) -> u64 {
        let previous = self.last.fetch_max(raw, Ordering::AcqRel);
        if raw < previous {
            tracing::warn!(raw, previous, "position went backwards, keeping last value");
            previous
        } else {
            raw
        }
    }

    /// Last reported position.
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Restarts from `position`, e.g. after a flush or a transport switch.
    pub fn reset_to(&self, position: u64) {
        self.last.store(position, Ordering::Release);
    }
}
