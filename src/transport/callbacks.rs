//! Position callbacks and read-stall bookkeeping shared by both transports.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::event::PositionCallback;

struct Mark {
    frame: u64,
    callback: PositionCallback,
    fired: bool,
}

struct Period {
    frames: u64,
    callback: PositionCallback,
    next: u64,
}

/// Mark and period callbacks keyed on the transferred-frame count.
///
/// A mark fires once when the count reaches its frame and stays quiet until
/// it is set again. A period fires whenever the count reaches its next
/// multiple.
#[derive(Default)]
pub(crate) struct PositionCallbacks {
    mark: Option<Mark>,
    period: Option<Period>,
}

impl PositionCallbacks {
    pub fn set_mark(&mut self, frame: u64, callback: PositionCallback) {
        self.mark = Some(Mark {
            frame,
            callback,
            fired: false,
        });
    }

    pub fn clear_mark(&mut self) {
        self.mark = None;
    }

    /// Arms a period callback; the first multiple is the one after `current`.
    pub fn set_period(&mut self, frames: u64, callback: PositionCallback, current: u64) {
        let frames = frames.max(1);
        self.period = Some(Period {
            frames,
            callback,
            next: (current / frames + 1) * frames,
        });
    }

    pub fn clear_period(&mut self) {
        self.period = None;
    }

    pub fn mark(&self) -> Option<(u64, PositionCallback)> {
        self.mark
            .as_ref()
            .filter(|mark| !mark.fired)
            .map(|mark| (mark.frame, mark.callback.clone()))
    }

    pub fn period(&self) -> Option<(u64, PositionCallback)> {
        self.period
            .as_ref()
            .map(|period| (period.frames, period.callback.clone()))
    }

    /// Returns the callbacks due at `total` frames with the position each
    /// fires at. The caller invokes them after releasing its lock.
    pub fn due(&mut self, total: u64) -> Vec<(PositionCallback, u64)> {
        let mut due = Vec::new();
        if let Some(mark) = self.mark.as_mut() {
            if !mark.fired && total >= mark.frame {
                mark.fired = true;
                due.push((mark.callback.clone(), mark.frame));
            }
        }
        if let Some(period) = self.period.as_mut() {
            if total >= period.next {
                let reached = total / period.frames * period.frames;
                period.next = reached + period.frames;
                due.push((period.callback.clone(), reached));
            }
        }
        due
    }
}

/// Counts consecutive read timeouts and reports the stall once per run.
#[derive(Debug)]
pub(crate) struct StallDetector {
    limit: u32,
    consecutive: AtomicU32,
}

impl StallDetector {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            consecutive: AtomicU32::new(0),
        }
    }

    /// Records a timeout; returns `true` exactly when the run reaches the limit.
    pub fn on_timeout(&self) -> bool {
        self.consecutive.fetch_add(1, Ordering::AcqRel) + 1 == self.limit
    }

    pub fn on_success(&self) {
        self.consecutive.store(0, Ordering::Release);
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive.load(Ordering::Acquire)
    }
}
