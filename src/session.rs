//! Session identity and data-path statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one server-side stream session.
///
/// Assigned by the transport when the stream is created; a stream switch
/// moves the stream to a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u32);

impl SessionId {
    /// Wraps a raw session number.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw session number.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Statistics about a stream's data path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames handed to (playback) or taken from (capture) the server.
    pub frames_transferred: u64,
    /// Spans played as silence because the application had no data ready.
    pub underflows: u64,
    /// Spans moved through the callback loop.
    pub spans_processed: u64,
    /// Reads that timed out.
    pub read_timeouts: u64,
}

/// Counters shared between a transport and its callback thread.
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    pub frames_transferred: AtomicU64,
    pub underflows: AtomicU64,
    pub spans_processed: AtomicU64,
    pub read_timeouts: AtomicU64,
}

impl SessionCounters {
    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_transferred: self.frames_transferred.load(Ordering::SeqCst),
            underflows: self.underflows.load(Ordering::SeqCst),
            spans_processed: self.spans_processed.load(Ordering::SeqCst),
            read_timeouts: self.read_timeouts.load(Ordering::SeqCst),
        }
    }

    /// Seeds the counters from a previous transport's statistics.
    pub fn restore(&self, stats: &SessionStats) {
        self.frames_transferred
            .store(stats.frames_transferred, Ordering::SeqCst);
        self.underflows.store(stats.underflows, Ordering::SeqCst);
        self.spans_processed
            .store(stats.spans_processed, Ordering::SeqCst);
        self.read_timeouts.store(stats.read_timeouts, Ordering::SeqCst);
    }
}
