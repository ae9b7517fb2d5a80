//! Buffer-queue engine.
//!
//! A fixed pool of spans circulates between the application and the
//! stream's callback thread through two FIFO queues:
//!
//! ```text
//!            playback                              capture
//!  app: get_buffer_desc ◄── free ◄─┐     app: get_buffer_desc ◄── filled ◄─┐
//!       fill, enqueue ──► filled ──┤          drain, enqueue ──► free ────┤
//!  loop: take_span ◄── filled      │     loop: take_span ◄── free          │
//!        write to server           │           read from server            │
//!        complete_span ──► free ───┘           complete_span ──► filled ───┘
//! ```
//!
//! Every span is always in exactly one of: the free queue, the filled
//! queue, or checked out by one side.

mod queue;

pub use queue::{BufferQueue, EnqueueError};
pub(crate) use queue::LoopSpan;

/// Status of one span.
///
/// A producer moves a span `Free → Writing → Done`; a consumer moves it
/// `Done → Reading → Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpanStatus {
    /// Empty and available to a producer.
    Free = 0,
    /// Held by the producer.
    Writing = 1,
    /// Holds data not yet consumed.
    Done = 2,
    /// Held by the consumer.
    Reading = 3,
}

impl SpanStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Writing,
            2 => Self::Done,
            3 => Self::Reading,
            _ => Self::Free,
        }
    }

    /// Returns `true` while one side holds the span.
    #[must_use]
    pub fn is_checked_out(self) -> bool {
        matches!(self, Self::Writing | Self::Reading)
    }
}

/// Which side of the queue the application is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    /// The application produces spans, the callback thread consumes them.
    Render,
    /// The callback thread produces spans, the application consumes them.
    Capture,
}

/// A span checked out to the application.
///
/// Obtained from [`BufferQueue::get_buffer_desc`] and handed back with
/// [`BufferQueue::enqueue`]. Owns the span storage while checked out.
#[derive(Debug)]
pub struct BufferDesc {
    pool_id: u64,
    index: usize,
    data: Box<[u8]>,
    /// Bytes of valid audio in `data`.
    ///
    /// A renderer sets this before enqueueing; for a capturer it holds the
    /// number of bytes captured.
    pub data_len: usize,
}

impl BufferDesc {
    /// Full span storage.
    pub fn buffer(&self) -> &[u8] {
        &self.data
    }

    /// Mutable span storage.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The valid audio bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_len.min(self.data.len())]
    }

    /// Span capacity in bytes. Fixed for the life of the pool.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Copies `bytes` into the span and sets `data_len`.
    ///
    /// Returns the number of bytes copied, at most the capacity.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.data_len = n;
        n
    }

    /// Position of this span in its pool.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Queue occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferQueueState {
    /// Spans waiting in the filled queue.
    pub filled: usize,
    /// Spans waiting in the free queue.
    pub free: usize,
    /// Spans checked out by the application or the callback thread.
    pub in_flight: usize,
}

impl BufferQueueState {
    /// Total spans accounted for.
    #[must_use]
    pub fn total(&self) -> usize {
        self.filled + self.free + self.in_flight
    }
}
