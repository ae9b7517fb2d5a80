//! Shared span ring of the low-latency process transport.
//!
//! Layout: a header with the read/write frame counters, one stream status
//! word and the server's latest handle position/time, followed by
//! `span_count` spans of `span_frames` frames. Every span carries its own
//! status word and timing stamps. Status words are the only
//! synchronization between client and server; the span bytes sit behind a
//! per-span mutex that is uncontended while statuses are respected.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::buffer::SpanStatus;

/// Lifecycle word shared by client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessStatus {
    /// Created, never started.
    Idle = 0,
    /// Start requested.
    Starting = 1,
    /// Both sides are moving data.
    Running = 2,
    /// Pause requested.
    Pausing = 3,
    /// Paused.
    Paused = 4,
    /// Stop requested.
    Stopping = 5,
    /// Stopped.
    Stopped = 6,
    /// Released.
    Released = 7,
    /// Unusable.
    Invalid = 8,
}

impl ProcessStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Pausing,
            4 => Self::Paused,
            5 => Self::Stopping,
            6 => Self::Stopped,
            7 => Self::Released,
            _ => Self::Invalid,
        }
    }
}

struct Header {
    cur_write_frame: AtomicU64,
    cur_read_frame: AtomicU64,
    status: AtomicU8,
    handle_pos: AtomicU64,
    handle_time: AtomicI64,
}

struct Span {
    status: AtomicU8,
    write_start: AtomicI64,
    write_done: AtomicI64,
    read_start: AtomicI64,
    read_done: AtomicI64,
    data: Mutex<Box<[u8]>>,
}

/// Which stamp of a span to set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStamp {
    /// Producer claimed the span.
    WriteStart,
    /// Producer released the span.
    WriteDone,
    /// Consumer claimed the span.
    ReadStart,
    /// Consumer released the span.
    ReadDone,
}

/// Span ring shared between a process transport and its server.
pub struct ProcessBuffer {
    span_frames: u64,
    frame_size: usize,
    header: Header,
    spans: Box<[Span]>,
}

impl ProcessBuffer {
    /// Allocates `span_count` zeroed spans of `span_frames` frames.
    pub fn new(span_frames: u64, span_count: usize, frame_size: usize) -> Self {
        let span_frames = span_frames.max(1);
        let span_bytes = span_frames as usize * frame_size;
        let spans = (0..span_count.max(1))
            .map(|_| Span {
                status: AtomicU8::new(SpanStatus::Free as u8),
                write_start: AtomicI64::new(0),
                write_done: AtomicI64::new(0),
                read_start: AtomicI64::new(0),
                read_done: AtomicI64::new(0),
                data: Mutex::new(vec![0u8; span_bytes].into_boxed_slice()),
            })
            .collect();
        Self {
            span_frames,
            frame_size,
            header: Header {
                cur_write_frame: AtomicU64::new(0),
                cur_read_frame: AtomicU64::new(0),
                status: AtomicU8::new(ProcessStatus::Idle as u8),
                handle_pos: AtomicU64::new(0),
                handle_time: AtomicI64::new(0),
            },
            spans,
        }
    }

    /// Frames per span.
    pub fn span_frames(&self) -> u64 {
        self.span_frames
    }

    /// Number of spans.
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Bytes per span.
    pub fn span_bytes(&self) -> usize {
        self.span_frames as usize * self.frame_size
    }

    /// Frames the whole ring holds.
    pub fn total_frames(&self) -> u64 {
        self.span_frames * self.spans.len() as u64
    }

    fn span(&self, frame: u64) -> &Span {
        let index = (frame / self.span_frames) as usize % self.spans.len();
        &self.spans[index]
    }

    /// Next frame the producer writes.
    pub fn cur_write_frame(&self) -> u64 {
        self.header.cur_write_frame.load(Ordering::Acquire)
    }

    /// Moves the producer's frame counter.
    pub fn set_cur_write_frame(&self, frame: u64) {
        self.header.cur_write_frame.store(frame, Ordering::Release);
    }

    /// Next frame the consumer reads.
    pub fn cur_read_frame(&self) -> u64 {
        self.header.cur_read_frame.load(Ordering::Acquire)
    }

    /// Moves the consumer's frame counter.
    pub fn set_cur_read_frame(&self, frame: u64) {
        self.header.cur_read_frame.store(frame, Ordering::Release);
    }

    /// Shared lifecycle word.
    pub fn status(&self) -> ProcessStatus {
        ProcessStatus::from_u8(self.header.status.load(Ordering::Acquire))
    }

    /// Sets the shared lifecycle word.
    pub fn set_status(&self, status: ProcessStatus) {
        self.header.status.store(status as u8, Ordering::Release);
    }

    /// Server's latest `(handle position, handle time)`.
    pub fn handle_info(&self) -> (u64, i64) {
        (
            self.header.handle_pos.load(Ordering::Acquire),
            self.header.handle_time.load(Ordering::Acquire),
        )
    }

    /// Publishes the server's handle position and time.
    pub fn set_handle_info(&self, position: u64, time: i64) {
        self.header.handle_time.store(time, Ordering::Release);
        self.header.handle_pos.store(position, Ordering::Release);
    }

    /// Status of the span containing `frame`.
    pub fn span_status(&self, frame: u64) -> SpanStatus {
        SpanStatus::from_u8(self.span(frame).status.load(Ordering::Acquire))
    }

    /// Atomically moves the span containing `frame` from `from` to `to`.
    pub fn try_transition(&self, frame: u64, from: SpanStatus, to: SpanStatus) -> bool {
        self.span(frame)
            .status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Sets the status of the span containing `frame` unconditionally.
    pub fn set_span_status(&self, frame: u64, status: SpanStatus) {
        self.span(frame).status.store(status as u8, Ordering::Release);
    }

    /// Records a timing stamp on the span containing `frame`.
    pub fn stamp(&self, frame: u64, stamp: SpanStamp, time: i64) {
        let span = self.span(frame);
        let field = match stamp {
            SpanStamp::WriteStart => &span.write_start,
            SpanStamp::WriteDone => &span.write_done,
            SpanStamp::ReadStart => &span.read_start,
            SpanStamp::ReadDone => &span.read_done,
        };
        field.store(time, Ordering::Release);
    }

    /// Producer time spent on the span containing `frame`.
    pub fn write_cost(&self, frame: u64) -> i64 {
        let span = self.span(frame);
        span.write_done.load(Ordering::Acquire) - span.write_start.load(Ordering::Acquire)
    }

    /// Consumer time spent on the span containing `frame`.
    pub fn read_cost(&self, frame: u64) -> i64 {
        let span = self.span(frame);
        span.read_done.load(Ordering::Acquire) - span.read_start.load(Ordering::Acquire)
    }

    /// Runs `f` on the bytes of the span containing `frame`.
    pub fn with_span<R>(&self, frame: u64, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.span(frame).data.lock();
        f(&mut data)
    }

    /// Marks every span free. Only safe while neither side is running.
    pub fn reset_spans(&self) {
        for span in self.spans.iter() {
            span.status.store(SpanStatus::Free as u8, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for ProcessBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBuffer")
            .field("span_frames", &self.span_frames)
            .field("span_count", &self.spans.len())
            .field("cur_write_frame", &self.cur_write_frame())
            .field("cur_read_frame", &self.cur_read_frame())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let buffer = ProcessBuffer::new(240, 4, 4);
        assert_eq!(buffer.span_bytes(), 960);
        assert_eq!(buffer.total_frames(), 960);
        assert_eq!(buffer.status(), ProcessStatus::Idle);
    }

    #[test]
    fn test_span_cas() {
        let buffer = ProcessBuffer::new(240, 4, 4);
        assert!(buffer.try_transition(0, SpanStatus::Free, SpanStatus::Writing));
        // A second producer cannot claim the same span.
        assert!(!buffer.try_transition(0, SpanStatus::Free, SpanStatus::Writing));
        assert_eq!(buffer.span_status(100), SpanStatus::Writing);
        buffer.set_span_status(0, SpanStatus::Done);
        assert!(buffer.try_transition(0, SpanStatus::Done, SpanStatus::Reading));
    }

    #[test]
    fn test_frames_wrap_to_spans() {
        let buffer = ProcessBuffer::new(240, 4, 4);
        buffer.set_span_status(0, SpanStatus::Done);
        // Frame 960 is span 0 again.
        assert_eq!(buffer.span_status(960), SpanStatus::Done);
        assert_eq!(buffer.span_status(240), SpanStatus::Free);
    }

    #[test]
    fn test_span_data_and_stamps() {
        let buffer = ProcessBuffer::new(2, 2, 2);
        buffer.with_span(2, |data| data.copy_from_slice(&[1, 2, 3, 4]));
        let copy = buffer.with_span(2, |data| data.to_vec());
        assert_eq!(copy, vec![1, 2, 3, 4]);

        buffer.stamp(2, SpanStamp::WriteStart, 100);
        buffer.stamp(2, SpanStamp::WriteDone, 350);
        assert_eq!(buffer.write_cost(2), 250);
    }

    #[test]
    fn test_handle_info() {
        let buffer = ProcessBuffer::new(240, 4, 4);
        buffer.set_handle_info(480, 1234);
        assert_eq!(buffer.handle_info(), (480, 1234));
    }
}
