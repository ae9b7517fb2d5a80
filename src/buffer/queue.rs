//! Span pool with free/filled FIFO queues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use super::{BufferDesc, BufferQueueState, QueueRole, SpanStatus};
use crate::StreamError;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed pool of audio spans exchanged between the application and a
/// stream's callback thread.
///
/// Application-side calls ([`get_buffer_desc`](Self::get_buffer_desc),
/// [`enqueue`](Self::enqueue)) never block. The callback thread waits for
/// spans with a bounded timeout so it can re-check whether it should keep
/// running.
pub struct BufferQueue {
    pool_id: u64,
    role: QueueRole,
    span_capacity: usize,
    span_count: usize,
    inner: Mutex<QueueInner>,
    ready: Condvar,
}

struct QueueInner {
    free: HeapRb<usize>,
    filled: HeapRb<usize>,
    slots: Vec<Slot>,
}

struct Slot {
    status: SpanStatus,
    holder: Holder,
    data: Option<Box<[u8]>>,
    len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    None,
    App,
    Loop,
}

/// A span checked out to the callback thread.
pub(crate) struct LoopSpan {
    index: usize,
    pub data: Box<[u8]>,
    pub len: usize,
}

/// A span handed back to [`BufferQueue::enqueue`] that the queue refused.
///
/// The span is returned so it can be enqueued where it belongs.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct EnqueueError {
    error: StreamError,
    desc: BufferDesc,
}

impl EnqueueError {
    /// Why the span was refused.
    pub fn error(&self) -> &StreamError {
        &self.error
    }

    /// Takes the refused span back.
    pub fn into_desc(self) -> BufferDesc {
        self.desc
    }
}

impl From<EnqueueError> for StreamError {
    fn from(err: EnqueueError) -> Self {
        err.error
    }
}

impl BufferQueue {
    /// Allocates `span_count` zeroed spans of `span_capacity` bytes, all free.
    pub fn new(role: QueueRole, span_count: usize, span_capacity: usize) -> Self {
        let span_count = span_count.max(1);
        let mut free = HeapRb::<usize>::new(span_count);
        let filled = HeapRb::<usize>::new(span_count);

        let slots = (0..span_count)
            .map(|index| {
                let pushed = free.try_push(index);
                debug_assert!(pushed.is_ok(), "free ring sized to the span count");
                Slot {
                    status: SpanStatus::Free,
                    holder: Holder::None,
                    data: Some(vec![0u8; span_capacity].into_boxed_slice()),
                    len: 0,
                }
            })
            .collect();

        let pool_id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(pool_id, ?role, span_count, span_capacity, "buffer queue allocated");

        Self {
            pool_id,
            role,
            span_capacity,
            span_count,
            inner: Mutex::new(QueueInner {
                free,
                filled,
                slots,
            }),
            ready: Condvar::new(),
        }
    }

    /// Which side the application is on.
    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// Capacity of every span in bytes.
    pub fn span_capacity(&self) -> usize {
        self.span_capacity
    }

    /// Number of spans in the pool.
    pub fn span_count(&self) -> usize {
        self.span_count
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock()
    }

    /// Checks out the next span for the application.
    ///
    /// A renderer gets an empty span to fill; a capturer gets the oldest
    /// span of captured data.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NotFound`] when no span is ready. Never blocks.
    pub fn get_buffer_desc(&self) -> Result<BufferDesc, StreamError> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let (queue, next_status) = match self.role {
            QueueRole::Render => (&mut inner.free, SpanStatus::Writing),
            QueueRole::Capture => (&mut inner.filled, SpanStatus::Reading),
        };
        let index = queue.try_pop().ok_or(StreamError::NotFound {
            what: "buffer span",
        })?;

        let slot = &mut inner.slots[index];
        let data = slot.data.take().unwrap_or_default();
        slot.status = next_status;
        slot.holder = Holder::App;

        let data_len = match self.role {
            QueueRole::Render => 0,
            QueueRole::Capture => slot.len,
        };
        Ok(BufferDesc {
            pool_id: self.pool_id,
            index,
            data,
            data_len,
        })
    }

    /// Returns a span checked out with [`get_buffer_desc`](Self::get_buffer_desc).
    ///
    /// A renderer's span moves to the filled queue for playback; a
    /// capturer's span goes back to the free queue. Wakes the callback
    /// thread.
    ///
    /// # Errors
    ///
    /// Refuses spans from another pool, spans not currently checked out by
    /// the application, and renderer spans whose `data_len` exceeds the
    /// capacity. The refused span is returned inside the error.
    pub fn enqueue(&self, desc: BufferDesc) -> Result<(), EnqueueError> {
        if desc.pool_id != self.pool_id {
            return Err(EnqueueError {
                error: StreamError::invalid_param("span belongs to another buffer queue"),
                desc,
            });
        }
        if self.role == QueueRole::Render && desc.data_len > desc.data.len() {
            return Err(EnqueueError {
                error: StreamError::invalid_param(format!(
                    "data_len {} exceeds span capacity {}",
                    desc.data_len,
                    desc.data.len()
                )),
                desc,
            });
        }

        let mut guard = self.lock();
        let inner = &mut *guard;

        let checked_out = inner
            .slots
            .get(desc.index)
            .is_some_and(|slot| slot.holder == Holder::App && slot.data.is_none());
        if !checked_out {
            return Err(EnqueueError {
                error: StreamError::invalid_param("span is not checked out"),
                desc,
            });
        }

        let BufferDesc {
            index,
            data,
            data_len,
            ..
        } = desc;
        let slot = &mut inner.slots[index];
        slot.data = Some(data);
        slot.holder = Holder::None;

        let pushed = match self.role {
            QueueRole::Render => {
                slot.status = SpanStatus::Done;
                slot.len = data_len;
                inner.filled.try_push(index)
            }
            QueueRole::Capture => {
                slot.status = SpanStatus::Free;
                slot.len = 0;
                inner.free.try_push(index)
            }
        };
        if pushed.is_err() {
            tracing::error!(pool_id = self.pool_id, index, "buffer queue overfull");
        }
        drop(guard);

        self.ready.notify_all();
        Ok(())
    }

    /// Moves every filled span back to the free queue, discarding its data.
    pub fn clear(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut cleared = 0usize;
        while let Some(index) = inner.filled.try_pop() {
            let slot = &mut inner.slots[index];
            slot.status = SpanStatus::Free;
            slot.len = 0;
            if inner.free.try_push(index).is_err() {
                tracing::error!(pool_id = self.pool_id, index, "buffer queue overfull");
            }
            cleared += 1;
        }
        drop(guard);

        if cleared > 0 {
            tracing::debug!(pool_id = self.pool_id, cleared, "buffer queue cleared");
        }
        self.ready.notify_all();
    }

    /// Occupancy of both queues and the spans checked out.
    pub fn state(&self) -> BufferQueueState {
        let inner = self.lock();
        BufferQueueState {
            filled: inner.filled.occupied_len(),
            free: inner.free.occupied_len(),
            in_flight: inner
                .slots
                .iter()
                .filter(|slot| slot.holder != Holder::None)
                .count(),
        }
    }

    /// Spans the application is waiting on.
    ///
    /// For a renderer, spans queued for playback; for a capturer, spans
    /// available to capture into.
    pub fn pending(&self) -> usize {
        let state = self.state();
        match self.role {
            QueueRole::Render => state.filled,
            QueueRole::Capture => state.free,
        }
    }

    /// Checks out the next span for the callback thread, waiting at most
    /// `timeout` when none is ready.
    pub(crate) fn take_span(&self, timeout: Duration) -> Option<LoopSpan> {
        let mut guard = self.lock();
        if self.loop_queue_len(&guard) == 0 {
            self.ready.wait_for(&mut guard, timeout);
        }
        self.pop_loop_span(&mut guard)
    }

    /// Checks out the next span for the callback thread without waiting.
    pub(crate) fn try_take_span(&self) -> Option<LoopSpan> {
        let mut guard = self.lock();
        self.pop_loop_span(&mut guard)
    }

    fn loop_queue_len(&self, inner: &QueueInner) -> usize {
        match self.role {
            QueueRole::Render => inner.filled.occupied_len(),
            QueueRole::Capture => inner.free.occupied_len(),
        }
    }

    fn pop_loop_span(&self, inner: &mut QueueInner) -> Option<LoopSpan> {
        let (index, next_status) = match self.role {
            QueueRole::Render => (inner.filled.try_pop()?, SpanStatus::Reading),
            QueueRole::Capture => (inner.free.try_pop()?, SpanStatus::Writing),
        };
        let slot = &mut inner.slots[index];
        slot.status = next_status;
        slot.holder = Holder::Loop;
        Some(LoopSpan {
            index,
            data: slot.data.take().unwrap_or_default(),
            len: match self.role {
                QueueRole::Render => slot.len,
                QueueRole::Capture => 0,
            },
        })
    }

    /// Returns a span the callback thread finished with.
    ///
    /// A rendered span goes back to free; a captured span holding `len`
    /// bytes goes to filled.
    pub(crate) fn complete_span(&self, span: LoopSpan) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let LoopSpan { index, data, len } = span;
        let slot = &mut inner.slots[index];
        slot.data = Some(data);
        slot.holder = Holder::None;

        let pushed = match self.role {
            QueueRole::Render => {
                slot.status = SpanStatus::Free;
                slot.len = 0;
                inner.free.try_push(index)
            }
            QueueRole::Capture => {
                slot.status = SpanStatus::Done;
                slot.len = len;
                inner.filled.try_push(index)
            }
        };
        if pushed.is_err() {
            tracing::error!(pool_id = self.pool_id, index, "buffer queue overfull");
        }
        drop(guard);
        self.ready.notify_all();
    }

    /// Puts back a capture span the callback thread could not fill.
    pub(crate) fn abandon_span(&self, span: LoopSpan) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let LoopSpan { index, data, .. } = span;
        let slot = &mut inner.slots[index];
        slot.data = Some(data);
        slot.holder = Holder::None;
        slot.status = SpanStatus::Free;
        slot.len = 0;
        if inner.free.try_push(index).is_err() {
            tracing::error!(pool_id = self.pool_id, index, "buffer queue overfull");
        }
    }

    /// Wakes a callback thread blocked in [`take_span`](Self::take_span).
    pub(crate) fn wake(&self) {
        self.ready.notify_all();
    }
}

impl std::fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferQueue")
            .field("pool_id", &self.pool_id)
            .field("role", &self.role)
            .field("span_capacity", &self.span_capacity)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_conserved(queue: &BufferQueue) {
        assert_eq!(queue.state().total(), queue.span_count());
    }

    #[test]
    fn test_render_round_trip() {
        let queue = BufferQueue::new(QueueRole::Render, 4, 16);
        assert_eq!(queue.state().free, 4);

        let mut desc = queue.get_buffer_desc().unwrap();
        assert_eq!(desc.capacity(), 16);
        assert_eq!(queue.state().in_flight, 1);
        desc.fill_from(&[1, 2, 3, 4]);
        queue.enqueue(desc).unwrap();
        assert_eq!(queue.pending(), 1);

        let span = queue.try_take_span().unwrap();
        assert_eq!(span.len, 4);
        assert_eq!(&span.data[..4], &[1, 2, 3, 4]);
        assert_conserved(&queue);
        queue.complete_span(span);

        assert_eq!(queue.state().free, 4);
        assert_conserved(&queue);
    }

    #[test]
    fn test_empty_queue_is_not_found() {
        let queue = BufferQueue::new(QueueRole::Render, 2, 8);
        let _a = queue.get_buffer_desc().unwrap();
        let _b = queue.get_buffer_desc().unwrap();
        let err = queue.get_buffer_desc().unwrap_err();
        assert!(matches!(err, StreamError::NotFound { .. }));
    }

    #[test]
    fn test_capture_app_gets_filled_spans() {
        let queue = BufferQueue::new(QueueRole::Capture, 3, 8);
        assert!(queue.get_buffer_desc().is_err());

        let mut span = queue.try_take_span().unwrap();
        span.data[..3].copy_from_slice(&[9, 8, 7]);
        span.len = 3;
        queue.complete_span(span);

        let desc = queue.get_buffer_desc().unwrap();
        assert_eq!(desc.data(), &[9, 8, 7]);
        queue.enqueue(desc).unwrap();
        assert_eq!(queue.state().free, 3);
    }

    #[test]
    fn test_foreign_span_is_returned() {
        let a = BufferQueue::new(QueueRole::Render, 2, 8);
        let b = BufferQueue::new(QueueRole::Render, 2, 8);
        let desc = a.get_buffer_desc().unwrap();

        let err = b.enqueue(desc).unwrap_err();
        assert!(matches!(err.error(), StreamError::InvalidParam { .. }));
        assert_conserved(&b);

        // The refused span still goes home.
        a.enqueue(err.into_desc()).unwrap();
        assert_conserved(&a);
        assert_eq!(a.state().filled, 1);
    }

    #[test]
    fn test_oversized_data_len_refused() {
        let queue = BufferQueue::new(QueueRole::Render, 1, 8);
        let mut desc = queue.get_buffer_desc().unwrap();
        desc.data_len = 9;
        let err = queue.enqueue(desc).unwrap_err();
        let mut desc = err.into_desc();
        desc.data_len = 8;
        queue.enqueue(desc).unwrap();
    }

    #[test]
    fn test_fifo_order() {
        let queue = BufferQueue::new(QueueRole::Render, 3, 4);
        for value in 1..=3u8 {
            let mut desc = queue.get_buffer_desc().unwrap();
            desc.fill_from(&[value]);
            queue.enqueue(desc).unwrap();
        }
        for value in 1..=3u8 {
            let span = queue.try_take_span().unwrap();
            assert_eq!(span.data[0], value);
            queue.complete_span(span);
        }
    }

    #[test]
    fn test_clear_moves_filled_to_free() {
        let queue = BufferQueue::new(QueueRole::Render, 4, 4);
        for _ in 0..3 {
            let mut desc = queue.get_buffer_desc().unwrap();
            desc.data_len = 4;
            queue.enqueue(desc).unwrap();
        }
        assert_eq!(queue.state().filled, 3);
        queue.clear();
        let state = queue.state();
        assert_eq!(state.filled, 0);
        assert_eq!(state.free, 4);
    }

    #[test]
    fn test_take_span_times_out() {
        let queue = BufferQueue::new(QueueRole::Render, 2, 4);
        let start = std::time::Instant::now();
        assert!(queue.take_span(Duration::from_millis(10)).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_take_span_woken_by_enqueue() {
        let queue = std::sync::Arc::new(BufferQueue::new(QueueRole::Render, 2, 4));
        let producer = std::sync::Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            let mut desc = producer.get_buffer_desc().unwrap();
            desc.data_len = 2;
            producer.enqueue(desc).unwrap();
        });
        let span = queue.take_span(Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(span.map(|s| s.len), Some(2));
    }

    #[test]
    fn test_abandon_returns_capture_span() {
        let queue = BufferQueue::new(QueueRole::Capture, 2, 4);
        let span = queue.try_take_span().unwrap();
        queue.abandon_span(span);
        assert_eq!(queue.state().free, 2);
        assert_conserved(&queue);
    }
}
