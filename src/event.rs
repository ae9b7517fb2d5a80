//! Runtime events and application callbacks.
//!
//! Events are notifications about stream behavior that do not belong to a
//! single call: state changes, focus interrupts, device changes, underflows,
//! asynchronous failures and recovery progress.

use std::sync::Arc;

use parking_lot::RwLock;

use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::info::DeviceInfo;
use crate::policy::InterruptEvent;
use crate::session::SessionId;
use crate::state::{ChangeSource, StreamState};
use crate::transport::TransportClass;

/// Runtime events emitted by a renderer or capturer.
///
/// # Example
///
/// ```
/// use audio_stream_client::StreamEvent;
///
/// fn handle_event(event: StreamEvent) {
///     match event {
///         StreamEvent::StateChanged { state, .. } => println!("now {state}"),
///         StreamEvent::Interrupt(interrupt) => println!("focus: {:?}", interrupt.hint),
///         StreamEvent::Error { kind, message } => eprintln!("{kind:?}: {message}"),
///         other => println!("{other:?}"),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The stream moved to a new state.
    StateChanged {
        /// The new state.
        state: StreamState,
        /// Whether the application or the stream itself caused the change.
        source: ChangeSource,
    },

    /// An audio-focus interrupt for this stream.
    ///
    /// Forced pauses, stops and ducks have already been applied when this
    /// arrives. A forced resume is delivered as a shared one: the
    /// application decides whether to call `start`.
    Interrupt(InterruptEvent),

    /// The active output device changed.
    DeviceChanged {
        /// The new device.
        device: DeviceInfo,
    },

    /// The transport played silence because no data was ready.
    Underflow {
        /// Total underflows since the stream was created.
        count: u64,
    },

    /// The stream moved to another transport.
    Switched {
        /// Previous transport class.
        from: TransportClass,
        /// New transport class.
        to: TransportClass,
        /// Session of the new transport.
        session: SessionId,
    },

    /// An asynchronous failure that left the stream in a state the
    /// application did not ask for.
    Error {
        /// Error class.
        kind: ErrorKind,
        /// Description.
        message: String,
    },

    /// The stream was restored after the policy service died.
    Restored {
        /// Attempts it took.
        attempts: u32,
    },
}

/// Callback type for receiving runtime events.
///
/// # Example
///
/// ```ignore
/// let renderer = Renderer::create(&ctx, options)?;
/// renderer.set_event_callback(event_callback(|event| {
///     tracing::warn!(?event, "stream event");
/// }));
/// ```
pub type EventCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Asks the application to fill (playback) or drain (capture) buffer-queue
/// spans. The argument is the number of bytes available.
pub type DataCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Called with the frame position a mark or period was reached at.
pub type PositionCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Called once per start when the first frame reaches the server, with the
/// stream latency in milliseconds.
pub type FirstFrameCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use audio_stream_client::{event_callback, StreamEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(StreamEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Creates a [`DataCallback`] from a closure.
pub fn data_callback<F>(f: F) -> DataCallback
where
    F: Fn(usize) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Creates a [`PositionCallback`] from a closure.
pub fn position_callback<F>(f: F) -> PositionCallback
where
    F: Fn(u64) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Creates an event callback that forwards into a bounded tokio channel.
///
/// Events are sent with `try_send` so the audio threads never block; when
/// the receiver falls behind, events are dropped.
///
/// # Example
///
/// ```
/// use audio_stream_client::event_channel;
///
/// let (callback, mut rx) = event_channel(64);
/// // renderer.set_event_callback(callback);
/// # drop(callback);
/// # assert!(rx.try_recv().is_err());
/// ```
pub fn event_channel(capacity: usize) -> (EventCallback, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    let callback = event_callback(move |event| {
        if let Err(err) = tx.try_send(event) {
            tracing::debug!("event channel dropped event: {err}");
        }
    });
    (callback, rx)
}

/// Holds the application's event callback and delivers events to it.
///
/// Shared between a stream and all of its transports so events keep
/// flowing across a transport switch.
#[derive(Default)]
pub(crate) struct EventHub {
    callback: RwLock<Option<EventCallback>>,
}

impl EventHub {
    pub fn set(&self, callback: Option<EventCallback>) {
        *self.callback.write() = callback;
    }

    pub fn emit(&self, event: StreamEvent) {
        // Clone out so the callback runs without the lock held.
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}
