//! Contract with the external policy service.
//!
//! The policy service arbitrates audio focus across all clients, tracks
//! stream state and owns device and volume policy. A stream only originates
//! and receives the protocol messages; decisions are made on the other side.

mod mock;

use std::sync::Arc;
use std::time::Duration;

use crate::info::{DeviceInfo, Direction, InterruptMode, StreamType};
use crate::session::SessionId;
use crate::state::StreamState;
use crate::PolicyError;

pub use mock::MockPolicy;

/// Begin or end of an interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptType {
    /// Another stream took focus.
    Begin,
    /// The other stream gave focus back.
    End,
}

/// Who acts on an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptForceType {
    /// The application decides.
    Share,
    /// The stream acts before notifying.
    Force,
}

/// What the arbitrator asks the stream to do.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptHint {
    None,
    Resume,
    Pause,
    Stop,
    Duck,
    Unduck,
}

/// An interrupt notification from the arbitrator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterruptEvent {
    /// Begin or end.
    pub event_type: InterruptType,
    /// Share or force.
    pub force_type: InterruptForceType,
    /// Requested action.
    pub hint: InterruptHint,
    /// Volume factor for [`InterruptHint::Duck`], in `0.0..=1.0`.
    pub duck_volume: f32,
}

impl InterruptEvent {
    /// Creates an event.
    pub fn new(
        event_type: InterruptType,
        force_type: InterruptForceType,
        hint: InterruptHint,
        duck_volume: f32,
    ) -> Self {
        Self {
            event_type,
            force_type,
            hint,
            duck_volume,
        }
    }
}

/// A session's claim on audio focus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterruptRecord {
    /// Claiming session.
    pub session_id: SessionId,
    /// Focus class.
    pub stream_type: StreamType,
    /// Share or independent focus.
    pub mode: InterruptMode,
    /// Pause instead of ducking.
    pub pause_when_ducked: bool,
    /// Owning process.
    pub pid: u32,
    /// Play alongside other streams instead of interrupting them.
    pub parallel_play: bool,
}

/// A device change reported by the policy service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChange {
    /// The active output device changed.
    OutputChanged(DeviceInfo),
    /// The stream should move to another transport class.
    RecreateStream {
        /// Target the low-latency transport.
        low_latency: bool,
    },
}

/// Stream-tracker entry reported on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamChangeInfo {
    /// Session.
    pub session_id: SessionId,
    /// Renderer or capturer.
    pub direction: Direction,
    /// Current state.
    pub state: StreamState,
    /// Owning user id.
    pub uid: u32,
    /// Focus class.
    pub stream_type: StreamType,
}

/// One segment of a tone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToneSegment {
    /// Frequencies played together, in Hz. Empty for silence.
    pub frequencies: Vec<u32>,
    /// Segment length.
    pub duration: Duration,
}

/// Tone definition for the tone-player collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToneDescriptor {
    /// Segments in play order.
    pub segments: Vec<ToneSegment>,
    /// How often the segment list repeats; 0 plays it once.
    pub repeat_count: u32,
}

/// Receives interrupt events for one session.
pub type InterruptCallback = Arc<dyn Fn(InterruptEvent) + Send + Sync>;

/// Called when the policy service connection is lost.
pub type ServiceDiedCallback = Arc<dyn Fn() + Send + Sync>;

/// Receives device changes for one session.
pub type DeviceChangeCallback = Arc<dyn Fn(DeviceChange) + Send + Sync>;

/// The focus arbitrator and policy service.
pub trait PolicyService: Send + Sync {
    /// Requests focus for `record`.
    fn activate_interrupt(&self, record: &InterruptRecord) -> Result<(), PolicyError>;

    /// Gives up focus held by `record`.
    fn deactivate_interrupt(&self, record: &InterruptRecord) -> Result<(), PolicyError>;

    /// Routes interrupt events for `session` to `callback`.
    fn set_interrupt_callback(
        &self,
        session: SessionId,
        callback: InterruptCallback,
    ) -> Result<(), PolicyError>;

    /// Stops routing interrupt events for `session`.
    fn unset_interrupt_callback(&self, session: SessionId) -> Result<(), PolicyError>;

    /// Registers a callback fired when the service dies.
    fn register_service_died_callback(&self, session: SessionId, callback: ServiceDiedCallback);

    /// Removes the service-died callback of `session`.
    fn unregister_service_died_callback(&self, session: SessionId);

    /// Routes device changes for `session` to `callback`.
    fn register_device_change_callback(&self, session: SessionId, callback: DeviceChangeCallback);

    /// Stops routing device changes for `session`.
    fn unregister_device_change_callback(&self, session: SessionId);

    /// Adds a stream to the tracker.
    fn register_tracker(&self, info: &StreamChangeInfo) -> Result<(), PolicyError>;

    /// Reports a state change of a tracked stream.
    fn update_tracker(&self, info: &StreamChangeInfo) -> Result<(), PolicyError>;

    /// Tone ids the tone player can play.
    fn supported_tones(&self) -> Result<Vec<i32>, PolicyError>;

    /// Definition of tone `id`.
    fn tone_config(&self, id: i32) -> Result<ToneDescriptor, PolicyError>;

    /// The active output device.
    fn active_output_device(&self) -> Result<DeviceInfo, PolicyError>;

    /// Sets the system volume level of a focus class.
    fn set_system_volume_level(&self, stream_type: StreamType, level: i32)
        -> Result<(), PolicyError>;

    /// System volume of a focus class at `level`, in dB.
    fn system_volume_db(&self, stream_type: StreamType, level: i32) -> Result<f32, PolicyError>;
}
