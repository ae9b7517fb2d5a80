//! Stream lifecycle states and the legal transition graph.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a renderer or capturer stream.
///
/// ```text
/// NEW ──prepare──► PREPARED ──start──► RUNNING ──pause──► PAUSED
///                     ▲                  │  ▲               │
///                     │                  │  └────start──────┤
///                     │                stop                stop
///                     │                  ▼                  │
///                     └──── STOPPED ◄────┴──────────────────┘
///                              │ start ─► RUNNING
///
/// any state except NEW/RELEASED ──release──► RELEASED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum StreamState {
    /// Created, stream parameters not negotiated yet.
    #[default]
    New = 0,
    /// Parameters negotiated with the transport; ready to start.
    Prepared = 1,
    /// Data is flowing.
    Running = 2,
    /// Data flow suspended; queued data is kept.
    Paused = 3,
    /// Transient state while the transport is being stopped.
    Stopping = 4,
    /// Data flow stopped.
    Stopped = 5,
    /// All resources given back. Terminal.
    Released = 6,
    /// The backing transport is gone or unusable.
    Invalid = 7,
}

impl StreamState {
    /// Every state, in declaration order.
    pub const ALL: [StreamState; 8] = [
        StreamState::New,
        StreamState::Prepared,
        StreamState::Running,
        StreamState::Paused,
        StreamState::Stopping,
        StreamState::Stopped,
        StreamState::Released,
        StreamState::Invalid,
    ];

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Prepared,
            2 => Self::Running,
            3 => Self::Paused,
            4 => Self::Stopping,
            5 => Self::Stopped,
            6 => Self::Released,
            _ => Self::Invalid,
        }
    }

    /// Returns the state reached by applying `command`, or `None` if the
    /// command is not legal from this state.
    #[must_use]
    pub fn next(self, command: StateCommand) -> Option<StreamState> {
        use StateCommand as C;
        use StreamState as S;

        match (self, command) {
            (S::New, C::Prepare) => Some(S::Prepared),
            (S::Prepared | S::Stopped | S::Paused, C::Start) => Some(S::Running),
            (S::Running, C::Pause) => Some(S::Paused),
            (S::Running | S::Paused, C::Stop) => Some(S::Stopped),
            (S::New | S::Released, C::Release) => None,
            (_, C::Release) => Some(S::Released),
            _ => None,
        }
    }

    /// Returns `true` if `command` is legal from this state.
    #[must_use]
    pub fn allows(self, command: StateCommand) -> bool {
        self.next(command).is_some()
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Prepared => "PREPARED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Released => "RELEASED",
            Self::Invalid => "INVALID",
        };
        f.write_str(name)
    }
}

/// A lifecycle command applied to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateCommand {
    /// Stream parameters were negotiated.
    Prepare,
    /// Begin or resume data flow.
    Start,
    /// Suspend data flow.
    Pause,
    /// Stop data flow.
    Stop,
    /// Tear everything down.
    Release,
}

impl StateCommand {
    /// Every command, in declaration order.
    pub const ALL: [StateCommand; 5] = [
        StateCommand::Prepare,
        StateCommand::Start,
        StateCommand::Pause,
        StateCommand::Stop,
        StateCommand::Release,
    ];

    /// Name used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Release => "release",
        }
    }
}

/// Who requested a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeSource {
    /// The application called a lifecycle method.
    #[default]
    Client,
    /// The stream acted on its own (forced interrupt, switch, recovery).
    System,
}

/// Lock-free cell holding a [`StreamState`].
///
/// Written only under the stream's control lock; read from anywhere,
/// including while a stream switch holds that lock.
#[derive(Debug, Default)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(state: StreamState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let s = StreamState::New;
        let s = s.next(StateCommand::Prepare).unwrap();
        assert_eq!(s, StreamState::Prepared);
        let s = s.next(StateCommand::Start).unwrap();
        assert_eq!(s, StreamState::Running);
        let s = s.next(StateCommand::Pause).unwrap();
        assert_eq!(s, StreamState::Paused);
        let s = s.next(StateCommand::Start).unwrap();
        let s = s.next(StateCommand::Stop).unwrap();
        assert_eq!(s, StreamState::Stopped);
        let s = s.next(StateCommand::Release).unwrap();
        assert_eq!(s, StreamState::Released);
    }

    #[test]
    fn test_pause_requires_running() {
        for state in StreamState::ALL {
            let expected = state == StreamState::Running;
            assert_eq!(state.allows(StateCommand::Pause), expected, "{state}");
        }
    }

    #[test]
    fn test_release_not_from_new_or_released() {
        assert!(!StreamState::New.allows(StateCommand::Release));
        assert!(!StreamState::Released.allows(StateCommand::Release));
        assert!(StreamState::Invalid.allows(StateCommand::Release));
        assert!(StreamState::Stopping.allows(StateCommand::Release));
    }

    #[test]
    fn test_graph_closure() {
        // Every (state, command) pair either has exactly one successor or none.
        for state in StreamState::ALL {
            for command in StateCommand::ALL {
                if let Some(next) = state.next(command) {
                    assert_ne!(next, StreamState::New, "{state} --{command:?}--> NEW");
                    assert_ne!(next, StreamState::Stopping);
                    assert_ne!(next, StreamState::Invalid);
                }
            }
        }
        // Released is terminal.
        for command in StateCommand::ALL {
            assert!(StreamState::Released.next(command).is_none());
        }
    }

    #[test]
    fn test_atomic_state_round_trip() {
        let cell = AtomicState::new(StreamState::New);
        for state in StreamState::ALL {
            cell.store(state);
            assert_eq!(cell.load(), state);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(StreamState::Running.to_string(), "RUNNING");
        assert_eq!(StreamState::Released.to_string(), "RELEASED");
    }
}
