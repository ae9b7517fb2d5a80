//! Error types for audio-stream-client.
//!
//! Errors are split into two categories:
//! - **Synchronous errors** ([`StreamError`]): returned to the caller of a
//!   renderer/capturer operation
//! - **Runtime events**: switch failures, underflows and recovery progress,
//!   surfaced via [`EventCallback`](crate::EventCallback)
//!
//! Collaborators have their own error types ([`ServerError`] for the audio
//! server, [`PolicyError`] for the policy service) which convert into
//! [`StreamError`] with `?`.

use std::time::Duration;

use crate::state::StreamState;

/// Coarse error class, used by callers that only need to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation invoked in an incompatible state. Never retried automatically.
    IllegalState,
    /// Malformed caller input. Correct and retry.
    InvalidParam,
    /// The transport or a collaborator call failed.
    TransportFailure,
    /// The backing coordination service is gone.
    ServiceDied,
    /// A bounded wait expired. Retry on the next cycle.
    Timeout,
    /// The requested item (buffer span, device, stream) is not available.
    NotFound,
}

/// Errors returned by [`Renderer`](crate::Renderer) and
/// [`Capturer`](crate::Capturer) operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The operation is not legal from the current state.
    #[error("{operation} not allowed in state {state}")]
    IllegalState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the stream was in.
        state: StreamState,
    },

    /// A stream switch is running; lifecycle calls fail fast until it ends.
    #[error("{operation} rejected: stream switch in progress")]
    SwitchInProgress {
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// The caller passed an invalid argument.
    #[error("invalid parameter: {reason}")]
    InvalidParam {
        /// What was wrong.
        reason: String,
    },

    /// The audio server rejected or failed an operation.
    #[error("transport {operation} failed: {source}")]
    Transport {
        /// Transport operation that failed.
        operation: &'static str,
        /// The underlying server error.
        #[source]
        source: ServerError,
    },

    /// An audio server error without operation context.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The policy service rejected or failed an operation.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// A bounded wait expired.
    #[error("{operation} timed out after {waited:?}")]
    Timeout {
        /// Operation that waited.
        operation: &'static str,
        /// How long it waited.
        waited: Duration,
    },

    /// Writing the PCM dump file failed.
    #[error("dump file error: {0}")]
    Io(#[from] std::io::Error),

    /// Nothing available right now (empty buffer queue, no transport).
    #[error("{what} not available")]
    NotFound {
        /// What was requested.
        what: &'static str,
    },
}

impl StreamError {
    /// Returns the error class.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IllegalState { .. } | Self::SwitchInProgress { .. } => ErrorKind::IllegalState,
            Self::InvalidParam { .. } => ErrorKind::InvalidParam,
            Self::Transport { source, .. } | Self::Server(source) => source.kind(),
            Self::Policy(PolicyError::ServiceDied) => ErrorKind::ServiceDied,
            Self::Policy(_) => ErrorKind::TransportFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Io(_) => ErrorKind::TransportFailure,
            Self::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    /// Creates an illegal-state error.
    pub fn illegal_state(operation: &'static str, state: StreamState) -> Self {
        Self::IllegalState { operation, state }
    }

    /// Creates an invalid-parameter error.
    pub fn invalid_param(reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            reason: reason.into(),
        }
    }

    /// Wraps a server error with the transport operation that produced it.
    pub fn transport(operation: &'static str, source: ServerError) -> Self {
        match source {
            ServerError::Timeout(waited) => Self::Timeout { operation, waited },
            source => Self::Transport { operation, source },
        }
    }
}

/// Errors reported by an [`AudioServer`](crate::server::AudioServer) and the
/// streams it hands out.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServerError {
    /// The server refused or failed the operation.
    #[error("{operation} failed: {reason}")]
    OperationFailed {
        /// Server operation that failed.
        operation: &'static str,
        /// Description of what went wrong.
        reason: String,
    },

    /// The server-side stream no longer exists.
    #[error("server stream released")]
    Released,

    /// The connection to the server was lost.
    #[error("server connection lost")]
    Disconnected,

    /// A blocking server call did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The server does not support the request.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An error from the underlying audio library (CPAL).
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl ServerError {
    /// Creates an operation-failed error.
    pub fn failed(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation,
            reason: reason.into(),
        }
    }

    /// Creates a backend error from anything displayable.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    /// Returns the error class.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Unsupported(_) => ErrorKind::InvalidParam,
            _ => ErrorKind::TransportFailure,
        }
    }
}

/// Errors reported by a [`PolicyService`](crate::policy::PolicyService).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The policy service is not reachable.
    #[error("policy service died")]
    ServiceDied,

    /// The service refused the request.
    #[error("{operation} rejected: {reason}")]
    Rejected {
        /// Policy call that was rejected.
        operation: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The referenced item is unknown to the service.
    #[error("not found: {0}")]
    NotFound(String),
}

impl PolicyError {
    /// Creates a rejected error.
    pub fn rejected(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Rejected {
            operation,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_state_display() {
        let err = StreamError::illegal_state("pause", StreamState::Prepared);
        assert_eq!(err.to_string(), "pause not allowed in state PREPARED");
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[test]
    fn test_switch_in_progress_is_illegal_state() {
        let err = StreamError::SwitchInProgress { operation: "start" };
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[test]
    fn test_server_error_conversion() {
        fn fails() -> Result<(), StreamError> {
            Err(ServerError::failed("start", "device busy"))?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert_eq!(err.to_string(), "start failed: device busy");
    }

    #[test]
    fn test_transport_timeout_maps_to_timeout() {
        let err = StreamError::transport("read", ServerError::Timeout(Duration::from_millis(5)));
        assert!(matches!(err, StreamError::Timeout { operation: "read", .. }));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_policy_service_died_kind() {
        let err: StreamError = PolicyError::ServiceDied.into();
        assert_eq!(err.kind(), ErrorKind::ServiceDied);

        let err: StreamError = PolicyError::rejected("activate", "focus denied").into();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert_eq!(err.to_string(), "activate rejected: focus denied");
    }

    #[test]
    fn test_backend_error() {
        let err = ServerError::backend("no device");
        assert_eq!(err.to_string(), "audio backend error: no device");
    }
}
