//! Hot swap of a stream's transport.
//!
//! The stream keeps its session-independent settings, position and
//! callbacks; only the transport class and the session id change. Any
//! failure after the old transport was touched produces exactly one
//! [`StreamEvent::Error`].

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{Control, StreamCore};
use crate::event::StreamEvent;
use crate::state::{ChangeSource, StreamState};
use crate::transport::{Transport, TransportClass};
use crate::StreamError;

impl StreamCore {
    /// Moves the stream to the low-latency transport or back.
    pub fn switch_stream(&self, low_latency: bool) -> Result<(), StreamError> {
        if self
            .switching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::SwitchInProgress {
                operation: "switch stream",
            });
        }

        let mut events = Vec::new();
        let result = self.switch_locked(TransportClass::for_low_latency(low_latency), &mut events);
        self.switching.store(false, Ordering::SeqCst);
        for event in events {
            self.emit(event);
        }
        result
    }

    fn switch_locked(
        &self,
        target: TransportClass,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), StreamError> {
        let mut control = self.lock_control();
        let state = self.state();
        let old = self.require_transport("switch stream")?;
        let from = old.class();

        if from == target {
            return Err(StreamError::invalid_param(format!(
                "stream already uses the {target} transport"
            )));
        }
        if target == TransportClass::Process && !self.ctx.server().supports_low_latency() {
            return Err(StreamError::invalid_param("server has no low-latency transport"));
        }
        if !matches!(
            state,
            StreamState::Prepared | StreamState::Running | StreamState::Paused | StreamState::Stopped
        ) {
            return Err(StreamError::illegal_state("switch stream", state));
        }

        tracing::info!(session = %old.session_id(), %from, to = %target, %state, "switching transport");
        let was_running = state == StreamState::Running;
        if was_running {
            old.stop()?;
        }

        let snapshot = old.snapshot();
        let old_frames = match old.position() {
            Ok((frames, _)) => frames,
            Err(err) => {
                tracing::warn!(%err, "no final position from the old transport");
                0
            }
        };

        let new = match Transport::create(target, &self.deps(&control), &snapshot) {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                tracing::error!(%err, to = %target, "could not create transport, keeping the old one");
                self.resume_old(&control, &old, was_running, events);
                return Err(self.switch_failed(target, err, events));
            }
        };

        if let Err(err) = old.release() {
            tracing::error!(%err, "could not release the old transport, dropping the new one");
            if let Err(err) = new.release() {
                tracing::warn!(%err, "releasing the new transport failed too");
            }
            self.resume_old(&control, &old, was_running, events);
            return Err(self.switch_failed(target, err, events));
        }

        let started = if was_running { new.start() } else { Ok(()) };
        let running = was_running && started.is_ok();
        self.adopt(&mut control, &old, &new, old_frames, running, state);

        match started {
            Ok(()) => {
                tracing::info!(session = %new.session_id(), %from, to = %target, "transport switched");
                events.push(StreamEvent::Switched {
                    from,
                    to: target,
                    session: new.session_id(),
                });
                Ok(())
            }
            Err(err) => {
                tracing::error!(session = %new.session_id(), %err, "new transport did not start");
                self.deactivate_best_effort(&self.record(&control, old.session_id()));
                self.state.store(StreamState::Stopped);
                self.update_tracker(&new, StreamState::Stopped);
                events.push(StreamEvent::StateChanged {
                    state: StreamState::Stopped,
                    source: ChangeSource::System,
                });
                Err(self.switch_failed(target, err, events))
            }
        }
    }

    /// Makes `new` the stream's transport and moves every per-session
    /// registration over from `old`.
    fn adopt(
        &self,
        control: &mut Control,
        old: &Transport,
        new: &Arc<Transport>,
        old_frames: u64,
        running: bool,
        state: StreamState,
    ) {
        let base = self.position_base.load(Ordering::SeqCst) + old_frames;
        self.publish(Some(Arc::clone(new)));
        self.position_base
            .store(base.max(self.tracker.last()), Ordering::SeqCst);

        self.register_callbacks(control, new.session_id());
        if running {
            self.deactivate_best_effort(&self.record(control, old.session_id()));
            let record = self.record(control, new.session_id());
            if let Err(err) = self.ctx.policy().activate_interrupt(&record) {
                tracing::warn!(session = %record.session_id, %err, "focus not moved to the new session");
            }
        }
        if new.tracker_registered() {
            self.register_tracker(new, state);
        }
    }

    /// Restarts the old transport after an aborted switch. If that fails
    /// too the stream ends up stopped.
    fn resume_old(
        &self,
        control: &Control,
        old: &Transport,
        was_running: bool,
        events: &mut Vec<StreamEvent>,
    ) {
        if !was_running {
            return;
        }
        if let Err(err) = old.start() {
            tracing::error!(session = %old.session_id(), %err, "old transport did not restart");
            self.deactivate_best_effort(&self.record(control, old.session_id()));
            self.state.store(StreamState::Stopped);
            self.update_tracker(old, StreamState::Stopped);
            events.push(StreamEvent::StateChanged {
                state: StreamState::Stopped,
                source: ChangeSource::System,
            });
        }
    }

    fn switch_failed(
        &self,
        target: TransportClass,
        err: StreamError,
        events: &mut Vec<StreamEvent>,
    ) -> StreamError {
        events.push(StreamEvent::Error {
            kind: err.kind(),
            message: format!("switch to the {target} transport failed: {err}"),
        });
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AudioContext;
    use crate::format::AudioStreamParams;
    use crate::info::{AppInfo, RendererInfo, StreamInfo};
    use crate::policy::MockPolicy;
    use crate::server::LoopbackServer;

    fn prepared(server: &LoopbackServer) -> Arc<StreamCore> {
        let ctx = AudioContext::new(server.clone(), MockPolicy::new());
        let core = StreamCore::new(
            ctx,
            StreamInfo::Renderer(RendererInfo::music()),
            AppInfo::default(),
        );
        core.set_params(AudioStreamParams::cd_quality()).unwrap();
        core
    }

    #[test]
    fn test_same_class_is_refused_without_event() {
        let server = LoopbackServer::new();
        let core = prepared(&server);
        let err = core.switch_stream(false).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidParam);
        assert!(!core.is_switching());
        core.release().unwrap();
    }

    #[test]
    fn test_prepared_switch_changes_session() {
        let server = LoopbackServer::new();
        let core = prepared(&server);
        let before = core.session_id().unwrap();
        core.switch_stream(true).unwrap();
        assert_eq!(core.transport_class(), Some(TransportClass::Process));
        assert_ne!(core.session_id(), Some(before));
        assert_eq!(core.state(), StreamState::Prepared);
        core.release().unwrap();
    }

    #[test]
    fn test_refused_without_low_latency_server() {
        let server = LoopbackServer::without_low_latency();
        let core = prepared(&server);
        assert!(core.switch_stream(true).is_err());
        assert_eq!(core.transport_class(), Some(TransportClass::Stream));
        core.release().unwrap();
    }
}
