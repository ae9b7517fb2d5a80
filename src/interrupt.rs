//! Client side of audio-focus interrupts.
//!
//! Shared interrupts reach the application untouched. Forced ones are acted
//! on first and then reported, so by the time the application sees a forced
//! pause the stream is already paused.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Weak;

use crate::event::StreamEvent;
use crate::policy::{InterruptEvent, InterruptForceType, InterruptHint};
use crate::state::StreamState;
use crate::stream::StreamCore;

/// Volume meaning "not ducked".
const NEUTRAL_VOLUME: f32 = 1.0;

/// Receives interrupt events for one stream.
///
/// Registered with the policy service per session. Holds only a weak
/// reference to its stream; events arriving after the stream is gone are
/// dropped.
pub(crate) struct InterruptHandler {
    core: Weak<StreamCore>,
    force_paused: AtomicBool,
    ducked: AtomicBool,
    pre_duck_volume: AtomicU32,
}

impl InterruptHandler {
    pub fn new(core: Weak<StreamCore>) -> Self {
        Self {
            core,
            force_paused: AtomicBool::new(false),
            ducked: AtomicBool::new(false),
            pre_duck_volume: AtomicU32::new(NEUTRAL_VOLUME.to_bits()),
        }
    }

    pub fn is_force_paused(&self) -> bool {
        self.force_paused.load(Ordering::SeqCst)
    }

    pub fn is_ducked(&self) -> bool {
        self.ducked.load(Ordering::SeqCst)
    }

    /// The application started the stream itself; a later forced resume
    /// has nothing to resume.
    pub fn on_client_start(&self) {
        self.force_paused.store(false, Ordering::SeqCst);
    }

    /// The application stopped or released the stream.
    pub fn on_client_stop(&self) {
        self.force_paused.store(false, Ordering::SeqCst);
    }

    pub fn handle(&self, event: InterruptEvent) {
        let Some(core) = self.core.upgrade() else {
            tracing::debug!(?event, "interrupt for a released stream, ignoring");
            return;
        };

        tracing::info!(
            session = ?core.session_id(),
            event_type = ?event.event_type,
            force_type = ?event.force_type,
            hint = ?event.hint,
            "audio interrupt"
        );

        if event.force_type == InterruptForceType::Share {
            core.emit(StreamEvent::Interrupt(event));
            return;
        }
        if !core.has_transport() {
            tracing::warn!(?event, "forced interrupt without a transport, ignoring");
            return;
        }

        let notify = match event.hint {
            InterruptHint::None => None,
            InterruptHint::Pause => self.force_pause(&core).then_some(event),
            InterruptHint::Resume => self.force_resume(&core).then(|| InterruptEvent {
                force_type: InterruptForceType::Share,
                ..event
            }),
            InterruptHint::Stop => {
                if let Err(err) = core.force_stop() {
                    tracing::warn!(%err, "forced stop failed");
                }
                self.force_paused.store(false, Ordering::SeqCst);
                Some(event)
            }
            InterruptHint::Duck => self.duck(&core, event.duck_volume).then_some(event),
            InterruptHint::Unduck => self.unduck(&core).then_some(event),
        };

        if let Some(event) = notify {
            core.emit(StreamEvent::Interrupt(event));
        }
    }

    fn force_pause(&self, core: &StreamCore) -> bool {
        match core.force_pause() {
            Ok(true) => {
                self.force_paused.store(true, Ordering::SeqCst);
                true
            }
            Ok(false) => {
                tracing::debug!(state = %core.state(), "forced pause while not running");
                false
            }
            Err(err) => {
                tracing::warn!(%err, "forced pause failed");
                false
            }
        }
    }

    /// Only a stream still sitting in the forced pause may be resumed.
    fn force_resume(&self, core: &StreamCore) -> bool {
        let was_paused = self.force_paused.swap(false, Ordering::SeqCst);
        if !was_paused {
            tracing::debug!("forced resume without a forced pause, ignoring");
            return false;
        }
        let state = core.state();
        if state != StreamState::Paused {
            tracing::debug!(%state, "forced resume for a stream that left the pause, ignoring");
            return false;
        }
        true
    }

    fn duck(&self, core: &StreamCore, factor: f32) -> bool {
        let factor = factor.clamp(0.0, 1.0);
        let pre_duck = if self.is_ducked() {
            f32::from_bits(self.pre_duck_volume.load(Ordering::SeqCst))
        } else {
            core.volume()
        };

        if let Err(err) = core.set_transport_volume(pre_duck * factor) {
            tracing::warn!(%err, factor, "duck failed, not notifying");
            return false;
        }
        if !self.ducked.swap(true, Ordering::SeqCst) {
            self.pre_duck_volume.store(pre_duck.to_bits(), Ordering::SeqCst);
        }
        true
    }

    fn unduck(&self, core: &StreamCore) -> bool {
        if !self.is_ducked() {
            tracing::debug!("unduck while not ducked, ignoring");
            return false;
        }
        let pre_duck = f32::from_bits(self.pre_duck_volume.load(Ordering::SeqCst));
        if let Err(err) = core.set_transport_volume(pre_duck) {
            tracing::warn!(%err, "unduck failed");
            return false;
        }
        self.ducked.store(false, Ordering::SeqCst);
        self.pre_duck_volume
            .store(NEUTRAL_VOLUME.to_bits(), Ordering::SeqCst);
        true
    }
}
