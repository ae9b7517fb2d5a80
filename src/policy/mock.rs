//! In-process policy service for testing without the system service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::{
    DeviceChange, DeviceChangeCallback, InterruptCallback, InterruptEvent, InterruptRecord,
    PolicyService, ServiceDiedCallback, StreamChangeInfo, ToneDescriptor, ToneSegment,
};
use crate::info::{DeviceInfo, DeviceType, StreamType};
use crate::session::SessionId;
use crate::PolicyError;

/// Highest system volume level.
const MAX_VOLUME_LEVEL: i32 = 15;

/// DTMF row/column frequencies for digits 0-9.
const DTMF: [(u32, u32); 10] = [
    (941, 1336),
    (697, 1209),
    (697, 1336),
    (697, 1477),
    (770, 1209),
    (770, 1336),
    (770, 1477),
    (852, 1209),
    (852, 1336),
    (852, 1477),
];

const DTMF_TONE_DURATION: Duration = Duration::from_millis(100);

/// A policy service that records every call and lets tests inject
/// interrupts, device changes and service death.
///
/// Focus is never arbitrated: every activation is granted unless
/// [`set_fail_activate`](Self::set_fail_activate) is on. Callbacks are invoked
/// on the calling thread, outside the mock's lock.
///
/// # Example
///
/// ```
/// use audio_stream_client::policy::MockPolicy;
///
/// let policy = MockPolicy::new();
/// assert_eq!(policy.activations(), 0);
/// policy.simulate_service_died();
/// assert!(policy.is_dead());
/// policy.revive();
/// ```
#[derive(Clone, Default)]
pub struct MockPolicy {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    dead: AtomicBool,
    fail_activate: AtomicBool,
    fail_deactivate: AtomicBool,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    active: Vec<InterruptRecord>,
    activations: u32,
    deactivations: u32,
    interrupt_callbacks: HashMap<SessionId, InterruptCallback>,
    died_callbacks: HashMap<SessionId, ServiceDiedCallback>,
    device_callbacks: HashMap<SessionId, DeviceChangeCallback>,
    trackers: HashMap<SessionId, StreamChangeInfo>,
    tracker_updates: u32,
    volume_levels: HashMap<StreamType, i32>,
    output_device: DeviceInfo,
}

impl MockPolicy {
    /// Creates a live policy service with a speaker as output device.
    pub fn new() -> Self {
        let policy = Self::default();
        policy.lock().output_device = DeviceInfo::new(1, "Speaker", DeviceType::Speaker);
        policy
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.inner.state.lock()
    }

    fn ensure_alive(&self) -> Result<(), PolicyError> {
        if self.is_dead() {
            Err(PolicyError::ServiceDied)
        } else {
            Ok(())
        }
    }

    /// Delivers an interrupt event to `session`.
    ///
    /// Returns `false` if no interrupt callback is set for it.
    pub fn deliver_interrupt(&self, session: SessionId, event: InterruptEvent) -> bool {
        let callback = self.lock().interrupt_callbacks.get(&session).cloned();
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }

    /// Marks the service dead and fires every service-died callback.
    ///
    /// All calls fail with [`PolicyError::ServiceDied`] until
    /// [`revive`](Self::revive).
    pub fn simulate_service_died(&self) {
        self.inner.dead.store(true, Ordering::SeqCst);
        let callbacks: Vec<ServiceDiedCallback> = {
            let mut state = self.lock();
            state.active.clear();
            state.interrupt_callbacks.clear();
            state.died_callbacks.values().cloned().collect()
        };
        tracing::info!(callbacks = callbacks.len(), "mock policy service died");
        for callback in callbacks {
            callback();
        }
    }

    /// Brings a dead service back.
    pub fn revive(&self) {
        self.inner.dead.store(false, Ordering::SeqCst);
    }

    /// Whether the service is dead.
    pub fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::SeqCst)
    }

    /// Delivers a device change to `session`.
    ///
    /// Returns `false` if no device-change callback is registered for it.
    pub fn change_device(&self, session: SessionId, change: DeviceChange) -> bool {
        let callback = {
            let mut state = self.lock();
            if let DeviceChange::OutputChanged(device) = &change {
                state.output_device = device.clone();
            }
            state.device_callbacks.get(&session).cloned()
        };
        match callback {
            Some(callback) => {
                callback(change);
                true
            }
            None => false,
        }
    }

    /// Makes focus activation fail.
    pub fn set_fail_activate(&self, fail: bool) {
        self.inner.fail_activate.store(fail, Ordering::SeqCst);
    }

    /// Makes focus deactivation fail.
    pub fn set_fail_deactivate(&self, fail: bool) {
        self.inner.fail_deactivate.store(fail, Ordering::SeqCst);
    }

    /// Successful activations so far.
    pub fn activations(&self) -> u32 {
        self.lock().activations
    }

    /// Successful deactivations so far.
    pub fn deactivations(&self) -> u32 {
        self.lock().deactivations
    }

    /// Records currently holding focus.
    pub fn active_records(&self) -> Vec<InterruptRecord> {
        self.lock().active.clone()
    }

    /// Whether `session` currently holds focus.
    pub fn is_active(&self, session: SessionId) -> bool {
        self.lock().active.iter().any(|r| r.session_id == session)
    }

    /// Whether an interrupt callback is set for `session`.
    pub fn has_interrupt_callback(&self, session: SessionId) -> bool {
        self.lock().interrupt_callbacks.contains_key(&session)
    }

    /// Whether a service-died callback is registered for `session`.
    pub fn has_service_died_callback(&self, session: SessionId) -> bool {
        self.lock().died_callbacks.contains_key(&session)
    }

    /// Whether a device-change callback is registered for `session`.
    pub fn has_device_change_callback(&self, session: SessionId) -> bool {
        self.lock().device_callbacks.contains_key(&session)
    }

    /// Latest tracker entry of `session`.
    pub fn tracker(&self, session: SessionId) -> Option<StreamChangeInfo> {
        self.lock().trackers.get(&session).copied()
    }

    /// Tracker updates received so far.
    pub fn tracker_updates(&self) -> u32 {
        self.lock().tracker_updates
    }
}

impl std::fmt::Debug for MockPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockPolicy")
            .field("dead", &self.is_dead())
            .field("active", &state.active.len())
            .field("activations", &state.activations)
            .finish_non_exhaustive()
    }
}

impl PolicyService for MockPolicy {
    fn activate_interrupt(&self, record: &InterruptRecord) -> Result<(), PolicyError> {
        self.ensure_alive()?;
        if self.inner.fail_activate.load(Ordering::SeqCst) {
            return Err(PolicyError::rejected("activate interrupt", "focus denied"));
        }
        let mut state = self.lock();
        state.active.retain(|r| r.session_id != record.session_id);
        state.active.push(*record);
        state.activations += 1;
        tracing::debug!(session = %record.session_id, stream_type = ?record.stream_type, "focus granted");
        Ok(())
    }

    fn deactivate_interrupt(&self, record: &InterruptRecord) -> Result<(), PolicyError> {
        self.ensure_alive()?;
        if self.inner.fail_deactivate.load(Ordering::SeqCst) {
            return Err(PolicyError::rejected("deactivate interrupt", "injected fault"));
        }
        let mut state = self.lock();
        state.active.retain(|r| r.session_id != record.session_id);
        state.deactivations += 1;
        Ok(())
    }

    fn set_interrupt_callback(
        &self,
        session: SessionId,
        callback: InterruptCallback,
    ) -> Result<(), PolicyError> {
        self.ensure_alive()?;
        self.lock().interrupt_callbacks.insert(session, callback);
        Ok(())
    }

    fn unset_interrupt_callback(&self, session: SessionId) -> Result<(), PolicyError> {
        self.ensure_alive()?;
        self.lock()
            .interrupt_callbacks
            .remove(&session)
            .map(|_| ())
            .ok_or_else(|| PolicyError::NotFound(format!("interrupt callback of {session}")))
    }

    fn register_service_died_callback(&self, session: SessionId, callback: ServiceDiedCallback) {
        self.lock().died_callbacks.insert(session, callback);
    }

    fn unregister_service_died_callback(&self, session: SessionId) {
        self.lock().died_callbacks.remove(&session);
    }

    fn register_device_change_callback(&self, session: SessionId, callback: DeviceChangeCallback) {
        self.lock().device_callbacks.insert(session, callback);
    }

    fn unregister_device_change_callback(&self, session: SessionId) {
        self.lock().device_callbacks.remove(&session);
    }

    fn register_tracker(&self, info: &StreamChangeInfo) -> Result<(), PolicyError> {
        self.ensure_alive()?;
        self.lock().trackers.insert(info.session_id, *info);
        Ok(())
    }

    fn update_tracker(&self, info: &StreamChangeInfo) -> Result<(), PolicyError> {
        self.ensure_alive()?;
        let mut state = self.lock();
        state.trackers.insert(info.session_id, *info);
        state.tracker_updates += 1;
        Ok(())
    }

    fn supported_tones(&self) -> Result<Vec<i32>, PolicyError> {
        self.ensure_alive()?;
        Ok((0..DTMF.len() as i32).collect())
    }

    fn tone_config(&self, id: i32) -> Result<ToneDescriptor, PolicyError> {
        self.ensure_alive()?;
        let (low, high) = usize::try_from(id)
            .ok()
            .and_then(|digit| DTMF.get(digit))
            .copied()
            .ok_or_else(|| PolicyError::NotFound(format!("tone {id}")))?;
        Ok(ToneDescriptor {
            segments: vec![
                ToneSegment {
                    frequencies: vec![low, high],
                    duration: DTMF_TONE_DURATION,
                },
                ToneSegment {
                    frequencies: Vec::new(),
                    duration: DTMF_TONE_DURATION,
                },
            ],
            repeat_count: 0,
        })
    }

    fn active_output_device(&self) -> Result<DeviceInfo, PolicyError> {
        self.ensure_alive()?;
        Ok(self.lock().output_device.clone())
    }

    fn set_system_volume_level(
        &self,
        stream_type: StreamType,
        level: i32,
    ) -> Result<(), PolicyError> {
        self.ensure_alive()?;
        if !(0..=MAX_VOLUME_LEVEL).contains(&level) {
            return Err(PolicyError::rejected(
                "set system volume",
                format!("level {level} out of range"),
            ));
        }
        self.lock().volume_levels.insert(stream_type, level);
        Ok(())
    }

    fn system_volume_db(&self, _stream_type: StreamType, level: i32) -> Result<f32, PolicyError> {
        self.ensure_alive()?;
        if level <= 0 {
            return Ok(-90.0);
        }
        let level = level.min(MAX_VOLUME_LEVEL);
        Ok(20.0 * (level as f32 / MAX_VOLUME_LEVEL as f32).log10())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::InterruptMode;
    use crate::policy::{InterruptForceType, InterruptHint, InterruptType};
    use std::sync::atomic::AtomicUsize;

    fn record(session: u32) -> InterruptRecord {
        InterruptRecord {
            session_id: SessionId::new(session),
            stream_type: StreamType::Music,
            mode: InterruptMode::Share,
            pause_when_ducked: false,
            pid: 1,
            parallel_play: false,
        }
    }

    #[test]
    fn test_activate_and_deactivate() {
        let policy = MockPolicy::new();
        policy.activate_interrupt(&record(1)).unwrap();
        policy.activate_interrupt(&record(1)).unwrap();
        assert_eq!(policy.active_records().len(), 1);
        assert_eq!(policy.activations(), 2);
        policy.deactivate_interrupt(&record(1)).unwrap();
        assert!(!policy.is_active(SessionId::new(1)));
    }

    #[test]
    fn test_fail_activate() {
        let policy = MockPolicy::new();
        policy.set_fail_activate(true);
        assert!(matches!(
            policy.activate_interrupt(&record(1)),
            Err(PolicyError::Rejected { .. })
        ));
    }

    #[test]
    fn test_deliver_interrupt() {
        let policy = MockPolicy::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        policy
            .set_interrupt_callback(
                SessionId::new(7),
                Arc::new(move |_| {
                    hits_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let event = InterruptEvent::new(
            InterruptType::Begin,
            InterruptForceType::Share,
            InterruptHint::Pause,
            0.0,
        );
        assert!(policy.deliver_interrupt(SessionId::new(7), event));
        assert!(!policy.deliver_interrupt(SessionId::new(8), event));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_service_died() {
        let policy = MockPolicy::new();
        let died = Arc::new(AtomicUsize::new(0));
        let died_clone = Arc::clone(&died);
        policy.register_service_died_callback(
            SessionId::new(1),
            Arc::new(move || {
                died_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        policy.simulate_service_died();
        assert_eq!(died.load(Ordering::SeqCst), 1);
        assert_eq!(
            policy.activate_interrupt(&record(1)),
            Err(PolicyError::ServiceDied)
        );
        policy.revive();
        assert!(policy.activate_interrupt(&record(1)).is_ok());
    }

    #[test]
    fn test_tones() {
        let policy = MockPolicy::new();
        assert_eq!(policy.supported_tones().unwrap().len(), 10);
        let tone = policy.tone_config(1).unwrap();
        assert_eq!(tone.segments[0].frequencies, vec![697, 1209]);
        assert!(matches!(policy.tone_config(42), Err(PolicyError::NotFound(_))));
    }

    #[test]
    fn test_volume_levels() {
        let policy = MockPolicy::new();
        assert!(policy.set_system_volume_level(StreamType::Music, 10).is_ok());
        assert!(policy.set_system_volume_level(StreamType::Music, 16).is_err());
        assert_eq!(policy.system_volume_db(StreamType::Music, 15).unwrap(), 0.0);
        assert!(policy.system_volume_db(StreamType::Music, 5).unwrap() < 0.0);
    }
}
