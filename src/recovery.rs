//! Restoring a stream after the policy service died.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::RecoveryConfig;
use crate::stream::StreamCore;

#[derive(Default)]
struct RecoveryState {
    aborted: bool,
    active: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<RecoveryState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RecoveryState> {
        self.state.lock()
    }

    /// Sleeps for `interval` unless aborted first. Returns `false` if aborted.
    fn wait(&self, interval: Duration) -> bool {
        let mut state = self.lock();
        self.changed
            .wait_while_for(&mut state, |state| !state.aborted, interval);
        !state.aborted
    }
}

/// Outcome of one restore attempt.
pub(crate) enum Attempt {
    /// The transport is back.
    Restored,
    /// Try again later.
    Failed,
    /// The stream or its transport is gone.
    Gone,
}

/// Runs at most one bounded retry loop per stream.
pub(crate) struct Recovery {
    config: RecoveryConfig,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Recovery {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            worker: Mutex::new(None),
        }
    }

    /// Starts the retry loop unless one is already running or the stream
    /// was released.
    pub fn spawn(&self, core: Weak<StreamCore>) {
        {
            let mut state = self.shared.lock();
            if state.aborted {
                return;
            }
            if state.active {
                tracing::debug!("recovery already running");
                return;
            }
            state.active = true;
        }

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let spawned = std::thread::Builder::new()
            .name("stream-recovery".into())
            .spawn(move || {
                run(&core, &shared, &config);
                shared.lock().active = false;
            });

        match spawned {
            Ok(handle) => {
                let previous = self.worker.lock().replace(handle);
                // A finished earlier loop; reap it.
                if let Some(previous) = previous {
                    let _ = previous.join();
                }
            }
            Err(err) => {
                tracing::error!(%err, "could not start recovery thread");
                self.shared.lock().active = false;
            }
        }
    }

    /// Stops any running loop and prevents new ones.
    pub fn abort(&self) {
        self.shared.lock().aborted = true;
        self.shared.changed.notify_all();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.lock().active
    }
}

impl Drop for Recovery {
    fn drop(&mut self) {
        self.abort();
    }
}

fn run(core: &Weak<StreamCore>, shared: &Shared, config: &RecoveryConfig) {
    let max_attempts = config.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        if shared.lock().aborted {
            tracing::debug!(attempt, "recovery aborted");
            return;
        }
        let outcome = match core.upgrade() {
            Some(core) => core.try_restore(attempt),
            None => Attempt::Gone,
        };
        match outcome {
            Attempt::Restored => return,
            Attempt::Gone => {
                tracing::debug!(attempt, "stream gone, stopping recovery");
                return;
            }
            Attempt::Failed => {
                tracing::warn!(attempt, remaining = max_attempts - attempt, "restore attempt failed");
            }
        }
        if attempt < max_attempts && !shared.wait(config.retry_interval) {
            return;
        }
    }

    if let Some(core) = core.upgrade() {
        core.on_recovery_exhausted(max_attempts);
    }
}
