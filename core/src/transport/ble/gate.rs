/// Wait/signal gate keyed by lifecycle stage
///
/// BLE delivers every result through a callback. The gate lets the calling
/// thread block until the callback for one named stage fires, an error is
/// injected, or a deadline passes.
///
/// Usage: `arm(key)` before issuing the BLE call whose callback will
/// `signal(key)`, then `wait(key, timeout)`. Arming first means a callback
/// that fires before `wait` is entered is not lost. Only one key is armed at
/// a time; `fail` resolves whatever is armed, and anything arriving while
/// nothing is armed is dropped.

use parking_lot::{Condvar, Mutex};
use std::fmt::Debug;
use std::time::{Duration, Instant};
use tracing::trace;

/// Why a wait ended without its stage being signaled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateError<E> {
    /// An error was injected with [`Gate::fail`]
    Failed(E),
    /// The deadline elapsed first
    TimedOut,
}

struct GateState<K, E> {
    armed: Option<K>,
    outcome: Option<Result<(), E>>,
}

pub struct Gate<K, E> {
    state: Mutex<GateState<K, E>>,
    condvar: Condvar,
}

impl<K, E> Gate<K, E>
where
    K: Copy + Eq + Debug,
    E: Debug,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                armed: None,
                outcome: None,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Start listening for `key`, discarding any previous outcome
    pub fn arm(&self, key: K) {
        let mut state = self.state.lock();
        state.armed = Some(key);
        state.outcome = None;
    }

    /// Key currently being waited for
    pub fn armed(&self) -> Option<K> {
        self.state.lock().armed
    }

    /// Resolve the wait on `key`. Returns false if `key` is not armed or the
    /// wait was already resolved.
    pub fn signal(&self, key: K) -> bool {
        let mut state = self.state.lock();
        if state.armed != Some(key) || state.outcome.is_some() {
            trace!("Gate: dropping signal for {:?} (armed: {:?})", key, state.armed);
            return false;
        }
        state.outcome = Some(Ok(()));
        self.condvar.notify_all();
        true
    }

    /// Resolve the armed wait with `error`, whatever its key. The first
    /// outcome wins; returns false if it was dropped.
    pub fn fail(&self, error: E) -> bool {
        let mut state = self.state.lock();
        if state.armed.is_none() || state.outcome.is_some() {
            trace!("Gate: dropping error {:?} (armed: {:?})", error, state.armed);
            return false;
        }
        state.outcome = Some(Err(error));
        self.condvar.notify_all();
        true
    }

    /// Block until `key` is signaled, an error is injected, or `timeout`
    /// elapses. Arms `key` if it is not armed already. The gate is disarmed
    /// on return, so late signals for this wait are dropped.
    pub fn wait(&self, key: K, timeout: Duration) -> Result<(), GateError<E>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.armed != Some(key) {
            state.armed = Some(key);
            state.outcome = None;
        }

        loop {
            if let Some(outcome) = state.outcome.take() {
                state.armed = None;
                return outcome.map_err(GateError::Failed);
            }
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                let outcome = state.outcome.take();
                state.armed = None;
                return match outcome {
                    Some(outcome) => outcome.map_err(GateError::Failed),
                    None => Err(GateError::TimedOut),
                };
            }
        }
    }
}

impl<K, E> Default for Gate<K, E>
where
    K: Copy + Eq + Debug,
    E: Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
