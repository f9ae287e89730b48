use std::sync::{mpsc::Sender, Condvar, Mutex, MutexGuard, PoisonError};

use super::EngineEvent;
use crate::match_runner::MatchStatus;

#[derive(Debug)]
struct ControlState {
    status: MatchStatus,
    destroyed: bool,
}

/// Status and stop/resume gate shared between a match and its handles.
///
/// The round loop parks on the condition variable while the status is `Stopped`; the wake-up
/// event interrupts a pending wait for agent output.
#[derive(Debug)]
pub(crate) struct MatchControl {
    state: Mutex<ControlState>,
    gate: Condvar,
    wake: Sender<EngineEvent>,
}

impl MatchControl {
    pub(crate) fn new(wake: Sender<EngineEvent>) -> Self {
        Self {
            state: Mutex::new(ControlState {
                status: MatchStatus::Uninitialized,
                destroyed: false,
            }),
            gate: Condvar::new(),
            wake,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> MatchStatus {
        self.lock().status
    }

    pub(crate) fn set_status(&self, status: MatchStatus) {
        self.lock().status = status;
        self.gate.notify_all();
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Moves `from` to `to` atomically. Returns the status observed when it did not match.
    pub(crate) fn transition(&self, from: MatchStatus, to: MatchStatus) -> Result<(), MatchStatus> {
        let mut state = self.lock();
        if state.status != from || state.destroyed {
            return Err(state.status);
        }
        state.status = to;
        drop(state);
        self.gate.notify_all();
        let _ = self.wake.send(EngineEvent::Wake);
        Ok(())
    }

    /// Returns false if the match was already destroyed.
    pub(crate) fn destroy(&self) -> bool {
        let mut state = self.lock();
        if state.destroyed {
            return false;
        }
        state.destroyed = true;
        if matches!(state.status, MatchStatus::Running | MatchStatus::Stopped) {
            state.status = MatchStatus::Error;
        }
        drop(state);
        self.gate.notify_all();
        let _ = self.wake.send(EngineEvent::Wake);
        true
    }

    /// Blocks while the match is stopped. Returns true if it got destroyed meanwhile.
    pub(crate) fn wait_while_stopped(&self) -> bool {
        let state = self.lock();
        let state = self
            .gate
            .wait_while(state, |s| s.status == MatchStatus::Stopped && !s.destroyed)
            .unwrap_or_else(PoisonError::into_inner);
        state.destroyed
    }
}
