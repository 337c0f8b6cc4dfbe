//! Session lifecycle state machine

use serde::Serialize;
use tracing::debug;

use crate::ssh::SshError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticating,
    Ready,
    Closing,
    Closed,
    /// Connect failed; only `destroy()` moves on from here
    Failed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Authenticating)
                | (Authenticating, Ready)
                | (Connecting | Authenticating, Failed)
                | (Idle | Connecting | Authenticating | Ready | Failed, Closing)
                | (Closing, Closed)
        )
    }
}

#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: SessionState) -> Result<SessionState, SshError> {
        if !self.state.can_transition_to(next) {
            return Err(SshError::InvalidState(format!(
                "cannot go from {:?} to {:?}",
                self.state, next
            )));
        }
        debug!("Session state {:?} -> {:?}", self.state, next);
        Ok(std::mem::replace(&mut self.state, next))
    }
}
