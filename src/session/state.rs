use std::fmt;

use super::SessionError;

/// Lifecycle state of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Created,
    Routing,
    Connecting,
    Relaying,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether `next` may follow `self`
    ///
    /// Every live state can fall through to `Closing`; `Closed` is terminal.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Routing)
                | (Routing, Connecting)
                | (Connecting, Relaying)
                | (Created | Routing | Connecting | Relaying, Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Routing => "routing",
            SessionState::Connecting => "connecting",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus every state the session has passed through
#[derive(Debug, Clone)]
pub struct StateTracker {
    history: Vec<SessionState>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            history: vec![SessionState::Created],
        }
    }

    pub fn current(&self) -> SessionState {
        // history always holds at least `Created`
        self.history[self.history.len() - 1]
    }

    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(SessionError::InvalidTransition { from, to: next });
        }
        self.history.push(next);
        Ok(())
    }
}
