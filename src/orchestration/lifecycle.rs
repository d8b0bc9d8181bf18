//! Request lifecycle state machine
//!
//! Tracks where a single request is in its transport round trip and rejects
//! transitions that would go backwards or leave a terminal state.

use std::fmt;

/// Stage of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initiated,
    AwaitingSocket,
    SocketObtained,
    AwaitingConnect,
    Connected,
    AwaitingResponse,
    Resolved,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Resolved | LifecycleState::Failed)
    }

    /// Whether `next` may directly follow `self`.
    ///
    /// `Failed` is reachable from every non-terminal state and `Resolved`
    /// from every state once the request is out; the rest is a straight line.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            Failed => true,
            Resolved => *self != Initiated,
            AwaitingSocket => *self == Initiated,
            SocketObtained => *self == AwaitingSocket,
            AwaitingConnect => *self == SocketObtained,
            Connected => *self == AwaitingConnect,
            AwaitingResponse => *self == Connected,
            Initiated => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Current state plus validated transitions
#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: LifecycleState::Initiated,
        }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next` if allowed. Returns whether the transition happened.
    pub fn advance(&mut self, next: LifecycleState) -> bool {
        if !self.state.can_transition_to(next) {
            log::debug!("Ignoring lifecycle transition {} -> {}", self.state, next);
            return false;
        }
        log::trace!("Lifecycle transition {} -> {}", self.state, next);
        self.state = next;
        true
    }
}
