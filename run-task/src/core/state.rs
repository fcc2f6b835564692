//! Orchestrator state machine.

use std::fmt;

/// Phases of a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    PrivilegeResolved,
    CacheVerified,
    ChecksComplete,
    Running,
    Exited,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Aborted)
    }

    /// The state that follows `self` on success, if any.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Init => Some(Self::PrivilegeResolved),
            Self::PrivilegeResolved => Some(Self::CacheVerified),
            Self::CacheVerified => Some(Self::ChecksComplete),
            Self::ChecksComplete => Some(Self::Running),
            Self::Running => Some(Self::Exited),
            Self::Exited | Self::Aborted => None,
        }
    }

    /// True if `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Aborted || self.successor() == Some(next)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::PrivilegeResolved => "privilege-resolved",
            Self::CacheVerified => "cache-verified",
            Self::ChecksComplete => "checks-complete",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Ordered record of the states a run went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTracker {
    history: Vec<RunState>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self {
            history: vec![RunState::Init],
        }
    }
}

impl StateTracker {
    pub fn current(&self) -> RunState {
        self.history
            .last()
            .copied()
            .unwrap_or(RunState::Init)
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn advance(&mut self, next: RunState) -> Result<(), String> {
        let current = self.current();
        if !current.can_transition_to(next) {
            return Err(format!("illegal state transition {current} -> {next}"));
        }
        self.history.push(next);
        Ok(())
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }
}
