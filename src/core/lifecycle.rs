//! Auxiliary lifecycle state machine
//!
//! `Stopped → Creating → Running → Stopping → Stopped`, with `Suspended` as a
//! parked variant of `Stopped` reachable only from `Running`.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Lifecycle state of one auxiliary instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AuxiliaryState {
    /// No transport open, no loops running
    #[default]
    Stopped,
    /// Opening the transport and handshaking
    Creating,
    /// Loops running, commands accepted
    Running,
    /// Tearing down loops and transport
    Stopping,
    /// Stopped on behalf of a copy, resumable
    Suspended,
}

impl AuxiliaryState {
    /// Commands are accepted only in this state
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Stopped or suspended
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Stopped | Self::Suspended)
    }

    /// Check if state is a transitional state
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Creating | Self::Stopping)
    }
}

/// State transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: AuxiliaryState,
    /// New state
    pub to: AuxiliaryState,
    /// Timestamp
    pub timestamp: DateTime<Local>,
    /// Reason for transition
    pub reason: Option<String>,
}

/// Rejected transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    /// Current state
    pub from: AuxiliaryState,
    /// Requested state
    pub to: AuxiliaryState,
}

/// Lifecycle state machine
#[derive(Debug)]
pub struct Lifecycle {
    state: AuxiliaryState,
    history: Vec<StateTransition>,
    max_history: usize,
    last_transition: Option<Instant>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Create a machine in `Stopped`
    pub fn new() -> Self {
        Self {
            state: AuxiliaryState::Stopped,
            history: Vec::new(),
            max_history: 64,
            last_transition: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> AuxiliaryState {
        self.state
    }

    /// Get state history, oldest first
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Get time in current state
    pub fn time_in_state(&self) -> Option<Duration> {
        self.last_transition.map(|t| t.elapsed())
    }

    /// Transition to a new state
    pub fn transition(
        &mut self,
        new_state: AuxiliaryState,
        reason: Option<&str>,
    ) -> Result<(), InvalidTransition> {
        if !self.is_valid_transition(new_state) {
            return Err(InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }
        if new_state == self.state {
            return Ok(());
        }

        self.history.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Local::now(),
            reason: reason.map(String::from),
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        self.state = new_state;
        self.last_transition = Some(Instant::now());
        Ok(())
    }

    fn is_valid_transition(&self, new_state: AuxiliaryState) -> bool {
        use AuxiliaryState::*;

        match (self.state, new_state) {
            (Stopped, Creating) => true,

            (Creating, Running) => true,
            (Creating, Stopped) => true, // handshake or open failed

            (Running, Stopping) => true,
            (Running, Suspended) => true,

            (Stopping, Stopped) => true,

            (Suspended, Creating) => true,
            (Suspended, Stopped) => true,

            (a, b) if a == b => true,

            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let mut lc = Lifecycle::new();
        assert_eq!(lc.state(), AuxiliaryState::Stopped);

        lc.transition(AuxiliaryState::Creating, Some("create")).unwrap();
        lc.transition(AuxiliaryState::Running, None).unwrap();
        assert!(lc.state().is_running());
        lc.transition(AuxiliaryState::Stopping, None).unwrap();
        lc.transition(AuxiliaryState::Stopped, None).unwrap();

        assert_eq!(lc.history().len(), 4);
        assert_eq!(lc.history()[0].reason.as_deref(), Some("create"));
    }

    #[test]
    fn test_suspend_resume() {
        let mut lc = Lifecycle::new();
        lc.transition(AuxiliaryState::Creating, None).unwrap();
        lc.transition(AuxiliaryState::Running, None).unwrap();
        lc.transition(AuxiliaryState::Suspended, None).unwrap();
        assert!(lc.state().is_idle());
        lc.transition(AuxiliaryState::Creating, None).unwrap();
        lc.transition(AuxiliaryState::Running, None).unwrap();
    }

    #[test]
    fn test_invalid_transition() {
        let mut lc = Lifecycle::new();

        let err = lc.transition(AuxiliaryState::Running, None).unwrap_err();
        assert_eq!(err.from, AuxiliaryState::Stopped);
        assert_eq!(err.to, AuxiliaryState::Running);

        // Suspended is only reachable from Running
        assert!(lc.transition(AuxiliaryState::Suspended, None).is_err());
    }

    #[test]
    fn test_same_state_not_recorded() {
        let mut lc = Lifecycle::new();
        lc.transition(AuxiliaryState::Stopped, None).unwrap();
        assert!(lc.history().is_empty());
    }
}
