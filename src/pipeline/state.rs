//! Mixer state management

use std::time::Instant;

/// Mix thread state machine
///
/// `Idle → Running ⇄ Paused → Exiting → Stopped`. Transitions are validated so
/// that a stopped mixer can never be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerState {
    /// Constructed, mix thread not started yet
    Idle,

    /// Mix thread is emitting frames
    Running {
        /// When the mixer started (or last resumed)
        started_at: Instant,
    },

    /// Mix thread is alive but emits nothing and holds its clock
    Paused {
        /// When the mixer was paused
        paused_at: Instant,
    },

    /// Exit requested, the mix thread is winding down
    Exiting,

    /// Mix thread joined; terminal
    Stopped,
}

impl MixerState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &MixerState) -> bool {
        use MixerState::*;

        match (self, target) {
            (Idle, Running { .. }) => true,
            // Shutting down a mixer that never ran
            (Idle, Exiting) => true,

            (Running { .. }, Paused { .. }) => true,
            (Running { .. }, Exiting) => true,

            (Paused { .. }, Running { .. }) => true,
            (Paused { .. }, Exiting) => true,

            (Exiting, Stopped) => true,

            (Stopped, _) => false,

            // Self-transitions
            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            MixerState::Idle => "Idle",
            MixerState::Running { .. } => "Running",
            MixerState::Paused { .. } => "Paused",
            MixerState::Exiting => "Exiting",
            MixerState::Stopped => "Stopped",
        }
    }

    /// Check if the mix thread is alive (running or paused)
    pub fn is_active(&self) -> bool {
        matches!(self, MixerState::Running { .. } | MixerState::Paused { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, MixerState::Running { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, MixerState::Paused { .. })
    }

    /// Check if shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, MixerState::Exiting | MixerState::Stopped)
    }
}

impl std::fmt::Display for MixerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
