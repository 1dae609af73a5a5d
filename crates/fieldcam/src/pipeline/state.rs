//! Pipeline lifecycle states.

use std::fmt;

use serde::Serialize;

/// Lifecycle of the pipeline.
///
/// `Initializing → Running ⇄ Degraded → ShuttingDown → Stopped`. Shutdown may
/// begin from any state; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    /// Components are being brought up.
    #[default]
    Initializing,
    /// All subsystems healthy.
    Running,
    /// Producing images with reduced capability.
    Degraded,
    /// Draining and releasing resources.
    ShuttingDown,
    /// Finished.
    Stopped,
}

impl PipelineState {
    /// Whether moving to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use PipelineState::{Degraded, Initializing, Running, ShuttingDown, Stopped};
        matches!(
            (self, next),
            (Initializing | Degraded, Running)
                | (Initializing | Running, Degraded)
                | (Initializing | Running | Degraded, ShuttingDown)
                | (Initializing | ShuttingDown, Stopped)
        )
    }

    /// Whether the cycle loop should be running in this state.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Degraded)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}
