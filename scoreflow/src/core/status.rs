//! Run status and stage name enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, no stage started yet.
    Pending,
    /// The export stage is in flight.
    Exporting,
    /// The compute stage is in flight.
    Computing,
    /// The outcome is decided and the notify stage is in flight.
    Notifying,
    /// Export and compute both succeeded.
    Succeeded,
    /// Some step failed or the deadline elapsed.
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Exporting => write!(f, "exporting"),
            Self::Computing => write!(f, "computing"),
            Self::Notifying => write!(f, "notifying"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl RunStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if `next` is a legal successor of this status.
    ///
    /// Any non-terminal state may jump to `notifying` (failure routing);
    /// only `notifying` may reach a terminal state.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match (*self, next) {
            (Self::Pending, Self::Exporting)
            | (Self::Exporting, Self::Computing)
            | (Self::Pending | Self::Exporting | Self::Computing, Self::Notifying)
            | (Self::Notifying, Self::Succeeded | Self::Failed) => true,
            _ => false,
        }
    }
}

/// Identifies the step of the pipeline a failure or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Parameter resolution before any stage runs.
    Preflight,
    /// Snapshot extraction.
    Export,
    /// Scoring job.
    Compute,
    /// Final status notification.
    Notify,
}

impl StageName {
    /// Returns the stable name of the stage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::Export => "export",
            Self::Compute => "compute",
            Self::Notify => "notify",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
