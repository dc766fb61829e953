//! Run-mode lifecycle enum.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a live event.
///
/// `Unpause` and `Unsuspend` are transient: the lifecycle engine uses them to
/// compute resume timestamps, then re-dispatches the effective prior mode.
/// User handlers never observe them in `LiveInfo::run_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Queued, waiting for activation
    Add,
    /// Running (or resumed)
    Start,
    /// Completed normally
    End,
    /// Frozen by pause
    Pause,
    /// Transient resume-from-pause marker
    Unpause,
    /// Frozen by suspend
    Suspend,
    /// Transient resume-from-suspend marker
    Unsuspend,
    /// Removed before completion, cleanup dispatched
    Cancel,
    /// Jumped over, cleanup dispatched
    Skip,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Add
    }
}

impl RunMode {
    /// Check if this mode finalizes the live event
    pub fn is_final(&self) -> bool {
        matches!(self, RunMode::End | RunMode::Cancel | RunMode::Skip)
    }

    /// Check if this mode freezes the live event
    pub fn is_frozen(&self) -> bool {
        matches!(self, RunMode::Pause | RunMode::Suspend)
    }

    /// Check if this mode is a transient resume marker
    pub fn is_unfreezing(&self) -> bool {
        matches!(self, RunMode::Unpause | RunMode::Unsuspend)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunMode::Add => "add",
            RunMode::Start => "start",
            RunMode::End => "end",
            RunMode::Pause => "pause",
            RunMode::Unpause => "unpause",
            RunMode::Suspend => "suspend",
            RunMode::Unsuspend => "unsuspend",
            RunMode::Cancel => "cancel",
            RunMode::Skip => "skip",
        };
        f.write_str(name)
    }
}
