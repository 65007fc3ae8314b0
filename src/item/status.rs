use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a work item.
///
/// Every item flows: PENDING → PROCESSING → SUCCESS | FAILED | SKIPPED.
/// Items that are never dispatched (job aborted, cancelled, or already done in a
/// previous run) go straight from PENDING to SKIPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Skipped,
}

impl ItemStatus {
    /// Check if this status allows moving to `target`.
    ///
    /// Processing → Processing is not a transition: a retry keeps the item in
    /// Processing and only bumps its attempt count.
    pub fn can_transition_to(self, target: ItemStatus) -> bool {
        use ItemStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Pending, Skipped)
                | (Processing, Success)
                | (Processing, Failed)
                | (Processing, Skipped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Pending => write!(f, "PENDING"),
            ItemStatus::Processing => write!(f, "PROCESSING"),
            ItemStatus::Success => write!(f, "SUCCESS"),
            ItemStatus::Failed => write!(f, "FAILED"),
            ItemStatus::Skipped => write!(f, "SKIPPED"),
        }
    }
}
