//! Manual-review queue trait.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::models::{DuplicateCandidateGroup, RunId};

/// A group awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    /// Run that found the group.
    pub run_id: RunId,
    /// The candidate group.
    pub group: DuplicateCandidateGroup,
    /// When it was queued.
    pub queued_at: DateTime<Utc>,
}

/// Sink for groups below the auto-merge threshold.
pub trait ReviewQueue: Send + Sync {
    /// Queues a group for review.
    fn enqueue(&self, run_id: &RunId, group: &DuplicateCandidateGroup) -> Result<()>;

    /// Returns all queued items, oldest first.
    fn pending(&self) -> Result<Vec<ReviewItem>>;
}
