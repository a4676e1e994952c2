//! In-memory review queue.

use chrono::Utc;
use std::sync::RwLock;

use crate::models::{DuplicateCandidateGroup, RunId};
use crate::storage::traits::{ReviewItem, ReviewQueue};
use crate::{Error, Result};

/// In-memory [`ReviewQueue`].
#[derive(Debug, Default)]
pub struct InMemoryReviewQueue {
    items: RwLock<Vec<ReviewItem>>,
}

impl InMemoryReviewQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().map(|i| i.len()).unwrap_or(0)
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReviewQueue for InMemoryReviewQueue {
    fn enqueue(&self, run_id: &RunId, group: &DuplicateCandidateGroup) -> Result<()> {
        let mut items = self.items.write().map_err(|_| Error::OperationFailed {
            operation: "review_enqueue".to_string(),
            cause: "Lock poisoned".to_string(),
        })?;
        // Re-queuing the same members replaces the older entry.
        items.retain(|item| item.group.members() != group.members());
        items.push(ReviewItem {
            run_id: run_id.clone(),
            group: group.clone(),
            queued_at: Utc::now(),
        });
        Ok(())
    }

    fn pending(&self) -> Result<Vec<ReviewItem>> {
        let items = self.items.read().map_err(|_| Error::OperationFailed {
            operation: "review_pending".to_string(),
            cause: "Lock poisoned".to_string(),
        })?;
        Ok(items.clone())
    }
}
