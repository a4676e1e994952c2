//! Memory repository trait.

use crate::Result;
use crate::models::{MemoryId, MemoryRecord, MergeDecision, RunCheckpoint, RunCounters, RunId};

/// Record selection criteria for [`MemoryRepository::fetch_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    /// Only return records in the `Active` merge state.
    pub active_only: bool,
    /// Only return records updated at or after this Unix timestamp.
    pub updated_since: Option<u64>,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self {
            active_only: true,
            updated_since: None,
        }
    }
}

impl RecordFilter {
    /// Filter matching every active record.
    #[must_use]
    pub fn active() -> Self {
        Self::default()
    }

    /// Restricts to records updated at or after `timestamp`.
    #[must_use]
    pub const fn with_updated_since(mut self, timestamp: u64) -> Self {
        self.updated_since = Some(timestamp);
        self
    }

    /// Returns true if `record` passes the filter.
    #[must_use]
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if self.active_only && !record.is_active() {
            return false;
        }
        self.updated_since
            .is_none_or(|since| record.updated_at >= since)
    }
}

/// One page of records.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    /// Records in cursor order.
    pub records: Vec<MemoryRecord>,
    /// Cursor to continue from; `None` once the collection is exhausted.
    pub next_cursor: Option<String>,
}

impl RecordBatch {
    /// Returns true if the batch holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Result of an attempted merge write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Survivor update and tombstones were written atomically.
    Applied,
    /// A record changed since it was read; nothing was written.
    VersionConflict {
        /// The record whose version no longer matched.
        record_id: MemoryId,
    },
}

/// Source of truth for memory records.
///
/// Implementations must be safe to call from the run worker thread and from
/// detector threads at the same time.
///
/// # Contract
///
/// - `fetch_batch` pages are disjoint and ordered; passing a page's
///   `next_cursor` back returns the following page.
/// - `apply_merge` is atomic: either the survivor update and every tombstone
///   are written, or nothing is. It compares each record's stored version with
///   `decision.expected_versions` and reports a conflict instead of writing
///   when they differ.
/// - After `apply_merge`, no tombstone may point at a tombstoned record.
pub trait MemoryRepository: Send + Sync {
    /// Fetches up to `limit` records after `cursor`.
    fn fetch_batch(
        &self,
        cursor: Option<&str>,
        limit: usize,
        filter: &RecordFilter,
    ) -> Result<RecordBatch>;

    /// Looks up the stored embedding for a record.
    fn get_embedding(&self, id: &MemoryId) -> Result<Option<Vec<f32>>>;

    /// Writes a merge: the updated survivor plus tombstoned losers.
    fn apply_merge(
        &self,
        survivor: &MemoryRecord,
        tombstoned: &[MemoryRecord],
        decision: &MergeDecision,
    ) -> Result<MergeOutcome>;

    /// Persists a run's resume point after a committed batch.
    fn record_run_checkpoint(
        &self,
        run_id: &RunId,
        cursor: Option<&str>,
        counters: &RunCounters,
    ) -> Result<()>;

    /// Returns the most recent checkpoint that was not finished.
    fn latest_checkpoint(&self) -> Result<Option<RunCheckpoint>> {
        Ok(None)
    }

    /// Marks a run's checkpoint finished so later runs start fresh.
    fn finish_run_checkpoint(&self, _run_id: &RunId) -> Result<()> {
        Ok(())
    }

    /// Marks every unfinished checkpoint other than `current`'s finished.
    ///
    /// Runs call this once their own checkpoint is written, so at most one
    /// resumable cursor exists.
    fn supersede_run_checkpoints(&self, _current: &RunId) -> Result<()> {
        Ok(())
    }
}
