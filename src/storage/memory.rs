//! In-memory repository.
//!
//! Provides a fast, non-persistent implementation of [`MemoryRepository`] for
//! tests, demos, and the CLI. Records are ordered by id and the paging cursor
//! is the last id returned.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use crate::models::{
    MemoryId, MemoryRecord, MergeDecision, MergeState, RunCheckpoint, RunCounters, RunId,
};
use crate::storage::traits::{MemoryRepository, MergeOutcome, RecordBatch, RecordFilter};
use crate::{Error, Result};

/// Repository operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryOperation {
    /// `fetch_batch`.
    FetchBatch,
    /// `get_embedding`.
    GetEmbedding,
    /// `apply_merge`.
    ApplyMerge,
    /// `record_run_checkpoint`.
    RecordCheckpoint,
    /// `latest_checkpoint`.
    LatestCheckpoint,
}

impl RepositoryOperation {
    const fn as_str(self) -> &'static str {
        match self {
            Self::FetchBatch => "fetch_batch",
            Self::GetEmbedding => "get_embedding",
            Self::ApplyMerge => "apply_merge",
            Self::RecordCheckpoint => "record_run_checkpoint",
            Self::LatestCheckpoint => "latest_checkpoint",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    remaining: u32,
    transient: bool,
}

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<MemoryId, MemoryRecord>,
    embeddings: HashMap<MemoryId, Vec<f32>>,
    decisions: Vec<MergeDecision>,
    checkpoints: Vec<RunCheckpoint>,
}

/// In-memory [`MemoryRepository`].
///
/// Uses a single `RwLock` so a merge (survivor update, tombstones, and the
/// audit entry) is applied atomically.
///
/// # Example
///
/// ```rust
/// use memdedup::models::MemoryRecord;
/// use memdedup::storage::{InMemoryRepository, MemoryRepository, RecordFilter};
///
/// let repository = InMemoryRepository::with_records([
///     MemoryRecord::new("m-1", "first"),
///     MemoryRecord::new("m-2", "second"),
/// ]);
/// let batch = repository.fetch_batch(None, 1, &RecordFilter::active()).unwrap();
/// assert_eq!(batch.records.len(), 1);
/// assert_eq!(batch.next_cursor.as_deref(), Some("m-1"));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
    failures: Mutex<HashMap<RepositoryOperation, InjectedFailure>>,
    concurrent_edits: Mutex<BTreeSet<MemoryId>>,
    fetch_delay: Mutex<Option<Duration>>,
}

fn poisoned(operation: &str) -> Error {
    Error::permanent(operation, "Lock poisoned")
}

impl InMemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository holding `records`.
    #[must_use]
    pub fn with_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = MemoryRecord>,
    {
        let repository = Self::new();
        for record in records {
            repository.insert(record);
        }
        repository
    }

    /// Inserts or replaces a record. An empty fingerprint is computed.
    pub fn insert(&self, mut record: MemoryRecord) {
        if record.fingerprint.is_empty() {
            record.refresh_fingerprint();
        }
        if let Ok(mut state) = self.state.write() {
            state.records.insert(record.id.clone(), record);
        }
    }

    /// Stores an embedding outside the record, served by `get_embedding`.
    pub fn set_embedding(&self, id: &MemoryId, embedding: Vec<f32>) {
        if let Ok(mut state) = self.state.write() {
            state.embeddings.insert(id.clone(), embedding);
        }
    }

    /// Returns a record by id.
    #[must_use]
    pub fn get(&self, id: &MemoryId) -> Option<MemoryRecord> {
        self.state.read().ok()?.records.get(id).cloned()
    }

    /// Returns every record in id order.
    #[must_use]
    pub fn records(&self) -> Vec<MemoryRecord> {
        self.state
            .read()
            .map(|s| s.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the active records in id order.
    #[must_use]
    pub fn active_records(&self) -> Vec<MemoryRecord> {
        self.records()
            .into_iter()
            .filter(MemoryRecord::is_active)
            .collect()
    }

    /// Total number of records, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.records.len()).unwrap_or(0)
    }

    /// Returns true if the repository holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the merge audit log, oldest first.
    #[must_use]
    pub fn decisions(&self) -> Vec<MergeDecision> {
        self.state
            .read()
            .map(|s| s.decisions.clone())
            .unwrap_or_default()
    }

    /// Returns every stored checkpoint, least recently written first.
    #[must_use]
    pub fn checkpoints(&self) -> Vec<RunCheckpoint> {
        self.state
            .read()
            .map(|s| s.checkpoints.clone())
            .unwrap_or_default()
    }

    /// Rewrites a record's content as an external writer would, bumping its
    /// version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the record does not exist.
    pub fn update_content(&self, id: &MemoryId, content: impl Into<String>) -> Result<()> {
        let mut state = self.state.write().map_err(|_| poisoned("update_content"))?;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("record {id}")))?;
        record.content = content.into();
        record.refresh_fingerprint();
        record.version += 1;
        record.updated_at = crate::current_timestamp();
        Ok(())
    }

    /// Makes the next `times` calls to `operation` fail.
    pub fn fail_next(&self, operation: RepositoryOperation, times: u32, transient: bool) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(
                operation,
                InjectedFailure {
                    remaining: times,
                    transient,
                },
            );
        }
    }

    /// Simulates another writer touching `id` right after it is next fetched,
    /// so the following merge of that record hits a version conflict.
    pub fn edit_after_fetch(&self, id: &MemoryId) {
        if let Ok(mut edits) = self.concurrent_edits.lock() {
            edits.insert(id.clone());
        }
    }

    /// Sleeps for `delay` on every `fetch_batch`, to simulate a slow store.
    pub fn set_fetch_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.fetch_delay.lock() {
            *slot = Some(delay);
        }
    }

    fn check_injected(&self, operation: RepositoryOperation) -> Result<()> {
        let mut failures = self
            .failures
            .lock()
            .map_err(|_| poisoned(operation.as_str()))?;
        let Some(failure) = failures.get_mut(&operation) else {
            return Ok(());
        };
        if failure.remaining == 0 {
            return Ok(());
        }
        failure.remaining -= 1;
        let cause = "injected failure";
        Err(if failure.transient {
            Error::transient(operation.as_str(), cause)
        } else {
            Error::permanent(operation.as_str(), cause)
        })
    }

    fn apply_concurrent_edits(&self, fetched: &[MemoryRecord]) {
        let Ok(mut edits) = self.concurrent_edits.lock() else {
            return;
        };
        let hit: Vec<MemoryId> = fetched
            .iter()
            .filter(|r| edits.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();
        if hit.is_empty() {
            return;
        }
        if let Ok(mut state) = self.state.write() {
            for id in &hit {
                edits.remove(id);
                if let Some(record) = state.records.get_mut(id) {
                    record.version += 1;
                }
            }
        }
    }
}

impl MemoryRepository for InMemoryRepository {
    fn fetch_batch(
        &self,
        cursor: Option<&str>,
        limit: usize,
        filter: &RecordFilter,
    ) -> Result<RecordBatch> {
        self.check_injected(RepositoryOperation::FetchBatch)?;
        let delay = self.fetch_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let batch = {
            let state = self.state.read().map_err(|_| poisoned("fetch_batch"))?;
            let mut matching = state
                .records
                .values()
                .filter(|r| cursor.is_none_or(|c| r.id.as_str() > c))
                .filter(|r| filter.matches(r));
            let records: Vec<MemoryRecord> = matching.by_ref().take(limit).cloned().collect();
            let more = matching.next().is_some();
            let next_cursor = if more {
                records.last().map(|r| r.id.as_str().to_string())
            } else {
                None
            };
            RecordBatch {
                records,
                next_cursor,
            }
        };

        self.apply_concurrent_edits(&batch.records);
        Ok(batch)
    }

    fn get_embedding(&self, id: &MemoryId) -> Result<Option<Vec<f32>>> {
        self.check_injected(RepositoryOperation::GetEmbedding)?;
        let state = self.state.read().map_err(|_| poisoned("get_embedding"))?;
        if let Some(embedding) = state.embeddings.get(id) {
            return Ok(Some(embedding.clone()));
        }
        Ok(state.records.get(id).and_then(|r| r.embedding.clone()))
    }

    fn apply_merge(
        &self,
        survivor: &MemoryRecord,
        tombstoned: &[MemoryRecord],
        decision: &MergeDecision,
    ) -> Result<MergeOutcome> {
        self.check_injected(RepositoryOperation::ApplyMerge)?;
        if decision.dry_run {
            return Err(Error::InvalidInput(
                "dry-run decisions must not be applied".to_string(),
            ));
        }

        let mut state = self.state.write().map_err(|_| poisoned("apply_merge"))?;

        for record in std::iter::once(survivor).chain(tombstoned) {
            let stored = state.records.get(&record.id).ok_or_else(|| {
                Error::permanent("apply_merge", format!("record {} does not exist", record.id))
            })?;
            let expected = decision.expected_versions.get(&record.id).copied();
            if expected != Some(stored.version) || !stored.is_active() {
                return Ok(MergeOutcome::VersionConflict {
                    record_id: record.id.clone(),
                });
            }
        }
        for record in tombstoned {
            if record.survivor() != Some(&survivor.id) {
                return Err(Error::DataIntegrity(format!(
                    "record {} must be tombstoned onto survivor {}",
                    record.id, survivor.id
                )));
            }
        }

        let losers: BTreeSet<&MemoryId> = tombstoned.iter().map(|r| &r.id).collect();
        let now = Utc::now();
        // Older tombstones of the losers move to the new survivor so no chain forms.
        for record in state.records.values_mut() {
            let repoint = matches!(
                &record.merge_state,
                MergeState::Tombstoned { survivor: target, .. } if losers.contains(target)
            );
            if repoint {
                record.merge_state = MergeState::Tombstoned {
                    survivor: survivor.id.clone(),
                    tombstoned_at: now,
                };
                record.version += 1;
            }
        }

        state.records.insert(survivor.id.clone(), survivor.clone());
        for record in tombstoned {
            state.records.insert(record.id.clone(), record.clone());
        }
        state.decisions.push(decision.clone());

        Ok(MergeOutcome::Applied)
    }

    fn record_run_checkpoint(
        &self,
        run_id: &RunId,
        cursor: Option<&str>,
        counters: &RunCounters,
    ) -> Result<()> {
        self.check_injected(RepositoryOperation::RecordCheckpoint)?;
        let mut state = self
            .state
            .write()
            .map_err(|_| poisoned("record_run_checkpoint"))?;
        state.checkpoints.retain(|c| &c.run_id != run_id);
        state.checkpoints.push(RunCheckpoint {
            run_id: run_id.clone(),
            cursor: cursor.map(str::to_string),
            counters: *counters,
            finished: false,
        });
        Ok(())
    }

    fn latest_checkpoint(&self) -> Result<Option<RunCheckpoint>> {
        self.check_injected(RepositoryOperation::LatestCheckpoint)?;
        let state = self.state.read().map_err(|_| poisoned("latest_checkpoint"))?;
        Ok(state.checkpoints.iter().rev().find(|c| !c.finished).cloned())
    }

    fn finish_run_checkpoint(&self, run_id: &RunId) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| poisoned("finish_run_checkpoint"))?;
        for checkpoint in state.checkpoints.iter_mut().filter(|c| &c.run_id == run_id) {
            checkpoint.finished = true;
        }
        Ok(())
    }

    fn supersede_run_checkpoints(&self, current: &RunId) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| poisoned("supersede_run_checkpoints"))?;
        for checkpoint in state.checkpoints.iter_mut().filter(|c| &c.run_id != current) {
            checkpoint.finished = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeStrategy;
    use crate::models::DetectionMethod;

    fn repository(n: usize) -> InMemoryRepository {
        InMemoryRepository::with_records(
            (0..n).map(|i| MemoryRecord::new(format!("m-{i:03}"), format!("content {i}"))),
        )
    }

    fn decision(survivor: &MemoryRecord, losers: &[&MemoryRecord]) -> MergeDecision {
        let mut expected = BTreeMap::new();
        expected.insert(survivor.id.clone(), survivor.version);
        for loser in losers {
            expected.insert(loser.id.clone(), loser.version);
        }
        MergeDecision {
            decision_id: MergeDecision::new_id(),
            run_id: RunId::new("run"),
            source_ids: expected.keys().cloned().collect(),
            survivor_id: survivor.id.clone(),
            strategy: MergeStrategy::KeepNewest,
            methods: BTreeSet::from([DetectionMethod::Exact]),
            confidence: 1.0,
            field_resolutions: Vec::new(),
            expected_versions: expected,
            dry_run: false,
            decided_at: Utc::now(),
        }
    }

    fn tombstone(record: &MemoryRecord, survivor: &MemoryId) -> MemoryRecord {
        let mut record = record.clone();
        record.merge_state = MergeState::Tombstoned {
            survivor: survivor.clone(),
            tombstoned_at: Utc::now(),
        };
        record.version += 1;
        record
    }

    #[test]
    fn test_fetch_pages_are_disjoint_and_ordered() {
        let repo = repository(5);
        let filter = RecordFilter::active();
        let first = repo.fetch_batch(None, 2, &filter).unwrap();
        let second = repo
            .fetch_batch(first.next_cursor.as_deref(), 2, &filter)
            .unwrap();
        let third = repo
            .fetch_batch(second.next_cursor.as_deref(), 2, &filter)
            .unwrap();
        assert_eq!(first.records[0].id.as_str(), "m-000");
        assert_eq!(second.records[0].id.as_str(), "m-002");
        assert_eq!(third.records.len(), 1);
        assert!(third.next_cursor.is_none());
    }

    #[test]
    fn test_exact_page_boundary_ends_cursor() {
        let repo = repository(2);
        let batch = repo.fetch_batch(None, 2, &RecordFilter::active()).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert!(batch.next_cursor.is_none());
    }

    #[test]
    fn test_apply_merge_checks_versions() {
        let repo = repository(2);
        let a = repo.get(&MemoryId::new("m-000")).unwrap();
        let b = repo.get(&MemoryId::new("m-001")).unwrap();
        let decision = decision(&a, &[&b]);
        repo.update_content(&b.id, "changed").unwrap();

        let outcome = repo
            .apply_merge(&a, &[tombstone(&b, &a.id)], &decision)
            .unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::VersionConflict {
                record_id: b.id.clone()
            }
        );
        assert!(repo.get(&b.id).unwrap().is_active());
        assert!(repo.decisions().is_empty());
    }

    #[test]
    fn test_apply_merge_repoints_older_tombstones() {
        let repo = repository(3);
        let a = repo.get(&MemoryId::new("m-000")).unwrap();
        let b = repo.get(&MemoryId::new("m-001")).unwrap();
        let c = repo.get(&MemoryId::new("m-002")).unwrap();

        // c merges into b, then b merges into a.
        let first = decision(&b, &[&c]);
        assert_eq!(
            repo.apply_merge(&b, &[tombstone(&c, &b.id)], &first)
                .unwrap(),
            MergeOutcome::Applied
        );
        let second = decision(&a, &[&b]);
        assert_eq!(
            repo.apply_merge(&a, &[tombstone(&b, &a.id)], &second)
                .unwrap(),
            MergeOutcome::Applied
        );

        let c_after = repo.get(&c.id).unwrap();
        assert_eq!(c_after.survivor(), Some(&a.id));
        assert_eq!(repo.decisions().len(), 2);
    }

    #[test]
    fn test_injected_failures_count_down() {
        let repo = repository(1);
        repo.fail_next(RepositoryOperation::FetchBatch, 1, true);
        let err = repo
            .fetch_batch(None, 10, &RecordFilter::active())
            .unwrap_err();
        assert!(err.is_transient());
        assert!(repo.fetch_batch(None, 10, &RecordFilter::active()).is_ok());
    }

    #[test]
    fn test_checkpoints() {
        let repo = repository(0);
        let run = RunId::new("r1");
        repo.record_run_checkpoint(&run, Some("m-010"), &RunCounters::default())
            .unwrap();
        let latest = repo.latest_checkpoint().unwrap().unwrap();
        assert_eq!(latest.cursor.as_deref(), Some("m-010"));

        repo.finish_run_checkpoint(&run).unwrap();
        assert!(repo.latest_checkpoint().unwrap().is_none());
    }

    #[test]
    fn test_supersede_keeps_only_current_checkpoint() {
        let repo = repository(0);
        let counters = RunCounters::default();
        for (run, cursor) in [("r1", "m-005"), ("r2", "m-007"), ("r3", "m-009")] {
            repo.record_run_checkpoint(&RunId::new(run), Some(cursor), &counters)
                .unwrap();
        }

        repo.supersede_run_checkpoints(&RunId::new("r2")).unwrap();
        let open: Vec<_> = repo
            .checkpoints()
            .into_iter()
            .filter(|c| !c.finished)
            .map(|c| c.run_id)
            .collect();
        assert_eq!(open, vec![RunId::new("r2")]);
        assert_eq!(
            repo.latest_checkpoint().unwrap().unwrap().cursor.as_deref(),
            Some("m-007")
        );
    }

    #[test]
    fn test_external_embedding_preferred() {
        let repo = repository(1);
        let id = MemoryId::new("m-000");
        assert!(repo.get_embedding(&id).unwrap().is_none());
        repo.set_embedding(&id, vec![1.0, 0.0]);
        assert_eq!(repo.get_embedding(&id).unwrap(), Some(vec![1.0, 0.0]));
    }
}
