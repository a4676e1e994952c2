//! Merge planning and execution for duplicate groups.
//!
//! The merger picks a survivor, folds the other members into it, and turns
//! the losers into tombstones that point at the survivor. Planning is a pure
//! function of the group and its records; execution hands the plan to the
//! repository, which checks record versions before writing.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tracing::instrument;

use super::retry::RetryPolicy;
use crate::config::{DedupSettings, MergeStrategy};
use crate::models::{
    DuplicateCandidateGroup, FieldResolution, MemoryId, MemoryRecord, MergeDecision, MergeState,
    RunId,
};
use crate::storage::{MemoryRepository, MergeOutcome};
use crate::{Error, Result};

/// Everything needed to write one merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    /// The updated survivor.
    pub survivor: MemoryRecord,
    /// The losers, already tombstoned onto the survivor.
    pub tombstoned: Vec<MemoryRecord>,
    /// Audit record.
    pub decision: MergeDecision,
    /// Payload bytes the tombstones no longer need to keep live.
    pub reclaimed_bytes: u64,
}

/// What happened to a group handed to [`MemoryMerger::merge`].
#[derive(Debug, Clone, PartialEq)]
pub enum MergeResult {
    /// Fewer than two active members remained.
    Skipped,
    /// Dry run: the plan was produced and nothing was written.
    Planned(MergePlan),
    /// The plan was written.
    Applied(MergePlan),
}

impl MergeResult {
    /// Returns the plan, unless the group was skipped.
    #[must_use]
    pub const fn plan(&self) -> Option<&MergePlan> {
        match self {
            Self::Skipped => None,
            Self::Planned(plan) | Self::Applied(plan) => Some(plan),
        }
    }
}

/// Merges duplicate groups into a single survivor.
///
/// # Survivor selection
///
/// | Strategy | Primary key | Tie-break |
/// |----------|-------------|-----------|
/// | `KeepNewest` | latest `updated_at` | smallest id |
/// | `KeepMostImportant` | highest `importance` | newest, then smallest id |
/// | `KeepMostComplete` | most non-empty metadata fields | newest, then smallest id |
///
/// # Field merging
///
/// - Tags are unioned
/// - Each metadata field takes the best-ranked non-null value
/// - Importance is the group maximum, `created_at` the group minimum
/// - The embedding is the survivor's, else the best-ranked one available
///
/// Members that are no longer active are left out, so merging the same group
/// twice is a no-op the second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMerger {
    strategy: MergeStrategy,
    dry_run: bool,
}

impl MemoryMerger {
    /// Creates a merger.
    #[must_use]
    pub const fn new(strategy: MergeStrategy, dry_run: bool) -> Self {
        Self { strategy, dry_run }
    }

    /// Creates a merger from run settings.
    #[must_use]
    pub const fn from_settings(settings: &DedupSettings) -> Self {
        Self::new(settings.merge_strategy(), settings.dry_run())
    }

    /// Returns the survivor strategy.
    #[must_use]
    pub const fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    /// Returns true in dry-run mode.
    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Orders two records best-first under the configured strategy.
    #[must_use]
    pub fn rank(&self, a: &MemoryRecord, b: &MemoryRecord) -> Ordering {
        let newest = b.updated_at.cmp(&a.updated_at);
        let primary = match self.strategy {
            MergeStrategy::KeepNewest => newest,
            MergeStrategy::KeepMostImportant => b.importance.total_cmp(&a.importance).then(newest),
            MergeStrategy::KeepMostComplete => b
                .non_empty_metadata_count()
                .cmp(&a.non_empty_metadata_count())
                .then(newest),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }

    /// Builds the merge plan for a group without writing anything.
    ///
    /// `records` must hold the current state of every group member. Returns
    /// `Ok(None)` when fewer than two members are still active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if a member is missing from `records`, or
    /// [`Error::DataIntegrity`] if a member is tombstoned onto itself or onto
    /// another tombstoned member.
    #[instrument(skip_all, fields(group_size = group.len(), strategy = %self.strategy))]
    pub fn plan(
        &self,
        run_id: &RunId,
        group: &DuplicateCandidateGroup,
        records: &[MemoryRecord],
    ) -> Result<Option<MergePlan>> {
        let by_id: BTreeMap<&MemoryId, &MemoryRecord> =
            records.iter().map(|r| (&r.id, r)).collect();
        let mut members = Vec::with_capacity(group.len());
        for id in group.members() {
            let record = by_id
                .get(id)
                .copied()
                .ok_or_else(|| Error::NotFound(format!("group member {id} not in batch")))?;
            members.push(record);
        }
        check_integrity(&members)?;

        let mut ranked: Vec<&MemoryRecord> = members.into_iter().filter(|r| r.is_active()).collect();
        if ranked.len() < 2 {
            tracing::debug!(active = ranked.len(), "Skipping group with fewer than two active members");
            return Ok(None);
        }
        ranked.sort_by(|a, b| self.rank(a, b));

        let best = ranked[0];
        let now = Utc::now();
        let mut survivor = best.clone();
        survivor.tags = ranked.iter().flat_map(|r| r.tags.iter().cloned()).collect();
        let field_resolutions = resolve_metadata(&ranked, &mut survivor);
        survivor.importance = ranked
            .iter()
            .map(|r| r.importance)
            .fold(f32::NEG_INFINITY, f32::max);
        survivor.created_at = ranked.iter().map(|r| r.created_at).min().unwrap_or(best.created_at);
        if survivor.embedding.is_none() {
            survivor.embedding = ranked.iter().find_map(|r| r.embedding.clone());
        }
        survivor.version = best.version + 1;
        survivor.updated_at = crate::current_timestamp().max(best.updated_at);

        let mut tombstoned = Vec::with_capacity(ranked.len() - 1);
        let mut reclaimed_bytes = 0;
        for loser in &ranked[1..] {
            let mut record = (*loser).clone();
            record.merge_state = MergeState::Tombstoned {
                survivor: survivor.id.clone(),
                tombstoned_at: now,
            };
            record.version = loser.version + 1;
            reclaimed_bytes += loser.storage_bytes();
            tombstoned.push(record);
        }

        let mut source_ids: Vec<MemoryId> = ranked.iter().map(|r| r.id.clone()).collect();
        source_ids.sort();
        let decision = MergeDecision {
            decision_id: MergeDecision::new_id(),
            run_id: run_id.clone(),
            source_ids,
            survivor_id: survivor.id.clone(),
            strategy: self.strategy,
            methods: group.methods().clone(),
            confidence: group.confidence(),
            field_resolutions,
            expected_versions: ranked.iter().map(|r| (r.id.clone(), r.version)).collect(),
            dry_run: self.dry_run,
            decided_at: now,
        };

        Ok(Some(MergePlan {
            survivor,
            tombstoned,
            decision,
            reclaimed_bytes,
        }))
    }

    /// Plans a group and, unless in dry-run mode, writes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VersionConflict`] if a member changed since it was
    /// read, any error from [`MemoryMerger::plan`], or the repository error
    /// once `retry` gives up.
    #[instrument(skip_all, fields(run_id = %run_id, group_size = group.len(), dry_run = self.dry_run))]
    pub fn merge(
        &self,
        repository: &dyn MemoryRepository,
        retry: &RetryPolicy,
        run_id: &RunId,
        group: &DuplicateCandidateGroup,
        records: &[MemoryRecord],
    ) -> Result<MergeResult> {
        let Some(plan) = self.plan(run_id, group, records)? else {
            return Ok(MergeResult::Skipped);
        };
        if self.dry_run {
            tracing::info!(
                survivor = %plan.survivor.id,
                tombstoned = plan.tombstoned.len(),
                "Dry run: merge planned, nothing written"
            );
            return Ok(MergeResult::Planned(plan));
        }

        let outcome = retry.execute("apply_merge", || {
            repository.apply_merge(&plan.survivor, &plan.tombstoned, &plan.decision)
        })?;
        match outcome {
            MergeOutcome::Applied => {
                tracing::info!(
                    survivor = %plan.survivor.id,
                    tombstoned = plan.tombstoned.len(),
                    "Merged duplicate group"
                );
                Ok(MergeResult::Applied(plan))
            },
            MergeOutcome::VersionConflict { record_id } => Err(Error::VersionConflict { record_id }),
        }
    }
}

impl Default for MemoryMerger {
    fn default() -> Self {
        Self::new(MergeStrategy::default(), false)
    }
}

fn check_integrity(members: &[&MemoryRecord]) -> Result<()> {
    let tombstoned: BTreeSet<&MemoryId> = members
        .iter()
        .filter(|r| !r.is_active())
        .map(|r| &r.id)
        .collect();
    for record in members {
        record.validate()?;
        if let Some(target) = record.survivor()
            && tombstoned.contains(target)
        {
            return Err(Error::DataIntegrity(format!(
                "record {} is tombstoned onto tombstoned record {target}",
                record.id
            )));
        }
    }
    Ok(())
}

/// Resolves metadata across ranked records into `survivor`.
fn resolve_metadata(
    ranked: &[&MemoryRecord],
    survivor: &mut MemoryRecord,
) -> Vec<FieldResolution> {
    let fields: BTreeSet<&String> = ranked.iter().flat_map(|r| r.metadata.keys()).collect();
    let mut merged = BTreeMap::new();
    let mut resolutions = Vec::with_capacity(fields.len());

    for field in fields {
        let holders: Vec<(&MemoryId, &serde_json::Value)> = ranked
            .iter()
            .filter_map(|r| r.metadata.get(field).map(|v| (&r.id, v)))
            .collect();
        let non_null: Vec<&(&MemoryId, &serde_json::Value)> =
            holders.iter().filter(|(_, v)| !v.is_null()).collect();
        let Some((source, value)) = non_null.first().map(|h| **h).or_else(|| holders.first().copied())
        else {
            continue;
        };
        let conflict = non_null.iter().any(|(_, v)| *v != value);
        merged.insert(field.clone(), value.clone());
        resolutions.push(FieldResolution {
            field: field.clone(),
            source: source.clone(),
            conflict,
        });
    }

    survivor.metadata = merged;
    resolutions
}
