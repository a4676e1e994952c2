//! Merge decisions (the audit trail).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::{DetectionMethod, MemoryId, RunId};
use crate::config::MergeStrategy;

/// Which record a merged metadata field was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldResolution {
    /// Metadata field name.
    pub field: String,
    /// Record the surviving value came from.
    pub source: MemoryId,
    /// True when two or more records held different non-null values.
    pub conflict: bool,
}

/// Record of one executed (or, in dry-run mode, planned) merge.
///
/// Created once per merge and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeDecision {
    /// Unique decision identifier.
    pub decision_id: String,
    /// Run that produced the decision.
    pub run_id: RunId,
    /// All records that took part in the merge (survivor included), sorted.
    pub source_ids: Vec<MemoryId>,
    /// The record that survived.
    pub survivor_id: MemoryId,
    /// Strategy used to pick the survivor and resolve conflicts.
    pub strategy: MergeStrategy,
    /// Detection methods that grouped the records.
    pub methods: BTreeSet<DetectionMethod>,
    /// Group confidence.
    pub confidence: f32,
    /// Per-field metadata resolutions.
    pub field_resolutions: Vec<FieldResolution>,
    /// Versions observed before the merge, keyed by record.
    pub expected_versions: BTreeMap<MemoryId, u64>,
    /// True if nothing was written.
    pub dry_run: bool,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

impl MergeDecision {
    /// Generates a fresh decision identifier.
    #[must_use]
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Returns the identifiers of the records that were tombstoned.
    pub fn tombstoned_ids(&self) -> impl Iterator<Item = &MemoryId> {
        self.source_ids
            .iter()
            .filter(move |id| **id != self.survivor_id)
    }
}
