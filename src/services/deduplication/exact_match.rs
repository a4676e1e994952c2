//! Exact match detection.
//!
//! Detects duplicates by bucketing records on the SHA-256 fingerprint of
//! their normalized content.

use std::borrow::Cow;
use std::collections::BTreeMap;

use tracing::instrument;

use super::detector::{DetectionContext, DetectorOutput, IndexUpdate};
use super::hasher::ContentHasher;
use crate::Result;
use crate::models::{DetectionMethod, DuplicateCandidateGroup, MemoryRecord};

/// Detector for byte-identical normalized content.
///
/// # How it works
///
/// 1. Takes the fingerprint of each active, non-blank record
/// 2. Buckets records by fingerprint
/// 3. Emits every bucket with two or more records at confidence 1.0
///
/// With case folding on, the fingerprint stored on the record is used as is;
/// it is only recomputed when missing or when case must be preserved.
///
/// A record alone in its bucket whose fingerprint the known-unique index
/// already maps to that same record is passed over and reported in
/// [`DetectorOutput::known_unique`]. Index maintenance (mark singletons,
/// forget grouped fingerprints) is returned as
/// [`DetectorOutput::index_updates`] rather than written here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExactMatchDetector {
    case_fold: bool,
}

impl ExactMatchDetector {
    /// Creates a detector.
    #[must_use]
    pub const fn new(case_fold: bool) -> Self {
        Self { case_fold }
    }

    /// Groups records with identical normalized content.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature matches the other detectors.
    #[instrument(skip_all, fields(records = records.len()))]
    pub fn detect(
        &self,
        records: &[MemoryRecord],
        context: &DetectionContext,
    ) -> Result<DetectorOutput> {
        let mut buckets: BTreeMap<Cow<'_, str>, Vec<usize>> = BTreeMap::new();
        for (idx, record) in records.iter().enumerate() {
            if !record.is_active() {
                continue;
            }
            if let Some(fingerprint) = self.fingerprint(record) {
                buckets.entry(fingerprint).or_default().push(idx);
            }
        }

        let index = context.known_unique();
        let mut groups = Vec::new();
        let mut known_unique = Vec::new();
        let mut index_updates = Vec::new();
        for (fingerprint, indices) in buckets {
            if let [only] = indices.as_slice() {
                let id = &records[*only].id;
                if let Some(index) = index {
                    if index.is_known_unique(&fingerprint, id) {
                        known_unique.push(id.clone());
                    } else {
                        index_updates.push(IndexUpdate::MarkUnique {
                            fingerprint: fingerprint.into_owned(),
                            record_id: id.clone(),
                        });
                    }
                }
                continue;
            }
            if index.is_some() {
                index_updates.push(IndexUpdate::Forget {
                    fingerprint: fingerprint.into_owned(),
                });
            }
            let members = indices.iter().map(|i| records[*i].id.clone());
            groups.push(DuplicateCandidateGroup::single(
                members,
                DetectionMethod::Exact,
                1.0,
            )?);
        }

        if !known_unique.is_empty() {
            metrics::counter!("dedup_known_unique_hits_total").increment(known_unique.len() as u64);
            tracing::debug!(known_hits = known_unique.len(), "Skipped known-unique records");
        }

        groups.sort_by(|a, b| a.members().cmp(b.members()));
        known_unique.sort();
        let mut output = DetectorOutput::new(DetectionMethod::Exact, groups);
        output.known_unique = known_unique;
        output.index_updates = index_updates;
        Ok(output)
    }

    /// Returns the bucket key for a record, or `None` for blank content.
    fn fingerprint<'a>(&self, record: &'a MemoryRecord) -> Option<Cow<'a, str>> {
        // Stored fingerprints are always case folded.
        if self.case_fold && !record.fingerprint.is_empty() {
            return (!record.content.trim().is_empty())
                .then_some(Cow::Borrowed(record.fingerprint.as_str()));
        }
        let normalized = ContentHasher::normalize_with(&record.content, self.case_fold);
        (!normalized.is_empty()).then(|| Cow::Owned(ContentHasher::hash_normalized(&normalized)))
    }
}

impl Default for ExactMatchDetector {
    fn default() -> Self {
        Self::new(true)
    }
}
