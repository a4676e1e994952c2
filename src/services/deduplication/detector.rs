//! The closed set of duplicate detectors.

use std::sync::Arc;
use std::time::Duration;

use super::exact_match::ExactMatchDetector;
use super::fuzzy::FuzzyMatchDetector;
use super::known_unique::KnownUniqueIndex;
use super::semantic::SemanticSimilarityDetector;
use crate::Result;
use crate::config::DedupSettings;
use crate::models::{DetectionMethod, DuplicateCandidateGroup, MemoryId, MemoryRecord};
use crate::storage::MemoryRepository;

/// Collaborators a detector may consult.
///
/// Everything a detector needs beyond the batch itself arrives here, so the
/// detectors hold no run state of their own.
#[derive(Clone, Default)]
pub struct DetectionContext {
    repository: Option<Arc<dyn MemoryRepository>>,
    known_unique: Option<Arc<dyn KnownUniqueIndex>>,
}

impl DetectionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the repository used for embedding lookups.
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn MemoryRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Sets the known-unique fingerprint index.
    #[must_use]
    pub fn with_known_unique(mut self, index: Arc<dyn KnownUniqueIndex>) -> Self {
        self.known_unique = Some(index);
        self
    }

    /// Returns the repository, if any.
    #[must_use]
    pub fn repository(&self) -> Option<&dyn MemoryRepository> {
        self.repository.as_deref()
    }

    /// Returns the known-unique index, if any.
    #[must_use]
    pub fn known_unique(&self) -> Option<&dyn KnownUniqueIndex> {
        self.known_unique.as_deref()
    }
}

/// A pending write to the known-unique index.
///
/// Detectors never write the index themselves. Updates travel with the
/// [`DetectorOutput`] and are committed only once that output is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexUpdate {
    /// The fingerprint is held by this record alone.
    MarkUnique {
        /// Content fingerprint.
        fingerprint: String,
        /// The only record holding it.
        record_id: MemoryId,
    },
    /// The fingerprint is shared and must not be skipped.
    Forget {
        /// Content fingerprint.
        fingerprint: String,
    },
}

/// What one detector found in one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorOutput {
    /// The detector that ran.
    pub method: DetectionMethod,
    /// Disjoint groups, each sorted, ordered by first member.
    pub groups: Vec<DuplicateCandidateGroup>,
    /// Records the detector could not consider (e.g. no embedding).
    pub skipped: Vec<MemoryId>,
    /// Records passed over because their fingerprint is known-unique.
    pub known_unique: Vec<MemoryId>,
    /// Index writes to commit if this output is accepted.
    pub index_updates: Vec<IndexUpdate>,
    /// Wall time spent.
    pub elapsed: Duration,
}

impl DetectorOutput {
    /// Creates an output with no skipped records.
    #[must_use]
    pub const fn new(method: DetectionMethod, groups: Vec<DuplicateCandidateGroup>) -> Self {
        Self {
            method,
            groups,
            skipped: Vec::new(),
            known_unique: Vec::new(),
            index_updates: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Applies the pending index writes, in order.
    pub fn commit_index_updates(&self, index: &dyn KnownUniqueIndex) {
        for update in &self.index_updates {
            match update {
                IndexUpdate::MarkUnique {
                    fingerprint,
                    record_id,
                } => index.mark_unique(fingerprint, record_id),
                IndexUpdate::Forget { fingerprint } => index.forget(fingerprint),
            }
        }
    }
}

/// A duplicate detector.
#[derive(Debug, Clone, PartialEq)]
pub enum Detector {
    /// Fingerprint equality.
    Exact(ExactMatchDetector),
    /// Text similarity.
    Fuzzy(FuzzyMatchDetector),
    /// Embedding similarity.
    Semantic(SemanticSimilarityDetector),
}

impl Detector {
    /// Builds the detector for `method` from settings.
    #[must_use]
    pub fn for_method(method: DetectionMethod, settings: &DedupSettings) -> Self {
        match method {
            DetectionMethod::Exact => Self::Exact(ExactMatchDetector::new(settings.case_fold())),
            DetectionMethod::Fuzzy => Self::Fuzzy(FuzzyMatchDetector::new(
                settings.similarity_threshold_fuzzy(),
                settings.case_fold(),
            )),
            DetectionMethod::Semantic => Self::Semantic(SemanticSimilarityDetector::new(
                settings.similarity_threshold_semantic(),
                settings.semantic_top_k(),
            )),
        }
    }

    /// Builds every detector enabled in `settings`, in method order.
    #[must_use]
    pub fn enabled(settings: &DedupSettings) -> Vec<Self> {
        settings
            .enabled_detectors()
            .iter()
            .map(|method| Self::for_method(*method, settings))
            .collect()
    }

    /// Returns the detection method.
    #[must_use]
    pub const fn method(&self) -> DetectionMethod {
        match self {
            Self::Exact(_) => DetectionMethod::Exact,
            Self::Fuzzy(_) => DetectionMethod::Fuzzy,
            Self::Semantic(_) => DetectionMethod::Semantic,
        }
    }

    /// Runs the detector over a batch.
    ///
    /// # Errors
    ///
    /// Returns an error if a collaborator lookup fails.
    pub fn detect(
        &self,
        records: &[MemoryRecord],
        context: &DetectionContext,
    ) -> Result<DetectorOutput> {
        let start = std::time::Instant::now();
        let mut output = match self {
            Self::Exact(detector) => detector.detect(records, context),
            Self::Fuzzy(detector) => detector.detect(records),
            Self::Semantic(detector) => detector.detect(records, context),
        }?;
        output.elapsed = start.elapsed();
        Ok(output)
    }
}
