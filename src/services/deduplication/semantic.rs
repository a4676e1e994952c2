//! Semantic similarity detection.
//!
//! Detects duplicates by comparing embedding vectors using cosine similarity
//! over an exact in-batch vector index.

use std::collections::BTreeSet;

use tracing::instrument;

use super::detector::{DetectionContext, DetectorOutput};
use super::union_find::UnionFind;
use crate::Result;
use crate::models::{DetectionMethod, DuplicateCandidateGroup, MemoryRecord};
use crate::storage::{FlatVectorIndex, cosine_similarity};

/// Detector for records with near-identical embeddings.
///
/// # How it works
///
/// 1. Resolves each record's embedding (inline, else from the repository)
/// 2. Indexes the L2-normalized vectors
/// 3. Queries the `top_k` nearest neighbors of every record
/// 4. Links pairs whose cosine similarity meets the threshold
///
/// Records without an embedding are reported in [`DetectorOutput::skipped`].
/// Zero-norm vectors and vectors of a different dimensionality than the first
/// indexed one never match anything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SemanticSimilarityDetector {
    threshold: f32,
    top_k: usize,
}

impl SemanticSimilarityDetector {
    /// Creates a detector.
    #[must_use]
    pub const fn new(threshold: f32, top_k: usize) -> Self {
        Self { threshold, top_k }
    }

    /// Returns the similarity threshold.
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Groups records whose embeddings are at least `threshold` similar.
    ///
    /// # Errors
    ///
    /// Returns an error if an embedding lookup fails.
    #[instrument(skip_all, fields(records = records.len(), threshold = self.threshold, top_k = self.top_k))]
    pub fn detect(
        &self,
        records: &[MemoryRecord],
        context: &DetectionContext,
    ) -> Result<DetectorOutput> {
        let mut index = FlatVectorIndex::with_capacity(records.len());
        let mut skipped = Vec::new();
        let mut rejected = 0_usize;

        for (slot, record) in records.iter().enumerate() {
            if !record.is_active() {
                continue;
            }
            let embedding = match &record.embedding {
                Some(embedding) => Some(embedding.clone()),
                None => match context.repository() {
                    Some(repository) => repository.get_embedding(&record.id)?,
                    None => None,
                },
            };
            match embedding {
                Some(vector) => {
                    if !index.insert(slot, &vector) {
                        rejected += 1;
                    }
                },
                None => skipped.push(record.id.clone()),
            }
        }
        if rejected > 0 {
            tracing::debug!(rejected, "Ignored zero-norm or mismatched embeddings");
        }

        let mut uf = UnionFind::new(records.len());
        let mut edges = 0_usize;
        for slot in 0..records.len() {
            let Some(query) = index.get(slot) else {
                continue;
            };
            for (other, similarity) in index.search(query, self.top_k, Some(slot)) {
                if similarity >= self.threshold {
                    uf.union(slot, other);
                    edges += 1;
                }
            }
        }

        let mut groups = Vec::new();
        for component in uf.components() {
            let confidence = mean_pairwise_similarity(&index, &component);
            let members = component.iter().map(|slot| records[*slot].id.clone());
            groups.push(DuplicateCandidateGroup::new(
                members,
                BTreeSet::from([DetectionMethod::Semantic]),
                confidence,
            )?);
        }

        tracing::debug!(
            indexed = index.len(),
            skipped = skipped.len(),
            edges,
            groups = groups.len(),
            "Semantic detection complete"
        );
        groups.sort_by(|a, b| a.members().cmp(b.members()));
        let mut output = DetectorOutput::new(DetectionMethod::Semantic, groups);
        output.skipped = skipped;
        Ok(output)
    }
}

/// Mean cosine over every member pair, clamped to `[0, 1]`.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn mean_pairwise_similarity(index: &FlatVectorIndex, slots: &[usize]) -> f32 {
    let vectors: Vec<&[f32]> = slots.iter().filter_map(|s| index.get(*s)).collect();
    let mut total = 0.0_f64;
    let mut pairs = 0_usize;
    for (i, a) in vectors.iter().enumerate() {
        for b in &vectors[i + 1..] {
            total += f64::from(cosine_similarity(a, b));
            pairs += 1;
        }
    }
    if pairs == 0 {
        return 0.0;
    }
    ((total / pairs as f64) as f32).clamp(0.0, 1.0)
}
