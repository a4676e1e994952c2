//! Exact in-memory vector index.
//!
//! Vectors are L2-normalized on insert, so a dot product is the cosine
//! similarity of the original vectors. Search is brute force, which is exact
//! and fast enough at batch scale.

/// Computes cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if the vectors are empty,
/// have different lengths, or either has zero norm.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 || !norm_a.is_finite() || !norm_b.is_finite() {
        return 0.0;
    }

    (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Returns the L2-normalized vector, or `None` for empty, zero-norm, or
/// non-finite input.
#[must_use]
pub fn l2_normalize(vector: &[f32]) -> Option<Vec<f32>> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if vector.is_empty() || norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(vector.iter().map(|x| x / norm).collect())
}

/// Brute-force cosine index keyed by slot number.
///
/// Vectors live at their slot position, so [`FlatVectorIndex::get`] is a
/// direct lookup.
#[derive(Debug, Clone, Default)]
pub struct FlatVectorIndex {
    dimensions: Option<usize>,
    slots: Vec<Option<Vec<f32>>>,
    len: usize,
}

impl FlatVectorIndex {
    /// Creates an empty index. The first insert fixes the dimensionality.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty index with room for `slots` slots.
    #[must_use]
    pub fn with_capacity(slots: usize) -> Self {
        Self {
            dimensions: None,
            slots: Vec::with_capacity(slots),
            len: 0,
        }
    }

    /// Number of indexed vectors.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is indexed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Indexed dimensionality, once known.
    #[must_use]
    pub const fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    /// Inserts a vector under `slot`, replacing any vector already there.
    ///
    /// Returns false (and indexes nothing) for zero-norm vectors or a
    /// dimension that differs from the first inserted vector.
    pub fn insert(&mut self, slot: usize, vector: &[f32]) -> bool {
        if self.dimensions.is_some_and(|d| d != vector.len()) {
            return false;
        }
        let Some(normalized) = l2_normalize(vector) else {
            return false;
        };
        self.dimensions = Some(vector.len());
        if slot >= self.slots.len() {
            self.slots.resize(slot + 1, None);
        }
        if self.slots[slot].replace(normalized).is_none() {
            self.len += 1;
        }
        true
    }

    /// Returns the stored normalized vector for `slot`.
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&[f32]> {
        self.slots.get(slot)?.as_deref()
    }

    /// Returns up to `limit` `(slot, similarity)` pairs, best first.
    ///
    /// `query` must already be normalized. `exclude` skips one slot (the
    /// querying record itself). Ties break on the lower slot.
    #[must_use]
    pub fn search(&self, query: &[f32], limit: usize, exclude: Option<usize>) -> Vec<(usize, f32)> {
        if self.dimensions != Some(query.len()) || limit == 0 {
            return Vec::new();
        }
        let mut scores: Vec<(usize, f32)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(slot, _)| Some(*slot) != exclude)
            .filter_map(|(slot, v)| {
                let v = v.as_deref()?;
                let dot: f32 = query.iter().zip(v).map(|(a, b)| a * b).sum();
                Some((slot, dot.clamp(-1.0, 1.0)))
            })
            .collect();
        scores.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scores.truncate(limit);
        scores
    }
}
