//! Fuzzy text similarity detection.
//!
//! Scores candidate pairs with a weighted blend of token-set Jaccard and the
//! normalized Levenshtein ratio, then groups connected pairs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::instrument;

use super::detector::DetectorOutput;
use super::hasher::ContentHasher;
use super::union_find::UnionFind;
use crate::Result;
use crate::models::{DetectionMethod, DuplicateCandidateGroup, MemoryRecord};

/// Weight of the token-set Jaccard component.
pub const JACCARD_WEIGHT: f64 = 0.4;

/// Weight of the Levenshtein ratio component.
pub const LEVENSHTEIN_WEIGHT: f64 = 0.6;

/// Texts longer than this (in chars) are scored on Jaccard alone.
pub const MAX_EDIT_DISTANCE_CHARS: usize = 4096;

/// Detector for near-identical text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuzzyMatchDetector {
    threshold: f32,
    case_fold: bool,
}

struct Prepared {
    index: usize,
    chars: Vec<char>,
    tokens: BTreeSet<String>,
}

impl FuzzyMatchDetector {
    /// Creates a detector. Pairs scoring at or above `threshold` are linked.
    #[must_use]
    pub const fn new(threshold: f32, case_fold: bool) -> Self {
        Self {
            threshold,
            case_fold,
        }
    }

    /// Returns the similarity threshold.
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Groups records whose text similarity meets the threshold.
    ///
    /// # Errors
    ///
    /// Returns an error only if a group cannot be constructed.
    #[instrument(skip_all, fields(records = records.len(), threshold = self.threshold))]
    pub fn detect(&self, records: &[MemoryRecord]) -> Result<DetectorOutput> {
        let prepared: Vec<Prepared> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_active())
            .filter_map(|(index, record)| {
                let normalized = ContentHasher::normalize_with(&record.content, self.case_fold);
                if normalized.is_empty() {
                    return None;
                }
                Some(Prepared {
                    index,
                    tokens: tokenize(&normalized),
                    chars: normalized.chars().collect(),
                })
            })
            .collect();

        // token -> positions in `prepared`
        let mut inverted: HashMap<&str, Vec<usize>> = HashMap::new();
        for (pos, entry) in prepared.iter().enumerate() {
            for token in &entry.tokens {
                inverted.entry(token.as_str()).or_default().push(pos);
            }
        }
        let mut candidates: BTreeSet<(usize, usize)> = BTreeSet::new();
        for positions in inverted.values() {
            for (i, a) in positions.iter().enumerate() {
                for b in &positions[i + 1..] {
                    candidates.insert(((*a).min(*b), (*a).max(*b)));
                }
            }
        }

        let mut uf = UnionFind::new(prepared.len());
        let mut edges: Vec<(usize, usize, f32)> = Vec::new();
        for (a, b) in candidates {
            if let Some(score) = self.score_pair(&prepared[a], &prepared[b]) {
                uf.union(a, b);
                edges.push((a, b, score));
            }
        }

        let mut weights: BTreeMap<usize, (f64, u32)> = BTreeMap::new();
        for (a, _, score) in &edges {
            let root = uf.find(*a);
            let entry = weights.entry(root).or_insert((0.0, 0));
            entry.0 += f64::from(*score);
            entry.1 += 1;
        }

        let mut groups = Vec::new();
        for component in uf.components() {
            let root = uf.find(component[0]);
            let (sum, count) = weights.get(&root).copied().unwrap_or((0.0, 0));
            let confidence = if count == 0 {
                0.0
            } else {
                sum / f64::from(count)
            };
            let members = component
                .iter()
                .map(|pos| records[prepared[*pos].index].id.clone());
            #[allow(clippy::cast_possible_truncation)]
            groups.push(DuplicateCandidateGroup::single(
                members,
                DetectionMethod::Fuzzy,
                confidence as f32,
            )?);
        }

        tracing::debug!(
            candidates = edges.len(),
            groups = groups.len(),
            "Fuzzy detection complete"
        );
        groups.sort_by(|a, b| a.members().cmp(b.members()));
        Ok(DetectorOutput::new(DetectionMethod::Fuzzy, groups))
    }

    /// Scores a pair, returning `None` below the threshold.
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn score_pair(&self, a: &Prepared, b: &Prepared) -> Option<f32> {
        let jaccard = jaccard(&a.tokens, &b.tokens);
        let longest = a.chars.len().max(b.chars.len());
        let score = if longest > MAX_EDIT_DISTANCE_CHARS {
            jaccard
        } else {
            let shortest = a.chars.len().min(b.chars.len());
            // Edit distance is at least the length difference.
            let bound = JACCARD_WEIGHT.mul_add(
                jaccard,
                LEVENSHTEIN_WEIGHT * (shortest as f64 / longest as f64),
            );
            if (bound as f32) + 1e-6 < self.threshold {
                return None;
            }
            let ratio = 1.0 - levenshtein(&a.chars, &b.chars) as f64 / longest as f64;
            JACCARD_WEIGHT.mul_add(jaccard, LEVENSHTEIN_WEIGHT * ratio)
        };
        let score = score as f32;
        (score >= self.threshold).then_some(score)
    }
}

/// Splits normalized text into a token set, trimming edge punctuation.
#[must_use]
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split_whitespace()
        .map(|word| word.trim_matches(|c: char| c.is_ascii_punctuation()))
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity of two token sets; 0 when both are empty.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Character-level Levenshtein distance using two rows.
#[must_use]
pub fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Blended similarity of two raw texts, as the detector scores them.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn similarity(a: &str, b: &str, case_fold: bool) -> f32 {
    let a = ContentHasher::normalize_with(a, case_fold);
    let b = ContentHasher::normalize_with(b, case_fold);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let jac = jaccard(&tokenize(&a), &tokenize(&b));
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let longest = a_chars.len().max(b_chars.len());
    if longest > MAX_EDIT_DISTANCE_CHARS {
        return jac as f32;
    }
    let ratio = 1.0 - levenshtein(&a_chars, &b_chars) as f64 / longest as f64;
    JACCARD_WEIGHT.mul_add(jac, LEVENSHTEIN_WEIGHT * ratio) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemoryId;
    use test_case::test_case;

    const BASE: &str =
        "The deployment pipeline runs the full integration suite on every pull request before merge";

    #[test_case("kitten", "sitting", 3 ; "classic")]
    #[test_case("", "abc", 3 ; "empty left")]
    #[test_case("abc", "abc", 0 ; "identical")]
    #[test_case("数据库", "数据", 1 ; "multibyte")]
    fn test_levenshtein(a: &str, b: &str, expected: usize) {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        assert_eq!(levenshtein(&a, &b), expected);
    }

    #[test]
    fn test_tokenize_trims_punctuation() {
        let tokens = tokenize("hello, world! (hello)");
        assert_eq!(tokens.len(), 2);
        assert!(tokens.contains("hello"));
        assert!(tokens.contains("world"));
    }

    #[test]
    fn test_near_duplicates_grouped() {
        let records = vec![
            MemoryRecord::new("a", BASE),
            MemoryRecord::new("b", format!("{BASE}s")),
            MemoryRecord::new("c", "Completely unrelated note about lunch"),
        ];
        let output = FuzzyMatchDetector::new(0.85, true).detect(&records).unwrap();
        assert_eq!(output.groups.len(), 1);
        let group = &output.groups[0];
        assert_eq!(group.members(), &[MemoryId::new("a"), MemoryId::new("b")]);
        assert!(group.confidence() >= 0.9);
        assert!(group.confidence() < 1.0);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let a = BASE;
        let b = format!("{BASE}s");
        let score = similarity(a, &b, true);
        let records = vec![MemoryRecord::new("a", a), MemoryRecord::new("b", b)];
        assert_eq!(
            FuzzyMatchDetector::new(score, true)
                .detect(&records)
                .unwrap()
                .groups
                .len(),
            1
        );
        assert!(
            FuzzyMatchDetector::new(score + 0.001, true)
                .detect(&records)
                .unwrap()
                .groups
                .is_empty()
        );
    }

    #[test]
    fn test_chain_forms_single_group() {
        let records = vec![
            MemoryRecord::new("a", BASE),
            MemoryRecord::new("b", format!("{BASE}s")),
            MemoryRecord::new("c", format!("{BASE}s!")),
        ];
        let output = FuzzyMatchDetector::new(0.85, true).detect(&records).unwrap();
        assert_eq!(output.groups.len(), 1);
        assert_eq!(output.groups[0].len(), 3);
    }

    #[test]
    fn test_disjoint_vocabulary_never_compared() {
        let records = vec![
            MemoryRecord::new("a", "alpha beta"),
            MemoryRecord::new("b", "gamma delta"),
        ];
        let output = FuzzyMatchDetector::new(0.0, true).detect(&records).unwrap();
        assert!(output.groups.is_empty());
    }

    #[test]
    fn test_empty_content_ignored() {
        let records = vec![MemoryRecord::new("a", ""), MemoryRecord::new("b", "  ")];
        let output = FuzzyMatchDetector::new(0.0, true).detect(&records).unwrap();
        assert!(output.groups.is_empty());
    }
}
