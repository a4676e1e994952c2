//! Duplicate candidate groups and detection methods.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::MemoryId;
use crate::{Error, Result};

/// Detection strategy that produced a duplicate signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Identical normalized content (SHA-256 fingerprint).
    Exact,
    /// Near-identical text (string similarity).
    Fuzzy,
    /// Similar embeddings (cosine similarity).
    Semantic,
}

impl DetectionMethod {
    /// All detection methods, in precedence order.
    pub const ALL: [Self; 3] = [Self::Exact, Self::Fuzzy, Self::Semantic];

    /// Returns the method as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Semantic => "semantic",
        }
    }

    /// Parses a method name (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Some(Self::Exact),
            "fuzzy" => Some(Self::Fuzzy),
            "semantic" => Some(Self::Semantic),
            _ => None,
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A set of records believed to be duplicates of each other.
///
/// Members are kept sorted and unique; a group always has at least two members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCandidateGroup {
    members: Vec<MemoryId>,
    methods: BTreeSet<DetectionMethod>,
    confidence: f32,
}

impl DuplicateCandidateGroup {
    /// Creates a group.
    ///
    /// Members are deduplicated and sorted; confidence is clamped to `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if fewer than two distinct members are
    /// given, no method is given, or the confidence is not finite.
    pub fn new<I>(members: I, methods: BTreeSet<DetectionMethod>, confidence: f32) -> Result<Self>
    where
        I: IntoIterator<Item = MemoryId>,
    {
        let members: BTreeSet<MemoryId> = members.into_iter().collect();
        if members.len() < 2 {
            return Err(Error::InvalidInput(format!(
                "duplicate group needs at least 2 members, got {}",
                members.len()
            )));
        }
        if methods.is_empty() {
            return Err(Error::InvalidInput(
                "duplicate group needs at least one detection method".to_string(),
            ));
        }
        if !confidence.is_finite() {
            return Err(Error::InvalidInput(format!(
                "group confidence must be finite, got {confidence}"
            )));
        }
        Ok(Self {
            members: members.into_iter().collect(),
            methods,
            confidence: confidence.clamp(0.0, 1.0),
        })
    }

    /// Creates a group found by a single method.
    ///
    /// # Errors
    ///
    /// Same as [`DuplicateCandidateGroup::new`].
    pub fn single<I>(members: I, method: DetectionMethod, confidence: f32) -> Result<Self>
    where
        I: IntoIterator<Item = MemoryId>,
    {
        Self::new(members, BTreeSet::from([method]), confidence)
    }

    /// Returns the sorted member identifiers.
    #[must_use]
    pub fn members(&self) -> &[MemoryId] {
        &self.members
    }

    /// Returns the contributing detection methods.
    #[must_use]
    pub const fn methods(&self) -> &BTreeSet<DetectionMethod> {
        &self.methods
    }

    /// Returns the group confidence in `[0, 1]`.
    #[must_use]
    pub const fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Returns true if `id` is a member.
    #[must_use]
    pub fn contains(&self, id: &MemoryId) -> bool {
        self.members.binary_search(id).is_ok()
    }

    /// Returns the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false: groups have at least two members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns a `+`-joined label of the contributing methods.
    #[must_use]
    pub fn methods_label(&self) -> String {
        self.methods
            .iter()
            .map(DetectionMethod::as_str)
            .collect::<Vec<_>>()
            .join("+")
    }
}
