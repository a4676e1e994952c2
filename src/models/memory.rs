//! Memory record types and identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::services::deduplication::ContentHasher;
use crate::{Error, Result};

/// Unique identifier for a memory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(String);

impl MemoryId {
    /// Creates a new memory ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MemoryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MemoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Merge state of a memory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MergeState {
    /// The record is live and eligible for deduplication.
    #[default]
    Active,
    /// The record was merged into `survivor` and is retained for audit only.
    Tombstoned {
        /// The active record this one was merged into.
        survivor: MemoryId,
        /// When the record was tombstoned.
        tombstoned_at: DateTime<Utc>,
    },
}

impl MergeState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Tombstoned { .. } => "tombstoned",
        }
    }
}

/// A free-text memory record.
///
/// Records are created and updated by the surrounding system; the engine only
/// ever mutates them by merging (survivor update + tombstoning).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier.
    pub id: MemoryId,
    /// The memory content.
    pub content: String,
    /// Hex SHA-256 of the normalized content.
    #[serde(default)]
    pub fingerprint: String,
    /// Optional embedding vector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Tags for categorization.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Free-form metadata. JSON `null` marks an unset field.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Importance score.
    #[serde(default)]
    pub importance: f32,
    /// Creation timestamp (Unix epoch seconds).
    #[serde(default)]
    pub created_at: u64,
    /// Last update timestamp (Unix epoch seconds).
    #[serde(default)]
    pub updated_at: u64,
    /// Version counter, bumped on every engine write.
    #[serde(default)]
    pub version: u64,
    /// Merge state.
    #[serde(default)]
    pub merge_state: MergeState,
}

impl MemoryRecord {
    /// Creates an active record with a computed fingerprint.
    #[must_use]
    pub fn new(id: impl Into<MemoryId>, content: impl Into<String>) -> Self {
        let content = content.into();
        let fingerprint = ContentHasher::hash(&content);
        let now = crate::current_timestamp();
        Self {
            id: id.into(),
            content,
            fingerprint,
            embedding: None,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            importance: 0.0,
            created_at: now,
            updated_at: now,
            version: 1,
            merge_state: MergeState::Active,
        }
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Adds several tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Sets a metadata field.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Sets the embedding.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Sets the importance score.
    #[must_use]
    pub const fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    /// Sets created/updated timestamps.
    #[must_use]
    pub const fn with_timestamps(mut self, created_at: u64, updated_at: u64) -> Self {
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    /// Sets the version counter.
    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Returns true if the record is active.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.merge_state, MergeState::Active)
    }

    /// Returns the survivor this record was merged into, if tombstoned.
    #[must_use]
    pub const fn survivor(&self) -> Option<&MemoryId> {
        match &self.merge_state {
            MergeState::Active => None,
            MergeState::Tombstoned { survivor, .. } => Some(survivor),
        }
    }

    /// Recomputes the fingerprint from the current content.
    pub fn refresh_fingerprint(&mut self) {
        self.fingerprint = ContentHasher::hash(&self.content);
    }

    /// Counts metadata fields holding a meaningful value.
    ///
    /// `null`, blank strings, and empty arrays/objects do not count.
    #[must_use]
    pub fn non_empty_metadata_count(&self) -> usize {
        self.metadata.values().filter(|v| is_non_empty(v)).count()
    }

    /// Approximate bytes held by this record's payload.
    #[must_use]
    pub fn storage_bytes(&self) -> u64 {
        let embedding_bytes = self
            .embedding
            .as_ref()
            .map_or(0, |e| e.len() * std::mem::size_of::<f32>());
        (self.content.len() + embedding_bytes) as u64
    }

    /// Checks invariants that can be verified on a single record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DataIntegrity`] if the record is tombstoned onto itself
    /// or carries a non-finite importance score.
    pub fn validate(&self) -> Result<()> {
        if let Some(survivor) = self.survivor()
            && survivor == &self.id
        {
            return Err(Error::DataIntegrity(format!(
                "record {} is tombstoned onto itself",
                self.id
            )));
        }
        if !self.importance.is_finite() {
            return Err(Error::DataIntegrity(format!(
                "record {} has non-finite importance",
                self.id
            )));
        }
        Ok(())
    }
}

/// Returns true if a metadata value carries information.
#[must_use]
pub fn is_non_empty(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.trim().is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        serde_json::Value::Bool(_) | serde_json::Value::Number(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_record_is_active_with_fingerprint() {
        let record = MemoryRecord::new("m-1", "Use PostgreSQL for storage");
        assert!(record.is_active());
        assert_eq!(record.fingerprint.len(), 64);
        assert_eq!(record.version, 1);
        assert!(record.survivor().is_none());
    }

    #[test]
    fn test_non_empty_metadata_count() {
        let record = MemoryRecord::new("m-1", "content")
            .with_metadata("source", json!("slack"))
            .with_metadata("owner", json!(null))
            .with_metadata("note", json!("   "))
            .with_metadata("links", json!([]))
            .with_metadata("priority", json!(3))
            .with_metadata("reviewed", json!(false));
        assert_eq!(record.non_empty_metadata_count(), 3);
    }

    #[test]
    fn test_storage_bytes_counts_embedding() {
        let record = MemoryRecord::new("m-1", "abcd").with_embedding(vec![0.0; 8]);
        assert_eq!(record.storage_bytes(), 4 + 32);
    }

    #[test]
    fn test_validate_rejects_self_tombstone() {
        let mut record = MemoryRecord::new("m-1", "content");
        record.merge_state = MergeState::Tombstoned {
            survivor: MemoryId::new("m-1"),
            tombstoned_at: Utc::now(),
        };
        assert!(matches!(record.validate(), Err(Error::DataIntegrity(_))));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let record: MemoryRecord =
            serde_json::from_str(r#"{"id":"m-9","content":"hello"}"#).unwrap();
        assert!(record.is_active());
        assert!(record.tags.is_empty());
        assert!(record.fingerprint.is_empty());
    }

    #[test]
    fn test_merge_state_serialization() {
        let state = MergeState::Tombstoned {
            survivor: MemoryId::new("m-2"),
            tombstoned_at: DateTime::from_timestamp(0, 0).unwrap_or_default(),
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["state"], "tombstoned");
        assert_eq!(value["survivor"], "m-2");
    }
}
