//! Content normalization and fingerprinting.
//!
//! Content is normalized before hashing so that formatting differences
//! (surrounding whitespace, runs of spaces, line breaks, and optionally case)
//! do not defeat exact-match detection.

use sha2::{Digest, Sha256};

/// Content hasher for deduplication.
///
/// # Normalization
///
/// - Trimmed of leading/trailing whitespace
/// - Multiple whitespace characters collapsed to single spaces
/// - Lowercased when case folding is on (the default)
///
/// # Example
///
/// ```rust
/// use memdedup::services::deduplication::ContentHasher;
///
/// let hash = ContentHasher::hash("Use PostgreSQL for primary storage");
/// assert_eq!(hash.len(), 64);
///
/// let hash2 = ContentHasher::hash("  Use  postgresql  for  primary  storage  ");
/// assert_eq!(hash, hash2);
///
/// assert_ne!(
///     ContentHasher::hash_with("ABC", false),
///     ContentHasher::hash_with("abc", false),
/// );
/// ```
pub struct ContentHasher;

impl ContentHasher {
    /// Computes the SHA-256 fingerprint of case-folded normalized content.
    #[must_use]
    pub fn hash(content: &str) -> String {
        Self::hash_with(content, true)
    }

    /// Computes the SHA-256 fingerprint, optionally case folding.
    ///
    /// Returns the lowercase hex digest (64 characters).
    #[must_use]
    pub fn hash_with(content: &str, case_fold: bool) -> String {
        Self::hash_normalized(&Self::normalize_with(content, case_fold))
    }

    /// Hashes text that is already normalized.
    #[must_use]
    pub fn hash_normalized(normalized: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Normalizes content with case folding.
    ///
    /// ```rust
    /// use memdedup::services::deduplication::ContentHasher;
    ///
    /// assert_eq!(ContentHasher::normalize("  Hello   WORLD  "), "hello world");
    /// ```
    #[must_use]
    pub fn normalize(content: &str) -> String {
        Self::normalize_with(content, true)
    }

    /// Normalizes content, optionally case folding.
    #[must_use]
    pub fn normalize_with(content: &str, case_fold: bool) -> String {
        let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
        if case_fold {
            collapsed.to_lowercase()
        } else {
            collapsed
        }
    }
}
