//! # memdedup
//!
//! Deduplication and consolidation engine for free-text memory records.
//!
//! memdedup scans a growing collection of memories in batches, finds records
//! that are exact, near-textual, or semantic duplicates of each other, and
//! merges every duplicate group into one surviving record. The losers are kept
//! as tombstones that point at the survivor, so nothing is ever lost.
//!
//! ## Features
//!
//! - Three detectors (exact fingerprint, fuzzy text, embedding similarity)
//!   running concurrently per batch
//! - Transitive grouping through an index-based union-find
//! - Deterministic survivor selection and field-level metadata resolution
//! - Resumable, pausable, cancelable runs with per-batch checkpoints
//! - Optimistic concurrency on merge writes
//!
//! ## Example
//!
//! ```rust,ignore
//! use memdedup::config::DedupSettings;
//! use memdedup::services::deduplication::DeduplicationOrchestrator;
//! use memdedup::storage::{InMemoryRepository, InMemoryReviewQueue};
//! use memdedup::observability::EventBus;
//! use std::sync::Arc;
//!
//! let repository = Arc::new(InMemoryRepository::new());
//! let orchestrator = DeduplicationOrchestrator::new(
//!     repository,
//!     Arc::new(InMemoryReviewQueue::new()),
//!     EventBus::new(256),
//! );
//! let run = orchestrator.run_to_completion(DedupSettings::default())?;
//! println!("merged {} groups", run.counters.merges_executed);
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use config::{DedupSettings, DedupSettingsBuilder, EngineConfig, MergeStrategy};
pub use models::{
    DeduplicationRun, DetectionMethod, DuplicateCandidateGroup, MemoryId, MemoryRecord,
    MergeDecision, MergeState, RunId, RunState,
};
pub use services::deduplication::{DeduplicationOrchestrator, HybridDetector, MemoryMerger};
pub use storage::{InMemoryRepository, InMemoryReviewQueue, MemoryRepository, ReviewQueue};

/// Error type for memdedup operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When | Fatal to a run |
/// |---------|-------------|----------------|
/// | `Configuration` | Settings out of range, no detector enabled, bad config file values | Yes, at start |
/// | `DetectorFailure` | A detector errors, panics, or misses its deadline | No (degraded) |
/// | `Repository` | Fetch/apply/checkpoint calls fail | Yes, once retries are exhausted |
/// | `VersionConflict` | A record changed between read and merge write | No (group deferred) |
/// | `DataIntegrity` | Tombstone chains or self-references | No (merge aborted) |
/// | `Conflict` | A second run is started while one is active | Start rejected |
/// | `NotFound` | Unknown run identifier | - |
/// | `InvalidTransition` | Illegal run state change (e.g. resuming a running run) | - |
/// | `InvalidInput` | Malformed arguments (e.g. a group with fewer than two members) | - |
/// | `OperationFailed` | File I/O, parsing, observability setup | - |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Settings failed validation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A single detector failed for a batch.
    ///
    /// Never fatal; the batch continues with the remaining detectors.
    #[error("detector '{detector}' failed: {cause}")]
    DetectorFailure {
        /// The detector that failed.
        detector: models::DetectionMethod,
        /// The underlying cause.
        cause: String,
    },

    /// A repository call failed.
    #[error("repository operation '{operation}' failed: {cause}")]
    Repository {
        /// The repository operation.
        operation: String,
        /// The underlying cause.
        cause: String,
        /// Whether retrying may succeed (connectivity, timeouts).
        transient: bool,
    },

    /// An optimistic-concurrency check rejected a merge write.
    #[error("version conflict on record {record_id}")]
    VersionConflict {
        /// The record whose version changed.
        record_id: MemoryId,
    },

    /// Stored data violates a structural invariant.
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// The operation conflicts with an active run.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A run state transition is not allowed.
    #[error("invalid run state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: models::RunState,
        /// Requested state.
        to: models::RunState,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Creates a transient repository error.
    #[must_use]
    pub fn transient(operation: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Repository {
            operation: operation.into(),
            cause: cause.into(),
            transient: true,
        }
    }

    /// Creates a permanent repository error.
    #[must_use]
    pub fn permanent(operation: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Repository {
            operation: operation.into(),
            cause: cause.into(),
            transient: false,
        }
    }

    /// Returns true if retrying the failed call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Repository { transient: true, .. })
    }
}

/// Result type alias for memdedup operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in seconds.
///
/// Falls back to 0 if the system clock is before the Unix epoch.
///
/// # Examples
///
/// ```rust
/// use memdedup::current_timestamp;
///
/// let ts = current_timestamp();
/// assert!(ts > 0);
/// ```
#[must_use]
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
