//! Deduplication run lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{DetectionMethod, DuplicateCandidateGroup, MergeDecision};
use crate::config::DedupSettings;
use crate::{Error, Result};

/// Unique identifier for a deduplication run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generates a new time-ordered run ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Wraps an existing identifier.
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

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run lifecycle state.
///
/// ```text
/// Idle ──► Running ◄──► Paused
///             │            │
///             ▼            ▼
///   Completed | Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, not yet processing.
    #[default]
    Idle,
    /// Processing batches.
    Running,
    /// Suspended between batches.
    Paused,
    /// Finished all batches.
    Completed,
    /// Aborted by a fatal error.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl RunState {
    /// Returns the state as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for `Completed`, `Failed`, and `Cancelled`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the state machine allows moving to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Running | Self::Failed | Self::Cancelled)
                | (
                    Self::Running,
                    Self::Paused | Self::Completed | Self::Failed | Self::Cancelled
                )
                | (Self::Paused, Self::Running | Self::Failed | Self::Cancelled)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress counters for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounters {
    /// Records fetched and run through detection.
    pub candidates_scanned: u64,
    /// Batches fully processed and checkpointed.
    pub batches_processed: u64,
    /// Duplicate groups found.
    pub groups_found: u64,
    /// Merges executed (planned, in dry-run mode).
    pub merges_executed: u64,
    /// Groups sent to manual review.
    pub groups_queued_for_review: u64,
    /// Groups skipped because their members were no longer active.
    pub groups_skipped: u64,
    /// Merge writes rejected by optimistic concurrency.
    pub version_conflicts: u64,
    /// Bytes held by tombstoned records.
    pub storage_bytes_reclaimed: u64,
    /// Records the semantic detector skipped for lack of an embedding.
    pub records_without_embedding: u64,
    /// Records the exact detector passed over as known-unique.
    #[serde(default)]
    pub known_unique_skipped: u64,
}

/// Category of a run diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Invalid settings.
    Configuration,
    /// A detector failed or timed out for a batch.
    DetectorFailure,
    /// A repository call failed.
    RepositoryError,
    /// A merge write was rejected because a record changed.
    VersionConflict,
    /// A merge was aborted because stored data is inconsistent.
    DataIntegrity,
    /// A request referenced missing or malformed data, e.g. a group member
    /// absent from its batch.
    InvalidInput,
    /// The engine itself failed, e.g. a worker thread panicked.
    Internal,
}

impl DiagnosticKind {
    /// Classifies an error.
    #[must_use]
    pub const fn from_error(error: &Error) -> Self {
        match error {
            Error::Configuration(_) => Self::Configuration,
            Error::DetectorFailure { .. } => Self::DetectorFailure,
            Error::VersionConflict { .. } => Self::VersionConflict,
            Error::DataIntegrity(_) => Self::DataIntegrity,
            Error::Repository { .. } => Self::RepositoryError,
            Error::Conflict(_)
            | Error::NotFound(_)
            | Error::InvalidTransition { .. }
            | Error::InvalidInput(_) => Self::InvalidInput,
            Error::OperationFailed { .. } => Self::Internal,
        }
    }
}

/// An error recorded against a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDiagnostic {
    /// Error category.
    pub kind: DiagnosticKind,
    /// Human-readable message.
    pub message: String,
    /// Batch cursor when the error occurred.
    pub cursor: Option<String>,
    /// Detector involved, for detector failures.
    pub detector: Option<DetectionMethod>,
    /// When the diagnostic was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Persisted resume point for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    /// The run that wrote the checkpoint.
    pub run_id: RunId,
    /// Cursor after the last committed batch.
    pub cursor: Option<String>,
    /// Counters at the checkpoint.
    pub counters: RunCounters,
    /// True once the run completed; finished checkpoints are not resumed.
    pub finished: bool,
}

/// A deduplication run and its progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationRun {
    /// Run identifier.
    pub run_id: RunId,
    /// Settings snapshot taken at start.
    pub settings: DedupSettings,
    /// Current lifecycle state.
    pub state: RunState,
    /// Progress counters.
    pub counters: RunCounters,
    /// Cursor after the last committed batch.
    pub checkpoint: Option<String>,
    /// Run whose checkpoint this one resumed from.
    pub resumed_from: Option<RunId>,
    /// True if any detector failed during the run.
    pub degraded: bool,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, once terminal.
    pub ended_at: Option<DateTime<Utc>>,
    /// Every error recorded during the run.
    pub diagnostics: Vec<RunDiagnostic>,
    /// Groups whose merge hit a version conflict; re-evaluated next run.
    pub deferred_groups: Vec<DuplicateCandidateGroup>,
    /// Decisions synthesized in dry-run mode.
    pub dry_run_decisions: Vec<MergeDecision>,
}

impl DeduplicationRun {
    /// Creates an idle run.
    #[must_use]
    pub fn new(settings: DedupSettings) -> Self {
        Self {
            run_id: RunId::generate(),
            settings,
            state: RunState::Idle,
            counters: RunCounters::default(),
            checkpoint: None,
            resumed_from: None,
            degraded: false,
            started_at: Utc::now(),
            ended_at: None,
            diagnostics: Vec::new(),
            deferred_groups: Vec::new(),
            dry_run_decisions: Vec::new(),
        }
    }

    /// Seeds the run from an unfinished checkpoint.
    #[must_use]
    pub fn resuming(mut self, checkpoint: &RunCheckpoint) -> Self {
        self.resumed_from = Some(checkpoint.run_id.clone());
        self.checkpoint.clone_from(&checkpoint.cursor);
        self
    }

    /// Moves the run to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the state machine forbids it.
    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Records an error against the run.
    pub fn record_error(&mut self, error: &Error) {
        let detector = match error {
            Error::DetectorFailure { detector, .. } => Some(*detector),
            _ => None,
        };
        if detector.is_some() {
            self.degraded = true;
        }
        self.diagnostics.push(RunDiagnostic {
            kind: DiagnosticKind::from_error(error),
            message: error.to_string(),
            cursor: self.checkpoint.clone(),
            detector,
            recorded_at: Utc::now(),
        });
    }

    /// Returns diagnostics of one kind.
    pub fn diagnostics_of(&self, kind: DiagnosticKind) -> impl Iterator<Item = &RunDiagnostic> {
        self.diagnostics.iter().filter(move |d| d.kind == kind)
    }
}
