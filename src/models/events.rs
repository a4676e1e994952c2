//! Engine event types for dashboards and automation triggers.

use super::{DetectionMethod, MemoryId, RunCounters, RunId};
use crate::current_timestamp;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Shared event metadata required for observability.
#[derive(Debug, Clone)]
pub struct EventMeta {
    /// Unique identifier for this event.
    pub event_id: String,
    /// Correlation identifier (the run ID).
    pub correlation_id: Option<String>,
    /// Event source component.
    pub source: &'static str,
    /// Timestamp (Unix epoch seconds).
    pub timestamp: u64,
}

impl EventMeta {
    /// Creates new event metadata using the current timestamp.
    #[must_use]
    pub fn new(source: &'static str, correlation_id: Option<String>) -> Self {
        Self::with_timestamp(source, correlation_id, current_timestamp())
    }

    /// Creates new event metadata with a specified timestamp.
    #[must_use]
    pub fn with_timestamp(
        source: &'static str,
        correlation_id: Option<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            correlation_id,
            source,
            timestamp,
        }
    }

    /// Creates metadata correlated with a run.
    #[must_use]
    pub fn for_run(source: &'static str, run_id: &RunId) -> Self {
        Self::new(source, Some(run_id.to_string()))
    }
}

/// Events emitted while a run progresses.
#[derive(Debug, Clone)]
pub enum DedupEvent {
    /// A run started processing.
    RunStarted {
        /// Event metadata.
        meta: EventMeta,
        /// The run.
        run_id: RunId,
        /// Run this one resumed from, if any.
        resumed_from: Option<RunId>,
    },
    /// A duplicate group was found.
    DuplicateGroupFound {
        /// Event metadata.
        meta: EventMeta,
        /// The run.
        run_id: RunId,
        /// Group members.
        members: Vec<MemoryId>,
        /// Contributing methods.
        methods: BTreeSet<DetectionMethod>,
        /// Group confidence.
        confidence: f32,
    },
    /// A group fell below the auto-merge threshold.
    GroupQueuedForReview {
        /// Event metadata.
        meta: EventMeta,
        /// The run.
        run_id: RunId,
        /// Group members.
        members: Vec<MemoryId>,
        /// Group confidence.
        confidence: f32,
    },
    /// A merge was applied (or planned, in dry-run mode).
    MergeExecuted {
        /// Event metadata.
        meta: EventMeta,
        /// The run.
        run_id: RunId,
        /// The decision identifier.
        decision_id: String,
        /// The surviving record.
        survivor_id: MemoryId,
        /// Records tombstoned.
        tombstoned: Vec<MemoryId>,
        /// True if nothing was written.
        dry_run: bool,
    },
    /// A batch was committed.
    RunProgress {
        /// Event metadata.
        meta: EventMeta,
        /// The run.
        run_id: RunId,
        /// Counters after the batch.
        counters: RunCounters,
        /// Cursor after the batch.
        cursor: Option<String>,
    },
    /// The run completed.
    RunCompleted {
        /// Event metadata.
        meta: EventMeta,
        /// The run.
        run_id: RunId,
        /// Final counters.
        counters: RunCounters,
        /// True if any detector failed during the run.
        degraded: bool,
    },
    /// The run failed.
    RunFailed {
        /// Event metadata.
        meta: EventMeta,
        /// The run.
        run_id: RunId,
        /// The fatal error.
        error: String,
        /// Last committed cursor, for resume.
        cursor: Option<String>,
    },
    /// The run was cancelled.
    RunCancelled {
        /// Event metadata.
        meta: EventMeta,
        /// The run.
        run_id: RunId,
        /// Counters at cancellation.
        counters: RunCounters,
    },
}

impl DedupEvent {
    /// Returns the event type name.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::DuplicateGroupFound { .. } => "duplicate_group_found",
            Self::GroupQueuedForReview { .. } => "group_queued_for_review",
            Self::MergeExecuted { .. } => "merge_executed",
            Self::RunProgress { .. } => "run_progress",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled { .. } => "run_cancelled",
        }
    }

    /// Returns the event metadata.
    #[must_use]
    pub const fn meta(&self) -> &EventMeta {
        match self {
            Self::RunStarted { meta, .. }
            | Self::DuplicateGroupFound { meta, .. }
            | Self::GroupQueuedForReview { meta, .. }
            | Self::MergeExecuted { meta, .. }
            | Self::RunProgress { meta, .. }
            | Self::RunCompleted { meta, .. }
            | Self::RunFailed { meta, .. }
            | Self::RunCancelled { meta, .. } => meta,
        }
    }

    /// Returns the run the event belongs to.
    #[must_use]
    pub const fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::DuplicateGroupFound { run_id, .. }
            | Self::GroupQueuedForReview { run_id, .. }
            | Self::MergeExecuted { run_id, .. }
            | Self::RunProgress { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id, .. } => run_id,
        }
    }

    /// Returns the timestamp of the event.
    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        self.meta().timestamp
    }
}
