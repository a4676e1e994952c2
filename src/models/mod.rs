//! Data models for memdedup.
//!
//! This module contains the value types shared by every engine component.

mod events;
mod group;
mod memory;
mod merge;
mod run;

pub use events::{DedupEvent, EventMeta};
pub use group::{DetectionMethod, DuplicateCandidateGroup};
pub use memory::{MemoryId, MemoryRecord, MergeState, is_non_empty};
pub use merge::{FieldResolution, MergeDecision};
pub use run::{
    DeduplicationRun, DiagnosticKind, RunCheckpoint, RunCounters, RunDiagnostic, RunId, RunState,
};
