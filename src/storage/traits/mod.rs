//! Storage traits consumed by the engine.

mod repository;
mod review;

pub use repository::{MemoryRepository, MergeOutcome, RecordBatch, RecordFilter};
pub use review::{ReviewItem, ReviewQueue};
