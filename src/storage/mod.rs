//! Storage layer abstraction.
//!
//! The engine reads and writes records only through [`MemoryRepository`] and
//! sends low-confidence groups to a [`ReviewQueue`]. In-memory implementations
//! of both are provided.

mod memory;
mod review;
pub mod traits;
pub mod vector;

pub use memory::{InMemoryRepository, RepositoryOperation};
pub use review::InMemoryReviewQueue;
pub use traits::{
    MemoryRepository, MergeOutcome, RecordBatch, RecordFilter, ReviewItem, ReviewQueue,
};
pub use vector::{FlatVectorIndex, cosine_similarity, l2_normalize};
