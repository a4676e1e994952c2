//! Business logic services.
//!
//! Services orchestrate storage backends and provide high-level operations.

pub mod deduplication;
