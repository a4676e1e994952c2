//! Batch deduplication of memory records.
//!
//! Three detectors look for duplicates in each batch:
//! 1. **Exact match**: SHA-256 fingerprint of normalized content
//! 2. **Fuzzy match**: token Jaccard blended with Levenshtein ratio
//! 3. **Semantic similarity**: cosine similarity of embeddings
//!
//! The hybrid detector runs them concurrently and unifies their groups; the
//! merger folds each confident group into a single survivor.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                   DeduplicationOrchestrator                      │
//! │   fetch batch ─► HybridDetector ─► route ─► checkpoint           │
//! │                   │                  │                           │
//! │   ┌───────────────┼──────────────┐   ├─► MemoryMerger (≥ auto)   │
//! │   │ Exact  │  Fuzzy  │ Semantic  │   └─► ReviewQueue  (< auto)   │
//! │   │ thread │ thread  │  thread   │                               │
//! │   └──────────── UnionFind ───────┘                               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use memdedup::config::DedupSettings;
//! use memdedup::models::MemoryRecord;
//! use memdedup::services::deduplication::{DetectionContext, HybridDetector};
//! use std::sync::Arc;
//!
//! let batch: Arc<[MemoryRecord]> = vec![
//!     MemoryRecord::new("a", "Use PostgreSQL for primary storage"),
//!     MemoryRecord::new("b", "use  postgresql for primary storage"),
//! ]
//! .into();
//! let hybrid = HybridDetector::from_settings(&DedupSettings::default());
//! let output = hybrid.detect(&batch, &DetectionContext::new());
//! assert_eq!(output.groups.len(), 1);
//! assert!((output.groups[0].confidence() - 1.0).abs() < f32::EPSILON);
//! ```

mod detector;
mod exact_match;
mod fuzzy;
mod hasher;
mod hybrid;
mod known_unique;
mod merger;
mod orchestrator;
mod retry;
mod semantic;
mod union_find;

pub use detector::{DetectionContext, Detector, DetectorOutput, IndexUpdate};
pub use exact_match::ExactMatchDetector;
pub use fuzzy::{FuzzyMatchDetector, jaccard, levenshtein, similarity, tokenize};
pub use hasher::ContentHasher;
pub use hybrid::{HybridDetector, HybridOutput, unify};
pub use known_unique::{DEFAULT_KNOWN_UNIQUE_CAPACITY, KnownUniqueIndex, LruKnownUniqueIndex};
pub use merger::{MemoryMerger, MergePlan, MergeResult};
pub use orchestrator::DeduplicationOrchestrator;
pub use retry::RetryPolicy;
pub use semantic::SemanticSimilarityDetector;
pub use union_find::UnionFind;
