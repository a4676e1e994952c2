//! Property-based tests for detection and merging.
//!
//! Uses proptest to verify invariants across random inputs:
//! - Exact matching groups precisely the records with equal normalized content
//! - Overlapping detector groups are closed transitively
//! - Pairs below a threshold are never linked
//! - A completed run leaves no duplicate active records and loses no tags

// Property tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use memdedup::config::DedupSettings;
use memdedup::models::{DetectionMethod, DuplicateCandidateGroup, MemoryId, MemoryRecord, RunState};
use memdedup::observability::EventBus;
use memdedup::services::deduplication::{
    ContentHasher, DetectionContext, DetectorOutput, DeduplicationOrchestrator,
    ExactMatchDetector, FuzzyMatchDetector, UnionFind, similarity, unify,
};
use memdedup::storage::{InMemoryRepository, InMemoryReviewQueue};
use proptest::prelude::*;

const WORDS: &[&str] = &["Alpha", "beta", "GAMMA", "delta", "alpha", "Beta"];

/// Short phrases over a tiny vocabulary, so collisions are common.
fn phrase() -> impl Strategy<Value = String> {
    (
        prop::collection::vec(prop::sample::select(WORDS), 1..4),
        prop::sample::select(vec![" ", "  ", "\t"]),
    )
        .prop_map(|(words, sep)| words.join(sep))
}

fn records_from(contents: &[String]) -> Vec<MemoryRecord> {
    contents
        .iter()
        .enumerate()
        .map(|(i, c)| MemoryRecord::new(format!("r-{i:02}"), c.clone()).with_tag(format!("t{i}")))
        .collect()
}

fn member_sets(groups: &[DuplicateCandidateGroup]) -> BTreeSet<Vec<MemoryId>> {
    groups.iter().map(|g| g.members().to_vec()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: exact groups are exactly the buckets of equal normalized content.
    #[test]
    fn prop_exact_match_groups_equal_normalized_content(
        contents in prop::collection::vec(phrase(), 0..12)
    ) {
        let records = records_from(&contents);
        let output = ExactMatchDetector::new(true)
            .detect(&records, &DetectionContext::new())
            .unwrap();

        let mut buckets: BTreeMap<String, Vec<MemoryId>> = BTreeMap::new();
        for record in &records {
            buckets
                .entry(ContentHasher::normalize(&record.content))
                .or_default()
                .push(record.id.clone());
        }
        let expected: BTreeSet<Vec<MemoryId>> =
            buckets.into_values().filter(|ids| ids.len() >= 2).collect();

        prop_assert_eq!(member_sets(&output.groups), expected);
        for group in &output.groups {
            prop_assert!((group.confidence() - 1.0).abs() < f32::EPSILON);
        }
    }

    /// Property: unify merges overlapping pairwise groups into connected components.
    #[test]
    fn prop_unify_is_transitive_closure(
        n in 2usize..10,
        edges in prop::collection::vec((0usize..10, 0usize..10, any::<bool>()), 0..15)
    ) {
        let records: Vec<MemoryRecord> = (0..n)
            .map(|i| MemoryRecord::new(format!("r-{i:02}"), format!("record {i}")))
            .collect();
        let mut uf = UnionFind::new(n);
        let mut exact = Vec::new();
        let mut fuzzy = Vec::new();
        for (a, b, to_exact) in edges {
            let (a, b) = (a % n, b % n);
            if a == b {
                continue;
            }
            uf.union(a, b);
            let ids = [records[a].id.clone(), records[b].id.clone()];
            if to_exact {
                exact.push(DuplicateCandidateGroup::single(ids, DetectionMethod::Exact, 1.0).unwrap());
            } else {
                fuzzy.push(DuplicateCandidateGroup::single(ids, DetectionMethod::Fuzzy, 0.9).unwrap());
            }
        }
        let expected: BTreeSet<Vec<MemoryId>> = uf
            .components()
            .into_iter()
            .map(|set| set.into_iter().map(|i| records[i].id.clone()).collect())
            .collect();

        let groups = unify(
            &records,
            vec![
                DetectorOutput::new(DetectionMethod::Exact, exact),
                DetectorOutput::new(DetectionMethod::Fuzzy, fuzzy),
            ],
        );

        prop_assert_eq!(member_sets(&groups), expected);
        for group in &groups {
            let confidence = group.confidence();
            if group.methods().contains(&DetectionMethod::Exact) {
                prop_assert!((confidence - 1.0).abs() < f32::EPSILON);
            } else {
                prop_assert!((confidence - 0.9).abs() < 1e-6);
            }
        }
    }

    /// Property: two records are linked by the fuzzy detector iff they meet the threshold.
    #[test]
    fn prop_fuzzy_threshold_excludes_weaker_pairs(
        a in phrase(),
        b in phrase(),
        threshold in 0.3f32..0.99
    ) {
        let records = records_from(&[a.clone(), b.clone()]);
        let output = FuzzyMatchDetector::new(threshold, true).detect(&records).unwrap();
        let score = similarity(&a, &b, true);

        if score < threshold - 1e-4 {
            prop_assert!(output.groups.is_empty(), "score {score} linked at {threshold}");
        }
        for group in &output.groups {
            prop_assert!(group.confidence() >= threshold - 1e-4);
        }
    }

    /// Property: after a completed run, every tombstone points at an active
    /// record with the same content, and the survivor carries the loser's tags.
    #[test]
    fn prop_merge_completeness(contents in prop::collection::vec(phrase(), 1..10)) {
        let repository = Arc::new(InMemoryRepository::with_records(records_from(&contents)));
        let orchestrator = DeduplicationOrchestrator::new(
            repository.clone(),
            Arc::new(InMemoryReviewQueue::new()),
            EventBus::default(),
        );
        let settings = DedupSettings::builder()
            .with_detectors([DetectionMethod::Exact])
            .build()
            .unwrap();

        let run = orchestrator.run_to_completion(settings).unwrap();
        prop_assert_eq!(run.state, RunState::Completed);

        let distinct: BTreeSet<String> =
            contents.iter().map(|c| ContentHasher::normalize(c)).collect();
        let active = repository.active_records();
        prop_assert_eq!(active.len(), distinct.len());

        for record in repository.records() {
            let Some(survivor_id) = record.survivor() else {
                continue;
            };
            let survivor = repository.get(survivor_id).unwrap();
            prop_assert!(survivor.is_active());
            prop_assert_eq!(
                ContentHasher::normalize(&survivor.content),
                ContentHasher::normalize(&record.content)
            );
            prop_assert!(record.tags.is_subset(&survivor.tags));
        }
        prop_assert_eq!(repository.len(), contents.len());
    }
}
