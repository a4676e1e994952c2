//! Integration tests for memdedup.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::too_many_lines,
    clippy::cast_precision_loss
)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use memdedup::config::{DedupSettings, MergeStrategy};
use memdedup::models::{
    DedupEvent, DetectionMethod, DiagnosticKind, MemoryId, MemoryRecord, RunState,
};
use memdedup::observability::EventBus;
use memdedup::services::deduplication::{DeduplicationOrchestrator, RetryPolicy};
use memdedup::storage::{
    InMemoryRepository, InMemoryReviewQueue, MemoryRepository, RepositoryOperation, ReviewQueue,
};
use memdedup::{Error, RunId};

const BASE: &str =
    "The deployment pipeline runs the full integration suite on every pull request before merge";

fn at_cosine(cos: f32) -> Vec<f32> {
    vec![cos, (1.0 - cos * cos).sqrt()]
}

fn orchestrator(repository: &Arc<InMemoryRepository>) -> DeduplicationOrchestrator {
    DeduplicationOrchestrator::new(
        repository.clone(),
        Arc::new(InMemoryReviewQueue::new()),
        EventBus::default(),
    )
    .with_retry_policy(RetryPolicy::default().with_initial_backoff_ms(1))
}

/// `n` records where ids `2k` and `2k + 1` share content.
fn pairs(n: usize) -> Vec<MemoryRecord> {
    (0..n)
        .map(|i| MemoryRecord::new(format!("m-{i:03}"), format!("note number {}", i / 2)))
        .collect()
}

/// Polls until the run has committed at least `batches` batches.
fn wait_for_batches(orchestrator: &DeduplicationOrchestrator, run_id: &RunId, batches: u64) {
    for _ in 0..400 {
        let run = orchestrator.get_run_status(run_id).unwrap();
        if run.counters.batches_processed >= batches {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("run {run_id} never reached {batches} batches");
}

fn id(s: &str) -> MemoryId {
    MemoryId::new(s)
}

#[test]
fn test_error_display() {
    let err = Error::InvalidInput("group needs two members".to_string());
    let display = err.to_string();
    assert!(display.contains("invalid input"));
    assert!(display.contains("group needs two members"));

    let err = Error::DetectorFailure {
        detector: DetectionMethod::Semantic,
        cause: "timed out".to_string(),
    };
    let display = err.to_string();
    assert!(display.contains("semantic"));
    assert!(display.contains("timed out"));

    let err = Error::VersionConflict {
        record_id: id("m-1"),
    };
    assert!(err.to_string().contains("m-1"));
}

mod scenarios {
    use super::*;

    #[test]
    fn test_exact_duplicates_merge_with_union_of_tags() {
        let repository = Arc::new(InMemoryRepository::with_records([
            MemoryRecord::new("a", "Use PostgreSQL for primary storage").with_tag("db"),
            MemoryRecord::new("b", "  use postgresql   for primary storage ").with_tag("postgres"),
        ]));
        let run = orchestrator(&repository)
            .run_to_completion(DedupSettings::default())
            .unwrap();

        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.counters.groups_found, 1);
        assert_eq!(run.counters.merges_executed, 1);

        let active = repository.active_records();
        assert_eq!(active.len(), 1);
        let survivor = &active[0];
        assert!(survivor.tags.contains("db"));
        assert!(survivor.tags.contains("postgres"));

        let decisions = repository.decisions();
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].methods.contains(&DetectionMethod::Exact));
        assert!((decisions[0].confidence - 1.0).abs() < f32::EPSILON);

        let loser = repository
            .records()
            .into_iter()
            .find(|r| !r.is_active())
            .unwrap();
        assert_eq!(loser.survivor(), Some(&survivor.id));
    }

    #[test]
    fn test_fuzzy_near_duplicates_merge() {
        let repository = Arc::new(InMemoryRepository::with_records([
            MemoryRecord::new("a", BASE),
            MemoryRecord::new("b", format!("{BASE}s")),
        ]));
        let run = orchestrator(&repository)
            .run_to_completion(DedupSettings::default())
            .unwrap();

        assert_eq!(run.counters.groups_found, 1);
        assert_eq!(run.counters.merges_executed, 1);
        assert_eq!(run.counters.records_without_embedding, 2);
        let decision = &repository.decisions()[0];
        assert!(decision.methods.contains(&DetectionMethod::Fuzzy));
        assert!(!decision.methods.contains(&DetectionMethod::Exact));
        assert!(decision.confidence > 0.9 && decision.confidence < 1.0);
        assert_eq!(repository.active_records().len(), 1);
    }

    #[test]
    fn test_semantic_below_threshold_stays_separate() {
        let repository = Arc::new(InMemoryRepository::with_records([
            MemoryRecord::new("a", "alpha beta").with_embedding(vec![1.0, 0.0]),
            MemoryRecord::new("b", "gamma delta").with_embedding(at_cosine(0.80)),
        ]));
        let run = orchestrator(&repository)
            .run_to_completion(DedupSettings::default())
            .unwrap();

        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.counters.groups_found, 0);
        assert_eq!(repository.active_records().len(), 2);
        assert!(repository.decisions().is_empty());
    }

    #[test]
    fn test_semantic_failure_degrades_but_keeps_exact_results() {
        // No inline embeddings, so the semantic detector asks the repository.
        let repository = Arc::new(InMemoryRepository::with_records([
            MemoryRecord::new("a", "rotate the signing keys every quarter"),
            MemoryRecord::new("b", "Rotate the signing keys every quarter"),
            MemoryRecord::new("c", "unrelated memory about lunch"),
        ]));
        repository.fail_next(RepositoryOperation::GetEmbedding, 1, false);

        let run = orchestrator(&repository)
            .run_to_completion(DedupSettings::default())
            .unwrap();

        assert_eq!(run.state, RunState::Completed);
        assert!(run.degraded);
        assert_eq!(run.counters.merges_executed, 1);
        let failures: Vec<_> = run.diagnostics_of(DiagnosticKind::DetectorFailure).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].detector, Some(DetectionMethod::Semantic));
        assert_eq!(repository.active_records().len(), 2);
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let repository = Arc::new(InMemoryRepository::with_records(pairs(6)));
        let before = repository.records();
        let settings = DedupSettings::builder().with_dry_run(true).build().unwrap();

        let run = orchestrator(&repository).run_to_completion(settings).unwrap();

        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.counters.merges_executed, 3);
        assert_eq!(run.dry_run_decisions.len(), 3);
        assert!(run.dry_run_decisions.iter().all(|d| d.dry_run));
        assert_eq!(repository.records(), before);
        assert!(repository.decisions().is_empty());
    }
}

#[test]
fn test_second_run_is_idempotent() {
    let repository = Arc::new(InMemoryRepository::with_records(pairs(8)));
    let orchestrator = orchestrator(&repository);

    let first = orchestrator
        .run_to_completion(DedupSettings::default())
        .unwrap();
    assert_eq!(first.counters.merges_executed, 4);
    let after_first = repository.records();

    let second = orchestrator
        .run_to_completion(DedupSettings::default())
        .unwrap();
    assert_eq!(second.state, RunState::Completed);
    assert!(second.resumed_from.is_none());
    assert_eq!(second.counters.merges_executed, 0);
    assert_eq!(second.counters.groups_found, 0);
    assert_eq!(repository.records(), after_first);
}

#[test]
fn test_low_confidence_group_goes_to_review() {
    let repository = Arc::new(InMemoryRepository::with_records([
        MemoryRecord::new("a", "alpha beta").with_embedding(vec![1.0, 0.0]),
        MemoryRecord::new("b", "gamma delta").with_embedding(at_cosine(0.97)),
    ]));
    let review = Arc::new(InMemoryReviewQueue::new());
    let orchestrator =
        DeduplicationOrchestrator::new(repository.clone(), review.clone(), EventBus::default());
    let settings = DedupSettings::builder()
        .with_auto_merge_threshold(0.99)
        .build()
        .unwrap();

    let run = orchestrator.run_to_completion(settings).unwrap();

    assert_eq!(run.counters.groups_found, 1);
    assert_eq!(run.counters.groups_queued_for_review, 1);
    assert_eq!(run.counters.merges_executed, 0);
    let pending = review.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].run_id, run.run_id);
    assert_eq!(pending[0].group.members(), &[id("a"), id("b")]);
    assert_eq!(repository.active_records().len(), 2);
}

#[test]
fn test_keep_most_important_strategy_picks_survivor() {
    let repository = Arc::new(InMemoryRepository::with_records([
        MemoryRecord::new("a", "cache invalidation notes").with_importance(0.2),
        MemoryRecord::new("b", "Cache invalidation notes").with_importance(0.9),
    ]));
    let settings = DedupSettings::builder()
        .with_merge_strategy(MergeStrategy::KeepMostImportant)
        .build()
        .unwrap();

    orchestrator(&repository).run_to_completion(settings).unwrap();

    let active = repository.active_records();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, id("b"));
    assert!(!repository.get(&id("a")).unwrap().is_active());
}

#[test]
fn test_transient_fetch_failures_are_retried() {
    let repository = Arc::new(InMemoryRepository::with_records(pairs(4)));
    repository.fail_next(RepositoryOperation::FetchBatch, 2, true);

    let run = orchestrator(&repository)
        .run_to_completion(DedupSettings::default())
        .unwrap();

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.counters.merges_executed, 2);
}

#[test]
fn test_exhausted_retries_fail_the_run() {
    let repository = Arc::new(InMemoryRepository::with_records(pairs(4)));
    repository.fail_next(RepositoryOperation::FetchBatch, 10, true);

    let run = orchestrator(&repository)
        .run_to_completion(DedupSettings::default())
        .unwrap();

    assert_eq!(run.state, RunState::Failed);
    assert!(run.ended_at.is_some());
    assert_eq!(
        run.diagnostics_of(DiagnosticKind::RepositoryError).count(),
        1
    );
    assert_eq!(repository.active_records().len(), 4);
}

#[test]
fn test_permanent_merge_failure_fails_run_and_next_run_recovers() {
    let repository = Arc::new(InMemoryRepository::with_records(pairs(4)));
    repository.fail_next(RepositoryOperation::ApplyMerge, 1, false);
    let orchestrator = orchestrator(&repository);

    let failed = orchestrator
        .run_to_completion(DedupSettings::default())
        .unwrap();
    assert_eq!(failed.state, RunState::Failed);
    assert_eq!(failed.counters.merges_executed, 0);

    let recovered = orchestrator
        .run_to_completion(DedupSettings::default())
        .unwrap();
    assert_eq!(recovered.state, RunState::Completed);
    assert_eq!(recovered.counters.merges_executed, 2);
    assert_eq!(repository.active_records().len(), 2);
}

#[test]
fn test_version_conflict_defers_group() {
    let repository = Arc::new(InMemoryRepository::with_records(pairs(4)));
    repository.edit_after_fetch(&id("m-000"));
    let orchestrator = orchestrator(&repository);

    let run = orchestrator
        .run_to_completion(DedupSettings::default())
        .unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.counters.version_conflicts, 1);
    assert_eq!(run.counters.merges_executed, 1);
    assert_eq!(run.deferred_groups.len(), 1);
    assert!(run.deferred_groups[0].contains(&id("m-000")));
    assert!(repository.get(&id("m-000")).unwrap().is_active());
    assert!(repository.get(&id("m-001")).unwrap().is_active());

    let next = orchestrator
        .run_to_completion(DedupSettings::default())
        .unwrap();
    assert_eq!(next.counters.merges_executed, 1);
    assert_eq!(repository.active_records().len(), 2);
}

#[test]
fn test_pause_and_resume() {
    let repository = Arc::new(InMemoryRepository::with_records(pairs(10)));
    repository.set_fetch_delay(Duration::from_millis(50));
    let orchestrator = orchestrator(&repository);
    let settings = DedupSettings::builder().with_batch_size(2).build().unwrap();

    let run_id = orchestrator.start_run(settings).unwrap();
    orchestrator.pause_run(&run_id).unwrap();
    thread::sleep(Duration::from_millis(200));

    let paused = orchestrator.get_run_status(&run_id).unwrap();
    assert_eq!(paused.state, RunState::Paused);
    assert!(paused.counters.batches_processed <= 1);
    assert!(matches!(
        orchestrator.pause_run(&run_id),
        Err(Error::InvalidTransition { .. })
    ));

    orchestrator.resume_run(&run_id).unwrap();
    assert!(matches!(
        orchestrator.resume_run(&run_id),
        Err(Error::InvalidTransition { .. })
    ));
    let run = orchestrator.wait_for_run(&run_id).unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.counters.batches_processed, 5);
    assert_eq!(run.counters.merges_executed, 5);
}

#[test]
fn test_cancel_then_next_run_resumes_from_checkpoint() {
    let repository = Arc::new(InMemoryRepository::with_records(pairs(10)));
    repository.set_fetch_delay(Duration::from_millis(50));
    let orchestrator = orchestrator(&repository);
    let settings = DedupSettings::builder().with_batch_size(2).build().unwrap();

    let run_id = orchestrator.start_run(settings.clone()).unwrap();
    wait_for_batches(&orchestrator, &run_id, 1);
    orchestrator.cancel_run(&run_id).unwrap();
    let cancelled = orchestrator.wait_for_run(&run_id).unwrap();
    assert_eq!(cancelled.state, RunState::Cancelled);
    assert!(cancelled.counters.batches_processed < 5);
    assert!(orchestrator.active_run().is_none());

    let resumed = orchestrator.run_to_completion(settings).unwrap();
    assert_eq!(resumed.state, RunState::Completed);
    assert_eq!(resumed.resumed_from, Some(run_id));
    assert_eq!(
        cancelled.counters.merges_executed + resumed.counters.merges_executed,
        5
    );
    assert_eq!(repository.active_records().len(), 5);
    assert!(repository.latest_checkpoint().unwrap().is_none());
}

#[test]
fn test_chained_interrupted_runs_leave_no_stale_cursor() {
    let repository = Arc::new(InMemoryRepository::with_records(pairs(10)));
    let counters = memdedup::models::RunCounters::default();
    repository
        .record_run_checkpoint(&RunId::new("run-a"), Some("m-005"), &counters)
        .unwrap();
    repository
        .record_run_checkpoint(&RunId::new("run-b"), Some("m-007"), &counters)
        .unwrap();
    let orchestrator = orchestrator(&repository);

    let resumed = orchestrator
        .run_to_completion(DedupSettings::default())
        .unwrap();
    assert_eq!(resumed.state, RunState::Completed);
    assert_eq!(resumed.resumed_from, Some(RunId::new("run-b")));
    assert_eq!(resumed.counters.candidates_scanned, 2);

    repository.insert(MemoryRecord::new("a-1", "freshly added note"));
    repository.insert(MemoryRecord::new("a-2", "Freshly added note"));

    let fresh = orchestrator
        .run_to_completion(DedupSettings::default())
        .unwrap();
    assert!(fresh.resumed_from.is_none());
    assert_eq!(fresh.counters.candidates_scanned, 11);
    assert_eq!(fresh.counters.merges_executed, 5);
    let new_active = [id("a-1"), id("a-2")]
        .iter()
        .filter(|i| repository.get(i).unwrap().is_active())
        .count();
    assert_eq!(new_active, 1);
    assert_eq!(repository.active_records().len(), 6);
}

#[test]
fn test_runs_continue_past_record_limit() {
    let records = (0..10).map(|i| {
        let topic = if i == 7 { 6 } else { i };
        MemoryRecord::new(format!("m-{i:03}"), format!("standalone note about topic {topic}"))
    });
    let repository = Arc::new(InMemoryRepository::with_records(records));
    let orchestrator = orchestrator(&repository);
    let settings = DedupSettings::builder()
        .with_detectors([DetectionMethod::Exact])
        .with_batch_size(3)
        .with_max_records_per_run(6)
        .build()
        .unwrap();

    let first = orchestrator.run_to_completion(settings.clone()).unwrap();
    assert_eq!(first.state, RunState::Completed);
    assert_eq!(first.counters.candidates_scanned, 6);
    assert_eq!(first.counters.merges_executed, 0);
    let open = repository.latest_checkpoint().unwrap().unwrap();
    assert_eq!(open.cursor.as_deref(), Some("m-005"));

    let second = orchestrator.run_to_completion(settings.clone()).unwrap();
    assert_eq!(second.resumed_from, Some(first.run_id));
    assert_eq!(second.counters.candidates_scanned, 4);
    assert_eq!(second.counters.merges_executed, 1);
    assert_eq!(repository.active_records().len(), 9);
    assert!(repository.latest_checkpoint().unwrap().is_none());

    let third = orchestrator.run_to_completion(settings).unwrap();
    assert!(third.resumed_from.is_none());
    assert_eq!(third.counters.candidates_scanned, 6);
}

#[test]
fn test_cancel_paused_run() {
    let repository = Arc::new(InMemoryRepository::with_records(pairs(10)));
    repository.set_fetch_delay(Duration::from_millis(50));
    let orchestrator = orchestrator(&repository);
    let settings = DedupSettings::builder().with_batch_size(2).build().unwrap();

    let run_id = orchestrator.start_run(settings).unwrap();
    orchestrator.pause_run(&run_id).unwrap();
    orchestrator.cancel_run(&run_id).unwrap();
    let run = orchestrator.wait_for_run(&run_id).unwrap();
    assert_eq!(run.state, RunState::Cancelled);
}

#[test]
fn test_concurrent_start_is_rejected() {
    let repository = Arc::new(InMemoryRepository::with_records(pairs(4)));
    repository.set_fetch_delay(Duration::from_millis(50));
    let orchestrator = orchestrator(&repository);

    let run_id = orchestrator.start_run(DedupSettings::default()).unwrap();
    let err = orchestrator.start_run(DedupSettings::default()).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    orchestrator.wait_for_run(&run_id).unwrap();

    assert!(orchestrator.start_run(DedupSettings::default()).is_ok());
}

#[test]
fn test_unknown_run() {
    let orchestrator = orchestrator(&Arc::new(InMemoryRepository::new()));
    let missing = RunId::new("nope");
    assert!(matches!(
        orchestrator.wait_for_run(&missing),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        orchestrator.cancel_run(&missing),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_empty_repository_completes() {
    let run = orchestrator(&Arc::new(InMemoryRepository::new()))
        .run_to_completion(DedupSettings::default())
        .unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.counters.batches_processed, 0);
    assert_eq!(run.counters.candidates_scanned, 0);
}

#[test]
fn test_events_follow_run_lifecycle() {
    let repository = Arc::new(InMemoryRepository::with_records(pairs(4)));
    let events = EventBus::default();
    let mut receiver = events.subscribe();
    let orchestrator = DeduplicationOrchestrator::new(
        repository,
        Arc::new(InMemoryReviewQueue::new()),
        events,
    );
    let settings = DedupSettings::builder().with_batch_size(2).build().unwrap();

    let run = orchestrator.run_to_completion(settings).unwrap();

    let mut received = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        received.push(event);
    }
    let types: Vec<&str> = received.iter().map(DedupEvent::event_type).collect();
    assert_eq!(types.first(), Some(&"run_started"));
    assert_eq!(types.last(), Some(&"run_completed"));
    assert_eq!(types.iter().filter(|t| **t == "run_progress").count(), 2);
    assert_eq!(types.iter().filter(|t| **t == "merge_executed").count(), 2);
    assert_eq!(
        types.iter().filter(|t| **t == "duplicate_group_found").count(),
        2
    );
    assert!(received.iter().all(|e| e.run_id() == &run.run_id));
}

mod config_file {
    use super::*;
    use memdedup::config::EngineConfig;
    use std::io::Write;

    #[test]
    fn test_load_config_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[dedup]
similarity_threshold_fuzzy = 0.8
batch_size = 25
enabled_detectors = ["exact", "fuzzy"]
merge_strategy = "keep_most_complete"
dry_run = true

[retry]
max_attempts = 5
"#
        )
        .unwrap();

        let config = EngineConfig::load_from_file(file.path()).unwrap();
        assert!((config.settings.similarity_threshold_fuzzy() - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.settings.batch_size(), 25);
        assert!(config.settings.dry_run());
        assert!(!config.settings.is_enabled(DetectionMethod::Semantic));
        assert_eq!(
            config.settings.merge_strategy(),
            MergeStrategy::KeepMostComplete
        );
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_invalid_threshold_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dedup]\nauto_merge_threshold = 1.5").unwrap();
        let err = EngineConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
