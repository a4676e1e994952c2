//! Run command handler.
//!
//! Loads records from a JSON file into an in-memory repository, runs one
//! deduplication pass to completion, and reports the outcome.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Args;
use serde::{Deserialize, Serialize};

use memdedup::config::{EngineConfig, MergeStrategy, parse_detectors};
use memdedup::models::{
    DedupEvent, DeduplicationRun, MemoryId, MemoryRecord, MergeDecision, RunState,
};
use memdedup::observability::{EventBus, ObservabilityHandle};
use memdedup::services::deduplication::DeduplicationOrchestrator;
use memdedup::storage::{InMemoryRepository, InMemoryReviewQueue, ReviewItem, ReviewQueue};

/// Arguments for `memdedup run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// JSON file holding an array of records.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Plan merges without writing them.
    #[arg(long)]
    pub dry_run: bool,

    /// Comma-separated detectors: exact, fuzzy, semantic.
    #[arg(long)]
    pub detectors: Option<String>,

    /// Survivor strategy: keep-newest, keep-most-important, keep-most-complete.
    #[arg(long)]
    pub strategy: Option<MergeStrategy>,

    /// Records per batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Write resulting records, decisions, and review items as JSON.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// One record as it appears in the input file.
#[derive(Debug, Deserialize)]
pub struct MemoryRecordInput {
    id: String,
    content: String,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    importance: f32,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    created_at: Option<u64>,
    #[serde(default)]
    updated_at: Option<u64>,
}

impl From<MemoryRecordInput> for MemoryRecord {
    fn from(input: MemoryRecordInput) -> Self {
        let mut record = Self::new(MemoryId::new(input.id), input.content)
            .with_tags(input.tags)
            .with_importance(input.importance);
        record.metadata = input.metadata;
        record.embedding = input.embedding;
        let created_at = input.created_at.unwrap_or(record.created_at);
        let updated_at = input.updated_at.unwrap_or(created_at.max(record.updated_at));
        record.with_timestamps(created_at, updated_at)
    }
}

#[derive(Serialize)]
struct RunReport<'a> {
    run: &'a DeduplicationRun,
    records: Vec<MemoryRecord>,
    decisions: Vec<MergeDecision>,
    review: Vec<ReviewItem>,
}

/// Run command.
pub async fn cmd_run(
    config: EngineConfig,
    args: RunArgs,
    observability: &ObservabilityHandle,
) -> anyhow::Result<()> {
    let mut builder = config.settings.to_builder();
    if args.dry_run {
        builder = builder.with_dry_run(true);
    }
    if let Some(detectors) = &args.detectors {
        builder = builder.with_detectors(parse_detectors(detectors)?);
    }
    if let Some(strategy) = args.strategy {
        builder = builder.with_merge_strategy(strategy);
    }
    if let Some(batch_size) = args.batch_size {
        builder = builder.with_batch_size(batch_size);
    }
    let settings = builder.build()?;

    let records = load_records(&args.input)?;
    let loaded = records.len();
    let repository = Arc::new(InMemoryRepository::with_records(records));
    let review = Arc::new(InMemoryReviewQueue::new());
    let events = EventBus::default();

    let mut progress = events.subscribe_filtered(|event| {
        matches!(
            event,
            DedupEvent::RunStarted { .. } | DedupEvent::RunProgress { .. }
        )
    });
    let printer = tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            match event {
                DedupEvent::RunStarted {
                    run_id,
                    resumed_from,
                    ..
                } => tracing::info!(run_id = %run_id, resumed = resumed_from.is_some(), "Run started"),
                DedupEvent::RunProgress {
                    counters, cursor, ..
                } => tracing::info!(
                    scanned = counters.candidates_scanned,
                    groups = counters.groups_found,
                    merges = counters.merges_executed,
                    cursor = cursor.as_deref().unwrap_or(""),
                    "Batch committed"
                ),
                _ => {},
            }
        }
    });

    let orchestrator =
        DeduplicationOrchestrator::new(repository.clone(), review.clone(), events)
            .with_retry_policy(config.retry.clone());
    let run = tokio::task::spawn_blocking(move || orchestrator.run_to_completion(settings))
        .await
        .context("run worker panicked")??;
    printer.abort();

    print_summary(&run, loaded);

    if let Some(path) = &args.output {
        let report = RunReport {
            run: &run,
            records: repository.records(),
            decisions: repository.decisions(),
            review: review.pending()?,
        };
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    if args.metrics
        && let Some(rendered) = observability.render_metrics()
    {
        println!();
        print!("{rendered}");
    }

    if run.state == RunState::Failed {
        let cause = run
            .diagnostics
            .last()
            .map_or_else(|| "unknown error".to_string(), |d| d.message.clone());
        bail!("run {} failed: {cause}", run.run_id);
    }
    Ok(())
}

fn load_records(path: &Path) -> anyhow::Result<Vec<MemoryRecord>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let inputs: Vec<MemoryRecordInput> = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(inputs.into_iter().map(MemoryRecord::from).collect())
}

fn print_summary(run: &DeduplicationRun, loaded: usize) {
    let c = &run.counters;
    println!("Deduplication Run");
    println!("=================");
    println!("Run ID:            {}", run.run_id);
    println!("State:             {}", run.state);
    if let Some(resumed) = &run.resumed_from {
        println!("Resumed From:      {resumed}");
    }
    println!("Dry Run:           {}", run.settings.dry_run());
    println!("Records Loaded:    {loaded}");
    println!("Records Scanned:   {}", c.candidates_scanned);
    println!("Batches:           {}", c.batches_processed);
    println!("Groups Found:      {}", c.groups_found);
    println!("Merges:            {}", c.merges_executed);
    println!("Queued for Review: {}", c.groups_queued_for_review);
    println!("Skipped:           {}", c.groups_skipped);
    println!("Version Conflicts: {}", c.version_conflicts);
    println!("Bytes Reclaimed:   {}", c.storage_bytes_reclaimed);
    println!("No Embedding:      {}", c.records_without_embedding);
    println!("Known Unique:      {}", c.known_unique_skipped);
    if run.degraded {
        println!("Degraded:          yes");
    }
    if !run.diagnostics.is_empty() {
        println!();
        println!("Diagnostics:");
        for diagnostic in &run.diagnostics {
            println!("  - [{:?}] {}", diagnostic.kind, diagnostic.message);
        }
    }
}
