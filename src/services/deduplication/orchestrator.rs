//! Run lifecycle and batch processing.
//!
//! The orchestrator owns every [`DeduplicationRun`] it started. Each run is
//! processed by one worker thread that walks the repository in batches:
//!
//! ```text
//! fetch batch ─► hybrid detect ─► route groups ─► checkpoint ─► progress
//!      ▲                          (merge | review)                 │
//!      └──────────── pause / resume / cancel gate ◄────────────────┘
//! ```
//!
//! Control calls only take effect at the gate between batches, so a batch is
//! always committed (or failed) as a whole.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use tracing::instrument;

use super::detector::DetectionContext;
use super::hybrid::HybridDetector;
use super::known_unique::{KnownUniqueIndex, LruKnownUniqueIndex};
use super::merger::{MemoryMerger, MergePlan, MergeResult};
use super::retry::RetryPolicy;
use crate::config::DedupSettings;
use crate::models::{
    DedupEvent, DeduplicationRun, DuplicateCandidateGroup, EventMeta, MemoryRecord, RunCounters,
    RunId, RunState,
};
use crate::observability::EventBus;
use crate::storage::{MemoryRepository, RecordFilter, ReviewQueue};
use crate::{Error, Result};

const EVENT_SOURCE: &str = "dedup_orchestrator";

struct RunSlot {
    run: DeduplicationRun,
    cancel_requested: bool,
}

#[derive(Default)]
struct Registry {
    runs: HashMap<RunId, RunSlot>,
    active: Option<RunId>,
    /// Bumped on every admitted run.
    generation: u64,
}

impl Registry {
    fn ensure_idle(&self) -> Result<()> {
        if let Some(active) = &self.active
            && self
                .runs
                .get(active)
                .is_some_and(|slot| !slot.run.state.is_terminal())
        {
            return Err(Error::Conflict(format!("run {active} is still active")));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Shared {
    registry: Mutex<Registry>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| Error::OperationFailed {
            operation: "run_registry".to_string(),
            cause: "Lock poisoned".to_string(),
        })
    }

    /// Applies `update` to a run and wakes every waiter.
    fn update<T>(&self, run_id: &RunId, update: impl FnOnce(&mut RunSlot) -> T) -> Result<T> {
        let mut registry = self.lock()?;
        let slot = registry
            .runs
            .get_mut(run_id)
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
        let value = update(slot);
        self.changed.notify_all();
        Ok(value)
    }
}

/// Drives deduplication runs over a [`MemoryRepository`].
///
/// At most one run is active at a time. Runs resume from the repository's
/// latest unfinished checkpoint, so a run that crashed, failed, was
/// cancelled, or stopped at `max_records_per_run` is picked up where it
/// stopped. Only a run that reaches the end of the repository closes its
/// checkpoint, sending the next run back to the start.
///
/// # Example
///
/// ```rust
/// use memdedup::config::DedupSettings;
/// use memdedup::models::{MemoryRecord, RunState};
/// use memdedup::observability::EventBus;
/// use memdedup::services::deduplication::DeduplicationOrchestrator;
/// use memdedup::storage::{InMemoryRepository, InMemoryReviewQueue};
/// use std::sync::Arc;
///
/// let repository = Arc::new(InMemoryRepository::with_records([
///     MemoryRecord::new("m-1", "Use PostgreSQL for storage").with_tag("db"),
///     MemoryRecord::new("m-2", "use postgresql for storage").with_tag("postgres"),
/// ]));
/// let orchestrator = DeduplicationOrchestrator::new(
///     repository.clone(),
///     Arc::new(InMemoryReviewQueue::new()),
///     EventBus::default(),
/// );
///
/// let run = orchestrator.run_to_completion(DedupSettings::default()).unwrap();
/// assert_eq!(run.state, RunState::Completed);
/// assert_eq!(run.counters.merges_executed, 1);
/// assert_eq!(repository.active_records().len(), 1);
/// ```
#[derive(Clone)]
pub struct DeduplicationOrchestrator {
    repository: Arc<dyn MemoryRepository>,
    review: Arc<dyn ReviewQueue>,
    events: EventBus,
    retry: RetryPolicy,
    known_unique: Arc<dyn KnownUniqueIndex>,
    shared: Arc<Shared>,
}

impl DeduplicationOrchestrator {
    /// Creates an orchestrator with the default retry policy and a bounded
    /// known-unique index.
    #[must_use]
    pub fn new(
        repository: Arc<dyn MemoryRepository>,
        review: Arc<dyn ReviewQueue>,
        events: EventBus,
    ) -> Self {
        Self {
            repository,
            review,
            events,
            retry: RetryPolicy::default(),
            known_unique: Arc::new(LruKnownUniqueIndex::default()),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Sets the repository retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the known-unique fingerprint index shared across runs.
    #[must_use]
    pub fn with_known_unique(mut self, index: Arc<dyn KnownUniqueIndex>) -> Self {
        self.known_unique = index;
        self
    }

    /// Returns the event bus runs publish to.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Starts a run on a background worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if another run is still active, or a
    /// repository error if the resume checkpoint cannot be read.
    #[instrument(skip_all, fields(batch_size = settings.batch_size(), dry_run = settings.dry_run()))]
    pub fn start_run(&self, settings: DedupSettings) -> Result<RunId> {
        // The checkpoint read retries with backoff, so it runs unlocked. A run
        // admitted meanwhile may have moved the checkpoint; read it again.
        let (mut registry, checkpoint) = loop {
            let generation = {
                let registry = self.shared.lock()?;
                registry.ensure_idle()?;
                registry.generation
            };
            let checkpoint = self
                .retry
                .execute("latest_checkpoint", || self.repository.latest_checkpoint())?;
            let registry = self.shared.lock()?;
            registry.ensure_idle()?;
            if registry.generation == generation {
                break (registry, checkpoint);
            }
        };

        let mut run = DeduplicationRun::new(settings);
        if let Some(checkpoint) = &checkpoint {
            run = run.resuming(checkpoint);
            tracing::info!(
                run_id = %run.run_id,
                resumed_from = %checkpoint.run_id,
                cursor = checkpoint.cursor.as_deref().unwrap_or(""),
                "Resuming from checkpoint"
            );
        }
        run.transition(RunState::Running)?;

        let run_id = run.run_id.clone();
        let resumed_from = run.resumed_from.clone();
        let worker = Worker {
            run_id: run_id.clone(),
            settings: run.settings.clone(),
            cursor: run.checkpoint.clone(),
            repository: Arc::clone(&self.repository),
            review: Arc::clone(&self.review),
            events: self.events.clone(),
            retry: self.retry.clone(),
            known_unique: Arc::clone(&self.known_unique),
            shared: Arc::clone(&self.shared),
        };
        registry.runs.insert(
            run_id.clone(),
            RunSlot {
                run,
                cancel_requested: false,
            },
        );
        registry.active = Some(run_id.clone());
        registry.generation += 1;
        drop(registry);

        metrics::counter!("dedup_runs_started_total").increment(1);
        metrics::gauge!("dedup_active_runs").set(1.0);
        self.events.publish(DedupEvent::RunStarted {
            meta: EventMeta::for_run(EVENT_SOURCE, &run_id),
            run_id: run_id.clone(),
            resumed_from,
        });
        tracing::info!(run_id = %run_id, "Deduplication run started");

        let spawned = std::thread::Builder::new()
            .name(format!("dedup-run-{}", short_id(&run_id)))
            .spawn(move || worker.run());
        if let Err(e) = spawned {
            let error = Error::OperationFailed {
                operation: "spawn_run_worker".to_string(),
                cause: e.to_string(),
            };
            self.shared.update(&run_id, |slot| {
                slot.run.record_error(&error);
                let _ = slot.run.transition(RunState::Failed);
            })?;
            metrics::gauge!("dedup_active_runs").set(0.0);
            return Err(error);
        }
        Ok(run_id)
    }

    /// Pauses a running run at the next batch boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown run or
    /// [`Error::InvalidTransition`] if the run is not running.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn pause_run(&self, run_id: &RunId) -> Result<()> {
        self.shared
            .update(run_id, |slot| slot.run.transition(RunState::Paused))??;
        tracing::info!("Run paused");
        Ok(())
    }

    /// Resumes a paused run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown run or
    /// [`Error::InvalidTransition`] if the run is not paused.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn resume_run(&self, run_id: &RunId) -> Result<()> {
        self.shared.update(run_id, |slot| {
            if slot.run.state == RunState::Running {
                return Err(Error::InvalidTransition {
                    from: RunState::Running,
                    to: RunState::Running,
                });
            }
            slot.run.transition(RunState::Running)
        })??;
        tracing::info!("Run resumed");
        Ok(())
    }

    /// Requests cancellation. A running run stops after its current batch; a
    /// paused run stops immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown run or
    /// [`Error::InvalidTransition`] if the run already ended.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        self.shared.update(run_id, |slot| {
            let state = slot.run.state;
            if !state.can_transition_to(RunState::Cancelled) {
                return Err(Error::InvalidTransition {
                    from: state,
                    to: RunState::Cancelled,
                });
            }
            slot.cancel_requested = true;
            Ok(())
        })??;
        tracing::info!("Run cancellation requested");
        Ok(())
    }

    /// Returns a snapshot of a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown run.
    pub fn get_run_status(&self, run_id: &RunId) -> Result<DeduplicationRun> {
        let registry = self.shared.lock()?;
        registry
            .runs
            .get(run_id)
            .map(|slot| slot.run.clone())
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))
    }

    /// Returns the most recently started run, if it is still active.
    #[must_use]
    pub fn active_run(&self) -> Option<RunId> {
        let registry = self.shared.lock().ok()?;
        let active = registry.active.as_ref()?;
        registry
            .runs
            .get(active)
            .filter(|slot| !slot.run.state.is_terminal())
            .map(|_| active.clone())
    }

    /// Blocks until a run reaches a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown run.
    pub fn wait_for_run(&self, run_id: &RunId) -> Result<DeduplicationRun> {
        let mut registry = self.shared.lock()?;
        loop {
            let slot = registry
                .runs
                .get(run_id)
                .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
            if slot.run.state.is_terminal() {
                return Ok(slot.run.clone());
            }
            registry = self.shared.changed.wait(registry).map_err(|_| Error::OperationFailed {
                operation: "run_registry".to_string(),
                cause: "Lock poisoned".to_string(),
            })?;
        }
    }

    /// Starts a run and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Same as [`DeduplicationOrchestrator::start_run`]. A run that fails is
    /// returned with state [`RunState::Failed`], not as an error.
    pub fn run_to_completion(&self, settings: DedupSettings) -> Result<DeduplicationRun> {
        let run_id = self.start_run(settings)?;
        self.wait_for_run(&run_id)
    }
}

fn short_id(run_id: &RunId) -> &str {
    let id = run_id.as_str();
    id.get(id.len().saturating_sub(8)..).unwrap_or(id)
}

/// What the worker should do at a batch boundary.
enum Gate {
    Proceed,
    Cancel,
}

/// Everything one run's worker thread needs.
struct Worker {
    run_id: RunId,
    settings: DedupSettings,
    cursor: Option<String>,
    repository: Arc<dyn MemoryRepository>,
    review: Arc<dyn ReviewQueue>,
    events: EventBus,
    retry: RetryPolicy,
    known_unique: Arc<dyn KnownUniqueIndex>,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(mut self) {
        let run_id = self.run_id.clone();
        let shared = Arc::clone(&self.shared);
        let outcome = catch_unwind(AssertUnwindSafe(|| self.process()));
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(Error::OperationFailed {
                operation: "run_worker".to_string(),
                cause: "worker thread panicked".to_string(),
            }),
        };
        if let Some(error) = error {
            tracing::error!(run_id = %run_id, error = %error, "Deduplication run failed");
            // Published under the registry lock so waiters see the event.
            let _ = shared.update(&run_id, |slot| {
                slot.run.record_error(&error);
                let _ = slot.run.transition(RunState::Failed);
                self.events.publish(DedupEvent::RunFailed {
                    meta: EventMeta::for_run(EVENT_SOURCE, &run_id),
                    run_id: run_id.clone(),
                    error: error.to_string(),
                    cursor: slot.run.checkpoint.clone(),
                });
            });
            metrics::counter!("dedup_runs_total", "state" => "failed").increment(1);
            metrics::gauge!("dedup_active_runs").set(0.0);
        }
    }

    #[instrument(name = "dedup_run", skip_all, fields(run_id = %self.run_id))]
    fn process(&mut self) -> Result<()> {
        let hybrid = HybridDetector::from_settings(&self.settings);
        let merger = MemoryMerger::from_settings(&self.settings);
        let context = DetectionContext::new()
            .with_repository(Arc::clone(&self.repository))
            .with_known_unique(Arc::clone(&self.known_unique));
        let filter = RecordFilter::active();
        let mut remaining = self.settings.max_records_per_run();
        let mut exhausted = false;
        let mut superseded = false;
        let mut batch_number = 0_u64;

        loop {
            if matches!(self.gate()?, Gate::Cancel) {
                self.finish(RunState::Cancelled)?;
                return Ok(());
            }
            if exhausted || remaining == 0 {
                if exhausted {
                    self.close_checkpoints()?;
                } else {
                    tracing::info!(
                        cursor = self.cursor.as_deref().unwrap_or(""),
                        "Record limit reached; next run continues from checkpoint"
                    );
                }
                // A pause that lands after the last batch sends us back to the gate.
                if self.finish(RunState::Completed)? {
                    return Ok(());
                }
                continue;
            }

            let limit = self.settings.batch_size().min(remaining);
            let cursor = self.cursor.clone();
            let batch = self.retry.execute("fetch_batch", || {
                self.repository.fetch_batch(cursor.as_deref(), limit, &filter)
            })?;
            if batch.is_empty() {
                exhausted = true;
                continue;
            }
            exhausted = batch.next_cursor.is_none();
            remaining = remaining.saturating_sub(batch.records.len());
            batch_number += 1;
            let last_id = batch
                .records
                .last()
                .map(|r| r.id.as_str().to_string());

            let started = Instant::now();
            self.process_batch(batch_number, batch.records.into(), &hybrid, &merger, &context)?;

            self.cursor = last_id;
            let counters = self.shared.update(&self.run_id, |slot| {
                slot.run.counters.batches_processed += 1;
                slot.run.counters
            })?;
            let cursor = self.cursor.clone();
            self.retry.execute("record_run_checkpoint", || {
                self.repository
                    .record_run_checkpoint(&self.run_id, cursor.as_deref(), &counters)
            })?;
            self.shared.update(&self.run_id, |slot| {
                slot.run.checkpoint.clone_from(&cursor);
            })?;
            if !superseded {
                superseded = self.supersede_checkpoints()?;
            }

            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            metrics::histogram!("dedup_batch_duration_ms").record(elapsed_ms);
            metrics::counter!("dedup_batches_total").increment(1);
            tracing::debug!(
                batch = batch_number,
                cursor = cursor.as_deref().unwrap_or(""),
                elapsed_ms,
                "Batch committed"
            );
            self.events.publish(DedupEvent::RunProgress {
                meta: EventMeta::for_run(EVENT_SOURCE, &self.run_id),
                run_id: self.run_id.clone(),
                counters,
                cursor,
            });
        }
    }

    /// Waits out a pause; reports a pending cancellation.
    fn gate(&self) -> Result<Gate> {
        let mut registry = self.shared.lock()?;
        loop {
            let slot = registry
                .runs
                .get(&self.run_id)
                .ok_or_else(|| Error::NotFound(format!("run {}", self.run_id)))?;
            if slot.cancel_requested {
                return Ok(Gate::Cancel);
            }
            if slot.run.state != RunState::Paused {
                return Ok(Gate::Proceed);
            }
            registry = self
                .shared
                .changed
                .wait(registry)
                .map_err(|_| Error::OperationFailed {
                    operation: "run_registry".to_string(),
                    cause: "Lock poisoned".to_string(),
                })?;
        }
    }

    #[instrument(skip_all, fields(batch = batch_number, records = records.len()))]
    fn process_batch(
        &self,
        batch_number: u64,
        records: Arc<[MemoryRecord]>,
        hybrid: &HybridDetector,
        merger: &MemoryMerger,
        context: &DetectionContext,
    ) -> Result<()> {
        let detected = hybrid.detect(&records, context);
        let scanned = records.len() as u64;
        let without_embedding = detected.skipped.len() as u64;
        let known_unique = detected.known_unique.len() as u64;
        let found = detected.groups.len() as u64;
        self.shared.update(&self.run_id, |slot| {
            slot.run.counters.candidates_scanned += scanned;
            slot.run.counters.records_without_embedding += without_embedding;
            slot.run.counters.known_unique_skipped += known_unique;
            slot.run.counters.groups_found += found;
            for failure in &detected.failures {
                slot.run.record_error(failure);
            }
        })?;
        metrics::counter!("dedup_records_scanned_total").increment(scanned);
        metrics::counter!("dedup_groups_found_total").increment(found);

        for group in &detected.groups {
            self.events.publish(DedupEvent::DuplicateGroupFound {
                meta: EventMeta::for_run(EVENT_SOURCE, &self.run_id),
                run_id: self.run_id.clone(),
                members: group.members().to_vec(),
                methods: group.methods().clone(),
                confidence: group.confidence(),
            });
            if group.confidence() >= self.settings.auto_merge_threshold() {
                self.merge_group(group, &records, merger)?;
            } else {
                self.queue_group(group)?;
            }
        }
        Ok(())
    }

    fn merge_group(
        &self,
        group: &DuplicateCandidateGroup,
        records: &[MemoryRecord],
        merger: &MemoryMerger,
    ) -> Result<()> {
        match merger.merge(
            self.repository.as_ref(),
            &self.retry,
            &self.run_id,
            group,
            records,
        ) {
            Ok(MergeResult::Skipped) => {
                self.shared.update(&self.run_id, |slot| {
                    slot.run.counters.groups_skipped += 1;
                })?;
            },
            Ok(MergeResult::Planned(plan)) => self.record_merge(plan, true)?,
            Ok(MergeResult::Applied(plan)) => self.record_merge(plan, false)?,
            Err(error @ Error::VersionConflict { .. }) => {
                tracing::warn!(error = %error, group_size = group.len(), "Merge deferred to next run");
                metrics::counter!("dedup_version_conflicts_total").increment(1);
                self.shared.update(&self.run_id, |slot| {
                    slot.run.counters.version_conflicts += 1;
                    slot.run.deferred_groups.push(group.clone());
                    slot.run.record_error(&error);
                })?;
            },
            Err(error @ Error::Repository { .. }) => return Err(error),
            Err(error) => {
                tracing::warn!(error = %error, group_size = group.len(), "Merge aborted");
                self.shared.update(&self.run_id, |slot| {
                    slot.run.counters.groups_skipped += 1;
                    slot.run.record_error(&error);
                })?;
            },
        }
        Ok(())
    }

    fn record_merge(&self, plan: MergePlan, dry_run: bool) -> Result<()> {
        let label = if dry_run { "true" } else { "false" };
        metrics::counter!("dedup_merges_total", "dry_run" => label).increment(1);
        let tombstoned: Vec<_> = plan.tombstoned.iter().map(|r| r.id.clone()).collect();
        let decision_id = plan.decision.decision_id.clone();
        let survivor_id = plan.survivor.id.clone();
        self.shared.update(&self.run_id, |slot| {
            slot.run.counters.merges_executed += 1;
            slot.run.counters.storage_bytes_reclaimed += plan.reclaimed_bytes;
            if dry_run {
                slot.run.dry_run_decisions.push(plan.decision);
            }
        })?;
        self.events.publish(DedupEvent::MergeExecuted {
            meta: EventMeta::for_run(EVENT_SOURCE, &self.run_id),
            run_id: self.run_id.clone(),
            decision_id,
            survivor_id,
            tombstoned,
            dry_run,
        });
        Ok(())
    }

    fn queue_group(&self, group: &DuplicateCandidateGroup) -> Result<()> {
        self.retry
            .execute("enqueue_review", || self.review.enqueue(&self.run_id, group))?;
        metrics::counter!("dedup_groups_queued_total").increment(1);
        self.shared.update(&self.run_id, |slot| {
            slot.run.counters.groups_queued_for_review += 1;
        })?;
        self.events.publish(DedupEvent::GroupQueuedForReview {
            meta: EventMeta::for_run(EVENT_SOURCE, &self.run_id),
            run_id: self.run_id.clone(),
            members: group.members().to_vec(),
            confidence: group.confidence(),
        });
        Ok(())
    }

    /// Closes every older checkpoint once this run has its own. Returns
    /// false if the repository refused, so the next batch tries again.
    fn supersede_checkpoints(&self) -> Result<bool> {
        match self.retry.execute("supersede_run_checkpoints", || {
            self.repository.supersede_run_checkpoints(&self.run_id)
        }) {
            Ok(()) => Ok(true),
            Err(error) => {
                tracing::warn!(error = %error, "Could not supersede older checkpoints");
                self.shared
                    .update(&self.run_id, |slot| slot.run.record_error(&error))?;
                Ok(false)
            },
        }
    }

    /// Closes every checkpoint, this run's included, after the repository
    /// was scanned to the end.
    fn close_checkpoints(&self) -> Result<()> {
        let closed = self
            .retry
            .execute("supersede_run_checkpoints", || {
                self.repository.supersede_run_checkpoints(&self.run_id)
            })
            .and_then(|()| {
                self.retry.execute("finish_run_checkpoint", || {
                    self.repository.finish_run_checkpoint(&self.run_id)
                })
            });
        if let Err(error) = closed {
            tracing::warn!(error = %error, "Could not mark checkpoints finished");
            self.shared
                .update(&self.run_id, |slot| slot.run.record_error(&error))?;
        }
        Ok(())
    }

    /// Moves the run to a terminal state. Returns false if the run was paused
    /// before it could complete.
    fn finish(&self, state: RunState) -> Result<bool> {
        let finished = self.shared.update(&self.run_id, |slot| -> Result<bool> {
            if state == RunState::Completed && slot.run.state == RunState::Paused {
                return Ok(false);
            }
            slot.run.transition(state)?;
            self.publish_terminal(state, slot.run.counters, slot.run.degraded);
            Ok(true)
        })??;
        if !finished {
            return Ok(false);
        }
        metrics::counter!("dedup_runs_total", "state" => state.as_str()).increment(1);
        metrics::gauge!("dedup_active_runs").set(0.0);
        Ok(true)
    }

    /// Runs under the registry lock, so the event is out before any waiter wakes.
    fn publish_terminal(&self, state: RunState, counters: RunCounters, degraded: bool) {
        let meta = EventMeta::for_run(EVENT_SOURCE, &self.run_id);
        let run_id = self.run_id.clone();
        if state == RunState::Cancelled {
            tracing::info!(run_id = %run_id, "Deduplication run cancelled");
            self.events.publish(DedupEvent::RunCancelled {
                meta,
                run_id,
                counters,
            });
        } else {
            tracing::info!(
                run_id = %run_id,
                batches = counters.batches_processed,
                groups = counters.groups_found,
                merges = counters.merges_executed,
                queued = counters.groups_queued_for_review,
                degraded,
                "Deduplication run completed"
            );
            self.events.publish(DedupEvent::RunCompleted {
                meta,
                run_id,
                counters,
                degraded,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemoryId, RunCheckpoint};
    use crate::storage::{InMemoryRepository, InMemoryReviewQueue, RepositoryOperation};
    use std::time::Duration;

    fn orchestrator(repository: Arc<InMemoryRepository>) -> DeduplicationOrchestrator {
        DeduplicationOrchestrator::new(
            repository,
            Arc::new(InMemoryReviewQueue::new()),
            EventBus::default(),
        )
        .with_retry_policy(RetryPolicy::default().with_initial_backoff_ms(1))
    }

    fn pairs(n: usize) -> Vec<MemoryRecord> {
        (0..n)
            .map(|i| MemoryRecord::new(format!("m-{i:03}"), format!("note number {}", i / 2)))
            .collect()
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id(&RunId::new("0123456789abcdef")), "89abcdef");
        assert_eq!(short_id(&RunId::new("abc")), "abc");
    }

    #[test]
    fn test_run_merges_pairs_across_batches() {
        let repository = Arc::new(InMemoryRepository::with_records(pairs(10)));
        let settings = DedupSettings::builder().with_batch_size(4).build().unwrap();
        let run = orchestrator(repository.clone())
            .run_to_completion(settings)
            .unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.counters.batches_processed, 3);
        assert_eq!(run.counters.candidates_scanned, 10);
        assert_eq!(run.counters.merges_executed, 5);
        assert_eq!(repository.active_records().len(), 5);
        assert!(repository.checkpoints().iter().all(|c| c.finished));
    }

    #[test]
    fn test_max_records_limits_scan() {
        let repository = Arc::new(InMemoryRepository::with_records(pairs(10)));
        let settings = DedupSettings::builder()
            .with_batch_size(4)
            .with_max_records_per_run(6)
            .build()
            .unwrap();
        let orchestrator = orchestrator(repository.clone());

        let first = orchestrator.run_to_completion(settings.clone()).unwrap();
        assert_eq!(first.state, RunState::Completed);
        assert_eq!(first.counters.candidates_scanned, 6);
        assert_eq!(first.counters.batches_processed, 2);
        let open = repository.latest_checkpoint().unwrap().unwrap();
        assert_eq!(open.run_id, first.run_id);
        assert_eq!(open.cursor.as_deref(), Some("m-005"));

        let second = orchestrator.run_to_completion(settings).unwrap();
        assert_eq!(second.resumed_from, Some(first.run_id));
        assert_eq!(second.counters.candidates_scanned, 4);
        assert_eq!(second.counters.merges_executed, 2);
        assert_eq!(repository.active_records().len(), 5);
        assert!(repository.checkpoints().iter().all(|c| c.finished));
    }

    #[test]
    fn test_resume_supersedes_older_checkpoints() {
        let repository = Arc::new(InMemoryRepository::with_records(pairs(10)));
        let counters = crate::models::RunCounters::default();
        repository
            .record_run_checkpoint(&RunId::new("older"), Some("m-003"), &counters)
            .unwrap();
        repository
            .record_run_checkpoint(&RunId::new("newer"), Some("m-005"), &counters)
            .unwrap();
        let settings = DedupSettings::builder().with_batch_size(2).build().unwrap();

        let run = orchestrator(repository.clone())
            .run_to_completion(settings)
            .unwrap();
        assert_eq!(run.resumed_from, Some(RunId::new("newer")));
        assert_eq!(run.counters.candidates_scanned, 4);
        assert!(repository.checkpoints().iter().all(|c| c.finished));
        assert!(repository.latest_checkpoint().unwrap().is_none());
    }

    #[test]
    fn test_second_start_conflicts() {
        let repository = Arc::new(InMemoryRepository::with_records(pairs(4)));
        repository.set_fetch_delay(Duration::from_millis(100));
        let orchestrator = orchestrator(repository);
        let run_id = orchestrator.start_run(DedupSettings::default()).unwrap();
        let second = orchestrator.start_run(DedupSettings::default());
        assert!(matches!(second, Err(Error::Conflict(_))));
        assert_eq!(orchestrator.active_run(), Some(run_id.clone()));
        orchestrator.wait_for_run(&run_id).unwrap();
        assert!(orchestrator.active_run().is_none());
    }

    #[test]
    fn test_checkpoint_retries_do_not_block_status() {
        let repository = Arc::new(InMemoryRepository::with_records(pairs(2)));
        let orchestrator = orchestrator(repository.clone())
            .with_retry_policy(RetryPolicy::default().with_initial_backoff_ms(400));
        let finished = orchestrator
            .run_to_completion(DedupSettings::default())
            .unwrap();

        repository.fail_next(RepositoryOperation::LatestCheckpoint, 1, true);
        let starter = {
            let orchestrator = orchestrator.clone();
            std::thread::spawn(move || orchestrator.start_run(DedupSettings::default()))
        };
        std::thread::sleep(Duration::from_millis(50));

        let asked = Instant::now();
        let status = orchestrator.get_run_status(&finished.run_id).unwrap();
        assert!(asked.elapsed() < Duration::from_millis(200));
        assert_eq!(status.state, RunState::Completed);

        let run_id = starter.join().unwrap().unwrap();
        assert_eq!(orchestrator.wait_for_run(&run_id).unwrap().state, RunState::Completed);
    }

    #[test]
    fn test_unknown_run_is_not_found() {
        let orchestrator = orchestrator(Arc::new(InMemoryRepository::new()));
        let missing = RunId::new("missing");
        assert!(matches!(orchestrator.get_run_status(&missing), Err(Error::NotFound(_))));
        assert!(matches!(orchestrator.pause_run(&missing), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_control_calls_on_finished_run_are_rejected() {
        let orchestrator = orchestrator(Arc::new(InMemoryRepository::with_records(pairs(2))));
        let run = orchestrator.run_to_completion(DedupSettings::default()).unwrap();
        assert!(matches!(
            orchestrator.pause_run(&run.run_id),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            orchestrator.cancel_run(&run.run_id),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            orchestrator.resume_run(&run.run_id),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_resumes_from_unfinished_checkpoint() {
        let repository = Arc::new(InMemoryRepository::with_records(pairs(6)));
        let counters = crate::models::RunCounters::default();
        repository
            .record_run_checkpoint(&RunId::new("crashed"), Some("m-003"), &counters)
            .unwrap();
        let run = orchestrator(repository.clone())
            .run_to_completion(DedupSettings::default())
            .unwrap();
        assert_eq!(run.resumed_from, Some(RunId::new("crashed")));
        assert_eq!(run.counters.candidates_scanned, 2);
        assert_eq!(run.counters.merges_executed, 1);
        assert!(repository.get(&MemoryId::new("m-000")).unwrap().is_active());
        assert!(repository.get(&MemoryId::new("m-001")).unwrap().is_active());
        let latest: Option<RunCheckpoint> = repository.latest_checkpoint().unwrap();
        assert!(latest.is_none());
    }
}
