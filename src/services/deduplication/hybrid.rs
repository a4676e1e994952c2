//! Concurrent multi-detector execution and result unification.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use tracing::instrument;

use super::detector::{DetectionContext, Detector, DetectorOutput};
use super::union_find::UnionFind;
use crate::config::DedupSettings;
use crate::models::{DetectionMethod, DuplicateCandidateGroup, MemoryId, MemoryRecord};
use crate::{Error, Result};

/// Unified result of every enabled detector on one batch.
#[derive(Debug, Default)]
pub struct HybridOutput {
    /// Disjoint groups, members sorted, ordered by first member.
    pub groups: Vec<DuplicateCandidateGroup>,
    /// One [`Error::DetectorFailure`] per detector that did not finish.
    pub failures: Vec<Error>,
    /// Records the semantic detector could not consider.
    pub skipped: Vec<MemoryId>,
    /// Records the exact detector passed over as known-unique.
    pub known_unique: Vec<MemoryId>,
    /// Per-detector wall time for detectors that finished.
    pub timings: BTreeMap<DetectionMethod, Duration>,
}

impl HybridOutput {
    /// True when at least one detector failed for this batch.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

type DetectorMessage = (DetectionMethod, std::thread::Result<Result<DetectorOutput>>);

/// Runs every enabled detector in parallel and merges their groups.
///
/// Each detector gets its own named OS thread and a shared handle to the
/// batch. Results are collected against a single deadline; a detector that
/// errors, panics, or is still running at the deadline is reported as a
/// failure and the rest of the batch proceeds. Late results are discarded,
/// and so are their known-unique index writes: a detector's
/// [`DetectorOutput::index_updates`] are committed only once its result is
/// accepted.
///
/// Groups from different detectors that share a record are unified, so the
/// output groups are disjoint. A unified group's confidence is 1.0 if any
/// contributing group was exact, otherwise the highest contributing
/// confidence.
#[derive(Debug, Clone)]
pub struct HybridDetector {
    detectors: Vec<Detector>,
    timeout: Duration,
}

impl HybridDetector {
    /// Creates a hybrid detector.
    #[must_use]
    pub const fn new(detectors: Vec<Detector>, timeout: Duration) -> Self {
        Self { detectors, timeout }
    }

    /// Builds the detectors enabled in `settings`.
    #[must_use]
    pub fn from_settings(settings: &DedupSettings) -> Self {
        Self::new(Detector::enabled(settings), settings.detector_timeout())
    }

    /// Returns the configured detectors.
    #[must_use]
    pub fn detectors(&self) -> &[Detector] {
        &self.detectors
    }

    /// Returns the shared per-batch deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs all detectors over `batch`.
    #[instrument(skip_all, fields(records = batch.len(), detectors = self.detectors.len()))]
    pub fn detect(&self, batch: &Arc<[MemoryRecord]>, context: &DetectionContext) -> HybridOutput {
        let mut output = HybridOutput::default();
        let (tx, rx) = mpsc::channel::<DetectorMessage>();
        let mut pending: BTreeSet<DetectionMethod> = BTreeSet::new();

        for detector in &self.detectors {
            let method = detector.method();
            let detector = detector.clone();
            let records = Arc::clone(batch);
            let context = context.clone();
            let sender = tx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("dedup-detector-{method}"))
                .spawn(move || {
                    let result =
                        catch_unwind(AssertUnwindSafe(|| detector.detect(&records, &context)));
                    // The receiver is gone once the deadline passed.
                    let _ = sender.send((method, result));
                });
            match spawned {
                Ok(_) => {
                    pending.insert(method);
                },
                Err(e) => output
                    .failures
                    .push(failure(method, format!("failed to spawn detector thread: {e}"))),
            }
        }
        drop(tx);

        let deadline = Instant::now() + self.timeout;
        let mut outputs: BTreeMap<DetectionMethod, DetectorOutput> = BTreeMap::new();
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((method, result)) => {
                    pending.remove(&method);
                    match result {
                        Ok(Ok(detected)) => {
                            if let Some(index) = context.known_unique() {
                                detected.commit_index_updates(index);
                            }
                            outputs.insert(method, detected);
                        },
                        Ok(Err(e)) => output.failures.push(failure(method, e.to_string())),
                        Err(payload) => output.failures.push(failure(
                            method,
                            format!("panicked: {}", panic_message(&*payload)),
                        )),
                    }
                },
                Err(RecvTimeoutError::Timeout) => {
                    let millis = self.timeout.as_millis();
                    for method in std::mem::take(&mut pending) {
                        output
                            .failures
                            .push(failure(method, format!("timed out after {millis} ms")));
                    }
                },
                Err(RecvTimeoutError::Disconnected) => {
                    for method in std::mem::take(&mut pending) {
                        output.failures.push(failure(
                            method,
                            "detector thread terminated without a result".to_string(),
                        ));
                    }
                },
            }
        }

        for error in &output.failures {
            if let Error::DetectorFailure { detector, cause } = error {
                tracing::warn!(detector = %detector, cause = %cause, "Detector failed; batch degraded");
                metrics::counter!("dedup_detector_failures_total", "detector" => detector.as_str())
                    .increment(1);
            }
        }
        output.failures.sort_by_key(|e| match e {
            Error::DetectorFailure { detector, .. } => Some(*detector),
            _ => None,
        });

        for (method, detected) in &outputs {
            let millis = detected.elapsed.as_secs_f64() * 1000.0;
            metrics::histogram!("dedup_detector_duration_ms", "detector" => method.as_str())
                .record(millis);
            output.timings.insert(*method, detected.elapsed);
            output.skipped.extend(detected.skipped.iter().cloned());
            output.known_unique.extend(detected.known_unique.iter().cloned());
        }
        output.skipped.sort();
        output.skipped.dedup();
        output.known_unique.sort();
        output.known_unique.dedup();

        output.groups = unify(batch, outputs.into_values().collect());
        output
    }
}

fn failure(detector: DetectionMethod, cause: String) -> Error {
    Error::DetectorFailure { detector, cause }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Unifies groups from several detectors into disjoint groups.
///
/// Members unknown to the batch are ignored.
#[must_use]
pub fn unify(batch: &[MemoryRecord], outputs: Vec<DetectorOutput>) -> Vec<DuplicateCandidateGroup> {
    let positions: HashMap<&MemoryId, usize> =
        batch.iter().enumerate().map(|(i, r)| (&r.id, i)).collect();
    let mut uf = UnionFind::new(batch.len());

    let mut contributions: Vec<(usize, DetectionMethod, f32)> = Vec::new();
    for detected in &outputs {
        for group in &detected.groups {
            let slots: Vec<usize> = group
                .members()
                .iter()
                .filter_map(|id| positions.get(id).copied())
                .collect();
            let Some(first) = slots.first().copied() else {
                continue;
            };
            for slot in &slots[1..] {
                uf.union(first, *slot);
            }
            contributions.push((first, detected.method, group.confidence()));
        }
    }

    let mut by_root: BTreeMap<usize, (BTreeSet<DetectionMethod>, f32)> = BTreeMap::new();
    for (slot, method, confidence) in contributions {
        let root = uf.find(slot);
        let entry = by_root.entry(root).or_insert((BTreeSet::new(), 0.0));
        entry.0.insert(method);
        entry.1 = entry.1.max(confidence);
    }

    let mut groups: Vec<DuplicateCandidateGroup> = uf
        .components()
        .into_iter()
        .filter_map(|component| {
            let root = uf.find(component[0]);
            let (methods, max_confidence) = by_root.remove(&root)?;
            let confidence = if methods.contains(&DetectionMethod::Exact) {
                1.0
            } else {
                max_confidence
            };
            let members = component.iter().map(|slot| batch[*slot].id.clone());
            DuplicateCandidateGroup::new(members, methods, confidence).ok()
        })
        .collect();
    groups.sort_by(|a, b| a.members().cmp(b.members()));
    groups
}
