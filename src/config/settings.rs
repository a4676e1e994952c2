//! Deduplication settings.
//!
//! Settings are immutable once built. Every run snapshots the settings it was
//! started with, so changing configuration never affects an in-flight run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::models::DetectionMethod;
use crate::{Error, Result};

/// Default fuzzy similarity threshold.
pub const DEFAULT_FUZZY_THRESHOLD: f32 = 0.85;
/// Default semantic (cosine) similarity threshold.
pub const DEFAULT_SEMANTIC_THRESHOLD: f32 = 0.95;
/// Default confidence at or above which groups merge without review.
pub const DEFAULT_AUTO_MERGE_THRESHOLD: f32 = 0.90;
/// Default number of records fetched per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Default cap on records scanned by one run.
pub const DEFAULT_MAX_RECORDS_PER_RUN: usize = 10_000;
/// Default nearest-neighbour count for semantic queries.
pub const DEFAULT_SEMANTIC_TOP_K: usize = 10;
/// Default per-batch detector deadline in milliseconds.
pub const DEFAULT_DETECTOR_TIMEOUT_MS: u64 = 30_000;

/// How the surviving record of a duplicate group is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Most recently updated record wins.
    #[default]
    KeepNewest,
    /// Highest importance wins; ties go to the newest.
    KeepMostImportant,
    /// Most non-empty metadata fields wins; ties go to the newest.
    KeepMostComplete,
}

impl MergeStrategy {
    /// Returns the strategy as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::KeepNewest => "keep_newest",
            Self::KeepMostImportant => "keep_most_important",
            Self::KeepMostComplete => "keep_most_complete",
        }
    }

    /// Parses a strategy name. Accepts `_` or `-` separators.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "keep_newest" | "newest" => Some(Self::KeepNewest),
            "keep_most_important" | "most_important" | "important" => {
                Some(Self::KeepMostImportant)
            },
            "keep_most_complete" | "most_complete" | "complete" => Some(Self::KeepMostComplete),
            _ => None,
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
            .ok_or_else(|| Error::Configuration(format!("unknown merge strategy '{s}'")))
    }
}

/// Parses a comma-separated detector list such as `exact,fuzzy`.
///
/// # Errors
///
/// Returns [`Error::Configuration`] for unknown names or an empty list.
pub fn parse_detectors(s: &str) -> Result<BTreeSet<DetectionMethod>> {
    let mut detectors = BTreeSet::new();
    for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let method = DetectionMethod::parse(name)
            .ok_or_else(|| Error::Configuration(format!("unknown detector '{name}'")))?;
        detectors.insert(method);
    }
    if detectors.is_empty() {
        return Err(Error::Configuration(
            "at least one detector must be enabled".to_string(),
        ));
    }
    Ok(detectors)
}

/// Validated deduplication settings.
///
/// # Environment Variables
///
/// | Variable | Type | Default |
/// |----------|------|---------|
/// | `MEMDEDUP_FUZZY_THRESHOLD` | f32 | `0.85` |
/// | `MEMDEDUP_SEMANTIC_THRESHOLD` | f32 | `0.95` |
/// | `MEMDEDUP_AUTO_MERGE_THRESHOLD` | f32 | `0.90` |
/// | `MEMDEDUP_BATCH_SIZE` | usize | `100` |
/// | `MEMDEDUP_MAX_RECORDS` | usize | `10000` |
/// | `MEMDEDUP_DETECTORS` | list | `exact,fuzzy,semantic` |
/// | `MEMDEDUP_MERGE_STRATEGY` | string | `keep_newest` |
/// | `MEMDEDUP_DRY_RUN` | bool | `false` |
/// | `MEMDEDUP_CASE_FOLD` | bool | `true` |
/// | `MEMDEDUP_SEMANTIC_TOP_K` | usize | `10` |
/// | `MEMDEDUP_DETECTOR_TIMEOUT_MS` | u64 | `30000` |
///
/// # Example
///
/// ```rust
/// use memdedup::config::{DedupSettings, MergeStrategy};
///
/// let settings = DedupSettings::builder()
///     .with_batch_size(50)
///     .with_merge_strategy(MergeStrategy::KeepMostImportant)
///     .build()
///     .unwrap();
/// assert_eq!(settings.batch_size(), 50);
/// assert!(DedupSettings::builder().with_batch_size(0).build().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DedupSettingsBuilder", into = "DedupSettingsBuilder")]
pub struct DedupSettings {
    similarity_threshold_fuzzy: f32,
    similarity_threshold_semantic: f32,
    auto_merge_threshold: f32,
    batch_size: usize,
    max_records_per_run: usize,
    enabled_detectors: BTreeSet<DetectionMethod>,
    merge_strategy: MergeStrategy,
    dry_run: bool,
    case_fold: bool,
    semantic_top_k: usize,
    detector_timeout: Duration,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            similarity_threshold_fuzzy: DEFAULT_FUZZY_THRESHOLD,
            similarity_threshold_semantic: DEFAULT_SEMANTIC_THRESHOLD,
            auto_merge_threshold: DEFAULT_AUTO_MERGE_THRESHOLD,
            batch_size: DEFAULT_BATCH_SIZE,
            max_records_per_run: DEFAULT_MAX_RECORDS_PER_RUN,
            enabled_detectors: DetectionMethod::ALL.into_iter().collect(),
            merge_strategy: MergeStrategy::KeepNewest,
            dry_run: false,
            case_fold: true,
            semantic_top_k: DEFAULT_SEMANTIC_TOP_K,
            detector_timeout: Duration::from_millis(DEFAULT_DETECTOR_TIMEOUT_MS),
        }
    }
}

impl DedupSettings {
    /// Starts a builder seeded with defaults.
    #[must_use]
    pub fn builder() -> DedupSettingsBuilder {
        DedupSettingsBuilder::default()
    }

    /// Builds settings from defaults plus `MEMDEDUP_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if an override yields invalid settings.
    pub fn from_env() -> Result<Self> {
        Self::builder().with_env_overrides().build()
    }

    /// Returns a builder holding these settings, for adjustment.
    #[must_use]
    pub fn to_builder(&self) -> DedupSettingsBuilder {
        DedupSettingsBuilder::from(self.clone())
    }

    /// Fuzzy similarity threshold (inclusive).
    #[must_use]
    pub const fn similarity_threshold_fuzzy(&self) -> f32 {
        self.similarity_threshold_fuzzy
    }

    /// Semantic similarity threshold (inclusive).
    #[must_use]
    pub const fn similarity_threshold_semantic(&self) -> f32 {
        self.similarity_threshold_semantic
    }

    /// Confidence at or above which a group is merged automatically.
    #[must_use]
    pub const fn auto_merge_threshold(&self) -> f32 {
        self.auto_merge_threshold
    }

    /// Records fetched per batch.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Maximum records scanned by one run.
    #[must_use]
    pub const fn max_records_per_run(&self) -> usize {
        self.max_records_per_run
    }

    /// Detectors that run on each batch.
    #[must_use]
    pub const fn enabled_detectors(&self) -> &BTreeSet<DetectionMethod> {
        &self.enabled_detectors
    }

    /// Returns true if `method` is enabled.
    #[must_use]
    pub fn is_enabled(&self, method: DetectionMethod) -> bool {
        self.enabled_detectors.contains(&method)
    }

    /// Survivor selection strategy.
    #[must_use]
    pub const fn merge_strategy(&self) -> MergeStrategy {
        self.merge_strategy
    }

    /// True if merges are planned but never written.
    #[must_use]
    pub const fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// True if content is lowercased before hashing and comparison.
    #[must_use]
    pub const fn case_fold(&self) -> bool {
        self.case_fold
    }

    /// Neighbours returned per semantic query.
    #[must_use]
    pub const fn semantic_top_k(&self) -> usize {
        self.semantic_top_k
    }

    /// Per-batch deadline shared by all detectors.
    #[must_use]
    pub const fn detector_timeout(&self) -> Duration {
        self.detector_timeout
    }
}

/// Builder for [`DedupSettings`].
///
/// Also the serialized form of the settings, which is why it derives serde:
/// the `[dedup]` section of a config file deserializes straight into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettingsBuilder {
    similarity_threshold_fuzzy: f32,
    similarity_threshold_semantic: f32,
    auto_merge_threshold: f32,
    batch_size: usize,
    max_records_per_run: usize,
    enabled_detectors: BTreeSet<DetectionMethod>,
    merge_strategy: MergeStrategy,
    dry_run: bool,
    case_fold: bool,
    semantic_top_k: usize,
    detector_timeout_ms: u64,
}

impl Default for DedupSettingsBuilder {
    fn default() -> Self {
        Self::from(DedupSettings::default())
    }
}

impl From<DedupSettings> for DedupSettingsBuilder {
    fn from(settings: DedupSettings) -> Self {
        Self {
            similarity_threshold_fuzzy: settings.similarity_threshold_fuzzy,
            similarity_threshold_semantic: settings.similarity_threshold_semantic,
            auto_merge_threshold: settings.auto_merge_threshold,
            batch_size: settings.batch_size,
            max_records_per_run: settings.max_records_per_run,
            enabled_detectors: settings.enabled_detectors,
            merge_strategy: settings.merge_strategy,
            dry_run: settings.dry_run,
            case_fold: settings.case_fold,
            semantic_top_k: settings.semantic_top_k,
            detector_timeout_ms: u64::try_from(settings.detector_timeout.as_millis())
                .unwrap_or(u64::MAX),
        }
    }
}

impl TryFrom<DedupSettingsBuilder> for DedupSettings {
    type Error = Error;

    fn try_from(builder: DedupSettingsBuilder) -> Result<Self> {
        builder.build()
    }
}

impl DedupSettingsBuilder {
    /// Sets the fuzzy threshold.
    #[must_use]
    pub const fn with_fuzzy_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold_fuzzy = threshold;
        self
    }

    /// Sets the semantic threshold.
    #[must_use]
    pub const fn with_semantic_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold_semantic = threshold;
        self
    }

    /// Sets the auto-merge threshold.
    #[must_use]
    pub const fn with_auto_merge_threshold(mut self, threshold: f32) -> Self {
        self.auto_merge_threshold = threshold;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the per-run record cap.
    #[must_use]
    pub const fn with_max_records_per_run(mut self, max: usize) -> Self {
        self.max_records_per_run = max;
        self
    }

    /// Replaces the enabled detector set.
    #[must_use]
    pub fn with_detectors<I>(mut self, detectors: I) -> Self
    where
        I: IntoIterator<Item = DetectionMethod>,
    {
        self.enabled_detectors = detectors.into_iter().collect();
        self
    }

    /// Sets the merge strategy.
    #[must_use]
    pub const fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    /// Enables or disables dry-run mode.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Enables or disables case folding.
    #[must_use]
    pub const fn with_case_fold(mut self, case_fold: bool) -> Self {
        self.case_fold = case_fold;
        self
    }

    /// Sets the semantic top-k.
    #[must_use]
    pub const fn with_semantic_top_k(mut self, top_k: usize) -> Self {
        self.semantic_top_k = top_k;
        self
    }

    /// Sets the detector deadline.
    #[must_use]
    pub fn with_detector_timeout(mut self, timeout: Duration) -> Self {
        self.detector_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Applies `MEMDEDUP_*` environment overrides.
    ///
    /// Unparseable values are logged and ignored. Detector lists and strategy
    /// names that do not parse are ignored the same way.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse("MEMDEDUP_FUZZY_THRESHOLD") {
            self.similarity_threshold_fuzzy = v;
        }
        if let Some(v) = env_parse("MEMDEDUP_SEMANTIC_THRESHOLD") {
            self.similarity_threshold_semantic = v;
        }
        if let Some(v) = env_parse("MEMDEDUP_AUTO_MERGE_THRESHOLD") {
            self.auto_merge_threshold = v;
        }
        if let Some(v) = env_parse("MEMDEDUP_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = env_parse("MEMDEDUP_MAX_RECORDS") {
            self.max_records_per_run = v;
        }
        if let Ok(v) = std::env::var("MEMDEDUP_DETECTORS") {
            match parse_detectors(&v) {
                Ok(detectors) => self.enabled_detectors = detectors,
                Err(e) => tracing::warn!(value = %v, error = %e, "Ignoring MEMDEDUP_DETECTORS"),
            }
        }
        if let Ok(v) = std::env::var("MEMDEDUP_MERGE_STRATEGY") {
            match MergeStrategy::parse(&v) {
                Some(strategy) => self.merge_strategy = strategy,
                None => tracing::warn!(value = %v, "Ignoring MEMDEDUP_MERGE_STRATEGY"),
            }
        }
        if let Some(v) = env_bool("MEMDEDUP_DRY_RUN") {
            self.dry_run = v;
        }
        if let Some(v) = env_bool("MEMDEDUP_CASE_FOLD") {
            self.case_fold = v;
        }
        if let Some(v) = env_parse("MEMDEDUP_SEMANTIC_TOP_K") {
            self.semantic_top_k = v;
        }
        if let Some(v) = env_parse("MEMDEDUP_DETECTOR_TIMEOUT_MS") {
            self.detector_timeout_ms = v;
        }
        self
    }

    /// Validates and builds the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a threshold is outside `[0, 1]` or
    /// not finite, a size or timeout is zero, or no detector is enabled.
    pub fn build(self) -> Result<DedupSettings> {
        validate_threshold("similarity_threshold_fuzzy", self.similarity_threshold_fuzzy)?;
        validate_threshold(
            "similarity_threshold_semantic",
            self.similarity_threshold_semantic,
        )?;
        validate_threshold("auto_merge_threshold", self.auto_merge_threshold)?;
        validate_positive("batch_size", self.batch_size)?;
        validate_positive("max_records_per_run", self.max_records_per_run)?;
        validate_positive("semantic_top_k", self.semantic_top_k)?;
        if self.detector_timeout_ms == 0 {
            return Err(Error::Configuration(
                "detector_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.enabled_detectors.is_empty() {
            return Err(Error::Configuration(
                "at least one detector must be enabled".to_string(),
            ));
        }

        Ok(DedupSettings {
            similarity_threshold_fuzzy: self.similarity_threshold_fuzzy,
            similarity_threshold_semantic: self.similarity_threshold_semantic,
            auto_merge_threshold: self.auto_merge_threshold,
            batch_size: self.batch_size,
            max_records_per_run: self.max_records_per_run,
            enabled_detectors: self.enabled_detectors,
            merge_strategy: self.merge_strategy,
            dry_run: self.dry_run,
            case_fold: self.case_fold,
            semantic_top_k: self.semantic_top_k,
            detector_timeout: Duration::from_millis(self.detector_timeout_ms),
        })
    }
}

fn validate_threshold(name: &str, value: f32) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "{name} must be between 0.0 and 1.0, got {value}"
        )))
    }
}

fn validate_positive(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(Error::Configuration(format!(
            "{name} must be greater than 0"
        )));
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
    }
    parsed
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        },
    }
}
