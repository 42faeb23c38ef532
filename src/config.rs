use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::StyleDimension;

/// Full engine configuration. Every section falls back to its defaults when
/// omitted from the JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub baseline: BaselineConfig,
    pub drift: DriftThresholds,
    pub ensemble: EnsembleConfig,
    pub integrity: IntegrityConfig,
    pub trend: TrendConfig,
    pub batch: BatchConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    /// Per-class drift thresholds, keyed by class id.
    pub class_overrides: HashMap<String, DriftThresholds>,
}

impl EngineConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Unreadable(format!("{}: {e}", path.display())))?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Unreadable(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Drift thresholds for a class, falling back to the global ones.
    pub fn drift_for_class(&self, class_id: &str) -> &DriftThresholds {
        self.class_overrides.get(class_id).unwrap_or(&self.drift)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.baseline.validate()?;
        self.drift.validate()?;
        for thresholds in self.class_overrides.values() {
            thresholds.validate()?;
        }
        self.ensemble.validate()?;
        self.integrity.validate()?;
        self.trend.validate()?;
        self.batch.validate()?;
        Ok(())
    }
}

fn ensure(
    ok: bool,
    field: &'static str,
    expected: &'static str,
    value: f64,
) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            expected,
            value,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub min_samples: usize,
    /// Upper bound on the weight a single new sample gets in an update.
    pub cap_weight: f64,
    pub max_initial_confidence: f64,
    pub confidence_step: f64,
    pub min_confidence: f64,
    pub max_baseline_age_days: i64,
    /// Size cap on the aggregated word-frequency table.
    pub max_tracked_words: usize,
    pub top_words: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            min_samples: 3,
            cap_weight: 0.3,
            max_initial_confidence: 0.95,
            confidence_step: 0.1,
            min_confidence: 0.6,
            max_baseline_age_days: 90,
            max_tracked_words: 500,
            top_words: 20,
        }
    }
}

impl BaselineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.min_samples >= 1, "baseline.min_samples", ">= 1", self.min_samples as f64)?;
        ensure(
            self.cap_weight > 0.0 && self.cap_weight <= 1.0,
            "baseline.cap_weight",
            "in (0, 1]",
            self.cap_weight,
        )?;
        ensure(
            (0.0..=1.0).contains(&self.max_initial_confidence),
            "baseline.max_initial_confidence",
            "in [0, 1]",
            self.max_initial_confidence,
        )?;
        ensure(
            self.confidence_step >= 0.0,
            "baseline.confidence_step",
            ">= 0",
            self.confidence_step,
        )?;
        ensure(
            self.max_baseline_age_days > 0,
            "baseline.max_baseline_age_days",
            "> 0",
            self.max_baseline_age_days as f64,
        )
    }
}

/// Percent-change thresholds for drift classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftThresholds {
    pub normal_threshold: f64,
    pub suspicious_threshold: f64,
    pub dimensions: Vec<StyleDimension>,
    pub anomaly_z_threshold: f64,
    pub grade_jump_threshold: f64,
    pub realism: RealismThresholds,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            normal_threshold: 25.0,
            suspicious_threshold: 40.0,
            // Raw vocabulary size scales with essay length, so it is opt-in.
            dimensions: StyleDimension::ALL
                .into_iter()
                .filter(|d| *d != StyleDimension::UniqueWords)
                .collect(),
            anomaly_z_threshold: 2.0,
            grade_jump_threshold: 2.0,
            realism: RealismThresholds::default(),
        }
    }
}

impl DriftThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.normal_threshold > 0.0,
            "drift.normal_threshold",
            "> 0",
            self.normal_threshold,
        )?;
        if self.normal_threshold >= self.suspicious_threshold {
            return Err(ConfigError::ThresholdOrder {
                normal: self.normal_threshold,
                suspicious: self.suspicious_threshold,
            });
        }
        ensure(
            self.anomaly_z_threshold > 0.0,
            "drift.anomaly_z_threshold",
            "> 0",
            self.anomaly_z_threshold,
        )?;
        self.realism.validate()
    }
}

/// Yearly growth a strong student can plausibly show. Growth is measured in
/// percent per year, except reading grade level which is in levels per year.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealismThresholds {
    pub dimensions: Vec<StyleDimension>,
    pub high_achiever_growth: f64,
    pub suspicious_growth: f64,
    pub high_achiever_grade_levels: f64,
    pub suspicious_grade_levels: f64,
    /// Shorter spans are stretched to this many days before annualizing.
    pub min_span_days: f64,
}

impl Default for RealismThresholds {
    fn default() -> Self {
        Self {
            dimensions: vec![
                StyleDimension::GradeLevel,
                StyleDimension::ComplexWordRatio,
                StyleDimension::LexicalDiversity,
                StyleDimension::AverageWordLength,
                StyleDimension::AverageSentenceLength,
            ],
            high_achiever_growth: 25.0,
            suspicious_growth: 30.0,
            high_achiever_grade_levels: 1.5,
            suspicious_grade_levels: 2.0,
            min_span_days: 180.0,
        }
    }
}

impl RealismThresholds {
    fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.high_achiever_growth < self.suspicious_growth,
            "drift.realism.high_achiever_growth",
            "< suspicious_growth",
            self.high_achiever_growth,
        )?;
        ensure(
            self.high_achiever_grade_levels < self.suspicious_grade_levels,
            "drift.realism.high_achiever_grade_levels",
            "< suspicious_grade_levels",
            self.high_achiever_grade_levels,
        )?;
        ensure(
            self.min_span_days > 0.0,
            "drift.realism.min_span_days",
            "> 0",
            self.min_span_days,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyWeights {
    pub statistical: f64,
    pub pattern: f64,
    pub linguistic: f64,
    pub baseline: f64,
    pub anti_evasion: f64,
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self {
            statistical: 1.0,
            pattern: 1.5,
            linguistic: 0.8,
            baseline: 2.0,
            anti_evasion: 1.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Minimum trimmed character count accepted by `detect`.
    pub min_length: usize,
    pub max_length: usize,
    pub max_segments: usize,
    pub classification_threshold: f64,
    pub strategy_timeout_ms: u64,
    pub weights: StrategyWeights,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            min_length: 100,
            max_length: 50_000,
            max_segments: 5,
            classification_threshold: 0.8,
            strategy_timeout_ms: 2_000,
            weights: StrategyWeights::default(),
        }
    }
}

impl EnsembleConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.min_length >= 1,
            "ensemble.min_length",
            ">= 1",
            self.min_length as f64,
        )?;
        ensure(
            self.max_length > self.min_length,
            "ensemble.max_length",
            "> min_length",
            self.max_length as f64,
        )?;
        ensure(
            self.max_segments >= 1,
            "ensemble.max_segments",
            ">= 1",
            self.max_segments as f64,
        )?;
        ensure(
            (0.0..=1.0).contains(&self.classification_threshold),
            "ensemble.classification_threshold",
            "in [0, 1]",
            self.classification_threshold,
        )?;
        let w = &self.weights;
        for (field, value) in [
            ("ensemble.weights.statistical", w.statistical),
            ("ensemble.weights.pattern", w.pattern),
            ("ensemble.weights.linguistic", w.linguistic),
            ("ensemble.weights.baseline", w.baseline),
            ("ensemble.weights.anti_evasion", w.anti_evasion),
        ] {
            ensure(value >= 0.0, field, ">= 0", value)?;
        }
        Ok(())
    }
}

/// Fusion weights for the integrity score. The defaults are a proposal and
/// expected to be tuned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub baseline_drift_weight: f64,
    pub ai_probability_weight: f64,
    pub source_match_weight: f64,
    /// Scores at or above this are reported as medium risk.
    pub medium_risk: f64,
    pub high_risk: f64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            baseline_drift_weight: 0.4,
            ai_probability_weight: 0.3,
            source_match_weight: 0.3,
            medium_risk: 0.4,
            high_risk: 0.7,
        }
    }
}

impl IntegrityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("integrity.baseline_drift_weight", self.baseline_drift_weight),
            ("integrity.ai_probability_weight", self.ai_probability_weight),
            ("integrity.source_match_weight", self.source_match_weight),
        ] {
            ensure(value >= 0.0, field, ">= 0", value)?;
        }
        ensure(
            self.medium_risk < self.high_risk,
            "integrity.medium_risk",
            "< high_risk",
            self.medium_risk,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    pub min_samples: usize,
    /// Rate per day above which a series counts as moving.
    pub significance_threshold: f64,
    /// Span (days) that earns full time-coverage confidence.
    pub full_coverage_days: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            min_samples: 3,
            significance_threshold: 0.1,
            full_coverage_days: 30.0,
        }
    }
}

impl TrendConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.min_samples >= 2,
            "trend.min_samples",
            ">= 2",
            self.min_samples as f64,
        )?;
        ensure(
            self.significance_threshold >= 0.0,
            "trend.significance_threshold",
            ">= 0",
            self.significance_threshold,
        )?;
        ensure(
            self.full_coverage_days > 0.0,
            "trend.full_coverage_days",
            "> 0",
            self.full_coverage_days,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub max_concurrent_batches: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8,
            max_concurrent_batches: 3,
        }
    }
}

impl BatchConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.chunk_size >= 1,
            "batch.chunk_size",
            ">= 1",
            self.chunk_size as f64,
        )?;
        ensure(
            self.max_concurrent_batches >= 1,
            "batch.max_concurrent_batches",
            ">= 1",
            self.max_concurrent_batches as f64,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    /// Entry count at which a write also sweeps expired entries.
    pub sweep_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3_600,
            sweep_threshold: 1_024,
        }
    }
}
