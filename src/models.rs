use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineWarning;

/// One piece of student writing. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritingSample {
    pub id: Uuid,
    pub student_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl WritingSample {
    pub fn new(
        student_id: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id: student_id.into(),
            text: text.into(),
            timestamp,
        }
    }
}

/// Counts are kept as `f64` so an aggregated baseline profile can hold
/// blended values in the same shape as a single sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VocabularyMetrics {
    pub word_count: f64,
    pub unique_word_count: f64,
    pub complex_word_ratio: f64,
    pub average_word_length: f64,
    pub lexical_diversity: f64,
    pub average_syllables_per_word: f64,
    pub word_frequencies: BTreeMap<String, f64>,
    pub common_words: Vec<String>,
    pub rare_words: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleFeatures {
    pub sentence_count: f64,
    pub paragraph_count: f64,
    /// Words per sentence.
    pub average_sentence_length: f64,
    pub sentence_length_variance: f64,
    /// Sentences per paragraph.
    pub average_paragraph_length: f64,
    pub transition_words: BTreeMap<String, f64>,
    /// Transition words per sentence.
    pub transition_density: f64,
    pub punctuation: BTreeMap<String, f64>,
    /// Punctuation marks per word.
    pub punctuation_density: f64,
    pub grade_level: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleMetrics {
    pub vocabulary: VocabularyMetrics,
    pub style: StyleFeatures,
}

/// Scalar views over [`StyleMetrics`] that drift detection, anomaly checks
/// and trend series read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StyleDimension {
    UniqueWords,
    ComplexWordRatio,
    AverageWordLength,
    LexicalDiversity,
    AverageSentenceLength,
    AverageParagraphLength,
    TransitionDensity,
    PunctuationDensity,
    GradeLevel,
}

impl StyleDimension {
    pub const ALL: [StyleDimension; 9] = [
        StyleDimension::UniqueWords,
        StyleDimension::ComplexWordRatio,
        StyleDimension::AverageWordLength,
        StyleDimension::LexicalDiversity,
        StyleDimension::AverageSentenceLength,
        StyleDimension::AverageParagraphLength,
        StyleDimension::TransitionDensity,
        StyleDimension::PunctuationDensity,
        StyleDimension::GradeLevel,
    ];

    pub fn value(self, metrics: &StyleMetrics) -> f64 {
        let v = &metrics.vocabulary;
        let s = &metrics.style;
        match self {
            Self::UniqueWords => v.unique_word_count,
            Self::ComplexWordRatio => v.complex_word_ratio,
            Self::AverageWordLength => v.average_word_length,
            Self::LexicalDiversity => v.lexical_diversity,
            Self::AverageSentenceLength => s.average_sentence_length,
            Self::AverageParagraphLength => s.average_paragraph_length,
            Self::TransitionDensity => s.transition_density,
            Self::PunctuationDensity => s.punctuation_density,
            Self::GradeLevel => s.grade_level,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UniqueWords => "unique_words",
            Self::ComplexWordRatio => "complex_word_ratio",
            Self::AverageWordLength => "average_word_length",
            Self::LexicalDiversity => "lexical_diversity",
            Self::AverageSentenceLength => "average_sentence_length",
            Self::AverageParagraphLength => "average_paragraph_length",
            Self::TransitionDensity => "transition_density",
            Self::PunctuationDensity => "punctuation_density",
            Self::GradeLevel => "grade_level",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::UniqueWords => "vocabulary size",
            Self::ComplexWordRatio => "vocabulary complexity",
            Self::AverageWordLength => "average word length",
            Self::LexicalDiversity => "lexical diversity",
            Self::AverageSentenceLength => "sentence length",
            Self::AverageParagraphLength => "paragraph length",
            Self::TransitionDensity => "transition word usage",
            Self::PunctuationDensity => "punctuation usage",
            Self::GradeLevel => "reading grade level",
        }
    }
}

impl std::str::FromStr for StyleDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown style dimension `{s}`"))
    }
}

/// A student's recency-weighted running style profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub student_id: String,
    pub aggregate_metrics: StyleMetrics,
    pub sample_count: usize,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Baseline {
    /// Whole days since the last update, for display.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_updated).num_days()
    }

    pub fn is_older_than(&self, max_age_days: i64, now: DateTime<Utc>) -> bool {
        now - self.last_updated > Duration::days(max_age_days)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BaselineState {
    Uninitialized,
    Building { samples: usize, required: usize },
    Established,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleChange {
    #[serde(rename = "type")]
    pub dimension: StyleDimension,
    pub description: String,
    pub severity: Severity,
    pub previous_value: f64,
    pub current_value: f64,
    pub percent_change: f64,
    pub confidence: f64,
}

/// A current-sample dimension far outside the student's own history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryAnomaly {
    pub dimension: StyleDimension,
    /// Absent when the history has no spread to measure against.
    pub z_score: Option<f64>,
    pub severity: Severity,
    pub description: String,
}

/// Result of feeding one sample through the baseline model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaselineUpdate {
    pub updated: bool,
    pub changes: Vec<StyleChange>,
    pub baseline: Baseline,
    pub warnings: Vec<EngineWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSignal {
    #[serde(rename = "type")]
    pub signal_type: String,
    pub severity: f64,
    pub evidence: Vec<String>,
}

impl DetectionSignal {
    pub fn new(signal_type: impl Into<String>, severity: f64, evidence: Vec<String>) -> Self {
        Self {
            signal_type: signal_type.into(),
            severity: severity.clamp(0.0, 1.0),
            evidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyScore {
    pub strategy: String,
    pub score: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentScore {
    pub index: usize,
    /// Byte range of the segment in the submitted text.
    pub start: usize,
    pub end: usize,
    pub score: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub score: f64,
    pub confidence: f64,
    pub signals: Vec<DetectionSignal>,
    pub strategy_scores: Vec<StrategyScore>,
    pub segments: Vec<SegmentScore>,
    pub is_ai_generated: bool,
    pub warnings: Vec<EngineWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMatch {
    pub source_id: String,
    pub similarity: f64,
    pub matched_segments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegritySignal {
    StyleDrift,
    AiProbability,
    SourceMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalContribution {
    pub signal: IntegritySignal,
    pub value: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub priority: Severity,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityAnalysis {
    pub risk_level: Severity,
    pub contributions: Vec<SignalContribution>,
    pub style_changes: Vec<StyleChange>,
    pub anomalies: Vec<HistoryAnomaly>,
    pub detection: Option<DetectionResult>,
    pub explanation: String,
    pub recommendations: Vec<Recommendation>,
    pub warnings: Vec<EngineWarning>,
}

/// Fused integrity risk. Read-only once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityScore {
    pub score: f64,
    pub student_match: Option<f64>,
    pub source_matches: Vec<SourceMatch>,
    pub ai_probability: Option<f64>,
    pub analysis: IntegrityAnalysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Steady,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Improving => "improving",
            Self::Declining => "declining",
            Self::Steady => "steady",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSegment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub net_change: f64,
    pub points: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendReport {
    pub trend: Trend,
    /// Regression slope in value units per day.
    pub rate: f64,
    pub confidence: f64,
    pub segments: Vec<TrendSegment>,
}

impl TrendReport {
    pub fn insufficient() -> Self {
        Self {
            trend: Trend::Steady,
            rate: 0.0,
            confidence: 0.0,
            segments: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_round_trip_through_names() {
        for dimension in StyleDimension::ALL {
            let parsed: StyleDimension = dimension.as_str().parse().unwrap();
            assert_eq!(parsed, dimension);
        }
        assert!("vibes".parse::<StyleDimension>().is_err());
    }

    #[test]
    fn severity_orders_low_to_high() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
    }

    #[test]
    fn signal_severity_is_clamped() {
        assert_eq!(DetectionSignal::new("x", 1.7, vec![]).severity, 1.0);
        assert_eq!(DetectionSignal::new("x", -0.2, vec![]).severity, 0.0);
    }
}
