//! Per-student recency-weighted style profiles.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::{BaselineConfig, DriftThresholds};
use crate::drift;
use crate::error::{EngineError, EngineResult, EngineWarning};
use crate::features::{top_words, FeatureExtractor};
use crate::models::{Baseline, BaselineState, BaselineUpdate, StyleMetrics, WritingSample};

/// Weight of the next sample folded into a profile that already holds
/// `sample_count` samples. Never exceeds `cap`.
pub fn sample_weight(sample_count: usize, cap: f64) -> f64 {
    (1.0 / (sample_count as f64 + 1.0)).min(cap)
}

fn mix(old: f64, new: f64, w: f64) -> f64 {
    old * (1.0 - w) + new * w
}

fn mix_maps(
    old: &BTreeMap<String, f64>,
    new: &BTreeMap<String, f64>,
    w: f64,
) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for key in old.keys().chain(new.keys()) {
        if out.contains_key(key) {
            continue;
        }
        let a = old.get(key).copied().unwrap_or(0.0);
        let b = new.get(key).copied().unwrap_or(0.0);
        out.insert(key.clone(), mix(a, b, w));
    }
    out
}

/// Keeps the `limit` most frequent words, ties broken alphabetically.
fn prune(frequencies: BTreeMap<String, f64>, limit: usize) -> BTreeMap<String, f64> {
    if frequencies.len() <= limit {
        return frequencies;
    }
    let mut ranked: Vec<(String, f64)> = frequencies.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked.into_iter().collect()
}

/// Blends `new` into `old` with weight `w` on every numeric field.
pub fn blend(
    old: &StyleMetrics,
    new: &StyleMetrics,
    w: f64,
    config: &BaselineConfig,
) -> StyleMetrics {
    let (ov, nv) = (&old.vocabulary, &new.vocabulary);
    let (os, ns) = (&old.style, &new.style);

    let word_frequencies = prune(
        mix_maps(&ov.word_frequencies, &nv.word_frequencies, w),
        config.max_tracked_words,
    );
    let common_words = top_words(&word_frequencies, config.top_words);
    let rare_words = word_frequencies
        .iter()
        .filter(|(_, &c)| c <= 1.0)
        .map(|(word, _)| word.clone())
        .collect();

    let mut out = new.clone();
    {
        let v = &mut out.vocabulary;
        v.word_count = mix(ov.word_count, nv.word_count, w);
        v.unique_word_count = mix(ov.unique_word_count, nv.unique_word_count, w);
        v.complex_word_ratio = mix(ov.complex_word_ratio, nv.complex_word_ratio, w);
        v.average_word_length = mix(ov.average_word_length, nv.average_word_length, w);
        v.lexical_diversity = mix(ov.lexical_diversity, nv.lexical_diversity, w);
        v.average_syllables_per_word =
            mix(ov.average_syllables_per_word, nv.average_syllables_per_word, w);
        v.word_frequencies = word_frequencies;
        v.common_words = common_words;
        v.rare_words = rare_words;
    }
    {
        let s = &mut out.style;
        s.sentence_count = mix(os.sentence_count, ns.sentence_count, w);
        s.paragraph_count = mix(os.paragraph_count, ns.paragraph_count, w);
        s.average_sentence_length = mix(os.average_sentence_length, ns.average_sentence_length, w);
        s.sentence_length_variance =
            mix(os.sentence_length_variance, ns.sentence_length_variance, w);
        s.average_paragraph_length =
            mix(os.average_paragraph_length, ns.average_paragraph_length, w);
        s.transition_words = mix_maps(&os.transition_words, &ns.transition_words, w);
        s.transition_density = mix(os.transition_density, ns.transition_density, w);
        s.punctuation = mix_maps(&os.punctuation, &ns.punctuation, w);
        s.punctuation_density = mix(os.punctuation_density, ns.punctuation_density, w);
        s.grade_level = mix(os.grade_level, ns.grade_level, w);
    }
    out
}

/// Rejects metrics carrying negative or non-finite values.
pub fn validate_metrics(metrics: &StyleMetrics) -> EngineResult<()> {
    let v = &metrics.vocabulary;
    let s = &metrics.style;
    let scalars = [
        ("vocabulary.word_count", v.word_count),
        ("vocabulary.unique_word_count", v.unique_word_count),
        ("vocabulary.complex_word_ratio", v.complex_word_ratio),
        ("vocabulary.average_word_length", v.average_word_length),
        ("vocabulary.lexical_diversity", v.lexical_diversity),
        ("vocabulary.average_syllables_per_word", v.average_syllables_per_word),
        ("style.sentence_count", s.sentence_count),
        ("style.paragraph_count", s.paragraph_count),
        ("style.average_sentence_length", s.average_sentence_length),
        ("style.sentence_length_variance", s.sentence_length_variance),
        ("style.average_paragraph_length", s.average_paragraph_length),
        ("style.transition_density", s.transition_density),
        ("style.punctuation_density", s.punctuation_density),
        ("style.grade_level", s.grade_level),
    ];
    for (field, value) in scalars {
        if !value.is_finite() || value < 0.0 {
            return Err(EngineError::MalformedMetrics {
                field: field.to_string(),
                reason: format!("expected a finite non-negative number, got {value}"),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BaselineModel {
    config: BaselineConfig,
    extractor: FeatureExtractor,
}

impl BaselineModel {
    pub fn new(config: BaselineConfig) -> Self {
        let extractor = FeatureExtractor::new(config.top_words);
        Self { config, extractor }
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn create(&self, samples: &[WritingSample]) -> EngineResult<Baseline> {
        self.create_at(samples, Utc::now())
    }

    /// Builds a profile by folding samples oldest-first through the update
    /// weighting, so recent writing carries more weight.
    pub fn create_at(
        &self,
        samples: &[WritingSample],
        now: DateTime<Utc>,
    ) -> EngineResult<Baseline> {
        let min = self.config.min_samples;
        if samples.len() < min {
            return Err(EngineError::InsufficientSamples {
                required: min,
                actual: samples.len(),
            });
        }
        let student_id = samples[0].student_id.clone();
        if let Some(other) = samples.iter().find(|s| s.student_id != student_id) {
            return Err(EngineError::input(format!(
                "samples belong to more than one student ({student_id}, {})",
                other.student_id
            )));
        }

        let mut ordered: Vec<&WritingSample> = samples.iter().collect();
        ordered.sort_by_key(|s| s.timestamp);

        let mut aggregate = self.extractor.extract(&ordered[0].text);
        for (folded, sample) in ordered.iter().enumerate().skip(1) {
            let metrics = self.extractor.extract(&sample.text);
            let w = sample_weight(folded, self.config.cap_weight);
            aggregate = blend(&aggregate, &metrics, w, &self.config);
        }
        validate_metrics(&aggregate)?;

        let confidence =
            (samples.len() as f64 / min as f64).min(1.0) * self.config.max_initial_confidence;
        info!(
            student_id = %student_id,
            samples = samples.len(),
            confidence,
            "baseline created"
        );
        Ok(Baseline {
            student_id,
            aggregate_metrics: aggregate,
            sample_count: samples.len(),
            confidence,
            created_at: now,
            last_updated: now,
        })
    }

    /// Incremental update: `w = min(1 / (n + 1), cap)`, every numeric field
    /// moves to `old·(1−w) + new·w`, confidence steps up toward 1.
    pub fn update(
        &self,
        baseline: &Baseline,
        new_metrics: &StyleMetrics,
        now: DateTime<Utc>,
    ) -> EngineResult<Baseline> {
        validate_metrics(new_metrics)?;
        let w = sample_weight(baseline.sample_count, self.config.cap_weight);
        let aggregate = blend(&baseline.aggregate_metrics, new_metrics, w, &self.config);
        let confidence = (baseline.confidence + self.config.confidence_step).min(1.0);
        debug!(
            student_id = %baseline.student_id,
            weight = w,
            confidence,
            "baseline updated"
        );
        Ok(Baseline {
            student_id: baseline.student_id.clone(),
            aggregate_metrics: aggregate,
            sample_count: baseline.sample_count + 1,
            confidence,
            created_at: baseline.created_at,
            last_updated: now,
        })
    }

    /// Compares a new sample against the profile and folds it in, unless the
    /// profile is stale, in which case it is left untouched and a warning
    /// asks the caller for a full rebuild.
    pub fn apply_sample(
        &self,
        baseline: &Baseline,
        sample: &WritingSample,
        thresholds: &DriftThresholds,
        now: DateTime<Utc>,
    ) -> EngineResult<BaselineUpdate> {
        if sample.student_id != baseline.student_id {
            return Err(EngineError::input(format!(
                "sample for student {} cannot update baseline of {}",
                sample.student_id, baseline.student_id
            )));
        }
        let metrics = self.extractor.extract(&sample.text);
        let changes = drift::compare(&metrics, &baseline.aggregate_metrics, thresholds);

        if let Some(warning) = self.staleness_warning(baseline, now) {
            return Ok(BaselineUpdate {
                updated: false,
                changes,
                baseline: baseline.clone(),
                warnings: vec![warning],
            });
        }
        Ok(BaselineUpdate {
            updated: true,
            changes,
            baseline: self.update(baseline, &metrics, now)?,
            warnings: Vec::new(),
        })
    }

    pub fn is_stale(&self, baseline: &Baseline, now: DateTime<Utc>) -> bool {
        baseline.is_older_than(self.config.max_baseline_age_days, now)
    }

    pub fn staleness_warning(
        &self,
        baseline: &Baseline,
        now: DateTime<Utc>,
    ) -> Option<EngineWarning> {
        self.is_stale(baseline, now).then(|| EngineWarning::StaleBaseline {
            age_days: baseline.age_days(now),
            max_age_days: self.config.max_baseline_age_days,
        })
    }

    pub fn state(
        &self,
        baseline: Option<&Baseline>,
        samples_seen: usize,
        now: DateTime<Utc>,
    ) -> BaselineState {
        let required = self.config.min_samples;
        match baseline {
            None if samples_seen == 0 => BaselineState::Uninitialized,
            None => BaselineState::Building {
                samples: samples_seen,
                required,
            },
            Some(b) if self.is_stale(b, now) => BaselineState::Stale,
            Some(b) if b.confidence >= self.config.min_confidence => BaselineState::Established,
            Some(b) => BaselineState::Building {
                samples: b.sample_count,
                required,
            },
        }
    }
}

impl Default for BaselineModel {
    fn default() -> Self {
        Self::new(BaselineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::models::Severity;

    const TEXT: &str = "My summer was long and slow. We went to the lake most days. \
        The water was cold but my brother swam anyway. I read three books on the dock.";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn samples(n: usize, text: &str) -> Vec<WritingSample> {
        (0..n)
            .map(|i| WritingSample::new("stu-1", text, now() - Duration::days((n - i) as i64)))
            .collect()
    }

    #[test]
    fn weight_is_capped() {
        assert_eq!(sample_weight(0, 0.3), 0.3);
        assert_eq!(sample_weight(1, 0.3), 0.3);
        assert_eq!(sample_weight(3, 0.3), 0.25);
        assert!((sample_weight(9, 0.3) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn rejects_too_few_samples() {
        let model = BaselineModel::default();
        let err = model.create_at(&samples(2, TEXT), now()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientSamples {
                required: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn rejects_mixed_students() {
        let model = BaselineModel::default();
        let mut mixed = samples(3, TEXT);
        mixed[1].student_id = "stu-2".to_string();
        assert!(matches!(
            model.create_at(&mixed, now()),
            Err(EngineError::Input { .. })
        ));
    }

    #[test]
    fn identical_samples_reach_max_initial_confidence() {
        let model = BaselineModel::default();
        let baseline = model.create_at(&samples(3, TEXT), now()).unwrap();
        let single = model.extractor().extract(TEXT);

        assert_eq!(baseline.sample_count, 3);
        assert_eq!(baseline.confidence, 0.95);
        assert_eq!(baseline.last_updated, now());
        let agg = &baseline.aggregate_metrics;
        let (v, s) = (&single.vocabulary, &single.style);
        assert!((agg.vocabulary.complex_word_ratio - v.complex_word_ratio).abs() < 1e-12);
        assert!((agg.style.average_sentence_length - s.average_sentence_length).abs() < 1e-12);
    }

    #[test]
    fn updates_raise_confidence_to_one() {
        let model = BaselineModel::default();
        let mut baseline = model.create_at(&samples(3, TEXT), now()).unwrap();
        let metrics = model.extractor().extract(TEXT);
        let mut previous = baseline.confidence;
        for _ in 0..3 {
            baseline = model.update(&baseline, &metrics, now()).unwrap();
            assert!(baseline.confidence >= previous);
            assert!(baseline.confidence <= 1.0);
            previous = baseline.confidence;
        }
        assert_eq!(baseline.confidence, 1.0);
        assert_eq!(baseline.sample_count, 6);
    }

    #[test]
    fn update_moves_fields_by_capped_weight() {
        let model = BaselineModel::default();
        let mut baseline = model.create_at(&samples(3, TEXT), now()).unwrap();
        baseline.aggregate_metrics.vocabulary.complex_word_ratio = 0.2;
        let mut metrics = baseline.aggregate_metrics.clone();
        metrics.vocabulary.complex_word_ratio = 0.6;

        let updated = model.update(&baseline, &metrics, now()).unwrap();
        // n = 3 → w = 0.25
        assert!((updated.aggregate_metrics.vocabulary.complex_word_ratio - 0.3).abs() < 1e-12);
    }

    #[test]
    fn malformed_metrics_are_rejected() {
        let model = BaselineModel::default();
        let baseline = model.create_at(&samples(3, TEXT), now()).unwrap();
        let mut metrics = baseline.aggregate_metrics.clone();
        metrics.style.grade_level = f64::NAN;
        assert!(matches!(
            model.update(&baseline, &metrics, now()),
            Err(EngineError::MalformedMetrics { .. })
        ));
    }

    #[test]
    fn stale_baseline_is_not_updated() {
        let model = BaselineModel::default();
        let baseline = model
            .create_at(&samples(3, TEXT), now() - Duration::days(120))
            .unwrap();
        let sample = WritingSample::new("stu-1", TEXT, now());
        let result = model
            .apply_sample(&baseline, &sample, &DriftThresholds::default(), now())
            .unwrap();

        assert!(!result.updated);
        assert_eq!(result.baseline, baseline);
        assert!(matches!(
            result.warnings.as_slice(),
            [EngineWarning::StaleBaseline { age_days: 120, max_age_days: 90 }]
        ));
        assert_eq!(model.state(Some(&baseline), 3, now()), BaselineState::Stale);
    }

    #[test]
    fn staleness_counts_partial_days() {
        let model = BaselineModel::default();
        let baseline = model.create_at(&samples(3, TEXT), now()).unwrap();
        let almost = now() + Duration::days(90);
        let past = almost + Duration::hours(23);

        assert!(!model.is_stale(&baseline, almost));
        assert!(model.is_stale(&baseline, past));
        assert!(matches!(
            model.staleness_warning(&baseline, past),
            Some(EngineWarning::StaleBaseline { age_days: 90, max_age_days: 90 })
        ));
    }

    #[test]
    fn apply_sample_reports_changes() {
        let model = BaselineModel::default();
        let baseline = model.create_at(&samples(3, TEXT), now()).unwrap();
        let sophisticated = WritingSample::new(
            "stu-1",
            "Notwithstanding considerable meteorological unpredictability, \
             comprehensive recreational opportunities materialized; consequently, \
             extraordinary intellectual development characterized the vacation.",
            now(),
        );
        let result = model
            .apply_sample(&baseline, &sophisticated, &DriftThresholds::default(), now())
            .unwrap();
        assert!(result.updated);
        assert!(result
            .changes
            .iter()
            .any(|c| c.severity == Severity::High));
    }

    #[test]
    fn state_machine() {
        let model = BaselineModel::default();
        assert_eq!(model.state(None, 0, now()), BaselineState::Uninitialized);
        assert_eq!(
            model.state(None, 2, now()),
            BaselineState::Building {
                samples: 2,
                required: 3
            }
        );
        let baseline = model.create_at(&samples(3, TEXT), now()).unwrap();
        assert_eq!(model.state(Some(&baseline), 3, now()), BaselineState::Established);
    }
}
