//! Deviation of a sample's metrics from a baseline profile.

use crate::config::{DriftThresholds, RealismThresholds};
use crate::models::{HistoryAnomaly, Severity, StyleChange, StyleDimension, StyleMetrics};

/// `(current − baseline) / baseline · 100`, or `None` when the baseline value
/// is zero and no relative change exists.
pub fn percent_change(current: f64, baseline: f64) -> Option<f64> {
    if baseline == 0.0 || !baseline.is_finite() || !current.is_finite() {
        return None;
    }
    Some((current - baseline) / baseline * 100.0)
}

/// Severity tier for a percent change. Monotonic in `|pct|`.
pub fn classify(pct: f64, thresholds: &DriftThresholds) -> Option<Severity> {
    let magnitude = pct.abs();
    if magnitude >= thresholds.suspicious_threshold {
        Some(Severity::High)
    } else if magnitude >= thresholds.normal_threshold {
        Some(Severity::Medium)
    } else {
        None
    }
}

pub fn change_confidence(pct: f64, thresholds: &DriftThresholds) -> f64 {
    (pct.abs() / thresholds.suspicious_threshold).min(1.0)
}

fn describe(dimension: StyleDimension, pct: f64, previous: f64, current: f64) -> String {
    let direction = if pct >= 0.0 { "rose" } else { "fell" };
    format!(
        "{} {direction} {:.1}% ({previous:.2} → {current:.2})",
        dimension.label(),
        pct.abs()
    )
}

/// One [`StyleChange`] per monitored dimension whose change reaches the
/// normal threshold.
pub fn compare(
    current: &StyleMetrics,
    baseline: &StyleMetrics,
    thresholds: &DriftThresholds,
) -> Vec<StyleChange> {
    thresholds
        .dimensions
        .iter()
        .filter_map(|&dimension| {
            let previous = dimension.value(baseline);
            let now = dimension.value(current);
            let pct = percent_change(now, previous)?;
            let severity = classify(pct, thresholds)?;
            Some(StyleChange {
                dimension,
                description: describe(dimension, pct, previous, now),
                severity,
                previous_value: previous,
                current_value: now,
                percent_change: pct,
                confidence: change_confidence(pct, thresholds),
            })
        })
        .collect()
}

fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::High => 1.0,
        Severity::Medium => 0.6,
        Severity::Low => 0.3,
    }
}

/// Collapses a set of changes into a drift signal in [0, 1]: half the
/// strongest change, half the mean across every monitored dimension.
pub fn drift_score(changes: &[StyleChange], thresholds: &DriftThresholds) -> f64 {
    let monitored = thresholds.dimensions.len();
    if monitored == 0 || changes.is_empty() {
        return 0.0;
    }
    let strengths: Vec<f64> = changes
        .iter()
        .map(|c| c.confidence * severity_weight(c.severity))
        .collect();
    let max = strengths.iter().copied().fold(0.0, f64::max);
    let mean = strengths.iter().sum::<f64>() / monitored as f64;
    (0.5 * max + 0.5 * mean).clamp(0.0, 1.0)
}

/// Flags dimensions where the current sample sits far outside the student's
/// own history (z-score), plus reading-grade jumps.
pub fn history_anomalies(
    current: &StyleMetrics,
    history: &[StyleMetrics],
    thresholds: &DriftThresholds,
) -> Vec<HistoryAnomaly> {
    if history.len() < 2 {
        return Vec::new();
    }
    let mut anomalies = Vec::new();
    for &dimension in &thresholds.dimensions {
        let values: Vec<f64> = history.iter().map(|m| dimension.value(m)).collect();
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        let value = dimension.value(current);

        let z = (std > 0.0).then(|| (value - mean) / std);
        if let Some(z) = z.filter(|z| z.abs() > thresholds.anomaly_z_threshold) {
            anomalies.push(HistoryAnomaly {
                dimension,
                z_score: Some(z),
                severity: if z.abs() > 3.0 { Severity::High } else { Severity::Medium },
                description: format!(
                    "{} is {:.1} standard deviations from this student's history",
                    dimension.label(),
                    z.abs()
                ),
            });
            continue;
        }

        let jump = value - mean;
        let grade = dimension == StyleDimension::GradeLevel;
        if grade && jump.abs() > thresholds.grade_jump_threshold {
            anomalies.push(HistoryAnomaly {
                dimension,
                z_score: z,
                severity: if jump.abs() > 3.0 { Severity::High } else { Severity::Medium },
                description: format!(
                    "reading grade level moved {jump:+.1} levels from this student's average"
                ),
            });
        }
    }
    anomalies
}

/// Growth since the baseline, annualized over `elapsed_days`, that outpaces
/// what a strong student plausibly manages. Spans shorter than
/// `min_span_days` are stretched to it. Only improvements are judged.
pub fn improvement_realism(
    current: &StyleMetrics,
    baseline: &StyleMetrics,
    elapsed_days: f64,
    thresholds: &RealismThresholds,
) -> Vec<HistoryAnomaly> {
    let years = elapsed_days.max(thresholds.min_span_days) / 365.0;
    thresholds
        .dimensions
        .iter()
        .filter_map(|&dimension| {
            let previous = dimension.value(baseline);
            let now = dimension.value(current);
            let (rate, plausible, suspicious) = if dimension == StyleDimension::GradeLevel {
                (
                    (now - previous) / years,
                    thresholds.high_achiever_grade_levels,
                    thresholds.suspicious_grade_levels,
                )
            } else {
                (
                    percent_change(now, previous)? / years,
                    thresholds.high_achiever_growth,
                    thresholds.suspicious_growth,
                )
            };
            let severity = if rate > suspicious {
                Severity::High
            } else if rate > plausible {
                Severity::Medium
            } else {
                return None;
            };
            let description = if dimension == StyleDimension::GradeLevel {
                format!(
                    "reading grade level is rising {rate:.1} levels per year \
                     (strong students reach {plausible:.1})"
                )
            } else {
                format!(
                    "{} is growing {rate:.0}% per year (strong students reach {plausible:.0}%)",
                    dimension.label()
                )
            };
            Some(HistoryAnomaly {
                dimension,
                z_score: None,
                severity,
                description,
            })
        })
        .collect()
}

/// Compares samples against a profile using one set of thresholds.
#[derive(Debug, Clone, Default)]
pub struct DriftDetector {
    thresholds: DriftThresholds,
}

impl DriftDetector {
    pub fn new(thresholds: DriftThresholds) -> Self {
        Self { thresholds }
    }

    pub fn compare(&self, current: &StyleMetrics, baseline: &StyleMetrics) -> Vec<StyleChange> {
        compare(current, baseline, &self.thresholds)
    }

    pub fn score(&self, changes: &[StyleChange]) -> f64 {
        drift_score(changes, &self.thresholds)
    }

    pub fn anomalies(
        &self,
        current: &StyleMetrics,
        history: &[StyleMetrics],
    ) -> Vec<HistoryAnomaly> {
        history_anomalies(current, history, &self.thresholds)
    }

    pub fn realism(
        &self,
        current: &StyleMetrics,
        baseline: &StyleMetrics,
        elapsed_days: f64,
    ) -> Vec<HistoryAnomaly> {
        improvement_realism(current, baseline, elapsed_days, &self.thresholds.realism)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_complexity(ratio: f64) -> StyleMetrics {
        let mut m = StyleMetrics::default();
        m.vocabulary.complex_word_ratio = ratio;
        m
    }

    #[test]
    fn complexity_jump_is_high_severity() {
        let thresholds = DriftThresholds::default();
        let changes = compare(&with_complexity(0.75), &with_complexity(0.50), &thresholds);

        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.dimension, StyleDimension::ComplexWordRatio);
        assert_eq!(change.percent_change, 50.0);
        assert_eq!(change.severity, Severity::High);
        assert_eq!(change.confidence, 1.0);
        assert_eq!(change.description, "vocabulary complexity rose 50.0% (0.50 → 0.75)");
    }

    #[test]
    fn tiers_follow_thresholds() {
        let t = DriftThresholds::default();
        assert_eq!(classify(10.0, &t), None);
        assert_eq!(classify(-24.9, &t), None);
        assert_eq!(classify(25.0, &t), Some(Severity::Medium));
        assert_eq!(classify(-39.0, &t), Some(Severity::Medium));
        assert_eq!(classify(40.0, &t), Some(Severity::High));
        assert_eq!(classify(-75.0, &t), Some(Severity::High));
        assert!((change_confidence(30.0, &t) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn zero_baseline_dimension_is_skipped() {
        let changes = compare(
            &with_complexity(0.4),
            &with_complexity(0.0),
            &DriftThresholds::default(),
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn tuned_thresholds_change_classification() {
        let strict = DriftThresholds {
            normal_threshold: 5.0,
            suspicious_threshold: 10.0,
            ..DriftThresholds::default()
        };
        let changes = compare(&with_complexity(0.54), &with_complexity(0.50), &strict);
        assert_eq!(changes[0].severity, Severity::Medium);
    }

    #[test]
    fn drift_score_blends_max_and_mean() {
        let thresholds = DriftThresholds::default();
        assert_eq!(drift_score(&[], &thresholds), 0.0);

        let changes = compare(&with_complexity(0.75), &with_complexity(0.50), &thresholds);
        let monitored = thresholds.dimensions.len() as f64;
        let expected = 0.5 + 0.5 / monitored;
        assert!((drift_score(&changes, &thresholds) - expected).abs() < 1e-12);
    }

    #[test]
    fn anomalies_need_history() {
        let t = DriftThresholds::default();
        assert!(history_anomalies(&with_complexity(0.9), &[with_complexity(0.1)], &t).is_empty());
    }

    #[test]
    fn z_score_outlier_is_flagged() {
        let t = DriftThresholds::default();
        let history: Vec<StyleMetrics> = [0.10, 0.12, 0.11, 0.09, 0.13]
            .into_iter()
            .map(with_complexity)
            .collect();
        let anomalies = history_anomalies(&with_complexity(0.40), &history, &t);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].dimension, StyleDimension::ComplexWordRatio);
        assert_eq!(anomalies[0].severity, Severity::High);
    }

    #[test]
    fn grade_jump_without_variance_is_flagged() {
        let t = DriftThresholds::default();
        let anomalies = history_anomalies(&grade(10.5), &[grade(7.0), grade(7.0)], &t);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].z_score, None);
        assert_eq!(anomalies[0].severity, Severity::High);
    }

    fn grade(level: f64) -> StyleMetrics {
        let mut m = StyleMetrics::default();
        m.style.grade_level = level;
        m
    }

    #[test]
    fn grade_growth_is_judged_per_year() {
        let detector = DriftDetector::default();
        assert!(detector.realism(&grade(9.0), &grade(7.0), 3.0 * 365.0).is_empty());

        let sudden = detector.realism(&grade(9.0), &grade(7.0), 3.0);
        assert_eq!(sudden.len(), 1);
        assert_eq!(sudden[0].dimension, StyleDimension::GradeLevel);
        assert_eq!(sudden[0].severity, Severity::High);
        assert!(sudden[0].description.contains("levels per year"));
    }

    #[test]
    fn percent_growth_uses_achiever_tiers() {
        let t = RealismThresholds::default();
        let (before, after) = (with_complexity(0.10), with_complexity(0.128));
        let strong = improvement_realism(&after, &before, 365.0, &t);
        assert_eq!(strong.len(), 1);
        assert_eq!(strong[0].severity, Severity::Medium);

        let steady = improvement_realism(&after, &before, 730.0, &t);
        assert!(steady.is_empty());

        let declining = improvement_realism(&with_complexity(0.05), &before, 1.0, &t);
        assert!(declining.is_empty());
    }
}
