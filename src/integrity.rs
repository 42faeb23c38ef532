//! Fusion of drift, authorship probability and source similarity into a
//! single risk score with an explanation.

use crate::config::IntegrityConfig;
use crate::error::EngineWarning;
use crate::models::{
    DetectionResult, HistoryAnomaly, IntegrityAnalysis, IntegrityScore, IntegritySignal,
    Recommendation, Severity, SignalContribution, SourceMatch, StyleChange,
};

/// Everything the scorer fuses. `None` marks a signal that could not be
/// produced; it is excluded from normalization rather than counted as zero.
#[derive(Debug, Clone, Default)]
pub struct IntegrityInputs {
    pub drift: Option<f64>,
    pub style_changes: Vec<StyleChange>,
    pub anomalies: Vec<HistoryAnomaly>,
    pub detection: Option<DetectionResult>,
    pub source_matches: Option<Vec<SourceMatch>>,
    pub warnings: Vec<EngineWarning>,
}

/// Weighted mean over the present signals with positive weight.
pub fn fuse(contributions: &[SignalContribution]) -> Option<f64> {
    let active: Vec<&SignalContribution> =
        contributions.iter().filter(|c| c.weight > 0.0).collect();
    let total: f64 = active.iter().map(|c| c.weight).sum();
    if total <= 0.0 {
        return None;
    }
    let value = active.iter().map(|c| c.value * c.weight).sum::<f64>() / total;
    Some(value.clamp(0.0, 1.0))
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityScorer {
    config: IntegrityConfig,
}

impl IntegrityScorer {
    pub fn new(config: IntegrityConfig) -> Self {
        Self { config }
    }

    pub fn risk_level(&self, score: f64) -> Severity {
        if score >= self.config.high_risk {
            Severity::High
        } else if score >= self.config.medium_risk {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn score(&self, inputs: IntegrityInputs) -> IntegrityScore {
        let IntegrityInputs {
            drift,
            style_changes,
            anomalies,
            detection,
            source_matches,
            mut warnings,
        } = inputs;

        let ai_probability = detection.as_ref().map(|d| d.score);
        let top_source = source_matches.as_ref().map(|matches| {
            matches
                .iter()
                .map(|m| m.similarity)
                .fold(0.0_f64, f64::max)
        });

        let mut contributions = Vec::new();
        let candidates = [
            (IntegritySignal::StyleDrift, drift, self.config.baseline_drift_weight),
            (IntegritySignal::AiProbability, ai_probability, self.config.ai_probability_weight),
            (IntegritySignal::SourceMatch, top_source, self.config.source_match_weight),
        ];
        for (signal, value, weight) in candidates {
            if let Some(value) = value {
                contributions.push(SignalContribution {
                    signal,
                    value: value.clamp(0.0, 1.0),
                    weight,
                });
            }
        }

        let score = match fuse(&contributions) {
            Some(score) => score,
            None => {
                warnings.push(EngineWarning::NoSignals);
                0.0
            }
        };
        let risk_level = self.risk_level(score);

        let mut analysis = IntegrityAnalysis {
            risk_level,
            contributions,
            style_changes,
            anomalies,
            detection,
            explanation: String::new(),
            recommendations: Vec::new(),
            warnings,
        };
        let source_matches = source_matches.unwrap_or_default();
        analysis.explanation = explain(score, &analysis, &source_matches);
        analysis.recommendations = recommend(&analysis, &source_matches);

        IntegrityScore {
            score,
            student_match: drift.map(|d| (1.0 - d).clamp(0.0, 1.0)),
            source_matches,
            ai_probability,
            analysis,
        }
    }
}

fn explain(score: f64, analysis: &IntegrityAnalysis, matches: &[SourceMatch]) -> String {
    let mut parts = vec![format!(
        "Overall integrity risk is {} ({score:.2}).",
        analysis.risk_level
    )];

    let has = |signal: IntegritySignal| analysis.contributions.iter().find(|c| c.signal == signal);
    match has(IntegritySignal::StyleDrift) {
        Some(c) if analysis.style_changes.is_empty() => parts.push(format!(
            "Writing style is consistent with the student's baseline (drift {:.2}).",
            c.value
        )),
        Some(c) => {
            let strongest = analysis
                .style_changes
                .iter()
                .max_by(|a, b| {
                    a.percent_change
                        .abs()
                        .partial_cmp(&b.percent_change.abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|change| change.description.as_str())
                .unwrap_or_default();
            parts.push(format!(
                "Style drift from the student's baseline is {:.2} across {} changed \
                 dimensions; largest: {strongest}.",
                c.value,
                analysis.style_changes.len()
            ));
        }
        None => parts.push(
            "No baseline was available, so style drift was not assessed.".to_string(),
        ),
    }

    match (&analysis.detection, has(IntegritySignal::AiProbability)) {
        (Some(d), Some(c)) => {
            let flagged = d.segments.iter().filter(|s| s.flagged).count();
            let segments = if flagged > 0 {
                format!(", {flagged} of {} segments flagged", d.segments.len())
            } else {
                String::new()
            };
            parts.push(format!(
                "Estimated AI-authorship probability is {:.2} (confidence {:.2}{segments}).",
                c.value, d.confidence
            ));
        }
        _ => parts.push("Authorship detection did not run.".to_string()),
    }

    let best = matches.iter().max_by(|a, b| {
        a.similarity
            .partial_cmp(&b.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    match (best, has(IntegritySignal::SourceMatch)) {
        (Some(best), Some(_)) if best.similarity > 0.0 => parts.push(format!(
            "Closest source is {} at {:.0}% similarity.",
            best.source_id,
            best.similarity * 100.0
        )),
        (_, Some(_)) => parts.push("No similar sources were found.".to_string()),
        (_, None) => parts.push("Source matching was unavailable.".to_string()),
    }

    if !analysis.anomalies.is_empty() {
        parts.push(format!(
            "{} measures sit outside the student's usual range.",
            analysis.anomalies.len()
        ));
    }
    parts.join(" ")
}

fn recommend(analysis: &IntegrityAnalysis, matches: &[SourceMatch]) -> Vec<Recommendation> {
    let mut out = Vec::new();
    let mut push =
        |priority: Severity, action: String| out.push(Recommendation { priority, action });

    if analysis.risk_level == Severity::High {
        push(
            Severity::High,
            "Meet with the student to review this submission before grading.".to_string(),
        );
    }
    if let Some(d) = &analysis.detection {
        if d.is_ai_generated || d.score >= 0.7 {
            push(
                Severity::High,
                "Ask the student to walk through their drafting process and notes.".to_string(),
            );
        }
    }
    for m in matches {
        if m.similarity >= 0.5 {
            push(
                Severity::High,
                format!(
                    "Compare the text against source {} and check citations.",
                    m.source_id
                ),
            );
        } else if m.similarity >= 0.2 {
            push(
                Severity::Medium,
                format!("Check attribution for passages resembling {}.", m.source_id),
            );
        }
    }
    for change in analysis.style_changes.iter().filter(|c| c.severity == Severity::High) {
        push(
            Severity::Medium,
            format!("Compare {} with the student's earlier submissions.", change.dimension.label()),
        );
    }
    for anomaly in &analysis.anomalies {
        push(Severity::Medium, format!("Review: {}.", anomaly.description));
    }
    for warning in &analysis.warnings {
        match warning {
            EngineWarning::StaleBaseline { .. } => push(
                Severity::Low,
                "Rebuild the baseline from the student's recent submissions.".to_string(),
            ),
            EngineWarning::BaselineMissing { .. } => push(
                Severity::Low,
                "Collect more writing samples to establish a baseline.".to_string(),
            ),
            _ => {}
        }
    }
    if out.is_empty() {
        out.push(Recommendation {
            priority: Severity::Low,
            action: "No action needed.".to_string(),
        });
    }
    out.sort_by(|a, b| b.priority.cmp(&a.priority));
    out
}
