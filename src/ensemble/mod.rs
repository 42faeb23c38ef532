//! Weighted multi-strategy authorship scoring.
//!
//! Strategies run concurrently on the blocking pool and are joined under a
//! single deadline. A strategy that errors, panics or misses the deadline is
//! left out of the weighted mean and reported as a warning; `detect` only
//! fails when nothing produced a score.

pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{DriftThresholds, EnsembleConfig};
use crate::error::{EngineError, EngineResult, EngineWarning, StrategyError};
use crate::features::{self, FeatureExtractor};
use crate::models::{Baseline, DetectionResult, DetectionSignal, SegmentScore, StrategyScore};

pub use strategies::{Strategy, StrategyContext, StrategyOutput};

/// `Σ(score·weight) / Σ(weight)` over `(score, weight)` pairs. Falls back to
/// the plain mean when every weight is zero.
pub fn aggregate(scores: &[(f64, f64)]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let total: f64 = scores.iter().map(|(_, w)| w).sum();
    let value = if total > 0.0 {
        scores.iter().map(|(s, w)| s * w).sum::<f64>() / total
    } else {
        scores.iter().map(|(s, _)| s).sum::<f64>() / scores.len() as f64
    };
    Some(value.clamp(0.0, 1.0))
}

/// `min(mean severity of strong signals · 1.2, 1)`; strong means above 0.5.
pub fn confidence(signals: &[DetectionSignal]) -> f64 {
    let strong: Vec<f64> = signals
        .iter()
        .map(|s| s.severity)
        .filter(|&s| s > 0.5)
        .collect();
    if strong.is_empty() {
        return 0.0;
    }
    let mean = strong.iter().sum::<f64>() / strong.len() as f64;
    (mean * 1.2).min(1.0)
}

/// Groups whole sentences into at most `max_segments` spans of at least
/// `min_length` characters each. Texts too short for two segments get none.
pub fn segment_spans(text: &str, min_length: usize, max_segments: usize) -> Vec<(usize, usize)> {
    let total = text.trim().chars().count();
    if max_segments < 2 || total < min_length.saturating_mul(2) {
        return Vec::new();
    }
    let target = min_length.max(total.div_ceil(max_segments));
    let spans = features::sentence_spans(text);
    let Some(&(_, last_end)) = spans.last() else {
        return Vec::new();
    };

    let mut segments: Vec<(usize, usize)> = Vec::new();
    let mut open: Option<usize> = None;
    for &(start, end) in &spans {
        let begin = *open.get_or_insert(start);
        if segments.len() + 1 == max_segments {
            continue;
        }
        if text[begin..end].chars().count() >= target {
            segments.push((begin, end));
            open = None;
        }
    }
    if let Some(begin) = open {
        let tail = text[begin..last_end].chars().count();
        match segments.last_mut() {
            Some(previous) if tail < min_length => previous.1 = last_end,
            _ => segments.push((begin, last_end)),
        }
    }
    segments
}

fn score_sync(strategies: &[Strategy], ctx: &StrategyContext) -> Option<f64> {
    let scores: Vec<(f64, f64)> = strategies
        .iter()
        .filter_map(|s| (s.analyze)(ctx).ok().map(|out| (out.score, s.weight)))
        .collect();
    aggregate(&scores)
}

#[derive(Debug, Clone)]
pub struct DetectionEnsemble {
    strategies: Vec<Strategy>,
    config: EnsembleConfig,
    drift: DriftThresholds,
    extractor: FeatureExtractor,
}

impl DetectionEnsemble {
    pub fn new(config: EnsembleConfig, drift: DriftThresholds) -> Self {
        let strategies = strategies::registry(&config.weights);
        Self::with_strategies(strategies, config, drift)
    }

    pub fn with_strategies(
        strategies: Vec<Strategy>,
        config: EnsembleConfig,
        drift: DriftThresholds,
    ) -> Self {
        Self {
            strategies,
            config,
            drift,
            extractor: FeatureExtractor::default(),
        }
    }

    /// Adds a strategy, replacing any registered under the same name.
    pub fn register(&mut self, strategy: Strategy) {
        match self.strategies.iter_mut().find(|s| s.name == strategy.name) {
            Some(existing) => *existing = strategy,
            None => self.strategies.push(strategy),
        }
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn validate_input(&self, text: &str) -> EngineResult<()> {
        let length = text.trim().chars().count();
        if length < self.config.min_length {
            return Err(EngineError::input(format!(
                "text has {length} characters, at least {} required",
                self.config.min_length
            )));
        }
        if length > self.config.max_length {
            return Err(EngineError::input(format!(
                "text has {length} characters, at most {} accepted",
                self.config.max_length
            )));
        }
        Ok(())
    }

    pub async fn detect(
        &self,
        text: &str,
        baseline: Option<&Baseline>,
    ) -> EngineResult<DetectionResult> {
        self.detect_with(text, baseline, &self.drift).await
    }

    /// Like [`detect`](Self::detect) with explicit drift thresholds for the
    /// baseline strategy.
    pub async fn detect_with(
        &self,
        text: &str,
        baseline: Option<&Baseline>,
        drift: &DriftThresholds,
    ) -> EngineResult<DetectionResult> {
        self.validate_input(text)?;

        let active: Vec<Strategy> = self
            .strategies
            .iter()
            .filter(|s| baseline.is_some() || !s.requires_baseline)
            .copied()
            .collect();
        let ctx = Arc::new(StrategyContext {
            text: text.to_string(),
            metrics: self.extractor.extract(text),
            baseline: baseline.cloned(),
            drift: drift.clone(),
        });

        let handles: Vec<(Strategy, JoinHandle<Result<StrategyOutput, StrategyError>>)> = active
            .iter()
            .map(|&strategy| {
                let ctx = Arc::clone(&ctx);
                (strategy, tokio::task::spawn_blocking(move || (strategy.analyze)(&ctx)))
            })
            .collect();
        let segment_task = {
            let ctx = Arc::clone(&ctx);
            let strategies = active.clone();
            let extractor = self.extractor.clone();
            let (min_length, max_segments) = (self.config.min_length, self.config.max_segments);
            tokio::task::spawn_blocking(move || {
                segment_spans(&ctx.text, min_length, max_segments)
                    .into_iter()
                    .filter_map(|(start, end)| {
                        let slice = &ctx.text[start..end];
                        let segment = StrategyContext {
                            text: slice.to_string(),
                            metrics: extractor.extract(slice),
                            baseline: ctx.baseline.clone(),
                            drift: ctx.drift.clone(),
                        };
                        score_sync(&strategies, &segment).map(|score| (start, end, score))
                    })
                    .collect::<Vec<_>>()
            })
        };

        let timeout_ms = self.config.strategy_timeout_ms;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut scores = Vec::new();
        let mut signals = Vec::new();
        let mut warnings = Vec::new();
        let mut failures = Vec::new();
        for (strategy, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(output))) => {
                    debug!(strategy = strategy.name, score = output.score, "strategy finished");
                    scores.push(StrategyScore {
                        strategy: strategy.name.to_string(),
                        score: output.score.clamp(0.0, 1.0),
                        weight: strategy.weight,
                    });
                    signals.extend(output.signals);
                }
                Ok(Ok(Err(e))) => {
                    warn!(strategy = strategy.name, error = %e.reason, "strategy failed");
                    failures.push(e.to_string());
                    warnings.push(EngineWarning::StrategyFailed {
                        strategy: strategy.name.to_string(),
                        reason: e.reason,
                    });
                }
                Ok(Err(join_error)) => {
                    warn!(strategy = strategy.name, error = %join_error, "strategy panicked");
                    failures.push(format!("{}: {join_error}", strategy.name));
                    warnings.push(EngineWarning::StrategyFailed {
                        strategy: strategy.name.to_string(),
                        reason: join_error.to_string(),
                    });
                }
                Err(_) => {
                    warn!(strategy = strategy.name, timeout_ms, "strategy timed out");
                    failures.push(format!("{}: timed out", strategy.name));
                    warnings.push(EngineWarning::StrategyTimedOut {
                        strategy: strategy.name.to_string(),
                        timeout_ms,
                    });
                }
            }
        }

        let pairs: Vec<(f64, f64)> = scores.iter().map(|s| (s.score, s.weight)).collect();
        let Some(score) = aggregate(&pairs) else {
            return Err(EngineError::EnsembleExhausted { failures });
        };

        let threshold = self.config.classification_threshold;
        let segmented = tokio::time::timeout_at(deadline, segment_task).await;
        let segments: Vec<SegmentScore> = match segmented {
            Ok(Ok(scored)) => scored
                .into_iter()
                .enumerate()
                .map(|(index, (start, end, score))| SegmentScore {
                    index,
                    start,
                    end,
                    score,
                    flagged: score > threshold,
                })
                .collect(),
            _ => {
                debug!("segment scoring unavailable");
                Vec::new()
            }
        };
        let classified = if segments.is_empty() {
            score
        } else {
            segments.iter().map(|s| s.score).sum::<f64>() / segments.len() as f64
        };

        Ok(DetectionResult {
            score,
            confidence: confidence(&signals),
            signals,
            strategy_scores: scores,
            segments,
            is_ai_generated: classified > threshold,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::config::StrategyWeights;

    const ESSAY: &str = "The summer I turned twelve, we drove to my grandmother's farm in Ohio. \
        She kept chickens, two goats, and a garden that seemed to go on forever. \
        Every morning I collected eggs while the rooster complained about it. \
        In the afternoons we canned tomatoes and listened to baseball on the radio. \
        I didn't understand then how much work it all was. \
        Now I think about those weeks whenever I smell fresh basil.";

    fn fixed(name: &'static str, weight: f64, analyze: strategies::AnalyzeFn) -> Strategy {
        Strategy {
            name,
            weight,
            requires_baseline: false,
            analyze,
        }
    }

    fn fails(_: &StrategyContext) -> Result<StrategyOutput, StrategyError> {
        Err(StrategyError::new("broken", "always fails"))
    }

    fn ensemble(strategies: Vec<Strategy>) -> DetectionEnsemble {
        DetectionEnsemble::with_strategies(
            strategies,
            EnsembleConfig::default(),
            DriftThresholds::default(),
        )
    }

    #[test]
    fn aggregate_matches_weighted_mean() {
        let scores = [(0.2, 1.0), (0.9, 1.5), (0.1, 0.8), (0.7, 1.3)];
        let value = aggregate(&scores).unwrap();
        assert!((value - 2.54 / 4.6).abs() < 1e-12);
        assert!((value - 0.552).abs() < 1e-3);
        assert_eq!(aggregate(&[]), None);
    }

    #[test]
    fn confidence_uses_strong_signals_only() {
        let signals = vec![
            DetectionSignal::new("a", 0.9, vec![]),
            DetectionSignal::new("b", 0.7, vec![]),
            DetectionSignal::new("c", 0.2, vec![]),
        ];
        assert!((confidence(&signals) - 0.96).abs() < 1e-12);
        assert_eq!(confidence(&signals[2..]), 0.0);
    }

    #[test]
    fn segments_respect_bounds() {
        let spans = segment_spans(ESSAY, 100, 5);
        assert!(spans.len() >= 2 && spans.len() <= 5);
        for &(start, end) in &spans {
            assert!(ESSAY[start..end].chars().count() >= 100);
        }
        assert!(spans.windows(2).all(|w| w[0].1 <= w[1].0));
        assert!(segment_spans("Too short. Really.", 100, 5).is_empty());
    }

    #[tokio::test]
    async fn short_text_is_rejected_before_any_strategy_runs() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn counting(_: &StrategyContext) -> Result<StrategyOutput, StrategyError> {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(StrategyOutput {
                score: 0.5,
                signals: vec![],
            })
        }
        let e = ensemble(vec![fixed("counting", 1.0, counting)]);
        let err = e.detect("8 chars!", None).await.unwrap_err();
        assert!(matches!(err, EngineError::Input { .. }));
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_strategy_is_isolated() {
        let e = ensemble(vec![
            fixed("steady", 1.0, |_| {
                Ok(StrategyOutput {
                    score: 0.4,
                    signals: vec![],
                })
            }),
            fixed("broken", 5.0, fails),
        ]);
        let result = e.detect(ESSAY, None).await.unwrap();
        assert!((result.score - 0.4).abs() < 1e-12);
        assert_eq!(result.strategy_scores.len(), 1);
        assert!(matches!(
            result.warnings.as_slice(),
            [EngineWarning::StrategyFailed { strategy, .. }] if strategy == "broken"
        ));
    }

    #[tokio::test]
    async fn all_strategies_failing_exhausts_the_ensemble() {
        let e = ensemble(vec![fixed("a", 1.0, fails), fixed("b", 1.0, fails)]);
        let err = e.detect(ESSAY, None).await.unwrap_err();
        match err {
            EngineError::EnsembleExhausted { failures } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn slow_strategy_times_out() {
        fn slow(_: &StrategyContext) -> Result<StrategyOutput, StrategyError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(StrategyOutput {
                score: 1.0,
                signals: vec![],
            })
        }
        let mut e = ensemble(vec![
            fixed("quick", 1.0, |_| {
                Ok(StrategyOutput {
                    score: 0.3,
                    signals: vec![],
                })
            }),
            fixed("slow", 1.0, slow),
        ]);
        e.config.strategy_timeout_ms = 50;
        let result = e.detect(ESSAY, None).await.unwrap();
        assert!((result.score - 0.3).abs() < 1e-12);
        assert!(result.warnings.iter().any(|w| matches!(
            w,
            EngineWarning::StrategyTimedOut { strategy, .. } if strategy == "slow"
        )));
    }

    #[tokio::test]
    async fn baseline_strategy_only_runs_with_a_baseline() {
        let e = DetectionEnsemble::new(EnsembleConfig::default(), DriftThresholds::default());
        let without = e.detect(ESSAY, None).await.unwrap();
        assert!(without
            .strategy_scores
            .iter()
            .all(|s| s.strategy != strategies::BASELINE));

        let baseline = Baseline {
            student_id: "stu-1".to_string(),
            aggregate_metrics: FeatureExtractor::default().extract(ESSAY),
            sample_count: 3,
            confidence: 0.95,
            created_at: Utc::now(),
            last_updated: Utc::now(),
        };
        let with = e.detect(ESSAY, Some(&baseline)).await.unwrap();
        let drift = with
            .strategy_scores
            .iter()
            .find(|s| s.strategy == strategies::BASELINE)
            .unwrap();
        assert_eq!(drift.score, 0.0);
        assert_eq!(drift.weight, StrategyWeights::default().baseline);
    }

    #[tokio::test]
    async fn built_in_strategies_produce_bounded_scores() {
        let e = DetectionEnsemble::new(EnsembleConfig::default(), DriftThresholds::default());
        let result = e.detect(ESSAY, None).await.unwrap();
        assert!((0.0..=1.0).contains(&result.score));
        assert!((0.0..=1.0).contains(&result.confidence));
        assert_eq!(result.strategy_scores.len(), 4);
        assert!(!result.segments.is_empty());
        assert!(!result.is_ai_generated);
    }
}
