//! The exposed engine: baselines, detection, integrity scoring and trends
//! wired to the storage and source-matching collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::baseline::BaselineModel;
use crate::cache::{self, AnalysisCache, TtlCache};
use crate::config::{DriftThresholds, EngineConfig};
use crate::drift::DriftDetector;
use crate::ensemble::DetectionEnsemble;
use crate::error::{EngineError, EngineResult, EngineWarning};
use crate::integrity::{IntegrityInputs, IntegrityScorer};
use crate::models::{
    Baseline, BaselineState, BaselineUpdate, DetectionResult, IntegrityScore, StyleDimension,
    StyleMetrics, TrendPoint, TrendReport, WritingSample,
};
use crate::retry::with_backoff;
use crate::store::{BaselineStore, SourceMatcher};
use crate::trend::TrendAnalyzer;

/// History samples considered when looking for anomalies.
const ANOMALY_HISTORY: usize = 20;

/// What happened to a student's profile after a submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionOutcome {
    pub state: BaselineState,
    /// Absent while the baseline is still building.
    pub update: Option<BaselineUpdate>,
}

/// Holds one student's lock; the table entry goes away with the last holder.
struct StudentGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    student_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for StudentGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.student_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct IntegrityEngine {
    config: EngineConfig,
    baselines: BaselineModel,
    ensemble: DetectionEnsemble,
    scorer: IntegrityScorer,
    trends: TrendAnalyzer,
    store: Arc<dyn BaselineStore>,
    sources: Option<Arc<dyn SourceMatcher>>,
    cache: Option<Arc<dyn AnalysisCache>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IntegrityEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn BaselineStore>) -> EngineResult<Self> {
        config.validate()?;
        let cache: Option<Arc<dyn AnalysisCache>> = if config.cache.enabled {
            Some(Arc::new(TtlCache::new(
                Duration::from_secs(config.cache.ttl_secs),
                config.cache.sweep_threshold,
            )))
        } else {
            None
        };
        Ok(Self {
            baselines: BaselineModel::new(config.baseline.clone()),
            ensemble: DetectionEnsemble::new(config.ensemble.clone(), config.drift.clone()),
            scorer: IntegrityScorer::new(config.integrity.clone()),
            trends: TrendAnalyzer::new(config.trend.clone()),
            config,
            store,
            sources: None,
            cache,
            locks: DashMap::new(),
        })
    }

    pub fn with_source_matcher(mut self, matcher: Arc<dyn SourceMatcher>) -> Self {
        self.sources = Some(matcher);
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn AnalysisCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_ensemble(mut self, ensemble: DetectionEnsemble) -> Self {
        self.ensemble = ensemble;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BaselineStore> {
        &self.store
    }

    pub fn build_baseline(&self, samples: &[WritingSample]) -> EngineResult<Baseline> {
        self.baselines.create(samples)
    }

    pub fn update_baseline(
        &self,
        baseline: &Baseline,
        sample: &WritingSample,
    ) -> EngineResult<BaselineUpdate> {
        self.baselines
            .apply_sample(baseline, sample, &self.config.drift, Utc::now())
    }

    async fn lock_student(&self, student_id: &str) -> StudentGuard<'_> {
        let lock = self
            .locks
            .entry(student_id.to_string())
            .or_default()
            .value()
            .clone();
        StudentGuard {
            locks: &self.locks,
            student_id: student_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn load_baseline(&self, student_id: &str) -> EngineResult<Option<Baseline>> {
        with_backoff(&self.config.retry, "load baseline", || {
            self.store.load_baseline(student_id)
        })
        .await
    }

    async fn save_baseline(&self, baseline: &Baseline) -> EngineResult<bool> {
        with_backoff(&self.config.retry, "save baseline", || {
            self.store.save_baseline(&baseline.student_id, baseline)
        })
        .await
    }

    async fn history(&self, student_id: &str) -> EngineResult<Vec<WritingSample>> {
        with_backoff(&self.config.retry, "load submission history", || {
            self.store.submission_history(student_id)
        })
        .await
    }

    /// Records a sample and moves the student's profile forward. Calls for
    /// the same student are serialized.
    pub async fn submit_sample(&self, sample: WritingSample) -> EngineResult<SubmissionOutcome> {
        if sample.text.trim().is_empty() {
            return Err(EngineError::input("sample text is empty"));
        }
        let _guard = self.lock_student(&sample.student_id).await;

        with_backoff(&self.config.retry, "record sample", || {
            self.store.record_sample(&sample)
        })
        .await?;
        let now = Utc::now();

        let Some(baseline) = self.load_baseline(&sample.student_id).await? else {
            let history = self.history(&sample.student_id).await?;
            if history.len() < self.config.baseline.min_samples {
                return Ok(SubmissionOutcome {
                    state: self.baselines.state(None, history.len(), now),
                    update: None,
                });
            }
            let baseline = self.baselines.create_at(&history, now)?;
            self.save_baseline(&baseline).await?;
            return Ok(SubmissionOutcome {
                state: self.baselines.state(Some(&baseline), history.len(), now),
                update: Some(BaselineUpdate {
                    updated: true,
                    changes: Vec::new(),
                    baseline,
                    warnings: Vec::new(),
                }),
            });
        };

        let mut update = self
            .baselines
            .apply_sample(&baseline, &sample, &self.config.drift, now)?;
        if update.updated {
            self.save_baseline(&update.baseline).await?;
        } else {
            warn!(
                student_id = %sample.student_id,
                "baseline stale, rebuilding from recent history"
            );
            update.baseline = self.rebuild_locked(&sample.student_id).await?;
            update.updated = true;
        }
        Ok(SubmissionOutcome {
            state: self
                .baselines
                .state(Some(&update.baseline), update.baseline.sample_count, now),
            update: Some(update),
        })
    }

    pub async fn rebuild_baseline(&self, student_id: &str) -> EngineResult<Baseline> {
        let _guard = self.lock_student(student_id).await;
        self.rebuild_locked(student_id).await
    }

    /// Rebuilds from samples inside the baseline age window, or from the most
    /// recent `min_samples` when the window holds too few.
    async fn rebuild_locked(&self, student_id: &str) -> EngineResult<Baseline> {
        let now = Utc::now();
        let history = self.history(student_id).await?;
        let max_age = chrono::Duration::days(self.config.baseline.max_baseline_age_days);
        let min = self.config.baseline.min_samples;

        let recent: Vec<WritingSample> = history
            .iter()
            .filter(|s| now - s.timestamp <= max_age)
            .cloned()
            .collect();
        let samples = if recent.len() >= min {
            recent
        } else {
            history[history.len().saturating_sub(min)..].to_vec()
        };

        let baseline = self.baselines.create_at(&samples, now)?;
        self.save_baseline(&baseline).await?;
        info!(student_id, samples = samples.len(), "baseline rebuilt");
        Ok(baseline)
    }

    pub async fn baseline_state(&self, student_id: &str) -> EngineResult<BaselineState> {
        let baseline = self.load_baseline(student_id).await?;
        let samples = self.history(student_id).await?.len();
        Ok(self.baselines.state(baseline.as_ref(), samples, Utc::now()))
    }

    pub async fn baseline(&self, student_id: &str) -> EngineResult<Option<Baseline>> {
        self.load_baseline(student_id).await
    }

    /// Scores `text` for machine authorship. A stale baseline is still used,
    /// and the result carries a [`EngineWarning::StaleBaseline`].
    pub async fn detect(
        &self,
        text: &str,
        baseline: Option<&Baseline>,
    ) -> EngineResult<DetectionResult> {
        let drift = self.config.drift.clone();
        let mut result = self.detect_with(text, baseline, &drift).await?;
        if let Some(b) = baseline {
            result
                .warnings
                .extend(self.baselines.staleness_warning(b, Utc::now()));
        }
        Ok(result)
    }

    async fn detect_with(
        &self,
        text: &str,
        baseline: Option<&Baseline>,
        drift: &DriftThresholds,
    ) -> EngineResult<DetectionResult> {
        let key = cache::detection_key(text, baseline, drift);
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            return Ok(hit);
        }
        let result = self.ensemble.detect_with(text, baseline, drift).await?;
        let degraded = result.warnings.iter().any(|w| {
            matches!(
                w,
                EngineWarning::StrategyFailed { .. } | EngineWarning::StrategyTimedOut { .. }
            )
        });
        match &self.cache {
            Some(_) if degraded => debug!("degraded detection result not cached"),
            Some(cache) => cache.set(key, result.clone()),
            None => {}
        }
        Ok(result)
    }

    pub async fn score_integrity(
        &self,
        text: &str,
        student_id: &str,
        class_id: &str,
    ) -> EngineResult<IntegrityScore> {
        self.score_excluding(text, student_id, class_id, None).await
    }

    /// Scores a sample that is already recorded, leaving it out of the
    /// history it is compared against. The baseline may still include it.
    pub async fn rescore_sample(
        &self,
        sample: &WritingSample,
        class_id: &str,
    ) -> EngineResult<IntegrityScore> {
        self.score_excluding(&sample.text, &sample.student_id, class_id, Some(sample.id))
            .await
    }

    async fn score_excluding(
        &self,
        text: &str,
        student_id: &str,
        class_id: &str,
        exclude: Option<Uuid>,
    ) -> EngineResult<IntegrityScore> {
        self.ensemble.validate_input(text)?;
        let thresholds = self.config.drift_for_class(class_id).clone();
        let detector = DriftDetector::new(thresholds.clone());
        let now = Utc::now();
        let mut warnings = Vec::new();

        let baseline = self.load_baseline(student_id).await?;
        match &baseline {
            None => warnings.push(EngineWarning::BaselineMissing {
                student_id: student_id.to_string(),
            }),
            Some(b) => warnings.extend(self.baselines.staleness_warning(b, now)),
        }

        let metrics = self.baselines.extractor().extract(text);
        let style_changes = baseline
            .as_ref()
            .map(|b| detector.compare(&metrics, &b.aggregate_metrics))
            .unwrap_or_default();
        let drift_score = baseline.as_ref().map(|_| detector.score(&style_changes));

        let history: Vec<WritingSample> = self
            .history(student_id)
            .await?
            .into_iter()
            .filter(|s| Some(s.id) != exclude)
            .collect();
        let recent: Vec<StyleMetrics> = history
            .iter()
            .rev()
            .take(ANOMALY_HISTORY)
            .map(|s| self.baselines.extractor().extract(&s.text))
            .collect();
        let mut anomalies = detector.anomalies(&metrics, &recent);
        if let Some(b) = &baseline {
            let since = history.first().map_or(b.created_at, |s| s.timestamp);
            let elapsed_days = (now - since).num_seconds().max(0) as f64 / 86_400.0;
            anomalies.extend(detector.realism(&metrics, &b.aggregate_metrics, elapsed_days));
        }

        let detection = match self.detect_with(text, baseline.as_ref(), &thresholds).await {
            Ok(result) => Some(result),
            Err(EngineError::EnsembleExhausted { failures }) => {
                warn!(student_id, "no detection strategy produced a score");
                warnings.push(EngineWarning::StrategyFailed {
                    strategy: "ensemble".to_string(),
                    reason: failures.join("; "),
                });
                None
            }
            Err(e) => return Err(e),
        };

        let source_matches = match &self.sources {
            Some(matcher) => {
                let found = with_backoff(&self.config.retry, "find similar sources", || {
                    matcher.find_similar_sources(text)
                })
                .await;
                match found {
                    Ok(matches) => Some(matches),
                    Err(e) => {
                        warn!(student_id, error = %e, "source matching unavailable");
                        warnings.push(EngineWarning::SourceMatcherUnavailable {
                            reason: e.to_string(),
                        });
                        None
                    }
                }
            }
            None => {
                warnings.push(EngineWarning::SourceMatcherUnavailable {
                    reason: "no source matcher configured".to_string(),
                });
                None
            }
        };

        let score = self.scorer.score(IntegrityInputs {
            drift: drift_score,
            style_changes,
            anomalies,
            detection,
            source_matches,
            warnings,
        });
        info!(
            student_id,
            class_id,
            score = score.score,
            risk = %score.analysis.risk_level,
            "integrity scored"
        );
        Ok(score)
    }

    pub fn analyze_trend(&self, series: &[TrendPoint]) -> TrendReport {
        self.trends.analyze(series)
    }

    /// One point per recorded sample: the sample's value on `dimension`.
    pub async fn metric_series(
        &self,
        student_id: &str,
        dimension: StyleDimension,
    ) -> EngineResult<Vec<TrendPoint>> {
        let extractor = self.baselines.extractor();
        Ok(self
            .history(student_id)
            .await?
            .iter()
            .map(|s| TrendPoint {
                timestamp: s.timestamp,
                value: dimension.value(&extractor.extract(&s.text)),
            })
            .collect())
    }

    pub fn evict_expired(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.evict_expired())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::Duration as Days;
    use futures::future::join_all;

    use super::*;
    use crate::ensemble::{Strategy, StrategyContext, StrategyOutput};
    use crate::error::StrategyError;
    use crate::features::FeatureExtractor;
    use crate::store::MemoryStore;

    const ESSAY: &str = "The summer I turned twelve, we drove to my grandmother's farm in Ohio. \
        She kept chickens, two goats, and a garden that seemed to go on forever. \
        Every morning I collected eggs while the rooster complained about it. \
        In the afternoons we canned tomatoes and listened to baseball on the radio. \
        I didn't understand then how much work it all was. \
        Now I think about those weeks whenever I smell fresh basil.";

    fn engine() -> IntegrityEngine {
        let mut config = EngineConfig::default();
        config.retry.base_delay_ms = 1;
        IntegrityEngine::new(config, Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn stale_baseline_is_flagged_on_fresh_and_cached_results() {
        let engine = engine();
        let old = Utc::now() - Days::days(200);
        let stale = Baseline {
            student_id: "stu-1".to_string(),
            aggregate_metrics: FeatureExtractor::default().extract(ESSAY),
            sample_count: 3,
            confidence: 0.95,
            created_at: old,
            last_updated: old,
        };

        for _ in 0..2 {
            let result = engine.detect(ESSAY, Some(&stale)).await.unwrap();
            assert!(matches!(
                result.warnings.as_slice(),
                [EngineWarning::StaleBaseline { max_age_days: 90, .. }]
            ));
        }
    }

    static SLOW: AtomicBool = AtomicBool::new(true);

    fn sometimes_slow(_: &StrategyContext) -> Result<StrategyOutput, StrategyError> {
        if SLOW.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(600));
        }
        Ok(StrategyOutput {
            score: 0.5,
            signals: vec![],
        })
    }

    #[tokio::test]
    async fn degraded_results_are_not_cached() {
        let mut config = EngineConfig::default();
        config.ensemble.strategy_timeout_ms = 150;
        let mut ensemble = DetectionEnsemble::new(config.ensemble.clone(), config.drift.clone());
        ensemble.register(Strategy {
            name: "sometimes_slow",
            weight: 1.0,
            requires_baseline: false,
            analyze: sometimes_slow,
        });
        let results: Arc<dyn AnalysisCache> =
            Arc::new(TtlCache::new(Duration::from_secs(60), 64));
        let engine = IntegrityEngine::new(config, Arc::new(MemoryStore::new()))
            .unwrap()
            .with_ensemble(ensemble)
            .with_cache(Some(Arc::clone(&results)));
        let key = cache::detection_key(ESSAY, None, &engine.config().drift);

        let first = engine.detect(ESSAY, None).await.unwrap();
        assert!(first.warnings.iter().any(|w| matches!(
            w,
            EngineWarning::StrategyTimedOut { strategy, .. } if strategy == "sometimes_slow"
        )));
        assert!(results.get(&key).is_none());

        SLOW.store(false, Ordering::SeqCst);
        let second = engine.detect(ESSAY, None).await.unwrap();
        assert!(second.warnings.is_empty());
        assert!(second
            .strategy_scores
            .iter()
            .any(|s| s.strategy == "sometimes_slow"));
        assert!(results.get(&key).is_some());
    }

    #[tokio::test]
    async fn student_locks_are_released_after_use() {
        let engine = Arc::new(engine());
        let submissions = (0..6).map(|i| {
            let engine = Arc::clone(&engine);
            async move {
                let student = format!("stu-{}", i % 3);
                let sample = WritingSample::new(student, ESSAY, Utc::now() - Days::days(i));
                engine.submit_sample(sample).await
            }
        });
        for outcome in join_all(submissions).await {
            outcome.unwrap();
        }
        engine.rebuild_baseline("stu-0").await.unwrap_err();
        assert!(engine.locks.is_empty());
    }
}
