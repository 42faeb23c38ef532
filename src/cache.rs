use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::config::DriftThresholds;
use crate::models::{Baseline, DetectionResult};

/// Key for a detection result: content hash plus the identity of the
/// baseline and thresholds it was scored against.
pub fn detection_key(
    text: &str,
    baseline: Option<&Baseline>,
    drift: &DriftThresholds,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(text.as_bytes());
    hasher.update(&drift.normal_threshold.to_le_bytes());
    hasher.update(&drift.suspicious_threshold.to_le_bytes());
    for dimension in &drift.dimensions {
        hasher.update(dimension.as_str().as_bytes());
    }
    if let Some(b) = baseline {
        hasher.update(b.student_id.as_bytes());
        hasher.update(&b.last_updated.timestamp_millis().to_le_bytes());
        hasher.update(&(b.sample_count as u64).to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

pub trait AnalysisCache: Send + Sync {
    fn get(&self, key: &str) -> Option<DetectionResult>;
    fn set(&self, key: String, value: DetectionResult);
    /// Drops expired entries and returns how many were removed.
    fn evict_expired(&self) -> usize;
}

#[derive(Debug)]
struct Entry {
    value: DetectionResult,
    inserted: Instant,
}

/// Expired entries are dropped on read, and swept in bulk whenever a write
/// finds `sweep_threshold` or more entries held.
#[derive(Debug)]
pub struct TtlCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
    sweep_threshold: usize,
}

impl TtlCache {
    pub fn new(ttl: Duration, sweep_threshold: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            sweep_threshold: sweep_threshold.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AnalysisCache for TtlCache {
    fn get(&self, key: &str) -> Option<DetectionResult> {
        let entry = self.entries.get(key)?;
        if entry.inserted.elapsed() >= self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: String, value: DetectionResult) {
        self.entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
        if self.entries.len() >= self.sweep_threshold {
            let evicted = self.evict_expired();
            if evicted > 0 {
                debug!(evicted, "swept expired detection results");
            }
        }
    }

    fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.inserted.elapsed() < self.ttl);
        before.saturating_sub(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn result(score: f64) -> DetectionResult {
        DetectionResult {
            score,
            confidence: 0.0,
            signals: vec![],
            strategy_scores: vec![],
            segments: vec![],
            is_ai_generated: false,
            warnings: vec![],
        }
    }

    #[test]
    fn keys_depend_on_baseline_identity() {
        let baseline = Baseline {
            student_id: "stu-1".to_string(),
            aggregate_metrics: Default::default(),
            sample_count: 3,
            confidence: 0.95,
            created_at: Utc::now(),
            last_updated: Utc::now(),
        };
        let drift = DriftThresholds::default();
        let plain = detection_key("essay", None, &drift);
        assert_eq!(plain, detection_key("essay", None, &drift));
        assert_ne!(plain, detection_key("essay", Some(&baseline), &drift));

        let mut updated = baseline.clone();
        updated.sample_count = 4;
        assert_ne!(
            detection_key("essay", Some(&baseline), &drift),
            detection_key("essay", Some(&updated), &drift)
        );

        let strict = DriftThresholds {
            suspicious_threshold: 30.0,
            ..DriftThresholds::default()
        };
        assert_ne!(plain, detection_key("essay", None, &strict));
    }

    #[test]
    fn entries_round_trip_until_expiry() {
        let cache = TtlCache::new(Duration::from_secs(60), 64);
        cache.set("k".to_string(), result(0.4));
        assert_eq!(cache.get("k").map(|r| r.score), Some(0.4));
        assert_eq!(cache.evict_expired(), 0);

        let expired = TtlCache::new(Duration::ZERO, 64);
        expired.set("k".to_string(), result(0.4));
        assert_eq!(expired.get("k"), None);
        expired.set("a".to_string(), result(0.1));
        expired.set("b".to_string(), result(0.2));
        assert_eq!(expired.evict_expired(), 2);
        assert!(expired.is_empty());
    }

    #[test]
    fn writes_sweep_once_the_threshold_is_reached() {
        let cache = TtlCache::new(Duration::ZERO, 3);
        cache.set("a".to_string(), result(0.1));
        cache.set("b".to_string(), result(0.2));
        assert_eq!(cache.len(), 2);
        cache.set("c".to_string(), result(0.3));
        assert!(cache.is_empty());

        let fresh = TtlCache::new(Duration::from_secs(60), 2);
        fresh.set("a".to_string(), result(0.1));
        fresh.set("b".to_string(), result(0.2));
        fresh.set("c".to_string(), result(0.3));
        assert_eq!(fresh.len(), 3);
    }
}
