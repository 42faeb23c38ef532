//! Boundaries to the storage and source-matching collaborators.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::models::{Baseline, SourceMatch, WritingSample};

#[async_trait]
pub trait BaselineStore: Send + Sync {
    async fn load_baseline(&self, student_id: &str) -> Result<Option<Baseline>, StoreError>;

    /// Returns whether a stored baseline was replaced.
    async fn save_baseline(
        &self,
        student_id: &str,
        baseline: &Baseline,
    ) -> Result<bool, StoreError>;

    /// Every recorded sample for the student, oldest first.
    async fn submission_history(&self, student_id: &str) -> Result<Vec<WritingSample>, StoreError>;

    async fn record_sample(&self, sample: &WritingSample) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SourceMatcher: Send + Sync {
    async fn find_similar_sources(&self, text: &str) -> Result<Vec<SourceMatch>, StoreError>;
}

/// In-process store for tests and embedding callers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    baselines: DashMap<String, Baseline>,
    samples: DashMap<String, Vec<WritingSample>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn student_count(&self) -> usize {
        self.samples.len()
    }
}

#[async_trait]
impl BaselineStore for MemoryStore {
    async fn load_baseline(&self, student_id: &str) -> Result<Option<Baseline>, StoreError> {
        Ok(self.baselines.get(student_id).map(|b| b.value().clone()))
    }

    async fn save_baseline(
        &self,
        student_id: &str,
        baseline: &Baseline,
    ) -> Result<bool, StoreError> {
        Ok(self
            .baselines
            .insert(student_id.to_string(), baseline.clone())
            .is_some())
    }

    async fn submission_history(&self, student_id: &str) -> Result<Vec<WritingSample>, StoreError> {
        let mut history = self
            .samples
            .get(student_id)
            .map(|s| s.value().clone())
            .unwrap_or_default();
        history.sort_by_key(|s| s.timestamp);
        Ok(history)
    }

    async fn record_sample(&self, sample: &WritingSample) -> Result<(), StoreError> {
        let mut entry = self.samples.entry(sample.student_id.clone()).or_default();
        if !entry.iter().any(|s| s.id == sample.id) {
            entry.push(sample.clone());
        }
        Ok(())
    }
}
