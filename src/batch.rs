//! Bulk scoring of submissions.
//!
//! Items are split into chunks; at most `max_concurrent_batches` chunks run
//! at once, and items inside a chunk run side by side. Store calls inside an
//! item are retried with backoff at the engine boundary, and a failing item
//! never holds up its siblings. Cancelling a job drops whatever is in flight
//! but keeps results that already finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::engine::IntegrityEngine;
use crate::error::EngineResult;
use crate::models::{BaselineState, IntegrityScore, WritingSample};

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub sample: WritingSample,
    pub class_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Scored {
        score: Box<IntegrityScore>,
        baseline_state: BaselineState,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub index: usize,
    pub sample_id: Uuid,
    pub student_id: String,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total: usize,
    /// Items that ran to completion, scored or failed, in submission order.
    pub results: Vec<ItemResult>,
}

impl BatchReport {
    pub fn scored(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ItemOutcome::Scored { .. }))
            .count()
    }
}

/// Shared cancellation signal for one job.
#[derive(Debug, Default)]
pub struct CancelHandle {
    cancelled: AtomicBool,
    notify: Notify,
    reason: Mutex<Option<String>>,
}

impl CancelHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert_with(|| reason.into());
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .ok()
            .and_then(|r| r.clone())
            .unwrap_or_else(|| "cancelled".to_string())
    }
}

pub struct BatchProcessor {
    engine: Arc<IntegrityEngine>,
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(engine: Arc<IntegrityEngine>) -> Self {
        let config = engine.config().batch.clone();
        Self { engine, config }
    }

    async fn process(&self, item: &BatchItem) -> EngineResult<ItemOutcome> {
        let sample = &item.sample;
        let score = self
            .engine
            .score_integrity(&sample.text, &sample.student_id, &item.class_id)
            .await?;
        let submitted = self.engine.submit_sample(sample.clone()).await?;
        Ok(ItemOutcome::Scored {
            score: Box::new(score),
            baseline_state: submitted.state,
        })
    }

    /// `None` when the job was cancelled while the item was in flight.
    async fn run_item(
        &self,
        index: usize,
        item: &BatchItem,
        cancel: &CancelHandle,
    ) -> Option<ItemResult> {
        let notified = cancel.notify.notified();
        if cancel.is_cancelled() {
            return None;
        }
        let outcome = tokio::select! {
            done = self.process(item) => done,
            _ = notified => {
                debug!(index, "item discarded on cancellation");
                return None;
            }
        };
        let outcome = outcome.unwrap_or_else(|e| {
            warn!(
                index,
                student_id = %item.sample.student_id,
                error = %e,
                "batch item failed"
            );
            ItemOutcome::Failed {
                error: e.to_string(),
            }
        });
        Some(ItemResult {
            index,
            sample_id: item.sample.id,
            student_id: item.sample.student_id.clone(),
            outcome,
        })
    }

    pub async fn run(&self, items: Vec<BatchItem>, cancel: Arc<CancelHandle>) -> BatchReport {
        let job_id = Uuid::new_v4();
        let total = items.len();
        let semaphore = Semaphore::new(self.config.max_concurrent_batches.max(1));
        let indexed: Vec<(usize, BatchItem)> = items.into_iter().enumerate().collect();
        info!(%job_id, total, chunk_size = self.config.chunk_size, "batch job started");

        let chunks = indexed.chunks(self.config.chunk_size.max(1)).map(|chunk| {
            let semaphore = &semaphore;
            let cancel = &cancel;
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return Vec::new();
                };
                if cancel.is_cancelled() {
                    return Vec::new();
                }
                let results = join_all(
                    chunk
                        .iter()
                        .map(|(index, item)| self.run_item(*index, item, cancel)),
                )
                .await;
                debug!(%job_id, items = chunk.len(), "chunk finished");
                results.into_iter().flatten().collect::<Vec<_>>()
            }
        });
        let mut results: Vec<ItemResult> =
            join_all(chunks).await.into_iter().flatten().collect();
        results.sort_by_key(|r| r.index);

        let status = if cancel.is_cancelled() {
            let reason = cancel.reason();
            warn!(%job_id, reason = %reason, kept = results.len(), "batch job cancelled");
            JobStatus::Failed { reason }
        } else {
            JobStatus::Completed
        };
        info!(%job_id, completed = results.len(), total, "batch job finished");
        BatchReport {
            job_id,
            status,
            total,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use super::*;
    use crate::config::EngineConfig;
    use crate::error::StoreError;
    use crate::models::Baseline;
    use crate::store::{BaselineStore, MemoryStore};

    const TEXT: &str = "Our class visited the science museum on Tuesday. \
        We saw a model of the solar system and a real meteorite from Arizona. \
        My favorite part was the room about electricity, where my hair stood up.";

    fn item(student: &str, text: &str, days_ago: i64) -> BatchItem {
        BatchItem {
            sample: WritingSample::new(student, text, Utc::now() - Duration::days(days_ago)),
            class_id: "eng-101".to_string(),
        }
    }

    fn processor_with(
        store: Arc<dyn BaselineStore>,
        chunk_size: usize,
        max_concurrent_batches: usize,
    ) -> BatchProcessor {
        let mut config = EngineConfig::default();
        config.batch.chunk_size = chunk_size;
        config.batch.max_concurrent_batches = max_concurrent_batches;
        config.retry.base_delay_ms = 1;
        let engine = IntegrityEngine::new(config, store).unwrap();
        BatchProcessor::new(Arc::new(engine))
    }

    fn processor() -> BatchProcessor {
        processor_with(Arc::new(MemoryStore::new()), 2, 3)
    }

    /// Memory store whose baseline loads fail a set number of times, and
    /// never return for one chosen student.
    #[derive(Default)]
    struct ScriptedStore {
        inner: MemoryStore,
        failures: AtomicU32,
        loads: AtomicU32,
        parked: Option<&'static str>,
        entered: Notify,
    }

    impl ScriptedStore {
        fn failing(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                ..Self::default()
            }
        }

        fn parking(student_id: &'static str) -> Self {
            Self {
                parked: Some(student_id),
                ..Self::default()
            }
        }

        fn loads(&self) -> u32 {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BaselineStore for ScriptedStore {
        async fn load_baseline(&self, student_id: &str) -> Result<Option<Baseline>, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.parked == Some(student_id) {
                self.entered.notify_one();
                std::future::pending::<()>().await;
            }
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(StoreError::Unavailable {
                    message: "connection reset".to_string(),
                });
            }
            self.inner.load_baseline(student_id).await
        }

        async fn save_baseline(
            &self,
            student_id: &str,
            baseline: &Baseline,
        ) -> Result<bool, StoreError> {
            self.inner.save_baseline(student_id, baseline).await
        }

        async fn submission_history(
            &self,
            student_id: &str,
        ) -> Result<Vec<WritingSample>, StoreError> {
            self.inner.submission_history(student_id).await
        }

        async fn record_sample(&self, sample: &WritingSample) -> Result<(), StoreError> {
            self.inner.record_sample(sample).await
        }
    }

    #[tokio::test]
    async fn scores_every_item_in_order() {
        let items = vec![
            item("stu-1", TEXT, 3),
            item("stu-2", TEXT, 2),
            item("stu-1", "Too short.", 1),
            item("stu-3", TEXT, 0),
        ];
        let report = processor().run(items, CancelHandle::new()).await;

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.total, 4);
        let indexes: Vec<usize> = report.results.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert_eq!(report.scored(), 3);
        assert!(matches!(report.results[2].outcome, ItemOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn cancelled_job_fails_with_reason() {
        let cancel = CancelHandle::new();
        cancel.cancel("operator stopped the import");
        let report = processor().run(vec![item("stu-1", TEXT, 0)], cancel).await;

        assert_eq!(
            report.status,
            JobStatus::Failed {
                reason: "operator stopped the import".to_string()
            }
        );
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn cancelling_mid_job_keeps_finished_chunks() {
        let store = Arc::new(ScriptedStore::parking("stu-2"));
        let processor = processor_with(store.clone(), 1, 1);
        let cancel = CancelHandle::new();
        let items = vec![item("stu-1", TEXT, 1), item("stu-2", TEXT, 0)];
        let job = tokio::spawn({
            let cancel = Arc::clone(&cancel);
            async move { processor.run(items, cancel).await }
        });

        store.entered.notified().await;
        cancel.cancel("term ended");
        let report = job.await.unwrap();

        assert_eq!(
            report.status,
            JobStatus::Failed {
                reason: "term ended".to_string()
            }
        );
        assert_eq!(report.total, 2);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].student_id, "stu-1");
        assert!(matches!(report.results[0].outcome, ItemOutcome::Scored { .. }));
    }

    #[tokio::test]
    async fn transient_store_failure_recovers_within_the_item() {
        let store = Arc::new(ScriptedStore::failing(1));
        let report = processor_with(store.clone(), 2, 3)
            .run(vec![item("stu-1", TEXT, 0)], CancelHandle::new())
            .await;

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.scored(), 1);
        // one failed load and its retry while scoring, one load on submit
        assert_eq!(store.loads(), 3);
    }

    #[tokio::test]
    async fn store_outage_is_retried_only_at_the_boundary() {
        let store = Arc::new(ScriptedStore::failing(u32::MAX));
        let report = processor_with(store.clone(), 2, 3)
            .run(vec![item("stu-1", TEXT, 0)], CancelHandle::new())
            .await;

        match &report.results[0].outcome {
            ItemOutcome::Failed { error } => {
                assert!(error.starts_with("load baseline failed after 3 attempts"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.loads(), 3);
    }
}
