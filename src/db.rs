use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Baseline, WritingSample};
use crate::store::BaselineStore;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed baseline and sample storage. Baselines are kept as JSON
/// text next to a few queryable columns.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn baseline_from_json(payload: &str) -> Result<Baseline, StoreError> {
    serde_json::from_str(payload).map_err(|e| StoreError::Serialization {
        what: "baseline".to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl BaselineStore for PgStore {
    async fn load_baseline(&self, student_id: &str) -> Result<Option<Baseline>, StoreError> {
        let row = sqlx::query(
            "SELECT payload FROM writing_integrity.baselines WHERE student_id = $1",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                baseline_from_json(&payload).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn save_baseline(
        &self,
        student_id: &str,
        baseline: &Baseline,
    ) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(baseline).map_err(|e| StoreError::Serialization {
            what: "baseline".to_string(),
            message: e.to_string(),
        })?;
        let replaced: bool = sqlx::query(
            r#"
            INSERT INTO writing_integrity.baselines
            (student_id, payload, sample_count, confidence, last_updated)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (student_id) DO UPDATE
            SET payload = EXCLUDED.payload,
                sample_count = EXCLUDED.sample_count,
                confidence = EXCLUDED.confidence,
                last_updated = EXCLUDED.last_updated
            RETURNING (xmax <> 0) AS replaced
            "#,
        )
        .bind(student_id)
        .bind(payload)
        .bind(baseline.sample_count as i64)
        .bind(baseline.confidence)
        .bind(baseline.last_updated)
        .fetch_one(&self.pool)
        .await?
        .get("replaced");
        Ok(replaced)
    }

    async fn submission_history(&self, student_id: &str) -> Result<Vec<WritingSample>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, student_id, body, submitted_at
            FROM writing_integrity.samples
            WHERE student_id = $1
            ORDER BY submitted_at
            "#,
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            samples.push(WritingSample {
                id: row.get("id"),
                student_id: row.get("student_id"),
                text: row.get("body"),
                timestamp: row.get("submitted_at"),
            });
        }
        Ok(samples)
    }

    async fn record_sample(&self, sample: &WritingSample) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO writing_integrity.samples (id, student_id, body, submitted_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(sample.id)
        .bind(&sample.student_id)
        .bind(&sample.text)
        .bind(sample.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    student_id: String,
    text: String,
    submitted_at: DateTime<Utc>,
    sample_id: Option<Uuid>,
}

/// Reads `student_id,text,submitted_at[,sample_id]` rows.
pub fn read_samples_csv(csv_path: &Path) -> anyhow::Result<Vec<WritingSample>> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut samples = Vec::new();

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result
            .with_context(|| format!("bad row {} in {}", line + 1, csv_path.display()))?;
        samples.push(WritingSample {
            id: row.sample_id.unwrap_or_else(Uuid::new_v4),
            student_id: row.student_id,
            text: row.text,
            timestamp: row.submitted_at,
        });
    }

    Ok(samples)
}

pub async fn import_csv(store: &dyn BaselineStore, csv_path: &Path) -> anyhow::Result<usize> {
    let samples = read_samples_csv(csv_path)?;
    for sample in &samples {
        store
            .record_sample(sample)
            .await
            .with_context(|| format!("failed to record sample {}", sample.id))?;
    }
    Ok(samples.len())
}
