//! Training samples repository (write-only)

use sqlx::{types::Json, Pool, Postgres};

use crate::{error::AppResult, models::TrainingSample};

#[derive(Clone)]
pub struct TrainingRepository {
    pool: Pool<Postgres>,
}

impl TrainingRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, sample: &TrainingSample) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO training_samples (
                id, receipt_id, predicted, corrected, model_version, recorded_by, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(sample.id)
        .bind(sample.receipt_id)
        .bind(Json(&sample.predicted))
        .bind(Json(&sample.corrected))
        .bind(&sample.model_version)
        .bind(sample.recorded_by)
        .bind(sample.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
