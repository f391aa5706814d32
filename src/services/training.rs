//! Records predicted vs corrected fields for offline model work

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{ExtractedFields, TrainingSample},
    repository::VerificationStore,
};

#[derive(Clone)]
pub struct TrainingRecorder {
    store: Arc<dyn VerificationStore>,
}

impl TrainingRecorder {
    pub fn new(store: Arc<dyn VerificationStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        receipt_id: Uuid,
        predicted: &ExtractedFields,
        corrected: &ExtractedFields,
        model_version: Option<&str>,
        recorded_by: Option<Uuid>,
        recorded_at: DateTime<Utc>,
    ) -> AppResult<TrainingSample> {
        let sample = TrainingSample {
            id: Uuid::new_v4(),
            receipt_id,
            predicted: predicted.clone(),
            corrected: corrected.clone(),
            model_version: model_version.map(str::to_string),
            recorded_by,
            recorded_at,
        };
        self.store.insert_training_sample(&sample).await?;

        tracing::debug!(
            %receipt_id,
            corrected = sample.is_correction(),
            model_version = ?sample.model_version,
            "Recorded training sample"
        );
        Ok(sample)
    }
}
