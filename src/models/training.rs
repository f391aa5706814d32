//! Training samples: predicted vs corrected fields for offline model work

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::extraction::ExtractedFields;

/// One reviewer correction (or confirmation) of an extraction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingSample {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub predicted: ExtractedFields,
    pub corrected: ExtractedFields,
    pub model_version: Option<String>,
    pub recorded_by: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

impl TrainingSample {
    /// True when the reviewer changed at least one field
    pub fn is_correction(&self) -> bool {
        self.predicted != self.corrected
    }
}
