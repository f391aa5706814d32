//! Receipt model: the evidentiary photo and its derived signals

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::enums::{FraudFlag, OcrMethod, ReceiptField, ReceiptStatus};
use super::extraction::ExtractedFields;

/// Position reported by the submitting device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate, ToSchema)]
pub struct GpsPoint {
    #[validate(range(min = -90.0, max = 90.0, message = "Latitude out of range"))]
    pub lat: f64,
    #[validate(range(min = -180.0, max = 180.0, message = "Longitude out of range"))]
    pub lng: f64,
    /// Reported accuracy radius, in meters
    #[validate(range(min = 0.0, message = "Accuracy must be positive"))]
    pub accuracy_m: Option<f64>,
}

impl GpsPoint {
    /// Great-circle distance in meters (haversine)
    pub fn distance_m(&self, other: &GpsPoint) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let d_lat = lat2 - lat1;
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

/// The three confidence signals plus per-field provider confidences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Confidences {
    pub vision: f64,
    pub parser: f64,
    pub consistency: f64,
    pub fields: BTreeMap<ReceiptField, f64>,
}

/// Receipt as held by the verification core
#[derive(Debug, Clone)]
pub struct Receipt {
    pub id: Uuid,
    pub visit_id: Uuid,
    pub user_id: Uuid,
    /// Resolved from the OIB; None until the directory matches it
    pub restaurant_id: Option<Uuid>,
    pub image_ref: String,
    /// Hex SHA-256 prefix (128 bits)
    pub image_hash: String,
    pub perceptual_hash: u64,
    pub gps: Option<GpsPoint>,
    pub device_fingerprint: Option<String>,
    pub declared_total: Option<Decimal>,
    pub status: ReceiptStatus,
    /// Effective fields: extraction with reviewer corrections applied
    pub fields: ExtractedFields,
    pub raw_ocr_payload: Option<serde_json::Value>,
    pub confidences: Option<Confidences>,
    pub fraud_flags: BTreeSet<FraudFlag>,
    pub auto_approve_score: Option<f64>,
    pub ocr_method: Option<OcrMethod>,
    pub model_version: Option<String>,
    pub predicted_data: Option<ExtractedFields>,
    pub corrected_data: Option<ExtractedFields>,
    pub points_awarded: Option<i32>,
    pub points_synced_at: Option<DateTime<Utc>>,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Signals computed by the pipeline, written back in one update
#[derive(Debug, Clone)]
pub struct ReceiptSignals {
    pub restaurant_id: Option<Uuid>,
    pub fields: ExtractedFields,
    pub raw_ocr_payload: Option<serde_json::Value>,
    pub confidences: Option<Confidences>,
    pub fraud_flags: BTreeSet<FraudFlag>,
    pub auto_approve_score: Option<f64>,
    pub ocr_method: Option<OcrMethod>,
    pub model_version: Option<String>,
}

/// The slice of a receipt the fraud detector compares against
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptFingerprint {
    pub id: Uuid,
    pub user_id: Uuid,
    pub image_hash: String,
    pub perceptual_hash: u64,
    pub device_fingerprint: Option<String>,
    pub gps: Option<GpsPoint>,
    pub status: ReceiptStatus,
    pub submitted_at: DateTime<Utc>,
}

impl From<&Receipt> for ReceiptFingerprint {
    fn from(receipt: &Receipt) -> Self {
        Self {
            id: receipt.id,
            user_id: receipt.user_id,
            image_hash: receipt.image_hash.clone(),
            perceptual_hash: receipt.perceptual_hash,
            device_fingerprint: receipt.device_fingerprint.clone(),
            gps: receipt.gps,
            status: receipt.status,
            submitted_at: receipt.submitted_at,
        }
    }
}

/// Full receipt view for administrators
#[serde_as]
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReceiptReview {
    pub id: Uuid,
    pub visit_id: Uuid,
    pub user_id: Uuid,
    pub restaurant_id: Option<Uuid>,
    pub image_ref: String,
    pub image_hash: String,
    /// 64-bit hash, serialized as a decimal string
    #[serde_as(as = "DisplayFromStr")]
    #[schema(value_type = String)]
    pub perceptual_hash: u64,
    pub gps: Option<GpsPoint>,
    pub device_fingerprint: Option<String>,
    pub declared_total: Option<Decimal>,
    pub status: ReceiptStatus,
    pub fields: ExtractedFields,
    pub missing_fields: Vec<ReceiptField>,
    pub confidences: Option<Confidences>,
    pub fraud_flags: Vec<FraudFlag>,
    pub auto_approve_score: Option<f64>,
    pub ocr_method: Option<OcrMethod>,
    pub model_version: Option<String>,
    pub points_awarded: Option<i32>,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl From<Receipt> for ReceiptReview {
    fn from(r: Receipt) -> Self {
        Self {
            missing_fields: r.fields.missing_required(),
            id: r.id,
            visit_id: r.visit_id,
            user_id: r.user_id,
            restaurant_id: r.restaurant_id,
            image_ref: r.image_ref,
            image_hash: r.image_hash,
            perceptual_hash: r.perceptual_hash,
            gps: r.gps,
            device_fingerprint: r.device_fingerprint,
            declared_total: r.declared_total,
            status: r.status,
            fields: r.fields,
            confidences: r.confidences,
            fraud_flags: r.fraud_flags.into_iter().collect(),
            auto_approve_score: r.auto_approve_score,
            ocr_method: r.ocr_method,
            model_version: r.model_version,
            points_awarded: r.points_awarded,
            submitted_at: r.submitted_at,
            reviewed_at: r.reviewed_at,
        }
    }
}
