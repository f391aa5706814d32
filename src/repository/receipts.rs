//! Receipts repository for database operations

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{types::Json, FromRow, Pool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{
        Confidences, ExtractedFields, FraudFlag, GpsPoint, OcrMethod, Receipt,
        ReceiptFingerprint, ReceiptSignals, ReceiptStatus,
    },
};

const RECEIPT_COLUMNS: &str = r#"
    id, visit_id, user_id, restaurant_id, image_ref, image_hash, perceptual_hash,
    gps_lat, gps_lng, gps_accuracy_m, device_fingerprint, declared_total, status,
    extracted, raw_ocr_payload, confidences, fraud_flags, auto_approve_score,
    ocr_method, model_version, predicted_data, corrected_data, points_awarded,
    points_synced_at, submitted_at, reviewed_at
"#;

/// Receipt as stored; JSONB and TEXT[] columns are converted on read
#[derive(Debug, FromRow)]
struct ReceiptRow {
    id: Uuid,
    visit_id: Uuid,
    user_id: Uuid,
    restaurant_id: Option<Uuid>,
    image_ref: String,
    image_hash: String,
    perceptual_hash: i64,
    gps_lat: Option<f64>,
    gps_lng: Option<f64>,
    gps_accuracy_m: Option<f64>,
    device_fingerprint: Option<String>,
    declared_total: Option<Decimal>,
    status: ReceiptStatus,
    extracted: Json<ExtractedFields>,
    raw_ocr_payload: Option<serde_json::Value>,
    confidences: Option<Json<Confidences>>,
    fraud_flags: Vec<String>,
    auto_approve_score: Option<f64>,
    ocr_method: Option<OcrMethod>,
    model_version: Option<String>,
    predicted_data: Option<Json<ExtractedFields>>,
    corrected_data: Option<Json<ExtractedFields>>,
    points_awarded: Option<i32>,
    points_synced_at: Option<DateTime<Utc>>,
    submitted_at: DateTime<Utc>,
    reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct FingerprintRow {
    id: Uuid,
    user_id: Uuid,
    image_hash: String,
    perceptual_hash: i64,
    device_fingerprint: Option<String>,
    gps_lat: Option<f64>,
    gps_lng: Option<f64>,
    gps_accuracy_m: Option<f64>,
    status: ReceiptStatus,
    submitted_at: DateTime<Utc>,
}

fn gps_from(lat: Option<f64>, lng: Option<f64>, accuracy_m: Option<f64>) -> Option<GpsPoint> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => Some(GpsPoint { lat, lng, accuracy_m }),
        _ => None,
    }
}

fn flags_to_text(flags: impl IntoIterator<Item = FraudFlag>) -> Vec<String> {
    flags.into_iter().map(|f| f.as_str().to_string()).collect()
}

impl TryFrom<ReceiptRow> for Receipt {
    type Error = AppError;

    fn try_from(row: ReceiptRow) -> Result<Self, Self::Error> {
        let fraud_flags = row
            .fraud_flags
            .iter()
            .map(|f| f.parse::<FraudFlag>())
            .collect::<Result<_, _>>()
            .map_err(AppError::Internal)?;

        Ok(Receipt {
            id: row.id,
            visit_id: row.visit_id,
            user_id: row.user_id,
            restaurant_id: row.restaurant_id,
            image_ref: row.image_ref,
            image_hash: row.image_hash,
            perceptual_hash: row.perceptual_hash as u64,
            gps: gps_from(row.gps_lat, row.gps_lng, row.gps_accuracy_m),
            device_fingerprint: row.device_fingerprint,
            declared_total: row.declared_total,
            status: row.status,
            fields: row.extracted.0,
            raw_ocr_payload: row.raw_ocr_payload,
            confidences: row.confidences.map(|c| c.0),
            fraud_flags,
            auto_approve_score: row.auto_approve_score,
            ocr_method: row.ocr_method,
            model_version: row.model_version,
            predicted_data: row.predicted_data.map(|d| d.0),
            corrected_data: row.corrected_data.map(|d| d.0),
            points_awarded: row.points_awarded,
            points_synced_at: row.points_synced_at,
            submitted_at: row.submitted_at,
            reviewed_at: row.reviewed_at,
        })
    }
}

impl From<FingerprintRow> for ReceiptFingerprint {
    fn from(row: FingerprintRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            image_hash: row.image_hash,
            perceptual_hash: row.perceptual_hash as u64,
            device_fingerprint: row.device_fingerprint,
            gps: gps_from(row.gps_lat, row.gps_lng, row.gps_accuracy_m),
            status: row.status,
            submitted_at: row.submitted_at,
        }
    }
}

#[derive(Clone)]
pub struct ReceiptsRepository {
    pool: Pool<Postgres>,
}

impl ReceiptsRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Insert a freshly uploaded receipt inside the caller's transaction
    pub(crate) async fn insert_in(
        tx: &mut Transaction<'_, Postgres>,
        receipt: &Receipt,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO receipts (
                id, visit_id, user_id, restaurant_id, image_ref, image_hash, perceptual_hash,
                gps_lat, gps_lng, gps_accuracy_m, device_fingerprint, declared_total,
                status, extracted, fraud_flags, submitted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(receipt.id)
        .bind(receipt.visit_id)
        .bind(receipt.user_id)
        .bind(receipt.restaurant_id)
        .bind(&receipt.image_ref)
        .bind(&receipt.image_hash)
        .bind(receipt.perceptual_hash as i64)
        .bind(receipt.gps.map(|g| g.lat))
        .bind(receipt.gps.map(|g| g.lng))
        .bind(receipt.gps.and_then(|g| g.accuracy_m))
        .bind(&receipt.device_fingerprint)
        .bind(receipt.declared_total)
        .bind(receipt.status)
        .bind(Json(&receipt.fields))
        .bind(flags_to_text(receipt.fraud_flags.iter().copied()))
        .bind(receipt.submitted_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Get receipt by ID
    pub async fn get_by_id(&self, id: Uuid) -> AppResult<Receipt> {
        let query = format!("SELECT {} FROM receipts WHERE id = $1", RECEIPT_COLUMNS);
        sqlx::query_as::<_, ReceiptRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Receipt with id {} not found", id)))?
            .try_into()
    }

    /// Get the receipt owned by a visit
    pub async fn get_by_visit(&self, visit_id: Uuid) -> AppResult<Receipt> {
        let query = format!("SELECT {} FROM receipts WHERE visit_id = $1", RECEIPT_COLUMNS);
        sqlx::query_as::<_, ReceiptRow>(&query)
            .bind(visit_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No receipt for visit {}", visit_id)))?
            .try_into()
    }

    /// Comparison window for the fraud detector
    pub async fn recent_fingerprints(
        &self,
        since: DateTime<Utc>,
        image_hash: &str,
    ) -> AppResult<Vec<ReceiptFingerprint>> {
        let rows = sqlx::query_as::<_, FingerprintRow>(
            r#"
            SELECT id, user_id, image_hash, perceptual_hash, device_fingerprint,
                   gps_lat, gps_lng, gps_accuracy_m, status, submitted_at
            FROM receipts
            WHERE submitted_at >= $1 OR image_hash = $2
            "#,
        )
        .bind(since)
        .bind(image_hash)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Write derived signals; only while the receipt is still pending
    pub async fn save_signals(&self, receipt_id: Uuid, signals: &ReceiptSignals) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE receipts SET
                restaurant_id = $2, extracted = $3, predicted_data = $3, raw_ocr_payload = $4,
                confidences = $5, fraud_flags = $6, auto_approve_score = $7,
                ocr_method = $8, model_version = $9
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(receipt_id)
        .bind(signals.restaurant_id)
        .bind(Json(&signals.fields))
        .bind(&signals.raw_ocr_payload)
        .bind(signals.confidences.as_ref().map(Json))
        .bind(flags_to_text(signals.fraud_flags.iter().copied()))
        .bind(signals.auto_approve_score)
        .bind(signals.ocr_method)
        .bind(&signals.model_version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_points_synced(&self, receipt_id: Uuid, at: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE receipts SET points_synced_at = $2
            WHERE id = $1 AND points_awarded IS NOT NULL AND points_synced_at IS NULL
            "#,
        )
        .bind(receipt_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Pending receipts, oldest first
    pub async fn review_queue(&self, limit: i64) -> AppResult<Vec<Receipt>> {
        let query = format!(
            "SELECT {} FROM receipts WHERE status = 'pending' ORDER BY submitted_at LIMIT $1",
            RECEIPT_COLUMNS
        );
        let rows = sqlx::query_as::<_, ReceiptRow>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Receipt::try_from).collect()
    }

    /// Approved receipts whose ledger award was never acknowledged
    pub async fn unsynced_awards(&self, before: DateTime<Utc>, limit: i64) -> AppResult<Vec<Receipt>> {
        let query = format!(
            r#"
            SELECT {} FROM receipts
            WHERE status = 'approved' AND points_awarded IS NOT NULL
              AND points_synced_at IS NULL AND reviewed_at < $1
            ORDER BY reviewed_at
            LIMIT $2
            "#,
            RECEIPT_COLUMNS
        );
        let rows = sqlx::query_as::<_, ReceiptRow>(&query)
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Receipt::try_from).collect()
    }

    pub async fn count_stale_pending(&self, before: DateTime<Utc>) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM receipts
            WHERE status = 'pending' AND ocr_method IS NULL AND submitted_at < $1
            "#,
        )
        .bind(before)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
