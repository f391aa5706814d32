//! Repository layer: the persistence boundary of the verification core

pub mod receipts;
pub mod training;
pub mod visits;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{
        ExtractedFields, Receipt, ReceiptFingerprint, ReceiptSignals, RejectionReason,
        TrainingSample, Visit,
    },
};

/// A new visit and its receipt, created together
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub visit: Visit,
    pub receipt: Receipt,
    /// RETAKE_NEEDED visit consumed by this submission
    pub replaces_retake: Option<Uuid>,
}

/// Approval transition, applied to the visit and its receipt at once
#[derive(Debug, Clone)]
pub struct Approval {
    pub visit_id: Uuid,
    pub receipt_id: Uuid,
    pub reviewed_at: DateTime<Utc>,
    pub reviewed_by: Option<Uuid>,
    pub points: i32,
    pub experience_deadline: DateTime<Utc>,
    pub visit_date: Option<NaiveDate>,
    pub fields: ExtractedFields,
    pub corrected_data: Option<ExtractedFields>,
}

/// Rejection transition; `retake_deadline` set means RETAKE_NEEDED
#[derive(Debug, Clone)]
pub struct Rejection {
    pub visit_id: Uuid,
    pub receipt_id: Uuid,
    pub reviewed_at: DateTime<Utc>,
    pub reviewed_by: Option<Uuid>,
    pub reason: RejectionReason,
    pub retake_deadline: Option<DateTime<Utc>>,
    pub corrected_data: Option<ExtractedFields>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    /// Visit or receipt already left PENDING; nothing changed
    NotPending,
    /// Another approved receipt carries the same image hash
    DuplicateImage,
}

/// Storage operations used by the pipeline, lifecycle and reconciler.
///
/// Every state-changing call is conditional on the expected prior state and
/// reports whether it applied, so callers can treat a lost race as a no-op.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn ping(&self) -> AppResult<()>;

    async fn create_submission(&self, submission: &NewSubmission) -> AppResult<()>;

    async fn find_open_retake(
        &self,
        user_id: Uuid,
        restaurant_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Visit>>;

    async fn get_visit(&self, id: Uuid) -> AppResult<Visit>;

    async fn list_user_visits(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<Visit>>;

    async fn get_receipt(&self, id: Uuid) -> AppResult<Receipt>;

    async fn get_receipt_for_visit(&self, visit_id: Uuid) -> AppResult<Receipt>;

    /// Receipts submitted since `since`, plus any older one sharing `image_hash`
    async fn recent_fingerprints(
        &self,
        since: DateTime<Utc>,
        image_hash: &str,
    ) -> AppResult<Vec<ReceiptFingerprint>>;

    async fn save_signals(&self, receipt_id: Uuid, signals: &ReceiptSignals) -> AppResult<()>;

    async fn approve(&self, approval: &Approval) -> AppResult<ApprovalOutcome>;

    async fn reject(&self, rejection: &Rejection) -> AppResult<bool>;

    async fn mark_points_synced(&self, receipt_id: Uuid, at: DateTime<Utc>) -> AppResult<bool>;

    async fn link_experience(&self, visit_id: Uuid, experience_id: Uuid) -> AppResult<bool>;

    async fn review_queue(&self, limit: i64) -> AppResult<Vec<Receipt>>;

    async fn expired_retakes(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<Visit>>;

    /// Delete a RETAKE_NEEDED visit (and its receipt) whose deadline passed
    async fn delete_expired_retake(&self, visit_id: Uuid, now: DateTime<Utc>) -> AppResult<bool>;

    async fn lapsed_experiences(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<Visit>>;

    async fn mark_experience_lapsed(&self, visit_id: Uuid, now: DateTime<Utc>) -> AppResult<bool>;

    async fn unsynced_awards(&self, before: DateTime<Utc>, limit: i64) -> AppResult<Vec<Receipt>>;

    /// Pending receipts the OCR step never completed for
    async fn count_stale_pending(&self, before: DateTime<Utc>) -> AppResult<i64>;

    async fn insert_training_sample(&self, sample: &TrainingSample) -> AppResult<()>;
}

/// Postgres-backed repository holding the connection pool
#[derive(Clone)]
pub struct Repository {
    pub pool: Pool<Postgres>,
    pub visits: visits::VisitsRepository,
    pub receipts: receipts::ReceiptsRepository,
    pub training: training::TrainingRepository,
}

impl Repository {
    /// Create a new repository with the given database pool
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            visits: visits::VisitsRepository::new(pool.clone()),
            receipts: receipts::ReceiptsRepository::new(pool.clone()),
            training: training::TrainingRepository::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl VerificationStore for Repository {
    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_submission(&self, submission: &NewSubmission) -> AppResult<()> {
        self.visits.create_with_receipt(submission).await
    }

    async fn find_open_retake(
        &self,
        user_id: Uuid,
        restaurant_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Visit>> {
        self.visits.find_open_retake(user_id, restaurant_id, now).await
    }

    async fn get_visit(&self, id: Uuid) -> AppResult<Visit> {
        self.visits.get_by_id(id).await
    }

    async fn list_user_visits(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<Visit>> {
        self.visits.list_for_user(user_id, limit).await
    }

    async fn get_receipt(&self, id: Uuid) -> AppResult<Receipt> {
        self.receipts.get_by_id(id).await
    }

    async fn get_receipt_for_visit(&self, visit_id: Uuid) -> AppResult<Receipt> {
        self.receipts.get_by_visit(visit_id).await
    }

    async fn recent_fingerprints(
        &self,
        since: DateTime<Utc>,
        image_hash: &str,
    ) -> AppResult<Vec<ReceiptFingerprint>> {
        self.receipts.recent_fingerprints(since, image_hash).await
    }

    async fn save_signals(&self, receipt_id: Uuid, signals: &ReceiptSignals) -> AppResult<()> {
        self.receipts.save_signals(receipt_id, signals).await
    }

    async fn approve(&self, approval: &Approval) -> AppResult<ApprovalOutcome> {
        self.visits.approve(approval).await
    }

    async fn reject(&self, rejection: &Rejection) -> AppResult<bool> {
        self.visits.reject(rejection).await
    }

    async fn mark_points_synced(&self, receipt_id: Uuid, at: DateTime<Utc>) -> AppResult<bool> {
        self.receipts.mark_points_synced(receipt_id, at).await
    }

    async fn link_experience(&self, visit_id: Uuid, experience_id: Uuid) -> AppResult<bool> {
        self.visits.link_experience(visit_id, experience_id).await
    }

    async fn review_queue(&self, limit: i64) -> AppResult<Vec<Receipt>> {
        self.receipts.review_queue(limit).await
    }

    async fn expired_retakes(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<Visit>> {
        self.visits.expired_retakes(now, limit).await
    }

    async fn delete_expired_retake(&self, visit_id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        self.visits.delete_expired_retake(visit_id, now).await
    }

    async fn lapsed_experiences(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<Visit>> {
        self.visits.lapsed_experiences(now, limit).await
    }

    async fn mark_experience_lapsed(&self, visit_id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        self.visits.mark_experience_lapsed(visit_id, now).await
    }

    async fn unsynced_awards(&self, before: DateTime<Utc>, limit: i64) -> AppResult<Vec<Receipt>> {
        self.receipts.unsynced_awards(before, limit).await
    }

    async fn count_stale_pending(&self, before: DateTime<Utc>) -> AppResult<i64> {
        self.receipts.count_stale_pending(before).await
    }

    async fn insert_training_sample(&self, sample: &TrainingSample) -> AppResult<()> {
        self.training.insert(sample).await
    }
}
