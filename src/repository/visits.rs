//! Visits repository for database operations

use chrono::{DateTime, Utc};
use sqlx::{types::Json, Pool, Postgres};
use uuid::Uuid;

use super::{receipts::ReceiptsRepository, Approval, ApprovalOutcome, NewSubmission, Rejection};
use crate::{
    error::{AppError, AppResult},
    models::{Visit, VisitStatus},
};

#[derive(Clone)]
pub struct VisitsRepository {
    pool: Pool<Postgres>,
}

impl VisitsRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get visit by ID
    pub async fn get_by_id(&self, id: Uuid) -> AppResult<Visit> {
        sqlx::query_as::<_, Visit>("SELECT * FROM visits WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Visit with id {} not found", id)))
    }

    /// Most recent visits of a user
    pub async fn list_for_user(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<Visit>> {
        let visits = sqlx::query_as::<_, Visit>(
            "SELECT * FROM visits WHERE user_id = $1 ORDER BY submitted_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(visits)
    }

    /// Unexpired RETAKE_NEEDED visit for this user and restaurant, if any
    pub async fn find_open_retake(
        &self,
        user_id: Uuid,
        restaurant_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Visit>> {
        let visit = sqlx::query_as::<_, Visit>(
            r#"
            SELECT * FROM visits
            WHERE user_id = $1 AND restaurant_id = $2
              AND status = 'retake_needed' AND retake_deadline > $3
            ORDER BY retake_deadline DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(restaurant_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(visit)
    }

    /// Create a visit and its receipt; consumes the replaced retake visit in
    /// the same transaction.
    pub async fn create_with_receipt(&self, submission: &NewSubmission) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(retake_id) = submission.replaces_retake {
            let result = sqlx::query(
                "DELETE FROM visits WHERE id = $1 AND status = 'retake_needed' AND retake_deadline > $2",
            )
            .bind(retake_id)
            .bind(submission.visit.submitted_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(AppError::Conflict(
                    "Retake window closed before the new receipt was stored".to_string(),
                ));
            }
        }

        let visit = &submission.visit;
        sqlx::query(
            r#"
            INSERT INTO visits (
                id, user_id, restaurant_id, receipt_image_ref, status, was_in_must_visit,
                visit_date, submitted_at, tagged_buddies, retake_of
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(visit.id)
        .bind(visit.user_id)
        .bind(visit.restaurant_id)
        .bind(&visit.receipt_image_ref)
        .bind(visit.status)
        .bind(visit.was_in_must_visit)
        .bind(visit.visit_date)
        .bind(visit.submitted_at)
        .bind(&visit.tagged_buddies)
        .bind(visit.retake_of)
        .execute(&mut *tx)
        .await?;

        ReceiptsRepository::insert_in(&mut tx, &submission.receipt).await?;

        tx.commit().await?;
        Ok(())
    }

    /// PENDING -> APPROVED for the visit and its receipt
    pub async fn approve(&self, approval: &Approval) -> AppResult<ApprovalOutcome> {
        let mut tx = self.pool.begin().await?;

        let visit_result = sqlx::query(
            r#"
            UPDATE visits SET
                status = 'approved', reviewed_at = $2, reviewed_by = $3,
                experience_deadline = $4, retake_deadline = NULL, visit_date = $5
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(approval.visit_id)
        .bind(approval.reviewed_at)
        .bind(approval.reviewed_by)
        .bind(approval.experience_deadline)
        .bind(approval.visit_date)
        .execute(&mut *tx)
        .await?;

        if visit_result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ApprovalOutcome::NotPending);
        }

        let receipt_result = sqlx::query(
            r#"
            UPDATE receipts SET
                status = 'approved', points_awarded = $2, reviewed_at = $3,
                extracted = $4, corrected_data = COALESCE($5, corrected_data)
            WHERE id = $1 AND status = 'pending' AND points_awarded IS NULL
            "#,
        )
        .bind(approval.receipt_id)
        .bind(approval.points)
        .bind(approval.reviewed_at)
        .bind(Json(&approval.fields))
        .bind(approval.corrected_data.as_ref().map(Json))
        .execute(&mut *tx)
        .await;

        match receipt_result {
            Ok(result) if result.rows_affected() == 1 => {
                tx.commit().await?;
                Ok(ApprovalOutcome::Approved)
            }
            Ok(_) => {
                tx.rollback().await?;
                Ok(ApprovalOutcome::NotPending)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tx.rollback().await?;
                Ok(ApprovalOutcome::DuplicateImage)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// PENDING -> REJECTED or RETAKE_NEEDED for the visit and its receipt
    pub async fn reject(&self, rejection: &Rejection) -> AppResult<bool> {
        let status = if rejection.retake_deadline.is_some() {
            VisitStatus::RetakeNeeded
        } else {
            VisitStatus::Rejected
        };

        let mut tx = self.pool.begin().await?;

        let visit_result = sqlx::query(
            r#"
            UPDATE visits SET
                status = $2, reviewed_at = $3, reviewed_by = $4, rejection_reason = $5,
                retake_deadline = $6, experience_deadline = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(rejection.visit_id)
        .bind(status)
        .bind(rejection.reviewed_at)
        .bind(rejection.reviewed_by)
        .bind(rejection.reason)
        .bind(rejection.retake_deadline)
        .execute(&mut *tx)
        .await?;

        if visit_result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE receipts SET
                status = 'rejected', reviewed_at = $2,
                corrected_data = COALESCE($3, corrected_data)
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(rejection.receipt_id)
        .bind(rejection.reviewed_at)
        .bind(rejection.corrected_data.as_ref().map(Json))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn link_experience(&self, visit_id: Uuid, experience_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE visits SET experience_id = $2
            WHERE id = $1 AND status = 'approved' AND experience_id IS NULL
            "#,
        )
        .bind(visit_id)
        .bind(experience_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// RETAKE_NEEDED visits past their deadline, oldest first
    pub async fn expired_retakes(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<Visit>> {
        let visits = sqlx::query_as::<_, Visit>(
            r#"
            SELECT * FROM visits
            WHERE status = 'retake_needed' AND retake_deadline <= $1
            ORDER BY retake_deadline
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(visits)
    }

    /// Hard-delete one expired retake; the receipt goes with it (cascade)
    pub async fn delete_expired_retake(&self, visit_id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            "DELETE FROM visits WHERE id = $1 AND status = 'retake_needed' AND retake_deadline <= $2",
        )
        .bind(visit_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// APPROVED visits whose experience window closed without an experience
    pub async fn lapsed_experiences(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<Visit>> {
        let visits = sqlx::query_as::<_, Visit>(
            r#"
            SELECT * FROM visits
            WHERE status = 'approved' AND experience_deadline <= $1
              AND experience_id IS NULL AND experience_lapsed_at IS NULL
            ORDER BY experience_deadline
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(visits)
    }

    pub async fn mark_experience_lapsed(&self, visit_id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE visits SET experience_lapsed_at = $2
            WHERE id = $1 AND status = 'approved' AND experience_deadline <= $2
              AND experience_id IS NULL AND experience_lapsed_at IS NULL
            "#,
        )
        .bind(visit_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
