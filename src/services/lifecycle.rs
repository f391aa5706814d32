//! Visit state machine and the side effects of its transitions

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    clock::Clock,
    decision::Decision,
    integrations::Collaborators,
    locks::{LockToken, ReceiptLocks},
    training::TrainingRecorder,
};
use crate::{
    config::LifecycleConfig,
    error::{AppError, AppResult},
    models::{
        enums::NotificationEvent, ExtractedFields, GpsPoint, Receipt, ReceiptField,
        ReceiptStatus, RejectionReason, Visit, VisitOutcome, VisitStatus,
    },
    repository::{Approval, ApprovalOutcome, NewSubmission, Rejection, VerificationStore},
};

/// Fields an approval cannot do without
const APPROVAL_FIELDS: [ReceiptField; 4] = [
    ReceiptField::TotalAmount,
    ReceiptField::Jir,
    ReceiptField::Zki,
    ReceiptField::Oib,
];

/// Everything known about a submission before its visit exists
#[derive(Debug, Clone)]
pub struct VisitDraft {
    pub user_id: Uuid,
    pub restaurant_id: Uuid,
    pub image_ref: String,
    pub image_hash: String,
    pub perceptual_hash: u64,
    pub gps: Option<GpsPoint>,
    pub device_fingerprint: Option<String>,
    pub declared_total: Option<Decimal>,
    pub tagged_buddies: Vec<Uuid>,
}

enum Transition {
    Applied(VisitOutcome),
    /// The expected prior state no longer held; nothing changed
    Stale,
    DuplicateImage,
}

#[derive(Clone)]
pub struct VisitLifecycle {
    store: Arc<dyn VerificationStore>,
    clock: Arc<dyn Clock>,
    collaborators: Collaborators,
    locks: Arc<dyn ReceiptLocks>,
    training: TrainingRecorder,
    config: LifecycleConfig,
}

impl VisitLifecycle {
    pub fn new(
        store: Arc<dyn VerificationStore>,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
        locks: Arc<dyn ReceiptLocks>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            training: TrainingRecorder::new(store.clone()),
            store,
            clock,
            collaborators,
            locks,
            config,
        }
    }

    /// Create the PENDING visit and its receipt. An open retake for the same
    /// restaurant is consumed and its must-visit snapshot inherited;
    /// otherwise the must-visit flag is taken now.
    pub async fn open(&self, draft: VisitDraft) -> AppResult<(Visit, Receipt)> {
        let now = self.clock.now();
        let retake = self
            .store
            .find_open_retake(draft.user_id, draft.restaurant_id, now)
            .await?;

        let (was_in_must_visit, took_flag) = match &retake {
            Some(previous) => (previous.was_in_must_visit, false),
            None => match self
                .collaborators
                .favorites
                .take_must_visit(draft.user_id, draft.restaurant_id)
                .await
            {
                Ok(removed) => (removed, removed),
                Err(e) => {
                    warn!(user_id = %draft.user_id, error = %e, "Could not take must-visit flag");
                    (false, false)
                }
            },
        };

        let visit = Visit {
            id: Uuid::new_v4(),
            user_id: draft.user_id,
            restaurant_id: draft.restaurant_id,
            receipt_image_ref: draft.image_ref.clone(),
            status: VisitStatus::Pending,
            was_in_must_visit,
            visit_date: None,
            submitted_at: now,
            reviewed_at: None,
            reviewed_by: None,
            rejection_reason: None,
            retake_deadline: None,
            experience_deadline: None,
            tagged_buddies: draft.tagged_buddies,
            retake_of: retake.as_ref().map(|r| r.id),
            experience_id: None,
            experience_lapsed_at: None,
        };
        let receipt = Receipt {
            id: Uuid::new_v4(),
            visit_id: visit.id,
            user_id: draft.user_id,
            restaurant_id: None,
            image_ref: draft.image_ref,
            image_hash: draft.image_hash,
            perceptual_hash: draft.perceptual_hash,
            gps: draft.gps,
            device_fingerprint: draft.device_fingerprint,
            declared_total: draft.declared_total,
            status: ReceiptStatus::Pending,
            fields: ExtractedFields::default(),
            raw_ocr_payload: None,
            confidences: None,
            fraud_flags: Default::default(),
            auto_approve_score: None,
            ocr_method: None,
            model_version: None,
            predicted_data: None,
            corrected_data: None,
            points_awarded: None,
            points_synced_at: None,
            submitted_at: now,
            reviewed_at: None,
        };

        let submission = NewSubmission {
            visit,
            receipt,
            replaces_retake: retake.map(|r| r.id),
        };
        if let Err(e) = self.store.create_submission(&submission).await {
            if took_flag {
                self.restore_must_visit(submission.visit.user_id, submission.visit.restaurant_id)
                    .await;
            }
            return Err(e);
        }

        info!(
            visit_id = %submission.visit.id,
            receipt_id = %submission.receipt.id,
            retake_of = ?submission.visit.retake_of,
            was_in_must_visit,
            "Visit created"
        );
        Ok((submission.visit, submission.receipt))
    }

    pub async fn lock(&self, visit_id: Uuid) -> AppResult<LockToken> {
        self.locks
            .acquire(visit_id, StdDuration::from_secs(self.config.lock_ttl_secs))
            .await
    }

    pub async fn unlock(&self, token: &LockToken) {
        if let Err(e) = self.locks.release(token).await {
            warn!(visit_id = %token.key, error = %e, "Failed to release visit lock");
        }
    }

    /// Apply an automated decision. `receipt` must carry the saved signals.
    pub async fn apply_decision(
        &self,
        visit: &Visit,
        receipt: &Receipt,
        decision: &Decision,
    ) -> AppResult<VisitOutcome> {
        let transition = match decision {
            Decision::AutoApprove { .. } => {
                match self.approve(visit, receipt, receipt.fields.clone(), None, None).await? {
                    // Lost the race on the image hash: same as an exact duplicate
                    Transition::DuplicateImage => {
                        self.reject(visit, RejectionReason::DuplicateReceipt, receipt.id, None, None)
                            .await?
                    }
                    other => other,
                }
            }
            Decision::AutoReject { reason, .. } => {
                self.reject(visit, *reason, receipt.id, None, None).await?
            }
            Decision::ManualReview { reason, .. } => {
                info!(visit_id = %visit.id, ?reason, "Visit queued for manual review");
                Transition::Applied(VisitOutcome::PendingReview)
            }
        };

        match transition {
            Transition::Applied(outcome) => Ok(outcome),
            _ => self.current_outcome(visit.id).await,
        }
    }

    /// Administrator approval, optionally correcting extracted fields
    pub async fn admin_approve(
        &self,
        visit_id: Uuid,
        admin_id: Uuid,
        corrected: Option<ExtractedFields>,
    ) -> AppResult<VisitOutcome> {
        let token = self.lock(visit_id).await?;
        let result = self.admin_approve_locked(visit_id, admin_id, corrected).await;
        self.unlock(&token).await;
        result
    }

    async fn admin_approve_locked(
        &self,
        visit_id: Uuid,
        admin_id: Uuid,
        corrected: Option<ExtractedFields>,
    ) -> AppResult<VisitOutcome> {
        let (visit, receipt) = self.pending_visit(visit_id).await?;
        let effective = match &corrected {
            Some(c) => receipt.fields.merged_with(c),
            None => receipt.fields.clone(),
        };

        let missing: Vec<&str> = effective
            .missing_required()
            .into_iter()
            .filter(|f| APPROVAL_FIELDS.contains(f))
            .map(|f| f.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(AppError::BusinessRule(format!(
                "Cannot approve without: {}",
                missing.join(", ")
            )));
        }

        let corrected_data = corrected.map(|_| effective.clone());

        match self
            .approve(&visit, &receipt, effective.clone(), Some(admin_id), corrected_data)
            .await?
        {
            Transition::Applied(outcome) => {
                self.record_review(&receipt, &effective, admin_id).await;
                Ok(outcome)
            }
            Transition::Stale => Err(AppError::BusinessRule(format!(
                "Visit {} was decided concurrently",
                visit_id
            ))),
            Transition::DuplicateImage => Err(AppError::Conflict(
                "Another approved receipt carries the same image".to_string(),
            )),
        }
    }

    /// Administrator rejection; opens a retake window when the policy allows
    pub async fn admin_reject(
        &self,
        visit_id: Uuid,
        admin_id: Uuid,
        reason: RejectionReason,
        corrected: Option<ExtractedFields>,
    ) -> AppResult<VisitOutcome> {
        let token = self.lock(visit_id).await?;
        let result = self.admin_reject_locked(visit_id, admin_id, reason, corrected).await;
        self.unlock(&token).await;
        result
    }

    async fn admin_reject_locked(
        &self,
        visit_id: Uuid,
        admin_id: Uuid,
        reason: RejectionReason,
        corrected: Option<ExtractedFields>,
    ) -> AppResult<VisitOutcome> {
        let (visit, receipt) = self.pending_visit(visit_id).await?;
        let effective = match &corrected {
            Some(c) => receipt.fields.merged_with(c),
            None => receipt.fields.clone(),
        };
        let corrected_data = corrected.map(|_| effective.clone());

        match self
            .reject(&visit, reason, receipt.id, Some(admin_id), corrected_data)
            .await?
        {
            Transition::Applied(outcome) => {
                self.record_review(&receipt, &effective, admin_id).await;
                Ok(outcome)
            }
            _ => Err(AppError::BusinessRule(format!(
                "Visit {} was decided concurrently",
                visit_id
            ))),
        }
    }

    /// Attach the experience created for an approved visit; repeating the
    /// same link is accepted.
    pub async fn link_experience(&self, visit_id: Uuid, experience_id: Uuid) -> AppResult<Visit> {
        if !self.store.link_experience(visit_id, experience_id).await? {
            let visit = self.store.get_visit(visit_id).await?;
            if visit.experience_id != Some(experience_id) {
                return Err(AppError::BusinessRule(format!(
                    "Visit {} cannot take an experience (status {}, experience {:?})",
                    visit_id, visit.status, visit.experience_id
                )));
            }
            return Ok(visit);
        }
        self.store.get_visit(visit_id).await
    }

    /// What the owner currently sees for a visit
    pub async fn current_outcome(&self, visit_id: Uuid) -> AppResult<VisitOutcome> {
        let visit = self.store.get_visit(visit_id).await?;
        let points = match self.store.get_receipt_for_visit(visit_id).await {
            Ok(receipt) => receipt.points_awarded,
            Err(AppError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(visit.outcome(points))
    }

    /// Send an approved receipt's award to the ledger and mark it synced.
    /// Returns whether the ledger acknowledged it.
    pub async fn sync_points(&self, visit: &Visit, receipt_id: Uuid, points: i32) -> AppResult<bool> {
        let awarded = self
            .collaborators
            .award_points(
                receipt_id,
                visit.user_id,
                points,
                &visit.tagged_buddies,
                self.config.points.buddy_points,
            )
            .await;

        match awarded {
            Ok(()) => {
                self.store
                    .mark_points_synced(receipt_id, self.clock.now())
                    .await?;
                Ok(true)
            }
            Err(e) => {
                warn!(%receipt_id, error = %e, "Points award not acknowledged, will retry");
                Ok(false)
            }
        }
    }

    pub async fn restore_must_visit(&self, user_id: Uuid, restaurant_id: Uuid) -> bool {
        match self.collaborators.favorites.restore(user_id, restaurant_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%user_id, %restaurant_id, error = %e, "Failed to restore must-visit flag");
                false
            }
        }
    }

    async fn pending_visit(&self, visit_id: Uuid) -> AppResult<(Visit, Receipt)> {
        let visit = self.store.get_visit(visit_id).await?;
        if visit.status != VisitStatus::Pending {
            return Err(AppError::BusinessRule(format!(
                "Visit {} is {}, not pending",
                visit_id, visit.status
            )));
        }
        let receipt = self.store.get_receipt_for_visit(visit_id).await?;
        Ok((visit, receipt))
    }

    async fn record_review(&self, receipt: &Receipt, effective: &ExtractedFields, admin_id: Uuid) {
        let predicted = receipt.predicted_data.as_ref().unwrap_or(&receipt.fields);
        if let Err(e) = self
            .training
            .record(
                receipt.id,
                predicted,
                effective,
                receipt.model_version.as_deref(),
                Some(admin_id),
                self.clock.now(),
            )
            .await
        {
            warn!(receipt_id = %receipt.id, error = %e, "Failed to record training sample");
        }
    }

    async fn approve(
        &self,
        visit: &Visit,
        receipt: &Receipt,
        fields: ExtractedFields,
        reviewed_by: Option<Uuid>,
        corrected_data: Option<ExtractedFields>,
    ) -> AppResult<Transition> {
        let reviewed_at = self.clock.now();
        let experience_deadline = reviewed_at + Duration::days(self.config.experience_window_days);
        let points = self
            .config
            .points
            .points_for(fields.total_amount, visit.was_in_must_visit);

        let approval = Approval {
            visit_id: visit.id,
            receipt_id: receipt.id,
            reviewed_at,
            reviewed_by,
            points,
            experience_deadline,
            visit_date: fields.issue_date,
            fields,
            corrected_data,
        };

        match self.store.approve(&approval).await? {
            ApprovalOutcome::Approved => {}
            ApprovalOutcome::NotPending => return Ok(Transition::Stale),
            ApprovalOutcome::DuplicateImage => return Ok(Transition::DuplicateImage),
        }

        info!(
            visit_id = %visit.id,
            receipt_id = %receipt.id,
            points,
            automated = reviewed_by.is_none(),
            "Visit approved"
        );

        // Committed: an unsynced award is left to the reconciler
        if let Err(e) = self.sync_points(visit, receipt.id, points).await {
            warn!(visit_id = %visit.id, receipt_id = %receipt.id, error = %e, "Failed to sync points");
        }

        if let Err(e) = self
            .collaborators
            .experiences
            .open_window(visit.id, visit.user_id, visit.restaurant_id, experience_deadline)
            .await
        {
            warn!(visit_id = %visit.id, error = %e, "Failed to open experience window");
        }

        self.notify(
            visit.user_id,
            NotificationEvent::VisitApproved,
            json!({
                "visit_id": visit.id,
                "points": points,
                "experience_deadline": experience_deadline,
            }),
        )
        .await;

        Ok(Transition::Applied(VisitOutcome::Approved {
            points,
            experience_deadline,
        }))
    }

    async fn reject(
        &self,
        visit: &Visit,
        reason: RejectionReason,
        receipt_id: Uuid,
        reviewed_by: Option<Uuid>,
        corrected_data: Option<ExtractedFields>,
    ) -> AppResult<Transition> {
        let reviewed_at = self.clock.now();
        let retake_deadline: Option<DateTime<Utc>> = self
            .config
            .retake
            .allows(visit.was_in_must_visit, reason)
            .then(|| reviewed_at + Duration::hours(self.config.retake_window_hours));

        let rejection = Rejection {
            visit_id: visit.id,
            receipt_id,
            reviewed_at,
            reviewed_by,
            reason,
            retake_deadline,
            corrected_data,
        };
        if !self.store.reject(&rejection).await? {
            return Ok(Transition::Stale);
        }

        info!(
            visit_id = %visit.id,
            %receipt_id,
            %reason,
            retake = retake_deadline.is_some(),
            automated = reviewed_by.is_none(),
            "Visit rejected"
        );

        let outcome = match retake_deadline {
            Some(deadline) => {
                self.notify(
                    visit.user_id,
                    NotificationEvent::RetakeRequested,
                    json!({ "visit_id": visit.id, "reason": reason, "deadline": deadline }),
                )
                .await;
                VisitOutcome::RetakeRequested { reason, deadline }
            }
            None => {
                if visit.was_in_must_visit {
                    self.restore_must_visit(visit.user_id, visit.restaurant_id).await;
                }
                self.notify(
                    visit.user_id,
                    NotificationEvent::VisitRejected,
                    json!({ "visit_id": visit.id, "reason": reason }),
                )
                .await;
                VisitOutcome::Rejected { reason }
            }
        };

        Ok(Transition::Applied(outcome))
    }

    async fn notify(&self, user_id: Uuid, event: NotificationEvent, payload: serde_json::Value) {
        if let Err(e) = self
            .collaborators
            .notifications
            .notify(user_id, event, payload)
            .await
        {
            warn!(%user_id, ?event, error = %e, "Notification dispatch failed");
        }
    }
}
