//! In-memory store mirroring the Postgres repository's conditional updates

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Approval, ApprovalOutcome, NewSubmission, Rejection, VerificationStore};
use crate::{
    error::{AppError, AppResult},
    models::{
        Receipt, ReceiptFingerprint, ReceiptSignals, ReceiptStatus, TrainingSample, Visit,
        VisitStatus,
    },
};

#[derive(Default)]
struct MemoryState {
    visits: HashMap<Uuid, Visit>,
    receipts: HashMap<Uuid, Receipt>,
    training: Vec<TrainingSample>,
    /// Count of applied state changes
    mutations: usize,
    /// Make `mark_points_synced` fail, as a dropped connection would
    sync_marks_fail: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    pub fn visit(&self, id: Uuid) -> Option<Visit> {
        self.state.lock().unwrap().visits.get(&id).cloned()
    }

    pub fn receipt(&self, id: Uuid) -> Option<Receipt> {
        self.state.lock().unwrap().receipts.get(&id).cloned()
    }

    pub fn fail_sync_marks(&self) {
        self.state.lock().unwrap().sync_marks_fail = true;
    }

    pub fn training_samples(&self) -> Vec<TrainingSample> {
        self.state.lock().unwrap().training.clone()
    }

    pub fn visit_count(&self) -> usize {
        self.state.lock().unwrap().visits.len()
    }

    /// Seed a visit/receipt pair directly, bypassing the pipeline
    pub fn seed(&self, visit: Visit, receipt: Receipt) {
        let mut state = self.state.lock().unwrap();
        state.receipts.insert(receipt.id, receipt);
        state.visits.insert(visit.id, visit);
    }
}

fn delete_visit(state: &mut MemoryState, visit_id: Uuid) {
    state.visits.remove(&visit_id);
    state.receipts.retain(|_, r| r.visit_id != visit_id);
}

#[async_trait]
impl VerificationStore for MemoryStore {
    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn create_submission(&self, submission: &NewSubmission) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();

        if let Some(retake_id) = submission.replaces_retake {
            let open = state.visits.get(&retake_id).is_some_and(|v| {
                v.status == VisitStatus::RetakeNeeded
                    && v.retake_deadline.is_some_and(|d| d > submission.visit.submitted_at)
            });
            if !open {
                return Err(AppError::Conflict(
                    "Retake window closed before the new receipt was stored".to_string(),
                ));
            }
            delete_visit(&mut state, retake_id);
        }

        state
            .visits
            .insert(submission.visit.id, submission.visit.clone());
        state
            .receipts
            .insert(submission.receipt.id, submission.receipt.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn find_open_retake(
        &self,
        user_id: Uuid,
        restaurant_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Visit>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .visits
            .values()
            .filter(|v| {
                v.user_id == user_id
                    && v.restaurant_id == restaurant_id
                    && v.status == VisitStatus::RetakeNeeded
                    && v.retake_deadline.is_some_and(|d| d > now)
            })
            .max_by_key(|v| v.retake_deadline)
            .cloned())
    }

    async fn get_visit(&self, id: Uuid) -> AppResult<Visit> {
        self.visit(id)
            .ok_or_else(|| AppError::NotFound(format!("Visit with id {} not found", id)))
    }

    async fn list_user_visits(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<Visit>> {
        let state = self.state.lock().unwrap();
        let mut visits: Vec<Visit> = state
            .visits
            .values()
            .filter(|v| v.user_id == user_id)
            .cloned()
            .collect();
        visits.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        visits.truncate(limit.max(0) as usize);
        Ok(visits)
    }

    async fn get_receipt(&self, id: Uuid) -> AppResult<Receipt> {
        self.receipt(id)
            .ok_or_else(|| AppError::NotFound(format!("Receipt with id {} not found", id)))
    }

    async fn get_receipt_for_visit(&self, visit_id: Uuid) -> AppResult<Receipt> {
        let state = self.state.lock().unwrap();
        state
            .receipts
            .values()
            .find(|r| r.visit_id == visit_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("No receipt for visit {}", visit_id)))
    }

    async fn recent_fingerprints(
        &self,
        since: DateTime<Utc>,
        image_hash: &str,
    ) -> AppResult<Vec<ReceiptFingerprint>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .receipts
            .values()
            .filter(|r| r.submitted_at >= since || r.image_hash == image_hash)
            .map(ReceiptFingerprint::from)
            .collect())
    }

    async fn save_signals(&self, receipt_id: Uuid, signals: &ReceiptSignals) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(receipt) = state
            .receipts
            .get_mut(&receipt_id)
            .filter(|r| r.status == ReceiptStatus::Pending)
        {
            receipt.restaurant_id = signals.restaurant_id;
            receipt.fields = signals.fields.clone();
            receipt.predicted_data = Some(signals.fields.clone());
            receipt.raw_ocr_payload = signals.raw_ocr_payload.clone();
            receipt.confidences = signals.confidences.clone();
            receipt.fraud_flags = signals.fraud_flags.clone();
            receipt.auto_approve_score = signals.auto_approve_score;
            receipt.ocr_method = signals.ocr_method;
            receipt.model_version = signals.model_version.clone();
            state.mutations += 1;
        }
        Ok(())
    }

    async fn approve(&self, approval: &Approval) -> AppResult<ApprovalOutcome> {
        let mut state = self.state.lock().unwrap();

        let visit_pending = state
            .visits
            .get(&approval.visit_id)
            .is_some_and(|v| v.status == VisitStatus::Pending);
        let receipt = match state.receipts.get(&approval.receipt_id) {
            Some(r) if visit_pending && r.status == ReceiptStatus::Pending && r.points_awarded.is_none() => r,
            _ => return Ok(ApprovalOutcome::NotPending),
        };

        let duplicate = state.receipts.values().any(|other| {
            other.id != receipt.id
                && other.status == ReceiptStatus::Approved
                && other.image_hash == receipt.image_hash
        });
        if duplicate {
            return Ok(ApprovalOutcome::DuplicateImage);
        }

        if let Some(visit) = state.visits.get_mut(&approval.visit_id) {
            visit.status = VisitStatus::Approved;
            visit.reviewed_at = Some(approval.reviewed_at);
            visit.reviewed_by = approval.reviewed_by;
            visit.experience_deadline = Some(approval.experience_deadline);
            visit.retake_deadline = None;
            visit.visit_date = approval.visit_date;
        }
        if let Some(receipt) = state.receipts.get_mut(&approval.receipt_id) {
            receipt.status = ReceiptStatus::Approved;
            receipt.points_awarded = Some(approval.points);
            receipt.reviewed_at = Some(approval.reviewed_at);
            receipt.fields = approval.fields.clone();
            if approval.corrected_data.is_some() {
                receipt.corrected_data = approval.corrected_data.clone();
            }
        }
        state.mutations += 1;
        Ok(ApprovalOutcome::Approved)
    }

    async fn reject(&self, rejection: &Rejection) -> AppResult<bool> {
        let mut state = self.state.lock().unwrap();

        let Some(visit) = state
            .visits
            .get_mut(&rejection.visit_id)
            .filter(|v| v.status == VisitStatus::Pending)
        else {
            return Ok(false);
        };

        visit.status = if rejection.retake_deadline.is_some() {
            VisitStatus::RetakeNeeded
        } else {
            VisitStatus::Rejected
        };
        visit.reviewed_at = Some(rejection.reviewed_at);
        visit.reviewed_by = rejection.reviewed_by;
        visit.rejection_reason = Some(rejection.reason);
        visit.retake_deadline = rejection.retake_deadline;
        visit.experience_deadline = None;

        if let Some(receipt) = state
            .receipts
            .get_mut(&rejection.receipt_id)
            .filter(|r| r.status == ReceiptStatus::Pending)
        {
            receipt.status = ReceiptStatus::Rejected;
            receipt.reviewed_at = Some(rejection.reviewed_at);
            if rejection.corrected_data.is_some() {
                receipt.corrected_data = rejection.corrected_data.clone();
            }
        }
        state.mutations += 1;
        Ok(true)
    }

    async fn mark_points_synced(&self, receipt_id: Uuid, at: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.lock().unwrap();
        if state.sync_marks_fail {
            return Err(AppError::Internal("connection reset".to_string()));
        }
        let Some(receipt) = state
            .receipts
            .get_mut(&receipt_id)
            .filter(|r| r.points_awarded.is_some() && r.points_synced_at.is_none())
        else {
            return Ok(false);
        };
        receipt.points_synced_at = Some(at);
        state.mutations += 1;
        Ok(true)
    }

    async fn link_experience(&self, visit_id: Uuid, experience_id: Uuid) -> AppResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(visit) = state
            .visits
            .get_mut(&visit_id)
            .filter(|v| v.status == VisitStatus::Approved && v.experience_id.is_none())
        else {
            return Ok(false);
        };
        visit.experience_id = Some(experience_id);
        state.mutations += 1;
        Ok(true)
    }

    async fn review_queue(&self, limit: i64) -> AppResult<Vec<Receipt>> {
        let state = self.state.lock().unwrap();
        let mut pending: Vec<Receipt> = state
            .receipts
            .values()
            .filter(|r| r.status == ReceiptStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.submitted_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn expired_retakes(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<Visit>> {
        let state = self.state.lock().unwrap();
        let mut expired: Vec<Visit> = state
            .visits
            .values()
            .filter(|v| {
                v.status == VisitStatus::RetakeNeeded && v.retake_deadline.is_some_and(|d| d <= now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|v| v.retake_deadline);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn delete_expired_retake(&self, visit_id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.lock().unwrap();
        let expired = state.visits.get(&visit_id).is_some_and(|v| {
            v.status == VisitStatus::RetakeNeeded && v.retake_deadline.is_some_and(|d| d <= now)
        });
        if !expired {
            return Ok(false);
        }
        delete_visit(&mut state, visit_id);
        state.mutations += 1;
        Ok(true)
    }

    async fn lapsed_experiences(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<Visit>> {
        let state = self.state.lock().unwrap();
        let mut lapsed: Vec<Visit> = state
            .visits
            .values()
            .filter(|v| is_lapsed(v, now))
            .cloned()
            .collect();
        lapsed.sort_by_key(|v| v.experience_deadline);
        lapsed.truncate(limit.max(0) as usize);
        Ok(lapsed)
    }

    async fn mark_experience_lapsed(&self, visit_id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(visit) = state.visits.get_mut(&visit_id).filter(|v| is_lapsed(v, now)) else {
            return Ok(false);
        };
        visit.experience_lapsed_at = Some(now);
        state.mutations += 1;
        Ok(true)
    }

    async fn unsynced_awards(&self, before: DateTime<Utc>, limit: i64) -> AppResult<Vec<Receipt>> {
        let state = self.state.lock().unwrap();
        let mut unsynced: Vec<Receipt> = state
            .receipts
            .values()
            .filter(|r| {
                r.status == ReceiptStatus::Approved
                    && r.points_awarded.is_some()
                    && r.points_synced_at.is_none()
                    && r.reviewed_at.is_some_and(|at| at < before)
            })
            .cloned()
            .collect();
        unsynced.sort_by_key(|r| r.reviewed_at);
        unsynced.truncate(limit.max(0) as usize);
        Ok(unsynced)
    }

    async fn count_stale_pending(&self, before: DateTime<Utc>) -> AppResult<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .receipts
            .values()
            .filter(|r| {
                r.status == ReceiptStatus::Pending && r.ocr_method.is_none() && r.submitted_at < before
            })
            .count() as i64)
    }

    async fn insert_training_sample(&self, sample: &TrainingSample) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.receipts.contains_key(&sample.receipt_id) {
            return Err(AppError::NotFound(format!(
                "Receipt with id {} not found",
                sample.receipt_id
            )));
        }
        state.training.push(sample.clone());
        state.mutations += 1;
        Ok(())
    }
}

fn is_lapsed(visit: &Visit, now: DateTime<Utc>) -> bool {
    visit.status == VisitStatus::Approved
        && visit.experience_deadline.is_some_and(|d| d <= now)
        && visit.experience_id.is_none()
        && visit.experience_lapsed_at.is_none()
}
