//! Submission pipeline: photo in, user-visible outcome out

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use super::{
    blob::BlobStore,
    clock::Clock,
    decision::{Decision, DecisionEngine, DecisionInput, ReviewReason, ScoreVector},
    fraud::FraudDetector,
    hashing::HashService,
    integrations::RestaurantDirectory,
    lifecycle::{VisitDraft, VisitLifecycle},
    ocr::{OcrAdapter, OcrError},
    scoring::{is_valid_oib, ConfidenceScorer, ScoringContext},
};
use crate::{
    config::{FraudConfig, ScoringConfig},
    error::{AppError, AppResult},
    models::{
        ExtractedFields, ExtractionResult, FraudFlag, GpsPoint, Receipt, ReceiptFingerprint,
        ReceiptSignals, SubmitVisit, SubmittedVisit, Visit, VisitOutcome,
    },
    repository::VerificationStore,
};

#[derive(Clone)]
pub struct VerificationPipeline {
    store: Arc<dyn VerificationStore>,
    blobs: Arc<dyn BlobStore>,
    ocr: OcrAdapter,
    lifecycle: VisitLifecycle,
    restaurants: Arc<dyn RestaurantDirectory>,
    clock: Arc<dyn Clock>,
    hasher: HashService,
    fraud: FraudDetector,
    scorer: ConfidenceScorer,
    engine: DecisionEngine,
}

impl VerificationPipeline {
    pub fn new(
        store: Arc<dyn VerificationStore>,
        blobs: Arc<dyn BlobStore>,
        ocr: OcrAdapter,
        lifecycle: VisitLifecycle,
        restaurants: Arc<dyn RestaurantDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            blobs,
            ocr,
            lifecycle,
            restaurants,
            clock,
            hasher: HashService::new(),
            fraud: FraudDetector::new(FraudConfig::default()),
            scorer: ConfidenceScorer::new(ScoringConfig::default()),
            engine: DecisionEngine::new(ScoringConfig::default()),
        }
    }

    pub fn with_scoring(mut self, config: ScoringConfig) -> Self {
        self.scorer = ConfidenceScorer::new(config.clone());
        self.engine = DecisionEngine::new(config);
        self
    }

    pub fn with_fraud(mut self, config: FraudConfig) -> Self {
        self.fraud = FraudDetector::new(config);
        self
    }

    /// Store the photo, open a PENDING visit and run it through fraud checks,
    /// OCR, scoring and the decision engine.
    pub async fn submit(
        &self,
        user_id: Uuid,
        request: SubmitVisit,
        image: Vec<u8>,
    ) -> AppResult<SubmittedVisit> {
        request
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;
        if image.is_empty() {
            return Err(AppError::Validation("Empty receipt image".to_string()));
        }

        let fingerprint = self.hasher.hash_blocking(image.clone()).await?;
        let extension = fingerprint
            .format
            .extensions_str()
            .first()
            .copied()
            .unwrap_or("bin");
        let image_ref = self
            .blobs
            .put(&fingerprint.content_hash, extension, &image)
            .await?;

        let (visit, receipt) = self
            .lifecycle
            .open(VisitDraft {
                user_id,
                restaurant_id: request.restaurant_id,
                image_ref,
                image_hash: fingerprint.content_hash.clone(),
                perceptual_hash: fingerprint.perceptual_hash,
                gps: request.gps,
                device_fingerprint: request.device_fingerprint,
                declared_total: request.declared_total,
                tagged_buddies: request.tagged_buddies,
            })
            .await?;

        let token = self.lifecycle.lock(visit.id).await?;
        let outcome = self
            .verify(&visit, &receipt, &image, fingerprint.content_type())
            .await;
        self.lifecycle.unlock(&token).await;

        Ok(SubmittedVisit {
            visit_id: visit.id,
            outcome: outcome?,
        })
    }

    async fn verify(
        &self,
        visit: &Visit,
        receipt: &Receipt,
        image: &[u8],
        content_type: &str,
    ) -> AppResult<VisitOutcome> {
        let now = self.clock.now();
        let window = self
            .store
            .recent_fingerprints(now - self.fraud.window(), &receipt.image_hash)
            .await?;
        let mut flags = self.fraud.detect(&ReceiptFingerprint::from(receipt), &window);

        let extraction = match self.ocr.extract(&receipt.image_ref, image, content_type).await {
            Ok(extraction) => extraction,
            Err(e) => return self.hold_for_review(visit, receipt, flags, e).await,
        };

        let fields = ExtractedFields::from_extraction(&extraction);
        let resolved_restaurant_id = self.resolve_restaurant(&fields).await;
        let ctx = ScoringContext {
            claimed_restaurant_id: visit.restaurant_id,
            resolved_restaurant_id,
            restaurant_location: self.restaurant_location(visit.restaurant_id).await,
            declared_total: receipt.declared_total,
            gps: receipt.gps,
            now,
        };

        let report = self.scorer.score(&extraction, &fields, &ctx);
        flags.extend(report.flags());
        let scores = ScoreVector {
            vision: report.vision,
            parser: report.parser,
            consistency: report.consistency,
        };
        let decision = self.engine.decide(&DecisionInput {
            scores,
            fraud_flags: flags.clone(),
            missing_fields: fields.missing_required(),
        });

        info!(
            visit_id = %visit.id,
            receipt_id = %receipt.id,
            vision = report.vision,
            parser = report.parser,
            consistency = report.consistency,
            findings = ?report.findings,
            flags = ?flags,
            outcome = decision.label(),
            score = ?decision.score(),
            "Receipt scored"
        );

        let signals = ReceiptSignals {
            restaurant_id: resolved_restaurant_id,
            fields,
            raw_ocr_payload: raw_payload(&extraction),
            confidences: Some(report.confidences()),
            auto_approve_score: Some(self.engine.auto_approve_score(&scores, &flags)),
            fraud_flags: flags,
            ocr_method: Some(extraction.method),
            model_version: extraction.model_version,
        };
        self.store.save_signals(receipt.id, &signals).await?;

        let receipt = self.store.get_receipt(receipt.id).await?;
        self.lifecycle.apply_decision(visit, &receipt, &decision).await
    }

    /// OCR failed: keep the receipt pending with whatever fraud signals exist
    async fn hold_for_review(
        &self,
        visit: &Visit,
        receipt: &Receipt,
        flags: BTreeSet<FraudFlag>,
        error: OcrError,
    ) -> AppResult<VisitOutcome> {
        warn!(visit_id = %visit.id, receipt_id = %receipt.id, error = %error, "OCR failed, holding for review");

        let reason = match error {
            OcrError::ProviderUnavailable(_) => ReviewReason::ProviderUnavailable,
            OcrError::ProviderRejected(_) => ReviewReason::ProviderRejected,
        };
        let signals = ReceiptSignals {
            restaurant_id: None,
            fields: ExtractedFields::default(),
            raw_ocr_payload: None,
            confidences: None,
            fraud_flags: flags,
            auto_approve_score: None,
            ocr_method: None,
            model_version: None,
        };
        self.store.save_signals(receipt.id, &signals).await?;

        let decision = Decision::ManualReview { score: None, reason };
        self.lifecycle.apply_decision(visit, receipt, &decision).await
    }

    async fn resolve_restaurant(&self, fields: &ExtractedFields) -> Option<Uuid> {
        let oib = fields.oib.as_deref().filter(|oib| is_valid_oib(oib))?;
        match self.restaurants.resolve_oib(oib).await {
            Ok(found) => found,
            Err(e) => {
                warn!(oib, error = %e, "OIB lookup failed");
                None
            }
        }
    }

    async fn restaurant_location(&self, restaurant_id: Uuid) -> Option<GpsPoint> {
        match self.restaurants.location(restaurant_id).await {
            Ok(location) => location,
            Err(e) => {
                warn!(%restaurant_id, error = %e, "Restaurant location lookup failed");
                None
            }
        }
    }
}

fn raw_payload(extraction: &ExtractionResult) -> Option<serde_json::Value> {
    serde_json::to_value(extraction)
        .map_err(|e| warn!(error = %e, "Could not serialise OCR payload"))
        .ok()
}
