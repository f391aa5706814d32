//! Builders shared by the service tests

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::integrations::{
    Collaborators, MockExperienceService, MockFavoritesService, MockNotificationDispatcher,
    MockPointsLedger, MockRestaurantDirectory,
};
use crate::models::{ExtractedFields, Receipt, ReceiptStatus, Visit, VisitStatus};

pub const VALID_OIB: &str = "69435151530";
pub const VALID_JIR: &str = "2f1c9a9e-5b7d-4c11-9e0a-3d6f4b8a1c2e";
pub const VALID_ZKI: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
}

pub fn complete_fields() -> ExtractedFields {
    ExtractedFields {
        merchant_name: Some("Bistro Lipa".to_string()),
        total_amount: Some(Decimal::new(1840, 2)),
        issue_date: NaiveDate::from_ymd_opt(2024, 3, 14),
        issue_time: NaiveTime::from_hms_opt(19, 42, 0),
        jir: Some(VALID_JIR.to_string()),
        zki: Some(VALID_ZKI.to_string()),
        oib: Some(VALID_OIB.to_string()),
    }
}

pub fn visit(status: VisitStatus, was_in_must_visit: bool) -> Visit {
    Visit {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        restaurant_id: Uuid::new_v4(),
        receipt_image_ref: "ab/ab01.jpg".to_string(),
        status,
        was_in_must_visit,
        visit_date: None,
        submitted_at: t0(),
        reviewed_at: None,
        reviewed_by: None,
        rejection_reason: None,
        retake_deadline: None,
        experience_deadline: None,
        tagged_buddies: Vec::new(),
        retake_of: None,
        experience_id: None,
        experience_lapsed_at: None,
    }
}

pub fn receipt_for(visit: &Visit, image_hash: &str) -> Receipt {
    Receipt {
        id: Uuid::new_v4(),
        visit_id: visit.id,
        user_id: visit.user_id,
        restaurant_id: None,
        image_ref: visit.receipt_image_ref.clone(),
        image_hash: image_hash.to_string(),
        perceptual_hash: 0x0f0f_0f0f_0f0f_0f0f,
        gps: None,
        device_fingerprint: None,
        declared_total: None,
        status: match visit.status {
            VisitStatus::Approved => ReceiptStatus::Approved,
            VisitStatus::Pending => ReceiptStatus::Pending,
            _ => ReceiptStatus::Rejected,
        },
        fields: complete_fields(),
        raw_ocr_payload: None,
        confidences: None,
        fraud_flags: BTreeSet::new(),
        auto_approve_score: None,
        ocr_method: None,
        model_version: Some("receipt-vision-3".to_string()),
        predicted_data: Some(complete_fields()),
        corrected_data: None,
        points_awarded: None,
        points_synced_at: None,
        submitted_at: visit.submitted_at,
        reviewed_at: None,
    }
}

/// Collaborator mocks; unset ones accept any call and succeed
#[derive(Default)]
pub struct MockCollaborators {
    pub ledger: Option<MockPointsLedger>,
    pub favorites: Option<MockFavoritesService>,
    pub notifications: Option<MockNotificationDispatcher>,
    pub experiences: Option<MockExperienceService>,
    pub restaurants: Option<MockRestaurantDirectory>,
}

impl MockCollaborators {
    pub fn build(self) -> Collaborators {
        let ledger = self.ledger.unwrap_or_else(|| {
            let mut m = MockPointsLedger::new();
            m.expect_award().returning(|_, _, _| Ok(()));
            m
        });
        let favorites = self.favorites.unwrap_or_else(|| {
            let mut m = MockFavoritesService::new();
            m.expect_take_must_visit().returning(|_, _| Ok(false));
            m.expect_restore().returning(|_, _| Ok(()));
            m
        });
        let notifications = self.notifications.unwrap_or_else(|| {
            let mut m = MockNotificationDispatcher::new();
            m.expect_notify().returning(|_, _, _| Ok(()));
            m
        });
        let experiences = self.experiences.unwrap_or_else(|| {
            let mut m = MockExperienceService::new();
            m.expect_open_window().returning(|_, _, _, _| Ok(()));
            m
        });
        let restaurants = self.restaurants.unwrap_or_else(|| {
            let mut m = MockRestaurantDirectory::new();
            m.expect_resolve_oib().returning(|_| Ok(None));
            m.expect_location().returning(|_| Ok(None));
            m
        });

        Collaborators {
            ledger: Arc::new(ledger),
            favorites: Arc::new(favorites),
            notifications: Arc::new(notifications),
            experiences: Arc::new(experiences),
            restaurants: Arc::new(restaurants),
        }
    }
}

/// Ledger mock that records every award it receives
pub fn recording_ledger() -> (MockPointsLedger, Arc<std::sync::Mutex<HashMap<Uuid, i32>>>) {
    let awards = Arc::new(std::sync::Mutex::new(HashMap::new()));
    let sink = awards.clone();
    let mut ledger = MockPointsLedger::new();
    ledger.expect_award().returning(move |_, points, reference| {
        sink.lock().unwrap().insert(reference, points);
        Ok(())
    });
    (ledger, awards)
}
