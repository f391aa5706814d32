//! Visit model and the user-facing outcome types

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::enums::{RejectionReason, VisitStatus};
use super::receipt::GpsPoint;

/// Visit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Visit {
    pub id: Uuid,
    pub user_id: Uuid,
    pub restaurant_id: Uuid,
    pub receipt_image_ref: String,
    pub status: VisitStatus,
    /// Snapshot taken at creation, never updated
    pub was_in_must_visit: bool,
    pub visit_date: Option<NaiveDate>,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    /// None when the decision was automated
    pub reviewed_by: Option<Uuid>,
    pub rejection_reason: Option<RejectionReason>,
    /// Only while RETAKE_NEEDED
    pub retake_deadline: Option<DateTime<Utc>>,
    /// Only while APPROVED
    pub experience_deadline: Option<DateTime<Utc>>,
    pub tagged_buddies: Vec<Uuid>,
    /// Visit this one replaced through a retake
    pub retake_of: Option<Uuid>,
    pub experience_id: Option<Uuid>,
    pub experience_lapsed_at: Option<DateTime<Utc>>,
}

/// Metadata sent alongside the receipt photo
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct SubmitVisit {
    pub restaurant_id: Uuid,
    /// Total the user typed in, if any
    pub declared_total: Option<Decimal>,
    #[validate(nested)]
    pub gps: Option<GpsPoint>,
    #[validate(length(min = 8, max = 256, message = "Invalid device fingerprint"))]
    pub device_fingerprint: Option<String>,
    #[validate(length(max = 10, message = "Too many tagged buddies"))]
    #[serde(default)]
    pub tagged_buddies: Vec<Uuid>,
}

/// What the submitter is told; scores and flags are never included
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VisitOutcome {
    Approved {
        points: i32,
        experience_deadline: DateTime<Utc>,
    },
    PendingReview,
    Rejected {
        reason: RejectionReason,
    },
    RetakeRequested {
        reason: RejectionReason,
        deadline: DateTime<Utc>,
    },
}

/// Response to a submission
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SubmittedVisit {
    pub visit_id: Uuid,
    pub outcome: VisitOutcome,
}

/// Visit as shown to its owner
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VisitSummary {
    pub id: Uuid,
    pub restaurant_id: Uuid,
    pub visit_date: Option<NaiveDate>,
    pub submitted_at: DateTime<Utc>,
    pub outcome: VisitOutcome,
    pub experience_id: Option<Uuid>,
}

impl Visit {
    /// Project the visit onto the outcome its owner may see.
    pub fn outcome(&self, points_awarded: Option<i32>) -> VisitOutcome {
        let reason = self.rejection_reason.unwrap_or(RejectionReason::Other);
        match (self.status, self.experience_deadline, self.retake_deadline) {
            (VisitStatus::Approved, Some(experience_deadline), _) => VisitOutcome::Approved {
                points: points_awarded.unwrap_or(0),
                experience_deadline,
            },
            (VisitStatus::RetakeNeeded, _, Some(deadline)) => {
                VisitOutcome::RetakeRequested { reason, deadline }
            }
            (VisitStatus::Rejected, _, _) => VisitOutcome::Rejected { reason },
            _ => VisitOutcome::PendingReview,
        }
    }

    pub fn summary(&self, points_awarded: Option<i32>) -> VisitSummary {
        VisitSummary {
            id: self.id,
            restaurant_id: self.restaurant_id,
            visit_date: self.visit_date,
            submitted_at: self.submitted_at,
            outcome: self.outcome(points_awarded),
            experience_id: self.experience_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn visit(status: VisitStatus) -> Visit {
        Visit {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            restaurant_id: Uuid::new_v4(),
            receipt_image_ref: "ab/abcdef".to_string(),
            status,
            was_in_must_visit: false,
            visit_date: None,
            submitted_at: Utc::now(),
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

    #[test]
    fn test_outcome_projection() {
        assert_eq!(visit(VisitStatus::Pending).outcome(None), VisitOutcome::PendingReview);

        let deadline = Utc::now() + Duration::hours(48);
        let mut retake = visit(VisitStatus::RetakeNeeded);
        retake.rejection_reason = Some(RejectionReason::LowConfidence);
        retake.retake_deadline = Some(deadline);
        assert_eq!(
            retake.outcome(None),
            VisitOutcome::RetakeRequested {
                reason: RejectionReason::LowConfidence,
                deadline
            }
        );
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(VisitOutcome::Rejected {
            reason: RejectionReason::DuplicateReceipt,
        })
        .unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "duplicate_receipt");
    }
}
