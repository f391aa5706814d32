//! Data models for the visit verifier

pub mod enums;
pub mod extraction;
pub mod receipt;
pub mod training;
pub mod user;
pub mod visit;

// Re-export commonly used types
pub use enums::{FraudFlag, OcrMethod, ReceiptField, ReceiptStatus, RejectionReason, VisitStatus};
pub use extraction::{ExtractedFields, ExtractionResult, FieldReading};
pub use receipt::{Confidences, GpsPoint, Receipt, ReceiptFingerprint, ReceiptReview, ReceiptSignals};
pub use training::TrainingSample;
pub use user::UserClaims;
pub use visit::{SubmitVisit, SubmittedVisit, Visit, VisitOutcome, VisitSummary};
