//! Shared domain enums, stored as snake_case TEXT

use serde::{Deserialize, Serialize};
use sqlx::{Decode, Encode, Postgres};
use utoipa::ToSchema;

/// Implements string conversions and the Postgres TEXT mapping for a
/// fieldless enum.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($name), s)),
                }
            }
        }

        impl sqlx::Type<Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <String as sqlx::Type<Postgres>>::type_info()
            }
        }

        impl<'r> Decode<'r, Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s: String = Decode::<Postgres>::decode(value)?;
                s.parse().map_err(|e: String| e.into())
            }
        }

        impl Encode<'_, Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> sqlx::encode::IsNull {
                <String as Encode<Postgres>>::encode(self.as_str().to_string(), buf)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// VisitStatus
// ---------------------------------------------------------------------------

/// Visit lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    Pending,
    Approved,
    Rejected,
    RetakeNeeded,
}

text_enum!(VisitStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    RetakeNeeded => "retake_needed",
});

// ---------------------------------------------------------------------------
// ReceiptStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Approved,
    Rejected,
}

text_enum!(ReceiptStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

// ---------------------------------------------------------------------------
// FraudFlag
// ---------------------------------------------------------------------------

/// Whether a flag blocks automatic approval outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagSeverity {
    HardBlock,
    Soft,
}

/// Fraud and integrity signals attached to a receipt
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum FraudFlag {
    /// Byte-identical image already submitted
    DuplicateExact,
    /// Perceptually close to an earlier image
    DuplicateSimilar,
    /// Too many receipts from one device or spot
    VelocityAnomaly,
    /// A fiscalization identifier failed its checksum
    InvalidFiscalId,
}

text_enum!(FraudFlag {
    DuplicateExact => "duplicate_exact",
    DuplicateSimilar => "duplicate_similar",
    VelocityAnomaly => "velocity_anomaly",
    InvalidFiscalId => "invalid_fiscal_id",
});

impl FraudFlag {
    pub fn severity(&self) -> FlagSeverity {
        match self {
            FraudFlag::DuplicateExact => FlagSeverity::HardBlock,
            FraudFlag::DuplicateSimilar => FlagSeverity::Soft,
            FraudFlag::VelocityAnomaly => FlagSeverity::Soft,
            FraudFlag::InvalidFiscalId => FlagSeverity::Soft,
        }
    }
}

// ---------------------------------------------------------------------------
// OcrMethod
// ---------------------------------------------------------------------------

/// How the provider produced the extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OcrMethod {
    Vision,
    LlmAssisted,
    Hybrid,
}

text_enum!(OcrMethod {
    Vision => "vision",
    LlmAssisted => "llm_assisted",
    Hybrid => "hybrid",
});

// ---------------------------------------------------------------------------
// RejectionReason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    DuplicateReceipt,
    LowConfidence,
    Unreadable,
    WrongRestaurant,
    ReceiptTooOld,
    Other,
}

text_enum!(RejectionReason {
    DuplicateReceipt => "duplicate_receipt",
    LowConfidence => "low_confidence",
    Unreadable => "unreadable",
    WrongRestaurant => "wrong_restaurant",
    ReceiptTooOld => "receipt_too_old",
    Other => "other",
});

// ---------------------------------------------------------------------------
// ReceiptField
// ---------------------------------------------------------------------------

/// Fields the OCR provider is asked to extract
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptField {
    MerchantName,
    TotalAmount,
    IssueDate,
    IssueTime,
    Jir,
    Zki,
    Oib,
}

text_enum!(ReceiptField {
    MerchantName => "merchant_name",
    TotalAmount => "total_amount",
    IssueDate => "issue_date",
    IssueTime => "issue_time",
    Jir => "jir",
    Zki => "zki",
    Oib => "oib",
});

impl ReceiptField {
    /// Fields that must be present before a receipt can be approved
    pub const REQUIRED: [ReceiptField; 6] = [
        ReceiptField::TotalAmount,
        ReceiptField::Jir,
        ReceiptField::Zki,
        ReceiptField::Oib,
        ReceiptField::IssueDate,
        ReceiptField::IssueTime,
    ];
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Caller role carried in the auth token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

// ---------------------------------------------------------------------------
// NotificationEvent
// ---------------------------------------------------------------------------

/// Terminal transitions pushed to the notification dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    VisitApproved,
    VisitRejected,
    RetakeRequested,
}
