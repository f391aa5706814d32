//! Decision engine: turns computed signals into an automated outcome

use std::collections::BTreeSet;

use crate::{
    config::ScoringConfig,
    models::{enums::FlagSeverity, FraudFlag, ReceiptField, RejectionReason},
};

/// The three confidence signals, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreVector {
    pub vision: f64,
    pub parser: f64,
    pub consistency: f64,
}

/// Everything the engine looks at
#[derive(Debug, Clone)]
pub struct DecisionInput {
    pub scores: ScoreVector,
    pub fraud_flags: BTreeSet<FraudFlag>,
    pub missing_fields: Vec<ReceiptField>,
}

/// Why a receipt goes to a human
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewReason {
    IncompleteFields(Vec<ReceiptField>),
    /// The OCR provider never answered; not the submitter's fault
    ProviderUnavailable,
    /// The provider refused the image
    ProviderRejected,
    BetweenThresholds,
    HardBlock(Vec<FraudFlag>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    AutoApprove {
        score: f64,
    },
    ManualReview {
        score: Option<f64>,
        reason: ReviewReason,
    },
    AutoReject {
        score: Option<f64>,
        reason: RejectionReason,
    },
}

impl Decision {
    pub fn score(&self) -> Option<f64> {
        match self {
            Decision::AutoApprove { score } => Some(*score),
            Decision::ManualReview { score, .. } | Decision::AutoReject { score, .. } => *score,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::AutoApprove { .. } => "auto_approve",
            Decision::ManualReview { .. } => "manual_review",
            Decision::AutoReject { .. } => "auto_reject",
        }
    }
}

/// Pure function of its input and the scoring configuration
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    config: ScoringConfig,
}

impl DecisionEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// `w . scores - sum(penalties)`; not clamped
    pub fn auto_approve_score(&self, scores: &ScoreVector, flags: &BTreeSet<FraudFlag>) -> f64 {
        let w = &self.config.weights;
        let weighted =
            w.vision * scores.vision + w.parser * scores.parser + w.consistency * scores.consistency;
        let penalty: f64 = flags.iter().map(|f| self.config.penalty(*f)).sum();
        weighted - penalty
    }

    pub fn decide(&self, input: &DecisionInput) -> Decision {
        // Missing data goes to a human, never to auto-reject
        if !input.missing_fields.is_empty() {
            return Decision::ManualReview {
                score: None,
                reason: ReviewReason::IncompleteFields(input.missing_fields.clone()),
            };
        }

        if input.fraud_flags.contains(&FraudFlag::DuplicateExact) {
            return Decision::AutoReject {
                score: None,
                reason: RejectionReason::DuplicateReceipt,
            };
        }

        let score = self.auto_approve_score(&input.scores, &input.fraud_flags);
        let hard_blocks: Vec<FraudFlag> = input
            .fraud_flags
            .iter()
            .copied()
            .filter(|f| f.severity() == FlagSeverity::HardBlock)
            .collect();

        if score >= self.config.auto_approve_threshold {
            if hard_blocks.is_empty() {
                return Decision::AutoApprove { score };
            }
            return Decision::ManualReview {
                score: Some(score),
                reason: ReviewReason::HardBlock(hard_blocks),
            };
        }

        if score < self.config.auto_reject_threshold {
            return Decision::AutoReject {
                score: Some(score),
                reason: RejectionReason::LowConfidence,
            };
        }

        Decision::ManualReview {
            score: Some(score),
            reason: ReviewReason::BetweenThresholds,
        }
    }
}
