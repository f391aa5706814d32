//! Confidence scoring of an extraction: vision, parser and consistency signals

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use uuid::Uuid;

use crate::{
    config::ScoringConfig,
    models::{
        extraction::{parse_issue_date, parse_issue_time},
        Confidences, ExtractedFields, ExtractionResult, FraudFlag, GpsPoint, ReceiptField,
    },
};

static JIR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
});
static ZKI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?i)[0-9a-f]{32}$").unwrap());

/// OIB check digit, ISO 7064 MOD 11,10
pub fn is_valid_oib(oib: &str) -> bool {
    let digits: Vec<u32> = oib.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 11 || oib.len() != 11 {
        return false;
    }

    let mut acc = 10;
    for digit in &digits[..10] {
        acc = (acc + digit) % 10;
        if acc == 0 {
            acc = 10;
        }
        acc = (acc * 2) % 11;
    }
    let check = match 11 - acc {
        10 => 0,
        c => c,
    };
    check == digits[10]
}

pub fn is_valid_jir(jir: &str) -> bool {
    JIR_RE.is_match(jir.trim())
}

pub fn is_valid_zki(zki: &str) -> bool {
    ZKI_RE.is_match(zki.trim())
}

/// Structural problems found while scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParserFinding {
    InvalidOibChecksum,
    MalformedJir,
    MalformedZki,
    UnparseableDate,
    FutureIssueDate,
    UnparseableTime,
}

/// Facts about the submission the extraction is checked against
#[derive(Debug, Clone)]
pub struct ScoringContext {
    /// Restaurant the user claims to have visited
    pub claimed_restaurant_id: Uuid,
    /// Restaurant the directory resolved the OIB to, if any
    pub resolved_restaurant_id: Option<Uuid>,
    pub restaurant_location: Option<GpsPoint>,
    pub declared_total: Option<Decimal>,
    pub gps: Option<GpsPoint>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreReport {
    pub vision: f64,
    pub parser: f64,
    pub consistency: f64,
    pub field_confidences: BTreeMap<ReceiptField, f64>,
    pub findings: BTreeSet<ParserFinding>,
}

impl ScoreReport {
    pub fn confidences(&self) -> Confidences {
        Confidences {
            vision: self.vision,
            parser: self.parser,
            consistency: self.consistency,
            fields: self.field_confidences.clone(),
        }
    }

    /// Fraud flags implied by parser findings
    pub fn flags(&self) -> BTreeSet<FraudFlag> {
        let mut flags = BTreeSet::new();
        if self.findings.contains(&ParserFinding::InvalidOibChecksum) {
            flags.insert(FraudFlag::InvalidFiscalId);
        }
        flags
    }
}

/// Pure scorer; every sub-check lies in [0, 1] and checks without data are
/// left out of their mean.
#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    config: ScoringConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn score(
        &self,
        extraction: &ExtractionResult,
        fields: &ExtractedFields,
        ctx: &ScoringContext,
    ) -> ScoreReport {
        let (parser, findings) = self.parser_confidence(extraction, ctx.now);
        ScoreReport {
            vision: self.vision_confidence(extraction),
            parser,
            consistency: self.consistency_score(fields, ctx),
            field_confidences: extraction.field_confidences(),
            findings,
        }
    }

    /// Weighted mean of provider confidences over the required fields; a
    /// missing field counts as zero confidence.
    pub fn vision_confidence(&self, extraction: &ExtractionResult) -> f64 {
        let w = &self.config.vision_field_weights;
        let weighted = [
            (ReceiptField::TotalAmount, w.total_amount),
            (ReceiptField::IssueDate, w.issue_date),
            (ReceiptField::Jir, w.jir),
            (ReceiptField::Zki, w.zki),
            (ReceiptField::Oib, w.oib),
        ];

        let total_weight: f64 = weighted.iter().map(|(_, w)| w.max(0.0)).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        let sum: f64 = weighted
            .iter()
            .map(|(field, w)| extraction.confidence(*field) * w.max(0.0))
            .sum();
        (sum / total_weight).clamp(0.0, 1.0)
    }

    /// Structural validity of the fiscal identifiers and the date/time
    pub fn parser_confidence(
        &self,
        extraction: &ExtractionResult,
        now: DateTime<Utc>,
    ) -> (f64, BTreeSet<ParserFinding>) {
        let raw = |field| {
            extraction
                .reading(field)
                .map(|r| r.value.trim())
                .filter(|v| !v.is_empty())
        };

        let mut checks = Vec::new();
        let mut findings = BTreeSet::new();
        let mut check = |passed: bool, finding: ParserFinding| {
            checks.push(if passed { 1.0 } else { 0.0 });
            if !passed {
                findings.insert(finding);
            }
        };

        if let Some(oib) = raw(ReceiptField::Oib) {
            check(is_valid_oib(oib), ParserFinding::InvalidOibChecksum);
        }
        if let Some(jir) = raw(ReceiptField::Jir) {
            check(is_valid_jir(jir), ParserFinding::MalformedJir);
        }
        if let Some(zki) = raw(ReceiptField::Zki) {
            check(is_valid_zki(zki), ParserFinding::MalformedZki);
        }
        if let Some(date) = raw(ReceiptField::IssueDate) {
            match parse_issue_date(date) {
                // Receipts carry local dates; allow one day of clock skew
                Some(d) => check(
                    d <= (now + Duration::days(1)).date_naive(),
                    ParserFinding::FutureIssueDate,
                ),
                None => check(false, ParserFinding::UnparseableDate),
            }
        }
        if let Some(time) = raw(ReceiptField::IssueTime) {
            check(parse_issue_time(time).is_some(), ParserFinding::UnparseableTime);
        }

        (mean(&checks).unwrap_or(0.0), findings)
    }

    /// Agreement of the extraction with what the submission says
    pub fn consistency_score(&self, fields: &ExtractedFields, ctx: &ScoringContext) -> f64 {
        let mut checks = Vec::new();

        if let (Some(declared), Some(extracted)) = (ctx.declared_total, fields.total_amount) {
            checks.push(self.total_agreement(declared, extracted));
        }

        if let Some(issued) = fields.issue_date {
            let age_days = (ctx.now.date_naive() - issued).num_days();
            let plausible = (-1..=self.config.max_receipt_age_days).contains(&age_days);
            checks.push(if plausible { 1.0 } else { 0.0 });
        }

        if let (Some(gps), Some(location)) = (ctx.gps, ctx.restaurant_location) {
            checks.push(self.proximity(&gps, &location));
        }

        if fields.oib.is_some() {
            checks.push(match ctx.resolved_restaurant_id {
                Some(id) if id == ctx.claimed_restaurant_id => 1.0,
                Some(_) => 0.0,
                None => self.config.unresolved_restaurant_score,
            });
        }

        mean(&checks).unwrap_or(self.config.no_evidence_score)
    }

    /// 1.0 inside the tolerance band, falling linearly to 0 at five times it
    fn total_agreement(&self, declared: Decimal, extracted: Decimal) -> f64 {
        let (Some(declared), Some(extracted)) = (declared.to_f64(), extracted.to_f64()) else {
            return 0.0;
        };
        let base = extracted.abs().max(declared.abs());
        if base == 0.0 {
            return 1.0;
        }

        let relative = (declared - extracted).abs() / base;
        let tolerance = self.config.total_tolerance.max(f64::EPSILON);
        if relative <= tolerance {
            1.0
        } else {
            (1.0 - (relative - tolerance) / (4.0 * tolerance)).clamp(0.0, 1.0)
        }
    }

    /// 1.0 within the radius (less reported accuracy), 0 beyond three radii
    fn proximity(&self, gps: &GpsPoint, location: &GpsPoint) -> f64 {
        let radius = self.config.gps_radius_m.max(1.0);
        let distance = (gps.distance_m(location) - gps.accuracy_m.unwrap_or(0.0)).max(0.0);
        if distance <= radius {
            1.0
        } else {
            (1.0 - (distance - radius) / (2.0 * radius)).clamp(0.0, 1.0)
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some((values.iter().sum::<f64>() / values.len() as f64).clamp(0.0, 1.0))
    }
}
