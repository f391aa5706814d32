//! OCR extraction results and their normalised field values

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::enums::{OcrMethod, ReceiptField};

/// One field as read by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FieldReading {
    pub value: String,
    /// Provider-reported confidence in [0, 1]
    pub confidence: f64,
}

/// Typed result of one OCR call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub raw_text: String,
    pub fields: BTreeMap<ReceiptField, FieldReading>,
    pub method: OcrMethod,
    pub model_version: Option<String>,
}

impl ExtractionResult {
    pub fn reading(&self, field: ReceiptField) -> Option<&FieldReading> {
        self.fields.get(&field)
    }

    /// Provider confidence for a field, zero when the field was not found
    pub fn confidence(&self, field: ReceiptField) -> f64 {
        self.reading(field)
            .map(|r| r.confidence.clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }

    pub fn field_confidences(&self) -> BTreeMap<ReceiptField, f64> {
        self.fields
            .iter()
            .map(|(field, reading)| (*field, reading.confidence.clamp(0.0, 1.0)))
            .collect()
    }
}

/// Normalised receipt fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExtractedFields {
    pub merchant_name: Option<String>,
    pub total_amount: Option<Decimal>,
    pub issue_date: Option<NaiveDate>,
    #[schema(value_type = Option<String>, example = "19:42:00")]
    pub issue_time: Option<NaiveTime>,
    /// Unique invoice identifier issued by the tax authority
    pub jir: Option<String>,
    /// Issuer protection code
    pub zki: Option<String>,
    /// Issuer tax number
    pub oib: Option<String>,
}

impl ExtractedFields {
    /// Normalise provider readings; unparseable values are dropped.
    pub fn from_extraction(extraction: &ExtractionResult) -> Self {
        let text = |field| {
            extraction
                .reading(field)
                .map(|r| r.value.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            merchant_name: text(ReceiptField::MerchantName),
            total_amount: text(ReceiptField::TotalAmount).and_then(|v| parse_total(&v)),
            issue_date: text(ReceiptField::IssueDate).and_then(|v| parse_issue_date(&v)),
            issue_time: text(ReceiptField::IssueTime).and_then(|v| parse_issue_time(&v)),
            jir: text(ReceiptField::Jir).map(|v| v.to_lowercase()),
            zki: text(ReceiptField::Zki).map(|v| v.to_lowercase()),
            oib: text(ReceiptField::Oib),
        }
    }

    /// Required fields that are still missing
    pub fn missing_required(&self) -> Vec<ReceiptField> {
        ReceiptField::REQUIRED
            .into_iter()
            .filter(|field| !self.has(*field))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_required().is_empty()
    }

    fn has(&self, field: ReceiptField) -> bool {
        match field {
            ReceiptField::MerchantName => self.merchant_name.is_some(),
            ReceiptField::TotalAmount => self.total_amount.is_some(),
            ReceiptField::IssueDate => self.issue_date.is_some(),
            ReceiptField::IssueTime => self.issue_time.is_some(),
            ReceiptField::Jir => self.jir.is_some(),
            ReceiptField::Zki => self.zki.is_some(),
            ReceiptField::Oib => self.oib.is_some(),
        }
    }

    /// Overlay reviewer corrections; fields the reviewer left empty keep
    /// the extracted value.
    pub fn merged_with(&self, corrected: &ExtractedFields) -> ExtractedFields {
        ExtractedFields {
            merchant_name: corrected.merchant_name.clone().or_else(|| self.merchant_name.clone()),
            total_amount: corrected.total_amount.or(self.total_amount),
            issue_date: corrected.issue_date.or(self.issue_date),
            issue_time: corrected.issue_time.or(self.issue_time),
            jir: corrected.jir.clone().or_else(|| self.jir.clone()),
            zki: corrected.zki.clone().or_else(|| self.zki.clone()),
            oib: corrected.oib.clone().or_else(|| self.oib.clone()),
        }
    }
}

/// Parse a printed total such as `12,50`, `1.234,56 EUR` or `€ 1,234.56`.
pub fn parse_total(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    if cleaned.is_empty() || raw.trim_start().starts_with('-') {
        return None;
    }

    let normalised = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };

    Decimal::from_str(&normalised).ok()
}

/// Parse an issue date in ISO or Croatian (`15.03.2024.`) form.
pub fn parse_issue_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim().trim_end_matches('.');
    ["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y", "%d. %m. %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// Parse an issue time, with or without seconds.
pub fn parse_issue_time(raw: &str) -> Option<NaiveTime> {
    let trimmed = raw.trim();
    ["%H:%M:%S", "%H:%M"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(trimmed, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(value: &str) -> FieldReading {
        FieldReading {
            value: value.to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn test_parse_total_formats() {
        let expected = Decimal::new(123456, 2);
        assert_eq!(parse_total("1.234,56 EUR"), Some(expected));
        assert_eq!(parse_total("€ 1,234.56"), Some(expected));
        assert_eq!(parse_total("12,50"), Some(Decimal::new(1250, 2)));
        assert_eq!(parse_total("-3,00"), None);
        assert_eq!(parse_total("n/a"), None);
    }

    #[test]
    fn test_parse_dates_and_times() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_eq!(parse_issue_date("15.03.2024."), Some(date));
        assert_eq!(parse_issue_date("2024-03-15"), Some(date));
        assert_eq!(parse_issue_date("32.03.2024."), None);
        assert_eq!(parse_issue_time("19:42"), NaiveTime::from_hms_opt(19, 42, 0));
        assert_eq!(parse_issue_time("7pm"), None);
    }

    #[test]
    fn test_missing_required_and_merge() {
        let mut fields = BTreeMap::new();
        fields.insert(ReceiptField::TotalAmount, reading("18,40"));
        fields.insert(ReceiptField::Oib, reading("69435151530"));
        let extraction = ExtractionResult {
            raw_text: String::new(),
            fields,
            method: OcrMethod::Vision,
            model_version: None,
        };

        let extracted = ExtractedFields::from_extraction(&extraction);
        assert_eq!(
            extracted.missing_required(),
            vec![
                ReceiptField::Jir,
                ReceiptField::Zki,
                ReceiptField::IssueDate,
                ReceiptField::IssueTime
            ]
        );

        let corrected = ExtractedFields {
            total_amount: Some(Decimal::new(2000, 2)),
            jir: Some("x".into()),
            ..Default::default()
        };
        let merged = extracted.merged_with(&corrected);
        assert_eq!(merged.total_amount, Some(Decimal::new(2000, 2)));
        assert_eq!(merged.oib.as_deref(), Some("69435151530"));
        assert_eq!(merged.jir.as_deref(), Some("x"));
    }
}
