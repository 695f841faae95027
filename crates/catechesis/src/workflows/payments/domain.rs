use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;
use crate::extraction::templates::parse_amount;
use crate::extraction::MobileMoneyProvider;
use crate::ids::{DocumentId, EnrollmentId, PaymentId, ProfileId};
use crate::workflows::documents::{Document, ExtractionStatus};
use crate::workflows::enrollment::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Wave,
    OrangeMoney,
    FreeMoney,
    /// Pre-printed parish receipt book.
    PrintedReceipt,
}

impl PaymentMethod {
    pub const fn label(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Wave => "wave",
            PaymentMethod::OrangeMoney => "orange_money",
            PaymentMethod::FreeMoney => "free_money",
            PaymentMethod::PrintedReceipt => "printed_receipt",
        }
    }

    pub const fn provider(self) -> Option<MobileMoneyProvider> {
        match self {
            PaymentMethod::Wave => Some(MobileMoneyProvider::Wave),
            PaymentMethod::OrangeMoney => Some(MobileMoneyProvider::OrangeMoney),
            PaymentMethod::FreeMoney => Some(MobileMoneyProvider::FreeMoney),
            PaymentMethod::Cash | PaymentMethod::PrintedReceipt => None,
        }
    }

    pub const fn is_mobile_money(self) -> bool {
        self.provider().is_some()
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PaymentMethod {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "wave" => Ok(PaymentMethod::Wave),
            "orange_money" | "om" => Ok(PaymentMethod::OrangeMoney),
            "free_money" => Ok(PaymentMethod::FreeMoney),
            "printed_receipt" | "receipt" => Ok(PaymentMethod::PrintedReceipt),
            other => Err(PipelineError::validation(format!(
                "unknown payment method '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    PendingReview,
    Validated,
    Rejected,
}

impl PaymentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            PaymentStatus::PendingReview => "pending_review",
            PaymentStatus::Validated => "validated",
            PaymentStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PaymentStatus {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending_review" => Ok(PaymentStatus::PendingReview),
            "validated" => Ok(PaymentStatus::Validated),
            "rejected" => Ok(PaymentStatus::Rejected),
            other => Err(PipelineError::validation(format!(
                "unknown payment status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: PaymentId,
    pub enrollment_id: EnrollmentId,
    /// Unknown until the reviewer reads it off an unclear proof.
    pub amount: Option<i64>,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub proof_document_id: Option<DocumentId>,
    pub status: PaymentStatus,
    pub reviewer_id: Option<ProfileId>,
    pub rejection_reason: Option<String>,
    pub provider_metadata: Option<Value>,
    pub submitted_by: ProfileId,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPayment {
    #[serde(default)]
    pub amount: Option<i64>,
    pub method: PaymentMethod,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub proof_document_id: Option<DocumentId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub payment_id: PaymentId,
    pub enrollment_id: EnrollmentId,
    pub status: PaymentStatus,
}

/// Reviewer input at validation. The amount overrides the submitted one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidateRequest {
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub payment: Payment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<Transition>,
}

/// Review queue filter. Dates bound the submission day, both inclusive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueFilter {
    #[serde(default)]
    pub status: Option<PaymentStatus>,
    #[serde(default)]
    pub method: Option<PaymentMethod>,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

impl QueueFilter {
    pub fn status(&self) -> PaymentStatus {
        self.status.unwrap_or(PaymentStatus::PendingReview)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        match (self.from, self.to) {
            (Some(from), Some(to)) if from > to => Err(PipelineError::validation(format!(
                "date range is empty: {from} is after {to}"
            ))),
            _ => Ok(()),
        }
    }
}

/// What the proof extraction suggests to the reviewer. Never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvisoryProof {
    pub document_id: DocumentId,
    pub extraction_status: ExtractionStatus,
    pub confidence: Option<f32>,
    pub requires_manual_check: bool,
    pub provider: Option<String>,
    pub transaction_id: Option<String>,
    /// Withheld when the extraction is below the auto-fill threshold.
    pub amount: Option<i64>,
    pub timestamp: Option<String>,
}

impl AdvisoryProof {
    pub fn from_document(document: &Document, threshold: f32) -> Self {
        let extracted = |name: &str| {
            document
                .fields
                .as_ref()
                .and_then(|fields| fields.get(name).cloned().flatten())
        };
        let confirmed = |name: &str| {
            document
                .confirmed_fields
                .as_ref()
                .and_then(|fields| fields.get(name).cloned())
        };
        let trusted = document
            .confidence
            .map(|confidence| confidence >= threshold)
            .unwrap_or(false);

        let amount = confirmed("amount")
            .or_else(|| extracted("amount").filter(|_| trusted))
            .and_then(|raw| parse_amount(&raw));

        Self {
            document_id: document.id,
            extraction_status: document.extraction_status,
            confidence: document.confidence,
            requires_manual_check: document.requires_manual_check,
            provider: confirmed("provider").or_else(|| extracted("provider")),
            transaction_id: confirmed("transaction_id").or_else(|| extracted("transaction_id")),
            amount,
            timestamp: confirmed("timestamp").or_else(|| extracted("timestamp")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub payment: Payment,
    pub enrollment_number: Option<String>,
    pub child_name: String,
    pub remaining_balance: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisory: Option<AdvisoryProof>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::DocumentKind;
    use crate::workflows::documents::DocumentFormat;
    use std::collections::BTreeMap;

    fn proof(confidence: f32, amount: &str) -> Document {
        let now = Utc::now();
        Document {
            id: DocumentId::generate(),
            enrollment_id: EnrollmentId::generate(),
            kind: DocumentKind::PaymentProof,
            storage_key: None,
            format: DocumentFormat::Png,
            size_bytes: 2048,
            extraction_status: ExtractionStatus::Succeeded,
            fields: Some(BTreeMap::from([
                ("amount".to_string(), Some(amount.to_string())),
                ("transaction_id".to_string(), Some("WV240311.1532.A81".to_string())),
                ("provider".to_string(), Some("wave".to_string())),
            ])),
            confirmed_fields: None,
            confidence: Some(confidence),
            requires_manual_check: confidence < 0.7,
            error_detail: None,
            confirmed: false,
            confirmed_by: None,
            confirmed_at: None,
            uploaded_by: ProfileId::generate(),
            created_at: now,
            updated_at: now,
            purged_at: None,
        }
    }

    #[test]
    fn blurry_proofs_withhold_the_amount() {
        let advisory = AdvisoryProof::from_document(&proof(0.40, "15 000 FCFA"), 0.70);
        assert_eq!(advisory.amount, None);
        assert!(advisory.requires_manual_check);
        assert_eq!(advisory.transaction_id.as_deref(), Some("WV240311.1532.A81"));
    }

    #[test]
    fn clear_proofs_suggest_the_amount() {
        let advisory = AdvisoryProof::from_document(&proof(0.91, "15 000 FCFA"), 0.70);
        assert_eq!(advisory.amount, Some(15_000));
        assert_eq!(advisory.provider.as_deref(), Some("wave"));
    }

    #[test]
    fn methods_parse_loosely() {
        assert_eq!("Orange Money".parse::<PaymentMethod>().expect("om"), PaymentMethod::OrangeMoney);
        assert_eq!("receipt".parse::<PaymentMethod>().expect("receipt"), PaymentMethod::PrintedReceipt);
        assert!(PaymentMethod::Wave.is_mobile_money());
        assert!(!PaymentMethod::Cash.is_mobile_money());
        assert!("cheque".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn inverted_date_ranges_are_rejected() {
        let filter = QueueFilter {
            from: NaiveDate::from_ymd_opt(2025, 3, 10),
            to: NaiveDate::from_ymd_opt(2025, 3, 1),
            ..QueueFilter::default()
        };
        assert!(filter.validate().is_err());
        assert_eq!(filter.status(), PaymentStatus::PendingReview);
    }
}
