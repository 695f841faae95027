use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::extraction::templates::{parse_amount, parse_date, template_fields};
use crate::extraction::DocumentKind;
use crate::ids::{DocumentId, EnrollmentId, ProfileId};
use crate::objects::SignedReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Fields were entered or confirmed without a usable extraction.
    Manual,
}

impl ExtractionStatus {
    pub const fn label(self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::Running => "running",
            ExtractionStatus::Succeeded => "succeeded",
            ExtractionStatus::Failed => "failed",
            ExtractionStatus::Manual => "manual",
        }
    }

    pub fn is_settled(self) -> bool {
        !matches!(self, ExtractionStatus::Pending | ExtractionStatus::Running)
    }
}

impl fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ExtractionStatus {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ExtractionStatus::Pending),
            "running" => Ok(ExtractionStatus::Running),
            "succeeded" => Ok(ExtractionStatus::Succeeded),
            "failed" => Ok(ExtractionStatus::Failed),
            "manual" => Ok(ExtractionStatus::Manual),
            other => Err(PipelineError::Store(format!(
                "unknown extraction status '{other}'"
            ))),
        }
    }
}

/// Accepted upload formats, recognized by their leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Jpeg,
    Png,
}

impl DocumentFormat {
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF-") {
            Some(DocumentFormat::Pdf)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(DocumentFormat::Jpeg)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(DocumentFormat::Png)
        } else {
            None
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Jpeg => "jpeg",
            DocumentFormat::Png => "png",
        }
    }

    pub const fn extension(self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Jpeg => "jpg",
            DocumentFormat::Png => "png",
        }
    }

    pub fn mime(self) -> mime::Mime {
        match self {
            DocumentFormat::Pdf => mime::APPLICATION_PDF,
            DocumentFormat::Jpeg => mime::IMAGE_JPEG,
            DocumentFormat::Png => mime::IMAGE_PNG,
        }
    }
}

impl FromStr for DocumentFormat {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pdf" => Ok(DocumentFormat::Pdf),
            "jpeg" => Ok(DocumentFormat::Jpeg),
            "png" => Ok(DocumentFormat::Png),
            other => Err(PipelineError::Store(format!("unknown document format '{other}'"))),
        }
    }
}

/// Size and format checks applied before anything is written.
pub fn inspect_upload(bytes: &[u8], max_bytes: usize) -> Result<DocumentFormat, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::validation("invalid document: empty upload"));
    }
    if bytes.len() > max_bytes {
        return Err(PipelineError::validation(format!(
            "invalid document: {} bytes exceeds the {max_bytes} byte limit",
            bytes.len()
        )));
    }
    DocumentFormat::sniff(bytes).ok_or_else(|| {
        PipelineError::validation("invalid document: only PDF, JPEG and PNG files are accepted")
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: DocumentId,
    pub enrollment_id: EnrollmentId,
    pub kind: DocumentKind,
    #[serde(skip)]
    pub storage_key: Option<String>,
    pub format: DocumentFormat,
    pub size_bytes: i64,
    pub extraction_status: ExtractionStatus,
    /// Candidates read by extraction; `None` values could not be read.
    pub fields: Option<BTreeMap<String, Option<String>>>,
    pub confirmed_fields: Option<BTreeMap<String, String>>,
    pub confidence: Option<f32>,
    pub requires_manual_check: bool,
    pub error_detail: Option<String>,
    /// Set once the guardian (or staff) confirmed the field set.
    pub confirmed: bool,
    pub confirmed_by: Option<ProfileId>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub uploaded_by: ProfileId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub purged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    #[serde(flatten)]
    pub document: Document,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_reference: Option<SignedReference>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub document_id: DocumentId,
    pub enrollment_id: EnrollmentId,
    pub kind: DocumentKind,
    pub extraction_status: ExtractionStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmRequest {
    pub fields: BTreeMap<String, String>,
}

/// Check a confirmed field set against the kind's template. Dates come back in
/// ISO form and amounts as whole numbers.
pub fn normalize_confirmed(
    kind: DocumentKind,
    fields: BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, PipelineError> {
    let mut allowed: Vec<&str> = template_fields(kind).collect();
    if kind == DocumentKind::PaymentProof {
        allowed.push("provider");
    }

    let mut normalized = BTreeMap::new();
    for (name, value) in fields {
        if !allowed.contains(&name.as_str()) {
            return Err(PipelineError::validation(format!(
                "field '{name}' does not belong to a {kind}"
            )));
        }
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let value = if name.ends_with("_date") {
            parse_date(value)
                .ok_or_else(|| PipelineError::validation(format!("'{value}' is not a date for {name}")))?
                .to_string()
        } else if name == "amount" {
            parse_amount(value)
                .ok_or_else(|| PipelineError::validation(format!("'{value}' is not an amount")))?
                .to_string()
        } else {
            value.to_string()
        };
        normalized.insert(name, value);
    }

    let missing: Vec<&str> = kind
        .required_fields()
        .iter()
        .copied()
        .filter(|field| !normalized.contains_key(*field))
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }
    Ok(normalized)
}
