use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::extraction::templates::fold;
use crate::extraction::DocumentKind;
use crate::ids::{ClassId, DocumentId, EnrollmentId, ProfileId};

/// Lifecycle of one child's registration for a catechetical year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Draft,
    AwaitingPayment,
    PartiallyPaid,
    Active,
    Cancelled,
}

impl EnrollmentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            EnrollmentStatus::Draft => "draft",
            EnrollmentStatus::AwaitingPayment => "awaiting_payment",
            EnrollmentStatus::PartiallyPaid => "partially_paid",
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Cancelled => "cancelled",
        }
    }

    /// `active` and `cancelled` hold for the rest of the season.
    pub fn is_terminal(self) -> bool {
        matches!(self, EnrollmentStatus::Active | EnrollmentStatus::Cancelled)
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EnrollmentStatus {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(EnrollmentStatus::Draft),
            "awaiting_payment" => Ok(EnrollmentStatus::AwaitingPayment),
            "partially_paid" => Ok(EnrollmentStatus::PartiallyPaid),
            "active" => Ok(EnrollmentStatus::Active),
            "cancelled" => Ok(EnrollmentStatus::Cancelled),
            other => Err(PipelineError::Store(format!(
                "unknown enrollment status '{other}'"
            ))),
        }
    }
}

/// Comparison key for duplicate detection: accent-folded, lowercase, with
/// hyphens, apostrophes and repeated spaces collapsed.
pub fn normalize_name(raw: &str) -> String {
    fold(raw)
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub number: Option<String>,
    pub year: i32,
    pub guardian_id: ProfileId,
    pub last_name: String,
    pub first_name: String,
    pub birth_date: NaiveDate,
    pub birth_place: Option<String>,
    pub baptism_date: Option<NaiveDate>,
    pub baptism_parish: Option<String>,
    pub baptism_officiant: Option<String>,
    pub origin_parish: Option<String>,
    pub prior_year: Option<String>,
    pub level: String,
    pub class_id: Option<ClassId>,
    pub status: EnrollmentStatus,
    pub total_due: i64,
    pub amount_paid: i64,
    pub revision: i64,
    pub created_by: ProfileId,
    pub validated_by: Option<ProfileId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn remaining_balance(&self) -> i64 {
        self.total_due - self.amount_paid
    }

    pub fn child_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Intake request. Guardians create for themselves; staff name the guardian.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEnrollment {
    #[serde(default)]
    pub guardian_id: Option<ProfileId>,
    pub year: i32,
    pub last_name: String,
    pub first_name: String,
    pub birth_date: NaiveDate,
    #[serde(default)]
    pub birth_place: Option<String>,
    pub level: String,
    pub total_due: i64,
    /// Staff override for a legitimate homonym of an existing enrollment.
    #[serde(default)]
    pub allow_homonym: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkRequest {
    #[serde(default)]
    pub guardian_id: Option<ProfileId>,
    pub last_name: String,
    pub first_name: String,
    pub birth_date: NaiveDate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrefillQuery {
    pub last_name: String,
    pub first_name: String,
    pub birth_date: NaiveDate,
    pub year: i32,
}

/// Fields carried over from the child's most recent earlier enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prefill {
    pub source_enrollment: EnrollmentId,
    pub source_year: i32,
    pub last_name: String,
    pub first_name: String,
    pub birth_date: NaiveDate,
    pub birth_place: Option<String>,
    pub baptism_date: Option<NaiveDate>,
    pub baptism_parish: Option<String>,
    pub baptism_officiant: Option<String>,
    pub previous_level: String,
    pub guardians: Vec<ProfileId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub kind: DocumentKind,
    pub extraction_status: String,
    pub confirmed: bool,
}

/// Read model returned to guardians and staff.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentView {
    pub id: EnrollmentId,
    pub number: Option<String>,
    pub year: i32,
    pub status: EnrollmentStatus,
    pub child_name: String,
    pub birth_date: NaiveDate,
    pub level: String,
    pub class_id: Option<ClassId>,
    pub total_due: i64,
    pub amount_paid: i64,
    pub remaining_balance: i64,
    pub guardians: Vec<ProfileId>,
    pub documents: Vec<DocumentSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefilled_from: Option<EnrollmentId>,
}

impl EnrollmentView {
    pub fn new(
        enrollment: Enrollment,
        guardians: Vec<ProfileId>,
        documents: Vec<DocumentSummary>,
    ) -> Self {
        Self {
            id: enrollment.id,
            child_name: enrollment.child_name(),
            remaining_balance: enrollment.remaining_balance(),
            number: enrollment.number,
            year: enrollment.year,
            status: enrollment.status,
            birth_date: enrollment.birth_date,
            level: enrollment.level,
            class_id: enrollment.class_id,
            total_due: enrollment.total_due,
            amount_paid: enrollment.amount_paid,
            guardians,
            documents,
            prefilled_from: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Class {
    pub id: ClassId,
    pub year: i32,
    pub level: String,
    pub label: String,
    pub capacity: i64,
    pub occupancy: i64,
    pub instructors: Vec<ProfileId>,
}

impl Class {
    pub fn seats_left(&self) -> i64 {
        self.capacity - self.occupancy
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewClass {
    pub year: i32,
    pub level: String,
    pub label: String,
    pub capacity: i64,
    #[serde(default)]
    pub instructors: Vec<ProfileId>,
}
