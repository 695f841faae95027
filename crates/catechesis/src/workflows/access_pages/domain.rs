use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::ids::{EnrollmentId, ProfileId};
use crate::workflows::enrollment::{Enrollment, EnrollmentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPurpose {
    /// Read-only enrollment summary for a guardian without an account session.
    Summary,
    /// Printable proof of a settled enrollment.
    Receipt,
}

impl AccessPurpose {
    pub const fn label(self) -> &'static str {
        match self {
            AccessPurpose::Summary => "summary",
            AccessPurpose::Receipt => "receipt",
        }
    }
}

impl fmt::Display for AccessPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AccessPurpose {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "summary" => Ok(AccessPurpose::Summary),
            "receipt" => Ok(AccessPurpose::Receipt),
            other => Err(PipelineError::validation(format!(
                "unknown access page purpose '{other}'"
            ))),
        }
    }
}

/// Temporary page held in the access-page store. It refers to an enrollment
/// in the enrollment store by id only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessPage {
    pub token: String,
    pub enrollment_id: EnrollmentId,
    pub purpose: AccessPurpose,
    pub issued_by: ProfileId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_viewed_at: Option<DateTime<Utc>>,
}

impl AccessPage {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueRequest {
    #[serde(default)]
    pub purpose: Option<AccessPurpose>,
}

/// What a page shows: a live read of the enrollment, never a copy.
#[derive(Debug, Clone, Serialize)]
pub struct PageSummary {
    pub number: Option<String>,
    pub year: i32,
    pub child_name: String,
    pub level: String,
    pub status: EnrollmentStatus,
    pub total_due: i64,
    pub amount_paid: i64,
    pub remaining_balance: i64,
}

impl From<&Enrollment> for PageSummary {
    fn from(enrollment: &Enrollment) -> Self {
        Self {
            number: enrollment.number.clone(),
            year: enrollment.year,
            child_name: enrollment.child_name(),
            level: enrollment.level.clone(),
            status: enrollment.status,
            total_due: enrollment.total_due,
            amount_paid: enrollment.amount_paid,
            remaining_balance: enrollment.remaining_balance(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessPageView {
    pub purpose: AccessPurpose,
    pub expires_at: DateTime<Utc>,
    pub enrollment: PageSummary,
}
