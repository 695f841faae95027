use chrono::Utc;
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::info;

use super::domain::EnrollmentStatus;
use super::lifecycle::{next_status, Balance};
use super::repository;
use crate::error::PipelineError;
use crate::ids::{EnrollmentId, ProfileId};
use crate::stores;

/// Outcome of re-deriving an enrollment's status inside a write transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub enrollment_id: EnrollmentId,
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub number: Option<String>,
    pub number_issued: bool,
    pub amount_paid: i64,
    pub remaining_balance: i64,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    pub fn activated(&self) -> bool {
        self.from != EnrollmentStatus::Active && self.to == EnrollmentStatus::Active
    }
}

pub fn format_number(prefix: &str, year: i32, sequence: i64) -> String {
    format!("{prefix}-{year}-{sequence:04}")
}

/// Recompute the paid total from validated payments, derive the status and
/// persist both on the caller's transaction. The enrollment number is issued
/// here, the first time the record leaves `draft`.
pub async fn reevaluate(
    conn: &mut SqliteConnection,
    id: EnrollmentId,
    prefix: &str,
    actor: Option<ProfileId>,
) -> Result<Transition, PipelineError> {
    let enrollment = repository::require(&mut *conn, id).await?;
    let paid = repository::validated_total(&mut *conn, id).await?;
    let balance = Balance::new(enrollment.total_due, paid)?;
    let documents = repository::document_requirements(&mut *conn, id).await?;

    let from = enrollment.status;
    let to = next_status(from, documents, balance);

    let mut number = enrollment.number.clone();
    let issue_number = number.is_none()
        && !matches!(to, EnrollmentStatus::Draft | EnrollmentStatus::Cancelled);
    if issue_number {
        let sequence = stores::next_sequence(&mut *conn, enrollment.year).await?;
        number = Some(format_number(prefix, enrollment.year, sequence));
    }

    let validated_by = match (from, to) {
        (previous, EnrollmentStatus::Active) if previous != EnrollmentStatus::Active => actor,
        _ => None,
    };

    if from != to || paid != enrollment.amount_paid || issue_number {
        sqlx::query(
            "UPDATE enrollments SET status = ?, number = ?, amount_paid = ?, \
             validated_by = COALESCE(?, validated_by), revision = revision + 1, updated_at = ? \
             WHERE id = ?",
        )
        .bind(to.label())
        .bind(number.as_deref())
        .bind(balance.amount_paid())
        .bind(validated_by.map(|profile| profile.to_string()))
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    }

    if from != to {
        info!(enrollment = %id, %from, %to, number = number.as_deref().unwrap_or("-"), "enrollment transitioned");
    }

    Ok(Transition {
        enrollment_id: id,
        from,
        to,
        number,
        number_issued: issue_number,
        amount_paid: balance.amount_paid(),
        remaining_balance: balance.remaining(),
    })
}
