//! SQL access to payments in the enrollment store.

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde_json::Value;
use sqlx::{Executor, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::domain::{Payment, PaymentMethod, PaymentStatus, QueueFilter};
use crate::error::PipelineError;
use crate::ids::{parse_optional, parse_stored, DocumentId, EnrollmentId, PaymentId, ProfileId};

const PAYMENT_COLUMNS: &str = "id, enrollment_id, amount, method, reference, proof_document_id, \
    status, reviewer_id, rejection_reason, provider_metadata, submitted_by, submitted_at, \
    reviewed_at";

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: String,
    enrollment_id: String,
    amount: Option<i64>,
    method: String,
    reference: Option<String>,
    proof_document_id: Option<String>,
    status: String,
    reviewer_id: Option<String>,
    rejection_reason: Option<String>,
    provider_metadata: Option<String>,
    submitted_by: String,
    submitted_at: DateTime<Utc>,
    reviewed_at: Option<DateTime<Utc>>,
}

impl PaymentRow {
    fn into_payment(self) -> Result<Payment, PipelineError> {
        let provider_metadata = self
            .provider_metadata
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(|err| PipelineError::Store(format!("corrupt provider metadata: {err}")))?;
        Ok(Payment {
            id: parse_stored(&self.id)?,
            enrollment_id: parse_stored(&self.enrollment_id)?,
            amount: self.amount,
            method: self
                .method
                .parse()
                .map_err(|_| PipelineError::Store(format!("corrupt payment method '{}'", self.method)))?,
            reference: self.reference,
            proof_document_id: parse_optional(self.proof_document_id)?,
            status: self
                .status
                .parse()
                .map_err(|_| PipelineError::Store(format!("corrupt payment status '{}'", self.status)))?,
            reviewer_id: parse_optional(self.reviewer_id)?,
            rejection_reason: self.rejection_reason,
            provider_metadata,
            submitted_by: parse_stored(&self.submitted_by)?,
            submitted_at: self.submitted_at,
            reviewed_at: self.reviewed_at,
        })
    }
}

/// Row written at submission.
#[derive(Debug, Clone)]
pub(crate) struct PaymentDraft {
    pub id: PaymentId,
    pub enrollment_id: EnrollmentId,
    pub amount: Option<i64>,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub proof_document_id: Option<DocumentId>,
    pub provider_metadata: Option<Value>,
    pub submitted_by: ProfileId,
}

pub(crate) async fn insert(
    conn: &mut SqliteConnection,
    draft: &PaymentDraft,
) -> Result<(), PipelineError> {
    sqlx::query(
        "INSERT INTO payments (id, enrollment_id, amount, method, reference, proof_document_id, \
         status, provider_metadata, submitted_by, submitted_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(draft.id.to_string())
    .bind(draft.enrollment_id.to_string())
    .bind(draft.amount)
    .bind(draft.method.label())
    .bind(draft.reference.as_deref())
    .bind(draft.proof_document_id.map(|id| id.to_string()))
    .bind(PaymentStatus::PendingReview.label())
    .bind(draft.provider_metadata.as_ref().map(Value::to_string))
    .bind(draft.submitted_by.to_string())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn load<'e, E>(executor: E, id: PaymentId) -> Result<Option<Payment>, PipelineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, PaymentRow>(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?"
    ))
    .bind(id.to_string())
    .fetch_optional(executor)
    .await?;
    row.map(PaymentRow::into_payment).transpose()
}

/// Oldest submissions first.
pub(crate) async fn queue(pool: &SqlitePool, filter: &QueueFilter) -> Result<Vec<Payment>, PipelineError> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE status = "
    ));
    builder.push_bind(filter.status().label());
    if let Some(method) = filter.method {
        builder.push(" AND method = ").push_bind(method.label());
    }
    if let Some(from) = filter.from {
        builder.push(" AND submitted_at >= ").push_bind(start_of(from));
    }
    if let Some(to) = filter.to {
        let end = to.checked_add_days(Days::new(1)).map(start_of);
        if let Some(end) = end {
            builder.push(" AND submitted_at < ").push_bind(end);
        }
    }
    builder.push(" ORDER BY submitted_at, id");

    let rows = builder
        .build_query_as::<PaymentRow>()
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(PaymentRow::into_payment).collect()
}

fn start_of(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// `pending_review -> validated`. False when another reviewer decided first.
pub(crate) async fn mark_validated(
    conn: &mut SqliteConnection,
    id: PaymentId,
    amount: i64,
    reference: Option<&str>,
    reviewer: ProfileId,
) -> Result<bool, PipelineError> {
    let updated = sqlx::query(
        "UPDATE payments SET status = 'validated', amount = ?, \
         reference = COALESCE(?, reference), reviewer_id = ?, reviewed_at = ? \
         WHERE id = ? AND status = 'pending_review'",
    )
    .bind(amount)
    .bind(reference)
    .bind(reviewer.to_string())
    .bind(Utc::now())
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(updated > 0)
}

pub(crate) async fn mark_rejected(
    conn: &mut SqliteConnection,
    id: PaymentId,
    reason: &str,
    reviewer: ProfileId,
) -> Result<bool, PipelineError> {
    let updated = sqlx::query(
        "UPDATE payments SET status = 'rejected', rejection_reason = ?, reviewer_id = ?, \
         reviewed_at = ? WHERE id = ? AND status = 'pending_review'",
    )
    .bind(reason)
    .bind(reviewer.to_string())
    .bind(Utc::now())
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(updated > 0)
}
