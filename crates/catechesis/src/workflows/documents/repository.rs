//! SQL access to document records in the enrollment store.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Executor, Sqlite, SqliteConnection};

use super::domain::{Document, DocumentFormat, ExtractionStatus};
use crate::error::PipelineError;
use crate::extraction::{DocumentKind, Extraction};
use crate::ids::{parse_optional, parse_stored, DocumentId, EnrollmentId, ProfileId};

const DOCUMENT_COLUMNS: &str = "id, enrollment_id, kind, storage_key, format, size_bytes, \
    extraction_status, raw_fields, confirmed_fields, confidence, requires_manual_check, \
    error_detail, confirmed, confirmed_by, confirmed_at, uploaded_by, created_at, updated_at, \
    purged_at";

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    enrollment_id: String,
    kind: String,
    storage_key: Option<String>,
    format: String,
    size_bytes: i64,
    extraction_status: String,
    raw_fields: Option<String>,
    confirmed_fields: Option<String>,
    confidence: Option<f64>,
    requires_manual_check: bool,
    error_detail: Option<String>,
    confirmed: bool,
    confirmed_by: Option<String>,
    confirmed_at: Option<DateTime<Utc>>,
    uploaded_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    purged_at: Option<DateTime<Utc>>,
}

impl DocumentRow {
    fn into_document(self) -> Result<Document, PipelineError> {
        Ok(Document {
            id: parse_stored(&self.id)?,
            enrollment_id: parse_stored(&self.enrollment_id)?,
            kind: self
                .kind
                .parse::<DocumentKind>()
                .map_err(|_| PipelineError::Store(format!("corrupt document kind '{}'", self.kind)))?,
            storage_key: self.storage_key,
            format: self.format.parse()?,
            size_bytes: self.size_bytes,
            extraction_status: self.extraction_status.parse()?,
            fields: decode(self.raw_fields.as_deref())?,
            confirmed_fields: decode(self.confirmed_fields.as_deref())?,
            confidence: self.confidence.map(|value| value as f32),
            requires_manual_check: self.requires_manual_check,
            error_detail: self.error_detail,
            confirmed: self.confirmed,
            confirmed_by: parse_optional(self.confirmed_by)?,
            confirmed_at: self.confirmed_at,
            uploaded_by: parse_stored(&self.uploaded_by)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            purged_at: self.purged_at,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(raw: Option<&str>) -> Result<Option<T>, PipelineError> {
    raw.map(|value| {
        serde_json::from_str(value)
            .map_err(|err| PipelineError::Store(format!("corrupt document fields: {err}")))
    })
    .transpose()
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, PipelineError> {
    serde_json::to_string(value)
        .map_err(|err| PipelineError::Store(format!("document fields not encodable: {err}")))
}

/// Row written when an upload is accepted.
#[derive(Debug, Clone)]
pub(crate) struct DocumentDraft {
    pub id: DocumentId,
    pub enrollment_id: EnrollmentId,
    pub kind: DocumentKind,
    pub storage_key: String,
    pub format: DocumentFormat,
    pub size_bytes: i64,
    pub uploaded_by: ProfileId,
}

pub(crate) async fn insert(
    conn: &mut SqliteConnection,
    draft: &DocumentDraft,
) -> Result<(), PipelineError> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO documents (id, enrollment_id, kind, storage_key, format, size_bytes, \
         extraction_status, requires_manual_check, confirmed, uploaded_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 1, 0, ?, ?, ?)",
    )
    .bind(draft.id.to_string())
    .bind(draft.enrollment_id.to_string())
    .bind(draft.kind.label())
    .bind(&draft.storage_key)
    .bind(draft.format.label())
    .bind(draft.size_bytes)
    .bind(ExtractionStatus::Pending.label())
    .bind(draft.uploaded_by.to_string())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn load<'e, E>(executor: E, id: DocumentId) -> Result<Option<Document>, PipelineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, DocumentRow>(&format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"
    ))
    .bind(id.to_string())
    .fetch_optional(executor)
    .await?;
    row.map(DocumentRow::into_document).transpose()
}

/// `pending -> running`. False when another worker (or a manual entry) got there first.
pub(crate) async fn mark_running<'e, E>(executor: E, id: DocumentId) -> Result<bool, PipelineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let updated = sqlx::query(
        "UPDATE documents SET extraction_status = 'running', updated_at = ? \
         WHERE id = ? AND extraction_status = 'pending'",
    )
    .bind(Utc::now())
    .bind(id.to_string())
    .execute(executor)
    .await?
    .rows_affected();
    Ok(updated > 0)
}

/// `running -> succeeded`. A document confirmed manually in the meantime keeps
/// its manual fields.
pub(crate) async fn store_extraction(
    conn: &mut SqliteConnection,
    id: DocumentId,
    extraction: &Extraction,
) -> Result<bool, PipelineError> {
    let updated = sqlx::query(
        "UPDATE documents SET extraction_status = 'succeeded', raw_fields = ?, confidence = ?, \
         requires_manual_check = ?, error_detail = NULL, updated_at = ? \
         WHERE id = ? AND extraction_status = 'running'",
    )
    .bind(encode(&extraction.fields)?)
    .bind(f64::from(extraction.confidence))
    .bind(extraction.requires_manual_check)
    .bind(Utc::now())
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(updated > 0)
}

/// `pending | running -> failed`, leaving the document open for manual entry.
pub(crate) async fn store_failure(
    conn: &mut SqliteConnection,
    id: DocumentId,
    detail: &str,
) -> Result<bool, PipelineError> {
    let updated = sqlx::query(
        "UPDATE documents SET extraction_status = 'failed', error_detail = ?, \
         requires_manual_check = 1, updated_at = ? \
         WHERE id = ? AND extraction_status IN ('pending', 'running')",
    )
    .bind(detail)
    .bind(Utc::now())
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(updated > 0)
}

pub(crate) async fn confirm(
    conn: &mut SqliteConnection,
    id: DocumentId,
    fields: &BTreeMap<String, String>,
    actor: ProfileId,
) -> Result<(), PipelineError> {
    let now = Utc::now();
    sqlx::query(
        "UPDATE documents SET confirmed = 1, confirmed_fields = ?, confirmed_by = ?, \
         confirmed_at = ?, updated_at = ?, \
         extraction_status = CASE WHEN extraction_status = 'succeeded' THEN 'succeeded' \
                                  ELSE 'manual' END \
         WHERE id = ?",
    )
    .bind(encode(fields)?)
    .bind(actor.to_string())
    .bind(now)
    .bind(now)
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Copy confirmed certificate data onto the enrollment. The child's identity
/// stays as entered at intake; only a missing birth place is completed.
pub(crate) async fn apply_to_enrollment(
    conn: &mut SqliteConnection,
    enrollment_id: EnrollmentId,
    kind: DocumentKind,
    fields: &BTreeMap<String, String>,
) -> Result<(), PipelineError> {
    let field = |name: &str| fields.get(name).map(String::as_str);
    let query = match kind {
        DocumentKind::BirthRecord => sqlx::query(
            "UPDATE enrollments SET birth_place = COALESCE(birth_place, ?) WHERE id = ?",
        )
        .bind(field("birth_place")),
        DocumentKind::BaptismRecord => {
            let baptism_date = field("baptism_date")
                .and_then(|value| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok());
            sqlx::query(
                "UPDATE enrollments SET baptism_date = ?, baptism_parish = ?, \
                 baptism_officiant = COALESCE(?, baptism_officiant) WHERE id = ?",
            )
            .bind(baptism_date)
            .bind(field("parish"))
            .bind(field("officiant"))
        }
        DocumentKind::TransferAttestation => sqlx::query(
            "UPDATE enrollments SET origin_parish = ?, prior_year = COALESCE(?, prior_year) \
             WHERE id = ?",
        )
        .bind(field("origin_parish"))
        .bind(field("prior_year")),
        DocumentKind::PaymentProof => return Ok(()),
    };

    query.bind(enrollment_id.to_string()).execute(&mut *conn).await?;
    Ok(())
}

/// Documents whose extraction has not moved since `cutoff`.
pub(crate) async fn stalled<'e, E>(
    executor: E,
    cutoff: DateTime<Utc>,
) -> Result<Vec<(DocumentId, EnrollmentId)>, PipelineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT id, enrollment_id FROM documents \
         WHERE extraction_status IN ('pending', 'running') AND updated_at < ? \
         ORDER BY updated_at",
    )
    .bind(cutoff)
    .fetch_all(executor)
    .await?;

    rows.into_iter()
        .map(|(id, enrollment)| Ok((parse_stored(&id)?, parse_stored(&enrollment)?)))
        .collect()
}

/// Raw objects of terminal enrollments whose last activity predates `cutoff`.
pub(crate) async fn purgeable<'e, E>(
    executor: E,
    cutoff: DateTime<Utc>,
) -> Result<Vec<(DocumentId, String)>, PipelineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT d.id, d.storage_key FROM documents d \
         JOIN enrollments e ON e.id = d.enrollment_id \
         WHERE d.storage_key IS NOT NULL AND d.purged_at IS NULL \
           AND e.status IN ('active', 'cancelled') AND e.updated_at < ? \
         ORDER BY d.created_at",
    )
    .bind(cutoff)
    .fetch_all(executor)
    .await?;

    rows.into_iter()
        .map(|(id, key)| Ok((parse_stored(&id)?, key)))
        .collect()
}

pub(crate) async fn mark_purged<'e, E>(executor: E, id: DocumentId) -> Result<bool, PipelineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = Utc::now();
    let updated = sqlx::query(
        "UPDATE documents SET storage_key = NULL, purged_at = ?, updated_at = ? \
         WHERE id = ? AND purged_at IS NULL",
    )
    .bind(now)
    .bind(now)
    .bind(id.to_string())
    .execute(executor)
    .await?
    .rows_affected();
    Ok(updated > 0)
}
