//! SQL access to enrollments, guardian links and classes in the enrollment store.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Executor, Sqlite, SqliteConnection, SqlitePool};

use super::domain::{Class, DocumentSummary, Enrollment, EnrollmentStatus, NewClass};
use super::lifecycle::DocumentRequirements;
use crate::access::Target;
use crate::error::PipelineError;
use crate::extraction::DocumentKind;
use crate::ids::{parse_optional, parse_stored, ClassId, EnrollmentId, ProfileId};

const ENROLLMENT_COLUMNS: &str = "id, number, year, guardian_id, last_name, first_name, \
    birth_date, birth_place, baptism_date, baptism_parish, baptism_officiant, origin_parish, \
    prior_year, level, class_id, status, total_due, amount_paid, revision, created_by, \
    validated_by, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    id: String,
    number: Option<String>,
    year: i32,
    guardian_id: String,
    last_name: String,
    first_name: String,
    birth_date: NaiveDate,
    birth_place: Option<String>,
    baptism_date: Option<NaiveDate>,
    baptism_parish: Option<String>,
    baptism_officiant: Option<String>,
    origin_parish: Option<String>,
    prior_year: Option<String>,
    level: String,
    class_id: Option<String>,
    status: String,
    total_due: i64,
    amount_paid: i64,
    revision: i64,
    created_by: String,
    validated_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EnrollmentRow {
    fn into_enrollment(self) -> Result<Enrollment, PipelineError> {
        Ok(Enrollment {
            id: parse_stored(&self.id)?,
            number: self.number,
            year: self.year,
            guardian_id: parse_stored(&self.guardian_id)?,
            last_name: self.last_name,
            first_name: self.first_name,
            birth_date: self.birth_date,
            birth_place: self.birth_place,
            baptism_date: self.baptism_date,
            baptism_parish: self.baptism_parish,
            baptism_officiant: self.baptism_officiant,
            origin_parish: self.origin_parish,
            prior_year: self.prior_year,
            level: self.level,
            class_id: parse_optional(self.class_id)?,
            status: self.status.parse()?,
            total_due: self.total_due,
            amount_paid: self.amount_paid,
            revision: self.revision,
            created_by: parse_stored(&self.created_by)?,
            validated_by: parse_optional(self.validated_by)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row written by intake.
#[derive(Debug, Clone)]
pub(crate) struct EnrollmentDraft {
    pub id: EnrollmentId,
    pub year: i32,
    pub guardian_id: ProfileId,
    pub last_name: String,
    pub first_name: String,
    pub norm_last_name: String,
    pub norm_first_name: String,
    pub birth_date: NaiveDate,
    pub birth_place: Option<String>,
    pub baptism_date: Option<NaiveDate>,
    pub baptism_parish: Option<String>,
    pub baptism_officiant: Option<String>,
    pub level: String,
    pub total_due: i64,
    pub created_by: ProfileId,
}

pub(crate) async fn load<'e, E>(executor: E, id: EnrollmentId) -> Result<Option<Enrollment>, PipelineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, EnrollmentRow>(&format!(
        "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE id = ?"
    ))
    .bind(id.to_string())
    .fetch_optional(executor)
    .await?;
    row.map(EnrollmentRow::into_enrollment).transpose()
}

pub(crate) async fn require(
    conn: &mut SqliteConnection,
    id: EnrollmentId,
) -> Result<Enrollment, PipelineError> {
    load(&mut *conn, id)
        .await?
        .ok_or_else(|| PipelineError::not_found("enrollment", id))
}

/// Primary guardian first, then linked co-guardians.
pub(crate) async fn owners<'e, E>(executor: E, id: EnrollmentId) -> Result<Vec<ProfileId>, PipelineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let raw: Vec<String> = sqlx::query_scalar(
        "SELECT guardian_id FROM ( \
             SELECT guardian_id, 0 AS position, created_at AS since FROM enrollments WHERE id = ? \
             UNION \
             SELECT guardian_id, 1 AS position, linked_at AS since FROM enrollment_guardians \
             WHERE enrollment_id = ? \
         ) GROUP BY guardian_id ORDER BY MIN(position), MIN(since)",
    )
    .bind(id.to_string())
    .bind(id.to_string())
    .fetch_all(executor)
    .await?;

    raw.iter().map(|value| parse_stored(value)).collect()
}

/// The enrollment together with the permission target naming its guardians.
pub(crate) async fn target(
    pool: &SqlitePool,
    id: EnrollmentId,
) -> Result<(Enrollment, Target), PipelineError> {
    let enrollment = load(pool, id)
        .await?
        .ok_or_else(|| PipelineError::not_found("enrollment", id))?;
    let owners = owners(pool, id).await?;
    Ok((
        enrollment,
        Target::new("enrollment").with_id(id).owned_by(owners),
    ))
}

/// Live (not cancelled) enrollment of the same child in the same year.
pub(crate) async fn find_same_year(
    conn: &mut SqliteConnection,
    norm_last_name: &str,
    norm_first_name: &str,
    birth_date: NaiveDate,
    year: i32,
) -> Result<Option<(EnrollmentId, ProfileId)>, PipelineError> {
    let row: Option<(String, String)> = sqlx::query_as(
        "SELECT id, guardian_id FROM enrollments \
         WHERE norm_last_name = ? AND norm_first_name = ? AND birth_date = ? AND year = ? \
           AND status != 'cancelled' \
         ORDER BY created_at LIMIT 1",
    )
    .bind(norm_last_name)
    .bind(norm_first_name)
    .bind(birth_date)
    .bind(year)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|(id, guardian)| Ok((parse_stored(&id)?, parse_stored(&guardian)?)))
        .transpose()
}

/// Most recent enrollment of the child from an earlier year.
pub(crate) async fn latest_before<'e, E>(
    executor: E,
    norm_last_name: &str,
    norm_first_name: &str,
    birth_date: NaiveDate,
    year: i32,
) -> Result<Option<Enrollment>, PipelineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, EnrollmentRow>(&format!(
        "SELECT {ENROLLMENT_COLUMNS} FROM enrollments \
         WHERE norm_last_name = ? AND norm_first_name = ? AND birth_date = ? AND year < ? \
         ORDER BY year DESC, created_at DESC LIMIT 1"
    ))
    .bind(norm_last_name)
    .bind(norm_first_name)
    .bind(birth_date)
    .bind(year)
    .fetch_optional(executor)
    .await?;
    row.map(EnrollmentRow::into_enrollment).transpose()
}

pub(crate) async fn insert(
    conn: &mut SqliteConnection,
    draft: &EnrollmentDraft,
) -> Result<(), PipelineError> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO enrollments (id, year, guardian_id, last_name, first_name, norm_last_name, \
         norm_first_name, birth_date, birth_place, baptism_date, baptism_parish, \
         baptism_officiant, level, status, total_due, amount_paid, revision, created_by, \
         created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?)",
    )
    .bind(draft.id.to_string())
    .bind(draft.year)
    .bind(draft.guardian_id.to_string())
    .bind(&draft.last_name)
    .bind(&draft.first_name)
    .bind(&draft.norm_last_name)
    .bind(&draft.norm_first_name)
    .bind(draft.birth_date)
    .bind(draft.birth_place.as_deref())
    .bind(draft.baptism_date)
    .bind(draft.baptism_parish.as_deref())
    .bind(draft.baptism_officiant.as_deref())
    .bind(&draft.level)
    .bind(EnrollmentStatus::Draft.label())
    .bind(draft.total_due)
    .bind(draft.created_by.to_string())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Returns false when the guardian was already linked.
pub(crate) async fn link_guardian(
    conn: &mut SqliteConnection,
    id: EnrollmentId,
    guardian: ProfileId,
) -> Result<bool, PipelineError> {
    let inserted = sqlx::query(
        "INSERT INTO enrollment_guardians (enrollment_id, guardian_id, linked_at) \
         VALUES (?, ?, ?) ON CONFLICT(enrollment_id, guardian_id) DO NOTHING",
    )
    .bind(id.to_string())
    .bind(guardian.to_string())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(inserted > 0)
}

/// Take the enrollment's write lock by bumping its revision. Returns false if
/// the enrollment does not exist.
pub(crate) async fn touch(conn: &mut SqliteConnection, id: EnrollmentId) -> Result<bool, PipelineError> {
    let updated = sqlx::query(
        "UPDATE enrollments SET revision = revision + 1, updated_at = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(updated > 0)
}

pub(crate) async fn documents<'e, E>(
    executor: E,
    id: EnrollmentId,
) -> Result<Vec<DocumentSummary>, PipelineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String, String, String, bool)> = sqlx::query_as(
        "SELECT id, kind, extraction_status, confirmed FROM documents \
         WHERE enrollment_id = ? ORDER BY created_at",
    )
    .bind(id.to_string())
    .fetch_all(executor)
    .await?;

    rows.into_iter()
        .map(|(id, kind, extraction_status, confirmed)| {
            Ok(DocumentSummary {
                id: parse_stored(&id)?,
                kind: kind
                    .parse::<DocumentKind>()
                    .map_err(|_| PipelineError::Store(format!("corrupt document kind '{kind}'")))?,
                extraction_status,
                confirmed,
            })
        })
        .collect()
}

pub(crate) async fn document_requirements(
    conn: &mut SqliteConnection,
    id: EnrollmentId,
) -> Result<DocumentRequirements, PipelineError> {
    let kinds: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT kind FROM documents WHERE enrollment_id = ? AND confirmed = 1",
    )
    .bind(id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    let has = |kind: DocumentKind| kinds.iter().any(|stored| stored == kind.label());
    Ok(DocumentRequirements {
        birth_record: has(DocumentKind::BirthRecord),
        baptism_record: has(DocumentKind::BaptismRecord),
        transfer_attestation: has(DocumentKind::TransferAttestation),
    })
}

/// Sum of validated payments: the source of `amount_paid`.
pub(crate) async fn validated_total(
    conn: &mut SqliteConnection,
    id: EnrollmentId,
) -> Result<i64, PipelineError> {
    let total: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM payments \
         WHERE enrollment_id = ? AND status = 'validated'",
    )
    .bind(id.to_string())
    .fetch_one(&mut *conn)
    .await?;
    Ok(total)
}

#[derive(sqlx::FromRow)]
struct ClassRow {
    id: String,
    year: i32,
    level: String,
    label: String,
    capacity: i64,
    occupancy: i64,
}

pub(crate) async fn insert_class(
    conn: &mut SqliteConnection,
    id: ClassId,
    class: &NewClass,
) -> Result<(), PipelineError> {
    sqlx::query(
        "INSERT INTO classes (id, year, level, label, capacity, occupancy, created_at) \
         VALUES (?, ?, ?, ?, ?, 0, ?)",
    )
    .bind(id.to_string())
    .bind(class.year)
    .bind(class.level.trim())
    .bind(class.label.trim())
    .bind(class.capacity)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    for instructor in &class.instructors {
        sqlx::query(
            "INSERT INTO class_instructors (class_id, instructor_id) VALUES (?, ?) \
             ON CONFLICT(class_id, instructor_id) DO NOTHING",
        )
        .bind(id.to_string())
        .bind(instructor.to_string())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub(crate) async fn load_class(pool: &SqlitePool, id: ClassId) -> Result<Option<Class>, PipelineError> {
    let row = sqlx::query_as::<_, ClassRow>(
        "SELECT id, year, level, label, capacity, occupancy FROM classes WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(class_from_row(pool, row).await?)),
        None => Ok(None),
    }
}

pub(crate) async fn list_classes(pool: &SqlitePool, year: i32) -> Result<Vec<Class>, PipelineError> {
    let rows = sqlx::query_as::<_, ClassRow>(
        "SELECT id, year, level, label, capacity, occupancy FROM classes \
         WHERE year = ? ORDER BY level, label",
    )
    .bind(year)
    .fetch_all(pool)
    .await?;

    let mut classes = Vec::with_capacity(rows.len());
    for row in rows {
        classes.push(class_from_row(pool, row).await?);
    }
    Ok(classes)
}

async fn class_from_row(pool: &SqlitePool, row: ClassRow) -> Result<Class, PipelineError> {
    let instructors: Vec<String> = sqlx::query_scalar(
        "SELECT instructor_id FROM class_instructors WHERE class_id = ? ORDER BY instructor_id",
    )
    .bind(&row.id)
    .fetch_all(pool)
    .await?;

    Ok(Class {
        id: parse_stored(&row.id)?,
        year: row.year,
        level: row.level,
        label: row.label,
        capacity: row.capacity,
        occupancy: row.occupancy,
        instructors: instructors
            .iter()
            .map(|value| parse_stored(value))
            .collect::<Result<_, _>>()?,
    })
}
