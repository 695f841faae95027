//! SQL access to the access-page store.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::domain::AccessPage;
use crate::error::PipelineError;
use crate::ids::parse_stored;

#[derive(sqlx::FromRow)]
struct AccessPageRow {
    token: String,
    enrollment_id: String,
    purpose: String,
    issued_by: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_viewed_at: Option<DateTime<Utc>>,
}

impl AccessPageRow {
    fn into_page(self) -> Result<AccessPage, PipelineError> {
        Ok(AccessPage {
            token: self.token,
            enrollment_id: parse_stored(&self.enrollment_id)?,
            purpose: self
                .purpose
                .parse()
                .map_err(|_| PipelineError::Store(format!("corrupt page purpose '{}'", self.purpose)))?,
            issued_by: parse_stored(&self.issued_by)?,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            last_viewed_at: self.last_viewed_at,
        })
    }
}

pub(crate) async fn insert(pool: &SqlitePool, page: &AccessPage) -> Result<(), PipelineError> {
    sqlx::query(
        "INSERT INTO access_pages (token, enrollment_id, purpose, issued_by, issued_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&page.token)
    .bind(page.enrollment_id.to_string())
    .bind(page.purpose.label())
    .bind(page.issued_by.to_string())
    .bind(page.issued_at)
    .bind(page.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn load(pool: &SqlitePool, token: &str) -> Result<Option<AccessPage>, PipelineError> {
    let row = sqlx::query_as::<_, AccessPageRow>(
        "SELECT token, enrollment_id, purpose, issued_by, issued_at, expires_at, last_viewed_at \
         FROM access_pages WHERE token = ?",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;
    row.map(AccessPageRow::into_page).transpose()
}

pub(crate) async fn delete(pool: &SqlitePool, token: &str) -> Result<bool, PipelineError> {
    let deleted = sqlx::query("DELETE FROM access_pages WHERE token = ?")
        .bind(token)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}

pub(crate) async fn touch(pool: &SqlitePool, token: &str, now: DateTime<Utc>) -> Result<(), PipelineError> {
    sqlx::query("UPDATE access_pages SET last_viewed_at = ? WHERE token = ?")
        .bind(now)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

pub(crate) async fn delete_expired(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64, PipelineError> {
    let deleted = sqlx::query("DELETE FROM access_pages WHERE expires_at <= ?")
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(deleted)
}
