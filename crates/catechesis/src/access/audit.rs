//! Append-only audit trail kept in the enrollment store.
//!
//! Successful mutations write their entry through [`record`] inside the same
//! transaction as the mutation, so a failed audit write rolls the mutation back.
//! Failures are appended on their own connection by [`AuditTrail::failure`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::ids::ProfileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CreateEnrollment,
    LinkEnrollment,
    CancelEnrollment,
    AssignClass,
    CreateClass,
    UploadDocument,
    ExtractDocument,
    ConfirmDocument,
    SubmitPayment,
    ValidatePayment,
    RejectPayment,
    IssueAccessPage,
    CreateProfile,
    ProvisionGuardian,
    ChangeRole,
    SetAccessCode,
    VerifyAccessCode,
    DeactivateProfile,
    Authorize,
}

impl AuditAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateEnrollment => "create_enrollment",
            Self::LinkEnrollment => "link_enrollment",
            Self::CancelEnrollment => "cancel_enrollment",
            Self::AssignClass => "assign_class",
            Self::CreateClass => "create_class",
            Self::UploadDocument => "upload_document",
            Self::ExtractDocument => "extract_document",
            Self::ConfirmDocument => "confirm_document",
            Self::SubmitPayment => "submit_payment",
            Self::ValidatePayment => "validate_payment",
            Self::RejectPayment => "reject_payment",
            Self::IssueAccessPage => "issue_access_page",
            Self::CreateProfile => "create_profile",
            Self::ProvisionGuardian => "provision_guardian",
            Self::ChangeRole => "change_role",
            Self::SetAccessCode => "set_access_code",
            Self::VerifyAccessCode => "verify_access_code",
            Self::DeactivateProfile => "deactivate_profile",
            Self::Authorize => "authorize",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// An entry about to be written. `actor` is `None` for system work such as
/// background extraction.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor: Option<ProfileId>,
    pub action: AuditAction,
    pub target_type: &'static str,
    pub target_id: Option<String>,
    pub outcome: AuditOutcome,
    pub detail: Option<Value>,
}

impl AuditRecord {
    pub fn new(actor: Option<ProfileId>, action: AuditAction, target_type: &'static str) -> Self {
        Self {
            actor,
            action,
            target_type,
            target_id: None,
            outcome: AuditOutcome::Success,
            detail: None,
        }
    }

    pub fn target_id(mut self, id: Option<String>) -> Self {
        self.target_id = id;
        self
    }

    pub fn target(mut self, id: impl ToString) -> Self {
        self.target_id = Some(id.to_string());
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// A stored entry. `detail` is gone once the entry has been scrubbed.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: String,
    pub actor_id: Option<String>,
    pub action: String,
    pub target_type: String,
    pub target_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub outcome: String,
    pub detail: Option<Value>,
    pub scrubbed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: String,
    actor_id: Option<String>,
    action: String,
    target_type: String,
    target_id: Option<String>,
    occurred_at: DateTime<Utc>,
    outcome: String,
    detail: Option<String>,
    scrubbed_at: Option<DateTime<Utc>>,
}

impl From<AuditRow> for AuditEntry {
    fn from(row: AuditRow) -> Self {
        Self {
            id: row.id,
            actor_id: row.actor_id,
            action: row.action,
            target_type: row.target_type,
            target_id: row.target_id,
            occurred_at: row.occurred_at,
            outcome: row.outcome,
            detail: row
                .detail
                .map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw))),
            scrubbed_at: row.scrubbed_at,
        }
    }
}

/// Aggregate kept intact by scrubbing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct AuditCount {
    pub action: String,
    pub outcome: String,
    pub entries: i64,
}

/// Write an entry on the caller's connection, normally inside its transaction.
pub async fn record(conn: &mut SqliteConnection, record: &AuditRecord) -> Result<(), PipelineError> {
    let detail = record
        .detail
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|err| PipelineError::Store(format!("audit detail not serializable: {err}")))?;

    sqlx::query(
        "INSERT INTO audit_entries \
         (id, actor_id, action, target_type, target_id, occurred_at, outcome, detail) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(record.actor.map(|actor| actor.to_string()))
    .bind(record.action.as_str())
    .bind(record.target_type)
    .bind(record.target_id.as_deref())
    .bind(Utc::now())
    .bind(record.outcome.as_str())
    .bind(detail)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[derive(Debug, Clone)]
pub struct AuditTrail {
    pool: SqlitePool,
}

impl AuditTrail {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append outside of any business transaction.
    pub async fn append(&self, entry: &AuditRecord) -> Result<(), PipelineError> {
        let mut conn = self.pool.acquire().await?;
        record(&mut conn, entry).await
    }

    /// Record a failed operation. Permission errors are skipped because the
    /// gatekeeper has already written the denial.
    pub async fn failure(&self, entry: AuditRecord, err: &PipelineError) {
        if matches!(err, PipelineError::Permission { .. }) {
            return;
        }

        let action = entry.action;
        let entry = entry.outcome(AuditOutcome::Failure).detail(serde_json::json!({
            "error": err.kind(),
            "message": err.to_string(),
        }));

        if let Err(audit_err) = self.append(&entry).await {
            warn!(action = action.as_str(), error = %audit_err, "failure could not be audited");
        }
    }

    /// Pass `result` through, auditing it first when it is an error.
    pub async fn on_failure<T>(
        &self,
        entry: AuditRecord,
        result: Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        if let Err(err) = &result {
            self.failure(entry, err).await;
        }
        result
    }

    pub async fn entries_for(
        &self,
        target_type: &str,
        target_id: &str,
    ) -> Result<Vec<AuditEntry>, PipelineError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT id, actor_id, action, target_type, target_id, occurred_at, outcome, \
             detail, scrubbed_at FROM audit_entries \
             WHERE target_type = ? AND target_id = ? ORDER BY occurred_at, rowid",
        )
        .bind(target_type)
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(AuditEntry::from).collect())
    }

    /// Irreversibly drop the detail of entries older than `cutoff`. Rows stay, so
    /// [`AuditTrail::counts`] is unaffected.
    pub async fn scrub_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, PipelineError> {
        let result = sqlx::query(
            "UPDATE audit_entries SET detail = NULL, scrubbed_at = ? \
             WHERE occurred_at < ? AND scrubbed_at IS NULL",
        )
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let scrubbed = result.rows_affected();
        if scrubbed > 0 {
            info!(scrubbed, %cutoff, "audit detail scrubbed");
        }
        Ok(scrubbed)
    }

    pub async fn counts(&self) -> Result<Vec<AuditCount>, PipelineError> {
        let counts = sqlx::query_as::<_, AuditCount>(
            "SELECT action, outcome, COUNT(*) AS entries FROM audit_entries \
             GROUP BY action, outcome ORDER BY action, outcome",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::stores::StoreSet;
    use chrono::Duration;

    async fn trail() -> (tempfile::TempDir, StoreSet, AuditTrail) {
        let dir = tempfile::tempdir().expect("tempdir");
        let stores = StoreSet::open(&StorageConfig::in_dir(dir.path()))
            .await
            .expect("stores");
        let trail = AuditTrail::new(stores.enrollment().clone());
        (dir, stores, trail)
    }

    #[tokio::test]
    async fn scrubbing_keeps_counts_but_drops_detail() {
        let (_dir, _stores, trail) = trail().await;
        let entry = AuditRecord::new(None, AuditAction::SubmitPayment, "payment")
            .target("p-1")
            .detail(serde_json::json!({ "amount": 15000 }));
        trail.append(&entry).await.expect("append");
        trail.append(&entry).await.expect("append");

        let before = trail.counts().await.expect("counts");
        let scrubbed = trail
            .scrub_older_than(Utc::now() + Duration::seconds(5))
            .await
            .expect("scrub");
        assert_eq!(scrubbed, 2);
        assert_eq!(trail.counts().await.expect("counts"), before);

        let entries = trail.entries_for("payment", "p-1").await.expect("entries");
        assert!(entries
            .iter()
            .all(|entry| entry.detail.is_none() && entry.scrubbed_at.is_some()));

        let again = trail
            .scrub_older_than(Utc::now() + Duration::seconds(5))
            .await
            .expect("idempotent");
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn entries_cannot_be_deleted_or_rewritten() {
        let (_dir, stores, trail) = trail().await;
        trail
            .append(&AuditRecord::new(None, AuditAction::CreateProfile, "profile").target("x"))
            .await
            .expect("append");

        let deleted = sqlx::query("DELETE FROM audit_entries")
            .execute(stores.enrollment())
            .await;
        assert!(deleted.is_err());

        let rewritten = sqlx::query("UPDATE audit_entries SET outcome = 'failure'")
            .execute(stores.enrollment())
            .await;
        assert!(rewritten.is_err());
    }

    #[tokio::test]
    async fn failures_are_recorded_with_their_kind() {
        let (_dir, _stores, trail) = trail().await;
        let entry = AuditRecord::new(None, AuditAction::ValidatePayment, "payment").target("p-9");
        trail
            .failure(
                entry.clone(),
                &PipelineError::PaymentMismatch {
                    amount: 30_000,
                    remaining: 10_000,
                },
            )
            .await;
        trail
            .failure(
                entry,
                &PipelineError::Permission {
                    actor: "someone".into(),
                    action: crate::access::Capability::ReviewPayment,
                },
            )
            .await;

        let entries = trail.entries_for("payment", "p-9").await.expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "failure");
        assert_eq!(
            entries[0].detail.as_ref().and_then(|d| d["error"].as_str()),
            Some("payment_mismatch_error")
        );
    }
}
