use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use tracing::info;

use super::{StoreError, StoreKind};

/// Schema version record kept inside every store.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaStatus {
    pub store: StoreKind,
    pub version: i64,
    pub migrated_at: Option<DateTime<Utc>>,
}

const META_DDL: &str = "
CREATE TABLE IF NOT EXISTS schema_meta (
    store       TEXT PRIMARY KEY,
    version     INTEGER NOT NULL,
    migrated_at TEXT NOT NULL
);
";

const ENROLLMENT_V1: &str = "
CREATE TABLE profiles (
    id               TEXT PRIMARY KEY,
    display_name     TEXT NOT NULL,
    role             TEXT NOT NULL,
    channel_identity TEXT UNIQUE,
    access_code_hash TEXT,
    permissions      TEXT NOT NULL,
    active           INTEGER NOT NULL DEFAULT 1,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE classes (
    id         TEXT PRIMARY KEY,
    year       INTEGER NOT NULL,
    level      TEXT NOT NULL,
    label      TEXT NOT NULL,
    capacity   INTEGER NOT NULL CHECK (capacity > 0),
    occupancy  INTEGER NOT NULL DEFAULT 0 CHECK (occupancy >= 0 AND occupancy <= capacity),
    created_at TEXT NOT NULL
);

CREATE TABLE class_instructors (
    class_id      TEXT NOT NULL REFERENCES classes(id),
    instructor_id TEXT NOT NULL REFERENCES profiles(id),
    PRIMARY KEY (class_id, instructor_id)
);

CREATE TABLE enrollments (
    id                TEXT PRIMARY KEY,
    number            TEXT UNIQUE,
    year              INTEGER NOT NULL,
    guardian_id       TEXT NOT NULL REFERENCES profiles(id),
    last_name         TEXT NOT NULL,
    first_name        TEXT NOT NULL,
    norm_last_name    TEXT NOT NULL,
    norm_first_name   TEXT NOT NULL,
    birth_date        TEXT NOT NULL,
    birth_place       TEXT,
    baptism_date      TEXT,
    baptism_parish    TEXT,
    baptism_officiant TEXT,
    origin_parish     TEXT,
    prior_year        TEXT,
    level             TEXT NOT NULL,
    class_id          TEXT REFERENCES classes(id),
    status            TEXT NOT NULL,
    total_due         INTEGER NOT NULL CHECK (total_due >= 0),
    amount_paid       INTEGER NOT NULL DEFAULT 0
                      CHECK (amount_paid >= 0 AND amount_paid <= total_due),
    revision          INTEGER NOT NULL DEFAULT 0,
    created_by        TEXT NOT NULL,
    validated_by      TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE INDEX enrollments_identity_idx
    ON enrollments (norm_last_name, norm_first_name, birth_date);
CREATE INDEX enrollments_guardian_idx ON enrollments (guardian_id);

CREATE TABLE enrollment_guardians (
    enrollment_id TEXT NOT NULL REFERENCES enrollments(id),
    guardian_id   TEXT NOT NULL REFERENCES profiles(id),
    linked_at     TEXT NOT NULL,
    PRIMARY KEY (enrollment_id, guardian_id)
);

CREATE TABLE number_sequences (
    year       INTEGER PRIMARY KEY,
    last_value INTEGER NOT NULL
);

CREATE TABLE write_claims (
    name       TEXT PRIMARY KEY,
    claimed_at TEXT NOT NULL
);

CREATE TABLE documents (
    id                    TEXT PRIMARY KEY,
    enrollment_id         TEXT NOT NULL REFERENCES enrollments(id),
    kind                  TEXT NOT NULL,
    storage_key           TEXT,
    format                TEXT NOT NULL,
    size_bytes            INTEGER NOT NULL CHECK (size_bytes > 0),
    extraction_status     TEXT NOT NULL,
    raw_fields            TEXT,
    confirmed_fields      TEXT,
    confidence            REAL CHECK (confidence IS NULL OR (confidence >= 0 AND confidence <= 1)),
    requires_manual_check INTEGER NOT NULL DEFAULT 1,
    error_detail          TEXT,
    confirmed             INTEGER NOT NULL DEFAULT 0,
    confirmed_by          TEXT,
    confirmed_at          TEXT,
    uploaded_by           TEXT NOT NULL,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL,
    purged_at             TEXT
);

CREATE INDEX documents_enrollment_idx ON documents (enrollment_id, kind);

CREATE TABLE payments (
    id                TEXT PRIMARY KEY,
    enrollment_id     TEXT NOT NULL REFERENCES enrollments(id),
    amount            INTEGER CHECK (amount IS NULL OR amount > 0),
    method            TEXT NOT NULL,
    reference         TEXT,
    proof_document_id TEXT REFERENCES documents(id),
    status            TEXT NOT NULL,
    reviewer_id       TEXT,
    rejection_reason  TEXT,
    provider_metadata TEXT,
    submitted_by      TEXT NOT NULL,
    submitted_at      TEXT NOT NULL,
    reviewed_at       TEXT
);

CREATE INDEX payments_enrollment_idx ON payments (enrollment_id, status);
CREATE INDEX payments_queue_idx ON payments (status, submitted_at);

CREATE TABLE audit_entries (
    id          TEXT PRIMARY KEY,
    actor_id    TEXT,
    action      TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_id   TEXT,
    occurred_at TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    detail      TEXT,
    scrubbed_at TEXT
);

CREATE INDEX audit_entries_occurred_idx ON audit_entries (occurred_at);
CREATE INDEX audit_entries_target_idx ON audit_entries (target_type, target_id);

CREATE TRIGGER audit_entries_no_delete BEFORE DELETE ON audit_entries
BEGIN
    SELECT RAISE(ABORT, 'audit entries are append-only');
END;

CREATE TRIGGER audit_entries_scrub_only BEFORE UPDATE ON audit_entries
WHEN NEW.id IS NOT OLD.id
  OR NEW.actor_id IS NOT OLD.actor_id
  OR NEW.action IS NOT OLD.action
  OR NEW.target_type IS NOT OLD.target_type
  OR NEW.target_id IS NOT OLD.target_id
  OR NEW.occurred_at IS NOT OLD.occurred_at
  OR NEW.outcome IS NOT OLD.outcome
  OR NEW.detail IS NOT NULL
  OR NEW.scrubbed_at IS NULL
BEGIN
    SELECT RAISE(ABORT, 'audit entries may only be scrubbed');
END;

CREATE TRIGGER enrollments_class_insert AFTER INSERT ON enrollments
WHEN NEW.class_id IS NOT NULL AND NEW.status != 'cancelled'
BEGIN
    UPDATE classes SET occupancy = occupancy + 1 WHERE id = NEW.class_id;
END;

CREATE TRIGGER enrollments_class_release AFTER UPDATE OF class_id, status ON enrollments
WHEN OLD.class_id IS NOT NULL AND OLD.status != 'cancelled'
  AND (NEW.class_id IS NOT OLD.class_id OR NEW.status = 'cancelled')
BEGIN
    UPDATE classes SET occupancy = occupancy - 1 WHERE id = OLD.class_id;
END;

CREATE TRIGGER enrollments_class_take AFTER UPDATE OF class_id, status ON enrollments
WHEN NEW.class_id IS NOT NULL AND NEW.status != 'cancelled'
  AND (NEW.class_id IS NOT OLD.class_id OR OLD.status = 'cancelled')
BEGIN
    UPDATE classes SET occupancy = occupancy + 1 WHERE id = NEW.class_id;
END;
";

const ENROLLMENT_V2: &str = "
ALTER TABLE profiles ADD COLUMN failed_code_attempts INTEGER NOT NULL DEFAULT 0;
ALTER TABLE profiles ADD COLUMN code_locked_until TEXT;

CREATE INDEX documents_extraction_idx ON documents (extraction_status, updated_at);
";

const ACCESS_PAGES_V1: &str = "
CREATE TABLE access_pages (
    token          TEXT PRIMARY KEY,
    enrollment_id  TEXT NOT NULL,
    purpose        TEXT NOT NULL,
    issued_by      TEXT NOT NULL,
    issued_at      TEXT NOT NULL,
    expires_at     TEXT NOT NULL,
    last_viewed_at TEXT
);

CREATE INDEX access_pages_expiry_idx ON access_pages (expires_at);
CREATE INDEX access_pages_enrollment_idx ON access_pages (enrollment_id);
";

const REGISTRY_V1: &str = "
CREATE TABLE sweep_runs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    job         TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    affected    INTEGER NOT NULL,
    outcome     TEXT NOT NULL
);

CREATE TABLE backups (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    store          TEXT NOT NULL,
    path           TEXT NOT NULL,
    size_bytes     INTEGER NOT NULL,
    schema_version INTEGER NOT NULL,
    created_at     TEXT NOT NULL
);
";

fn migrations(kind: StoreKind) -> &'static [(i64, &'static str)] {
    match kind {
        StoreKind::Enrollment => &[(1, ENROLLMENT_V1), (2, ENROLLMENT_V2)],
        StoreKind::AccessPages => &[(1, ACCESS_PAGES_V1)],
        StoreKind::Registry => &[(1, REGISTRY_V1)],
    }
}

pub(crate) async fn migrate(kind: StoreKind, pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(META_DDL)
        .execute(pool)
        .await
        .map_err(|source| StoreError::Migration {
            store: kind,
            version: 0,
            source,
        })?;

    let current = current_version(kind, pool).await?;

    for (version, ddl) in migrations(kind) {
        if *version <= current {
            continue;
        }

        let wrap = |source| StoreError::Migration {
            store: kind,
            version: *version,
            source,
        };

        let mut tx = pool.begin().await.map_err(wrap)?;
        sqlx::raw_sql(ddl).execute(&mut *tx).await.map_err(wrap)?;
        sqlx::query(
            "INSERT INTO schema_meta (store, version, migrated_at) VALUES (?, ?, ?) \
             ON CONFLICT(store) DO UPDATE SET version = excluded.version, \
             migrated_at = excluded.migrated_at",
        )
        .bind(kind.label())
        .bind(*version)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(wrap)?;
        tx.commit().await.map_err(wrap)?;

        info!(store = %kind, version, "store migrated");
    }

    Ok(())
}

async fn current_version(kind: StoreKind, pool: &SqlitePool) -> Result<i64, StoreError> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_meta WHERE store = ?")
            .bind(kind.label())
            .fetch_optional(pool)
            .await?;
    Ok(version.unwrap_or(0))
}

pub(crate) async fn status(kind: StoreKind, pool: &SqlitePool) -> Result<SchemaStatus, StoreError> {
    let row: Option<(i64, DateTime<Utc>)> =
        sqlx::query_as("SELECT version, migrated_at FROM schema_meta WHERE store = ?")
            .bind(kind.label())
            .fetch_optional(pool)
            .await?;

    Ok(match row {
        Some((version, migrated_at)) => SchemaStatus {
            store: kind,
            version,
            migrated_at: Some(migrated_at),
        },
        None => SchemaStatus {
            store: kind,
            version: 0,
            migrated_at: None,
        },
    })
}

/// Latest schema version this build knows for a store.
pub(crate) fn target_version(kind: StoreKind) -> i64 {
    migrations(kind)
        .iter()
        .map(|(version, _)| *version)
        .max()
        .unwrap_or(0)
}
