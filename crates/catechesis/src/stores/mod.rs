//! Ownership of the three isolated embedded stores.
//!
//! Each store is its own SQLite file in WAL mode with a bounded pool and a bounded
//! lock wait. Nothing here spans stores: references between them are checked by the
//! workflows before writing and tolerate eventual consistency.

mod backup;
mod schema;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::PipelineError;

pub use backup::{restore, BackupManifest};
pub use schema::SchemaStatus;

/// The three logically isolated stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Enrollment,
    AccessPages,
    Registry,
}

impl StoreKind {
    pub const ALL: [StoreKind; 3] = [
        StoreKind::Enrollment,
        StoreKind::AccessPages,
        StoreKind::Registry,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            StoreKind::Enrollment => "enrollment",
            StoreKind::AccessPages => "access_pages",
            StoreKind::Registry => "registry",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.db", self.label())
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "enrollment" | "catechism" => Ok(StoreKind::Enrollment),
            "access_pages" | "pages" => Ok(StoreKind::AccessPages),
            "registry" | "system" => Ok(StoreKind::Registry),
            other => Err(format!(
                "unknown store '{other}' (expected enrollment, access_pages or registry)"
            )),
        }
    }
}

/// Failures opening, migrating, or copying a store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot prepare {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot open the {store} store: {source}")]
    Connect { store: StoreKind, source: sqlx::Error },
    #[error("migration {version} of the {store} store failed: {source}")]
    Migration {
        store: StoreKind,
        version: i64,
        source: sqlx::Error,
    },
    #[error("backup of the {store} store failed: {reason}")]
    Backup { store: StoreKind, reason: String },
    #[error("restore of the {store} store refused: {reason}")]
    Restore { store: StoreKind, reason: String },
    #[error(transparent)]
    Query(#[from] sqlx::Error),
}

/// Cross-store and contention failures; see [`ConsistencyError::is_retryable`].
#[derive(Debug, thiserror::Error)]
pub enum ConsistencyError {
    #[error("store busy, retry later: {0}")]
    StoreBusy(String),
    #[error("{entity} {id} referenced from the {store} store does not exist")]
    MissingReference {
        store: StoreKind,
        entity: &'static str,
        id: String,
    },
}

impl ConsistencyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsistencyError::StoreBusy(_))
    }
}

/// Handle over the three pools. Cloning shares the pools.
#[derive(Debug, Clone)]
pub struct StoreSet {
    enrollment: SqlitePool,
    access_pages: SqlitePool,
    registry: SqlitePool,
    config: StorageConfig,
}

impl StoreSet {
    /// Open (creating when missing) and migrate all three stores.
    pub async fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: config.data_dir.clone(),
                source,
            })?;

        let enrollment = connect(StoreKind::Enrollment, config).await?;
        let access_pages = connect(StoreKind::AccessPages, config).await?;
        let registry = connect(StoreKind::Registry, config).await?;

        let stores = Self {
            enrollment,
            access_pages,
            registry,
            config: config.clone(),
        };

        for kind in StoreKind::ALL {
            schema::migrate(kind, stores.pool(kind)).await?;
        }

        info!(
            data_dir = %config.data_dir.display(),
            pool_size = config.pool_size,
            "stores ready"
        );
        Ok(stores)
    }

    pub fn pool(&self, kind: StoreKind) -> &SqlitePool {
        match kind {
            StoreKind::Enrollment => &self.enrollment,
            StoreKind::AccessPages => &self.access_pages,
            StoreKind::Registry => &self.registry,
        }
    }

    pub fn enrollment(&self) -> &SqlitePool {
        &self.enrollment
    }

    pub fn access_pages(&self) -> &SqlitePool {
        &self.access_pages
    }

    pub fn registry(&self) -> &SqlitePool {
        &self.registry
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn path_of(&self, kind: StoreKind) -> PathBuf {
        self.config.data_dir.join(kind.file_name())
    }

    pub async fn schema_status(&self) -> Result<Vec<SchemaStatus>, StoreError> {
        let mut statuses = Vec::with_capacity(StoreKind::ALL.len());
        for kind in StoreKind::ALL {
            statuses.push(schema::status(kind, self.pool(kind)).await?);
        }
        Ok(statuses)
    }

    /// Run a store operation, retrying a bounded number of times while the store is busy.
    pub async fn retrying<T, F, Fut>(
        &self,
        operation: &'static str,
        attempt: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        with_busy_retry(self.config.busy_retries, operation, attempt).await
    }

    pub async fn close(&self) {
        self.enrollment.close().await;
        self.access_pages.close().await;
        self.registry.close().await;
    }
}

async fn connect(kind: StoreKind, config: &StorageConfig) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(config.data_dir.join(kind.file_name()))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(config.busy_timeout)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(config.pool_size.max(1))
        .acquire_timeout(config.busy_timeout)
        .connect_with(options)
        .await
        .map_err(|source| StoreError::Connect {
            store: kind,
            source,
        })
}

/// SQLITE_BUSY / SQLITE_LOCKED (and their extended codes) or an exhausted pool.
pub fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            matches!(
                db.code().as_deref(),
                Some("5") | Some("6") | Some("261") | Some("262") | Some("517")
            ) || db.message().contains("database is locked")
        }
        _ => false,
    }
}

pub async fn with_busy_retry<T, F, Fut>(
    retries: u32,
    operation: &'static str,
    mut attempt: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut tries = 0u32;
    loop {
        match attempt().await {
            Err(err) if err.is_retryable() && tries < retries => {
                tries += 1;
                let backoff = Duration::from_millis(25 * 2u64.pow(tries));
                debug!(operation, tries, ?backoff, "store busy, retrying");
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }
}

/// Take the store's write lock before anything is read, so concurrent writers queue
/// behind the busy timeout instead of failing on a stale snapshot.
pub async fn claim(conn: &mut SqliteConnection, name: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO write_claims (name, claimed_at) VALUES (?, ?) \
         ON CONFLICT(name) DO UPDATE SET claimed_at = excluded.claimed_at",
    )
    .bind(name)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Atomic increment-and-read of the per-year enrollment counter.
pub async fn next_sequence(conn: &mut SqliteConnection, year: i32) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO number_sequences (year, last_value) VALUES (?, 1) \
         ON CONFLICT(year) DO UPDATE SET last_value = last_value + 1 \
         RETURNING last_value",
    )
    .bind(year)
    .fetch_one(&mut *conn)
    .await
}
