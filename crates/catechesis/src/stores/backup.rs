use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use tracing::{info, warn};

use super::{schema, StoreError, StoreKind, StoreSet};
use crate::config::StorageConfig;

/// Record of one store copy; also persisted in the registry store.
#[derive(Debug, Clone, Serialize)]
pub struct BackupManifest {
    pub store: StoreKind,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub schema_version: i64,
    pub created_at: DateTime<Utc>,
}

impl StoreSet {
    /// Copy one store into `dir` as `<store>-<timestamp>.db`, independent of the others.
    pub async fn backup(&self, kind: StoreKind, dir: &Path) -> Result<BackupManifest, StoreError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;

        let created_at = Utc::now();
        let target = dir.join(format!(
            "{}-{}.db",
            kind.label(),
            created_at.format("%Y%m%dT%H%M%S%.3fZ")
        ));
        let target_str = target.to_str().ok_or_else(|| StoreError::Backup {
            store: kind,
            reason: format!("backup path {} is not valid UTF-8", target.display()),
        })?;

        sqlx::query("VACUUM INTO ?")
            .bind(target_str)
            .execute(self.pool(kind))
            .await
            .map_err(|err| StoreError::Backup {
                store: kind,
                reason: err.to_string(),
            })?;

        let size_bytes = tokio::fs::metadata(&target)
            .await
            .map_err(|source| StoreError::Io {
                path: target.clone(),
                source,
            })?
            .len();
        let schema_version = schema::status(kind, self.pool(kind)).await?.version;

        let manifest = BackupManifest {
            store: kind,
            path: target,
            size_bytes,
            schema_version,
            created_at,
        };

        if let Err(err) = self.record_backup(&manifest).await {
            warn!(store = %kind, error = %err, "backup written but manifest not recorded");
        }

        info!(store = %kind, path = %manifest.path.display(), size_bytes, "store backed up");
        Ok(manifest)
    }

    pub async fn backup_all(&self, dir: &Path) -> Result<Vec<BackupManifest>, StoreError> {
        let mut manifests = Vec::with_capacity(StoreKind::ALL.len());
        for kind in StoreKind::ALL {
            manifests.push(self.backup(kind, dir).await?);
        }
        Ok(manifests)
    }

    async fn record_backup(&self, manifest: &BackupManifest) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO backups (store, path, size_bytes, schema_version, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(manifest.store.label())
        .bind(manifest.path.to_string_lossy().into_owned())
        .bind(i64::try_from(manifest.size_bytes).unwrap_or(i64::MAX))
        .bind(manifest.schema_version)
        .bind(manifest.created_at)
        .execute(self.registry())
        .await?;
        Ok(())
    }
}

/// Replace one store file with a backup. Pools for that store must be closed.
pub async fn restore(
    config: &StorageConfig,
    kind: StoreKind,
    backup: &Path,
) -> Result<PathBuf, StoreError> {
    let refuse = |reason: String| StoreError::Restore { store: kind, reason };

    let mut conn = SqliteConnectOptions::new()
        .filename(backup)
        .read_only(true)
        .connect()
        .await
        .map_err(|err| refuse(format!("cannot open {}: {err}", backup.display())))?;

    let version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_meta WHERE store = ?")
            .bind(kind.label())
            .fetch_optional(&mut conn)
            .await
            .map_err(|err| refuse(format!("not a {kind} store: {err}")))?;
    conn.close()
        .await
        .map_err(|err| refuse(err.to_string()))?;

    let version = version.ok_or_else(|| refuse(format!("backup holds no {kind} schema record")))?;
    if version > schema::target_version(kind) {
        return Err(refuse(format!(
            "backup schema {version} is newer than this build supports"
        )));
    }

    let target = config.data_dir.join(kind.file_name());
    for suffix in ["-wal", "-shm"] {
        let sidecar = PathBuf::from(format!("{}{suffix}", target.display()));
        match tokio::fs::remove_file(&sidecar).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Io {
                    path: sidecar,
                    source,
                })
            }
        }
    }

    tokio::fs::copy(backup, &target)
        .await
        .map_err(|source| StoreError::Io {
            path: target.clone(),
            source,
        })?;

    info!(store = %kind, from = %backup.display(), "store restored");
    Ok(target)
}
