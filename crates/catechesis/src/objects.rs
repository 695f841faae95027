//! Raw document storage behind short-lived signed references.
//!
//! Keys follow `{year}/{enrollment_id}/{kind}/{document_id}.{ext}`. Workflows
//! keep the key and hand out signed references; bytes are only held while a
//! document is being accepted or recognized.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::debug;

use crate::config::ObjectStoreConfig;
use crate::error::PipelineError;

#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("invalid object key '{0}'")]
    InvalidKey(String),
    #[error("object '{0}' not found")]
    NotFound(String),
    #[error("signed reference is invalid")]
    InvalidSignature,
    #[error("signed reference expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("object storage i/o failure on '{key}': {source}")]
    Io {
        key: String,
        source: std::io::Error,
    },
}

impl From<ObjectError> for PipelineError {
    fn from(value: ObjectError) -> Self {
        match value {
            ObjectError::NotFound(key) => PipelineError::not_found("object", key),
            ObjectError::InvalidKey(_) | ObjectError::InvalidSignature | ObjectError::Expired(_) => {
                PipelineError::validation(value.to_string())
            }
            ObjectError::Io { .. } => PipelineError::Store(value.to_string()),
        }
    }
}

/// Time-limited capability to read one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedReference {
    pub key: String,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
}

impl SignedReference {
    /// Query-string form handed to clients.
    pub fn token(&self) -> String {
        format!(
            "{}?expires={}&signature={}",
            self.key,
            self.expires_at.timestamp(),
            self.signature
        )
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectError>;
    /// Returns whether an object was removed.
    async fn delete(&self, key: &str) -> Result<bool, ObjectError>;
    fn sign(&self, key: &str) -> SignedReference;
    fn verify(&self, reference: &SignedReference) -> Result<(), ObjectError>;

    async fn open(&self, reference: &SignedReference) -> Result<Vec<u8>, ObjectError> {
        self.verify(reference)?;
        self.get(&reference.key).await
    }
}

pub fn object_key(
    year: i32,
    enrollment: impl std::fmt::Display,
    kind: &str,
    document: impl std::fmt::Display,
    extension: &str,
) -> String {
    format!("{year}/{enrollment}/{kind}/{document}.{extension}")
}

/// Object store on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    secret: String,
    ttl: Duration,
}

impl FsObjectStore {
    pub fn new(config: &ObjectStoreConfig) -> Self {
        Self {
            root: config.root.clone(),
            secret: config.signing_secret.clone(),
            ttl: config.reference_ttl,
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ObjectError> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !clean {
            return Err(ObjectError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn mac(&self, key: &str, expires_at: i64) -> Result<Hmac<Sha256>, ObjectError> {
        let mut mac = <Hmac<Sha256>>::new_from_slice(self.secret.as_bytes())
            .map_err(|_| ObjectError::InvalidSignature)?;
        mac.update(key.as_bytes());
        mac.update(&[0u8]);
        mac.update(&expires_at.to_be_bytes());
        Ok(mac)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectError> {
        let path = self.path_for(key)?;
        let io = |source| ObjectError::Io {
            key: key.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        tokio::fs::write(&path, bytes).await.map_err(io)?;
        debug!(key, size = bytes.len(), "object stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectError::NotFound(key.to_string()))
            }
            Err(source) => Err(ObjectError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, ObjectError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ObjectError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn sign(&self, key: &str) -> SignedReference {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(15));
        let expires_at = Utc::now() + ttl;
        // HMAC keys have no length limit.
        let signature = self
            .mac(key, expires_at.timestamp())
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
            .unwrap_or_default();
        SignedReference {
            key: key.to_string(),
            expires_at,
            signature,
        }
    }

    fn verify(&self, reference: &SignedReference) -> Result<(), ObjectError> {
        let provided = hex::decode(&reference.signature).map_err(|_| ObjectError::InvalidSignature)?;
        self.mac(&reference.key, reference.expires_at.timestamp())?
            .verify_slice(&provided)
            .map_err(|_| ObjectError::InvalidSignature)?;
        if reference.expires_at <= Utc::now() {
            return Err(ObjectError::Expired(reference.expires_at));
        }
        Ok(())
    }
}
