//! Recognition engines: the OCR boundary.

use async_trait::async_trait;
use mime::Mime;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::DocumentKind;

/// One line of recognized text with the engine's own confidence for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedLine {
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognizedPage {
    pub lines: Vec<RecognizedLine>,
    /// Dominant colour of the image, when the engine reports one. Used to tell
    /// mobile-money receipts apart.
    #[serde(default)]
    pub dominant_rgb: Option<[u8; 3]>,
}

impl RecognizedPage {
    pub fn from_lines<I, S>(lines: I, confidence: f32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines
                .into_iter()
                .map(|text| RecognizedLine {
                    text: text.into(),
                    confidence,
                })
                .collect(),
            dominant_rgb: None,
        }
    }

    pub fn with_colour(mut self, rgb: [u8; 3]) -> Self {
        self.dominant_rgb = Some(rgb);
        self
    }

    pub fn is_blank(&self) -> bool {
        self.lines.iter().all(|line| line.text.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecognitionFailure {
    /// Worth one more attempt: I/O errors, 5xx, overloaded sidecar.
    #[error("transient recognition failure: {0}")]
    Transient(String),
    #[error("recognition failed: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    async fn recognize(
        &self,
        kind: DocumentKind,
        content_type: &Mime,
        bytes: &[u8],
    ) -> Result<RecognizedPage, RecognitionFailure>;
}

/// OCR sidecar reached over HTTP. The raw file is posted as the body; the
/// sidecar answers with a [`RecognizedPage`].
#[derive(Debug, Clone)]
pub struct HttpRecognitionEngine {
    client: Client,
    endpoint: String,
}

impl HttpRecognitionEngine {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, RecognitionFailure> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RecognitionFailure::Permanent(format!("http client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl RecognitionEngine for HttpRecognitionEngine {
    async fn recognize(
        &self,
        kind: DocumentKind,
        content_type: &Mime,
        bytes: &[u8],
    ) -> Result<RecognizedPage, RecognitionFailure> {
        debug!(endpoint = %self.endpoint, kind = kind.label(), %content_type, size = bytes.len(), "calling recognition sidecar");

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("kind", kind.label())])
            .header(reqwest::header::CONTENT_TYPE, content_type.as_ref())
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() || err.is_connect() || err.is_request() {
                    RecognitionFailure::Transient(err.to_string())
                } else {
                    RecognitionFailure::Permanent(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RecognitionFailure::Transient(format!("sidecar answered {status}")));
        }
        if !status.is_success() {
            return Err(RecognitionFailure::Permanent(format!("sidecar answered {status}")));
        }

        response
            .json::<RecognizedPage>()
            .await
            .map_err(|err| RecognitionFailure::Permanent(format!("malformed sidecar payload: {err}")))
    }
}

/// Used when no sidecar is configured: every document goes to manual entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableRecognitionEngine;

#[async_trait]
impl RecognitionEngine for UnavailableRecognitionEngine {
    async fn recognize(
        &self,
        _kind: DocumentKind,
        _content_type: &Mime,
        _bytes: &[u8],
    ) -> Result<RecognizedPage, RecognitionFailure> {
        Err(RecognitionFailure::Permanent(
            "no recognition engine configured".to_string(),
        ))
    }
}
