//! Optical extraction of structured fields from uploaded documents.
//!
//! A [`RecognitionEngine`] turns the raw file into text lines; a per-kind template
//! then reads field candidates off those lines. The service enforces the hard
//! timeout, the single retry on transient failures, and the confidence score.

pub mod engine;
pub mod providers;
pub mod templates;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use mime::Mime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::error::PipelineError;

pub use engine::{
    HttpRecognitionEngine, RecognitionEngine, RecognitionFailure, RecognizedLine, RecognizedPage,
    UnavailableRecognitionEngine,
};
pub use providers::{MobileMoneyProvider, ProviderMatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    BirthRecord,
    BaptismRecord,
    TransferAttestation,
    PaymentProof,
}

impl DocumentKind {
    pub const fn label(self) -> &'static str {
        match self {
            DocumentKind::BirthRecord => "birth_record",
            DocumentKind::BaptismRecord => "baptism_record",
            DocumentKind::TransferAttestation => "transfer_attestation",
            DocumentKind::PaymentProof => "payment_proof",
        }
    }

    /// Fields a confirmation must carry before the document counts as complete.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            DocumentKind::BirthRecord => &["last_name", "given_names", "birth_date"],
            DocumentKind::BaptismRecord => &["baptism_date", "parish"],
            DocumentKind::TransferAttestation => &["origin_parish"],
            DocumentKind::PaymentProof => &[],
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DocumentKind {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "birth_record" | "birth" => Ok(DocumentKind::BirthRecord),
            "baptism_record" | "baptism" => Ok(DocumentKind::BaptismRecord),
            "transfer_attestation" | "transfer" => Ok(DocumentKind::TransferAttestation),
            "payment_proof" | "proof" => Ok(DocumentKind::PaymentProof),
            other => Err(PipelineError::validation(format!(
                "unknown document kind '{other}'"
            ))),
        }
    }
}

/// Recognition outcome that could not be turned into fields. Always recoverable
/// through manual entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("recognition timed out after {0:?}")]
    Timeout(Duration),
    #[error("recognition unavailable: {0}")]
    Unavailable(String),
    #[error("recognition failed: {0}")]
    Failed(String),
    #[error("no text could be recognized")]
    Unreadable,
}

/// Field candidates read from one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extraction {
    pub fields: BTreeMap<String, Option<String>>,
    pub confidence: f32,
    /// Set when confidence is below the auto-fill threshold: every field must
    /// be checked by the guardian.
    pub requires_manual_check: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<MobileMoneyProvider>,
}

impl Extraction {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|value| value.as_deref())
    }
}

const MAX_ATTEMPTS: u32 = 2;

#[derive(Clone)]
pub struct ExtractionService {
    engine: Arc<dyn RecognitionEngine>,
    timeout: Duration,
    threshold: f32,
}

impl fmt::Debug for ExtractionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionService")
            .field("timeout", &self.timeout)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl ExtractionService {
    pub fn new(engine: Arc<dyn RecognitionEngine>, config: &ExtractionConfig) -> Self {
        Self {
            engine,
            timeout: config.timeout,
            threshold: config.confidence_threshold,
        }
    }

    /// The HTTP sidecar when an endpoint is configured, manual entry otherwise.
    pub fn from_config(config: &ExtractionConfig) -> Self {
        let engine: Arc<dyn RecognitionEngine> = match config.endpoint.as_deref() {
            Some(endpoint) => match HttpRecognitionEngine::new(endpoint, config.timeout) {
                Ok(engine) => Arc::new(engine),
                Err(err) => {
                    warn!(error = %err, "recognition sidecar unusable, documents need manual entry");
                    Arc::new(UnavailableRecognitionEngine)
                }
            },
            None => {
                info!("no recognition endpoint configured, documents need manual entry");
                Arc::new(UnavailableRecognitionEngine)
            }
        };
        Self::new(engine, config)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub async fn extract(
        &self,
        kind: DocumentKind,
        content_type: &Mime,
        bytes: &[u8],
    ) -> Result<Extraction, ExtractionError> {
        let page = self.recognize(kind, content_type, bytes).await?;
        if page.is_blank() {
            return Err(ExtractionError::Unreadable);
        }

        let extraction = self.score(kind, &page);
        debug!(
            kind = kind.label(),
            confidence = extraction.confidence,
            manual = extraction.requires_manual_check,
            "document extracted"
        );
        Ok(extraction)
    }

    async fn recognize(
        &self,
        kind: DocumentKind,
        content_type: &Mime,
        bytes: &[u8],
    ) -> Result<RecognizedPage, ExtractionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(
                self.timeout,
                self.engine.recognize(kind, content_type, bytes),
            )
            .await;

            let transient = match outcome {
                Ok(Ok(page)) => return Ok(page),
                Ok(Err(RecognitionFailure::Permanent(reason))) => {
                    return Err(ExtractionError::Failed(reason))
                }
                Ok(Err(RecognitionFailure::Transient(reason))) => {
                    ExtractionError::Unavailable(reason)
                }
                Err(_) => ExtractionError::Timeout(self.timeout),
            };

            if attempt >= MAX_ATTEMPTS {
                return Err(transient);
            }
            warn!(kind = kind.label(), attempt, error = %transient, "transient recognition failure, retrying once");
        }
    }

    fn score(&self, kind: DocumentKind, page: &RecognizedPage) -> Extraction {
        let detected = match kind {
            DocumentKind::PaymentProof => Some(providers::detect(page)),
            _ => None,
        };

        let mut matched = templates::apply(kind, page);
        let mut expected = matched.fields.len();
        if let Some(detected) = detected {
            expected += 1;
            matched.fields.insert(
                "provider".to_string(),
                detected.map(|found| found.provider.label().to_string()),
            );
            if let Some(found) = detected {
                matched.confidences.push(found.score);
            }
        }
        let provider = detected.flatten().map(|found| found.provider);

        let confidence = confidence(&matched.confidences, expected);
        Extraction {
            fields: matched.fields,
            confidence,
            requires_manual_check: confidence < self.threshold,
            provider,
        }
    }
}

/// Mean confidence of the fields read, scaled by the share of fields read.
/// A non-finite engine score counts as zero.
fn confidence(read: &[f32], expected: usize) -> f32 {
    if read.is_empty() || expected == 0 {
        return 0.0;
    }
    let mean = read
        .iter()
        .map(|score| if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 })
        .sum::<f32>()
        / read.len() as f32;
    let coverage = read.len().min(expected) as f32 / expected as f32;
    (mean * coverage).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays scripted engine answers in order.
    struct ScriptedEngine {
        answers: Mutex<Vec<Result<RecognizedPage, RecognitionFailure>>>,
        calls: AtomicU32,
        content_types: Mutex<Vec<String>>,
    }

    impl ScriptedEngine {
        fn new(mut answers: Vec<Result<RecognizedPage, RecognitionFailure>>) -> Arc<Self> {
            answers.reverse();
            Arc::new(Self {
                answers: Mutex::new(answers),
                calls: AtomicU32::new(0),
                content_types: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RecognitionEngine for ScriptedEngine {
        async fn recognize(
            &self,
            _kind: DocumentKind,
            content_type: &Mime,
            _bytes: &[u8],
        ) -> Result<RecognizedPage, RecognitionFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.content_types
                .lock()
                .expect("engine script poisoned")
                .push(content_type.to_string());
            self.answers
                .lock()
                .expect("engine script poisoned")
                .pop()
                .unwrap_or_else(|| Err(RecognitionFailure::Permanent("script exhausted".into())))
        }
    }

    struct StalledEngine;

    #[async_trait]
    impl RecognitionEngine for StalledEngine {
        async fn recognize(
            &self,
            _kind: DocumentKind,
            _content_type: &Mime,
            _bytes: &[u8],
        ) -> Result<RecognizedPage, RecognitionFailure> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(RecognizedPage::default())
        }
    }

    fn config() -> ExtractionConfig {
        ExtractionConfig {
            timeout: Duration::from_millis(50),
            ..ExtractionConfig::default()
        }
    }

    fn birth_page(confidence: f32) -> RecognizedPage {
        RecognizedPage::from_lines(
            [
                "Nom : DIALLO",
                "Prénoms : Amadou",
                "Né le 12/03/2015",
                "Lieu de naissance : Thiès",
            ],
            confidence,
        )
    }

    #[tokio::test]
    async fn clear_documents_are_auto_filled() {
        let engine = ScriptedEngine::new(vec![Ok(birth_page(0.92))]);
        let service = ExtractionService::new(engine, &config());

        let extraction = service
            .extract(DocumentKind::BirthRecord, &mime::APPLICATION_PDF, b"%PDF")
            .await
            .expect("extracted");
        assert!((extraction.confidence - 0.92).abs() < 1e-4);
        assert!(!extraction.requires_manual_check);
        assert_eq!(extraction.field("birth_date"), Some("2015-03-12"));
    }

    #[tokio::test]
    async fn low_confidence_still_fills_fields_but_flags_them() {
        let engine = ScriptedEngine::new(vec![Ok(birth_page(0.55))]);
        let service = ExtractionService::new(engine, &config());

        let extraction = service
            .extract(DocumentKind::BirthRecord, &mime::APPLICATION_PDF, b"%PDF")
            .await
            .expect("extracted");
        assert!(extraction.confidence < 0.70);
        assert!(extraction.requires_manual_check);
        assert_eq!(extraction.field("last_name"), Some("DIALLO"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_once() {
        let engine = ScriptedEngine::new(vec![
            Err(RecognitionFailure::Transient("503".into())),
            Ok(birth_page(0.9)),
        ]);
        let service = ExtractionService::new(engine.clone(), &config());

        service
            .extract(DocumentKind::BirthRecord, &mime::APPLICATION_PDF, b"%PDF")
            .await
            .expect("second attempt succeeds");
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let engine = ScriptedEngine::new(vec![
            Err(RecognitionFailure::Permanent("unsupported".into())),
            Ok(birth_page(0.9)),
        ]);
        let service = ExtractionService::new(engine.clone(), &config());

        let err = service
            .extract(DocumentKind::BirthRecord, &mime::APPLICATION_PDF, b"%PDF")
            .await
            .expect_err("fails");
        assert!(matches!(err, ExtractionError::Failed(_)));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_surface_as_explicit_failures() {
        let service = ExtractionService::new(Arc::new(StalledEngine), &config());
        let err = service
            .extract(DocumentKind::BaptismRecord, &mime::APPLICATION_PDF, b"%PDF")
            .await
            .expect_err("times out");
        assert_eq!(err, ExtractionError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn proof_extraction_detects_the_provider() {
        let page = RecognizedPage::from_lines(
            [
                "Wave",
                "Vous avez envoyé 15 000 F",
                "ID de transaction : T-WAVE-88121",
                "Date : 02/10/2025 09:15",
            ],
            0.9,
        );
        let engine = ScriptedEngine::new(vec![Ok(page)]);
        let service = ExtractionService::new(engine, &config());

        let extraction = service
            .extract(DocumentKind::PaymentProof, &mime::IMAGE_PNG, b"\x89PNG")
            .await
            .expect("extracted");
        assert_eq!(extraction.provider, Some(MobileMoneyProvider::Wave));
        assert_eq!(extraction.field("provider"), Some("wave"));
        assert_eq!(extraction.field("amount"), Some("15000"));
    }

    #[tokio::test]
    async fn unconfigured_engine_forces_manual_entry() {
        let service = ExtractionService::from_config(&ExtractionConfig::default());
        let err = service
            .extract(DocumentKind::BirthRecord, &mime::APPLICATION_PDF, b"%PDF")
            .await
            .expect_err("no engine");
        assert!(matches!(err, ExtractionError::Failed(_)));
    }

    #[test]
    fn confidence_is_scaled_by_coverage() {
        assert_eq!(confidence(&[], 4), 0.0);
        assert!((confidence(&[0.8, 0.8], 4) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn non_finite_scores_count_as_zero() {
        assert!((confidence(&[f32::NAN, 0.8], 2) - 0.4).abs() < 1e-6);
        assert_eq!(confidence(&[f32::INFINITY], 1), 0.0);
        assert_eq!(confidence(&[1.7], 1), 1.0);
    }

    #[tokio::test]
    async fn a_nan_engine_score_is_flagged_for_checking() {
        let engine = ScriptedEngine::new(vec![Ok(birth_page(f32::NAN))]);
        let service = ExtractionService::new(engine, &config());

        let extraction = service
            .extract(DocumentKind::BirthRecord, &mime::APPLICATION_PDF, b"%PDF")
            .await
            .expect("extracted");
        assert!(extraction.confidence.is_finite());
        assert_eq!(extraction.confidence, 0.0);
        assert!(extraction.requires_manual_check);
    }

    #[tokio::test]
    async fn the_content_type_reaches_the_engine() {
        let engine = ScriptedEngine::new(vec![Ok(birth_page(0.9))]);
        let service = ExtractionService::new(engine.clone(), &config());

        service
            .extract(DocumentKind::BirthRecord, &mime::IMAGE_JPEG, b"\xFF\xD8\xFF")
            .await
            .expect("extracted");
        assert_eq!(
            *engine.content_types.lock().expect("engine script poisoned"),
            vec!["image/jpeg".to_string()]
        );
    }

    #[test]
    fn kinds_parse_from_path_values() {
        assert_eq!(
            "birth-record".parse::<DocumentKind>().expect("parses"),
            DocumentKind::BirthRecord
        );
        assert!("passport".parse::<DocumentKind>().is_err());
    }
}
