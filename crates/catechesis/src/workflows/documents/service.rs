use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::domain::{
    inspect_upload, normalize_confirmed, ConfirmRequest, Document, DocumentView, ExtractionStatus,
    UploadReceipt,
};
use super::repository::{self, DocumentDraft};
use crate::access::audit::{self, AuditAction, AuditOutcome, AuditRecord, AuditTrail};
use crate::access::{Capability, Gatekeeper};
use crate::config::IntakeConfig;
use crate::error::PipelineError;
use crate::extraction::{DocumentKind, ExtractionError, ExtractionService};
use crate::ids::{DocumentId, EnrollmentId, ProfileId};
use crate::objects::{object_key, ObjectStore};
use crate::stores::StoreSet;
use crate::workflows::enrollment::{reevaluate, repository as enrollments, EnrollmentStatus, Transition};
use crate::workflows::notify::{self, GuardianNotifier, NoticeKind};

/// Result of confirming a document's fields.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmOutcome {
    pub document: Document,
    pub transition: Transition,
}

/// Upload acceptance, asynchronous extraction and guardian confirmation.
pub struct DocumentService<O, N> {
    stores: StoreSet,
    gatekeeper: Gatekeeper,
    trail: AuditTrail,
    objects: Arc<O>,
    extraction: ExtractionService,
    notifier: Arc<N>,
    number_prefix: String,
    max_bytes: usize,
}

impl<O, N> DocumentService<O, N>
where
    O: ObjectStore + 'static,
    N: GuardianNotifier + 'static,
{
    pub fn new(
        stores: StoreSet,
        gatekeeper: Gatekeeper,
        objects: Arc<O>,
        extraction: ExtractionService,
        notifier: Arc<N>,
        intake: &IntakeConfig,
        max_bytes: usize,
    ) -> Self {
        let trail = gatekeeper.trail().clone();
        Self {
            stores,
            gatekeeper,
            trail,
            objects,
            extraction,
            notifier,
            number_prefix: intake.number_prefix.clone(),
            max_bytes,
        }
    }

    fn pool(&self) -> &SqlitePool {
        self.stores.enrollment()
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Accept a document and schedule its extraction. Returns as soon as the
    /// `pending` record is durable.
    pub async fn upload(
        &self,
        actor: ProfileId,
        enrollment_id: EnrollmentId,
        kind: DocumentKind,
        bytes: &[u8],
    ) -> Result<UploadReceipt, PipelineError> {
        let result = self.upload_inner(actor, enrollment_id, kind, bytes).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::UploadDocument, "document")
                    .detail(json!({ "enrollment_id": enrollment_id, "kind": kind })),
                result,
            )
            .await
    }

    async fn upload_inner(
        &self,
        actor: ProfileId,
        enrollment_id: EnrollmentId,
        kind: DocumentKind,
        bytes: &[u8],
    ) -> Result<UploadReceipt, PipelineError> {
        let format = inspect_upload(bytes, self.max_bytes)?;

        let (enrollment, target) = enrollments::target(self.pool(), enrollment_id).await?;
        self.gatekeeper
            .authorize(actor, Capability::UploadDocument, &target)
            .await?;
        if enrollment.status == EnrollmentStatus::Cancelled {
            return Err(PipelineError::validation("enrollment is cancelled"));
        }

        let id = DocumentId::generate();
        let draft = DocumentDraft {
            id,
            enrollment_id,
            kind,
            storage_key: object_key(enrollment.year, enrollment_id, kind.label(), id, format.extension()),
            format,
            size_bytes: bytes.len() as i64,
            uploaded_by: actor,
        };
        self.objects.put(&draft.storage_key, bytes).await?;

        let draft = &draft;
        let written = self
            .stores
            .retrying("documents.upload", || async move {
                let mut tx = self.pool().begin().await?;
                repository::insert(&mut tx, draft).await?;
                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(actor), AuditAction::UploadDocument, "document")
                        .target(draft.id)
                        .detail(json!({
                            "enrollment_id": draft.enrollment_id,
                            "kind": draft.kind,
                            "format": draft.format,
                            "size_bytes": draft.size_bytes,
                        })),
                )
                .await?;
                tx.commit().await?;
                Ok(())
            })
            .await;

        if let Err(err) = written {
            if let Err(cleanup) = self.objects.delete(&draft.storage_key).await {
                warn!(document = %id, error = %cleanup, "orphaned object could not be removed");
            }
            return Err(err);
        }

        info!(document = %id, enrollment = %enrollment_id, kind = kind.label(), "document accepted");
        tokio::spawn(self.job(id).run());

        Ok(UploadReceipt {
            document_id: id,
            enrollment_id,
            kind,
            extraction_status: ExtractionStatus::Pending,
        })
    }

    fn job(&self, document_id: DocumentId) -> ExtractionJob<O, N> {
        ExtractionJob {
            stores: self.stores.clone(),
            objects: self.objects.clone(),
            extraction: self.extraction.clone(),
            notifier: self.notifier.clone(),
            document_id,
        }
    }

    /// Current extraction state, with a short-lived reference to the raw file
    /// while it is still retained.
    pub async fn get_extraction(
        &self,
        actor: ProfileId,
        id: DocumentId,
    ) -> Result<DocumentView, PipelineError> {
        let document = repository::load(self.pool(), id)
            .await?
            .ok_or_else(|| PipelineError::not_found("document", id))?;
        let (_, target) = enrollments::target(self.pool(), document.enrollment_id).await?;
        self.gatekeeper
            .authorize(actor, Capability::ViewEnrollment, &target)
            .await?;

        let storage_reference = document
            .storage_key
            .as_deref()
            .map(|key| self.objects.sign(key));
        Ok(DocumentView {
            document,
            storage_reference,
        })
    }

    /// Record the guardian-confirmed field set and re-derive the enrollment status.
    pub async fn confirm(
        &self,
        actor: ProfileId,
        id: DocumentId,
        request: ConfirmRequest,
    ) -> Result<ConfirmOutcome, PipelineError> {
        let result = self.confirm_inner(actor, id, request).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::ConfirmDocument, "document").target(id),
                result,
            )
            .await
    }

    async fn confirm_inner(
        &self,
        actor: ProfileId,
        id: DocumentId,
        request: ConfirmRequest,
    ) -> Result<ConfirmOutcome, PipelineError> {
        let document = repository::load(self.pool(), id)
            .await?
            .ok_or_else(|| PipelineError::not_found("document", id))?;
        let enrollment_id = document.enrollment_id;
        let (enrollment, target) = enrollments::target(self.pool(), enrollment_id).await?;
        self.gatekeeper
            .authorize(actor, Capability::ConfirmDocument, &target)
            .await?;
        if enrollment.status == EnrollmentStatus::Cancelled {
            return Err(PipelineError::validation("enrollment is cancelled"));
        }

        let kind = document.kind;
        let fields = normalize_confirmed(kind, request.fields)?;
        if kind == DocumentKind::BirthRecord {
            let confirmed = fields
                .get("birth_date")
                .and_then(|value| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok());
            if confirmed != Some(enrollment.birth_date) {
                return Err(PipelineError::validation(format!(
                    "birth record date does not match the enrollment ({})",
                    enrollment.birth_date
                )));
            }
        }

        let fields = &fields;
        let prefix = self.number_prefix.as_str();
        let transition = self
            .stores
            .retrying("documents.confirm", || async move {
                let mut tx = self.pool().begin().await?;
                if !enrollments::touch(&mut tx, enrollment_id).await? {
                    return Err(PipelineError::not_found("enrollment", enrollment_id));
                }
                repository::confirm(&mut tx, id, fields, actor).await?;
                repository::apply_to_enrollment(&mut tx, enrollment_id, kind, fields).await?;
                let transition = reevaluate(&mut tx, enrollment_id, prefix, Some(actor)).await?;
                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(actor), AuditAction::ConfirmDocument, "document")
                        .target(id)
                        .detail(json!({
                            "enrollment_id": enrollment_id,
                            "kind": kind,
                            "fields": fields.keys().collect::<Vec<_>>(),
                            "from": transition.from,
                            "to": transition.to,
                        })),
                )
                .await?;
                tx.commit().await?;
                Ok(transition)
            })
            .await?;

        info!(document = %id, enrollment = %enrollment_id, status = %transition.to, "document confirmed");
        if transition.activated() {
            let owners = enrollments::owners(self.pool(), enrollment_id).await?;
            notify::dispatch(
                self.notifier.as_ref(),
                &owners,
                enrollment_id,
                NoticeKind::EnrollmentActivated,
                &notify::activation_details(&transition),
            );
        }

        let document = repository::load(self.pool(), id)
            .await?
            .ok_or_else(|| PipelineError::not_found("document", id))?;
        Ok(ConfirmOutcome {
            document,
            transition,
        })
    }
}

/// Move a pending or running document to `failed` with an audited reason.
/// False when it had already settled.
pub(crate) async fn fail_extraction(
    stores: &StoreSet,
    id: DocumentId,
    detail: &str,
) -> Result<bool, PipelineError> {
    let pool = stores.enrollment();
    stores
        .retrying("documents.extraction_failed", || async move {
            let mut tx = pool.begin().await?;
            let stored = repository::store_failure(&mut tx, id, detail).await?;
            if stored {
                audit::record(
                    &mut tx,
                    &AuditRecord::new(None, AuditAction::ExtractDocument, "document")
                        .target(id)
                        .outcome(AuditOutcome::Failure)
                        .detail(json!({ "error": "extraction_error", "message": detail })),
                )
                .await?;
            }
            tx.commit().await?;
            Ok(stored)
        })
        .await
}

/// Tell the enrollment's guardians that `document` needs typing in by hand.
pub(crate) async fn request_manual_entry<N>(
    notifier: &N,
    pool: &SqlitePool,
    enrollment_id: EnrollmentId,
    document: DocumentId,
    reason: &str,
) where
    N: GuardianNotifier + ?Sized,
{
    match enrollments::owners(pool, enrollment_id).await {
        Ok(owners) => notify::dispatch(
            notifier,
            &owners,
            enrollment_id,
            NoticeKind::ManualEntryRequired,
            &notify::details([
                ("document_id", document.to_string()),
                ("reason", reason.to_string()),
            ]),
        ),
        Err(err) => {
            warn!(%document, error = %err, "guardians could not be looked up for a manual entry notice")
        }
    }
}

/// Background recognition of one uploaded document.
struct ExtractionJob<O, N> {
    stores: StoreSet,
    objects: Arc<O>,
    extraction: ExtractionService,
    notifier: Arc<N>,
    document_id: DocumentId,
}

impl<O, N> ExtractionJob<O, N>
where
    O: ObjectStore + 'static,
    N: GuardianNotifier + 'static,
{
    async fn run(self) {
        if let Err(err) = self.execute().await {
            self.abandon(&err).await;
        }
    }

    /// Best effort after an internal error: the document must not stay
    /// `running`. Whatever is left is picked up by the stalled-extraction sweep.
    async fn abandon(&self, err: &PipelineError) {
        let id = self.document_id;
        warn!(document = %id, error = %err, "extraction job aborted");
        let reason = format!("extraction interrupted: {err}");
        match fail_extraction(&self.stores, id, &reason).await {
            Ok(true) => {
                match repository::load(self.stores.enrollment(), id).await {
                    Ok(Some(document)) => {
                        request_manual_entry(
                            self.notifier.as_ref(),
                            self.stores.enrollment(),
                            document.enrollment_id,
                            id,
                            &reason,
                        )
                        .await
                    }
                    Ok(None) => {}
                    Err(load_err) => {
                        warn!(document = %id, error = %load_err, "failed document could not be reloaded")
                    }
                }
            }
            Ok(false) => debug!(document = %id, "document settled before the job gave up"),
            Err(store_err) => {
                warn!(document = %id, error = %store_err, "aborted extraction left for the stalled sweep")
            }
        }
    }

    async fn execute(&self) -> Result<(), PipelineError> {
        let pool = self.stores.enrollment();
        let id = self.document_id;
        if !repository::mark_running(pool, id).await? {
            debug!(document = %id, "document no longer pending, extraction skipped");
            return Ok(());
        }

        let document = repository::load(pool, id)
            .await?
            .ok_or_else(|| PipelineError::not_found("document", id))?;
        let outcome = match document.storage_key.as_deref() {
            Some(key) => {
                let reference = self.objects.sign(key);
                match self.objects.open(&reference).await {
                    Ok(bytes) => {
                        self.extraction
                            .extract(document.kind, &document.format.mime(), &bytes)
                            .await
                    }
                    Err(err) => Err(ExtractionError::Unavailable(err.to_string())),
                }
            }
            None => Err(ExtractionError::Unavailable("raw file is no longer retained".to_string())),
        };

        let enrollment_id = document.enrollment_id;
        match outcome {
            Ok(extraction) => {
                let extraction = &extraction;
                let stored = self
                    .stores
                    .retrying("documents.extraction", || async move {
                        let mut tx = pool.begin().await?;
                        let stored = repository::store_extraction(&mut tx, id, extraction).await?;
                        if stored {
                            audit::record(
                                &mut tx,
                                &AuditRecord::new(None, AuditAction::ExtractDocument, "document")
                                    .target(id)
                                    .detail(json!({
                                        "confidence": extraction.confidence,
                                        "requires_manual_check": extraction.requires_manual_check,
                                        "provider": extraction.provider,
                                    })),
                            )
                            .await?;
                        }
                        tx.commit().await?;
                        Ok(stored)
                    })
                    .await?;
                if stored {
                    info!(document = %id, confidence = extraction.confidence, "extraction succeeded");
                    match enrollments::owners(pool, enrollment_id).await {
                        Ok(owners) => notify::dispatch(
                            self.notifier.as_ref(),
                            &owners,
                            enrollment_id,
                            NoticeKind::ExtractionReady,
                            &notify::details([
                                ("document_id", id.to_string()),
                                ("confidence", format!("{:.2}", extraction.confidence)),
                                (
                                    "requires_manual_check",
                                    extraction.requires_manual_check.to_string(),
                                ),
                            ]),
                        ),
                        Err(err) => {
                            warn!(document = %id, error = %err, "guardians could not be looked up for an extraction notice")
                        }
                    }
                }
            }
            Err(err) => {
                warn!(document = %id, error = %err, "extraction failed, manual entry required");
                let detail = err.to_string();
                if fail_extraction(&self.stores, id, &detail).await? {
                    request_manual_entry(self.notifier.as_ref(), pool, enrollment_id, id, &detail)
                        .await;
                }
            }
        }
        Ok(())
    }
}
