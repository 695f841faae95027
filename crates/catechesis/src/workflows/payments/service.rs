use std::sync::Arc;

use serde_json::json;
use sqlx::SqlitePool;
use tracing::info;

use super::domain::{
    AdvisoryProof, NewPayment, Payment, PaymentMethod, PaymentReceipt, PaymentStatus, QueueEntry, QueueFilter,
    RejectRequest, ReviewOutcome, ValidateRequest,
};
use super::repository::{self, PaymentDraft};
use crate::access::audit::{self, AuditAction, AuditRecord, AuditTrail};
use crate::access::{Capability, Gatekeeper, Target};
use crate::config::IntakeConfig;
use crate::error::PipelineError;
use crate::extraction::DocumentKind;
use crate::ids::{EnrollmentId, PaymentId, ProfileId};
use crate::stores::StoreSet;
use crate::workflows::documents::repository as documents;
use crate::workflows::enrollment::{
    reevaluate, repository as enrollments, Balance, EnrollmentStatus,
};
use crate::workflows::notify::{self, GuardianNotifier, NoticeKind};

/// Payment submission and the treasurer review workflow.
pub struct PaymentService<N> {
    stores: StoreSet,
    gatekeeper: Gatekeeper,
    trail: AuditTrail,
    notifier: Arc<N>,
    number_prefix: String,
    threshold: f32,
}

impl<N> PaymentService<N>
where
    N: GuardianNotifier + 'static,
{
    pub fn new(
        stores: StoreSet,
        gatekeeper: Gatekeeper,
        notifier: Arc<N>,
        intake: &IntakeConfig,
        threshold: f32,
    ) -> Self {
        let trail = gatekeeper.trail().clone();
        Self {
            stores,
            gatekeeper,
            trail,
            notifier,
            number_prefix: intake.number_prefix.clone(),
            threshold,
        }
    }

    fn pool(&self) -> &SqlitePool {
        self.stores.enrollment()
    }

    /// Record a payment for review. Mobile-money payments must point at an
    /// uploaded proof; their amount may be left for the reviewer.
    pub async fn submit(
        &self,
        actor: ProfileId,
        enrollment_id: EnrollmentId,
        request: NewPayment,
    ) -> Result<PaymentReceipt, PipelineError> {
        let result = self.submit_inner(actor, enrollment_id, request).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::SubmitPayment, "payment")
                    .detail(json!({ "enrollment_id": enrollment_id })),
                result,
            )
            .await
    }

    async fn submit_inner(
        &self,
        actor: ProfileId,
        enrollment_id: EnrollmentId,
        request: NewPayment,
    ) -> Result<PaymentReceipt, PipelineError> {
        let method = request.method;
        let reference = request
            .reference
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        if let Some(amount) = request.amount {
            if amount <= 0 {
                return Err(PipelineError::validation("payment amount must be positive"));
            }
        }
        if !method.is_mobile_money() && request.amount.is_none() {
            return Err(PipelineError::validation(format!(
                "a {method} payment needs an amount"
            )));
        }
        if method == PaymentMethod::PrintedReceipt && reference.is_none() {
            return Err(PipelineError::validation("a printed receipt needs its receipt number"));
        }

        let (enrollment, target) = enrollments::target(self.pool(), enrollment_id).await?;
        self.gatekeeper
            .authorize(actor, Capability::SubmitPayment, &target)
            .await?;
        match enrollment.status {
            EnrollmentStatus::Cancelled => {
                return Err(PipelineError::validation("enrollment is cancelled"))
            }
            EnrollmentStatus::Active => {
                return Err(PipelineError::validation("enrollment is already fully paid"))
            }
            _ => {}
        }
        if let Some(amount) = request.amount {
            if amount > enrollment.remaining_balance() {
                return Err(PipelineError::PaymentMismatch {
                    amount,
                    remaining: enrollment.remaining_balance(),
                });
            }
        }

        let proof_document_id = match (method.is_mobile_money(), request.proof_document_id) {
            (true, None) => {
                return Err(PipelineError::validation(format!(
                    "a {method} payment needs an uploaded proof"
                )))
            }
            (_, Some(proof)) => {
                let document = documents::load(self.pool(), proof)
                    .await?
                    .ok_or_else(|| PipelineError::not_found("document", proof))?;
                if document.enrollment_id != enrollment_id || document.kind != DocumentKind::PaymentProof {
                    return Err(PipelineError::validation(format!(
                        "document {proof} is not a payment proof for this enrollment"
                    )));
                }
                Some(proof)
            }
            (false, None) => None,
        };

        let draft = PaymentDraft {
            id: PaymentId::generate(),
            enrollment_id,
            amount: request.amount,
            method,
            reference,
            proof_document_id,
            provider_metadata: method
                .provider()
                .map(|provider| json!({ "provider": provider.label() })),
            submitted_by: actor,
        };
        let draft = &draft;
        self.stores
            .retrying("payments.submit", || async move {
                let mut tx = self.pool().begin().await?;
                repository::insert(&mut tx, draft).await?;
                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(actor), AuditAction::SubmitPayment, "payment")
                        .target(draft.id)
                        .detail(json!({
                            "enrollment_id": draft.enrollment_id,
                            "method": draft.method,
                            "amount": draft.amount,
                            "proof_document_id": draft.proof_document_id,
                        })),
                )
                .await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;

        info!(payment = %draft.id, enrollment = %enrollment_id, method = method.label(), "payment submitted");
        Ok(PaymentReceipt {
            payment_id: draft.id,
            enrollment_id,
            status: PaymentStatus::PendingReview,
        })
    }

    /// Treasurer review queue, oldest first, with the proof extraction as a hint.
    pub async fn queue(
        &self,
        actor: ProfileId,
        filter: QueueFilter,
    ) -> Result<Vec<QueueEntry>, PipelineError> {
        self.gatekeeper
            .authorize(actor, Capability::ViewPaymentQueue, &Target::new("payment"))
            .await?;
        filter.validate()?;

        let payments = repository::queue(self.pool(), &filter).await?;
        let mut entries = Vec::with_capacity(payments.len());
        for payment in payments {
            let enrollment = enrollments::load(self.pool(), payment.enrollment_id)
                .await?
                .ok_or_else(|| PipelineError::not_found("enrollment", payment.enrollment_id))?;
            let advisory = match payment.proof_document_id {
                Some(proof) => documents::load(self.pool(), proof)
                    .await?
                    .map(|document| AdvisoryProof::from_document(&document, self.threshold)),
                None => None,
            };
            entries.push(QueueEntry {
                enrollment_number: enrollment.number.clone(),
                child_name: enrollment.child_name(),
                remaining_balance: enrollment.remaining_balance(),
                payment,
                advisory,
            });
        }
        Ok(entries)
    }

    pub async fn get(&self, actor: ProfileId, id: PaymentId) -> Result<Payment, PipelineError> {
        let payment = repository::load(self.pool(), id)
            .await?
            .ok_or_else(|| PipelineError::not_found("payment", id))?;
        let (_, target) = enrollments::target(self.pool(), payment.enrollment_id).await?;
        self.gatekeeper
            .authorize(actor, Capability::ViewEnrollment, &target)
            .await?;
        Ok(payment)
    }

    /// Validate a payment and re-derive the enrollment status in the same
    /// transaction. Concurrent reviews of one enrollment serialize on its row.
    pub async fn validate(
        &self,
        actor: ProfileId,
        id: PaymentId,
        request: ValidateRequest,
    ) -> Result<ReviewOutcome, PipelineError> {
        let result = self.validate_inner(actor, id, request).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::ValidatePayment, "payment").target(id),
                result,
            )
            .await
    }

    async fn validate_inner(
        &self,
        actor: ProfileId,
        id: PaymentId,
        request: ValidateRequest,
    ) -> Result<ReviewOutcome, PipelineError> {
        let payment = repository::load(self.pool(), id)
            .await?
            .ok_or_else(|| PipelineError::not_found("payment", id))?;
        let enrollment_id = payment.enrollment_id;
        self.gatekeeper
            .authorize(
                actor,
                Capability::ReviewPayment,
                &Target::new("payment").with_id(id),
            )
            .await?;

        let amount = request.amount.or(payment.amount).ok_or_else(|| {
            PipelineError::validation("the amount must be entered before validation")
        })?;
        if amount <= 0 {
            return Err(PipelineError::validation("payment amount must be positive"));
        }
        let reference = request
            .reference
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let prefix = self.number_prefix.as_str();

        let transition = self
            .stores
            .retrying("payments.validate", || async move {
                let mut tx = self.pool().begin().await?;
                if !enrollments::touch(&mut tx, enrollment_id).await? {
                    return Err(PipelineError::not_found("enrollment", enrollment_id));
                }
                let current = repository::load(&mut *tx, id)
                    .await?
                    .ok_or_else(|| PipelineError::not_found("payment", id))?;
                if current.status != PaymentStatus::PendingReview {
                    return Err(PipelineError::validation(format!(
                        "payment is already {}",
                        current.status
                    )));
                }
                let enrollment = enrollments::require(&mut tx, enrollment_id).await?;
                if enrollment.status == EnrollmentStatus::Cancelled {
                    return Err(PipelineError::validation("enrollment is cancelled"));
                }

                let paid = enrollments::validated_total(&mut tx, enrollment_id).await?;
                Balance::new(enrollment.total_due, paid)?.apply(amount)?;

                repository::mark_validated(&mut tx, id, amount, reference, actor).await?;
                let transition = reevaluate(&mut tx, enrollment_id, prefix, Some(actor)).await?;
                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(actor), AuditAction::ValidatePayment, "payment")
                        .target(id)
                        .detail(json!({
                            "enrollment_id": enrollment_id,
                            "amount": amount,
                            "submitted_amount": current.amount,
                            "from": transition.from,
                            "to": transition.to,
                            "remaining_balance": transition.remaining_balance,
                        })),
                )
                .await?;
                tx.commit().await?;
                Ok(transition)
            })
            .await?;

        info!(
            payment = %id,
            enrollment = %enrollment_id,
            amount,
            remaining = transition.remaining_balance,
            status = %transition.to,
            "payment validated"
        );

        let owners = enrollments::owners(self.pool(), enrollment_id).await?;
        notify::dispatch(
            self.notifier.as_ref(),
            &owners,
            enrollment_id,
            NoticeKind::PaymentValidated,
            &notify::details([
                ("payment_id", id.to_string()),
                ("amount", amount.to_string()),
                ("remaining_balance", transition.remaining_balance.to_string()),
            ]),
        );
        if transition.activated() {
            notify::dispatch(
                self.notifier.as_ref(),
                &owners,
                enrollment_id,
                NoticeKind::EnrollmentActivated,
                &notify::activation_details(&transition),
            );
        }

        let payment = repository::load(self.pool(), id)
            .await?
            .ok_or_else(|| PipelineError::not_found("payment", id))?;
        Ok(ReviewOutcome {
            payment,
            transition: Some(transition),
        })
    }

    /// Reject a payment. The enrollment is left as it was; guardians receive
    /// the reason.
    pub async fn reject(
        &self,
        actor: ProfileId,
        id: PaymentId,
        request: RejectRequest,
    ) -> Result<ReviewOutcome, PipelineError> {
        let result = self.reject_inner(actor, id, request).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::RejectPayment, "payment").target(id),
                result,
            )
            .await
    }

    async fn reject_inner(
        &self,
        actor: ProfileId,
        id: PaymentId,
        request: RejectRequest,
    ) -> Result<ReviewOutcome, PipelineError> {
        let payment = repository::load(self.pool(), id)
            .await?
            .ok_or_else(|| PipelineError::not_found("payment", id))?;
        self.gatekeeper
            .authorize(
                actor,
                Capability::ReviewPayment,
                &Target::new("payment").with_id(id),
            )
            .await?;
        let reason = request.reason.trim();
        if reason.is_empty() {
            return Err(PipelineError::validation("a rejection needs a reason"));
        }
        let enrollment_id = payment.enrollment_id;

        self.stores
            .retrying("payments.reject", || async move {
                let mut tx = self.pool().begin().await?;
                if !repository::mark_rejected(&mut tx, id, reason, actor).await? {
                    let status = repository::load(&mut *tx, id)
                        .await?
                        .map(|current| current.status.label())
                        .unwrap_or("missing");
                    return Err(PipelineError::validation(format!("payment is already {status}")));
                }
                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(actor), AuditAction::RejectPayment, "payment")
                        .target(id)
                        .detail(json!({ "enrollment_id": enrollment_id, "reason": reason })),
                )
                .await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;

        info!(payment = %id, enrollment = %enrollment_id, reason, "payment rejected");
        let owners = enrollments::owners(self.pool(), enrollment_id).await?;
        notify::dispatch(
            self.notifier.as_ref(),
            &owners,
            enrollment_id,
            NoticeKind::PaymentRejected,
            &notify::details([
                ("payment_id", id.to_string()),
                ("reason", reason.to_string()),
            ]),
        );

        let payment = repository::load(self.pool(), id)
            .await?
            .ok_or_else(|| PipelineError::not_found("payment", id))?;
        Ok(ReviewOutcome {
            payment,
            transition: None,
        })
    }
}
