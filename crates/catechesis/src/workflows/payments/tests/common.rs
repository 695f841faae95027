pub(super) use crate::workflows::testing::*;

use crate::extraction::{DocumentKind, RecognizedPage};
use crate::ids::{DocumentId, EnrollmentId, PaymentId};
use crate::workflows::payments::{NewPayment, PaymentMethod};

pub(super) fn cash(amount: i64) -> NewPayment {
    NewPayment {
        amount: Some(amount),
        method: PaymentMethod::Cash,
        reference: None,
        proof_document_id: None,
    }
}

/// Enrollment with both certificates confirmed, waiting for its first payment.
pub(super) async fn awaiting_payment(harness: &Harness) -> EnrollmentId {
    let enrollment = harness.enroll().await;
    harness.complete_documents(enrollment.id).await;
    enrollment.id
}

pub(super) async fn proof(harness: &Harness, enrollment: EnrollmentId, page: RecognizedPage) -> DocumentId {
    harness
        .upload(enrollment, DocumentKind::PaymentProof, page)
        .await
        .document
        .id
}

pub(super) async fn submit(harness: &Harness, enrollment: EnrollmentId, payment: NewPayment) -> PaymentId {
    harness
        .pipeline
        .payments
        .submit(harness.guardian, enrollment, payment)
        .await
        .expect("payment submitted")
        .payment_id
}
