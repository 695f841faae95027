pub(super) use crate::workflows::testing::*;

use crate::ids::EnrollmentId;
use crate::workflows::payments::{NewPayment, PaymentMethod, ValidateRequest};

/// Enrollment with its documents confirmed and the full amount validated.
pub(super) async fn settled_enrollment(harness: &Harness) -> EnrollmentId {
    let enrollment = harness.enroll().await;
    harness.complete_documents(enrollment.id).await;
    let receipt = harness
        .pipeline
        .payments
        .submit(
            harness.guardian,
            enrollment.id,
            NewPayment {
                amount: Some(TOTAL_DUE),
                method: PaymentMethod::Cash,
                reference: None,
                proof_document_id: None,
            },
        )
        .await
        .expect("payment submitted");
    harness
        .pipeline
        .payments
        .validate(harness.treasurer, receipt.payment_id, ValidateRequest::default())
        .await
        .expect("payment validated");
    enrollment.id
}
