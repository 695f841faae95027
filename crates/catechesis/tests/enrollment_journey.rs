mod common;

use catechesis::access::Role;
use catechesis::extraction::DocumentKind;
use catechesis::workflows::access_pages::AccessPurpose;
use catechesis::workflows::enrollment::{EnrollmentStatus, LinkRequest};
use catechesis::workflows::payments::{
    NewPayment, PaymentMethod, PaymentStatus, QueueFilter, RejectRequest, ValidateRequest,
};
use catechesis::workflows::NoticeKind;
use catechesis::PipelineError;
use common::*;

#[tokio::test]
async fn guardian_enrolls_pays_and_receives_a_receipt() {
    let parish = Parish::open().await;
    let pipeline = &parish.pipeline;
    let guardian = parish.profile("Awa Diallo", Role::Guardian).await;

    let enrollment = pipeline
        .enrollments
        .create(guardian, child("Amadou", 2025))
        .await
        .expect("draft created");
    assert_eq!(enrollment.status, EnrollmentStatus::Draft);

    let birth = upload(pipeline, guardian, enrollment.id, DocumentKind::BirthRecord).await;
    let extracted = birth.document.fields.clone().expect("fields pre-filled");
    assert_eq!(extracted["given_names"].as_deref(), Some("Amadou"));
    assert!(!birth.document.requires_manual_check);

    complete_documents(pipeline, guardian, enrollment.id, "Amadou").await;
    let view = pipeline
        .enrollments
        .get(guardian, enrollment.id)
        .await
        .expect("view");
    assert_eq!(view.status, EnrollmentStatus::AwaitingPayment);
    assert_eq!(view.number.as_deref(), Some("CAT-2025-0001"));

    let proof = upload(pipeline, guardian, enrollment.id, DocumentKind::PaymentProof).await;
    let first = pipeline
        .payments
        .submit(
            guardian,
            enrollment.id,
            NewPayment {
                amount: None,
                method: PaymentMethod::Wave,
                reference: None,
                proof_document_id: Some(proof.document.id),
            },
        )
        .await
        .expect("proof submitted");

    pipeline
        .payments
        .reject(
            parish.treasurer,
            first.payment_id,
            RejectRequest {
                reason: "transaction introuvable".to_string(),
            },
        )
        .await
        .expect("rejected");
    let rejected = parish.outbox.of_kind(NoticeKind::PaymentRejected);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].details["reason"], "transaction introuvable");

    let second = pipeline
        .payments
        .submit(
            guardian,
            enrollment.id,
            NewPayment {
                amount: None,
                method: PaymentMethod::Wave,
                reference: None,
                proof_document_id: Some(proof.document.id),
            },
        )
        .await
        .expect("resubmitted");
    let queue = pipeline
        .payments
        .queue(parish.treasurer, QueueFilter::default())
        .await
        .expect("queue");
    assert_eq!(queue.len(), 1);
    let suggested = queue[0]
        .advisory
        .as_ref()
        .and_then(|advisory| advisory.amount)
        .expect("amount read from the proof");

    let outcome = pipeline
        .payments
        .validate(
            parish.treasurer,
            second.payment_id,
            ValidateRequest {
                amount: Some(suggested),
                reference: None,
            },
        )
        .await
        .expect("validated");
    assert_eq!(outcome.payment.status, PaymentStatus::Validated);
    assert_eq!(
        outcome.transition.expect("re-derived").to,
        EnrollmentStatus::Active
    );
    assert_eq!(parish.outbox.of_kind(NoticeKind::EnrollmentActivated).len(), 1);

    let page = pipeline
        .access_pages
        .issue(guardian, enrollment.id, AccessPurpose::Receipt)
        .await
        .expect("receipt page");
    let receipt = pipeline
        .access_pages
        .resolve(&page.token)
        .await
        .expect("receipt opens");
    assert_eq!(receipt.enrollment.number.as_deref(), Some("CAT-2025-0001"));
    assert_eq!(receipt.enrollment.remaining_balance, 0);
}

#[tokio::test]
async fn second_guardian_links_to_the_existing_enrollment() {
    let parish = Parish::open().await;
    let pipeline = &parish.pipeline;
    let mother = parish.profile("Awa Diallo", Role::Guardian).await;
    let father = parish.profile("Moussa Diallo", Role::Guardian).await;

    let enrollment = pipeline
        .enrollments
        .create(mother, child("Amadou", 2025))
        .await
        .expect("created");

    let err = pipeline
        .enrollments
        .create(father, child("Amadou", 2025))
        .await
        .expect_err("already enrolled");
    let existing = match err {
        PipelineError::DuplicateEnrollment { existing, .. } => existing,
        other => panic!("expected a duplicate, got {other}"),
    };
    assert_eq!(existing, enrollment.id);

    let linked = pipeline
        .enrollments
        .link(
            father,
            existing,
            LinkRequest {
                guardian_id: None,
                last_name: "DIALLO".to_string(),
                first_name: "amadou".to_string(),
                birth_date: enrollment.birth_date,
            },
        )
        .await
        .expect("linked");
    assert!(linked.guardians.contains(&mother));
    assert!(linked.guardians.contains(&father));

    let seen_by_father = pipeline
        .enrollments
        .get(father, enrollment.id)
        .await
        .expect("father can read");
    assert_eq!(seen_by_father.id, enrollment.id);
}
