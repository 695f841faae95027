use super::common::*;
use crate::error::PipelineError;
use crate::workflows::enrollment::{EnrollmentStatus, LinkRequest, NewEnrollment, PrefillQuery};

#[tokio::test]
async fn intake_creates_unnumbered_draft() {
    let harness = Harness::new().await;

    let view = harness.enroll().await;

    assert_eq!(view.status, EnrollmentStatus::Draft);
    assert_eq!(view.number, None);
    assert_eq!(view.child_name, "Amadou Diallo");
    assert_eq!(view.remaining_balance, TOTAL_DUE);
    assert_eq!(view.guardians, vec![harness.guardian]);
    assert!(view.documents.is_empty());
}

#[tokio::test]
async fn second_submission_for_same_child_offers_link() {
    let harness = Harness::new().await;
    let first = harness.enroll().await;
    let other_guardian = harness.another_guardian("Moussa Diallo").await;

    let err = harness
        .pipeline
        .enrollments
        .create(
            other_guardian,
            NewEnrollment {
                last_name: "DIALLO ".to_string(),
                first_name: "amadou".to_string(),
                ..amadou(2025)
            },
        )
        .await
        .expect_err("duplicate blocked");

    match err {
        PipelineError::DuplicateEnrollment { existing, guardian } => {
            assert_eq!(existing, first.id);
            assert_eq!(guardian, harness.guardian);
        }
        other => panic!("expected duplicate enrollment, got {other:?}"),
    }

    let linked = harness
        .pipeline
        .enrollments
        .link(
            other_guardian,
            first.id,
            LinkRequest {
                guardian_id: None,
                last_name: "Diallo".to_string(),
                first_name: "Amadou".to_string(),
                birth_date: birth_date(),
            },
        )
        .await
        .expect("second guardian linked");
    assert_eq!(linked.guardians.len(), 2);
    assert!(linked.guardians.contains(&other_guardian));
}

#[tokio::test]
async fn link_requires_matching_identity() {
    let harness = Harness::new().await;
    let first = harness.enroll().await;
    let other_guardian = harness.another_guardian("Moussa Diallo").await;

    let err = harness
        .pipeline
        .enrollments
        .link(
            other_guardian,
            first.id,
            LinkRequest {
                guardian_id: None,
                last_name: "Diallo".to_string(),
                first_name: "Amadou".to_string(),
                birth_date: chrono::NaiveDate::from_ymd_opt(2016, 3, 12).expect("valid date"),
            },
        )
        .await
        .expect_err("identity mismatch");
    assert!(matches!(err, PipelineError::Validation(_)));
}

#[tokio::test]
async fn homonym_override_is_staff_only() {
    let harness = Harness::new().await;
    harness.enroll().await;

    let err = harness
        .pipeline
        .enrollments
        .create(
            harness.guardian,
            NewEnrollment {
                allow_homonym: true,
                ..amadou(2025)
            },
        )
        .await
        .expect_err("guardians cannot override");
    assert!(matches!(err, PipelineError::Permission { .. }));

    let other_guardian = harness.another_guardian("Khady Diallo").await;
    let homonym = harness
        .pipeline
        .enrollments
        .create(
            harness.front_desk,
            NewEnrollment {
                guardian_id: Some(other_guardian),
                allow_homonym: true,
                ..amadou(2025)
            },
        )
        .await
        .expect("front desk confirms a homonym");
    assert_eq!(homonym.guardians, vec![other_guardian]);
}

#[tokio::test]
async fn cancelled_enrollments_do_not_block_intake() {
    let harness = Harness::new().await;
    let first = harness.enroll().await;

    let cancelled = harness
        .pipeline
        .enrollments
        .cancel(harness.guardian, first.id, Some("wrong parish".to_string()))
        .await
        .expect("cancelled");
    assert_eq!(cancelled.status, EnrollmentStatus::Cancelled);

    let again = harness
        .pipeline
        .enrollments
        .cancel(harness.guardian, first.id, None)
        .await
        .expect_err("already cancelled");
    assert!(matches!(again, PipelineError::Validation(_)));

    let second = harness.enroll().await;
    assert_ne!(second.id, first.id);
}

#[tokio::test]
async fn complete_documents_issue_sequential_numbers() {
    let harness = Harness::new().await;
    let first = harness.enroll().await;
    harness.complete_documents(first.id).await;

    let view = harness
        .pipeline
        .enrollments
        .get(harness.guardian, first.id)
        .await
        .expect("view");
    assert_eq!(view.status, EnrollmentStatus::AwaitingPayment);
    assert_eq!(view.number.as_deref(), Some("CAT-2025-0001"));
    assert_eq!(view.documents.len(), 2);
    assert!(view.documents.iter().all(|document| document.confirmed));

    let second = harness
        .pipeline
        .enrollments
        .create(harness.guardian, fatou(2025))
        .await
        .expect("second child");
    harness.complete_documents_for(second.id, "Fatou", "2015-09-02").await;
    let view = harness
        .pipeline
        .enrollments
        .get(harness.guardian, second.id)
        .await
        .expect("view");
    assert_eq!(view.number.as_deref(), Some("CAT-2025-0002"));
}

#[tokio::test]
async fn re_enrollment_carries_baptism_forward() {
    let harness = Harness::new().await;
    let previous = harness
        .pipeline
        .enrollments
        .create(harness.guardian, amadou(2024))
        .await
        .expect("previous year");
    harness.complete_documents(previous.id).await;

    let prefill = harness
        .pipeline
        .enrollments
        .prefill(
            harness.guardian,
            PrefillQuery {
                last_name: "Diallo".to_string(),
                first_name: "Amadou".to_string(),
                birth_date: birth_date(),
                year: 2025,
            },
        )
        .await
        .expect("prefill lookup")
        .expect("earlier enrollment found");
    assert_eq!(prefill.source_enrollment, previous.id);
    assert_eq!(prefill.source_year, 2024);
    assert_eq!(prefill.baptism_parish.as_deref(), Some("Saint Joseph de Médina"));
    assert_eq!(prefill.birth_place.as_deref(), Some("Thiès"));

    let current = harness.enroll().await;
    assert_eq!(current.prefilled_from, Some(previous.id));
}

#[tokio::test]
async fn guardians_only_see_their_own_children() {
    let harness = Harness::new().await;
    let first = harness.enroll().await;
    let stranger = harness.another_guardian("Inconnu").await;

    let err = harness
        .pipeline
        .enrollments
        .get(stranger, first.id)
        .await
        .expect_err("not the owner");
    assert!(matches!(err, PipelineError::Permission { .. }));

    let denials = harness
        .trail()
        .entries_for("enrollment", &first.id.to_string())
        .await
        .expect("audit readable");
    assert!(denials
        .iter()
        .any(|entry| entry.action == "authorize" && entry.outcome == "failure"));
}

#[tokio::test]
async fn classes_refuse_seats_beyond_capacity() {
    let harness = Harness::new().await;
    let class = harness
        .pipeline
        .enrollments
        .create_class(harness.admin, small_class(1))
        .await
        .expect("class created");
    let first = harness.enroll().await;
    let second = harness
        .pipeline
        .enrollments
        .create(harness.guardian, fatou(2025))
        .await
        .expect("second child");

    let seated = harness
        .pipeline
        .enrollments
        .assign_class(harness.front_desk, first.id, class.id)
        .await
        .expect("first seat");
    assert_eq!(seated.class_id, Some(class.id));

    let err = harness
        .pipeline
        .enrollments
        .assign_class(harness.front_desk, second.id, class.id)
        .await
        .expect_err("class is full");
    assert!(err.to_string().contains("full"));

    let classes = harness
        .pipeline
        .enrollments
        .classes(harness.front_desk, Some(2025))
        .await
        .expect("classes listed");
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0].seats_left(), 0);
}

#[tokio::test]
async fn staff_must_name_an_existing_guardian() {
    let harness = Harness::new().await;

    let err = harness
        .pipeline
        .enrollments
        .create(
            harness.front_desk,
            NewEnrollment {
                guardian_id: Some(harness.treasurer),
                ..amadou(2025)
            },
        )
        .await
        .expect_err("treasurer is not a guardian");
    assert!(matches!(err, PipelineError::Validation(_)));

    let err = harness
        .pipeline
        .enrollments
        .create(
            harness.guardian,
            NewEnrollment {
                total_due: 0,
                ..amadou(2025)
            },
        )
        .await
        .expect_err("nothing due");
    assert!(matches!(err, PipelineError::Validation(_)));
}
