use super::common::*;
use axum::http::StatusCode;
use serde_json::json;
use tower::ServiceExt;

#[tokio::test]
async fn issued_page_opens_without_an_actor() {
    let harness = Harness::new().await;
    let enrollment = harness.enroll().await;

    let response = harness
        .pipeline
        .router()
        .oneshot(json_request(
            "POST",
            &format!("/api/v1/enrollments/{}/access-pages", enrollment.id),
            Some(harness.guardian),
            &json!({ "purpose": "summary" }),
        ))
        .await
        .expect("route executes");
    assert_eq!(response.status(), StatusCode::CREATED);
    let page = read_json(response).await;
    let token = page["token"].as_str().expect("token").to_string();

    let response = harness
        .pipeline
        .router()
        .oneshot(get_request(&format!("/api/v1/pages/{token}"), None))
        .await
        .expect("route executes");
    assert_eq!(response.status(), StatusCode::OK);
    let view = read_json(response).await;
    assert_eq!(view["purpose"], "summary");
    assert_eq!(view["enrollment"]["child_name"], "Amadou Diallo");
    assert_eq!(view["enrollment"]["status"], "draft");
}

#[tokio::test]
async fn unknown_page_answers_not_found() {
    let harness = Harness::new().await;

    let response = harness
        .pipeline
        .router()
        .oneshot(get_request("/api/v1/pages/nothing-here", None))
        .await
        .expect("route executes");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let payload = read_json(response).await;
    assert_eq!(payload["kind"], "not_found");
}
