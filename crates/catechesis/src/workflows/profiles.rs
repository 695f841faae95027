//! HTTP surface of the profile directory.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::access::{NewProfile, ProfileDirectory, Role};
use crate::ids::ProfileId;
use crate::workflows::ActorId;

pub fn profile_router(directory: Arc<ProfileDirectory>) -> Router {
    Router::new()
        .route("/api/v1/profiles", post(create_handler))
        .route("/api/v1/provision", post(provision_handler))
        .route("/api/v1/profiles/:id", get(view_handler))
        .route("/api/v1/profiles/:id/role", put(role_handler))
        .route("/api/v1/profiles/:id/access-code", post(access_code_handler))
        .route("/api/v1/profiles/:id/access-code/verify", post(verify_handler))
        .route("/api/v1/profiles/:id/deactivate", post(deactivate_handler))
        .with_state(directory)
}

fn parse_id(raw: &str) -> Result<ProfileId, Response> {
    ProfileId::parse(raw).map_err(IntoResponse::into_response)
}

pub(crate) async fn create_handler(
    State(directory): State<Arc<ProfileDirectory>>,
    ActorId(actor): ActorId,
    Json(request): Json<NewProfile>,
) -> Response {
    match directory.create(actor, request).await {
        Ok(profile) => (StatusCode::CREATED, Json(profile)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProvisionRequest {
    channel_identity: String,
    display_name: String,
}

/// First contact from a messaging channel. Answers 201 when a guardian
/// profile was created, 200 when the channel was already known.
pub(crate) async fn provision_handler(
    State(directory): State<Arc<ProfileDirectory>>,
    Json(request): Json<ProvisionRequest>,
) -> Response {
    match directory
        .provision_guardian(&request.channel_identity, &request.display_name)
        .await
    {
        Ok((profile, true)) => (StatusCode::CREATED, Json(profile)).into_response(),
        Ok((profile, false)) => (StatusCode::OK, Json(profile)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn view_handler(
    State(directory): State<Arc<ProfileDirectory>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match directory.view(actor, id).await {
        Ok(profile) => (StatusCode::OK, Json(profile)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RoleRequest {
    role: Role,
}

pub(crate) async fn role_handler(
    State(directory): State<Arc<ProfileDirectory>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
    Json(request): Json<RoleRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match directory.change_role(actor, id, request.role).await {
        Ok(profile) => (StatusCode::OK, Json(profile)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct AccessCodeRequest {
    code: String,
}

pub(crate) async fn access_code_handler(
    State(directory): State<Arc<ProfileDirectory>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
    Json(request): Json<AccessCodeRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match directory.set_access_code(actor, id, &request.code).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn verify_handler(
    State(directory): State<Arc<ProfileDirectory>>,
    Path(id): Path<String>,
    Json(request): Json<AccessCodeRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match directory.verify_access_code(id, &request.code).await {
        Ok(valid) => (StatusCode::OK, Json(json!({ "valid": valid }))).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn deactivate_handler(
    State(directory): State<Arc<ProfileDirectory>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match directory.deactivate(actor, id).await {
        Ok(profile) => (StatusCode::OK, Json(profile)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::workflows::testing::*;

    #[tokio::test]
    async fn first_contact_provisions_once() {
        let harness = Harness::new().await;
        let body = json!({ "channel_identity": "whatsapp:+221770000001", "display_name": "Awa" });

        let response = harness
            .pipeline
            .router()
            .oneshot(json_request("POST", "/api/v1/provision", None, &body))
            .await
            .expect("route executes");
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = read_json(response).await;
        assert_eq!(created["role"], "guardian");

        let response = harness
            .pipeline
            .router()
            .oneshot(json_request("POST", "/api/v1/provision", None, &body))
            .await
            .expect("route executes");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["id"], created["id"]);
    }

    #[tokio::test]
    async fn guardian_sets_and_verifies_an_access_code() {
        let harness = Harness::new().await;
        let guardian = harness.guardian;

        let response = harness
            .pipeline
            .router()
            .oneshot(json_request(
                "POST",
                &format!("/api/v1/profiles/{guardian}/access-code"),
                Some(guardian),
                &json!({ "code": "482913" }),
            ))
            .await
            .expect("route executes");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        for (code, valid) in [("482913", true), ("000000", false)] {
            let response = harness
                .pipeline
                .router()
                .oneshot(json_request(
                    "POST",
                    &format!("/api/v1/profiles/{guardian}/access-code/verify"),
                    None,
                    &json!({ "code": code }),
                ))
                .await
                .expect("route executes");
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(read_json(response).await["valid"], valid);
        }
    }

    #[tokio::test]
    async fn only_administrators_create_profiles() {
        let harness = Harness::new().await;
        let body = json!({ "display_name": "Catéchiste", "role": "instructor" });

        let response = harness
            .pipeline
            .router()
            .oneshot(json_request("POST", "/api/v1/profiles", Some(harness.front_desk), &body))
            .await
            .expect("route executes");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = harness
            .pipeline
            .router()
            .oneshot(json_request("POST", "/api/v1/profiles", Some(harness.admin), &body))
            .await
            .expect("route executes");
        assert_eq!(response.status(), StatusCode::CREATED);
    }
}
