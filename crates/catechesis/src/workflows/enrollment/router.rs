use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use super::domain::{LinkRequest, NewClass, NewEnrollment, PrefillQuery};
use super::service::EnrollmentService;
use crate::ids::{ClassId, EnrollmentId};
use crate::workflows::ActorId;

/// Enrollment intake, view, link, cancellation, pre-fill and class routes.
pub fn enrollment_router(service: Arc<EnrollmentService>) -> Router {
    Router::new()
        .route("/api/v1/enrollments", post(create_handler))
        .route("/api/v1/enrollments/:id", get(view_handler))
        .route("/api/v1/enrollments/:id/link", post(link_handler))
        .route("/api/v1/enrollments/:id/cancel", post(cancel_handler))
        .route("/api/v1/enrollments/:id/class", post(assign_class_handler))
        .route("/api/v1/prefill", get(prefill_handler))
        .route("/api/v1/classes", post(create_class_handler).get(classes_handler))
        .with_state(service)
}

pub(crate) async fn create_handler(
    State(service): State<Arc<EnrollmentService>>,
    ActorId(actor): ActorId,
    Json(request): Json<NewEnrollment>,
) -> Response {
    match service.create(actor, request).await {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn view_handler(
    State(service): State<Arc<EnrollmentService>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
) -> Response {
    let id = match EnrollmentId::parse(&id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    match service.get(actor, id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn link_handler(
    State(service): State<Arc<EnrollmentService>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
    Json(request): Json<LinkRequest>,
) -> Response {
    let id = match EnrollmentId::parse(&id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    match service.link(actor, id, request).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

pub(crate) async fn cancel_handler(
    State(service): State<Arc<EnrollmentService>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Response {
    let id = match EnrollmentId::parse(&id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    let Json(request) = body.unwrap_or_default();
    match service.cancel(actor, id, request.reason).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct AssignClassRequest {
    class_id: ClassId,
}

pub(crate) async fn assign_class_handler(
    State(service): State<Arc<EnrollmentService>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
    Json(request): Json<AssignClassRequest>,
) -> Response {
    let id = match EnrollmentId::parse(&id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    match service.assign_class(actor, id, request.class_id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn prefill_handler(
    State(service): State<Arc<EnrollmentService>>,
    ActorId(actor): ActorId,
    Query(query): Query<PrefillQuery>,
) -> Response {
    match service.prefill(actor, query).await {
        Ok(Some(prefill)) => (StatusCode::OK, Json(prefill)).into_response(),
        Ok(None) => {
            let payload = json!({
                "error": "no earlier enrollment for this child",
                "kind": "not_found",
            });
            (StatusCode::NOT_FOUND, Json(payload)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn create_class_handler(
    State(service): State<Arc<EnrollmentService>>,
    ActorId(actor): ActorId,
    Json(request): Json<NewClass>,
) -> Response {
    match service.create_class(actor, request).await {
        Ok(class) => (StatusCode::CREATED, Json(class)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ClassesQuery {
    #[serde(default)]
    year: Option<i32>,
}

pub(crate) async fn classes_handler(
    State(service): State<Arc<EnrollmentService>>,
    ActorId(actor): ActorId,
    Query(query): Query<ClassesQuery>,
) -> Response {
    match service.classes(actor, query.year).await {
        Ok(classes) => (StatusCode::OK, Json(classes)).into_response(),
        Err(err) => err.into_response(),
    }
}
