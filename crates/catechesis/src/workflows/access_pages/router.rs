use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use super::domain::{AccessPurpose, IssueRequest};
use super::service::AccessPageService;
use crate::ids::EnrollmentId;
use crate::workflows::ActorId;

/// Issuing needs an actor; opening a page only needs its token.
pub fn access_page_router(service: Arc<AccessPageService>) -> Router {
    Router::new()
        .route("/api/v1/enrollments/:id/access-pages", post(issue_handler))
        .route("/api/v1/pages/:token", get(resolve_handler))
        .with_state(service)
}

pub(crate) async fn issue_handler(
    State(service): State<Arc<AccessPageService>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
    body: Option<Json<IssueRequest>>,
) -> Response {
    let id = match EnrollmentId::parse(&id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    let Json(request) = body.unwrap_or_default();
    let purpose = request.purpose.unwrap_or(AccessPurpose::Summary);
    match service.issue(actor, id, purpose).await {
        Ok(page) => (StatusCode::CREATED, Json(page)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn resolve_handler(
    State(service): State<Arc<AccessPageService>>,
    Path(token): Path<String>,
) -> Response {
    match service.resolve(&token).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => err.into_response(),
    }
}
