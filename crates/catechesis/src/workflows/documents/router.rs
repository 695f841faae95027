use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use super::domain::ConfirmRequest;
use super::service::DocumentService;
use crate::extraction::DocumentKind;
use crate::ids::{DocumentId, EnrollmentId};
use crate::objects::ObjectStore;
use crate::workflows::notify::GuardianNotifier;
use crate::workflows::ActorId;

/// Upload, extraction polling and confirmation routes. The body limit leaves
/// room above the document bound so oversized files get a validation error.
pub fn document_router<O, N>(service: Arc<DocumentService<O, N>>) -> Router
where
    O: ObjectStore + 'static,
    N: GuardianNotifier + 'static,
{
    let body_limit = service.max_bytes() + 64 * 1024;
    Router::new()
        .route("/api/v1/enrollments/:id/documents", post(upload_handler::<O, N>))
        .route("/api/v1/documents/:id", get(extraction_handler::<O, N>))
        .route("/api/v1/documents/:id/confirm", post(confirm_handler::<O, N>))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(service)
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadQuery {
    kind: String,
}

pub(crate) async fn upload_handler<O, N>(
    State(service): State<Arc<DocumentService<O, N>>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Response
where
    O: ObjectStore + 'static,
    N: GuardianNotifier + 'static,
{
    let id = match EnrollmentId::parse(&id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    let kind = match query.kind.parse::<DocumentKind>() {
        Ok(kind) => kind,
        Err(err) => return err.into_response(),
    };
    match service.upload(actor, id, kind, &body).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn extraction_handler<O, N>(
    State(service): State<Arc<DocumentService<O, N>>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
) -> Response
where
    O: ObjectStore + 'static,
    N: GuardianNotifier + 'static,
{
    let id = match DocumentId::parse(&id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    match service.get_extraction(actor, id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn confirm_handler<O, N>(
    State(service): State<Arc<DocumentService<O, N>>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
    Json(request): Json<ConfirmRequest>,
) -> Response
where
    O: ObjectStore + 'static,
    N: GuardianNotifier + 'static,
{
    let id = match DocumentId::parse(&id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    match service.confirm(actor, id, request).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => err.into_response(),
    }
}
