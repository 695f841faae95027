use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use super::domain::{NewPayment, QueueFilter, RejectRequest, ValidateRequest};
use super::service::PaymentService;
use crate::ids::{EnrollmentId, PaymentId};
use crate::workflows::notify::GuardianNotifier;
use crate::workflows::ActorId;

pub fn payment_router<N>(service: Arc<PaymentService<N>>) -> Router
where
    N: GuardianNotifier + 'static,
{
    Router::new()
        .route("/api/v1/enrollments/:id/payments", post(submit_handler::<N>))
        .route("/api/v1/payments", get(queue_handler::<N>))
        .route("/api/v1/payments/:id", get(payment_handler::<N>))
        .route("/api/v1/payments/:id/validate", post(validate_handler::<N>))
        .route("/api/v1/payments/:id/reject", post(reject_handler::<N>))
        .with_state(service)
}

pub(crate) async fn submit_handler<N: GuardianNotifier + 'static>(
    State(service): State<Arc<PaymentService<N>>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
    Json(request): Json<NewPayment>,
) -> Response {
    let id = match EnrollmentId::parse(&id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    match service.submit(actor, id, request).await {
        Ok(receipt) => (StatusCode::CREATED, Json(receipt)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn queue_handler<N: GuardianNotifier + 'static>(
    State(service): State<Arc<PaymentService<N>>>,
    ActorId(actor): ActorId,
    Query(filter): Query<QueueFilter>,
) -> Response {
    match service.queue(actor, filter).await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn payment_handler<N: GuardianNotifier + 'static>(
    State(service): State<Arc<PaymentService<N>>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
) -> Response {
    let id = match PaymentId::parse(&id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    match service.get(actor, id).await {
        Ok(payment) => (StatusCode::OK, Json(payment)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn validate_handler<N: GuardianNotifier + 'static>(
    State(service): State<Arc<PaymentService<N>>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
    body: Option<Json<ValidateRequest>>,
) -> Response {
    let id = match PaymentId::parse(&id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    let Json(request) = body.unwrap_or_default();
    match service.validate(actor, id, request).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn reject_handler<N: GuardianNotifier + 'static>(
    State(service): State<Arc<PaymentService<N>>>,
    ActorId(actor): ActorId,
    Path(id): Path<String>,
    Json(request): Json<RejectRequest>,
) -> Response {
    let id = match PaymentId::parse(&id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    match service.reject(actor, id, request).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => err.into_response(),
    }
}
