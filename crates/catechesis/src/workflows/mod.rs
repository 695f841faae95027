//! Workflow services and their HTTP routers.

pub mod access_pages;
pub mod documents;
pub mod enrollment;
pub mod notify;
pub mod payments;
pub mod profiles;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;

use crate::access::{Gatekeeper, ProfileDirectory};
use crate::config::AppConfig;
use crate::extraction::ExtractionService;
use crate::ids::ProfileId;
use crate::objects::ObjectStore;
use crate::stores::StoreSet;

pub use notify::{GuardianNotice, GuardianNotifier, NoticeKind, NotifyError};

use access_pages::AccessPageService;
use documents::DocumentService;
use enrollment::EnrollmentService;
use payments::PaymentService;

/// Header carrying the authenticated profile, set by the conversational
/// front-end or the staff tooling in front of this service.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// The acting profile of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorId(pub ProfileId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for ActorId
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| unauthorized(format!("missing {ACTOR_HEADER} header")))?;

        raw.parse::<ProfileId>()
            .map(ActorId)
            .map_err(|_| unauthorized(format!("malformed {ACTOR_HEADER} header")))
    }
}

fn unauthorized(message: String) -> Response {
    let payload = json!({ "error": message, "kind": "unauthenticated" });
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

/// Every workflow service over one set of stores.
pub struct Pipeline<O, N> {
    pub stores: StoreSet,
    pub profiles: Arc<ProfileDirectory>,
    pub enrollments: Arc<EnrollmentService>,
    pub documents: Arc<DocumentService<O, N>>,
    pub payments: Arc<PaymentService<N>>,
    pub access_pages: Arc<AccessPageService>,
}

impl<O, N> Pipeline<O, N>
where
    O: ObjectStore + 'static,
    N: GuardianNotifier + 'static,
{
    pub fn new(
        stores: StoreSet,
        config: &AppConfig,
        objects: Arc<O>,
        extraction: ExtractionService,
        notifier: Arc<N>,
    ) -> Self {
        let gatekeeper = Gatekeeper::new(stores.enrollment().clone());

        let profiles = Arc::new(ProfileDirectory::new(stores.clone(), gatekeeper.clone()));
        let enrollments = Arc::new(EnrollmentService::new(
            stores.clone(),
            gatekeeper.clone(),
            config.intake.clone(),
        ));
        let documents = Arc::new(DocumentService::new(
            stores.clone(),
            gatekeeper.clone(),
            objects,
            extraction.clone(),
            notifier.clone(),
            &config.intake,
            config.extraction.max_document_bytes,
        ));
        let payments = Arc::new(PaymentService::new(
            stores.clone(),
            gatekeeper.clone(),
            notifier,
            &config.intake,
            extraction.threshold(),
        ));
        let access_pages = Arc::new(AccessPageService::new(
            stores.clone(),
            gatekeeper,
            config.intake.access_page_ttl,
        ));

        Self {
            stores,
            profiles,
            enrollments,
            documents,
            payments,
            access_pages,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .merge(profiles::profile_router(self.profiles.clone()))
            .merge(enrollment::enrollment_router(self.enrollments.clone()))
            .merge(documents::document_router(self.documents.clone()))
            .merge(payments::payment_router(self.payments.clone()))
            .merge(access_pages::access_page_router(self.access_pages.clone()))
    }
}
