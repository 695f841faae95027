use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::domain::{AccessPage, AccessPageView, AccessPurpose, PageSummary};
use super::repository;
use crate::access::audit::{AuditAction, AuditRecord, AuditTrail};
use crate::access::{Capability, Gatekeeper, Target};
use crate::error::PipelineError;
use crate::ids::{EnrollmentId, ProfileId};
use crate::stores::{ConsistencyError, StoreKind, StoreSet};
use crate::workflows::enrollment::{repository as enrollments, EnrollmentStatus};

/// Temporary pages in their own store. The enrollment they point at is checked
/// in the enrollment store before the page is written; nothing holds the two
/// stores together afterwards.
#[derive(Debug, Clone)]
pub struct AccessPageService {
    stores: StoreSet,
    gatekeeper: Gatekeeper,
    trail: AuditTrail,
    ttl: chrono::Duration,
}

impl AccessPageService {
    pub fn new(stores: StoreSet, gatekeeper: Gatekeeper, ttl: chrono::Duration) -> Self {
        let trail = gatekeeper.trail().clone();
        Self {
            stores,
            gatekeeper,
            trail,
            ttl,
        }
    }

    pub async fn issue(
        &self,
        actor: ProfileId,
        enrollment_id: EnrollmentId,
        purpose: AccessPurpose,
    ) -> Result<AccessPage, PipelineError> {
        let result = self.issue_inner(actor, enrollment_id, purpose).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::IssueAccessPage, "enrollment")
                    .target(enrollment_id),
                result,
            )
            .await
    }

    async fn issue_inner(
        &self,
        actor: ProfileId,
        enrollment_id: EnrollmentId,
        purpose: AccessPurpose,
    ) -> Result<AccessPage, PipelineError> {
        let enrollment = enrollments::load(self.stores.enrollment(), enrollment_id)
            .await?
            .ok_or_else(|| missing(enrollment_id))?;
        let owners = enrollments::owners(self.stores.enrollment(), enrollment_id).await?;
        self.gatekeeper
            .authorize(
                actor,
                Capability::IssueAccessPage,
                &Target::new("enrollment").with_id(enrollment_id).owned_by(owners),
            )
            .await?;
        if enrollment.status == EnrollmentStatus::Cancelled {
            return Err(PipelineError::validation("enrollment is cancelled"));
        }
        if purpose == AccessPurpose::Receipt && enrollment.status != EnrollmentStatus::Active {
            return Err(PipelineError::validation(
                "a receipt page needs a fully paid enrollment",
            ));
        }

        let now = Utc::now();
        let page = AccessPage {
            token: Uuid::new_v4().simple().to_string(),
            enrollment_id,
            purpose,
            issued_by: actor,
            issued_at: now,
            expires_at: now + self.ttl,
            last_viewed_at: None,
        };
        let page_ref = &page;
        self.stores
            .retrying("access_pages.issue", || async move {
                repository::insert(self.stores.access_pages(), page_ref).await
            })
            .await?;

        let audited = self
            .trail
            .append(
                &AuditRecord::new(Some(actor), AuditAction::IssueAccessPage, "enrollment")
                    .target(enrollment_id)
                    .detail(json!({ "purpose": purpose, "expires_at": page.expires_at })),
            )
            .await;
        if let Err(err) = audited {
            if let Err(cleanup) = repository::delete(self.stores.access_pages(), &page.token).await {
                warn!(enrollment = %enrollment_id, error = %cleanup, "unaudited access page could not be withdrawn");
            }
            return Err(err);
        }

        info!(enrollment = %enrollment_id, purpose = purpose.label(), expires_at = %page.expires_at, "access page issued");
        Ok(page)
    }

    /// Open a page by its token. Expired and unknown tokens look the same.
    pub async fn resolve(&self, token: &str) -> Result<AccessPageView, PipelineError> {
        let now = Utc::now();
        let page = repository::load(self.stores.access_pages(), token)
            .await?
            .filter(|page| !page.is_expired(now))
            .ok_or_else(|| PipelineError::not_found("access page", "for this token"))?;

        let enrollment = enrollments::load(self.stores.enrollment(), page.enrollment_id)
            .await?
            .ok_or_else(|| {
                warn!(enrollment = %page.enrollment_id, "access page points at a missing enrollment");
                missing(page.enrollment_id)
            })?;

        repository::touch(self.stores.access_pages(), token, now).await?;
        Ok(AccessPageView {
            purpose: page.purpose,
            expires_at: page.expires_at,
            enrollment: PageSummary::from(&enrollment),
        })
    }
}

fn missing(enrollment_id: EnrollmentId) -> PipelineError {
    PipelineError::Consistency(ConsistencyError::MissingReference {
        store: StoreKind::AccessPages,
        entity: "enrollment",
        id: enrollment_id.to_string(),
    })
}
