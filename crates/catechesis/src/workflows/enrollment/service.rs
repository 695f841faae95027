use chrono::{Datelike, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::info;

use super::domain::{
    normalize_name, Class, EnrollmentStatus, EnrollmentView, LinkRequest, NewClass,
    NewEnrollment, Prefill, PrefillQuery,
};
use super::repository::{self, EnrollmentDraft};
use crate::access::audit::{self, AuditAction, AuditRecord, AuditTrail};
use crate::access::{profiles, Capability, Gatekeeper, Role, Target};
use crate::config::IntakeConfig;
use crate::error::PipelineError;
use crate::ids::{ClassId, EnrollmentId, ProfileId};
use crate::stores::{self, StoreSet};

/// Intake, guardian links, re-enrollment pre-fill, cancellation and classes.
#[derive(Debug, Clone)]
pub struct EnrollmentService {
    stores: StoreSet,
    gatekeeper: Gatekeeper,
    trail: AuditTrail,
    intake: IntakeConfig,
}

impl EnrollmentService {
    pub fn new(stores: StoreSet, gatekeeper: Gatekeeper, intake: IntakeConfig) -> Self {
        let trail = gatekeeper.trail().clone();
        Self {
            stores,
            gatekeeper,
            trail,
            intake,
        }
    }

    fn pool(&self) -> &SqlitePool {
        self.stores.enrollment()
    }

    pub fn intake(&self) -> &IntakeConfig {
        &self.intake
    }

    /// Create a `draft` enrollment. A live enrollment of the same child in the
    /// same year blocks creation with a link offer unless staff confirm a homonym.
    pub async fn create(
        &self,
        actor: ProfileId,
        request: NewEnrollment,
    ) -> Result<EnrollmentView, PipelineError> {
        let result = self.create_inner(actor, request).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::CreateEnrollment, "enrollment"),
                result,
            )
            .await
    }

    async fn create_inner(
        &self,
        actor: ProfileId,
        request: NewEnrollment,
    ) -> Result<EnrollmentView, PipelineError> {
        let last_name = required(&request.last_name, "last name")?;
        let first_name = required(&request.first_name, "first name")?;
        let level = required(&request.level, "level")?;
        if request.total_due <= 0 {
            return Err(PipelineError::validation("total due must be positive"));
        }
        if !(2000..=2100).contains(&request.year) {
            return Err(PipelineError::validation(format!(
                "year {} is out of range",
                request.year
            )));
        }
        if request.birth_date > Utc::now().date_naive() {
            return Err(PipelineError::validation("birth date is in the future"));
        }

        let guardian_id = request.guardian_id.unwrap_or(actor);
        self.gatekeeper
            .authorize(
                actor,
                Capability::CreateEnrollment,
                &Target::new("enrollment").owned_by([guardian_id]),
            )
            .await?;
        if request.allow_homonym {
            self.gatekeeper
                .authorize(actor, Capability::OverrideDuplicate, &Target::new("enrollment"))
                .await?;
        }
        self.require_guardian(guardian_id).await?;

        let norm_last_name = normalize_name(last_name);
        let norm_first_name = normalize_name(first_name);
        let prior = repository::latest_before(
            self.pool(),
            &norm_last_name,
            &norm_first_name,
            request.birth_date,
            request.year,
        )
        .await?;

        let draft = EnrollmentDraft {
            id: EnrollmentId::generate(),
            year: request.year,
            guardian_id,
            last_name: last_name.to_string(),
            first_name: first_name.to_string(),
            norm_last_name,
            norm_first_name,
            birth_date: request.birth_date,
            birth_place: optional(request.birth_place.as_deref())
                .map(str::to_string)
                .or_else(|| prior.as_ref().and_then(|p| p.birth_place.clone())),
            baptism_date: prior.as_ref().and_then(|p| p.baptism_date),
            baptism_parish: prior.as_ref().and_then(|p| p.baptism_parish.clone()),
            baptism_officiant: prior.as_ref().and_then(|p| p.baptism_officiant.clone()),
            level: level.to_string(),
            total_due: request.total_due,
            created_by: actor,
        };
        let prefilled_from = prior.as_ref().map(|p| p.id);
        let allow_homonym = request.allow_homonym;
        let draft = &draft;

        self.stores
            .retrying("enrollment.create", || async move {
                let mut tx = self.pool().begin().await?;
                stores::claim(&mut tx, "enrollments.identity").await?;

                let existing = repository::find_same_year(
                    &mut tx,
                    &draft.norm_last_name,
                    &draft.norm_first_name,
                    draft.birth_date,
                    draft.year,
                )
                .await?;
                if let Some((existing, guardian)) = existing {
                    if !allow_homonym {
                        return Err(PipelineError::DuplicateEnrollment { existing, guardian });
                    }
                }

                repository::insert(&mut tx, draft).await?;
                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(actor), AuditAction::CreateEnrollment, "enrollment")
                        .target(draft.id)
                        .detail(json!({
                            "year": draft.year,
                            "level": draft.level,
                            "guardian_id": draft.guardian_id,
                            "homonym_override": existing.is_some(),
                            "prefilled_from": prefilled_from,
                        })),
                )
                .await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;

        info!(enrollment = %draft.id, year = draft.year, guardian = %guardian_id, "enrollment created");
        let mut view = self.view(draft.id).await?;
        view.prefilled_from = prefilled_from;
        Ok(view)
    }

    /// Attach a guardian to an existing enrollment of the same child.
    pub async fn link(
        &self,
        actor: ProfileId,
        id: EnrollmentId,
        request: LinkRequest,
    ) -> Result<EnrollmentView, PipelineError> {
        let result = self.link_inner(actor, id, request).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::LinkEnrollment, "enrollment").target(id),
                result,
            )
            .await
    }

    async fn link_inner(
        &self,
        actor: ProfileId,
        id: EnrollmentId,
        request: LinkRequest,
    ) -> Result<EnrollmentView, PipelineError> {
        let guardian_id = request.guardian_id.unwrap_or(actor);
        self.gatekeeper
            .authorize(
                actor,
                Capability::LinkEnrollment,
                &Target::new("enrollment").with_id(id).owned_by([guardian_id]),
            )
            .await?;
        self.require_guardian(guardian_id).await?;

        let enrollment = repository::load(self.pool(), id)
            .await?
            .ok_or_else(|| PipelineError::not_found("enrollment", id))?;
        let same_child = normalize_name(&request.last_name) == normalize_name(&enrollment.last_name)
            && normalize_name(&request.first_name) == normalize_name(&enrollment.first_name)
            && request.birth_date == enrollment.birth_date;
        if !same_child {
            return Err(PipelineError::validation(
                "child identity does not match the enrollment",
            ));
        }
        if enrollment.status == EnrollmentStatus::Cancelled {
            return Err(PipelineError::validation("enrollment is cancelled"));
        }

        let primary = enrollment.guardian_id;
        let linked = self
            .stores
            .retrying("enrollment.link", || async move {
                let mut tx = self.pool().begin().await?;
                let linked = guardian_id != primary
                    && repository::link_guardian(&mut tx, id, guardian_id).await?;
                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(actor), AuditAction::LinkEnrollment, "enrollment")
                        .target(id)
                        .detail(json!({ "guardian_id": guardian_id, "newly_linked": linked })),
                )
                .await?;
                tx.commit().await?;
                Ok(linked)
            })
            .await?;

        if linked {
            info!(enrollment = %id, guardian = %guardian_id, "guardian linked to enrollment");
        }
        self.view(id).await
    }

    /// Fields from the child's most recent earlier enrollment, if any.
    pub async fn prefill(
        &self,
        actor: ProfileId,
        query: PrefillQuery,
    ) -> Result<Option<Prefill>, PipelineError> {
        let Some(prior) = repository::latest_before(
            self.pool(),
            &normalize_name(&query.last_name),
            &normalize_name(&query.first_name),
            query.birth_date,
            query.year,
        )
        .await?
        else {
            return Ok(None);
        };

        let guardians = repository::owners(self.pool(), prior.id).await?;
        self.gatekeeper
            .authorize(
                actor,
                Capability::ViewEnrollment,
                &Target::new("enrollment")
                    .with_id(prior.id)
                    .owned_by(guardians.iter().copied()),
            )
            .await?;

        Ok(Some(Prefill {
            source_enrollment: prior.id,
            source_year: prior.year,
            last_name: prior.last_name,
            first_name: prior.first_name,
            birth_date: prior.birth_date,
            birth_place: prior.birth_place,
            baptism_date: prior.baptism_date,
            baptism_parish: prior.baptism_parish,
            baptism_officiant: prior.baptism_officiant,
            previous_level: prior.level,
            guardians,
        }))
    }

    pub async fn get(&self, actor: ProfileId, id: EnrollmentId) -> Result<EnrollmentView, PipelineError> {
        let (_, target) = repository::target(self.pool(), id).await?;
        self.gatekeeper
            .authorize(actor, Capability::ViewEnrollment, &target)
            .await?;
        self.view(id).await
    }

    pub async fn cancel(
        &self,
        actor: ProfileId,
        id: EnrollmentId,
        reason: Option<String>,
    ) -> Result<EnrollmentView, PipelineError> {
        let result = self.cancel_inner(actor, id, reason).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::CancelEnrollment, "enrollment")
                    .target(id),
                result,
            )
            .await
    }

    async fn cancel_inner(
        &self,
        actor: ProfileId,
        id: EnrollmentId,
        reason: Option<String>,
    ) -> Result<EnrollmentView, PipelineError> {
        let (enrollment, target) = repository::target(self.pool(), id).await?;
        self.gatekeeper
            .authorize(actor, Capability::CancelEnrollment, &target)
            .await?;
        if enrollment.status.is_terminal() {
            return Err(PipelineError::validation(format!(
                "enrollment is already {}",
                enrollment.status
            )));
        }
        let reason = optional(reason.as_deref());
        let from = enrollment.status;

        self.stores
            .retrying("enrollment.cancel", || async move {
                let mut tx = self.pool().begin().await?;
                let updated = sqlx::query(
                    "UPDATE enrollments SET status = 'cancelled', revision = revision + 1, \
                     updated_at = ? WHERE id = ? AND status NOT IN ('active', 'cancelled')",
                )
                .bind(Utc::now())
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if updated == 0 {
                    return Err(PipelineError::validation(
                        "enrollment reached a terminal state concurrently",
                    ));
                }
                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(actor), AuditAction::CancelEnrollment, "enrollment")
                        .target(id)
                        .detail(json!({ "from": from, "reason": reason })),
                )
                .await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;

        info!(enrollment = %id, %from, "enrollment cancelled");
        self.view(id).await
    }

    pub async fn create_class(&self, actor: ProfileId, request: NewClass) -> Result<Class, PipelineError> {
        let result = self.create_class_inner(actor, request).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::CreateClass, "class"),
                result,
            )
            .await
    }

    async fn create_class_inner(
        &self,
        actor: ProfileId,
        request: NewClass,
    ) -> Result<Class, PipelineError> {
        self.gatekeeper
            .authorize(actor, Capability::ManageClasses, &Target::new("class"))
            .await?;
        required(&request.label, "class label")?;
        required(&request.level, "class level")?;
        if request.capacity <= 0 {
            return Err(PipelineError::validation("class capacity must be positive"));
        }
        for instructor in &request.instructors {
            let profile = profiles::load(self.pool(), *instructor)
                .await?
                .ok_or_else(|| PipelineError::not_found("profile", instructor))?;
            if !matches!(profile.role, Role::Instructor | Role::Administrator) || !profile.active {
                return Err(PipelineError::validation(format!(
                    "{} cannot teach a class",
                    profile.display_name
                )));
            }
        }

        let id = ClassId::generate();
        let request = &request;
        self.stores
            .retrying("classes.create", || async move {
                let mut tx = self.pool().begin().await?;
                repository::insert_class(&mut tx, id, request).await?;
                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(actor), AuditAction::CreateClass, "class")
                        .target(id)
                        .detail(json!({
                            "year": request.year,
                            "level": request.level,
                            "capacity": request.capacity,
                        })),
                )
                .await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;

        info!(class = %id, year = request.year, level = %request.level, "class created");
        repository::load_class(self.pool(), id)
            .await?
            .ok_or_else(|| PipelineError::not_found("class", id))
    }

    pub async fn classes(&self, actor: ProfileId, year: Option<i32>) -> Result<Vec<Class>, PipelineError> {
        self.gatekeeper
            .authorize(actor, Capability::ViewEnrollment, &Target::new("class"))
            .await?;
        let year = year.unwrap_or_else(|| Utc::now().year());
        repository::list_classes(self.pool(), year).await
    }

    /// Seat an enrollment in a class of the same year and level. Occupancy is
    /// maintained by the store, which refuses to overfill a class.
    pub async fn assign_class(
        &self,
        actor: ProfileId,
        id: EnrollmentId,
        class_id: ClassId,
    ) -> Result<EnrollmentView, PipelineError> {
        let result = self.assign_class_inner(actor, id, class_id).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::AssignClass, "enrollment").target(id),
                result,
            )
            .await
    }

    async fn assign_class_inner(
        &self,
        actor: ProfileId,
        id: EnrollmentId,
        class_id: ClassId,
    ) -> Result<EnrollmentView, PipelineError> {
        let (enrollment, target) = repository::target(self.pool(), id).await?;
        self.gatekeeper
            .authorize(actor, Capability::AssignClass, &target)
            .await?;
        if enrollment.status == EnrollmentStatus::Cancelled {
            return Err(PipelineError::validation("enrollment is cancelled"));
        }
        let class = repository::load_class(self.pool(), class_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("class", class_id))?;
        if class.year != enrollment.year || normalize_name(&class.level) != normalize_name(&enrollment.level) {
            return Err(PipelineError::validation(format!(
                "class {} is for {} {}, enrollment is {} {}",
                class.label, class.level, class.year, enrollment.level, enrollment.year
            )));
        }
        if enrollment.class_id == Some(class_id) {
            return self.view(id).await;
        }

        let label = class.label.as_str();
        let previous = enrollment.class_id;
        self.stores
            .retrying("enrollment.assign_class", || async move {
                let mut tx = self.pool().begin().await?;
                sqlx::query(
                    "UPDATE enrollments SET class_id = ?, revision = revision + 1, updated_at = ? \
                     WHERE id = ?",
                )
                .bind(class_id.to_string())
                .bind(Utc::now())
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|err| match &err {
                    sqlx::Error::Database(db) if db.is_check_violation() => {
                        PipelineError::validation(format!("class {label} is full"))
                    }
                    _ => PipelineError::from(err),
                })?;
                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(actor), AuditAction::AssignClass, "enrollment")
                        .target(id)
                        .detail(json!({ "class_id": class_id, "previous_class_id": previous })),
                )
                .await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;

        info!(enrollment = %id, class = %class_id, "enrollment assigned to class");
        self.view(id).await
    }

    pub(crate) async fn view(&self, id: EnrollmentId) -> Result<EnrollmentView, PipelineError> {
        let enrollment = repository::load(self.pool(), id)
            .await?
            .ok_or_else(|| PipelineError::not_found("enrollment", id))?;
        let guardians = repository::owners(self.pool(), id).await?;
        let documents = repository::documents(self.pool(), id).await?;
        Ok(EnrollmentView::new(enrollment, guardians, documents))
    }

    async fn require_guardian(&self, id: ProfileId) -> Result<(), PipelineError> {
        match profiles::load(self.pool(), id).await? {
            Some(profile) if profile.role == Role::Guardian && profile.active => Ok(()),
            Some(_) => Err(PipelineError::validation(format!(
                "profile {id} is not an active guardian"
            ))),
            None => Err(PipelineError::not_found("profile", id)),
        }
    }
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, PipelineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::validation(format!("{field} is required")));
    }
    Ok(trimmed)
}

fn optional(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
