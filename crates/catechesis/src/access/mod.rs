//! Role-permission evaluation and the append-only audit trail.
//!
//! Every profile carries a precomputed capability map derived from its role. The
//! map is stored with the profile and recomputed only when the role changes, so
//! evaluation never branches on the role itself.

pub mod audit;
pub mod profiles;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::warn;

use crate::error::PipelineError;
use crate::ids::ProfileId;

pub use audit::{AuditAction, AuditCount, AuditEntry, AuditOutcome, AuditRecord, AuditTrail};
pub use profiles::{NewProfile, Profile, ProfileDirectory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guardian,
    FrontDesk,
    Instructor,
    Treasurer,
    Administrator,
}

impl Role {
    pub const fn label(self) -> &'static str {
        match self {
            Role::Guardian => "guardian",
            Role::FrontDesk => "front_desk",
            Role::Instructor => "instructor",
            Role::Treasurer => "treasurer",
            Role::Administrator => "administrator",
        }
    }

    pub fn is_staff(self) -> bool {
        !matches!(self, Role::Guardian)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Role {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "guardian" | "parent" => Ok(Role::Guardian),
            "front_desk" | "secretary" => Ok(Role::FrontDesk),
            "instructor" | "catechist" => Ok(Role::Instructor),
            "treasurer" => Ok(Role::Treasurer),
            "administrator" | "admin" => Ok(Role::Administrator),
            other => Err(PipelineError::validation(format!("unknown role '{other}'"))),
        }
    }
}

/// Actions gated by the permission map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CreateEnrollment,
    ViewEnrollment,
    CancelEnrollment,
    OverrideDuplicate,
    LinkEnrollment,
    UploadDocument,
    ConfirmDocument,
    SubmitPayment,
    ReviewPayment,
    ViewPaymentQueue,
    AssignClass,
    ManageClasses,
    IssueAccessPage,
    ManageProfiles,
    RunMaintenance,
}

impl Capability {
    pub const ALL: [Capability; 15] = [
        Capability::CreateEnrollment,
        Capability::ViewEnrollment,
        Capability::CancelEnrollment,
        Capability::OverrideDuplicate,
        Capability::LinkEnrollment,
        Capability::UploadDocument,
        Capability::ConfirmDocument,
        Capability::SubmitPayment,
        Capability::ReviewPayment,
        Capability::ViewPaymentQueue,
        Capability::AssignClass,
        Capability::ManageClasses,
        Capability::IssueAccessPage,
        Capability::ManageProfiles,
        Capability::RunMaintenance,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            Capability::CreateEnrollment => "create_enrollment",
            Capability::ViewEnrollment => "view_enrollment",
            Capability::CancelEnrollment => "cancel_enrollment",
            Capability::OverrideDuplicate => "override_duplicate",
            Capability::LinkEnrollment => "link_enrollment",
            Capability::UploadDocument => "upload_document",
            Capability::ConfirmDocument => "confirm_document",
            Capability::SubmitPayment => "submit_payment",
            Capability::ReviewPayment => "review_payment",
            Capability::ViewPaymentQueue => "view_payment_queue",
            Capability::AssignClass => "assign_class",
            Capability::ManageClasses => "manage_classes",
            Capability::IssueAccessPage => "issue_access_page",
            Capability::ManageProfiles => "manage_profiles",
            Capability::RunMaintenance => "run_maintenance",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How far a granted capability reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Only targets the actor owns (a guardian's own children).
    Own,
    Any,
}

/// Precomputed capability map stored alongside each profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeMap<Capability, Scope>);

impl PermissionSet {
    pub fn for_role(role: Role) -> Self {
        use Capability::*;

        let grants: &[(Capability, Scope)] = match role {
            Role::Guardian => &[
                (CreateEnrollment, Scope::Own),
                (ViewEnrollment, Scope::Own),
                (CancelEnrollment, Scope::Own),
                (LinkEnrollment, Scope::Own),
                (UploadDocument, Scope::Own),
                (ConfirmDocument, Scope::Own),
                (SubmitPayment, Scope::Own),
                (IssueAccessPage, Scope::Own),
            ],
            Role::FrontDesk => &[
                (CreateEnrollment, Scope::Any),
                (ViewEnrollment, Scope::Any),
                (CancelEnrollment, Scope::Any),
                (OverrideDuplicate, Scope::Any),
                (LinkEnrollment, Scope::Any),
                (UploadDocument, Scope::Any),
                (ConfirmDocument, Scope::Any),
                (SubmitPayment, Scope::Any),
                (AssignClass, Scope::Any),
                (IssueAccessPage, Scope::Any),
            ],
            Role::Instructor => &[(ViewEnrollment, Scope::Any)],
            Role::Treasurer => &[
                (ViewEnrollment, Scope::Any),
                (SubmitPayment, Scope::Any),
                (ReviewPayment, Scope::Any),
                (ViewPaymentQueue, Scope::Any),
            ],
            Role::Administrator => {
                return Self(
                    Capability::ALL
                        .iter()
                        .map(|capability| (*capability, Scope::Any))
                        .collect(),
                )
            }
        };

        Self(grants.iter().copied().collect())
    }

    pub fn scope(&self, capability: Capability) -> Option<Scope> {
        self.0.get(&capability).copied()
    }

    pub fn grants(&self, capability: Capability) -> bool {
        self.0.contains_key(&capability)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What an action touches, with the profiles that own it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub kind: &'static str,
    pub id: Option<String>,
    pub owners: Vec<ProfileId>,
}

impl Target {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            id: None,
            owners: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl ToString) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn owned_by(mut self, owners: impl IntoIterator<Item = ProfileId>) -> Self {
        self.owners.extend(owners);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    UnknownActor,
    Inactive,
    MissingCapability,
    NotOwner,
}

impl DenyReason {
    pub const fn label(self) -> &'static str {
        match self {
            DenyReason::UnknownActor => "unknown_actor",
            DenyReason::Inactive => "inactive_profile",
            DenyReason::MissingCapability => "missing_capability",
            DenyReason::NotOwner => "not_owner",
        }
    }
}

/// Pure permission check against the profile's stored map.
pub fn evaluate(actor: &Profile, action: Capability, target: &Target) -> Decision {
    if !actor.active {
        return Decision::Deny(DenyReason::Inactive);
    }

    match actor.permissions.scope(action) {
        None => Decision::Deny(DenyReason::MissingCapability),
        Some(Scope::Any) => Decision::Allow,
        Some(Scope::Own) if target.owners.contains(&actor.id) => Decision::Allow,
        Some(Scope::Own) => Decision::Deny(DenyReason::NotOwner),
    }
}

/// Loads the acting profile, evaluates the request, and audits every denial.
#[derive(Debug, Clone)]
pub struct Gatekeeper {
    pool: SqlitePool,
    trail: AuditTrail,
}

impl Gatekeeper {
    pub fn new(pool: SqlitePool) -> Self {
        let trail = AuditTrail::new(pool.clone());
        Self { pool, trail }
    }

    pub fn trail(&self) -> &AuditTrail {
        &self.trail
    }

    pub async fn authorize(
        &self,
        actor: ProfileId,
        action: Capability,
        target: &Target,
    ) -> Result<Profile, PipelineError> {
        let Some(profile) = profiles::load(&self.pool, actor).await? else {
            return self
                .deny(actor, action, target, DenyReason::UnknownActor)
                .await;
        };

        match evaluate(&profile, action, target) {
            Decision::Allow => Ok(profile),
            Decision::Deny(reason) => self.deny(actor, action, target, reason).await,
        }
    }

    async fn deny(
        &self,
        actor: ProfileId,
        action: Capability,
        target: &Target,
        reason: DenyReason,
    ) -> Result<Profile, PipelineError> {
        warn!(%actor, capability = %action, target = target.kind, reason = reason.label(), "permission denied");

        let record = AuditRecord::new(Some(actor), AuditAction::Authorize, target.kind)
            .target_id(target.id.clone())
            .outcome(AuditOutcome::Failure)
            .detail(serde_json::json!({
                "capability": action,
                "reason": reason,
                "error": "permission_error",
            }));
        self.trail.append(&record).await?;

        Err(PipelineError::Permission {
            actor: actor.to_string(),
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn profile(role: Role) -> Profile {
        Profile {
            id: ProfileId::generate(),
            display_name: "Awa Ndiaye".to_string(),
            role,
            channel_identity: None,
            has_access_code: false,
            permissions: PermissionSet::for_role(role),
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn guardians_reach_only_their_own_targets() {
        let guardian = profile(Role::Guardian);
        let own = Target::new("enrollment").owned_by([guardian.id]);
        let foreign = Target::new("enrollment").owned_by([ProfileId::generate()]);

        assert_eq!(
            evaluate(&guardian, Capability::UploadDocument, &own),
            Decision::Allow
        );
        assert_eq!(
            evaluate(&guardian, Capability::UploadDocument, &foreign),
            Decision::Deny(DenyReason::NotOwner)
        );
        assert_eq!(
            evaluate(&guardian, Capability::ReviewPayment, &own),
            Decision::Deny(DenyReason::MissingCapability)
        );
    }

    #[test]
    fn only_treasurers_and_administrators_review_payments() {
        let target = Target::new("payment");
        for role in [Role::Guardian, Role::FrontDesk, Role::Instructor] {
            assert_ne!(
                evaluate(&profile(role), Capability::ReviewPayment, &target),
                Decision::Allow,
                "{role}"
            );
        }
        for role in [Role::Treasurer, Role::Administrator] {
            assert_eq!(
                evaluate(&profile(role), Capability::ReviewPayment, &target),
                Decision::Allow
            );
        }
    }

    #[test]
    fn inactive_profiles_are_denied_everything() {
        let mut admin = profile(Role::Administrator);
        admin.active = false;
        assert_eq!(
            evaluate(&admin, Capability::ViewEnrollment, &Target::new("enrollment")),
            Decision::Deny(DenyReason::Inactive)
        );
    }

    #[test]
    fn administrator_holds_every_capability() {
        let set = PermissionSet::for_role(Role::Administrator);
        assert_eq!(set.len(), Capability::ALL.len());
        assert!(Capability::ALL.iter().all(|capability| set.grants(*capability)));
    }

    #[test]
    fn permission_sets_round_trip_as_json_maps() {
        let set = PermissionSet::for_role(Role::Treasurer);
        let json = serde_json::to_string(&set).expect("serializes");
        assert!(json.contains("\"review_payment\":\"any\""));
        let back: PermissionSet = serde_json::from_str(&json).expect("parses");
        assert_eq!(back, set);
    }
}
