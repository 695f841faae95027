use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::{Executor, Sqlite, SqliteConnection, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use super::audit::{self, AuditAction, AuditOutcome, AuditRecord, AuditTrail};
use super::{Capability, Gatekeeper, PermissionSet, Role, Target};
use crate::error::PipelineError;
use crate::ids::{parse_stored, ProfileId};
use crate::stores::StoreSet;

const MIN_ACCESS_CODE_LEN: usize = 4;
const CODE_SCHEME: &str = "hmac-sha256";
/// Consecutive wrong codes before a profile is locked.
pub const MAX_FAILED_CODE_ATTEMPTS: i64 = 5;
pub const CODE_LOCKOUT_MINUTES: i64 = 15;

#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub id: ProfileId,
    pub display_name: String,
    pub role: Role,
    pub channel_identity: Option<String>,
    pub has_access_code: bool,
    pub permissions: PermissionSet,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProfile {
    pub display_name: String,
    pub role: Role,
    #[serde(default)]
    pub channel_identity: Option<String>,
    #[serde(default)]
    pub access_code: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    id: String,
    display_name: String,
    role: String,
    channel_identity: Option<String>,
    access_code_hash: Option<String>,
    permissions: String,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProfileRow {
    fn into_profile(self) -> Result<Profile, PipelineError> {
        let role = self
            .role
            .parse::<Role>()
            .map_err(|_| PipelineError::Store(format!("corrupt role '{}'", self.role)))?;
        let permissions: PermissionSet = serde_json::from_str(&self.permissions)
            .map_err(|err| PipelineError::Store(format!("corrupt permission set: {err}")))?;

        Ok(Profile {
            id: parse_stored(&self.id)?,
            display_name: self.display_name,
            role,
            channel_identity: self.channel_identity,
            has_access_code: self.access_code_hash.is_some(),
            permissions,
            active: self.active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const PROFILE_COLUMNS: &str = "id, display_name, role, channel_identity, access_code_hash, \
                               permissions, active, created_at, updated_at";

pub(crate) async fn load<'e, E>(executor: E, id: ProfileId) -> Result<Option<Profile>, PipelineError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, ProfileRow>(&format!(
        "SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = ?"
    ))
    .bind(id.to_string())
    .fetch_optional(executor)
    .await?;

    row.map(ProfileRow::into_profile).transpose()
}

/// Salted HMAC-SHA256, encoded as `hmac-sha256$<salt>$<digest>`.
pub fn hash_access_code(code: &str) -> String {
    let salt = Uuid::new_v4();
    let digest = code_mac(salt.as_bytes(), code)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default();
    format!("{CODE_SCHEME}${}${digest}", hex::encode(salt.as_bytes()))
}

fn code_mac(salt: &[u8], code: &str) -> Option<Hmac<Sha256>> {
    let mut mac = <Hmac<Sha256>>::new_from_slice(salt).ok()?;
    mac.update(code.trim().as_bytes());
    Some(mac)
}

/// Constant-time check of `candidate` against a stored digest.
pub fn verify_access_code(stored: &str, candidate: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(CODE_SCHEME), Some(salt), Some(digest)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let (Ok(salt), Ok(digest)) = (hex::decode(salt), hex::decode(digest)) else {
        return false;
    };
    code_mac(&salt, candidate).is_some_and(|mac| mac.verify_slice(&digest).is_ok())
}

enum CodeCheck {
    Accepted,
    Rejected,
    Locked(DateTime<Utc>),
}

fn validate_access_code(role: Role, code: &str) -> Result<(), PipelineError> {
    if role != Role::Guardian {
        return Err(PipelineError::validation(
            "access codes are only issued to guardians",
        ));
    }
    if code.trim().chars().count() < MIN_ACCESS_CODE_LEN {
        return Err(PipelineError::validation(format!(
            "access code must have at least {MIN_ACCESS_CODE_LEN} characters"
        )));
    }
    Ok(())
}

/// Profile administration and first-contact guardian provisioning.
#[derive(Debug, Clone)]
pub struct ProfileDirectory {
    stores: StoreSet,
    gatekeeper: Gatekeeper,
    trail: AuditTrail,
}

impl ProfileDirectory {
    pub fn new(stores: StoreSet, gatekeeper: Gatekeeper) -> Self {
        let trail = gatekeeper.trail().clone();
        Self {
            stores,
            gatekeeper,
            trail,
        }
    }

    fn pool(&self) -> &SqlitePool {
        self.stores.enrollment()
    }

    pub async fn get(&self, id: ProfileId) -> Result<Profile, PipelineError> {
        load(self.pool(), id)
            .await?
            .ok_or_else(|| PipelineError::not_found("profile", id))
    }

    /// A profile as seen by `actor`: their own, or any with profile management.
    pub async fn view(&self, actor: ProfileId, id: ProfileId) -> Result<Profile, PipelineError> {
        if actor != id {
            self.gatekeeper
                .authorize(actor, Capability::ManageProfiles, &Target::new("profile").with_id(id))
                .await?;
        }
        self.get(id).await
    }

    pub async fn find_by_channel(&self, channel: &str) -> Result<Option<Profile>, PipelineError> {
        let row = sqlx::query_as::<_, ProfileRow>(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE channel_identity = ?"
        ))
        .bind(channel.trim())
        .fetch_optional(self.pool())
        .await?;
        row.map(ProfileRow::into_profile).transpose()
    }

    pub async fn create(
        &self,
        actor: ProfileId,
        request: NewProfile,
    ) -> Result<Profile, PipelineError> {
        let result = self.create_inner(actor, request).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::CreateProfile, "profile"),
                result,
            )
            .await
    }

    async fn create_inner(
        &self,
        actor: ProfileId,
        request: NewProfile,
    ) -> Result<Profile, PipelineError> {
        self.gatekeeper
            .authorize(actor, Capability::ManageProfiles, &Target::new("profile"))
            .await?;

        let display_name = request.display_name.trim().to_string();
        if display_name.is_empty() {
            return Err(PipelineError::validation("display name is required"));
        }
        let role = request.role;
        let code_hash = match request.access_code.as_deref() {
            Some(code) => {
                validate_access_code(role, code)?;
                Some(hash_access_code(code))
            }
            None => None,
        };
        let channel = request
            .channel_identity
            .map(|channel| channel.trim().to_string())
            .filter(|channel| !channel.is_empty());

        let id = ProfileId::generate();
        let display_name = display_name.as_str();
        let channel = channel.as_deref();
        let code_hash = code_hash.as_deref();

        self.stores
            .retrying("profiles.create", || async move {
                let mut tx = self.pool().begin().await?;
                insert(&mut tx, id, display_name, role, channel, code_hash).await?;
                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(actor), AuditAction::CreateProfile, "profile")
                        .target(id)
                        .detail(serde_json::json!({ "role": role })),
                )
                .await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;

        info!(profile = %id, %role, "profile created");
        self.get(id).await
    }

    /// Find or create the guardian behind a messaging-channel identity. The flag
    /// reports whether a profile was created.
    pub async fn provision_guardian(
        &self,
        channel_identity: &str,
        display_name: &str,
    ) -> Result<(Profile, bool), PipelineError> {
        let channel = channel_identity.trim();
        if channel.is_empty() {
            return Err(PipelineError::validation("channel identity is required"));
        }
        if let Some(existing) = self.find_by_channel(channel).await? {
            return Ok((existing, false));
        }

        let id = ProfileId::generate();
        let name = if display_name.trim().is_empty() {
            channel
        } else {
            display_name.trim()
        };

        let created = self
            .stores
            .retrying("profiles.provision", || async move {
                let mut tx = self.pool().begin().await?;
                let now = Utc::now();
                let inserted = sqlx::query(
                    "INSERT INTO profiles (id, display_name, role, channel_identity, permissions, \
                     active, created_at, updated_at) VALUES (?, ?, ?, ?, ?, 1, ?, ?) \
                     ON CONFLICT(channel_identity) DO NOTHING",
                )
                .bind(id.to_string())
                .bind(name)
                .bind(Role::Guardian.label())
                .bind(channel)
                .bind(permissions_json(Role::Guardian)?)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if inserted == 0 {
                    return Ok(false);
                }

                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(id), AuditAction::ProvisionGuardian, "profile")
                        .target(id)
                        .detail(serde_json::json!({ "channel": channel })),
                )
                .await?;
                tx.commit().await?;
                Ok(true)
            })
            .await?;

        if created {
            info!(profile = %id, "guardian provisioned on first contact");
            return Ok((self.get(id).await?, true));
        }

        // Lost a race with a concurrent first contact.
        let existing = self
            .find_by_channel(channel)
            .await?
            .ok_or_else(|| PipelineError::not_found("profile", channel))?;
        Ok((existing, false))
    }

    /// Change a role; the stored permission set is recomputed in the same write.
    pub async fn change_role(
        &self,
        actor: ProfileId,
        id: ProfileId,
        role: Role,
    ) -> Result<Profile, PipelineError> {
        let result = self.change_role_inner(actor, id, role).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::ChangeRole, "profile").target(id),
                result,
            )
            .await
    }

    async fn change_role_inner(
        &self,
        actor: ProfileId,
        id: ProfileId,
        role: Role,
    ) -> Result<Profile, PipelineError> {
        self.gatekeeper
            .authorize(
                actor,
                Capability::ManageProfiles,
                &Target::new("profile").with_id(id),
            )
            .await?;
        let previous = self.get(id).await?.role;

        self.stores
            .retrying("profiles.change_role", || async move {
                let mut tx = self.pool().begin().await?;
                // Non-guardians never keep an access code.
                sqlx::query(
                    "UPDATE profiles SET role = ?, permissions = ?, updated_at = ?, \
                     access_code_hash = CASE WHEN ? THEN access_code_hash ELSE NULL END \
                     WHERE id = ?",
                )
                .bind(role.label())
                .bind(permissions_json(role)?)
                .bind(Utc::now())
                .bind(role == Role::Guardian)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
                audit::record(
                    &mut tx,
                    &AuditRecord::new(Some(actor), AuditAction::ChangeRole, "profile")
                        .target(id)
                        .detail(serde_json::json!({ "from": previous, "to": role })),
                )
                .await?;
                tx.commit().await?;
                Ok(())
            })
            .await?;

        info!(profile = %id, from = %previous, to = %role, "role changed");
        self.get(id).await
    }

    /// Set a guardian's access code. Guardians may set their own; administrators
    /// may set anyone's.
    pub async fn set_access_code(
        &self,
        actor: ProfileId,
        id: ProfileId,
        code: &str,
    ) -> Result<(), PipelineError> {
        let result = self.set_access_code_inner(actor, id, code).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::SetAccessCode, "profile").target(id),
                result,
            )
            .await
    }

    async fn set_access_code_inner(
        &self,
        actor: ProfileId,
        id: ProfileId,
        code: &str,
    ) -> Result<(), PipelineError> {
        let target = self.get(id).await?;
        if actor != id {
            self.gatekeeper
                .authorize(
                    actor,
                    Capability::ManageProfiles,
                    &Target::new("profile").with_id(id),
                )
                .await?;
        } else if !target.active {
            return Err(PipelineError::validation("profile is inactive"));
        }
        validate_access_code(target.role, code)?;
        let hash = hash_access_code(code);

        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE profiles SET access_code_hash = ?, updated_at = ? WHERE id = ?")
            .bind(&hash)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        audit::record(
            &mut tx,
            &AuditRecord::new(Some(actor), AuditAction::SetAccessCode, "profile").target(id),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Check a guardian's access code. Every attempt is audited; after
    /// [`MAX_FAILED_CODE_ATTEMPTS`] consecutive misses the profile refuses
    /// codes for [`CODE_LOCKOUT_MINUTES`].
    pub async fn verify_access_code(
        &self,
        id: ProfileId,
        candidate: &str,
    ) -> Result<bool, PipelineError> {
        let check = self
            .stores
            .retrying("profiles.verify_access_code", || async move {
                let mut tx = self.pool().begin().await?;
                crate::stores::claim(&mut tx, "profiles.verify_access_code").await?;
                let row: Option<(Option<String>, i64, Option<DateTime<Utc>>)> = sqlx::query_as(
                    "SELECT access_code_hash, failed_code_attempts, code_locked_until \
                     FROM profiles WHERE id = ? AND active = 1",
                )
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;

                let now = Utc::now();
                let entry = AuditRecord::new(None, AuditAction::VerifyAccessCode, "profile")
                    .target(id);
                let (check, entry) = match row {
                    Some((_, _, Some(until))) if until > now => (
                        CodeCheck::Locked(until),
                        entry
                            .outcome(AuditOutcome::Failure)
                            .detail(serde_json::json!({ "reason": "locked", "locked_until": until })),
                    ),
                    Some((Some(hash), _, _)) if verify_access_code(&hash, candidate) => {
                        sqlx::query(
                            "UPDATE profiles SET failed_code_attempts = 0, code_locked_until = NULL \
                             WHERE id = ?",
                        )
                        .bind(id.to_string())
                        .execute(&mut *tx)
                        .await?;
                        (CodeCheck::Accepted, entry)
                    }
                    Some((Some(_), attempts, _)) => {
                        let attempts = attempts + 1;
                        let locked_until = (attempts >= MAX_FAILED_CODE_ATTEMPTS)
                            .then(|| now + chrono::Duration::minutes(CODE_LOCKOUT_MINUTES));
                        sqlx::query(
                            "UPDATE profiles SET failed_code_attempts = ?, code_locked_until = ? \
                             WHERE id = ?",
                        )
                        .bind(if locked_until.is_some() { 0 } else { attempts })
                        .bind(locked_until)
                        .bind(id.to_string())
                        .execute(&mut *tx)
                        .await?;
                        (
                            CodeCheck::Rejected,
                            entry.outcome(AuditOutcome::Failure).detail(serde_json::json!({
                                "reason": "wrong_code",
                                "attempts": attempts,
                                "locked_until": locked_until,
                            })),
                        )
                    }
                    Some((None, _, _)) | None => (
                        CodeCheck::Rejected,
                        entry
                            .outcome(AuditOutcome::Failure)
                            .detail(serde_json::json!({ "reason": "no_access_code" })),
                    ),
                };
                audit::record(&mut tx, &entry).await?;
                tx.commit().await?;
                Ok(check)
            })
            .await?;

        match check {
            CodeCheck::Accepted => Ok(true),
            CodeCheck::Rejected => Ok(false),
            CodeCheck::Locked(until) => {
                warn!(profile = %id, %until, "access code check refused while locked");
                Err(PipelineError::validation(format!(
                    "too many wrong access codes; try again after {}",
                    until.format("%H:%M UTC")
                )))
            }
        }
    }

    pub async fn deactivate(
        &self,
        actor: ProfileId,
        id: ProfileId,
    ) -> Result<Profile, PipelineError> {
        let result = self.deactivate_inner(actor, id).await;
        self.trail
            .on_failure(
                AuditRecord::new(Some(actor), AuditAction::DeactivateProfile, "profile")
                    .target(id),
                result,
            )
            .await
    }

    async fn deactivate_inner(
        &self,
        actor: ProfileId,
        id: ProfileId,
    ) -> Result<Profile, PipelineError> {
        self.gatekeeper
            .authorize(
                actor,
                Capability::ManageProfiles,
                &Target::new("profile").with_id(id),
            )
            .await?;
        if actor == id {
            return Err(PipelineError::validation(
                "profiles cannot deactivate themselves",
            ));
        }

        let mut tx = self.pool().begin().await?;
        let updated = sqlx::query(
            "UPDATE profiles SET active = 0, updated_at = ? WHERE id = ? AND active = 1",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(PipelineError::not_found("active profile", id));
        }
        audit::record(
            &mut tx,
            &AuditRecord::new(Some(actor), AuditAction::DeactivateProfile, "profile").target(id),
        )
        .await?;
        tx.commit().await?;

        info!(profile = %id, "profile deactivated");
        self.get(id).await
    }

    /// Create the first administrator. Refused once an active administrator exists.
    pub async fn bootstrap_administrator(
        &self,
        display_name: &str,
    ) -> Result<Profile, PipelineError> {
        let name = display_name.trim();
        if name.is_empty() {
            return Err(PipelineError::validation("display name is required"));
        }

        let id = ProfileId::generate();
        let mut tx = self.pool().begin().await?;
        crate::stores::claim(&mut tx, "profiles.bootstrap").await?;
        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM profiles WHERE role = ? AND active = 1")
                .bind(Role::Administrator.label())
                .fetch_one(&mut *tx)
                .await?;
        if existing > 0 {
            return Err(PipelineError::validation("an administrator already exists"));
        }

        insert(&mut tx, id, name, Role::Administrator, None, None).await?;
        audit::record(
            &mut tx,
            &AuditRecord::new(None, AuditAction::CreateProfile, "profile")
                .target(id)
                .detail(serde_json::json!({ "role": Role::Administrator, "bootstrap": true })),
        )
        .await?;
        tx.commit().await?;

        info!(profile = %id, "administrator bootstrapped");
        self.get(id).await
    }
}

fn permissions_json(role: Role) -> Result<String, PipelineError> {
    serde_json::to_string(&PermissionSet::for_role(role))
        .map_err(|err| PipelineError::Store(format!("permission set not serializable: {err}")))
}

async fn insert(
    conn: &mut SqliteConnection,
    id: ProfileId,
    display_name: &str,
    role: Role,
    channel: Option<&str>,
    code_hash: Option<&str>,
) -> Result<(), PipelineError> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO profiles (id, display_name, role, channel_identity, access_code_hash, \
         permissions, active, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(id.to_string())
    .bind(display_name)
    .bind(role.label())
    .bind(channel)
    .bind(code_hash)
    .bind(permissions_json(role)?)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|err| match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            PipelineError::validation("channel identity already belongs to another profile")
        }
        _ => PipelineError::from(err),
    })?;
    Ok(())
}
