use crate::audit::{self, Actor, AuditAction, RequestMetadata};
use crate::database::Database;
use crate::security::{self, CredentialHasher};
use crate::{DmsError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Roles a principal may hold. DMS_Admin is a superset capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Author,
    Reviewer,
    Approver,
    DmsAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Author => "Author",
            Role::Reviewer => "Reviewer",
            Role::Approver => "Approver",
            Role::DmsAdmin => "DMS_Admin",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Author" => Ok(Role::Author),
            "Reviewer" => Ok(Role::Reviewer),
            "Approver" => Ok(Role::Approver),
            "DMS_Admin" => Ok(Role::DmsAdmin),
            other => Err(DmsError::validation(
                "role",
                format!("unknown role: '{}'", other),
            )),
        }
    }
}

/// An authenticated identity with its effective role set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(skip_serializing)]
    pub salt: String,
    pub roles: Vec<Role>,
    pub is_active: bool,
    pub active_session_token: Option<String>,
    pub session_last_activity: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Principal {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(Role::DmsAdmin)
    }

    pub fn actor(&self) -> Actor<'_> {
        Actor {
            principal_id: &self.id,
            username: &self.username,
        }
    }
}

// Capability layer. Handlers call these boolean questions and never inspect
// role names directly.

pub fn can_manage_principals(p: &Principal) -> bool {
    p.is_admin()
}

pub fn can_create_document(p: &Principal) -> bool {
    p.has_role(Role::Author) || p.is_admin()
}

/// Draft mutation (content save, lock acquisition, metadata edit)
pub fn can_edit_draft(p: &Principal, owner_id: &str) -> bool {
    (p.has_role(Role::Author) && p.id == owner_id) || p.is_admin()
}

pub fn can_submit(p: &Principal, owner_id: &str) -> bool {
    can_edit_draft(p, owner_id)
}

pub fn can_review(p: &Principal) -> bool {
    p.has_role(Role::Reviewer) || p.is_admin()
}

pub fn can_approve(p: &Principal) -> bool {
    p.has_role(Role::Approver) || p.is_admin()
}

pub fn can_publish(p: &Principal) -> bool {
    p.is_admin()
}

pub fn can_archive(p: &Principal) -> bool {
    p.is_admin()
}

pub fn can_delete_document(p: &Principal) -> bool {
    p.is_admin()
}

/// Force-releasing another principal's edit lock
pub fn can_force_release_lock(p: &Principal) -> bool {
    p.is_admin()
}

/// Commenting capability; independent of the workflow stage the version is in
pub fn can_comment(p: &Principal) -> bool {
    p.has_role(Role::Reviewer) || p.has_role(Role::Approver) || p.is_admin()
}

// Repository functions. All take a connection so they compose into the
// caller's transaction.

pub fn insert_principal(conn: &Connection, principal: &Principal) -> Result<()> {
    conn.execute(
        "INSERT INTO principals (
            id, username, password_hash, salt, is_active,
            active_session_token, session_last_activity, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            principal.id,
            principal.username,
            principal.password_hash,
            principal.salt,
            principal.is_active,
            principal.active_session_token,
            principal.session_last_activity.map(|t| t.to_rfc3339()),
            principal.created_at.to_rfc3339(),
            principal.updated_at.to_rfc3339(),
        ],
    )?;
    for role in &principal.roles {
        conn.execute(
            "INSERT INTO role_assignments (principal_id, role) VALUES (?1, ?2)",
            params![principal.id, role.as_str()],
        )?;
    }
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Principal>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, password_hash, salt, is_active,
                active_session_token, session_last_activity, created_at, updated_at
         FROM principals WHERE id = ?1",
    )?;
    let principal = stmt
        .query_row(params![id], row_to_principal)
        .optional()?;
    attach_roles(conn, principal)
}

pub fn find_by_username(conn: &Connection, username: &str) -> Result<Option<Principal>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, password_hash, salt, is_active,
                active_session_token, session_last_activity, created_at, updated_at
         FROM principals WHERE username = ?1",
    )?;
    let principal = stmt
        .query_row(params![username], row_to_principal)
        .optional()?;
    attach_roles(conn, principal)
}

fn attach_roles(conn: &Connection, principal: Option<Principal>) -> Result<Option<Principal>> {
    match principal {
        Some(mut p) => {
            p.roles = load_roles(conn, &p.id)?;
            Ok(Some(p))
        }
        None => Ok(None),
    }
}

fn load_roles(conn: &Connection, principal_id: &str) -> Result<Vec<Role>> {
    let mut stmt =
        conn.prepare("SELECT role FROM role_assignments WHERE principal_id = ?1 ORDER BY role")?;
    let rows = stmt.query_map(params![principal_id], |row| row.get::<_, String>(0))?;
    let mut roles = Vec::new();
    for row in rows {
        roles.push(Role::parse(&row?)?);
    }
    Ok(roles)
}

fn row_to_principal(row: &rusqlite::Row) -> rusqlite::Result<Principal> {
    Ok(Principal {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        salt: row.get(3)?,
        roles: Vec::new(),
        is_active: row.get(4)?,
        active_session_token: row.get(5)?,
        session_last_activity: parse_opt_ts(row.get::<_, Option<String>>(6)?),
        created_at: parse_ts(row.get::<_, String>(7)?),
        updated_at: parse_ts(row.get::<_, String>(8)?),
    })
}

pub(crate) fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Replace the principal's single-session token
pub fn set_active_session(
    conn: &Connection,
    principal_id: &str,
    token: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE principals
         SET active_session_token = ?2, session_last_activity = ?3, updated_at = ?3
         WHERE id = ?1",
        params![principal_id, token, now.to_rfc3339()],
    )?;
    Ok(())
}

/// Request to create a principal. A closed record of recognised fields.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPrincipal {
    pub username: String,
    pub credential: String,
    pub roles: Vec<Role>,
}

/// Principal administration. Principals are created by DMS_Admin and never
/// deleted, only deactivated, so audit references stay resolvable.
#[derive(Clone)]
pub struct PrincipalService {
    db: Database,
    hasher: CredentialHasher,
    min_credential_length: usize,
}

impl PrincipalService {
    pub fn new(db: Database, hasher: CredentialHasher, min_credential_length: usize) -> Self {
        Self {
            db,
            hasher,
            min_credential_length,
        }
    }

    pub fn get(&self, id: &str) -> Result<Principal> {
        self.db.with_connection(|conn| {
            find_by_id(conn, id)?.ok_or_else(|| DmsError::not_found("principal", id))
        })
    }

    pub fn get_by_username(&self, username: &str) -> Result<Principal> {
        self.db.with_connection(|conn| {
            find_by_username(conn, username)?
                .ok_or_else(|| DmsError::not_found("principal", username))
        })
    }

    /// Create a principal (admin only)
    pub fn create(
        &self,
        acting: &Principal,
        request: NewPrincipal,
        meta: &RequestMetadata,
    ) -> Result<Principal> {
        if !can_manage_principals(acting) {
            return Err(DmsError::permission_denied("create principal"));
        }
        if request.username.trim().is_empty() {
            return Err(DmsError::validation("username", "username is required"));
        }
        if request.roles.is_empty() {
            return Err(DmsError::validation("roles", "at least one role is required"));
        }
        security::validate_credential(&request.credential, self.min_credential_length)?;

        let (hash, salt) = self.hasher.hash(&request.credential)?;
        let now = Utc::now();
        let principal = Principal {
            id: Uuid::new_v4().to_string(),
            username: request.username.trim().to_string(),
            password_hash: hash,
            salt,
            roles: dedup_roles(request.roles),
            is_active: true,
            active_session_token: None,
            session_last_activity: None,
            created_at: now,
            updated_at: now,
        };

        self.db.transaction(|tx| {
            if find_by_username(tx, &principal.username)?.is_some() {
                return Err(DmsError::AlreadyExists {
                    resource: "principal".to_string(),
                    id: principal.username.clone(),
                });
            }
            insert_principal(tx, &principal)?;
            audit::record(
                tx,
                &acting.actor(),
                AuditAction::UserCreated,
                "principal",
                &principal.id,
                &format!("Created principal '{}'", principal.username),
                serde_json::json!({
                    "username": &principal.username,
                    "roles": &principal.roles,
                }),
                meta,
            )?;
            Ok(())
        })?;

        Ok(principal)
    }

    /// Deactivate a principal (admin only). Also invalidates any active
    /// session so subsequent probes observe it.
    pub fn deactivate(
        &self,
        acting: &Principal,
        principal_id: &str,
        meta: &RequestMetadata,
    ) -> Result<()> {
        if !can_manage_principals(acting) {
            return Err(DmsError::permission_denied("deactivate principal"));
        }

        self.db.transaction(|tx| {
            let target = find_by_id(tx, principal_id)?
                .ok_or_else(|| DmsError::not_found("principal", principal_id))?;
            tx.execute(
                "UPDATE principals
                 SET is_active = 0, active_session_token = NULL, updated_at = ?2
                 WHERE id = ?1",
                params![principal_id, Utc::now().to_rfc3339()],
            )?;
            audit::record(
                tx,
                &acting.actor(),
                AuditAction::UserDeactivated,
                "principal",
                principal_id,
                &format!("Deactivated principal '{}'", target.username),
                serde_json::json!({ "username": target.username }),
                meta,
            )?;
            Ok(())
        })
    }

    /// Reset a principal's credential (admin only)
    pub fn reset_credential(
        &self,
        acting: &Principal,
        principal_id: &str,
        new_credential: &str,
        meta: &RequestMetadata,
    ) -> Result<()> {
        if !can_manage_principals(acting) {
            return Err(DmsError::permission_denied("reset credential"));
        }
        security::validate_credential(new_credential, self.min_credential_length)?;
        let (hash, salt) = self.hasher.hash(new_credential)?;

        self.db.transaction(|tx| {
            let target = find_by_id(tx, principal_id)?
                .ok_or_else(|| DmsError::not_found("principal", principal_id))?;
            tx.execute(
                "UPDATE principals SET password_hash = ?2, salt = ?3, updated_at = ?4 WHERE id = ?1",
                params![principal_id, hash, salt, Utc::now().to_rfc3339()],
            )?;
            audit::record(
                tx,
                &acting.actor(),
                AuditAction::PasswordReset,
                "principal",
                principal_id,
                &format!("Reset credential for '{}'", target.username),
                serde_json::json!({ "username": target.username }),
                meta,
            )?;
            Ok(())
        })
    }

    /// First-run bootstrap: create a DMS_Admin when no principals exist.
    /// The new admin is its own audit actor.
    pub fn bootstrap_admin(&self, username: &str, credential: &str) -> Result<Principal> {
        security::validate_credential(credential, self.min_credential_length)?;
        let (hash, salt) = self.hasher.hash(credential)?;
        let now = Utc::now();
        let principal = Principal {
            id: Uuid::new_v4().to_string(),
            username: username.trim().to_string(),
            password_hash: hash,
            salt,
            roles: vec![Role::DmsAdmin],
            is_active: true,
            active_session_token: None,
            session_last_activity: None,
            created_at: now,
            updated_at: now,
        };

        self.db.transaction(|tx| {
            let existing: i64 =
                tx.query_row("SELECT COUNT(*) FROM principals", [], |row| row.get(0))?;
            if existing > 0 {
                return Err(DmsError::AlreadyExists {
                    resource: "principal".to_string(),
                    id: "bootstrap admin".to_string(),
                });
            }
            insert_principal(tx, &principal)?;
            audit::record(
                tx,
                &principal.actor(),
                AuditAction::UserCreated,
                "principal",
                &principal.id,
                &format!("Bootstrapped admin principal '{}'", principal.username),
                serde_json::json!({ "bootstrap": true }),
                &RequestMetadata::default(),
            )?;
            Ok(())
        })?;

        Ok(principal)
    }
}

fn dedup_roles(mut roles: Vec<Role>) -> Vec<Role> {
    roles.sort();
    roles.dedup();
    roles
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Insert a principal directly, bypassing the admin gate (test setup)
    pub fn seed_principal(db: &Database, username: &str, credential: &str, roles: Vec<Role>) -> Principal {
        let hasher = CredentialHasher::new(1000);
        let (hash, salt) = hasher.hash(credential).unwrap();
        let now = Utc::now();
        let principal = Principal {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: hash,
            salt,
            roles,
            is_active: true,
            active_session_token: None,
            session_last_activity: None,
            created_at: now,
            updated_at: now,
        };
        db.transaction(|tx| insert_principal(tx, &principal)).unwrap();
        principal
    }
}
