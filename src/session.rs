use crate::audit::{self, AuditAction, RequestMetadata};
use crate::database::Database;
use crate::identity::{self, Principal, Role};
use crate::security::{self, CredentialHasher};
use crate::{DmsError, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// A bearer session issued at login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub principal_id: String,
    pub username: String,
    /// Role snapshot at issuance
    pub roles: Vec<Role>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a session-validity probe. Stateless read; never blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProbe {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SessionProbe {
    fn invalid(reason: &str) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
        }
    }

    fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }
}

/// Session and authentication gate.
///
/// The server is authoritative for the single-session policy: the
/// principal record carries the one active session token, and a forced
/// re-login invalidates the previous token so subsequent probes by the old
/// session observe it. Client polling is a latency optimisation only.
#[derive(Clone)]
pub struct AuthService {
    db: Database,
    hasher: CredentialHasher,
    session_timeout_minutes: i64,
}

impl AuthService {
    pub fn new(db: Database, hasher: CredentialHasher, session_timeout_minutes: i64) -> Self {
        Self {
            db,
            hasher,
            session_timeout_minutes,
        }
    }

    /// Authenticate a username/credential pair and issue a bearer session.
    ///
    /// Fails with `SessionConflict` when an unexpired session exists for the
    /// principal, unless `force` is set, in which case the previous session
    /// is invalidated.
    pub fn login(
        &self,
        username: &str,
        credential: &str,
        force: bool,
        meta: &RequestMetadata,
    ) -> Result<Session> {
        self.login_at(username, credential, force, meta, Utc::now())
    }

    pub(crate) fn login_at(
        &self,
        username: &str,
        credential: &str,
        force: bool,
        meta: &RequestMetadata,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        // Authentication failures commit their audit entries by design, so
        // the closure returns the failure as a value instead of rolling the
        // transaction back with it.
        let attempt = self.db.transaction(|tx| {
            let principal = match identity::find_by_username(tx, username)? {
                Some(p) => p,
                // Same failure as a bad credential so the response never
                // reveals whether the username exists
                None => return Ok(Err(DmsError::InvalidCredentials)),
            };

            if !self
                .hasher
                .verify(credential, &principal.password_hash, &principal.salt)?
            {
                audit::record(
                    tx,
                    &principal.actor(),
                    AuditAction::LoginFailure,
                    "session",
                    &principal.id,
                    "Login failed: credential mismatch",
                    serde_json::json!({ "reason": "credential_mismatch" }),
                    meta,
                )?;
                return Ok(Err(DmsError::InvalidCredentials));
            }

            if !principal.is_active {
                audit::record(
                    tx,
                    &principal.actor(),
                    AuditAction::LoginFailure,
                    "session",
                    &principal.id,
                    "Login failed: account deactivated",
                    serde_json::json!({ "reason": "deactivated" }),
                    meta,
                )?;
                return Ok(Err(DmsError::Deactivated));
            }

            if let Some(existing_token) = &principal.active_session_token {
                if let Some(existing) = find_session(tx, existing_token)? {
                    let alive = existing.is_active && existing.session.expires_at > now;
                    if alive && !force {
                        return Ok(Err(DmsError::SessionConflict));
                    }
                    if alive {
                        invalidate_session(tx, existing_token)?;
                    }
                }
            }

            let session = Session {
                token: security::generate_token(),
                principal_id: principal.id.clone(),
                username: principal.username.clone(),
                roles: principal.roles.clone(),
                issued_at: now,
                expires_at: now + Duration::minutes(self.session_timeout_minutes),
            };
            insert_session(tx, &session)?;
            identity::set_active_session(tx, &principal.id, Some(&session.token), now)?;

            audit::record(
                tx,
                &principal.actor(),
                AuditAction::LoginSuccess,
                "session",
                &principal.id,
                &format!("Principal '{}' logged in", principal.username),
                serde_json::json!({ "forced": force }),
                meta,
            )?;

            Ok(Ok(session))
        })?;
        attempt
    }

    /// Session-validity probe. Consumers poll this at most every 30 seconds
    /// and on tab-focus events.
    pub fn validate(&self, token: &str) -> Result<SessionProbe> {
        self.validate_at(token, Utc::now())
    }

    pub(crate) fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<SessionProbe> {
        self.db.with_connection(|conn| {
            let stored = match find_session(conn, token)? {
                Some(s) => s,
                None => return Ok(SessionProbe::invalid("unknown")),
            };

            let principal = identity::find_by_id(conn, &stored.session.principal_id)?;
            match principal {
                Some(p) if !p.is_active => return Ok(SessionProbe::invalid("deactivated")),
                None => return Ok(SessionProbe::invalid("deactivated")),
                Some(p) => {
                    if now > stored.session.expires_at {
                        return Ok(SessionProbe::invalid("expired"));
                    }
                    if !stored.is_active
                        || p.active_session_token.as_deref() != Some(token)
                    {
                        return Ok(SessionProbe::invalid("superseded"));
                    }
                }
            }

            Ok(SessionProbe::valid())
        })
    }

    /// Resolve a bearer token to its principal for a guarded operation
    pub fn authenticate(&self, token: &str) -> Result<Principal> {
        self.authenticate_at(token, Utc::now())
    }

    pub(crate) fn authenticate_at(&self, token: &str, now: DateTime<Utc>) -> Result<Principal> {
        let probe = self.validate_at(token, now)?;
        if probe.valid {
            return self.db.with_connection(|conn| {
                let stored = find_session(conn, token)?
                    .ok_or_else(|| DmsError::not_found("session", token))?;
                identity::find_by_id(conn, &stored.session.principal_id)?
                    .ok_or_else(|| DmsError::not_found("principal", &stored.session.principal_id))
            });
        }
        match probe.reason.as_deref() {
            Some("superseded") => Err(DmsError::SessionSuperseded),
            Some("deactivated") => Err(DmsError::Deactivated),
            _ => Err(DmsError::InvalidCredentials),
        }
    }

    /// Invalidate the session and clear the principal's single-session token
    pub fn logout(&self, token: &str, meta: &RequestMetadata) -> Result<()> {
        self.db.transaction(|tx| {
            let stored = match find_session(tx, token)? {
                Some(s) => s,
                None => return Ok(()),
            };
            invalidate_session(tx, token)?;

            if let Some(principal) = identity::find_by_id(tx, &stored.session.principal_id)? {
                if principal.active_session_token.as_deref() == Some(token) {
                    identity::set_active_session(tx, &principal.id, None, Utc::now())?;
                }
                audit::record(
                    tx,
                    &principal.actor(),
                    AuditAction::Logout,
                    "session",
                    &principal.id,
                    &format!("Principal '{}' logged out", principal.username),
                    serde_json::json!({}),
                    meta,
                )?;
            }
            Ok(())
        })
    }

    /// Re-verify the acting principal's credential for an e-signature.
    /// Mutates no session state.
    pub fn verify_esignature(&self, principal: &Principal, credential: &str) -> Result<()> {
        if self
            .hasher
            .verify(credential, &principal.password_hash, &principal.salt)?
        {
            Ok(())
        } else {
            Err(DmsError::ESignatureMismatch)
        }
    }
}

struct StoredSession {
    session: Session,
    is_active: bool,
}

fn insert_session(conn: &Connection, session: &Session) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (token, principal_id, username, roles_snapshot,
                               issued_at, expires_at, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
        params![
            session.token,
            session.principal_id,
            session.username,
            serde_json::to_string(&session.roles)?,
            session.issued_at.to_rfc3339(),
            session.expires_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn invalidate_session(conn: &Connection, token: &str) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET is_active = 0 WHERE token = ?1",
        params![token],
    )?;
    Ok(())
}

fn find_session(conn: &Connection, token: &str) -> Result<Option<StoredSession>> {
    let mut stmt = conn.prepare(
        "SELECT token, principal_id, username, roles_snapshot, issued_at, expires_at, is_active
         FROM sessions WHERE token = ?1",
    )?;
    let row = stmt
        .query_row(params![token], |row| {
            let roles_raw: String = row.get(3)?;
            Ok((
                Session {
                    token: row.get(0)?,
                    principal_id: row.get(1)?,
                    username: row.get(2)?,
                    roles: Vec::new(),
                    issued_at: identity::parse_ts(row.get::<_, String>(4)?),
                    expires_at: identity::parse_ts(row.get::<_, String>(5)?),
                },
                roles_raw,
                row.get::<_, bool>(6)?,
            ))
        })
        .optional()?;

    match row {
        Some((mut session, roles_raw, is_active)) => {
            session.roles = serde_json::from_str(&roles_raw)?;
            Ok(Some(StoredSession { session, is_active }))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_support::seed_principal;
    use crate::identity::Role;

    fn auth(db: &Database) -> AuthService {
        AuthService::new(db.clone(), CredentialHasher::new(1000), 60)
    }

    #[test]
    fn test_login_success_issues_session() {
        let db = Database::open_in_memory().unwrap();
        seed_principal(&db, "author1", "password1", vec![Role::Author]);
        let auth = auth(&db);

        let session = auth
            .login("author1", "password1", false, &RequestMetadata::default())
            .unwrap();
        assert_eq!(session.username, "author1");
        assert_eq!(session.roles, vec![Role::Author]);
        assert!(session.expires_at > session.issued_at);

        let probe = auth.validate(&session.token).unwrap();
        assert!(probe.valid);
    }

    #[test]
    fn test_login_wrong_credential() {
        let db = Database::open_in_memory().unwrap();
        seed_principal(&db, "author1", "password1", vec![Role::Author]);
        let auth = auth(&db);

        let result = auth.login("author1", "wrong", false, &RequestMetadata::default());
        assert!(matches!(result, Err(DmsError::InvalidCredentials)));
    }

    #[test]
    fn test_unknown_username_same_error_as_bad_credential() {
        let db = Database::open_in_memory().unwrap();
        let auth = auth(&db);
        let result = auth.login("ghost", "whatever", false, &RequestMetadata::default());
        assert!(matches!(result, Err(DmsError::InvalidCredentials)));
    }

    #[test]
    fn test_deactivated_principal_cannot_login() {
        let db = Database::open_in_memory().unwrap();
        let p = seed_principal(&db, "gone", "password1", vec![Role::Author]);
        db.transaction(|tx| {
            tx.execute(
                "UPDATE principals SET is_active = 0 WHERE id = ?1",
                params![p.id],
            )?;
            Ok(())
        })
        .unwrap();

        let auth = auth(&db);
        let result = auth.login("gone", "password1", false, &RequestMetadata::default());
        assert!(matches!(result, Err(DmsError::Deactivated)));
    }

    #[test]
    fn test_second_login_conflicts_without_force() {
        let db = Database::open_in_memory().unwrap();
        seed_principal(&db, "author1", "password1", vec![Role::Author]);
        let auth = auth(&db);

        auth.login("author1", "password1", false, &RequestMetadata::default())
            .unwrap();
        let second = auth.login("author1", "password1", false, &RequestMetadata::default());
        assert!(matches!(second, Err(DmsError::SessionConflict)));
    }

    #[test]
    fn test_forced_login_supersedes_previous_session() {
        let db = Database::open_in_memory().unwrap();
        seed_principal(&db, "author1", "password1", vec![Role::Author]);
        let auth = auth(&db);

        let s1 = auth
            .login("author1", "password1", false, &RequestMetadata::default())
            .unwrap();
        let s2 = auth
            .login("author1", "password1", true, &RequestMetadata::default())
            .unwrap();

        let probe1 = auth.validate(&s1.token).unwrap();
        assert!(!probe1.valid);
        assert_eq!(probe1.reason.as_deref(), Some("superseded"));

        let probe2 = auth.validate(&s2.token).unwrap();
        assert!(probe2.valid);
        assert!(probe2.reason.is_none());
    }

    #[test]
    fn test_login_after_expiry_needs_no_force() {
        let db = Database::open_in_memory().unwrap();
        seed_principal(&db, "author1", "password1", vec![Role::Author]);
        let auth = auth(&db);

        let past = Utc::now() - Duration::minutes(120);
        auth.login_at("author1", "password1", false, &RequestMetadata::default(), past)
            .unwrap();

        // The earlier session expired; a plain login succeeds
        let result = auth.login("author1", "password1", false, &RequestMetadata::default());
        assert!(result.is_ok());
    }

    #[test]
    fn test_probe_reports_expired() {
        let db = Database::open_in_memory().unwrap();
        seed_principal(&db, "author1", "password1", vec![Role::Author]);
        let auth = auth(&db);

        let session = auth
            .login("author1", "password1", false, &RequestMetadata::default())
            .unwrap();
        let later = Utc::now() + Duration::minutes(61);
        let probe = auth.validate_at(&session.token, later).unwrap();
        assert!(!probe.valid);
        assert_eq!(probe.reason.as_deref(), Some("expired"));
    }

    #[test]
    fn test_probe_reports_deactivated() {
        let db = Database::open_in_memory().unwrap();
        let p = seed_principal(&db, "author1", "password1", vec![Role::Author]);
        let auth = auth(&db);

        let session = auth
            .login("author1", "password1", false, &RequestMetadata::default())
            .unwrap();
        db.transaction(|tx| {
            tx.execute(
                "UPDATE principals SET is_active = 0 WHERE id = ?1",
                params![p.id],
            )?;
            Ok(())
        })
        .unwrap();

        let probe = auth.validate(&session.token).unwrap();
        assert_eq!(probe.reason.as_deref(), Some("deactivated"));
    }

    #[test]
    fn test_unknown_token_probe() {
        let db = Database::open_in_memory().unwrap();
        let auth = auth(&db);
        let probe = auth.validate("not-a-token").unwrap();
        assert!(!probe.valid);
        assert_eq!(probe.reason.as_deref(), Some("unknown"));
    }

    #[test]
    fn test_logout_invalidates_session() {
        let db = Database::open_in_memory().unwrap();
        seed_principal(&db, "author1", "password1", vec![Role::Author]);
        let auth = auth(&db);

        let session = auth
            .login("author1", "password1", false, &RequestMetadata::default())
            .unwrap();
        auth.logout(&session.token, &RequestMetadata::default())
            .unwrap();

        let probe = auth.validate(&session.token).unwrap();
        assert!(!probe.valid);

        // And a fresh login needs no force
        assert!(auth
            .login("author1", "password1", false, &RequestMetadata::default())
            .is_ok());
    }

    #[test]
    fn test_esignature_verification() {
        // A wrong credential is a mismatch and
        // leaves session state untouched
        let db = Database::open_in_memory().unwrap();
        let p = seed_principal(&db, "approver1", "password1", vec![Role::Approver]);
        let auth = auth(&db);

        assert!(auth.verify_esignature(&p, "password1").is_ok());
        let result = auth.verify_esignature(&p, "wrong");
        assert!(matches!(result, Err(DmsError::ESignatureMismatch)));
    }

    #[test]
    fn test_authenticate_maps_superseded() {
        let db = Database::open_in_memory().unwrap();
        seed_principal(&db, "author1", "password1", vec![Role::Author]);
        let auth = auth(&db);

        let s1 = auth
            .login("author1", "password1", false, &RequestMetadata::default())
            .unwrap();
        auth.login("author1", "password1", true, &RequestMetadata::default())
            .unwrap();

        let result = auth.authenticate(&s1.token);
        assert!(matches!(result, Err(DmsError::SessionSuperseded)));
    }
}
