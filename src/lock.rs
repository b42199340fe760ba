use crate::audit::{self, AuditAction, RequestMetadata};
use crate::database::Database;
use crate::document;
use crate::identity::{self, Principal};
use crate::security;
use crate::version::{self, VersionStatus};
use crate::{DmsError, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// An exclusive, time-bounded lease permitting mutation of a Draft version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditLock {
    pub version_id: String,
    pub lock_token: String,
    pub holder_id: String,
    pub holder_username: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub session_tag: Option<String>,
}

impl EditLock {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Read-only view of a version's lock state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockView {
    pub holder_username: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub session_tag: Option<String>,
}

/// Single-writer lease coordinator for draft versions.
///
/// Leases expire by wall-clock comparison; expiry is observed lazily by the
/// next operation that looks. The sweep exists for housekeeping only.
#[derive(Clone)]
pub struct LockCoordinator {
    db: Database,
    default_minutes: i64,
    max_minutes: i64,
}

impl LockCoordinator {
    pub fn new(db: Database, default_minutes: i64, max_minutes: i64) -> Self {
        Self {
            db,
            default_minutes,
            max_minutes,
        }
    }

    /// Acquire (or re-acquire) the edit lock on a draft version.
    ///
    /// Idempotent for the current holder: the same token is returned and the
    /// expiry is left alone unless the session tag changed.
    pub fn acquire(
        &self,
        principal: &Principal,
        version_id: &str,
        timeout_minutes: Option<i64>,
        session_tag: Option<String>,
        meta: &RequestMetadata,
    ) -> Result<EditLock> {
        self.acquire_at(principal, version_id, timeout_minutes, session_tag, meta, Utc::now())
    }

    pub(crate) fn acquire_at(
        &self,
        principal: &Principal,
        version_id: &str,
        timeout_minutes: Option<i64>,
        session_tag: Option<String>,
        meta: &RequestMetadata,
        now: DateTime<Utc>,
    ) -> Result<EditLock> {
        let timeout = timeout_minutes
            .unwrap_or(self.default_minutes)
            .clamp(1, self.max_minutes);

        self.db.transaction(|tx| {
            let version = version::require_version(tx, version_id)?;
            if version.status != VersionStatus::Draft {
                return Err(DmsError::IllegalStatus {
                    required: VersionStatus::Draft.as_str().to_string(),
                    actual: version.status.as_str().to_string(),
                });
            }
            let doc = document::require_document(tx, &version.document_id)?;
            if !identity::can_edit_draft(principal, &doc.owner_id) {
                return Err(DmsError::permission_denied("acquire edit lock"));
            }

            if let Some(existing) = find_lock(tx, version_id)? {
                if existing.is_active(now) {
                    if existing.holder_id == principal.id {
                        // Same holder: return the existing lease. Only a
                        // changed session tag resets the expiry.
                        if session_tag.is_some() && session_tag != existing.session_tag {
                            let expires_at = now + Duration::minutes(timeout);
                            tx.execute(
                                "UPDATE edit_locks
                                 SET expires_at = ?2, last_heartbeat = ?3, session_tag = ?4
                                 WHERE version_id = ?1",
                                params![
                                    version_id,
                                    expires_at.to_rfc3339(),
                                    now.to_rfc3339(),
                                    session_tag,
                                ],
                            )?;
                            return find_lock(tx, version_id)?
                                .ok_or_else(|| DmsError::invariant("edit lock vanished mid-update"));
                        }
                        return Ok(existing);
                    }
                    return Err(DmsError::Locked {
                        holder: existing.holder_username,
                        expires_at: existing.expires_at.to_rfc3339(),
                    });
                }
                // Stale lease: replace it
                delete_lock(tx, version_id)?;
            }

            let lock = EditLock {
                version_id: version_id.to_string(),
                lock_token: security::generate_token(),
                holder_id: principal.id.clone(),
                holder_username: principal.username.clone(),
                acquired_at: now,
                expires_at: now + Duration::minutes(timeout),
                last_heartbeat: now,
                session_tag: session_tag.clone(),
            };
            insert_lock(tx, &lock)?;

            audit::record(
                tx,
                &principal.actor(),
                AuditAction::LockAcquired,
                "version",
                version_id,
                &format!(
                    "Acquired edit lock on version {} of document {}",
                    version.version_string, doc.document_number
                ),
                serde_json::json!({
                    "expires_at": lock.expires_at.to_rfc3339(),
                    "timeout_minutes": timeout,
                }),
                meta,
            )?;

            Ok(lock)
        })
    }

    /// Advance the lease expiry. Clients emit a heartbeat every 15 seconds.
    pub fn heartbeat(
        &self,
        principal: &Principal,
        version_id: &str,
        lock_token: &str,
        extend_minutes: i64,
    ) -> Result<EditLock> {
        self.heartbeat_at(principal, version_id, lock_token, extend_minutes, Utc::now())
    }

    pub(crate) fn heartbeat_at(
        &self,
        principal: &Principal,
        version_id: &str,
        lock_token: &str,
        extend_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<EditLock> {
        let extend = extend_minutes.clamp(1, self.max_minutes);
        self.db.transaction(|tx| {
            let lock = find_lock(tx, version_id)?.ok_or(DmsError::LockNotHeld)?;
            if lock.holder_id != principal.id || lock.lock_token != lock_token {
                return Err(DmsError::LockNotHeld);
            }
            if !lock.is_active(now) {
                return Err(DmsError::LockExpired);
            }

            let expires_at = now + Duration::minutes(extend);
            tx.execute(
                "UPDATE edit_locks SET expires_at = ?2, last_heartbeat = ?3 WHERE version_id = ?1",
                params![version_id, expires_at.to_rfc3339(), now.to_rfc3339()],
            )?;
            find_lock(tx, version_id)?
                .ok_or_else(|| DmsError::invariant("edit lock vanished mid-heartbeat"))
        })
    }

    /// Release the lock. Best-effort on page exit: a missing lock is not an
    /// error. Admins may force-release without the token.
    pub fn release(
        &self,
        principal: &Principal,
        version_id: &str,
        lock_token: Option<&str>,
        force_admin: bool,
        meta: &RequestMetadata,
    ) -> Result<()> {
        self.db.transaction(|tx| {
            let lock = match find_lock(tx, version_id)? {
                Some(lock) => lock,
                None => return Ok(()),
            };

            let forced = if force_admin {
                if !identity::can_force_release_lock(principal) {
                    return Err(DmsError::permission_denied("force-release edit lock"));
                }
                true
            } else {
                if lock.holder_id != principal.id
                    || lock_token.map(|t| t != lock.lock_token).unwrap_or(true)
                {
                    return Err(DmsError::LockNotHeld);
                }
                false
            };

            delete_lock(tx, version_id)?;
            audit::record(
                tx,
                &principal.actor(),
                AuditAction::LockReleased,
                "version",
                version_id,
                &format!("Released edit lock held by '{}'", lock.holder_username),
                serde_json::json!({
                    "holder": lock.holder_username,
                    "forced_by_admin": forced,
                }),
                meta,
            )?;
            Ok(())
        })
    }

    /// Read-only lock status; an expired lease reads as no lock
    pub fn status(&self, version_id: &str) -> Result<Option<LockView>> {
        self.status_at(version_id, Utc::now())
    }

    pub(crate) fn status_at(
        &self,
        version_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LockView>> {
        self.db.with_connection(|conn| {
            Ok(find_lock(conn, version_id)?
                .filter(|lock| lock.is_active(now))
                .map(|lock| LockView {
                    holder_username: lock.holder_username,
                    acquired_at: lock.acquired_at,
                    expires_at: lock.expires_at,
                    session_tag: lock.session_tag,
                }))
        })
    }

    /// Housekeeping pass deleting expired lease rows. Correctness never
    /// depends on this running.
    pub fn sweep_expired(&self) -> Result<usize> {
        self.sweep_expired_at(Utc::now())
    }

    pub(crate) fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        self.db.transaction(|tx| {
            let deleted = tx.execute(
                "DELETE FROM edit_locks WHERE expires_at < ?1",
                params![now.to_rfc3339()],
            )?;
            Ok(deleted)
        })
    }
}

/// Gate a save against the caller's lease. Administrator override is not
/// permitted here, in contrast with release.
pub fn require_lock(
    conn: &Connection,
    version_id: &str,
    principal: &Principal,
    supplied_token: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let token = supplied_token.ok_or(DmsError::LockNotHeld)?;
    let lock = find_lock(conn, version_id)?.ok_or(DmsError::LockNotHeld)?;
    if lock.holder_id != principal.id || lock.lock_token != token {
        return Err(DmsError::LockNotHeld);
    }
    if !lock.is_active(now) {
        return Err(DmsError::LockExpired);
    }
    Ok(())
}

fn insert_lock(conn: &Connection, lock: &EditLock) -> Result<()> {
    conn.execute(
        "INSERT INTO edit_locks (
            version_id, lock_token, holder_id, holder_username,
            acquired_at, expires_at, last_heartbeat, session_tag
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            lock.version_id,
            lock.lock_token,
            lock.holder_id,
            lock.holder_username,
            lock.acquired_at.to_rfc3339(),
            lock.expires_at.to_rfc3339(),
            lock.last_heartbeat.to_rfc3339(),
            lock.session_tag,
        ],
    )?;
    Ok(())
}

fn delete_lock(conn: &Connection, version_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM edit_locks WHERE version_id = ?1",
        params![version_id],
    )?;
    Ok(())
}

fn find_lock(conn: &Connection, version_id: &str) -> Result<Option<EditLock>> {
    let mut stmt = conn.prepare(
        "SELECT version_id, lock_token, holder_id, holder_username,
                acquired_at, expires_at, last_heartbeat, session_tag
         FROM edit_locks WHERE version_id = ?1",
    )?;
    Ok(stmt
        .query_row(params![version_id], |row| {
            Ok(EditLock {
                version_id: row.get(0)?,
                lock_token: row.get(1)?,
                holder_id: row.get(2)?,
                holder_username: row.get(3)?,
                acquired_at: identity::parse_ts(row.get(4)?),
                expires_at: identity::parse_ts(row.get(5)?),
                last_heartbeat: identity::parse_ts(row.get(6)?),
                session_tag: row.get(7)?,
            })
        })
        .optional()?)
}
