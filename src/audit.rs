use crate::database::Database;
use crate::{DmsError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Action codes recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    DocumentCreated,
    DocumentUpdated,
    DocumentDeleted,
    DocumentExported,
    VersionCreated,
    VersionSaved,
    VersionUpdated,
    VersionSubmitted,
    VersionReviewApproved,
    VersionChangesRequested,
    VersionApproved,
    VersionRejected,
    VersionPublished,
    VersionArchived,
    LockAcquired,
    LockReleased,
    CommentCreated,
    CommentUpdated,
    CommentResolved,
    CommentUnresolved,
    CommentDeleted,
    AttachmentUploaded,
    AttachmentDeleted,
    LoginSuccess,
    LoginFailure,
    Logout,
    ESignatureFailed,
    PermissionDenied,
    UserCreated,
    UserDeactivated,
    PasswordReset,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::DocumentCreated => "DOCUMENT_CREATED",
            AuditAction::DocumentUpdated => "DOCUMENT_UPDATED",
            AuditAction::DocumentDeleted => "DOCUMENT_DELETED",
            AuditAction::DocumentExported => "DOCUMENT_EXPORTED",
            AuditAction::VersionCreated => "VERSION_CREATED",
            AuditAction::VersionSaved => "VERSION_SAVED",
            AuditAction::VersionUpdated => "VERSION_UPDATED",
            AuditAction::VersionSubmitted => "VERSION_SUBMITTED",
            AuditAction::VersionReviewApproved => "VERSION_REVIEW_APPROVED",
            AuditAction::VersionChangesRequested => "VERSION_CHANGES_REQUESTED",
            AuditAction::VersionApproved => "VERSION_APPROVED",
            AuditAction::VersionRejected => "VERSION_REJECTED",
            AuditAction::VersionPublished => "VERSION_PUBLISHED",
            AuditAction::VersionArchived => "VERSION_ARCHIVED",
            AuditAction::LockAcquired => "LOCK_ACQUIRED",
            AuditAction::LockReleased => "LOCK_RELEASED",
            AuditAction::CommentCreated => "COMMENT_CREATED",
            AuditAction::CommentUpdated => "COMMENT_UPDATED",
            AuditAction::CommentResolved => "COMMENT_RESOLVED",
            AuditAction::CommentUnresolved => "COMMENT_UNRESOLVED",
            AuditAction::CommentDeleted => "COMMENT_DELETED",
            AuditAction::AttachmentUploaded => "ATTACHMENT_UPLOADED",
            AuditAction::AttachmentDeleted => "ATTACHMENT_DELETED",
            AuditAction::LoginSuccess => "LOGIN_SUCCESS",
            AuditAction::LoginFailure => "LOGIN_FAILURE",
            AuditAction::Logout => "LOGOUT",
            AuditAction::ESignatureFailed => "ESIGNATURE_FAILED",
            AuditAction::PermissionDenied => "PERMISSION_DENIED",
            AuditAction::UserCreated => "USER_CREATED",
            AuditAction::UserDeactivated => "USER_DEACTIVATED",
            AuditAction::PasswordReset => "PASSWORD_RESET",
        }
    }
}

/// Caller-supplied request metadata attached to audit entries.
///
/// A closed record: unknown transport metadata is rejected at the surface,
/// not silently ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// One immutable audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub principal_id: String,
    /// Denormalized at write time; preserved even if the principal record
    /// later changes
    pub username: String,
    pub action: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub description: String,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub esignature: bool,
    pub created_at: DateTime<Utc>,
}

/// Identity of the acting principal, denormalized into each entry
#[derive(Debug, Clone)]
pub struct Actor<'a> {
    pub principal_id: &'a str,
    pub username: &'a str,
}

/// Append one audit entry inside the caller's transaction.
///
/// This is the only write path; the entry commits or rolls back together
/// with the mutation that caused it. No update or delete path exists.
pub fn record(
    conn: &Connection,
    actor: &Actor<'_>,
    action: AuditAction,
    entity_kind: &str,
    entity_id: &str,
    description: &str,
    details: serde_json::Value,
    meta: &RequestMetadata,
) -> Result<()> {
    let esignature = details
        .get("esignature")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    conn.execute(
        "INSERT INTO audit_entries (
            id, principal_id, username, action, entity_kind, entity_id,
            description, details, ip_address, user_agent, esignature, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            Uuid::new_v4().to_string(),
            actor.principal_id,
            actor.username,
            action.as_str(),
            entity_kind,
            entity_id,
            description,
            serde_json::to_string(&details).map_err(|e| DmsError::AuditTrail {
                message: format!("failed to serialize audit details: {}", e),
            })?,
            meta.ip_address,
            meta.user_agent,
            esignature,
            Utc::now().to_rfc3339(),
        ],
    )?;

    tracing::info!(
        audit = true,
        principal = %actor.username,
        action = action.as_str(),
        entity_kind,
        entity_id,
        esignature,
        "{}",
        description
    );

    Ok(())
}

/// Build the description and details for an e-signed lifecycle transition.
///
/// The `E-Signature:` token in the description plus `esignature: true` in
/// the details map are the sole reliable source for compliance reporting.
pub fn esigned_details(
    username: &str,
    description: &str,
    mut details: serde_json::Value,
) -> (String, serde_json::Value) {
    let description = format!("{} [E-Signature: {}]", description, username);
    if let Some(map) = details.as_object_mut() {
        map.insert("esignature".to_string(), serde_json::Value::Bool(true));
    }
    (description, details)
}

/// Read-side filters for audit retrieval
#[derive(Debug, Clone, Default)]
pub struct AuditFilters {
    pub principal_id: Option<String>,
    pub action: Option<String>,
    pub entity_kind: Option<String>,
    pub entity_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl AuditFilters {
    pub fn with_limit(limit: i64, offset: i64) -> Self {
        Self {
            limit,
            offset,
            ..Default::default()
        }
    }
}

/// Read-only audit trail access
#[derive(Clone)]
pub struct AuditTrail {
    db: Database,
}

impl AuditTrail {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Retrieve entries matching the filters, newest first
    pub fn list(&self, filters: &AuditFilters) -> Result<Vec<AuditEntry>> {
        self.db.with_connection(|conn| list_entries(conn, filters))
    }

    /// Count all recorded entries
    pub fn count(&self) -> Result<u64> {
        self.db.with_connection(|conn| {
            conn.query_row("SELECT COUNT(*) FROM audit_entries", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(Into::into)
        })
    }
}

pub fn list_entries(conn: &Connection, filters: &AuditFilters) -> Result<Vec<AuditEntry>> {
    let mut sql = String::from(
        "SELECT id, principal_id, username, action, entity_kind, entity_id,
                description, details, ip_address, user_agent, esignature, created_at
         FROM audit_entries WHERE 1=1",
    );
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(pid) = &filters.principal_id {
        sql.push_str(" AND principal_id = ?");
        params.push(Box::new(pid.clone()));
    }
    if let Some(action) = &filters.action {
        sql.push_str(" AND action = ?");
        params.push(Box::new(action.clone()));
    }
    if let Some(kind) = &filters.entity_kind {
        sql.push_str(" AND entity_kind = ?");
        params.push(Box::new(kind.clone()));
    }
    if let Some(eid) = &filters.entity_id {
        sql.push_str(" AND entity_id = ?");
        params.push(Box::new(eid.clone()));
    }
    if let Some(from) = &filters.from {
        sql.push_str(" AND created_at >= ?");
        params.push(Box::new(from.to_rfc3339()));
    }
    if let Some(to) = &filters.to {
        sql.push_str(" AND created_at <= ?");
        params.push(Box::new(to.to_rfc3339()));
    }

    sql.push_str(" ORDER BY created_at DESC, id LIMIT ? OFFSET ?");
    let limit = if filters.limit > 0 { filters.limit } else { 100 };
    params.push(Box::new(limit));
    params.push(Box::new(filters.offset.max(0)));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(param_refs.as_slice(), row_to_entry)?;

    let mut entries = Vec::new();
    for entry in rows {
        entries.push(entry?);
    }
    Ok(entries)
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<AuditEntry> {
    let details_raw: String = row.get(7)?;
    let created_raw: String = row.get(11)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        principal_id: row.get(1)?,
        username: row.get(2)?,
        action: row.get(3)?,
        entity_kind: row.get(4)?,
        entity_id: row.get(5)?,
        description: row.get(6)?,
        details: serde_json::from_str(&details_raw)
            .unwrap_or(serde_json::Value::String(details_raw)),
        ip_address: row.get(8)?,
        user_agent: row.get(9)?,
        esignature: row.get(10)?,
        created_at: DateTime::parse_from_rfc3339(&created_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_actor() -> Actor<'static> {
        Actor {
            principal_id: "p-1",
            username: "admin",
        }
    }

    #[test]
    fn test_record_and_list() {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|tx| {
            record(
                tx,
                &test_actor(),
                AuditAction::DocumentCreated,
                "document",
                "d-1",
                "Created document SOP-QUAL-20260801-0001",
                serde_json::json!({"document_number": "SOP-QUAL-20260801-0001"}),
                &RequestMetadata::default(),
            )
        })
        .unwrap();

        let trail = AuditTrail::new(db);
        let entries = trail.list(&AuditFilters::with_limit(10, 0)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "DOCUMENT_CREATED");
        assert_eq!(entries[0].username, "admin");
        assert!(!entries[0].esignature);
    }

    #[test]
    fn test_esignature_flag_derived_from_details() {
        let db = Database::open_in_memory().unwrap();
        let (description, details) = esigned_details(
            "approver1",
            "Version v1.0 approved",
            serde_json::json!({"version": "v1.0"}),
        );
        assert!(description.contains("E-Signature: approver1"));

        db.transaction(|tx| {
            record(
                tx,
                &test_actor(),
                AuditAction::VersionApproved,
                "version",
                "v-1",
                &description,
                details.clone(),
                &RequestMetadata::default(),
            )
        })
        .unwrap();

        let trail = AuditTrail::new(db);
        let entries = trail.list(&AuditFilters::with_limit(10, 0)).unwrap();
        assert!(entries[0].esignature);
        assert_eq!(entries[0].details["esignature"], serde_json::json!(true));
    }

    #[test]
    fn test_filter_by_action_and_entity() {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|tx| {
            record(
                tx,
                &test_actor(),
                AuditAction::LoginSuccess,
                "session",
                "s-1",
                "login",
                serde_json::json!({}),
                &RequestMetadata::default(),
            )?;
            record(
                tx,
                &test_actor(),
                AuditAction::LockAcquired,
                "version",
                "v-1",
                "lock",
                serde_json::json!({}),
                &RequestMetadata::default(),
            )
        })
        .unwrap();

        let trail = AuditTrail::new(db);
        let mut filters = AuditFilters::with_limit(10, 0);
        filters.action = Some("LOCK_ACQUIRED".to_string());
        let entries = trail.list(&filters).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity_kind, "version");

        let mut filters = AuditFilters::with_limit(10, 0);
        filters.entity_kind = Some("session".to_string());
        let entries = trail.list(&filters).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "LOGIN_SUCCESS");
    }

    #[test]
    fn test_request_metadata_recorded() {
        let db = Database::open_in_memory().unwrap();
        let meta = RequestMetadata {
            ip_address: Some("10.1.2.3".to_string()),
            user_agent: Some("editor/2.1".to_string()),
        };
        db.transaction(|tx| {
            record(
                tx,
                &test_actor(),
                AuditAction::VersionSaved,
                "version",
                "v-9",
                "saved",
                serde_json::json!({}),
                &meta,
            )
        })
        .unwrap();

        let trail = AuditTrail::new(db);
        let entries = trail.list(&AuditFilters::with_limit(1, 0)).unwrap();
        assert_eq!(entries[0].ip_address.as_deref(), Some("10.1.2.3"));
        assert_eq!(entries[0].user_agent.as_deref(), Some("editor/2.1"));
    }
}
