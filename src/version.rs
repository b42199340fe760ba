use crate::audit::{self, AuditAction, RequestMetadata};
use crate::database::Database;
use crate::document;
use crate::identity::{self, Principal};
use crate::lock;
use crate::security;
use crate::{DmsError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// First version string assigned to a new document's draft
pub const INITIAL_VERSION_STRING: &str = "v0.1";

/// Bounds for change_reason on controlled new-version creation
pub const CHANGE_REASON_MIN: usize = 10;
pub const CHANGE_REASON_MAX: usize = 1000;

/// Workflow status of a document version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionStatus {
    Draft,
    UnderReview,
    PendingApproval,
    Approved,
    Effective,
    Obsolete,
    /// Present in stored data for compatibility; no transition produces it
    Rejected,
    Archived,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Draft => "Draft",
            VersionStatus::UnderReview => "Under Review",
            VersionStatus::PendingApproval => "Pending Approval",
            VersionStatus::Approved => "Approved",
            VersionStatus::Effective => "Effective",
            VersionStatus::Obsolete => "Obsolete",
            VersionStatus::Rejected => "Rejected",
            VersionStatus::Archived => "Archived",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Draft" => Ok(VersionStatus::Draft),
            "Under Review" => Ok(VersionStatus::UnderReview),
            "Pending Approval" => Ok(VersionStatus::PendingApproval),
            "Approved" => Ok(VersionStatus::Approved),
            "Effective" => Ok(VersionStatus::Effective),
            "Obsolete" => Ok(VersionStatus::Obsolete),
            "Rejected" => Ok(VersionStatus::Rejected),
            "Archived" => Ok(VersionStatus::Archived),
            other => Err(DmsError::validation(
                "status",
                format!("unknown version status: '{}'", other),
            )),
        }
    }

    /// Content, hash, and version string of these statuses never change
    pub fn is_immutable(&self) -> bool {
        matches!(
            self,
            VersionStatus::Approved
                | VersionStatus::Effective
                | VersionStatus::Obsolete
                | VersionStatus::Archived
        )
    }
}

/// Classification of a controlled revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Minor,
    Major,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Minor => "Minor",
            ChangeType::Major => "Major",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Minor" => Ok(ChangeType::Minor),
            "Major" => Ok(ChangeType::Major),
            other => Err(DmsError::validation(
                "change_type",
                format!("unknown change type: '{}'", other),
            )),
        }
    }
}

/// One version of a controlled document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: String,
    pub document_id: String,
    pub version_number: i64,
    pub version_string: String,
    pub status: VersionStatus,
    pub content: String,
    pub content_hash: String,
    pub change_summary: Option<String>,
    pub change_type: Option<ChangeType>,
    pub change_reason: Option<String>,
    pub parent_version_id: Option<String>,
    pub is_latest: bool,
    pub replaced_by: Option<String>,
    pub lock_version: i64,
    pub autosaves_since_manual: i64,
    pub effective_at: Option<DateTime<Utc>>,
    pub obsolete_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub submitted_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub published_by: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
    pub archived_by: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentVersion {
    /// Fresh draft with the given content
    pub fn new_draft(
        document_id: &str,
        version_number: i64,
        version_string: &str,
        content: &str,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            version_number,
            version_string: version_string.to_string(),
            status: VersionStatus::Draft,
            content: content.to_string(),
            content_hash: security::content_hash(content.as_bytes()),
            change_summary: None,
            change_type: None,
            change_reason: None,
            parent_version_id: None,
            is_latest: true,
            replaced_by: None,
            lock_version: 0,
            autosaves_since_manual: 0,
            effective_at: None,
            obsolete_at: None,
            submitted_at: None,
            submitted_by: None,
            reviewed_at: None,
            reviewed_by: None,
            approved_at: None,
            approved_by: None,
            rejected_at: None,
            rejected_by: None,
            published_by: None,
            archived_at: None,
            archived_by: None,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Parse a `vMAJOR.MINOR` version string
pub fn parse_version_string(s: &str) -> Result<(u32, u32)> {
    let rest = s.strip_prefix('v').ok_or_else(|| {
        DmsError::validation("version_string", format!("malformed version string: '{}'", s))
    })?;
    let (major, minor) = rest.split_once('.').ok_or_else(|| {
        DmsError::validation("version_string", format!("malformed version string: '{}'", s))
    })?;
    let major: u32 = major.parse().map_err(|_| {
        DmsError::validation("version_string", format!("malformed version string: '{}'", s))
    })?;
    let minor: u32 = minor.parse().map_err(|_| {
        DmsError::validation("version_string", format!("malformed version string: '{}'", s))
    })?;
    Ok((major, minor))
}

/// Compute the successor version string for a controlled revision
pub fn bump_version_string(parent: &str, change_type: ChangeType) -> Result<String> {
    let (major, minor) = parse_version_string(parent)?;
    Ok(match change_type {
        ChangeType::Minor => format!("v{}.{}", major, minor + 1),
        ChangeType::Major => format!("v{}.0", major + 1),
    })
}

/// Validate the mandatory rationale supplied on controlled revision creation
pub fn validate_change_reason(reason: &str) -> Result<()> {
    let len = reason.chars().count();
    if len < CHANGE_REASON_MIN || len > CHANGE_REASON_MAX {
        return Err(DmsError::validation(
            "change_reason",
            format!(
                "change reason must be {}-{} characters (got {})",
                CHANGE_REASON_MIN, CHANGE_REASON_MAX, len
            ),
        ));
    }
    Ok(())
}

// Repository functions

const VERSION_COLUMNS: &str = "id, document_id, version_number, version_string, status, content, \
     content_hash, change_summary, change_type, change_reason, parent_version_id, is_latest, \
     replaced_by, lock_version, autosaves_since_manual, effective_at, obsolete_at, submitted_at, \
     submitted_by, reviewed_at, reviewed_by, approved_at, approved_by, rejected_at, rejected_by, \
     published_by, archived_at, archived_by, created_by, created_at, updated_at";

pub fn insert_version(conn: &Connection, v: &DocumentVersion) -> Result<()> {
    conn.execute(
        "INSERT INTO document_versions (
            id, document_id, version_number, version_string, status, content,
            content_hash, change_summary, change_type, change_reason, parent_version_id,
            is_latest, replaced_by, lock_version, autosaves_since_manual, effective_at,
            obsolete_at, submitted_at, submitted_by, reviewed_at, reviewed_by, approved_at,
            approved_by, rejected_at, rejected_by, published_by, archived_at, archived_by,
            created_by, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                  ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31)",
        params![
            v.id,
            v.document_id,
            v.version_number,
            v.version_string,
            v.status.as_str(),
            v.content,
            v.content_hash,
            v.change_summary,
            v.change_type.map(|c| c.as_str()),
            v.change_reason,
            v.parent_version_id,
            v.is_latest,
            v.replaced_by,
            v.lock_version,
            v.autosaves_since_manual,
            v.effective_at.map(|t| t.to_rfc3339()),
            v.obsolete_at.map(|t| t.to_rfc3339()),
            v.submitted_at.map(|t| t.to_rfc3339()),
            v.submitted_by,
            v.reviewed_at.map(|t| t.to_rfc3339()),
            v.reviewed_by,
            v.approved_at.map(|t| t.to_rfc3339()),
            v.approved_by,
            v.rejected_at.map(|t| t.to_rfc3339()),
            v.rejected_by,
            v.published_by,
            v.archived_at.map(|t| t.to_rfc3339()),
            v.archived_by,
            v.created_by,
            v.created_at.to_rfc3339(),
            v.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn find_version(conn: &Connection, id: &str) -> Result<Option<DocumentVersion>> {
    let sql = format!("SELECT {} FROM document_versions WHERE id = ?1", VERSION_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    Ok(stmt.query_row(params![id], row_to_version).optional()?)
}

pub fn require_version(conn: &Connection, id: &str) -> Result<DocumentVersion> {
    find_version(conn, id)?.ok_or_else(|| DmsError::not_found("version", id))
}

pub fn list_versions(conn: &Connection, document_id: &str) -> Result<Vec<DocumentVersion>> {
    let sql = format!(
        "SELECT {} FROM document_versions WHERE document_id = ?1 ORDER BY version_number",
        VERSION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![document_id], row_to_version)?;
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row?);
    }
    Ok(versions)
}

fn find_by_status(
    conn: &Connection,
    document_id: &str,
    status: VersionStatus,
) -> Result<Option<DocumentVersion>> {
    let sql = format!(
        "SELECT {} FROM document_versions WHERE document_id = ?1 AND status = ?2",
        VERSION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    Ok(stmt
        .query_row(params![document_id, status.as_str()], row_to_version)
        .optional()?)
}

/// The at-most-one Draft of a document
pub fn find_draft(conn: &Connection, document_id: &str) -> Result<Option<DocumentVersion>> {
    find_by_status(conn, document_id, VersionStatus::Draft)
}

/// The at-most-one Effective version of a document
pub fn find_effective(conn: &Connection, document_id: &str) -> Result<Option<DocumentVersion>> {
    find_by_status(conn, document_id, VersionStatus::Effective)
}

pub fn max_version_number(conn: &Connection, document_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version_number), 0) FROM document_versions WHERE document_id = ?1",
        params![document_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

/// Flip `is_latest` to the given version, exclusively
pub fn mark_latest(conn: &Connection, document_id: &str, version_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE document_versions SET is_latest = (id = ?2) WHERE document_id = ?1",
        params![document_id, version_id],
    )?;
    Ok(())
}

pub(crate) fn row_to_version(row: &rusqlite::Row) -> rusqlite::Result<DocumentVersion> {
    let status_raw: String = row.get(4)?;
    let change_type_raw: Option<String> = row.get(8)?;
    Ok(DocumentVersion {
        id: row.get(0)?,
        document_id: row.get(1)?,
        version_number: row.get(2)?,
        version_string: row.get(3)?,
        status: VersionStatus::parse(&status_raw).unwrap_or(VersionStatus::Draft),
        content: row.get(5)?,
        content_hash: row.get(6)?,
        change_summary: row.get(7)?,
        change_type: change_type_raw.and_then(|s| ChangeType::parse(&s).ok()),
        change_reason: row.get(9)?,
        parent_version_id: row.get(10)?,
        is_latest: row.get(11)?,
        replaced_by: row.get(12)?,
        lock_version: row.get(13)?,
        autosaves_since_manual: row.get(14)?,
        effective_at: identity::parse_opt_ts(row.get(15)?),
        obsolete_at: identity::parse_opt_ts(row.get(16)?),
        submitted_at: identity::parse_opt_ts(row.get(17)?),
        submitted_by: row.get(18)?,
        reviewed_at: identity::parse_opt_ts(row.get(19)?),
        reviewed_by: row.get(20)?,
        approved_at: identity::parse_opt_ts(row.get(21)?),
        approved_by: row.get(22)?,
        rejected_at: identity::parse_opt_ts(row.get(23)?),
        rejected_by: row.get(24)?,
        published_by: row.get(25)?,
        archived_at: identity::parse_opt_ts(row.get(26)?),
        archived_by: row.get(27)?,
        created_by: row.get(28)?,
        created_at: identity::parse_ts(row.get(29)?),
        updated_at: identity::parse_ts(row.get(30)?),
    })
}

/// Outcome of a successful (or short-circuited) save
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub content_hash: String,
    pub lock_version: i64,
}

/// Patch for draft-only metadata. A closed record of recognised fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DraftMetadataPatch {
    pub change_summary: Option<String>,
    pub change_type: Option<ChangeType>,
    pub change_reason: Option<String>,
}

/// Version store operations: content saves and draft metadata edits
#[derive(Clone)]
pub struct VersionService {
    db: Database,
    autosave_audit_interval: u32,
}

impl VersionService {
    pub fn new(db: Database, autosave_audit_interval: u32) -> Self {
        Self {
            db,
            autosave_audit_interval: autosave_audit_interval.max(1),
        }
    }

    /// Fetch a version, checking it belongs to the given document
    pub fn get(&self, document_id: &str, version_id: &str) -> Result<DocumentVersion> {
        self.db.with_connection(|conn| {
            let version = require_version(conn, version_id)?;
            if version.document_id != document_id {
                return Err(DmsError::not_found("version", version_id));
            }
            Ok(version)
        })
    }

    /// Save draft content under the caller's edit lock.
    ///
    /// Save contention is double-gated: the edit lock prevents two writers,
    /// and the optional `expected_content_hash` detects the same writer
    /// racing itself from two tabs.
    pub fn save_content(
        &self,
        principal: &Principal,
        version_id: &str,
        content: &str,
        lock_token: Option<&str>,
        expected_content_hash: Option<&str>,
        is_autosave: bool,
        meta: &RequestMetadata,
    ) -> Result<SaveOutcome> {
        self.save_content_at(
            principal,
            version_id,
            content,
            lock_token,
            expected_content_hash,
            is_autosave,
            meta,
            Utc::now(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn save_content_at(
        &self,
        principal: &Principal,
        version_id: &str,
        content: &str,
        lock_token: Option<&str>,
        expected_content_hash: Option<&str>,
        is_autosave: bool,
        meta: &RequestMetadata,
        now: DateTime<Utc>,
    ) -> Result<SaveOutcome> {
        self.db.transaction(|tx| {
            let version = require_version(tx, version_id)?;
            if version.status != VersionStatus::Draft {
                return Err(DmsError::IllegalStatus {
                    required: VersionStatus::Draft.as_str().to_string(),
                    actual: version.status.as_str().to_string(),
                });
            }

            lock::require_lock(tx, version_id, principal, lock_token, now)?;

            if let Some(expected) = expected_content_hash {
                if expected != version.content_hash {
                    return Err(DmsError::Conflict {
                        current_hash: version.content_hash.clone(),
                    });
                }
            }

            let new_hash = security::content_hash(content.as_bytes());
            if new_hash == version.content_hash {
                // No-op save: no write, no audit entry
                return Ok(SaveOutcome {
                    content_hash: new_hash,
                    lock_version: version.lock_version,
                });
            }

            let autosave_sequence = if is_autosave {
                version.autosaves_since_manual + 1
            } else {
                0
            };
            let new_lock_version = version.lock_version + 1;
            tx.execute(
                "UPDATE document_versions
                 SET content = ?2, content_hash = ?3, lock_version = ?4,
                     autosaves_since_manual = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    version_id,
                    content,
                    new_hash,
                    new_lock_version,
                    autosave_sequence,
                    now.to_rfc3339(),
                ],
            )?;

            // Autosave audit entries are coalesced: the 1st and every Nth
            // since the last manual save are recorded so auditors see a
            // bounded, not zero, autosave trail.
            let record_audit = if is_autosave {
                autosave_sequence == 1
                    || autosave_sequence % i64::from(self.autosave_audit_interval) == 0
            } else {
                true
            };
            if record_audit {
                audit::record(
                    tx,
                    &principal.actor(),
                    AuditAction::VersionSaved,
                    "version",
                    version_id,
                    &format!(
                        "Saved content of version {} ({})",
                        version.version_string,
                        if is_autosave { "autosave" } else { "manual" }
                    ),
                    serde_json::json!({
                        "before_hash": &version.content_hash,
                        "after_hash": &new_hash,
                        "is_autosave": is_autosave,
                        "autosave_sequence": autosave_sequence,
                        "lock_version": new_lock_version,
                    }),
                    meta,
                )?;
            }

            Ok(SaveOutcome {
                content_hash: new_hash,
                lock_version: new_lock_version,
            })
        })
    }

    /// Update non-content fields on a Draft. Requires ownership but no lock.
    pub fn update_draft_metadata(
        &self,
        principal: &Principal,
        version_id: &str,
        patch: DraftMetadataPatch,
        meta: &RequestMetadata,
    ) -> Result<DocumentVersion> {
        self.db.transaction(|tx| {
            let version = require_version(tx, version_id)?;
            if version.status != VersionStatus::Draft {
                return Err(DmsError::IllegalStatus {
                    required: VersionStatus::Draft.as_str().to_string(),
                    actual: version.status.as_str().to_string(),
                });
            }
            let doc = document::require_document(tx, &version.document_id)?;
            if !identity::can_edit_draft(principal, &doc.owner_id) {
                return Err(DmsError::permission_denied("edit draft metadata"));
            }
            if let Some(reason) = &patch.change_reason {
                validate_change_reason(reason)?;
            }

            let before = serde_json::json!({
                "change_summary": &version.change_summary,
                "change_type": &version.change_type,
                "change_reason": &version.change_reason,
            });

            let change_summary = patch
                .change_summary
                .clone()
                .or_else(|| version.change_summary.clone());
            let change_type = patch.change_type.or(version.change_type);
            let change_reason = patch
                .change_reason
                .clone()
                .or_else(|| version.change_reason.clone());
            let now = Utc::now();

            tx.execute(
                "UPDATE document_versions
                 SET change_summary = ?2, change_type = ?3, change_reason = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    version_id,
                    change_summary,
                    change_type.map(|c| c.as_str()),
                    change_reason,
                    now.to_rfc3339(),
                ],
            )?;

            let after = serde_json::json!({
                "change_summary": &change_summary,
                "change_type": &change_type,
                "change_reason": &change_reason,
            });
            audit::record(
                tx,
                &principal.actor(),
                AuditAction::VersionUpdated,
                "version",
                version_id,
                &format!("Updated draft metadata of version {}", version.version_string),
                serde_json::json!({ "before": before, "after": after }),
                meta,
            )?;

            require_version(tx, version_id)
        })
    }
}
