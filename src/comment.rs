use crate::audit::{self, AuditAction, RequestMetadata};
use crate::database::Database;
use crate::identity::{self, Principal};
use crate::version::{self, VersionStatus};
use crate::{DmsError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Text anchor for an inline comment.
///
/// The verbatim selected substring is canonical; offsets and context are
/// hints for highlighting and must never be relied on for matching, since
/// surrounding content may have been edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentAnchor {
    pub selected_text: String,
    pub start_offset: Option<i64>,
    pub end_offset: Option<i64>,
    pub context_snippet: Option<String>,
}

impl CommentAnchor {
    pub fn text(selected_text: &str) -> Self {
        Self {
            selected_text: selected_text.to_string(),
            start_offset: None,
            end_offset: None,
            context_snippet: None,
        }
    }
}

/// An inline comment on a document version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub version_id: String,
    pub author_id: String,
    pub author_username: String,
    pub body: String,
    pub anchor: CommentAnchor,
    pub is_resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Commenting on read-only versions: the channel through which non-editing
/// roles communicate with the author.
#[derive(Clone)]
pub struct CommentService {
    db: Database,
}

impl CommentService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a comment. Reviewer, Approver, and Admin may comment on any
    /// non-Draft version; a Draft accepts comments from an Admin only.
    pub fn create(
        &self,
        principal: &Principal,
        version_id: &str,
        body: &str,
        anchor: CommentAnchor,
        meta: &RequestMetadata,
    ) -> Result<Comment> {
        if body.trim().is_empty() {
            return Err(DmsError::validation("body", "comment body is required"));
        }
        if anchor.selected_text.trim().is_empty() {
            return Err(DmsError::validation(
                "anchor",
                "the selected substring is required",
            ));
        }

        self.db.transaction(|tx| {
            let version = version::require_version(tx, version_id)?;
            let allowed = if version.status == VersionStatus::Draft {
                principal.is_admin()
            } else {
                identity::can_comment(principal)
            };
            if !allowed {
                return Err(DmsError::permission_denied("comment on version"));
            }

            let now = Utc::now();
            let comment = Comment {
                id: Uuid::new_v4().to_string(),
                version_id: version_id.to_string(),
                author_id: principal.id.clone(),
                author_username: principal.username.clone(),
                body: body.trim().to_string(),
                anchor: anchor.clone(),
                is_resolved: false,
                resolved_by: None,
                resolved_at: None,
                created_at: now,
                updated_at: now,
            };
            insert_comment(tx, &comment)?;

            audit::record(
                tx,
                &principal.actor(),
                AuditAction::CommentCreated,
                "comment",
                &comment.id,
                &format!(
                    "Commented on version {} of document {}",
                    version.version_string, version.document_id
                ),
                serde_json::json!({
                    "version_id": version_id,
                    "selected_text": &comment.anchor.selected_text,
                }),
                meta,
            )?;

            Ok(comment)
        })
    }

    /// Edit a comment body (author or admin)
    pub fn edit(
        &self,
        principal: &Principal,
        comment_id: &str,
        body: &str,
        meta: &RequestMetadata,
    ) -> Result<Comment> {
        if body.trim().is_empty() {
            return Err(DmsError::validation("body", "comment body is required"));
        }
        self.db.transaction(|tx| {
            let comment = require_comment(tx, comment_id)?;
            if comment.author_id != principal.id && !principal.is_admin() {
                return Err(DmsError::permission_denied("edit comment"));
            }

            tx.execute(
                "UPDATE comments SET body = ?2, updated_at = ?3 WHERE id = ?1",
                params![comment_id, body.trim(), Utc::now().to_rfc3339()],
            )?;
            audit::record(
                tx,
                &principal.actor(),
                AuditAction::CommentUpdated,
                "comment",
                comment_id,
                "Edited comment",
                serde_json::json!({ "before": comment.body, "after": body.trim() }),
                meta,
            )?;

            require_comment(tx, comment_id)
        })
    }

    /// Delete a comment (author or admin)
    pub fn delete(
        &self,
        principal: &Principal,
        comment_id: &str,
        meta: &RequestMetadata,
    ) -> Result<()> {
        self.db.transaction(|tx| {
            let comment = require_comment(tx, comment_id)?;
            if comment.author_id != principal.id && !principal.is_admin() {
                return Err(DmsError::permission_denied("delete comment"));
            }

            tx.execute("DELETE FROM comments WHERE id = ?1", params![comment_id])?;
            audit::record(
                tx,
                &principal.actor(),
                AuditAction::CommentDeleted,
                "comment",
                comment_id,
                &format!("Deleted comment by '{}'", comment.author_username),
                serde_json::json!({
                    "version_id": comment.version_id,
                    "body": comment.body,
                }),
                meta,
            )?;
            Ok(())
        })
    }

    /// Mark resolved (any commenting-capable principal)
    pub fn resolve(
        &self,
        principal: &Principal,
        comment_id: &str,
        meta: &RequestMetadata,
    ) -> Result<Comment> {
        self.set_resolution(principal, comment_id, true, meta)
    }

    /// Reopen (any commenting-capable principal)
    pub fn unresolve(
        &self,
        principal: &Principal,
        comment_id: &str,
        meta: &RequestMetadata,
    ) -> Result<Comment> {
        self.set_resolution(principal, comment_id, false, meta)
    }

    fn set_resolution(
        &self,
        principal: &Principal,
        comment_id: &str,
        resolved: bool,
        meta: &RequestMetadata,
    ) -> Result<Comment> {
        if !identity::can_comment(principal) {
            return Err(DmsError::permission_denied("resolve comment"));
        }
        self.db.transaction(|tx| {
            let comment = require_comment(tx, comment_id)?;
            if comment.is_resolved == resolved {
                return Ok(comment);
            }

            let now = Utc::now();
            if resolved {
                tx.execute(
                    "UPDATE comments
                     SET is_resolved = 1, resolved_by = ?2, resolved_at = ?3, updated_at = ?3
                     WHERE id = ?1",
                    params![comment_id, principal.id, now.to_rfc3339()],
                )?;
            } else {
                tx.execute(
                    "UPDATE comments
                     SET is_resolved = 0, resolved_by = NULL, resolved_at = NULL, updated_at = ?2
                     WHERE id = ?1",
                    params![comment_id, now.to_rfc3339()],
                )?;
            }

            audit::record(
                tx,
                &principal.actor(),
                if resolved {
                    AuditAction::CommentResolved
                } else {
                    AuditAction::CommentUnresolved
                },
                "comment",
                comment_id,
                if resolved {
                    "Resolved comment"
                } else {
                    "Reopened comment"
                },
                serde_json::json!({ "version_id": comment.version_id }),
                meta,
            )?;

            require_comment(tx, comment_id)
        })
    }

    /// List a version's comments, oldest first
    pub fn list(&self, version_id: &str, include_resolved: bool) -> Result<Vec<Comment>> {
        self.db.with_connection(|conn| {
            let sql = if include_resolved {
                "SELECT id, version_id, author_id, author_username, body, selected_text,
                        start_offset, end_offset, context_snippet, is_resolved, resolved_by,
                        resolved_at, created_at, updated_at
                 FROM comments WHERE version_id = ?1 ORDER BY created_at, id"
            } else {
                "SELECT id, version_id, author_id, author_username, body, selected_text,
                        start_offset, end_offset, context_snippet, is_resolved, resolved_by,
                        resolved_at, created_at, updated_at
                 FROM comments WHERE version_id = ?1 AND is_resolved = 0 ORDER BY created_at, id"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![version_id], row_to_comment)?;
            let mut comments = Vec::new();
            for row in rows {
                comments.push(row?);
            }
            Ok(comments)
        })
    }

    /// Count of unresolved comments on a version (task-feed priority input)
    pub fn unresolved_count(&self, version_id: &str) -> Result<i64> {
        self.db
            .with_connection(|conn| unresolved_count(conn, version_id))
    }
}

pub(crate) fn unresolved_count(conn: &Connection, version_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM comments WHERE version_id = ?1 AND is_resolved = 0",
        params![version_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

fn insert_comment(conn: &Connection, comment: &Comment) -> Result<()> {
    conn.execute(
        "INSERT INTO comments (
            id, version_id, author_id, author_username, body, selected_text,
            start_offset, end_offset, context_snippet, is_resolved, resolved_by,
            resolved_at, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            comment.id,
            comment.version_id,
            comment.author_id,
            comment.author_username,
            comment.body,
            comment.anchor.selected_text,
            comment.anchor.start_offset,
            comment.anchor.end_offset,
            comment.anchor.context_snippet,
            comment.is_resolved,
            comment.resolved_by,
            comment.resolved_at.map(|t| t.to_rfc3339()),
            comment.created_at.to_rfc3339(),
            comment.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn require_comment(conn: &Connection, id: &str) -> Result<Comment> {
    let mut stmt = conn.prepare(
        "SELECT id, version_id, author_id, author_username, body, selected_text,
                start_offset, end_offset, context_snippet, is_resolved, resolved_by,
                resolved_at, created_at, updated_at
         FROM comments WHERE id = ?1",
    )?;
    stmt.query_row(params![id], row_to_comment)
        .optional()?
        .ok_or_else(|| DmsError::not_found("comment", id))
}

fn row_to_comment(row: &rusqlite::Row) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        version_id: row.get(1)?,
        author_id: row.get(2)?,
        author_username: row.get(3)?,
        body: row.get(4)?,
        anchor: CommentAnchor {
            selected_text: row.get(5)?,
            start_offset: row.get(6)?,
            end_offset: row.get(7)?,
            context_snippet: row.get(8)?,
        },
        is_resolved: row.get(9)?,
        resolved_by: row.get(10)?,
        resolved_at: identity::parse_opt_ts(row.get(11)?),
        created_at: identity::parse_ts(row.get(12)?),
        updated_at: identity::parse_ts(row.get(13)?),
    })
}
