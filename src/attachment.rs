use crate::audit::{self, AuditAction, RequestMetadata};
use crate::database::Database;
use crate::identity::{self, Principal};
use crate::security;
use crate::{DmsError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Owner of an attachment: a document or one of its versions, never both
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentParent {
    Document(String),
    Version(String),
}

impl AttachmentParent {
    fn document_id(&self) -> Option<&str> {
        match self {
            AttachmentParent::Document(id) => Some(id),
            AttachmentParent::Version(_) => None,
        }
    }

    fn version_id(&self) -> Option<&str> {
        match self {
            AttachmentParent::Document(_) => None,
            AttachmentParent::Version(id) => Some(id),
        }
    }
}

/// Metadata row for an uploaded file. The blob lives on disk under its
/// content hash; attachments are immutable once uploaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub sha256: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub uploaded_by: String,
    pub document_id: Option<String>,
    pub version_id: Option<String>,
    pub description: Option<String>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Content-addressed attachment store with per-parent deduplication
#[derive(Clone)]
pub struct AttachmentService {
    db: Database,
    storage_dir: PathBuf,
}

impl AttachmentService {
    pub fn new(db: Database, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            storage_dir: storage_dir.into(),
        }
    }

    /// Upload bytes. An existing non-deleted attachment with the same hash
    /// on the same parent is returned unchanged (deduplication).
    pub fn upload(
        &self,
        principal: &Principal,
        bytes: &[u8],
        filename: &str,
        parent: AttachmentParent,
        description: Option<&str>,
        meta: &RequestMetadata,
    ) -> Result<Attachment> {
        if filename.trim().is_empty() {
            return Err(DmsError::validation("filename", "filename is required"));
        }
        if bytes.is_empty() {
            return Err(DmsError::validation("bytes", "attachment is empty"));
        }

        let sha256 = security::content_hash(bytes);
        let blob_path = self.blob_path(&sha256, filename);
        std::fs::create_dir_all(&self.storage_dir).map_err(|e| DmsError::FileSystem {
            path: self.storage_dir.display().to_string(),
            message: format!("failed to create attachment directory: {}", e),
        })?;
        if !blob_path.exists() {
            std::fs::write(&blob_path, bytes).map_err(|e| DmsError::FileSystem {
                path: blob_path.display().to_string(),
                message: format!("failed to write attachment blob: {}", e),
            })?;
        }

        self.db.transaction(|tx| {
            if let Some(existing) = find_duplicate(tx, &parent, &sha256)? {
                return Ok(existing);
            }

            let attachment = Attachment {
                id: Uuid::new_v4().to_string(),
                filename: filename.trim().to_string(),
                sha256: sha256.clone(),
                size_bytes: bytes.len() as i64,
                mime_type: mime_for(filename),
                uploaded_by: principal.id.clone(),
                document_id: parent.document_id().map(str::to_string),
                version_id: parent.version_id().map(str::to_string),
                description: description.map(str::to_string),
                is_deleted: false,
                created_at: Utc::now(),
            };
            insert_attachment(tx, &attachment)?;

            audit::record(
                tx,
                &principal.actor(),
                AuditAction::AttachmentUploaded,
                "attachment",
                &attachment.id,
                &format!("Uploaded attachment '{}'", attachment.filename),
                serde_json::json!({
                    "sha256": &attachment.sha256,
                    "size_bytes": attachment.size_bytes,
                    "document_id": &attachment.document_id,
                    "version_id": &attachment.version_id,
                }),
                meta,
            )?;

            Ok(attachment)
        })
    }

    pub fn get(&self, id: &str) -> Result<Attachment> {
        self.db.with_connection(|conn| require_attachment(conn, id))
    }

    /// Serve the blob bytes with the original filename
    pub fn download(&self, id: &str) -> Result<(Vec<u8>, String)> {
        let attachment = self.get(id)?;
        if attachment.is_deleted {
            return Err(DmsError::not_found("attachment", id));
        }
        let path = self.blob_path(&attachment.sha256, &attachment.filename);
        let bytes = std::fs::read(&path).map_err(|e| DmsError::FileSystem {
            path: path.display().to_string(),
            message: format!("failed to read attachment blob: {}", e),
        })?;
        Ok((bytes, attachment.filename))
    }

    /// Soft-delete the metadata row; the blob stays on disk
    pub fn delete(&self, principal: &Principal, id: &str, meta: &RequestMetadata) -> Result<()> {
        self.db.transaction(|tx| {
            let attachment = require_attachment(tx, id)?;
            if attachment.uploaded_by != principal.id && !principal.is_admin() {
                return Err(DmsError::permission_denied("delete attachment"));
            }
            tx.execute(
                "UPDATE attachments SET is_deleted = 1 WHERE id = ?1",
                params![id],
            )?;
            audit::record(
                tx,
                &principal.actor(),
                AuditAction::AttachmentDeleted,
                "attachment",
                id,
                &format!("Soft-deleted attachment '{}'", attachment.filename),
                serde_json::json!({ "sha256": attachment.sha256 }),
                meta,
            )?;
            Ok(())
        })
    }

    /// List non-deleted attachments of a parent
    pub fn list(&self, parent: &AttachmentParent) -> Result<Vec<Attachment>> {
        self.db.with_connection(|conn| {
            let (sql, id) = match parent {
                AttachmentParent::Document(id) => (
                    format!(
                        "SELECT {} FROM attachments
                         WHERE document_id = ?1 AND is_deleted = 0 ORDER BY created_at, id",
                        ATTACHMENT_COLUMNS
                    ),
                    id,
                ),
                AttachmentParent::Version(id) => (
                    format!(
                        "SELECT {} FROM attachments
                         WHERE version_id = ?1 AND is_deleted = 0 ORDER BY created_at, id",
                        ATTACHMENT_COLUMNS
                    ),
                    id,
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![id], row_to_attachment)?;
            let mut attachments = Vec::new();
            for row in rows {
                attachments.push(row?);
            }
            Ok(attachments)
        })
    }

    /// Blob filename on disk: content hash plus the original extension
    fn blob_path(&self, sha256: &str, filename: &str) -> PathBuf {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        self.storage_dir.join(format!("{}.{}", sha256, ext))
    }
}

/// Clone version-scoped attachment metadata onto a new version. The rows
/// share the stored blob; only the metadata is duplicated. Returns the
/// number of cloned rows.
pub fn clone_version_attachments(
    conn: &Connection,
    from_version_id: &str,
    to_version_id: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    let sql = format!(
        "SELECT {} FROM attachments WHERE version_id = ?1 AND is_deleted = 0",
        ATTACHMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![from_version_id], row_to_attachment)?;

    let mut cloned = 0;
    for row in rows {
        let source = row?;
        let copy = Attachment {
            id: Uuid::new_v4().to_string(),
            version_id: Some(to_version_id.to_string()),
            created_at: now,
            ..source
        };
        insert_attachment(conn, &copy)?;
        cloned += 1;
    }
    Ok(cloned)
}

const ATTACHMENT_COLUMNS: &str = "id, filename, sha256, size_bytes, mime_type, uploaded_by, \
     document_id, version_id, description, is_deleted, created_at";

fn insert_attachment(conn: &Connection, a: &Attachment) -> Result<()> {
    conn.execute(
        "INSERT INTO attachments (
            id, filename, sha256, size_bytes, mime_type, uploaded_by,
            document_id, version_id, description, is_deleted, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            a.id,
            a.filename,
            a.sha256,
            a.size_bytes,
            a.mime_type,
            a.uploaded_by,
            a.document_id,
            a.version_id,
            a.description,
            a.is_deleted,
            a.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn find_duplicate(
    conn: &Connection,
    parent: &AttachmentParent,
    sha256: &str,
) -> Result<Option<Attachment>> {
    let (sql, id) = match parent {
        AttachmentParent::Document(id) => (
            format!(
                "SELECT {} FROM attachments
                 WHERE document_id = ?1 AND sha256 = ?2 AND is_deleted = 0",
                ATTACHMENT_COLUMNS
            ),
            id,
        ),
        AttachmentParent::Version(id) => (
            format!(
                "SELECT {} FROM attachments
                 WHERE version_id = ?1 AND sha256 = ?2 AND is_deleted = 0",
                ATTACHMENT_COLUMNS
            ),
            id,
        ),
    };
    let mut stmt = conn.prepare(&sql)?;
    Ok(stmt
        .query_row(params![id, sha256], row_to_attachment)
        .optional()?)
}

fn require_attachment(conn: &Connection, id: &str) -> Result<Attachment> {
    let sql = format!("SELECT {} FROM attachments WHERE id = ?1", ATTACHMENT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_row(params![id], row_to_attachment)
        .optional()?
        .ok_or_else(|| DmsError::not_found("attachment", id))
}

fn row_to_attachment(row: &rusqlite::Row) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: row.get(0)?,
        filename: row.get(1)?,
        sha256: row.get(2)?,
        size_bytes: row.get(3)?,
        mime_type: row.get(4)?,
        uploaded_by: row.get(5)?,
        document_id: row.get(6)?,
        version_id: row.get(7)?,
        description: row.get(8)?,
        is_deleted: row.get(9)?,
        created_at: identity::parse_ts(row.get(10)?),
    })
}

fn mime_for(filename: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
    .to_string()
}
