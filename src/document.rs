use crate::audit::{self, AuditAction, RequestMetadata};
use crate::database::Database;
use crate::identity::{self, Principal};
use crate::version::{self, DocumentVersion, VersionStatus, INITIAL_VERSION_STRING};
use crate::{DmsError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A controlled document. Versions carry the content; the document row
/// carries identity and the pointer to the current Effective version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub document_number: String,
    pub title: String,
    pub description: Option<String>,
    pub department: String,
    pub tags: Vec<String>,
    pub owner_id: String,
    pub current_version_id: Option<String>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lightweight projection of a version for document detail listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: String,
    pub version_number: i64,
    pub version_string: String,
    pub status: VersionStatus,
    pub is_latest: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A document plus the summary of its version history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDetail {
    pub document: Document,
    pub versions: Vec<VersionSummary>,
}

/// Request to create a document. A closed record of recognised fields.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDocument {
    pub title: String,
    pub description: Option<String>,
    pub department: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Caller-supplied unique number; auto-generated when absent
    pub document_number: Option<String>,
    /// Create the v0.1 draft in the same transaction
    #[serde(default = "default_true")]
    pub create_initial_draft: bool,
}

fn default_true() -> bool {
    true
}

/// Patch for document metadata. Department is immutable because the
/// document number embeds it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Listing filters with limit/offset pagination
#[derive(Debug, Clone, Default)]
pub struct DocumentFilters {
    pub department: Option<String>,
    pub tag: Option<String>,
    /// Case-insensitive substring match on title or document number
    pub text: Option<String>,
    /// Status of the latest version
    pub status: Option<VersionStatus>,
    pub include_deleted: bool,
    pub limit: i64,
    pub offset: i64,
}

// Repository functions

const DOCUMENT_COLUMNS: &str = "id, document_number, title, description, department, tags, \
     owner_id, current_version_id, is_deleted, created_at, updated_at";

pub fn insert_document(conn: &Connection, doc: &Document) -> Result<()> {
    conn.execute(
        "INSERT INTO documents (
            id, document_number, title, description, department, tags,
            owner_id, current_version_id, is_deleted, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            doc.id,
            doc.document_number,
            doc.title,
            doc.description,
            doc.department,
            serde_json::to_string(&doc.tags)?,
            doc.owner_id,
            doc.current_version_id,
            doc.is_deleted,
            doc.created_at.to_rfc3339(),
            doc.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn find_document(conn: &Connection, id: &str) -> Result<Option<Document>> {
    let sql = format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    Ok(stmt.query_row(params![id], row_to_document).optional()?)
}

pub fn require_document(conn: &Connection, id: &str) -> Result<Document> {
    find_document(conn, id)?.ok_or_else(|| DmsError::not_found("document", id))
}

pub fn set_current_version(conn: &Connection, document_id: &str, version_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE documents SET current_version_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![document_id, version_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<Document> {
    let tags_raw: String = row.get(5)?;
    Ok(Document {
        id: row.get(0)?,
        document_number: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        department: row.get(4)?,
        tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
        owner_id: row.get(6)?,
        current_version_id: row.get(7)?,
        is_deleted: row.get(8)?,
        created_at: identity::parse_ts(row.get(9)?),
        updated_at: identity::parse_ts(row.get(10)?),
    })
}

/// Derive the four-letter uppercase department code embedded in document
/// numbers
pub fn department_code(department: &str) -> Result<String> {
    let code: String = department
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .take(4)
        .collect::<String>()
        .to_ascii_uppercase();
    if code.len() < 4 {
        return Err(DmsError::validation(
            "department",
            "department must contain at least four letters",
        ));
    }
    Ok(code)
}

/// Allocate the next document number for the department: transactional
/// counter increment prevents collisions.
pub fn next_document_number(
    conn: &Connection,
    department: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let code = department_code(department)?;
    let day = now.format("%Y%m%d").to_string();
    conn.execute(
        "INSERT INTO document_number_counters (department, day, counter) VALUES (?1, ?2, 1)
         ON CONFLICT (department, day) DO UPDATE SET counter = counter + 1",
        params![code, day],
    )?;
    let counter: i64 = conn.query_row(
        "SELECT counter FROM document_number_counters WHERE department = ?1 AND day = ?2",
        params![code, day],
        |row| row.get(0),
    )?;
    Ok(format!("SOP-{}-{}-{:04}", code, day, counter))
}

/// Document CRUD and the create-document-plus-initial-version convenience
#[derive(Clone)]
pub struct DocumentService {
    db: Database,
}

impl DocumentService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a document, optionally with its v0.1 draft, in one
    /// transaction
    pub fn create(
        &self,
        principal: &Principal,
        request: NewDocument,
        meta: &RequestMetadata,
    ) -> Result<DocumentDetail> {
        self.create_at(principal, request, meta, Utc::now())
    }

    pub(crate) fn create_at(
        &self,
        principal: &Principal,
        request: NewDocument,
        meta: &RequestMetadata,
        now: DateTime<Utc>,
    ) -> Result<DocumentDetail> {
        if !identity::can_create_document(principal) {
            return Err(DmsError::permission_denied("create document"));
        }
        if request.title.trim().is_empty() {
            return Err(DmsError::validation("title", "title is required"));
        }
        department_code(&request.department)?;

        self.db.transaction(|tx| {
            let document_number = match &request.document_number {
                Some(number) => {
                    let number = number.trim();
                    if number.is_empty() {
                        return Err(DmsError::validation(
                            "document_number",
                            "document number must not be blank",
                        ));
                    }
                    let exists: i64 = tx.query_row(
                        "SELECT COUNT(*) FROM documents WHERE document_number = ?1",
                        params![number],
                        |row| row.get(0),
                    )?;
                    if exists > 0 {
                        return Err(DmsError::AlreadyExists {
                            resource: "document".to_string(),
                            id: number.to_string(),
                        });
                    }
                    number.to_string()
                }
                None => next_document_number(tx, &request.department, now)?,
            };

            let document = Document {
                id: Uuid::new_v4().to_string(),
                document_number: document_number.clone(),
                title: request.title.trim().to_string(),
                description: request.description.clone(),
                department: request.department.clone(),
                tags: request.tags.clone(),
                owner_id: principal.id.clone(),
                current_version_id: None,
                is_deleted: false,
                created_at: now,
                updated_at: now,
            };
            insert_document(tx, &document)?;
            audit::record(
                tx,
                &principal.actor(),
                AuditAction::DocumentCreated,
                "document",
                &document.id,
                &format!("Created document {} '{}'", document_number, document.title),
                serde_json::json!({
                    "document_number": &document_number,
                    "department": &document.department,
                }),
                meta,
            )?;

            let mut versions = Vec::new();
            if request.create_initial_draft {
                let draft = DocumentVersion::new_draft(
                    &document.id,
                    1,
                    INITIAL_VERSION_STRING,
                    "",
                    &principal.id,
                    now,
                );
                version::insert_version(tx, &draft)?;
                audit::record(
                    tx,
                    &principal.actor(),
                    AuditAction::VersionCreated,
                    "version",
                    &draft.id,
                    &format!(
                        "Created initial draft {} of document {}",
                        draft.version_string, document_number
                    ),
                    serde_json::json!({
                        "version_string": &draft.version_string,
                        "document_number": &document_number,
                    }),
                    meta,
                )?;
                versions.push(summary_of(&draft));
            }

            Ok(DocumentDetail { document, versions })
        })
    }

    /// List documents matching the filters, newest first. Soft-deleted
    /// documents are hidden unless explicitly requested.
    pub fn list(&self, filters: &DocumentFilters) -> Result<Vec<Document>> {
        self.db.with_connection(|conn| {
            let mut sql = format!("SELECT {} FROM documents WHERE 1=1", DOCUMENT_COLUMNS);
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if !filters.include_deleted {
                sql.push_str(" AND is_deleted = 0");
            }
            if let Some(department) = &filters.department {
                sql.push_str(" AND department = ?");
                params.push(Box::new(department.clone()));
            }
            if let Some(tag) = &filters.tag {
                // Tags are stored as a JSON array of strings
                sql.push_str(" AND tags LIKE ?");
                params.push(Box::new(format!("%\"{}\"%", tag)));
            }
            if let Some(text) = &filters.text {
                sql.push_str(" AND (title LIKE ? COLLATE NOCASE OR document_number LIKE ? COLLATE NOCASE)");
                let pattern = format!("%{}%", text);
                params.push(Box::new(pattern.clone()));
                params.push(Box::new(pattern));
            }
            if let Some(status) = &filters.status {
                sql.push_str(
                    " AND EXISTS (SELECT 1 FROM document_versions v
                       WHERE v.document_id = documents.id AND v.is_latest = 1 AND v.status = ?)",
                );
                params.push(Box::new(status.as_str().to_string()));
            }

            sql.push_str(" ORDER BY created_at DESC, id LIMIT ? OFFSET ?");
            let limit = if filters.limit > 0 { filters.limit } else { 50 };
            params.push(Box::new(limit));
            params.push(Box::new(filters.offset.max(0)));

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let rows = stmt.query_map(param_refs.as_slice(), row_to_document)?;

            let mut documents = Vec::new();
            for row in rows {
                documents.push(row?);
            }
            Ok(documents)
        })
    }

    /// Fetch a document with its version summaries
    pub fn get(&self, id: &str) -> Result<DocumentDetail> {
        self.db.with_connection(|conn| {
            let document = require_document(conn, id)?;
            let versions = version::list_versions(conn, id)?
                .iter()
                .map(summary_of)
                .collect();
            Ok(DocumentDetail { document, versions })
        })
    }

    /// Update document metadata (owner or admin)
    pub fn update_metadata(
        &self,
        principal: &Principal,
        id: &str,
        patch: DocumentPatch,
        meta: &RequestMetadata,
    ) -> Result<Document> {
        self.db.transaction(|tx| {
            let document = require_document(tx, id)?;
            if !identity::can_edit_draft(principal, &document.owner_id) {
                return Err(DmsError::permission_denied("update document metadata"));
            }
            if let Some(title) = &patch.title {
                if title.trim().is_empty() {
                    return Err(DmsError::validation("title", "title must not be blank"));
                }
            }

            let before = serde_json::json!({
                "title": &document.title,
                "description": &document.description,
                "tags": &document.tags,
            });

            let title = patch
                .title
                .as_deref()
                .map(str::trim)
                .map(str::to_string)
                .unwrap_or_else(|| document.title.clone());
            let description = patch.description.clone().or_else(|| document.description.clone());
            let tags = patch.tags.clone().unwrap_or_else(|| document.tags.clone());
            let now = Utc::now();

            tx.execute(
                "UPDATE documents SET title = ?2, description = ?3, tags = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    id,
                    title,
                    description,
                    serde_json::to_string(&tags)?,
                    now.to_rfc3339(),
                ],
            )?;

            audit::record(
                tx,
                &principal.actor(),
                AuditAction::DocumentUpdated,
                "document",
                id,
                &format!("Updated metadata of document {}", document.document_number),
                serde_json::json!({
                    "before": before,
                    "after": { "title": &title, "description": &description, "tags": &tags },
                }),
                meta,
            )?;

            require_document(tx, id)
        })
    }

    /// Soft-delete a document (admin only). The record is hidden from
    /// listings but retained for audit references.
    pub fn soft_delete(
        &self,
        principal: &Principal,
        id: &str,
        meta: &RequestMetadata,
    ) -> Result<()> {
        if !identity::can_delete_document(principal) {
            return Err(DmsError::permission_denied("delete document"));
        }
        self.db.transaction(|tx| {
            let document = require_document(tx, id)?;
            tx.execute(
                "UPDATE documents SET is_deleted = 1, updated_at = ?2 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )?;
            audit::record(
                tx,
                &principal.actor(),
                AuditAction::DocumentDeleted,
                "document",
                id,
                &format!("Soft-deleted document {}", document.document_number),
                serde_json::json!({ "document_number": document.document_number }),
                meta,
            )?;
            Ok(())
        })
    }
}

fn summary_of(v: &DocumentVersion) -> VersionSummary {
    VersionSummary {
        id: v.id.clone(),
        version_number: v.version_number,
        version_string: v.version_string.clone(),
        status: v.status,
        is_latest: v.is_latest,
        created_by: v.created_by.clone(),
        created_at: v.created_at,
        updated_at: v.updated_at,
    }
}
