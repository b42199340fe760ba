use crate::audit::{self, AuditAction, RequestMetadata};
use crate::database::Database;
use crate::document;
use crate::identity::{self, Principal};
use crate::version;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One workflow signatory on an exported version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signatory {
    pub stage: String,
    pub username: String,
    pub signed_at: Option<DateTime<Utc>>,
}

/// Everything the renderer needs to produce a DOCX
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportInput {
    pub title: String,
    pub document_number: String,
    pub version_string: String,
    pub status: String,
    pub effective_at: Option<DateTime<Utc>>,
    pub organization: String,
    pub signatories: Vec<Signatory>,
    pub html: String,
}

/// Seam to the external HTML-to-DOCX collaborator. The core gathers inputs
/// and records the audit entry; the translation itself lives behind this
/// trait.
pub trait DocxRenderer: Send + Sync {
    fn render(&self, input: &ExportInput) -> Result<Vec<u8>>;
}

/// Built-in renderer emitting Word-processable HTML bytes. Stands in for a
/// full OOXML converter deployment-side; the byte payload preserves
/// headings, lists, tables, inline formatting, and links because the source
/// HTML is embedded unmodified.
pub struct WordHtmlRenderer;

impl DocxRenderer for WordHtmlRenderer {
    fn render(&self, input: &ExportInput) -> Result<Vec<u8>> {
        let mut signatories = String::new();
        for s in &input.signatories {
            let when = s
                .signed_at
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_default();
            signatories.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                s.stage, s.username, when
            ));
        }
        let effective = input
            .effective_at
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "-".to_string());

        let doc = format!(
            "<html xmlns:w=\"urn:schemas-microsoft-com:office:word\"><head>\
             <meta charset=\"utf-8\"><title>{title}</title></head><body>\
             <h1>{title}</h1>\
             <table border=\"1\">\
             <tr><td>Document Number</td><td>{number}</td></tr>\
             <tr><td>Version</td><td>{version}</td></tr>\
             <tr><td>Status</td><td>{status}</td></tr>\
             <tr><td>Effective Date</td><td>{effective}</td></tr>\
             <tr><td>Organization</td><td>{organization}</td></tr>\
             </table>\
             <h2>Signatures</h2>\
             <table border=\"1\"><tr><th>Stage</th><th>Signed By</th><th>Date</th></tr>{signatories}</table>\
             <hr>{content}</body></html>",
            title = input.title,
            number = input.document_number,
            version = input.version_string,
            status = input.status,
            effective = effective,
            organization = input.organization,
            signatories = signatories,
            content = input.html,
        );
        Ok(doc.into_bytes())
    }
}

/// Export operations: gather inputs, call the renderer, record the audit
#[derive(Clone)]
pub struct ExportService {
    db: Database,
    renderer: Arc<dyn DocxRenderer>,
    organization: String,
}

impl ExportService {
    pub fn new(db: Database, renderer: Arc<dyn DocxRenderer>, organization: String) -> Self {
        Self {
            db,
            renderer,
            organization,
        }
    }

    /// Render a version to DOCX bytes plus a suggested filename
    pub fn render_docx(
        &self,
        principal: &Principal,
        version_id: &str,
        meta: &RequestMetadata,
    ) -> Result<(Vec<u8>, String)> {
        let input = self.gather(version_id)?;
        let bytes = self.renderer.render(&input)?;
        let filename = format!(
            "{}_{}.docx",
            input.document_number.replace('/', "-"),
            input.version_string
        );

        self.db.transaction(|tx| {
            audit::record(
                tx,
                &principal.actor(),
                AuditAction::DocumentExported,
                "version",
                version_id,
                &format!(
                    "Exported version {} of document {} to DOCX",
                    input.version_string, input.document_number
                ),
                serde_json::json!({
                    "filename": &filename,
                    "size_bytes": bytes.len(),
                }),
                meta,
            )
        })?;

        Ok((bytes, filename))
    }

    fn gather(&self, version_id: &str) -> Result<ExportInput> {
        self.db.with_connection(|conn| {
            let version = version::require_version(conn, version_id)?;
            let doc = document::require_document(conn, &version.document_id)?;

            let mut signatories = Vec::new();
            let stages: [(&str, &Option<String>, Option<DateTime<Utc>>); 4] = [
                ("Submitted", &version.submitted_by, version.submitted_at),
                ("Reviewed", &version.reviewed_by, version.reviewed_at),
                ("Approved", &version.approved_by, version.approved_at),
                ("Published", &version.published_by, version.effective_at),
            ];
            for (stage, principal_id, signed_at) in stages {
                if let Some(pid) = principal_id {
                    let username = identity::find_by_id(conn, pid)?
                        .map(|p| p.username)
                        .unwrap_or_else(|| pid.clone());
                    signatories.push(Signatory {
                        stage: stage.to_string(),
                        username,
                        signed_at,
                    });
                }
            }

            Ok(ExportInput {
                title: doc.title,
                document_number: doc.document_number,
                version_string: version.version_string,
                status: version.status.as_str().to_string(),
                effective_at: version.effective_at,
                organization: self.organization.clone(),
                signatories,
                html: version.content,
            })
        })
    }
}

/// Test renderer recording what it was asked to render
#[cfg(test)]
pub(crate) struct RecordingRenderer {
    pub inputs: std::sync::Mutex<Vec<ExportInput>>,
}

#[cfg(test)]
impl DocxRenderer for RecordingRenderer {
    fn render(&self, input: &ExportInput) -> Result<Vec<u8>> {
        self.inputs
            .lock()
            .map_err(|_| crate::DmsError::invariant("recorder poisoned"))?
            .push(input.clone());
        Ok(b"docx-bytes".to_vec())
    }
}
