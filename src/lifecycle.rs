use crate::attachment;
use crate::audit::{self, AuditAction, RequestMetadata};
use crate::database::Database;
use crate::document::{self, Document};
use crate::identity::{self, Principal};
use crate::session::AuthService;
use crate::version::{
    self, bump_version_string, parse_version_string, validate_change_reason, ChangeType,
    DocumentVersion, VersionStatus,
};
use crate::{DmsError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Transaction};

/// Named lifecycle transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Submit,
    ApproveReview,
    RequestChanges,
    Approve,
    Reject,
    Publish,
    Archive,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Submit => "Submit",
            LifecycleAction::ApproveReview => "Approve Review",
            LifecycleAction::RequestChanges => "Request Changes",
            LifecycleAction::Approve => "Approve",
            LifecycleAction::Reject => "Reject",
            LifecycleAction::Publish => "Publish",
            LifecycleAction::Archive => "Archive",
        }
    }
}

/// Who may execute a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    OwnerOrAdmin,
    Reviewer,
    Approver,
    Publisher,
    Archiver,
}

/// One row of the legal-transition table
struct TransitionRule {
    action: LifecycleAction,
    from: &'static [VersionStatus],
    to: VersionStatus,
    gate: Gate,
    comment_required: bool,
    audit_action: AuditAction,
}

/// The explicit table of legal transitions. Every lifecycle transition is
/// e-signature gated; anything not listed is an `IllegalTransition`.
const TRANSITIONS: &[TransitionRule] = &[
    TransitionRule {
        action: LifecycleAction::Submit,
        from: &[VersionStatus::Draft],
        to: VersionStatus::UnderReview,
        gate: Gate::OwnerOrAdmin,
        comment_required: false,
        audit_action: AuditAction::VersionSubmitted,
    },
    TransitionRule {
        action: LifecycleAction::ApproveReview,
        from: &[VersionStatus::UnderReview],
        to: VersionStatus::PendingApproval,
        gate: Gate::Reviewer,
        comment_required: false,
        audit_action: AuditAction::VersionReviewApproved,
    },
    TransitionRule {
        action: LifecycleAction::RequestChanges,
        from: &[VersionStatus::UnderReview],
        to: VersionStatus::Draft,
        gate: Gate::Reviewer,
        comment_required: true,
        audit_action: AuditAction::VersionChangesRequested,
    },
    TransitionRule {
        action: LifecycleAction::Approve,
        from: &[VersionStatus::PendingApproval],
        to: VersionStatus::Approved,
        gate: Gate::Approver,
        comment_required: false,
        audit_action: AuditAction::VersionApproved,
    },
    TransitionRule {
        action: LifecycleAction::Reject,
        from: &[VersionStatus::PendingApproval],
        to: VersionStatus::Draft,
        gate: Gate::Approver,
        comment_required: true,
        audit_action: AuditAction::VersionRejected,
    },
    TransitionRule {
        action: LifecycleAction::Publish,
        from: &[VersionStatus::Approved],
        to: VersionStatus::Effective,
        gate: Gate::Publisher,
        comment_required: false,
        audit_action: AuditAction::VersionPublished,
    },
    TransitionRule {
        action: LifecycleAction::Archive,
        from: &[VersionStatus::Effective, VersionStatus::Obsolete],
        to: VersionStatus::Archived,
        gate: Gate::Archiver,
        comment_required: false,
        audit_action: AuditAction::VersionArchived,
    },
];

fn rule_for(action: LifecycleAction) -> &'static TransitionRule {
    TRANSITIONS
        .iter()
        .find(|r| r.action == action)
        .expect("every action has a table row")
}

/// The lifecycle state machine. The only component allowed to set a
/// version's status; no other path may set Effective or Obsolete.
#[derive(Clone)]
pub struct LifecycleService {
    db: Database,
    auth: AuthService,
}

impl LifecycleService {
    pub fn new(db: Database, auth: AuthService) -> Self {
        Self { db, auth }
    }

    /// Draft → Under Review
    pub fn submit(
        &self,
        principal: &Principal,
        version_id: &str,
        credential: &str,
        comment: Option<&str>,
        meta: &RequestMetadata,
    ) -> Result<DocumentVersion> {
        self.transition(principal, version_id, LifecycleAction::Submit, credential, comment, meta)
    }

    /// Under Review → Pending Approval
    pub fn approve_review(
        &self,
        principal: &Principal,
        version_id: &str,
        credential: &str,
        comment: Option<&str>,
        meta: &RequestMetadata,
    ) -> Result<DocumentVersion> {
        self.transition(
            principal,
            version_id,
            LifecycleAction::ApproveReview,
            credential,
            comment,
            meta,
        )
    }

    /// Under Review → Draft; the review comment is mandatory
    pub fn request_changes(
        &self,
        principal: &Principal,
        version_id: &str,
        credential: &str,
        comment: &str,
        meta: &RequestMetadata,
    ) -> Result<DocumentVersion> {
        self.transition(
            principal,
            version_id,
            LifecycleAction::RequestChanges,
            credential,
            Some(comment),
            meta,
        )
    }

    /// Pending Approval → Approved
    pub fn approve(
        &self,
        principal: &Principal,
        version_id: &str,
        credential: &str,
        comment: Option<&str>,
        meta: &RequestMetadata,
    ) -> Result<DocumentVersion> {
        self.transition(principal, version_id, LifecycleAction::Approve, credential, comment, meta)
    }

    /// Pending Approval → Draft; the rejection reason is mandatory
    pub fn reject(
        &self,
        principal: &Principal,
        version_id: &str,
        credential: &str,
        reason: &str,
        meta: &RequestMetadata,
    ) -> Result<DocumentVersion> {
        self.transition(
            principal,
            version_id,
            LifecycleAction::Reject,
            credential,
            Some(reason),
            meta,
        )
    }

    /// Effective/Obsolete → Archived
    pub fn archive(
        &self,
        principal: &Principal,
        version_id: &str,
        credential: &str,
        meta: &RequestMetadata,
    ) -> Result<DocumentVersion> {
        self.transition(principal, version_id, LifecycleAction::Archive, credential, None, meta)
    }

    fn transition(
        &self,
        principal: &Principal,
        version_id: &str,
        action: LifecycleAction,
        credential: &str,
        comment: Option<&str>,
        meta: &RequestMetadata,
    ) -> Result<DocumentVersion> {
        let rule = rule_for(action);
        let comment = normalize_comment(comment);
        if rule.comment_required && comment.is_none() {
            return Err(DmsError::validation(
                "comment",
                format!("a comment is required for {}", action.as_str()),
            ));
        }

        self.precheck(principal, version_id, action, rule.gate, credential, meta)?;

        self.db.transaction(|tx| {
            let version = version::require_version(tx, version_id)?;
            if !rule.from.contains(&version.status) {
                return Err(DmsError::IllegalTransition {
                    from: version.status.as_str().to_string(),
                    action: action.as_str().to_string(),
                });
            }
            let doc = document::require_document(tx, &version.document_id)?;
            let now = Utc::now();

            // Returning a version to Draft must not create a second one
            if rule.to == VersionStatus::Draft {
                if let Some(existing) = version::find_draft(tx, &doc.id)? {
                    if existing.id != version.id {
                        return Err(DmsError::invariant(format!(
                            "document {} already has draft version {}",
                            doc.document_number, existing.version_string
                        )));
                    }
                }
            }

            apply_stamps(tx, &version, rule.to, action, &principal.id, now)?;

            let (description, details) = audit::esigned_details(
                &principal.username,
                &format!(
                    "{}: version {} of document {} ({} -> {})",
                    action.as_str(),
                    version.version_string,
                    doc.document_number,
                    version.status.as_str(),
                    rule.to.as_str()
                ),
                serde_json::json!({
                    "from": version.status.as_str(),
                    "to": rule.to.as_str(),
                    "comment": &comment,
                }),
            );
            audit::record(
                tx,
                &principal.actor(),
                rule.audit_action,
                "version",
                version_id,
                &description,
                details,
                meta,
            )?;

            version::require_version(tx, version_id)
        })
    }

    /// Publish: Approved → Effective, atomically obsoleting the current
    /// Effective version.
    pub fn publish(
        &self,
        principal: &Principal,
        version_id: &str,
        credential: &str,
        effective_date: Option<DateTime<Utc>>,
        meta: &RequestMetadata,
    ) -> Result<DocumentVersion> {
        self.publish_at(principal, version_id, credential, effective_date, meta, Utc::now())
    }

    pub(crate) fn publish_at(
        &self,
        principal: &Principal,
        version_id: &str,
        credential: &str,
        effective_date: Option<DateTime<Utc>>,
        meta: &RequestMetadata,
        now: DateTime<Utc>,
    ) -> Result<DocumentVersion> {
        self.precheck(
            principal,
            version_id,
            LifecycleAction::Publish,
            Gate::Publisher,
            credential,
            meta,
        )?;

        self.db.transaction(|tx| {
            let version = version::require_version(tx, version_id)?;
            if version.status != VersionStatus::Approved {
                return Err(DmsError::IllegalTransition {
                    from: version.status.as_str().to_string(),
                    action: LifecycleAction::Publish.as_str().to_string(),
                });
            }
            let doc = document::require_document(tx, &version.document_id)?;

            // The version must still descend from the document's current
            // version; a concurrently published sibling moves the
            // predecessor out from under it.
            if let Some(current) = &doc.current_version_id {
                if version.parent_version_id.as_deref() != Some(current.as_str()) {
                    return Err(DmsError::IllegalTransition {
                        from: version.status.as_str().to_string(),
                        action: LifecycleAction::Publish.as_str().to_string(),
                    });
                }
            }

            // The sole version-string renaming event: first publish promotes
            // the pre-release string to v1.0
            let (major, _) = parse_version_string(&version.version_string)?;
            let new_string = if major == 0 {
                "v1.0".to_string()
            } else {
                version.version_string.clone()
            };

            let effective_at = effective_date.unwrap_or(now);
            let predecessor = version::find_effective(tx, &doc.id)?;

            tx.execute(
                "UPDATE document_versions
                 SET status = ?2, version_string = ?3, effective_at = ?4,
                     published_by = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    version_id,
                    VersionStatus::Effective.as_str(),
                    new_string,
                    effective_at.to_rfc3339(),
                    principal.id,
                    now.to_rfc3339(),
                ],
            )?;

            let mut obsoleted = Vec::new();
            if let Some(prior) = &predecessor {
                tx.execute(
                    "UPDATE document_versions
                     SET status = ?2, obsolete_at = ?3, replaced_by = ?4, updated_at = ?3
                     WHERE id = ?1",
                    params![
                        prior.id,
                        VersionStatus::Obsolete.as_str(),
                        now.to_rfc3339(),
                        version_id,
                    ],
                )?;
                obsoleted.push(serde_json::json!({
                    "id": &prior.id,
                    "version_string": &prior.version_string,
                }));
            }

            version::mark_latest(tx, &doc.id, version_id)?;
            document::set_current_version(tx, &doc.id, version_id)?;

            // Transactional re-check of the single-effective invariant
            let effective_count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM document_versions
                 WHERE document_id = ?1 AND status = ?2",
                params![doc.id, VersionStatus::Effective.as_str()],
                |row| row.get(0),
            )?;
            if effective_count != 1 {
                return Err(DmsError::invariant(format!(
                    "document {} would have {} effective versions",
                    doc.document_number, effective_count
                )));
            }

            let (description, details) = audit::esigned_details(
                &principal.username,
                &format!(
                    "Publish: version {} of document {} is now Effective",
                    new_string, doc.document_number
                ),
                serde_json::json!({
                    "from": VersionStatus::Approved.as_str(),
                    "to": VersionStatus::Effective.as_str(),
                    "version_string": new_string,
                    "effective_at": effective_at.to_rfc3339(),
                    "obsoleted": obsoleted,
                }),
            );
            audit::record(
                tx,
                &principal.actor(),
                AuditAction::VersionPublished,
                "version",
                version_id,
                &description,
                details,
                meta,
            )?;

            version::require_version(tx, version_id)
        })
    }

    /// Create the next controlled revision as a Draft cloned from an
    /// Effective parent.
    pub fn create_next_version(
        &self,
        principal: &Principal,
        parent_version_id: &str,
        change_type: ChangeType,
        change_reason: &str,
        meta: &RequestMetadata,
    ) -> Result<DocumentVersion> {
        validate_change_reason(change_reason)?;

        self.db.transaction(|tx| {
            let parent = version::require_version(tx, parent_version_id)?;
            let doc = document::require_document(tx, &parent.document_id)?;
            if !identity::can_edit_draft(principal, &doc.owner_id) {
                return Err(DmsError::permission_denied("create next version"));
            }
            if parent.status != VersionStatus::Effective {
                return Err(DmsError::IllegalStatus {
                    required: VersionStatus::Effective.as_str().to_string(),
                    actual: parent.status.as_str().to_string(),
                });
            }
            if let Some(existing) = version::find_draft(tx, &doc.id)? {
                return Err(DmsError::AlreadyExists {
                    resource: "draft version".to_string(),
                    id: existing.version_string,
                });
            }

            let now = Utc::now();
            let mut draft = DocumentVersion::new_draft(
                &doc.id,
                version::max_version_number(tx, &doc.id)? + 1,
                &bump_version_string(&parent.version_string, change_type)?,
                &parent.content,
                &principal.id,
                now,
            );
            draft.change_type = Some(change_type);
            draft.change_reason = Some(change_reason.to_string());
            draft.parent_version_id = Some(parent.id.clone());
            version::insert_version(tx, &draft)?;
            version::mark_latest(tx, &doc.id, &draft.id)?;

            // Attachment metadata rides along with the content clone
            let cloned = attachment::clone_version_attachments(tx, &parent.id, &draft.id, now)?;

            audit::record(
                tx,
                &principal.actor(),
                AuditAction::VersionCreated,
                "version",
                &draft.id,
                &format!(
                    "Created draft {} of document {} from parent {}",
                    draft.version_string, doc.document_number, parent.version_string
                ),
                serde_json::json!({
                    "parent_version": parent.version_string,
                    "change_type": change_type.as_str(),
                    "change_reason": change_reason,
                    "cloned_attachments": cloned,
                }),
                meta,
            )?;

            version::require_version(tx, &draft.id)
        })
    }

    /// Capability and e-signature gate, executed before any mutation. Both
    /// failure kinds commit their audit entries in their own transaction.
    fn precheck(
        &self,
        principal: &Principal,
        version_id: &str,
        action: LifecycleAction,
        gate: Gate,
        credential: &str,
        meta: &RequestMetadata,
    ) -> Result<()> {
        let doc = self.db.with_connection(|conn| {
            let version = version::require_version(conn, version_id)?;
            document::require_document(conn, &version.document_id)
        })?;

        if !gate_allows(gate, principal, &doc) {
            self.db.transaction(|tx| {
                audit::record(
                    tx,
                    &principal.actor(),
                    AuditAction::PermissionDenied,
                    "version",
                    version_id,
                    &format!("Permission denied for {}", action.as_str()),
                    serde_json::json!({ "action": action.as_str() }),
                    meta,
                )
            })?;
            return Err(DmsError::permission_denied(action.as_str()));
        }

        if self.auth.verify_esignature(principal, credential).is_err() {
            self.db.transaction(|tx| {
                audit::record(
                    tx,
                    &principal.actor(),
                    AuditAction::ESignatureFailed,
                    "version",
                    version_id,
                    &format!("E-signature verification failed for {}", action.as_str()),
                    serde_json::json!({ "action": action.as_str() }),
                    meta,
                )
            })?;
            return Err(DmsError::ESignatureMismatch);
        }

        Ok(())
    }
}

fn gate_allows(gate: Gate, principal: &Principal, doc: &Document) -> bool {
    match gate {
        Gate::OwnerOrAdmin => identity::can_submit(principal, &doc.owner_id),
        Gate::Reviewer => identity::can_review(principal),
        Gate::Approver => identity::can_approve(principal),
        Gate::Publisher => identity::can_publish(principal),
        Gate::Archiver => identity::can_archive(principal),
    }
}

fn normalize_comment(comment: Option<&str>) -> Option<String> {
    comment
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

/// Set the status and the per-transition workflow stamps
fn apply_stamps(
    tx: &Transaction,
    version: &DocumentVersion,
    to: VersionStatus,
    action: LifecycleAction,
    principal_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let stamp_column = match action {
        LifecycleAction::Submit => Some(("submitted_at", "submitted_by")),
        LifecycleAction::ApproveReview | LifecycleAction::RequestChanges => {
            Some(("reviewed_at", "reviewed_by"))
        }
        LifecycleAction::Approve => Some(("approved_at", "approved_by")),
        LifecycleAction::Reject => Some(("rejected_at", "rejected_by")),
        LifecycleAction::Archive => Some(("archived_at", "archived_by")),
        LifecycleAction::Publish => None,
    };

    match stamp_column {
        Some((at_col, by_col)) => {
            let sql = format!(
                "UPDATE document_versions SET status = ?2, {} = ?3, {} = ?4, updated_at = ?3
                 WHERE id = ?1",
                at_col, by_col
            );
            tx.execute(
                &sql,
                params![version.id, to.as_str(), now.to_rfc3339(), principal_id],
            )?;
        }
        None => {
            tx.execute(
                "UPDATE document_versions SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![version.id, to.as_str(), now.to_rfc3339()],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditFilters, AuditTrail};
    use crate::document::{DocumentService, NewDocument};
    use crate::identity::test_support::seed_principal;
    use crate::identity::Role;
    use crate::security::CredentialHasher;

    struct Fixture {
        db: Database,
        lifecycle: LifecycleService,
        admin: Principal,
        author: Principal,
        reviewer: Principal,
        approver: Principal,
        document_id: String,
        version_id: String,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let admin = seed_principal(&db, "admin1", "password1", vec![Role::DmsAdmin]);
        let author = seed_principal(&db, "author1", "password1", vec![Role::Author]);
        let reviewer = seed_principal(&db, "rev1", "password1", vec![Role::Reviewer]);
        let approver = seed_principal(&db, "app1", "password1", vec![Role::Approver]);

        let documents = DocumentService::new(db.clone());
        let detail = documents
            .create(
                &admin,
                NewDocument {
                    title: "QC SOP".to_string(),
                    description: None,
                    department: "QUAL".to_string(),
                    tags: vec![],
                    document_number: None,
                    create_initial_draft: true,
                },
                &RequestMetadata::default(),
            )
            .unwrap();

        let auth = AuthService::new(db.clone(), CredentialHasher::new(1000), 60);
        Fixture {
            lifecycle: LifecycleService::new(db.clone(), auth),
            db,
            admin,
            author,
            reviewer,
            approver,
            document_id: detail.document.id.clone(),
            version_id: detail.versions[0].id.clone(),
        }
    }

    fn meta() -> RequestMetadata {
        RequestMetadata::default()
    }

    /// Drive the fixture version through the full workflow to Effective
    fn publish_first_version(f: &Fixture) -> DocumentVersion {
        f.lifecycle
            .submit(&f.admin, &f.version_id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve_review(&f.reviewer, &f.version_id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve(&f.approver, &f.version_id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .publish(&f.admin, &f.version_id, "password1", None, &meta())
            .unwrap()
    }

    #[test]
    fn test_full_first_version_lifecycle() {
        // The v0.1 draft ends as v1.0 Effective
        let f = fixture();
        let published = publish_first_version(&f);

        assert_eq!(published.status, VersionStatus::Effective);
        assert_eq!(published.version_string, "v1.0");
        assert!(published.effective_at.is_some());
        assert!(published.is_latest);

        let doc = DocumentService::new(f.db.clone()).get(&f.document_id).unwrap();
        assert_eq!(
            doc.document.current_version_id.as_deref(),
            Some(f.version_id.as_str())
        );

        // Four e-signed transition entries (submit, review, approve, publish)
        let trail = AuditTrail::new(f.db.clone());
        let entries = trail.list(&AuditFilters::with_limit(100, 0)).unwrap();
        let esigned: Vec<_> = entries.iter().filter(|e| e.esignature).collect();
        assert_eq!(esigned.len(), 4);
        for entry in &esigned {
            assert!(entry.description.contains("E-Signature:"));
        }
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let f = fixture();
        // Draft cannot be approved directly
        let result = f
            .lifecycle
            .approve(&f.approver, &f.version_id, "password1", None, &meta());
        assert!(matches!(result, Err(DmsError::IllegalTransition { .. })));

        // And publish demands Approved
        let result = f
            .lifecycle
            .publish(&f.admin, &f.version_id, "password1", None, &meta());
        assert!(matches!(result, Err(DmsError::IllegalTransition { .. })));
    }

    #[test]
    fn test_capability_gates() {
        let f = fixture();
        // A reviewer cannot submit someone else's draft
        let result = f
            .lifecycle
            .submit(&f.reviewer, &f.version_id, "password1", None, &meta());
        assert!(matches!(result, Err(DmsError::PermissionDenied { .. })));

        f.lifecycle
            .submit(&f.admin, &f.version_id, "password1", None, &meta())
            .unwrap();

        // An author cannot approve the review stage
        let result = f
            .lifecycle
            .approve_review(&f.author, &f.version_id, "password1", None, &meta());
        assert!(matches!(result, Err(DmsError::PermissionDenied { .. })));

        f.lifecycle
            .approve_review(&f.reviewer, &f.version_id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve(&f.approver, &f.version_id, "password1", None, &meta())
            .unwrap();

        // Only an admin may publish
        let result = f
            .lifecycle
            .publish(&f.approver, &f.version_id, "password1", None, &meta());
        assert!(matches!(result, Err(DmsError::PermissionDenied { .. })));
    }

    #[test]
    fn test_wrong_esignature_blocks_transition() {
        let f = fixture();
        f.lifecycle
            .submit(&f.admin, &f.version_id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve_review(&f.reviewer, &f.version_id, "password1", None, &meta())
            .unwrap();

        let result = f
            .lifecycle
            .approve(&f.approver, &f.version_id, "wrong-credential", None, &meta());
        assert!(matches!(result, Err(DmsError::ESignatureMismatch)));

        // Version remains Pending Approval, no VERSION_APPROVED entry, one
        // ESIGNATURE_FAILED entry
        let version = f
            .db
            .with_connection(|conn| version::require_version(conn, &f.version_id))
            .unwrap();
        assert_eq!(version.status, VersionStatus::PendingApproval);

        let trail = AuditTrail::new(f.db.clone());
        let mut filters = AuditFilters::with_limit(100, 0);
        filters.action = Some("VERSION_APPROVED".to_string());
        assert!(trail.list(&filters).unwrap().is_empty());

        let mut filters = AuditFilters::with_limit(100, 0);
        filters.action = Some("ESIGNATURE_FAILED".to_string());
        assert_eq!(trail.list(&filters).unwrap().len(), 1);
    }

    #[test]
    fn test_request_changes_requires_comment() {
        let f = fixture();
        f.lifecycle
            .submit(&f.admin, &f.version_id, "password1", None, &meta())
            .unwrap();

        let result =
            f.lifecycle
                .request_changes(&f.reviewer, &f.version_id, "password1", "  ", &meta());
        assert!(matches!(result, Err(DmsError::Validation { .. })));

        let back = f
            .lifecycle
            .request_changes(
                &f.reviewer,
                &f.version_id,
                "password1",
                "Step 4 is missing the hold time",
                &meta(),
            )
            .unwrap();
        assert_eq!(back.status, VersionStatus::Draft);
        // Rejection never renames or renumbers the draft
        assert_eq!(back.version_string, "v0.1");
        assert_eq!(back.version_number, 1);
    }

    #[test]
    fn test_reject_returns_to_draft_with_reason() {
        let f = fixture();
        f.lifecycle
            .submit(&f.admin, &f.version_id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve_review(&f.reviewer, &f.version_id, "password1", None, &meta())
            .unwrap();

        let back = f
            .lifecycle
            .reject(
                &f.approver,
                &f.version_id,
                "password1",
                "References the retired balance SOP",
                &meta(),
            )
            .unwrap();
        assert_eq!(back.status, VersionStatus::Draft);
        assert!(back.rejected_at.is_some());
        assert_eq!(back.rejected_by.as_deref(), Some(f.approver.id.as_str()));
    }

    #[test]
    fn test_minor_revision_obsoletes_predecessor() {
        let f = fixture();
        let v1 = publish_first_version(&f);

        let draft = f
            .lifecycle
            .create_next_version(
                &f.admin,
                &v1.id,
                ChangeType::Minor,
                "Typo fix in step 3",
                &meta(),
            )
            .unwrap();
        assert_eq!(draft.version_string, "v1.1");
        assert_eq!(draft.status, VersionStatus::Draft);
        assert_eq!(draft.parent_version_id.as_deref(), Some(v1.id.as_str()));
        assert_eq!(draft.content, v1.content);
        assert_eq!(draft.version_number, 2);

        f.lifecycle
            .submit(&f.admin, &draft.id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve_review(&f.reviewer, &draft.id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve(&f.approver, &draft.id, "password1", None, &meta())
            .unwrap();
        let published = f
            .lifecycle
            .publish(&f.admin, &draft.id, "password1", None, &meta())
            .unwrap();
        assert_eq!(published.version_string, "v1.1");
        assert_eq!(published.status, VersionStatus::Effective);

        let old = f
            .db
            .with_connection(|conn| version::require_version(conn, &v1.id))
            .unwrap();
        assert_eq!(old.status, VersionStatus::Obsolete);
        assert_eq!(old.replaced_by.as_deref(), Some(draft.id.as_str()));
        assert!(old.obsolete_at.is_some());
        assert!(!old.is_latest);

        // One VERSION_PUBLISHED entry names both versions
        let trail = AuditTrail::new(f.db.clone());
        let mut filters = AuditFilters::with_limit(100, 0);
        filters.action = Some("VERSION_PUBLISHED".to_string());
        filters.entity_id = Some(draft.id.clone());
        let entries = trail.list(&filters).unwrap();
        assert_eq!(entries.len(), 1);
        let obsoleted = entries[0].details["obsoleted"].as_array().unwrap();
        assert_eq!(obsoleted.len(), 1);
        assert_eq!(obsoleted[0]["id"], serde_json::json!(v1.id));
    }

    #[test]
    fn test_major_revision_bumps_major() {
        let f = fixture();
        let v1 = publish_first_version(&f);

        let draft = f
            .lifecycle
            .create_next_version(
                &f.admin,
                &v1.id,
                ChangeType::Major,
                "Process overhaul for new equipment line",
                &meta(),
            )
            .unwrap();
        assert_eq!(draft.version_string, "v2.0");
    }

    #[test]
    fn test_create_next_version_requires_effective_parent() {
        let f = fixture();
        // The draft itself is not a legal parent
        let result = f.lifecycle.create_next_version(
            &f.admin,
            &f.version_id,
            ChangeType::Minor,
            "Not applicable here",
            &meta(),
        );
        assert!(matches!(result, Err(DmsError::IllegalStatus { .. })));
    }

    #[test]
    fn test_create_next_version_rejects_second_draft() {
        let f = fixture();
        let v1 = publish_first_version(&f);
        f.lifecycle
            .create_next_version(&f.admin, &v1.id, ChangeType::Minor, "Typo fix in step 3", &meta())
            .unwrap();

        let result = f.lifecycle.create_next_version(
            &f.admin,
            &v1.id,
            ChangeType::Minor,
            "Second concurrent draft",
            &meta(),
        );
        assert!(matches!(result, Err(DmsError::AlreadyExists { .. })));
    }

    #[test]
    fn test_change_reason_boundaries_on_create() {
        // Length bounds are enforced at the operation level
        let f = fixture();
        let v1 = publish_first_version(&f);

        let result = f.lifecycle.create_next_version(
            &f.admin,
            &v1.id,
            ChangeType::Minor,
            &"x".repeat(9),
            &meta(),
        );
        assert!(matches!(result, Err(DmsError::Validation { .. })));

        let result = f.lifecycle.create_next_version(
            &f.admin,
            &v1.id,
            ChangeType::Minor,
            &"x".repeat(1001),
            &meta(),
        );
        assert!(matches!(result, Err(DmsError::Validation { .. })));

        assert!(f
            .lifecycle
            .create_next_version(&f.admin, &v1.id, ChangeType::Minor, &"x".repeat(10), &meta())
            .is_ok());
    }

    #[test]
    fn test_concurrent_sibling_publish_loses() {
        // Once a sibling has published, the other Approved
        // version's predecessor has moved and publish is illegal
        let f = fixture();
        let v1 = publish_first_version(&f);

        // First sibling goes all the way to Approved
        let a = f
            .lifecycle
            .create_next_version(&f.admin, &v1.id, ChangeType::Minor, "Sibling A change", &meta())
            .unwrap();
        f.lifecycle
            .submit(&f.admin, &a.id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve_review(&f.reviewer, &a.id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve(&f.approver, &a.id, "password1", None, &meta())
            .unwrap();

        // Second sibling (allowed: no Draft exists while A is in flight)
        let b = f
            .lifecycle
            .create_next_version(&f.admin, &v1.id, ChangeType::Minor, "Sibling B change", &meta())
            .unwrap();
        f.lifecycle
            .submit(&f.admin, &b.id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve_review(&f.reviewer, &b.id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve(&f.approver, &b.id, "password1", None, &meta())
            .unwrap();

        // A publishes first and wins
        f.lifecycle
            .publish(&f.admin, &a.id, "password1", None, &meta())
            .unwrap();

        // B's predecessor has moved
        let result = f
            .lifecycle
            .publish(&f.admin, &b.id, "password1", None, &meta());
        assert!(matches!(result, Err(DmsError::IllegalTransition { .. })));

        // Exactly one Effective version remains
        let versions = f
            .db
            .with_connection(|conn| version::list_versions(conn, &f.document_id))
            .unwrap();
        let effective: Vec<_> = versions
            .iter()
            .filter(|v| v.status == VersionStatus::Effective)
            .collect();
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].id, a.id);
    }

    #[test]
    fn test_archive_from_effective_and_obsolete() {
        let f = fixture();
        let v1 = publish_first_version(&f);

        // Supersede v1.0, then archive it from Obsolete
        let draft = f
            .lifecycle
            .create_next_version(&f.admin, &v1.id, ChangeType::Minor, "Routine revision", &meta())
            .unwrap();
        f.lifecycle
            .submit(&f.admin, &draft.id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve_review(&f.reviewer, &draft.id, "password1", None, &meta())
            .unwrap();
        f.lifecycle
            .approve(&f.approver, &draft.id, "password1", None, &meta())
            .unwrap();
        let v11 = f
            .lifecycle
            .publish(&f.admin, &draft.id, "password1", None, &meta())
            .unwrap();

        let archived_old = f
            .lifecycle
            .archive(&f.admin, &v1.id, "password1", &meta())
            .unwrap();
        assert_eq!(archived_old.status, VersionStatus::Archived);
        assert!(archived_old.archived_at.is_some());

        // And from Effective
        let archived_current = f
            .lifecycle
            .archive(&f.admin, &v11.id, "password1", &meta())
            .unwrap();
        assert_eq!(archived_current.status, VersionStatus::Archived);

        // Archive requires admin
        let f2 = fixture();
        let v1 = publish_first_version(&f2);
        let result = f2
            .lifecycle
            .archive(&f2.approver, &v1.id, "password1", &meta());
        assert!(matches!(result, Err(DmsError::PermissionDenied { .. })));
    }

    #[test]
    fn test_permission_denied_is_audited() {
        let f = fixture();
        let _ = f
            .lifecycle
            .submit(&f.reviewer, &f.version_id, "password1", None, &meta());

        let trail = AuditTrail::new(f.db.clone());
        let mut filters = AuditFilters::with_limit(100, 0);
        filters.action = Some("PERMISSION_DENIED".to_string());
        assert_eq!(trail.list(&filters).unwrap().len(), 1);
    }

    #[test]
    fn test_request_changes_blocked_when_second_draft_exists() {
        // Returning a version to Draft must never violate the single-draft
        // invariant
        let f = fixture();
        let v1 = publish_first_version(&f);

        // v1.1 goes under review, then a second revision v1.2 is drafted
        let a = f
            .lifecycle
            .create_next_version(&f.admin, &v1.id, ChangeType::Minor, "Sibling A change", &meta())
            .unwrap();
        f.lifecycle
            .submit(&f.admin, &a.id, "password1", None, &meta())
            .unwrap();
        let _b = f
            .lifecycle
            .create_next_version(&f.admin, &v1.id, ChangeType::Minor, "Sibling B change", &meta())
            .unwrap();

        let result = f.lifecycle.request_changes(
            &f.reviewer,
            &a.id,
            "password1",
            "Cannot return, a newer draft exists",
            &meta(),
        );
        assert!(matches!(result, Err(DmsError::InvariantViolation { .. })));
    }
}
