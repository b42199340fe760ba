use crate::attachment::AttachmentService;
use crate::audit::AuditTrail;
use crate::comment::CommentService;
use crate::config::Config;
use crate::database::Database;
use crate::document::DocumentService;
use crate::export::{DocxRenderer, ExportService, WordHtmlRenderer};
use crate::identity::PrincipalService;
use crate::lifecycle::LifecycleService;
use crate::lock::LockCoordinator;
use crate::security::CredentialHasher;
use crate::session::AuthService;
use crate::tasks::TaskService;
use crate::version::VersionService;
use crate::Result;
use std::sync::Arc;

/// The orchestrator: one handle wiring every subsystem over a shared
/// database. Each operation runs its capability check, transaction, and
/// audit write inside the owning service; this facade only assembles them.
///
/// The store is the sole source of truth; no service caches mutable version
/// state across requests.
#[derive(Clone)]
pub struct Dms {
    pub db: Database,
    pub principals: PrincipalService,
    pub auth: AuthService,
    pub documents: DocumentService,
    pub versions: VersionService,
    pub lifecycle: LifecycleService,
    pub locks: LockCoordinator,
    pub comments: CommentService,
    pub attachments: AttachmentService,
    pub export: ExportService,
    pub tasks: TaskService,
    pub audit: AuditTrail,
}

impl Dms {
    /// Open the control plane against the configured database with the
    /// built-in export renderer
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_renderer(config, Arc::new(WordHtmlRenderer))
    }

    /// Open the control plane with a custom export renderer
    pub fn with_renderer(config: &Config, renderer: Arc<dyn DocxRenderer>) -> Result<Self> {
        let db = Database::new(config.database.clone())?;
        let hasher = CredentialHasher::new(config.security.pbkdf2_iterations);

        let auth = AuthService::new(db.clone(), hasher, config.security.session_timeout_minutes);
        Ok(Self {
            principals: PrincipalService::new(
                db.clone(),
                hasher,
                config.security.min_password_length,
            ),
            documents: DocumentService::new(db.clone()),
            versions: VersionService::new(db.clone(), config.editing.autosave_audit_interval),
            lifecycle: LifecycleService::new(db.clone(), auth.clone()),
            locks: LockCoordinator::new(
                db.clone(),
                config.editing.default_lock_minutes,
                config.editing.max_lock_minutes,
            ),
            comments: CommentService::new(db.clone()),
            attachments: AttachmentService::new(
                db.clone(),
                config.storage.attachment_directory.clone(),
            ),
            export: ExportService::new(
                db.clone(),
                renderer,
                config.application.organization_name.clone(),
            ),
            tasks: TaskService::new(db.clone()),
            audit: AuditTrail::new(db.clone()),
            auth,
            db,
        })
    }

    /// In-memory instance for tests and self-checks
    pub fn open_in_memory() -> Result<Self> {
        let mut config = Config::default();
        config.database.url = ":memory:".to_string();
        config.database.wal_mode = false;
        config.security.pbkdf2_iterations = 1000;
        config.storage.attachment_directory = std::env::temp_dir()
            .join(format!("dmsrs-attachments-{}", uuid::Uuid::new_v4()))
            .display()
            .to_string();
        Self::new(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_wires_services() {
        let dms = Dms::open_in_memory().unwrap();

        let admin = dms
            .principals
            .bootstrap_admin("root", "bootstrap-secret")
            .unwrap();
        assert!(admin.is_admin());

        // The same store backs every service
        let session = dms
            .auth
            .login("root", "bootstrap-secret", false, &Default::default())
            .unwrap();
        let resolved = dms.auth.authenticate(&session.token).unwrap();
        assert_eq!(resolved.id, admin.id);

        assert!(dms.tasks.pending_tasks(&admin).unwrap().is_empty());
        assert!(dms.audit.count().unwrap() >= 2); // bootstrap + login
    }
}
