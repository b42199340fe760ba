use crate::{config::DatabaseConfig, DmsError, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle to the persistent store.
///
/// SQLite is a single-writer store; every service clones this handle and all
/// access funnels through one guarded connection. Each mutating operation
/// runs inside one transaction so the audit entry and the mutation that
/// caused it commit or roll back together.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    config: DatabaseConfig,
}

impl Database {
    /// Open (or create) the database and initialize the schema
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let connection = if config.url == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.url).parent() {
                std::fs::create_dir_all(parent).map_err(|e| DmsError::FileSystem {
                    path: parent.display().to_string(),
                    message: format!("Failed to create database directory: {}", e),
                })?;
            }
            Connection::open(&config.url)?
        };

        if config.wal_mode && config.url != ":memory:" {
            connection.pragma_update(None, "journal_mode", "WAL")?;
        }
        connection.pragma_update(None, "foreign_keys", "ON")?;
        connection.pragma_update(None, "synchronous", "FULL")?;
        connection.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(connection)),
            config,
        };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Open an isolated in-memory database (tests, API self-checks)
    pub fn open_in_memory() -> Result<Self> {
        Self::new(DatabaseConfig {
            url: ":memory:".to_string(),
            wal_mode: false,
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DmsError::Database {
            message: "connection mutex poisoned".to_string(),
        })
    }

    /// Run a read-only closure against the connection
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run a closure inside one immediate transaction. Writes are visible
    /// only on commit; any error rolls the whole transaction back.
    ///
    /// Transient lock contention is retried exactly once with identical
    /// inputs; all writes are idempotent within the same transaction.
    pub fn transaction<T>(&self, mut f: impl FnMut(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        match Self::run_once(&mut conn, &mut f) {
            Err(e) if is_transient(&e) => {
                tracing::warn!(error = %e, "transient store error, retrying transaction once");
                Self::run_once(&mut conn, &mut f)
            }
            other => other,
        }
    }

    fn run_once<T>(
        conn: &mut Connection,
        f: &mut impl FnMut(&Transaction) -> Result<T>,
    ) -> Result<T> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Create a database backup at the given path
    pub fn create_backup(&self, backup_path: &str) -> Result<()> {
        let conn = self.lock()?;
        let mut backup_conn = Connection::open(backup_path)?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut backup_conn)?;
        backup.run_to_completion(5, std::time::Duration::from_millis(250), None)?;
        Ok(())
    }
}

fn is_transient(err: &DmsError) -> bool {
    match err {
        DmsError::Database { message } => {
            message.contains("database is locked") || message.contains("database is busy")
        }
        _ => false,
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS principals (
    id TEXT PRIMARY KEY,
    username TEXT UNIQUE NOT NULL,
    password_hash TEXT NOT NULL,
    salt TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    active_session_token TEXT,
    session_last_activity TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS role_assignments (
    principal_id TEXT NOT NULL,
    role TEXT NOT NULL,
    PRIMARY KEY (principal_id, role),
    FOREIGN KEY (principal_id) REFERENCES principals(id)
);

CREATE TABLE IF NOT EXISTS sessions (
    token TEXT PRIMARY KEY,
    principal_id TEXT NOT NULL,
    username TEXT NOT NULL,
    roles_snapshot TEXT NOT NULL,
    issued_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY (principal_id) REFERENCES principals(id)
);

CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    document_number TEXT UNIQUE NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    department TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    owner_id TEXT NOT NULL,
    current_version_id TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (owner_id) REFERENCES principals(id)
);

CREATE TABLE IF NOT EXISTS document_number_counters (
    department TEXT NOT NULL,
    day TEXT NOT NULL,
    counter INTEGER NOT NULL,
    PRIMARY KEY (department, day)
);

CREATE TABLE IF NOT EXISTS document_versions (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL,
    version_number INTEGER NOT NULL,
    version_string TEXT NOT NULL,
    status TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    content_hash TEXT NOT NULL,
    change_summary TEXT,
    change_type TEXT,
    change_reason TEXT,
    parent_version_id TEXT,
    is_latest INTEGER NOT NULL DEFAULT 0,
    replaced_by TEXT,
    lock_version INTEGER NOT NULL DEFAULT 0,
    autosaves_since_manual INTEGER NOT NULL DEFAULT 0,
    effective_at TEXT,
    obsolete_at TEXT,
    submitted_at TEXT,
    submitted_by TEXT,
    reviewed_at TEXT,
    reviewed_by TEXT,
    approved_at TEXT,
    approved_by TEXT,
    rejected_at TEXT,
    rejected_by TEXT,
    published_by TEXT,
    archived_at TEXT,
    archived_by TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (document_id, version_number),
    FOREIGN KEY (document_id) REFERENCES documents(id)
);

CREATE TABLE IF NOT EXISTS edit_locks (
    version_id TEXT PRIMARY KEY,
    lock_token TEXT NOT NULL,
    holder_id TEXT NOT NULL,
    holder_username TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL,
    session_tag TEXT,
    FOREIGN KEY (version_id) REFERENCES document_versions(id)
);

CREATE TABLE IF NOT EXISTS comments (
    id TEXT PRIMARY KEY,
    version_id TEXT NOT NULL,
    author_id TEXT NOT NULL,
    author_username TEXT NOT NULL,
    body TEXT NOT NULL,
    selected_text TEXT NOT NULL,
    start_offset INTEGER,
    end_offset INTEGER,
    context_snippet TEXT,
    is_resolved INTEGER NOT NULL DEFAULT 0,
    resolved_by TEXT,
    resolved_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (version_id) REFERENCES document_versions(id)
);

CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    mime_type TEXT NOT NULL,
    uploaded_by TEXT NOT NULL,
    document_id TEXT,
    version_id TEXT,
    description TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    CHECK ((document_id IS NULL) <> (version_id IS NULL))
);

CREATE TABLE IF NOT EXISTS audit_entries (
    id TEXT PRIMARY KEY,
    principal_id TEXT NOT NULL,
    username TEXT NOT NULL,
    action TEXT NOT NULL,
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    description TEXT NOT NULL,
    details TEXT NOT NULL,
    ip_address TEXT,
    user_agent TEXT,
    esignature INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_entries_created_at ON audit_entries(created_at);
CREATE INDEX IF NOT EXISTS idx_audit_entries_principal ON audit_entries(principal_id);
CREATE INDEX IF NOT EXISTS idx_audit_entries_entity ON audit_entries(entity_kind, entity_id);
CREATE INDEX IF NOT EXISTS idx_versions_document ON document_versions(document_id);
CREATE INDEX IF NOT EXISTS idx_versions_status ON document_versions(status);
CREATE INDEX IF NOT EXISTS idx_comments_version ON comments(version_id);
CREATE INDEX IF NOT EXISTS idx_attachments_document ON attachments(document_id);
CREATE INDEX IF NOT EXISTS idx_attachments_version ON attachments(version_id);
";

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    #[test]
    fn test_database_initialization() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn test_schema_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        // Re-running the schema must not fail on an initialized store
        assert!(db.initialize_schema().is_ok());
    }

    #[test]
    fn test_transaction_commits() {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|tx| {
            tx.execute(
                "INSERT INTO document_number_counters (department, day, counter) VALUES (?1, ?2, ?3)",
                params!["QUAL", "20260801", 1],
            )?;
            Ok(())
        })
        .unwrap();

        let counter: i64 = db
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT counter FROM document_number_counters WHERE department = 'QUAL'",
                    [],
                    |row| row.get(0),
                )
                .map_err(Into::into)
            })
            .unwrap();
        assert_eq!(counter, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO document_number_counters (department, day, counter) VALUES (?1, ?2, ?3)",
                params!["QUAL", "20260801", 1],
            )?;
            Err(DmsError::validation("counter", "forced failure"))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_connection(|conn| {
                conn.query_row("SELECT COUNT(*) FROM document_number_counters", [], |row| {
                    row.get(0)
                })
                .map_err(Into::into)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_attachment_parent_exclusivity() {
        // CHECK constraint: an attachment is owned by a document or a
        // version, never both and never neither
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO attachments (id, filename, sha256, size_bytes, mime_type,
                 uploaded_by, document_id, version_id, created_at)
                 VALUES ('a1', 'f.pdf', 'h', 1, 'application/pdf', 'u1', 'd1', 'v1', 'now')",
                [],
            )?;
            Ok(())
        });
        assert!(result.is_err());
    }
}
