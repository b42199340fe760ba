use crate::comment;
use crate::database::Database;
use crate::identity::{self, Principal};
use crate::version::VersionStatus;
use crate::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// What the principal is being asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    ReviseDraft,
    Review,
    Approve,
    Publish,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ReviseDraft => "Revise Draft",
            TaskType::Review => "Review",
            TaskType::Approve => "Approve",
            TaskType::Publish => "Publish",
        }
    }
}

/// Derived urgency; never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// One actionable item in a principal's queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTask {
    pub document_id: String,
    pub document_number: String,
    pub title: String,
    pub version_id: String,
    pub version_string: String,
    pub task_type: TaskType,
    pub priority: Priority,
}

/// Projects current version states into each principal's actionable queue.
/// Always derived on read; nothing here is stored denormalized.
#[derive(Clone)]
pub struct TaskService {
    db: Database,
}

impl TaskService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn pending_tasks(&self, principal: &Principal) -> Result<Vec<PendingTask>> {
        self.db.with_connection(|conn| {
            let mut tasks = Vec::new();

            // Drafts come back to their owning author; unresolved review
            // comments raise the urgency
            for row in versions_in_status(conn, VersionStatus::Draft)? {
                if !identity::can_edit_draft(principal, &row.owner_id)
                    || row.owner_id != principal.id
                {
                    continue;
                }
                let unresolved = comment::unresolved_count(conn, &row.version_id)?;
                tasks.push(row.into_task(
                    TaskType::ReviseDraft,
                    if unresolved > 0 {
                        Priority::High
                    } else {
                        Priority::Low
                    },
                ));
            }

            if identity::can_review(principal) {
                for row in versions_in_status(conn, VersionStatus::UnderReview)? {
                    tasks.push(row.into_task(TaskType::Review, Priority::High));
                }
            }

            if identity::can_approve(principal) {
                for row in versions_in_status(conn, VersionStatus::PendingApproval)? {
                    tasks.push(row.into_task(TaskType::Approve, Priority::High));
                }
            }

            if identity::can_publish(principal) {
                for row in versions_in_status(conn, VersionStatus::Approved)? {
                    tasks.push(row.into_task(TaskType::Publish, Priority::Medium));
                }
            }

            tasks.sort_by(|a, b| {
                a.priority
                    .rank()
                    .cmp(&b.priority.rank())
                    .then_with(|| a.document_number.cmp(&b.document_number))
            });
            Ok(tasks)
        })
    }
}

struct TaskRow {
    document_id: String,
    document_number: String,
    title: String,
    owner_id: String,
    version_id: String,
    version_string: String,
}

impl TaskRow {
    fn into_task(self, task_type: TaskType, priority: Priority) -> PendingTask {
        PendingTask {
            document_id: self.document_id,
            document_number: self.document_number,
            title: self.title,
            version_id: self.version_id,
            version_string: self.version_string,
            task_type,
            priority,
        }
    }
}

fn versions_in_status(conn: &Connection, status: VersionStatus) -> Result<Vec<TaskRow>> {
    let mut stmt = conn.prepare(
        "SELECT d.id, d.document_number, d.title, d.owner_id, v.id, v.version_string
         FROM document_versions v
         JOIN documents d ON d.id = v.document_id
         WHERE v.status = ?1 AND d.is_deleted = 0
         ORDER BY d.document_number",
    )?;
    let rows = stmt.query_map(params![status.as_str()], |row| {
        Ok(TaskRow {
            document_id: row.get(0)?,
            document_number: row.get(1)?,
            title: row.get(2)?,
            owner_id: row.get(3)?,
            version_id: row.get(4)?,
            version_string: row.get(5)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
