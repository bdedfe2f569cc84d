//! SQLite-backed contact directory and task repository.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::identity::{display_name, ExternalUser, IdentityDirectory, Recipient};
use crate::scheduler::ScheduleStore;
use crate::task::{TaskKind, TaskRepository, TaskStatus, TaskSummary};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    telegram_id INTEGER PRIMARY KEY,
    username TEXT,
    first_name TEXT,
    last_name TEXT,
    first_contact TEXT NOT NULL,
    last_contact TEXT NOT NULL,
    is_banned INTEGER NOT NULL DEFAULT 0,
    is_whitelisted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    kind TEXT NOT NULL DEFAULT 'task',
    created_by INTEGER,
    assignee_id INTEGER,
    deadline TEXT,
    schedule_at TEXT,
    schedule_repeat INTEGER,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assignee_id);
";

const TASK_COLUMNS: &str = "t.id, t.title, t.status, t.kind, t.assignee_id, t.deadline, \
     t.schedule_at, t.schedule_repeat, u.username, u.first_name, u.last_name";

/// Input for [`Store::insert_task`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub created_by: Option<i64>,
    pub assignee_id: Option<i64>,
    pub deadline: Option<DateTime<Utc>>,
    pub kind: TaskKind,
    pub schedule_at: Option<DateTime<Utc>>,
    pub schedule_repeat: Option<i64>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open store '{}'", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {e}"))
    }

    /// Add a task. Tasks are normally written by agent tools; this exists for
    /// the CLI and fixtures.
    pub fn insert_task(&self, task: &NewTask) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO tasks (id, title, status, kind, created_by, assignee_id, deadline, schedule_at, schedule_repeat, created_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                task.title,
                task.kind.as_str(),
                task.created_by,
                task.assignee_id,
                task.deadline.map(|d| d.to_rfc3339()),
                task.schedule_at.map(|d| d.to_rfc3339()),
                task.schedule_repeat,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    pub fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    /// Move a scheduled task's next run.
    pub fn reschedule_task(&self, id: &str, next: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET schedule_at = ?1 WHERE id = ?2",
            params![next.to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    /// Pending and in-progress tasks.
    pub fn open_tasks(&self) -> Result<Vec<TaskSummary>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t LEFT JOIN users u ON u.telegram_id = t.assignee_id
             WHERE t.status IN ('pending', 'in_progress')"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    fn load_user(conn: &Connection, id: i64) -> Result<Option<ExternalUser>> {
        let user = conn
            .query_row(
                "SELECT telegram_id, username, first_name, last_name, first_contact, last_contact, is_banned, is_whitelisted
                 FROM users WHERE telegram_id = ?1",
                params![id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    fn update_flag(&self, column: &str, id: i64, value: bool) -> Result<()> {
        let conn = self.lock_conn()?;
        let now = Utc::now().to_rfc3339();
        // Flags can be set before the user ever writes to the bot.
        conn.execute(
            "INSERT OR IGNORE INTO users (telegram_id, first_contact, last_contact) VALUES (?1, ?2, ?2)",
            params![id, now],
        )?;
        conn.execute(
            &format!("UPDATE users SET {column} = ?1 WHERE telegram_id = ?2"),
            params![value, id],
        )?;
        Ok(())
    }
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskSummary> {
    let status: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let assignee_id: Option<i64> = row.get(4)?;
    let username: Option<String> = row.get(8)?;
    let first_name: Option<String> = row.get(9)?;
    let last_name: Option<String> = row.get(10)?;
    Ok(TaskSummary {
        id: row.get(0)?,
        title: row.get(1)?,
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending),
        kind: TaskKind::from_str(&kind).unwrap_or_default(),
        assignee_id,
        assignee_name: assignee_id.map(|id| {
            display_name(
                id,
                username.as_deref(),
                first_name.as_deref(),
                last_name.as_deref(),
            )
        }),
        deadline: parse_time(row.get(5)?),
        schedule_at: parse_time(row.get(6)?),
        schedule_repeat: row.get(7)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<ExternalUser> {
    Ok(ExternalUser {
        telegram_id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        first_contact: parse_time(row.get(4)?).unwrap_or_else(Utc::now),
        last_contact: parse_time(row.get(5)?).unwrap_or_else(Utc::now),
        is_banned: row.get(6)?,
        is_whitelisted: row.get(7)?,
    })
}

#[async_trait]
impl IdentityDirectory for Store {
    async fn get_user(&self, id: i64) -> Result<Option<ExternalUser>> {
        let conn = self.lock_conn()?;
        Self::load_user(&conn, id)
    }

    async fn record_contact(&self, recipient: &Recipient) -> Result<ExternalUser> {
        let conn = self.lock_conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO users (telegram_id, username, first_name, last_name, first_contact, last_contact)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(telegram_id) DO UPDATE SET
                username = COALESCE(excluded.username, users.username),
                first_name = COALESCE(excluded.first_name, users.first_name),
                last_name = COALESCE(excluded.last_name, users.last_name),
                last_contact = excluded.last_contact",
            params![
                recipient.id,
                recipient.username,
                recipient.first_name,
                recipient.last_name,
                now,
            ],
        )?;
        Self::load_user(&conn, recipient.id)?
            .ok_or_else(|| anyhow::anyhow!("user {} vanished after upsert", recipient.id))
    }

    async fn set_whitelisted(&self, id: i64, whitelisted: bool) -> Result<()> {
        self.update_flag("is_whitelisted", id, whitelisted)
    }

    async fn set_banned(&self, id: i64, banned: bool) -> Result<()> {
        self.update_flag("is_banned", id, banned)
    }

    async fn list_users(&self) -> Result<Vec<ExternalUser>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT telegram_id, username, first_name, last_name, first_contact, last_contact, is_banned, is_whitelisted
             FROM users ORDER BY last_contact DESC",
        )?;
        let rows = stmt.query_map([], user_from_row)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

#[async_trait]
impl TaskRepository for Store {
    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<TaskSummary>> {
        let mut tasks: Vec<TaskSummary> = self
            .open_tasks()?
            .into_iter()
            .filter(|t| t.is_overdue(now))
            .collect();
        tasks.sort_by_key(|t| t.deadline);
        Ok(tasks)
    }

    async fn list_due_soon(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<TaskSummary>> {
        let mut tasks: Vec<TaskSummary> = self
            .open_tasks()?
            .into_iter()
            .filter(|t| t.is_due_within(now, window))
            .collect();
        tasks.sort_by_key(|t| t.deadline);
        Ok(tasks)
    }

    async fn list_scheduled(&self) -> Result<Vec<TaskSummary>> {
        let mut tasks: Vec<TaskSummary> = self
            .open_tasks()?
            .into_iter()
            .filter(|t| t.kind == TaskKind::Scheduled && t.schedule_at.is_some())
            .collect();
        tasks.sort_by_key(|t| t.schedule_at);
        Ok(tasks)
    }
}

#[async_trait]
impl ScheduleStore for Store {
    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<TaskSummary>> {
        Ok(self
            .list_scheduled()
            .await?
            .into_iter()
            .filter(|t| t.schedule_at.is_some_and(|at| at <= now))
            .collect())
    }

    async fn advance(&self, id: &str, next: DateTime<Utc>) -> Result<()> {
        self.reschedule_task(id, next)?;
        Ok(())
    }

    async fn finish(&self, id: &str) -> Result<()> {
        self.set_task_status(id, TaskStatus::Done)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(title: &str, assignee: Option<i64>, deadline: Option<DateTime<Utc>>) -> NewTask {
        NewTask {
            title: title.into(),
            assignee_id: assignee,
            deadline,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn record_contact_upserts_and_keeps_flags() {
        let store = Store::open_in_memory().unwrap();
        let first = store
            .record_contact(&Recipient::user(10).with_names(Some("ann".into()), None, None))
            .await
            .unwrap();
        assert_eq!(first.display_name(), "@ann");
        assert!(!first.is_whitelisted);

        store.set_whitelisted(10, true).await.unwrap();
        let again = store
            .record_contact(&Recipient::user(10).with_names(None, Some("Ann".into()), None))
            .await
            .unwrap();
        assert!(again.is_whitelisted);
        assert_eq!(again.username.as_deref(), Some("ann"));
        assert_eq!(again.display_name(), "Ann");
        assert_eq!(again.first_contact, first.first_contact);
    }

    #[tokio::test]
    async fn ban_unknown_user_creates_record() {
        let store = Store::open_in_memory().unwrap();
        store.set_banned(99, true).await.unwrap();
        let user = store.get_user(99).await.unwrap().unwrap();
        assert!(user.is_banned);
        assert!(store.get_user(100).await.unwrap().is_none());
        assert_eq!(store.list_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overdue_excludes_closed_and_future_tasks() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .record_contact(&Recipient::user(7).with_names(None, Some("Bob".into()), None))
            .await
            .unwrap();
        let late = store
            .insert_task(&task("late", Some(7), Some(now - Duration::days(2))))
            .unwrap();
        let closed = store
            .insert_task(&task("closed", Some(7), Some(now - Duration::days(1))))
            .unwrap();
        store.set_task_status(&closed, TaskStatus::Done).unwrap();
        store
            .insert_task(&task("future", Some(7), Some(now + Duration::hours(3))))
            .unwrap();

        let overdue = store.list_overdue(now).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, late);
        assert_eq!(overdue[0].assignee_name.as_deref(), Some("Bob"));

        let soon = store.list_due_soon(now, Duration::hours(24)).await.unwrap();
        assert_eq!(soon.len(), 1);
        assert_eq!(soon[0].title, "future");
    }

    #[tokio::test]
    async fn scheduled_sorted_by_next_run() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        for (title, hours) in [("later", 5), ("sooner", 1)] {
            store
                .insert_task(&NewTask {
                    title: title.into(),
                    kind: TaskKind::Scheduled,
                    schedule_at: Some(now + Duration::hours(hours)),
                    schedule_repeat: Some(86_400),
                    ..Default::default()
                })
                .unwrap();
        }
        store.insert_task(&task("plain", None, None)).unwrap();

        let scheduled = store.list_scheduled().await.unwrap();
        let titles: Vec<&str> = scheduled.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["sooner", "later"]);
        assert_eq!(scheduled[0].schedule_repeat, Some(86_400));
    }

    #[tokio::test]
    async fn due_jobs_skip_future_and_finished_runs() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let mut ids = Vec::new();
        for (title, minutes) in [("due", -5), ("future", 30), ("done", -10)] {
            ids.push(
                store
                    .insert_task(&NewTask {
                        title: title.into(),
                        kind: TaskKind::Scheduled,
                        schedule_at: Some(now + Duration::minutes(minutes)),
                        ..Default::default()
                    })
                    .unwrap(),
            );
        }
        store.finish(&ids[2]).await.unwrap();

        let due = store.due_jobs(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].title, "due");

        store.advance(&ids[0], now + Duration::hours(1)).await.unwrap();
        assert!(store.due_jobs(now).await.unwrap().is_empty());
    }

    #[test]
    fn open_on_disk_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("nested").join("db.sqlite")).unwrap();
        assert!(store.insert_task(&task("x", None, None)).is_ok());
    }
}
