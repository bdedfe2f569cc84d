//! Read-only view of the task store.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" | "inprogress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Task,
    Scheduled,
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::Task => "task",
            TaskKind::Scheduled => "scheduled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "task" => Some(Self::Task),
            "scheduled" => Some(Self::Scheduled),
            _ => None,
        }
    }
}

/// Aggregate fields the orchestration layer reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub kind: TaskKind,
    pub assignee_id: Option<i64>,
    pub assignee_name: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub schedule_at: Option<DateTime<Utc>>,
    /// Repeat interval in seconds for scheduled tasks.
    pub schedule_repeat: Option<i64>,
}

impl TaskSummary {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && self.deadline.is_some_and(|d| d < now)
    }

    /// Whole days past the deadline, 0 when not overdue.
    pub fn days_overdue(&self, now: DateTime<Utc>) -> i64 {
        match self.deadline {
            Some(d) if d < now => (now - d).num_days(),
            _ => 0,
        }
    }

    pub fn is_due_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.status.is_open() && self.deadline.is_some_and(|d| d >= now && d <= now + window)
    }
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Open tasks whose deadline has passed, oldest deadline first.
    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<TaskSummary>>;

    /// Open tasks due in `[now, now + window]`, soonest first.
    async fn list_due_soon(&self, now: DateTime<Utc>, window: Duration)
        -> Result<Vec<TaskSummary>>;

    /// Open scheduled tasks with a next run time, soonest first.
    async fn list_scheduled(&self) -> Result<Vec<TaskSummary>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: TaskStatus, deadline: Option<DateTime<Utc>>) -> TaskSummary {
        TaskSummary {
            id: "t1".into(),
            title: "Report".into(),
            status,
            kind: TaskKind::Task,
            assignee_id: Some(5),
            assignee_name: None,
            deadline,
            schedule_at: None,
            schedule_repeat: None,
        }
    }

    #[test]
    fn overdue_requires_open_status_and_past_deadline() {
        let now = Utc::now();
        let past = Some(now - Duration::days(3));
        assert!(task(TaskStatus::Pending, past).is_overdue(now));
        assert!(task(TaskStatus::InProgress, past).is_overdue(now));
        assert!(!task(TaskStatus::Done, past).is_overdue(now));
        assert!(!task(TaskStatus::Cancelled, past).is_overdue(now));
        assert!(!task(TaskStatus::Pending, None).is_overdue(now));
        assert!(!task(TaskStatus::Pending, Some(now + Duration::hours(1))).is_overdue(now));
    }

    #[test]
    fn days_overdue_counts_whole_days() {
        let now = Utc::now();
        assert_eq!(task(TaskStatus::Pending, Some(now - Duration::hours(50))).days_overdue(now), 2);
        assert_eq!(task(TaskStatus::Pending, Some(now + Duration::hours(5))).days_overdue(now), 0);
    }

    #[test]
    fn due_window_is_inclusive() {
        let now = Utc::now();
        let t = task(TaskStatus::Pending, Some(now + Duration::hours(24)));
        assert!(t.is_due_within(now, Duration::hours(24)));
        assert!(!t.is_due_within(now, Duration::hours(23)));
    }

    #[test]
    fn status_parsing() {
        assert_eq!(TaskStatus::from_str("in-progress"), Some(TaskStatus::InProgress));
        assert_eq!(TaskStatus::from_str("Canceled"), Some(TaskStatus::Cancelled));
        assert_eq!(TaskStatus::from_str("bogus"), None);
    }
}
