//! Periodic proactive check.
//!
//! Every interval the runner does two independent things: it reminds
//! assignees about their overdue tasks with a fixed template, and it asks a
//! throwaway agent session whether anything deserves the owner's attention.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use steward_config::Config;

use crate::gate::RecipientGate;
use crate::session::SessionManager;
use crate::task::{TaskRepository, TaskSummary};
use crate::text::{preview, truncate_with_ellipsis, unless_silent};
use crate::transport::{send_to_user, Transport};

const REMINDER_HEADER: &str = "⏰ Reminder about overdue tasks:";
const REMINDER_MAX_TASKS: usize = 3;
const BRIEFING_SECTION_LIMIT: usize = 5;
const BRIEFING_MARKER: &str = "💡";

const HEARTBEAT_PROMPT: &str = "\
This is a scheduled check-in that runs every {interval} minutes. Nobody asked you anything.

Review the task overview below and anything in your workspace that may need attention. \
Only speak up when there is something the owner should act on now: overdue work, a deadline \
coming up today, or a scheduled job worth preparing for. Keep it to a few short lines.

If nothing needs attention, reply with just: {marker}";

#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub silent_marker: String,
    pub max_length: usize,
}

impl HeartbeatSettings {
    /// `None` when the heartbeat is disabled (interval 0).
    pub fn from_config(config: &Config) -> Option<Self> {
        if config.heartbeat.interval_minutes == 0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs(config.heartbeat.interval_minutes.saturating_mul(60)),
            silent_marker: config.heartbeat.silent_marker.clone(),
            max_length: config.delivery.max_message_length,
        })
    }
}

/// What one check did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub reminders_sent: usize,
    pub reminders_denied: usize,
    pub reminders_failed: usize,
    /// The briefing text sent to the owner, if any.
    pub briefing: Option<String>,
}

struct HeartbeatInner {
    sessions: Arc<SessionManager>,
    tasks: Arc<dyn TaskRepository>,
    gate: Arc<dyn RecipientGate>,
    transport: Arc<dyn Transport>,
    settings: HeartbeatSettings,
}

pub struct HeartbeatRunner {
    inner: Arc<HeartbeatInner>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatRunner {
    pub fn new(
        sessions: Arc<SessionManager>,
        tasks: Arc<dyn TaskRepository>,
        gate: Arc<dyn RecipientGate>,
        transport: Arc<dyn Transport>,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            inner: Arc::new(HeartbeatInner {
                sessions,
                tasks,
                gate,
                transport,
                settings,
            }),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Start the background loop. The first check runs after one interval.
    pub fn start(&self) {
        let Ok(mut handle) = self.handle.lock() else {
            error!("Heartbeat handle lock poisoned");
            return;
        };
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let interval = inner.settings.interval;
        *handle = Some(tokio::spawn(async move {
            info!(
                "Heartbeat started (interval: {} min)",
                interval.as_secs() / 60
            );
            loop {
                tokio::time::sleep(interval).await;
                inner.check().await;
            }
        }));
    }

    /// Cancel the loop, including a pending sleep or an in-flight check,
    /// and wait until it has ended.
    pub async fn stop(&self) {
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("Heartbeat stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Run one check right now, outside the schedule.
    pub async fn trigger_now(&self) -> CheckReport {
        self.inner.check().await
    }
}

impl HeartbeatInner {
    async fn check(&self) -> CheckReport {
        debug!("Heartbeat check started");
        let now = Utc::now();
        let mut report = CheckReport::default();

        if let Err(e) = self.send_reminders(now, &mut report).await {
            error!("Heartbeat reminders failed: {e:#}");
        }
        match self.send_briefing(now).await {
            Ok(briefing) => report.briefing = briefing,
            Err(e) => error!("Heartbeat briefing failed: {e:#}"),
        }
        report
    }

    async fn send_reminders(&self, now: DateTime<Utc>, report: &mut CheckReport) -> Result<()> {
        let overdue = self.tasks.list_overdue(now).await?;
        if overdue.is_empty() {
            return Ok(());
        }
        info!("Found {} overdue tasks", overdue.len());

        let owner_id = self.sessions.owner_id();
        let mut by_assignee: BTreeMap<i64, Vec<&TaskSummary>> = BTreeMap::new();
        for task in &overdue {
            match task.assignee_id {
                Some(id) if id != owner_id => by_assignee.entry(id).or_default().push(task),
                _ => {}
            }
        }

        for (assignee, tasks) in by_assignee {
            let text = reminder_text(&tasks, now);
            match send_to_user(self.gate.as_ref(), self.transport.as_ref(), assignee, &text).await
            {
                Ok(decision) if decision.allowed => {
                    info!("Sent reminder to {assignee}: {} overdue tasks", tasks.len());
                    report.reminders_sent += 1;
                }
                Ok(decision) => {
                    debug!("Reminder to {assignee} skipped: {}", decision.reason);
                    report.reminders_denied += 1;
                }
                Err(e) => {
                    error!("Failed to send reminder to {assignee}: {e:#}");
                    report.reminders_failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn send_briefing(&self, now: DateTime<Utc>) -> Result<Option<String>> {
        let prompt = self.briefing_prompt(now).await?;

        let reply = {
            let session = self.sessions.create_heartbeat_session();
            session.query(&prompt).await
        };

        let Some(content) = unless_silent(&reply, Some(&self.settings.silent_marker)) else {
            debug!("Heartbeat: silent ({})", self.settings.silent_marker);
            return Ok(None);
        };

        let message = truncate_with_ellipsis(
            &format!("{BRIEFING_MARKER}\n{content}"),
            self.settings.max_length,
        );
        // Sent straight to the owner; briefings are not buffered into the
        // owner's session.
        self.transport
            .send(self.sessions.owner_id(), &message)
            .await?;
        info!("Heartbeat notification sent: {}", preview(&content, 80));
        Ok(Some(message))
    }

    async fn briefing_prompt(&self, now: DateTime<Utc>) -> Result<String> {
        let mut prompt = HEARTBEAT_PROMPT
            .replace("{interval}", &(self.settings.interval.as_secs() / 60).to_string())
            .replace("{marker}", &self.settings.silent_marker);

        let overdue = self.tasks.list_overdue(now).await?;
        let due_soon = self
            .tasks
            .list_due_soon(now, chrono::Duration::hours(24))
            .await?;
        let scheduled = self.tasks.list_scheduled().await?;

        let mut sections: Vec<String> = Vec::new();
        if !overdue.is_empty() {
            sections.push(format!("\n## Overdue tasks ({})", overdue.len()));
            for task in overdue.iter().take(BRIEFING_SECTION_LIMIT) {
                sections.push(format!(
                    "- [{}] {}: {} (overdue)",
                    task.id,
                    assignee_label(task),
                    clip(&task.title, 40)
                ));
            }
        }
        if !due_soon.is_empty() {
            sections.push(format!("\n## Due within 24 hours ({})", due_soon.len()));
            for task in due_soon.iter().take(BRIEFING_SECTION_LIMIT) {
                let time = task
                    .deadline
                    .map(|d| d.with_timezone(&Local).format("%H:%M").to_string())
                    .unwrap_or_else(|| "-".into());
                sections.push(format!(
                    "- [{}] {}: {} (deadline {time})",
                    task.id,
                    assignee_label(task),
                    clip(&task.title, 40)
                ));
            }
        }
        if !scheduled.is_empty() {
            sections.push(format!("\n## Scheduled tasks ({})", scheduled.len()));
            for task in scheduled.iter().take(BRIEFING_SECTION_LIMIT) {
                let when = task
                    .schedule_at
                    .map(|d| d.with_timezone(&Local).format("%d.%m %H:%M").to_string())
                    .unwrap_or_default();
                let repeat = task
                    .schedule_repeat
                    .map(|secs| format!(" (repeat: {secs}s)"))
                    .unwrap_or_default();
                sections.push(format!(
                    "- [{}] {when}{repeat}: {}",
                    task.id,
                    clip(&task.title, 40)
                ));
            }
        }

        if !sections.is_empty() {
            prompt.push('\n');
            prompt.push_str(&sections.join("\n"));
        }
        Ok(prompt)
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn assignee_label(task: &TaskSummary) -> String {
    match (&task.assignee_name, task.assignee_id) {
        (Some(name), _) => name.clone(),
        (None, Some(id)) => id.to_string(),
        (None, None) => "system".into(),
    }
}

/// Deterministic reminder: the first three tasks plus a count of the rest.
fn reminder_text(tasks: &[&TaskSummary], now: DateTime<Utc>) -> String {
    let lines: Vec<String> = tasks
        .iter()
        .take(REMINDER_MAX_TASKS)
        .map(|t| {
            format!(
                "• {} (overdue {} d)",
                clip(&t.title, 50),
                t.days_overdue(now)
            )
        })
        .collect();
    let mut text = format!("{REMINDER_HEADER}\n\n{}", lines.join("\n"));
    if tasks.len() > REMINDER_MAX_TASKS {
        text.push_str(&format!(
            "\n\n...and {} more",
            tasks.len() - REMINDER_MAX_TASKS
        ));
    }
    text
}
