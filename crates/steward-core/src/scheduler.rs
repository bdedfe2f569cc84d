//! Runs scheduled tasks through the trigger executor.
//!
//! Each poll picks up scheduled tasks whose run time has passed, executes
//! them as background triggers, then moves repeating tasks to their next
//! run and closes one-shot tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use steward_config::Config;

use crate::task::TaskSummary;
use crate::trigger::{TriggerEvent, TriggerExecutor};

const SCHEDULED_PROMPT: &str = "\
Scheduled task \"{title}\" is due now. Carry it out and report the result to the owner \
in a few short lines.";

/// Where scheduled tasks are read from and written back to.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Open scheduled tasks whose run time is at or before `now`.
    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<TaskSummary>>;

    async fn advance(&self, id: &str, next: DateTime<Utc>) -> Result<()>;

    /// Close a task that will not run again.
    async fn finish(&self, id: &str) -> Result<()>;
}

/// What one poll did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub ran: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Next run strictly after `now`, keeping the original phase.
///
/// `None` for one-shot tasks and for repeats that would overflow.
pub fn next_run(
    at: DateTime<Utc>,
    repeat_secs: Option<i64>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let secs = repeat_secs.filter(|s| *s > 0)?;
    let elapsed = (now - at).num_seconds().max(0);
    let steps = elapsed / secs + 1;
    let offset = chrono::Duration::try_seconds(secs.checked_mul(steps)?)?;
    at.checked_add_signed(offset)
}

struct SchedulerInner {
    store: Arc<dyn ScheduleStore>,
    executor: Arc<TriggerExecutor>,
    poll: Duration,
}

pub struct SchedulerRunner {
    inner: Arc<SchedulerInner>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerRunner {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        executor: Arc<TriggerExecutor>,
        poll: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                executor,
                poll,
            }),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Poll interval from config, `None` when the scheduler is disabled.
    pub fn poll_from_config(config: &Config) -> Option<Duration> {
        match config.triggers.scheduler_poll_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Start polling. The first poll runs immediately.
    pub fn start(&self) {
        let Ok(mut handle) = self.handle.lock() else {
            error!("Scheduler handle lock poisoned");
            return;
        };
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *handle = Some(tokio::spawn(async move {
            info!("Scheduler started (poll: {}s)", inner.poll.as_secs());
            loop {
                inner.run_due(Utc::now()).await;
                tokio::time::sleep(inner.poll).await;
            }
        }));
    }

    pub async fn stop(&self) {
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("Scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Run every task due at `now`.
    pub async fn run_due(&self, now: DateTime<Utc>) -> ScheduleReport {
        self.inner.run_due(now).await
    }
}

impl SchedulerInner {
    async fn run_due(&self, now: DateTime<Utc>) -> ScheduleReport {
        let mut report = ScheduleReport::default();
        let due = match self.store.due_jobs(now).await {
            Ok(due) => due,
            Err(e) => {
                error!("Scheduler could not read tasks: {e:#}");
                return report;
            }
        };
        if due.is_empty() {
            return report;
        }
        debug!("Scheduler: {} tasks due", due.len());

        for task in &due {
            report.ran += 1;
            let event = TriggerEvent::new(
                format!("scheduler:{}", task.id),
                SCHEDULED_PROMPT.replace("{title}", &task.title),
            )
            .with_prefix(format!("📅 {}\n\n", task.title));

            match self.executor.execute(&event).await {
                Ok(Some(_)) => report.delivered += 1,
                Ok(None) => {}
                Err(e) => {
                    error!("Scheduled task {} failed: {e:#}", task.id);
                    report.failed += 1;
                }
            }

            // Advanced even after a failure, so a broken task does not rerun
            // on every poll.
            if let Err(e) = self.reschedule(task, now).await {
                warn!("Scheduled task {} not updated: {e:#}", task.id);
            }
        }
        report
    }

    async fn reschedule(&self, task: &TaskSummary, now: DateTime<Utc>) -> Result<()> {
        let next = task
            .schedule_at
            .and_then(|at| next_run(at, task.schedule_repeat, now));
        match next {
            Some(next) => {
                debug!("Scheduled task {} next run {next}", task.id);
                self.store.advance(&task.id, next).await
            }
            None => {
                info!("Scheduled task {} finished", task.id);
                self.store.finish(&task.id).await
            }
        }
    }
}
