//! Fakes shared by the unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;

use crate::backend::{
    AgentBackend, AgentEvent, AgentRequest, BackendError, EventStream, ResumeToken,
};
use crate::task::{TaskKind, TaskRepository, TaskStatus, TaskSummary};
use crate::transport::Transport;

pub enum Script {
    Reply {
        chunks: Vec<&'static str>,
        tools: Vec<&'static str>,
        token: Option<&'static str>,
    },
    Fail(&'static str),
}

impl Script {
    pub fn text(text: &'static str, token: &'static str) -> Self {
        Script::Reply {
            chunks: vec![text],
            tools: Vec::new(),
            token: Some(token),
        }
    }
}

/// Plays back scripted turns; once exhausted every turn answers "ok".
pub struct FakeBackend {
    scripts: Mutex<VecDeque<Script>>,
    pub requests: Mutex<Vec<AgentRequest>>,
    pub calls: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeBackend {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> AgentRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl AgentBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn open(&self, request: AgentRequest) -> Result<EventStream, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let script = self.scripts.lock().unwrap().pop_front();
        let events: Vec<Result<AgentEvent, BackendError>> = match script {
            Some(Script::Fail(msg)) => return Err(BackendError::Failed(msg.to_string())),
            Some(Script::Reply {
                chunks,
                tools,
                token,
            }) => {
                let mut events: Vec<_> = tools
                    .into_iter()
                    .map(|t| Ok(AgentEvent::ToolUse(t.to_string())))
                    .collect();
                events.extend(chunks.into_iter().map(|c| Ok(AgentEvent::Text(c.to_string()))));
                events.push(Ok(AgentEvent::Completed {
                    resume_token: token.map(ResumeToken::new),
                }));
                events
            }
            None => vec![
                Ok(AgentEvent::Text("ok".into())),
                Ok(AgentEvent::Completed {
                    resume_token: Some(ResumeToken::new(format!("auto-{n}"))),
                }),
            ],
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

/// Records every send; ids in `failing` return an error.
#[derive(Default)]
pub struct SpyTransport {
    pub sent: Mutex<Vec<(i64, String)>>,
    pub failing: Mutex<HashSet<i64>>,
}

impl SpyTransport {
    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_for(&self, id: i64) {
        self.failing.lock().unwrap().insert(id);
    }
}

#[async_trait]
impl Transport for SpyTransport {
    fn name(&self) -> &str {
        "spy"
    }

    async fn send(&self, recipient_id: i64, text: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(&recipient_id) {
            anyhow::bail!("send to {recipient_id} refused");
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient_id, text.to_string()));
        Ok(())
    }
}

/// Fixed task lists; `failing` makes every query error.
#[derive(Default)]
pub struct MemoryTasks {
    pub overdue: Vec<TaskSummary>,
    pub due_soon: Vec<TaskSummary>,
    pub scheduled: Vec<TaskSummary>,
    pub failing: bool,
}

#[async_trait]
impl TaskRepository for MemoryTasks {
    async fn list_overdue(&self, _now: DateTime<Utc>) -> Result<Vec<TaskSummary>> {
        if self.failing {
            anyhow::bail!("task store offline");
        }
        Ok(self.overdue.clone())
    }

    async fn list_due_soon(
        &self,
        _now: DateTime<Utc>,
        _window: chrono::Duration,
    ) -> Result<Vec<TaskSummary>> {
        if self.failing {
            anyhow::bail!("task store offline");
        }
        Ok(self.due_soon.clone())
    }

    async fn list_scheduled(&self) -> Result<Vec<TaskSummary>> {
        if self.failing {
            anyhow::bail!("task store offline");
        }
        Ok(self.scheduled.clone())
    }
}

pub fn task(id: &str, title: &str, assignee: Option<i64>, deadline: DateTime<Utc>) -> TaskSummary {
    TaskSummary {
        id: id.into(),
        title: title.into(),
        status: TaskStatus::Pending,
        kind: TaskKind::Task,
        assignee_id: assignee,
        assignee_name: assignee.map(|a| format!("user{a}")),
        deadline: Some(deadline),
        schedule_at: None,
        schedule_repeat: None,
    }
}
