use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::backend::{
    AgentBackend, AgentEvent, AgentRequest, BackendError, EventStream, ResumeToken,
};
use crate::identity::Role;

use super::profile::SessionProfile;
use super::token_store::TokenStore;

/// Reply used when a turn completes without any text.
pub const NO_RESPONSE: &str = "🤷 No response";

/// Most queued incoming records kept per session.
pub const MAX_INBOX_RECORDS: usize = 20;
/// Character budget for queued incoming records; the newest one is always kept.
pub const MAX_INBOX_CHARS: usize = 24_000;

/// User-facing rendering of a failed turn.
pub fn error_reply(err: &BackendError) -> String {
    format!("❌ Error: {err}")
}

/// One item of a streamed turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Text(String),
    Tool(String),
    /// Always last. Carries the full reply, or the error text on failure.
    Final(String),
}

enum Persistence {
    Durable(TokenStore),
    /// Never loads, remembers or writes a token.
    Ephemeral,
}

#[derive(Default)]
pub(crate) struct TurnState {
    resume_token: Option<ResumeToken>,
}

/// Queued records, numbered so a turn only drops what it actually sent.
#[derive(Default)]
struct Inbox {
    next_seq: u64,
    records: VecDeque<(u64, String)>,
    chars: usize,
}

impl Inbox {
    /// Returns how many of the oldest records were dropped to stay in budget.
    fn push(&mut self, text: &str) -> usize {
        self.records.push_back((self.next_seq, text.to_string()));
        self.next_seq += 1;
        self.chars += text.chars().count();

        let mut dropped = 0;
        while self.records.len() > 1
            && (self.records.len() > MAX_INBOX_RECORDS || self.chars > MAX_INBOX_CHARS)
        {
            if let Some((_, old)) = self.records.pop_front() {
                self.chars -= old.chars().count();
                dropped += 1;
            }
        }
        dropped
    }

    /// Drop every record up to and including `seq`.
    fn consume_through(&mut self, seq: u64) {
        while self.records.front().is_some_and(|(s, _)| *s <= seq) {
            if let Some((_, old)) = self.records.pop_front() {
                self.chars -= old.chars().count();
            }
        }
    }

    fn clear(&mut self) {
        self.records.clear();
        self.chars = 0;
    }
}

/// A recipient bound to one resumable backend conversation.
///
/// Turns are serialized: the state lock is held for the whole turn, so
/// overlapping queries on one session run one after another.
pub struct UserSession {
    recipient_id: i64,
    profile: SessionProfile,
    backend: Arc<dyn AgentBackend>,
    workspace: PathBuf,
    persistence: Persistence,
    state: Arc<Mutex<TurnState>>,
    inbox: std::sync::Mutex<Inbox>,
    /// Set once the manager has replaced this session; its turns stop
    /// writing the shared token file.
    retired: AtomicBool,
}

impl UserSession {
    pub(crate) fn durable(
        recipient_id: i64,
        profile: SessionProfile,
        backend: Arc<dyn AgentBackend>,
        workspace: PathBuf,
        tokens: TokenStore,
    ) -> Self {
        let resume_token = tokens.load(recipient_id);
        debug!(
            "Session {recipient_id} created ({:?}, resume: {})",
            profile.role,
            resume_token.as_ref().map_or("none", |t| t.short())
        );
        Self {
            recipient_id,
            profile,
            backend,
            workspace,
            persistence: Persistence::Durable(tokens),
            state: Arc::new(Mutex::new(TurnState { resume_token })),
            inbox: std::sync::Mutex::new(Inbox::default()),
            retired: AtomicBool::new(false),
        }
    }

    fn ephemeral(
        recipient_id: i64,
        profile: SessionProfile,
        backend: Arc<dyn AgentBackend>,
        workspace: PathBuf,
    ) -> Self {
        Self {
            recipient_id,
            profile,
            backend,
            workspace,
            persistence: Persistence::Ephemeral,
            state: Arc::new(Mutex::new(TurnState::default())),
            inbox: std::sync::Mutex::new(Inbox::default()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn recipient_id(&self) -> i64 {
        self.recipient_id
    }

    pub fn role(&self) -> Role {
        self.profile.role
    }

    pub async fn resume_token(&self) -> Option<ResumeToken> {
        self.state.lock().await.resume_token.clone()
    }

    /// Queue a synthetic incoming record for the next turn.
    pub fn receive_incoming(&self, text: &str) {
        match self.inbox.lock() {
            Ok(mut inbox) => {
                let dropped = inbox.push(text);
                if dropped > 0 {
                    warn!(
                        "Session {} inbox full, dropped {dropped} oldest records",
                        self.recipient_id
                    );
                }
            }
            Err(e) => warn!("Session {} inbox poisoned: {e}", self.recipient_id),
        }
    }

    pub fn pending_incoming(&self) -> usize {
        self.inbox.lock().map(|i| i.records.len()).unwrap_or(0)
    }

    /// Run one turn. Failures come back as an error string and leave the
    /// stored token untouched.
    pub async fn query(&self, prompt: &str) -> String {
        match self.try_query(prompt).await {
            Ok(reply) if reply.is_empty() => NO_RESPONSE.to_string(),
            Ok(reply) => reply,
            Err(e) => {
                warn!("Session {} turn failed: {e}", self.recipient_id);
                error_reply(&e)
            }
        }
    }

    /// Run one turn, surfacing failure as a typed error.
    pub async fn try_query(&self, prompt: &str) -> Result<String, BackendError> {
        let mut state = self.state.lock().await;
        let (consumed, full_prompt) = self.compose(prompt);
        let request = self.request(full_prompt, state.resume_token.clone());
        let mut events = self.backend.open(request).await?;

        let mut reply = String::new();
        while let Some(event) = events.next().await {
            match event? {
                AgentEvent::Text(text) => reply.push_str(&text),
                AgentEvent::ToolUse(name) => {
                    debug!("Session {} tool: {name}", self.recipient_id)
                }
                AgentEvent::Completed { resume_token } => {
                    self.commit(&mut state, resume_token, consumed);
                    return Ok(reply);
                }
            }
        }
        Err(BackendError::Protocol("stream ended before completion".into()))
    }

    /// Lazy variant of [`query`](Self::query) that also surfaces tool use.
    ///
    /// Nothing happens until the stream is polled. It yields exactly one
    /// [`StreamItem::Final`] and then ends.
    pub fn query_stream(self: &Arc<Self>, prompt: &str) -> BoxStream<'static, StreamItem> {
        let start = StreamState::Start {
            session: Arc::clone(self),
            prompt: prompt.to_string(),
        };
        Box::pin(stream::unfold(start, advance_stream))
    }

    /// Forget the conversation. Waits for an in-flight turn to finish.
    pub async fn reset(&self) {
        let _turn = self.reset_held().await;
    }

    /// Reset and keep holding the turn lock, so the caller can swap this
    /// session out before another turn starts on it.
    pub(crate) async fn reset_held(&self) -> MutexGuard<'_, TurnState> {
        let mut state = self.state.lock().await;
        state.resume_token = None;
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.clear();
        }
        if let Persistence::Durable(tokens) = &self.persistence {
            if let Err(e) = tokens.clear(self.recipient_id) {
                warn!("Session {} reset: {e:#}", self.recipient_id);
            }
        }
        info!("Session {} reset", self.recipient_id);
        state
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Prepend queued incoming records. Returns the last record sent.
    fn compose(&self, prompt: &str) -> (Option<u64>, String) {
        let Ok(inbox) = self.inbox.lock() else {
            return (None, prompt.to_string());
        };
        let Some((last, _)) = inbox.records.back() else {
            return (None, prompt.to_string());
        };
        let mut full = String::new();
        for (_, record) in &inbox.records {
            full.push_str(record);
            full.push_str("\n\n");
        }
        full.push_str(prompt);
        (Some(*last), full)
    }

    fn request(&self, prompt: String, resume_token: Option<ResumeToken>) -> AgentRequest {
        AgentRequest {
            system_prompt: self.profile.system_prompt.clone(),
            allowed_tools: self.profile.allowed_tools.clone(),
            permission_mode: self.profile.permission_mode,
            resume_token,
            prompt,
            workspace: self.workspace.clone(),
        }
    }

    /// Successful completion: store the new token, drop consumed records.
    fn commit(&self, state: &mut TurnState, token: Option<ResumeToken>, consumed: Option<u64>) {
        if let (Some(seq), Ok(mut inbox)) = (consumed, self.inbox.lock()) {
            inbox.consume_through(seq);
        }
        let (Persistence::Durable(tokens), Some(token)) = (&self.persistence, token) else {
            return;
        };
        if self.retired.load(Ordering::SeqCst) {
            debug!("Session {} retired, token not saved", self.recipient_id);
        } else if let Err(e) = tokens.save(self.recipient_id, &token) {
            warn!("Session {} token not saved: {e:#}", self.recipient_id);
        }
        debug!("Session {} resume -> {}", self.recipient_id, token.short());
        state.resume_token = Some(token);
    }
}

enum StreamState {
    Start {
        session: Arc<UserSession>,
        prompt: String,
    },
    Running {
        session: Arc<UserSession>,
        guard: OwnedMutexGuard<TurnState>,
        events: EventStream,
        reply: String,
        consumed: Option<u64>,
    },
    Done,
}

async fn advance_stream(state: StreamState) -> Option<(StreamItem, StreamState)> {
    let mut state = state;
    loop {
        state = match state {
            StreamState::Done => return None,
            StreamState::Start { session, prompt } => {
                let guard = Arc::clone(&session.state).lock_owned().await;
                let (consumed, full_prompt) = session.compose(&prompt);
                let request = session.request(full_prompt, guard.resume_token.clone());
                match session.backend.open(request).await {
                    Ok(events) => StreamState::Running {
                        session,
                        guard,
                        events,
                        reply: String::new(),
                        consumed,
                    },
                    Err(e) => {
                        warn!("Session {} stream failed: {e}", session.recipient_id);
                        return Some((StreamItem::Final(error_reply(&e)), StreamState::Done));
                    }
                }
            }
            StreamState::Running {
                session,
                mut guard,
                mut events,
                mut reply,
                consumed,
            } => match events.next().await {
                Some(Ok(AgentEvent::Text(text))) => {
                    reply.push_str(&text);
                    let running = StreamState::Running {
                        session,
                        guard,
                        events,
                        reply,
                        consumed,
                    };
                    return Some((StreamItem::Text(text), running));
                }
                Some(Ok(AgentEvent::ToolUse(name))) => {
                    let running = StreamState::Running {
                        session,
                        guard,
                        events,
                        reply,
                        consumed,
                    };
                    return Some((StreamItem::Tool(name), running));
                }
                Some(Ok(AgentEvent::Completed { resume_token })) => {
                    session.commit(&mut guard, resume_token, consumed);
                    let full = if reply.is_empty() {
                        NO_RESPONSE.to_string()
                    } else {
                        reply
                    };
                    return Some((StreamItem::Final(full), StreamState::Done));
                }
                Some(Err(e)) => {
                    warn!("Session {} stream failed: {e}", session.recipient_id);
                    return Some((StreamItem::Final(error_reply(&e)), StreamState::Done));
                }
                None => {
                    let e = BackendError::Protocol("stream ended before completion".into());
                    return Some((StreamItem::Final(error_reply(&e)), StreamState::Done));
                }
            },
        };
    }
}

/// A single-use session for unattended work.
///
/// Owner-equivalent permissions, never cached, never tokenized. Dropping it
/// ends its lifetime on every exit path, including panics and cancellation.
pub struct EphemeralSession {
    inner: UserSession,
    label: &'static str,
    live: Arc<AtomicUsize>,
}

impl EphemeralSession {
    pub(crate) fn new(
        label: &'static str,
        owner_id: i64,
        profile: SessionProfile,
        backend: Arc<dyn AgentBackend>,
        workspace: PathBuf,
        live: Arc<AtomicUsize>,
    ) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        debug!("Ephemeral {label} session opened");
        Self {
            inner: UserSession::ephemeral(owner_id, profile, backend, workspace),
            label,
            live,
        }
    }

    pub fn label(&self) -> &str {
        self.label
    }

    pub async fn query(&self, prompt: &str) -> String {
        self.inner.query(prompt).await
    }

    pub async fn try_query(&self, prompt: &str) -> Result<String, BackendError> {
        self.inner.try_query(prompt).await
    }
}

impl Drop for EphemeralSession {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        debug!("Ephemeral {} session closed", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::profile::test_settings;
    use crate::testing::{FakeBackend, Script};

    fn owner_session(dir: &std::path::Path, backend: Arc<FakeBackend>) -> Arc<UserSession> {
        let settings = test_settings(dir);
        Arc::new(UserSession::durable(
            1,
            SessionProfile::owner(&settings),
            backend,
            settings.workspace.clone(),
            TokenStore::new(settings.sessions_dir.clone()),
        ))
    }

    #[tokio::test]
    async fn query_concatenates_and_persists_token() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(vec![Script::Reply {
            chunks: vec!["Hello", ", ", "world"],
            tools: vec!["Read"],
            token: Some("tok-1"),
        }]));
        let session = owner_session(dir.path(), backend.clone());

        assert_eq!(session.query("hi").await, "Hello, world");
        assert_eq!(session.resume_token().await, Some(ResumeToken::new("tok-1")));
        let stored = std::fs::read_to_string(dir.path().join("sessions").join("1.session"));
        assert_eq!(stored.unwrap(), "tok-1");
        assert!(backend.last_request().resume_token.is_none());

        session.query("again").await;
        assert_eq!(
            backend.last_request().resume_token,
            Some(ResumeToken::new("tok-1"))
        );
    }

    #[tokio::test]
    async fn failure_returns_error_text_and_keeps_token() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(vec![
            Script::text("first", "tok-1"),
            Script::Fail("overloaded"),
        ]));
        let session = owner_session(dir.path(), backend);

        session.query("one").await;
        let reply = session.query("two").await;
        assert!(reply.starts_with("❌ Error:"));
        assert!(reply.contains("overloaded"));
        assert_eq!(session.resume_token().await, Some(ResumeToken::new("tok-1")));
    }

    #[tokio::test]
    async fn empty_reply_becomes_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(vec![Script::Reply {
            chunks: vec![],
            tools: vec![],
            token: Some("tok-1"),
        }]));
        let session = owner_session(dir.path(), backend);
        assert_eq!(session.query("hi").await, NO_RESPONSE);
    }

    #[tokio::test]
    async fn token_loaded_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sessions")).unwrap();
        std::fs::write(dir.path().join("sessions").join("1.session"), "saved").unwrap();
        let backend = Arc::new(FakeBackend::new(vec![]));
        let session = owner_session(dir.path(), backend.clone());

        session.query("hi").await;
        assert_eq!(
            backend.requests.lock().unwrap()[0].resume_token,
            Some(ResumeToken::new("saved"))
        );
    }

    #[tokio::test]
    async fn reset_clears_token_file_and_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(vec![]));
        let session = owner_session(dir.path(), backend.clone());
        session.query("hi").await;
        session.receive_incoming("[Background task output]\nx");

        session.reset().await;
        session.reset().await;
        assert!(session.resume_token().await.is_none());
        assert_eq!(session.pending_incoming(), 0);
        assert!(!dir.path().join("sessions").join("1.session").exists());

        session.query("fresh").await;
        assert!(backend.last_request().resume_token.is_none());
    }

    #[tokio::test]
    async fn incoming_is_prepended_once_and_kept_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(vec![
            Script::Fail("boom"),
            Script::text("seen", "tok-2"),
        ]));
        let session = owner_session(dir.path(), backend.clone());
        session.receive_incoming("[Background task output]\nreport ready");

        session.query("what happened?").await;
        assert_eq!(session.pending_incoming(), 1);

        session.query("what happened?").await;
        let prompt = backend.last_request().prompt;
        assert!(prompt.starts_with("[Background task output]\nreport ready\n\n"));
        assert!(prompt.ends_with("what happened?"));
        assert_eq!(session.pending_incoming(), 0);

        session.query("next").await;
        assert_eq!(backend.last_request().prompt, "next");
    }

    #[tokio::test]
    async fn inbox_keeps_only_the_newest_records() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(vec![]));
        let session = owner_session(dir.path(), backend.clone());

        for i in 0..MAX_INBOX_RECORDS + 5 {
            session.receive_incoming(&format!("record {i}"));
        }
        assert_eq!(session.pending_incoming(), MAX_INBOX_RECORDS);

        session.query("hi").await;
        let prompt = backend.last_request().prompt;
        assert!(prompt.starts_with("record 5\n\n"));
        assert!(!prompt.contains("record 4\n"));
        assert!(prompt.contains(&format!("record {}", MAX_INBOX_RECORDS + 4)));
    }

    #[tokio::test]
    async fn inbox_stays_within_char_budget() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(vec![]));
        let session = owner_session(dir.path(), backend.clone());

        let big = "x".repeat(4000);
        for _ in 0..2000 {
            session.receive_incoming(&big);
        }
        assert_eq!(session.pending_incoming(), MAX_INBOX_CHARS / 4000);

        session.query("hi").await;
        assert!(backend.last_request().prompt.len() < MAX_INBOX_CHARS + 100);
    }

    #[tokio::test]
    async fn oversized_single_record_is_still_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(vec![]));
        let session = owner_session(dir.path(), backend);

        session.receive_incoming("small");
        session.receive_incoming(&"y".repeat(MAX_INBOX_CHARS + 1));
        assert_eq!(session.pending_incoming(), 1);
    }

    #[tokio::test]
    async fn records_queued_during_a_turn_survive_it() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            FakeBackend::new(vec![Script::text("seen", "tok-1")])
                .with_delay(std::time::Duration::from_millis(40)),
        );
        let session = owner_session(dir.path(), backend.clone());
        session.receive_incoming("first");

        let turn = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.query("hi").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        session.receive_incoming("second");
        turn.await.unwrap();

        assert_eq!(session.pending_incoming(), 1);
        session.query("next").await;
        assert_eq!(backend.last_request().prompt, "second\n\nnext");
    }

    #[tokio::test]
    async fn stream_yields_tools_text_then_final() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(vec![Script::Reply {
            chunks: vec!["a", "b"],
            tools: vec!["WebSearch"],
            token: Some("tok-s"),
        }]));
        let session = owner_session(dir.path(), backend.clone());

        let stream = session.query_stream("go");
        assert_eq!(backend.calls(), 0);
        let items: Vec<StreamItem> = stream.collect().await;
        assert_eq!(
            items,
            vec![
                StreamItem::Tool("WebSearch".into()),
                StreamItem::Text("a".into()),
                StreamItem::Text("b".into()),
                StreamItem::Final("ab".into()),
            ]
        );
        assert_eq!(session.resume_token().await, Some(ResumeToken::new("tok-s")));
    }

    #[tokio::test]
    async fn stream_failure_is_single_final_item() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(vec![Script::Fail("down")]));
        let session = owner_session(dir.path(), backend);

        let items: Vec<StreamItem> = session.query_stream("go").collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], StreamItem::Final(t) if t.contains("down")));
        assert!(session.resume_token().await.is_none());
    }

    #[tokio::test]
    async fn overlapping_queries_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            FakeBackend::new(vec![Script::text("1", "tok-a"), Script::text("2", "tok-b")])
                .with_delay(std::time::Duration::from_millis(30)),
        );
        let session = owner_session(dir.path(), backend.clone());

        let (a, b) = tokio::join!(session.query("x"), session.query("y"));
        assert_eq!(vec![a, b], vec!["1".to_string(), "2".to_string()]);
        let requests = backend.requests.lock().unwrap();
        // The second turn saw the token the first one produced.
        assert_eq!(requests[1].resume_token, Some(ResumeToken::new("tok-a")));
    }

    #[tokio::test]
    async fn ephemeral_never_remembers_a_token() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let backend = Arc::new(FakeBackend::new(vec![
            Script::text("a", "tok-1"),
            Script::text("b", "tok-2"),
        ]));
        let live = Arc::new(AtomicUsize::new(0));
        {
            let session = EphemeralSession::new(
                "background",
                1,
                SessionProfile::background(&settings),
                backend.clone(),
                settings.workspace.clone(),
                live.clone(),
            );
            assert_eq!(live.load(Ordering::SeqCst), 1);
            session.query("one").await;
            session.query("two").await;
        }
        assert_eq!(live.load(Ordering::SeqCst), 0);
        let requests = backend.requests.lock().unwrap();
        assert!(requests.iter().all(|r| r.resume_token.is_none()));
        assert!(!dir.path().join("sessions").join("1.session").exists());
    }
}
