//! Backend that drives the `claude` CLI in non-interactive stream-json mode.
//!
//! One child process per turn. The process is killed when the event stream
//! is dropped, so abandoning a turn never leaks a running agent.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use steward_config::ClaudeCliConfig;

use super::{AgentBackend, AgentEvent, AgentRequest, BackendError, EventStream, ResumeToken};

pub struct ClaudeCliBackend {
    command: PathBuf,
    model: Option<String>,
    timeout: Duration,
    proxy: Option<String>,
    mcp_config: Option<String>,
    env: HashMap<String, String>,
}

impl ClaudeCliBackend {
    /// Resolve the CLI binary up front so a missing install fails at startup.
    pub fn new(config: &ClaudeCliConfig) -> Result<Self, BackendError> {
        let command = which::which(&config.command).map_err(|e| {
            BackendError::Spawn(format!("'{}' not found on PATH: {e}", config.command))
        })?;
        Ok(Self {
            command,
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            proxy: config.proxy.clone().filter(|p| !p.is_empty()),
            mcp_config: config.mcp_config.clone(),
            env: config.env.clone(),
        })
    }

    fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--permission-mode".to_string(),
            request.permission_mode.as_str().to_string(),
        ];
        if !request.system_prompt.is_empty() {
            args.push("--system-prompt".into());
            args.push(request.system_prompt.clone());
        }
        if !request.allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(request.allowed_tools.join(","));
        }
        if let Some(token) = &request.resume_token {
            args.push("--resume".into());
            args.push(token.as_str().to_string());
        }
        if let Some(model) = &self.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if let Some(mcp) = &self.mcp_config {
            args.push("--mcp-config".into());
            args.push(mcp.clone());
        }
        args
    }
}

#[async_trait]
impl AgentBackend for ClaudeCliBackend {
    fn name(&self) -> &str {
        "claude-cli"
    }

    async fn open(&self, request: AgentRequest) -> Result<EventStream, BackendError> {
        let args = self.build_args(&request);
        debug!(
            "Spawning {} (resume: {})",
            self.command.display(),
            request.resume_token.as_ref().map_or("none", |t| t.short())
        );

        if !request.workspace.exists() {
            std::fs::create_dir_all(&request.workspace)?;
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&args)
            .current_dir(&request.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(proxy) = &self.proxy {
            cmd.env("HTTPS_PROXY", proxy).env("HTTP_PROXY", proxy);
        }
        cmd.envs(&self.env);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Spawn(format!("{}: {e}", self.command.display())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Spawn("stdout not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("claude stderr: {line}");
                }
            });
        }
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    warn!("Failed to write prompt to claude: {e}");
                }
                // stdin dropped here, closing the pipe
            });
        }

        let turn = Turn {
            lines: BufReader::new(stdout).lines(),
            child,
            deadline: Instant::now() + self.timeout,
            timeout_secs: self.timeout.as_secs(),
            pending: VecDeque::new(),
            finished: false,
        };
        Ok(Box::pin(stream::unfold(turn, next_event)))
    }
}

struct Turn {
    lines: Lines<BufReader<ChildStdout>>,
    child: Child,
    deadline: Instant,
    timeout_secs: u64,
    pending: VecDeque<AgentEvent>,
    finished: bool,
}

async fn next_event(mut turn: Turn) -> Option<(Result<AgentEvent, BackendError>, Turn)> {
    loop {
        if let Some(event) = turn.pending.pop_front() {
            return Some((Ok(event), turn));
        }
        if turn.finished {
            return None;
        }

        let line = match tokio::time::timeout_at(turn.deadline, turn.lines.next_line()).await {
            Err(_) => {
                turn.finished = true;
                let _ = turn.child.start_kill();
                return Some((Err(BackendError::Timeout(turn.timeout_secs)), turn));
            }
            Ok(Err(e)) => {
                turn.finished = true;
                return Some((Err(BackendError::Io(e)), turn));
            }
            Ok(Ok(None)) => {
                turn.finished = true;
                let status = turn
                    .child
                    .wait()
                    .await
                    .map(|s| s.to_string())
                    .unwrap_or_else(|e| e.to_string());
                return Some((
                    Err(BackendError::Protocol(format!(
                        "output ended without a result ({status})"
                    ))),
                    turn,
                ));
            }
            Ok(Ok(Some(line))) => line,
        };

        match parse_stream_line(&line) {
            Ok(events) => {
                for event in events {
                    if matches!(event, AgentEvent::Completed { .. }) {
                        turn.finished = true;
                    }
                    turn.pending.push_back(event);
                }
            }
            Err(e) => {
                turn.finished = true;
                return Some((Err(e), turn));
            }
        }
    }
}

/// Translate one stream-json line into zero or more events.
fn parse_stream_line(line: &str) -> Result<Vec<AgentEvent>, BackendError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("Skipping non-JSON line from claude: {e}");
            return Ok(Vec::new());
        }
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => {
            let blocks = value
                .pointer("/message/content")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            let events = blocks
                .iter()
                .filter_map(|block| match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => block
                        .get("text")
                        .and_then(|t| t.as_str())
                        .map(|t| AgentEvent::Text(t.to_string())),
                    Some("tool_use") => block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .map(|n| AgentEvent::ToolUse(n.to_string())),
                    _ => None,
                })
                .collect();
            Ok(events)
        }
        Some("result") => {
            let is_error = value
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if is_error {
                let detail = value
                    .get("result")
                    .and_then(|r| r.as_str())
                    .or_else(|| value.get("subtype").and_then(|s| s.as_str()))
                    .unwrap_or("unknown error");
                return Err(BackendError::Failed(detail.to_string()));
            }
            let resume_token = value
                .get("session_id")
                .and_then(|s| s.as_str())
                .filter(|s| !s.is_empty())
                .map(ResumeToken::new);
            Ok(vec![AgentEvent::Completed { resume_token }])
        }
        // system init, user tool results, rate limit notices
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PermissionMode;

    fn backend() -> ClaudeCliBackend {
        ClaudeCliBackend {
            command: PathBuf::from("claude"),
            model: Some("sonnet".into()),
            timeout: Duration::from_secs(5),
            proxy: None,
            mcp_config: Some("/etc/mcp.json".into()),
            env: HashMap::new(),
        }
    }

    fn request(token: Option<&str>) -> AgentRequest {
        AgentRequest {
            system_prompt: "be brief".into(),
            allowed_tools: vec!["Read".into(), "WebSearch".into()],
            permission_mode: PermissionMode::BypassPermissions,
            resume_token: token.map(ResumeToken::new),
            prompt: "hi".into(),
            workspace: PathBuf::from("/tmp"),
        }
    }

    #[test]
    fn args_include_resume_only_when_present() {
        let b = backend();
        let fresh = b.build_args(&request(None));
        assert!(!fresh.contains(&"--resume".to_string()));

        let resumed = b.build_args(&request(Some("abc-123")));
        let pos = resumed.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(resumed[pos + 1], "abc-123");
    }

    #[test]
    fn args_carry_permissions_tools_and_model() {
        let args = backend().build_args(&request(None));
        let joined = args.join(" ");
        assert!(joined.contains("--permission-mode bypassPermissions"));
        assert!(joined.contains("--allowedTools Read,WebSearch"));
        assert!(joined.contains("--model sonnet"));
        assert!(joined.contains("--mcp-config /etc/mcp.json"));
        assert!(joined.contains("--output-format stream-json"));
    }

    #[test]
    fn assistant_line_yields_text_and_tools_in_order() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Looking"},
            {"type":"tool_use","name":"Read","input":{}},
            {"type":"text","text":" done"}]}}"#
            .replace('\n', "");
        let events = parse_stream_line(&line).unwrap();
        assert_eq!(
            events,
            vec![
                AgentEvent::Text("Looking".into()),
                AgentEvent::ToolUse("Read".into()),
                AgentEvent::Text(" done".into()),
            ]
        );
    }

    #[test]
    fn result_line_completes_with_session_id() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"x","session_id":"s-42"}"#;
        let events = parse_stream_line(line).unwrap();
        assert_eq!(
            events,
            vec![AgentEvent::Completed {
                resume_token: Some(ResumeToken::new("s-42"))
            }]
        );
    }

    #[test]
    fn error_result_is_failure() {
        let line = r#"{"type":"result","subtype":"error_max_turns","is_error":true,"session_id":"s-1"}"#;
        match parse_stream_line(line) {
            Err(BackendError::Failed(detail)) => assert_eq!(detail, "error_max_turns"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        assert!(parse_stream_line(r#"{"type":"system","subtype":"init"}"#)
            .unwrap()
            .is_empty());
        assert!(parse_stream_line(r#"{"type":"rate_limit_event"}"#)
            .unwrap()
            .is_empty());
        assert!(parse_stream_line("not json").unwrap().is_empty());
        assert!(parse_stream_line("").unwrap().is_empty());
    }
}
