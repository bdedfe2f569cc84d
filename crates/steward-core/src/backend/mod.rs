//! The reasoning backend seam.
//!
//! A backend receives one [`AgentRequest`] per turn and streams back
//! [`AgentEvent`]s: text segments and tool notices, terminated by a
//! `Completed` event that may carry a new [`ResumeToken`].

pub mod claude_cli;
pub mod completion;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use claude_cli::ClaudeCliBackend;
pub use completion::{RigBackend, TranscriptStore};

/// Opaque conversation handle minted by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First few characters, for log lines.
    pub fn short(&self) -> &str {
        crate::text::preview(&self.0, 8)
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// Tool calls may prompt or be refused.
    Default,
    /// Every allowed tool runs without confirmation.
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }
}

/// Everything a backend needs to run a single turn.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    pub permission_mode: PermissionMode,
    pub resume_token: Option<ResumeToken>,
    pub prompt: String,
    pub workspace: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Text(String),
    ToolUse(String),
    Completed { resume_token: Option<ResumeToken> },
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to start backend: {0}")]
    Spawn(String),
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend protocol error: {0}")]
    Protocol(String),
    #[error("backend reported failure: {0}")]
    Failed(String),
    #[error("backend timed out after {0}s")]
    Timeout(u64),
}

pub type EventStream = BoxStream<'static, Result<AgentEvent, BackendError>>;

/// A conversational reasoning engine.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Start one turn. The returned stream ends after `Completed` or an error.
    async fn open(&self, request: AgentRequest) -> Result<EventStream, BackendError>;
}
