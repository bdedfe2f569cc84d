//! Provider-API backend built on rig completion models.
//!
//! The resume token names a JSONL transcript on disk. Tool calls the model
//! proposes are surfaced as events but not executed.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Local;
use futures::stream;
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::completion::{CompletionModel, CompletionRequest, Message};
use rig::message::{AssistantContent, Text, UserContent};
use rig::OneOrMany;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AgentBackend, AgentEvent, AgentRequest, BackendError, EventStream, ResumeToken};

/// One line of a transcript file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptEntry {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl TranscriptEntry {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Some(Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
        }
    }
}

/// Append-only JSONL transcripts keyed by resume token.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, token: &ResumeToken) -> PathBuf {
        let safe: String = token
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    /// Load a transcript; a missing file is an empty conversation.
    pub fn load(&self, token: &ResumeToken) -> Vec<TranscriptEntry> {
        let path = self.path(token);
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        std::io::BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(&line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping malformed transcript line: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn append(
        &self,
        token: &ResumeToken,
        entries: &[TranscriptEntry],
    ) -> Result<(), BackendError> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(token))?;
        for entry in entries {
            let line = serde_json::to_string(entry)
                .map_err(|e| BackendError::Protocol(e.to_string()))?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

/// Build the chat history for one turn from prior entries and the new prompt.
fn build_history(entries: &[TranscriptEntry], window: usize, prompt: &str) -> Vec<Message> {
    let start = entries.len().saturating_sub(window);
    let mut history: Vec<Message> = entries[start..]
        .iter()
        .filter_map(|entry| match entry.role.as_str() {
            "user" => Some(user_message(&entry.content)),
            "assistant" => Some(Message::Assistant {
                id: None,
                content: OneOrMany::one(AssistantContent::Text(Text {
                    text: entry.content.clone(),
                })),
            }),
            _ => None,
        })
        .collect();
    history.push(user_message(prompt));
    history
}

fn user_message(text: &str) -> Message {
    Message::User {
        content: OneOrMany::one(UserContent::Text(Text {
            text: text.to_string(),
        })),
    }
}

#[allow(deprecated)]
pub struct RigBackend {
    model: CompletionModelHandle<'static>,
    model_name: String,
    transcripts: TranscriptStore,
    max_tokens: u64,
    temperature: f64,
    history_window: usize,
}

#[allow(deprecated)]
impl RigBackend {
    pub fn new(
        model: CompletionModelHandle<'static>,
        model_name: impl Into<String>,
        transcripts: TranscriptStore,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            model,
            model_name: model_name.into(),
            transcripts,
            max_tokens: max_tokens as u64,
            temperature: temperature as f64,
            history_window: 50,
        }
    }
}

#[async_trait]
impl AgentBackend for RigBackend {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn open(&self, request: AgentRequest) -> Result<EventStream, BackendError> {
        let token = request
            .resume_token
            .clone()
            .unwrap_or_else(|| ResumeToken::new(uuid::Uuid::new_v4().to_string()));
        let prior = self.transcripts.load(&token);
        let history = build_history(&prior, self.history_window, &request.prompt);
        debug!(
            "rig turn on {} with {} prior messages (token {})",
            self.model_name,
            prior.len(),
            token.short()
        );

        let completion = CompletionRequest {
            preamble: Some(request.system_prompt.clone()),
            chat_history: OneOrMany::many(history)
                .unwrap_or_else(|_| OneOrMany::one(user_message(&request.prompt))),
            documents: Vec::new(),
            tools: Vec::new(),
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            tool_choice: None,
            additional_params: None,
        };

        let response = self
            .model
            .completion(completion)
            .await
            .map_err(|e| BackendError::Failed(format!("LLM completion error: {e}")))?;

        let mut events = Vec::new();
        let mut reply = String::new();
        for content in response.choice.iter() {
            match content {
                AssistantContent::Text(t) => {
                    reply.push_str(&t.text);
                    events.push(AgentEvent::Text(t.text.clone()));
                }
                AssistantContent::ToolCall(tc) => {
                    events.push(AgentEvent::ToolUse(tc.function.name.clone()));
                }
                _ => {}
            }
        }

        self.transcripts.append(
            &token,
            &[
                TranscriptEntry::new("user", &request.prompt),
                TranscriptEntry::new("assistant", &reply),
            ],
        )?;
        events.push(AgentEvent::Completed {
            resume_token: Some(token),
        });

        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path().join("transcripts"));
        let token = ResumeToken::new("abc-1");
        assert!(store.load(&token).is_empty());

        store
            .append(
                &token,
                &[
                    TranscriptEntry::new("user", "hi"),
                    TranscriptEntry::new("assistant", "hello"),
                ],
            )
            .unwrap();
        store
            .append(&token, &[TranscriptEntry::new("user", "again")])
            .unwrap();

        let loaded = store.load(&token);
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].role, "user");
        assert_eq!(loaded[1].content, "hello");
        assert_eq!(loaded[2].content, "again");
    }

    #[test]
    fn token_is_sanitized_for_filename() {
        let store = TranscriptStore::new(PathBuf::from("/tmp/t"));
        let path = store.path(&ResumeToken::new("../etc/passwd"));
        assert_eq!(path, PathBuf::from("/tmp/t/___etc_passwd.jsonl"));
    }

    #[test]
    fn history_ends_with_prompt_and_respects_window() {
        let entries: Vec<TranscriptEntry> = (0..10)
            .map(|i| TranscriptEntry::new(if i % 2 == 0 { "user" } else { "assistant" }, "x"))
            .collect();
        let history = build_history(&entries, 4, "now");
        assert_eq!(history.len(), 5);
        assert!(matches!(history.last(), Some(Message::User { .. })));
    }

    #[test]
    fn unknown_roles_are_skipped() {
        let entries = vec![TranscriptEntry::new("system", "ignored")];
        assert_eq!(build_history(&entries, 10, "p").len(), 1);
    }
}
