//! One-shot execution of background-initiated work.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::session::SessionManager;
use crate::text::{preview, truncate_with_ellipsis, unless_silent};
use crate::transport::Transport;

/// Header of records buffered into the owner's session.
pub const BACKGROUND_OUTPUT_HEADER: &str = "[Background task output]";

/// A unit of background work, e.g. a scheduled job or a watched channel post.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub source: String,
    pub prompt: String,
    /// Sent to the owner before the work starts.
    pub preview: Option<String>,
    pub notify_owner: bool,
    /// Reply text that means "nothing worth reporting".
    pub silent_marker: Option<String>,
    pub result_prefix: Option<String>,
}

impl TriggerEvent {
    pub fn new(source: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            prompt: prompt.into(),
            preview: None,
            notify_owner: true,
            silent_marker: None,
            result_prefix: None,
        }
    }

    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.preview = Some(preview.into());
        self
    }

    pub fn silent_when(mut self, marker: impl Into<String>) -> Self {
        self.silent_marker = Some(marker.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.result_prefix = Some(prefix.into());
        self
    }

    /// Run without messaging the owner; the result is only returned.
    pub fn quiet(mut self) -> Self {
        self.notify_owner = false;
        self
    }
}

pub struct TriggerExecutor {
    sessions: Arc<SessionManager>,
    transport: Arc<dyn Transport>,
    max_length: usize,
    default_marker: Option<String>,
}

impl TriggerExecutor {
    pub fn new(
        sessions: Arc<SessionManager>,
        transport: Arc<dyn Transport>,
        max_length: usize,
        default_marker: Option<String>,
    ) -> Self {
        Self {
            sessions,
            transport,
            max_length,
            default_marker: default_marker.filter(|m| !m.is_empty()),
        }
    }

    /// Run the event in a fresh ephemeral session and deliver the result.
    ///
    /// Returns the delivered text, or `None` when the reply was silent.
    /// Delivery failures are returned as errors.
    pub async fn execute(&self, event: &TriggerEvent) -> Result<Option<String>> {
        info!("Trigger {}: running", event.source);

        if event.notify_owner {
            if let Some(preview) = event.preview.as_deref() {
                self.send_to_owner(preview, false).await?;
            }
        }

        let reply = {
            let session = self.sessions.create_background_session();
            session.query(&event.prompt).await
        };

        let marker = event
            .silent_marker
            .as_deref()
            .or(self.default_marker.as_deref());
        let Some(content) = unless_silent(&reply, marker) else {
            debug!("Trigger {}: silent", event.source);
            return Ok(None);
        };

        let content = match event.result_prefix.as_deref() {
            Some(prefix) => format!("{prefix}{content}"),
            None => content,
        };
        let content = truncate_with_ellipsis(&content, self.max_length);

        if event.notify_owner {
            self.send_to_owner(&content, true).await?;
        }
        info!(
            "Trigger {}: delivered {} chars: {}",
            event.source,
            content.chars().count(),
            preview(&content, 60)
        );
        Ok(Some(content))
    }

    /// The single path for owner notifications.
    ///
    /// With `buffer`, the text is also queued into the owner's session so
    /// the next interactive turn knows it was delivered.
    pub async fn send_to_owner(&self, text: &str, buffer: bool) -> Result<()> {
        let owner_id = self.sessions.owner_id();
        self.transport
            .send(owner_id, text)
            .await
            .with_context(|| format!("failed to notify owner via {}", self.transport.name()))?;
        if buffer {
            self.sessions
                .get_owner_session()
                .receive_incoming(&format!("{BACKGROUND_OUTPUT_HEADER}\n{text}"));
        }
        Ok(())
    }
}
