//! Recipient identities and the directory that remembers them.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    User,
    Group,
    Channel,
}

/// Who a message is about to go to, as far as the transport knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub id: i64,
    pub kind: RecipientKind,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl Recipient {
    pub fn user(id: i64) -> Self {
        Self {
            id,
            kind: RecipientKind::User,
            username: None,
            first_name: None,
            last_name: None,
        }
    }

    /// Telegram uses negative ids for groups and channels.
    pub fn from_id(id: i64) -> Self {
        let kind = if id < 0 {
            RecipientKind::Group
        } else {
            RecipientKind::User
        };
        Self {
            kind,
            ..Self::user(id)
        }
    }

    pub fn with_names(
        mut self,
        username: Option<String>,
        first_name: Option<String>,
        last_name: Option<String>,
    ) -> Self {
        self.username = username;
        self.first_name = first_name;
        self.last_name = last_name;
        self
    }

    pub fn is_group_like(&self) -> bool {
        matches!(self.kind, RecipientKind::Group | RecipientKind::Channel)
    }
}

/// A non-owner contact as stored in the directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalUser {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub first_contact: DateTime<Utc>,
    pub last_contact: DateTime<Utc>,
    pub is_banned: bool,
    pub is_whitelisted: bool,
}

impl ExternalUser {
    pub fn display_name(&self) -> String {
        display_name(
            self.telegram_id,
            self.username.as_deref(),
            self.first_name.as_deref(),
            self.last_name.as_deref(),
        )
    }
}

/// Full name if known, else `@username`, else the numeric id.
pub fn display_name(
    id: i64,
    username: Option<&str>,
    first_name: Option<&str>,
    last_name: Option<&str>,
) -> String {
    let parts: Vec<&str> = [first_name, last_name]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if !parts.is_empty() {
        return parts.join(" ");
    }
    match username.filter(|u| !u.is_empty()) {
        Some(u) => format!("@{u}"),
        None => id.to_string(),
    }
}

/// Persistent record of external contacts.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn get_user(&self, id: i64) -> Result<Option<ExternalUser>>;

    /// Insert or refresh a contact, updating names and `last_contact`.
    async fn record_contact(&self, recipient: &Recipient) -> Result<ExternalUser>;

    async fn set_whitelisted(&self, id: i64, whitelisted: bool) -> Result<()>;

    async fn set_banned(&self, id: i64, banned: bool) -> Result<()>;

    async fn list_users(&self) -> Result<Vec<ExternalUser>>;
}
