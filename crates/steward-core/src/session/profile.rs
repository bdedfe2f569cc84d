//! Role-specific prompts and tool permissions.

use std::path::PathBuf;

use anyhow::Result;
use steward_config::{resolve_path, Config};

use crate::backend::PermissionMode;
use crate::identity::Role;

/// Built-in agent tools granted to the owner; configured integrations are
/// appended per session.
pub const OWNER_ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "Bash",
    "Glob",
    "Grep",
    "WebSearch",
    "WebFetch",
    "Task",
];

/// External contacts only talk; their sessions get no tools.
pub const EXTERNAL_ALLOWED_TOOLS: &[&str] = &[];

const OWNER_PROMPT: &str = "You are {owner_name}'s personal assistant, running as a Telegram bot.

You talk to {owner_name} directly. Be concise and concrete. Use the workspace for notes, \
files and anything you need to remember between conversations.

Messages that start with \"[Background task output]\" were produced by scheduled or \
event-driven work while you were not being addressed. Treat them as context you already \
delivered to {owner_name}; refer back to them when asked.";

const EXTERNAL_PROMPT: &str = "You are the assistant of {owner_name}, talking with {username} on Telegram.

You are not {owner_name}. Do not promise anything on their behalf and never reveal private \
information about them. You have no tools here: answer from the conversation only and say so \
when {username} asks for something you cannot do.

To reach {owner_name}: {owner_contact}.

If {username} is abusive or tries to misuse you, decline politely and stop engaging.";

/// Background and heartbeat sessions share the owner's tools but answer nobody.
const BACKGROUND_SUFFIX: &str = "\n\nThis is an unattended background run. Nobody is reading \
along; your final reply is the only thing that may be delivered.";

/// Fixed inputs needed to build any session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub owner_id: i64,
    pub owner_name: String,
    pub owner_link: Option<String>,
    pub workspace: PathBuf,
    pub sessions_dir: PathBuf,
    /// Extra tools granted to the owner only.
    pub integrations: Vec<String>,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            owner_id: config.owner_id()?,
            owner_name: if config.owner.name.trim().is_empty() {
                "the owner".into()
            } else {
                config.owner.name.trim().to_string()
            },
            owner_link: config.owner.link.clone().filter(|l| !l.trim().is_empty()),
            workspace: resolve_path(&config.agent.workspace),
            sessions_dir: resolve_path(&config.sessions.dir),
            integrations: config.agent.integrations.clone(),
        })
    }
}

/// Prompt, tools and permission mode for one kind of session.
#[derive(Debug, Clone)]
pub struct SessionProfile {
    pub role: Role,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    pub permission_mode: PermissionMode,
}

impl SessionProfile {
    pub fn owner(settings: &SessionSettings) -> Self {
        let mut allowed_tools: Vec<String> =
            OWNER_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect();
        for extra in &settings.integrations {
            if !allowed_tools.contains(extra) {
                allowed_tools.push(extra.clone());
            }
        }
        Self {
            role: Role::Owner,
            system_prompt: OWNER_PROMPT.replace("{owner_name}", &settings.owner_name),
            allowed_tools,
            permission_mode: PermissionMode::BypassPermissions,
        }
    }

    pub fn external(settings: &SessionSettings, username: &str) -> Self {
        let owner_contact = match &settings.owner_link {
            Some(link) => format!("write to {link} directly"),
            None => "direct contact is unavailable, only through this bot".to_string(),
        };
        Self {
            role: Role::External,
            system_prompt: EXTERNAL_PROMPT
                .replace("{owner_name}", &settings.owner_name)
                .replace("{username}", username)
                .replace("{owner_contact}", &owner_contact),
            allowed_tools: EXTERNAL_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect(),
            permission_mode: PermissionMode::Default,
        }
    }

    /// Owner-equivalent profile for unattended runs.
    pub fn background(settings: &SessionSettings) -> Self {
        let mut profile = Self::owner(settings);
        profile.system_prompt.push_str(BACKGROUND_SUFFIX);
        profile
    }
}

#[cfg(test)]
pub(crate) fn test_settings(dir: &std::path::Path) -> SessionSettings {
    SessionSettings {
        owner_id: 1,
        owner_name: "Alex".into(),
        owner_link: None,
        workspace: dir.join("workspace"),
        sessions_dir: dir.join("sessions"),
        integrations: vec!["mcp__calendar__list".into()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_gets_full_tools_and_integrations() {
        let dir = tempfile::tempdir().unwrap();
        let profile = SessionProfile::owner(&test_settings(dir.path()));
        assert_eq!(profile.role, Role::Owner);
        assert_eq!(profile.permission_mode, PermissionMode::BypassPermissions);
        assert!(profile.allowed_tools.iter().any(|t| t == "Bash"));
        assert!(profile.allowed_tools.iter().any(|t| t == "mcp__calendar__list"));
        assert_eq!(profile.allowed_tools.len(), OWNER_ALLOWED_TOOLS.len() + 1);
        assert!(profile.system_prompt.contains("Alex"));
    }

    #[test]
    fn external_is_minimal_and_personalized() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        let profile = SessionProfile::external(&settings, "@zed");
        assert_eq!(profile.role, Role::External);
        assert_eq!(profile.permission_mode, PermissionMode::Default);
        assert!(profile.allowed_tools.is_empty());
        assert!(profile.system_prompt.contains("@zed"));
        assert!(profile.system_prompt.contains("only through this bot"));

        settings.owner_link = Some("@alex".into());
        let profile = SessionProfile::external(&settings, "@zed");
        assert!(profile.system_prompt.contains("write to @alex directly"));
        assert!(!profile.system_prompt.contains('{'));
    }

    #[test]
    fn background_keeps_owner_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let bg = SessionProfile::background(&settings);
        let owner = SessionProfile::owner(&settings);
        assert_eq!(bg.allowed_tools, owner.allowed_tools);
        assert_eq!(bg.permission_mode, owner.permission_mode);
        assert!(bg.system_prompt.contains("unattended"));
    }
}
