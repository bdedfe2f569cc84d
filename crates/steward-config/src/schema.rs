use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub owner: OwnerConfig,
    pub agent: AgentConfig,
    pub providers: ProvidersConfig,
    pub sessions: SessionsConfig,
    pub heartbeat: HeartbeatConfig,
    pub triggers: TriggersConfig,
    pub delivery: DeliveryConfig,
    pub gate: GateConfig,
    pub telegram: TelegramConfig,
    pub store: StoreConfig,
}

/// The single privileged recipient.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnerConfig {
    /// Telegram user id. Falls back to `STEWARD_OWNER_ID` when unset.
    pub id: Option<i64>,
    pub name: String,
    /// How external contacts can reach the owner directly, e.g. "@handle".
    pub link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub workspace: String,
    pub backend: BackendKind,
    pub claude: ClaudeCliConfig,
    /// Used by the `rig` backend.
    pub model: ModelRef,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Extra tool names granted to the owner, e.g. "mcp__calendar".
    pub integrations: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workspace: "~/.steward/workspace".into(),
            backend: BackendKind::default(),
            claude: ClaudeCliConfig::default(),
            model: ModelRef::default(),
            max_tokens: 4096,
            temperature: 0.7,
            integrations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    #[default]
    ClaudeCli,
    Rig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClaudeCliConfig {
    pub command: String,
    pub model: Option<String>,
    pub timeout_secs: u64,
    pub proxy: Option<String>,
    /// Path to an MCP server config passed through to the CLI.
    pub mcp_config: Option<String>,
    pub env: HashMap<String, String>,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            command: "claude".into(),
            model: None,
            timeout_secs: 300,
            proxy: None,
            mcp_config: None,
            env: HashMap::new(),
        }
    }
}

/// Reference to a provider + model combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl Default for ModelRef {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            model: "claude-sonnet-4-5".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub anthropic: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
    pub ollama: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionsConfig {
    /// Directory holding one `<id>.session` token file per recipient.
    pub dir: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            dir: "~/.steward/sessions".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatConfig {
    /// 0 disables the heartbeat.
    pub interval_minutes: u64,
    pub silent_marker: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 30,
            silent_marker: "HEARTBEAT_OK".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggersConfig {
    /// Applied to events that do not carry their own marker.
    pub silent_marker: Option<String>,
    /// How often scheduled tasks are checked; 0 disables the scheduler.
    pub scheduler_poll_secs: u64,
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            silent_marker: None,
            scheduler_poll_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryConfig {
    /// Maximum characters per outbound message.
    pub max_message_length: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_message_length: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GateConfig {
    /// Must be set explicitly; there is no implicit default policy.
    pub policy: Option<GatePolicy>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum GatePolicy {
    /// Unknown users are denied until whitelisted.
    Strict,
    /// Unknown users are whitelisted on first contact.
    AutoGrant,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TelegramConfig {
    pub token: String,
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// SQLite database with users and tasks.
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "~/.steward/steward.sqlite".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: Config = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cfg.heartbeat.interval_minutes, 30);
        assert_eq!(cfg.heartbeat.silent_marker, "HEARTBEAT_OK");
        assert_eq!(cfg.delivery.max_message_length, 4000);
        assert_eq!(cfg.agent.backend, BackendKind::ClaudeCli);
        assert_eq!(cfg.agent.claude.command, "claude");
        assert!(cfg.gate.policy.is_none());
        assert!(cfg.triggers.silent_marker.is_none());
        assert_eq!(cfg.triggers.scheduler_poll_secs, 60);
    }

    #[test]
    fn gate_policy_parsed() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "gate": { "policy": "autoGrant" }
        }))
        .unwrap();
        assert_eq!(cfg.gate.policy, Some(GatePolicy::AutoGrant));

        let cfg: Config = serde_json::from_value(serde_json::json!({
            "gate": { "policy": "strict" }
        }))
        .unwrap();
        assert_eq!(cfg.gate.policy, Some(GatePolicy::Strict));
    }

    #[test]
    fn agent_section_camel_case() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "owner": { "id": 42, "name": "Alex", "link": "@alex" },
            "agent": {
                "backend": "rig",
                "model": { "provider": "ollama", "model": "llama3.1" },
                "claude": { "timeoutSecs": 60, "mcpConfig": "/etc/mcp.json" },
                "integrations": ["mcp__calendar"]
            },
            "heartbeat": { "intervalMinutes": 0 }
        }))
        .unwrap();
        assert_eq!(cfg.owner.id, Some(42));
        assert_eq!(cfg.owner.link.as_deref(), Some("@alex"));
        assert_eq!(cfg.agent.backend, BackendKind::Rig);
        assert_eq!(cfg.agent.model.provider, "ollama");
        assert_eq!(cfg.agent.claude.timeout_secs, 60);
        assert_eq!(cfg.agent.claude.command, "claude");
        assert_eq!(cfg.agent.claude.mcp_config.as_deref(), Some("/etc/mcp.json"));
        assert_eq!(cfg.agent.integrations, vec!["mcp__calendar".to_string()]);
        assert_eq!(cfg.heartbeat.interval_minutes, 0);
        assert_eq!(cfg.heartbeat.silent_marker, "HEARTBEAT_OK");
    }
}
