use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::Config;

/// Resolve a configured path, expanding ~ to the home directory.
pub fn resolve_path(path: &str) -> PathBuf {
    if path.starts_with("~/") || path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~/").unwrap_or(""));
        }
    }
    PathBuf::from(path)
}

/// Find the config file by searching standard locations.
pub fn find_config_path() -> PathBuf {
    let local = Path::new("config.json");
    if local.exists() {
        return local.to_path_buf();
    }

    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".steward").join("config.json");
        if home_config.exists() {
            return home_config;
        }
    }

    // Default: ~/.steward/config.json (will use defaults if missing)
    dirs::home_dir()
        .map(|h| h.join(".steward").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("config.json"))
}

/// Load configuration from a JSON file and apply environment fallbacks.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config '{}'", path.display()))?
    } else {
        Config::default()
    };
    apply_env(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Fill unset values from the environment. File values win.
pub fn apply_env<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if config.owner.id.is_none() {
        if let Some(raw) = lookup("STEWARD_OWNER_ID") {
            let id = raw
                .trim()
                .parse::<i64>()
                .with_context(|| format!("STEWARD_OWNER_ID is not a number: '{raw}'"))?;
            config.owner.id = Some(id);
        }
    }
    if config.telegram.token.is_empty() {
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            config.telegram.token = token;
        }
    }
    if config.agent.claude.proxy.is_none() {
        config.agent.claude.proxy = lookup("HTTPS_PROXY").or_else(|| lookup("HTTP_PROXY"));
    }
    Ok(())
}

/// Save configuration to a JSON file.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let contents = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create config directory '{}'",
                parent.to_string_lossy()
            )
        })?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config '{}'", path.display()))?;
    Ok(())
}

impl Config {
    /// The configured owner id, or a configuration error.
    pub fn owner_id(&self) -> Result<i64> {
        match self.owner.id {
            Some(id) => Ok(id),
            None => bail!("owner.id is not configured (set it in config.json or STEWARD_OWNER_ID)"),
        }
    }

    /// Checks required for any command that talks to recipients.
    pub fn validate(&self) -> Result<()> {
        self.owner_id()?;
        if self.gate.policy.is_none() {
            bail!("gate.policy is not configured (expected \"strict\" or \"autoGrant\")");
        }
        if self.delivery.max_message_length == 0 {
            bail!("delivery.maxMessageLength must be greater than zero");
        }
        if self.heartbeat.silent_marker.trim().is_empty() {
            bail!("heartbeat.silentMarker must not be empty");
        }
        Ok(())
    }
}
