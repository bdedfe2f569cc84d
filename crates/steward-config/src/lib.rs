pub mod loader;
pub mod schema;

pub use loader::{apply_env, find_config_path, load_config, resolve_path, save_config};
pub use schema::{
    AgentConfig, BackendKind, ClaudeCliConfig, Config, DeliveryConfig, GateConfig, GatePolicy,
    HeartbeatConfig, ModelRef, OwnerConfig, ProviderConfig, ProvidersConfig, SessionsConfig,
    StoreConfig, TelegramConfig, TriggersConfig,
};
