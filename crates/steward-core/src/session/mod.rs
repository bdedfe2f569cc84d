pub mod manager;
pub mod profile;
pub mod token_store;
pub mod user;

pub use manager::SessionManager;
pub use profile::{SessionProfile, SessionSettings, EXTERNAL_ALLOWED_TOOLS, OWNER_ALLOWED_TOOLS};
pub use token_store::TokenStore;
pub use user::{EphemeralSession, StreamItem, UserSession, NO_RESPONSE};
