use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::backend::AgentBackend;
use crate::identity::Role;

use super::profile::{SessionProfile, SessionSettings};
use super::token_store::TokenStore;
use super::user::{EphemeralSession, UserSession};

/// Registry of per-recipient sessions.
///
/// Sessions are created on first use and live until reset. Creation is
/// serialized per id, so concurrent first messages share one instance.
pub struct SessionManager {
    settings: SessionSettings,
    backend: Arc<dyn AgentBackend>,
    tokens: TokenStore,
    sessions: DashMap<i64, Arc<UserSession>>,
    live_ephemeral: Arc<AtomicUsize>,
}

impl SessionManager {
    pub fn new(settings: SessionSettings, backend: Arc<dyn AgentBackend>) -> Self {
        let tokens = TokenStore::new(settings.sessions_dir.clone());
        Self {
            settings,
            backend,
            tokens,
            sessions: DashMap::new(),
            live_ephemeral: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn owner_id(&self) -> i64 {
        self.settings.owner_id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn role_of(&self, id: i64) -> Role {
        if id == self.settings.owner_id {
            Role::Owner
        } else {
            Role::External
        }
    }

    /// Cached session for `id`, created on first use.
    ///
    /// `display_name` personalizes an external session's prompt; it is only
    /// read when the session is created.
    pub fn get_session(&self, id: i64, display_name: Option<&str>) -> Arc<UserSession> {
        if let Some(existing) = self.sessions.get(&id) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .sessions
            .entry(id)
            .or_insert_with(|| Arc::new(self.build(id, display_name)));
        Arc::clone(entry.value())
    }

    pub fn get_owner_session(&self) -> Arc<UserSession> {
        self.get_session(self.settings.owner_id, None)
    }

    /// Throwaway session for a trigger run.
    pub fn create_background_session(&self) -> EphemeralSession {
        self.ephemeral("background")
    }

    /// Throwaway session for a heartbeat briefing.
    pub fn create_heartbeat_session(&self) -> EphemeralSession {
        self.ephemeral("heartbeat")
    }

    /// Drop the cached session and its stored token.
    ///
    /// The cached entry stays in place until the in-flight turn finishes and
    /// the reset holds the turn lock, so callers never see two live sessions
    /// for one id.
    pub async fn reset_session(&self, id: i64) {
        let cached = self.sessions.get(&id).map(|e| Arc::clone(e.value()));
        match cached {
            Some(session) => {
                let _turn = session.reset_held().await;
                session.retire();
                self.sessions
                    .remove_if(&id, |_, current| Arc::ptr_eq(current, &session));
            }
            None => {
                if let Err(e) = self.tokens.clear(id) {
                    warn!("Failed to clear token for {id}: {e:#}");
                }
            }
        }
    }

    /// Reset every cached session and every stored token.
    pub async fn reset_all(&self) {
        let mut ids = self.cached_ids();
        ids.extend(self.tokens.stored_ids());
        ids.sort_unstable();
        ids.dedup();
        for id in &ids {
            self.reset_session(*id).await;
        }
        info!("Reset {} sessions", ids.len());
    }

    pub fn cached_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Ephemeral sessions currently alive.
    pub fn live_ephemeral(&self) -> usize {
        self.live_ephemeral.load(Ordering::SeqCst)
    }

    fn build(&self, id: i64, display_name: Option<&str>) -> UserSession {
        let profile = match self.role_of(id) {
            Role::Owner => SessionProfile::owner(&self.settings),
            Role::External => {
                let fallback = id.to_string();
                let name = display_name
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .unwrap_or(&fallback);
                SessionProfile::external(&self.settings, name)
            }
        };
        UserSession::durable(
            id,
            profile,
            Arc::clone(&self.backend),
            self.settings.workspace.clone(),
            self.tokens.clone(),
        )
    }

    fn ephemeral(&self, label: &'static str) -> EphemeralSession {
        EphemeralSession::new(
            label,
            self.settings.owner_id,
            SessionProfile::background(&self.settings),
            Arc::clone(&self.backend),
            self.settings.workspace.clone(),
            Arc::clone(&self.live_ephemeral),
        )
    }
}
