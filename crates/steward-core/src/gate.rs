//! Authorization for outbound delivery.
//!
//! Every send that is not addressed to the owner or to a group passes a
//! [`RecipientGate`] first. Bans always win over any grant.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use steward_config::GatePolicy;

use crate::identity::{IdentityDirectory, Recipient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: String,
}

impl GateDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait RecipientGate: Send + Sync {
    async fn validate(&self, recipient: &Recipient) -> Result<GateDecision>;

    /// Same check when only the numeric id is known.
    async fn validate_by_id(&self, id: i64) -> Result<GateDecision> {
        self.validate(&Recipient::from_id(id)).await
    }
}

/// Checks shared by every policy. `None` means the policy decides.
async fn common_checks(
    owner_id: i64,
    directory: &dyn IdentityDirectory,
    recipient: &Recipient,
) -> Result<Option<GateDecision>> {
    if recipient.id == owner_id {
        return Ok(Some(GateDecision::allow("owner")));
    }
    if recipient.is_group_like() {
        return Ok(Some(GateDecision::allow("channel/group")));
    }
    match directory.get_user(recipient.id).await? {
        Some(user) if user.is_banned => Ok(Some(GateDecision::deny("banned"))),
        Some(user) if user.is_whitelisted => Ok(Some(GateDecision::allow("whitelisted"))),
        _ => Ok(None),
    }
}

/// Unknown users stay blocked until the owner whitelists them.
pub struct StrictGate {
    owner_id: i64,
    directory: Arc<dyn IdentityDirectory>,
}

impl StrictGate {
    pub fn new(owner_id: i64, directory: Arc<dyn IdentityDirectory>) -> Self {
        Self {
            owner_id,
            directory,
        }
    }
}

#[async_trait]
impl RecipientGate for StrictGate {
    async fn validate(&self, recipient: &Recipient) -> Result<GateDecision> {
        if let Some(decision) =
            common_checks(self.owner_id, self.directory.as_ref(), recipient).await?
        {
            return Ok(decision);
        }
        debug!("Gate denied {}: not whitelisted", recipient.id);
        Ok(GateDecision::deny("not whitelisted"))
    }
}

/// Unknown users are recorded and whitelisted on first contact.
pub struct AutoGrantGate {
    owner_id: i64,
    directory: Arc<dyn IdentityDirectory>,
}

impl AutoGrantGate {
    pub fn new(owner_id: i64, directory: Arc<dyn IdentityDirectory>) -> Self {
        Self {
            owner_id,
            directory,
        }
    }
}

#[async_trait]
impl RecipientGate for AutoGrantGate {
    async fn validate(&self, recipient: &Recipient) -> Result<GateDecision> {
        if let Some(decision) =
            common_checks(self.owner_id, self.directory.as_ref(), recipient).await?
        {
            return Ok(decision);
        }
        let user = self.directory.record_contact(recipient).await?;
        self.directory.set_whitelisted(recipient.id, true).await?;
        info!(
            "Auto-whitelisted {} ({})",
            user.display_name(),
            recipient.id
        );
        Ok(GateDecision::allow("auto-granted"))
    }
}

pub fn build_gate(
    policy: GatePolicy,
    owner_id: i64,
    directory: Arc<dyn IdentityDirectory>,
) -> Arc<dyn RecipientGate> {
    match policy {
        GatePolicy::Strict => Arc::new(StrictGate::new(owner_id, directory)),
        GatePolicy::AutoGrant => Arc::new(AutoGrantGate::new(owner_id, directory)),
    }
}
