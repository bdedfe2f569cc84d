use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::gate::{GateDecision, RecipientGate};
use crate::text::preview;

/// Outbound side of a messaging platform.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one message. Callers keep `text` within the platform limit.
    async fn send(&self, recipient_id: i64, text: &str) -> Result<()>;
}

/// Message a recipient only if the gate allows it.
///
/// Returns the gate's decision; nothing is sent on a denial. Gate and
/// transport failures are errors.
pub async fn send_to_user(
    gate: &dyn RecipientGate,
    transport: &dyn Transport,
    recipient_id: i64,
    text: &str,
) -> Result<GateDecision> {
    let decision = gate.validate_by_id(recipient_id).await?;
    if !decision.allowed {
        debug!("Send to {recipient_id} denied: {}", decision.reason);
        return Ok(decision);
    }
    transport.send(recipient_id, text).await?;
    info!("Sent to {recipient_id} via {}: {}", transport.name(), preview(text, 50));
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use steward_config::GatePolicy;

    use crate::gate::build_gate;
    use crate::identity::IdentityDirectory;
    use crate::store::Store;
    use crate::testing::SpyTransport;

    const OWNER: i64 = 1;

    #[tokio::test]
    async fn allowed_recipient_gets_the_message() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.set_whitelisted(42, true).await.unwrap();
        let gate = build_gate(GatePolicy::Strict, OWNER, store.clone());
        let transport = SpyTransport::default();

        let decision = send_to_user(gate.as_ref(), &transport, 42, "see you at 5")
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(transport.sent(), vec![(42, "see you at 5".to_string())]);
    }

    #[tokio::test]
    async fn denied_recipient_gets_nothing() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.set_banned(42, true).await.unwrap();
        let transport = SpyTransport::default();

        for policy in [GatePolicy::Strict, GatePolicy::AutoGrant] {
            let gate = build_gate(policy, OWNER, store.clone());
            let decision = send_to_user(gate.as_ref(), &transport, 42, "hi")
                .await
                .unwrap();
            assert_eq!(decision, GateDecision::deny("banned"));
        }
        let strict = build_gate(GatePolicy::Strict, OWNER, store.clone());
        assert!(!send_to_user(strict.as_ref(), &transport, 77, "hi")
            .await
            .unwrap()
            .allowed);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_an_error() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let gate = build_gate(GatePolicy::AutoGrant, OWNER, store.clone());
        let transport = SpyTransport::default();
        transport.fail_for(42);

        assert!(send_to_user(gate.as_ref(), &transport, 42, "hi").await.is_err());
    }
}
