//! Local role probe: what the validator on this box says about itself.
//!
//! Every predicate collapses an RPC error into a negative answer. An
//! unreachable local RPC means we cannot prove we are active or healthy,
//! and "not active, not healthy" is the answer that biases the decision
//! loop toward demotion, which is the safe direction.

use tracing::{debug, error, warn};

use crate::rpc;

#[derive(Debug)]
pub struct RoleProbe {
    local_rpc: rpc::Client,
    active_pubkey: String,
}

impl RoleProbe {
    pub fn new(local_rpc: rpc::Client, active_pubkey: String) -> Self {
        RoleProbe {
            local_rpc,
            active_pubkey,
        }
    }

    /// The local validator currently runs with the shared active identity.
    pub async fn is_active(&self) -> bool {
        match self.local_rpc.get_identity().await {
            Ok(identity) => identity == self.active_pubkey,
            Err(e) => {
                error!(error = %e, "failed to get local identity");
                false
            }
        }
    }

    /// The local validator runs with anything other than the shared active
    /// identity. Not the negation of `is_active`: an RPC error makes both
    /// answer false.
    pub async fn is_passive(&self) -> bool {
        match self.local_rpc.get_identity().await {
            Ok(identity) => identity != self.active_pubkey,
            Err(e) => {
                error!(error = %e, "failed to get local identity");
                false
            }
        }
    }

    pub async fn is_healthy(&self) -> bool {
        match self.local_rpc.get_health().await {
            Ok(status) => {
                let is_healthy = status == "ok";
                debug!(status = %status, is_healthy, "health status");
                if !is_healthy {
                    warn!(status = %status, "this node is unhealthy");
                }
                is_healthy
            }
            Err(e) => {
                error!(error = %e, "failed to get local health");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testutil::MockRpc;
    use serde_json::json;

    const ACTIVE_PUBKEY: &str = "ActivePubkey1111111111111111111111111111111";

    async fn probe_with(mock: &MockRpc) -> RoleProbe {
        let url = mock.spawn().await;
        RoleProbe::new(
            rpc::Client::new("local", vec![url]),
            ACTIVE_PUBKEY.to_string(),
        )
    }

    #[tokio::test]
    async fn active_identity_is_detected() {
        let mock = MockRpc::new();
        mock.respond("getIdentity", json!({"identity": ACTIVE_PUBKEY}));
        let probe = probe_with(&mock).await;

        assert!(probe.is_active().await);
        assert!(!probe.is_passive().await);
    }

    #[tokio::test]
    async fn other_identity_is_passive() {
        let mock = MockRpc::new();
        mock.respond("getIdentity", json!({"identity": "SomeOtherPubkey"}));
        let probe = probe_with(&mock).await;

        assert!(!probe.is_active().await);
        assert!(probe.is_passive().await);
    }

    #[tokio::test]
    async fn health_requires_ok() {
        let mock = MockRpc::new();
        mock.respond("getHealth", json!("ok"));
        let probe = probe_with(&mock).await;
        assert!(probe.is_healthy().await);

        let unhealthy = MockRpc::new();
        unhealthy.respond("getHealth", json!("behind"));
        let probe = probe_with(&unhealthy).await;
        assert!(!probe.is_healthy().await);
    }

    #[tokio::test]
    async fn rpc_errors_collapse_to_negative() {
        // nothing listening on this port
        let probe = RoleProbe::new(
            rpc::Client::new("local", vec!["http://127.0.0.1:1".to_string()]),
            ACTIVE_PUBKEY.to_string(),
        );

        assert!(!probe.is_active().await);
        assert!(!probe.is_passive().await);
        assert!(!probe.is_healthy().await);
    }
}
