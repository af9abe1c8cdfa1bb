//! Multi-endpoint JSON-RPC client for the cluster substrate and the local
//! validator.
//!
//! Endpoint selection spreads load away from whichever endpoint served the
//! last successful call: shared public RPC endpoints rate-limit repeat
//! callers, so the known-good URL is kept as the fallback of last resort
//! rather than hammered first. There is no backoff or circuit breaking; the
//! decision loop is periodic and tolerates transient failure by design.
//!
//! All membership and voting queries use `processed` commitment, the
//! weakest level the substrate offers. The decision loop tolerates stale
//! reads; stronger commitment would only add latency.

use std::sync::Mutex;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{method} failed on all RPC endpoints: {attempts}")]
    AllEndpointsFailed { method: &'static str, attempts: String },
}

/// A single failed attempt against one endpoint.
#[derive(Debug)]
enum AttemptError {
    Transport(reqwest::Error),
    /// JSON-RPC error object; only its message is surfaced.
    Rpc(String),
    MissingResult,
    TimedOut(Duration),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Transport(e) => write!(f, "{e}"),
            AttemptError::Rpc(msg) => write!(f, "{msg}"),
            AttemptError::MissingResult => write!(f, "response carried neither result nor error"),
            AttemptError::TimedOut(t) => write!(f, "timed out after {t:?}"),
        }
    }
}

#[derive(Debug)]
pub struct Client {
    label: &'static str,
    urls: Vec<String>,
    http: reqwest::Client,
    last_successful_url: Mutex<Option<String>>,
    timeout: Duration,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    message: String,
}

/// One entry of a `getClusterNodes` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub pubkey: String,
    pub gossip: Option<String>,
    #[serde(default)]
    pub tpu: Option<String>,
    #[serde(default)]
    pub rpc: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoteAccounts {
    pub current: Vec<VoteAccount>,
    pub delinquent: Vec<VoteAccount>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteAccount {
    pub vote_pubkey: String,
    pub node_pubkey: String,
    #[serde(default)]
    pub last_vote: u64,
}

#[derive(Deserialize)]
struct ValueEnvelope<T> {
    value: T,
}

#[derive(Deserialize)]
struct IdentityResult {
    identity: String,
}

impl Client {
    /// Create a client over one or more endpoint URLs, tried in declared
    /// order. `label` prefixes log lines so cluster and local clients can be
    /// told apart.
    pub fn new(label: &'static str, urls: Vec<String>) -> Self {
        Client {
            label,
            urls,
            // The per-call deadline is enforced with tokio timeouts; the
            // reqwest-level timeout is a backstop.
            http: reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT * 2)
                .build()
                .unwrap_or_default(),
            last_successful_url: Mutex::new(None),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Attempt order for the next call: every other URL in declared order,
    /// then the last successful URL as the final fallback.
    fn urls_to_try(&self) -> Vec<String> {
        let last = self.last_successful_url.lock().unwrap().clone();
        match last {
            Some(last) if self.urls.len() > 1 => {
                let mut order: Vec<String> =
                    self.urls.iter().filter(|u| **u != last).cloned().collect();
                order.push(last);
                order
            }
            _ => self.urls.clone(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, RpcError> {
        let mut attempts = Vec::new();
        for url in self.urls_to_try() {
            let outcome =
                tokio::time::timeout(self.timeout, self.call_url(&url, method, params.clone()))
                    .await;
            let err = match outcome {
                Ok(Ok(result)) => {
                    *self.last_successful_url.lock().unwrap() = Some(url);
                    return Ok(result);
                }
                Ok(Err(e)) => e,
                Err(_) => AttemptError::TimedOut(self.timeout),
            };
            debug!(client = self.label, method, rpc_url = %url, error = %err, "method call failed");
            attempts.push(format!("{url}: {err}"));
        }
        Err(RpcError::AllEndpointsFailed {
            method,
            attempts: attempts.join("; "),
        })
    }

    async fn call_url<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &'static str,
        params: Value,
    ) -> Result<T, AttemptError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(AttemptError::Transport)?
            .json::<RpcResponse<T>>()
            .await
            .map_err(AttemptError::Transport)?;

        if let Some(err) = response.error {
            return Err(AttemptError::Rpc(err.message));
        }
        response.result.ok_or(AttemptError::MissingResult)
    }

    pub async fn get_cluster_nodes(&self) -> Result<Vec<ClusterNode>, RpcError> {
        self.call("getClusterNodes", json!([])).await
    }

    pub async fn get_vote_accounts(&self) -> Result<VoteAccounts, RpcError> {
        self.call("getVoteAccounts", json!([{"commitment": "processed"}]))
            .await
    }

    pub async fn get_slot(&self) -> Result<u64, RpcError> {
        self.call("getSlot", json!([{"commitment": "processed"}])).await
    }

    pub async fn get_balance(&self, pubkey: &str) -> Result<u64, RpcError> {
        let envelope: ValueEnvelope<u64> = self
            .call("getBalance", json!([pubkey, {"commitment": "processed"}]))
            .await?;
        Ok(envelope.value)
    }

    /// The local validator's current identity pubkey.
    pub async fn get_identity(&self) -> Result<String, RpcError> {
        let result: IdentityResult = self.call("getIdentity", json!([])).await?;
        Ok(result.identity)
    }

    /// "ok" when the node considers itself healthy; otherwise the JSON-RPC
    /// error message (e.g. "Node is unhealthy") surfaces in the error.
    pub async fn get_health(&self) -> Result<String, RpcError> {
        self.call("getHealth", json!([])).await
    }
}
