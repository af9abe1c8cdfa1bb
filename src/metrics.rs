//! Prometheus exposition and the two HTTP endpoints.
//!
//! The decision loop publishes `ControlState` snapshots through a watch
//! channel; the /metrics handler renders the latest snapshot on every
//! scrape. Rendering from a snapshot means a role change simply stops
//! emitting the old `metadata` series; no explicit reset bookkeeping.
//!
//! `GET /metrics` is served on `prometheus.port`, `GET /health` on
//! `prometheus.port + 1`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const ROLE_ACTIVE: &str = "active";
pub const ROLE_PASSIVE: &str = "passive";
pub const ROLE_UNKNOWN: &str = "unknown";

pub const STATUS_HEALTHY: &str = "healthy";
pub const STATUS_UNHEALTHY: &str = "unhealthy";

pub const FAILOVER_IDLE: &str = "idle";
pub const FAILOVER_BECOMING_ACTIVE: &str = "becoming_active";
pub const FAILOVER_BECOMING_PASSIVE: &str = "becoming_passive";

const NAMESPACE: &str = "solana_validator_ha_";

/// Externally visible status of the decision loop, republished every tick
/// and around each role transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlState {
    pub validator_name: String,
    pub public_ip: String,
    pub role: &'static str,
    pub status: &'static str,
    pub peer_count: usize,
    pub self_in_gossip: bool,
    pub failover_status: &'static str,
}

impl ControlState {
    pub fn initial(validator_name: String, public_ip: String) -> Self {
        ControlState {
            validator_name,
            public_ip,
            role: ROLE_UNKNOWN,
            status: STATUS_UNHEALTHY,
            peer_count: 0,
            self_in_gossip: false,
            failover_status: FAILOVER_IDLE,
        }
    }
}

/// Render the exposition document for one state snapshot.
pub fn render(state: &ControlState, static_labels: &BTreeMap<String, String>) -> String {
    let common = common_labels(state, static_labels);
    let mut out = String::new();

    let _ = writeln!(
        out,
        "# HELP {NAMESPACE}metadata Metadata about the validator HA manager, always 1 with metadata labels"
    );
    let _ = writeln!(out, "# TYPE {NAMESPACE}metadata gauge");
    let _ = writeln!(
        out,
        "{NAMESPACE}metadata{{validator_role=\"{}\",validator_status=\"{}\",{common}}} 1",
        escape(state.role),
        escape(state.status),
    );

    let _ = writeln!(
        out,
        "# HELP {NAMESPACE}peer_count Number of peers seen in gossip this node is aware of, excluding self"
    );
    let _ = writeln!(out, "# TYPE {NAMESPACE}peer_count gauge");
    let _ = writeln!(out, "{NAMESPACE}peer_count{{{common}}} {}", state.peer_count);

    let _ = writeln!(
        out,
        "# HELP {NAMESPACE}self_in_gossip Whether this node sees itself in gossip (1 = yes, 0 = no)"
    );
    let _ = writeln!(out, "# TYPE {NAMESPACE}self_in_gossip gauge");
    let _ = writeln!(
        out,
        "{NAMESPACE}self_in_gossip{{{common}}} {}",
        u8::from(state.self_in_gossip)
    );

    let _ = writeln!(out, "# HELP {NAMESPACE}failover_status Current failover status of the node");
    let _ = writeln!(out, "# TYPE {NAMESPACE}failover_status gauge");
    let _ = writeln!(
        out,
        "{NAMESPACE}failover_status{{status=\"{}\",{common}}} 1",
        escape(state.failover_status),
    );

    out
}

fn common_labels(state: &ControlState, static_labels: &BTreeMap<String, String>) -> String {
    let mut labels = vec![
        format!("validator_name=\"{}\"", escape(&state.validator_name)),
        format!("public_ip=\"{}\"", escape(&state.public_ip)),
    ];
    for (name, value) in static_labels {
        labels.push(format!("{name}=\"{}\"", escape(value)));
    }
    labels.join(",")
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Serve /metrics, rendering the latest published state on each scrape.
pub async fn serve_metrics(
    port: u16,
    static_labels: BTreeMap<String, String>,
    state_rx: watch::Receiver<ControlState>,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind metrics server to port {port}"))?;
    info!(port, "metrics server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;
        let state = state_rx.borrow().clone();
        let body = render(&state, &static_labels);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            if socket.read(&mut buf).await.is_err() {
                return;
            }
            let request = String::from_utf8_lossy(&buf);
            let response = if request.starts_with("GET /metrics") {
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                )
            } else {
                not_found()
            };
            if let Err(e) = socket.write_all(response.as_bytes()).await {
                debug!(error = %e, "failed to write metrics response");
            }
        });
    }
}

/// Serve /health on its own port; always 200 "healthy" while the process
/// runs.
pub async fn serve_health(port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind health server to port {port}"))?;
    debug!(port, "health check server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            if socket.read(&mut buf).await.is_err() {
                return;
            }
            let request = String::from_utf8_lossy(&buf);
            let response = if request.starts_with("GET /health") {
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 7\r\nConnection: close\r\n\r\nhealthy"
                    .to_string()
            } else {
                not_found()
            };
            if let Err(e) = socket.write_all(response.as_bytes()).await {
                warn!(error = %e, "failed to write health response");
            }
        });
    }
}

fn not_found() -> String {
    "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\nConnection: close\r\n\r\nNot Found".to_string()
}
