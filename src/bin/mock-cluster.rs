//! A fake Solana cluster for rehearsing failovers on one machine.
//!
//! Serves the substrate RPC surface the supervisor consumes
//! (getClusterNodes, getVoteAccounts, getSlot, getBalance) at `POST /`,
//! a per-validator local RPC (getIdentity, getHealth) at
//! `POST /<name>/rpc`, and two plain-HTTP control endpoints:
//!
//!   GET /<name>/public-ip            -> the validator's public IP
//!   GET /<name>/set-identity/<role>  -> flip a validator to active/passive
//!
//! Point a supervisor's `cluster.rpc_urls` at `/`, its
//! `validator.rpc_url` at `/<name>/rpc`, its public IP service at
//! `/<name>/public-ip`, and make the role commands curl the set-identity
//! endpoints. Gossip addresses are bound as real listeners so the
//! supervisor's liveness probe sees online validators as dialable.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mock-cluster", about = "Mock Solana cluster for validator-ha rehearsals")]
struct Cli {
    /// Scenario file describing the validators
    #[arg(long, short)]
    config: PathBuf,

    /// Port to serve all endpoints on
    #[arg(long, default_value = "8899")]
    port: u16,
}

#[derive(Debug, Deserialize)]
struct Scenario {
    validators: BTreeMap<String, ValidatorScenario>,
}

#[derive(Debug, Clone, Deserialize)]
struct ValidatorScenario {
    public_ip: String,
    active_pubkey: String,
    passive_pubkey: String,
    /// "active" or "passive"
    #[serde(default = "default_startup_identity")]
    on_startup_identity: String,
    /// Gossip address to advertise and listen on; defaults to
    /// "<public_ip>:8001".
    #[serde(default)]
    gossip_addr: Option<String>,
    #[serde(default = "default_true")]
    healthy: bool,
    #[serde(default)]
    is_offline: bool,
    #[serde(default)]
    delinquent: bool,
    /// Identity account balance in lamports.
    #[serde(default = "default_balance")]
    balance: u64,
}

fn default_startup_identity() -> String {
    "passive".to_string()
}

fn default_true() -> bool {
    true
}

fn default_balance() -> u64 {
    10_000_000
}

#[derive(Debug, Clone)]
struct ValidatorState {
    scenario: ValidatorScenario,
    is_active: bool,
}

impl ValidatorState {
    fn identity(&self) -> &str {
        if self.is_active {
            &self.scenario.active_pubkey
        } else {
            &self.scenario.passive_pubkey
        }
    }

    fn gossip_addr(&self) -> String {
        self.scenario
            .gossip_addr
            .clone()
            .unwrap_or_else(|| format!("{}:8001", self.scenario.public_ip))
    }
}

struct Server {
    validators: Mutex<BTreeMap<String, ValidatorState>>,
    slot: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("failed to read scenario {}", cli.config.display()))?;
    let scenario: Scenario = serde_yaml::from_str(&raw).context("failed to parse scenario")?;

    let mut validators = BTreeMap::new();
    for (name, v) in scenario.validators {
        let is_active = v.on_startup_identity == "active";
        info!(name = %name, public_ip = %v.public_ip, is_active, is_offline = v.is_offline, "validator configured");
        validators.insert(name, ValidatorState { scenario: v, is_active });
    }

    let server = Arc::new(Server {
        validators: Mutex::new(validators),
        slot: AtomicU64::new(100_000),
    });

    spawn_gossip_listeners(&server).await;

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("failed to bind port {}", cli.port))?;
    info!(port = cli.port, "mock cluster listening");

    loop {
        let (socket, _) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, server).await {
                warn!(error = %e, "connection error");
            }
        });
    }
}

/// Bind a real listener on every online validator's gossip address so the
/// supervisor's TCP liveness probe succeeds.
async fn spawn_gossip_listeners(server: &Arc<Server>) {
    let addrs: Vec<String> = {
        let validators = server.validators.lock().unwrap();
        validators
            .values()
            .filter(|v| !v.scenario.is_offline)
            .map(ValidatorState::gossip_addr)
            .collect()
    };
    for addr in addrs {
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!(addr = %addr, "gossip liveness listener bound");
                tokio::spawn(async move {
                    loop {
                        let Ok((_socket, _)) = listener.accept().await else {
                            return;
                        };
                    }
                });
            }
            Err(e) => warn!(addr = %addr, error = %e, "failed to bind gossip listener"),
        }
    }
}

async fn handle_connection(mut socket: TcpStream, server: Arc<Server>) -> Result<()> {
    let (method, path, body) = read_request(&mut socket).await?;

    let response = match route(&server, &method, &path, &body) {
        Some(r) => r,
        None => Response::not_found(),
    };
    socket.write_all(response.to_http().as_bytes()).await?;
    Ok(())
}

fn route(server: &Server, method: &str, path: &str, body: &str) -> Option<Response> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        ("POST", &[]) => Some(handle_cluster_rpc(server, body)),
        ("POST", &[name, "rpc"]) => Some(handle_local_rpc(server, name, body)),
        ("GET", &[name, "public-ip"]) => {
            let validators = server.validators.lock().unwrap();
            let validator = validators.get(name)?;
            info!(validator = %name, ip = %validator.scenario.public_ip, "returning public IP");
            Some(Response::text(200, validator.scenario.public_ip.clone()))
        }
        ("GET" | "POST", &[name, "set-identity", role]) => {
            let mut validators = server.validators.lock().unwrap();
            let validator = validators.get_mut(name)?;
            match role {
                "active" => validator.is_active = true,
                "passive" => validator.is_active = false,
                _ => return Some(Response::text(400, "Invalid identity type".to_string())),
            }
            info!(validator = %name, role = %role, "identity set");
            Some(Response::text(200, "OK".to_string()))
        }
        _ => None,
    }
}

fn handle_cluster_rpc(server: &Server, body: &str) -> Response {
    let request: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return Response::text(400, "Invalid JSON".to_string()),
    };
    let method = request["method"].as_str().unwrap_or_default();
    let id = request["id"].clone();
    let validators = server.validators.lock().unwrap();

    let result = match method {
        "getClusterNodes" => {
            let nodes: Vec<Value> = validators
                .values()
                .filter(|v| !v.scenario.is_offline)
                .map(|v| {
                    json!({
                        "pubkey": v.identity(),
                        "gossip": v.gossip_addr(),
                        "tpu": format!("{}:8003", v.scenario.public_ip),
                        "rpc": format!("{}:8899", v.scenario.public_ip),
                        "version": "1.18.0",
                    })
                })
                .collect();
            json!(nodes)
        }
        "getVoteAccounts" => {
            let mut current = Vec::new();
            let mut delinquent = Vec::new();
            for v in validators.values().filter(|v| v.is_active && !v.scenario.is_offline) {
                let account = json!({
                    "votePubkey": format!("vote-{}", v.identity()),
                    "nodePubkey": v.identity(),
                    "lastVote": server.slot.load(Ordering::Relaxed),
                    "activatedStake": 1_000_000_000u64,
                });
                if v.scenario.delinquent {
                    delinquent.push(account);
                } else {
                    current.push(account);
                }
            }
            json!({"current": current, "delinquent": delinquent})
        }
        "getSlot" => json!(server.slot.fetch_add(1, Ordering::Relaxed)),
        "getBalance" => {
            let pubkey = request["params"][0].as_str().unwrap_or_default();
            let balance = validators
                .values()
                .find(|v| v.identity() == pubkey)
                .map(|v| v.scenario.balance)
                .unwrap_or(0);
            json!({"context": {"slot": server.slot.load(Ordering::Relaxed)}, "value": balance})
        }
        _ => {
            return Response::json(json!({
                "jsonrpc": "2.0", "id": id,
                "error": {"code": -32601, "message": "Method not found"},
            }));
        }
    };

    Response::json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn handle_local_rpc(server: &Server, name: &str, body: &str) -> Response {
    let request: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return Response::text(400, "Invalid JSON".to_string()),
    };
    let method = request["method"].as_str().unwrap_or_default();
    let id = request["id"].clone();
    let validators = server.validators.lock().unwrap();
    let Some(validator) = validators.get(name) else {
        return Response::text(404, "Validator not found".to_string());
    };

    let payload = match method {
        "getIdentity" => json!({
            "jsonrpc": "2.0", "id": id,
            "result": {"identity": validator.identity()},
        }),
        "getHealth" => {
            if validator.scenario.healthy {
                json!({"jsonrpc": "2.0", "id": id, "result": "ok"})
            } else {
                json!({
                    "jsonrpc": "2.0", "id": id,
                    "error": {"code": -32005, "message": "Node is unhealthy"},
                })
            }
        }
        _ => json!({
            "jsonrpc": "2.0", "id": id,
            "error": {"code": -32601, "message": "Method not found"},
        }),
    };
    Response::json(payload)
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl Response {
    fn json(value: Value) -> Self {
        Response {
            status: 200,
            content_type: "application/json",
            body: value.to_string(),
        }
    }

    fn text(status: u16, body: String) -> Self {
        Response {
            status,
            content_type: "text/plain",
            body,
        }
    }

    fn not_found() -> Self {
        Response::text(404, "Not Found".to_string())
    }

    fn to_http(&self) -> String {
        let reason = match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            _ => "Error",
        };
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            reason,
            self.content_type,
            self.body.len(),
            self.body
        )
    }
}

/// Read one HTTP request: returns (method, path, body).
async fn read_request(socket: &mut TcpStream) -> Result<(String, String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(parsed) = try_parse(&buf) {
            return Ok(parsed);
        }
    }
    try_parse(&buf).context("truncated HTTP request")
}

fn try_parse(buf: &[u8]) -> Option<(String, String, String)> {
    let text = String::from_utf8_lossy(buf);
    let header_end = text.find("\r\n\r\n")?;
    let head = &text[..header_end];
    let mut request_line = head.lines().next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();

    let content_length = head
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let body = &text[header_end + 4..];
    if body.len() < content_length {
        return None;
    }
    Some((method, path, body[..content_length].to_string()))
}
