//! Configuration: a single YAML file loaded once at startup.
//!
//! Loading goes through three stages: deserialize (serde fills defaults),
//! initialize (cluster RPC defaults, identity keypairs read from disk), and
//! validate. Role commands and hooks are template-expanded eagerly against
//! the loaded identities so that no templating can fail mid-failover.
//!
//! Template variables, written as `{{Name}}` in any command, arg or env
//! value: `ActiveIdentityKeypairFile`, `ActiveIdentityPubkey`,
//! `PassiveIdentityKeypairFile`, `PassiveIdentityPubkey`, `SelfName`.

use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::bail;
use ed25519_dalek::SigningKey;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

const CLUSTER_NAME_CUSTOM: &str = "custom";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error loading config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("error parsing config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("failed to load keypair {}: {reason}", .path.display())]
    Keypair { path: PathBuf, reason: String },
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Complete configuration for one supervisor instance.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    pub failover: FailoverConfig,
}

impl Config {
    /// Load, initialize and validate a config file. `~` expands to the
    /// user's home directory.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let path = expand_tilde(path);
        let raw = fs::read_to_string(&path)?;
        let mut cfg: Config = serde_yaml::from_str(&raw)?;

        cfg.cluster.apply_defaults();
        cfg.validator.identities.load()?;
        cfg.validate()?;

        let data = TemplateData {
            active_identity_keypair_file: cfg.validator.identities.active.display().to_string(),
            active_identity_pubkey: cfg.validator.identities.active_pubkey().to_string(),
            passive_identity_keypair_file: cfg.validator.identities.passive.display().to_string(),
            passive_identity_pubkey: cfg.validator.identities.passive_pubkey().to_string(),
            self_name: cfg.validator.name.clone(),
        };
        cfg.failover.render(&data)?;

        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;
        self.validator.validate()?;
        self.cluster.validate()?;
        self.prometheus.validate()?;
        self.failover.validate()?;
        Ok(())
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

// ── log ──

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LogConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["debug", "info", "warn", "error", "fatal"];
        const FORMATS: [&str; 3] = ["text", "logfmt", "json"];
        if !LEVELS.contains(&self.level.as_str()) {
            return Err(invalid("log.level must be one of debug, info, warn, error, fatal"));
        }
        if !FORMATS.contains(&self.format.as_str()) {
            return Err(invalid("log.format must be one of text, logfmt, json"));
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// ── validator ──

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    /// Vanity name of this validator; becomes its peer name once self is
    /// inserted into the peer set.
    #[serde(default)]
    pub name: String,
    /// Local validator JSON-RPC endpoint, used by the role probe.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// HTTP services that return our public IPv4 in the response body,
    /// tried in order.
    #[serde(default = "default_public_ip_service_urls")]
    pub public_ip_service_urls: Vec<String>,
    pub identities: Identities,
}

impl ValidatorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(invalid("validator.name must be defined"));
        }
        let url = reqwest::Url::parse(&self.rpc_url)
            .map_err(|_| invalid("validator.rpc_url must be a valid URL"))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid("validator.rpc_url must be a valid URL"));
        }
        if self.public_ip_service_urls.is_empty() {
            return Err(invalid("validator.public_ip_service_urls must not be empty"));
        }
        Ok(())
    }

    /// Discover this node's public IPv4 by asking the configured services
    /// in order. The first body that parses as an IPv4 address wins.
    pub async fn discover_public_ip(&self) -> anyhow::Result<String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        for url in &self.public_ip_service_urls {
            match client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.text().await {
                    Ok(body) => {
                        let candidate = body.trim().to_string();
                        if candidate.parse::<Ipv4Addr>().is_ok() {
                            debug!(ip = %candidate, service = %url, "discovered public IP");
                            return Ok(candidate);
                        }
                        warn!(service = %url, body = %candidate, "public IP service returned a non-IPv4 body");
                    }
                    Err(e) => warn!(service = %url, error = %e, "failed to read public IP response"),
                },
                Ok(resp) => warn!(service = %url, status = %resp.status(), "public IP service returned an error status"),
                Err(e) => warn!(service = %url, error = %e, "public IP service unreachable"),
            }
        }
        bail!("failed to discover public IP from any of {:?}", self.public_ip_service_urls)
    }
}

fn default_rpc_url() -> String {
    "http://localhost:8899".to_string()
}

fn default_public_ip_service_urls() -> Vec<String> {
    vec![
        "https://ifconfig.me/ip".to_string(),
        "https://api.ipify.org".to_string(),
        "https://ipv4.icanhazip.com".to_string(),
    ]
}

/// The two keypairs every node holds: the shared active identity and this
/// node's own passive identity. Only the derived public keys are used here;
/// the private key material is touched by the user's role commands alone.
#[derive(Debug, Clone, Deserialize)]
pub struct Identities {
    pub active: PathBuf,
    pub passive: PathBuf,
    #[serde(skip)]
    active_pubkey: String,
    #[serde(skip)]
    passive_pubkey: String,
}

impl Identities {
    fn load(&mut self) -> Result<(), ConfigError> {
        self.active_pubkey = load_keypair_pubkey(&self.active)?;
        self.passive_pubkey = load_keypair_pubkey(&self.passive)?;
        if self.active_pubkey == self.passive_pubkey {
            return Err(invalid(
                "validator.identities.active and validator.identities.passive must be distinct keypairs",
            ));
        }
        Ok(())
    }

    pub fn active_pubkey(&self) -> &str {
        &self.active_pubkey
    }

    pub fn passive_pubkey(&self) -> &str {
        &self.passive_pubkey
    }
}

/// Read a Solana-style keypair file (JSON array of 64 bytes: 32-byte secret
/// followed by the 32-byte public key) and return the base58 public key.
fn load_keypair_pubkey(path: &Path) -> Result<String, ConfigError> {
    let keypair_err = |reason: String| ConfigError::Keypair {
        path: path.to_path_buf(),
        reason,
    };

    let raw = fs::read_to_string(path).map_err(|e| keypair_err(e.to_string()))?;
    let bytes: Vec<u8> = serde_json::from_str(&raw).map_err(|e| keypair_err(e.to_string()))?;
    if bytes.len() != 64 {
        return Err(keypair_err(format!("expected 64 bytes, got {}", bytes.len())));
    }

    let mut secret = [0u8; 32];
    secret.copy_from_slice(&bytes[..32]);
    let derived = SigningKey::from_bytes(&secret).verifying_key().to_bytes();
    if derived[..] != bytes[32..] {
        return Err(keypair_err("public key does not match secret key".to_string()));
    }

    Ok(bs58::encode(derived).into_string())
}

// ── cluster ──

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            name: default_cluster_name(),
            rpc_urls: Vec::new(),
        }
    }
}

impl ClusterConfig {
    fn apply_defaults(&mut self) {
        if !self.rpc_urls.is_empty() {
            return;
        }
        self.rpc_urls = match self.name.as_str() {
            "mainnet-beta" => vec!["https://api.mainnet-beta.solana.com".to_string()],
            "devnet" => vec!["https://api.devnet.solana.com".to_string()],
            "testnet" => vec!["https://api.testnet.solana.com".to_string()],
            _ => Vec::new(),
        };
    }

    fn validate(&self) -> Result<(), ConfigError> {
        const NAMES: [&str; 4] = ["mainnet-beta", "devnet", "testnet", CLUSTER_NAME_CUSTOM];
        if !NAMES.contains(&self.name.as_str()) {
            return Err(invalid("cluster.name must be one of mainnet-beta, devnet, testnet, custom"));
        }
        if self.rpc_urls.is_empty() {
            return Err(invalid("cluster.rpc_urls must be defined when cluster.name is custom"));
        }
        Ok(())
    }
}

fn default_cluster_name() -> String {
    "mainnet-beta".to_string()
}

// ── prometheus ──

#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusConfig {
    /// /metrics port; port + 1 is reserved for /health.
    #[serde(default = "default_prometheus_port")]
    pub port: u16,
    /// Extra labels attached to every exported series.
    #[serde(default)]
    pub static_labels: BTreeMap<String, String>,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        PrometheusConfig {
            port: default_prometheus_port(),
            static_labels: BTreeMap::new(),
        }
    }
}

impl PrometheusConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 || self.port == u16::MAX {
            return Err(invalid("prometheus.port must be between 1 and 65534 (port + 1 serves /health)"));
        }
        Ok(())
    }
}

fn default_prometheus_port() -> u16 {
    9099
}

// ── failover ──

#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    /// Log commands and hooks as if run, but never fork.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "de_duration",
        rename = "poll_interval_duration"
    )]
    pub poll_interval: Duration,
    /// Consecutive refreshes without an active peer before failover starts.
    #[serde(default = "default_leaderless_samples_threshold")]
    pub leaderless_samples_threshold: u32,
    /// Upper bound (exclusive) of the random jitter added to the ranked
    /// takeover delay, in seconds.
    #[serde(default = "default_takeover_jitter_seconds")]
    pub takeover_jitter_seconds: u32,
    pub active: RoleConfig,
    pub passive: RoleConfig,
    #[serde(default)]
    pub peers: Peers,
}

impl FailoverConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(invalid("failover.poll_interval_duration must be greater than zero"));
        }
        if self.leaderless_samples_threshold == 0 {
            return Err(invalid("failover.leaderless_samples_threshold must be positive and non-zero"));
        }
        if self.takeover_jitter_seconds == 0 {
            return Err(invalid("failover.takeover_jitter_seconds must be positive and non-zero"));
        }
        self.active
            .validate()
            .map_err(|e| invalid(format!("failover.active.{e}")))?;
        self.passive
            .validate()
            .map_err(|e| invalid(format!("failover.passive.{e}")))?;
        self.peers.validate()?;
        Ok(())
    }

    fn render(&mut self, data: &TemplateData) -> Result<(), ConfigError> {
        self.active
            .render(data)
            .map_err(|e| invalid(format!("failover.active.{e}")))?;
        self.passive
            .render(data)
            .map_err(|e| invalid(format!("failover.passive.{e}")))?;
        Ok(())
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_leaderless_samples_threshold() -> u32 {
    3
}

fn default_takeover_jitter_seconds() -> u32 {
    3
}

/// The peer set declared at startup, keyed by vanity name. Self is not in
/// the declared set; the manager inserts it after public-IP discovery.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Peers(BTreeMap<String, Peer>);

#[derive(Debug, Clone, Deserialize)]
pub struct Peer {
    pub ip: String,
}

impl Peers {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Peer)> {
        self.0.iter()
    }

    pub fn has_ip(&self, ip: &str) -> bool {
        self.0.values().any(|p| p.ip == ip)
    }

    pub fn name_for_ip(&self, ip: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(_, p)| p.ip == ip)
            .map(|(name, _)| name.as_str())
    }

    pub fn insert(&mut self, name: String, ip: String) {
        self.0.insert(name, Peer { ip });
    }

    /// All peer IPs in the deterministic takeover ranking: lexicographic
    /// order of the IPv4 strings. Every node with the same peer set computes
    /// the same ranking.
    pub fn ranked_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self.0.values().map(|p| p.ip.clone()).collect();
        ips.sort();
        ips
    }

    /// 1-based rank of `ip` in the deterministic ranking.
    pub fn rank_of(&self, ip: &str) -> Option<usize> {
        self.ranked_ips().iter().position(|i| i == ip).map(|i| i + 1)
    }

    pub fn summary(&self) -> String {
        self.0
            .iter()
            .map(|(name, p)| format!("{name}={}", p.ip))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.0.is_empty() {
            return Err(invalid("failover.peers - at least one peer must be defined"));
        }
        let mut seen = Vec::with_capacity(self.0.len());
        for (name, peer) in &self.0 {
            if peer.ip.parse::<Ipv4Addr>().is_err() {
                return Err(invalid(format!(
                    "failover.peers - invalid IP address {} for peer {name}",
                    peer.ip
                )));
            }
            if seen.contains(&peer.ip.as_str()) {
                return Err(invalid(format!("failover.peers - duplicate IP address {}", peer.ip)));
            }
            seen.push(peer.ip.as_str());
        }
        Ok(())
    }
}

// ── roles and hooks ──

/// One side of a role transition: the command that assumes the role, plus
/// its pre/post hooks.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub hooks: Hooks,
}

impl RoleConfig {
    fn validate(&self) -> Result<(), String> {
        if self.command.is_empty() {
            return Err("command must be defined".to_string());
        }
        self.hooks.validate()
    }

    fn render(&mut self, data: &TemplateData) -> Result<(), String> {
        render_command_parts(&mut self.command, &mut self.args, &mut self.env, data)
            .map_err(|e| format!("command: {e}"))?;
        for (i, hook) in self.hooks.pre.iter_mut().enumerate() {
            render_command_parts(&mut hook.command, &mut hook.args, &mut hook.env, data)
                .map_err(|e| format!("hooks.pre[{i}]: {e}"))?;
        }
        for (i, hook) in self.hooks.post.iter_mut().enumerate() {
            render_command_parts(&mut hook.command, &mut hook.args, &mut hook.env, data)
                .map_err(|e| format!("hooks.post[{i}]: {e}"))?;
        }
        Ok(())
    }

    /// Run the role command. No timeout by design: real role transitions can
    /// legitimately block for minutes.
    pub async fn run_command(&self, stage: &str, dry_run: bool) -> anyhow::Result<()> {
        crate::command::run(stage, &self.command, &self.args, &self.env, dry_run).await
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub pre: Vec<Hook>,
    #[serde(default)]
    pub post: Vec<Hook>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hook {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Pre-hooks only: a failure aborts the current role transition.
    #[serde(default)]
    pub must_succeed: bool,
}

impl Hooks {
    fn validate(&self) -> Result<(), String> {
        for (i, hook) in self.pre.iter().enumerate() {
            hook.validate(true).map_err(|e| format!("hooks.pre[{i}] {e}"))?;
        }
        for (i, hook) in self.post.iter().enumerate() {
            hook.validate(false).map_err(|e| format!("hooks.post[{i}] {e}"))?;
        }
        Ok(())
    }

    /// Run pre-hooks in declared order. A failing hook with `must_succeed`
    /// aborts and returns the error; other failures are logged and skipped.
    pub async fn run_pre(&self, stage: &str, dry_run: bool) -> anyhow::Result<()> {
        for hook in &self.pre {
            let name = format!("{stage}-hook {}", hook.name);
            let result = crate::command::run(&name, &hook.command, &hook.args, &hook.env, dry_run).await;
            if let Err(e) = result {
                if hook.must_succeed {
                    return Err(e);
                }
                tracing::error!(hook = %hook.name, error = %e, "hook failed");
            }
        }
        Ok(())
    }

    /// Run post-hooks in declared order. Failures are logged only; they can
    /// never abort anything.
    pub async fn run_post(&self, stage: &str, dry_run: bool) {
        for hook in &self.post {
            let name = format!("{stage}-hook {}", hook.name);
            let result = crate::command::run(&name, &hook.command, &hook.args, &hook.env, dry_run).await;
            if let Err(e) = result {
                tracing::error!(hook = %hook.name, error = %e, "hook failed");
            }
        }
    }
}

impl Hook {
    fn validate(&self, allow_must_succeed: bool) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("must have a name".to_string());
        }
        if self.command.is_empty() {
            return Err("must have a command".to_string());
        }
        if !allow_must_succeed && self.must_succeed {
            return Err("must_succeed not allowed for post hooks".to_string());
        }
        Ok(())
    }
}

// ── templates ──

pub struct TemplateData {
    pub active_identity_keypair_file: String,
    pub active_identity_pubkey: String,
    pub passive_identity_keypair_file: String,
    pub passive_identity_pubkey: String,
    pub self_name: String,
}

fn render_template(s: &str, data: &TemplateData) -> Result<String, String> {
    let rendered = s
        .replace("{{ActiveIdentityKeypairFile}}", &data.active_identity_keypair_file)
        .replace("{{ActiveIdentityPubkey}}", &data.active_identity_pubkey)
        .replace("{{PassiveIdentityKeypairFile}}", &data.passive_identity_keypair_file)
        .replace("{{PassiveIdentityPubkey}}", &data.passive_identity_pubkey)
        .replace("{{SelfName}}", &data.self_name);
    if rendered.contains("{{") {
        return Err(format!("unknown template variable in {s:?}"));
    }
    Ok(rendered)
}

fn render_command_parts(
    command: &mut String,
    args: &mut [String],
    env: &mut BTreeMap<String, String>,
    data: &TemplateData,
) -> Result<(), String> {
    *command = render_template(command, data)?;
    for arg in args.iter_mut() {
        *arg = render_template(arg, data)?;
    }
    for value in env.values_mut() {
        *value = render_template(value, data)?;
    }
    Ok(())
}

// ── durations ──

/// Parse durations like "500ms", "5s", "2m", "1h". Bare numbers are seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!("invalid duration unit in {s:?}")),
    }
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub(crate) fn write_keypair_file(seed: u8) -> NamedTempFile {
        let secret = [seed; 32];
        let public = SigningKey::from_bytes(&secret).verifying_key().to_bytes();
        let mut bytes = secret.to_vec();
        bytes.extend_from_slice(&public);
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&bytes).unwrap()).unwrap();
        file
    }

    fn config_yaml(active: &Path, passive: &Path) -> String {
        format!(
            r#"
validator:
  name: "test-validator"
  rpc_url: "http://localhost:8899"
  identities:
    active: "{}"
    passive: "{}"

cluster:
  name: "testnet"

prometheus:
  port: 9099
  static_labels:
    environment: "test"

failover:
  dry_run: true
  poll_interval_duration: "30s"
  leaderless_samples_threshold: 10
  takeover_jitter_seconds: 10
  active:
    command: "solana-validator"
    args: ["set-identity", "{{{{ActiveIdentityKeypairFile}}}}"]
  passive:
    command: "systemctl"
    args: ["restart", "solana-validator"]
    env:
      WHO: "{{{{SelfName}}}}"
  peers:
    validator-1:
      ip: "192.168.1.10"
    validator-2:
      ip: "192.168.1.11"
"#,
            active.display(),
            passive.display()
        )
    }

    fn load_test_config() -> Config {
        let active = write_keypair_file(1);
        let passive = write_keypair_file(2);
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", config_yaml(active.path(), passive.path())).unwrap();
        Config::from_file(file.path()).unwrap()
    }

    #[test]
    fn from_file_loads_and_renders() {
        let cfg = load_test_config();
        assert_eq!(cfg.validator.name, "test-validator");
        assert_eq!(cfg.failover.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.failover.leaderless_samples_threshold, 10);
        assert!(cfg.failover.dry_run);
        assert_eq!(cfg.cluster.rpc_urls, vec!["https://api.testnet.solana.com".to_string()]);

        // templates are expanded eagerly at load time
        assert_eq!(
            cfg.failover.active.args[1],
            cfg.validator.identities.active.display().to_string()
        );
        assert_eq!(cfg.failover.passive.env["WHO"], "test-validator");
    }

    #[test]
    fn defaults_are_applied() {
        let active = write_keypair_file(1);
        let passive = write_keypair_file(2);
        let yaml = format!(
            r#"
validator:
  name: "v"
  identities:
    active: "{}"
    passive: "{}"
failover:
  active:
    command: "a"
  passive:
    command: "p"
  peers:
    other:
      ip: "10.0.0.1"
"#,
            active.path().display(),
            passive.path().display()
        );
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{yaml}").unwrap();
        let cfg = Config::from_file(file.path()).unwrap();

        assert_eq!(cfg.log.level, "info");
        assert_eq!(cfg.log.format, "text");
        assert_eq!(cfg.validator.rpc_url, "http://localhost:8899");
        assert_eq!(cfg.prometheus.port, 9099);
        assert_eq!(cfg.failover.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.failover.leaderless_samples_threshold, 3);
        assert_eq!(cfg.failover.takeover_jitter_seconds, 3);
        assert_eq!(cfg.cluster.name, "mainnet-beta");
        assert_eq!(cfg.cluster.rpc_urls, vec!["https://api.mainnet-beta.solana.com".to_string()]);
    }

    #[test]
    fn keypair_pubkey_is_derived_and_checked() {
        let file = write_keypair_file(7);
        let pubkey = load_keypair_pubkey(file.path()).unwrap();
        let expected = bs58::encode(SigningKey::from_bytes(&[7u8; 32]).verifying_key().to_bytes())
            .into_string();
        assert_eq!(pubkey, expected);

        // corrupt the stored public half
        let mut bytes = [7u8; 32].to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        let mut bad = NamedTempFile::new().unwrap();
        write!(bad, "{}", serde_json::to_string(&bytes).unwrap()).unwrap();
        let err = load_keypair_pubkey(bad.path()).unwrap_err();
        assert!(err.to_string().contains("public key does not match"));
    }

    #[test]
    fn failover_validation_messages() {
        let mut cfg = load_test_config();

        cfg.failover.poll_interval = Duration::ZERO;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("failover.poll_interval_duration must be greater than zero"));
        cfg.failover.poll_interval = Duration::from_secs(5);

        cfg.failover.leaderless_samples_threshold = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("failover.leaderless_samples_threshold must be positive and non-zero"));
        cfg.failover.leaderless_samples_threshold = 3;

        cfg.failover.active.command = String::new();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("failover.active.command must be defined"));
        cfg.failover.active.command = "a".to_string();

        cfg.failover.peers = Peers::default();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("failover.peers - at least one peer must be defined"));

        cfg.failover.peers.insert("bad".to_string(), "not-an-ip".to_string());
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("failover.peers - invalid IP address"));

        cfg.failover.peers = Peers::default();
        cfg.failover.peers.insert("a".to_string(), "192.168.1.10".to_string());
        cfg.failover.peers.insert("b".to_string(), "192.168.1.10".to_string());
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("failover.peers - duplicate IP address"));
    }

    #[test]
    fn hook_validation() {
        let mut cfg = load_test_config();
        cfg.failover.active.hooks.pre.push(Hook {
            name: String::new(),
            command: "echo".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            must_succeed: true,
        });
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("failover.active.hooks.pre[0] must have a name"));

        cfg.failover.active.hooks.pre[0].name = "named".to_string();
        cfg.failover.active.hooks.pre[0].command = String::new();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("must have a command"));

        cfg.failover.active.hooks.pre.clear();
        cfg.failover.active.hooks.post.push(Hook {
            name: "post".to_string(),
            command: "echo".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            must_succeed: true,
        });
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("must_succeed not allowed for post hooks"));
    }

    #[test]
    fn unknown_template_variable_is_rejected() {
        let data = TemplateData {
            active_identity_keypair_file: "a".to_string(),
            active_identity_pubkey: "ap".to_string(),
            passive_identity_keypair_file: "p".to_string(),
            passive_identity_pubkey: "pp".to_string(),
            self_name: "self".to_string(),
        };
        assert_eq!(render_template("{{SelfName}}", &data).unwrap(), "self");
        assert!(render_template("{{Bogus}}", &data).is_err());
    }

    #[test]
    fn peers_ranking_is_lexicographic_and_stable() {
        let mut peers = Peers::default();
        peers.insert("c".to_string(), "10.0.0.3".to_string());
        peers.insert("a".to_string(), "10.0.0.1".to_string());
        peers.insert("b".to_string(), "10.0.0.2".to_string());

        assert_eq!(peers.ranked_ips(), vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(peers.rank_of("10.0.0.1"), Some(1));
        assert_eq!(peers.rank_of("10.0.0.3"), Some(3));
        assert_eq!(peers.rank_of("10.0.0.9"), None);
        assert!(peers.has_ip("10.0.0.2"));
        assert_eq!(peers.name_for_ip("10.0.0.2"), Some("b"));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("").is_err());
    }
}
