//! The HA decision loop.
//!
//! One tick at a time: refresh gossip, publish state, walk the decision
//! tree, and, when promotion is warranted, serialize the race against the
//! other passive peers with a ranked delay plus jitter and a second look at
//! gossip before running the user's active command.
//!
//! There is no coordinator and no peer-to-peer channel. All signals are
//! indirect: cluster gossip, vote accounts, and the local validator RPC.

use std::time::Duration;

use anyhow::{ensure, Result};
use rand::Rng;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::gossip;
use crate::metrics::{self, ControlState};
use crate::probe::RoleProbe;
use crate::rpc;

#[derive(Debug)]
pub struct Manager {
    cfg: Config,
    self_name: String,
    self_ip: String,
    /// Number of peers declared in config, not counting us. With one
    /// declared peer there is nobody to race against for takeover.
    declared_peer_count: usize,
    gossip_state: gossip::State,
    probe: RoleProbe,
    state_tx: watch::Sender<ControlState>,
}

impl Manager {
    /// Discover the public IP, then assemble the manager.
    pub async fn new(cfg: Config) -> Result<Self> {
        let public_ip = cfg.validator.discover_public_ip().await?;
        Self::with_public_ip(cfg, public_ip)
    }

    /// Assemble the manager with a known public IP. The configured peer set
    /// must not contain us; we insert ourselves once the IP is known.
    pub fn with_public_ip(mut cfg: Config, public_ip: String) -> Result<Self> {
        ensure!(
            !cfg.failover.peers.has_ip(&public_ip),
            "failover.peers must not reference ourselves, found {public_ip} in failover.peers"
        );

        let declared_peer_count = cfg.failover.peers.len();
        let self_name = cfg.validator.name.clone();
        debug!(name = %self_name, ip = %public_ip, "adding us to config peers");
        cfg.failover.peers.insert(self_name.clone(), public_ip.clone());

        info!(
            public_ip = %public_ip,
            cluster_rpc_urls = ?cfg.cluster.rpc_urls,
            validator_rpc_url = %cfg.validator.rpc_url,
            active_pubkey = %cfg.validator.identities.active_pubkey(),
            passive_pubkey = %cfg.validator.identities.passive_pubkey(),
            peers = %cfg.failover.peers.summary(),
            "initializing"
        );

        let gossip_state = gossip::State::new(gossip::Options {
            cluster_rpc: rpc::Client::new("cluster", cfg.cluster.rpc_urls.clone()),
            active_pubkey: cfg.validator.identities.active_pubkey().to_string(),
            config_peers: cfg.failover.peers.clone(),
        });
        let probe = RoleProbe::new(
            rpc::Client::new("local", vec![cfg.validator.rpc_url.clone()]),
            cfg.validator.identities.active_pubkey().to_string(),
        );
        let (state_tx, _) = watch::channel(ControlState::initial(self_name.clone(), public_ip.clone()));

        Ok(Manager {
            cfg,
            self_name,
            self_ip: public_ip,
            declared_peer_count,
            gossip_state,
            probe,
            state_tx,
        })
    }

    /// Run until SIGINT or SIGTERM. An in-flight tick (including a role
    /// command) finishes before the loop exits, so a shutdown never leaves
    /// the cluster half-promoted.
    pub async fn run(mut self) -> Result<()> {
        self.spawn_http_servers();

        info!(poll_interval = ?self.cfg.failover.poll_interval, "monitoring HA state");

        // Initial refresh so the first tick starts from a populated
        // snapshot, and a greeting if an active peer is already visible.
        self.gossip_state.refresh().await;
        if let Some(active) = self.gossip_state.get_active_peer() {
            let message = if active.ip == self.self_ip {
                "active peer found (us)"
            } else {
                "active peer found"
            };
            info!(name = %active.name, public_ip = %active.ip, pubkey = %active.pubkey, "{message}");
        }

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut ticker = tokio::time::interval(self.cfg.failover.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
                _ = ticker.tick() => self.ensure_ha_state().await,
            }
        }

        info!("HA monitor loop done");
        Ok(())
    }

    fn spawn_http_servers(&self) {
        let metrics_port = self.cfg.prometheus.port;
        let static_labels = self.cfg.prometheus.static_labels.clone();
        let state_rx = self.state_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(metrics_port, static_labels, state_rx).await {
                error!(error = %e, "metrics server error");
            }
        });
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_health(metrics_port + 1).await {
                error!(error = %e, "health check server error");
            }
        });
    }

    /// One tick of the decision loop. First matching rule wins.
    async fn ensure_ha_state(&mut self) {
        debug!("ensuring HA");

        self.gossip_state.refresh().await;
        self.publish_control_state().await;

        // Not in gossip: startup, network dropout, or our own restart.
        // Demote and sit the failover out until gossip sees us again.
        if !self.gossip_state.has_ip(&self.self_ip) {
            warn!(public_ip = %self.self_ip, "we are not in gossip - ensuring we are passive");
            self.ensure_passive().await;
            return;
        }

        // Just rediscovered: no action this tick, prevents flapping on
        // recovery.
        if self.gossip_state.is_recently_in_gossip(&self.self_ip) {
            info!(pubkey = %self.self_gossip_pubkey(), public_ip = %self.self_ip, "we are in gossip");
            return;
        }

        // The lookback over the last N samples absorbs RPC glitches and
        // single stale reads.
        let threshold = self.cfg.failover.leaderless_samples_threshold;
        if self.gossip_state.leaderless_samples_below_threshold(threshold) {
            debug!("active peer found - no failover required");
            return;
        }

        error!(
            leaderless_samples = self.gossip_state.leaderless_samples(),
            "no active peer found - failover required"
        );

        // Unhealthy nodes may never promote.
        if !self.probe.is_healthy().await {
            error!("we are not healthy - unable to become active in failover");
            return;
        }

        // Gossip lost us as active but the local validator still thinks it
        // is: force consistency by demoting.
        if self.probe.is_active().await {
            warn!("we are already active as reported by local rpc - unable to become active in failover and ensuring we are passive");
            self.ensure_passive().await;
            return;
        }

        self.delay_takeover().await;

        // Re-observe: someone ahead of us in the ranking may have taken
        // over during the delay.
        self.gossip_state.refresh().await;
        if self.gossip_state.leaderless_samples_below_threshold(threshold) {
            match self.gossip_state.get_active_peer() {
                Some(active) => warn!(
                    name = %active.name, ip = %active.ip, pubkey = %active.pubkey,
                    "peer became active during takeover delay"
                ),
                None => warn!("failed to get active peer from state, but we know someone else already assumed active role"),
            }
            return;
        }

        info!(pubkey = %self.cfg.validator.identities.active_pubkey(), "becoming active");
        self.ensure_active().await;
    }

    /// Promote: pre-hooks, active command, post-hooks, probe post-check.
    /// Any abort here leaves the node passive; the next tick retries.
    async fn ensure_active(&mut self) {
        let active_pubkey = self.cfg.validator.identities.active_pubkey().to_string();
        let dry_run = self.cfg.failover.dry_run;
        let role = self.cfg.failover.active.clone();

        self.set_failover_status(metrics::FAILOVER_BECOMING_ACTIVE);

        if !role.hooks.pre.is_empty() {
            debug!("running pre-active hooks");
            if let Err(e) = role.hooks.run_pre("pre-active", dry_run).await {
                error!(error = %e, "failed to run pre-active hooks");
                return;
            }
        }

        debug!("running active command");
        if let Err(e) = role.run_command("active", dry_run).await {
            warn!(error = %e, "failed to run active command");
            return;
        }

        if !role.hooks.post.is_empty() {
            debug!("running post-active hooks");
            role.hooks.run_post("post-active", dry_run).await;
        }

        if !self.probe.is_active().await {
            error!(active_pubkey = %active_pubkey,
                "this node is not active as reported by local rpc - unable to become active in failover");
            return;
        }

        info!(active_pubkey = %active_pubkey, "we are confirmed to be active");
    }

    /// Demote: pre-hooks, passive command, post-hooks, probe post-check,
    /// then one more gossip look to report where we ended up. The passive
    /// command is expected to be idempotent.
    async fn ensure_passive(&mut self) {
        let passive_pubkey = self.cfg.validator.identities.passive_pubkey().to_string();
        let dry_run = self.cfg.failover.dry_run;
        let role = self.cfg.failover.passive.clone();

        self.set_failover_status(metrics::FAILOVER_BECOMING_PASSIVE);

        if !role.hooks.pre.is_empty() {
            debug!("running pre-passive hooks");
            if let Err(e) = role.hooks.run_pre("pre-passive", dry_run).await {
                error!(error = %e, "failed to run pre-passive hooks");
                return;
            }
        }

        debug!("running passive command");
        if let Err(e) = role.run_command("passive", dry_run).await {
            warn!(error = %e, "failed to run passive command");
            return;
        }

        if !role.hooks.post.is_empty() {
            debug!("running post-passive hooks");
            role.hooks.run_post("post-passive", dry_run).await;
        }

        if !self.probe.is_passive().await {
            error!(passive_pubkey = %passive_pubkey,
                "we are not passive as reported by local rpc - unable to become active in failover");
            return;
        }

        debug!(passive_pubkey = %passive_pubkey, "we are confirmed to be passive as reported by local rpc");

        self.gossip_state.refresh().await;

        if !self.gossip_state.has_ip(&self.self_ip) {
            warn!(passive_pubkey = %passive_pubkey, "we are not in gossip after becoming passive");
            return;
        }

        if !self.probe.is_passive().await {
            error!(passive_pubkey = %passive_pubkey,
                "we are in gossip but not passive - this should not happen, check failover.passive.command logic");
            return;
        }

        info!(passive_pubkey = %passive_pubkey, "we are confirmed to be passive");
    }

    /// Stagger racing passive peers: rank seconds (deterministic by IP
    /// ordering) plus uniform jitter to break symmetric configurations.
    /// With a single known peer there is no race to lose.
    async fn delay_takeover(&self) {
        if self.declared_peer_count <= 1 {
            return;
        }

        let rank = self.cfg.failover.peers.rank_of(&self.self_ip).unwrap_or(1) as u64;
        let jitter = rand::thread_rng().gen_range(0..u64::from(self.cfg.failover.takeover_jitter_seconds));
        let delay = Duration::from_secs(rank + jitter);
        debug!(?delay, rank, "delaying takeover to avoid race conditions");
        tokio::time::sleep(delay).await;
    }

    /// Recompute role/health and publish a fresh idle ControlState.
    async fn publish_control_state(&mut self) {
        debug!("refreshing metrics");

        let role = if self.probe.is_active().await {
            metrics::ROLE_ACTIVE
        } else if self.probe.is_passive().await {
            metrics::ROLE_PASSIVE
        } else {
            metrics::ROLE_UNKNOWN
        };
        let status = if self.probe.is_healthy().await {
            metrics::STATUS_HEALTHY
        } else {
            metrics::STATUS_UNHEALTHY
        };
        let peer_count = self
            .gossip_state
            .peer_states()
            .values()
            .filter(|p| p.ip != self.self_ip)
            .count();
        let self_in_gossip = self.gossip_state.has_ip(&self.self_ip);

        let state = ControlState {
            validator_name: self.self_name.clone(),
            public_ip: self.self_ip.clone(),
            role,
            status,
            peer_count,
            self_in_gossip,
            failover_status: metrics::FAILOVER_IDLE,
        };
        debug!(role, status, peer_count, self_in_gossip, "metrics refreshed");
        self.state_tx.send_replace(state);
    }

    fn set_failover_status(&self, failover_status: &'static str) {
        let mut state = self.state_tx.borrow().clone();
        state.failover_status = failover_status;
        self.state_tx.send_replace(state);
    }

    fn self_gossip_pubkey(&self) -> String {
        self.gossip_state
            .peer_states()
            .values()
            .find(|p| p.ip == self.self_ip)
            .map(|p| p.pubkey.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn state_rx(&self) -> watch::Receiver<ControlState> {
        self.state_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn write_keypair_file(seed: u8) -> NamedTempFile {
        let secret = [seed; 32];
        let public = SigningKey::from_bytes(&secret).verifying_key().to_bytes();
        let mut bytes = secret.to_vec();
        bytes.extend_from_slice(&public);
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&bytes).unwrap()).unwrap();
        file
    }

    struct Fixture {
        cfg: Config,
        _keypairs: (NamedTempFile, NamedTempFile),
        dir: TempDir,
    }

    /// A config whose role commands leave marker files behind, against a
    /// local RPC that is unreachable (every probe answers false).
    fn fixture(dry_run: bool, failing_pre_hook: bool) -> Fixture {
        let active = write_keypair_file(1);
        let passive = write_keypair_file(2);
        let dir = tempfile::tempdir().unwrap();
        let active_marker = dir.path().join("active-ran");
        let post_marker = dir.path().join("post-ran");

        let pre_hooks = if failing_pre_hook {
            r#"
    hooks:
      pre:
        - name: "gate"
          command: "sh"
          args: ["-c", "exit 1"]
          must_succeed: true
      post:
        - name: "announce"
          command: "touch"
          args: ["POST_MARKER"]
"#
        } else {
            ""
        };

        let yaml = format!(
            r#"
validator:
  name: "test-validator"
  rpc_url: "http://127.0.0.1:1"
  identities:
    active: "{active}"
    passive: "{passive}"
cluster:
  name: "custom"
  rpc_urls: ["http://127.0.0.1:1"]
failover:
  dry_run: {dry_run}
  active:
    command: "touch"
    args: ["{active_marker}"]{pre_hooks}
  passive:
    command: "true"
  peers:
    peer-1:
      ip: "10.0.0.1"
    peer-2:
      ip: "10.0.0.2"
"#,
            active = active.path().display(),
            passive = passive.path().display(),
            active_marker = active_marker.display(),
            pre_hooks = pre_hooks.replace("POST_MARKER", &post_marker.display().to_string()),
        );
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{yaml}").unwrap();
        let cfg = Config::from_file(file.path()).unwrap();
        Fixture {
            cfg,
            _keypairs: (active, passive),
            dir,
        }
    }

    #[test]
    fn self_ip_in_peer_set_is_rejected() {
        let fx = fixture(false, false);
        let err = Manager::with_public_ip(fx.cfg, "10.0.0.1".to_string()).unwrap_err();
        assert!(err.to_string().contains("must not reference ourselves"));
    }

    #[test]
    fn self_is_inserted_into_the_peer_set() {
        let fx = fixture(false, false);
        let manager = Manager::with_public_ip(fx.cfg, "10.0.0.3".to_string()).unwrap();
        assert!(manager.cfg.failover.peers.has_ip("10.0.0.3"));
        assert_eq!(manager.cfg.failover.peers.len(), 3);
        assert_eq!(manager.cfg.failover.peers.rank_of("10.0.0.3"), Some(3));
    }

    #[tokio::test]
    async fn ensure_active_runs_the_role_command() {
        let fx = fixture(false, false);
        let marker = fx.dir.path().join("active-ran");
        let mut manager = Manager::with_public_ip(fx.cfg, "10.0.0.3".to_string()).unwrap();
        let rx = manager.state_rx();

        manager.ensure_active().await;

        // command ran; the probe post-check fails (local RPC unreachable)
        // which only logs
        assert!(marker.exists());
        assert_eq!(rx.borrow().failover_status, metrics::FAILOVER_BECOMING_ACTIVE);
    }

    #[tokio::test]
    async fn failing_must_succeed_pre_hook_aborts_promotion() {
        let fx = fixture(false, true);
        let marker = fx.dir.path().join("active-ran");
        let post_marker = fx.dir.path().join("post-ran");
        let mut manager = Manager::with_public_ip(fx.cfg, "10.0.0.3".to_string()).unwrap();

        manager.ensure_active().await;

        // neither the role command nor the post-hooks may run
        assert!(!marker.exists());
        assert!(!post_marker.exists());
    }

    #[tokio::test]
    async fn dry_run_executes_nothing() {
        let fx = fixture(true, false);
        let marker = fx.dir.path().join("active-ran");
        let mut manager = Manager::with_public_ip(fx.cfg, "10.0.0.3".to_string()).unwrap();

        manager.ensure_active().await;

        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn takeover_delay_skipped_with_one_declared_peer() {
        let fx = fixture(false, false);
        let mut manager = Manager::with_public_ip(fx.cfg, "10.0.0.8".to_string()).unwrap();
        // a two-node set: one declared peer plus us, nobody to race
        manager.declared_peer_count = 1;

        let started = std::time::Instant::now();
        manager.delay_takeover().await;
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_delay_is_rank_plus_jitter() {
        let fx = fixture(false, false);
        // peers are 10.0.0.1 and 10.0.0.2; our IP ranks third
        let manager = Manager::with_public_ip(fx.cfg, "10.0.0.3".to_string()).unwrap();
        assert_eq!(manager.declared_peer_count, 2);
        assert_eq!(manager.cfg.failover.peers.rank_of("10.0.0.3"), Some(3));

        // jitter is in [0, takeover_jitter_seconds), so the delay is
        // bounded by rank and rank + jitter - 1 seconds
        let jitter = u64::from(manager.cfg.failover.takeover_jitter_seconds);
        let started = tokio::time::Instant::now();
        manager.delay_takeover().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(3 + jitter));
    }
}
