//! Cluster gossip state: which configured peers are visible, which one (if
//! any) currently holds the shared active identity, and for how many
//! consecutive samples the cluster has looked leaderless.
//!
//! A peer only enters the snapshot if its gossip address is actually
//! dialable; `getClusterNodes` happily returns stale entries for nodes
//! that dropped off the network. A peer carrying the shared active pubkey
//! additionally has to pass the voting check before it counts as active.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::config::Peers;
use crate::rpc::{self, ClusterNode};

/// Accounts below this balance cannot persist on chain. A delinquent active
/// node that is merely broke is still treated as voting: failing over would
/// only hand the funding problem to the next peer. 890880 lamports is the
/// substrate's rent-exempt minimum for a system account.
const RENT_EXEMPT_MINIMUM_LAMPORTS: u64 = 890_880;

/// How a present peer was classified in the latest sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// In gossip with a non-shared identity.
    Passive,
    /// In gossip with the shared active identity and passing the voting
    /// check.
    ActiveVoting,
}

#[derive(Debug, Clone)]
pub struct PeerState {
    pub name: String,
    pub ip: String,
    pub pubkey: String,
    pub last_seen_at: DateTime<Utc>,
    pub role: PeerRole,
    /// Present now, but missing from the previous sample.
    pub recently_in_gossip: bool,
}

impl PeerState {
    pub fn is_active(&self) -> bool {
        self.role == PeerRole::ActiveVoting
    }
}

pub struct Options {
    pub cluster_rpc: rpc::Client,
    pub active_pubkey: String,
    pub config_peers: Peers,
}

#[derive(Debug)]
pub struct State {
    cluster_rpc: rpc::Client,
    active_pubkey: String,
    config_peers: Peers,
    dial_timeout: Duration,
    peer_states: HashMap<String, PeerState>,
    missing_gossip_ips: Vec<String>,
    last_active_peer: Option<PeerState>,
    leaderless_samples: u32,
    refreshed_at: Option<DateTime<Utc>>,
}

impl State {
    pub fn new(opts: Options) -> Self {
        let dial_timeout = opts.cluster_rpc.timeout();
        State {
            cluster_rpc: opts.cluster_rpc,
            active_pubkey: opts.active_pubkey,
            config_peers: opts.config_peers,
            dial_timeout,
            peer_states: HashMap::new(),
            missing_gossip_ips: Vec::new(),
            last_active_peer: None,
            leaderless_samples: 0,
            refreshed_at: None,
        }
    }

    /// Replace the snapshot with a fresh sample of cluster gossip.
    ///
    /// If the membership query itself fails the snapshot is cleared and the
    /// leaderless counter is left untouched: an empty snapshot already
    /// pushes the decision loop toward the safe direction (demote), and we
    /// cannot tell whether the cluster is actually leaderless.
    pub async fn refresh(&mut self) {
        debug!("refreshing peers state");

        let cluster_nodes = match self.cluster_rpc.get_cluster_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                self.peer_states.clear();
                self.refreshed_at = Some(Utc::now());
                error!(error = %e, "failed to get cluster nodes");
                return;
            }
        };

        debug!(
            cluster_nodes_count = cluster_nodes.len(),
            peers_count = self.config_peers.len(),
            peers = %self.config_peers.summary(),
            active_pubkey = %self.active_pubkey,
            "looking for peers in gossip"
        );

        let mut latest: HashMap<String, PeerState> = HashMap::new();
        let mut leaderless_sample = true;

        for node in &cluster_nodes {
            let Some(gossip_addr) = node.gossip.as_deref() else {
                continue;
            };
            let ip = gossip_addr.split(':').next().unwrap_or_default().to_string();
            let is_shared_active = node.pubkey == self.active_pubkey;

            let Some(name) = self.config_peers.name_for_ip(&ip).map(str::to_string) else {
                if is_shared_active {
                    warn!(ip = %ip, pubkey = %node.pubkey,
                        "node holds the shared active identity but is not a configured peer - ignoring");
                }
                continue;
            };

            if !self.is_gossip_addr_alive(gossip_addr).await {
                debug!(peer_name = %name, ip = %ip, gossip_address = %gossip_addr, pubkey = %node.pubkey,
                    "node gossip address not alive - excluding from state");
                continue;
            }

            // An apparent active peer might be in gossip but no longer
            // voting; only a voting node counts as active.
            if is_shared_active && !self.is_node_active_and_voting(node).await {
                warn!(ip = %ip, pubkey = %node.pubkey,
                    "active peer appears in gossip but is not voting - excluding from state");
                continue;
            }

            let peer = PeerState {
                name: name.clone(),
                ip: ip.clone(),
                pubkey: node.pubkey.clone(),
                last_seen_at: Utc::now(),
                role: if is_shared_active {
                    PeerRole::ActiveVoting
                } else {
                    PeerRole::Passive
                },
                recently_in_gossip: self.missing_gossip_ips.contains(&ip),
            };

            if peer.is_active() {
                leaderless_sample = false;
                if let Some(last) = &self.last_active_peer {
                    if last.ip != peer.ip {
                        warn!(
                            "active peer changed: {} ({}) -> {} ({})",
                            last.ip, last.name, peer.ip, peer.name
                        );
                    }
                }
                debug!(name = %peer.name, ip = %peer.ip, pubkey = %peer.pubkey,
                    last_seen_at = %peer.last_seen_at.to_rfc3339(), "active peer found");
                self.last_active_peer = Some(peer.clone());
            }

            if !self.has_ip(&peer.ip) {
                info!(name = %peer.name, ip = %peer.ip, pubkey = %peer.pubkey,
                    is_active = peer.is_active(), "peer discovered in gossip");
            }

            latest.insert(name, peer);

            if latest.len() == self.config_peers.len() {
                break;
            }
        }

        let latest_missing: Vec<String> = self
            .config_peers
            .iter()
            .filter(|(name, _)| !latest.contains_key(*name))
            .map(|(_, peer)| peer.ip.clone())
            .collect();

        for ip in &latest_missing {
            let Some(name) = self.config_peers.name_for_ip(ip) else {
                continue;
            };
            if self.has_ip(ip) {
                warn!(name = %name, ip = %ip, "peer lost from gossip");
            } else if !self.missing_gossip_ips.contains(ip) {
                warn!(name = %name, ip = %ip, "peer not found in gossip");
            } else {
                debug!(name = %name, ip = %ip, "peer still missing from gossip");
            }
        }

        if leaderless_sample {
            self.leaderless_samples += 1;
            warn!(leaderless_samples_count = self.leaderless_samples, "no active peer found");
        } else {
            self.leaderless_samples = 0;
        }
        self.missing_gossip_ips = latest_missing;
        self.peer_states = latest;
        self.refreshed_at = Some(Utc::now());
        debug!(peer_count = self.peer_states.len(), "peers state refreshed");
    }

    /// Whether a node carrying the shared active identity is actually
    /// voting. RPC failures inside this check answer yes: a false-positive
    /// failover is worse than tolerating a flaky endpoint for one sample.
    async fn is_node_active_and_voting(&self, node: &ClusterNode) -> bool {
        let current_slot = match self.cluster_rpc.get_slot().await {
            Ok(slot) => slot,
            Err(e) => {
                error!(error = %e, "failed to get current slot");
                return true;
            }
        };

        let vote_accounts = match self.cluster_rpc.get_vote_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(error = %e, "failed to get vote accounts");
                return true;
            }
        };

        for delinquent in &vote_accounts.delinquent {
            if delinquent.node_pubkey != node.pubkey {
                continue;
            }

            // Delinquency with a balance below the rent-exempt minimum is a
            // funding problem, not a liveness problem. Promoting another
            // peer under the same identity would inherit it.
            let balance = match self.cluster_rpc.get_balance(&delinquent.node_pubkey).await {
                Ok(balance) => balance,
                Err(e) => {
                    error!(error = %e, "failed to get balance");
                    return true;
                }
            };
            if balance <= RENT_EXEMPT_MINIMUM_LAMPORTS {
                error!(pubkey = %node.pubkey, current_slot, balance,
                    "node is delinquent from balance being below rent-exempt minimum - assuming still active to not trigger a false-positive failover - FIX balance pronto!");
                return true;
            }

            debug!(pubkey = %node.pubkey, current_slot, "node is delinquent - not voting");
            return false;
        }

        for vote_account in &vote_accounts.current {
            if vote_account.node_pubkey == node.pubkey {
                debug!(pubkey = %node.pubkey, vote_account_pubkey = %vote_account.vote_pubkey,
                    last_voted_at_slot = vote_account.last_vote, current_slot,
                    "node found in current vote accounts");
                return true;
            }
        }

        warn!(pubkey = %node.pubkey, current_slot,
            "no current or delinquent vote account found for node");
        false
    }

    /// TCP-dial the advertised gossip address. The gossip port is probed
    /// rather than the transaction-processing port: TPU ports are commonly
    /// firewalled and would yield false negatives.
    async fn is_gossip_addr_alive(&self, gossip_addr: &str) -> bool {
        debug!(gossip_address = %gossip_addr, "probing for node liveness on gossip address");
        matches!(
            tokio::time::timeout(self.dial_timeout, TcpStream::connect(gossip_addr)).await,
            Ok(Ok(_))
        )
    }

    // ── query surface for the decision loop ──

    pub fn has_active_peer(&self) -> bool {
        self.peer_states.values().any(PeerState::is_active)
    }

    /// True while the leaderless streak is still shorter than `n` samples.
    pub fn leaderless_samples_below_threshold(&self, n: u32) -> bool {
        self.leaderless_samples < n
    }

    pub fn leaderless_samples(&self) -> u32 {
        self.leaderless_samples
    }

    pub fn has_ip(&self, ip: &str) -> bool {
        self.peer_states.values().any(|p| p.ip == ip)
    }

    /// Any peer in the snapshot other than `ip`.
    pub fn has_peers(&self, ip: &str) -> bool {
        self.peer_states.values().any(|p| p.ip != ip)
    }

    pub fn is_recently_in_gossip(&self, ip: &str) -> bool {
        self.peer_states
            .values()
            .any(|p| p.ip == ip && p.recently_in_gossip)
    }

    pub fn get_active_peer(&self) -> Option<&PeerState> {
        self.peer_states.values().find(|p| p.is_active())
    }

    pub fn peer_states(&self) -> &HashMap<String, PeerState> {
        &self.peer_states
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }
}
