//! validator-ha: decentralized high-availability supervisor for a set of
//! cooperating Solana validators.
//!
//! Every node in the HA set runs one instance. Exactly one node should hold
//! the shared active (voting) identity at a time; the rest hold their own
//! passive identities. When the active peer drops out of cluster gossip,
//! the surviving supervisors elect a single replacement without any
//! coordinator and without talking to each other, using only ranked
//! delays, jitter and re-observation of gossip.

pub mod command;
pub mod config;
pub mod gossip;
pub mod manager;
pub mod metrics;
pub mod probe;
pub mod rpc;
