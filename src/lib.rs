//! A pluggable consensus engine for clusters of cooperating nodes.
//!
//! Three interchangeable algorithms sit behind one proposal/vote/result interface:
//!
//! - **Raft** ([`raft`]): leader election and majority replication, for strong consistency.
//! - **Byzantine** ([`byzantine`]): PBFT-style pre-prepare/prepare/commit, tolerating up to `f`
//!   faulty nodes out of `3f+1`.
//! - **Gossip** ([`gossip`]): epidemic dissemination with anti-entropy, converging eventually.
//!
//! The main entry point is [`engine::ConsensusEngine`]. Pick an algorithm in
//! [`config::ConsensusConfig`] (or let [`algorithm::select_optimal_algorithm`] pick one), register
//! peers, propose values and await a [`types::ConsensusResult`]. Failing to agree is not an
//! error: a proposal that misses its quorum ends up `rejected` or `expired`.
//!
//! Nodes talk through the [`transport::Transport`] trait. [`transport::InMemoryNetwork`] wires
//! several engines together inside one process, which is how the tests simulate clusters.

pub mod algorithm;
pub mod byzantine;
pub mod config;
pub mod engine;
pub mod engine_stats;
pub mod error;
pub mod events;
pub mod gossip;
pub mod proposals;
pub mod protocol;
pub mod raft;
pub mod transport;
pub mod types;
pub mod utils;
