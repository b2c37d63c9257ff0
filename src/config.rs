use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    algorithm::Algorithm,
    error::ConsensusError,
    utils::{validate_threshold, validate_timeout},
};

/// Raft timing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat period; must stay well below the election timeout.
    pub heartbeat_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

impl RaftConfig {
    pub fn random_election_timeout(&self) -> Duration {
        let timeout_ms = rand::thread_rng()
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);
        Duration::from_millis(timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(ConsensusError::InvalidConfiguration(
                "election_timeout_min_ms must be less than election_timeout_max_ms".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(ConsensusError::InvalidConfiguration(
                "heartbeat_interval_ms must be non-zero and less than election_timeout_min_ms"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// PBFT parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ByzantineConfig {
    /// `f`: every phase needs `2f+1` matching messages.
    pub max_faulty_nodes: usize,
    /// How long a backup waits on an uncommitted pre-prepare before asking for a new view.
    pub view_change_timeout_ms: u64,
}

impl Default for ByzantineConfig {
    fn default() -> Self {
        Self {
            max_faulty_nodes: 1,
            view_change_timeout_ms: 5_000,
        }
    }
}

impl ByzantineConfig {
    pub fn view_change_timeout(&self) -> Duration {
        Duration::from_millis(self.view_change_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        validate_timeout(self.view_change_timeout_ms)
    }
}

/// Epidemic dissemination parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Neighbors contacted per gossip round.
    pub fanout: usize,
    pub gossip_interval_ms: u64,
    /// Messages that travelled more hops than this are dropped.
    pub max_hops: u32,
    /// Fraction of known nodes that must approve before a proposal converges.
    pub convergence_threshold: f64,
    /// Period of full-state reconciliation with one random neighbor.
    pub anti_entropy_interval_ms: u64,
    /// Vote to approve every proposal received, without waiting for the application.
    pub auto_vote: bool,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 3,
            gossip_interval_ms: 100,
            max_hops: 5,
            convergence_threshold: 0.9,
            anti_entropy_interval_ms: 1_000,
            auto_vote: true,
        }
    }
}

impl GossipConfig {
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn anti_entropy_interval(&self) -> Duration {
        Duration::from_millis(self.anti_entropy_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.fanout == 0 {
            return Err(ConsensusError::InvalidConfiguration(
                "fanout must be at least 1".to_string(),
            ));
        }
        if self.max_hops == 0 {
            return Err(ConsensusError::InvalidConfiguration(
                "max_hops must be at least 1".to_string(),
            ));
        }
        validate_threshold(self.convergence_threshold)?;
        validate_timeout(self.gossip_interval_ms)?;
        validate_timeout(self.anti_entropy_interval_ms)
    }
}

/// Engine configuration. Every field has a default, so a partial JSON document is valid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub algorithm: Algorithm,
    /// Fraction of voters that must approve (Raft) or fallback approval rate at timeout.
    pub threshold: f64,
    /// How long `await_consensus` waits before the proposal is closed.
    pub timeout_ms: u64,
    /// Rounds a gossip proposer keeps re-pushing a pending proposal.
    pub max_rounds: u32,
    /// When false, a timed-out proposal is decided on the votes it has instead of expiring.
    pub require_quorum: bool,
    /// Optional cap on known nodes (peers plus self).
    pub max_nodes: Option<usize>,
    pub raft: RaftConfig,
    pub byzantine: ByzantineConfig,
    pub gossip: GossipConfig,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Raft,
            threshold: 0.66,
            timeout_ms: 30_000,
            max_rounds: 10,
            require_quorum: true,
            max_nodes: None,
            raft: RaftConfig::default(),
            byzantine: ByzantineConfig::default(),
            gossip: GossipConfig::default(),
        }
    }
}

impl From<Algorithm> for ConsensusConfig {
    fn from(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            ..Self::default()
        }
    }
}

impl ConsensusConfig {
    pub fn builder() -> ConsensusConfigBuilder {
        ConsensusConfigBuilder::default()
    }

    /// Parse a (possibly partial) JSON document and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, ConsensusError> {
        let mut document: Value = serde_json::from_str(json)?;
        if let Some(tag) = document.get("algorithm").and_then(Value::as_str) {
            let algorithm = tag.parse::<Algorithm>()?;
            document["algorithm"] = Value::from(algorithm.as_str());
        }
        let config: ConsensusConfig = serde_json::from_value(document)?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        validate_threshold(self.threshold)?;
        validate_timeout(self.timeout_ms)?;
        if self.max_nodes == Some(0) {
            return Err(ConsensusError::InvalidConfiguration(
                "max_nodes must count at least the local node".to_string(),
            ));
        }
        match self.algorithm.implementation() {
            Algorithm::Byzantine => self.byzantine.validate(),
            Algorithm::Gossip => self.gossip.validate(),
            _ => self.raft.validate(),
        }
    }
}

pub struct ConsensusConfigBuilder {
    config: ConsensusConfig,
}

impl Default for ConsensusConfigBuilder {
    fn default() -> Self {
        Self {
            config: ConsensusConfig::default(),
        }
    }
}

impl ConsensusConfigBuilder {
    /// Start builder from an existing config (useful for partial updates)
    pub fn from_existing(config: ConsensusConfig) -> Self {
        Self { config }
    }

    pub fn for_algorithm(algorithm: Algorithm) -> Self {
        Self::from_existing(ConsensusConfig::from(algorithm))
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.config.algorithm = algorithm;
        self
    }

    /// Set consensus threshold (0.0 to 1.0)
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.config.threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.config.max_rounds = max_rounds;
        self
    }

    pub fn with_require_quorum(mut self, require_quorum: bool) -> Self {
        self.config.require_quorum = require_quorum;
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: Option<usize>) -> Self {
        self.config.max_nodes = max_nodes;
        self
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.config.raft = raft;
        self
    }

    pub fn with_byzantine(mut self, byzantine: ByzantineConfig) -> Self {
        self.config.byzantine = byzantine;
        self
    }

    pub fn with_gossip(mut self, gossip: GossipConfig) -> Self {
        self.config.gossip = gossip;
        self
    }

    /// Use strict consensus (higher threshold = 0.9)
    pub fn strict_consensus(mut self) -> Self {
        self.config.threshold = 0.9;
        self
    }

    /// Use fast consensus (lower threshold = 0.51, shorter timeout = 5s)
    pub fn fast_consensus(mut self) -> Self {
        self.config.threshold = 0.51;
        self.config.timeout_ms = 5_000;
        self
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        self.config.validate()
    }

    pub fn build(self) -> Result<ConsensusConfig, ConsensusError> {
        self.validate()?;
        Ok(self.config)
    }

    pub fn get_config(&self) -> ConsensusConfig {
        self.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        for algorithm in [
            Algorithm::Raft,
            Algorithm::Byzantine,
            Algorithm::Gossip,
            Algorithm::Paxos,
        ] {
            ConsensusConfig::from(algorithm).validate().unwrap();
        }
    }

    #[test]
    fn election_timeout_is_within_bounds() {
        let raft = RaftConfig::default();
        for _ in 0..50 {
            let timeout = raft.random_election_timeout();
            assert!(timeout >= Duration::from_millis(150));
            assert!(timeout <= Duration::from_millis(300));
        }
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{"algorithm":"pbft","byzantine":{"max_faulty_nodes":2}}"#;
        let config = ConsensusConfig::from_json_str(json).unwrap();
        assert_eq!(config.algorithm, Algorithm::Byzantine);
        assert_eq!(config.byzantine.max_faulty_nodes, 2);
        assert_eq!(config.byzantine.view_change_timeout_ms, 5_000);
        assert_eq!(config.threshold, 0.66);
    }

    #[test]
    fn unknown_algorithm_tag_is_reported() {
        let err = ConsensusConfig::from_json_str(r#"{"algorithm":"hotstuff"}"#).unwrap_err();
        assert!(matches!(err, ConsensusError::UnknownAlgorithm(tag) if tag == "hotstuff"));
    }

    #[test]
    fn algorithm_tag_is_case_insensitive() {
        let config = ConsensusConfig::from_json_str(r#"{"algorithm":"PBFT"}"#).unwrap();
        assert_eq!(config.algorithm, Algorithm::Byzantine);
        let config = ConsensusConfig::from_json_str(r#"{"algorithm":" Gossip "}"#).unwrap();
        assert_eq!(config.algorithm, Algorithm::Gossip);
    }

    #[test]
    fn heartbeat_must_be_below_election_timeout() {
        let raft = RaftConfig {
            heartbeat_interval_ms: 200,
            ..RaftConfig::default()
        };
        assert!(matches!(
            raft.validate(),
            Err(ConsensusError::InvalidConfiguration(_))
        ));
    }
}
