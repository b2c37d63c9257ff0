use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ConsensusError;

/// Algorithm tag selected at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Raft,
    #[serde(alias = "pbft")]
    Byzantine,
    Gossip,
    /// Served by the Raft implementation.
    Paxos,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Raft => "raft",
            Algorithm::Byzantine => "byzantine",
            Algorithm::Gossip => "gossip",
            Algorithm::Paxos => "paxos",
        }
    }

    /// The algorithm whose implementation actually runs for this tag.
    pub fn implementation(&self) -> Algorithm {
        match self {
            Algorithm::Paxos => Algorithm::Raft,
            other => *other,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raft" => Ok(Algorithm::Raft),
            "byzantine" | "pbft" => Ok(Algorithm::Byzantine),
            "gossip" => Ok(Algorithm::Gossip),
            "paxos" => Ok(Algorithm::Paxos),
            _ => Err(ConsensusError::UnknownAlgorithm(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    #[default]
    Strong,
    Eventual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scale {
    Small,
    #[default]
    Medium,
    Large,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Latency {
    Low,
    #[default]
    Normal,
    Tolerant,
}

/// Deployment requirements fed to [`select_optimal_algorithm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlgorithmRequirements {
    pub byzantine_fault_tolerance: bool,
    pub consistency: Consistency,
    pub scale: Scale,
    pub latency: Latency,
}

/// Fixed policy table mapping requirements to an algorithm.
pub fn select_optimal_algorithm(requirements: &AlgorithmRequirements) -> Algorithm {
    if requirements.byzantine_fault_tolerance {
        return Algorithm::Byzantine;
    }
    if requirements.consistency == Consistency::Eventual && requirements.scale == Scale::Large {
        return Algorithm::Gossip;
    }
    if requirements.latency == Latency::Low && requirements.scale != Scale::Large {
        return Algorithm::Raft;
    }
    Algorithm::Raft
}
