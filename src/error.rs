#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Consensus engine not initialized")]
    NotInitialized,
    #[error("Consensus engine already initialized")]
    AlreadyInitialized,

    #[error("Node is not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<String> },
    #[error("Node is not the primary (current primary: {primary:?})")]
    NotPrimary { primary: Option<String> },

    #[error("Unknown consensus algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),
    #[error("Node limit reached: at most {max} nodes")]
    NodeLimit { max: usize },
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Invalid consensus threshold: {0}")]
    InvalidConsensusThreshold(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),
    #[error("No Tokio runtime available to drive consensus timers")]
    RuntimeUnavailable,
    #[error("Failed to encode or decode message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to get current time")]
    FailedToGetCurrentTime(#[from] std::time::SystemTimeError),
}
