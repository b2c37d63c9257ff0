use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::ConsensusError;

/// Tolerance applied before rounding fractional quorum sizes, so `5 * 0.6` is 3 and not 2.
const QUORUM_EPSILON: f64 = 1e-9;

pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn current_timestamp_ms() -> Result<u64, ConsensusError> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}

/// SHA-256 over the canonical JSON encoding of `value`, hex encoded.
///
/// Used only to match three-phase messages that refer to the same value. It is not a signature.
pub fn compute_digest(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Raft election quorum: `⌊n/2⌋ + 1` where `n` counts peers plus self.
pub fn majority(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// Approving votes needed out of `total_voters` for a fractional threshold:
/// `⌊n·t⌋`, at least 1.
pub fn calculate_required_votes(total_voters: usize, threshold: f64) -> usize {
    ((total_voters as f64 * threshold) + QUORUM_EPSILON)
        .floor()
        .max(1.0) as usize
}

/// Approvals needed for a fraction of known nodes to count as converged: `⌈n·t⌉`, at least 1.
pub fn calculate_convergence_votes(known_nodes: usize, threshold: f64) -> usize {
    ((known_nodes as f64 * threshold) - QUORUM_EPSILON)
        .ceil()
        .max(1.0) as usize
}

/// Matching messages needed in each PBFT phase.
pub fn byzantine_quorum(max_faulty_nodes: usize) -> usize {
    2 * max_faulty_nodes + 1
}

/// Largest number of Byzantine nodes a cluster of `n` nodes tolerates, `⌊(n-1)/3⌋`.
pub fn max_tolerable_faults(cluster_size: usize) -> usize {
    cluster_size.saturating_sub(1) / 3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyOutcome {
    Accepted,
    Rejected,
    Undecided,
}

/// Decide a vote tally against a fixed quorum.
///
/// Accepted once `approvals >= required`; rejected once even every remaining voter
/// approving could not reach `required`.
pub fn evaluate_tally(
    approvals: usize,
    voted: usize,
    total_voters: usize,
    required: usize,
) -> TallyOutcome {
    if approvals >= required {
        return TallyOutcome::Accepted;
    }
    let remaining = total_voters.saturating_sub(voted);
    if approvals + remaining < required {
        TallyOutcome::Rejected
    } else {
        TallyOutcome::Undecided
    }
}

pub fn validate_threshold(threshold: f64) -> Result<(), ConsensusError> {
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(ConsensusError::InvalidConsensusThreshold(format!(
            "threshold must be within (0, 1], got {threshold}"
        )));
    }
    Ok(())
}

pub fn validate_timeout(timeout_ms: u64) -> Result<(), ConsensusError> {
    if timeout_ms == 0 {
        return Err(ConsensusError::InvalidConfiguration(
            "timeout must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn required_votes_floor_of_threshold() {
        assert_eq!(calculate_required_votes(5, 0.66), 3);
        assert_eq!(calculate_required_votes(5, 0.6), 3);
        assert_eq!(calculate_required_votes(3, 0.66), 1);
        assert_eq!(calculate_required_votes(1, 0.66), 1);
        assert_eq!(calculate_required_votes(10, 1.0), 10);
    }

    #[test]
    fn convergence_votes_ceil_of_threshold() {
        assert_eq!(calculate_convergence_votes(10, 0.9), 9);
        assert_eq!(calculate_convergence_votes(4, 0.9), 4);
        assert_eq!(calculate_convergence_votes(1, 0.9), 1);
    }

    #[test]
    fn byzantine_bounds() {
        assert_eq!(byzantine_quorum(1), 3);
        assert_eq!(max_tolerable_faults(4), 1);
        assert_eq!(max_tolerable_faults(7), 2);
        assert_eq!(max_tolerable_faults(1), 0);
    }

    #[test]
    fn majority_of_cluster() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn tally_rejects_once_quorum_unreachable() {
        assert_eq!(evaluate_tally(3, 3, 5, 3), TallyOutcome::Accepted);
        assert_eq!(evaluate_tally(1, 3, 5, 3), TallyOutcome::Undecided);
        assert_eq!(evaluate_tally(0, 3, 5, 3), TallyOutcome::Rejected);
    }

    #[test]
    fn digest_is_stable() {
        let a = compute_digest(&json!({"k": [1, 2, 3]}));
        let b = compute_digest(&json!({"k": [1, 2, 3]}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, compute_digest(&json!("other")));
    }

    #[test]
    fn threshold_validation() {
        assert!(validate_threshold(0.66).is_ok());
        assert!(validate_threshold(1.0).is_ok());
        assert!(validate_threshold(0.0).is_err());
        assert!(validate_threshold(1.5).is_err());
        assert!(validate_threshold(f64::NAN).is_err());
    }
}
