use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use serde_json::json;
use tokio::time::{Instant, sleep, timeout};

use pluggable_consensus::{
    algorithm::Algorithm,
    config::ConsensusConfig,
    engine::DefaultConsensusEngine,
    error::ConsensusError,
    events::{ConsensusEvent, event_stream},
    transport::InMemoryNetwork,
    types::{ConsensusVote, NodeOptions, ProposalStatus},
};

const NODE_ID: &str = "engine-node";
const SHORT_TIMEOUT_MS: u64 = 200;
const LEADER_WAIT: Duration = Duration::from_secs(3);

fn engine(network: &InMemoryNetwork, node_id: &str) -> DefaultConsensusEngine {
    let (transport, _inbox) = network.join(node_id);
    DefaultConsensusEngine::new(node_id, transport)
}

fn config(algorithm: Algorithm) -> ConsensusConfig {
    ConsensusConfig::builder()
        .with_algorithm(algorithm)
        .with_timeout(Duration::from_millis(SHORT_TIMEOUT_MS))
        .build()
        .expect("valid config")
}

async fn wait_for_leadership(engine: &DefaultConsensusEngine) {
    let deadline = Instant::now() + LEADER_WAIT;
    while !engine.is_leader().expect("initialized") {
        assert!(Instant::now() < deadline, "single node never became leader");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_calls_before_initialize_fail() {
    let network = InMemoryNetwork::new();
    let engine = engine(&network, NODE_ID);

    assert!(!engine.is_initialized());
    assert!(matches!(
        engine.propose(json!(1), None),
        Err(ConsensusError::NotInitialized)
    ));
    assert!(matches!(
        engine.add_node("peer", NodeOptions::default()),
        Err(ConsensusError::NotInitialized)
    ));
    assert!(matches!(
        engine.get_stats(),
        Err(ConsensusError::NotInitialized)
    ));
    assert!(matches!(
        engine.await_consensus("missing").await,
        Err(ConsensusError::NotInitialized)
    ));
}

#[test]
fn test_initialize_outside_runtime_fails() {
    let network = InMemoryNetwork::new();
    let engine = engine(&network, NODE_ID);

    for algorithm in [Algorithm::Raft, Algorithm::Byzantine, Algorithm::Gossip] {
        assert!(matches!(
            engine.initialize(config(algorithm)),
            Err(ConsensusError::RuntimeUnavailable)
        ));
        assert!(!engine.is_initialized());
    }
}

#[tokio::test]
async fn test_initialize_twice_fails_until_shutdown() {
    let network = InMemoryNetwork::new();
    let engine = engine(&network, NODE_ID);

    engine
        .initialize(config(Algorithm::Gossip))
        .expect("first initialize");
    assert!(matches!(
        engine.initialize(config(Algorithm::Raft)),
        Err(ConsensusError::AlreadyInitialized)
    ));

    engine.shutdown();
    assert!(!engine.is_initialized());
    engine
        .initialize(config(Algorithm::Raft))
        .expect("initialize after shutdown");
    assert_eq!(engine.get_algorithm().expect("algorithm"), Algorithm::Raft);
}

#[tokio::test]
async fn test_unknown_algorithm_and_invalid_config_rejected() {
    let err = ConsensusConfig::from_json_str(r#"{"algorithm": "tendermint"}"#)
        .expect_err("unknown tag");
    assert!(matches!(err, ConsensusError::UnknownAlgorithm(tag) if tag == "tendermint"));

    let network = InMemoryNetwork::new();
    let engine = engine(&network, NODE_ID);
    let invalid = ConsensusConfig {
        threshold: 1.5,
        ..ConsensusConfig::default()
    };
    assert!(matches!(
        engine.initialize(invalid),
        Err(ConsensusError::InvalidConsensusThreshold(_))
    ));
    assert!(!engine.is_initialized());
}

#[tokio::test]
async fn test_paxos_runs_raft() {
    let network = InMemoryNetwork::new();
    let engine = engine(&network, NODE_ID);
    engine
        .initialize(config(Algorithm::Paxos))
        .expect("initialize");
    assert_eq!(engine.get_algorithm().expect("algorithm"), Algorithm::Paxos);

    wait_for_leadership(&engine).await;
    assert_eq!(
        engine.get_leader_id().expect("leader id").as_deref(),
        Some(NODE_ID)
    );

    let proposal = engine.propose(json!("X"), None).expect("propose");
    let result = engine
        .await_consensus(&proposal.id)
        .await
        .expect("result");
    assert!(result.approved);
    assert_eq!(result.final_value, Some(json!("X")));
    assert_eq!(result.participation_rate, 1.0);
}

#[tokio::test]
async fn test_isolated_proposal_expires_at_timeout() {
    let network = InMemoryNetwork::new();
    let engine = engine(&network, NODE_ID);
    engine
        .initialize(config(Algorithm::Gossip))
        .expect("initialize");
    for peer in ["peer-1", "peer-2", "peer-3"] {
        engine
            .add_node(peer, NodeOptions::default())
            .expect("add peer");
    }
    network.isolate(NODE_ID);

    let proposal = engine.propose(json!("lonely"), None).expect("propose");
    let started = Instant::now();
    let result = timeout(Duration::from_secs(2), engine.await_consensus(&proposal.id))
        .await
        .expect("await_consensus never hangs")
        .expect("result");
    let elapsed = started.elapsed();

    assert!(!result.approved);
    assert_eq!(result.final_value, None);
    assert!(elapsed >= Duration::from_millis(SHORT_TIMEOUT_MS));
    assert!(elapsed < Duration::from_millis(SHORT_TIMEOUT_MS + 500));
    assert_eq!(
        engine
            .get_proposal(&proposal.id)
            .expect("initialized")
            .expect("stored")
            .status,
        ProposalStatus::Expired
    );
    assert!(engine.get_active_proposals().expect("initialized").is_empty());
}

#[tokio::test]
async fn test_timeout_without_quorum_requirement_decides_on_cast_votes() {
    let network = InMemoryNetwork::new();
    let engine = engine(&network, NODE_ID);
    let config = ConsensusConfig::builder()
        .with_algorithm(Algorithm::Gossip)
        .with_timeout(Duration::from_millis(SHORT_TIMEOUT_MS))
        .with_require_quorum(false)
        .build()
        .expect("valid config");
    engine.initialize(config).expect("initialize");
    for peer in ["peer-1", "peer-2", "peer-3"] {
        engine
            .add_node(peer, NodeOptions::default())
            .expect("add peer");
    }

    let approved = engine.propose(json!("yes"), None).expect("propose");
    engine
        .vote(&approved.id, ConsensusVote::approve("peer-1"))
        .expect("vote");
    let rejected = engine.propose(json!("no"), None).expect("propose");
    engine
        .vote(&rejected.id, ConsensusVote::reject("peer-1"))
        .expect("vote");
    engine
        .vote(&rejected.id, ConsensusVote::reject("peer-2"))
        .expect("vote");

    let approved = engine.await_consensus(&approved.id).await.expect("result");
    let rejected = engine.await_consensus(&rejected.id).await.expect("result");
    assert!(approved.approved);
    assert_eq!(approved.participation_rate, 0.5);
    assert!(!rejected.approved);

    let stats = engine.get_stats().expect("stats");
    assert_eq!(stats.accepted_proposals, 1);
    assert_eq!(stats.rejected_proposals, 1);
}

#[tokio::test]
async fn test_stats_count_proposals_by_status() {
    let network = InMemoryNetwork::new();
    let engine = engine(&network, NODE_ID);
    engine
        .initialize(config(Algorithm::Gossip))
        .expect("initialize");

    for value in 0..3 {
        engine.propose(json!(value), None).expect("propose");
    }
    engine
        .add_node("peer-1", NodeOptions::default())
        .expect("add peer");
    let pending = engine.propose(json!("pending"), None).expect("propose");

    let stats = engine.get_stats().expect("stats");
    assert_eq!(stats.algorithm, Algorithm::Gossip);
    assert_eq!(stats.total_proposals, 4);
    assert_eq!(stats.accepted_proposals, 3);
    assert_eq!(stats.pending_proposals, 1);
    assert_eq!(stats.expired_proposals, 0);

    engine.await_consensus(&pending.id).await.expect("result");
    let stats = engine.get_stats().expect("stats");
    assert_eq!(stats.pending_proposals, 0);
    assert_eq!(stats.expired_proposals, 1);
}

#[tokio::test]
async fn test_node_limit() {
    let network = InMemoryNetwork::new();
    let engine = engine(&network, NODE_ID);
    let config = ConsensusConfig::builder()
        .with_algorithm(Algorithm::Byzantine)
        .with_max_nodes(Some(3))
        .build()
        .expect("valid config");
    engine.initialize(config).expect("initialize");

    engine.add_node("a", NodeOptions::default()).expect("first");
    engine.add_node("b", NodeOptions::default()).expect("second");
    engine
        .add_node("b", NodeOptions::default())
        .expect("re-adding a known node is fine");
    assert!(matches!(
        engine.add_node("c", NodeOptions::default()),
        Err(ConsensusError::NodeLimit { max: 3 })
    ));

    assert!(engine.remove_node("a").expect("initialized"));
    assert!(!engine.remove_node("a").expect("initialized"));
    engine.add_node("c", NodeOptions::default()).expect("room again");
}

#[tokio::test]
async fn test_pinned_primary_decides_who_may_propose() {
    let network = InMemoryNetwork::new();
    let engine = engine(&network, "node-b");
    engine
        .initialize(config(Algorithm::Byzantine))
        .expect("initialize");
    for peer in ["node-a", "node-c", "node-d"] {
        engine
            .add_node(peer, NodeOptions::default())
            .expect("add peer");
    }
    assert!(!engine.is_leader().expect("initialized"));
    assert!(matches!(
        engine.propose(json!(1), None),
        Err(ConsensusError::NotPrimary { .. })
    ));

    engine
        .add_node("node-b", NodeOptions::primary())
        .expect("pin self");
    assert!(engine.is_leader().expect("initialized"));
    assert_eq!(
        engine.get_leader_id().expect("initialized").as_deref(),
        Some("node-b")
    );
    engine.propose(json!(1), None).expect("pinned primary proposes");
}

#[tokio::test]
async fn test_events_stream_election_and_decision() {
    let network = InMemoryNetwork::new();
    let engine = Arc::new(engine(&network, NODE_ID));
    let mut events = Box::pin(event_stream(engine.subscribe()));

    engine
        .initialize(config(Algorithm::Raft))
        .expect("initialize");
    wait_for_leadership(&engine).await;
    let proposal = engine
        .propose(json!({"k": "v"}), Some("client-7".into()))
        .expect("propose");
    assert_eq!(proposal.proposer_id, "client-7");

    let elected = timeout(Duration::from_secs(1), events.next())
        .await
        .expect("event in time")
        .expect("stream open");
    assert_eq!(elected.name(), "leader.elected");
    assert!(matches!(
        elected,
        ConsensusEvent::LeaderElected { ref node_id, term } if node_id == NODE_ID && term >= 1
    ));

    let achieved = timeout(Duration::from_secs(1), events.next())
        .await
        .expect("event in time")
        .expect("stream open");
    assert_eq!(
        achieved,
        ConsensusEvent::ConsensusAchieved {
            proposal_id: proposal.id.clone(),
            status: ProposalStatus::Accepted,
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engines_form_a_raft_cluster_over_the_network() {
    let network = InMemoryNetwork::new();
    let ids = ["node-a", "node-b", "node-c"];
    let mut engines = Vec::new();
    for id in ids {
        let (transport, inbox) = network.join(id);
        let engine = DefaultConsensusEngine::new(id, transport);
        engine
            .initialize(ConsensusConfig::default())
            .expect("initialize");
        for peer in ids.iter().filter(|peer| **peer != id) {
            engine
                .add_node(*peer, NodeOptions::default())
                .expect("add peer");
        }
        engine.listen(inbox).expect("listen");
        engines.push(engine);
    }

    let deadline = Instant::now() + LEADER_WAIT;
    let leader = loop {
        let leaders: Vec<&DefaultConsensusEngine> = engines
            .iter()
            .filter(|engine| engine.is_leader().expect("initialized"))
            .collect();
        if let [leader] = leaders.as_slice() {
            let leader_id = leader.node_id();
            if engines.iter().all(|engine| {
                engine.get_leader_id().expect("initialized").as_deref() == Some(leader_id)
            }) {
                break *leader;
            }
        }
        assert!(Instant::now() < deadline, "no leader elected");
        sleep(Duration::from_millis(20)).await;
    };

    let proposal = leader.propose(json!("X"), None).expect("propose");
    let result = leader
        .await_consensus_with_timeout(&proposal.id, Duration::from_secs(5))
        .await
        .expect("result");
    assert!(result.approved);

    for engine in &engines {
        engine.shutdown();
    }
}
