use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::future::join_all;
use serde_json::json;
use tokio::{
    spawn,
    sync::Barrier,
    time::{Instant, sleep},
};

use pluggable_consensus::{
    algorithm::Algorithm,
    config::ConsensusConfig,
    engine::DefaultConsensusEngine,
    transport::InMemoryNetwork,
    types::{ConsensusVote, NodeOptions, ProposalStatus},
};

const NODE_ID: &str = "concurrency-node";
const PEER_COUNT: usize = 9;
const CONCURRENT_PROPOSALS: usize = 20;

fn engine(network: &InMemoryNetwork, algorithm: Algorithm) -> Arc<DefaultConsensusEngine> {
    let (transport, _inbox) = network.join(NODE_ID);
    let engine = DefaultConsensusEngine::new(NODE_ID, transport);
    engine
        .initialize(ConsensusConfig::from(algorithm))
        .expect("initialize");
    Arc::new(engine)
}

fn peer(i: usize) -> String {
    format!("peer-{i}")
}

// Ten known nodes at a 0.9 convergence threshold: the proposer plus eight parallel approvals
// decide the proposal.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_vote_casting() {
    let network = InMemoryNetwork::new();
    let engine = engine(&network, Algorithm::Gossip);
    for i in 0..PEER_COUNT {
        engine
            .add_node(peer(i), NodeOptions::default())
            .expect("add peer");
    }
    let proposal = engine.propose(json!("X"), None).expect("propose");

    let voters = PEER_COUNT - 1;
    let barrier = Arc::new(Barrier::new(voters));
    let mut handles = Vec::new();
    for i in 0..voters {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        let proposal_id = proposal.id.clone();
        handles.push(spawn(async move {
            barrier.wait().await;
            engine.vote(&proposal_id, ConsensusVote::approve(peer(i)))
        }));
    }

    let results = join_all(handles).await;
    assert!(results.iter().all(|r| matches!(r, Ok(Ok(())))));

    let decided = engine
        .get_proposal(&proposal.id)
        .expect("initialized")
        .expect("stored");
    assert_eq!(decided.status, ProposalStatus::Accepted);
    assert_eq!(decided.approvals(), PEER_COUNT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_votes_from_one_voter_keep_one_entry() {
    let network = InMemoryNetwork::new();
    let engine = engine(&network, Algorithm::Gossip);
    for i in 0..PEER_COUNT {
        engine
            .add_node(peer(i), NodeOptions::default())
            .expect("add peer");
    }
    let proposal = engine.propose(json!("X"), None).expect("propose");

    let barrier = Arc::new(Barrier::new(10));
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let proposal_id = proposal.id.clone();
            spawn(async move {
                barrier.wait().await;
                engine.vote(&proposal_id, ConsensusVote::approve(peer(0)))
            })
        })
        .collect();
    for result in join_all(handles).await {
        result.expect("task").expect("vote");
    }

    let stored = engine
        .get_proposal(&proposal.id)
        .expect("initialized")
        .expect("stored");
    assert_eq!(stored.votes.len(), 2);
    assert_eq!(stored.status, ProposalStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_proposals_on_single_node_leader() {
    let network = InMemoryNetwork::new();
    let engine = engine(&network, Algorithm::Raft);

    let deadline = Instant::now() + Duration::from_secs(3);
    while !engine.is_leader().expect("initialized") {
        assert!(Instant::now() < deadline, "single node never became leader");
        sleep(Duration::from_millis(10)).await;
    }

    let barrier = Arc::new(Barrier::new(CONCURRENT_PROPOSALS));
    let handles: Vec<_> = (0..CONCURRENT_PROPOSALS)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            spawn(async move {
                barrier.wait().await;
                engine.propose(json!(i), None)
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for result in join_all(handles).await {
        let proposal = result.expect("task").expect("propose");
        assert_eq!(proposal.status, ProposalStatus::Accepted);
        ids.insert(proposal.id);
    }
    assert_eq!(ids.len(), CONCURRENT_PROPOSALS);

    let stats = engine.get_stats().expect("stats");
    assert_eq!(stats.total_proposals, CONCURRENT_PROPOSALS);
    assert_eq!(stats.accepted_proposals, CONCURRENT_PROPOSALS);
}
