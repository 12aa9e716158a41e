//! Multi-node consensus over the in-memory cluster transport.

use crate::integration::fixtures::{InMemoryClusterNet, eventually, fast_consensus_config};
use parking_lot::Mutex;
use peridot::core::NodeId;
use peridot::core::consensus::ConsensusEngine;
use std::sync::Arc;
use std::time::Duration;

fn three_nodes(
    net: &Arc<InMemoryClusterNet>,
) -> Vec<(Arc<ConsensusEngine>, Arc<Mutex<Vec<Vec<u8>>>>)> {
    let ids: Vec<NodeId> = vec!["node-a".into(), "node-b".into(), "node-c".into()];
    ids.iter()
        .map(|id| {
            let engine = ConsensusEngine::new(
                id.clone(),
                ids.clone(),
                fast_consensus_config(),
                net.clone(),
            );
            let applied: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
            let sink = applied.clone();
            engine.set_state_machine_callback(Arc::new(move |_, payload| {
                sink.lock().push(payload.to_vec());
            }));
            net.register(engine.clone());
            (engine, applied)
        })
        .collect()
}

fn sole_leader(engines: &[(Arc<ConsensusEngine>, Arc<Mutex<Vec<Vec<u8>>>>)]) -> Option<NodeId> {
    let leaders: Vec<NodeId> = engines
        .iter()
        .filter(|(engine, _)| engine.is_leader())
        .map(|(engine, _)| engine.node_id().clone())
        .collect();
    if leaders.len() != 1 {
        return None;
    }
    let leader = leaders[0].clone();
    engines
        .iter()
        .all(|(engine, _)| engine.get_leader_id() == Some(leader.clone()))
        .then_some(leader)
}

#[tokio::test]
async fn test_three_node_cluster_elects_exactly_one_leader() {
    let net = InMemoryClusterNet::new();
    let engines = three_nodes(&net);
    for (engine, _) in &engines {
        engine.start();
    }

    let converged = eventually(Duration::from_secs(3), || sole_leader(&engines).is_some()).await;
    assert!(converged, "no sole leader agreed on within the deadline");

    // Election safety: both non-leaders follow at the leader's term.
    let leader = sole_leader(&engines).unwrap();
    let leader_term = engines
        .iter()
        .find(|(engine, _)| engine.node_id() == &leader)
        .unwrap()
        .0
        .current_term();
    for (engine, _) in &engines {
        assert!(engine.current_term() <= leader_term);
    }

    for (engine, _) in &engines {
        engine.stop().await;
    }
}

#[tokio::test]
async fn test_proposal_commits_on_every_node() {
    let net = InMemoryClusterNet::new();
    let engines = three_nodes(&net);
    for (engine, _) in &engines {
        engine.start();
    }
    assert!(eventually(Duration::from_secs(3), || sole_leader(&engines).is_some()).await);

    let leader_id = sole_leader(&engines).unwrap();
    let (leader, _) = engines
        .iter()
        .find(|(engine, _)| engine.node_id() == &leader_id)
        .unwrap();
    leader.propose(vec![0xDE, 0xAD]).await.unwrap();

    let committed_everywhere = eventually(Duration::from_secs(3), || {
        engines
            .iter()
            .all(|(engine, _)| engine.stats().commit_index >= 1)
    })
    .await;
    assert!(committed_everywhere, "commit index never reached 1 on all nodes");

    let applied_everywhere = eventually(Duration::from_secs(3), || {
        engines
            .iter()
            .all(|(_, applied)| applied.lock().first() == Some(&vec![0xDE, 0xAD]))
    })
    .await;
    assert!(applied_everywhere, "payload not applied on all nodes");

    for (engine, _) in &engines {
        engine.stop().await;
    }
}

#[tokio::test]
async fn test_cluster_reelects_after_leader_partition() {
    let net = InMemoryClusterNet::new();
    let engines = three_nodes(&net);
    for (engine, _) in &engines {
        engine.start();
    }
    assert!(eventually(Duration::from_secs(3), || sole_leader(&engines).is_some()).await);
    let old_leader = sole_leader(&engines).unwrap();

    net.partition(&old_leader);

    let survivors: Vec<_> = engines
        .iter()
        .filter(|(engine, _)| engine.node_id() != &old_leader)
        .collect();
    let reelected = eventually(Duration::from_secs(5), || {
        survivors.iter().any(|(engine, _)| engine.is_leader())
    })
    .await;
    assert!(reelected, "survivors never elected a replacement leader");

    // After the partition heals the cluster converges on a single leader
    // again (the returning node may reclaim leadership at a higher term).
    net.heal(&old_leader);
    let converged = eventually(Duration::from_secs(5), || sole_leader(&engines).is_some()).await;
    assert!(converged, "cluster did not reconverge after the partition healed");

    for (engine, _) in &engines {
        engine.stop().await;
    }
}
