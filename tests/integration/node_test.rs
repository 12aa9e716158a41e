//! Whole-node wiring: construction, start/stop, and the failover-to-
//! coordinator event flow.

use crate::integration::fixtures::{InMemoryClusterNet, eventually};
use parking_lot::Mutex;
use peridot::config::ValidatorConfig;
use peridot::core::coordinator::MasterRole;
use peridot::node::handlers::LoopbackReplicationTransport;
use peridot::node::{NodeDependencies, ValidatorNode};
use std::sync::Arc;
use std::time::Duration;

fn config() -> ValidatorConfig {
    ValidatorConfig {
        enable_gossip: false,
        region: "us-east".into(),
        ..Default::default()
    }
}

fn deps(net: &Arc<InMemoryClusterNet>) -> NodeDependencies {
    NodeDependencies {
        cluster_transport: net.clone(),
        replication_transport: LoopbackReplicationTransport::new(),
        action_handler: None,
    }
}

#[tokio::test]
async fn test_node_starts_and_stops_cleanly() {
    let net = InMemoryClusterNet::new();
    let node = ValidatorNode::new(config(), deps(&net)).await.unwrap();
    net.register(node.consensus().clone());

    node.start();
    // Idempotent start must not double-spawn.
    node.start();

    let elected = eventually(Duration::from_secs(3), || node.consensus().is_leader()).await;
    assert!(elected, "a standalone node must elect itself");

    node.stop().await;
    node.stop().await;
}

#[tokio::test]
async fn test_single_node_proposal_reaches_state_machine() {
    let net = InMemoryClusterNet::new();
    let node = ValidatorNode::new(config(), deps(&net)).await.unwrap();
    net.register(node.consensus().clone());

    let applied: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = applied.clone();
    node.set_state_machine_callback(Arc::new(move |_, payload| {
        sink.lock().push(payload.to_vec());
    }));

    node.start();
    assert!(eventually(Duration::from_secs(3), || node.consensus().is_leader()).await);
    node.consensus().propose(vec![7, 7, 7]).await.unwrap();

    let delivered =
        eventually(Duration::from_secs(3), || applied.lock().len() == 1).await;
    assert!(delivered);
    assert_eq!(applied.lock()[0], vec![7, 7, 7]);

    let snapshot = node.stats_snapshot();
    assert_eq!(snapshot["consensus"]["commit_index"], 1);
    assert_eq!(snapshot["consensus"]["log_size"], 1);

    node.stop().await;
}

#[tokio::test]
async fn test_rpc_promotion_flows_to_router() {
    let net = InMemoryClusterNet::new();
    let node = ValidatorNode::new(config(), deps(&net)).await.unwrap();
    let self_id = node.node_id().clone();

    node.coordinator()
        .promote_master(&self_id, MasterRole::Rpc)
        .unwrap();
    assert!(node.router().get_backend(&self_id).is_some());
    assert!(node.multi_master().is_role_covered(MasterRole::Rpc));

    node.coordinator()
        .demote_master(&self_id, MasterRole::Rpc)
        .unwrap();
    assert!(node.router().get_backend(&self_id).is_none());
}

#[tokio::test]
async fn test_replication_through_node_wiring() {
    let net = InMemoryClusterNet::new();
    let node = ValidatorNode::new(config(), deps(&net)).await.unwrap();

    node.replication()
        .add_target("replica-1".into(), "10.0.0.9:9000".into());
    node.replication().submit(bytes::Bytes::from_static(b"op"));
    assert!(node.replication().replicate_pending().await);
    assert_eq!(
        node.replication()
            .target(&"replica-1".into())
            .unwrap()
            .last_applied_index,
        1
    );
}
