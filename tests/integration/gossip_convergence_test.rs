//! Gossip dissemination between services wired through the in-memory sink.

use crate::integration::fixtures::{InMemoryGossipNet, eventually, fast_gossip_config};
use peridot::core::events::EventBus;
use peridot::core::gossip::crds_value::{CrdsData, CrdsValueLabel};
use peridot::core::gossip::protocol::Protocol;
use peridot::core::gossip::GossipService;
use peridot::core::now_ms;
use std::sync::Arc;
use std::time::Duration;

fn service(
    net: &Arc<InMemoryGossipNet>,
    id: &str,
    entrypoints: Vec<String>,
) -> Arc<GossipService> {
    let addr = format!("mem://{id}");
    let service = GossipService::new(
        id.to_string(),
        addr.clone(),
        None,
        fast_gossip_config(entrypoints),
        net.clone(),
        Arc::new(EventBus::new()),
    );
    net.register(addr, service.clone());
    service
}

#[tokio::test]
async fn test_two_nodes_discover_each_other_via_entrypoint() {
    let net = InMemoryGossipNet::new();
    let a = service(&net, "node-a", vec![]);
    let b = service(&net, "node-b", vec!["mem://node-a".into()]);

    a.start();
    b.start();

    let discovered = eventually(Duration::from_secs(5), || {
        a.crds().get_contact_info(&"node-b".into()).is_some()
            && b.crds().get_contact_info(&"node-a".into()).is_some()
    })
    .await;
    assert!(discovered, "nodes never learned each other's contact info");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_local_insert_propagates_to_peer() {
    let net = InMemoryGossipNet::new();
    let a = service(&net, "node-a", vec![]);
    let b = service(&net, "node-b", vec!["mem://node-a".into()]);
    a.start();
    b.start();

    assert!(
        eventually(Duration::from_secs(5), || {
            a.crds().get_contact_info(&"node-b".into()).is_some()
        })
        .await
    );

    a.push_local(CrdsData::LowestSlot {
        origin: "node-a".into(),
        lowest: 4242,
        wallclock_ms: now_ms(),
    })
    .unwrap();

    let label = CrdsValueLabel::LowestSlot("node-a".into());
    let propagated = eventually(Duration::from_secs(5), || {
        b.crds()
            .get(&label)
            .map(|entry| matches!(entry.value.data, CrdsData::LowestSlot { lowest: 4242, .. }))
            .unwrap_or(false)
    })
    .await;
    assert!(propagated, "locally-inserted value never reached the peer");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_three_node_mesh_converges() {
    let net = InMemoryGossipNet::new();
    let a = service(&net, "node-a", vec![]);
    let b = service(&net, "node-b", vec!["mem://node-a".into()]);
    let c = service(&net, "node-c", vec!["mem://node-a".into()]);
    for s in [&a, &b, &c] {
        s.start();
    }

    // b and c only know the entrypoint; they must still learn of each other.
    let meshed = eventually(Duration::from_secs(8), || {
        b.crds().get_contact_info(&"node-c".into()).is_some()
            && c.crds().get_contact_info(&"node-b".into()).is_some()
    })
    .await;
    assert!(meshed, "transitive discovery through the entrypoint failed");

    for s in [&a, &b, &c] {
        s.stop().await;
    }
}

#[tokio::test]
async fn test_prune_removes_peer_from_active_set() {
    let net = InMemoryGossipNet::new();
    let a = service(&net, "node-a", vec![]);

    // Seed the active set directly.
    let pool: Vec<(String, u64)> = vec![("peer-q".into(), 1), ("peer-r".into(), 1)];
    a.active_set().rotate(&pool, [1u8; 32]);
    assert!(a.active_set().contains(&"peer-q".into()));

    // A prune from peer-p destined for this node removes peer-q.
    a.handle_message(Protocol::PruneMessage {
        from: "peer-p".into(),
        prunes: vec!["peer-q".into()],
        destination: "node-a".into(),
        wallclock_ms: now_ms(),
    })
    .await;
    assert!(!a.active_set().contains(&"peer-q".into()));

    // A prune destined for somebody else is ignored.
    a.handle_message(Protocol::PruneMessage {
        from: "peer-p".into(),
        prunes: vec!["peer-r".into()],
        destination: "node-z".into(),
        wallclock_ms: now_ms(),
    })
    .await;
    assert!(a.active_set().contains(&"peer-r".into()));
}

#[tokio::test]
async fn test_repeated_push_hits_dedup_cache() {
    let net = InMemoryGossipNet::new();
    let a = service(&net, "node-a", vec![]);

    let value = peridot::core::gossip::crds_value::CrdsValue::new_signed(
        CrdsData::LowestSlot {
            origin: "elsewhere".into(),
            lowest: 1,
            wallclock_ms: now_ms(),
        },
        &None,
    );

    a.handle_message(Protocol::PushMessage {
        from: "relay-1".into(),
        values: vec![value.clone()],
    })
    .await;
    let before = a.gossip_metrics().dedup_hits;

    a.handle_message(Protocol::PushMessage {
        from: "relay-2".into(),
        values: vec![value],
    })
    .await;
    let after = a.gossip_metrics().dedup_hits;
    assert_eq!(after, before + 1, "second delivery must hit the dedup cache");
}
