use peridot::config::{MultiMasterConfig, RouterConfig};
use peridot::core::PeridotError;
use peridot::core::coordinator::{
    GlobalConsensusState, MasterNode, MasterRole, MultiMasterCoordinator, MultiMasterManager,
    SyncKind,
};
use peridot::core::events::EventBus;
use peridot::core::failover::NodeHealth;
use peridot::core::router::LoadBalancer;
use peridot::core::topology::TopologyManager;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    manager: Arc<MultiMasterManager>,
    topology: Arc<TopologyManager>,
    router: Arc<LoadBalancer>,
    coordinator: Arc<MultiMasterCoordinator>,
}

fn fixture() -> Fixture {
    let config = MultiMasterConfig {
        min_masters_for_consensus: 1,
        max_masters_per_region: 2,
        ..Default::default()
    };
    let events = Arc::new(EventBus::new());
    let manager = MultiMasterManager::new(config.clone());
    let topology = TopologyManager::new(Duration::from_secs(10), events.clone());
    let router = LoadBalancer::new(RouterConfig::default());
    let coordinator = MultiMasterCoordinator::new(
        "local".into(),
        config,
        &manager,
        &topology,
        &router,
        events,
    );
    Fixture {
        manager,
        topology,
        router,
        coordinator,
    }
}

fn master(id: &str, region: &str) -> MasterNode {
    MasterNode::new(id.to_string(), "10.0.0.1".into(), 8899, region.to_string())
}

fn healthy(id: &str, cpu: f64, mem: f64) -> NodeHealth {
    let mut reading = NodeHealth::unresponsive(id.to_string());
    reading.responsive = true;
    reading.available = true;
    reading.cpu_usage = cpu;
    reading.memory_usage = mem;
    reading
}

#[tokio::test]
async fn test_rpc_promotion_registers_router_backend() {
    let fx = fixture();
    fx.manager.register_master(master("node-1", "us-east"));

    fx.coordinator
        .promote_master(&"node-1".into(), MasterRole::Rpc)
        .unwrap();

    assert!(fx.manager.is_role_covered(MasterRole::Rpc));
    assert!(fx.router.get_backend(&"node-1".into()).is_some());
    let state = fx.coordinator.global_state();
    assert_eq!(state.role_assignments.get("node-1"), Some(&MasterRole::Rpc));
    assert!(state.state_version > 0);
}

#[tokio::test]
async fn test_demotion_clears_registry_and_router() {
    let fx = fixture();
    fx.manager.register_master(master("node-1", "us-east"));
    fx.coordinator
        .promote_master(&"node-1".into(), MasterRole::Rpc)
        .unwrap();
    let version_after_promote = fx.coordinator.global_state().state_version;

    fx.coordinator
        .demote_master(&"node-1".into(), MasterRole::Rpc)
        .unwrap();
    assert!(!fx.manager.is_role_covered(MasterRole::Rpc));
    assert!(fx.router.get_backend(&"node-1".into()).is_none());
    assert!(fx.coordinator.global_state().state_version > version_after_promote);
}

#[tokio::test]
async fn test_promotion_rejected_without_capacity() {
    let fx = fixture();
    fx.manager.register_master(master("node-1", "us-east"));
    fx.manager
        .set_health_provider(Arc::new(|node| Some(healthy(node, 95.0, 10.0))));

    let result = fx
        .coordinator
        .promote_master(&"node-1".into(), MasterRole::Ledger);
    assert!(matches!(result, Err(PeridotError::InvalidState(_))));
    assert!(!fx.manager.is_role_covered(MasterRole::Ledger));
}

#[tokio::test]
async fn test_per_region_cap_enforced() {
    let fx = fixture();
    for id in ["a", "b", "c"] {
        fx.manager.register_master(master(id, "us-east"));
    }
    fx.coordinator
        .promote_master(&"a".into(), MasterRole::Gossip)
        .unwrap();
    fx.coordinator
        .promote_master(&"b".into(), MasterRole::Gossip)
        .unwrap();
    // max_masters_per_region is 2 for this fixture.
    let result = fx.coordinator.promote_master(&"c".into(), MasterRole::Gossip);
    assert!(result.is_err());

    // The same role in another region is unaffected.
    fx.manager.register_master(master("d", "eu-west"));
    fx.coordinator
        .promote_master(&"d".into(), MasterRole::Gossip)
        .unwrap();
}

#[tokio::test]
async fn test_global_state_rebuild_elects_leader_and_maps_shards() {
    let fx = fixture();
    let mut shard_master = master("shard-holder", "us-east");
    shard_master.shard_id = Some(3);
    fx.manager.register_master(shard_master);
    fx.manager.register_master(master("other", "eu-west"));
    fx.manager
        .promote(&"shard-holder".into(), MasterRole::Shard)
        .unwrap();

    assert!(!fx.coordinator.validate_global_state());
    fx.coordinator.rebuild_global_state();

    let state = fx.coordinator.global_state();
    assert!(state.global_leader.is_some());
    assert_eq!(state.consensus_term, 1);
    assert!(state.state_version > 0);
    assert_eq!(
        state.shard_masters.get(&3),
        Some(&"shard-holder".to_string())
    );
    assert_eq!(state.region_leaders.len(), 2);
    assert!(fx.coordinator.validate_global_state());
}

#[tokio::test]
async fn test_stale_state_update_rejected() {
    let fx = fixture();
    fx.manager.register_master(master("node-1", "us-east"));
    fx.coordinator.rebuild_global_state();
    let local_version = fx.coordinator.global_state().state_version;

    let stale = GlobalConsensusState {
        state_version: local_version,
        ..Default::default()
    };
    let result = fx.coordinator.update_global_state(stale);
    assert!(matches!(result, Err(PeridotError::StaleState { .. })));

    let newer = GlobalConsensusState {
        state_version: local_version + 10,
        consensus_term: 9,
        ..Default::default()
    };
    fx.coordinator.update_global_state(newer).unwrap();
    assert_eq!(
        fx.coordinator.global_state().state_version,
        local_version + 10
    );
}

#[tokio::test]
async fn test_master_failure_hands_roles_to_fittest() {
    let fx = fixture();
    fx.manager.register_master(master("failed", "us-east"));
    fx.manager.register_master(master("strong", "eu-west"));
    fx.manager.register_master(master("weak", "eu-west"));
    fx.manager.set_health_provider(Arc::new(|node| {
        Some(match node.as_str() {
            "strong" => healthy(node, 5.0, 5.0),
            "weak" => healthy(node, 70.0, 70.0),
            _ => healthy(node, 10.0, 10.0),
        })
    }));
    fx.coordinator
        .promote_master(&"failed".into(), MasterRole::Ledger)
        .unwrap();

    fx.coordinator
        .handle_master_failure(&"failed".into())
        .unwrap();

    assert!(
        fx.manager
            .masters_with_role(MasterRole::Ledger)
            .iter()
            .any(|m| m.node_id == "strong")
    );
    let state = fx.coordinator.global_state();
    assert!(!state.role_assignments.contains_key("failed"));
}

#[tokio::test]
async fn test_sync_requests_are_processed_and_counted() {
    let fx = fixture();
    fx.coordinator.request_sync(SyncKind::Ledger, "peer".into());
    fx.coordinator.request_sync(SyncKind::Full, "peer".into());
    assert_eq!(fx.coordinator.stats().pending_syncs, 2);

    fx.coordinator.start();
    let mut done = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = fx.coordinator.stats();
        // No sync handler is registered in this fixture, so both requests
        // are reported as failed rather than silently dropped.
        if stats.failed_syncs == 2 && stats.pending_syncs == 0 {
            done = true;
            break;
        }
    }
    assert!(done);
    fx.coordinator.stop().await;
    let _ = (&fx.topology, &fx.router);
}

#[tokio::test]
async fn test_events_are_replayed_idempotently() {
    let fx = fixture();
    fx.manager.register_master(master("node-1", "us-east"));
    fx.coordinator
        .promote_master(&"node-1".into(), MasterRole::Gossip)
        .unwrap();

    let events = fx.coordinator.events();
    assert!(!events.is_empty());
    let event = events[0].clone();
    let version = fx.coordinator.global_state().state_version;

    // Replaying an event we already processed must not bump the state again.
    fx.coordinator.apply_event(event);
    assert_eq!(fx.coordinator.global_state().state_version, version);
}
