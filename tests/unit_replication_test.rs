use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use peridot::config::ReplicationSettings;
use peridot::core::events::EventBus;
use peridot::core::replication::{
    ReplicationBatch, ReplicationEntry, ReplicationManager, ReplicationStrategy,
    ReplicationTarget, ReplicationTransport, crc32,
};
use peridot::core::{NodeId, PeridotError};
use peridot::node::handlers::LoopbackReplicationTransport;
use std::sync::Arc;

/// A transport where chosen targets always fail.
#[derive(Default)]
struct FlakyTransport {
    down: DashSet<NodeId>,
    inner: LoopbackReplicationTransport,
}

impl FlakyTransport {
    fn take_down(&self, target: &str) {
        self.down.insert(target.to_string());
    }
}

#[async_trait]
impl ReplicationTransport for FlakyTransport {
    async fn send_batch(
        &self,
        target: &ReplicationTarget,
        batch: &ReplicationBatch,
    ) -> Result<u64, PeridotError> {
        if self.down.contains(&target.node_id) {
            return Err(PeridotError::TargetUnreachable(target.node_id.clone()));
        }
        self.inner.send_batch(target, batch).await
    }

    async fn send_heartbeat(
        &self,
        target: &ReplicationTarget,
        current_index: u64,
    ) -> Result<u64, PeridotError> {
        if self.down.contains(&target.node_id) {
            return Err(PeridotError::TargetUnreachable(target.node_id.clone()));
        }
        self.inner.send_heartbeat(target, current_index).await
    }

    async fn request_sync(
        &self,
        target: &ReplicationTarget,
        from_index: u64,
    ) -> Result<(), PeridotError> {
        if self.down.contains(&target.node_id) {
            return Err(PeridotError::TargetUnreachable(target.node_id.clone()));
        }
        self.inner.request_sync(target, from_index).await
    }
}

fn settings(strategy: ReplicationStrategy) -> ReplicationSettings {
    ReplicationSettings {
        strategy,
        batch_size: 4,
        max_retry_count: 2,
        quorum_size: 2,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_entries_carry_verifiable_checksums() {
    let entry = ReplicationEntry::new(1, Bytes::from_static(b"payload"), 0);
    assert!(entry.verify_checksum());
    assert_eq!(entry.checksum, crc32(b"payload"));

    let mut corrupted = entry.clone();
    corrupted.payload = Bytes::from_static(b"tampered");
    assert!(!corrupted.verify_checksum());
}

#[tokio::test]
async fn test_batch_delivery_updates_targets() {
    let manager = ReplicationManager::new(
        settings(ReplicationStrategy::Synchronous),
        Arc::new(FlakyTransport::default()),
        Arc::new(EventBus::new()),
    );
    manager.add_target("replica-1".into(), "10.0.0.1:9000".into());
    manager.add_target("replica-2".into(), "10.0.0.2:9000".into());

    for i in 0..3u8 {
        manager.submit(Bytes::from(vec![i]));
    }
    assert!(manager.replicate_pending().await);

    let target = manager.target(&"replica-1".into()).unwrap();
    assert_eq!(target.last_applied_index, 3);
    assert!(target.active);
    assert_eq!(manager.stats().batches_sent, 1);
}

#[tokio::test]
async fn test_synchronous_strategy_fails_on_any_miss() {
    let transport = Arc::new(FlakyTransport::default());
    transport.take_down("replica-2");
    let manager = ReplicationManager::new(
        settings(ReplicationStrategy::Synchronous),
        transport,
        Arc::new(EventBus::new()),
    );
    manager.add_target("replica-1".into(), "a".into());
    manager.add_target("replica-2".into(), "b".into());

    manager.submit(Bytes::from_static(b"x"));
    assert!(!manager.replicate_pending().await);
    assert_eq!(manager.stats().failed_batches, 1);
}

#[tokio::test]
async fn test_quorum_strategy_tolerates_minority_loss() {
    let transport = Arc::new(FlakyTransport::default());
    transport.take_down("replica-3");
    let manager = ReplicationManager::new(
        settings(ReplicationStrategy::QuorumBased),
        transport,
        Arc::new(EventBus::new()),
    );
    manager.add_target("replica-1".into(), "a".into());
    manager.add_target("replica-2".into(), "b".into());
    manager.add_target("replica-3".into(), "c".into());

    manager.submit(Bytes::from_static(b"x"));
    assert!(manager.replicate_pending().await);
}

#[tokio::test]
async fn test_asynchronous_strategy_always_succeeds_once_attempted() {
    let transport = Arc::new(FlakyTransport::default());
    transport.take_down("replica-1");
    transport.take_down("replica-2");
    let manager = ReplicationManager::new(
        settings(ReplicationStrategy::Asynchronous),
        transport,
        Arc::new(EventBus::new()),
    );
    manager.add_target("replica-1".into(), "a".into());
    manager.add_target("replica-2".into(), "b".into());

    manager.submit(Bytes::from_static(b"x"));
    assert!(manager.replicate_pending().await);
}

#[tokio::test]
async fn test_target_deactivated_after_repeated_failures_and_recovered() {
    let transport = Arc::new(FlakyTransport::default());
    transport.take_down("replica-1");
    let manager = ReplicationManager::new(
        settings(ReplicationStrategy::Asynchronous),
        transport.clone(),
        Arc::new(EventBus::new()),
    );
    manager.add_target("replica-1".into(), "a".into());

    // max_retry_count is 2; the third consecutive failure deactivates.
    for _ in 0..3 {
        manager.submit(Bytes::from_static(b"x"));
        manager.replicate_pending().await;
    }
    let target = manager.target(&"replica-1".into()).unwrap();
    assert!(!target.active);

    transport.down.remove("replica-1");
    manager.recover_target(&"replica-1".into()).await.unwrap();
    let target = manager.target(&"replica-1".into()).unwrap();
    assert!(target.active);
    assert_eq!(target.retry_count, 0);
}

#[tokio::test]
async fn test_runtime_strategy_switch() {
    let manager = ReplicationManager::new(
        settings(ReplicationStrategy::Synchronous),
        Arc::new(FlakyTransport::default()),
        Arc::new(EventBus::new()),
    );
    assert_eq!(manager.strategy(), ReplicationStrategy::Synchronous);
    manager.set_strategy(ReplicationStrategy::QuorumBased);
    assert_eq!(manager.strategy(), ReplicationStrategy::QuorumBased);
}

#[tokio::test]
async fn test_batches_drain_at_most_batch_size() {
    let manager = ReplicationManager::new(
        settings(ReplicationStrategy::Asynchronous),
        Arc::new(FlakyTransport::default()),
        Arc::new(EventBus::new()),
    );
    manager.add_target("replica-1".into(), "a".into());
    for i in 0..10u8 {
        manager.submit(Bytes::from(vec![i]));
    }
    manager.replicate_pending().await;
    // batch_size is 4, so 6 entries remain queued.
    assert_eq!(manager.stats().pending_entries, 6);
}
