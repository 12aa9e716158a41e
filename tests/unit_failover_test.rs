use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use peridot::config::FailoverConfig;
use peridot::core::events::EventBus;
use peridot::core::failover::{
    FailoverActionHandler, FailoverController, FailoverState, FailoverTrigger, NodeHealth,
};
use peridot::core::{NodeId, PeridotError};
use std::sync::Arc;
use std::time::Duration;

/// A scriptable action handler: per-node health readings plus a call log.
#[derive(Default)]
struct ScriptedHandler {
    health: DashMap<NodeId, NodeHealth>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedHandler {
    fn set_health(&self, node: &str, responsive: bool, cpu: f64) {
        let mut reading = NodeHealth::unresponsive(node.to_string());
        reading.responsive = responsive;
        reading.available = responsive;
        reading.cpu_usage = cpu;
        self.health.insert(node.to_string(), reading);
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl FailoverActionHandler for ScriptedHandler {
    async fn promote_to_leader(&self, node: &NodeId) -> Result<(), PeridotError> {
        self.log(format!("promote:{node}"));
        Ok(())
    }
    async fn demote_from_leader(&self, node: &NodeId) -> Result<(), PeridotError> {
        self.log(format!("demote:{node}"));
        Ok(())
    }
    async fn redirect_traffic(&self, from: &NodeId, to: &NodeId) -> Result<(), PeridotError> {
        self.log(format!("redirect:{from}->{to}"));
        Ok(())
    }
    async fn isolate_failed_node(&self, node: &NodeId) -> Result<(), PeridotError> {
        self.log(format!("isolate:{node}"));
        Ok(())
    }
    async fn restore_node_to_cluster(&self, node: &NodeId) -> Result<(), PeridotError> {
        self.log(format!("restore:{node}"));
        Ok(())
    }
    async fn get_node_health(&self, node: &NodeId) -> Result<NodeHealth, PeridotError> {
        self.health
            .get(node)
            .map(|entry| entry.clone())
            .ok_or_else(|| PeridotError::NodeNotFound(node.clone()))
    }
}

fn fast_config() -> FailoverConfig {
    FailoverConfig {
        health_check_interval: Duration::from_millis(30),
        // Long enough that the recovery loop never resurrects a node
        // mid-test and triggers a second failover.
        recovery_interval: Duration::from_secs(60),
        max_consecutive_failures: 2,
        failover_cooldown: Duration::from_secs(30),
        settle_delay: Duration::from_millis(20),
        ..Default::default()
    }
}

fn cluster(handler: &Arc<ScriptedHandler>) -> Arc<FailoverController> {
    let controller =
        FailoverController::new(fast_config(), handler.clone(), Arc::new(EventBus::new()));
    for node in ["node-a", "node-b", "node-c"] {
        handler.set_health(node, true, 10.0);
        controller.register_node(node.to_string());
        let mut healthy = NodeHealth::unresponsive(node.to_string());
        healthy.responsive = true;
        healthy.available = true;
        healthy.cpu_usage = 10.0;
        controller.report_health(healthy);
    }
    controller
}

#[tokio::test]
async fn test_manual_failover_switches_leader() {
    let handler = Arc::new(ScriptedHandler::default());
    let controller = cluster(&handler);
    controller.set_current_leader(Some("node-a".to_string()));

    let replacement = controller
        .trigger_failover(&"node-a".into(), FailoverTrigger::ManualFailover)
        .await
        .unwrap();
    assert_ne!(replacement, "node-a");
    assert_eq!(controller.current_leader(), Some(replacement.clone()));
    assert_eq!(controller.stats().successful_failovers, 1);
    assert_eq!(controller.current_state(), FailoverState::Normal);

    let calls = handler.calls.lock().clone();
    assert!(calls.iter().any(|c| c == "isolate:node-a"));
    assert!(calls.iter().any(|c| c == "demote:node-a"));
    assert!(calls.iter().any(|c| c == &format!("promote:{replacement}")));
    assert!(
        calls
            .iter()
            .any(|c| c == &format!("redirect:node-a->{replacement}"))
    );

    let history = controller.history();
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
}

#[tokio::test]
async fn test_replacement_prefers_fittest() {
    let handler = Arc::new(ScriptedHandler::default());
    let controller = cluster(&handler);

    // node-b is heavily loaded, node-c is idle.
    let mut busy = NodeHealth::unresponsive("node-b".to_string());
    busy.responsive = true;
    busy.available = true;
    busy.cpu_usage = 95.0;
    controller.report_health(busy);

    let replacement = controller
        .trigger_failover(&"node-a".into(), FailoverTrigger::HealthCheckFailed)
        .await
        .unwrap();
    assert_eq!(replacement, "node-c");
}

#[tokio::test]
async fn test_no_candidate_enters_emergency() {
    let handler = Arc::new(ScriptedHandler::default());
    let controller =
        FailoverController::new(fast_config(), handler.clone(), Arc::new(EventBus::new()));
    controller.register_node("node-a".to_string());

    let result = controller
        .trigger_failover(&"node-a".into(), FailoverTrigger::NodeUnresponsive)
        .await;
    assert!(matches!(result, Err(PeridotError::NoCandidate)));
    assert_eq!(controller.current_state(), FailoverState::Emergency);
    assert_eq!(controller.stats().failed_failovers, 1);
    assert_eq!(controller.stats().successful_failovers, 0);
}

#[tokio::test]
async fn test_cooldown_suppresses_back_to_back_failovers() {
    let handler = Arc::new(ScriptedHandler::default());
    let controller = cluster(&handler);

    controller
        .trigger_failover(&"node-a".into(), FailoverTrigger::ManualFailover)
        .await
        .unwrap();
    let second = controller
        .trigger_failover(&"node-b".into(), FailoverTrigger::ManualFailover)
        .await;
    assert!(second.is_err(), "second failover inside cooldown must be refused");
    assert_eq!(controller.stats().successful_failovers, 1);
}

#[tokio::test]
async fn test_automatic_failover_on_sustained_unresponsiveness() {
    let handler = Arc::new(ScriptedHandler::default());
    let controller = cluster(&handler);
    controller.set_current_leader(Some("node-a".to_string()));
    controller.start();

    // node-a goes dark; two consecutive failed checks trip the failover.
    handler.set_health("node-a", false, 0.0);

    let mut switched = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let leader = controller.current_leader();
        if leader.is_some() && leader != Some("node-a".to_string()) {
            switched = true;
            break;
        }
    }
    assert!(switched, "leader never moved off the unresponsive node");
    assert_eq!(controller.stats().successful_failovers, 1);

    // The controller settles back to Normal.
    let mut normal = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if controller.current_state() == FailoverState::Normal {
            normal = true;
            break;
        }
    }
    assert!(normal);
    controller.stop().await;
}

#[tokio::test]
async fn test_failed_node_is_tracked_for_recovery() {
    let handler = Arc::new(ScriptedHandler::default());
    let controller = cluster(&handler);

    controller
        .trigger_failover(&"node-a".into(), FailoverTrigger::ManualFailover)
        .await
        .unwrap();
    assert!(controller.failed_since(&"node-a".into()).is_some());
    assert_eq!(controller.stats().failed_nodes, 1);
}
