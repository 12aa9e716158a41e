// src/node/mod.rs

//! Node wiring: constructs every subsystem, connects their callbacks, and
//! drives the leaf-first start / reverse stop order.

pub mod bus;
pub mod handlers;
mod metrics_server;

use crate::config::ValidatorConfig;
use crate::core::consensus::{ClusterTransport, ConsensusEngine, StateMachineCallback};
use crate::core::coordinator::{MultiMasterCoordinator, MultiMasterManager};
use crate::core::coordinator::master::MasterNode;
use crate::core::events::{ClusterEvent, EventBus};
use crate::core::failover::{FailoverActionHandler, FailoverController};
use crate::core::gossip::{GossipNotification, GossipService, SocketTag, UdpGossipSink};
use crate::core::replication::{ReplicationManager, ReplicationTransport};
use crate::core::router::LoadBalancer;
use crate::core::topology::{TopologyManager, TopologyNode};
use crate::core::{NodeId, PeridotError, generate_node_id};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The injected boundaries a node runs against. Without an explicit action
/// handler the node steers failovers through its own router and topology.
pub struct NodeDependencies {
    pub cluster_transport: Arc<dyn ClusterTransport>,
    pub replication_transport: Arc<dyn ReplicationTransport>,
    pub action_handler: Option<Arc<dyn FailoverActionHandler>>,
}

/// One validator process: all coordination subsystems wired together.
pub struct ValidatorNode {
    config: ValidatorConfig,
    node_id: NodeId,
    events: Arc<EventBus>,
    gossip: Option<Arc<GossipService>>,
    gossip_socket: Option<Arc<UdpSocket>>,
    consensus: Arc<ConsensusEngine>,
    replication: Arc<ReplicationManager>,
    failover: Arc<FailoverController>,
    topology: Arc<TopologyManager>,
    router: Arc<LoadBalancer>,
    manager: Arc<MultiMasterManager>,
    coordinator: Arc<MultiMasterCoordinator>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ValidatorNode {
    /// Builds a node. Bind failures and invalid configuration are fatal: the
    /// node refuses to construct.
    pub async fn new(
        config: ValidatorConfig,
        deps: NodeDependencies,
    ) -> Result<Arc<Self>, PeridotError> {
        config.validate()?;
        let node_id = match &config.identity_keypair_path {
            Some(path) => std::fs::read_to_string(path)
                .map(|contents| contents.trim().to_string())
                .map_err(|e| {
                    PeridotError::InvalidConfig(format!("cannot read identity at '{path}': {e}"))
                })?,
            None => generate_node_id(),
        };
        info!("Validator node identity: {}", node_id);

        let events = Arc::new(EventBus::new());
        let router = LoadBalancer::new(config.router.clone());
        let topology = TopologyManager::new(config.topology.check_interval, events.clone());
        let manager = MultiMasterManager::new(config.multi_master.clone());
        let action_handler = deps.action_handler.unwrap_or_else(|| {
            handlers::RouterActionHandler::new(router.clone(), topology.clone())
        });
        let failover =
            FailoverController::new(config.failover.clone(), action_handler, events.clone());

        // The registry consults the failover controller's health view when it
        // validates promotion capacity.
        let health_source = failover.clone();
        manager.set_health_provider(Arc::new(move |node| health_source.node_health(node)));

        let coordinator = MultiMasterCoordinator::new(
            node_id.clone(),
            config.multi_master.clone(),
            &manager,
            &topology,
            &router,
            events.clone(),
        );
        coordinator.set_sync_handler(handlers::LoggingSyncHandler::new());

        let peers: Vec<NodeId> = config
            .peers
            .iter()
            .map(|peer| peer.node_id.clone())
            .collect();
        let consensus = ConsensusEngine::new(
            node_id.clone(),
            peers,
            config.consensus.clone(),
            deps.cluster_transport.clone(),
        );

        let replication = ReplicationManager::new(
            config.replication.clone(),
            deps.replication_transport.clone(),
            events.clone(),
        );

        let (gossip, gossip_socket) = if config.enable_gossip {
            let socket = UdpSocket::bind(&config.gossip_bind_address)
                .await
                .map_err(|e| {
                    PeridotError::Internal(format!(
                        "failed to bind gossip socket on {}: {e}",
                        config.gossip_bind_address
                    ))
                })?;
            let socket = Arc::new(socket);
            let advertised = format!("{}:{}", config.node_address, config.node_port);
            let service = GossipService::new(
                node_id.clone(),
                advertised,
                config.cluster_secret.clone(),
                config.gossip.clone(),
                Arc::new(UdpGossipSink::new(socket.clone())),
                events.clone(),
            );
            (Some(service), Some(socket))
        } else {
            (None, None)
        };

        // Seed the registries with ourselves.
        let self_master = MasterNode::new(
            node_id.clone(),
            config.node_address.clone(),
            config.node_port,
            config.region.clone(),
        );
        manager.register_master(self_master);
        topology.register_node(TopologyNode::new(
            node_id.clone(),
            config.node_address.clone(),
            config.node_port,
            config.region.clone(),
        ));
        failover.register_node(node_id.clone());

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            config,
            node_id,
            events,
            gossip,
            gossip_socket,
            consensus,
            replication,
            failover,
            topology,
            router,
            manager,
            coordinator,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn gossip(&self) -> Option<&Arc<GossipService>> {
        self.gossip.as_ref()
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.replication
    }

    pub fn failover(&self) -> &Arc<FailoverController> {
        &self.failover
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn router(&self) -> &Arc<LoadBalancer> {
        &self.router
    }

    pub fn multi_master(&self) -> &Arc<MultiMasterManager> {
        &self.manager
    }

    pub fn coordinator(&self) -> &Arc<MultiMasterCoordinator> {
        &self.coordinator
    }

    /// Passes the embedder's state-machine callback through to the engine.
    pub fn set_state_machine_callback(&self, callback: StateMachineCallback) {
        self.consensus.set_state_machine_callback(callback);
    }

    /// Starts every subsystem leaf-first and wires the cross-subsystem event
    /// flows.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Validator node {} starting", self.node_id);

        if let (Some(gossip), Some(socket)) = (&self.gossip, &self.gossip_socket) {
            gossip.start();
            gossip.spawn_udp_receiver(socket.clone());
        }
        self.consensus.start();
        self.replication.start();
        self.failover.start();
        self.topology.start();
        self.router.start();
        self.coordinator.start();

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(self.clone().run_event_wiring()));
        if let Some(gossip) = &self.gossip {
            handles.push(tokio::spawn(
                self.clone().run_gossip_wiring(gossip.subscribe()),
            ));
        }
        if self.config.metrics.enabled {
            let node = self.clone();
            let port = self.config.metrics.port;
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                metrics_server::run_metrics_server(node, port, shutdown_rx).await;
            }));
        }
    }

    /// Stops subsystems in reverse start order and joins the wiring tasks.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Validator node {} stopping", self.node_id);
        let _ = self.shutdown_tx.send(());

        self.coordinator.stop().await;
        self.router.stop().await;
        self.topology.stop().await;
        self.failover.stop().await;
        self.replication.stop().await;
        self.consensus.stop().await;
        if let Some(gossip) = &self.gossip {
            gossip.stop().await;
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        info!("Validator node {} stopped", self.node_id);
    }

    /// Routes failover outcomes into the coordinator so master roles follow
    /// the replacement.
    async fn run_event_wiring(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut events_rx = self.events.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                event = events_rx.recv() => {
                    match event {
                        Ok(ClusterEvent::FailoverCompleted { failed_node, replacement }) => {
                            debug!(
                                "Reassigning master roles after failover of {} to {}",
                                failed_node, replacement
                            );
                            if let Err(e) = self.coordinator.handle_master_failure(&failed_node) {
                                debug!("No master reassignment for {}: {}", failed_node, e);
                            }
                        }
                        Ok(ClusterEvent::ReplicationTargetFailed { target }) => {
                            warn!("Replication target {} deactivated", target);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Event wiring lagged; {} events dropped", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    /// Feeds gossip discoveries into the topology and failover registries.
    async fn run_gossip_wiring(
        self: Arc<Self>,
        mut notifications: broadcast::Receiver<GossipNotification>,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                notification = notifications.recv() => {
                    match notification {
                        Ok(GossipNotification::ContactInfo(info)) => {
                            let Some(addr) = info.socket(SocketTag::Gossip) else {
                                continue;
                            };
                            let (host, port) = match addr.rsplit_once(':') {
                                Some((host, port)) => {
                                    (host.to_string(), port.parse::<u16>().unwrap_or(0))
                                }
                                None => (addr.to_string(), 0),
                            };
                            self.topology.register_node(TopologyNode::new(
                                info.origin.clone(),
                                host,
                                port,
                                self.config.region.clone(),
                            ));
                            self.failover.register_node(info.origin);
                        }
                        Ok(GossipNotification::Vote { origin, slot }) => {
                            debug!("Observed vote from {} for slot {}", origin, slot);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Gossip wiring lagged; {} notifications dropped", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    /// All subsystem snapshots in one JSON document for the /stats endpoint.
    pub fn stats_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "node_id": self.node_id,
            "gossip": self.gossip.as_ref().map(|g| g.gossip_metrics()),
            "consensus": self.consensus.stats(),
            "replication": self.replication.stats(),
            "failover": self.failover.stats(),
            "multi_master": self.manager.stats(),
            "coordinator": self.coordinator.stats(),
            "topology": self.topology.stats(),
            "router": self.router.stats(),
        })
    }
}
