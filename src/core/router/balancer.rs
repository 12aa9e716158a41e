// src/core/router/balancer.rs

//! The distributed request router: rule matching, strategy-driven backend
//! selection, session affinity, circuit breaking, and the bounded intake
//! queue.
//!
//! Hot-path routing takes only short shared locks and atomic counters; health
//! probing and breaker re-probes run on their own loops.

use crate::config::RouterConfig;
use crate::core::metrics;
use crate::core::router::affinity::SessionAffinity;
use crate::core::router::backend::BackendServer;
use crate::core::router::breaker::CircuitBreakers;
use crate::core::router::queue::{QueueMetrics, RequestQueue};
use crate::core::router::strategy::{RoutingStrategy, SelectionContext, select};
use crate::core::{NodeId, PeridotError, now_ms};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Decides whether a backend is currently healthy. Runs on the health loop,
/// never on the routing hot path.
pub type HealthProber = Arc<dyn Fn(&BackendServer) -> bool + Send + Sync>;

/// One routing rule. Rules are evaluated in insertion order; the `default`
/// rule always exists and matches everything.
#[derive(Clone)]
pub struct RoutingRule {
    pub name: String,
    pub pattern: String,
    regex: Option<Regex>,
    pub strategy: RoutingStrategy,
    pub session_affinity: bool,
    pub weights: HashMap<String, u32>,
}

impl RoutingRule {
    /// Builds a rule. `pattern` is matched literally and, when it compiles,
    /// as an anchored regex.
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        strategy: RoutingStrategy,
    ) -> Result<Self, PeridotError> {
        let pattern = pattern.into();
        let regex = if pattern.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
            // Plain literal; no regex needed.
            None
        } else {
            Some(Regex::new(&format!("^(?:{pattern})$"))?)
        };
        Ok(Self {
            name: name.into(),
            pattern,
            regex,
            strategy,
            session_affinity: false,
            weights: HashMap::new(),
        })
    }

    pub fn with_session_affinity(mut self) -> Self {
        self.session_affinity = true;
        self
    }

    pub fn with_weights(mut self, weights: HashMap<String, u32>) -> Self {
        self.weights = weights;
        self
    }

    fn matches(&self, service_name: &str) -> bool {
        if self.pattern == service_name {
            return true;
        }
        self.regex
            .as_ref()
            .is_some_and(|regex| regex.is_match(service_name))
    }
}

/// An incoming request to be routed.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub request_id: String,
    pub service_name: String,
    pub client_ip: String,
    pub session_id: Option<String>,
    pub target_region: Option<String>,
}

/// The routing decision handed back to the caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionResponse {
    pub request_id: String,
    pub server_id: Option<NodeId>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub success: bool,
    pub error_message: Option<String>,
    pub response_time_ms: u64,
}

impl ConnectionResponse {
    fn rejected(request_id: String, error: impl Into<String>) -> Self {
        Self {
            request_id,
            server_id: None,
            address: None,
            port: None,
            success: false,
            error_message: Some(error.into()),
            response_time_ms: 0,
        }
    }
}

/// A non-blocking snapshot of router counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LoadBalancerStats {
    pub backends: usize,
    pub eligible_backends: usize,
    pub open_breakers: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub active_sessions: usize,
    pub requests_by_region: HashMap<String, u64>,
    pub queue: QueueMetrics,
}

/// The request router.
pub struct LoadBalancer {
    config: RouterConfig,
    /// Keyed and iterated in server-id order so counter-based strategies are
    /// deterministic.
    servers: RwLock<BTreeMap<NodeId, BackendServer>>,
    rules: RwLock<Vec<RoutingRule>>,
    counters: DashMap<String, Arc<AtomicUsize>>,
    affinity: SessionAffinity,
    breakers: CircuitBreakers,
    queue: RequestQueue<ConnectionRequest>,
    prober: RwLock<Option<HealthProber>>,
    responses: broadcast::Sender<ConnectionResponse>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    region_counts: DashMap<String, u64>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl LoadBalancer {
    pub fn new(config: RouterConfig) -> Arc<Self> {
        let default_rule = RoutingRule::new("default", ".*", config.default_strategy)
            .expect("the default rule pattern always compiles");
        let (responses, _) = broadcast::channel(4096);
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            queue: RequestQueue::new(config.queue_capacity),
            breakers: CircuitBreakers::new(config.breaker_probe_interval),
            config,
            servers: RwLock::new(BTreeMap::new()),
            rules: RwLock::new(vec![default_rule]),
            counters: DashMap::new(),
            affinity: SessionAffinity::new(),
            prober: RwLock::new(None),
            responses,
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            region_counts: DashMap::new(),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn set_health_prober(&self, prober: HealthProber) {
        *self.prober.write() = Some(prober);
    }

    pub fn subscribe_responses(&self) -> broadcast::Receiver<ConnectionResponse> {
        self.responses.subscribe()
    }

    // --- Backend registry ---

    pub fn register_backend(&self, server: BackendServer) {
        info!(
            "Registered backend {} at {}:{} ({})",
            server.server_id, server.address, server.port, server.region
        );
        self.breakers.register(server.server_id.clone());
        self.servers
            .write()
            .insert(server.server_id.clone(), server);
    }

    pub fn deregister_backend(&self, server_id: &NodeId) -> bool {
        let removed = self.servers.write().remove(server_id).is_some();
        if removed {
            self.breakers.deregister(server_id);
            self.affinity.unbind_server(server_id);
            info!("Deregistered backend {}", server_id);
        }
        removed
    }

    /// Puts a backend into draining: in-flight requests finish, new ones go
    /// elsewhere.
    pub fn drain_backend(&self, server_id: &NodeId) -> Result<(), PeridotError> {
        let mut servers = self.servers.write();
        let server = servers
            .get_mut(server_id)
            .ok_or_else(|| PeridotError::ServerNotFound(server_id.clone()))?;
        server.draining = true;
        Ok(())
    }

    pub fn get_backend(&self, server_id: &NodeId) -> Option<BackendServer> {
        self.servers.read().get(server_id).cloned()
    }

    // --- Rules ---

    /// Installs a rule ahead of the default catch-all.
    pub fn add_rule(&self, rule: RoutingRule) {
        let mut rules = self.rules.write();
        let at = rules.len().saturating_sub(1);
        rules.insert(at, rule);
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        if name == "default" {
            return false;
        }
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|rule| rule.name != name);
        rules.len() < before
    }

    // --- Routing ---

    /// Routes one request to a backend. The hot path: shared locks and
    /// atomics only, no I/O.
    pub fn route_request(&self, request: &ConnectionRequest) -> ConnectionResponse {
        let started = Instant::now();
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let rule = {
            let rules = self.rules.read();
            rules
                .iter()
                .find(|rule| rule.matches(&request.service_name))
                .cloned()
                .expect("the default rule matches every service")
        };

        // Session affinity first: an existing binding to a still-eligible
        // backend short-circuits selection.
        if rule.session_affinity {
            if let Some(session_id) = &request.session_id {
                if let Some(server_id) = self.affinity.lookup(session_id) {
                    if let Some(server) = self.eligible_backend(&server_id) {
                        self.affinity.bind(session_id.clone(), server_id);
                        return self.accept(request, &rule, server, started);
                    }
                    self.affinity.unbind(session_id);
                }
            }
        }

        // The available set: eligible servers, restricted to the requested
        // region when one is named. Every strategy draws from this set; the
        // per-strategy region terms only break ties within it.
        let candidates: Vec<BackendServer> = {
            let servers = self.servers.read();
            servers
                .values()
                .filter(|server| {
                    server.is_eligible() && self.breakers.is_closed(&server.server_id)
                })
                .filter(|server| {
                    request
                        .target_region
                        .as_deref()
                        .is_none_or(|region| server.region == region)
                })
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            metrics::ROUTED_REQUESTS_TOTAL
                .with_label_values(&["no_backend"])
                .inc();
            let error = match request.target_region.as_deref() {
                Some(region) => format!(
                    "no eligible backend for service '{}' in region '{region}'",
                    request.service_name
                ),
                None => format!("no eligible backend for service '{}'", request.service_name),
            };
            return ConnectionResponse::rejected(request.request_id.clone(), error);
        }

        let counter = self
            .counters
            .entry(request.service_name.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        let ctx = SelectionContext {
            counter: &counter,
            client_ip: &request.client_ip,
            target_region: request.target_region.as_deref(),
            rule_weights: &rule.weights,
        };
        let Some(chosen) = select(rule.strategy, &candidates, &ctx) else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            return ConnectionResponse::rejected(
                request.request_id.clone(),
                "strategy produced no selection",
            );
        };
        let server = candidates[chosen].clone();

        if rule.session_affinity {
            if let Some(session_id) = &request.session_id {
                self.affinity.bind(session_id.clone(), server.server_id.clone());
            }
        }
        self.accept(request, &rule, server, started)
    }

    fn accept(
        &self,
        request: &ConnectionRequest,
        rule: &RoutingRule,
        server: BackendServer,
        started: Instant,
    ) -> ConnectionResponse {
        {
            let mut servers = self.servers.write();
            if let Some(entry) = servers.get_mut(&server.server_id) {
                entry.current_connections = entry.current_connections.saturating_add(1);
            }
        }
        *self.region_counts.entry(server.region.clone()).or_insert(0) += 1;
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        metrics::ROUTED_REQUESTS_TOTAL
            .with_label_values(&["ok"])
            .inc();
        let elapsed = started.elapsed();
        metrics::ROUTING_LATENCY_SECONDS.observe(elapsed.as_secs_f64());
        debug!(
            "Routed {} ({} via rule '{}') to {}",
            request.request_id, request.service_name, rule.name, server.server_id
        );
        ConnectionResponse {
            request_id: request.request_id.clone(),
            server_id: Some(server.server_id),
            address: Some(server.address),
            port: Some(server.port),
            success: true,
            error_message: None,
            response_time_ms: elapsed.as_millis() as u64,
        }
    }

    /// Reports a finished request so connection counts and response averages
    /// stay honest.
    pub fn complete_request(&self, server_id: &NodeId, response_time_ms: u64) {
        let mut servers = self.servers.write();
        if let Some(server) = servers.get_mut(server_id) {
            server.current_connections = server.current_connections.saturating_sub(1);
            server.avg_response_ms = if server.avg_response_ms == 0.0 {
                response_time_ms as f64
            } else {
                server.avg_response_ms * 0.8 + response_time_ms as f64 * 0.2
            };
        }
    }

    /// Enqueues a request for asynchronous routing by the worker loop. On a
    /// full queue the request is released and the caller gets an overload
    /// rejection.
    pub fn submit_request(&self, request: ConnectionRequest) -> ConnectionResponse {
        let request_id = request.request_id.clone();
        match self
            .queue
            .push_with_policy(request, self.config.backpressure)
        {
            Ok(()) => ConnectionResponse {
                request_id,
                server_id: None,
                address: None,
                port: None,
                success: true,
                error_message: None,
                response_time_ms: 0,
            },
            Err(rejected) => {
                // Ownership came back to us; dropping it releases the request.
                drop(rejected);
                ConnectionResponse::rejected(request_id, "request queue overloaded")
            }
        }
    }

    pub fn queue_metrics(&self) -> QueueMetrics {
        self.queue.metrics()
    }

    fn eligible_backend(&self, server_id: &NodeId) -> Option<BackendServer> {
        let servers = self.servers.read();
        let server = servers.get(server_id)?;
        (server.is_eligible() && self.breakers.is_closed(server_id)).then(|| server.clone())
    }

    pub fn stats(&self) -> LoadBalancerStats {
        let servers = self.servers.read();
        LoadBalancerStats {
            backends: servers.len(),
            eligible_backends: servers
                .values()
                .filter(|server| server.is_eligible() && self.breakers.is_closed(&server.server_id))
                .count(),
            open_breakers: self.breakers.open_count(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            active_sessions: self.affinity.len(),
            requests_by_region: self
                .region_counts
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            queue: self.queue.metrics(),
        }
    }

    // --- Background loops ---

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Request router starting");
        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(self.clone().run_queue_worker()));
        handles.push(tokio::spawn(self.clone().run_breaker_loop()));
        handles.push(tokio::spawn(self.clone().run_health_loop()));
        handles.push(tokio::spawn(self.clone().run_affinity_gc_loop()));
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("Request router stopped");
    }

    async fn run_queue_worker(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = time::sleep(Duration::from_millis(10)) => {
                    while let Some(request) = self.queue.pop() {
                        let response = self.route_request(&request);
                        let _ = self.responses.send(response);
                    }
                }
            }
        }
    }

    async fn run_breaker_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.breaker_probe_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    self.probe_open_breakers();
                }
            }
        }
    }

    async fn run_health_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    self.check_backend_health();
                }
            }
        }
    }

    async fn run_affinity_gc_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(self.config.affinity_gc_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {
                    let removed = self.affinity.collect_expired();
                    if removed > 0 {
                        debug!("Collected {} expired session bindings", removed);
                    }
                }
            }
        }
    }

    fn probe_open_breakers(&self) {
        let Some(prober) = self.prober.read().clone() else {
            return;
        };
        for server_id in self.breakers.due_for_probe() {
            let Some(server) = self.get_backend(&server_id) else {
                continue;
            };
            if prober(&server) {
                self.breakers.record_success(&server_id);
                let mut servers = self.servers.write();
                if let Some(entry) = servers.get_mut(&server_id) {
                    entry.health_score = 1.0;
                    entry.last_health_check_ms = now_ms();
                }
            } else {
                self.breakers.record_failure(&server_id);
            }
        }
    }

    fn check_backend_health(&self) {
        let Some(prober) = self.prober.read().clone() else {
            return;
        };
        let snapshot: Vec<BackendServer> = self.servers.read().values().cloned().collect();
        for server in snapshot {
            let healthy = prober(&server);
            {
                let mut servers = self.servers.write();
                if let Some(entry) = servers.get_mut(&server.server_id) {
                    entry.health_score = if healthy { 1.0 } else { 0.0 };
                    entry.last_health_check_ms = now_ms();
                }
            }
            if !healthy {
                warn!("Backend {} failed its health check", server.server_id);
                self.breakers.record_failure(&server.server_id);
            }
        }
    }
}
