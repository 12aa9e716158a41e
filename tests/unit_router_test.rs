use peridot::config::RouterConfig;
use peridot::core::router::{
    BackendServer, BackpressurePolicy, ConnectionRequest, LoadBalancer, RoutingRule,
    RoutingStrategy,
};
use std::collections::HashMap;
use std::sync::Arc;

fn backend(id: &str, region: &str) -> BackendServer {
    BackendServer::new(id.to_string(), format!("10.0.0.{id}"), 9000, region.into())
}

fn request(service: &str, id: &str) -> ConnectionRequest {
    ConnectionRequest {
        request_id: id.to_string(),
        service_name: service.to_string(),
        client_ip: "192.168.1.50".into(),
        session_id: None,
        target_region: None,
    }
}

fn router() -> Arc<LoadBalancer> {
    LoadBalancer::new(RouterConfig::default())
}

#[tokio::test]
async fn test_round_robin_distributes_evenly_in_order() {
    let balancer = router();
    for id in ["server1", "server2", "server3"] {
        balancer.register_backend(backend(id, "us-east"));
    }

    let mut counts: HashMap<String, u32> = HashMap::new();
    let mut order = Vec::new();
    for i in 0..9 {
        let response = balancer.route_request(&request("svc", &format!("r{i}")));
        assert!(response.success);
        let server = response.server_id.unwrap();
        order.push(server.clone());
        *counts.entry(server).or_default() += 1;
    }
    assert_eq!(counts["server1"], 3);
    assert_eq!(counts["server2"], 3);
    assert_eq!(counts["server3"], 3);
    assert_eq!(
        &order[..3],
        &[
            "server1".to_string(),
            "server2".to_string(),
            "server3".to_string()
        ]
    );
    assert_eq!(order[3], "server1");
}

#[tokio::test]
async fn test_empty_eligible_set_is_rejected() {
    let balancer = router();
    let response = balancer.route_request(&request("svc", "r1"));
    assert!(!response.success);
    assert!(!response.error_message.as_deref().unwrap_or("").is_empty());
    assert!(response.server_id.is_none());

    // A registered but draining server is still not eligible.
    balancer.register_backend(backend("server1", "us-east"));
    balancer.drain_backend(&"server1".into()).unwrap();
    let response = balancer.route_request(&request("svc", "r2"));
    assert!(!response.success);
}

#[tokio::test]
async fn test_single_server_wins_under_every_strategy() {
    let strategies = [
        RoutingStrategy::RoundRobin,
        RoutingStrategy::LeastConnections,
        RoutingStrategy::LeastResponseTime,
        RoutingStrategy::WeightedRoundRobin,
        RoutingStrategy::IpHash,
        RoutingStrategy::Geographic,
        RoutingStrategy::ResourceBased,
        RoutingStrategy::Adaptive,
    ];
    for strategy in strategies {
        let balancer = router();
        balancer.register_backend(backend("only", "us-east"));
        balancer.add_rule(RoutingRule::new("svc-rule", "svc", strategy).unwrap());
        let response = balancer.route_request(&request("svc", "r"));
        assert!(response.success, "strategy {strategy} failed");
        assert_eq!(response.server_id.as_deref(), Some("only"));
    }
}

#[tokio::test]
async fn test_ip_hash_is_sticky_per_client() {
    let balancer = router();
    for id in ["server1", "server2", "server3"] {
        balancer.register_backend(backend(id, "us-east"));
    }
    balancer.add_rule(RoutingRule::new("svc-rule", "svc", RoutingStrategy::IpHash).unwrap());

    let first = balancer.route_request(&request("svc", "r1")).server_id;
    for i in 0..5 {
        let again = balancer
            .route_request(&request("svc", &format!("r{i}")))
            .server_id;
        assert_eq!(again, first);
    }
}

#[tokio::test]
async fn test_least_connections_prefers_idle_server() {
    let balancer = router();
    balancer.register_backend(backend("server1", "us-east"));
    balancer.register_backend(backend("server2", "us-east"));
    balancer.add_rule(
        RoutingRule::new("svc-rule", "svc", RoutingStrategy::LeastConnections).unwrap(),
    );

    // First request loads server1 (both idle, order breaks the tie).
    let first = balancer.route_request(&request("svc", "r0")).server_id.unwrap();
    // The still-open connection steers the next request to the other server.
    let second = balancer.route_request(&request("svc", "r1")).server_id.unwrap();
    assert_ne!(first, second);

    // Completion releases the connection and the preference flips back.
    balancer.complete_request(&first, 5);
    balancer.complete_request(&second, 5);
    let third = balancer.route_request(&request("svc", "r2")).server_id.unwrap();
    assert_eq!(third, first);
}

#[tokio::test]
async fn test_geographic_prefers_matching_region() {
    let balancer = router();
    balancer.register_backend(backend("east", "us-east"));
    balancer.register_backend(backend("west", "us-west"));
    balancer.add_rule(RoutingRule::new("svc-rule", "svc", RoutingStrategy::Geographic).unwrap());

    let mut req = request("svc", "r1");
    req.target_region = Some("us-west".into());
    let response = balancer.route_request(&req);
    assert_eq!(response.server_id.as_deref(), Some("west"));

    // A region nobody serves leaves the available set empty.
    let mut req = request("svc", "r2");
    req.target_region = Some("ap-south".into());
    let response = balancer.route_request(&req);
    assert!(!response.success);
    assert!(
        response
            .error_message
            .as_deref()
            .unwrap_or("")
            .contains("ap-south")
    );

    // Without a target region the strategy falls back to least connections
    // over every eligible server.
    assert!(balancer.route_request(&request("svc", "r3")).success);
}

#[tokio::test]
async fn test_target_region_restricts_every_strategy() {
    // The region filter applies before strategy selection, so even
    // region-blind strategies never route out of region.
    let strategies = [
        RoutingStrategy::RoundRobin,
        RoutingStrategy::LeastConnections,
        RoutingStrategy::LeastResponseTime,
        RoutingStrategy::WeightedRoundRobin,
        RoutingStrategy::IpHash,
        RoutingStrategy::ResourceBased,
        RoutingStrategy::Adaptive,
    ];
    for strategy in strategies {
        let balancer = router();
        balancer.register_backend(backend("east1", "us-east"));
        balancer.register_backend(backend("east2", "us-east"));
        balancer.register_backend(backend("west1", "us-west"));
        balancer.add_rule(RoutingRule::new("svc-rule", "svc", strategy).unwrap());

        for i in 0..6 {
            let mut req = request("svc", &format!("r{i}"));
            req.target_region = Some("us-west".into());
            let response = balancer.route_request(&req);
            assert!(response.success, "strategy {strategy} rejected in-region");
            assert_eq!(
                response.server_id.as_deref(),
                Some("west1"),
                "strategy {strategy} escaped the requested region"
            );
        }
    }
}

#[tokio::test]
async fn test_session_affinity_sticks_until_ineligible() {
    let balancer = router();
    for id in ["server1", "server2", "server3"] {
        balancer.register_backend(backend(id, "us-east"));
    }
    balancer.add_rule(
        RoutingRule::new("svc-rule", "svc", RoutingStrategy::RoundRobin)
            .unwrap()
            .with_session_affinity(),
    );

    let mut req = request("svc", "r0");
    req.session_id = Some("session-42".into());
    let bound = balancer.route_request(&req).server_id.unwrap();

    for i in 1..6 {
        let mut req = request("svc", &format!("r{i}"));
        req.session_id = Some("session-42".into());
        let routed = balancer.route_request(&req).server_id.unwrap();
        assert_eq!(routed, bound, "affinity must pin the session");
    }

    // Once the bound server drains, the session moves elsewhere.
    balancer.drain_backend(&bound).unwrap();
    let mut req = request("svc", "r9");
    req.session_id = Some("session-42".into());
    let moved = balancer.route_request(&req).server_id.unwrap();
    assert_ne!(moved, bound);
}

#[tokio::test]
async fn test_weighted_round_robin_respects_rule_weights() {
    let balancer = router();
    balancer.register_backend(backend("heavy", "us-east"));
    balancer.register_backend(backend("light", "us-east"));
    let weights: HashMap<String, u32> =
        [("heavy".to_string(), 99), ("light".to_string(), 1)].into();
    balancer.add_rule(
        RoutingRule::new("svc-rule", "svc", RoutingStrategy::WeightedRoundRobin)
            .unwrap()
            .with_weights(weights),
    );

    let mut heavy_hits = 0;
    for i in 0..100 {
        let response = balancer.route_request(&request("svc", &format!("r{i}")));
        if response.server_id.as_deref() == Some("heavy") {
            heavy_hits += 1;
        }
    }
    assert!(heavy_hits > 80, "heavy server only won {heavy_hits}/100 draws");
}

#[tokio::test]
async fn test_rule_patterns_match_regex_and_literal() {
    let balancer = router();
    balancer.register_backend(backend("server1", "us-east"));
    balancer
        .add_rule(RoutingRule::new("api-rule", "api-.*", RoutingStrategy::RoundRobin).unwrap());

    assert!(balancer.route_request(&request("api-v1", "r1")).success);
    assert!(balancer.route_request(&request("api-v2", "r2")).success);
    // Anything else falls through to the default rule, which still routes.
    assert!(balancer.route_request(&request("other", "r3")).success);

    // Removing the default rule is refused.
    assert!(!balancer.remove_rule("default"));
    assert!(balancer.remove_rule("api-rule"));
}

#[tokio::test]
async fn test_queue_backpressure_rejects_exactly_overflow() {
    let config = RouterConfig {
        queue_capacity: 4,
        backpressure: BackpressurePolicy::Reject,
        ..Default::default()
    };
    let balancer = LoadBalancer::new(config);
    balancer.register_backend(backend("server1", "us-east"));

    let mut failures = 0;
    for i in 0..5 {
        let response = balancer.submit_request(request("svc", &format!("r{i}")));
        if !response.success {
            failures += 1;
            assert!(
                response
                    .error_message
                    .as_deref()
                    .unwrap_or("")
                    .contains("overloaded")
            );
        }
    }
    assert_eq!(failures, 1);
    assert_eq!(balancer.queue_metrics().push_failure_count, 1);
    assert_eq!(balancer.queue_metrics().allocated_count, 4);
}

#[tokio::test]
async fn test_health_failure_opens_breaker_and_excludes_backend() {
    let balancer = router();
    balancer.register_backend(backend("server1", "us-east"));
    balancer.register_backend(backend("server2", "us-east"));
    balancer.set_health_prober(Arc::new(|server| server.server_id != "server1"));

    balancer.start();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let stats = balancer.stats();
    assert_eq!(stats.backends, 2);
    assert!(stats.open_breakers >= 1);

    for i in 0..4 {
        let response = balancer.route_request(&request("svc", &format!("r{i}")));
        assert_eq!(response.server_id.as_deref(), Some("server2"));
    }
    balancer.stop().await;
}
