// src/main.rs

//! The main entry point for the Peridot validator node.

use anyhow::Result;
use peridot::config::ValidatorConfig;
use peridot::node::bus::UdpClusterBus;
use peridot::node::handlers::LoopbackReplicationTransport;
use peridot::node::{NodeDependencies, ValidatorNode};
use std::env;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("Peridot version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise it defaults to "peridot.toml" when present.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let mut config = match config_path {
        Some(path) => match ValidatorConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e}");
                std::process::exit(1);
            }
        },
        None if std::path::Path::new("peridot.toml").exists() => {
            match ValidatorConfig::from_file("peridot.toml") {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to load configuration from \"peridot.toml\": {e}");
                    std::process::exit(1);
                }
            }
        }
        None => ValidatorConfig::default(),
    };

    // Override the node port if provided as a command-line argument.
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        match args.get(port_index + 1).and_then(|s| s.parse().ok()) {
            Some(port) => config.node_port = port,
            None => {
                eprintln!("--port flag requires a valid port number");
                std::process::exit(1);
            }
        }
    }

    // Setup logging with reloading capabilities.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    info!("Starting Peridot v{VERSION}");

    // Standalone wiring: a UDP cluster bus for consensus and in-process
    // defaults for the remaining boundaries. Embedders supply their own.
    let bus_addr = format!("{}:{}", config.node_address, config.node_port);
    let bus = match UdpClusterBus::bind(&bus_addr).await {
        Ok(bus) => bus,
        Err(e) => {
            error!("Cannot start cluster bus: {}", e);
            return Err(e.into());
        }
    };
    for peer in &config.peers {
        bus.add_peer(peer.node_id.clone(), peer.address.clone());
    }

    let node = ValidatorNode::new(
        config,
        NodeDependencies {
            cluster_transport: bus.clone(),
            replication_transport: LoopbackReplicationTransport::new(),
            action_handler: None,
        },
    )
    .await;
    let node = match node {
        Ok(node) => node,
        Err(e) => {
            error!("Node failed to start: {}", e);
            return Err(e.into());
        }
    };

    bus.attach_engine(node.consensus().clone());

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let receiver_handle = bus.spawn_receiver(shutdown_tx.subscribe());

    node.start();
    info!("Node {} is up", node.node_id());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    node.stop().await;
    let _ = shutdown_tx.send(());
    let _ = receiver_handle.await;
    Ok(())
}
