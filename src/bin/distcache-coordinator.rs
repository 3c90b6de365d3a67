//! # 分布式缓存协调器
//!
//! 协调器进程：集群成员与环版本的权威注册表。节点在此注册并心跳，
//! 操作员通过它增删节点；每次环变更都原子落盘，重启后读回。
//!
//! ## 启动方式
//!
//! ```bash
//! cargo run --bin distcache-coordinator -- \
//!   --grpc-addr 127.0.0.1:50050 \
//!   --state-file ./coordinator-state.json
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Arg, Command};
use distcache::cluster::coordinator::{Coordinator, CoordinatorConfig};
use distcache::network::server::CoordinatorService;
use distcache::proto;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn init_logging(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        other => return Err(anyhow!("Invalid log level: {}", other)),
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
    Ok(())
}

fn create_cli() -> Command {
    Command::new("distcache-coordinator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Distributed cache topology coordinator")
        .arg(
            Arg::new("grpc-addr")
                .short('a')
                .long("grpc-addr")
                .value_name("ADDR")
                .help("gRPC bind address")
                .default_value("127.0.0.1:50050"),
        )
        .arg(
            Arg::new("state-file")
                .short('s')
                .long("state-file")
                .value_name("FILE")
                .help("Path of the persisted cluster state")
                .default_value("./coordinator-state.json")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("replication-factor")
                .short('r')
                .long("replication-factor")
                .value_name("N")
                .help("Replicas per key")
                .default_value("3"),
        )
        .arg(
            Arg::new("virtual-nodes")
                .long("virtual-nodes")
                .value_name("V")
                .help("Virtual nodes per physical node")
                .default_value("150"),
        )
        .arg(
            Arg::new("heartbeat-timeout-ms")
                .long("heartbeat-timeout-ms")
                .value_name("MS")
                .help("Heartbeat age before a node is considered unhealthy")
                .default_value("5000"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value("info"),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = create_cli().get_matches();

    init_logging(matches.get_one::<String>("log-level").unwrap())?;

    let replication_factor: usize = matches
        .get_one::<String>("replication-factor")
        .unwrap()
        .parse()
        .context("Invalid replication factor")?;
    let virtual_nodes: usize = matches
        .get_one::<String>("virtual-nodes")
        .unwrap()
        .parse()
        .context("Invalid virtual node count")?;
    let heartbeat_timeout_ms: u64 = matches
        .get_one::<String>("heartbeat-timeout-ms")
        .unwrap()
        .parse()
        .context("Invalid heartbeat timeout")?;
    if replication_factor == 0 {
        return Err(anyhow!("Replication factor must be at least 1"));
    }

    let config = CoordinatorConfig {
        replication_factor,
        virtual_nodes_per_node: virtual_nodes,
        heartbeat_timeout: Duration::from_millis(heartbeat_timeout_ms),
        state_path: matches.get_one::<PathBuf>("state-file").unwrap().clone(),
    };

    let coordinator =
        Arc::new(Coordinator::open(config).context("Failed to load coordinator state")?);
    info!(
        "Coordinator ready, ring version {}, {} node(s) known",
        coordinator.ring_version(),
        coordinator.get_nodes().len()
    );

    let addr = matches
        .get_one::<String>("grpc-addr")
        .unwrap()
        .parse()
        .context("Invalid gRPC bind address")?;
    info!("Coordinator listening on {}", addr);

    let service = CoordinatorService::new(coordinator);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .context("Failed to install SIGINT handler")?;

    let server = tonic::transport::Server::builder()
        .add_service(proto::coordinator_service_server::CoordinatorServiceServer::new(service))
        .serve(addr);
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result.context("Coordinator server failed")?,
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
    }

    info!("Coordinator shutdown complete");
    Ok(())
}
