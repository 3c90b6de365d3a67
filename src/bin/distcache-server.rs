//! # 分布式缓存节点服务器
//!
//! 缓存节点的主程序。启动流程：加载配置（TOML 文件 + 命令行覆盖）、
//! 初始化日志、执行恢复（快照 + 预写日志回放）、启动后台工作任务
//! （复制排出、快照调度、心跳探测、作业清理）、向协调器注册，
//! 最后对外提供 gRPC 服务。
//!
//! ## 启动方式
//!
//! ### 使用默认配置启动
//! ```bash
//! cargo run --bin distcache-server
//! ```
//!
//! ### 使用配置文件启动
//! ```bash
//! cargo run --bin distcache-server -- --config node1.toml
//! ```
//!
//! ### 指定节点参数
//! ```bash
//! cargo run --bin distcache-server -- \
//!   --node-id node1 \
//!   --grpc-addr 127.0.0.1:50051 \
//!   --data-dir ./data/node1 \
//!   --coordinator http://127.0.0.1:50050 \
//!   --peers node2@127.0.0.1:50052 --peers node3@127.0.0.1:50053
//! ```
//!
//! ## 退出码
//!
//! 正常停机返回 0；配置无效、端口被占用或状态损坏等致命初始化错误
//! 在开始服务之前以非零码退出。

use anyhow::{anyhow, Context, Result};
use clap::{Arg, Command};
use distcache::cluster::failover::{FailoverConfig, FailoverManager};
use distcache::cluster::membership::{MembershipConfig, MembershipManager};
use distcache::cluster::rebalance::{
    GrpcMigrationTransport, RebalanceConfig, RebalanceOrchestrator,
};
use distcache::cluster::ring::HashRing;
use distcache::cluster::{Node, NodeStatus};
use distcache::metrics::Metrics;
use distcache::network::client::{ClientPool, NodeClient};
use distcache::network::server::{
    AdminService, CacheService, FailoverService, ReplicationService,
};
use distcache::proto;
use distcache::replication::{GrpcBatchSender, ReplicationConfig, ReplicationManager};
use distcache::storage::recovery::RecoveryManager;
use distcache::storage::snapshot::{SnapshotConfig, SnapshotStore};
use distcache::storage::wal::{Wal, WalConfig};
use distcache::storage::StorageEngine;
use distcache::NodeConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub node: NodeConfig,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &PathBuf) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Merge with command line arguments
    pub fn merge_with_args(&mut self, matches: &clap::ArgMatches) {
        if let Some(node_id) = matches.get_one::<String>("node-id") {
            self.node.node_id = node_id.clone();
        }
        if let Some(addr) = matches.get_one::<String>("grpc-addr") {
            self.node.listen_addr = addr.clone();
        }
        if let Some(data_dir) = matches.get_one::<String>("data-dir") {
            self.node.data_dir = data_dir.clone();
        }
        if let Some(coordinator) = matches.get_one::<String>("coordinator") {
            self.node.coordinator_addr = coordinator.clone();
        }
        if let Some(peers) = matches.get_many::<String>("peers") {
            for peer in peers {
                // Peer format: node_id@address
                if let Some((node_id, address)) = peer.split_once('@') {
                    self.node
                        .peers
                        .insert(node_id.to_string(), address.to_string());
                }
            }
        }
        if let Some(memory) = matches.get_one::<String>("max-memory-mb") {
            if let Ok(mb) = memory.parse::<usize>() {
                self.node.cache.max_memory_bytes = mb * 1024 * 1024;
            }
        }
        if let Some(log_level) = matches.get_one::<String>("log-level") {
            self.log_level = log_level.clone();
        }
    }

    /// Validate configuration; errors here are fatal before serving
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.is_empty() {
            return Err(anyhow!("Node ID cannot be empty"));
        }
        if self.node.listen_addr.is_empty() {
            return Err(anyhow!("gRPC listen address cannot be empty"));
        }
        if self.node.cache.num_shards == 0 {
            return Err(anyhow!("Shard count must be at least 1"));
        }
        if self.node.cluster.replication_factor == 0 {
            return Err(anyhow!("Replication factor must be at least 1"));
        }
        if self.node.cluster.failure_threshold >= self.node.cluster.dead_threshold {
            return Err(anyhow!(
                "Failure threshold ({}) must be below the dead threshold ({})",
                self.node.cluster.failure_threshold,
                self.node.cluster.dead_threshold
            ));
        }
        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(anyhow!("Invalid log level: {}", other)),
        }
        Ok(())
    }
}

/// Initialize logging
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
        .with_thread_ids(true)
        .init();
    Ok(())
}

/// Create command line interface
fn create_cli() -> Command {
    Command::new("distcache-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Distributed in-memory cache node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("node-id")
                .short('n')
                .long("node-id")
                .value_name("ID")
                .help("Unique node identifier"),
        )
        .arg(
            Arg::new("grpc-addr")
                .short('a')
                .long("grpc-addr")
                .value_name("ADDR")
                .help("gRPC bind address (e.g., 0.0.0.0:50051)"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory for WAL and snapshots"),
        )
        .arg(
            Arg::new("coordinator")
                .long("coordinator")
                .value_name("ADDR")
                .help("Coordinator endpoint (e.g., http://127.0.0.1:50050)"),
        )
        .arg(
            Arg::new("peers")
                .short('p')
                .long("peers")
                .value_name("ID@ADDR")
                .help("Peer in node_id@address form (repeatable)")
                .action(clap::ArgAction::Append),
        )
        .arg(
            Arg::new("max-memory-mb")
                .long("max-memory-mb")
                .value_name("MB")
                .help("Engine memory cap in megabytes"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value("info"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a sample configuration file and exit")
                .value_parser(clap::value_parser!(PathBuf)),
        )
}

/// Pull the coordinator's ring view into the local cached ring.
fn reconcile_ring(ring: &HashRing, view: &proto::GetRingResponse) {
    let wanted: std::collections::HashMap<&str, &str> = view
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n.address.as_str()))
        .collect();

    for node in ring.all_nodes() {
        if !wanted.contains_key(node.id.as_str()) {
            ring.remove_node(&node.id);
        }
    }
    for (id, address) in wanted {
        ring.add_node(Node::new(id, address));
    }
}

/// Start the node
async fn start_server(config: ServerConfig) -> Result<()> {
    info!("Starting distcache node");
    info!("Node ID: {}", config.node.node_id);
    info!("Data directory: {}", config.node.data_dir);
    info!("Listen address: {}", config.node.listen_addr);
    info!("Peers: {:?}", config.node.peers);

    let node = &config.node;
    let data_dir = PathBuf::from(&node.data_dir);
    let metrics = Arc::new(Metrics::new());

    // Storage: engine + WAL + snapshots
    let engine = Arc::new(StorageEngine::new(
        node.node_id.clone(),
        node.cache.num_shards,
        node.cache.max_memory_bytes,
        metrics.clone(),
    ));
    let wal = Arc::new(
        Wal::open(WalConfig {
            wal_dir: data_dir.join("wal"),
            node_id: node.node_id.clone(),
            max_file_size_bytes: node.cache.wal_max_file_size_bytes,
            max_log_files: node.cache.wal_max_files,
            sync_on_write: node.cache.wal_sync_on_write,
            sync_batch_size: 100,
        })
        .context("Failed to open the WAL")?,
    );
    let snapshots = Arc::new(
        SnapshotStore::open(SnapshotConfig {
            snapshot_dir: data_dir.join("snapshots"),
            node_id: node.node_id.clone(),
            snapshot_interval: Duration::from_secs(node.cache.snapshot_interval_secs),
            max_snapshots_retained: node.cache.max_snapshots_retained,
        })
        .context("Failed to open the snapshot store")?,
    );

    // Recovery runs exactly once, before any request is served
    let recovery = RecoveryManager::new(&engine, &snapshots, &wal);
    let result = recovery.recover().context("Recovery failed")?;
    info!(
        "Recovery done: {} keys in the engine after {} replayed record(s)",
        engine.len(),
        result.wal_records_replayed
    );

    // Cluster plumbing
    let pool = Arc::new(ClientPool::new());
    let ring = Arc::new(HashRing::new(node.cluster.virtual_nodes_per_node));
    ring.add_node(Node::new(&node.node_id, &node.listen_addr));
    for (peer_id, peer_addr) in &node.peers {
        ring.add_node(Node::new(peer_id, peer_addr));
    }

    let membership = Arc::new(MembershipManager::new(
        MembershipConfig {
            self_node_id: node.node_id.clone(),
            heartbeat_interval: Duration::from_millis(node.cluster.heartbeat_interval_ms),
            health_timeout: Duration::from_millis(node.cluster.health_timeout_ms),
            failure_threshold: node.cluster.failure_threshold,
            dead_threshold: node.cluster.dead_threshold,
        },
        pool.clone(),
    ));
    for (peer_id, peer_addr) in &node.peers {
        membership.add_node(Node::new(peer_id, peer_addr));
    }

    let health_membership = membership.clone();
    let failover = Arc::new(FailoverManager::new(
        FailoverConfig {
            node_id: node.node_id.clone(),
            replication_factor: node.cluster.replication_factor,
            auto_failover_enabled: node.cluster.auto_failover,
        },
        ring.clone(),
        Arc::new(move |node_id| health_membership.is_healthy(node_id)),
        metrics.clone(),
    ));

    // DEAD transitions drive failover; the route cache drops the peer
    let failover_trigger = failover.clone();
    membership.on_node_event(Arc::new(move |node, status| {
        if status == NodeStatus::Dead {
            failover_trigger.initiate_failover(&node.id);
        }
    }));

    let replication = Arc::new(ReplicationManager::new(
        ReplicationConfig {
            node_id: node.node_id.clone(),
            replication_factor: node.cluster.replication_factor,
            ..ReplicationConfig::default()
        },
        ring.clone(),
        Arc::new(GrpcBatchSender::new(pool.clone())),
        metrics.clone(),
    ));

    let orchestrator = Arc::new(RebalanceOrchestrator::new(
        RebalanceConfig::default(),
        engine.clone(),
        Arc::new(GrpcMigrationTransport::new(
            pool.clone(),
            Duration::from_secs(5),
        )),
    ));

    // Background workers share one stop flag and poll it every loop
    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();
    workers.push(tokio::spawn(replication.clone().run(stop.clone())));
    workers.push(tokio::spawn(snapshots.clone().run_scheduler(
        engine.clone(),
        wal.clone(),
        stop.clone(),
    )));
    workers.push(tokio::spawn(membership.clone().run(stop.clone())));
    workers.push(tokio::spawn(orchestrator.clone().run_janitor(stop.clone())));

    // Register with the coordinator and keep the cached ring fresh
    if !node.coordinator_addr.is_empty() {
        let client = NodeClient::connect_lazy(&node.coordinator_addr)
            .map_err(|e| anyhow!("Invalid coordinator address: {}", e))?;
        match client.register_node(&node.node_id, &node.listen_addr).await {
            Ok(response) => {
                info!("Registered with coordinator, ring version {}", response.ring_version)
            }
            Err(e) => warn!("Coordinator registration failed (will retry): {}", e),
        }

        let heartbeat_ring = ring.clone();
        let heartbeat_stop = stop.clone();
        let node_id = node.node_id.clone();
        let interval = Duration::from_millis(node.cluster.heartbeat_interval_ms);
        workers.push(tokio::spawn(async move {
            let mut known_version = 0u64;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if heartbeat_stop.load(Ordering::Relaxed) {
                    break;
                }
                match client.heartbeat(&node_id, known_version).await {
                    Ok(response) if response.ring_changed => {
                        match client.get_ring(known_version).await {
                            Ok(view) => {
                                reconcile_ring(&heartbeat_ring, &view);
                                known_version = view.version;
                                info!("Ring updated to version {}", known_version);
                            }
                            Err(e) => warn!("Failed to pull ring update: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Coordinator heartbeat failed: {}", e),
                }
            }
        }));
    }

    // Serve
    let serving = Arc::new(AtomicBool::new(true));
    let addr = node
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", node.listen_addr))?;

    let cache_service = CacheService::new(
        engine.clone(),
        wal.clone(),
        replication.clone(),
        serving.clone(),
    );
    let replication_service = ReplicationService::new(engine.clone());
    let failover_service = FailoverService::new(failover.clone(), engine.clone());
    let admin_service = AdminService::new(
        engine.clone(),
        ring.clone(),
        orchestrator.clone(),
        membership.clone(),
        metrics.clone(),
    );

    info!("gRPC services listening on {}", addr);
    let server = tonic::transport::Server::builder()
        .add_service(proto::cache_service_server::CacheServiceServer::new(cache_service))
        .add_service(proto::replication_service_server::ReplicationServiceServer::new(
            replication_service,
        ))
        .add_service(proto::failover_service_server::FailoverServiceServer::new(
            failover_service,
        ))
        .add_service(proto::admin_service_server::AdminServiceServer::new(admin_service));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .context("Failed to install SIGINT handler")?;

    let serve = server.serve(addr);
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            result.context("gRPC server failed")?;
            warn!("gRPC server exited unexpectedly");
        }
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
    }

    // Cooperative shutdown: mark not-serving, stop workers, bounded join
    serving.store(false, Ordering::Relaxed);
    stop.store(true, Ordering::Relaxed);
    let _ = wal.sync();
    for worker in workers {
        if tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .is_err()
        {
            warn!("A background worker did not stop in time");
        }
    }

    info!("Node shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = create_cli().get_matches();

    // Handle config generation
    if let Some(config_path) = matches.get_one::<PathBuf>("generate-config") {
        let config = ServerConfig::default();
        config.save_to_file(config_path)?;
        println!("Generated sample configuration file: {}", config_path.display());
        return Ok(());
    }

    // Load configuration, then apply command line overrides
    let mut config = if let Some(config_path) = matches.get_one::<PathBuf>("config") {
        ServerConfig::load_from_file(config_path)?
    } else {
        ServerConfig::default()
    };
    config.merge_with_args(&matches);

    init_logging(&config.log_level)?;

    config.validate().map_err(|e| {
        error!("Configuration validation failed: {}", e);
        e
    })?;

    start_server(config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert!(!config.node.node_id.is_empty());
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_config_validation() {
        let mut config = ServerConfig::default();
        config.node.node_id = String::new();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.node.cluster.failure_threshold = 6;
        config.node.cluster.dead_threshold = 3;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.node.cluster.replication_factor = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("node.toml");

        let original = ServerConfig::default();
        original.save_to_file(&path).unwrap();

        let loaded = ServerConfig::load_from_file(&path).unwrap();
        assert_eq!(original.node.node_id, loaded.node.node_id);
        assert_eq!(original.node.cache.num_shards, loaded.node.cache.num_shards);
        assert_eq!(original.log_level, loaded.log_level);
    }

    #[test]
    fn test_config_merge_with_args() {
        let cli = create_cli();
        let matches = cli
            .try_get_matches_from(vec![
                "distcache-server",
                "--node-id",
                "test-node",
                "--grpc-addr",
                "127.0.0.1:6000",
                "--data-dir",
                "/tmp/test",
                "--peers",
                "node2@127.0.0.1:6001",
                "--peers",
                "node3@127.0.0.1:6002",
                "--max-memory-mb",
                "64",
                "--log-level",
                "debug",
            ])
            .unwrap();

        let mut config = ServerConfig::default();
        config.merge_with_args(&matches);

        assert_eq!(config.node.node_id, "test-node");
        assert_eq!(config.node.listen_addr, "127.0.0.1:6000");
        assert_eq!(config.node.data_dir, "/tmp/test");
        assert_eq!(config.node.peers.len(), 2);
        assert_eq!(config.node.peers["node2"], "127.0.0.1:6001");
        assert_eq!(config.node.cache.max_memory_bytes, 64 * 1024 * 1024);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_defaults() {
        let cli = create_cli();
        let matches = cli.try_get_matches_from(vec!["distcache-server"]).unwrap();
        assert_eq!(matches.get_one::<String>("log-level").unwrap(), "info");
    }
}
