//! Shared helpers for in-process multi-node cluster tests.
//!
//! Every test cluster runs all of its nodes inside one process: each node
//! is a coordinator with its own transport bound to a free localhost port.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use courier::{
    server_rank_to_id, worker_rank_to_id, Coordinator, NodeConfig, NodeId, Role, SCHEDULER_ID,
};

/// Upper bound for any single rendezvous or round-trip in these tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Opt into log output with `RUST_LOG=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Reserve a free localhost port by binding and immediately releasing it.
pub fn pick_free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind a probe listener")
        .local_addr()
        .expect("probe listener address")
        .port()
}

/// Member table with a free localhost port per node id.
pub fn member_table(num_servers: usize, num_workers: usize) -> BTreeMap<NodeId, SocketAddr> {
    let mut members = BTreeMap::new();
    let mut add = |id: NodeId| {
        let addr: SocketAddr = format!("127.0.0.1:{}", pick_free_port()).parse().expect("addr");
        members.insert(id, addr);
    };
    add(SCHEDULER_ID);
    for rank in 0..num_servers {
        add(server_rank_to_id(rank));
    }
    for rank in 0..num_workers {
        add(worker_rank_to_id(rank));
    }
    members
}

/// One fully started in-process cluster.
pub struct TestCluster {
    pub scheduler: Arc<Coordinator>,
    pub servers: Vec<Arc<Coordinator>>,
    pub workers: Vec<Arc<Coordinator>>,
}

impl TestCluster {
    pub fn all(&self) -> Vec<Arc<Coordinator>> {
        let mut nodes = vec![self.scheduler.clone()];
        nodes.extend(self.servers.iter().cloned());
        nodes.extend(self.workers.iter().cloned());
        nodes
    }

    /// Stop every node. Trackers must have been shut down first.
    pub async fn finalize(&self) -> anyhow::Result<()> {
        for node in self.all() {
            node.finalize().await?;
        }
        Ok(())
    }
}

/// Build and start a scheduler, `num_servers` servers, and `num_workers`
/// workers. Start is concurrent because every node blocks in the
/// all-cluster barrier until the others arrive.
pub async fn spawn_cluster(num_servers: usize, num_workers: usize) -> anyhow::Result<TestCluster> {
    init_tracing();
    let members = member_table(num_servers, num_workers);
    let build = |role: Role, rank: usize| -> anyhow::Result<Arc<Coordinator>> {
        let mut cfg = NodeConfig::new(role, rank, num_workers, num_servers, members.clone());
        cfg.heartbeat_interval = Duration::from_millis(200);
        cfg.heartbeat_timeout = Duration::from_secs(10);
        Ok(Coordinator::new(cfg)?)
    };

    let scheduler = build(Role::Scheduler, 0)?;
    let servers: Vec<_> = (0..num_servers)
        .map(|r| build(Role::Server, r))
        .collect::<anyhow::Result<_>>()?;
    let workers: Vec<_> = (0..num_workers)
        .map(|r| build(Role::Worker, r))
        .collect::<anyhow::Result<_>>()?;

    let cluster = TestCluster {
        scheduler,
        servers,
        workers,
    };
    let mut starts = Vec::new();
    for node in cluster.all() {
        starts.push(tokio::spawn(async move { node.start().await }));
    }
    for start in starts {
        tokio::time::timeout(TEST_TIMEOUT, start).await???;
    }
    Ok(cluster)
}
