//! Bootstrap configuration and node identity.
//!
//! A cluster is described once at startup: this node's role and rank, the
//! worker/server counts, and the full member address table. Configuration
//! is built programmatically or read from the process environment:
//!
//! ```text
//! COURIER_ROLE=worker COURIER_RANK=0
//! COURIER_NUM_WORKERS=2 COURIER_NUM_SERVERS=2
//! COURIER_MEMBERS=1@10.0.0.1:7000,8@10.0.0.2:7000,...
//! ```
//!
//! The member list uses `id@addr` entries for every node id derived from
//! the counts, scheduler included.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::range::KeyRange;
use crate::{
    server_rank_to_id, worker_rank_to_id, GroupId, NodeId, SCHEDULER, SCHEDULER_ID, SERVER_GROUP,
    WORKER_GROUP,
};

/// Role of one cluster process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Scheduler,
    Server,
    Worker,
}

impl Role {
    /// The group flag this role belongs to.
    pub fn group_flag(&self) -> GroupId {
        match self {
            Role::Scheduler => SCHEDULER,
            Role::Server => SERVER_GROUP,
            Role::Worker => WORKER_GROUP,
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduler" => Ok(Role::Scheduler),
            "server" => Ok(Role::Server),
            "worker" => Ok(Role::Worker),
            other => Err(Error::Config(format!("unknown role {other:?}"))),
        }
    }
}

/// Identity of one cluster node, fixed at cluster start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub role: Role,
    pub addr: SocketAddr,
    /// Key range owned by this node; servers only.
    pub range: Option<KeyRange>,
}

/// Bootstrap information consumed by the coordinator at start.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: Role,
    /// Rank within the role's group. Scheduler rank is always 0.
    pub rank: usize,
    pub num_workers: usize,
    pub num_servers: usize,
    /// Listen address of every node id in the cluster.
    pub members: BTreeMap<NodeId, SocketAddr>,
    /// Cadence of liveness probes from the monitor loop.
    pub heartbeat_interval: Duration,
    /// Silence threshold after which a monitored peer is reported dead.
    pub heartbeat_timeout: Duration,
}

impl NodeConfig {
    pub fn new(
        role: Role,
        rank: usize,
        num_workers: usize,
        num_servers: usize,
        members: BTreeMap<NodeId, SocketAddr>,
    ) -> Self {
        Self {
            role,
            rank,
            num_workers,
            num_servers,
            members,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(5),
        }
    }

    /// Read the configuration from `COURIER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let role = Role::parse(&env_var("COURIER_ROLE")?)?;
        let rank = parse_env_usize("COURIER_RANK", 0)?;
        let num_workers = parse_env_usize("COURIER_NUM_WORKERS", 1)?;
        let num_servers = parse_env_usize("COURIER_NUM_SERVERS", 1)?;
        let members = parse_members(&env_var("COURIER_MEMBERS")?)?;
        let cfg = Self::new(role, rank, num_workers, num_servers, members);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Node id of this process under the rank-derived id scheme.
    pub fn my_node_id(&self) -> NodeId {
        match self.role {
            Role::Scheduler => SCHEDULER_ID,
            Role::Server => server_rank_to_id(self.rank),
            Role::Worker => worker_rank_to_id(self.rank),
        }
    }

    /// Every node id the cluster is configured with, ascending.
    pub fn all_node_ids(&self) -> Vec<NodeId> {
        let mut ids = vec![SCHEDULER_ID];
        ids.extend((0..self.num_servers).map(server_rank_to_id));
        ids.extend((0..self.num_workers).map(worker_rank_to_id));
        ids.sort_unstable();
        ids
    }

    /// Fatal-class sanity checks on the bootstrap info.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 || self.num_servers == 0 {
            return Err(Error::Config(
                "cluster needs at least one worker and one server".into(),
            ));
        }
        let group_size = match self.role {
            Role::Scheduler => 1,
            Role::Server => self.num_servers,
            Role::Worker => self.num_workers,
        };
        if self.rank >= group_size {
            return Err(Error::Config(format!(
                "rank {} out of bounds for a group of {group_size}",
                self.rank
            )));
        }
        for id in self.all_node_ids() {
            if !self.members.contains_key(&id) {
                return Err(Error::Config(format!(
                    "member table is missing node {id}"
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for (id, addr) in &self.members {
            if !seen.insert(*addr) {
                return Err(Error::Config(format!(
                    "member table reuses address {addr} (node {id})"
                )));
            }
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_timeout < self.heartbeat_interval {
            return Err(Error::Config(
                "heartbeat timeout must be at least one interval".into(),
            ));
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::Config(format!("{key} is not set")))
}

fn parse_env_usize(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} is not an integer: {v:?}"))),
        Err(_) => Ok(default),
    }
}

/// Parse a `id@addr,id@addr,...` member list, the same shape the rest of
/// the cluster tooling uses for initial membership.
pub fn parse_members(list: &str) -> Result<BTreeMap<NodeId, SocketAddr>> {
    let mut members = BTreeMap::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, addr) = entry
            .split_once('@')
            .ok_or_else(|| Error::Config(format!("member entry {entry:?} is not id@addr")))?;
        let id: NodeId = id
            .parse()
            .map_err(|_| Error::Config(format!("bad node id in member entry {entry:?}")))?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| Error::Config(format!("bad address in member entry {entry:?}")))?;
        if members.insert(id, addr).is_some() {
            return Err(Error::Config(format!("duplicate member entry for node {id}")));
        }
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members_for(num_servers: usize, num_workers: usize) -> BTreeMap<NodeId, SocketAddr> {
        let mut members = BTreeMap::new();
        let mut port = 7000;
        let mut add = |id: NodeId| {
            members.insert(id, format!("127.0.0.1:{port}").parse().unwrap());
            port += 1;
        };
        add(SCHEDULER_ID);
        for r in 0..num_servers {
            add(server_rank_to_id(r));
        }
        for r in 0..num_workers {
            add(worker_rank_to_id(r));
        }
        members
    }

    #[test]
    fn parse_members_accepts_the_id_at_addr_form() {
        let members = parse_members("1@127.0.0.1:7000, 8@127.0.0.1:7001,9@127.0.0.1:7002").unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members[&8], "127.0.0.1:7001".parse().unwrap());
        assert!(parse_members("8=127.0.0.1:7001").is_err());
        assert!(parse_members("8@127.0.0.1:7001,8@127.0.0.1:7002").is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_rank_and_missing_members() {
        let cfg = NodeConfig::new(Role::Worker, 2, 2, 1, members_for(1, 2));
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut members = members_for(1, 1);
        members.remove(&server_rank_to_id(0));
        let cfg = NodeConfig::new(Role::Worker, 0, 1, 1, members);
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_duplicate_addresses() {
        let mut members = members_for(1, 1);
        let scheduler_addr = members[&SCHEDULER_ID];
        members.insert(worker_rank_to_id(0), scheduler_addr);
        let cfg = NodeConfig::new(Role::Scheduler, 0, 1, 1, members);
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn my_node_id_follows_the_rank_scheme() {
        let cfg = NodeConfig::new(Role::Server, 1, 2, 2, members_for(2, 2));
        assert_eq!(cfg.my_node_id(), 10);
        let cfg = NodeConfig::new(Role::Worker, 1, 2, 2, members_for(2, 2));
        assert_eq!(cfg.my_node_id(), 11);
        let cfg = NodeConfig::new(Role::Scheduler, 0, 2, 2, members_for(2, 2));
        assert_eq!(cfg.my_node_id(), SCHEDULER_ID);
    }
}
