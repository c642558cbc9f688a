//! Cluster coordination: topology, endpoint registry, and the barrier
//! rendezvous protocol.
//!
//! One [`Coordinator`] per process owns the transport, the node-id to
//! group-membership table, the node-id to key-range table, and the
//! endpoint registry trackers register into. It is an explicitly
//! constructed context object: tests run several coordinators in one
//! process, each its own cluster node.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::{Node, NodeConfig, Role};
use crate::envelope::{ControlCmd, Envelope};
use crate::error::{Error, Result};
use crate::range::{self, KeyRange};
use crate::tracker::Mailbox;
use crate::transport::Transport;
use crate::{EndpointId, GroupId, NodeId, ALL_GROUPS, SCHEDULER_ID};

/// Per-group rendezvous bookkeeping. Counts live on the scheduler; done
/// flags live on every member.
#[derive(Default)]
struct BarrierState {
    counts: HashMap<GroupId, usize>,
    done: HashSet<GroupId>,
}

/// Process-wide cluster coordinator.
pub struct Coordinator {
    config: NodeConfig,
    my_node: Node,
    transport: Arc<Transport>,
    /// Group id to ascending member ids. Immutable once constructed, so
    /// reads take no lock.
    node_ids: HashMap<GroupId, Vec<NodeId>>,
    /// Key range of each server, in rank order.
    server_ranges: Vec<KeyRange>,
    endpoints: Mutex<HashMap<EndpointId, Mailbox>>,
    endpoint_signal: Notify,
    barrier: Mutex<BarrierState>,
    barrier_signal: Notify,
    unreachable: Mutex<HashSet<NodeId>>,
    started: AtomicBool,
    finalized: AtomicBool,
}

impl Coordinator {
    /// Validate the bootstrap info and build the topology tables.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let my_id = config.my_node_id();
        let addr = *config
            .members
            .get(&my_id)
            .ok_or_else(|| Error::Config(format!("member table is missing node {my_id}")))?;
        let server_ranges = range::partition(config.num_servers);
        range::validate_partition(&server_ranges)?;
        let my_node = Node {
            id: my_id,
            role: config.role,
            addr,
            range: (config.role == Role::Server).then(|| server_ranges[config.rank]),
        };
        let transport = Arc::new(Transport::new(
            my_id,
            config.role == Role::Scheduler,
            addr,
            config.members.clone(),
            config.heartbeat_interval,
            config.heartbeat_timeout,
        ));
        let node_ids = build_node_ids(&config);
        Ok(Arc::new(Self {
            config,
            my_node,
            transport,
            node_ids,
            server_ranges,
            endpoints: Mutex::new(HashMap::new()),
            endpoint_signal: Notify::new(),
            barrier: Mutex::new(BarrierState::default()),
            barrier_signal: Notify::new(),
            unreachable: Mutex::new(HashSet::new()),
            started: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        }))
    }

    /// Start the transport, then rendezvous with the whole cluster so no
    /// node proceeds until every node has started.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Config("coordinator started twice".into()));
        }
        self.transport.start(Arc::downgrade(self)).await?;
        self.barrier(ALL_GROUPS).await?;
        info!(
            node = self.my_node.id,
            role = ?self.my_node.role,
            workers = self.config.num_workers,
            servers = self.config.num_servers,
            "cluster node started"
        );
        Ok(())
    }

    /// Stop the transport. Idempotent. Callers destroy their trackers
    /// first; a tracker still registered here would never drain again.
    pub async fn finalize(&self) -> Result<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let remaining = self.endpoints.lock().await.len();
        if remaining > 0 {
            warn!(
                node = self.my_node.id,
                remaining, "finalizing with endpoints still registered"
            );
        }
        self.transport.stop().await
    }

    /// This node's identity.
    pub fn my_node(&self) -> &Node {
        &self.my_node
    }

    /// The bootstrap info this coordinator was built from.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The transport owned by this coordinator.
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Bind `mailbox`'s endpoint id in the registry.
    pub(crate) async fn register_endpoint(&self, mailbox: Mailbox) -> Result<()> {
        let mut endpoints = self.endpoints.lock().await;
        let id = mailbox.endpoint();
        if endpoints.contains_key(&id) {
            return Err(Error::DuplicateEndpoint(id));
        }
        endpoints.insert(id, mailbox);
        drop(endpoints);
        self.endpoint_signal.notify_waiters();
        debug!(node = self.my_node.id, endpoint = id, "endpoint registered");
        Ok(())
    }

    /// Remove an endpoint binding. Missing ids are ignored.
    pub(crate) async fn unregister_endpoint(&self, id: EndpointId) {
        if self.endpoints.lock().await.remove(&id).is_some() {
            debug!(node = self.my_node.id, endpoint = id, "endpoint unregistered");
        }
    }

    /// Look up an endpoint's mailbox, waiting up to `timeout` for it to be
    /// registered. A zero timeout checks exactly once. Returns `None` on
    /// expiry rather than failing: requests may legitimately arrive before
    /// local endpoint construction completes.
    pub async fn lookup_endpoint(&self, id: EndpointId, timeout: Duration) -> Option<Mailbox> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking the map so a registration signaled
            // between check and sleep wakes this waiter immediately.
            let registered = self.endpoint_signal.notified();
            tokio::pin!(registered);
            registered.as_mut().enable();
            if let Some(mailbox) = self.endpoints.lock().await.get(&id) {
                return Some(mailbox.clone());
            }
            if timeout.is_zero() {
                return None;
            }
            if tokio::time::timeout_at(deadline, registered).await.is_err() {
                // Deadline hit; close the race with a final check.
                return self.endpoints.lock().await.get(&id).cloned();
            }
        }
    }

    /// Ascending node ids of `group`: a single node id, a role flag, or
    /// any OR-combination registered at startup.
    pub fn resolve_group(&self, group: GroupId) -> Result<&[NodeId]> {
        self.node_ids
            .get(&group)
            .map(Vec::as_slice)
            .ok_or(Error::UnknownGroup(group))
    }

    /// Each server's key range, in rank order. The ranges partition the
    /// key domain with no gaps or overlaps.
    pub fn server_key_ranges(&self) -> &[KeyRange] {
        &self.server_ranges
    }

    /// Rendezvous with every member of `group`: blocks until all members
    /// have called `barrier(group)`. A group with at most one member
    /// returns immediately without any message exchange.
    pub async fn barrier(&self, group: GroupId) -> Result<()> {
        let members = self.resolve_group(group)?;
        if members.len() <= 1 {
            return Ok(());
        }
        if group & self.my_node.role.group_flag() == 0 {
            return Err(Error::Config(format!(
                "node {} ({:?}) is not a member of barrier group {group:#x}",
                self.my_node.id, self.my_node.role
            )));
        }
        self.barrier.lock().await.done.remove(&group);
        let request = Envelope::control(
            self.my_node.id,
            SCHEDULER_ID,
            ControlCmd::Barrier,
            Some(group),
            true,
        );
        self.transport.send(request).await?;
        loop {
            // Register before checking the flag: the release is sent exactly
            // once, so a notification lost between check and sleep would
            // park this caller forever.
            let released = self.barrier_signal.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.barrier.lock().await.done.contains(&group) {
                return Ok(());
            }
            released.await;
        }
    }

    /// Route one control envelope to the barrier protocol or the liveness
    /// bookkeeping. Data envelopes do not belong here.
    pub async fn dispatch(&self, env: Envelope) -> Result<()> {
        let Some(ctrl) = env.meta.control else {
            return Err(Error::Protocol(
                "data envelope routed to control dispatch".into(),
            ));
        };
        match ctrl.cmd {
            ControlCmd::Barrier if env.meta.request => {
                let group = ctrl.barrier_group.ok_or_else(|| {
                    Error::Protocol("barrier request without a group".into())
                })?;
                let members: Vec<NodeId> = self
                    .resolve_group(group)
                    .map_err(|_| {
                        Error::Protocol(format!("barrier request for unknown group {group:#x}"))
                    })?
                    .to_vec();
                let arrived = {
                    let mut barrier = self.barrier.lock().await;
                    let count = barrier.counts.entry(group).or_insert(0);
                    *count += 1;
                    let arrived = *count;
                    if arrived == members.len() {
                        *count = 0;
                    }
                    arrived
                };
                debug!(
                    node = self.my_node.id,
                    group,
                    from = env.sender,
                    arrived,
                    expected = members.len(),
                    "barrier request"
                );
                if arrived == members.len() {
                    for &member in &members {
                        let release = Envelope::control(
                            self.my_node.id,
                            member,
                            ControlCmd::Barrier,
                            Some(group),
                            false,
                        );
                        self.transport.send(release).await?;
                    }
                }
            }
            ControlCmd::Barrier => {
                let group = ctrl.barrier_group.ok_or_else(|| {
                    Error::Protocol("barrier release without a group".into())
                })?;
                self.barrier.lock().await.done.insert(group);
                self.barrier_signal.notify_waiters();
                debug!(node = self.my_node.id, group, "barrier released");
            }
            ControlCmd::Heartbeat => {
                // Liveness is tracked by the transport per inbound frame;
                // the probe itself needs no reply.
            }
            ControlCmd::Terminate => {
                debug!(node = self.my_node.id, from = env.sender, "terminate observed");
            }
        }
        Ok(())
    }

    /// Monitor-loop intake: a monitored peer has gone silent.
    pub(crate) async fn peer_unreachable(&self, node: NodeId) {
        if self.unreachable.lock().await.insert(node) {
            warn!(node = self.my_node.id, peer = node, "peer unreachable");
        }
    }

    /// Transport intake: traffic from a previously silent peer resumed.
    pub(crate) async fn peer_recovered(&self, node: NodeId) {
        if self.unreachable.lock().await.remove(&node) {
            info!(node = self.my_node.id, peer = node, "peer reachable again");
        }
    }

    /// Peers currently considered unreachable by the monitor loop.
    pub async fn unreachable_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.unreachable.lock().await.iter().copied().collect();
        nodes.sort_unstable();
        nodes
    }
}

/// Build the group-membership table: every node id is listed under its own
/// id and under every OR-combination of role flags that includes its role.
fn build_node_ids(config: &NodeConfig) -> HashMap<GroupId, Vec<NodeId>> {
    let mut table: HashMap<GroupId, Vec<NodeId>> = HashMap::new();
    let mut nodes: Vec<(NodeId, GroupId)> = vec![(SCHEDULER_ID, Role::Scheduler.group_flag())];
    nodes.extend(
        (0..config.num_servers).map(|r| (crate::server_rank_to_id(r), Role::Server.group_flag())),
    );
    nodes.extend(
        (0..config.num_workers).map(|r| (crate::worker_rank_to_id(r), Role::Worker.group_flag())),
    );
    for (id, flag) in nodes {
        table.entry(id).or_default().push(id);
        for combo in 1..=ALL_GROUPS {
            if combo & flag != 0 {
                table.entry(combo).or_default().push(id);
            }
        }
    }
    for members in table.values_mut() {
        members.sort_unstable();
        members.dedup();
    }
    table
}
