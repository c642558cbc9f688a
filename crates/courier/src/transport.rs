//! Framed TCP transport between node identities.
//!
//! One transport per node: it listens on the node's configured address,
//! keeps one outbound connection per destination (opened lazily, written
//! by a dedicated task so per-destination order is preserved), and runs
//! two background activities: the receive loop that decodes inbound
//! frames and demultiplexes them to the coordinator or an endpoint
//! mailbox, and the monitor loop that exchanges heartbeats and reports
//! silent peers.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cluster::Coordinator;
use crate::envelope::{encode_frame, read_frame, write_frame, ControlCmd, Envelope};
use crate::error::{Error, Result};
use crate::NodeId;

/// Capacity of each per-destination send queue. A full queue applies
/// backpressure to `send` callers.
const SEND_QUEUE_CAPACITY: usize = 1024;

/// How long the receive loop waits for a locally registered endpoint
/// before dropping an inbound envelope. Covers the race where a request
/// arrives ahead of the endpoint's construction.
const ENDPOINT_RESOLVE_WAIT: Duration = Duration::from_secs(3);

/// Point-to-point message transport for one node.
pub struct Transport {
    my_id: NodeId,
    is_scheduler: bool,
    listen_addr: SocketAddr,
    members: BTreeMap<NodeId, SocketAddr>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    started: AtomicBool,
    ready: AtomicBool,
    stopping: AtomicBool,
    shutdown: watch::Sender<bool>,
    peers: Mutex<HashMap<NodeId, mpsc::Sender<Bytes>>>,
    loops: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    last_seen: Mutex<HashMap<NodeId, Instant>>,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
}

impl Transport {
    pub fn new(
        my_id: NodeId,
        is_scheduler: bool,
        listen_addr: SocketAddr,
        members: BTreeMap<NodeId, SocketAddr>,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            my_id,
            is_scheduler,
            listen_addr,
            members,
            heartbeat_interval,
            heartbeat_timeout,
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            shutdown,
            peers: Mutex::new(HashMap::new()),
            loops: Mutex::new(None),
            last_seen: Mutex::new(HashMap::new()),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
        }
    }

    /// Bind the listen address and start the receive and monitor loops.
    ///
    /// Must be called exactly once before [`send`](Self::send); a second
    /// call and a failed bind are both fatal-class errors.
    pub async fn start(self: &Arc<Self>, coordinator: Weak<Coordinator>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Config("transport started twice".into()));
        }
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!(node = self.my_id, addr = %self.listen_addr, "transport listening");
        self.ready.store(true, Ordering::Release);
        let accept = tokio::spawn(accept_loop(self.clone(), coordinator.clone(), listener));
        let monitor = tokio::spawn(monitor_loop(self.clone(), coordinator));
        *self.loops.lock().await = Some((accept, monitor));
        Ok(())
    }

    /// Serialize and transmit one envelope, returning the framed byte
    /// count.
    ///
    /// Fails with [`Error::NotReady`] before [`start`](Self::start) and
    /// with [`Error::UnknownDestination`] when the receiver is not in the
    /// member table. Blocks when the destination's send queue is full.
    pub async fn send(&self, env: Envelope) -> Result<usize> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(Error::NotReady);
        }
        let recver = env.recver;
        let frame = encode_frame(&env)?;
        let n = frame.len();
        let tx = self.peer_sender(recver).await?;
        tx.send(frame)
            .await
            .map_err(|_| Error::UnknownDestination(recver))?;
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Halt both background loops, close all connections, and wait for
    /// the loops to exit. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        // The receive loop watches for a self-delivered terminate; the
        // watch channel backstops it if the loopback send fails.
        if let Err(e) = self.send(Envelope::terminate(self.my_id)).await {
            debug!(node = self.my_id, error = %e, "self terminate not delivered");
        }
        let _ = self.shutdown.send(true);
        if let Some((accept, monitor)) = self.loops.lock().await.take() {
            let _ = accept.await;
            let _ = monitor.await;
        }
        self.peers.lock().await.clear();
        self.ready.store(false, Ordering::Release);
        info!(
            node = self.my_id,
            sent = self.bytes_sent.load(Ordering::Relaxed),
            received = self.bytes_recv.load(Ordering::Relaxed),
            "transport stopped"
        );
        Ok(())
    }

    /// Total framed bytes transmitted.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total framed bytes received.
    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }

    /// Queue handle for `node`, spawning the connection writer on first
    /// use.
    async fn peer_sender(&self, node: NodeId) -> Result<mpsc::Sender<Bytes>> {
        let addr = *self
            .members
            .get(&node)
            .ok_or(Error::UnknownDestination(node))?;
        let mut peers = self.peers.lock().await;
        if let Some(tx) = peers.get(&node) {
            return Ok(tx.clone());
        }
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        tokio::spawn(write_loop(node, addr, rx, self.shutdown.subscribe()));
        peers.insert(node, tx.clone());
        Ok(tx)
    }

    async fn note_seen(&self, node: NodeId) {
        self.last_seen.lock().await.insert(node, Instant::now());
    }
}

/// Accept inbound connections and hand each to a frame reader until
/// shutdown, then join the readers.
async fn accept_loop(
    transport: Arc<Transport>,
    coordinator: Weak<Coordinator>,
    listener: TcpListener,
) {
    let mut shutdown = transport.shutdown.subscribe();
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => match res {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    readers.spawn(read_loop(
                        transport.clone(),
                        coordinator.clone(),
                        stream,
                        peer_addr,
                    ));
                }
                Err(e) => warn!(node = transport.my_id, error = %e, "accept failed"),
            },
        }
    }
    while readers.join_next().await.is_some() {}
    debug!(node = transport.my_id, "receive loop exited");
}

/// Decode frames from one inbound connection and demultiplex them:
/// control envelopes to the coordinator, data envelopes to the endpoint
/// mailbox named in their metadata.
async fn read_loop(
    transport: Arc<Transport>,
    coordinator: Weak<Coordinator>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
) {
    let mut shutdown = transport.shutdown.subscribe();
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut stream) => frame,
        };
        let (env, n) = match frame {
            Ok(Some(decoded)) => decoded,
            Ok(None) => break,
            Err(e) => {
                warn!(node = transport.my_id, peer = %peer_addr, error = %e, "connection error");
                break;
            }
        };
        transport.bytes_recv.fetch_add(n as u64, Ordering::Relaxed);
        transport.note_seen(env.sender).await;
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        coordinator.peer_recovered(env.sender).await;

        match env.meta.control {
            Some(ctrl) if ctrl.cmd == ControlCmd::Terminate => {
                if env.sender == transport.my_id {
                    // Self-delivered shutdown signal: stop both loops.
                    let _ = transport.shutdown.send(true);
                    break;
                }
                warn!(node = transport.my_id, from = env.sender, "ignoring remote terminate");
            }
            Some(_) => {
                if let Err(e) = coordinator.dispatch(env).await {
                    error!(node = transport.my_id, error = %e, "control dispatch failed");
                }
            }
            None => {
                let endpoint = env.meta.endpoint;
                match coordinator
                    .lookup_endpoint(endpoint, ENDPOINT_RESOLVE_WAIT)
                    .await
                {
                    Some(mailbox) => {
                        if let Err(e) = mailbox.deliver(env) {
                            warn!(node = transport.my_id, endpoint, error = %e, "delivery failed");
                        }
                    }
                    None => warn!(
                        node = transport.my_id,
                        endpoint,
                        from = env.sender,
                        "dropping envelope for unresolved endpoint"
                    ),
                }
            }
        }
    }
}

/// Heartbeat the monitored peers and report the ones that have gone
/// silent past the liveness threshold.
///
/// The scheduler watches every other node; every other node watches the
/// scheduler.
async fn monitor_loop(transport: Arc<Transport>, coordinator: Weak<Coordinator>) {
    let mut shutdown = transport.shutdown.subscribe();
    let mut ticker = tokio::time::interval(transport.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let targets: Vec<NodeId> = if transport.is_scheduler {
        transport
            .members
            .keys()
            .copied()
            .filter(|&id| id != transport.my_id)
            .collect()
    } else {
        vec![crate::SCHEDULER_ID]
    };
    // Grace period: a peer cannot be stale before the first interval.
    {
        let mut seen = transport.last_seen.lock().await;
        for &t in &targets {
            seen.entry(t).or_insert_with(Instant::now);
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        for &target in &targets {
            let beat = Envelope::control(transport.my_id, target, ControlCmd::Heartbeat, None, true);
            if let Err(e) = transport.send(beat).await {
                debug!(node = transport.my_id, target, error = %e, "heartbeat send failed");
            }
        }
        let stale: Vec<NodeId> = {
            let seen = transport.last_seen.lock().await;
            targets
                .iter()
                .copied()
                .filter(|t| {
                    seen.get(t)
                        .map_or(true, |at| at.elapsed() > transport.heartbeat_timeout)
                })
                .collect()
        };
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        for node in stale {
            coordinator.peer_unreachable(node).await;
        }
    }
    debug!(node = transport.my_id, "monitor loop exited");
}

/// Drain one destination's send queue over a lazily established
/// connection. A single writer per destination keeps per-pair ordering.
async fn write_loop(
    node: NodeId,
    addr: SocketAddr,
    mut rx: mpsc::Receiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream: Option<TcpStream> = None;
    'frames: while let Some(frame) = tokio::select! {
        _ = shutdown.changed() => None,
        frame = rx.recv() => frame,
    } {
        // One reconnect attempt per frame; a frame that fails twice is
        // dropped rather than stalling everything behind it.
        for attempt in 0..2 {
            if stream.is_none() {
                stream = connect_with_retry(node, addr, &mut shutdown).await;
                if stream.is_none() {
                    break 'frames;
                }
            }
            if let Some(s) = stream.as_mut() {
                match write_frame(s, &frame).await {
                    Ok(()) => continue 'frames,
                    Err(e) => {
                        warn!(peer = node, error = %e, "write failed");
                        stream = None;
                        if attempt == 1 {
                            warn!(peer = node, "dropping frame after reconnect failure");
                        }
                    }
                }
            }
        }
    }
    debug!(peer = node, "writer exited");
}

/// Dial `addr` with exponential backoff until connected or shut down.
async fn connect_with_retry(
    node: NodeId,
    addr: SocketAddr,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<TcpStream> {
    let mut delay = Duration::from_millis(50);
    loop {
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            _ = shutdown.changed() => return None,
            res = TcpStream::connect(addr) => match res {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Some(stream);
                }
                Err(e) => debug!(peer = node, error = %e, "connect failed, retrying"),
            },
        }
        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(Duration::from_secs(1));
    }
}
