//! Per-endpoint request bookkeeping and serialized message processing.
//!
//! Each logical endpoint owns one [`RequestTracker`]: it issues request
//! timestamps, counts expected-vs-received replies, and drains the
//! endpoint's inbound queue on a dedicated task so handlers for one
//! endpoint never run concurrently with each other or block any other
//! endpoint.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cluster::Coordinator;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::{EndpointId, GroupId, Timestamp};

/// User callback invoked for every envelope delivered to an endpoint.
pub type RecvHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Sending side of one endpoint's inbound queue, held in the coordinator
/// registry so the transport receive loop can deliver without touching the
/// tracker itself.
#[derive(Clone)]
pub struct Mailbox {
    endpoint: EndpointId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Mailbox {
    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Enqueue an inbound envelope. Fails only when the owning tracker has
    /// already shut down.
    pub fn deliver(&self, env: Envelope) -> Result<()> {
        self.tx
            .send(env)
            .map_err(|_| Error::Protocol(format!("endpoint {} is shut down", self.endpoint)))
    }
}

/// Expected-vs-received reply counts for one outstanding request.
#[derive(Debug, Clone, Copy)]
struct RequestRecord {
    expected: u32,
    received: u32,
}

/// State shared between the tracker handle and its drainer task.
#[derive(Default)]
struct TrackerInner {
    records: Mutex<Vec<RequestRecord>>,
    signal: Notify,
}

impl TrackerInner {
    async fn add_response(&self, endpoint: EndpointId, ts: Timestamp, count: u32) {
        {
            let mut records = self.records.lock().await;
            match records.get_mut(ts as usize) {
                Some(rec) => {
                    let next = rec.received.saturating_add(count);
                    if next > rec.expected {
                        // Counted replies must never exceed the fan-out
                        // recorded at request time.
                        warn!(
                            endpoint,
                            ts,
                            expected = rec.expected,
                            received = next,
                            "reply overflow, clamping"
                        );
                    }
                    rec.received = next.min(rec.expected);
                }
                None => {
                    warn!(endpoint, ts, "response for unknown request timestamp");
                    return;
                }
            }
        }
        self.signal.notify_waiters();
    }
}

/// Request tracker for one endpoint.
pub struct RequestTracker {
    endpoint: EndpointId,
    coordinator: Arc<Coordinator>,
    inner: Arc<TrackerInner>,
    mailbox: Mutex<Option<Mailbox>>,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

impl RequestTracker {
    /// Create the tracker, register its endpoint with the coordinator, and
    /// start the drainer task.
    ///
    /// Fails with [`Error::DuplicateEndpoint`] when the id is already
    /// bound. `handler` runs once per delivered envelope, in delivery
    /// order.
    pub async fn new(
        endpoint: EndpointId,
        coordinator: Arc<Coordinator>,
        handler: RecvHandler,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mailbox = Mailbox { endpoint, tx };
        coordinator.register_endpoint(mailbox.clone()).await?;
        let inner = Arc::new(TrackerInner::default());
        let drainer = tokio::spawn(drain(endpoint, inner.clone(), rx, handler));
        Ok(Self {
            endpoint,
            coordinator,
            inner,
            mailbox: Mutex::new(Some(mailbox)),
            drainer: Mutex::new(Some(drainer)),
        })
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Record a new outbound request fanned out to `group` and return its
    /// timestamp. Timestamps are monotonic from 0 and never reused.
    pub async fn new_request(&self, group: GroupId) -> Result<Timestamp> {
        let expected = self.coordinator.resolve_group(group)?.len() as u32;
        let mut records = self.inner.records.lock().await;
        records.push(RequestRecord {
            expected,
            received: 0,
        });
        Ok((records.len() - 1) as Timestamp)
    }

    /// Count `count` replies toward the request at `ts` and wake waiters.
    pub async fn add_response(&self, ts: Timestamp, count: u32) {
        self.inner.add_response(self.endpoint, ts, count).await;
    }

    /// Replies received so far for the request at `ts`.
    pub async fn num_responses(&self, ts: Timestamp) -> Result<u32> {
        let records = self.inner.records.lock().await;
        records
            .get(ts as usize)
            .map(|r| r.received)
            .ok_or_else(|| Error::Protocol(format!("unknown request timestamp {ts}")))
    }

    /// Block until every expected reply for `ts` has been counted.
    pub async fn wait(&self, ts: Timestamp) -> Result<()> {
        loop {
            // Register the waiter before inspecting state so a concurrent
            // add_response cannot notify between check and sleep.
            let notified = self.inner.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let records = self.inner.records.lock().await;
                let rec = records
                    .get(ts as usize)
                    .ok_or_else(|| Error::Protocol(format!("unknown request timestamp {ts}")))?;
                if rec.received >= rec.expected {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Enqueue an inbound envelope from the transport receive loop.
    pub async fn accept(&self, env: Envelope) -> Result<()> {
        match &*self.mailbox.lock().await {
            Some(mailbox) => mailbox.deliver(env),
            None => Err(Error::Protocol(format!(
                "endpoint {} is shut down",
                self.endpoint
            ))),
        }
    }

    /// Tear the tracker down: unregister the endpoint, close the inbound
    /// queue, and join the drainer task. Idempotent; guarantees no task or
    /// registry entry outlives the call.
    pub async fn shutdown(&self) -> Result<()> {
        self.coordinator.unregister_endpoint(self.endpoint).await;
        // Dropping the last sender closes the queue and ends the drainer.
        self.mailbox.lock().await.take();
        if let Some(handle) = self.drainer.lock().await.take() {
            handle
                .await
                .map_err(|e| Error::Protocol(format!("endpoint drainer failed: {e}")))?;
        }
        Ok(())
    }
}

/// Drain the inbound queue: run the handler, then count replies toward
/// their request records. Exits when the queue closes.
async fn drain(
    endpoint: EndpointId,
    inner: Arc<TrackerInner>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    handler: RecvHandler,
) {
    while let Some(env) = rx.recv().await {
        let is_reply = !env.meta.request;
        let ts = env.meta.timestamp;
        handler(env).await;
        if is_reply {
            inner.add_response(endpoint, ts, 1).await;
        }
    }
    debug!(endpoint, "endpoint drainer exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, Role};
    use crate::{server_rank_to_id, worker_rank_to_id, SCHEDULER_ID, SERVER_GROUP};
    use std::collections::BTreeMap;

    fn test_config(num_servers: usize, num_workers: usize) -> NodeConfig {
        let mut members = BTreeMap::new();
        let mut port = 9100;
        let mut add = |id: crate::NodeId| {
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
        NodeConfig::new(Role::Worker, 0, num_workers, num_servers, members)
    }

    fn noop_handler() -> RecvHandler {
        Arc::new(|_| Box::pin(async {}))
    }

    #[tokio::test]
    async fn timestamps_are_monotonic_from_zero() {
        let coordinator = Coordinator::new(test_config(3, 1)).unwrap();
        let tracker = RequestTracker::new(0, coordinator, noop_handler())
            .await
            .unwrap();
        for expect in 0..16u64 {
            let ts = tracker.new_request(SERVER_GROUP).await.unwrap();
            assert_eq!(ts, expect);
        }
        tracker.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wait_unblocks_exactly_at_full_fanout() {
        let coordinator = Coordinator::new(test_config(4, 1)).unwrap();
        let tracker = Arc::new(
            RequestTracker::new(0, coordinator, noop_handler())
                .await
                .unwrap(),
        );
        let ts = tracker.new_request(SERVER_GROUP).await.unwrap();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait(ts).await })
        };
        // Three of four replies must leave the waiter blocked.
        for _ in 0..3 {
            tracker.add_response(ts, 1).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        tracker.add_response(ts, 1).await;
        waiter.await.unwrap().unwrap();
        assert_eq!(tracker.num_responses(ts).await.unwrap(), 4);
        tracker.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_responses_never_exceed_expected() {
        let coordinator = Coordinator::new(test_config(4, 1)).unwrap();
        let tracker = Arc::new(
            RequestTracker::new(0, coordinator, noop_handler())
                .await
                .unwrap(),
        );
        let ts = tracker.new_request(SERVER_GROUP).await.unwrap();
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(async move {
                tracker.add_response(ts, 1).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        tracker.wait(ts).await.unwrap();
        assert_eq!(tracker.num_responses(ts).await.unwrap(), 4);
        tracker.shutdown().await.unwrap();
    }

    /// Responses land in tight succession while the waiter is between its
    /// state check and its sleep; the waiter must still observe the final
    /// count every time.
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn wait_survives_tightly_interleaved_responses() {
        let coordinator = Coordinator::new(test_config(2, 1)).unwrap();
        let tracker = Arc::new(
            RequestTracker::new(0, coordinator, noop_handler())
                .await
                .unwrap(),
        );
        for _ in 0..200 {
            let ts = tracker.new_request(SERVER_GROUP).await.unwrap();
            let waiter = {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.wait(ts).await })
            };
            let mut responders = Vec::new();
            for _ in 0..2 {
                let tracker = tracker.clone();
                responders.push(tokio::spawn(async move {
                    tracker.add_response(ts, 1).await;
                }));
            }
            for r in responders {
                r.await.unwrap();
            }
            tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
                .await
                .expect("waiter must see the final response")
                .unwrap()
                .unwrap();
        }
        tracker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_with_an_empty_queue_does_not_deadlock() {
        let coordinator = Coordinator::new(test_config(1, 1)).unwrap();
        let tracker = RequestTracker::new(7, coordinator.clone(), noop_handler())
            .await
            .unwrap();
        // The drainer is parked on an empty queue; shutdown must still join.
        tokio::time::timeout(std::time::Duration::from_secs(5), tracker.shutdown())
            .await
            .expect("shutdown should not hang")
            .unwrap();
        // Registry entry is gone, so the id is reusable.
        let again = RequestTracker::new(7, coordinator, noop_handler())
            .await
            .unwrap();
        again.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn replies_are_counted_after_the_handler_runs() {
        let coordinator = Coordinator::new(test_config(2, 1)).unwrap();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handler: RecvHandler = {
            let seen = seen.clone();
            Arc::new(move |_env| {
                let seen = seen.clone();
                Box::pin(async move {
                    seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
            })
        };
        let tracker = RequestTracker::new(0, coordinator, handler).await.unwrap();
        let ts = tracker.new_request(SERVER_GROUP).await.unwrap();

        let reply = Envelope {
            meta: crate::envelope::Meta {
                request: false,
                timestamp: ts,
                ..Default::default()
            },
            keys: crate::sarray::SArray::new(),
            values: Vec::new(),
            sender: 8,
            recver: 9,
        };
        tracker.accept(reply.clone()).await.unwrap();
        tracker.accept(reply).await.unwrap();

        tracker.wait(ts).await.unwrap();
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 2);
        tracker.shutdown().await.unwrap();
    }
}
