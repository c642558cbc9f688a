//! Key-value application layer: push/pull between workers and servers.
//!
//! A [`KvWorker`] and the [`KvServer`]s it talks to share one endpoint id;
//! the worker slices each batch against the server key-range table, sends
//! one request per server that owns keys in the batch, self-acks the
//! servers that own none, and waits on its tracker until every server has
//! answered. Values travel at a fixed per-key stride
//! (`vals.len() / keys.len()`).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::cluster::Coordinator;
use crate::envelope::{Envelope, Meta};
use crate::error::{Error, Result};
use crate::sarray::{Element, SArray};
use crate::slice::{slice, KvPairs};
use crate::tracker::{RecvHandler, RequestTracker};
use crate::{EndpointId, Key, NodeId, Timestamp, SERVER_GROUP};

/// `meta.head` command: store the carried key-value pairs.
pub const CMD_PUSH: i32 = 1;
/// `meta.head` command: answer with the values for the carried keys.
pub const CMD_PULL: i32 = 2;

/// Pack a key-value batch into a wire envelope.
fn kv_envelope<V: Element>(
    head: i32,
    endpoint: EndpointId,
    timestamp: Timestamp,
    request: bool,
    sender: NodeId,
    recver: NodeId,
    pairs: &KvPairs<V>,
) -> Result<Envelope> {
    let mut values = vec![pairs.vals.reinterpret::<u8>()?];
    let mut value_types = vec![V::DTYPE];
    if !pairs.lens.is_empty() {
        values.push(pairs.lens.reinterpret::<u8>()?);
        value_types.push(<u32 as Element>::DTYPE);
    }
    Ok(Envelope {
        meta: Meta {
            head,
            value_types,
            request,
            endpoint,
            timestamp,
            ..Meta::default()
        },
        keys: pairs.keys.clone(),
        values,
        sender,
        recver,
    })
}

/// Unpack a wire envelope back into a key-value batch.
fn kv_pairs_from<V: Element>(env: &Envelope) -> Result<KvPairs<V>> {
    let vals = match env.values.first() {
        Some(buf) => {
            if env.meta.value_types.first() != Some(&V::DTYPE) {
                return Err(Error::Protocol(format!(
                    "value buffer is {:?}, expected {:?}",
                    env.meta.value_types.first(),
                    V::DTYPE
                )));
            }
            buf.reinterpret::<V>()?
        }
        None => SArray::new(),
    };
    let lens = match env.values.get(1) {
        Some(buf) => buf.reinterpret::<u32>()?,
        None => SArray::new(),
    };
    if lens.is_empty() {
        KvPairs::new(env.keys.clone(), vals)
    } else {
        KvPairs::with_lens(env.keys.clone(), vals, lens)
    }
}

/// Concatenate per-server pull responses back into key order.
///
/// Responses arrive per server in arbitrary order, but each covers one key
/// range, so sorting by first key restores the request's key order.
fn assemble<V: Element>(mut parts: Vec<KvPairs<V>>) -> Vec<V> {
    parts.sort_by_key(|p| p.keys.get(0).unwrap_or(Key::MAX));
    let mut out = Vec::new();
    for part in &parts {
        out.extend(part.vals.iter());
    }
    out
}

/// Worker-side handle pushing and pulling key-value batches to the server
/// group.
pub struct KvWorker<V: Element> {
    tracker: RequestTracker,
    coordinator: Arc<Coordinator>,
    pulls: Arc<Mutex<HashMap<Timestamp, Vec<KvPairs<V>>>>>,
}

impl<V: Element> KvWorker<V> {
    /// Create a worker handle on `endpoint`. The server objects answering
    /// it must be registered under the same endpoint id on their nodes.
    pub async fn new(endpoint: EndpointId, coordinator: Arc<Coordinator>) -> Result<Self> {
        let pulls: Arc<Mutex<HashMap<Timestamp, Vec<KvPairs<V>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let handler: RecvHandler = {
            let pulls = pulls.clone();
            Arc::new(move |env: Envelope| {
                let pulls = pulls.clone();
                Box::pin(async move {
                    // Push acks carry no keys; only pull responses do.
                    if env.meta.request || env.keys.is_empty() {
                        return;
                    }
                    match kv_pairs_from::<V>(&env) {
                        Ok(pairs) => {
                            pulls
                                .lock()
                                .await
                                .entry(env.meta.timestamp)
                                .or_default()
                                .push(pairs);
                        }
                        Err(e) => warn!(error = %e, "malformed pull response"),
                    }
                })
            })
        };
        let tracker = RequestTracker::new(endpoint, coordinator.clone(), handler).await?;
        Ok(Self {
            tracker,
            coordinator,
            pulls,
        })
    }

    /// Push sorted `keys` with their values to the servers owning them.
    /// Returns the request timestamp to pass to [`wait`](Self::wait).
    pub async fn push(&self, keys: &[Key], vals: &[V]) -> Result<Timestamp> {
        let batch = KvPairs::new(SArray::from_slice(keys), SArray::from_slice(vals))?;
        self.fan_out(CMD_PUSH, batch).await
    }

    /// Request the values for sorted `keys` from the servers owning them.
    /// Returns the timestamp to pass to [`wait_pull`](Self::wait_pull).
    pub async fn pull(&self, keys: &[Key]) -> Result<Timestamp> {
        let batch = KvPairs::new(SArray::from_slice(keys), SArray::new())?;
        self.fan_out(CMD_PULL, batch).await
    }

    async fn fan_out(&self, cmd: i32, batch: KvPairs<V>) -> Result<Timestamp> {
        let ts = self.tracker.new_request(SERVER_GROUP).await?;
        let parts = slice(&batch, self.coordinator.server_key_ranges())?;
        let servers = self.coordinator.resolve_group(SERVER_GROUP)?.to_vec();
        for (rank, part) in parts.into_iter().enumerate() {
            if part.is_empty() {
                // Nothing for this server: count it as already answered.
                self.tracker.add_response(ts, 1).await;
                continue;
            }
            let env = kv_envelope(
                cmd,
                self.tracker.endpoint(),
                ts,
                true,
                self.coordinator.my_node().id,
                servers[rank],
                &part,
            )?;
            self.coordinator.transport().send(env).await?;
        }
        Ok(ts)
    }

    /// Block until every server has acknowledged the request at `ts`.
    pub async fn wait(&self, ts: Timestamp) -> Result<()> {
        self.tracker.wait(ts).await
    }

    /// Block until the pull at `ts` completes, then return the assembled
    /// values in request key order.
    pub async fn wait_pull(&self, ts: Timestamp) -> Result<Vec<V>> {
        self.tracker.wait(ts).await?;
        let parts = self.pulls.lock().await.remove(&ts).unwrap_or_default();
        Ok(assemble(parts))
    }

    /// Tear down the endpoint: joins the tracker's drainer and frees the
    /// endpoint id.
    pub async fn shutdown(&self) -> Result<()> {
        self.tracker.shutdown().await
    }
}

/// Server-side key-value state, guarded as one unit so pushes and pulls
/// for this endpoint serialize.
struct Store<V> {
    entries: HashMap<Key, Vec<V>>,
    /// Values per key, learned from the first push.
    stride: usize,
}

/// Server-side handle storing pushed values and answering pulls.
pub struct KvServer<V: Element> {
    tracker: RequestTracker,
    _marker: std::marker::PhantomData<V>,
}

impl<V: Element> KvServer<V> {
    /// Create a server handle on `endpoint`, mirroring the worker side.
    pub async fn new(endpoint: EndpointId, coordinator: Arc<Coordinator>) -> Result<Self> {
        let store = Arc::new(Mutex::new(Store {
            entries: HashMap::new(),
            stride: 1,
        }));
        let handler: RecvHandler = {
            let coordinator = coordinator.clone();
            Arc::new(move |env: Envelope| {
                let coordinator = coordinator.clone();
                let store = store.clone();
                Box::pin(async move {
                    if !env.meta.request {
                        return;
                    }
                    if let Err(e) = handle_request::<V>(&coordinator, &store, env).await {
                        warn!(error = %e, "kv request failed");
                    }
                })
            })
        };
        let tracker = RequestTracker::new(endpoint, coordinator, handler).await?;
        Ok(Self {
            tracker,
            _marker: std::marker::PhantomData,
        })
    }

    /// Tear down the endpoint: joins the tracker's drainer and frees the
    /// endpoint id.
    pub async fn shutdown(&self) -> Result<()> {
        self.tracker.shutdown().await
    }
}

async fn handle_request<V: Element>(
    coordinator: &Arc<Coordinator>,
    store: &Arc<Mutex<Store<V>>>,
    env: Envelope,
) -> Result<()> {
    let me = coordinator.my_node().id;
    let reply_to = env.sender;
    let endpoint = env.meta.endpoint;
    let ts = env.meta.timestamp;
    match env.meta.head {
        CMD_PUSH => {
            let pairs = kv_pairs_from::<V>(&env)?;
            let stride = pairs.value_stride().ok_or_else(|| {
                Error::Protocol("per-key value lengths are not supported here".into())
            })?;
            {
                let mut store = store.lock().await;
                if stride > 0 {
                    store.stride = stride;
                }
                for (i, key) in pairs.keys.iter().enumerate() {
                    let vals = pairs.vals.slice(i * stride..(i + 1) * stride).to_vec();
                    store.entries.insert(key, vals);
                }
            }
            let ack = kv_envelope::<V>(CMD_PUSH, endpoint, ts, false, me, reply_to, &KvPairs::empty())?;
            coordinator.transport().send(ack).await?;
        }
        CMD_PULL => {
            let response = {
                let store = store.lock().await;
                let stride = store.stride;
                let mut vals = Vec::with_capacity(env.keys.len() * stride);
                for key in env.keys.iter() {
                    match store.entries.get(&key) {
                        Some(stored) => vals.extend(stored.iter().copied()),
                        None => vals.extend(std::iter::repeat(V::ZERO).take(stride)),
                    }
                }
                KvPairs::new(env.keys.clone(), SArray::from_vec(vals))?
            };
            let reply = kv_envelope::<V>(CMD_PULL, endpoint, ts, false, me, reply_to, &response)?;
            coordinator.transport().send(reply).await?;
        }
        other => return Err(Error::Protocol(format!("unknown kv command {other}"))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_restores_key_order_across_servers() {
        let high = KvPairs::new(
            SArray::from_slice(&[50u64, 60]),
            SArray::from_slice(&[5.0f32, 6.0]),
        )
        .unwrap();
        let low = KvPairs::new(
            SArray::from_slice(&[1u64, 2]),
            SArray::from_slice(&[0.1f32, 0.2]),
        )
        .unwrap();
        assert_eq!(assemble(vec![high, low]), vec![0.1, 0.2, 5.0, 6.0]);
        assert_eq!(assemble(Vec::<KvPairs<f32>>::new()), Vec::<f32>::new());
    }

    #[test]
    fn envelope_round_trip_preserves_the_batch() {
        let pairs = KvPairs::new(
            SArray::from_slice(&[1u64, 3]),
            SArray::from_slice(&[1.1f32, 1.2, 3.1, 3.2]),
        )
        .unwrap();
        let env = kv_envelope(CMD_PUSH, 0, 7, true, 9, 8, &pairs).unwrap();
        assert_eq!(env.meta.value_types, vec![<f32 as Element>::DTYPE]);
        let back = kv_pairs_from::<f32>(&env).unwrap();
        assert_eq!(back, pairs);
    }

    #[test]
    fn decoding_at_the_wrong_element_type_fails() {
        let pairs = KvPairs::new(SArray::from_slice(&[1u64]), SArray::from_slice(&[1.0f32]))
            .unwrap();
        let env = kv_envelope(CMD_PUSH, 0, 0, true, 9, 8, &pairs).unwrap();
        assert!(matches!(
            kv_pairs_from::<f64>(&env),
            Err(Error::Protocol(_))
        ));
    }
}
