//! Key-range slicing of key-value batches.
//!
//! Before fan-out, a request issuer partitions its sorted batch against the
//! server key-range table; each sub-batch then travels to the server owning
//! that range. Slicing is zero-copy: sub-batches share the original key and
//! value buffers.

use crate::error::{Error, Result};
use crate::range::{validate_partition, KeyRange};
use crate::sarray::{Element, SArray};
use crate::Key;

/// A key-value batch: keys plus their values, either at a fixed per-key
/// stride or with explicit per-key lengths.
#[derive(Debug, Clone, PartialEq)]
pub struct KvPairs<V: Element> {
    pub keys: SArray<Key>,
    pub vals: SArray<V>,
    /// Per-key value counts; empty for fixed-stride batches.
    pub lens: SArray<u32>,
}

impl<V: Element> KvPairs<V> {
    /// Fixed-stride batch. The value count must be a multiple of the key
    /// count; the stride is their ratio.
    pub fn new(keys: SArray<Key>, vals: SArray<V>) -> Result<Self> {
        if !keys.is_empty() && vals.len() % keys.len() != 0 {
            return Err(Error::Protocol(format!(
                "{} values cannot be evenly assigned to {} keys",
                vals.len(),
                keys.len()
            )));
        }
        Ok(Self {
            keys,
            vals,
            lens: SArray::new(),
        })
    }

    /// Batch with an explicit value count per key.
    pub fn with_lens(keys: SArray<Key>, vals: SArray<V>, lens: SArray<u32>) -> Result<Self> {
        if lens.len() != keys.len() {
            return Err(Error::Protocol(format!(
                "{} length entries for {} keys",
                lens.len(),
                keys.len()
            )));
        }
        let total: usize = lens.iter().map(|l| l as usize).sum();
        if total != vals.len() {
            return Err(Error::Protocol(format!(
                "length entries sum to {total} but {} values are present",
                vals.len()
            )));
        }
        Ok(Self { keys, vals, lens })
    }

    /// Empty batch.
    pub fn empty() -> Self {
        Self {
            keys: SArray::new(),
            vals: SArray::new(),
            lens: SArray::new(),
        }
    }

    /// Values per key for fixed-stride batches, `None` when per-key
    /// lengths are in use.
    pub fn value_stride(&self) -> Option<usize> {
        if !self.lens.is_empty() {
            return None;
        }
        if self.keys.is_empty() {
            return Some(0);
        }
        Some(self.vals.len() / self.keys.len())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// First index in `keys[lo..hi]` whose key is not below `target`.
fn lower_bound(keys: &SArray<Key>, mut lo: usize, mut hi: usize, target: Key) -> usize {
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match keys.get(mid) {
            Some(k) if k < target => lo = mid + 1,
            _ => hi = mid,
        }
    }
    lo
}

/// Partition `batch` against the rank-ordered server key ranges.
///
/// Returns one sub-batch per range, in range order; a server with no keys
/// in this batch yields an empty sub-batch the caller must skip without
/// sending. Each range boundary is located by binary search, so the whole
/// partition costs O(S log K) for S servers and K keys.
///
/// Fails with [`Error::InvalidKeyOrder`] when keys are not strictly
/// ascending, and with [`Error::Config`] when `ranges` is not a gapless
/// cover of the key domain.
pub fn slice<V: Element>(batch: &KvPairs<V>, ranges: &[KeyRange]) -> Result<Vec<KvPairs<V>>> {
    validate_partition(ranges)?;
    let k = batch.keys.len();
    let mut prev: Option<Key> = None;
    for key in batch.keys.iter() {
        if let Some(p) = prev {
            if key <= p {
                return Err(Error::InvalidKeyOrder);
            }
        }
        prev = Some(key);
    }
    if prev.is_some_and(|last| last == Key::MAX) {
        return Err(Error::Protocol(
            "key outside the served domain [0, Key::MAX)".into(),
        ));
    }

    // Prefix value offsets; with per-key lens the value split points are
    // irregular, otherwise a fixed stride applies.
    let stride = batch.value_stride();
    let prefix: Vec<usize> = if stride.is_none() {
        let mut acc = Vec::with_capacity(k + 1);
        let mut total = 0usize;
        acc.push(0);
        for l in batch.lens.iter() {
            total += l as usize;
            acc.push(total);
        }
        acc
    } else {
        Vec::new()
    };

    let mut out = Vec::with_capacity(ranges.len());
    let mut begin = 0usize;
    for range in ranges {
        let end = lower_bound(&batch.keys, begin, k, range.end());
        let keys = batch.keys.slice(begin..end);
        let (vals, lens) = match stride {
            Some(s) => (batch.vals.slice(begin * s..end * s), SArray::new()),
            None => (
                batch.vals.slice(prefix[begin]..prefix[end]),
                batch.lens.slice(begin..end),
            ),
        };
        out.push(KvPairs { keys, vals, lens });
        begin = end;
    }
    Ok(out)
}
