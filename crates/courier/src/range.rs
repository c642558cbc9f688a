//! Key ranges. Ranges are half-open, end-exclusive intervals over the key
//! domain `[0, Key::MAX)`; the ranges owned by the server group always
//! partition the domain with no gaps or overlaps.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::Key;

/// Half-open interval `[begin, end)` of the key domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    begin: Key,
    end: Key,
}

impl KeyRange {
    pub fn new(begin: Key, end: Key) -> Self {
        debug_assert!(begin <= end, "range start must not exceed end");
        Self { begin, end }
    }

    pub fn begin(&self) -> Key {
        self.begin
    }

    pub fn end(&self) -> Key {
        self.end
    }

    pub fn contains(&self, key: Key) -> bool {
        self.begin <= key && key < self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

/// Split the key domain evenly across `num_servers` ranges, in rank order.
///
/// The last range absorbs the division remainder so the union is exactly
/// `[0, Key::MAX)`.
pub fn partition(num_servers: usize) -> Vec<KeyRange> {
    debug_assert!(num_servers > 0);
    let span = Key::MAX / num_servers as Key;
    (0..num_servers)
        .map(|rank| {
            let begin = span * rank as Key;
            let end = if rank + 1 == num_servers {
                Key::MAX
            } else {
                span * (rank + 1) as Key
            };
            KeyRange::new(begin, end)
        })
        .collect()
}

/// Check that `ranges` is a gapless, non-overlapping cover of the key
/// domain in ascending order.
pub fn validate_partition(ranges: &[KeyRange]) -> Result<()> {
    if ranges.is_empty() {
        return Err(Error::Config("server key-range table is empty".into()));
    }
    if ranges[0].begin() != 0 {
        return Err(Error::Config(format!(
            "key-range table starts at {} instead of 0",
            ranges[0].begin()
        )));
    }
    for pair in ranges.windows(2) {
        if pair[0].end() != pair[1].begin() {
            return Err(Error::Config(format!(
                "key-range table has a gap or overlap at {}..{}",
                pair[0].end(),
                pair[1].begin()
            )));
        }
    }
    if ranges[ranges.len() - 1].end() != Key::MAX {
        return Err(Error::Config(format!(
            "key-range table ends at {} instead of the domain end",
            ranges[ranges.len() - 1].end()
        )));
    }
    Ok(())
}
