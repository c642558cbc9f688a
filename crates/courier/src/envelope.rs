//! Wire messages and the frame codec.
//!
//! An [`Envelope`] is the immutable unit of exchange between nodes: message
//! metadata plus zero-copy key and value buffers. On the wire each envelope
//! travels as one length-prefixed, checksummed frame:
//!
//! ```text
//! magic(4) | version(2) | flags(2) | payload_len(4) | crc32(4) | payload
//! ```
//!
//! with the payload being the bincode encoding of the envelope.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::sarray::{DataType, SArray};
use crate::{EndpointId, GroupId, Key, NodeId, Timestamp};

/// Magic bytes opening every frame.
const FRAME_MAGIC: [u8; 4] = *b"CRM1";

/// Wire protocol version.
const FRAME_VERSION: u16 = 1;

/// Fixed frame header size in bytes.
const HEADER_LEN: usize = 16;

/// Upper bound on a single frame payload. Anything larger is a protocol
/// violation rather than an allocation request.
const MAX_PAYLOAD_LEN: usize = 256 << 20;

/// Control sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCmd {
    /// Barrier request (toward the scheduler) or release (from it).
    Barrier,
    /// Liveness probe exchanged by the monitor loops.
    Heartbeat,
    /// Self-delivered shutdown signal for the receive loop.
    Terminate,
}

/// Control payload carried by system messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    pub cmd: ControlCmd,
    /// Group being rendezvoused; required for `Barrier` commands.
    pub barrier_group: Option<GroupId>,
}

/// Message metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    /// Application command, e.g. push vs pull. Zero when unused.
    pub head: i32,
    /// Opaque application body.
    pub body: Bytes,
    /// Element type of each value buffer, index-aligned with
    /// [`Envelope::values`].
    pub value_types: Vec<DataType>,
    /// True for requests, false for replies.
    pub request: bool,
    /// Destination endpoint within the receiving node.
    pub endpoint: EndpointId,
    /// Request sequence number within the issuing tracker.
    pub timestamp: Timestamp,
    /// Present on system control messages only.
    pub control: Option<Control>,
}

/// One message between two node identities. Immutable once handed to the
/// transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub meta: Meta,
    /// Keys addressed by this message, strictly ascending and unique
    /// whenever non-empty.
    pub keys: SArray<Key>,
    /// Value buffers, typed by `meta.value_types`.
    pub values: Vec<SArray<u8>>,
    pub sender: NodeId,
    pub recver: NodeId,
}

impl Envelope {
    /// A control message from `sender` to `recver`.
    pub fn control(
        sender: NodeId,
        recver: NodeId,
        cmd: ControlCmd,
        barrier_group: Option<GroupId>,
        request: bool,
    ) -> Self {
        Self {
            meta: Meta {
                request,
                control: Some(Control { cmd, barrier_group }),
                ..Meta::default()
            },
            keys: SArray::new(),
            values: Vec::new(),
            sender,
            recver,
        }
    }

    /// The self-addressed shutdown signal observed by the receive loop.
    pub fn terminate(node: NodeId) -> Self {
        Self::control(node, node, ControlCmd::Terminate, None, true)
    }

    pub fn is_control(&self) -> bool {
        self.meta.control.is_some()
    }
}

/// Encode an envelope into one framed buffer.
pub fn encode_frame(env: &Envelope) -> Result<Bytes> {
    debug_assert!(
        env.keys
            .iter()
            .zip(env.keys.iter().skip(1))
            .all(|(a, b)| a < b),
        "envelope keys must be strictly ascending"
    );
    let payload = bincode::serialize(env)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::Protocol(format!(
            "outgoing frame of {} bytes exceeds the payload limit",
            payload.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&FRAME_MAGIC);
    buf.put_u16(FRAME_VERSION);
    buf.put_u16(0); // flags, reserved
    buf.put_u32(payload.len() as u32);
    buf.put_u32(crc32fast::hash(&payload));
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Write one framed envelope to `w`.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    Ok(())
}

/// Read one framed envelope from `r`.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary, the
/// decoded envelope and its total frame length otherwise.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<(Envelope, usize)>> {
    let mut header = [0u8; HEADER_LEN];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if header[0..4] != FRAME_MAGIC {
        return Err(Error::Protocol("bad frame magic".into()));
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != FRAME_VERSION {
        return Err(Error::Protocol(format!(
            "unsupported frame version {version}"
        )));
    }
    let payload_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::Protocol(format!(
            "incoming frame of {payload_len} bytes exceeds the payload limit"
        )));
    }
    let crc = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload).await?;
    if crc32fast::hash(&payload) != crc {
        return Err(Error::Protocol("frame checksum mismatch".into()));
    }
    let env: Envelope = bincode::deserialize(&payload)?;
    Ok(Some((env, HEADER_LEN + payload_len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            meta: Meta {
                head: 7,
                body: Bytes::from_static(b"opaque"),
                value_types: vec![DataType::Float],
                request: true,
                endpoint: 3,
                timestamp: 42,
                control: None,
            },
            keys: SArray::from_vec(vec![1u64, 3, 5]),
            values: vec![SArray::from_vec(vec![9u8, 8, 7])],
            sender: 9,
            recver: 8,
        }
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let env = sample();
        let frame = encode_frame(&env).unwrap();
        let mut cursor = std::io::Cursor::new(frame.to_vec());
        let (decoded, n) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded.keys, env.keys);
        assert_eq!(decoded.values[0], env.values[0]);
        assert_eq!(decoded.meta.timestamp, 42);
        assert_eq!(decoded.meta.value_types, vec![DataType::Float]);
        assert!(decoded.meta.request);
        assert_eq!((decoded.sender, decoded.recver), (9, 8));
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupted_payload_is_a_protocol_error() {
        let frame = encode_frame(&sample()).unwrap();
        let mut raw = frame.to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let mut cursor = std::io::Cursor::new(raw);
        match read_frame(&mut cursor).await {
            Err(Error::Protocol(msg)) => assert!(msg.contains("checksum")),
            other => panic!("expected checksum failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_magic_is_a_protocol_error() {
        let mut raw = encode_frame(&sample()).unwrap().to_vec();
        raw[0] = b'X';
        let mut cursor = std::io::Cursor::new(raw);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::Protocol(_))
        ));
    }
}
