//! Shared, immutable, typed byte buffers.
//!
//! [`SArray`] is the value currency of the wire layer: a reference-counted
//! view over a [`Bytes`] buffer, typed by a fixed-layout element. Cloning
//! shares the underlying allocation, sub-slicing and reinterpretation
//! between element types are zero-copy, and the buffer is released when the
//! last holder drops it.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Element type tag carried in message metadata next to each value buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
}

mod sealed {
    pub trait Sealed {}
}

/// Fixed-layout numeric element storable in an [`SArray`].
///
/// Elements are encoded little-endian, so a buffer received from the wire
/// reads back identically on every node.
pub trait Element: sealed::Sealed + Copy + PartialEq + Send + Sync + 'static {
    /// Encoded width in bytes.
    const WIDTH: usize;
    /// Wire tag for this element type.
    const DTYPE: DataType;
    /// Additive identity, used to materialize absent values.
    const ZERO: Self;

    fn read_le(buf: &[u8]) -> Self;
    fn write_le(self, buf: &mut BytesMut);
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident, $zero:expr;)*) => {
        $(
            impl sealed::Sealed for $ty {}
            impl Element for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();
                const DTYPE: DataType = DataType::$dtype;
                const ZERO: Self = $zero;

                fn read_le(buf: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&buf[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_le_bytes(raw)
                }

                fn write_le(self, buf: &mut BytesMut) {
                    buf.put_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_element! {
    i8 => Int8, 0;
    i16 => Int16, 0;
    i32 => Int32, 0;
    i64 => Int64, 0;
    u8 => UInt8, 0;
    u16 => UInt16, 0;
    u32 => UInt32, 0;
    u64 => UInt64, 0;
    f32 => Float, 0.0;
    f64 => Double, 0.0;
}

/// Shared array: an immutable, refcounted, typed view over a byte buffer.
pub struct SArray<T: Element> {
    bytes: Bytes,
    _elem: PhantomData<T>,
}

impl<T: Element> SArray<T> {
    /// Empty array.
    pub fn new() -> Self {
        Self {
            bytes: Bytes::new(),
            _elem: PhantomData,
        }
    }

    /// Build from a slice of elements. One copy into the backing buffer.
    pub fn from_slice(elems: &[T]) -> Self {
        let mut buf = BytesMut::with_capacity(elems.len() * T::WIDTH);
        for &e in elems {
            e.write_le(&mut buf);
        }
        Self {
            bytes: buf.freeze(),
            _elem: PhantomData,
        }
    }

    /// Build from an owned vector. One copy into the backing buffer.
    pub fn from_vec(elems: Vec<T>) -> Self {
        Self::from_slice(&elems)
    }

    /// Wrap an existing byte buffer without copying.
    ///
    /// Fails with [`Error::Layout`] when the buffer length is not a
    /// multiple of the element width.
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        if bytes.len() % T::WIDTH != 0 {
            return Err(Error::Layout {
                bytes: bytes.len(),
                width: T::WIDTH,
            });
        }
        Ok(Self {
            bytes,
            _elem: PhantomData,
        })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / T::WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Element at `index`, or `None` past the end.
    pub fn get(&self, index: usize) -> Option<T> {
        if index >= self.len() {
            return None;
        }
        Some(T::read_le(&self.bytes[index * T::WIDTH..]))
    }

    /// Iterate elements by value.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.bytes.chunks_exact(T::WIDTH).map(T::read_le)
    }

    /// Copy out into a plain vector.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    /// Zero-copy sub-slice over an element index range.
    ///
    /// Panics when the range is out of bounds, like slice indexing.
    pub fn slice(&self, range: Range<usize>) -> Self {
        Self {
            bytes: self.bytes.slice(range.start * T::WIDTH..range.end * T::WIDTH),
            _elem: PhantomData,
        }
    }

    /// Zero-copy view of the same bytes as another element type.
    pub fn reinterpret<U: Element>(&self) -> Result<SArray<U>> {
        SArray::from_bytes(self.bytes.clone())
    }

    /// The raw backing bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }
}

impl<T: Element> Default for SArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> Clone for SArray<T> {
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
            _elem: PhantomData,
        }
    }
}

impl<T: Element> PartialEq for SArray<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<T: Element + fmt::Debug> fmt::Debug for SArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: Element> Serialize for SArray<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.bytes)
    }
}

struct SArrayVisitor<T: Element>(PhantomData<T>);

impl<'de, T: Element> Visitor<'de> for SArrayVisitor<T> {
    type Value = SArray<T>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a byte buffer with length divisible by {}", T::WIDTH)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Self::Value, E> {
        self.visit_byte_buf(v.to_vec())
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E> {
        SArray::from_bytes(Bytes::from(v)).map_err(de::Error::custom)
    }

    fn visit_seq<A: de::SeqAccess<'de>>(
        self,
        mut seq: A,
    ) -> std::result::Result<Self::Value, A::Error> {
        let mut v = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(b) = seq.next_element::<u8>()? {
            v.push(b);
        }
        self.visit_byte_buf(v)
    }
}

impl<'de, T: Element> Deserialize<'de> for SArray<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_byte_buf(SArrayVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_storage_across_clones_and_slices() {
        let a = SArray::from_vec(vec![1u64, 2, 3, 4]);
        let b = a.clone();
        let tail = a.slice(2..4);
        assert_eq!(b.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(tail.to_vec(), vec![3, 4]);
        // Slices view the same allocation.
        assert_eq!(
            tail.as_bytes().as_ptr() as usize,
            a.as_bytes().as_ptr() as usize + 16
        );
    }

    #[test]
    fn reinterpret_round_trips_between_widths() {
        let a = SArray::from_vec(vec![0x0102_0304_0506_0708u64]);
        let bytes = a.reinterpret::<u8>().unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes.get(0), Some(0x08)); // little-endian
        let back = bytes.reinterpret::<u64>().unwrap();
        assert_eq!(back.to_vec(), a.to_vec());
    }

    #[test]
    fn reinterpret_rejects_indivisible_lengths() {
        let a = SArray::from_vec(vec![1u8, 2, 3]);
        match a.reinterpret::<u32>() {
            Err(Error::Layout { bytes: 3, width: 4 }) => {}
            other => panic!("expected layout error, got {other:?}"),
        }
    }

    #[test]
    fn get_and_iter_agree() {
        let a = SArray::from_vec(vec![1.5f32, -2.5, 3.25]);
        assert_eq!(a.get(1), Some(-2.5));
        assert_eq!(a.get(3), None);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1.5, -2.5, 3.25]);
    }
}
