//! The serialization capability interface (spec.md §6).
//!
//! The core does not prescribe an encoding for user record types -- it only
//! requires a byte-sink/byte-source capability, a `fixed_size` declaration,
//! and a stable type hash for self-verification. [`BlockWriter`]/[`BlockReader`]
//! in `block_io.rs` are generic over any `T: Serializable`.
//!
//! [`BlockWriter`]: crate::block_io::BlockWriter
//! [`BlockReader`]: crate::block_io::BlockReader

use crate::error::EngineError;

/// A byte sink with stateful put-byte/put-raw operations (spec.md §6.iii).
pub trait ByteSink {
    fn put_byte(&mut self, b: u8);
    fn put_raw(&mut self, bytes: &[u8]);
}

/// A byte source with stateful get-byte/get-raw operations.
pub trait ByteSource {
    /// Returns `None` at end of input.
    fn get_byte(&mut self) -> Option<u8>;
    /// Reads exactly `buf.len()` bytes, or returns a short-read error.
    fn get_raw(&mut self, buf: &mut [u8]) -> Result<(), EngineError>;
}

/// Capability every record type T must implement to flow through a Block.
///
/// `fixed_size()` returning `Some(n)` unlocks the `Skip` fast path on
/// [`BlockReader`](crate::block_io::BlockReader) (spec.md §4.2, §8 invariant 6).
pub trait Serializable: Sized {
    /// Size in bytes if every instance serializes identically, else `None`.
    fn fixed_size() -> Option<usize> {
        None
    }

    /// A stable hash of the logical type, used as a self-verify prefix.
    fn type_hash() -> u64;

    fn serialize(&self, sink: &mut dyn ByteSink);

    fn deserialize(source: &mut dyn ByteSource) -> Result<Self, EngineError>;
}

/// FNV-1a over a type name; stable across runs of the same binary, which is
/// all self-verification needs (spec.md §9: "a type-id hash precedes each
/// record and is checked on read").
pub const fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x100000001b3);
        i += 1;
    }
    hash
}

macro_rules! impl_fixed_primitive {
    ($t:ty, $n:expr) => {
        impl Serializable for $t {
            fn fixed_size() -> Option<usize> {
                Some($n)
            }

            fn type_hash() -> u64 {
                fnv1a(stringify!($t).as_bytes())
            }

            fn serialize(&self, sink: &mut dyn ByteSink) {
                sink.put_raw(&self.to_le_bytes());
            }

            fn deserialize(source: &mut dyn ByteSource) -> Result<Self, EngineError> {
                let mut buf = [0u8; $n];
                source.get_raw(&mut buf)?;
                Ok(<$t>::from_le_bytes(buf))
            }
        }
    };
}

impl_fixed_primitive!(u8, 1);
impl_fixed_primitive!(i32, 4);
impl_fixed_primitive!(u32, 4);
impl_fixed_primitive!(i64, 8);
impl_fixed_primitive!(u64, 8);
impl_fixed_primitive!(f64, 8);

impl Serializable for String {
    fn type_hash() -> u64 {
        fnv1a(b"String")
    }

    fn serialize(&self, sink: &mut dyn ByteSink) {
        let bytes = self.as_bytes();
        sink.put_raw(&(bytes.len() as u32).to_le_bytes());
        sink.put_raw(bytes);
    }

    fn deserialize(source: &mut dyn ByteSource) -> Result<Self, EngineError> {
        let mut len_buf = [0u8; 4];
        source.get_raw(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        source.get_raw(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|e| EngineError::serialization(format!("invalid utf8 string: {e}")))
    }
}

impl<A: Serializable, B: Serializable> Serializable for (A, B) {
    fn fixed_size() -> Option<usize> {
        match (A::fixed_size(), B::fixed_size()) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        }
    }

    fn type_hash() -> u64 {
        A::type_hash() ^ B::type_hash().rotate_left(17)
    }

    fn serialize(&self, sink: &mut dyn ByteSink) {
        self.0.serialize(sink);
        self.1.serialize(sink);
    }

    fn deserialize(source: &mut dyn ByteSource) -> Result<Self, EngineError> {
        let a = A::deserialize(source)?;
        let b = B::deserialize(source)?;
        Ok((a, b))
    }
}
