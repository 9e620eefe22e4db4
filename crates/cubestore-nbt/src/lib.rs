//! Typed tag trees and their little-endian binary form.
//!
//! Chunk payloads and heightmap side files are stored as an unnamed root
//! compound. Ints are i32_le, string lengths are u16_le.

mod codec;
pub mod error;
pub mod tag;

pub use codec::MAX_DEPTH;
pub use error::NbtError;
pub use tag::{CompoundExt, NbtCompound, NbtRoot, NbtTag};

use bytes::{Buf, BufMut, BytesMut};

/// Read a little-endian tag tree from a buffer.
pub fn read_nbt_le(buf: &mut impl Buf) -> Result<NbtRoot, NbtError> {
    codec::read_root(buf)
}

/// Write a little-endian tag tree to a buffer.
///
/// Fails on trees the format cannot represent: heterogeneous lists,
/// strings longer than 65535 bytes, arrays longer than `i32::MAX`.
pub fn write_nbt_le(buf: &mut impl BufMut, root: &NbtRoot) -> Result<(), NbtError> {
    codec::write_root(buf, root)
}

/// Encode a tree into a fresh byte vector.
pub fn to_bytes(root: &NbtRoot) -> Result<Vec<u8>, NbtError> {
    let mut buf = BytesMut::new();
    write_nbt_le(&mut buf, root)?;
    Ok(buf.to_vec())
}

/// Decode a tree from a byte slice.
pub fn from_bytes(mut data: &[u8]) -> Result<NbtRoot, NbtError> {
    read_nbt_le(&mut data)
}
