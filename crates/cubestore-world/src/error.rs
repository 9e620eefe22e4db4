//! Storage and scheduling error types.

use std::io;

use cubestore_nbt::NbtError;
use thiserror::Error;

use crate::coords::ChunkVec;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("payload codec error: {0}")]
    Nbt(#[from] NbtError),

    #[error("chunk index holds {entries} entries, capacity is {capacity}")]
    IndexOverflow { entries: usize, capacity: usize },

    #[error("no run of {needed} free sectors left in region file")]
    NoFreeSectors { needed: u32 },

    #[error("local chunk coordinate ({x}, {y}, {z}) outside region bounds")]
    OutOfBounds { x: i32, y: i32, z: i32 },

    #[error("invalid chunk payload: {0}")]
    InvalidChunk(String),

    /// The container was torn down between lookup and use; callers retry.
    #[error("container closed")]
    ContainerClosed,

    #[error("generation failed for chunk {pos}: {message}")]
    Generation { pos: ChunkVec, message: String },

    #[error("request for chunk {0} cancelled")]
    Cancelled(ChunkVec),

    #[error("chunk manager is shut down")]
    ShutDown,
}
