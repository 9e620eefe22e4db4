//! World, region and local chunk coordinates.

use std::fmt;

use crate::error::{Result, StorageError};

/// Blocks along one edge of a chunk.
pub const CHUNK_SIZE: i32 = 32;

/// Chunks along one edge of a region.
pub const REGION_SIZE: i32 = 32;

/// Default sea level in blocks; the surface probe never starts below it.
pub const SEA_LEVEL: i32 = 63;

/// Lowest block Y the surface probe will descend to.
pub const WORLD_FLOOR: i32 = -4096;

/// Highest block Y the surface probe will climb to.
pub const WORLD_CEILING: i32 = 4096;

/// Chunk containing the given block coordinate.
pub fn block_to_chunk(block: i32) -> i32 {
    block.div_euclid(CHUNK_SIZE)
}

/// Block offset within its chunk, always in `0..CHUNK_SIZE`.
pub fn block_in_chunk(block: i32) -> usize {
    block.rem_euclid(CHUNK_SIZE) as usize
}

/// World-space chunk coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkVec {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkVec {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Chunk that contains the block at `(x, y, z)`.
    pub fn containing_block(x: i32, y: i32, z: i32) -> Self {
        Self::new(block_to_chunk(x), block_to_chunk(y), block_to_chunk(z))
    }

    pub fn region(&self) -> RegionVec {
        RegionVec::new(
            self.x.div_euclid(REGION_SIZE),
            self.y.div_euclid(REGION_SIZE),
            self.z.div_euclid(REGION_SIZE),
        )
    }

    pub fn local(&self) -> LocalChunk {
        LocalChunk {
            x: self.x.rem_euclid(REGION_SIZE) as usize,
            y: self.y.rem_euclid(REGION_SIZE) as usize,
            z: self.z.rem_euclid(REGION_SIZE) as usize,
        }
    }

    /// Y of the lowest block layer in this chunk.
    pub fn min_block_y(&self) -> i32 {
        self.y * CHUNK_SIZE
    }

    pub fn above(&self) -> Self {
        Self::new(self.x, self.y + 1, self.z)
    }

    pub fn below(&self) -> Self {
        Self::new(self.x, self.y - 1, self.z)
    }
}

impl fmt::Display for ChunkVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Region coordinate; one region file per `RegionVec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionVec {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl RegionVec {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Key of the owning region column.
    pub fn column(&self) -> (i32, i32) {
        (self.x, self.z)
    }

    /// World coordinate of a chunk inside this region.
    pub fn chunk_at(&self, local: LocalChunk) -> ChunkVec {
        ChunkVec::new(
            self.x * REGION_SIZE + local.x as i32,
            self.y * REGION_SIZE + local.y as i32,
            self.z * REGION_SIZE + local.z as i32,
        )
    }
}

impl fmt::Display for RegionVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Chunk position within a region, each axis in `0..REGION_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalChunk {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl LocalChunk {
    /// Bounds-checked constructor.
    pub fn new(x: i32, y: i32, z: i32) -> Result<Self> {
        let range = 0..REGION_SIZE;
        if !(range.contains(&x) && range.contains(&y) && range.contains(&z)) {
            return Err(StorageError::OutOfBounds { x, y, z });
        }
        Ok(Self {
            x: x as usize,
            y: y as usize,
            z: z as usize,
        })
    }

    /// Index of the chunk column within the region grid.
    pub fn column_index(&self) -> usize {
        self.z * REGION_SIZE as usize + self.x
    }
}
