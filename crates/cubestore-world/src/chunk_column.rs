//! A vertical stack of chunk slots inside one region.

use crate::chunk::SharedChunk;
use crate::coords::REGION_SIZE;

/// `REGION_SIZE` chunk slots indexed by local Y.
#[derive(Debug)]
pub struct ChunkColumn {
    slots: Vec<Option<SharedChunk>>,
}

impl Default for ChunkColumn {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkColumn {
    pub fn new() -> Self {
        Self {
            slots: vec![None; REGION_SIZE as usize],
        }
    }

    pub fn get(&self, y: usize) -> Option<&SharedChunk> {
        self.slots[y].as_ref()
    }

    /// Install a chunk, returning the previous occupant.
    pub fn set(&mut self, y: usize, chunk: SharedChunk) -> Option<SharedChunk> {
        self.slots[y].replace(chunk)
    }

    pub fn take(&mut self, y: usize) -> Option<SharedChunk> {
        self.slots[y].take()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Occupied slots with their local Y.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &SharedChunk)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(y, slot)| slot.as_ref().map(|chunk| (y, chunk)))
    }
}
