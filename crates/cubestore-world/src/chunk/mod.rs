//! Server-side chunks and their lifecycle.
//!
//! A chunk is either being built (it carries the barrier generation has
//! reached) or finalized (it reached [`GenerationBarrier::All`] and tracks
//! whether it changed since the last save). The transition is one-way.

mod data;

use std::sync::Arc;

use cubestore_nbt::{CompoundExt, NbtCompound, NbtTag};
use parking_lot::RwLock;
use tracing::warn;

pub use data::{BlockStorage, ChunkData, AIR, CHUNK_VOLUME, EDGE};

use crate::barrier::GenerationBarrier;
use crate::coords::ChunkVec;
use crate::error::{Result, StorageError};
use crate::ticket::Residency;

/// A chunk shared between the region grid, the scheduler and callers.
pub type SharedChunk = Arc<RwLock<ServerChunk>>;

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkState {
    Building {
        barrier: GenerationBarrier,
        data: ChunkData,
    },
    Finalized {
        data: ChunkData,
        modified: bool,
    },
}

/// Chunk handed to a generator. Owned by the worker while generation runs.
#[derive(Debug)]
pub struct BuilderChunk {
    pos: ChunkVec,
    barrier: GenerationBarrier,
    pub data: ChunkData,
}

impl BuilderChunk {
    pub fn pos(&self) -> ChunkVec {
        self.pos
    }

    pub fn barrier(&self) -> GenerationBarrier {
        self.barrier
    }

    /// Record progress. Lower barriers are ignored.
    pub fn advance_to(&mut self, barrier: GenerationBarrier) {
        self.barrier = self.barrier.max(barrier);
    }
}

#[derive(Debug)]
pub struct ServerChunk {
    pos: ChunkVec,
    state: ChunkState,
    residency: Residency,
    /// Set while a worker holds the data; such chunks are never saved.
    generating: bool,
}

impl ServerChunk {
    /// An empty chunk at barrier `None`.
    pub fn builder(pos: ChunkVec, unload_ticks: u64) -> Self {
        Self {
            pos,
            state: ChunkState::Building {
                barrier: GenerationBarrier::None,
                data: ChunkData::empty(),
            },
            residency: Residency::new(unload_ticks),
            generating: false,
        }
    }

    pub fn finalized(pos: ChunkVec, data: ChunkData, modified: bool, unload_ticks: u64) -> Self {
        Self {
            pos,
            state: ChunkState::Finalized { data, modified },
            residency: Residency::new(unload_ticks),
            generating: false,
        }
    }

    pub fn into_shared(self) -> SharedChunk {
        Arc::new(RwLock::new(self))
    }

    pub fn pos(&self) -> ChunkVec {
        self.pos
    }

    pub fn state(&self) -> &ChunkState {
        &self.state
    }

    pub fn barrier(&self) -> GenerationBarrier {
        match &self.state {
            ChunkState::Building { barrier, .. } => *barrier,
            ChunkState::Finalized { .. } => GenerationBarrier::All,
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.state, ChunkState::Finalized { .. })
    }

    pub fn is_modified(&self) -> bool {
        matches!(self.state, ChunkState::Finalized { modified: true, .. })
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn data(&self) -> &ChunkData {
        match &self.state {
            ChunkState::Building { data, .. } | ChunkState::Finalized { data, .. } => data,
        }
    }

    pub fn residency(&self) -> &Residency {
        &self.residency
    }

    pub fn residency_mut(&mut self) -> &mut Residency {
        &mut self.residency
    }

    pub fn get_block(&self, x: usize, y: usize, z: usize) -> u32 {
        self.data().get_block(x, y, z)
    }

    /// Change a block. Finalized chunks become modified.
    pub fn set_block(&mut self, x: usize, y: usize, z: usize, runtime_id: u32) {
        match &mut self.state {
            ChunkState::Building { data, .. } => data.set_block(x, y, z, runtime_id),
            ChunkState::Finalized { data, modified } => {
                data.set_block(x, y, z, runtime_id);
                *modified = true;
            }
        }
    }

    /// Finalize a building chunk in place. Returns false if already finalized.
    pub fn finalize(&mut self, modified: bool) -> bool {
        match &mut self.state {
            ChunkState::Building { data, .. } => {
                let data = std::mem::take(data);
                self.state = ChunkState::Finalized { data, modified };
                true
            }
            ChunkState::Finalized { .. } => false,
        }
    }

    /// Whether unloading or saving this chunk would write anything.
    pub fn needs_save(&self) -> bool {
        if self.generating {
            return false;
        }
        match &self.state {
            ChunkState::Building { barrier, .. } => *barrier > GenerationBarrier::None,
            ChunkState::Finalized { modified, .. } => *modified,
        }
    }

    pub fn mark_saved(&mut self) {
        if let ChunkState::Finalized { modified, .. } = &mut self.state {
            *modified = false;
        }
    }

    // ─── Generation hand-off ────────────────────────────────────────────

    /// Move the data of a building chunk out for generation. The chunk stays
    /// at its current barrier and is marked as generating until the builder
    /// is handed back.
    pub fn begin_generation(&mut self) -> Option<BuilderChunk> {
        if self.generating {
            return None;
        }
        let ChunkState::Building { barrier, data } = &mut self.state else {
            return None;
        };
        self.generating = true;
        Some(BuilderChunk {
            pos: self.pos,
            barrier: *barrier,
            data: std::mem::take(data),
        })
    }

    /// Install a builder's result, finalizing it at the terminal barrier.
    pub fn finish_generation(&mut self, builder: BuilderChunk, persist_generated: bool) {
        self.generating = false;
        self.state = ChunkState::Building {
            barrier: builder.barrier,
            data: builder.data,
        };
        if builder.barrier.is_terminal() {
            self.finalize(persist_generated);
        }
    }

    // ─── Persistence ────────────────────────────────────────────────────

    /// Serialize into the payload layout stored in region files.
    pub fn save(&self) -> NbtCompound {
        let mut c = NbtCompound::new();
        c.insert("generated".into(), NbtTag::from(self.is_finalized()));
        c.insert("modified".into(), NbtTag::from(self.is_modified()));
        c.insert("currentBarrier".into(), NbtTag::from(self.barrier().name()));
        c.insert(
            "Pos".into(),
            NbtTag::IntArray(vec![self.pos.x, self.pos.y, self.pos.z]),
        );
        self.data().write_to(&mut c);
        c
    }

    /// Rebuild a chunk from its payload. `pos` is authoritative; a payload
    /// recorded for other coordinates is logged and accepted.
    pub fn load(pos: ChunkVec, c: &NbtCompound, unload_ticks: u64) -> Result<Self> {
        let generated = c
            .get_bool("generated")
            .ok_or_else(|| StorageError::InvalidChunk("missing generated flag".into()))?;

        if let Some(&[x, y, z]) = c.get_int_array("Pos") {
            let stored = ChunkVec::new(x, y, z);
            if stored != pos {
                warn!("Chunk loaded at {pos} reports coordinates {stored}");
            }
        }

        let data = ChunkData::read_from(c)?;
        let state = if generated {
            ChunkState::Finalized {
                data,
                modified: false,
            }
        } else {
            let name = c.get_str("currentBarrier").unwrap_or("NONE");
            let barrier = GenerationBarrier::from_name(name).ok_or_else(|| {
                StorageError::InvalidChunk(format!("unknown barrier {name:?}"))
            })?;
            if barrier.is_terminal() {
                return Err(StorageError::InvalidChunk(
                    "unfinished chunk claims the terminal barrier".into(),
                ));
            }
            ChunkState::Building { barrier, data }
        };

        Ok(Self {
            pos,
            state,
            residency: Residency::new(unload_ticks),
            generating: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICKS: u64 = 100;

    #[test]
    fn builder_advances_then_finalizes() {
        let pos = ChunkVec::new(1, 2, 3);
        let mut chunk = ServerChunk::builder(pos, TICKS);
        assert_eq!(chunk.barrier(), GenerationBarrier::None);
        assert!(!chunk.needs_save());

        let mut builder = chunk.begin_generation().unwrap();
        assert!(chunk.is_generating());
        assert!(chunk.begin_generation().is_none());
        builder.data.set_block(0, 0, 0, 9);
        builder.advance_to(GenerationBarrier::Terrain);
        builder.advance_to(GenerationBarrier::Skeleton);
        chunk.finish_generation(builder, true);
        assert_eq!(chunk.barrier(), GenerationBarrier::Terrain);
        assert!(!chunk.is_finalized());
        assert_eq!(chunk.get_block(0, 0, 0), 9);

        let mut builder = chunk.begin_generation().unwrap();
        builder.advance_to(GenerationBarrier::All);
        chunk.finish_generation(builder, false);
        assert!(chunk.is_finalized());
        assert_eq!(chunk.barrier(), GenerationBarrier::All);
        assert!(!chunk.is_modified());
        assert!(chunk.begin_generation().is_none());
    }

    #[test]
    fn generating_chunks_are_not_saved() {
        let mut chunk = ServerChunk::builder(ChunkVec::new(0, 0, 0), TICKS);
        let mut builder = chunk.begin_generation().unwrap();
        builder.advance_to(GenerationBarrier::Skeleton);
        chunk.finish_generation(builder, true);
        assert!(chunk.needs_save());
        let _builder = chunk.begin_generation().unwrap();
        assert!(!chunk.needs_save());
    }

    #[test]
    fn set_block_marks_finalized_modified() {
        let mut chunk = ServerChunk::finalized(ChunkVec::new(0, 0, 0), ChunkData::empty(), false, TICKS);
        assert!(!chunk.needs_save());
        chunk.set_block(1, 1, 1, 4);
        assert!(chunk.is_modified());
        chunk.mark_saved();
        assert!(!chunk.is_modified());
    }

    #[test]
    fn finalized_payload_roundtrip() {
        let pos = ChunkVec::new(-4, 7, 12);
        let mut data = ChunkData::empty();
        data.set_block(3, 2, 1, 77);
        let chunk = ServerChunk::finalized(pos, data.clone(), true, TICKS);
        let payload = chunk.save();
        assert_eq!(payload.get_bool("generated"), Some(true));
        assert_eq!(payload.get_bool("modified"), Some(true));
        assert_eq!(payload.get_str("currentBarrier"), Some("ALL"));

        let loaded = ServerChunk::load(pos, &payload, TICKS).unwrap();
        assert!(loaded.is_finalized());
        assert!(!loaded.is_modified());
        assert_eq!(loaded.data(), &data);
    }

    #[test]
    fn builder_payload_roundtrip() {
        let pos = ChunkVec::new(0, -1, 0);
        let mut chunk = ServerChunk::builder(pos, TICKS);
        let mut builder = chunk.begin_generation().unwrap();
        builder.advance_to(GenerationBarrier::Spawn);
        chunk.finish_generation(builder, true);

        let payload = chunk.save();
        assert_eq!(payload.get_bool("generated"), Some(false));
        let loaded = ServerChunk::load(pos, &payload, TICKS).unwrap();
        assert_eq!(loaded.barrier(), GenerationBarrier::Spawn);
        assert!(!loaded.is_finalized());
    }

    #[test]
    fn mismatched_coordinates_are_tolerated() {
        let chunk = ServerChunk::finalized(ChunkVec::new(1, 1, 1), ChunkData::empty(), false, TICKS);
        let payload = chunk.save();
        let loaded = ServerChunk::load(ChunkVec::new(2, 2, 2), &payload, TICKS).unwrap();
        assert_eq!(loaded.pos(), ChunkVec::new(2, 2, 2));
    }

    #[test]
    fn load_rejects_missing_flag() {
        let mut payload = ServerChunk::builder(ChunkVec::new(0, 0, 0), TICKS).save();
        payload.remove("generated");
        assert!(matches!(
            ServerChunk::load(ChunkVec::new(0, 0, 0), &payload, TICKS),
            Err(StorageError::InvalidChunk(_))
        ));
    }
}
