//! Collaborators invoked by the scheduler while a chunk is being generated.

use crate::barrier::GenerationBarrier;
use crate::chunk::{BuilderChunk, ChunkData};
use crate::coords::ChunkVec;
use crate::heightmap::HeightmapType;
use crate::region_map::RegionMap;

/// Error reported by a generator; surfaced as `StorageError::Generation`.
pub type GeneratorError = Box<dyn std::error::Error + Send + Sync>;

/// Fills builder chunks stage by stage.
///
/// `generate` is called on a worker thread with the chunk's data moved out of
/// the shared chunk, so it never contends with readers of that chunk. It must
/// leave the builder at `barrier` or above; the scheduler advances it
/// afterwards regardless.
pub trait ChunkGenerator: Send + Sync {
    fn generate(
        &self,
        ctx: &GenerationContext<'_>,
        chunk: &mut BuilderChunk,
        barrier: GenerationBarrier,
    ) -> Result<(), GeneratorError>;

    /// Estimated surface height at a block column, used to start surface
    /// probes close to the answer.
    fn surface_hint(&self, _x: i32, _z: i32) -> Option<f64> {
        None
    }
}

pub trait LightingSystem: Send + Sync {
    fn light_chunk(&self, _chunk: &mut BuilderChunk) {}
}

/// Lighting that leaves chunks untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLighting;

impl LightingSystem for NoLighting {}

/// What a generator may look at besides its own chunk.
pub struct GenerationContext<'a> {
    regions: &'a RegionMap,
    lighting: &'a dyn LightingSystem,
}

impl<'a> GenerationContext<'a> {
    pub fn new(regions: &'a RegionMap, lighting: &'a dyn LightingSystem) -> Self {
        Self { regions, lighting }
    }

    pub fn lighting(&self) -> &dyn LightingSystem {
        self.lighting
    }

    /// Read a neighbouring chunk if it is resident and not locked for
    /// writing. Never loads or generates.
    pub fn with_loaded_chunk<R>(&self, pos: ChunkVec, f: impl FnOnce(&ChunkData) -> R) -> Option<R> {
        let chunk = self.regions.get_loaded_chunk(pos)?;
        let guard = chunk.try_read()?;
        if guard.is_generating() {
            return None;
        }
        Some(f(guard.data()))
    }

    pub fn height(&self, x: i32, z: i32, kind: HeightmapType) -> Option<i32> {
        self.regions.height(x, z, kind)
    }
}
