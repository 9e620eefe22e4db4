//! Flat world chunk generator.
//!
//! Layers relative to the configured surface height `s`:
//! - Y = s-3: Bedrock
//! - Y = s-2..s-1: Dirt
//! - Y = s: Grass
//! - above: Air
//!
//! Biomes are written at `Skeleton`, blocks at `Terrain`. Later barriers have
//! nothing to add.

use crate::barrier::GenerationBarrier;
use crate::chunk::{BuilderChunk, EDGE};
use crate::generator::{ChunkGenerator, GenerationContext, GeneratorError};

pub const BEDROCK: u32 = 1;
pub const DIRT: u32 = 2;
pub const GRASS: u32 = 3;

/// Biome written into every column.
pub const PLAINS: u8 = 1;

#[derive(Debug, Clone)]
pub struct FlatGenerator {
    surface: i32,
}

impl FlatGenerator {
    pub fn new(surface: i32) -> Self {
        Self { surface }
    }

    pub fn surface(&self) -> i32 {
        self.surface
    }

    /// Block at world height `y`.
    pub fn layer(&self, y: i32) -> Option<u32> {
        match self.surface - y {
            0 => Some(GRASS),
            1 | 2 => Some(DIRT),
            3 => Some(BEDROCK),
            _ => None,
        }
    }

    fn place_layers(&self, chunk: &mut BuilderChunk) {
        let min_y = chunk.pos().min_block_y();
        for ly in 0..EDGE {
            let Some(block) = self.layer(min_y + ly as i32) else {
                continue;
            };
            for x in 0..EDGE {
                for z in 0..EDGE {
                    chunk.data.set_block(x, ly, z, block);
                }
            }
        }
    }
}

impl ChunkGenerator for FlatGenerator {
    fn generate(
        &self,
        ctx: &GenerationContext<'_>,
        chunk: &mut BuilderChunk,
        barrier: GenerationBarrier,
    ) -> Result<(), GeneratorError> {
        while chunk.barrier() < barrier {
            let Some(stage) = chunk.barrier().next() else {
                break;
            };
            match stage {
                GenerationBarrier::Skeleton => {
                    for x in 0..EDGE {
                        for z in 0..EDGE {
                            chunk.data.set_biome(x, z, PLAINS);
                        }
                    }
                }
                GenerationBarrier::Terrain => self.place_layers(chunk),
                GenerationBarrier::Spawn => {}
                GenerationBarrier::All => ctx.lighting().light_chunk(chunk),
                GenerationBarrier::None => {}
            }
            chunk.advance_to(stage);
        }
        Ok(())
    }

    fn surface_hint(&self, _x: i32, _z: i32) -> Option<f64> {
        Some(self.surface as f64)
    }
}
