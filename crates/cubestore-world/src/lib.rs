//! World storage: region files, chunk residency, and generation scheduling.
//!
//! Chunks are `CHUNK_SIZE`³ cubes grouped into `REGION_SIZE`³ regions, each
//! region backed by one sector file. [`ChunkManager`] is the entry point for
//! the rest of the server.

pub mod barrier;
pub mod chunk;
pub mod chunk_column;
pub mod config;
pub mod coords;
pub mod error;
pub mod flat_generator;
pub mod generator;
pub mod heightmap;
pub mod housekeeping;
pub mod manager;
pub mod region;
pub mod region_codec;
pub mod region_column;
pub mod region_map;
pub mod sector_file;
pub mod storage;
pub mod ticket;

pub use barrier::GenerationBarrier;
pub use chunk::{ChunkData, ServerChunk, SharedChunk};
pub use config::StorageConfig;
pub use coords::{ChunkVec, RegionVec};
pub use error::{Result, StorageError};
pub use flat_generator::FlatGenerator;
pub use generator::{ChunkGenerator, GenerationContext, LightingSystem, NoLighting};
pub use heightmap::HeightmapType;
pub use housekeeping::{Housekeeping, ResidencyProvider};
pub use manager::{ChunkErrorHook, ChunkFuture, ChunkManager};
pub use storage::WorldStorage;
pub use ticket::ChunkLoadTicket;
