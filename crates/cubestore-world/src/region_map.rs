//! World-scoped index from (region x, region z) to region columns.
//!
//! Containers are removed bottom-up: an emptied region closes itself and is
//! dropped by its column, an emptied column is closed and dropped here. A
//! caller that raced with a removal sees [`StorageError::ContainerClosed`]
//! internally and retries against a freshly opened container.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};

use crate::chunk::{ChunkData, SharedChunk, EDGE};
use crate::coords::{ChunkVec, RegionVec, CHUNK_SIZE};
use crate::error::{Result, StorageError};
use crate::heightmap::{column_offset, HeightmapType};
use crate::region::Region;
use crate::region_column::RegionColumn;
use crate::storage::WorldStorage;

pub struct RegionMap {
    storage: WorldStorage,
    unload_ticks: u64,
    columns: DashMap<(i32, i32), Arc<RegionColumn>>,
    closed: AtomicBool,
}

impl RegionMap {
    pub fn new(storage: WorldStorage, unload_ticks: u64) -> Self {
        Self {
            storage,
            unload_ticks,
            columns: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn storage(&self) -> &WorldStorage {
        &self.storage
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Region column at `(x, z)`, created on first use.
    pub fn get_region_column(&self, x: i32, z: i32) -> Result<Arc<RegionColumn>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::ShutDown);
        }
        let column = self
            .columns
            .entry((x, z))
            .or_insert_with(|| Arc::new(RegionColumn::open(&self.storage, x, z, self.unload_ticks)))
            .clone();
        Ok(column)
    }

    pub fn get_region_column_if_present(&self, x: i32, z: i32) -> Option<Arc<RegionColumn>> {
        self.columns.get(&(x, z)).map(|c| c.clone())
    }

    /// Drop the column at `(x, z)` if it holds no regions, saving its
    /// heightmaps. Returns true if the column was removed.
    pub fn remove_column(&self, x: i32, z: i32) -> bool {
        let removed = self
            .columns
            .remove_if(&(x, z), |_, column| column.close_if_empty())
            .is_some();
        if removed {
            debug!("Removed region column ({x}, {z})");
        }
        removed
    }

    /// Run `f` against the region at `pos`, reopening containers that were
    /// torn down concurrently.
    fn with_region<T>(&self, pos: RegionVec, f: impl Fn(&Region) -> Result<T>) -> Result<T> {
        loop {
            let (x, z) = pos.column();
            let column = self.get_region_column(x, z)?;
            let result = column.get_region(pos.y).and_then(|region| f(region.as_ref()));
            match result {
                Err(StorageError::ContainerClosed) => continue,
                other => return other,
            }
        }
    }

    /// Resident or stored chunk at `pos`; never generates.
    pub fn get_chunk(&self, pos: ChunkVec) -> Result<Option<SharedChunk>> {
        let local = pos.local();
        self.with_region(pos.region(), |region| region.get_chunk(local))
    }

    /// Resident chunk at `pos`; never touches the disk or opens files.
    pub fn get_loaded_chunk(&self, pos: ChunkVec) -> Option<SharedChunk> {
        let region_pos = pos.region();
        let (x, z) = region_pos.column();
        let column = self.get_region_column_if_present(x, z)?;
        let region = column.get_region_if_open(region_pos.y)?;
        region.get_loaded_chunk(pos.local()).ok().flatten()
    }

    pub fn set_chunk(&self, pos: ChunkVec, chunk: SharedChunk) -> Result<()> {
        let local = pos.local();
        self.with_region(pos.region(), |region| region.set_chunk(local, chunk.clone()))
    }

    /// Save and evict the chunk at `pos`, cascading removal of containers
    /// that became empty. Unloading a chunk that is not resident is a no-op.
    pub fn unload_chunk(&self, pos: ChunkVec) -> Result<()> {
        let (x, z) = pos.region().column();
        let Some(column) = self.get_region_column_if_present(x, z) else {
            return Ok(());
        };
        match column.unload_chunk(pos) {
            Ok(true) => {
                self.remove_column(x, z);
                Ok(())
            }
            Ok(false) | Err(StorageError::ContainerClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Save every column. Returns the number of chunks written.
    pub fn save(&self) -> Result<usize> {
        let columns = self.snapshot();
        let mut written = 0;
        let mut first_error = None;
        for column in columns {
            match column.save() {
                Ok(n) => written += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Decay residency everywhere. Returns chunks whose lease ran out.
    pub fn tick(&self) -> Vec<ChunkVec> {
        self.snapshot().iter().flat_map(|column| column.tick()).collect()
    }

    /// Save and close everything. Later lookups fail with `ShutDown`.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let columns = self.snapshot();
        self.columns.clear();
        let mut result = Ok(());
        for column in columns {
            if let Err(e) = column.close() {
                error!("Failed to close region column ({}, {}): {e}", column.x(), column.z());
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    // ─── Heightmaps ─────────────────────────────────────────────────────

    pub fn height(&self, block_x: i32, block_z: i32, kind: HeightmapType) -> Option<i32> {
        let (x, z) = ChunkVec::containing_block(block_x, 0, block_z).region().column();
        self.get_region_column_if_present(x, z)?
            .height(block_x, block_z, kind)
    }

    /// Raise one heightmap cell. Lower values are ignored.
    pub fn raise_height(
        &self,
        block_x: i32,
        block_z: i32,
        kind: HeightmapType,
        height: i32,
    ) -> Result<()> {
        let (x, z) = ChunkVec::containing_block(block_x, 0, block_z).region().column();
        let column = self.get_region_column(x, z)?;
        column.with_heightmaps(|maps| {
            maps.get_or_create(kind)
                .raise(column_offset(block_x), column_offset(block_z), height);
        });
        Ok(())
    }

    /// Raise the world-surface heightmap to the top blocks of a chunk.
    /// Columns solid up to the chunk's top row are skipped, their surface
    /// lies in a chunk above.
    pub fn record_surface(&self, pos: ChunkVec, data: &ChunkData) -> Result<()> {
        let (x, z) = pos.region().column();
        let column = self.get_region_column(x, z)?;
        let base_x = pos.x * CHUNK_SIZE;
        let base_z = pos.z * CHUNK_SIZE;
        column.with_heightmaps(|maps| {
            let map = maps.get_or_create(HeightmapType::WorldSurface);
            for lx in 0..EDGE {
                for lz in 0..EDGE {
                    let top = match data.highest_block(lx, lz) {
                        Some(top) if top < EDGE - 1 => top,
                        _ => continue,
                    };
                    map.raise(
                        column_offset(base_x + lx as i32),
                        column_offset(base_z + lz as i32),
                        pos.min_block_y() + top as i32,
                    );
                }
            }
        });
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<RegionColumn>> {
        self.columns.iter().map(|entry| entry.value().clone()).collect()
    }
}
