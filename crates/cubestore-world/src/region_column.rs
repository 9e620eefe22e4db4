//! The vertical stack of regions sharing one (x, z) region coordinate, plus
//! the heightmaps covering its footprint.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::coords::{ChunkVec, RegionVec};
use crate::error::{Result, StorageError};
use crate::heightmap::{column_offset, HeightmapType, Heightmaps};
use crate::region::{Region, RegionStatus};
use crate::storage::WorldStorage;

struct ColumnRegions {
    regions: HashMap<i32, Arc<Region>>,
    closed: bool,
}

pub struct RegionColumn {
    x: i32,
    z: i32,
    storage: WorldStorage,
    unload_ticks: u64,
    regions: Mutex<ColumnRegions>,
    heightmaps: Mutex<Heightmaps>,
}

impl RegionColumn {
    /// Create the column and load its heightmap side file. An unreadable side
    /// file is logged and replaced with empty heightmaps.
    pub fn open(storage: &WorldStorage, x: i32, z: i32, unload_ticks: u64) -> Self {
        let path = storage.heightmap_file(x, z);
        let heightmaps = Heightmaps::load_file(&path).unwrap_or_else(|e| {
            error!("Failed to load heightmaps {}: {e}", path.display());
            Heightmaps::default()
        });
        Self {
            x,
            z,
            storage: storage.clone(),
            unload_ticks,
            regions: Mutex::new(ColumnRegions {
                regions: HashMap::new(),
                closed: false,
            }),
            heightmaps: Mutex::new(heightmaps),
        }
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn z(&self) -> i32 {
        self.z
    }

    /// Region at vertical index `y`, opened on first use.
    pub fn get_region(&self, y: i32) -> Result<Arc<Region>> {
        let mut inner = self.regions.lock();
        if inner.closed {
            return Err(StorageError::ContainerClosed);
        }
        if let Some(region) = inner.regions.get(&y) {
            return Ok(region.clone());
        }
        let pos = RegionVec::new(self.x, y, self.z);
        let region = Arc::new(Region::open(&self.storage, pos, self.unload_ticks)?);
        inner.regions.insert(y, region.clone());
        Ok(region)
    }

    /// Region at `y` if it is already open.
    pub fn get_region_if_open(&self, y: i32) -> Option<Arc<Region>> {
        let inner = self.regions.lock();
        if inner.closed {
            return None;
        }
        inner.regions.get(&y).cloned()
    }

    /// Forget a region. Returns true when the column holds no regions anymore.
    pub fn discard_region(&self, y: i32) -> bool {
        let mut inner = self.regions.lock();
        inner.regions.remove(&y);
        inner.regions.is_empty()
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.lock().regions.is_empty()
    }

    /// Unload one chunk, discarding its region once empty. Returns true when
    /// the column itself became empty.
    pub fn unload_chunk(&self, pos: ChunkVec) -> Result<bool> {
        let region_pos = pos.region();
        let mut inner = self.regions.lock();
        if inner.closed {
            return Err(StorageError::ContainerClosed);
        }
        let Some(region) = inner.regions.get(&region_pos.y).cloned() else {
            return Ok(inner.regions.is_empty());
        };
        if region.unload_chunk(pos.local())? == RegionStatus::Empty {
            inner.regions.remove(&region_pos.y);
            debug!("Discarded region {region_pos}");
        }
        Ok(inner.regions.is_empty())
    }

    /// Close the column if it holds no regions, saving its heightmaps.
    /// Returns true if the column was closed.
    pub fn close_if_empty(&self) -> bool {
        let mut inner = self.regions.lock();
        if inner.closed || !inner.regions.is_empty() {
            return false;
        }
        inner.closed = true;
        drop(inner);
        if let Err(e) = self.save_heightmaps() {
            error!("Failed to save heightmaps for column ({}, {}): {e}", self.x, self.z);
        }
        true
    }

    /// Save every region and the heightmap side file. Every region is
    /// attempted; the first region error is returned afterwards.
    pub fn save(&self) -> Result<usize> {
        let regions: Vec<Arc<Region>> = self.regions.lock().regions.values().cloned().collect();
        let mut written = 0;
        let mut first_error = None;
        for region in regions {
            match region.save() {
                Ok(n) => written += n,
                Err(e) => {
                    error!("Failed to save region {}: {e}", region.pos());
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Err(e) = self.save_heightmaps() {
            error!("Failed to save heightmaps for column ({}, {}): {e}", self.x, self.z);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    pub fn tick(&self) -> Vec<ChunkVec> {
        let regions: Vec<Arc<Region>> = self.regions.lock().regions.values().cloned().collect();
        regions.iter().flat_map(|region| region.tick()).collect()
    }

    /// Close every region and save the heightmaps.
    pub fn close(&self) -> Result<()> {
        let regions: Vec<Arc<Region>> = {
            let mut inner = self.regions.lock();
            inner.closed = true;
            inner.regions.drain().map(|(_, region)| region).collect()
        };
        let mut result = Ok(());
        for region in regions {
            if let Err(e) = region.close() {
                error!("Failed to close region {}: {e}", region.pos());
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.save_heightmaps()?;
        result
    }

    // ─── Heightmaps ─────────────────────────────────────────────────────

    pub fn with_heightmaps<R>(&self, f: impl FnOnce(&mut Heightmaps) -> R) -> R {
        f(&mut self.heightmaps.lock())
    }

    /// Height at a world block column inside this region column.
    pub fn height(&self, block_x: i32, block_z: i32, kind: HeightmapType) -> Option<i32> {
        self.heightmaps
            .lock()
            .get(kind)
            .and_then(|map| map.get(column_offset(block_x), column_offset(block_z)))
    }

    fn save_heightmaps(&self) -> Result<()> {
        let heightmaps = self.heightmaps.lock();
        if heightmaps.is_empty() {
            return Ok(());
        }
        heightmaps.save_file(&self.storage.heightmap_file(self.x, self.z))
    }
}
