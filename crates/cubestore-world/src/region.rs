//! A `REGION_SIZE`³ block of chunks backed by one sector file.

use std::sync::Arc;

use cubestore_nbt::NbtRoot;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::chunk::{ServerChunk, SharedChunk};
use crate::chunk_column::ChunkColumn;
use crate::coords::{ChunkVec, LocalChunk, RegionVec, REGION_SIZE};
use crate::error::{Result, StorageError};
use crate::region_codec::RegionCodec;
use crate::storage::WorldStorage;

/// Occupancy reported after an unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionStatus {
    Occupied,
    /// The last chunk left; the region flushed and closed its file.
    Empty,
}

struct RegionGrid {
    /// Chunk columns indexed by `z * REGION_SIZE + x`, created on demand.
    columns: Vec<Option<ChunkColumn>>,
    closed: bool,
}

impl RegionGrid {
    fn slot(&self, local: LocalChunk) -> Option<&SharedChunk> {
        self.columns[local.column_index()]
            .as_ref()
            .and_then(|column| column.get(local.y))
    }

    fn is_empty(&self) -> bool {
        self.columns.iter().all(Option::is_none)
    }

    fn chunks(&self) -> impl Iterator<Item = (LocalChunk, &SharedChunk)> {
        let size = REGION_SIZE as usize;
        self.columns.iter().enumerate().flat_map(move |(i, column)| {
            column.iter().flat_map(move |column| {
                column.iter().map(move |(y, chunk)| {
                    (
                        LocalChunk {
                            x: i % size,
                            y,
                            z: i / size,
                        },
                        chunk,
                    )
                })
            })
        })
    }
}

/// Lock order: grid, then chunk, then the codec's file lock.
pub struct Region {
    pos: RegionVec,
    codec: RegionCodec,
    unload_ticks: u64,
    grid: Mutex<RegionGrid>,
}

impl Region {
    /// Open or create the region file for `pos`.
    pub fn open(storage: &WorldStorage, pos: RegionVec, unload_ticks: u64) -> Result<Self> {
        let path = storage.prepare_region_file(pos)?;
        let codec = RegionCodec::open(&path)?;
        let size = REGION_SIZE as usize;
        Ok(Self {
            pos,
            codec,
            unload_ticks,
            grid: Mutex::new(RegionGrid {
                columns: (0..size * size).map(|_| None).collect(),
                closed: false,
            }),
        })
    }

    pub fn pos(&self) -> RegionVec {
        self.pos
    }

    pub fn is_closed(&self) -> bool {
        self.grid.lock().closed
    }

    pub fn chunk_count(&self) -> usize {
        let grid = self.grid.lock();
        grid.columns.iter().flatten().map(ChunkColumn::len).sum()
    }

    /// Resident chunk, or the stored one loaded from disk. `None` means the
    /// chunk must be generated. Unreadable payloads are logged and reported
    /// as absent.
    pub fn get_chunk(&self, local: LocalChunk) -> Result<Option<SharedChunk>> {
        let mut grid = self.grid.lock();
        if grid.closed {
            return Err(StorageError::ContainerClosed);
        }
        if let Some(chunk) = grid.slot(local) {
            return Ok(Some(chunk.clone()));
        }

        let pos = self.pos.chunk_at(local);
        let loaded = match self.codec.load_chunk(local) {
            Ok(Some(root)) => ServerChunk::load(pos, &root.compound, self.unload_ticks),
            Ok(None) => return Ok(None),
            Err(e) => Err(e),
        };
        let chunk = match loaded {
            Ok(chunk) => chunk.into_shared(),
            Err(e) => {
                error!("Failed to load chunk {pos} from {}: {e}", self.codec.path().display());
                return Ok(None);
            }
        };

        debug!("Loaded chunk {pos} from disk");
        grid.columns[local.column_index()]
            .get_or_insert_with(ChunkColumn::new)
            .set(local.y, chunk.clone());
        Ok(Some(chunk))
    }

    /// Resident chunk only; never touches the disk.
    pub fn get_loaded_chunk(&self, local: LocalChunk) -> Result<Option<SharedChunk>> {
        let grid = self.grid.lock();
        if grid.closed {
            return Err(StorageError::ContainerClosed);
        }
        Ok(grid.slot(local).cloned())
    }

    /// Install `chunk`. A different chunk in the slot is saved and evicted first.
    pub fn set_chunk(&self, local: LocalChunk, chunk: SharedChunk) -> Result<()> {
        let mut grid = self.grid.lock();
        if grid.closed {
            return Err(StorageError::ContainerClosed);
        }
        let previous = grid.columns[local.column_index()]
            .get_or_insert_with(ChunkColumn::new)
            .set(local.y, chunk.clone());
        if let Some(old) = previous.filter(|old| !Arc::ptr_eq(old, &chunk)) {
            if let Err(e) = self.persist(local, &old) {
                error!("Failed to save replaced chunk {}: {e}", self.pos.chunk_at(local));
            }
        }
        Ok(())
    }

    /// Save and evict one chunk. On a failed save the chunk stays resident
    /// and the error is returned.
    pub fn unload_chunk(&self, local: LocalChunk) -> Result<RegionStatus> {
        let mut grid = self.grid.lock();
        if grid.closed {
            return Err(StorageError::ContainerClosed);
        }
        let Some(chunk) = grid.slot(local).cloned() else {
            return Ok(self.status(&grid));
        };

        self.persist(local, &chunk)?;

        let index = local.column_index();
        if let Some(column) = grid.columns[index].as_mut() {
            column.take(local.y);
            if column.is_empty() {
                grid.columns[index] = None;
            }
        }
        debug!("Unloaded chunk {}", self.pos.chunk_at(local));

        if grid.is_empty() {
            grid.closed = true;
            self.codec.close()?;
            debug!("Region {} is empty, closed {}", self.pos, self.codec.path().display());
            return Ok(RegionStatus::Empty);
        }
        Ok(RegionStatus::Occupied)
    }

    /// Save every chunk that needs it and flush the index. Per-chunk
    /// failures are logged and the chunk stays dirty. Returns the number of
    /// chunks written.
    pub fn save(&self) -> Result<usize> {
        let grid = self.grid.lock();
        if grid.closed {
            return Ok(0);
        }
        let written = self.save_all(&grid);
        self.codec.flush()?;
        Ok(written)
    }

    /// Decay residency of every chunk. Returns the chunks whose lease ran out.
    pub fn tick(&self) -> Vec<ChunkVec> {
        let grid = self.grid.lock();
        if grid.closed {
            return Vec::new();
        }
        grid.chunks()
            .filter(|(_, chunk)| chunk.write().residency_mut().tick())
            .map(|(local, _)| self.pos.chunk_at(local))
            .collect()
    }

    /// Save everything, drop all chunks and close the file.
    pub fn close(&self) -> Result<()> {
        let mut grid = self.grid.lock();
        if grid.closed {
            return Ok(());
        }
        self.save_all(&grid);
        grid.columns.iter_mut().for_each(|c| *c = None);
        grid.closed = true;
        self.codec.close()
    }

    fn status(&self, grid: &RegionGrid) -> RegionStatus {
        if grid.is_empty() {
            RegionStatus::Empty
        } else {
            RegionStatus::Occupied
        }
    }

    fn save_all(&self, grid: &RegionGrid) -> usize {
        let mut written = 0;
        for (local, chunk) in grid.chunks() {
            match self.persist(local, chunk) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to save chunk {}: {e}", self.pos.chunk_at(local)),
            }
        }
        written
    }

    /// Write one chunk if it needs saving. Returns whether anything was written.
    fn persist(&self, local: LocalChunk, chunk: &SharedChunk) -> Result<bool> {
        let mut chunk = chunk.write();
        if !chunk.needs_save() {
            return Ok(false);
        }
        self.codec
            .save_chunk(local, &NbtRoot::unnamed(chunk.save()))?;
        chunk.mark_saved();
        Ok(true)
    }
}
