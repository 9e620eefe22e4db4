//! Per-region-column heightmaps and their side file.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use cubestore_nbt::{CompoundExt, NbtCompound, NbtRoot, NbtTag};
use tracing::warn;

use crate::coords::{CHUNK_SIZE, REGION_SIZE};
use crate::error::Result;

/// Block columns along one edge of a region column.
pub const HEIGHTMAP_WIDTH: usize = (REGION_SIZE * CHUNK_SIZE) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeightmapType {
    WorldSurface,
    MotionBlocking,
    OceanFloor,
    LightBlocking,
    Terrain,
}

impl HeightmapType {
    pub const ALL: [HeightmapType; 5] = [
        HeightmapType::WorldSurface,
        HeightmapType::MotionBlocking,
        HeightmapType::OceanFloor,
        HeightmapType::LightBlocking,
        HeightmapType::Terrain,
    ];

    /// Key in the side file.
    pub fn name(&self) -> &'static str {
        match self {
            HeightmapType::WorldSurface => "WORLD_SURFACE",
            HeightmapType::MotionBlocking => "MOTION_BLOCKING",
            HeightmapType::OceanFloor => "OCEAN_FLOOR",
            HeightmapType::LightBlocking => "LIGHT_BLOCKING",
            HeightmapType::Terrain => "TERRAIN",
        }
    }
}

/// Offset of a world block coordinate within its region column.
pub fn column_offset(block: i32) -> usize {
    block.rem_euclid(HEIGHTMAP_WIDTH as i32) as usize
}

/// Square grid of heights, one per block column. Unknown cells hold
/// [`Heightmap::UNKNOWN`].
#[derive(Debug, Clone, PartialEq)]
pub struct Heightmap {
    width: usize,
    cells: Vec<i32>,
    initialized: bool,
}

impl Heightmap {
    pub const UNKNOWN: i32 = i32::MIN;

    pub fn new(width: usize) -> Self {
        Self {
            width,
            cells: vec![Self::UNKNOWN; width * width],
            initialized: false,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn get(&self, x: usize, z: usize) -> Option<i32> {
        let value = self.cells[self.index(x, z)];
        (value != Self::UNKNOWN).then_some(value)
    }

    pub fn set(&mut self, x: usize, z: usize, height: i32) {
        let i = self.index(x, z);
        self.cells[i] = height;
    }

    /// Store `height` if it is above the current value. Returns true on change.
    pub fn raise(&mut self, x: usize, z: usize, height: i32) -> bool {
        let i = self.index(x, z);
        if self.cells[i] == Self::UNKNOWN || height > self.cells[i] {
            self.cells[i] = height;
            true
        } else {
            false
        }
    }

    pub fn init(&mut self) {
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn save(&self) -> Vec<i32> {
        self.cells.clone()
    }

    /// Replace the grid with persisted data. Arrays of the wrong size are
    /// rejected and leave the map untouched.
    pub fn load(&mut self, data: &[i32]) -> bool {
        if data.len() != self.cells.len() {
            return false;
        }
        self.cells.copy_from_slice(data);
        self.initialized = true;
        true
    }

    fn index(&self, x: usize, z: usize) -> usize {
        assert!(x < self.width && z < self.width, "heightmap cell ({x}, {z}) out of range");
        z * self.width + x
    }
}

/// The heightmaps of one region column, created on first use.
#[derive(Debug, Default)]
pub struct Heightmaps {
    maps: HashMap<HeightmapType, Heightmap>,
}

impl Heightmaps {
    pub fn get(&self, kind: HeightmapType) -> Option<&Heightmap> {
        self.maps.get(&kind)
    }

    pub fn get_or_create(&mut self, kind: HeightmapType) -> &mut Heightmap {
        self.maps
            .entry(kind)
            .or_insert_with(|| Heightmap::new(HEIGHTMAP_WIDTH))
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Read the side file. A missing file yields empty heightmaps.
    pub fn load_file(path: &Path) -> Result<Self> {
        let mut heightmaps = Self::default();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(heightmaps),
            Err(e) => return Err(e.into()),
        };
        let root = cubestore_nbt::from_bytes(&bytes)?;
        for kind in HeightmapType::ALL {
            let Some(data) = root.compound.get_int_array(kind.name()) else {
                continue;
            };
            let map = heightmaps.get_or_create(kind);
            if !map.load(data) {
                warn!(
                    "Ignoring {} heightmap of {} cells in {}",
                    kind.name(),
                    data.len(),
                    path.display()
                );
                heightmaps.maps.remove(&kind);
            }
        }
        Ok(heightmaps)
    }

    /// Write one integer array per heightmap type to the side file.
    pub fn save_file(&self, path: &Path) -> Result<()> {
        let mut compound = NbtCompound::new();
        for (kind, map) in &self.maps {
            compound.insert(kind.name().into(), NbtTag::IntArray(map.save()));
        }
        let bytes = cubestore_nbt::to_bytes(&NbtRoot::new("heightmaps", compound))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }
}
