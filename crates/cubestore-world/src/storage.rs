//! On-disk layout of a world directory.
//!
//! ```text
//! <root>/regions/<rx>,<rz>/section.<ry>.cbr   one sector file per region
//! <root>/regions/<rx>,<rz>/heightmaps.nbt     heightmaps of the region column
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::coords::RegionVec;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct WorldStorage {
    root: PathBuf,
}

impl WorldStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory shared by every region of a region column.
    pub fn column_dir(&self, x: i32, z: i32) -> PathBuf {
        self.root.join("regions").join(format!("{x},{z}"))
    }

    pub fn region_file(&self, pos: RegionVec) -> PathBuf {
        self.column_dir(pos.x, pos.z)
            .join(format!("section.{}.cbr", pos.y))
    }

    pub fn heightmap_file(&self, x: i32, z: i32) -> PathBuf {
        self.column_dir(x, z).join("heightmaps.nbt")
    }

    /// Create the column directory if missing and return the region file path.
    pub fn prepare_region_file(&self, pos: RegionVec) -> Result<PathBuf> {
        fs::create_dir_all(self.column_dir(pos.x, pos.z))?;
        Ok(self.region_file(pos))
    }
}
