//! Maps local chunk coordinates onto sector-file ids and carries tag-tree
//! payloads through the file.

use std::collections::HashMap;
use std::path::Path;

use cubestore_nbt::NbtRoot;
use parking_lot::Mutex;
use tracing::debug;

use crate::coords::{LocalChunk, REGION_SIZE};
use crate::error::Result;
use crate::sector_file::SectorFile;

/// Offset added to every chunk id so ids below it stay free for other records.
pub const CHUNK_ID_BASE: u32 = 32;

/// Flat sector-file id of a chunk: `(y * SIZE + z) * SIZE + x`, offset by the base.
pub fn chunk_id(local: LocalChunk) -> u32 {
    let size = REGION_SIZE as u32;
    CHUNK_ID_BASE + (local.y as u32 * size + local.z as u32) * size + local.x as u32
}

pub struct RegionCodec {
    file: SectorFile,
    /// Exact payload length per chunk id, learned on save.
    lengths: Mutex<HashMap<u32, usize>>,
}

impl RegionCodec {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            file: SectorFile::open(path)?,
            lengths: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Serialize and store the payload of one chunk.
    pub fn save_chunk(&self, local: LocalChunk, root: &NbtRoot) -> Result<()> {
        let id = chunk_id(local);
        let bytes = cubestore_nbt::to_bytes(root)?;
        let entry = self.file.write_chunk(id, &bytes)?;
        self.lengths.lock().insert(id, bytes.len());
        debug!(
            "Saved chunk id {id}: {} bytes in sectors {}..{}",
            bytes.len(),
            entry.start,
            entry.end()
        );
        Ok(())
    }

    /// Load and parse the payload of one chunk, `None` if never stored.
    pub fn load_chunk(&self, local: LocalChunk) -> Result<Option<NbtRoot>> {
        let id = chunk_id(local);
        let cached = self.lengths.lock().get(&id).copied();
        let len = match cached {
            Some(len) => len,
            // Cold start: the full run is read and the decoder stops at the
            // end of the root compound, ignoring the zero padding.
            None => match self.file.entry(id) {
                Some(entry) => entry.byte_len(),
                None => return Ok(None),
            },
        };

        let Some(bytes) = self.file.read_chunk(id, len)? else {
            return Ok(None);
        };
        Ok(Some(cubestore_nbt::from_bytes(&bytes)?))
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.file.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubestore_nbt::{NbtCompound, NbtTag};
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cubestore_test_{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample(marker: i32) -> NbtRoot {
        let mut c = NbtCompound::new();
        c.insert("generated".into(), NbtTag::from(true));
        c.insert("marker".into(), NbtTag::Int(marker));
        c.insert("fill".into(), NbtTag::IntArray(vec![marker; 3000]));
        NbtRoot::unnamed(c)
    }

    #[test]
    fn chunk_ids_are_unique_and_offset() {
        assert_eq!(chunk_id(LocalChunk::new(0, 0, 0).unwrap()), 32);
        assert_eq!(chunk_id(LocalChunk::new(1, 0, 0).unwrap()), 33);
        assert_eq!(chunk_id(LocalChunk::new(0, 0, 1).unwrap()), 64);
        assert_eq!(chunk_id(LocalChunk::new(0, 1, 0).unwrap()), 32 + 1024);
        assert_eq!(chunk_id(LocalChunk::new(31, 31, 31).unwrap()), 32 + 32767);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = temp_dir();
        let codec = RegionCodec::open(&dir.join("r.cbr")).unwrap();
        let local = LocalChunk::new(3, 2, 5).unwrap();
        codec.save_chunk(local, &sample(9)).unwrap();
        assert_eq!(codec.load_chunk(local).unwrap(), Some(sample(9)));
        assert_eq!(codec.load_chunk(LocalChunk::new(3, 2, 6).unwrap()).unwrap(), None);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cold_start_derives_length_from_sectors() {
        let dir = temp_dir();
        let path = dir.join("r.cbr");
        let local = LocalChunk::new(31, 0, 7).unwrap();
        {
            let codec = RegionCodec::open(&path).unwrap();
            codec.save_chunk(local, &sample(1)).unwrap();
            codec.save_chunk(local, &sample(2)).unwrap();
            codec.close().unwrap();
        }
        let codec = RegionCodec::open(&path).unwrap();
        assert!(codec.lengths.lock().is_empty());
        assert_eq!(codec.load_chunk(local).unwrap(), Some(sample(2)));
        std::fs::remove_dir_all(&dir).ok();
    }
}
