//! Sector-allocated region file.
//!
//! The file is a sequence of 4096-byte sectors. Sector 0 is a reserved
//! header and sectors `[97, 161)` hold the chunk index; everything else is
//! chunk data, handed out first-fit. The index is stored big-endian as
//! `[count:4]` followed by `count` entries of `[id:4][start:4][sectors:4]`.
//!
//! All operations serialize on one lock per file. Rewriting a chunk always
//! allocates fresh sectors; the previous run is left allocated and is never
//! reused, so files only grow.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

/// Size of one sector in bytes.
pub const SECTOR_SIZE: usize = 4096;

/// Sectors reserved for the file header, starting at 0.
pub const HEADER_SECTORS: u32 = 1;

/// First sector of the chunk index.
pub const INDEX_START: u32 = 97;

/// Number of sectors reserved for the chunk index.
pub const INDEX_SECTORS: u32 = 64;

/// Highest sector number the allocator will hand out.
pub const MAX_SECTOR: u32 = 0xFFFFF;

const ENTRY_BYTES: usize = 12;
const INDEX_BYTES: usize = INDEX_SECTORS as usize * SECTOR_SIZE;

/// Location of one chunk payload inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    pub start: u32,
    pub sectors: u32,
}

impl ChunkEntry {
    /// One past the last sector of the run.
    pub fn end(&self) -> u32 {
        self.start + self.sectors
    }

    /// `end` for entries read from disk, `None` if the run wraps.
    fn checked_end(&self) -> Option<u32> {
        self.start.checked_add(self.sectors)
    }

    pub fn overlaps(&self, other: &ChunkEntry) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    pub fn byte_len(&self) -> usize {
        self.sectors as usize * SECTOR_SIZE
    }
}

/// Sectors needed to hold `len` bytes. Empty payloads still take one sector.
pub fn sectors_for(len: usize) -> u32 {
    len.div_ceil(SECTOR_SIZE).max(1) as u32
}

fn is_reserved(sector: u32) -> bool {
    sector < HEADER_SECTORS || (INDEX_START..INDEX_START + INDEX_SECTORS).contains(&sector)
}

/// Maximum number of entries that fit in the reserved index range.
pub fn entry_capacity() -> usize {
    (INDEX_BYTES - 4) / ENTRY_BYTES
}

// ─── Free-space bitmap ──────────────────────────────────────────────────────

/// One bit per sector, set when the sector is reserved or owned by a chunk.
/// Sectors past the end of the bitmap are free.
#[derive(Debug, Default)]
struct SectorBitmap {
    words: Vec<u64>,
}

impl SectorBitmap {
    fn with_reserved() -> Self {
        let mut map = Self::default();
        map.mark(0, HEADER_SECTORS);
        map.mark(INDEX_START, INDEX_SECTORS);
        map
    }

    fn len_bits(&self) -> u32 {
        (self.words.len() * 64) as u32
    }

    fn is_used(&self, sector: u32) -> bool {
        let word = (sector / 64) as usize;
        self.words
            .get(word)
            .is_some_and(|w| w & (1u64 << (sector % 64)) != 0)
    }

    fn mark(&mut self, start: u32, count: u32) {
        for sector in start..start + count {
            let word = (sector / 64) as usize;
            if word >= self.words.len() {
                self.words.resize(word + 1, 0);
            }
            self.words[word] |= 1u64 << (sector % 64);
        }
    }

    fn is_free_run(&self, start: u32, count: u32) -> bool {
        (start..start + count).all(|s| !self.is_used(s))
    }

    /// First run of `count` free sectors at or after sector 1.
    fn first_fit(&self, count: u32) -> Option<u32> {
        let mut run_start = HEADER_SECTORS;
        let mut run_len = 0;
        let mut sector = HEADER_SECTORS;
        while sector <= MAX_SECTOR {
            if sector >= self.len_bits() {
                // Everything from here on is free.
                let end = run_start.checked_add(count)?;
                return (end - 1 <= MAX_SECTOR).then_some(run_start);
            }
            if self.is_used(sector) {
                run_len = 0;
                run_start = sector + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            sector += 1;
        }
        None
    }
}

// ─── Sector file ────────────────────────────────────────────────────────────

struct SectorFileInner {
    file: File,
    entries: BTreeMap<u32, ChunkEntry>,
    used: SectorBitmap,
    index_dirty: bool,
}

/// A region file with its own free-space bookkeeping.
pub struct SectorFile {
    path: PathBuf,
    inner: Mutex<SectorFileInner>,
}

impl SectorFile {
    /// Open an existing file and read its index, or create a new one with an
    /// empty index.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let fresh = file.metadata()?.len() == 0;

        let mut inner = SectorFileInner {
            file,
            entries: BTreeMap::new(),
            used: SectorBitmap::with_reserved(),
            index_dirty: fresh,
        };

        if fresh {
            inner.file.write_all(&[0u8; SECTOR_SIZE])?;
            inner.write_index()?;
            debug!("Created region file {}", path.display());
        } else {
            inner.read_index(path)?;
            debug!(
                "Opened region file {} ({} entries)",
                path.display(),
                inner.entries.len()
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store `data` under `id` in a newly allocated run of sectors.
    pub fn write_chunk(&self, id: u32, data: &[u8]) -> Result<ChunkEntry> {
        let needed = sectors_for(data.len());
        let mut inner = self.inner.lock();
        let start = inner
            .used
            .first_fit(needed)
            .ok_or(StorageError::NoFreeSectors { needed })?;
        let entry = ChunkEntry {
            start,
            sectors: needed,
        };

        inner
            .file
            .seek(SeekFrom::Start(start as u64 * SECTOR_SIZE as u64))?;
        inner.file.write_all(data)?;
        let padding = entry.byte_len() - data.len();
        if padding > 0 {
            inner.file.write_all(&vec![0u8; padding])?;
        }

        inner.used.mark(start, needed);
        inner.entries.insert(id, entry);
        inner.index_dirty = true;
        Ok(entry)
    }

    /// Read the payload stored under `id`, truncated to `expected_len`.
    /// Returns `None` when no entry exists.
    pub fn read_chunk(&self, id: u32, expected_len: usize) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get(&id).copied() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; entry.byte_len()];
        inner
            .file
            .seek(SeekFrom::Start(entry.start as u64 * SECTOR_SIZE as u64))?;
        inner.file.read_exact(&mut buf)?;
        buf.truncate(expected_len.min(buf.len()));
        Ok(Some(buf))
    }

    pub fn entry(&self, id: u32) -> Option<ChunkEntry> {
        self.inner.lock().entries.get(&id).copied()
    }

    /// Snapshot of all live entries, ordered by id.
    pub fn entries(&self) -> Vec<(u32, ChunkEntry)> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(&id, &entry)| (id, entry))
            .collect()
    }

    /// Persist the index if anything changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.index_dirty {
            inner.write_index()?;
        }
        inner.file.flush()?;
        Ok(())
    }

    /// Flush the index and sync file contents to disk.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.index_dirty {
            inner.write_index()?;
        }
        inner.file.sync_all()?;
        Ok(())
    }
}

impl SectorFileInner {
    fn write_index(&mut self) -> Result<()> {
        let capacity = entry_capacity();
        if self.entries.len() > capacity {
            return Err(StorageError::IndexOverflow {
                entries: self.entries.len(),
                capacity,
            });
        }

        let mut buf = Vec::with_capacity(INDEX_BYTES);
        buf.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for (&id, entry) in &self.entries {
            buf.extend_from_slice(&id.to_be_bytes());
            buf.extend_from_slice(&entry.start.to_be_bytes());
            buf.extend_from_slice(&entry.sectors.to_be_bytes());
        }
        buf.resize(INDEX_BYTES, 0);

        self.file
            .seek(SeekFrom::Start(INDEX_START as u64 * SECTOR_SIZE as u64))?;
        self.file.write_all(&buf)?;
        self.index_dirty = false;
        Ok(())
    }

    fn read_index(&mut self, path: &Path) -> Result<()> {
        let mut buf = Vec::with_capacity(INDEX_BYTES);
        self.file
            .seek(SeekFrom::Start(INDEX_START as u64 * SECTOR_SIZE as u64))?;
        (&mut self.file)
            .take(INDEX_BYTES as u64)
            .read_to_end(&mut buf)?;
        buf.resize(INDEX_BYTES, 0);

        let word = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let count = word(0) as usize;
        if count > entry_capacity() {
            return Err(StorageError::IndexOverflow {
                entries: count,
                capacity: entry_capacity(),
            });
        }

        for i in 0..count {
            let at = 4 + i * ENTRY_BYTES;
            let id = word(at);
            let entry = ChunkEntry {
                start: word(at + 4),
                sectors: word(at + 8),
            };
            let valid = match entry.checked_end() {
                Some(end) if entry.sectors > 0 && end - 1 <= MAX_SECTOR => {
                    !(entry.start..end).any(is_reserved)
                        && self.used.is_free_run(entry.start, entry.sectors)
                }
                _ => false,
            };
            if !valid {
                warn!(
                    "Dropping invalid index entry {id} ({}+{}) in {}",
                    entry.start,
                    entry.sectors,
                    path.display()
                );
                continue;
            }
            self.used.mark(entry.start, entry.sectors);
            self.entries.insert(id, entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cubestore_test_{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn new_file_has_header_and_index() {
        let dir = temp_dir();
        let path = dir.join("r.cbr");
        let file = SectorFile::open(&path).unwrap();
        assert!(file.entries().is_empty());
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, ((INDEX_START + INDEX_SECTORS) as usize * SECTOR_SIZE) as u64);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = temp_dir();
        let file = SectorFile::open(&dir.join("r.cbr")).unwrap();
        let data = payload(5000, 7);
        let entry = file.write_chunk(33, &data).unwrap();
        assert_eq!(entry, ChunkEntry { start: 1, sectors: 2 });
        assert_eq!(file.read_chunk(33, data.len()).unwrap(), Some(data));
        assert_eq!(file.read_chunk(34, 10).unwrap(), None);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reopen_preserves_payload() {
        let dir = temp_dir();
        let path = dir.join("r.cbr");
        let data = payload(9000, 3);
        {
            let file = SectorFile::open(&path).unwrap();
            let entry = file.write_chunk(40, &data).unwrap();
            assert_eq!(entry.sectors, 3);
            file.close().unwrap();
        }
        let file = SectorFile::open(&path).unwrap();
        assert_eq!(file.entry(40).map(|e| e.sectors), Some(3));
        assert_eq!(file.read_chunk(40, 9000).unwrap(), Some(data));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn allocation_skips_index_range() {
        let dir = temp_dir();
        let file = SectorFile::open(&dir.join("r.cbr")).unwrap();
        // Sectors 1..=90 are taken, leaving 91..97 (6 sectors) before the index.
        file.write_chunk(100, &payload(90 * SECTOR_SIZE, 1)).unwrap();
        let straddling = file.write_chunk(101, &payload(8 * SECTOR_SIZE, 2)).unwrap();
        assert_eq!(straddling.start, INDEX_START + INDEX_SECTORS);
        let small = file.write_chunk(102, &payload(SECTOR_SIZE, 3)).unwrap();
        assert_eq!(small.start, 91);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn live_entries_never_overlap_or_touch_reserved() {
        let dir = temp_dir();
        let file = SectorFile::open(&dir.join("r.cbr")).unwrap();
        for i in 0..200u32 {
            let len = 1 + (i as usize * 2917) % (5 * SECTOR_SIZE);
            file.write_chunk(32 + i % 50, &payload(len, i as u8)).unwrap();
        }
        let entries = file.entries();
        assert_eq!(entries.len(), 50);
        for (i, (_, a)) in entries.iter().enumerate() {
            assert!(!(a.start..a.end()).any(is_reserved));
            for (_, b) in &entries[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rewrite_orphans_old_sectors() {
        let dir = temp_dir();
        let file = SectorFile::open(&dir.join("r.cbr")).unwrap();
        let first = file.write_chunk(32, &payload(100, 1)).unwrap();
        let second = file.write_chunk(32, &payload(100, 2)).unwrap();
        assert_ne!(first.start, second.start);
        assert_eq!(file.entries().len(), 1);
        assert_eq!(file.read_chunk(32, 100).unwrap(), Some(payload(100, 2)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn index_overflow_is_fatal() {
        let dir = temp_dir();
        let path = dir.join("r.cbr");
        let file = SectorFile::open(&path).unwrap();
        {
            // Inflate the index directly; writing this many payloads is slow.
            let mut inner = file.inner.lock();
            for id in 0..=entry_capacity() as u32 {
                inner.entries.insert(id, ChunkEntry { start: 200 + id, sectors: 1 });
            }
            inner.index_dirty = true;
        }
        assert!(matches!(
            file.flush(),
            Err(StorageError::IndexOverflow { capacity, .. }) if capacity == entry_capacity()
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn wrapping_index_entry_is_dropped() {
        use std::io::{Seek, SeekFrom, Write};

        let dir = temp_dir();
        let path = dir.join("r.cbr");
        let file = SectorFile::open(&path).unwrap();
        let good = file.write_chunk(5, &payload(100, 1)).unwrap();
        file.close().unwrap();
        drop(file);

        let mut index = Vec::new();
        for word in [2, 5, good.start, good.sectors, 9, u32::MAX - 1, 4] {
            index.extend_from_slice(&word.to_be_bytes());
        }
        let mut raw = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        raw.seek(SeekFrom::Start(INDEX_START as u64 * SECTOR_SIZE as u64))
            .unwrap();
        raw.write_all(&index).unwrap();
        drop(raw);

        let file = SectorFile::open(&path).unwrap();
        assert_eq!(file.entry(5), Some(good));
        assert_eq!(file.entry(9), None);
        assert_eq!(file.read_chunk(5, 100).unwrap(), Some(payload(100, 1)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn first_fit_reuses_gaps() {
        let mut map = SectorBitmap::with_reserved();
        map.mark(1, 10);
        map.mark(14, 2);
        assert_eq!(map.first_fit(3), Some(11));
        assert_eq!(map.first_fit(4), Some(16));
        assert_eq!(map.first_fit(90), Some(INDEX_START + INDEX_SECTORS));
    }
}
