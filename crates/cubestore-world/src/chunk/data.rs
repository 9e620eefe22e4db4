//! Block and biome payload of a single chunk.

use cubestore_nbt::{CompoundExt, NbtCompound, NbtTag};

use crate::coords::CHUNK_SIZE;
use crate::error::{Result, StorageError};

/// Blocks along one edge of a chunk, as an index type.
pub const EDGE: usize = CHUNK_SIZE as usize;

/// Blocks in one chunk.
pub const CHUNK_VOLUME: usize = EDGE * EDGE * EDGE;

/// Runtime id of the empty block.
pub const AIR: u32 = 0;

/// Index of a block in XZY order: `(x * EDGE + z) * EDGE + y`.
fn block_index(x: usize, y: usize, z: usize) -> usize {
    debug_assert!(x < EDGE && y < EDGE && z < EDGE);
    (x * EDGE + z) * EDGE + y
}

/// Minimum bits-per-block for a palette. Valid values: 0, 1, 2, 3, 4, 5, 6, 8, 16.
fn bits_per_block_for_palette(palette_size: usize) -> u8 {
    match palette_size {
        0..=1 => 0,
        2 => 1,
        3..=4 => 2,
        5..=8 => 3,
        9..=16 => 4,
        17..=32 => 5,
        33..=64 => 6,
        65..=256 => 8,
        _ => 16,
    }
}

// ─── Palette storage ────────────────────────────────────────────────────────

/// Palette-compressed block storage. A chunk made of one block type keeps no
/// per-block indices at all.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockStorage {
    palette: Vec<u32>,
    indices: Option<Vec<u16>>,
}

impl BlockStorage {
    pub fn uniform(runtime_id: u32) -> Self {
        Self {
            palette: vec![runtime_id],
            indices: None,
        }
    }

    pub fn palette(&self) -> &[u32] {
        &self.palette
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> u32 {
        match &self.indices {
            Some(indices) => self.palette[indices[block_index(x, y, z)] as usize],
            None => self.palette[0],
        }
    }

    pub fn set(&mut self, x: usize, y: usize, z: usize, runtime_id: u32) {
        if self.indices.is_none() {
            if self.palette[0] == runtime_id {
                return;
            }
            self.indices = Some(vec![0; CHUNK_VOLUME]);
        }
        let palette_index = match self.palette.iter().position(|&id| id == runtime_id) {
            Some(idx) => idx,
            None => {
                if self.palette.len() > u16::MAX as usize {
                    self.compact();
                }
                self.palette.push(runtime_id);
                self.palette.len() - 1
            }
        };
        if let Some(indices) = self.indices.as_mut() {
            indices[block_index(x, y, z)] = palette_index as u16;
        }
    }

    /// True if every block is `runtime_id`.
    pub fn is_uniform(&self, runtime_id: u32) -> bool {
        match &self.indices {
            None => self.palette[0] == runtime_id,
            Some(indices) => indices.iter().all(|&i| self.palette[i as usize] == runtime_id),
        }
    }

    /// Drop palette entries no block refers to.
    fn compact(&mut self) {
        let Some(indices) = self.indices.as_mut() else {
            self.palette.truncate(1);
            return;
        };
        let mut remap = vec![u16::MAX; self.palette.len()];
        let mut palette = Vec::new();
        for index in indices.iter_mut() {
            let old = *index as usize;
            if remap[old] == u16::MAX {
                remap[old] = palette.len() as u16;
                palette.push(self.palette[old]);
            }
            *index = remap[old];
        }
        self.palette = palette;
    }

    /// Persisted form: `Palette` ids, `BitsPerBlock`, and the packed `Data` words.
    pub fn to_compound(&self) -> NbtCompound {
        let mut c = NbtCompound::new();
        c.insert(
            "Palette".into(),
            NbtTag::IntArray(self.palette.iter().map(|&id| id as i32).collect()),
        );

        let bpb = match &self.indices {
            Some(_) => bits_per_block_for_palette(self.palette.len()),
            None => 0,
        };
        c.insert("BitsPerBlock".into(), NbtTag::Byte(bpb as i8));

        let mut words = Vec::new();
        if let (Some(indices), true) = (&self.indices, bpb > 0) {
            // Pack palette indices into u32 words, LSB-first.
            let blocks_per_word = 32 / bpb as usize;
            let word_count = CHUNK_VOLUME.div_ceil(blocks_per_word);
            words.reserve(word_count);
            for chunk in indices.chunks(blocks_per_word) {
                let mut word: u32 = 0;
                for (slot, &palette_index) in chunk.iter().enumerate() {
                    word |= (palette_index as u32) << (bpb as u32 * slot as u32);
                }
                words.push(word as i32);
            }
        }
        c.insert("Data".into(), NbtTag::IntArray(words));
        c
    }

    pub fn from_compound(c: &NbtCompound) -> Result<Self> {
        let palette: Vec<u32> = c
            .get_int_array("Palette")
            .ok_or_else(|| invalid("missing block palette"))?
            .iter()
            .map(|&id| id as u32)
            .collect();
        if palette.is_empty() {
            return Err(invalid("empty block palette"));
        }

        let bpb = c
            .get("BitsPerBlock")
            .and_then(NbtTag::as_byte)
            .ok_or_else(|| invalid("missing bits per block"))? as u8;
        if bpb == 0 {
            return Ok(Self {
                palette: palette[..1].to_vec(),
                indices: None,
            });
        }
        if bpb > 16 || bpb < bits_per_block_for_palette(palette.len()) {
            return Err(invalid(format!(
                "{bpb} bits per block cannot address {} palette entries",
                palette.len()
            )));
        }

        let words = c
            .get_int_array("Data")
            .ok_or_else(|| invalid("missing block data"))?;
        let blocks_per_word = 32 / bpb as usize;
        if words.len() != CHUNK_VOLUME.div_ceil(blocks_per_word) {
            return Err(invalid(format!("block data has {} words", words.len())));
        }

        let mask = (1u32 << bpb) - 1;
        let mut indices = vec![0u16; CHUNK_VOLUME];
        for (i, slot) in indices.iter_mut().enumerate() {
            let word = words[i / blocks_per_word] as u32;
            let shift = bpb as u32 * (i % blocks_per_word) as u32;
            let palette_index = (word >> shift) & mask;
            if palette_index as usize >= palette.len() {
                return Err(invalid(format!("palette index {palette_index} out of range")));
            }
            *slot = palette_index as u16;
        }

        Ok(Self {
            palette,
            indices: Some(indices),
        })
    }
}

fn invalid(message: impl Into<String>) -> StorageError {
    StorageError::InvalidChunk(message.into())
}

// ─── Chunk data ─────────────────────────────────────────────────────────────

/// Everything persisted for one chunk besides its lifecycle flags.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkData {
    blocks: BlockStorage,
    /// One biome id per block column, indexed `z * EDGE + x`.
    biomes: Vec<u8>,
    /// Opaque data owned by other subsystems, carried through saves untouched.
    extra: NbtCompound,
}

impl Default for ChunkData {
    fn default() -> Self {
        Self::empty()
    }
}

impl ChunkData {
    /// An all-air chunk.
    pub fn empty() -> Self {
        Self {
            blocks: BlockStorage::uniform(AIR),
            biomes: vec![0; EDGE * EDGE],
            extra: NbtCompound::new(),
        }
    }

    pub fn blocks(&self) -> &BlockStorage {
        &self.blocks
    }

    pub fn get_block(&self, x: usize, y: usize, z: usize) -> u32 {
        self.blocks.get(x, y, z)
    }

    pub fn set_block(&mut self, x: usize, y: usize, z: usize, runtime_id: u32) {
        self.blocks.set(x, y, z, runtime_id);
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_uniform(AIR)
    }

    /// Local Y of the highest non-air block in a column.
    pub fn highest_block(&self, x: usize, z: usize) -> Option<usize> {
        (0..EDGE).rev().find(|&y| self.get_block(x, y, z) != AIR)
    }

    /// Local Y of the lowest non-air block in a column.
    pub fn lowest_block(&self, x: usize, z: usize) -> Option<usize> {
        (0..EDGE).find(|&y| self.get_block(x, y, z) != AIR)
    }

    pub fn biome(&self, x: usize, z: usize) -> u8 {
        self.biomes[z * EDGE + x]
    }

    pub fn set_biome(&mut self, x: usize, z: usize, biome: u8) {
        self.biomes[z * EDGE + x] = biome;
    }

    pub fn extra(&self) -> &NbtCompound {
        &self.extra
    }

    pub fn extra_mut(&mut self) -> &mut NbtCompound {
        &mut self.extra
    }

    pub fn write_to(&self, c: &mut NbtCompound) {
        c.insert("Blocks".into(), NbtTag::Compound(self.blocks.to_compound()));
        c.insert(
            "Biomes".into(),
            NbtTag::ByteArray(self.biomes.iter().map(|&b| b as i8).collect()),
        );
        if !self.extra.is_empty() {
            c.insert("Extra".into(), NbtTag::Compound(self.extra.clone()));
        }
    }

    pub fn read_from(c: &NbtCompound) -> Result<Self> {
        let blocks = BlockStorage::from_compound(
            c.get_compound("Blocks")
                .ok_or_else(|| invalid("missing Blocks"))?,
        )?;
        let biomes: Vec<u8> = match c.get_byte_array("Biomes") {
            Some(raw) if raw.len() == EDGE * EDGE => raw.iter().map(|&b| b as u8).collect(),
            Some(raw) => return Err(invalid(format!("biome array has {} entries", raw.len()))),
            None => vec![0; EDGE * EDGE],
        };
        let extra = c.get_compound("Extra").cloned().unwrap_or_default();
        Ok(Self {
            blocks,
            biomes,
            extra,
        })
    }
}
