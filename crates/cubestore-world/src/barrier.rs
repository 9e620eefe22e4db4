//! Generation barriers: ordered completion milestones of a chunk.

use std::fmt;

/// How far procedural generation has progressed for a chunk.
///
/// Barriers are totally ordered and a chunk's barrier never decreases.
/// [`GenerationBarrier::All`] is terminal: a chunk that reaches it is
/// finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum GenerationBarrier {
    #[default]
    None,
    Skeleton,
    Terrain,
    Spawn,
    All,
}

impl GenerationBarrier {
    pub const ALL_BARRIERS: [GenerationBarrier; 5] = [
        GenerationBarrier::None,
        GenerationBarrier::Skeleton,
        GenerationBarrier::Terrain,
        GenerationBarrier::Spawn,
        GenerationBarrier::All,
    ];

    /// Name used in chunk payloads.
    pub fn name(&self) -> &'static str {
        match self {
            GenerationBarrier::None => "NONE",
            GenerationBarrier::Skeleton => "SKELETON",
            GenerationBarrier::Terrain => "TERRAIN",
            GenerationBarrier::Spawn => "SPAWN",
            GenerationBarrier::All => "ALL",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL_BARRIERS.into_iter().find(|b| b.name() == name)
    }

    pub fn is_terminal(&self) -> bool {
        *self == GenerationBarrier::All
    }

    /// The barrier after this one, `None` at the terminal barrier.
    pub fn next(&self) -> Option<Self> {
        match self {
            GenerationBarrier::None => Some(GenerationBarrier::Skeleton),
            GenerationBarrier::Skeleton => Some(GenerationBarrier::Terrain),
            GenerationBarrier::Terrain => Some(GenerationBarrier::Spawn),
            GenerationBarrier::Spawn => Some(GenerationBarrier::All),
            GenerationBarrier::All => None,
        }
    }
}

impl fmt::Display for GenerationBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
