//! Keeps the chunks around the world spawn resident.

use cubestore_world::{ChunkLoadTicket, ChunkVec, ResidencyProvider};

pub struct SpawnArea {
    center: ChunkVec,
    radius: i32,
}

impl SpawnArea {
    pub fn new(center: ChunkVec, radius: i32) -> Self {
        Self {
            center,
            radius: radius.max(0),
        }
    }
}

impl ResidencyProvider for SpawnArea {
    fn leases(&self) -> Vec<(ChunkVec, ChunkLoadTicket)> {
        let r = self.radius;
        let mut leases = Vec::new();
        for dx in -r..=r {
            for dy in -r..=r {
                for dz in -r..=r {
                    let pos = ChunkVec::new(self.center.x + dx, self.center.y + dy, self.center.z + dz);
                    leases.push((pos, ChunkLoadTicket::PLAYER));
                }
            }
        }
        leases
    }
}
