//! Residency tickets: leases that keep a chunk in memory.

/// A lease on a chunk's residency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkLoadTicket {
    /// Keep the chunk for at least this many ticks.
    Timed(u64),
    /// Keep the chunk until the ticket is revoked or replaced.
    Indefinite,
}

impl ChunkLoadTicket {
    /// Lease renewed for chunks near a player on every refresh.
    pub const PLAYER: ChunkLoadTicket = ChunkLoadTicket::Timed(100);
}

/// Per-chunk residency bookkeeping, decayed once per scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Residency {
    countdown: u64,
    indefinite: bool,
}

impl Residency {
    pub fn new(initial_ticks: u64) -> Self {
        Self {
            countdown: initial_ticks,
            indefinite: false,
        }
    }

    /// Extend residency: a timed ticket raises the countdown to at least its
    /// timeout, an indefinite ticket pins the chunk.
    pub fn consume(&mut self, ticket: ChunkLoadTicket) {
        match ticket {
            ChunkLoadTicket::Timed(ticks) => self.countdown = self.countdown.max(ticks),
            ChunkLoadTicket::Indefinite => self.indefinite = true,
        }
    }

    /// Overwrite the current lease. Replacing an indefinite lease with a timed
    /// one unpins the chunk.
    pub fn replace(&mut self, ticket: ChunkLoadTicket) {
        match ticket {
            ChunkLoadTicket::Timed(ticks) => {
                self.countdown = ticks;
                self.indefinite = false;
            }
            ChunkLoadTicket::Indefinite => self.indefinite = true,
        }
    }

    /// Drop every lease; the chunk becomes eligible for unload immediately.
    pub fn revoke(&mut self) {
        self.indefinite = false;
        self.countdown = 0;
    }

    pub fn is_pinned(&self) -> bool {
        self.indefinite
    }

    pub fn remaining(&self) -> u64 {
        self.countdown
    }

    /// Unpinned with no ticks left.
    pub fn is_expired(&self) -> bool {
        !self.indefinite && self.countdown == 0
    }

    /// Advance one tick. Returns true while the chunk is expired.
    pub fn tick(&mut self) -> bool {
        if self.indefinite {
            return false;
        }
        self.countdown = self.countdown.saturating_sub(1);
        self.countdown == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_expires() {
        let mut r = Residency::new(3);
        assert!(!r.tick());
        assert!(!r.tick());
        assert!(r.tick());
        assert!(r.is_expired());
        assert!(r.tick());
    }

    #[test]
    fn consume_only_raises() {
        let mut r = Residency::new(50);
        r.consume(ChunkLoadTicket::Timed(10));
        assert_eq!(r.remaining(), 50);
        r.consume(ChunkLoadTicket::PLAYER);
        assert_eq!(r.remaining(), 100);
    }

    #[test]
    fn indefinite_suppresses_expiry() {
        let mut r = Residency::new(1);
        r.consume(ChunkLoadTicket::Indefinite);
        for _ in 0..1000 {
            assert!(!r.tick());
        }
        assert!(r.is_pinned());
        assert!(!r.is_expired());
    }

    #[test]
    fn replace_with_timed_unpins() {
        let mut r = Residency::new(100);
        r.consume(ChunkLoadTicket::Indefinite);
        r.replace(ChunkLoadTicket::Timed(2));
        assert!(!r.is_pinned());
        assert!(!r.tick());
        assert!(r.tick());
    }

    #[test]
    fn revoke_expires_immediately() {
        let mut r = Residency::new(100);
        r.consume(ChunkLoadTicket::Indefinite);
        r.revoke();
        assert!(r.is_expired());
    }
}
