//! Allocator statistics.

use crate::ZONE_NR;

/// Size and free bytes of one zone. Free bytes include the headers of free
/// chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ZoneStats {
    pub size: u64,
    pub free: u64,
}

impl ZoneStats {
    pub const fn used(&self) -> u64 {
        self.size - self.free
    }
}

/// Number of words the persisted statistics occupy.
pub(crate) const STATS_WORDS: usize = 7 + 2 * ZONE_NR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AllocatorStats {
    /// Size of the allocator space.
    pub space_total: u64,
    /// Bytes in used chunks, headers included.
    pub space_used: u64,
    /// Bytes in free chunks, headers included.
    pub space_free: u64,

    /// Number of chunks, free or used.
    pub chunks_nr: u64,
    /// Number of free chunks.
    pub free_chunks_nr: u64,

    /// Total number of successful allocations.
    pub alloc_nr: u64,
    /// Total number of frees.
    pub free_nr: u64,

    /// Per-zone figures, indexed by [`ZoneType::index`](crate::ZoneType::index).
    pub zones: [ZoneStats; ZONE_NR],
}

impl AllocatorStats {
    /// Number of live allocations.
    pub const fn used_chunks_nr(&self) -> u64 {
        self.chunks_nr - self.free_chunks_nr
    }

    pub(crate) fn account_alloc(&mut self, zone: usize, size: u64, chunks_delta: i64) {
        self.zones[zone].free -= size;
        self.space_free -= size;
        self.space_used += size;
        self.alloc_nr += 1;
        self.shift_chunks(chunks_delta, chunks_delta - 1);
    }

    pub(crate) fn account_free(&mut self, zone: usize, size: u64, chunks_delta: i64) {
        self.zones[zone].free += size;
        self.space_free += size;
        self.space_used -= size;
        self.free_nr += 1;
        self.shift_chunks(chunks_delta, chunks_delta + 1);
    }

    fn shift_chunks(&mut self, chunks: i64, free_chunks: i64) {
        self.chunks_nr = self.chunks_nr.wrapping_add_signed(chunks);
        self.free_chunks_nr = self.free_chunks_nr.wrapping_add_signed(free_chunks);
    }

    pub(crate) fn to_words(&self) -> [u64; STATS_WORDS] {
        let mut words = [0; STATS_WORDS];
        words[..7].copy_from_slice(&[
            self.space_total,
            self.space_used,
            self.space_free,
            self.chunks_nr,
            self.free_chunks_nr,
            self.alloc_nr,
            self.free_nr,
        ]);
        for (z, zone) in self.zones.iter().enumerate() {
            words[7 + 2 * z] = zone.size;
            words[8 + 2 * z] = zone.free;
        }
        words
    }

    pub(crate) fn from_words(words: &[u64; STATS_WORDS]) -> Self {
        let mut zones = [ZoneStats::default(); ZONE_NR];
        for (z, zone) in zones.iter_mut().enumerate() {
            *zone = ZoneStats { size: words[7 + 2 * z], free: words[8 + 2 * z] };
        }

        Self {
            space_total: words[0],
            space_used: words[1],
            space_free: words[2],
            chunks_nr: words[3],
            free_chunks_nr: words[4],
            alloc_nr: words[5],
            free_nr: words[6],
            zones,
        }
    }
}

impl core::fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            r#"Stat                 | Value
---------------------|---------------
Space total          | {:>14}
Space used           | {:>14}
Space free           | {:>14}
Chunks               | {:>14}
Free chunks          | {:>14}
Allocations (total)  | {:>14}
Frees (total)        | {:>14}"#,
            self.space_total,
            self.space_used,
            self.space_free,
            self.chunks_nr,
            self.free_chunks_nr,
            self.alloc_nr,
            self.free_nr,
        )?;

        for zone in crate::ZoneType::LAYOUT {
            let z = self.zones[zone.index()];
            write!(f, "\n{:<20} | {:>14}", format!("{:?} zone free/size", zone), format!("{}/{}", z.free, z.size))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ZoneType;

    #[test]
    fn stats_accounting_test() {
        let mut stats = AllocatorStats {
            space_total: 0x1000,
            space_free: 0x1000,
            chunks_nr: 1,
            free_chunks_nr: 1,
            ..Default::default()
        };
        let z = ZoneType::Normal.index();
        stats.zones[z] = ZoneStats { size: 0x1000, free: 0x1000 };

        // split: one used chunk carved off, the free remainder stays listed
        stats.account_alloc(z, 0x100, 1);
        assert!(stats.chunks_nr == 2 && stats.free_chunks_nr == 1);
        assert!(stats.space_used == 0x100 && stats.zones[z].used() == 0x100);

        // whole chunk granted
        stats.account_alloc(z, 0xf00, 0);
        assert!(stats.chunks_nr == 2 && stats.free_chunks_nr == 0);
        assert!(stats.used_chunks_nr() == 2);

        // freed chunk absorbs its free successor
        stats.account_free(z, 0x100, 0);
        stats.account_free(z, 0xf00, -1);
        assert!(stats.chunks_nr == 1 && stats.free_chunks_nr == 1);
        assert!(stats.space_free == 0x1000 && stats.alloc_nr == 2 && stats.free_nr == 2);

        assert!(AllocatorStats::from_words(&stats.to_words()) == stats);
    }

    #[test]
    fn stats_display_test() {
        let stats = AllocatorStats { space_total: 42, ..Default::default() };
        let table = format!("{}", stats);

        assert!(table.contains("Space total"));
        assert!(table.contains("42"));
        assert!(table.contains("Repair zone free/size"));
    }
}
