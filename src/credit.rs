//! Capture units and the per-operation plans built from them.
//!
//! Every metadata write is one of a handful of unit kinds. An operation's
//! plan is the worst-case number of units of each kind it captures; its
//! credit is derived from that plan, and the running operation checks its
//! actual ledger against the same plan.

use crate::{chunk, fl, header, stats, TxCredit, ALLOC_SHIFT_MIN, ZONE_NR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Unit {
    /// A single metadata word.
    Word,
    /// The free-list link pair of a chunk.
    FreeLinks,
    /// A whole chunk header.
    ChunkHeader,
    /// A zone record: size and free bytes.
    Zone,
    /// The persisted statistics.
    Stats,
    /// All bucket heads of one free-list index.
    FlHeads,
    /// The fixed part of the allocator header.
    AllocatorHeader,
}

const UNIT_NR: usize = 7;

impl Unit {
    const ALL: [Unit; UNIT_NR] = [
        Unit::Word,
        Unit::FreeLinks,
        Unit::ChunkHeader,
        Unit::Zone,
        Unit::Stats,
        Unit::FlHeads,
        Unit::AllocatorHeader,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    /// Captured bytes per unit.
    pub(crate) const fn size(self) -> u64 {
        match self {
            Unit::Word => 8,
            Unit::FreeLinks => 16,
            Unit::ChunkHeader => chunk::HEADER_SIZE,
            Unit::Zone => 16,
            Unit::Stats => stats::STATS_WORDS as u64 * 8,
            Unit::FlHeads => fl::FL_NR as u64 * 8,
            Unit::AllocatorHeader => header::FIXED_WORDS as u64 * 8,
        }
    }
}

/// A count of capture units per kind.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub(crate) struct Units([u64; UNIT_NR]);

impl Units {
    pub(crate) const NONE: Self = Self([0; UNIT_NR]);

    pub(crate) const fn with(self, unit: Unit, n: u64) -> Self {
        let mut counts = self.0;
        counts[unit.index()] += n;
        Self(counts)
    }

    pub(crate) const fn plus(self, other: Self) -> Self {
        let mut counts = self.0;
        let mut i = 0;
        while i < UNIT_NR {
            counts[i] += other.0[i];
            i += 1;
        }
        Self(counts)
    }

    pub(crate) const fn times(self, k: u64) -> Self {
        let mut counts = self.0;
        let mut i = 0;
        while i < UNIT_NR {
            counts[i] *= k;
            i += 1;
        }
        Self(counts)
    }

    pub(crate) const fn credit(self) -> TxCredit {
        let mut credit = TxCredit::ZERO;
        let mut i = 0;
        while i < UNIT_NR {
            credit = credit.add(TxCredit::new(self.0[i], self.0[i] * Unit::ALL[i].size()));
            i += 1;
        }
        credit
    }

    pub(crate) fn fits_within(&self, plan: &Units) -> bool {
        self.0.iter().zip(plan.0.iter()).all(|(used, planned)| used <= planned)
    }

    pub(crate) fn record(&mut self, unit: Unit) {
        self.0[unit.index()] += 1;
    }
}

impl core::fmt::Debug for Units {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for unit in Unit::ALL {
            if self.0[unit.index()] != 0 {
                map.entry(&unit, &self.0[unit.index()]);
            }
        }
        map.finish()
    }
}

const WORD: Units = Units::NONE.with(Unit::Word, 1);
const ZONE_UPDATE: Units = Units::NONE.with(Unit::Zone, 1);

// free-list index
pub(crate) const FL_ADD: Units = Units::NONE.with(Unit::FreeLinks, 1).with(Unit::Word, 2);
pub(crate) const FL_DEL: Units = Units::NONE.with(Unit::Word, 2);
pub(crate) const FL_CREATE: Units = Units::NONE.with(Unit::FlHeads, 1);
pub(crate) const FL_DESTROY: Units = Units::NONE.with(Unit::FlHeads, 1);

// all-chunks list
pub(crate) const CHUNK_NEW: Units = Units::NONE.with(Unit::ChunkHeader, 1).with(Unit::Word, 2);
pub(crate) const CHUNK_REMOVE: Units = Units::NONE.with(Unit::Word, 2);

/// Allocation from the start of a free chunk: take it off its list, mark it
/// used and resize it, then split the tail off as a new listed free chunk.
pub(crate) const ALLOC: Units =
    FL_DEL.plus(WORD.times(2)).plus(CHUNK_NEW).plus(FL_ADD).plus(ZONE_UPDATE);

/// Allocation carving an aligned chunk out of the middle of a free one: the
/// free prefix is shrunk and relisted, the allocated chunk and the free
/// suffix are both new chunks.
pub(crate) const ALLOC_ALIGNED: Units = FL_DEL
    .plus(WORD)
    .plus(FL_ADD)
    .plus(CHUNK_NEW.times(2))
    .plus(FL_ADD)
    .plus(ZONE_UPDATE);

/// Freeing: flag the chunk, absorb a free successor, merge into a free
/// predecessor or relist the chunk itself.
pub(crate) const FREE: Units = WORD
    .plus(FL_DEL.times(2))
    .plus(CHUNK_REMOVE.times(2))
    .plus(WORD)
    .plus(FL_ADD)
    .plus(ZONE_UPDATE);

pub(crate) const CREATE: Units = Units::NONE
    .with(Unit::AllocatorHeader, 1)
    .with(Unit::Stats, 1)
    .plus(FL_CREATE.plus(CHUNK_NEW).plus(FL_ADD).times(ZONE_NR as u64));

/// Destruction: unlist every zone chunk, drop the free-list indices, clear
/// the chunk list ends and the magic.
pub(crate) const DESTROY: Units =
    FL_DEL.plus(FL_DESTROY).times(ZONE_NR as u64).plus(CHUNK_REMOVE).plus(WORD);

pub(crate) const STATS: Units = Units::NONE.with(Unit::Stats, 1);

/// Allocator operations that need transaction credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorOp {
    Create,
    Destroy,
    Alloc,
    AllocAligned,
    Free,
    FreeAligned,
}

impl AllocatorOp {
    /// The capture plan of the operation. Only aligned allocation depends on
    /// its arguments: alignments above the minimum may need a free prefix.
    pub(crate) const fn plan(self, shift: u32) -> Units {
        match self {
            AllocatorOp::Create => CREATE,
            AllocatorOp::Destroy => DESTROY,
            AllocatorOp::Alloc => ALLOC,
            AllocatorOp::AllocAligned if shift <= ALLOC_SHIFT_MIN => ALLOC,
            AllocatorOp::AllocAligned => ALLOC_ALIGNED,
            AllocatorOp::Free | AllocatorOp::FreeAligned => FREE,
        }
    }
}
