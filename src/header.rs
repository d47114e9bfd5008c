//! Allocator header layout.
//!
//! The header sits at [`HEADER_OFFSET`] inside the reserved area of the
//! segment:
//!
//! ```text
//! magic | space base | space size | first chunk | last chunk
//! zone records (size, free) x ZONE_NR
//! persisted statistics
//! free-list bucket heads x ZONE_NR
//! ```

use crate::fl::FL_NR;
use crate::stats::{AllocatorStats, STATS_WORDS};
use crate::tx::Capture;
use crate::credit::Unit;
use crate::{Segment, ZoneStats, ZoneType, SEGMENT_RESERVED, ZONE_NR};

pub(crate) const HEADER_OFFSET: u64 = 0x40;
pub(crate) const ALLOCATOR_MAGIC: u64 = 0x7365_6761_6c6c_6f63;

pub(crate) const MAGIC: u64 = HEADER_OFFSET;
pub(crate) const SPACE_BASE: u64 = HEADER_OFFSET + 8;
pub(crate) const SPACE_SIZE: u64 = HEADER_OFFSET + 16;
pub(crate) const CHUNKS_FIRST: u64 = HEADER_OFFSET + 24;
pub(crate) const CHUNKS_LAST: u64 = HEADER_OFFSET + 32;
const ZONES: u64 = HEADER_OFFSET + 40;

/// Words written at once when the header is formatted.
pub(crate) const FIXED_WORDS: usize = 5 + 2 * ZONE_NR;

const STATS: u64 = HEADER_OFFSET + FIXED_WORDS as u64 * 8;
const FL_HEADS: u64 = STATS + STATS_WORDS as u64 * 8;
const HEADER_ACME: u64 = FL_HEADS + (ZONE_NR * FL_NR) as u64 * 8;

const _: () = assert!(HEADER_ACME <= SEGMENT_RESERVED);

pub(crate) const fn zone_record(zone: ZoneType) -> u64 {
    ZONES + zone.index() as u64 * 16
}

/// Segment offset of the free-list bucket heads of `zone`.
pub(crate) const fn fl_heads(zone: ZoneType) -> u64 {
    FL_HEADS + (zone.index() * FL_NR) as u64 * 8
}

pub(crate) fn format(w: &mut Capture<'_>, space_base: u64, space_size: u64, zones: &[ZoneStats; ZONE_NR]) {
    let mut words = [0; FIXED_WORDS];
    words[..5].copy_from_slice(&[ALLOCATOR_MAGIC, space_base, space_size, 0, 0]);
    for (z, zone) in zones.iter().enumerate() {
        words[5 + 2 * z] = zone.size;
        words[6 + 2 * z] = zone.free;
    }

    w.write(Unit::AllocatorHeader, HEADER_OFFSET, &words);
}

pub(crate) fn read_zone(seg: &Segment, zone: ZoneType) -> ZoneStats {
    ZoneStats { size: seg.read_u64(zone_record(zone)), free: seg.read_u64(zone_record(zone) + 8) }
}

pub(crate) fn write_zone(w: &mut Capture<'_>, zone: ZoneType, stats: &ZoneStats) {
    w.write(Unit::Zone, zone_record(zone), &[stats.size, stats.free]);
}

pub(crate) fn read_stats(seg: &Segment) -> AllocatorStats {
    let mut words = [0; STATS_WORDS];
    for (i, word) in words.iter_mut().enumerate() {
        *word = seg.read_u64(STATS + i as u64 * 8);
    }
    AllocatorStats::from_words(&words)
}

pub(crate) fn write_stats(w: &mut Capture<'_>, stats: &AllocatorStats) {
    w.write(Unit::Stats, STATS, &stats.to_words());
}
