//! Chunk headers.
//!
//! Every chunk of the allocator space starts with a fixed header of
//! [`HEADER_WORDS`] words, immediately followed by the payload:
//!
//! ```text
//!  0 guard0     | 4 free_prev  | 8 flags
//!  1 prev       | 5 free_next  | 9 guard1    <- payload follows
//!  2 next       | 6 free magic |
//!  3 link magic | 7 size       |
//! ```
//!
//! `prev`/`next` link all chunks of the space in address order,
//! `free_prev`/`free_next` link free chunks into their free-list bucket.
//! Links are segment offsets of chunk headers, zero meaning none. `size`
//! includes the header. The guards bracket the header and are verified on
//! every load.

use thiserror::Error;

use crate::credit::Unit;
use crate::ptr_utils::WORD_SIZE;
use crate::tx::Capture;
use crate::{Segment, ZoneType};

pub(crate) const HEADER_WORDS: u64 = 10;
/// Size of a chunk header.
pub const HEADER_SIZE: u64 = HEADER_WORDS * WORD_SIZE;
/// The smallest chunk: a header and one word of payload.
pub(crate) const MIN_CHUNK_SIZE: u64 = HEADER_SIZE + WORD_SIZE;

const GUARD0: u64 = 0x6368_756e_6b30_cafe;
const GUARD1: u64 = 0xfeed_0001_6368_756e;
const LINK_MAGIC: u64 = 0x6c69_6e6b_0000_a110;
const FREE_MAGIC: u64 = 0x6672_6565_0000_a110;

const W_GUARD0: u64 = 0;
const W_PREV: u64 = 1;
const W_NEXT: u64 = 2;
const W_LINK_MAGIC: u64 = 3;
const W_FREE_PREV: u64 = 4;
const W_FREE_NEXT: u64 = 5;
const W_FREE_MAGIC: u64 = 6;
const W_SIZE: u64 = 7;
const W_FLAGS: u64 = 8;
const W_GUARD1: u64 = 9;

const FLAG_FREE: u64 = 1;
const FLAG_ZONE_SHIFT: u32 = 8;
const FLAG_CHUNK_ALIGN: u64 = 1 << 16;
const FLAG_ALIGN_SHIFT: u32 = 32;

/// Damaged chunk metadata.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Corruption {
    #[error("chunk {chunk:#x}: {field} is {found:#x}, expected {expected:#x}")]
    Guard { chunk: u64, field: &'static str, found: u64, expected: u64 },

    #[error("chunk {chunk:#x}: header outside the segment")]
    OutOfBounds { chunk: u64 },

    #[error("chunk {chunk:#x}: invalid flags {flags:#x}")]
    Flags { chunk: u64, flags: u64 },
}

/// A chunk, identified by the segment offset of its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Chunk(pub(crate) u64);

/// Decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkHeader {
    pub(crate) prev: Option<Chunk>,
    pub(crate) next: Option<Chunk>,
    pub(crate) free_prev: Option<Chunk>,
    pub(crate) free_next: Option<Chunk>,
    pub(crate) size: u64,
    pub(crate) free: bool,
    pub(crate) zone: ZoneType,
    /// Whether the header rather than the payload was aligned.
    pub(crate) chunk_align: bool,
    /// Alignment shift requested at allocation.
    pub(crate) align_shift: u32,
}

impl ChunkHeader {
    pub(crate) fn new_free(size: u64, zone: ZoneType) -> Self {
        Self {
            prev: None,
            next: None,
            free_prev: None,
            free_next: None,
            size,
            free: true,
            zone,
            chunk_align: false,
            align_shift: 0,
        }
    }

    pub(crate) fn flags(&self) -> u64 {
        (self.free as u64)
            | (self.zone.index() as u64) << FLAG_ZONE_SHIFT
            | (if self.chunk_align { FLAG_CHUNK_ALIGN } else { 0 })
            | (self.align_shift as u64) << FLAG_ALIGN_SHIFT
    }

    fn words(&self) -> [u64; HEADER_WORDS as usize] {
        [
            GUARD0,
            raw(self.prev),
            raw(self.next),
            LINK_MAGIC,
            raw(self.free_prev),
            raw(self.free_next),
            FREE_MAGIC,
            self.size,
            self.flags(),
            GUARD1,
        ]
    }
}

#[inline]
fn raw(link: Option<Chunk>) -> u64 {
    link.map_or(0, |c| c.0)
}

#[inline]
fn link(raw: u64) -> Option<Chunk> {
    (raw != 0).then_some(Chunk(raw))
}

impl Chunk {
    #[inline]
    fn word(self, w: u64) -> u64 {
        self.0 + w * WORD_SIZE
    }

    /// Offset of the first payload byte.
    #[inline]
    pub(crate) fn payload(self) -> u64 {
        self.0 + HEADER_SIZE
    }

    #[inline]
    pub(crate) fn from_payload(offset: u64) -> Self {
        Self(offset - HEADER_SIZE)
    }

    /// One past the last byte of the chunk.
    #[inline]
    pub(crate) fn acme(self, header: &ChunkHeader) -> u64 {
        self.0 + header.size
    }

    /// Loads and verifies the header.
    pub(crate) fn try_load(self, seg: &Segment) -> Result<ChunkHeader, Corruption> {
        if self.0 % WORD_SIZE != 0
            || self.0.checked_add(HEADER_SIZE).map_or(true, |acme| acme > seg.size())
        {
            return Err(Corruption::OutOfBounds { chunk: self.0 });
        }

        let check = |w: u64, field: &'static str, expected: u64| {
            let found = seg.read_u64(self.word(w));
            if found == expected {
                Ok(())
            } else {
                Err(Corruption::Guard { chunk: self.0, field, found, expected })
            }
        };

        check(W_GUARD0, "guard0", GUARD0)?;
        check(W_GUARD1, "guard1", GUARD1)?;
        check(W_LINK_MAGIC, "link magic", LINK_MAGIC)?;
        check(W_FREE_MAGIC, "free-link magic", FREE_MAGIC)?;

        let flags = seg.read_u64(self.word(W_FLAGS));
        let zone = ZoneType::from_index(flags >> FLAG_ZONE_SHIFT & 0xff)
            .ok_or(Corruption::Flags { chunk: self.0, flags })?;

        Ok(ChunkHeader {
            prev: link(seg.read_u64(self.word(W_PREV))),
            next: link(seg.read_u64(self.word(W_NEXT))),
            free_prev: link(seg.read_u64(self.word(W_FREE_PREV))),
            free_next: link(seg.read_u64(self.word(W_FREE_NEXT))),
            size: seg.read_u64(self.word(W_SIZE)),
            free: flags & FLAG_FREE != 0,
            zone,
            chunk_align: flags & FLAG_CHUNK_ALIGN != 0,
            align_shift: (flags >> FLAG_ALIGN_SHIFT) as u32,
        })
    }

    /// Loads and verifies the header.
    ///
    /// ### Panics
    /// Panics if the header is corrupted.
    #[track_caller]
    pub(crate) fn load(self, seg: &Segment) -> ChunkHeader {
        match self.try_load(seg) {
            Ok(header) => header,
            Err(err) => {
                tracing::error!(%err, "chunk header corrupted");
                panic!("allocator metadata corrupted: {}", err)
            }
        }
    }

    pub(crate) fn store(self, w: &mut Capture<'_>, header: &ChunkHeader) {
        w.write(Unit::ChunkHeader, self.0, &header.words());
    }

    pub(crate) fn set_prev(self, w: &mut Capture<'_>, prev: Option<Chunk>) {
        w.write_word(self.word(W_PREV), raw(prev));
    }

    pub(crate) fn set_next(self, w: &mut Capture<'_>, next: Option<Chunk>) {
        w.write_word(self.word(W_NEXT), raw(next));
    }

    pub(crate) fn set_free_links(self, w: &mut Capture<'_>, prev: Option<Chunk>, next: Option<Chunk>) {
        w.write(Unit::FreeLinks, self.word(W_FREE_PREV), &[raw(prev), raw(next)]);
    }

    pub(crate) fn set_free_prev(self, w: &mut Capture<'_>, prev: Option<Chunk>) {
        w.write_word(self.word(W_FREE_PREV), raw(prev));
    }

    pub(crate) fn set_free_next(self, w: &mut Capture<'_>, next: Option<Chunk>) {
        w.write_word(self.word(W_FREE_NEXT), raw(next));
    }

    pub(crate) fn set_size(self, w: &mut Capture<'_>, size: u64) {
        w.write_word(self.word(W_SIZE), size);
    }

    pub(crate) fn set_flags(self, w: &mut Capture<'_>, header: &ChunkHeader) {
        w.write_word(self.word(W_FLAGS), header.flags());
    }
}

/// The physically following chunk and its header, if any.
///
/// ### Panics
/// Panics if the next link does not point right past `chunk`.
#[track_caller]
pub(crate) fn chunk_after(seg: &Segment, chunk: Chunk, header: &ChunkHeader) -> Option<(Chunk, ChunkHeader)> {
    let next = header.next?;
    assert!(next.0 == chunk.acme(header), "chunk {:#x} is not followed by {:#x}", chunk.0, next.0);
    Some((next, next.load(seg)))
}

/// The physically preceding chunk and its header, if any.
///
/// ### Panics
/// Panics if the previous link does not end right at `chunk`.
#[track_caller]
pub(crate) fn chunk_before(seg: &Segment, chunk: Chunk, header: &ChunkHeader) -> Option<(Chunk, ChunkHeader)> {
    let prev = header.prev?;
    let prev_header = prev.load(seg);
    assert!(prev.acme(&prev_header) == chunk.0, "chunk {:#x} is not preceded by {:#x}", chunk.0, prev.0);
    Some((prev, prev_header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credit::Units;
    use crate::{Segment, Transaction, Tx, TxCredit};

    fn open_tx() -> Tx {
        let mut tx = Tx::new();
        tx.prep(TxCredit::new(64, 0x1000));
        tx.open();
        tx
    }

    #[test]
    fn chunk_store_load_test() {
        let mut seg = Segment::new(0x4000).unwrap();
        let mut tx = open_tx();

        let a = Chunk(0x1000);
        let b = Chunk(0x1100);

        let mut ha = ChunkHeader::new_free(0x100, ZoneType::Normal);
        ha.next = Some(b);
        let mut hb = ChunkHeader::new_free(0x200, ZoneType::Repair);
        hb.prev = Some(a);
        hb.free = false;
        hb.chunk_align = true;
        hb.align_shift = 12;

        let mut w = Capture::new(&mut seg, &mut tx);
        a.store(&mut w, &ha);
        b.store(&mut w, &hb);
        w.finish(Units::NONE.with(Unit::ChunkHeader, 2));

        assert!(tx.is_open());
        assert!(a.load(&seg) == ha);
        assert!(b.load(&seg) == hb);

        assert!(chunk_after(&seg, a, &ha) == Some((b, hb)));
        assert!(chunk_before(&seg, b, &hb) == Some((a, ha)));
        assert!(chunk_before(&seg, a, &ha).is_none());
        assert!(Chunk::from_payload(b.payload()) == b);
    }

    #[test]
    fn chunk_field_update_test() {
        let mut seg = Segment::new(0x4000).unwrap();
        let mut tx = open_tx();
        let c = Chunk(0x2000);

        let mut w = Capture::new(&mut seg, &mut tx);
        let mut header = ChunkHeader::new_free(0x400, ZoneType::Normal);
        c.store(&mut w, &header);

        c.set_size(&mut w, 0x180);
        c.set_free_links(&mut w, Some(Chunk(0x1000)), Some(Chunk(0x3000)));
        c.set_free_next(&mut w, None);
        header.free = false;
        c.set_flags(&mut w, &header);
        w.finish(Units::NONE.with(Unit::ChunkHeader, 1).with(Unit::FreeLinks, 1).with(Unit::Word, 3));

        let loaded = c.load(&seg);
        assert!(loaded.size == 0x180);
        assert!(!loaded.free);
        assert!(loaded.free_prev == Some(Chunk(0x1000)));
        assert!(loaded.free_next.is_none());
    }

    #[test]
    fn chunk_corruption_test() {
        let mut seg = Segment::new(0x4000).unwrap();
        let mut tx = open_tx();
        let c = Chunk(0x1000);

        let mut w = Capture::new(&mut seg, &mut tx);
        c.store(&mut w, &ChunkHeader::new_free(0x100, ZoneType::Normal));
        drop(w);

        seg.write_u64(c.0 + W_GUARD1 * WORD_SIZE, GUARD1 ^ 1 << 56);
        assert!(matches!(c.try_load(&seg), Err(Corruption::Guard { field: "guard1", .. })));

        assert!(matches!(Chunk(0x3ff8).try_load(&seg), Err(Corruption::OutOfBounds { .. })));
        assert!(matches!(Chunk(0x2000).try_load(&seg), Err(Corruption::Guard { field: "guard0", .. })));
    }

    #[test]
    #[should_panic(expected = "is not followed by")]
    fn chunk_after_checks_adjacency_test() {
        let mut seg = Segment::new(0x4000).unwrap();
        let mut tx = open_tx();
        let a = Chunk(0x1000);

        let mut header = ChunkHeader::new_free(0x100, ZoneType::Normal);
        header.next = Some(Chunk(0x1200));

        let mut w = Capture::new(&mut seg, &mut tx);
        a.store(&mut w, &header);
        drop(w);

        chunk_after(&seg, a, &header);
    }

    #[test]
    #[should_panic(expected = "corrupted")]
    fn chunk_load_panics_on_corruption_test() {
        let seg = Segment::new(0x4000).unwrap();
        Chunk(0x1000).load(&seg);
    }
}
