//! The allocator engine.
//!
//! Chunks tile the allocator space in address order and are linked into the
//! all-chunks list; free chunks are additionally listed in the free-list
//! index of their zone. Allocation takes the first suitable listed chunk,
//! carves the aligned allocation out of it and relists what remains. Freeing
//! eagerly merges the chunk with free neighbours of the same zone, so no two
//! adjacent chunks of a zone are ever both free.
//!
//! Every mutation goes through a [`Capture`] bound to the caller's
//! transaction, and every operation checks what it captured against the
//! same plan its credit is derived from.

mod sync;
#[cfg(test)]
mod tests;

pub use sync::Allocator;

use std::collections::BTreeSet;

use core::ptr::NonNull;

use crate::chunk::{chunk_after, chunk_before, Chunk, ChunkHeader, HEADER_SIZE, MIN_CHUNK_SIZE};
use crate::credit::{self, AllocatorOp, Units};
use crate::fl::{bucket_of, FreeLists, FL_NR};
use crate::header;
use crate::ptr_utils::{align_down, checked_align_up, is_aligned, WORD_SIZE};
use crate::tx::Capture;
use crate::{
    AllocatorConfig, AllocatorStats, Error, Segment, Span, Transaction, TxCredit, ZoneMask,
    ZoneStats, ZoneType, ALLOC_SHIFT_MAX, ALLOC_SHIFT_MIN, SEGMENT_ALIGN, SEGMENT_RESERVED,
    ZONE_NR,
};

/// The allocator proper, without a lock.
///
/// Owns the segment it allocates from. Wrap it in an [`Allocator`] to share
/// it between threads.
pub struct AllocatorCore {
    seg: Segment,
    space: Span,
    /// Zone spans, indexed by `ZoneType::index`.
    zones: [Span; ZONE_NR],
    fls: [FreeLists; ZONE_NR],
    stats: AllocatorStats,
}

impl core::fmt::Debug for AllocatorCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AllocatorCore")
            .field("segment", &self.seg)
            .field("space", &format_args!("{}", self.space))
            .field("normal", &format_args!("{}", self.zones[ZoneType::Normal.index()]))
            .field("repair", &format_args!("{}", self.zones[ZoneType::Repair.index()]))
            .field("stats", &self.stats)
            .finish()
    }
}

/// Where an allocation lands inside a free chunk.
#[derive(Debug, Clone, Copy)]
struct Placement {
    at: Chunk,
    /// Size of the allocated chunk.
    size: u64,
    /// Whether the rest of the free chunk is split off as a new free chunk.
    split: bool,
}

/// Fits an allocation of `payload` bytes aligned to `1 << shift` into the
/// free chunk `chunk`, if possible. Alignment applies to the absolute
/// address of the payload, or of the header with `chunk_align`.
///
/// A free prefix in front of the allocation must be able to stand as a chunk
/// of its own, so too small a gap moves the allocation further up. A suffix
/// too small to be a chunk is granted to the allocation.
fn place(
    addr: u64,
    chunk: Chunk,
    header: &ChunkHeader,
    payload: u64,
    shift: u32,
    chunk_align: bool,
) -> Option<Placement> {
    let align = 1u64 << shift;
    let target = |from: u64| -> Option<u64> {
        if chunk_align {
            Some(checked_align_up(addr.checked_add(from)?, align)? - addr)
        } else {
            let payload_addr = addr.checked_add(from + HEADER_SIZE)?;
            Some(checked_align_up(payload_addr, align)? - addr - HEADER_SIZE)
        }
    };

    let mut at = target(chunk.0)?;
    if at != chunk.0 && at - chunk.0 < MIN_CHUNK_SIZE {
        at = target(chunk.0 + MIN_CHUNK_SIZE)?;
    }

    let acme = chunk.acme(header);
    let end = at.checked_add(HEADER_SIZE + payload)?;
    if end > acme {
        return None;
    }

    let split = acme - end >= MIN_CHUNK_SIZE;
    Some(Placement { at: Chunk(at), size: if split { end - at } else { acme - at }, split })
}

/// Writes a fresh header at `chunk` and links it between `prev` and `next`.
fn chunk_new(
    w: &mut Capture<'_>,
    chunk: Chunk,
    mut fresh: ChunkHeader,
    prev: Option<Chunk>,
    next: Option<Chunk>,
) {
    fresh.prev = prev;
    fresh.next = next;
    chunk.store(w, &fresh);

    match prev {
        Some(prev) => prev.set_next(w, Some(chunk)),
        None => w.write_word(header::CHUNKS_FIRST, chunk.0),
    }
    match next {
        Some(next) => next.set_prev(w, Some(chunk)),
        None => w.write_word(header::CHUNKS_LAST, chunk.0),
    }
}

/// Unlinks the chunk described by `removed` from the all-chunks list.
fn chunk_remove(w: &mut Capture<'_>, removed: &ChunkHeader) {
    let raw = |link: Option<Chunk>| link.map_or(0, |c| c.0);

    match removed.prev {
        Some(prev) => prev.set_next(w, removed.next),
        None => w.write_word(header::CHUNKS_FIRST, raw(removed.next)),
    }
    match removed.next {
        Some(next) => next.set_prev(w, removed.prev),
        None => w.write_word(header::CHUNKS_LAST, raw(removed.prev)),
    }
}

/// Carves `placement` out of the listed free chunk `chunk`.
///
/// Returns the change in the number of chunks.
fn carve(
    w: &mut Capture<'_>,
    fl: &mut FreeLists,
    chunk: Chunk,
    header: &ChunkHeader,
    placement: Placement,
    shift: u32,
    chunk_align: bool,
) -> i64 {
    let Placement { at, size, split } = placement;
    let acme = chunk.acme(header);
    let next = header.next;

    let used = ChunkHeader {
        size,
        free: false,
        chunk_align,
        align_shift: shift,
        ..ChunkHeader::new_free(size, header.zone)
    };

    fl.del(w, chunk);

    let mut created = 0;
    if at != chunk {
        chunk.set_size(w, at.0 - chunk.0);
        fl.add(w, chunk);
        chunk_new(w, at, used, Some(chunk), next);
        created += 1;
    } else {
        chunk.set_size(w, size);
        chunk.set_flags(w, &used);
    }

    if split {
        let rest = Chunk(at.0 + size);
        chunk_new(w, rest, ChunkHeader::new_free(acme - rest.0, header.zone), Some(at), next);
        fl.add(w, rest);
        created += 1;
    }

    created
}

/// Returns the used chunk `chunk` to the free lists, merging it with free
/// neighbours of its zone.
///
/// Returns the number of chunks merged away.
fn release(w: &mut Capture<'_>, fl: &mut FreeLists, chunk: Chunk, header: &ChunkHeader) -> i64 {
    let freed = ChunkHeader { free: true, chunk_align: false, align_shift: 0, ..*header };
    chunk.set_flags(w, &freed);

    let mut size = header.size;
    let mut merged = 0;

    if let Some((next, next_header)) = chunk_after(w.seg(), chunk, header) {
        if next_header.free && next_header.zone == header.zone {
            fl.del(w, next);
            chunk_remove(w, &next_header);
            size += next_header.size;
            merged += 1;
        }
    }

    match chunk_before(w.seg(), chunk, header) {
        Some((prev, prev_header)) if prev_header.free && prev_header.zone == header.zone => {
            fl.del(w, prev);
            let current = chunk.load(w.seg());
            chunk_remove(w, &current);
            prev.set_size(w, prev_header.size + size);
            fl.add(w, prev);
            merged += 1;
        }
        _ => {
            chunk.set_size(w, size);
            fl.add(w, chunk);
        }
    }

    merged
}

impl AllocatorCore {
    /// The allocator space of `seg`: everything above the reserved area.
    fn space_of(seg: &Segment) -> Result<Span, Error> {
        let size = align_down(seg.size().saturating_sub(SEGMENT_RESERVED), WORD_SIZE);

        if size < MIN_CHUNK_SIZE {
            return Err(Error::SegmentTooSmall {
                size: seg.size(),
                min: SEGMENT_RESERVED + MIN_CHUNK_SIZE,
            });
        }

        Ok(Span::from_base_size(SEGMENT_RESERVED, size))
    }

    /// Formats an allocator in `segment` and binds to it.
    ///
    /// Writes the allocator header, one free-list index per zone and one
    /// free chunk spanning each non-empty zone, all captured into `tx`, which
    /// must hold the credit of [`AllocatorOp::Create`].
    ///
    /// Fails without touching the segment if the segment or the zone layout
    /// is unusable.
    pub fn create(
        mut segment: Segment,
        tx: &mut dyn Transaction,
        config: &AllocatorConfig,
    ) -> Result<Self, Error> {
        let space = Self::space_of(&segment)?;
        let spans = config.layout(space)?;
        let zones = spans.map(|span| ZoneStats { size: span.size(), free: span.size() });

        let stats = AllocatorStats {
            space_total: space.size(),
            space_free: space.size(),
            chunks_nr: spans.iter().filter(|span| !span.is_empty()).count() as u64,
            free_chunks_nr: spans.iter().filter(|span| !span.is_empty()).count() as u64,
            zones,
            ..Default::default()
        };

        let mut w = Capture::new(&mut segment, tx);
        header::format(&mut w, space.base, space.size(), &zones);
        header::write_stats(&mut w, &stats);

        let mut last = None;
        for zone in ZoneType::LAYOUT {
            let mut fl = FreeLists::create(&mut w, header::fl_heads(zone));
            let span = spans[zone.index()];

            if !span.is_empty() {
                let chunk = Chunk(span.base);
                chunk_new(&mut w, chunk, ChunkHeader::new_free(span.size(), zone), last, None);
                fl.add(&mut w, chunk);
                last = Some(chunk);
            }
        }
        w.finish(credit::CREATE);

        let (normal, repair) = (spans[ZoneType::Normal.index()], spans[ZoneType::Repair.index()]);
        tracing::debug!(space = %space, normal = %normal, repair = %repair, "allocator created");

        Self::init(segment)
    }

    /// Binds to the allocator previously created in `segment`.
    ///
    /// Validates the header, rebuilds the volatile free-list state and
    /// reconciles statistics with the chunk list.
    pub fn init(segment: Segment) -> Result<Self, Error> {
        let magic = segment.read_u64(header::MAGIC);
        if magic != header::ALLOCATOR_MAGIC {
            return Err(Error::BadMagic { found: magic });
        }

        let space = Self::space_of(&segment)?;
        if segment.read_u64(header::SPACE_BASE) != space.base
            || segment.read_u64(header::SPACE_SIZE) != space.size()
        {
            return Err(Error::BadGeometry { cause: "allocator space does not match the segment" });
        }

        let records = ZoneType::ALL.map(|zone| header::read_zone(&segment, zone));
        if records.iter().any(|z| z.free > z.size || !is_aligned(z.size, WORD_SIZE))
            || records.iter().map(|z| z.size).sum::<u64>() != space.size()
        {
            return Err(Error::BadGeometry { cause: "zone records do not tile the allocator space" });
        }

        let mut zones = [Span::empty(); ZONE_NR];
        let mut base = space.base;
        for zone in ZoneType::LAYOUT {
            zones[zone.index()] = Span::from_base_size(base, records[zone.index()].size);
            base += records[zone.index()].size;
        }

        let fls = ZoneType::ALL.map(|zone| FreeLists::open(&segment, header::fl_heads(zone)));

        let mut chunks_nr = 0;
        let mut free_chunks_nr = 0;
        let mut cursor = Some(segment.read_u64(header::CHUNKS_FIRST)).filter(|&raw| raw != 0).map(Chunk);
        while let Some(chunk) = cursor {
            if chunks_nr > space.size() / MIN_CHUNK_SIZE {
                return Err(Error::BadGeometry { cause: "chunk list does not terminate" });
            }

            let header = chunk.try_load(&segment)?;
            chunks_nr += 1;
            free_chunks_nr += header.free as u64;
            cursor = header.next;
        }

        let space_free = records.iter().map(|z| z.free).sum::<u64>();
        let stats = AllocatorStats {
            space_total: space.size(),
            space_used: space.size() - space_free,
            space_free,
            chunks_nr,
            free_chunks_nr,
            zones: records,
            ..header::read_stats(&segment)
        };

        tracing::debug!(space = %space, chunks_nr, free_chunks_nr, space_free, "allocator bound");

        Ok(Self { seg: segment, space, zones, fls, stats })
    }

    /// Unbinds from the segment without touching it.
    pub fn fini(self) -> Segment {
        tracing::debug!(space = %self.space, "allocator unbound");
        self.seg
    }

    /// Dismantles the allocator: unlists the zone chunks from the free lists
    /// and the all-chunks list, destroys the free-list indices and clears
    /// the header magic, all captured into `tx`,
    /// which must hold the credit of [`AllocatorOp::Destroy`].
    ///
    /// ### Panics
    /// Panics if any allocation is still live.
    pub fn destroy(mut self, tx: &mut dyn Transaction) -> Segment {
        let mut w = Capture::new(&mut self.seg, tx);

        for zone in ZoneType::LAYOUT {
            let z = zone.index();
            let stats = self.stats.zones[z];
            assert!(stats.free == stats.size, "destroying an allocator with live allocations in the {:?} zone", zone);

            let mut fl = self.fls[z];
            if !self.zones[z].is_empty() {
                fl.del(&mut w, Chunk(self.zones[z].base));
            }
            fl.destroy(&mut w);
        }

        w.write_word(header::CHUNKS_FIRST, 0);
        w.write_word(header::CHUNKS_LAST, 0);
        w.write_word(header::MAGIC, 0);
        w.finish(credit::DESTROY);

        tracing::debug!(space = %self.space, "allocator destroyed");

        self.seg
    }

    /// Worst-case capture cost of `op`.
    ///
    /// Only metadata is ever captured, so `size` does not affect the result;
    /// `shift` does for [`AllocatorOp::AllocAligned`].
    pub fn credit(op: AllocatorOp, size: u64, shift: u32) -> TxCredit {
        let mut credit = TxCredit::ZERO;
        Self::credit_add(op, size, shift, &mut credit);
        credit
    }

    /// Adds the worst-case capture cost of `op` to `accum`.
    pub fn credit_add(op: AllocatorOp, _size: u64, shift: u32, accum: &mut TxCredit) {
        *accum += op.plan(shift).credit();
    }

    /// Allocates `size` bytes from any zone of `zones`.
    ///
    /// Returns `None` if no free chunk can hold the allocation. `tx` must be
    /// open and hold the credit of [`AllocatorOp::Alloc`].
    pub fn alloc(&mut self, tx: &mut dyn Transaction, size: u64, zones: ZoneMask) -> Option<NonNull<u8>> {
        self.alloc_chunk(tx, size, ALLOC_SHIFT_MIN, zones, false, credit::ALLOC)
    }

    /// Allocates `size` bytes aligned to `1 << shift` from any zone of
    /// `zones`. With `chunk_align`, the chunk header rather than the returned
    /// payload is aligned.
    ///
    /// Returns `None` if no free chunk can hold the allocation. `tx` must be
    /// open and hold the credit of [`AllocatorOp::AllocAligned`] for `shift`.
    ///
    /// ### Panics
    /// Panics if `shift` exceeds [`ALLOC_SHIFT_MAX`].
    pub fn alloc_aligned(
        &mut self,
        tx: &mut dyn Transaction,
        size: u64,
        shift: u32,
        zones: ZoneMask,
        chunk_align: bool,
    ) -> Option<NonNull<u8>> {
        assert!(shift <= ALLOC_SHIFT_MAX, "alignment shift {} above {}", shift, ALLOC_SHIFT_MAX);

        let plan = AllocatorOp::AllocAligned.plan(shift);
        self.alloc_chunk(tx, size, shift.max(ALLOC_SHIFT_MIN), zones, chunk_align, plan)
    }

    fn alloc_chunk(
        &mut self,
        tx: &mut dyn Transaction,
        size: u64,
        shift: u32,
        zones: ZoneMask,
        chunk_align: bool,
        plan: Units,
    ) -> Option<NonNull<u8>> {
        let addr = self.seg.addr();
        let mut w = Capture::new(&mut self.seg, tx);

        let Some((payload, required)) = checked_align_up(size.max(1), WORD_SIZE)
            .and_then(|payload| Some((payload, payload.checked_add(HEADER_SIZE)?)))
        else {
            tracing::debug!(size, "allocation size out of range");
            return None;
        };

        let mut found = None;
        for zone in ZoneType::SEARCH.into_iter().filter(|&zone| zones.contains(zone)) {
            found = self.fls[zone.index()]
                .pick(w.seg(), required, |chunk, header| {
                    place(addr, chunk, header, payload, shift, chunk_align).map(|p| (*header, p))
                })
                .map(|(chunk, (free_header, placement))| (zone, chunk, free_header, placement));

            if found.is_some() {
                break;
            }
        }

        let Some((zone, chunk, free_header, placement)) = found else {
            tracing::debug!(size, shift, ?zones, "out of space");
            return None;
        };

        let z = zone.index();
        let created = carve(&mut w, &mut self.fls[z], chunk, &free_header, placement, shift, chunk_align);

        let mut zone_stats = self.stats.zones[z];
        zone_stats.free -= placement.size;
        header::write_zone(&mut w, zone, &zone_stats);

        w.finish(plan);

        self.stats.account_alloc(z, placement.size, created);
        self.scan_for_errors();

        tracing::trace!(
            size,
            shift,
            ?zone,
            chunk = placement.at.0,
            chunk_size = placement.size,
            "allocated"
        );

        Some(self.seg.ptr_at(placement.at.payload()))
    }

    /// Frees an allocation made by [`alloc`](Self::alloc) or
    /// [`alloc_aligned`](Self::alloc_aligned). `tx` must be open and hold the
    /// credit of [`AllocatorOp::Free`].
    ///
    /// ### Panics
    /// Panics if `ptr` is not a live allocation of this allocator.
    #[track_caller]
    pub fn free(&mut self, tx: &mut dyn Transaction, ptr: NonNull<u8>) {
        self.free_chunk(tx, ptr, false);
    }

    /// Frees an allocation made by [`alloc_aligned`](Self::alloc_aligned),
    /// also checking it against the alignment recorded at allocation. `tx`
    /// must be open and hold the credit of [`AllocatorOp::FreeAligned`].
    ///
    /// ### Panics
    /// Panics if `ptr` is not a live allocation of this allocator.
    #[track_caller]
    pub fn free_aligned(&mut self, tx: &mut dyn Transaction, ptr: NonNull<u8>) {
        self.free_chunk(tx, ptr, true);
    }

    #[track_caller]
    fn free_chunk(&mut self, tx: &mut dyn Transaction, ptr: NonNull<u8>, aligned: bool) {
        let chunk = self.chunk_of(ptr);
        let used = chunk.load(&self.seg);
        assert!(!used.free, "double free of chunk {:#x}", chunk.0);

        // larger alignments do not survive relocating the segment
        if aligned && used.align_shift <= SEGMENT_ALIGN.trailing_zeros() {
            let at = if used.chunk_align { chunk.0 } else { chunk.payload() };
            assert!(
                is_aligned(self.seg.addr() + at, 1 << used.align_shift),
                "chunk {:#x} does not satisfy its recorded alignment",
                chunk.0
            );
        }

        let z = used.zone.index();
        let mut w = Capture::new(&mut self.seg, tx);

        let merged = release(&mut w, &mut self.fls[z], chunk, &used);

        let mut zone_stats = self.stats.zones[z];
        zone_stats.free += used.size;
        header::write_zone(&mut w, used.zone, &zone_stats);

        w.finish(credit::FREE);

        self.stats.account_free(z, used.size, -merged);
        self.scan_for_errors();

        tracing::trace!(chunk = chunk.0, chunk_size = used.size, merged, zone = ?used.zone, "freed");
    }

    #[track_caller]
    fn chunk_of(&self, ptr: NonNull<u8>) -> Chunk {
        match self.seg.offset_of(ptr) {
            Some(offset)
                if offset >= self.space.base + HEADER_SIZE
                    && self.space.contains(offset)
                    && is_aligned(offset, WORD_SIZE) =>
            {
                Chunk::from_payload(offset)
            }
            _ => panic!("{:p} is not an allocation of this allocator", ptr),
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> AllocatorStats {
        self.stats
    }

    /// Capture cost of [`stats_capture`](Self::stats_capture).
    pub fn stats_credit() -> TxCredit {
        credit::STATS.credit()
    }

    /// Persists the current statistics into the allocator header.
    pub fn stats_capture(&mut self, tx: &mut dyn Transaction) {
        let mut w = Capture::new(&mut self.seg, tx);
        header::write_stats(&mut w, &self.stats);
        w.finish(credit::STATS);
    }

    /// Size of the header in front of every allocation.
    pub const fn chunk_header_size() -> u64 {
        HEADER_SIZE
    }

    pub fn segment(&self) -> &Segment {
        &self.seg
    }

    /// The span of segment offsets chunks are carved from.
    pub fn space(&self) -> Span {
        self.space
    }

    pub fn zone_span(&self, zone: ZoneType) -> Span {
        self.zones[zone.index()]
    }

    /// Checks the whole allocator structure. Linear in the number of chunks.
    ///
    /// Returns `false` and logs the first violated property on failure.
    pub fn invariant(&self) -> bool {
        match self.verify() {
            Ok(()) => true,
            Err(violation) => {
                tracing::error!(%violation, "allocator invariant violated");
                false
            }
        }
    }

    fn verify(&self) -> Result<(), String> {
        macro_rules! ensure {
            ($cond:expr, $($arg:tt)+) => {
                if !$cond {
                    return Err(format!($($arg)+));
                }
            };
        }

        let seg = &self.seg;
        let link = |raw: u64| (raw != 0).then_some(Chunk(raw));

        ensure!(seg.read_u64(header::MAGIC) == header::ALLOCATOR_MAGIC, "allocator magic is gone");

        let mut zone_free = [0u64; ZONE_NR];
        let mut free_chunks: [BTreeSet<Chunk>; ZONE_NR] = Default::default();
        let mut chunks_nr = 0u64;
        let mut expected = self.space.base;
        let mut prev: Option<(Chunk, ChunkHeader)> = None;
        let mut cursor = link(seg.read_u64(header::CHUNKS_FIRST));

        while let Some(chunk) = cursor {
            ensure!(chunks_nr <= self.space.size() / MIN_CHUNK_SIZE, "chunk list does not terminate");

            let header = chunk.try_load(seg).map_err(|e| e.to_string())?;
            let z = header.zone.index();

            ensure!(chunk.0 == expected, "chunk {:#x} found where {:#x} was expected", chunk.0, expected);
            ensure!(header.prev == prev.map(|(c, _)| c), "chunk {:#x} has a stale back link", chunk.0);
            ensure!(
                header.size >= MIN_CHUNK_SIZE && is_aligned(header.size, WORD_SIZE),
                "chunk {:#x} has bad size {:#x}",
                chunk.0,
                header.size
            );
            ensure!(
                self.zones[z].contains_span(Span::from_base_size(chunk.0, header.size)),
                "chunk {:#x} of {:#x} bytes is outside its {:?} zone",
                chunk.0,
                header.size,
                header.zone
            );

            if header.free {
                if let Some((prev, prev_header)) = prev {
                    ensure!(
                        !(prev_header.free && prev_header.zone == header.zone),
                        "free chunks {:#x} and {:#x} are adjacent",
                        prev.0,
                        chunk.0
                    );
                }
                zone_free[z] += header.size;
                free_chunks[z].insert(chunk);
            } else if header.align_shift <= SEGMENT_ALIGN.trailing_zeros() {
                // larger alignments do not survive relocating the segment
                let at = if header.chunk_align { chunk.0 } else { chunk.payload() };
                ensure!(
                    is_aligned(seg.addr() + at, 1 << header.align_shift),
                    "chunk {:#x} lost its alignment of 2^{}",
                    chunk.0,
                    header.align_shift
                );
            }

            chunks_nr += 1;
            expected += header.size;
            prev = Some((chunk, header));
            cursor = header.next;
        }

        ensure!(expected == self.space.acme, "chunks end at {:#x}, space ends at {:#x}", expected, self.space.acme);
        ensure!(
            link(seg.read_u64(header::CHUNKS_LAST)) == prev.map(|(c, _)| c),
            "last chunk link is stale"
        );

        for zone in ZoneType::LAYOUT {
            let z = zone.index();
            let record = header::read_zone(seg, zone);

            ensure!(record.size == self.zones[z].size(), "{:?} zone record disagrees with its span", zone);
            ensure!(record == self.stats.zones[z], "{:?} zone record disagrees with statistics", zone);
            ensure!(
                record.free == zone_free[z],
                "{:?} zone counts {:#x} free bytes, its chunks hold {:#x}",
                zone,
                record.free,
                zone_free[z]
            );

            let fl = &self.fls[z];
            let mut listed = 0;

            for b in 0..FL_NR {
                ensure!(
                    fl.is_available(b) == fl.head(seg, b).is_some(),
                    "{:?} zone bucket {} availability is stale",
                    zone,
                    b
                );

                let mut free_prev = None;
                let mut cursor = fl.head(seg, b);
                while let Some(chunk) = cursor {
                    ensure!(
                        free_chunks[z].contains(&chunk) && listed < free_chunks[z].len(),
                        "listed chunk {:#x} is not a free chunk of the {:?} zone",
                        chunk.0,
                        zone
                    );

                    let header = chunk.try_load(seg).map_err(|e| e.to_string())?;
                    ensure!(bucket_of(header.size) == b, "chunk {:#x} is listed in the wrong bucket", chunk.0);
                    ensure!(header.free_prev == free_prev, "chunk {:#x} has a stale free-list back link", chunk.0);

                    listed += 1;
                    free_prev = Some(chunk);
                    cursor = header.free_next;
                }
            }

            ensure!(
                listed == free_chunks[z].len(),
                "{:?} zone lists {} of its {} free chunks",
                zone,
                listed,
                free_chunks[z].len()
            );
        }

        let free_total: u64 = zone_free.iter().sum();
        let free_chunks_nr: u64 = free_chunks.iter().map(|set| set.len() as u64).sum();
        let stats = &self.stats;

        ensure!(stats.space_total == self.space.size(), "space total is stale");
        ensure!(stats.space_free == free_total, "space free is {:#x}, chunks hold {:#x}", stats.space_free, free_total);
        ensure!(stats.space_used == stats.space_total - free_total, "space used is stale");
        ensure!(stats.chunks_nr == chunks_nr, "chunk count is {}, found {}", stats.chunks_nr, chunks_nr);
        ensure!(stats.free_chunks_nr == free_chunks_nr, "free chunk count is {}, found {}", stats.free_chunks_nr, free_chunks_nr);

        Ok(())
    }

    #[cfg(any(test, feature = "invariant-scanning"))]
    #[track_caller]
    fn scan_for_errors(&self) {
        if let Err(violation) = self.verify() {
            panic!("allocator invariant violated: {}", violation);
        }
    }

    #[cfg(not(any(test, feature = "invariant-scanning")))]
    #[inline]
    fn scan_for_errors(&self) {}
}
