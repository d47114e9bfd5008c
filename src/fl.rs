//! Free-list index.
//!
//! Free chunks of one zone are kept in [`FL_NR`] intrusive doubly linked
//! lists, bucketed by `floor(log2(size / FL_STEP))`; everything beyond the
//! top bucket's lower bound lands in the top bucket. The bucket heads live in
//! the allocator header, the links in the chunk headers. A volatile bitfield
//! of non-empty buckets makes finding the next candidate bucket O(1); it is
//! rebuilt from the heads when an allocator is opened.
//!
//! Insertion is at the head of the bucket, so within a bucket the most
//! recently freed chunk is tried first.

use crate::chunk::{Chunk, ChunkHeader};
use crate::credit::{self, Unit, Units};
use crate::tx::Capture;
use crate::{Segment, TxCredit};

/// Size-class step of the free-list buckets.
pub const FL_STEP: u64 = 8;
/// Number of free-list buckets.
pub const FL_NR: usize = 32;

/// Returns the bucket of a free chunk of `size` bytes.
#[inline]
pub(crate) const fn bucket_of(size: u64) -> usize {
    let steps = size / FL_STEP;
    if steps == 0 {
        return 0;
    }

    let bucket = (u64::BITS - 1 - steps.leading_zeros()) as usize;
    if bucket < FL_NR {
        bucket
    } else {
        FL_NR - 1
    }
}

/// Free-list operations that need transaction credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlOp {
    Create,
    Destroy,
    Add,
    Del,
}

impl FlOp {
    pub(crate) const fn plan(self) -> Units {
        match self {
            FlOp::Create => credit::FL_CREATE,
            FlOp::Destroy => credit::FL_DESTROY,
            FlOp::Add => credit::FL_ADD,
            FlOp::Del => credit::FL_DEL,
        }
    }

    /// Adds the worst-case capture cost of the operation to `accum`.
    /// Independent of chunk sizes and list contents.
    pub fn credit(self, accum: &mut TxCredit) {
        *accum += self.plan().credit();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeLists {
    /// Segment offset of the bucket heads.
    heads: u64,
    /// Bit `b` is set iff bucket `b` is non-empty.
    avails: u64,
}

impl FreeLists {
    #[inline]
    fn head_at(&self, bucket: usize) -> u64 {
        debug_assert!(bucket < FL_NR);

        self.heads + bucket as u64 * 8
    }

    /// Formats empty buckets at `heads`.
    pub(crate) fn create(w: &mut Capture<'_>, heads: u64) -> Self {
        w.write(Unit::FlHeads, heads, &[0; FL_NR]);
        Self { heads, avails: 0 }
    }

    /// Binds to existing bucket heads at `heads`.
    pub(crate) fn open(seg: &Segment, heads: u64) -> Self {
        let mut fl = Self { heads, avails: 0 };
        for b in 0..FL_NR {
            if seg.read_u64(fl.head_at(b)) != 0 {
                fl.avails |= 1 << b;
            }
        }
        fl
    }

    /// ### Panics
    /// Panics if any bucket still holds a chunk.
    pub(crate) fn destroy(self, w: &mut Capture<'_>) {
        assert!(self.is_empty(), "destroying a non-empty free-list index");
        w.write(Unit::FlHeads, self.heads, &[0; FL_NR]);
    }

    pub(crate) fn head(&self, seg: &Segment, bucket: usize) -> Option<Chunk> {
        let raw = seg.read_u64(self.head_at(bucket));
        (raw != 0).then_some(Chunk(raw))
    }

    pub(crate) fn is_available(&self, bucket: usize) -> bool {
        self.avails & 1 << bucket != 0
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.avails == 0
    }

    /// Next non-empty bucket at or above `bucket`.
    #[inline]
    fn next_bucket(&self, bucket: usize) -> Option<usize> {
        let masked = self.avails & (u64::MAX << bucket);
        (masked != 0).then(|| masked.trailing_zeros() as usize)
    }

    /// Lists the free chunk `chunk` at the head of its bucket.
    pub(crate) fn add(&mut self, w: &mut Capture<'_>, chunk: Chunk) {
        let header = chunk.load(w.seg());
        assert!(header.free, "listing used chunk {:#x}", chunk.0);

        let b = bucket_of(header.size);
        let head = self.head(w.seg(), b);

        chunk.set_free_links(w, None, head);
        if let Some(head) = head {
            head.set_free_prev(w, Some(chunk));
        }
        w.write_word(self.head_at(b), chunk.0);

        self.avails |= 1 << b;
    }

    /// Unlists `chunk`. The chunk must be listed and keep the size it was
    /// listed with.
    pub(crate) fn del(&mut self, w: &mut Capture<'_>, chunk: Chunk) {
        let header = chunk.load(w.seg());
        let b = bucket_of(header.size);
        debug_assert!(self.is_available(b));

        match header.free_prev {
            Some(prev) => prev.set_free_next(w, header.free_next),
            None => {
                debug_assert!(self.head(w.seg(), b) == Some(chunk));
                w.write_word(self.head_at(b), header.free_next.map_or(0, |c| c.0));
            }
        }
        if let Some(next) = header.free_next {
            next.set_free_prev(w, header.free_prev);
        }

        if header.free_prev.is_none() && header.free_next.is_none() {
            self.avails &= !(1 << b);
        }
    }

    /// Finds the first listed chunk of at least `required` bytes that `fit`
    /// accepts, trying buckets upward from the one `required` falls in and
    /// each bucket in list order.
    pub(crate) fn pick<T>(
        &self,
        seg: &Segment,
        required: u64,
        mut fit: impl FnMut(Chunk, &ChunkHeader) -> Option<T>,
    ) -> Option<(Chunk, T)> {
        let mut b = self.next_bucket(bucket_of(required))?;

        loop {
            for (chunk, header) in self.iter(seg, b) {
                if header.size >= required {
                    if let Some(fitted) = fit(chunk, &header) {
                        return Some((chunk, fitted));
                    }
                }
            }

            b = self.next_bucket(b + 1)?;
        }
    }

    /// Iterates over the chunks of `bucket` in list order.
    pub(crate) fn iter<'s>(&self, seg: &'s Segment, bucket: usize) -> FlIter<'s> {
        FlIter { seg, next: self.head(seg, bucket) }
    }
}

pub(crate) struct FlIter<'s> {
    seg: &'s Segment,
    next: Option<Chunk>,
}

impl Iterator for FlIter<'_> {
    type Item = (Chunk, ChunkHeader);

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.next?;
        let header = chunk.load(self.seg);
        self.next = header.free_next;
        Some((chunk, header))
    }
}
