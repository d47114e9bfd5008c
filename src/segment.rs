//! The memory segment an allocator lives in.
//!
//! A segment is one contiguous, zero-initialised byte range. Its first
//! [`SEGMENT_RESERVED`] bytes hold the segment header (magic and size at
//! offset 0) and the allocator header; everything above is allocator space.
//! All metadata is accessed as 64-bit words through bounds- and
//! alignment-checked accessors, never through references into the segment.

use core::alloc::Layout;
use core::ptr::NonNull;

use allocator_api2::alloc::{Allocator as _, Global};

use crate::ptr_utils::{is_aligned, WORD_SIZE};
use crate::{Error, Span};

/// Alignment of segment memory.
pub const SEGMENT_ALIGN: u64 = 1 << 16;
/// Bytes at the bottom of a segment reserved for the segment and allocator headers.
pub const SEGMENT_RESERVED: u64 = 0x1000;

const SEGMENT_MAGIC: u64 = 0x5345_474d_454e_5431;
const MAGIC_OFFSET: u64 = 0;
const SIZE_OFFSET: u64 = 8;

/// An owned, [`SEGMENT_ALIGN`]-aligned segment of memory.
pub struct Segment {
    base: NonNull<u8>,
    size: u64,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl core::fmt::Debug for Segment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Segment")
            .field("base", &self.base)
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

impl Segment {
    /// Obtains a zeroed segment of `size` bytes and writes its header.
    ///
    /// `size` is rounded down to a multiple of the word size.
    pub fn new(size: u64) -> Result<Self, Error> {
        let size = size & !(WORD_SIZE - 1);

        if size <= SEGMENT_RESERVED {
            return Err(Error::SegmentTooSmall { size, min: SEGMENT_RESERVED + WORD_SIZE });
        }

        let layout = usize::try_from(size)
            .ok()
            .and_then(|s| Layout::from_size_align(s, SEGMENT_ALIGN as usize).ok())
            .ok_or(Error::SegmentAlloc { size })?;

        let memory = Global.allocate_zeroed(layout).map_err(|_| Error::SegmentAlloc { size })?;

        let mut segment = Self { base: memory.cast(), size };
        segment.write_u64(MAGIC_OFFSET, SEGMENT_MAGIC);
        segment.write_u64(SIZE_OFFSET, size);

        tracing::debug!(size, base = ?segment.base, "segment created");

        Ok(segment)
    }

    /// Rebuilds a segment from an image previously taken with [`Segment::snapshot`].
    ///
    /// The image is placed at a new address; allocator metadata only stores
    /// segment offsets, so it stays valid.
    pub fn from_image(image: &[u8]) -> Result<Self, Error> {
        if image.len() < 2 * WORD_SIZE as usize {
            return Err(Error::BadSegment { cause: "image too short" });
        }

        let word = |at: usize| {
            let mut bytes = [0u8; WORD_SIZE as usize];
            bytes.copy_from_slice(&image[at..at + WORD_SIZE as usize]);
            u64::from_ne_bytes(bytes)
        };

        if word(MAGIC_OFFSET as usize) != SEGMENT_MAGIC {
            return Err(Error::BadSegment { cause: "segment magic mismatch" });
        }
        if word(SIZE_OFFSET as usize) != image.len() as u64 {
            return Err(Error::BadSegment { cause: "recorded size differs from image length" });
        }

        let mut segment = Self::new(image.len() as u64)?;
        segment.write_bytes(0, image);
        Ok(segment)
    }

    /// Copies the whole segment out.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes(self.span()).to_vec()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The address of the first byte of the segment.
    pub fn addr(&self) -> u64 {
        self.base.as_ptr() as usize as u64
    }

    /// The whole segment as a span of offsets.
    pub fn span(&self) -> Span {
        Span::new(0, self.size)
    }

    /// Translates a pointer into a segment offset, if it points inside the segment.
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<u64> {
        let addr = ptr.as_ptr() as usize as u64;
        addr.checked_sub(self.addr()).filter(|&off| off < self.size)
    }

    /// Returns a pointer to the byte at `offset`.
    ///
    /// ### Panics
    /// Panics if `offset` lies outside the segment.
    pub fn ptr_at(&self, offset: u64) -> NonNull<u8> {
        assert!(offset < self.size, "offset {:#x} outside segment of {:#x} bytes", offset, self.size);

        // SAFETY: offset is within the allocation
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset as usize)) }
    }

    #[track_caller]
    fn check_word(&self, offset: u64) {
        assert!(
            is_aligned(offset, WORD_SIZE) && offset.checked_add(WORD_SIZE).is_some_and(|e| e <= self.size),
            "misaligned or out-of-bounds word access at {:#x}",
            offset
        );
    }

    /// Reads the word at `offset`.
    ///
    /// ### Panics
    /// Panics if `offset` is misaligned or out of bounds.
    #[track_caller]
    pub fn read_u64(&self, offset: u64) -> u64 {
        self.check_word(offset);

        // SAFETY: bounds and alignment checked, the base is SEGMENT_ALIGN-aligned
        unsafe { self.base.as_ptr().add(offset as usize).cast::<u64>().read() }
    }

    #[track_caller]
    pub(crate) fn write_u64(&mut self, offset: u64, value: u64) {
        self.check_word(offset);

        // SAFETY: as in read_u64
        unsafe { self.base.as_ptr().add(offset as usize).cast::<u64>().write(value) }
    }

    /// Borrows the bytes of `span`.
    ///
    /// ### Panics
    /// Panics if `span` is not within the segment.
    pub fn bytes(&self, span: Span) -> &[u8] {
        assert!(self.span().contains_span(span), "span {} outside segment", span);

        // SAFETY: the span is within the allocation
        unsafe {
            core::slice::from_raw_parts(self.base.as_ptr().add(span.base as usize), span.size() as usize)
        }
    }

    pub(crate) fn write_bytes(&mut self, offset: u64, bytes: &[u8]) {
        let span = Span::from_base_size(offset, bytes.len() as u64);
        assert!(self.span().contains_span(span), "span {} outside segment", span);

        // SAFETY: the span is within the allocation and cannot overlap `bytes`,
        // which is borrowed from elsewhere
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(offset as usize),
                bytes.len(),
            )
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // the layout was validated in `new`
        if let Ok(layout) = Layout::from_size_align(self.size as usize, SEGMENT_ALIGN as usize) {
            unsafe { Global.deallocate(self.base, layout) }
        }
    }
}
