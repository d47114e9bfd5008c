//! Errors reported by the configuration-time paths: segment setup, allocator
//! creation and binding to an existing allocator header.
//!
//! Exhaustion is not an error (allocation yields `None`), and contract
//! violations such as credit overruns, double frees or guard mismatches
//! panic where they are detected.

use thiserror::Error;

use crate::chunk::Corruption;
use crate::ZoneType;

/// The error type for fallible allocator setup operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The segment cannot hold the reserved header area and a minimal chunk.
    #[error("segment of {size:#x} bytes is too small, at least {min:#x} bytes are required")]
    SegmentTooSmall {
        /// The offered segment size.
        size: u64,
        /// The smallest usable segment size.
        min: u64,
    },

    /// The memory backing a segment could not be obtained.
    #[error("cannot obtain {size:#x} bytes of segment memory")]
    SegmentAlloc {
        /// The requested segment size.
        size: u64,
    },

    /// A segment image does not carry a valid segment header.
    #[error("bad segment image: {cause}")]
    BadSegment {
        /// What is wrong with the image.
        cause: &'static str,
    },

    /// No allocator header was found at the reserved location.
    #[error("no allocator header: magic is {found:#x}")]
    BadMagic {
        /// The value found where the allocator magic was expected.
        found: u64,
    },

    /// The allocator header disagrees with the segment it lives in.
    #[error("inconsistent allocator geometry: {cause}")]
    BadGeometry {
        /// Which property of the geometry is violated.
        cause: &'static str,
    },

    /// Zone percentages do not add up to the whole allocator space.
    #[error("zone percentages sum to {sum}, expected 100")]
    ZonePercent {
        /// The actual sum of all zone percentages.
        sum: u64,
    },

    /// A zone was given some space but not enough for a single chunk.
    #[error("zone {zone:?} of {size:#x} bytes cannot hold a chunk of {min:#x} bytes")]
    ZoneTooSmall {
        /// The zone at fault.
        zone: ZoneType,
        /// The space the zone would receive.
        size: u64,
        /// The minimal chunk size.
        min: u64,
    },

    /// Chunk metadata found while binding to an allocator is damaged.
    #[error(transparent)]
    Corrupted(#[from] Corruption),
}
