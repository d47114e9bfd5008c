#![doc = include_str!("../README.md")]

mod allocator;
mod chunk;
mod credit;
mod error;
mod fl;
mod header;
mod ptr_utils;
mod segment;
mod span;
mod stats;
mod tx;
mod zone;

#[cfg(test)]
mod test_utils;

pub use allocator::{Allocator, AllocatorCore};
pub use chunk::{Corruption, HEADER_SIZE as CHUNK_HEADER_SIZE};
pub use credit::AllocatorOp;
pub use error::Error;
pub use fl::{FlOp, FL_NR, FL_STEP};
pub use segment::{Segment, SEGMENT_ALIGN, SEGMENT_RESERVED};
pub use span::Span;
pub use stats::{AllocatorStats, ZoneStats};
pub use tx::{Transaction, Tx, TxCredit, TxRecord, TxRegion, TxState};
pub use zone::{AllocatorConfig, ZoneMask, ZoneType, ZONE_NR};

/// Smallest supported alignment shift. Every chunk and every payload is
/// aligned to `1 << ALLOC_SHIFT_MIN` bytes.
pub const ALLOC_SHIFT_MIN: u32 = 3;
/// Largest alignment shift accepted by `alloc_aligned`.
pub const ALLOC_SHIFT_MAX: u32 = 24;
