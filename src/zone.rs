//! Allocator zones.
//!
//! The allocator space is split into contiguous zones, laid out in
//! [`ZoneType::LAYOUT`] order. Each zone has its own free-list index and
//! free-byte counter, so space reserved for one zone cannot be consumed by
//! requests restricted to another.

use core::ops::BitOr;

use crate::chunk::MIN_CHUNK_SIZE;
use crate::ptr_utils::{align_down, WORD_SIZE};
use crate::{Error, Span};

pub const ZONE_NR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ZoneType {
    /// Space reserved for repair, usable when the normal pool is exhausted.
    Repair = 0,
    Normal = 1,
}

impl ZoneType {
    /// All zones, in [`index`](ZoneType::index) order.
    pub const ALL: [ZoneType; ZONE_NR] = [ZoneType::Repair, ZoneType::Normal];
    /// Order of zones inside the allocator space.
    pub const LAYOUT: [ZoneType; ZONE_NR] = [ZoneType::Normal, ZoneType::Repair];
    /// Order in which a multi-zone request tries zones.
    pub const SEARCH: [ZoneType; ZONE_NR] = [ZoneType::Normal, ZoneType::Repair];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn from_index(index: u64) -> Option<Self> {
        match index {
            0 => Some(ZoneType::Repair),
            1 => Some(ZoneType::Normal),
            _ => None,
        }
    }
}

/// A set of zones an allocation may be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZoneMask(u64);

impl ZoneMask {
    pub const NONE: Self = Self(0);
    pub const REPAIR: Self = Self::of(ZoneType::Repair);
    pub const NORMAL: Self = Self::of(ZoneType::Normal);
    pub const ALL: Self = Self(Self::NORMAL.0 | Self::REPAIR.0);

    pub const fn of(zone: ZoneType) -> Self {
        Self(1 << zone.index())
    }

    pub const fn contains(self, zone: ZoneType) -> bool {
        self.0 & Self::of(zone).0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ZoneMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<ZoneType> for ZoneMask {
    fn from(zone: ZoneType) -> Self {
        Self::of(zone)
    }
}

/// Allocator creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocatorConfig {
    /// Share of the allocator space given to each zone, in percent, indexed
    /// by [`ZoneType::index`]. Must sum to 100.
    pub zone_percent: [u64; ZONE_NR],
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::with_repair_percent(0)
    }
}

impl AllocatorConfig {
    /// Reserves `repair` percent of the space for the repair zone and gives
    /// the rest to the normal zone.
    pub const fn with_repair_percent(repair: u64) -> Self {
        let mut zone_percent = [0; ZONE_NR];
        zone_percent[ZoneType::Repair.index()] = repair;
        zone_percent[ZoneType::Normal.index()] = 100u64.saturating_sub(repair);
        Self { zone_percent }
    }

    /// Splits `space` into zone spans, indexed by [`ZoneType::index`].
    ///
    /// Every zone but the last in layout order gets its percentage rounded
    /// down to the word size; the last gets the remainder.
    pub(crate) fn layout(&self, space: Span) -> Result<[Span; ZONE_NR], Error> {
        let sum: u64 = self.zone_percent.iter().sum();
        if sum != 100 {
            return Err(Error::ZonePercent { sum });
        }

        let mut spans = [Span::empty(); ZONE_NR];
        let mut base = space.base;

        for (i, zone) in ZoneType::LAYOUT.into_iter().enumerate() {
            let size = if i + 1 == ZONE_NR {
                space.acme - base
            } else {
                align_down(space.size() / 100 * self.zone_percent[zone.index()]
                    + space.size() % 100 * self.zone_percent[zone.index()] / 100, WORD_SIZE)
            };

            if size != 0 && size < MIN_CHUNK_SIZE {
                return Err(Error::ZoneTooSmall { zone, size, min: MIN_CHUNK_SIZE });
            }

            spans[zone.index()] = Span::from_base_size(base, size);
            base += size;
        }

        Ok(spans)
    }
}
