/// A byte range `[base, acme)` of a segment, expressed in segment offsets.
#[derive(Debug, Clone, Copy, Default, Hash)]
pub struct Span {
    pub base: u64,
    pub acme: u64,
}

impl PartialEq for Span {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        (self.is_empty() && other.is_empty())
            || (self.base == other.base && self.acme == other.acme)
    }
}
impl Eq for Span {}

impl Span {
    pub const fn empty() -> Self {
        Self { base: 0, acme: 0 }
    }

    pub const fn new(base: u64, acme: u64) -> Self {
        Self { base, acme }
    }

    pub const fn from_base_size(base: u64, size: u64) -> Self {
        Self { base, acme: base + size }
    }

    pub const fn size(&self) -> u64 {
        if self.acme > self.base {
            self.acme - self.base
        } else {
            0
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.base >= self.acme
    }

    /// Returns whether `self` contains the offset `other`.
    pub const fn contains(&self, other: u64) -> bool {
        self.base <= other && other < self.acme
    }

    /// Returns whether `self` contains `other`.
    ///
    /// Empty spans are contained by any span.
    pub const fn contains_span(&self, other: Span) -> bool {
        other.is_empty() || (self.base <= other.base && other.acme <= self.acme)
    }
}

impl core::fmt::Display for Span {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}..{:#x}", self.base, self.acme)
    }
}
