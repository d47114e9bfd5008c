//! Transactional glue.
//!
//! The allocator never writes segment memory on its own: every write goes
//! through a [`Capture`], which records the written range into the caller's
//! open [`Transaction`] and charges it against the plan of the running
//! operation.

use core::ops::{Add, AddAssign};

use crate::credit::{Unit, Units};
use crate::{Segment, Span};

/// An upper bound on what a transaction will capture: a number of regions
/// and their total size in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TxCredit {
    /// Number of captured regions.
    pub reg_nr: u64,
    /// Total bytes of captured regions.
    pub reg_size: u64,
}

impl TxCredit {
    pub const ZERO: Self = Self::new(0, 0);

    pub const fn new(reg_nr: u64, reg_size: u64) -> Self {
        Self { reg_nr, reg_size }
    }

    pub const fn add(self, other: Self) -> Self {
        Self::new(self.reg_nr + other.reg_nr, self.reg_size + other.reg_size)
    }

    /// ### Panics
    /// Panics if `other` is not [`le`](TxCredit::le) `self`.
    pub const fn sub(self, other: Self) -> Self {
        assert!(other.le(self), "credit underflow");

        Self::new(self.reg_nr - other.reg_nr, self.reg_size - other.reg_size)
    }

    pub const fn mul(self, k: u64) -> Self {
        Self::new(self.reg_nr * k, self.reg_size * k)
    }

    /// `self + other * k`
    pub const fn mac(self, other: Self, k: u64) -> Self {
        self.add(other.mul(k))
    }

    /// Component-wise maximum.
    pub const fn max(self, other: Self) -> Self {
        Self::new(
            if self.reg_nr > other.reg_nr { self.reg_nr } else { other.reg_nr },
            if self.reg_size > other.reg_size { self.reg_size } else { other.reg_size },
        )
    }

    /// `self + max(a, b)`, the credit of doing one of two things.
    pub const fn add_max(self, a: Self, b: Self) -> Self {
        self.add(a.max(b))
    }

    /// Whether `self` fits within `other` in both components.
    pub const fn le(self, other: Self) -> bool {
        self.reg_nr <= other.reg_nr && self.reg_size <= other.reg_size
    }
}

impl Add for TxCredit {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        TxCredit::add(self, rhs)
    }
}

impl AddAssign for TxCredit {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl core::fmt::Display for TxCredit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({},{})", self.reg_nr, self.reg_size)
    }
}

/// The write-ahead log as seen by the allocator.
pub trait Transaction {
    /// Whether the transaction accepts captures.
    fn is_open(&self) -> bool;

    /// Records that `span` of the segment now holds `bytes`.
    ///
    /// Implementations must enforce their credit: capturing past it is a
    /// contract violation and must not be tolerated silently.
    fn capture(&mut self, span: Span, bytes: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    /// Accumulating credit.
    Prepare,
    /// Accepting captures.
    Open,
    Closed,
}

/// One captured region of a transaction with its post-image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRegion {
    pub span: Span,
    pub bytes: Vec<u8>,
}

/// An in-memory transaction: prepared with a credit, opened, filled with
/// captures and closed into a redo [`TxRecord`].
#[derive(Debug)]
pub struct Tx {
    state: TxState,
    prepared: TxCredit,
    used: TxCredit,
    regions: Vec<TxRegion>,
}

impl Default for Tx {
    fn default() -> Self {
        Self::new()
    }
}

impl Tx {
    pub const fn new() -> Self {
        Self { state: TxState::Prepare, prepared: TxCredit::ZERO, used: TxCredit::ZERO, regions: Vec::new() }
    }

    /// Adds `credit` to the reservation.
    ///
    /// ### Panics
    /// Panics unless the transaction is being prepared; a credit cannot grow
    /// once the transaction is open.
    pub fn prep(&mut self, credit: TxCredit) {
        assert!(self.state == TxState::Prepare, "credit added to a {:?} transaction", self.state);
        self.prepared += credit;
    }

    pub fn open(&mut self) {
        assert!(self.state == TxState::Prepare, "opening a {:?} transaction", self.state);
        self.state = TxState::Open;
    }

    /// Closes the transaction, yielding its redo record.
    pub fn close(mut self) -> TxRecord {
        assert!(self.state == TxState::Open, "closing a {:?} transaction", self.state);
        self.state = TxState::Closed;

        tracing::trace!(prepared = %self.prepared, used = %self.used, "transaction closed");

        TxRecord { regions: core::mem::take(&mut self.regions), used: self.used }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn prepared(&self) -> TxCredit {
        self.prepared
    }

    pub fn used(&self) -> TxCredit {
        self.used
    }
}

impl Transaction for Tx {
    fn is_open(&self) -> bool {
        self.state == TxState::Open
    }

    fn capture(&mut self, span: Span, bytes: &[u8]) {
        assert!(self.is_open(), "capture into a {:?} transaction", self.state);
        debug_assert!(span.size() == bytes.len() as u64);

        self.used += TxCredit::new(1, span.size());
        assert!(
            self.used.le(self.prepared),
            "transaction credit exhausted: used {} prepared {}",
            self.used,
            self.prepared
        );

        self.regions.push(TxRegion { span, bytes: bytes.to_vec() });
    }
}

/// The redo log of a closed [`Tx`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxRecord {
    regions: Vec<TxRegion>,
    used: TxCredit,
}

impl TxRecord {
    pub fn regions(&self) -> &[TxRegion] {
        &self.regions
    }

    /// The credit actually consumed.
    pub fn used(&self) -> TxCredit {
        self.used
    }

    /// Applies the captured post-images to `segment`, in capture order.
    pub fn replay(&self, segment: &mut Segment) {
        for region in &self.regions {
            segment.write_bytes(region.span.base, &region.bytes);
        }
    }
}

/// Writes allocator metadata into a segment, capturing every write into a
/// transaction and keeping a ledger of the capture units spent.
pub(crate) struct Capture<'a> {
    seg: &'a mut Segment,
    tx: &'a mut dyn Transaction,
    ledger: Units,
}

impl<'a> Capture<'a> {
    /// ### Panics
    /// Panics if `tx` is not open.
    #[track_caller]
    pub(crate) fn new(seg: &'a mut Segment, tx: &'a mut dyn Transaction) -> Self {
        assert!(tx.is_open(), "segment mutation outside an open transaction");

        Self { seg, tx, ledger: Units::NONE }
    }

    pub(crate) fn seg(&self) -> &Segment {
        self.seg
    }

    /// Writes `words` at `offset` as one capture unit.
    #[track_caller]
    pub(crate) fn write(&mut self, unit: Unit, offset: u64, words: &[u64]) {
        debug_assert!(words.len() as u64 * 8 == unit.size(), "{:?} written with {} words", unit, words.len());

        for (i, &word) in words.iter().enumerate() {
            self.seg.write_u64(offset + i as u64 * 8, word);
        }

        let span = Span::from_base_size(offset, unit.size());
        self.tx.capture(span, self.seg.bytes(span));
        self.ledger.record(unit);
    }

    #[inline]
    #[track_caller]
    pub(crate) fn write_word(&mut self, offset: u64, value: u64) {
        self.write(Unit::Word, offset, &[value]);
    }

    /// Ends the operation, checking it stayed within `plan`.
    ///
    /// ### Panics
    /// Panics if more was captured than `plan` accounts for; the matching
    /// credit would have been too small.
    #[track_caller]
    pub(crate) fn finish(self, plan: Units) {
        assert!(
            self.ledger.fits_within(&plan),
            "operation captured {:?}, beyond its credit plan {:?}",
            self.ledger,
            plan
        );
    }
}
