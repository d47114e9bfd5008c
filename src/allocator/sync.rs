use core::ptr::NonNull;

use super::AllocatorCore;
use crate::{
    AllocatorConfig, AllocatorOp, AllocatorStats, Error, Segment, Transaction, TxCredit, ZoneMask,
};

/// Locked allocator: wrapper struct containing a mutex-locked [`AllocatorCore`].
///
/// Every operation holds the lock for its duration. Call [`lock`](Allocator::lock)
/// to run several operations, or the invariant checker, under one acquisition.
#[derive(Debug)]
pub struct Allocator<R: lock_api::RawMutex>(pub lock_api::Mutex<R, AllocatorCore>);

impl<R: lock_api::RawMutex> From<AllocatorCore> for Allocator<R> {
    fn from(core: AllocatorCore) -> Self {
        Self(lock_api::Mutex::new(core))
    }
}

impl<R: lock_api::RawMutex> Allocator<R> {
    /// See [`AllocatorCore::create`].
    pub fn create(
        segment: Segment,
        tx: &mut dyn Transaction,
        config: &AllocatorConfig,
    ) -> Result<Self, Error> {
        AllocatorCore::create(segment, tx, config).map(Self::from)
    }

    /// See [`AllocatorCore::init`].
    pub fn init(segment: Segment) -> Result<Self, Error> {
        AllocatorCore::init(segment).map(Self::from)
    }

    pub fn fini(self) -> Segment {
        self.0.into_inner().fini()
    }

    pub fn destroy(self, tx: &mut dyn Transaction) -> Segment {
        self.0.into_inner().destroy(tx)
    }

    /// Lock the mutex and access the inner `AllocatorCore`.
    pub fn lock(&self) -> lock_api::MutexGuard<'_, R, AllocatorCore> {
        self.0.lock()
    }

    pub fn credit(op: AllocatorOp, size: u64, shift: u32) -> TxCredit {
        AllocatorCore::credit(op, size, shift)
    }

    pub fn credit_add(op: AllocatorOp, size: u64, shift: u32, accum: &mut TxCredit) {
        AllocatorCore::credit_add(op, size, shift, accum)
    }

    pub fn stats_credit() -> TxCredit {
        AllocatorCore::stats_credit()
    }

    pub const fn chunk_header_size() -> u64 {
        AllocatorCore::chunk_header_size()
    }

    pub fn alloc(&self, tx: &mut dyn Transaction, size: u64, zones: ZoneMask) -> Option<NonNull<u8>> {
        self.lock().alloc(tx, size, zones)
    }

    pub fn alloc_aligned(
        &self,
        tx: &mut dyn Transaction,
        size: u64,
        shift: u32,
        zones: ZoneMask,
        chunk_align: bool,
    ) -> Option<NonNull<u8>> {
        self.lock().alloc_aligned(tx, size, shift, zones, chunk_align)
    }

    #[track_caller]
    pub fn free(&self, tx: &mut dyn Transaction, ptr: NonNull<u8>) {
        self.lock().free(tx, ptr)
    }

    #[track_caller]
    pub fn free_aligned(&self, tx: &mut dyn Transaction, ptr: NonNull<u8>) {
        self.lock().free_aligned(tx, ptr)
    }

    pub fn stats(&self) -> AllocatorStats {
        self.lock().stats()
    }

    pub fn stats_capture(&self, tx: &mut dyn Transaction) {
        self.lock().stats_capture(tx)
    }

    pub fn invariant(&self) -> bool {
        self.lock().invariant()
    }
}
