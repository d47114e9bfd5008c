#![no_main]

use std::ptr::NonNull;

use segalloc::*;

use libfuzzer_sys::fuzz_target;

use libfuzzer_sys::arbitrary::Arbitrary;

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Allocate `size` bytes, from the repair zone if `repair`
    Alloc { size: u16, repair: bool },
    /// Allocate with an alignment of 1 << (align_bit % 17)
    AllocAligned { size: u16, align_bit: u8, chunk_align: bool, repair: bool },
    /// Free the ith allocation
    Free { index: u8 },
    /// Persist statistics
    Stats,
    /// Unbind and rebind the allocator
    Rebind,
}
use Actions::*;

fn transact<R>(credit: TxCredit, f: impl FnOnce(&mut Tx) -> R) -> R {
    let mut tx = Tx::new();
    tx.prep(credit);
    tx.open();
    let result = f(&mut tx);
    let record = tx.close();
    assert!(record.used().le(credit));
    result
}

fn zones(repair: bool) -> ZoneMask {
    if repair { ZoneMask::REPAIR } else { ZoneMask::NORMAL }
}

fuzz_target!(|actions: Vec<Actions>| {
    let segment = Segment::new(0x40000).unwrap();
    let config = AllocatorConfig::with_repair_percent(25);
    let mut allocator = transact(AllocatorCore::credit(AllocatorOp::Create, 0, 0), |tx| {
        Allocator::<spin::Mutex<()>>::create(segment, tx, &config)
    })
    .unwrap();

    let mut allocations: Vec<(NonNull<u8>, u64, bool)> = vec![];

    for action in actions {
        match action {
            Alloc { size, repair } => {
                let size = size as u64;
                let credit = AllocatorCore::credit(AllocatorOp::Alloc, size, 0);
                let ptr = transact(credit, |tx| allocator.alloc(tx, size, zones(repair)));

                if let Some(ptr) = ptr {
                    unsafe { ptr.as_ptr().write_bytes(0xab, size as usize) };
                    allocations.push((ptr, size, false));
                }
            }
            AllocAligned { size, align_bit, chunk_align, repair } => {
                let size = size as u64;
                let shift = align_bit as u32 % 17;
                let credit = AllocatorCore::credit(AllocatorOp::AllocAligned, size, shift);
                let ptr = transact(credit, |tx| {
                    allocator.alloc_aligned(tx, size, shift, zones(repair), chunk_align)
                });

                if let Some(ptr) = ptr {
                    let at = if chunk_align {
                        ptr.as_ptr() as usize - AllocatorCore::chunk_header_size() as usize
                    } else {
                        ptr.as_ptr() as usize
                    };
                    assert!(at % (1 << shift) == 0);

                    unsafe { ptr.as_ptr().write_bytes(0xcd, size as usize) };
                    allocations.push((ptr, size, true));
                }
            }
            Free { index } => {
                if index as usize >= allocations.len() { continue; }

                let (ptr, _, aligned) = allocations.swap_remove(index as usize);
                if aligned {
                    transact(AllocatorCore::credit(AllocatorOp::FreeAligned, 0, 0), |tx| {
                        allocator.free_aligned(tx, ptr)
                    });
                } else {
                    transact(AllocatorCore::credit(AllocatorOp::Free, 0, 0), |tx| allocator.free(tx, ptr));
                }
            }
            Stats => {
                transact(AllocatorCore::stats_credit(), |tx| allocator.stats_capture(tx));
            }
            Rebind => {
                let stats = allocator.stats();
                allocator = Allocator::init(allocator.fini()).unwrap();

                let rebound = allocator.stats();
                assert!(rebound.space_free == stats.space_free);
                assert!(rebound.chunks_nr == stats.chunks_nr);
                assert!(rebound.zones == stats.zones);
            }
        }
    }

    assert!(allocator.invariant());

    for (ptr, _, _) in allocations {
        transact(AllocatorCore::credit(AllocatorOp::Free, 0, 0), |tx| allocator.free(tx, ptr));
    }

    let stats = allocator.stats();
    assert!(stats.space_free == stats.space_total);
});
