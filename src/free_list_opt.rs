//! The segregated free-list allocator.
//!
//! Essentially the same free list algorithm as [`FreeList`](crate::FreeList),
//! with three accelerations:
//!
//! - block metadata lives in a structure-of-arrays [`BlockTable`], keeping it
//!   compact and cache friendly;
//! - free blocks are segregated by size class ([`SizeClasses`]), so the
//!   best-fit search only looks at blocks that might be large enough;
//! - allocated blocks are found by address through a hash table
//!   ([`AllocatedIndex`]) instead of walking the list on deallocation.
//!
//! Best fit is only approximate: blocks within a size class are kept in
//! insertion order, not sorted, and among equally good candidates the one
//! filed first wins regardless of address. An exact fit is taken as soon as
//! it is seen.

use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use crate::algorithm::{AllocOptions, Algorithm, BankConfig, DeviceAddr, Direction, Statistics};
use crate::alloc_index::AllocatedIndex;
use crate::bank::Bank;
use crate::block_table::{BlockIndex, Validity};
use crate::error::{fatal, FatalError};
use crate::size_class::{SizeClasses, DEFAULT_SIZE_CLASS_BASE, DEFAULT_SIZE_CLASS_COUNT};

#[derive(Debug, Clone)]
pub struct FreeListOpt {
    bank: Bank,
    free_blocks: SizeClasses,
    allocated: AllocatedIndex,
}

impl FreeListOpt {
    /// Create an allocator with the default size classes.
    ///
    /// # Panics
    ///
    /// If `config` does not pass [`BankConfig::validate`].
    #[track_caller]
    pub fn new(config: BankConfig) -> Self {
        FreeListOpt::with_size_classes(config, DEFAULT_SIZE_CLASS_BASE, DEFAULT_SIZE_CLASS_COUNT)
    }

    /// Create an allocator whose smallest size class holds blocks under
    /// `2 * base` bytes, with `count` classes in all.
    #[track_caller]
    pub fn with_size_classes(config: BankConfig, base: DeviceAddr, count: usize) -> Self {
        let mut allocator = FreeListOpt {
            bank: Bank::new(config),
            free_blocks: SizeClasses::new(base, count),
            allocated: AllocatedIndex::default(),
        };
        allocator.init();
        allocator
    }

    fn init(&mut self) {
        self.free_blocks.clear();
        self.allocated.clear();
        if let Some(index) = self.bank.reset() {
            self.free_blocks.insert(index, self.bank.blocks.size(index));
        }
    }

    /// Take a free block out of its size class.
    fn unfile(&mut self, index: BlockIndex) {
        let size = self.bank.blocks.size(index);
        let removed = self.free_blocks.remove(index, size);
        assert!(removed, "Free block {} ({} bytes) missing from its size class", index, size);
    }

    /// Allocate `[offset, offset + alloc_size)` of a free block that has
    /// already been taken out of its size class. Returns the bank-relative
    /// address of the allocation.
    fn allocate_in_block(&mut self, index: BlockIndex, alloc_size: DeviceAddr, offset: DeviceAddr) -> DeviceAddr {
        let carve = self.bank.blocks.carve(index, offset, alloc_size);
        for remainder in carve.remainders() {
            self.free_blocks.insert(remainder, self.bank.blocks.size(remainder));
        }

        let address = self.bank.blocks.address(index);
        self.allocated.insert(address, index);
        address
    }

    /// Free an allocated block and merge it with its free neighbours.
    fn release(&mut self, address: DeviceAddr) {
        let index = match self.allocated.remove(address) {
            Some(index) => index,
            None => fatal(FatalError::InvalidDeallocation {
                address: self.bank.config.to_absolute(address),
            }),
        };

        let free_blocks = &mut self.free_blocks;
        let merged = self.bank.blocks.coalesce(index, |neighbour, size| {
            let removed = free_blocks.remove(neighbour, size);
            assert!(removed, "Free block {} ({} bytes) missing from its size class", neighbour, size);
        });
        self.free_blocks.insert(merged, self.bank.blocks.size(merged));
    }
}

impl Algorithm for FreeListOpt {
    fn config(&self) -> &BankConfig {
        &self.bank.config
    }

    fn max_size_bytes(&self) -> DeviceAddr {
        self.bank.max_size_bytes
    }

    fn shrunk_bytes(&self) -> DeviceAddr {
        self.bank.shrink_size
    }

    fn lowest_occupied_address(&self) -> Option<DeviceAddr> {
        self.bank.lowest_occupied_address()
    }

    fn available_addresses(&self, size_bytes: DeviceAddr) -> Vec<Range<DeviceAddr>> {
        // Every free block, not just the classes a search would visit
        self.bank.available_addresses(size_bytes)
    }

    fn allocate_with(&mut self, size_bytes: DeviceAddr, options: AllocOptions) -> Option<DeviceAddr> {
        let alloc_size = self.bank.alloc_size(size_bytes)?;

        let blocks = &self.bank.blocks;
        let (class, pos) = match self.free_blocks.find_fit(alloc_size, |i| blocks.size(i)) {
            Some(found) => found,
            None => {
                log::debug!("No free block can hold {} bytes", alloc_size);
                return None;
            }
        };
        let index = self.free_blocks.bucket(class)[pos];
        debug_assert!(!self.bank.blocks.is_allocated(index), "Block {} is already allocated", index);

        let offset = self.bank.placement(index, alloc_size, options);
        self.free_blocks.take(class, pos);
        let address = self.allocate_in_block(index, alloc_size, offset);
        let address = self.bank.config.to_absolute(address);

        log::debug!("Allocated {} bytes at {:#x} ({:?})", alloc_size, address, options.direction);
        Some(address)
    }

    fn allocate_at_address(
        &mut self,
        absolute_address: DeviceAddr,
        size_bytes: DeviceAddr,
    ) -> Option<DeviceAddr> {
        let alloc_size = self.bank.alloc_size(size_bytes)?;
        let block = self.bank.locate(absolute_address, alloc_size)?;

        self.unfile(block.index);
        let offset = self.bank.config.to_relative(absolute_address)? - block.address;
        let address = self.allocate_in_block(block.index, alloc_size, offset);

        log::debug!("Allocated {} bytes at requested {:#x}", alloc_size, absolute_address);
        Some(self.bank.config.to_absolute(address))
    }

    fn deallocate(&mut self, absolute_address: DeviceAddr) {
        let address = match self.bank.config.to_relative(absolute_address) {
            Some(address) => address,
            None => fatal(FatalError::InvalidDeallocation {
                address: absolute_address,
            }),
        };
        self.release(address);
        log::debug!("Deallocated {:#x}", absolute_address);
    }

    fn clear(&mut self) {
        self.init();
    }

    fn statistics(&self) -> Statistics {
        self.bank.statistics()
    }

    fn shrink_size(&mut self, amount: DeviceAddr, direction: Direction) {
        if amount == 0 {
            return;
        }
        let index = self.bank.shrink_target(amount, direction);

        self.unfile(index);
        if let Some(index) = self.bank.blocks.truncate_front(index, amount) {
            self.free_blocks.insert(index, self.bank.blocks.size(index));
        }
        self.bank.max_size_bytes -= amount;
        self.bank.shrink_size += amount;

        log::debug!(
            "Shrunk by {:#x}: {:#x} bytes usable, {:#x} held back",
            amount,
            self.bank.max_size_bytes,
            self.bank.shrink_size
        );
    }

    fn reset_size(&mut self) {
        let shrunk = self.bank.shrink_size;
        if shrunk == 0 {
            return;
        }

        // Put the carved-out prefix back as an allocated block, then free it
        // so the ordinary merge path folds it into its neighbour.
        let sentinel = self.bank.blocks.push_front(0, shrunk, true);
        self.allocated.insert(0, sentinel);
        self.bank.max_size_bytes += shrunk;
        self.bank.shrink_size = 0;
        self.release(0);

        log::debug!("Restored {:#x} shrunk bytes", shrunk);
    }

    fn validity(&self) -> Validity {
        let blocks = &self.bank.blocks;
        let mut validity = blocks.validity(self.bank.span());

        let mut filed = Vec::new();
        for (class, index) in self.free_blocks.entries() {
            let live = blocks.iter().any(|b| b.index == index);
            if !live || blocks.is_allocated(index) || self.free_blocks.class_of(blocks.size(index)) != class {
                validity.misfiled += 1;
            }
            filed.push(index);
        }
        filed.sort();
        let before = filed.len();
        filed.dedup();
        validity.misfiled += before - filed.len();

        let mut allocated_count = 0;
        for block in blocks {
            if block.allocated {
                allocated_count += 1;
                if self.allocated.get(block.address) != Some(block.index) {
                    validity.unindexed += 1;
                }
            } else if filed.binary_search(&block.index).is_err() {
                validity.misfiled += 1;
            }
        }
        if self.allocated.len() > allocated_count {
            validity.unindexed += self.allocated.len() - allocated_count;
        }

        validity
    }

    fn dump_blocks(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "FreeListOpt allocator info:")?;
        writeln!(out, "segregated free blocks by size:")?;
        self.free_blocks.dump(out)?;

        write!(out, "Free slots in block table:")?;
        for index in self.bank.blocks.free_slots() {
            write!(out, " {}", index)?;
        }
        writeln!(out)?;

        writeln!(out, "Block table:")?;
        self.bank.blocks.dump(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    const KIB: DeviceAddr = 1024;
    const GIB: DeviceAddr = 1024 * 1024 * 1024;

    fn allocator() -> FreeListOpt {
        FreeListOpt::new(BankConfig::new(GIB, 0, KIB, KIB))
    }

    fn check(allocator: &FreeListOpt) {
        let validity = allocator.validity();
        assert!(validity.is_valid(), "{:?}: {}", validity, allocator.bank.blocks);
    }

    #[test]
    fn test_allocation() {
        let mut allocator = allocator();
        assert_eq!(allocator.allocate(KIB), Some(0));
        assert_eq!(allocator.allocate(KIB), Some(KIB));
        check(&allocator);
    }

    #[test]
    fn test_clear() {
        let mut allocator = allocator();
        allocator.allocate(KIB).unwrap();
        allocator.allocate(KIB).unwrap();
        allocator.clear();
        assert_eq!(allocator.allocate(KIB), Some(0));
        assert_eq!(allocator.bank.blocks.slot_count(), 2);
        check(&allocator);
    }

    #[test]
    fn test_deallocate_in_order() {
        let mut allocator = allocator();
        let addrs: Vec<_> = (0..10).map(|_| allocator.allocate(KIB).unwrap()).collect();
        for &addr in &addrs {
            allocator.deallocate(addr);
            check(&allocator);
        }
        assert_eq!(allocator.available_addresses(KIB), vec![0..GIB]);
        assert!(allocator.allocated.is_empty());
    }

    #[test]
    fn test_deallocate_in_reverse_order() {
        let mut allocator = allocator();
        let addrs: Vec<_> = (0..10).map(|_| allocator.allocate(KIB).unwrap()).collect();
        for &addr in addrs.iter().rev() {
            allocator.deallocate(addr);
            check(&allocator);
        }
        assert_eq!(allocator.available_addresses(KIB), vec![0..GIB]);
        // Everything merged back into one block
        assert_eq!(allocator.bank.blocks.len(), 1);
    }

    #[test]
    fn test_allocate_at_address() {
        let mut allocator = allocator();
        let a = allocator.allocate(KIB).unwrap();
        assert_eq!(a, 0);

        assert_eq!(allocator.allocate_at_address(KIB, KIB), Some(KIB));
        // Address is already allocated
        assert_eq!(allocator.allocate_at_address(KIB, KIB), None);
        assert_eq!(allocator.allocate_at_address(2 * KIB, KIB), Some(2 * KIB));

        allocator.deallocate(a);
        assert_eq!(allocator.allocate_at_address(0, KIB), Some(0));
        check(&allocator);
    }

    #[test]
    fn test_allocate_at_address_out_of_range() {
        let mut allocator = allocator();
        assert_eq!(allocator.allocate_at_address(GIB - KIB, 2 * KIB), None);
        assert_eq!(allocator.allocate_at_address(GIB, KIB), None);
        assert_eq!(allocator.allocate_at_address(GIB - KIB, KIB), Some(GIB - KIB));
        check(&allocator);
    }

    #[test]
    fn test_allocate_at_address_interactions() {
        let mut allocator = allocator();
        allocator.allocate_at_address(32 * KIB, KIB).unwrap();

        assert_eq!(allocator.allocate(KIB), Some(0));
        // Counterintuitive, but best fit finds the smaller block at the bottom
        assert_eq!(allocator.allocate_with(KIB, AllocOptions::top_down()), Some(31 * KIB));
        assert_eq!(allocator.allocate(KIB), Some(KIB));
        check(&allocator);
    }

    #[test]
    fn test_allocate_from_top() {
        let mut allocator = allocator();
        assert_eq!(allocator.allocate_with(KIB, AllocOptions::top_down()), Some(GIB - KIB));
        assert_eq!(allocator.allocate_with(KIB, AllocOptions::top_down()), Some(GIB - 2 * KIB));
        assert_eq!(allocator.allocate(KIB), Some(0));
        check(&allocator);
    }

    #[test]
    fn test_coalescing() {
        let mut allocator = allocator();
        let a = allocator.allocate(KIB).unwrap();
        let b = allocator.allocate(KIB).unwrap();
        let c = allocator.allocate(KIB).unwrap();
        assert_eq!(c, 2 * KIB);
        allocator.deallocate(b);
        allocator.deallocate(a);
        check(&allocator);

        assert_eq!(allocator.allocate(2 * KIB), Some(0));
    }

    #[test]
    fn test_ties_follow_bucket_order() {
        let mut allocator = allocator();
        let sizes = [KIB, 2 * KIB, KIB, 2 * KIB, KIB];
        let addrs: Vec<_> = sizes.iter().map(|&s| allocator.allocate(s).unwrap()).collect();
        assert_eq!(addrs, vec![0, KIB, 3 * KIB, 4 * KIB, 6 * KIB]);

        // Two 2K holes; the higher one is filed first
        allocator.deallocate(addrs[3]);
        allocator.deallocate(addrs[1]);

        assert_eq!(allocator.allocate(2 * KIB), Some(4 * KIB));
        assert_eq!(allocator.allocate(2 * KIB), Some(KIB));
        check(&allocator);
    }

    #[test]
    fn test_smallest_in_class() {
        let mut allocator = allocator();
        let sizes = [KIB, 3 * KIB, KIB, 2 * KIB, KIB];
        let addrs: Vec<_> = sizes.iter().map(|&s| allocator.allocate(s).unwrap()).collect();
        allocator.deallocate(addrs[1]);
        allocator.deallocate(addrs[3]);

        // Both holes are in class 1; the 2K one is the better fit
        assert_eq!(allocator.allocate(2 * KIB), Some(addrs[3]));
        assert_eq!(allocator.allocate(2 * KIB), Some(addrs[1]));
        check(&allocator);
    }

    #[test]
    fn test_shrink_and_reset() {
        let mut allocator = allocator();
        let a = allocator.allocate(KIB).unwrap();
        let b = allocator.allocate(KIB).unwrap();
        allocator.deallocate(a);

        allocator.shrink_size(KIB, Direction::BottomUp);
        assert_eq!(allocator.max_size_bytes(), GIB - KIB);
        assert_eq!(allocator.shrunk_bytes(), KIB);
        check(&allocator);
        assert_eq!(allocator.allocate_at_address(0, KIB), None);
        assert_eq!(allocator.allocate_at_address(KIB, KIB), None);

        allocator.reset_size();
        assert_eq!(allocator.max_size_bytes(), GIB);
        check(&allocator);
        allocator.deallocate(b);
        assert_eq!(allocator.allocate(2 * KIB), Some(0));
    }

    #[test]
    fn test_coalescing_after_reset() {
        let mut allocator = allocator();
        let a = allocator.allocate(KIB).unwrap();
        let b = allocator.allocate(KIB).unwrap();
        allocator.allocate(KIB).unwrap();
        allocator.deallocate(b);
        allocator.deallocate(a);

        allocator.shrink_size(KIB, Direction::BottomUp);
        // The 1K left in front of the wedge is too small
        assert_eq!(allocator.allocate(2 * KIB), Some(3 * KIB));
        allocator.reset_size();
        check(&allocator);
        assert_eq!(allocator.allocate(2 * KIB), Some(0));
    }

    #[test]
    fn test_shrink_whole_bank() {
        let mut allocator = FreeListOpt::new(BankConfig::new(4 * KIB, 0, KIB, KIB));
        allocator.shrink_size(4 * KIB, Direction::BottomUp);
        check(&allocator);
        assert_eq!(allocator.allocate(KIB), None);

        allocator.reset_size();
        check(&allocator);
        assert_eq!(allocator.allocate(4 * KIB), Some(0));
    }

    #[test]
    fn test_repeated_shrink() {
        let mut allocator = allocator();
        allocator.shrink_size(KIB, Direction::BottomUp);
        allocator.shrink_size(2 * KIB, Direction::BottomUp);
        assert_eq!(allocator.shrunk_bytes(), 3 * KIB);
        assert_eq!(allocator.allocate(KIB), Some(3 * KIB));
        check(&allocator);

        allocator.reset_size();
        check(&allocator);
        assert_eq!(allocator.available_addresses(KIB), vec![0..3 * KIB, 4 * KIB..GIB]);
    }

    #[test]
    fn test_clear_undoes_shrink() {
        let mut allocator = allocator();
        allocator.shrink_size(KIB, Direction::BottomUp);
        allocator.clear();
        assert_eq!(allocator.shrunk_bytes(), 0);
        assert_eq!(allocator.allocate(KIB), Some(0));
    }

    #[test]
    #[should_panic(expected = "cuts into allocated block at 0x0")]
    fn test_shrink_into_allocation() {
        let mut allocator = allocator();
        allocator.allocate(KIB).unwrap();
        allocator.shrink_size(KIB, Direction::BottomUp);
    }

    #[test]
    #[should_panic(expected = "exceeds usable size")]
    fn test_shrink_too_far() {
        let mut allocator = allocator();
        allocator.shrink_size(2 * GIB, Direction::BottomUp);
    }

    #[test]
    #[should_panic(expected = "shrinking from the top")]
    fn test_shrink_top_down() {
        let mut allocator = allocator();
        allocator.shrink_size(KIB, Direction::TopDown);
    }

    #[test]
    fn test_statistics() {
        let mut allocator = allocator();
        let a = allocator.allocate(KIB).unwrap();
        allocator.allocate(KIB).unwrap();
        allocator.deallocate(a);

        let stats = allocator.statistics();
        assert_eq!(stats.total_allocated_bytes, KIB);
        assert_eq!(stats.total_free_bytes, GIB - KIB);
        assert_eq!(stats.largest_free_block_bytes, GIB - 2 * KIB);
        assert_eq!(stats.largest_free_block_addrs, vec![2 * KIB]);
    }

    #[test]
    fn test_out_of_memory() {
        let mut allocator = allocator();
        assert_eq!(allocator.allocate(GIB), Some(0));
        assert_eq!(allocator.allocate(KIB), None);

        allocator.clear();
        allocator.allocate(GIB - KIB).unwrap();
        assert_eq!(allocator.allocate(2 * KIB), None);
        check(&allocator);
    }

    #[test]
    fn test_available_addresses() {
        let mut allocator = allocator();
        let a = allocator.allocate(KIB).unwrap();
        assert_eq!(allocator.available_addresses(KIB), vec![KIB..GIB]);

        let b = allocator.allocate(KIB).unwrap();
        let c = allocator.allocate(KIB).unwrap();
        assert_eq!((a, b, c), (0, KIB, 2 * KIB));
        allocator.deallocate(b);
        assert_eq!(allocator.available_addresses(KIB), vec![KIB..2 * KIB, 3 * KIB..GIB]);
        assert_eq!(allocator.available_addresses(10 * KIB), vec![3 * KIB..GIB]);
    }

    #[test]
    fn test_offset_addresses() {
        let base = 64 * KIB;
        let mut allocator = FreeListOpt::new(BankConfig::new(16 * KIB, base, KIB, KIB));
        let a = allocator.allocate(KIB).unwrap();
        assert_eq!(a, base);
        assert_eq!(allocator.allocate_at_address(base + 4 * KIB, KIB), Some(base + 4 * KIB));
        assert_eq!(allocator.lowest_occupied_address(), Some(base));
        assert_eq!(allocator.available_addresses(KIB)[0], base + KIB..base + 4 * KIB);

        allocator.deallocate(a);
        assert_eq!(allocator.lowest_occupied_address(), Some(base + 4 * KIB));
        check(&allocator);
    }

    #[test]
    fn test_address_limit() {
        let mut allocator = allocator();
        let options = AllocOptions::default().below(KIB);
        assert_eq!(allocator.allocate_with(KIB, options), Some(0));
    }

    #[test]
    fn test_address_limit_failure_leaves_state() {
        let mut allocator = allocator();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            allocator.allocate_with(KIB, AllocOptions::top_down().below(GIB / 2))
        }));
        assert!(result.is_err());
        // Checked before anything was committed
        assert_eq!(allocator.available_addresses(KIB), vec![0..GIB]);
        check(&allocator);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free() {
        let mut allocator = allocator();
        let a = allocator.allocate(KIB).unwrap();
        allocator.deallocate(a);
        allocator.deallocate(a);
    }

    #[test]
    #[should_panic(expected = "invalid deallocation at 0x200")]
    fn test_deallocate_unknown() {
        let mut allocator = allocator();
        allocator.allocate(KIB).unwrap();
        allocator.deallocate(512);
    }

    #[test]
    #[should_panic(expected = "should be 1024 B aligned")]
    fn test_misaligned_offset() {
        FreeListOpt::new(BankConfig::new(GIB, 100, KIB, KIB));
    }

    #[test]
    fn test_custom_size_classes() {
        let mut allocator = FreeListOpt::with_size_classes(BankConfig::new(1 << 20, 0, 16, 16), 16, 4);
        let addrs: Vec<_> = (1..=64).map(|i| allocator.allocate(i * 16).unwrap()).collect();
        for &addr in addrs.iter().step_by(2) {
            allocator.deallocate(addr);
        }
        check(&allocator);
        assert_eq!(allocator.free_blocks.count(), 4);
    }

    #[test]
    fn test_dump_blocks() {
        let mut allocator = allocator();
        allocator.allocate(KIB).unwrap();
        let mut out = String::new();
        allocator.dump_blocks(&mut out).unwrap();
        assert!(out.contains("Size class 0: (1024 - 2048) blocks:"));
        assert!(out.contains("Size class 11: (2097152 - inf) blocks: 1"));
        // Dumping doesn't touch anything
        assert_eq!(allocator.allocate(KIB), Some(KIB));
    }
}
