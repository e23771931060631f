//! The reference free-list allocator.
//!
//! One address-ordered list of blocks, searched front to back on every
//! allocation and deallocation. There are no side indexes to keep in sync, so
//! this is the baseline the segregated allocator is checked against.

use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use crate::algorithm::{AllocOptions, Algorithm, BankConfig, DeviceAddr, Direction, Statistics};
use crate::bank::Bank;
use crate::block_table::{Block, Validity};
use crate::error::{fatal, FatalError};

/// How [`FreeList`] picks among the free blocks that are large enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPolicy {
    /// The lowest block that fits.
    First,
    /// The smallest block that fits; the lowest of those on a tie.
    Best,
}

#[derive(Debug, Clone)]
pub struct FreeList {
    bank: Bank,
    policy: SearchPolicy,
}

impl FreeList {
    /// # Panics
    ///
    /// If `config` does not pass [`BankConfig::validate`].
    #[track_caller]
    pub fn new(config: BankConfig, policy: SearchPolicy) -> Self {
        FreeList {
            bank: Bank::new(config),
            policy,
        }
    }

    pub fn policy(&self) -> SearchPolicy {
        self.policy
    }

    fn find_free(&self, alloc_size: DeviceAddr) -> Option<Block> {
        let mut candidates = self
            .bank
            .blocks
            .iter()
            .filter(|block| !block.allocated && block.size >= alloc_size);

        match self.policy {
            SearchPolicy::First => candidates.next(),
            SearchPolicy::Best => candidates.min_by_key(|block| block.size),
        }
    }
}

impl Algorithm for FreeList {
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
        self.bank.available_addresses(size_bytes)
    }

    fn allocate_with(&mut self, size_bytes: DeviceAddr, options: AllocOptions) -> Option<DeviceAddr> {
        let alloc_size = self.bank.alloc_size(size_bytes)?;
        let block = match self.find_free(alloc_size) {
            Some(block) => block,
            None => {
                log::debug!("No free block can hold {} bytes", alloc_size);
                return None;
            }
        };

        let offset = self.bank.placement(block.index, alloc_size, options);
        self.bank.blocks.carve(block.index, offset, alloc_size);
        let address = self.bank.config.to_absolute(block.address + offset);

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

        let offset = self.bank.config.to_relative(absolute_address)? - block.address;
        self.bank.blocks.carve(block.index, offset, alloc_size);

        log::debug!("Allocated {} bytes at requested {:#x}", alloc_size, absolute_address);
        Some(absolute_address)
    }

    fn deallocate(&mut self, absolute_address: DeviceAddr) {
        let found = self.bank.config.to_relative(absolute_address).and_then(|address| {
            self.bank
                .blocks
                .iter()
                .take_while(|block| block.address <= address)
                .find(|block| block.address == address && block.allocated)
        });
        let block = match found {
            Some(block) => block,
            None => fatal(FatalError::InvalidDeallocation {
                address: absolute_address,
            }),
        };

        self.bank.blocks.coalesce(block.index, |_, _| {});
        log::debug!("Deallocated {:#x}", absolute_address);
    }

    fn clear(&mut self) {
        self.bank.reset();
    }

    fn statistics(&self) -> Statistics {
        self.bank.statistics()
    }

    fn shrink_size(&mut self, amount: DeviceAddr, direction: Direction) {
        if amount == 0 {
            return;
        }
        let index = self.bank.shrink_target(amount, direction);
        self.bank.blocks.truncate_front(index, amount);
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

        let sentinel = self.bank.blocks.push_front(0, shrunk, true);
        self.bank.max_size_bytes += shrunk;
        self.bank.shrink_size = 0;
        self.bank.blocks.coalesce(sentinel, |_, _| {});

        log::debug!("Restored {:#x} shrunk bytes", shrunk);
    }

    fn validity(&self) -> Validity {
        self.bank.blocks.validity(self.bank.span())
    }

    fn dump_blocks(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "FreeList allocator info ({:?} fit):", self.policy)?;
        writeln!(out, "Block table:")?;
        self.bank.blocks.dump(out)
    }
}
