//! State and queries shared by the free-list strategies.
//!
//! A `Bank` owns the block table along with the configuration and the
//! shrink bookkeeping. It answers every read-only question about the bank and
//! performs the argument checks that are the same for every strategy; the
//! strategies themselves only decide which block to use and keep their own
//! indexes up to date.

use alloc::vec::Vec;
use core::ops::Range;

use crate::algorithm::{AllocOptions, BankConfig, DeviceAddr, Direction, Statistics};
use crate::block_table::{Block, BlockIndex, BlockTable};
use crate::error::{fatal, FatalError};

#[derive(Debug, Clone)]
pub(crate) struct Bank {
    pub config: BankConfig,
    /// Currently usable bytes.
    pub max_size_bytes: DeviceAddr,
    /// Bytes carved off the low end by `shrink_size`.
    pub shrink_size: DeviceAddr,
    pub blocks: BlockTable,
}

impl Bank {
    #[track_caller]
    pub fn new(config: BankConfig) -> Self {
        let config = config.validated();
        Bank {
            config,
            max_size_bytes: config.max_size_bytes,
            shrink_size: 0,
            blocks: BlockTable::new(0, config.max_size_bytes),
        }
    }

    /// Back to a single free block spanning the whole bank, undoing any
    /// shrink. Returns that block, if the bank is not empty.
    pub fn reset(&mut self) -> Option<BlockIndex> {
        self.max_size_bytes = self.config.max_size_bytes;
        self.shrink_size = 0;
        self.blocks.reset(0, self.max_size_bytes)
    }

    /// The bank-relative range the block list should cover.
    pub fn span(&self) -> Range<DeviceAddr> {
        self.shrink_size..self.shrink_size + self.max_size_bytes
    }

    /// Bytes to grant for a request of `size_bytes`, or `None` if it could
    /// never fit in the usable range.
    pub fn alloc_size(&self, size_bytes: DeviceAddr) -> Option<DeviceAddr> {
        let alloc_size = self
            .config
            .alloc_size(size_bytes)
            .filter(|&size| size <= self.max_size_bytes);
        if alloc_size.is_none() {
            log::debug!(
                "Request for {} bytes can never fit in {} usable bytes",
                size_bytes,
                self.max_size_bytes
            );
        }
        alloc_size
    }

    /// Pick where in `block` an allocation of `alloc_size` starts, checking
    /// the caller's address limit before anything is committed.
    ///
    /// Returns the offset of the allocation within the block.
    #[track_caller]
    pub fn placement(&self, block: BlockIndex, alloc_size: DeviceAddr, options: AllocOptions) -> DeviceAddr {
        let offset = match options.direction {
            Direction::BottomUp => 0,
            Direction::TopDown => self.blocks.size(block) - alloc_size,
        };
        if let Some(limit) = options.address_limit {
            let address = self.config.to_absolute(self.blocks.address(block) + offset);
            if address >= limit {
                fatal(FatalError::AddressLimitExceeded { limit, address });
            }
        }
        offset
    }

    /// Find the free block that can hold `[absolute, absolute + alloc_size)`.
    pub fn locate(&self, absolute: DeviceAddr, alloc_size: DeviceAddr) -> Option<Block> {
        let address = match self.config.to_relative(absolute) {
            Some(address) => address,
            None => {
                log::warn!(
                    "Address {:#x} is below the bank offset {:#x}",
                    absolute,
                    self.config.offset_bytes
                );
                return None;
            }
        };
        if address % self.config.alignment != 0 {
            log::warn!(
                "Address {:#x} is not {} B aligned",
                absolute,
                self.config.alignment
            );
            return None;
        }

        let block = self.blocks.find_containing(address, alloc_size)?;
        if block.allocated {
            return None;
        }
        Some(block)
    }

    /// Check a shrink request and find the free block the cut lands in.
    #[track_caller]
    pub fn shrink_target(&self, amount: DeviceAddr, direction: Direction) -> BlockIndex {
        if direction == Direction::TopDown {
            fatal(FatalError::TopDownShrinkUnsupported);
        }
        if amount > self.max_size_bytes {
            fatal(FatalError::ShrinkExceedsCapacity {
                amount,
                max_size: self.max_size_bytes,
            });
        }
        match self.blocks.front_cut(amount) {
            Ok(index) => index,
            Err(address) => fatal(FatalError::ShrinkCutsIntoAllocation {
                amount,
                address: self.config.to_absolute(address),
            }),
        }
    }

    pub fn lowest_occupied_address(&self) -> Option<DeviceAddr> {
        self.blocks
            .iter()
            .find(|block| block.allocated)
            .map(|block| self.config.to_absolute(block.address))
    }

    pub fn available_addresses(&self, size_bytes: DeviceAddr) -> Vec<Range<DeviceAddr>> {
        let alloc_size = match self.alloc_size(size_bytes) {
            Some(size) => size,
            None => return Vec::new(),
        };
        self.blocks
            .iter()
            .filter(|block| !block.allocated && block.size >= alloc_size)
            .map(|block| self.config.to_absolute(block.address)..self.config.to_absolute(block.end()))
            .collect()
    }

    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics {
            total_allocatable_size_bytes: self.max_size_bytes,
            ..Statistics::default()
        };

        for block in &self.blocks {
            if block.allocated {
                stats.total_allocated_bytes += block.size;
                continue;
            }
            stats.total_free_bytes += block.size;
            if block.size > stats.largest_free_block_bytes {
                stats.largest_free_block_bytes = block.size;
                stats.largest_free_block_addrs.clear();
            }
            if block.size == stats.largest_free_block_bytes {
                stats
                    .largest_free_block_addrs
                    .push(self.config.to_absolute(block.address));
            }
        }

        stats
    }
}
