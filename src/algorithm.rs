//! The contract every allocation strategy implements.
//!
//! A strategy manages the byte range `[0, max_size_bytes)` of one bank. Every
//! address handed across this interface is absolute: the bank's
//! `offset_bytes` is added on the way out and subtracted on the way in.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use crate::block_table::Validity;
use crate::error::{fatal, FatalError};

/// A byte address (or byte count) within a device's address space.
pub type DeviceAddr = u64;

// Round value up to the nearest multiple of increment, or None on overflow
pub(crate) fn round_up(value: DeviceAddr, increment: DeviceAddr) -> Option<DeviceAddr> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment + 1).checked_mul(increment)
}

/// The fixed parameters of a bank allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankConfig {
    /// Usable bytes in the bank.
    pub max_size_bytes: DeviceAddr,
    /// Where the bank starts in the larger address space. Added to every
    /// address returned to callers.
    pub offset_bytes: DeviceAddr,
    /// No allocation is granted fewer bytes than this.
    pub min_allocation_size: DeviceAddr,
    /// Power-of-two granularity of all addresses and sizes.
    pub alignment: DeviceAddr,
}

impl BankConfig {
    pub const fn new(
        max_size_bytes: DeviceAddr,
        offset_bytes: DeviceAddr,
        min_allocation_size: DeviceAddr,
        alignment: DeviceAddr,
    ) -> Self {
        BankConfig {
            max_size_bytes,
            offset_bytes,
            min_allocation_size,
            alignment,
        }
    }

    /// Check that the parameters describe a bank the allocators can manage.
    pub fn validate(&self) -> Result<(), FatalError> {
        let alignment = self.alignment;
        if !alignment.is_power_of_two() {
            return Err(FatalError::InvalidAlignment { alignment });
        }
        if self.offset_bytes % alignment != 0 {
            return Err(FatalError::MisalignedOffset {
                offset: self.offset_bytes,
                alignment,
            });
        }
        if self.max_size_bytes % alignment != 0 {
            return Err(FatalError::MisalignedSize {
                size: self.max_size_bytes,
                alignment,
            });
        }
        if self.offset_bytes.checked_add(self.max_size_bytes).is_none() {
            return Err(FatalError::BankOutOfRange {
                offset: self.offset_bytes,
                size: self.max_size_bytes,
            });
        }
        Ok(())
    }

    /// Like `validate`, but a bad config is a contract violation.
    #[track_caller]
    pub(crate) fn validated(self) -> Self {
        if let Err(err) = self.validate() {
            fatal(err);
        }
        self
    }

    /// Round an address or size up to the bank's alignment. `None` if that
    /// does not fit in a `DeviceAddr`.
    pub fn align(&self, value: DeviceAddr) -> Option<DeviceAddr> {
        round_up(value, self.alignment)
    }

    /// The number of bytes actually granted for a request of `size_bytes`,
    /// or `None` if no bank could ever hold it.
    pub fn alloc_size(&self, size_bytes: DeviceAddr) -> Option<DeviceAddr> {
        let size = self.align(size_bytes.max(self.min_allocation_size))?;
        if size == 0 {
            Some(self.alignment)
        } else {
            Some(size)
        }
    }

    pub(crate) fn to_absolute(&self, address: DeviceAddr) -> DeviceAddr {
        address + self.offset_bytes
    }

    /// Translate an absolute address into the bank, if it can lie within it.
    pub(crate) fn to_relative(&self, absolute: DeviceAddr) -> Option<DeviceAddr> {
        absolute.checked_sub(self.offset_bytes)
    }
}

/// Which end of a free block an allocation is carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Carve from the low end; the bank fills from address 0 upwards.
    BottomUp,
    /// Carve from the high end; the bank fills from the top downwards.
    TopDown,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::BottomUp
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocOptions {
    pub direction: Direction,
    /// When set, the returned absolute address must be strictly below this.
    /// Failing to honor the limit is fatal, not an out-of-memory.
    pub address_limit: Option<DeviceAddr>,
}

impl AllocOptions {
    pub fn top_down() -> Self {
        AllocOptions {
            direction: Direction::TopDown,
            address_limit: None,
        }
    }

    /// Require the allocation to start below `limit`. A limit of 0 means no
    /// limit at all.
    pub fn below(self, limit: DeviceAddr) -> Self {
        AllocOptions {
            address_limit: if limit == 0 { None } else { Some(limit) },
            ..self
        }
    }
}

/// A snapshot of how the bank is used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total_allocatable_size_bytes: DeviceAddr,
    pub total_allocated_bytes: DeviceAddr,
    pub total_free_bytes: DeviceAddr,
    pub largest_free_block_bytes: DeviceAddr,
    /// Absolute addresses of every free block of `largest_free_block_bytes`.
    pub largest_free_block_addrs: Vec<DeviceAddr>,
}

/// An allocation strategy for a single bank.
///
/// Implementations are not thread-safe; callers serialize access (see
/// [`Locked`](crate::Locked) for one way to do that).
pub trait Algorithm {
    fn config(&self) -> &BankConfig;

    /// Currently usable bytes; reduced by [`shrink_size`](Self::shrink_size).
    fn max_size_bytes(&self) -> DeviceAddr;

    /// Bytes currently carved out at the low end of the bank.
    fn shrunk_bytes(&self) -> DeviceAddr;

    /// Absolute address of the lowest allocated block.
    fn lowest_occupied_address(&self) -> Option<DeviceAddr>;

    /// Every free `[start, end)` range, in address order, that could hold an
    /// allocation of `size_bytes`.
    fn available_addresses(&self, size_bytes: DeviceAddr) -> Vec<Range<DeviceAddr>>;

    /// Allocate `size_bytes` (rounded up to the minimum size and alignment).
    ///
    /// Returns `None` when no free block is large enough.
    fn allocate_with(&mut self, size_bytes: DeviceAddr, options: AllocOptions) -> Option<DeviceAddr>;

    /// Bottom-up allocation without an address limit.
    fn allocate(&mut self, size_bytes: DeviceAddr) -> Option<DeviceAddr> {
        self.allocate_with(size_bytes, AllocOptions::default())
    }

    /// Allocate exactly at `absolute_address`, or return `None` if that range
    /// is not entirely free.
    fn allocate_at_address(
        &mut self,
        absolute_address: DeviceAddr,
        size_bytes: DeviceAddr,
    ) -> Option<DeviceAddr>;

    /// Release the block starting at `absolute_address`.
    ///
    /// # Panics
    ///
    /// If no block is allocated at that address.
    fn deallocate(&mut self, absolute_address: DeviceAddr);

    /// Forget every allocation, as if freshly constructed.
    fn clear(&mut self);

    fn statistics(&self) -> Statistics;

    /// Carve `amount` bytes off the low end of the usable range.
    ///
    /// # Panics
    ///
    /// If the cut would land in an allocated block, or exceeds the usable
    /// size, or `direction` is `TopDown`.
    fn shrink_size(&mut self, amount: DeviceAddr, direction: Direction);

    /// Give back everything removed by `shrink_size`.
    fn reset_size(&mut self);

    /// Check the structural invariants of the allocator.
    fn validity(&self) -> Validity;

    fn dump_blocks(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}

impl<A: Algorithm + ?Sized> Algorithm for Box<A> {
    fn config(&self) -> &BankConfig {
        (**self).config()
    }

    fn max_size_bytes(&self) -> DeviceAddr {
        (**self).max_size_bytes()
    }

    fn shrunk_bytes(&self) -> DeviceAddr {
        (**self).shrunk_bytes()
    }

    fn lowest_occupied_address(&self) -> Option<DeviceAddr> {
        (**self).lowest_occupied_address()
    }

    fn available_addresses(&self, size_bytes: DeviceAddr) -> Vec<Range<DeviceAddr>> {
        (**self).available_addresses(size_bytes)
    }

    fn allocate_with(&mut self, size_bytes: DeviceAddr, options: AllocOptions) -> Option<DeviceAddr> {
        (**self).allocate_with(size_bytes, options)
    }

    fn allocate_at_address(
        &mut self,
        absolute_address: DeviceAddr,
        size_bytes: DeviceAddr,
    ) -> Option<DeviceAddr> {
        (**self).allocate_at_address(absolute_address, size_bytes)
    }

    fn deallocate(&mut self, absolute_address: DeviceAddr) {
        (**self).deallocate(absolute_address)
    }

    fn clear(&mut self) {
        (**self).clear()
    }

    fn statistics(&self) -> Statistics {
        (**self).statistics()
    }

    fn shrink_size(&mut self, amount: DeviceAddr, direction: Direction) {
        (**self).shrink_size(amount, direction)
    }

    fn reset_size(&mut self) {
        (**self).reset_size()
    }

    fn validity(&self) -> Validity {
        (**self).validity()
    }

    fn dump_blocks(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        (**self).dump_blocks(out)
    }
}
