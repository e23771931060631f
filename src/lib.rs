#![cfg_attr(not(test), no_std)]

//! Address-space allocators for fixed-size memory banks.
//!
//! A bank is a contiguous range of device memory, for example one DRAM or
//! L1 bank on an accelerator. The allocators here never touch that memory:
//! they hand out and take back byte ranges, so the same code can manage any
//! address space the caller describes with a [`BankConfig`].
//!
//! ### [`FreeList`](struct.FreeList.html)
//!
//! A single address-ordered list of blocks, searched linearly with either a
//! first-fit or best-fit [`SearchPolicy`]. Simple and obviously correct.
//!
//! ### [`FreeListOpt`](struct.FreeListOpt.html)
//!
//! The same algorithm with the block list stored as parallel arrays, free
//! blocks segregated into power-of-two size classes, and a hash index from
//! address to allocated block. This is the one to use.
//!
//! Both implement [`Algorithm`]; [`Strategy`] picks one at runtime, and
//! [`Locked`] makes either shareable between threads.
//!
//! Running out of space is reported with `None`. Misuse (double frees,
//! shrinking into live data, bad configuration) panics with a
//! [`FatalError`] message after logging it.

extern crate alloc;

use alloc::boxed::Box;

pub mod algorithm;
pub mod alloc_index;
mod bank;
pub mod block_table;
pub mod error;
pub mod free_list;
pub mod free_list_opt;
pub mod locked;
pub mod size_class;

pub use algorithm::{AllocOptions, Algorithm, BankConfig, DeviceAddr, Direction, Statistics};
pub use block_table::Validity;
pub use error::FatalError;
pub use free_list::{FreeList, SearchPolicy};
pub use free_list_opt::FreeListOpt;
pub use locked::Locked;

/// The available allocation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// [`FreeList`] taking the lowest free block that fits.
    FirstFit,
    /// [`FreeList`] taking the smallest free block that fits.
    BestFit,
    /// [`FreeListOpt`], searching size-class buckets.
    Segregated,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::FirstFit, Strategy::BestFit, Strategy::Segregated];

    /// Construct an allocator of this kind for the bank described by `config`.
    ///
    /// # Panics
    ///
    /// If `config` does not pass [`BankConfig::validate`].
    #[track_caller]
    pub fn build(self, config: BankConfig) -> Box<dyn Algorithm + Send> {
        log::debug!("Building {:?} allocator for {:?}", self, config);
        match self {
            Strategy::FirstFit => Box::new(FreeList::new(config, SearchPolicy::First)),
            Strategy::BestFit => Box::new(FreeList::new(config, SearchPolicy::Best)),
            Strategy::Segregated => Box::new(FreeListOpt::new(config)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    const KIB: DeviceAddr = 1024;
    const GIB: DeviceAddr = 1024 * 1024 * 1024;

    fn allocators() -> impl Iterator<Item = (Strategy, Box<dyn Algorithm + Send>)> {
        Strategy::ALL
            .to_vec()
            .into_iter()
            .map(|s| (s, s.build(BankConfig::new(GIB, 0, KIB, KIB))))
    }

    #[test]
    fn test_bump_allocation() {
        for (strategy, mut allocator) in allocators() {
            assert_eq!(allocator.allocate(KIB), Some(0), "{:?}", strategy);
            assert_eq!(allocator.allocate(KIB), Some(KIB), "{:?}", strategy);
            assert!(allocator.validity().is_valid(), "{:?}", strategy);
        }
    }

    #[test]
    fn test_coalescing() {
        for (strategy, mut allocator) in allocators() {
            let addrs: Vec<_> = (0..3).map(|_| allocator.allocate(KIB).unwrap()).collect();
            assert_eq!(addrs, vec![0, KIB, 2 * KIB], "{:?}", strategy);

            allocator.deallocate(addrs[1]);
            allocator.deallocate(addrs[0]);
            assert_eq!(allocator.allocate(2 * KIB), Some(0), "{:?}", strategy);
            assert!(allocator.validity().is_valid(), "{:?}", strategy);
        }
    }

    #[test]
    fn test_shrink_and_reset() {
        for (strategy, mut allocator) in allocators() {
            let a = allocator.allocate(KIB).unwrap();
            let b = allocator.allocate(KIB).unwrap();
            allocator.deallocate(a);

            allocator.shrink_size(KIB, Direction::BottomUp);
            assert_eq!(allocator.allocate_at_address(0, KIB), None, "{:?}", strategy);
            assert_eq!(allocator.allocate_at_address(KIB, KIB), None, "{:?}", strategy);

            allocator.reset_size();
            allocator.deallocate(b);
            assert_eq!(allocator.allocate(2 * KIB), Some(0), "{:?}", strategy);
            assert!(allocator.validity().is_valid(), "{:?}", strategy);
        }
    }

    #[test]
    fn test_top_down() {
        for (strategy, mut allocator) in allocators() {
            let top_down = AllocOptions::top_down();
            assert_eq!(allocator.allocate_with(KIB, top_down), Some(GIB - KIB), "{:?}", strategy);
            assert_eq!(allocator.allocate_with(KIB, top_down), Some(GIB - 2 * KIB), "{:?}", strategy);
        }
    }

    #[test]
    fn test_exhaustion() {
        for (strategy, mut allocator) in allocators() {
            assert_eq!(allocator.allocate(GIB), Some(0), "{:?}", strategy);
            assert_eq!(allocator.allocate(KIB), None, "{:?}", strategy);

            let stats = allocator.statistics();
            assert_eq!(stats.total_free_bytes, 0);
            assert!(stats.largest_free_block_addrs.is_empty());
        }
    }

    #[test]
    fn test_strategies_agree_on_simple_sequences() {
        let mut results = Vec::new();
        for (_, mut allocator) in allocators() {
            let a = allocator.allocate(4 * KIB).unwrap();
            let _b = allocator.allocate(KIB).unwrap();
            allocator.deallocate(a);
            let c = allocator.allocate(2 * KIB);
            let d = allocator.allocate_with(KIB, AllocOptions::top_down());
            results.push((c, d, allocator.statistics()));
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]), "{:?}", results);
    }

    #[test]
    fn test_oversized_requests() {
        for (strategy, mut allocator) in allocators() {
            assert_eq!(allocator.allocate(DeviceAddr::MAX), None, "{:?}", strategy);
            assert_eq!(allocator.allocate(DeviceAddr::MAX - KIB), None, "{:?}", strategy);
            assert_eq!(
                allocator.allocate_with(GIB + 1, AllocOptions::top_down()),
                None,
                "{:?}",
                strategy
            );
            assert_eq!(allocator.allocate_at_address(0, DeviceAddr::MAX), None, "{:?}", strategy);
            assert_eq!(allocator.allocate_at_address(KIB, GIB), None, "{:?}", strategy);
            assert!(allocator.available_addresses(DeviceAddr::MAX).is_empty());

            // Nothing was touched
            assert_eq!(allocator.available_addresses(KIB), vec![0..GIB], "{:?}", strategy);
            assert!(allocator.validity().is_valid(), "{:?}", strategy);
        }
    }

    #[test]
    fn test_zero_address_limit() {
        for (strategy, mut allocator) in allocators() {
            let options = AllocOptions::top_down().below(0);
            assert_eq!(allocator.allocate_with(KIB, options), Some(GIB - KIB), "{:?}", strategy);
        }
    }

    #[test]
    fn test_bank_at_top_of_address_space() {
        let offset = DeviceAddr::MAX - GIB;
        for &strategy in Strategy::ALL.iter() {
            let mut allocator = strategy.build(BankConfig::new(GIB, offset, 1, 1));
            assert_eq!(
                allocator.allocate_with(KIB, AllocOptions::top_down()),
                Some(DeviceAddr::MAX - KIB),
                "{:?}",
                strategy
            );
            assert_eq!(allocator.available_addresses(1), vec![offset..DeviceAddr::MAX - KIB]);
        }
    }

    #[test]
    #[should_panic(expected = "runs past the end of the address space")]
    fn test_build_rejects_wrapping_bank() {
        Strategy::FirstFit.build(BankConfig::new(1 << 20, DeviceAddr::MAX & !1023, KIB, KIB));
    }

    #[test]
    #[should_panic(expected = "must be a non-zero power of two")]
    fn test_build_rejects_bad_alignment() {
        Strategy::Segregated.build(BankConfig::new(GIB, 0, KIB, 3000));
    }
}
