//! Reverse lookup from an allocated block's address to its table slot.
//!
//! A fixed number of hash buckets, each a short vector of `(address, index)`
//! pairs. Addresses come out of the allocator aligned, so they are mixed with
//! a multiplicative hash before picking a bucket.

use alloc::vec::Vec;

use crate::algorithm::DeviceAddr;
use crate::block_table::BlockIndex;

const BUCKET_BITS: u32 = 9;
const BUCKET_COUNT: usize = 1 << BUCKET_BITS;
/// Initial room in each bucket.
const BUCKET_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct AllocatedIndex {
    buckets: Vec<Vec<(DeviceAddr, BlockIndex)>>,
    len: usize,
}

impl Default for AllocatedIndex {
    fn default() -> Self {
        AllocatedIndex {
            buckets: (0..BUCKET_COUNT)
                .map(|_| Vec::with_capacity(BUCKET_CAPACITY))
                .collect(),
            len: 0,
        }
    }
}

fn hash(address: DeviceAddr) -> usize {
    // Fibonacci hashing: take the top bits of the product
    (address.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (64 - BUCKET_BITS)) as usize
}

impl AllocatedIndex {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record that the block at `index` is allocated at `address`.
    ///
    /// Panics if `address` is already recorded.
    pub fn insert(&mut self, address: DeviceAddr, index: BlockIndex) {
        let bucket = &mut self.buckets[hash(address)];
        assert!(
            bucket.iter().all(|&(a, _)| a != address),
            "Block at {:#x} already allocated",
            address
        );
        bucket.push((address, index));
        self.len += 1;
    }

    pub fn get(&self, address: DeviceAddr) -> Option<BlockIndex> {
        self.buckets[hash(address)]
            .iter()
            .find(|&&(a, _)| a == address)
            .map(|&(_, index)| index)
    }

    pub fn contains(&self, address: DeviceAddr) -> bool {
        self.get(address).is_some()
    }

    /// Remove the entry for `address`, returning its block.
    pub fn remove(&mut self, address: DeviceAddr) -> Option<BlockIndex> {
        let bucket = &mut self.buckets[hash(address)];
        let pos = bucket.iter().position(|&(a, _)| a == address)?;
        self.len -= 1;
        Some(bucket.swap_remove(pos).1)
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.len = 0;
    }
}
