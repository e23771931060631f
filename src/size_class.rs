//! Segregated free lists.
//!
//! Free blocks are filed into buckets by a logarithmic size class, so a
//! best-fit search can skip every block that is certainly too small. Within a
//! bucket, blocks stay in insertion order; they are not sorted by size.

use alloc::vec::Vec;
use core::fmt;

use static_assertions::const_assert;

use crate::algorithm::DeviceAddr;
use crate::block_table::BlockIndex;

/// Size of the smallest size class, in bytes.
pub const DEFAULT_SIZE_CLASS_BASE: DeviceAddr = 1024;
/// Number of size classes. The last one holds everything larger.
pub const DEFAULT_SIZE_CLASS_COUNT: usize = 12;

const_assert!(DEFAULT_SIZE_CLASS_BASE.is_power_of_two());
const_assert!(DEFAULT_SIZE_CLASS_COUNT > 0);
const_assert!(DEFAULT_SIZE_CLASS_COUNT < 64);

#[derive(Debug, Clone)]
pub struct SizeClasses {
    base: DeviceAddr,
    buckets: Vec<Vec<BlockIndex>>,
}

impl Default for SizeClasses {
    fn default() -> Self {
        SizeClasses::new(DEFAULT_SIZE_CLASS_BASE, DEFAULT_SIZE_CLASS_COUNT)
    }
}

impl SizeClasses {
    pub fn new(base: DeviceAddr, count: usize) -> Self {
        assert!(base > 0, "size class base must be non-zero");
        assert!(count > 0 && count < 64, "size class count {} out of range", count);
        SizeClasses {
            base,
            buckets: (0..count).map(|_| Vec::new()).collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.buckets.len()
    }

    /// The class of a block of `size` bytes: `floor(log2(size / base))`,
    /// capped at the last class.
    pub fn class_of(&self, size: DeviceAddr) -> usize {
        let n = size / self.base;
        // floor(log2(0)) is taken to be 0, like floor(log2(1))
        let lg = if n == 0 {
            0
        } else {
            (63 - n.leading_zeros()) as usize
        };
        lg.min(self.count() - 1)
    }

    pub fn bucket(&self, class: usize) -> &[BlockIndex] {
        &self.buckets[class]
    }

    pub fn insert(&mut self, index: BlockIndex, size: DeviceAddr) {
        let class = self.class_of(size);
        log::trace!("Filing block {} ({} bytes) in class {}", index, size, class);
        self.buckets[class].push(index);
    }

    /// Remove `index` from the bucket for `size`. Returns whether it was there.
    pub fn remove(&mut self, index: BlockIndex, size: DeviceAddr) -> bool {
        let class = self.class_of(size);
        let bucket = &mut self.buckets[class];
        match bucket.iter().position(|&i| i == index) {
            Some(pos) => {
                bucket.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Remove and return the entry at `pos` in `class`.
    pub fn take(&mut self, class: usize, pos: usize) -> BlockIndex {
        self.buckets[class].remove(pos)
    }

    /// Search for a block of at least `size` bytes, starting from its size
    /// class and moving up.
    ///
    /// Each bucket is scanned in full: an exact fit is taken immediately,
    /// otherwise the smallest adequate block in the bucket wins, ties going to
    /// the first one seen. The first bucket with any candidate ends the
    /// search. Returns `(class, position)` of the pick.
    pub fn find_fit<F>(&self, size: DeviceAddr, size_of: F) -> Option<(usize, usize)>
    where
        F: Fn(BlockIndex) -> DeviceAddr,
    {
        for class in self.class_of(size)..self.count() {
            let mut best: Option<(usize, DeviceAddr)> = None;
            for (pos, &index) in self.buckets[class].iter().enumerate() {
                let candidate = size_of(index);
                if candidate == size {
                    return Some((class, pos));
                }
                if candidate > size && best.map_or(true, |(_, s)| candidate < s) {
                    best = Some((pos, candidate));
                }
            }
            if let Some((pos, _)) = best {
                return Some((class, pos));
            }
        }
        None
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    /// Every filed entry, as `(class, index)`.
    pub fn entries(&self) -> impl Iterator<Item = (usize, BlockIndex)> + '_ {
        self.buckets
            .iter()
            .enumerate()
            .flat_map(|(class, bucket)| bucket.iter().map(move |&i| (class, i)))
    }

    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let last = self.count() - 1;
        for (class, bucket) in self.buckets.iter().enumerate() {
            let low = self.base << class;
            if class == last {
                write!(out, "  Size class {}: ({} - inf) blocks:", class, low)?;
            } else {
                write!(out, "  Size class {}: ({} - {}) blocks:", class, low, low << 1)?;
            }
            for index in bucket {
                write!(out, " {}", index)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}
