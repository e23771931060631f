//! Block metadata storage shared by the free-list strategies.
//!
//! A `BlockTable` holds every block in the bank, free or allocated, as a
//! doubly linked list ordered by address. The list is embedded in parallel
//! arrays ("structure of arrays") and linked by integer [`BlockIndex`]
//! handles rather than pointers. Slots of blocks that are merged away are kept
//! in a pool and reused before the arrays grow.
//!
//! The table only knows about bank-relative addresses; translating to and from
//! absolute addresses is up to the strategy that owns it.

use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use crate::algorithm::DeviceAddr;

/// Reduce reallocations by reserving room for this many blocks up front.
const INITIAL_BLOCK_COUNT: usize = 60;

/// A handle to a slot in a [`BlockTable`].
///
/// Handles are not addresses, and are only meaningful until the block they
/// name is merged away or consumed; after that the slot may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex(pub(crate) usize);

impl BlockIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A copy of one block's metadata, as yielded by [`BlockTable::iter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub index: BlockIndex,
    pub address: DeviceAddr,
    pub size: DeviceAddr,
    pub allocated: bool,
}

impl Block {
    pub fn end(&self) -> DeviceAddr {
        self.address + self.size
    }

    pub fn as_range(&self) -> Range<DeviceAddr> {
        self.address..self.end()
    }

    /// Compare two blocks to see how they are ordered.
    fn relation(&self, other: &Self) -> Relation {
        let self_range = self.as_range();
        let other_range = other.as_range();

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }
}

/// An enum for easy comparison of blocks and their order
enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// The free remainders created when a block is carved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Carve {
    pub left: Option<BlockIndex>,
    pub right: Option<BlockIndex>,
}

impl Carve {
    pub fn remainders(self) -> impl Iterator<Item = BlockIndex> {
        self.left.into_iter().chain(self.right)
    }
}

/// Validity contains a representation of all invalid states found in an
/// allocator.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Number of blocks overlapping their predecessor.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,
    /// Number of holes in the coverage of the usable range, including
    /// uncovered space at either end.
    pub gaps: usize,
    /// Number of blocks that do not have an address greater than their
    /// predecessor.
    pub out_of_orders: usize,
    /// Number of blocks whose `prev` does not point back at the block that
    /// links to them.
    pub broken_links: usize,
    /// Number of neighbouring block pairs that are both free. These should
    /// have been merged on deallocation.
    pub adjacent_free: usize,
    /// Number of free blocks missing from the size-class index, or filed
    /// under the wrong class, or filed more than once.
    pub misfiled: usize,
    /// Number of allocated blocks that cannot be found through the allocated
    /// index (or stale index entries).
    pub unindexed: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        *self == Validity::default()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// Structure-of-arrays block storage forming an address-ordered linked list.
#[derive(Debug, Clone)]
pub struct BlockTable {
    address: Vec<DeviceAddr>,
    size: Vec<DeviceAddr>,
    prev: Vec<Option<BlockIndex>>,
    next: Vec<Option<BlockIndex>>,
    allocated: Vec<bool>,

    // Slots not currently holding a block, reused before growing
    free_slots: Vec<BlockIndex>,
    head: Option<BlockIndex>,
}

pub struct BlockIter<'table> {
    table: &'table BlockTable,
    next: Option<BlockIndex>,
}

impl<'table> Iterator for BlockIter<'table> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next.take()?;

        self.next = self.table.next(index);

        Some(self.table.block(index))
    }
}

impl<'table> IntoIterator for &'table BlockTable {
    type Item = Block;
    type IntoIter = BlockIter<'table>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl Default for BlockTable {
    fn default() -> Self {
        BlockTable {
            address: Vec::with_capacity(INITIAL_BLOCK_COUNT),
            size: Vec::with_capacity(INITIAL_BLOCK_COUNT),
            prev: Vec::with_capacity(INITIAL_BLOCK_COUNT),
            next: Vec::with_capacity(INITIAL_BLOCK_COUNT),
            allocated: Vec::with_capacity(INITIAL_BLOCK_COUNT),
            free_slots: Vec::with_capacity(INITIAL_BLOCK_COUNT),
            head: None,
        }
    }
}

impl fmt::Display for BlockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockTable(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            let state = if block.allocated { "used" } else { "free" };
            write!(f, "Block({:#x}, {}, {})", block.address, block.size, state)?;
        }

        write!(f, ")")
    }
}

impl BlockTable {
    /// Create a table holding a single free block `[address, address + size)`.
    pub fn new(address: DeviceAddr, size: DeviceAddr) -> Self {
        let mut table = BlockTable::default();
        table.reset(address, size);
        table
    }

    /// Drop every block and start over with a single free block spanning
    /// `[address, address + size)`. An empty span leaves the table empty.
    pub fn reset(&mut self, address: DeviceAddr, size: DeviceAddr) -> Option<BlockIndex> {
        self.address.clear();
        self.size.clear();
        self.prev.clear();
        self.next.clear();
        self.allocated.clear();
        self.free_slots.clear();
        self.head = None;

        if size == 0 {
            return None;
        }
        let index = self.alloc_slot(address, size, None, None, false);
        self.head = Some(index);
        Some(index)
    }

    pub fn head(&self) -> Option<BlockIndex> {
        self.head
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            table: self,
            next: self.head,
        }
    }

    /// Number of blocks currently in the list.
    pub fn len(&self) -> usize {
        self.address.len() - self.free_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of slots, including unused ones awaiting reuse.
    pub fn slot_count(&self) -> usize {
        self.address.len()
    }

    pub fn free_slots(&self) -> &[BlockIndex] {
        &self.free_slots
    }

    pub fn block(&self, index: BlockIndex) -> Block {
        Block {
            index,
            address: self.address(index),
            size: self.size(index),
            allocated: self.is_allocated(index),
        }
    }

    pub fn address(&self, index: BlockIndex) -> DeviceAddr {
        self.address[index.0]
    }

    pub fn size(&self, index: BlockIndex) -> DeviceAddr {
        self.size[index.0]
    }

    pub fn end(&self, index: BlockIndex) -> DeviceAddr {
        self.address(index) + self.size(index)
    }

    pub fn prev(&self, index: BlockIndex) -> Option<BlockIndex> {
        self.prev[index.0]
    }

    pub fn next(&self, index: BlockIndex) -> Option<BlockIndex> {
        self.next[index.0]
    }

    pub fn is_allocated(&self, index: BlockIndex) -> bool {
        self.allocated[index.0]
    }

    pub fn set_allocated(&mut self, index: BlockIndex, allocated: bool) {
        self.allocated[index.0] = allocated;
    }

    /// The block in the list containing all of `[address, address + size)`,
    /// if there is one.
    pub fn find_containing(&self, address: DeviceAddr, size: DeviceAddr) -> Option<Block> {
        let end = address.checked_add(size)?;
        self.iter()
            .take_while(|block| block.address <= address)
            .find(|block| block.end() >= end)
    }

    /// Store a block, preferring a previously freed slot.
    fn alloc_slot(
        &mut self,
        address: DeviceAddr,
        size: DeviceAddr,
        prev: Option<BlockIndex>,
        next: Option<BlockIndex>,
        allocated: bool,
    ) -> BlockIndex {
        match self.free_slots.pop() {
            Some(index) => {
                let i = index.0;
                self.address[i] = address;
                self.size[i] = size;
                self.prev[i] = prev;
                self.next[i] = next;
                self.allocated[i] = allocated;
                index
            }
            None => {
                let index = BlockIndex(self.address.len());
                self.address.push(address);
                self.size.push(size);
                self.prev.push(prev);
                self.next.push(next);
                self.allocated.push(allocated);
                index
            }
        }
    }

    /// Unlink a block from the list and return its slot to the pool.
    fn retire(&mut self, index: BlockIndex) {
        let prev = self.prev(index);
        let next = self.next(index);
        match prev {
            Some(p) => self.next[p.0] = next,
            None => self.head = next,
        }
        if let Some(n) = next {
            self.prev[n.0] = prev;
        }
        self.prev[index.0] = None;
        self.next[index.0] = None;
        self.size[index.0] = 0;
        self.allocated[index.0] = false;
        self.free_slots.push(index);
    }

    /// Link a new block in directly before `index`.
    fn link_before(
        &mut self,
        index: BlockIndex,
        address: DeviceAddr,
        size: DeviceAddr,
        allocated: bool,
    ) -> BlockIndex {
        let prev = self.prev(index);
        let new_index = self.alloc_slot(address, size, prev, Some(index), allocated);
        match prev {
            Some(p) => self.next[p.0] = Some(new_index),
            None => self.head = Some(new_index),
        }
        self.prev[index.0] = Some(new_index);
        new_index
    }

    /// Link a new block in directly after `index`.
    fn link_after(
        &mut self,
        index: BlockIndex,
        address: DeviceAddr,
        size: DeviceAddr,
        allocated: bool,
    ) -> BlockIndex {
        let next = self.next(index);
        let new_index = self.alloc_slot(address, size, Some(index), next, allocated);
        if let Some(n) = next {
            self.prev[n.0] = Some(new_index);
        }
        self.next[index.0] = Some(new_index);
        new_index
    }

    /// Mark `[offset, offset + size)` of the block at `index` as allocated.
    ///
    /// Whatever is left over on either side is split off into new free
    /// blocks, which are returned so the caller can index them. The block
    /// keeps its handle and afterwards covers exactly the allocated range.
    ///
    /// Panics if the range does not fit inside the block.
    pub fn carve(&mut self, index: BlockIndex, offset: DeviceAddr, size: DeviceAddr) -> Carve {
        let block_size = self.size(index);
        assert!(
            offset + size <= block_size,
            "Can't carve {}+{} out of a block of size {}",
            offset,
            size,
            block_size,
        );
        debug_assert!(!self.is_allocated(index), "carving an allocated block");

        let mut carve = Carve::default();

        if offset > 0 {
            let address = self.address(index);
            carve.left = Some(self.link_before(index, address, offset, false));
            self.address[index.0] += offset;
            self.size[index.0] -= offset;
        }

        let tail = self.size(index) - size;
        if tail > 0 {
            let address = self.address(index) + size;
            carve.right = Some(self.link_after(index, address, tail, false));
            self.size[index.0] = size;
        }

        self.allocated[index.0] = true;
        log::trace!(
            "Carved {:#x}+{} from block {}, leaving {:?}",
            self.address(index),
            size,
            index,
            carve,
        );
        carve
    }

    /// Absorb the following block into the block at `index`.
    ///
    /// Returns the retired handle of the absorbed block. Panics if there is
    /// no next block.
    pub fn merge_next(&mut self, index: BlockIndex) -> BlockIndex {
        let next = self
            .next(index)
            .expect("merge_next called on the last block");
        debug_assert_eq!(self.end(index), self.address(next), "merging non-adjacent blocks");

        self.size[index.0] += self.size(next);
        self.retire(next);
        log::trace!(
            "Merged block {} into {}: now {:#x}+{}",
            next,
            index,
            self.address(index),
            self.size(index),
        );
        next
    }

    /// Free the block at `index` and merge it with any free neighbours.
    ///
    /// `absorb` is called with each neighbour that is about to be merged
    /// (and its size before the merge), so callers can drop it from any index
    /// keyed by size. Returns the handle of the final merged block.
    pub fn coalesce<F>(&mut self, index: BlockIndex, mut absorb: F) -> BlockIndex
    where
        F: FnMut(BlockIndex, DeviceAddr),
    {
        self.set_allocated(index, false);
        let mut index = index;

        if let Some(prev) = self.prev(index) {
            if !self.is_allocated(prev) {
                absorb(prev, self.size(prev));
                self.merge_next(prev);
                index = prev;
            }
        }

        if let Some(next) = self.next(index) {
            if !self.is_allocated(next) {
                absorb(next, self.size(next));
                self.merge_next(index);
            }
        }

        index
    }

    /// Find the block that a cut of `amount` bytes off the front of the list
    /// lands in. Only a free lowest block can be cut.
    ///
    /// On failure, returns the address of the allocated block that the cut
    /// would slice into.
    pub fn front_cut(&self, amount: DeviceAddr) -> Result<BlockIndex, DeviceAddr> {
        let head = self.head.ok_or(0 as DeviceAddr)?;
        if self.is_allocated(head) {
            return Err(self.address(head));
        }
        if self.size(head) >= amount {
            return Ok(head);
        }
        // Free blocks are never adjacent, so whatever follows is in use
        match self.next(head) {
            Some(next) => Err(self.address(next)),
            None => Err(self.end(head)),
        }
    }

    /// Cut `amount` bytes off the front of the block at `index`.
    ///
    /// Returns `None` if that consumes the block entirely (its slot is
    /// retired), and the still-live handle otherwise.
    pub fn truncate_front(&mut self, index: BlockIndex, amount: DeviceAddr) -> Option<BlockIndex> {
        let size = self.size(index);
        assert!(amount <= size, "Can't truncate {} bytes off a block of size {}", amount, size);
        if amount == size {
            self.retire(index);
            return None;
        }
        self.address[index.0] += amount;
        self.size[index.0] -= amount;
        Some(index)
    }

    /// Link a new block in as the lowest block of the list.
    pub fn push_front(&mut self, address: DeviceAddr, size: DeviceAddr, allocated: bool) -> BlockIndex {
        match self.head {
            Some(head) => {
                debug_assert!(address + size <= self.address(head), "push_front overlaps the head");
                self.link_before(head, address, size, allocated)
            }
            None => {
                let index = self.alloc_slot(address, size, None, None, allocated);
                self.head = Some(index);
                index
            }
        }
    }

    /// Check that the list exactly tiles `span` with correctly linked,
    /// address-ordered blocks, and that no two free blocks are adjacent.
    pub fn validity(&self, span: Range<DeviceAddr>) -> Validity {
        let mut validity = Validity::default();

        let mut previous: Option<Block> = None;
        for block in self {
            if self.prev(block.index) != previous.map(|p| p.index) {
                validity.broken_links += 1;
            }

            match previous.map(|p| p.relation(&block)) {
                Some(Relation::Before) => {
                    // Right order, but there's a hole between them.
                    validity.gaps += 1;
                }
                Some(Relation::AdjacentBefore) => {
                    // This is valid, unless both are free.
                }
                Some(Relation::Overlapping) => {
                    // This is really bad.
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter) | Some(Relation::After) => {
                    // Wrong order.
                    validity.out_of_orders += 1;
                }
                None => {
                    if block.address != span.start {
                        validity.gaps += 1;
                    }
                }
            }

            if let Some(p) = previous {
                if !p.allocated && !block.allocated {
                    validity.adjacent_free += 1;
                }
            }
            previous = Some(block);
        }

        match previous {
            Some(last) if last.end() != span.end => validity.gaps += 1,
            None if !span.is_empty() => validity.gaps += 1,
            _ => {}
        }

        validity
    }

    /// Write one line per block, in slot order, skipping unused slots.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        const PAD: usize = 10;
        fn link(index: Option<BlockIndex>) -> alloc::string::String {
            use alloc::string::ToString;
            index.map_or_else(|| "none".to_string(), |i| i.to_string())
        }

        writeln!(
            out,
            "{:>w$} {:>w$} {:>w$} {:>w$} {:>w$} {:>w$}",
            "Block",
            "Address",
            "Size",
            "PrevID",
            "NextID",
            "Allocated",
            w = PAD
        )?;
        for i in 0..self.slot_count() {
            let index = BlockIndex(i);
            if self.free_slots.contains(&index) {
                continue;
            }
            writeln!(
                out,
                "{:>w$} {:>w$} {:>w$} {:>w$} {:>w$} {:>w$}",
                i,
                self.address(index),
                self.size(index),
                link(self.prev(index)),
                link(self.next(index)),
                if self.is_allocated(index) { "yes" } else { "no" },
                w = PAD
            )?;
        }
        Ok(())
    }
}
