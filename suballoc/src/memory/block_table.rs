// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Free-list bookkeeping of a buddy allocator.
//!
//! See [`BlockTable`] for the algorithm.

use crate::DeviceSize;
#[cfg(debug_assertions)]
use foldhash::HashMap;
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt::{self, Display},
};

/// Tracks which power-of-two blocks of an address range `[0, max_block_size)` are free.
///
/// The range is divided into *blocks* whose sizes are the minimum block size times a power of
/// two. That power is the block's *order*: order 0 is the smallest unit and the highest order is
/// the whole range. Every block of order *k*&nbsp;+&nbsp;1 splits into exactly two *buddies* of
/// order *k*, and the offsets of two buddies only differ in the bit that corresponds to their size.
///
/// Allocating a block of order *k* takes the lowest free block of that order. If there is none,
/// a block of order *k*&nbsp;+&nbsp;1 is allocated and split in two: the lower half is handed
/// out and the upper half becomes free. Freeing a block does the reverse, merging it with its
/// buddy for as long as the buddy is free too. Free blocks are therefore always coalesced as much
/// as possible, and allocating then freeing a block restores the table to the exact state it was
/// in before.
///
/// Both operations are *O*(*m*) where *m* is the highest order, plus the cost of keeping each
/// free-list sorted.
#[derive(Debug)]
pub struct BlockTable {
    min_block_size: DeviceSize,
    max_order: u32,
    // Offsets are stored in units of `min_block_size`. Each free-list is sorted so that the lowest
    // free block of an order is always the one that gets allocated.
    free_lists: SmallVec<[Vec<DeviceSize>; BlockTable::INLINE_ORDERS]>,
    // Total size of the free blocks.
    free_size: DeviceSize,
    // Order of every allocated block, keyed by its offset in units.
    #[cfg(debug_assertions)]
    live: HashMap<DeviceSize, u32>,
}

impl BlockTable {
    /// Number of orders that fit without a heap allocation for the free-lists. With a minimum
    /// block size of 256B, this covers a 2GiB range.
    const INLINE_ORDERS: usize = 24;

    /// Creates a new `BlockTable` whose whole range is one free block.
    ///
    /// # Panics
    ///
    /// - Panics if `min_block_size` is not a power of two.
    /// - Panics if `max_block_size` is not a power of two.
    /// - Panics if `max_block_size` is smaller than `min_block_size`.
    pub fn new(min_block_size: DeviceSize, max_block_size: DeviceSize) -> Self {
        assert!(
            min_block_size.is_power_of_two(),
            "the minimum block size must be a power of two",
        );
        assert!(
            max_block_size.is_power_of_two(),
            "the maximum block size must be a power of two",
        );
        assert!(
            max_block_size >= min_block_size,
            "the maximum block size must not be smaller than the minimum block size",
        );

        let max_order = (max_block_size / min_block_size).trailing_zeros();

        let mut free_lists: SmallVec<[Vec<DeviceSize>; BlockTable::INLINE_ORDERS]> =
            SmallVec::new();
        free_lists.resize(max_order as usize + 1, Vec::new());
        // The root block has the lowest offset and highest order, so it's the whole range.
        free_lists[max_order as usize].push(0);

        BlockTable {
            min_block_size,
            max_order,
            free_lists,
            free_size: max_block_size,
            #[cfg(debug_assertions)]
            live: HashMap::default(),
        }
    }

    /// Returns the size of the smallest block.
    #[inline]
    pub fn min_block_size(&self) -> DeviceSize {
        self.min_block_size
    }

    /// Returns the size of the whole range, which is also the size of the largest block.
    #[inline]
    pub fn max_block_size(&self) -> DeviceSize {
        self.block_size(self.max_order)
    }

    /// Returns the order of the largest block.
    #[inline]
    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Returns the size of a block of the given `order`.
    #[inline]
    pub fn block_size(&self, order: u32) -> DeviceSize {
        self.min_block_size << order
    }

    /// Returns the total size of the free blocks. Internal fragmentation of allocated blocks is
    /// not counted as free.
    #[inline]
    pub fn free_size(&self) -> DeviceSize {
        self.free_size
    }

    /// Returns whether no block is allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.free_size == self.max_block_size()
    }

    /// Returns the byte offsets of the free blocks of the given `order`, lowest first.
    ///
    /// # Panics
    ///
    /// - Panics if `order` exceeds the highest order.
    pub fn free_blocks(&self, order: u32) -> impl ExactSizeIterator<Item = DeviceSize> + '_ {
        let min_block_size = self.min_block_size;

        self.free_lists[order as usize]
            .iter()
            .map(move |&units| units * min_block_size)
    }

    /// Returns the smallest order whose blocks can hold `size` bytes.
    ///
    /// The size is rounded up to a multiple of the minimum block size, and the resulting number
    /// of units to the next power of two. Returns [`BlockTableError::SizeExceedsTable`] if no
    /// block is large enough.
    pub fn size_to_order(&self, size: DeviceSize) -> Result<u32, BlockTableError> {
        let units = size.div_ceil(self.min_block_size).max(1);
        let order = units
            .checked_next_power_of_two()
            .ok_or(BlockTableError::SizeExceedsTable)?
            .trailing_zeros();

        if order > self.max_order {
            return Err(BlockTableError::SizeExceedsTable);
        }

        Ok(order)
    }

    /// Allocates a block of the given `order` and returns its byte offset.
    ///
    /// Returns [`BlockTableError::OutOfBlocks`] if there is no free block of this or any higher
    /// order.
    pub fn allocate_block(&mut self, order: u32) -> Result<DeviceSize, BlockTableError> {
        let units = self.take_block(order)?;

        self.free_size -= self.block_size(order);

        #[cfg(debug_assertions)]
        self.live.insert(units, order);

        Ok(units * self.min_block_size)
    }

    fn take_block(&mut self, order: u32) -> Result<DeviceSize, BlockTableError> {
        if order > self.max_order {
            return Err(BlockTableError::OutOfBlocks);
        }

        let free_list = &mut self.free_lists[order as usize];

        if !free_list.is_empty() {
            return Ok(free_list.remove(0));
        }

        // Split a block of the next order. The upper half can't already be in the free-list,
        // because the block it is a part of was free.
        let lower = self.take_block(order + 1)?;
        let upper = lower + (1 << order);
        self.insert_free(order, upper);

        Ok(lower)
    }

    /// Frees the block of the given `order` at byte `offset`, merging it with its buddy for as
    /// long as possible.
    ///
    /// # Panics
    ///
    /// - Panics if `offset` is not a multiple of the minimum block size.
    /// - In debug builds, panics if the block is not currently allocated with this order. That
    ///   catches double frees.
    pub fn free_block(&mut self, offset: DeviceSize, order: u32) {
        assert_eq!(
            offset % self.min_block_size,
            0,
            "block offsets are multiples of the minimum block size",
        );

        let units = offset / self.min_block_size;

        #[cfg(debug_assertions)]
        {
            let live_order = self.live.remove(&units);
            assert_eq!(
                live_order,
                Some(order),
                "freeing block at offset {offset} of order {order} which is not allocated",
            );
        }

        self.free_size += self.block_size(order);
        self.release_block(units, order);
    }

    fn release_block(&mut self, units: DeviceSize, order: u32) {
        if order == self.max_order {
            self.insert_free(order, units);
            return;
        }

        let buddy = units ^ (1 << order);
        let free_list = &mut self.free_lists[order as usize];

        match free_list.binary_search(&buddy) {
            // If the buddy is in the free-list, coalesce and keep going up.
            Ok(index) => {
                free_list.remove(index);
                self.release_block(DeviceSize::min(units, buddy), order + 1);
            }
            Err(_) => self.insert_free(order, units),
        }
    }

    fn insert_free(&mut self, order: u32, units: DeviceSize) {
        let free_list = &mut self.free_lists[order as usize];

        match free_list.binary_search(&units) {
            Ok(_) => unreachable!("block {units} of order {order} is already free"),
            Err(index) => free_list.insert(index, units),
        }
    }

    /// Allocates the smallest block that can hold `size` bytes.
    pub fn allocate(&mut self, size: DeviceSize) -> Result<Block, BlockTableError> {
        let order = self.size_to_order(size)?;
        let offset = self.allocate_block(order)?;

        Ok(Block {
            offset,
            order,
            requested_size: size,
        })
    }

    /// Returns `block` to the table.
    ///
    /// # Panics
    ///
    /// - In debug builds, panics if `block` is not currently allocated from `self`.
    #[inline]
    pub fn deallocate(&mut self, block: Block) {
        self.free_block(block.offset, block.order);
    }
}

/// A block allocated from a [`BlockTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    offset: DeviceSize,
    order: u32,
    requested_size: DeviceSize,
}

impl Block {
    /// Returns the byte offset of the block within the table's range.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// Returns the order of the block that was granted.
    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Returns the size that was asked for. The rest of the block is internal fragmentation.
    #[inline]
    pub fn requested_size(&self) -> DeviceSize {
        self.requested_size
    }
}

/// Error that can be returned when allocating from a [`BlockTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTableError {
    /// The request is larger than the table's whole range.
    SizeExceedsTable,

    /// There is no free block large enough.
    OutOfBlocks,
}

impl Error for BlockTableError {}

impl Display for BlockTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::SizeExceedsTable => "the requested size is larger than the whole block table",
            Self::OutOfBlocks => "there is no free block large enough",
        };

        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn free_lists(table: &BlockTable) -> Vec<Vec<DeviceSize>> {
        (0..=table.max_order())
            .map(|order| table.free_blocks(order).collect())
            .collect()
    }

    #[test]
    fn new_table_is_one_free_block() {
        // More orders than fit inline.
        for (min_block_size, max_block_size) in [(256, 256), (256, 1 << 20), (1, 1 << 30)] {
            let table = BlockTable::new(min_block_size, max_block_size);

            assert_eq!(table.max_block_size(), max_block_size);
            assert_eq!(table.free_size(), max_block_size);
            assert!(table.is_empty());
            assert_eq!(
                table.free_blocks(table.max_order()).collect::<Vec<_>>(),
                [0],
            );
            for order in 0..table.max_order() {
                assert_eq!(table.free_blocks(order).len(), 0);
            }
        }
    }

    #[test]
    fn three_small_blocks_then_coalesce() {
        let mut table = BlockTable::new(256, 1024);
        assert_eq!(table.max_order(), 2);

        let a = table.allocate(100).unwrap();
        let b = table.allocate(100).unwrap();
        let c = table.allocate(100).unwrap();
        assert_eq!((a.offset(), a.order()), (0, 0));
        assert_eq!((b.offset(), b.order()), (256, 0));
        assert_eq!((c.offset(), c.order()), (512, 0));
        assert_eq!(free_lists(&table), [vec![768], vec![], vec![]]);

        table.deallocate(a);
        assert_eq!(free_lists(&table), [vec![0, 768], vec![], vec![]]);

        // 0 and 256 are buddies, so they must merge into one block of order 1.
        table.deallocate(b);
        assert_eq!(free_lists(&table), [vec![768], vec![0], vec![]]);

        table.deallocate(c);
        assert_eq!(free_lists(&table), [vec![], vec![], vec![0]]);
        assert!(table.is_empty());
    }

    #[test]
    fn size_larger_than_table() {
        let mut table = BlockTable::new(256, 1024);

        assert_eq!(table.size_to_order(1024), Ok(2));
        assert_eq!(table.size_to_order(1025), Err(BlockTableError::SizeExceedsTable));
        assert_eq!(table.allocate(1025), Err(BlockTableError::SizeExceedsTable));
        assert_eq!(
            BlockTable::new(1, 1 << 16).size_to_order(DeviceSize::MAX),
            Err(BlockTableError::SizeExceedsTable),
        );
    }

    #[test]
    fn order_is_minimal() {
        let table = BlockTable::new(256, 1 << 20);

        for size in [1, 255, 256, 257, 511, 512, 513, 1000, 4096, 4097, (1 << 20) - 1] {
            let order = table.size_to_order(size).unwrap();

            assert!(table.block_size(order) >= size);
            if order > 0 {
                assert!(table.block_size(order - 1) < size);
            }
        }

        // Zero-sized requests still need a block.
        assert_eq!(table.size_to_order(0), Ok(0));
    }

    #[test]
    fn capacity() {
        const MAX_ORDER: u32 = 8;

        let mut table = BlockTable::new(256, 256 << MAX_ORDER);
        let mut blocks = Vec::new();

        for order in 0..=MAX_ORDER {
            for _ in 0..1 << (MAX_ORDER - order) {
                blocks.push(table.allocate(table.block_size(order)).unwrap());
            }

            assert_eq!(table.allocate(1), Err(BlockTableError::OutOfBlocks));
            assert_eq!(table.free_size(), 0);

            for block in blocks.drain(..) {
                table.deallocate(block);
            }

            assert!(table.is_empty());
        }
    }

    #[test]
    fn allocate_free_allocate_returns_same_offset() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut table = BlockTable::new(256, 256 << 10);
        let mut live = Vec::new();

        for _ in 0..200 {
            if live.len() < 20 && rng.gen_bool(0.6) {
                if let Ok(block) = table.allocate(rng.gen_range(1..=16 * 256)) {
                    live.push(block);
                }
            } else if !live.is_empty() {
                let block = live.swap_remove(rng.gen_range(0..live.len()));
                table.deallocate(block);
            }

            let order = rng.gen_range(0..=4);
            if let Ok(offset) = table.allocate_block(order) {
                table.free_block(offset, order);
                assert_eq!(table.allocate_block(order), Ok(offset));
                table.free_block(offset, order);
            }
        }
    }

    #[test]
    fn random_interleavings_never_overlap_and_fully_coalesce() {
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..20 {
            let mut table = BlockTable::new(256, 256 << 12);
            let initial = free_lists(&table);
            let mut live: Vec<Block> = Vec::new();

            for _ in 0..500 {
                if rng.gen_bool(0.55) {
                    let size = rng.gen_range(1..=64 * 256);

                    match table.allocate(size) {
                        Ok(block) => {
                            let end = block.offset() + block.requested_size();
                            assert!(end <= table.max_block_size());
                            assert!(live.iter().all(|other| {
                                end <= other.offset()
                                    || other.offset() + other.requested_size() <= block.offset()
                            }));
                            live.push(block);
                        }
                        Err(err) => assert_eq!(err, BlockTableError::OutOfBlocks),
                    }
                } else if !live.is_empty() {
                    let block = live.swap_remove(rng.gen_range(0..live.len()));
                    table.deallocate(block);
                }
            }

            for block in live.drain(..) {
                table.deallocate(block);
            }

            assert_eq!(free_lists(&table), initial);
            assert!(table.is_empty());
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not allocated")]
    fn double_free_is_detected() {
        let mut table = BlockTable::new(256, 1024);
        let block = table.allocate(100).unwrap();
        let _other = table.allocate(100).unwrap();

        table.deallocate(block);
        table.deallocate(block);
    }
}
