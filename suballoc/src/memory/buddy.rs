// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A [buddy allocator] over one heap.
//!
//! The [`BlockTable`] decides which ranges are free. A [`BuddyAllocator`] owns the heap those
//! ranges refer to and turns a granted block into something the device can use, according to its
//! [`AllocationStrategy`].
//!
//! [buddy allocator]: https://en.wikipedia.org/wiki/Buddy_memory_allocation

use super::{
    align_up,
    location::{BackingOffset, Placement, ResourceLocation},
    AllocationError, AllocatorId, Block, BlockTable, BlockTableError, DeviceLayout, InstanceId,
};
use crate::{
    device::{
        BufferDesc, CreatedResource, DeviceError, HeapCreateInfo, HeapType, HeapUsage,
        MemoryDevice, ResourceDesc,
    },
    DeviceSize, K, M,
};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    mem::ManuallyDrop,
    sync::Arc,
};

/// How a [`BuddyAllocator`] backs the blocks it hands out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AllocationStrategy {
    /// Every allocation creates its own resource, placed at the block's offset inside the heap.
    /// Deallocated resources are destroyed when their block is cleared up.
    PlacedResource,

    /// The heap holds one buffer spanning all of it, and every allocation is a byte range of that
    /// buffer. Only usable for buffers.
    #[default]
    ManualSubAllocation,
}

/// Parameters to create a new [`BuddyAllocator`], or a pool of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct BuddyAllocatorCreateInfo {
    /// Where the heap lives.
    ///
    /// The default value is [`HeapType::Default`].
    pub heap_type: HeapType,

    /// What kind of resources the heap holds.
    ///
    /// The default value is [`HeapUsage::Buffers`].
    pub heap_usage: HeapUsage,

    /// How blocks are backed.
    ///
    /// The default value is [`AllocationStrategy::ManualSubAllocation`].
    pub strategy: AllocationStrategy,

    /// The size of the smallest block. Every allocation uses at least this much memory.
    ///
    /// The default value is `256`.
    pub min_block_size: DeviceSize,

    /// The size of the heap, which is also the largest request that can be served.
    ///
    /// The default value is 512MiB.
    pub max_block_size: DeviceSize,
}

impl BuddyAllocatorCreateInfo {
    /// The default minimum block size.
    pub const DEFAULT_MIN_BLOCK_SIZE: DeviceSize = 256;

    /// The default maximum block size.
    pub const DEFAULT_MAX_BLOCK_SIZE: DeviceSize = 512 * M;

    /// Returns the configuration of a pool of device-local buffers.
    #[inline]
    pub fn default_buffers() -> Self {
        BuddyAllocatorCreateInfo::default()
    }

    /// Returns the configuration of a pool of CPU-visible buffers.
    #[inline]
    pub fn upload_buffers() -> Self {
        BuddyAllocatorCreateInfo {
            heap_type: HeapType::Upload,
            ..Default::default()
        }
    }

    /// Returns the configuration of a pool of sampled textures. Blocks are 64KiB, the usual
    /// alignment of a texture.
    #[inline]
    pub fn textures() -> Self {
        BuddyAllocatorCreateInfo {
            heap_usage: HeapUsage::Textures,
            strategy: AllocationStrategy::PlacedResource,
            min_block_size: 64 * K,
            ..Default::default()
        }
    }

    /// Returns the configuration of a pool of render targets.
    #[inline]
    pub fn render_targets() -> Self {
        BuddyAllocatorCreateInfo {
            heap_usage: HeapUsage::RenderTargets,
            strategy: AllocationStrategy::PlacedResource,
            min_block_size: 64 * K,
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) {
        let &Self {
            heap_type: _,
            heap_usage,
            strategy,
            min_block_size,
            max_block_size,
        } = self;

        assert!(
            min_block_size.is_power_of_two(),
            "`create_info.min_block_size` must be a power of two",
        );
        assert!(
            max_block_size.is_power_of_two(),
            "`create_info.max_block_size` must be a power of two",
        );
        assert!(
            min_block_size <= max_block_size,
            "`create_info.min_block_size` must not exceed `create_info.max_block_size`",
        );
        assert!(
            strategy != AllocationStrategy::ManualSubAllocation
                || heap_usage == HeapUsage::Buffers,
            "manual sub-allocation carves up one buffer, so `create_info.heap_usage` must be \
            `HeapUsage::Buffers`",
        );
    }
}

impl Default for BuddyAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        BuddyAllocatorCreateInfo {
            heap_type: HeapType::Default,
            heap_usage: HeapUsage::Buffers,
            strategy: AllocationStrategy::ManualSubAllocation,
            min_block_size: Self::DEFAULT_MIN_BLOCK_SIZE,
            max_block_size: Self::DEFAULT_MAX_BLOCK_SIZE,
        }
    }
}

/// Sub-allocates one heap using the buddy system.
///
/// The heap is `max_block_size` bytes large and is created together with the allocator. With
/// [`AllocationStrategy::ManualSubAllocation`], a buffer spanning the whole heap is created as
/// well, and allocations are byte ranges of it.
///
/// Deallocated blocks are not reused right away. They wait in a queue until the timeline value
/// they were tagged with has completed, see [`clear_up_allocations`].
///
/// A `BuddyAllocator` needs exclusive access for every operation. A [`MultiBuddyAllocator`] wraps
/// each of its instances in a mutex.
///
/// [`clear_up_allocations`]: Self::clear_up_allocations
/// [`MultiBuddyAllocator`]: super::MultiBuddyAllocator
pub struct BuddyAllocator<D: MemoryDevice> {
    device: Arc<D>,
    id: InstanceId,
    heap_type: HeapType,
    heap_usage: HeapUsage,
    heap: ManuallyDrop<D::Heap>,
    backing: Backing<D::Resource>,
    table: BlockTable,
    pending_frees: VecDeque<PendingFree<D::Resource>>,
    live_count: usize,
}

// SAFETY: The mapped pointer of the backing buffer is only handed out offset into disjoint blocks.
unsafe impl<D: MemoryDevice> Send for BuddyAllocator<D> {}
unsafe impl<D: MemoryDevice> Sync for BuddyAllocator<D> {}

enum Backing<R> {
    Placed,
    SubAllocated(CreatedResource<R>),
}

struct PendingFree<R> {
    block: Block,
    // Only set for placed resources. Sub-allocations share the backing buffer.
    placed_resource: Option<R>,
    retire_after: u64,
}

impl<D: MemoryDevice> BuddyAllocator<D> {
    /// Creates a new `BuddyAllocator`, along with its heap.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.min_block_size` or `create_info.max_block_size` is not a power of
    ///   two.
    /// - Panics if `create_info.min_block_size` exceeds `create_info.max_block_size`.
    /// - Panics if `create_info.strategy` is [`AllocationStrategy::ManualSubAllocation`] and
    ///   `create_info.heap_usage` is not [`HeapUsage::Buffers`].
    pub fn new(
        device: Arc<D>,
        create_info: &BuddyAllocatorCreateInfo,
    ) -> Result<Self, AllocationError> {
        let id = InstanceId {
            allocator: AllocatorId::next(),
            index: 0,
        };

        create_info.validate();

        Self::new_with_id(device, create_info, id)
    }

    pub(crate) fn new_with_id(
        device: Arc<D>,
        create_info: &BuddyAllocatorCreateInfo,
        id: InstanceId,
    ) -> Result<Self, AllocationError> {
        let &BuddyAllocatorCreateInfo {
            heap_type,
            heap_usage,
            strategy,
            min_block_size,
            max_block_size,
        } = create_info;

        let heap = unsafe {
            device.create_heap(&HeapCreateInfo {
                size: max_block_size,
                heap_type,
                usage: heap_usage,
            })
        }?;

        let backing = match strategy {
            AllocationStrategy::PlacedResource => Backing::Placed,
            AllocationStrategy::ManualSubAllocation => {
                let desc = ResourceDesc::Buffer(BufferDesc {
                    size: max_block_size,
                });

                match unsafe { device.create_placed_resource(&heap, 0, &desc) } {
                    Ok(resource) => Backing::SubAllocated(resource),
                    Err(err) => {
                        unsafe { device.destroy_heap(heap) };
                        return Err(err.into());
                    }
                }
            }
        };

        log::debug!(
            "created {heap_type:?} heap #{} of {max_block_size} bytes for {heap_usage:?} \
            ({strategy:?})",
            id.index,
        );

        Ok(BuddyAllocator {
            device,
            id,
            heap_type,
            heap_usage,
            heap: ManuallyDrop::new(heap),
            backing,
            table: BlockTable::new(min_block_size, max_block_size),
            pending_frees: VecDeque::new(),
            live_count: 0,
        })
    }

    /// Returns the device the heap was created on.
    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Returns the ID of the allocator that locations from `self` are traced back to.
    #[inline]
    pub fn allocator_id(&self) -> AllocatorId {
        self.id.allocator
    }

    /// Returns how blocks are backed.
    #[inline]
    pub fn strategy(&self) -> AllocationStrategy {
        match self.backing {
            Backing::Placed => AllocationStrategy::PlacedResource,
            Backing::SubAllocated(_) => AllocationStrategy::ManualSubAllocation,
        }
    }

    #[inline]
    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    #[inline]
    pub fn heap_usage(&self) -> HeapUsage {
        self.heap_usage
    }

    /// Returns the heap.
    #[inline]
    pub fn heap(&self) -> &D::Heap {
        &self.heap
    }

    /// Returns the buffer spanning the heap, if the allocator uses manual sub-allocation.
    #[inline]
    pub fn backing_resource(&self) -> Option<D::Resource> {
        match &self.backing {
            Backing::Placed => None,
            Backing::SubAllocated(backing) => Some(backing.resource),
        }
    }

    /// Returns the free-list bookkeeping.
    #[inline]
    pub fn block_table(&self) -> &BlockTable {
        &self.table
    }

    /// Returns the size of the heap.
    #[inline]
    pub fn heap_size(&self) -> DeviceSize {
        self.table.max_block_size()
    }

    /// Returns the total size of the free blocks. Blocks waiting in the deferred-free queue are
    /// not free yet.
    #[inline]
    pub fn free_size(&self) -> DeviceSize {
        self.table.free_size()
    }

    /// Returns the number of allocations that have not been deallocated yet.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Returns the number of deallocated blocks that haven't been cleared up yet.
    #[inline]
    pub fn pending_free_count(&self) -> usize {
        self.pending_frees.len()
    }

    /// Allocates a byte range of the buffer spanning the heap.
    ///
    /// The location's offset is a [`BackingOffset::FromResource`], and its device address and
    /// mapped pointer are those of the buffer advanced by that offset.
    ///
    /// # Panics
    ///
    /// - Panics if the allocator doesn't use [`AllocationStrategy::ManualSubAllocation`].
    /// - Panics if the block granted for `layout.size()` can't fit the request once its offset is
    ///   aligned to `layout.alignment()`.
    pub fn allocate(&mut self, layout: DeviceLayout) -> Result<ResourceLocation<D>, AllocationError> {
        let Backing::SubAllocated(backing) = &self.backing else {
            panic!("placed-resource allocators must be allocated from with `allocate_placed`");
        };
        let backing = *backing;

        let (block, offset) = self.allocate_block(layout)?;

        let device_address = backing
            .device_address
            .and_then(|address| address.checked_add(offset));
        // SAFETY: The offset is within the heap, which the buffer spans.
        let mapped_ptr = backing
            .mapped_ptr
            .map(|ptr| unsafe { ptr.add(offset as usize) });

        self.live_count += 1;

        Ok(ResourceLocation::new(
            Placement::SubAllocation {
                owner: self.id,
                block,
                offset: BackingOffset::FromResource(offset),
                resource: backing.resource,
            },
            layout.size(),
            device_address,
            mapped_ptr,
        ))
    }

    /// Allocates a block and creates a resource described by `desc` inside of it.
    ///
    /// The size and alignment of the block are those the device reports for `desc` through
    /// [`MemoryDevice::resource_requirements`]. The location's offset is a
    /// [`BackingOffset::FromHeap`], and its device address and mapped pointer are those of the
    /// new resource. If creating the resource fails, the block is returned to the free-lists
    /// right away.
    ///
    /// # Panics
    ///
    /// - Panics if the allocator doesn't use [`AllocationStrategy::PlacedResource`].
    /// - Panics if `desc` can't be placed in a heap with this allocator's usage.
    pub fn allocate_placed(
        &mut self,
        desc: &ResourceDesc,
    ) -> Result<ResourceLocation<D>, AllocationError> {
        let layout = placed_layout(&*self.device, desc)?;

        self.place(layout, desc)
    }

    /// `layout` must be the result of [`placed_layout`] for `desc`.
    pub(crate) fn place(
        &mut self,
        layout: DeviceLayout,
        desc: &ResourceDesc,
    ) -> Result<ResourceLocation<D>, AllocationError> {
        assert!(
            matches!(self.backing, Backing::Placed),
            "manually sub-allocated allocators must be allocated from with `allocate`",
        );
        assert!(
            self.heap_usage.accepts(desc),
            "a heap for {:?} can't hold {desc:?}",
            self.heap_usage,
        );

        let (block, offset) = self.allocate_block(layout)?;

        let created = match unsafe { self.device.create_placed_resource(&self.heap, offset, desc) }
        {
            Ok(created) => created,
            Err(err) => {
                self.table.deallocate(block);
                return Err(err.into());
            }
        };

        self.live_count += 1;

        let size = match desc {
            ResourceDesc::Buffer(buffer) => buffer.size,
            ResourceDesc::Texture(_) => layout.size(),
        };

        Ok(ResourceLocation::new(
            Placement::SubAllocation {
                owner: self.id,
                block,
                offset: BackingOffset::FromHeap(offset),
                resource: created.resource,
            },
            size,
            created.device_address,
            created.mapped_ptr,
        ))
    }

    fn allocate_block(&mut self, layout: DeviceLayout) -> Result<(Block, DeviceSize), AllocationError> {
        let size = layout.size();

        let block = self.table.allocate(size).map_err(|err| match err {
            BlockTableError::SizeExceedsTable => AllocationError::SizeExceedsHeap {
                size,
                heap_size: self.table.max_block_size(),
            },
            BlockTableError::OutOfBlocks => AllocationError::OutOfHeapMemory,
        })?;

        let block_size = self.table.block_size(block.order());
        let offset = align_up(block.offset(), layout.alignment());
        let padding = offset - block.offset();

        assert!(
            padding <= block_size && size <= block_size - padding,
            "a request of {size} bytes aligned to {:?} doesn't fit the block of {block_size} \
            bytes at offset {}",
            layout.alignment(),
            block.offset(),
        );

        log::trace!(
            "allocated block of order {} at offset {offset} from heap #{}",
            block.order(),
            self.id.index,
        );

        Ok((block, offset))
    }

    /// Queues the block of `location` to be freed once the timeline reaches `retire_after`.
    ///
    /// Nothing is freed right away: the free-lists only change in [`clear_up_allocations`].
    ///
    /// # Panics
    ///
    /// - Panics if `location` was not allocated from `self`.
    ///
    /// [`clear_up_allocations`]: Self::clear_up_allocations
    pub fn deallocate(&mut self, location: ResourceLocation<D>, retire_after: u64) {
        let Placement::SubAllocation {
            owner,
            block,
            resource,
            ..
        } = location.placement
        else {
            panic!("only sub-allocations can be given back to a `BuddyAllocator`");
        };

        assert_eq!(
            owner, self.id,
            "the location was allocated from a different allocator",
        );

        let placed_resource = match self.backing {
            Backing::Placed => Some(resource),
            Backing::SubAllocated(_) => None,
        };

        self.pending_frees.push_back(PendingFree {
            block,
            placed_resource,
            retire_after,
        });
        self.live_count -= 1;
    }

    /// Frees every queued block whose timeline value is at most `completed`, in the order they
    /// were deallocated, and returns how many were freed.
    ///
    /// Placed resources of the freed blocks are destroyed.
    pub fn clear_up_allocations(&mut self, completed: u64) -> usize {
        let mut count = 0;

        while let Some(pending) = self.pending_frees.pop_front() {
            if pending.retire_after > completed {
                self.pending_frees.push_front(pending);
                break;
            }

            self.free(pending);
            count += 1;
        }

        if count != 0 {
            log::trace!("cleared up {count} blocks of heap #{}", self.id.index);
        }

        count
    }

    /// Frees every queued block regardless of its timeline value, and returns how many were
    /// freed.
    ///
    /// # Safety
    ///
    /// - The device must not be using any of the deallocated ranges anymore, which is the case
    ///   once it is idle.
    pub unsafe fn clear_up_all_allocations(&mut self) -> usize {
        let count = self.pending_frees.len();

        while let Some(pending) = self.pending_frees.pop_front() {
            self.free(pending);
        }

        count
    }

    fn free(&mut self, pending: PendingFree<D::Resource>) {
        if let Some(resource) = pending.placed_resource {
            unsafe { self.device.destroy_resource(resource) };
        }

        self.table.deallocate(pending.block);
    }
}

impl<D: MemoryDevice> Drop for BuddyAllocator<D> {
    fn drop(&mut self) {
        if self.live_count != 0 {
            log::warn!(
                "dropping heap #{} while {} of its allocations are still alive",
                self.id.index,
                self.live_count,
            );
        }

        for pending in self.pending_frees.drain(..) {
            if let Some(resource) = pending.placed_resource {
                unsafe { self.device.destroy_resource(resource) };
            }
        }

        if let Backing::SubAllocated(backing) = &self.backing {
            unsafe { self.device.destroy_resource(backing.resource) };
        }

        let heap = unsafe { ManuallyDrop::take(&mut self.heap) };
        unsafe { self.device.destroy_heap(heap) };

        log::debug!("destroyed {:?} heap #{}", self.heap_type, self.id.index);
    }
}

impl<D: MemoryDevice> Debug for BuddyAllocator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("id", &self.id)
            .field("heap_type", &self.heap_type)
            .field("heap_usage", &self.heap_usage)
            .field("strategy", &self.strategy())
            .field("heap", &*self.heap)
            .field("backing_resource", &self.backing_resource())
            .field("table", &self.table)
            .field("live_count", &self.live_count)
            .field("pending_free_count", &self.pending_frees.len())
            .finish_non_exhaustive()
    }
}

/// Returns the size and alignment of the block a resource described by `desc` must be placed in.
pub(crate) fn placed_layout<D: MemoryDevice>(
    device: &D,
    desc: &ResourceDesc,
) -> Result<DeviceLayout, AllocationError> {
    let requirements = device.resource_requirements(desc)?;

    DeviceLayout::from_requirements(&requirements)
        .ok_or(AllocationError::Device(DeviceError::Unsupported))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{TextureDesc, TextureFormat},
        host::HostDevice,
        memory::LocationKind,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn layout(size: DeviceSize, alignment: DeviceSize) -> DeviceLayout {
        DeviceLayout::from_size_alignment(size, alignment).unwrap()
    }

    fn upload_create_info(max_block_size: DeviceSize) -> BuddyAllocatorCreateInfo {
        BuddyAllocatorCreateInfo {
            heap_type: HeapType::Upload,
            max_block_size,
            ..Default::default()
        }
    }

    #[test]
    fn frees_wait_for_the_timeline() {
        let device = Arc::new(HostDevice::new());
        let mut allocator = BuddyAllocator::new(device, &upload_create_info(1024)).unwrap();
        let base = allocator.allocate(layout(1, 1)).unwrap();
        let base_address = base.device_address().unwrap().get();
        allocator.deallocate(base, 0);
        assert_eq!(allocator.clear_up_allocations(0), 1);

        let a = allocator.allocate(layout(100, 1)).unwrap();
        let b = allocator.allocate(layout(100, 1)).unwrap();
        let c = allocator.allocate(layout(100, 1)).unwrap();

        assert_eq!(a.kind(), LocationKind::SubAllocation);
        assert_eq!(a.offset(), Some(BackingOffset::FromResource(0)));
        assert_eq!(b.offset(), Some(BackingOffset::FromResource(256)));
        assert_eq!(c.offset(), Some(BackingOffset::FromResource(512)));
        assert_eq!(c.device_address().unwrap().get(), base_address + 512);
        assert_eq!(a.resource(), allocator.backing_resource());

        let a_ptr = a.mapped_ptr().unwrap().as_ptr() as usize;
        let b_ptr = b.mapped_ptr().unwrap().as_ptr() as usize;
        assert_eq!(b_ptr - a_ptr, 256);

        allocator.deallocate(a, 1);
        allocator.deallocate(b, 2);
        assert_eq!(allocator.pending_free_count(), 2);
        assert_eq!(allocator.free_size(), 256);

        assert_eq!(allocator.clear_up_allocations(0), 0);
        assert_eq!(allocator.clear_up_allocations(1), 1);
        assert_eq!(allocator.clear_up_allocations(2), 1);

        let table = allocator.block_table();
        assert_eq!(table.free_blocks(0).collect::<Vec<_>>(), [768]);
        assert_eq!(table.free_blocks(1).collect::<Vec<_>>(), [0]);

        allocator.deallocate(c, 3);
        unsafe { allocator.clear_up_all_allocations() };
        assert!(allocator.block_table().is_empty());
        assert_eq!(allocator.live_count(), 0);
    }

    #[test]
    fn size_exceeds_heap() {
        let device = Arc::new(HostDevice::new());
        let mut allocator = BuddyAllocator::new(device, &upload_create_info(1024)).unwrap();

        assert_eq!(
            allocator.allocate(layout(1025, 256)).unwrap_err(),
            AllocationError::SizeExceedsHeap {
                size: 1025,
                heap_size: 1024,
            },
        );
    }

    #[test]
    fn out_of_heap_memory() {
        let device = Arc::new(HostDevice::new());
        let mut allocator = BuddyAllocator::new(device, &upload_create_info(1024)).unwrap();

        let whole = allocator.allocate(layout(1024, 1)).unwrap();
        let err = allocator.allocate(layout(1, 1)).unwrap_err();
        assert_eq!(err, AllocationError::OutOfHeapMemory);
        assert!(err.is_retryable());

        // Still out of memory until the block is cleared up.
        allocator.deallocate(whole, 5);
        assert!(allocator.allocate(layout(1, 1)).is_err());
        allocator.clear_up_allocations(5);
        let location = allocator.allocate(layout(1, 1)).unwrap();
        allocator.deallocate(location, 6);
    }

    #[test]
    fn device_addresses_respect_alignment() {
        let device = Arc::new(HostDevice::new());
        let create_info = BuddyAllocatorCreateInfo {
            max_block_size: 1 << 20,
            ..Default::default()
        };
        let mut allocator = BuddyAllocator::new(device, &create_info).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut live = Vec::new();

        for _ in 0..300 {
            let alignment = 1 << rng.gen_range(0..=8);
            let size = rng.gen_range(1..=8192);

            match allocator.allocate(layout(size, alignment)) {
                Ok(location) => {
                    let address = location.device_address().unwrap().get();
                    assert_eq!(address % alignment, 0);
                    assert!(location.mapped_ptr().is_none());
                    live.push(location);
                }
                Err(err) => assert_eq!(err, AllocationError::OutOfHeapMemory),
            }

            if live.len() > 40 {
                let location = live.swap_remove(rng.gen_range(0..live.len()));
                allocator.deallocate(location, 0);
                allocator.clear_up_allocations(0);
            }
        }

        // Alignments above the minimum block size work as long as the size is at least as large.
        let large = allocator.allocate(layout(4096, 4096));
        if let Ok(location) = large {
            assert_eq!(location.device_address().unwrap().get() % 4096, 0);
            live.push(location);
        }

        for location in live {
            allocator.deallocate(location, 1);
        }
        allocator.clear_up_allocations(1);
        assert!(allocator.block_table().is_empty());
    }

    #[test]
    #[should_panic(expected = "doesn't fit the block")]
    fn unsatisfiable_alignment() {
        let device = Arc::new(HostDevice::new());
        let mut allocator = BuddyAllocator::new(device, &upload_create_info(1024)).unwrap();

        let _first = allocator.allocate(layout(100, 1)).unwrap();
        // The next block is at 256, which can't be aligned to 512 inside a block of 256 bytes.
        let _second = allocator.allocate(layout(100, 512));
    }

    #[test]
    fn placed_resources_are_destroyed_on_clear_up() {
        let device = Arc::new(HostDevice::new());
        let create_info = BuddyAllocatorCreateInfo {
            heap_usage: HeapUsage::Textures,
            strategy: AllocationStrategy::PlacedResource,
            min_block_size: 64 * 1024,
            max_block_size: 4 * M,
            ..Default::default()
        };
        let mut allocator = BuddyAllocator::new(device.clone(), &create_info).unwrap();
        assert_eq!(device.live_heaps(), 1);
        assert_eq!(device.live_resources(), 0);

        let desc = ResourceDesc::from(TextureDesc::new_2d(TextureFormat::R8G8B8A8Unorm, 256, 256));
        let requirements = device.resource_requirements(&desc).unwrap();

        let first = allocator.allocate_placed(&desc).unwrap();
        let second = allocator.allocate_placed(&desc).unwrap();
        assert_eq!(device.live_resources(), 2);
        assert_eq!(first.offset(), Some(BackingOffset::FromHeap(0)));
        assert_eq!(
            second.offset(),
            Some(BackingOffset::FromHeap(requirements.size)),
        );
        assert_ne!(first.resource(), second.resource());

        allocator.deallocate(first, 1);
        assert_eq!(device.live_resources(), 2);
        allocator.clear_up_allocations(1);
        assert_eq!(device.live_resources(), 1);

        allocator.deallocate(second, 2);
        drop(allocator);
        assert_eq!(device.live_resources(), 0);
        assert_eq!(device.live_heaps(), 0);
    }

    #[test]
    fn placed_buffers_use_the_device_alignment() {
        let device = Arc::new(HostDevice::new());
        let create_info = BuddyAllocatorCreateInfo {
            strategy: AllocationStrategy::PlacedResource,
            min_block_size: 64,
            max_block_size: 4 * K,
            ..Default::default()
        };
        let mut allocator = BuddyAllocator::new(device.clone(), &create_info).unwrap();

        // The device wants 256-byte aligned buffers, whatever their size.
        let desc = ResourceDesc::from(BufferDesc { size: 100 });
        let first = allocator.allocate_placed(&desc).unwrap();
        let second = allocator.allocate_placed(&desc).unwrap();
        assert_eq!(first.offset(), Some(BackingOffset::FromHeap(0)));
        assert_eq!(second.offset(), Some(BackingOffset::FromHeap(256)));
        assert_eq!(first.size(), 100);
        assert_eq!(allocator.block_table().free_size(), 4 * K - 512);

        allocator.deallocate(first, 1);
        allocator.deallocate(second, 1);
        allocator.clear_up_allocations(1);
        assert!(allocator.block_table().is_empty());
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn manual_sub_allocation_owns_one_buffer() {
        let device = Arc::new(HostDevice::new());
        let allocator = BuddyAllocator::new(device.clone(), &upload_create_info(1024)).unwrap();

        assert_eq!(allocator.strategy(), AllocationStrategy::ManualSubAllocation);
        assert_eq!(device.live_heaps(), 1);
        assert_eq!(device.live_resources(), 1);

        drop(allocator);
        assert_eq!(device.live_heaps(), 0);
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn out_of_device_memory_is_reported() {
        let device = Arc::new(HostDevice::with_budget(1024));
        let _allocator = BuddyAllocator::new(device.clone(), &upload_create_info(1024)).unwrap();

        let err = BuddyAllocator::new(device, &upload_create_info(1024)).unwrap_err();
        assert_eq!(err, AllocationError::Device(DeviceError::OutOfDeviceMemory));
    }

    #[test]
    #[should_panic(expected = "different allocator")]
    fn foreign_location() {
        let device = Arc::new(HostDevice::new());
        let mut a = BuddyAllocator::new(device.clone(), &upload_create_info(1024)).unwrap();
        let mut b = BuddyAllocator::new(device, &upload_create_info(1024)).unwrap();

        let location = a.allocate(layout(16, 16)).unwrap();
        b.deallocate(location, 0);
    }

    #[test]
    #[should_panic(expected = "`HeapUsage::Buffers`")]
    fn manual_sub_allocation_of_textures() {
        let device = Arc::new(HostDevice::new());
        let create_info = BuddyAllocatorCreateInfo {
            heap_usage: HeapUsage::Textures,
            ..Default::default()
        };

        let _ = BuddyAllocator::new(device, &create_info);
    }

    #[test]
    fn alignment_is_free_up_to_the_block_size() {
        let device = Arc::new(HostDevice::new());
        let mut allocator = BuddyAllocator::new(device, &upload_create_info(1 << 16)).unwrap();
        let small = allocator.allocate(layout(10, 1)).unwrap();
        let aligned = allocator.allocate(layout(1024, 1024)).unwrap();
        assert_eq!(aligned.offset(), Some(BackingOffset::FromResource(1024)));
        assert_eq!(aligned.block().unwrap().order(), 2);

        allocator.deallocate(small, 0);
        allocator.deallocate(aligned, 0);
        allocator.clear_up_allocations(0);
    }

    #[test]
    fn presets_are_valid() {
        for create_info in [
            BuddyAllocatorCreateInfo::default_buffers(),
            BuddyAllocatorCreateInfo::upload_buffers(),
            BuddyAllocatorCreateInfo::textures(),
            BuddyAllocatorCreateInfo::render_targets(),
        ] {
            create_info.validate();
        }

        assert!(BuddyAllocatorCreateInfo::upload_buffers()
            .heap_type
            .is_cpu_visible());
        assert_eq!(BuddyAllocatorCreateInfo::textures().min_block_size, 64 * K);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn create_info_from_ron() {
        let create_info: BuddyAllocatorCreateInfo =
            ron::from_str("(heap_usage: Textures, strategy: PlacedResource)").unwrap();

        assert_eq!(create_info.heap_type, HeapType::Default);
        assert_eq!(create_info.heap_usage, HeapUsage::Textures);
        assert_eq!(create_info.strategy, AllocationStrategy::PlacedResource);
        assert_eq!(
            create_info.max_block_size,
            BuddyAllocatorCreateInfo::DEFAULT_MAX_BLOCK_SIZE,
        );
    }
}
