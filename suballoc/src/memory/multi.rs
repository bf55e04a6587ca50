// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    buddy::{placed_layout, AllocationStrategy, BuddyAllocator, BuddyAllocatorCreateInfo},
    location::{Placement, ResourceLocation},
    AllocationError, AllocatorId, DeviceLayout, InstanceId,
};
use crate::{
    device::{HeapCreateInfo, MemoryDevice, ResourceDesc},
    sync::Timeline,
    DeviceSize,
};
use foldhash::HashMap;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    sync::Arc,
};

/// A growable pool of [`BuddyAllocator`]s that share one configuration.
///
/// Allocations are tried against every instance in the order they were created. Only once all of
/// them are full is a new instance, and with it a new heap, created. Callers therefore never see
/// [`AllocationError::OutOfHeapMemory`]: the only request that can't be served is one larger than
/// a whole heap.
///
/// Deallocations are tagged with the [`Timeline`]'s pending value, and [`clear_up_allocations`]
/// frees whatever the device has finished with.
///
/// # Locking
///
/// The instances live behind a read/write lock, and each one behind its own mutex. Allocating
/// only takes the read lock, so threads allocating from different instances don't contend. The
/// write lock is taken only to add an instance.
///
/// [`clear_up_allocations`]: Self::clear_up_allocations
pub struct MultiBuddyAllocator<D: MemoryDevice> {
    device: Arc<D>,
    id: AllocatorId,
    create_info: BuddyAllocatorCreateInfo,
    timeline: Arc<Timeline>,
    instances: RwLock<Vec<Mutex<BuddyAllocator<D>>>>,
    stand_alone: Mutex<StandAloneStore<D::Heap, D::Resource>>,
}

struct StandAloneStore<H, R> {
    next_id: u64,
    live: HashMap<u64, StandAlone<H, R>>,
    pending_frees: VecDeque<(u64, StandAlone<H, R>)>,
}

struct StandAlone<H, R> {
    heap: H,
    resource: R,
    size: DeviceSize,
}

/// A snapshot of how much memory a [`MultiBuddyAllocator`] uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStatistics {
    /// The number of [`BuddyAllocator`]s in the pool.
    pub instance_count: usize,

    /// The total size of every heap, including those of stand-alone allocations.
    pub reserved_size: DeviceSize,

    /// The total size of the free blocks of the pool.
    pub free_size: DeviceSize,

    /// The number of allocations that have not been deallocated yet.
    pub allocation_count: usize,

    /// The number of deallocations that wait for the device.
    pub pending_free_count: usize,

    /// How many of `allocation_count` are stand-alone allocations.
    pub stand_alone_count: usize,
}

impl<D: MemoryDevice> MultiBuddyAllocator<D> {
    /// Past this many instances, every new one is logged as a warning. A pool this large usually
    /// means that frees are never cleared up or that the heap size is too small.
    const INSTANCE_WARNING_THRESHOLD: usize = 16;

    /// Creates a new `MultiBuddyAllocator` and the first instance of its pool.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info` is invalid, see [`BuddyAllocator::new`].
    pub fn new(
        device: Arc<D>,
        timeline: Arc<Timeline>,
        create_info: BuddyAllocatorCreateInfo,
    ) -> Result<Self, AllocationError> {
        create_info.validate();

        let id = AllocatorId::next();
        let first = BuddyAllocator::new_with_id(
            device.clone(),
            &create_info,
            InstanceId {
                allocator: id,
                index: 0,
            },
        )?;

        Ok(MultiBuddyAllocator {
            device,
            id,
            create_info,
            timeline,
            instances: RwLock::new(vec![Mutex::new(first)]),
            stand_alone: Mutex::new(StandAloneStore {
                next_id: 0,
                live: HashMap::default(),
                pending_frees: VecDeque::new(),
            }),
        })
    }

    /// Returns the device the heaps are created on.
    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Returns the ID that locations from `self` are traced back to.
    #[inline]
    pub fn id(&self) -> AllocatorId {
        self.id
    }

    /// Returns the configuration every instance is created with.
    #[inline]
    pub fn create_info(&self) -> &BuddyAllocatorCreateInfo {
        &self.create_info
    }

    /// Returns the timeline that gates deferred frees.
    #[inline]
    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    /// Returns the number of instances in the pool.
    #[inline]
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Allocates a byte range of one of the pool's buffers. See [`BuddyAllocator::allocate`].
    ///
    /// # Panics
    ///
    /// - Panics if the pool doesn't use [`AllocationStrategy::ManualSubAllocation`].
    pub fn allocate(&self, layout: DeviceLayout) -> Result<ResourceLocation<D>, AllocationError> {
        assert_eq!(
            self.create_info.strategy,
            AllocationStrategy::ManualSubAllocation,
            "placed-resource pools must be allocated from with `allocate_placed`",
        );

        self.allocate_with(layout, |instance| instance.allocate(layout))
    }

    /// Allocates a block in one of the pool's heaps and creates a resource inside of it. See
    /// [`BuddyAllocator::allocate_placed`].
    ///
    /// # Panics
    ///
    /// - Panics if the pool doesn't use [`AllocationStrategy::PlacedResource`].
    pub fn allocate_placed(
        &self,
        desc: &ResourceDesc,
    ) -> Result<ResourceLocation<D>, AllocationError> {
        assert_eq!(
            self.create_info.strategy,
            AllocationStrategy::PlacedResource,
            "manually sub-allocated pools must be allocated from with `allocate`",
        );

        let layout = placed_layout(&*self.device, desc)?;

        self.allocate_with(layout, |instance| instance.place(layout, desc))
    }

    fn allocate_with(
        &self,
        layout: DeviceLayout,
        allocate: impl Fn(&mut BuddyAllocator<D>) -> Result<ResourceLocation<D>, AllocationError>,
    ) -> Result<ResourceLocation<D>, AllocationError> {
        let heap_size = self.create_info.max_block_size;

        if layout.size() > heap_size {
            return Err(AllocationError::SizeExceedsHeap {
                size: layout.size(),
                heap_size,
            });
        }

        let tried = {
            let instances = self.instances.read();

            for instance in instances.iter() {
                match allocate(&mut *instance.lock()) {
                    Err(AllocationError::OutOfHeapMemory) => {}
                    result => return result,
                }
            }

            instances.len()
        };

        let mut instances = self.instances.write();

        // Another thread might have added instances while no lock was held.
        for instance in &instances[tried..] {
            match allocate(&mut *instance.lock()) {
                Err(AllocationError::OutOfHeapMemory) => {}
                result => return result,
            }
        }

        let index = instances.len();
        let mut instance = BuddyAllocator::new_with_id(
            self.device.clone(),
            &self.create_info,
            InstanceId {
                allocator: self.id,
                index,
            },
        )?;

        if index >= Self::INSTANCE_WARNING_THRESHOLD {
            log::warn!(
                "{:?} pool for {:?} grew to {} heaps of {heap_size} bytes",
                self.create_info.heap_type,
                self.create_info.heap_usage,
                index + 1,
            );
        }

        let result = allocate(&mut instance);
        instances.push(Mutex::new(instance));

        result
    }

    /// Creates a dedicated heap with one resource described by `desc` in it.
    ///
    /// Useful for resources too large for the pool, or that are expected to live for the whole
    /// application. The location is deallocated the same way as sub-allocations.
    ///
    /// # Panics
    ///
    /// - Panics if `desc` can't be placed in a heap with the pool's usage.
    pub fn allocate_stand_alone(
        &self,
        desc: &ResourceDesc,
    ) -> Result<ResourceLocation<D>, AllocationError> {
        assert!(
            self.create_info.heap_usage.accepts(desc),
            "a heap for {:?} can't hold {desc:?}",
            self.create_info.heap_usage,
        );

        let requirements = self.device.resource_requirements(desc)?;

        let heap = unsafe {
            self.device.create_heap(&HeapCreateInfo {
                size: requirements.size,
                heap_type: self.create_info.heap_type,
                usage: self.create_info.heap_usage,
            })
        }?;

        let created = match unsafe { self.device.create_placed_resource(&heap, 0, desc) } {
            Ok(created) => created,
            Err(err) => {
                unsafe { self.device.destroy_heap(heap) };
                return Err(err.into());
            }
        };

        let size = match desc {
            ResourceDesc::Buffer(buffer) => buffer.size,
            ResourceDesc::Texture(_) => requirements.size,
        };

        let mut stand_alone = self.stand_alone.lock();
        let id = stand_alone.next_id;
        stand_alone.next_id += 1;
        stand_alone.live.insert(
            id,
            StandAlone {
                heap,
                resource: created.resource,
                size: requirements.size,
            },
        );

        log::debug!(
            "created stand-alone {:?} heap of {} bytes",
            self.create_info.heap_type,
            requirements.size,
        );

        Ok(ResourceLocation::new(
            Placement::StandAlone {
                owner: self.id,
                id,
                resource: created.resource,
            },
            size,
            created.device_address,
            created.mapped_ptr,
        ))
    }

    /// Gives `location` back. Its memory is reused once the device reaches the timeline's
    /// current pending value and [`clear_up_allocations`] runs.
    ///
    /// Deallocating an undefined location does nothing.
    ///
    /// # Panics
    ///
    /// - Panics if `location` was not allocated from `self`.
    ///
    /// [`clear_up_allocations`]: Self::clear_up_allocations
    pub fn deallocate(&self, location: ResourceLocation<D>) {
        let retire_after = self.timeline.pending_value();

        match location.placement {
            Placement::Undefined => {}
            Placement::StandAlone { owner, id, .. } => {
                assert_eq!(
                    owner, self.id,
                    "the location was allocated from a different allocator",
                );

                let mut stand_alone = self.stand_alone.lock();
                let Some(entry) = stand_alone.live.remove(&id) else {
                    panic!("deallocating stand-alone allocation {id} which is not allocated");
                };
                stand_alone.pending_frees.push_back((retire_after, entry));
            }
            Placement::SubAllocation { owner, .. } => {
                assert_eq!(
                    owner.allocator, self.id,
                    "the location was allocated from a different allocator",
                );

                let instances = self.instances.read();
                instances[owner.index]
                    .lock()
                    .deallocate(location, retire_after);
            }
        }
    }

    /// Frees every deallocated block and stand-alone heap that the device has finished with,
    /// according to the timeline's completed value. Returns how many were freed.
    ///
    /// Call this once per frame, after the timeline has been signaled.
    pub fn clear_up_allocations(&self) -> usize {
        let completed = self.timeline.completed_value();
        let mut count = 0;

        for instance in self.instances.read().iter() {
            count += instance.lock().clear_up_allocations(completed);
        }

        let mut stand_alone = self.stand_alone.lock();

        while let Some((retire_after, entry)) = stand_alone.pending_frees.pop_front() {
            if retire_after > completed {
                stand_alone.pending_frees.push_front((retire_after, entry));
                break;
            }

            unsafe { self.destroy_stand_alone(entry) };
            count += 1;
        }

        count
    }

    /// Frees everything that was deallocated, regardless of the timeline. Returns how many were
    /// freed.
    ///
    /// # Safety
    ///
    /// - The device must not be using any of the deallocated ranges anymore, which is the case
    ///   once it is idle.
    pub unsafe fn clear_up_all_allocations(&self) -> usize {
        let mut count = 0;

        for instance in self.instances.read().iter() {
            count += unsafe { instance.lock().clear_up_all_allocations() };
        }

        let mut stand_alone = self.stand_alone.lock();
        count += stand_alone.pending_frees.len();

        for (_, entry) in stand_alone.pending_frees.drain(..) {
            unsafe { self.destroy_stand_alone(entry) };
        }

        count
    }

    unsafe fn destroy_stand_alone(&self, entry: StandAlone<D::Heap, D::Resource>) {
        unsafe { self.device.destroy_resource(entry.resource) };
        unsafe { self.device.destroy_heap(entry.heap) };
    }

    /// Returns how much memory the pool uses right now.
    pub fn statistics(&self) -> AllocatorStatistics {
        let mut statistics = AllocatorStatistics::default();

        for instance in self.instances.read().iter() {
            let instance = instance.lock();
            statistics.instance_count += 1;
            statistics.reserved_size += instance.heap_size();
            statistics.free_size += instance.free_size();
            statistics.allocation_count += instance.live_count();
            statistics.pending_free_count += instance.pending_free_count();
        }

        let stand_alone = self.stand_alone.lock();
        let stand_alone_entries = stand_alone
            .live
            .values()
            .chain(stand_alone.pending_frees.iter().map(|(_, entry)| entry));

        for entry in stand_alone_entries {
            statistics.reserved_size += entry.size;
        }

        statistics.stand_alone_count = stand_alone.live.len();
        statistics.allocation_count += stand_alone.live.len();
        statistics.pending_free_count += stand_alone.pending_frees.len();

        statistics
    }
}

impl<D: MemoryDevice> Drop for MultiBuddyAllocator<D> {
    fn drop(&mut self) {
        let stand_alone = self.stand_alone.get_mut();

        if !stand_alone.live.is_empty() {
            log::warn!(
                "dropping a pool while {} of its stand-alone allocations are still alive",
                stand_alone.live.len(),
            );
        }

        let entries: Vec<_> = stand_alone
            .live
            .drain()
            .map(|(_, entry)| entry)
            .chain(stand_alone.pending_frees.drain(..).map(|(_, entry)| entry))
            .collect();

        for entry in entries {
            unsafe { self.destroy_stand_alone(entry) };
        }
    }
}

impl<D: MemoryDevice> Debug for MultiBuddyAllocator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiBuddyAllocator")
            .field("id", &self.id)
            .field("create_info", &self.create_info)
            .field("statistics", &self.statistics())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{BufferDesc, DeviceError, HeapType, HeapUsage, TextureDesc, TextureFormat},
        host::HostDevice,
        memory::{BackingOffset, LocationKind},
    };
    use crossbeam_queue::ArrayQueue;
    use std::thread;

    fn layout(size: DeviceSize, alignment: DeviceSize) -> DeviceLayout {
        DeviceLayout::from_size_alignment(size, alignment).unwrap()
    }

    fn pool(max_block_size: DeviceSize) -> (Arc<HostDevice>, MultiBuddyAllocator<HostDevice>) {
        let device = Arc::new(HostDevice::new());
        let create_info = BuddyAllocatorCreateInfo {
            heap_type: HeapType::Upload,
            max_block_size,
            ..Default::default()
        };
        let allocator =
            MultiBuddyAllocator::new(device.clone(), Arc::new(Timeline::new()), create_info)
                .unwrap();

        (device, allocator)
    }

    #[test]
    fn grows_when_full() {
        let (device, allocator) = pool(1024);
        assert_eq!(allocator.instance_count(), 1);

        let locations: Vec<_> = (0..5)
            .map(|_| allocator.allocate(layout(512, 1)).unwrap())
            .collect();

        assert_eq!(allocator.instance_count(), 3);
        assert_eq!(device.live_heaps(), 3);

        // The first instances are tried first, so the blocks fill heaps in order.
        let offsets: Vec<_> = locations
            .iter()
            .map(|location| location.offset().unwrap())
            .collect();
        assert_eq!(
            offsets,
            [0, 512, 0, 512, 0].map(BackingOffset::FromResource),
        );

        let statistics = allocator.statistics();
        assert_eq!(statistics.reserved_size, 3 * 1024);
        assert_eq!(statistics.free_size, 512);
        assert_eq!(statistics.allocation_count, 5);

        for location in locations {
            allocator.deallocate(location);
        }
    }

    #[test]
    fn request_larger_than_a_heap() {
        let (_, allocator) = pool(1024);

        let err = allocator.allocate(layout(1025, 256)).unwrap_err();
        assert_eq!(
            err,
            AllocationError::SizeExceedsHeap {
                size: 1025,
                heap_size: 1024,
            },
        );
        assert!(!err.is_retryable());
        assert_eq!(allocator.instance_count(), 1);
    }

    #[test]
    fn frees_are_gated_on_the_timeline() {
        let (_, allocator) = pool(1024);
        let timeline = allocator.timeline().clone();

        let location = allocator.allocate(layout(1024, 1)).unwrap();
        allocator.deallocate(location);
        let frame = timeline.submit();

        // The device hasn't finished the frame, so the block can't be reused yet.
        assert_eq!(allocator.clear_up_allocations(), 0);
        let other = allocator.allocate(layout(1024, 1)).unwrap();
        assert_eq!(allocator.instance_count(), 2);
        allocator.deallocate(other);

        timeline.signal(frame);
        assert_eq!(allocator.clear_up_allocations(), 1);
        let statistics = allocator.statistics();
        assert_eq!(statistics.pending_free_count, 1);
        assert_eq!(statistics.free_size, 1024);

        timeline.submit();
        timeline.signal(timeline.pending_value() - 1);
        assert_eq!(allocator.clear_up_allocations(), 1);
        assert_eq!(allocator.statistics().free_size, 2048);
    }

    #[test]
    fn stand_alone_allocations() {
        let (device, allocator) = pool(1024);

        let location = allocator
            .allocate_stand_alone(&BufferDesc { size: 4000 }.into())
            .unwrap();
        assert_eq!(location.kind(), LocationKind::StandAlone);
        assert_eq!(location.size(), 4000);
        assert!(location.offset().is_none());
        assert!(location.mapped_ptr().is_some());
        assert_eq!(device.live_heaps(), 2);

        let statistics = allocator.statistics();
        assert_eq!(statistics.stand_alone_count, 1);
        assert_eq!(statistics.reserved_size, 1024 + 4096);

        allocator.deallocate(location);
        assert_eq!(device.live_heaps(), 2);

        allocator.timeline().submit();
        allocator.timeline().signal(1);
        assert_eq!(allocator.clear_up_allocations(), 1);
        assert_eq!(device.live_heaps(), 1);
        assert_eq!(allocator.statistics().stand_alone_count, 0);
    }

    #[test]
    fn undefined_locations_are_ignored() {
        let (_, allocator) = pool(1024);

        allocator.deallocate(ResourceLocation::undefined());
        assert_eq!(allocator.statistics().pending_free_count, 0);
    }

    #[test]
    fn drop_releases_everything() {
        let (device, allocator) = pool(1024);
        let timeline = allocator.timeline().clone();

        for _ in 0..4 {
            let location = allocator.allocate(layout(700, 1)).unwrap();
            allocator.deallocate(location);
        }
        let stand_alone = allocator
            .allocate_stand_alone(&BufferDesc { size: 16 }.into())
            .unwrap();
        allocator.deallocate(stand_alone);
        timeline.submit();

        assert!(device.live_heaps() > 1);
        drop(allocator);
        assert_eq!(device.live_heaps(), 0);
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    #[should_panic(expected = "different allocator")]
    fn foreign_location() {
        let (_, a) = pool(1024);
        let (_, b) = pool(1024);

        let location = a.allocate(layout(16, 1)).unwrap();
        b.deallocate(location);
    }

    #[test]
    fn placed_pool() {
        let device = Arc::new(HostDevice::new());
        let create_info = BuddyAllocatorCreateInfo {
            heap_usage: HeapUsage::Textures,
            strategy: AllocationStrategy::PlacedResource,
            min_block_size: 64 * 1024,
            max_block_size: 256 * 1024,
            ..Default::default()
        };
        let allocator =
            MultiBuddyAllocator::new(device.clone(), Arc::new(Timeline::new()), create_info)
                .unwrap();
        let desc = ResourceDesc::from(TextureDesc::new_2d(TextureFormat::R8G8B8A8Unorm, 128, 128));

        let locations: Vec<_> = (0..5)
            .map(|_| allocator.allocate_placed(&desc).unwrap())
            .collect();
        assert_eq!(allocator.instance_count(), 2);
        assert_eq!(device.live_resources(), 5);

        for location in locations {
            allocator.deallocate(location);
        }
        unsafe { allocator.clear_up_all_allocations() };
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn placed_pool_reports_what_the_device_rejects() {
        let device = Arc::new(HostDevice::new());
        let create_info = BuddyAllocatorCreateInfo {
            heap_usage: HeapUsage::Textures,
            strategy: AllocationStrategy::PlacedResource,
            min_block_size: 64 * 1024,
            max_block_size: 256 * 1024,
            ..Default::default()
        };
        let allocator =
            MultiBuddyAllocator::new(device.clone(), Arc::new(Timeline::new()), create_info)
                .unwrap();

        let empty = ResourceDesc::from(TextureDesc::new_2d(TextureFormat::R8G8B8A8Unorm, 0, 128));
        assert!(matches!(
            allocator.allocate_placed(&empty),
            Err(AllocationError::Device(DeviceError::Unsupported)),
        ));

        let large = ResourceDesc::from(TextureDesc::new_2d(TextureFormat::R8G8B8A8Unorm, 512, 512));
        assert!(matches!(
            allocator.allocate_placed(&large),
            Err(AllocationError::SizeExceedsHeap { size, .. }) if size == 1024 * 1024,
        ));
        assert_eq!(allocator.instance_count(), 1);
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn concurrent_allocations_never_overlap() {
        const THREADS: usize = 8;
        const ALLOCATIONS_PER_THREAD: usize = 64;

        let (_, allocator) = pool(64 * 1024);
        let locations = ArrayQueue::new(THREADS * ALLOCATIONS_PER_THREAD);

        // Using threads to randomize allocation order.
        thread::scope(|scope| {
            for i in 1..=THREADS {
                let (allocator, locations) = (&allocator, &locations);

                scope.spawn(move || {
                    let layout = layout(i as DeviceSize * 100, 16);

                    for _ in 0..ALLOCATIONS_PER_THREAD {
                        locations.push(allocator.allocate(layout).unwrap()).unwrap();
                    }
                });
            }
        });

        let mut ranges: Vec<_> = locations
            .into_iter()
            .map(|location| {
                let start = location.device_address().unwrap().get();
                assert_eq!(start % 16, 0);

                (start, start + location.size(), location)
            })
            .collect();
        ranges.sort_by_key(|&(start, _, _)| start);

        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }

        for (_, _, location) in ranges {
            allocator.deallocate(location);
        }

        unsafe { allocator.clear_up_all_allocations() };
        let statistics = allocator.statistics();
        assert_eq!(statistics.free_size, statistics.reserved_size);
        assert_eq!(statistics.allocation_count, 0);
    }
}
