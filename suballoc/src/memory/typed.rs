// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Pools preconfigured for one kind of GPU memory.
//!
//! Each front-end is a [`MultiBuddyAllocator`] with a fixed heap type, usage and strategy, and an
//! `allocate` method taking what that kind of resource is described by.

use super::{
    buddy::{AllocationStrategy, BuddyAllocatorCreateInfo},
    location::ResourceLocation,
    AllocationError, AllocatorStatistics, DeviceAlignment, DeviceLayout, MultiBuddyAllocator,
};
use crate::{
    device::{
        BufferDesc, HeapType, HeapUsage, MemoryDevice, ResourceDesc, TextureDesc,
        TextureUsage,
    },
    sync::Timeline,
    DeviceSize, NonZeroDeviceSize,
};
use bytemuck::Pod;
use std::{mem::size_of_val, sync::Arc};

// Everything the front-ends have in common besides `allocate`.
macro_rules! front_end {
    ($name:ident) => {
        impl<D: MemoryDevice> $name<D> {
            /// Creates a new allocator using the default configuration.
            #[inline]
            pub fn new_default(
                device: Arc<D>,
                timeline: Arc<Timeline>,
            ) -> Result<Self, AllocationError> {
                Self::new(device, timeline, Self::default_create_info())
            }

            /// Returns the pool the allocator is built on.
            #[inline]
            pub fn pool(&self) -> &MultiBuddyAllocator<D> {
                &self.pool
            }

            /// Gives `location` back, see [`MultiBuddyAllocator::deallocate`].
            #[inline]
            pub fn deallocate(&self, location: ResourceLocation<D>) {
                self.pool.deallocate(location);
            }

            /// Frees what the device has finished with, see
            /// [`MultiBuddyAllocator::clear_up_allocations`].
            #[inline]
            pub fn clear_up_allocations(&self) -> usize {
                self.pool.clear_up_allocations()
            }

            /// Frees everything that was deallocated, see
            /// [`MultiBuddyAllocator::clear_up_all_allocations`].
            ///
            /// # Safety
            ///
            /// - The device must be idle.
            #[inline]
            pub unsafe fn clear_up_all_allocations(&self) -> usize {
                unsafe { self.pool.clear_up_all_allocations() }
            }

            #[inline]
            pub fn statistics(&self) -> AllocatorStatistics {
                self.pool.statistics()
            }
        }
    };
}

fn buffer_layout(
    size: DeviceSize,
    alignment: DeviceAlignment,
    heap_size: DeviceSize,
) -> Result<DeviceLayout, AllocationError> {
    let Some(nonzero_size) = NonZeroDeviceSize::new(size) else {
        panic!("buffers must not be empty");
    };

    DeviceLayout::new(nonzero_size, alignment)
        .ok_or(AllocationError::SizeExceedsHeap { size, heap_size })
}

/// Allocates device-local buffers, such as vertex, index and storage buffers.
///
/// All allocations are ranges of a few large buffers, so binding one requires the offset of the
/// location as well as its resource.
#[derive(Debug)]
pub struct DefaultBufferAllocator<D: MemoryDevice> {
    pool: MultiBuddyAllocator<D>,
}

impl<D: MemoryDevice> DefaultBufferAllocator<D> {
    /// Returns the default configuration: 512MiB device-local heaps of 256B blocks.
    #[inline]
    pub fn default_create_info() -> BuddyAllocatorCreateInfo {
        BuddyAllocatorCreateInfo::default_buffers()
    }

    /// Creates a new `DefaultBufferAllocator`.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.heap_type` is not [`HeapType::Default`].
    /// - Panics if `create_info.strategy` is not [`AllocationStrategy::ManualSubAllocation`].
    /// - Panics if `create_info` is otherwise invalid, see [`MultiBuddyAllocator::new`].
    pub fn new(
        device: Arc<D>,
        timeline: Arc<Timeline>,
        create_info: BuddyAllocatorCreateInfo,
    ) -> Result<Self, AllocationError> {
        assert_eq!(create_info.heap_type, HeapType::Default);
        assert_eq!(
            create_info.strategy,
            AllocationStrategy::ManualSubAllocation,
        );

        Ok(DefaultBufferAllocator {
            pool: MultiBuddyAllocator::new(device, timeline, create_info)?,
        })
    }

    /// Allocates `size` bytes whose device address is a multiple of `alignment`.
    ///
    /// # Panics
    ///
    /// - Panics if `size` is zero.
    pub fn allocate(
        &self,
        size: DeviceSize,
        alignment: DeviceAlignment,
    ) -> Result<ResourceLocation<D>, AllocationError> {
        let layout = buffer_layout(size, alignment, self.pool.create_info().max_block_size)?;

        self.pool.allocate(layout)
    }

    /// Creates a buffer of `size` bytes in its own heap, see
    /// [`MultiBuddyAllocator::allocate_stand_alone`].
    pub fn allocate_stand_alone(
        &self,
        size: DeviceSize,
    ) -> Result<ResourceLocation<D>, AllocationError> {
        self.pool
            .allocate_stand_alone(&ResourceDesc::Buffer(BufferDesc { size }))
    }
}

front_end!(DefaultBufferAllocator);

/// Allocates CPU-visible buffers, such as constant buffers and staging buffers.
///
/// Every heap is mapped for its whole lifetime, so every location has a mapped pointer that stays
/// valid until the location is deallocated.
#[derive(Debug)]
pub struct UploadBufferAllocator<D: MemoryDevice> {
    pool: MultiBuddyAllocator<D>,
}

impl<D: MemoryDevice> UploadBufferAllocator<D> {
    /// Returns the default configuration: 512MiB upload heaps of 256B blocks.
    #[inline]
    pub fn default_create_info() -> BuddyAllocatorCreateInfo {
        BuddyAllocatorCreateInfo::upload_buffers()
    }

    /// Creates a new `UploadBufferAllocator`. The first heap is created and mapped right away.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.heap_type` is not CPU-visible.
    /// - Panics if `create_info.strategy` is not [`AllocationStrategy::ManualSubAllocation`].
    /// - Panics if `create_info` is otherwise invalid, see [`MultiBuddyAllocator::new`].
    pub fn new(
        device: Arc<D>,
        timeline: Arc<Timeline>,
        create_info: BuddyAllocatorCreateInfo,
    ) -> Result<Self, AllocationError> {
        assert!(
            create_info.heap_type.is_cpu_visible(),
            "upload buffers must be allocated from CPU-visible heaps",
        );
        assert_eq!(
            create_info.strategy,
            AllocationStrategy::ManualSubAllocation,
        );

        Ok(UploadBufferAllocator {
            pool: MultiBuddyAllocator::new(device, timeline, create_info)?,
        })
    }

    /// Allocates `size` bytes whose device address is a multiple of `alignment`.
    ///
    /// # Panics
    ///
    /// - Panics if `size` is zero.
    pub fn allocate(
        &self,
        size: DeviceSize,
        alignment: DeviceAlignment,
    ) -> Result<ResourceLocation<D>, AllocationError> {
        let layout = buffer_layout(size, alignment, self.pool.create_info().max_block_size)?;

        self.pool.allocate(layout)
    }

    /// Allocates a buffer the size of `data` and copies `data` into it.
    ///
    /// # Panics
    ///
    /// - Panics if `data` is empty.
    pub fn allocate_slice<T: Pod>(
        &self,
        data: &[T],
        alignment: DeviceAlignment,
    ) -> Result<ResourceLocation<D>, AllocationError> {
        let mut location = self.allocate(size_of_val(data) as DeviceSize, alignment)?;
        location.write(0, data);

        Ok(location)
    }

    /// Creates a buffer of `size` bytes in its own heap, see
    /// [`MultiBuddyAllocator::allocate_stand_alone`].
    pub fn allocate_stand_alone(
        &self,
        size: DeviceSize,
    ) -> Result<ResourceLocation<D>, AllocationError> {
        self.pool
            .allocate_stand_alone(&ResourceDesc::Buffer(BufferDesc { size }))
    }
}

front_end!(UploadBufferAllocator);

/// Allocates sampled textures. Every allocation is its own texture, placed inside a shared heap.
#[derive(Debug)]
pub struct TextureAllocator<D: MemoryDevice> {
    pool: MultiBuddyAllocator<D>,
}

impl<D: MemoryDevice> TextureAllocator<D> {
    /// Returns the default configuration: 512MiB device-local heaps of 64KiB blocks, the usual
    /// alignment of a texture.
    #[inline]
    pub fn default_create_info() -> BuddyAllocatorCreateInfo {
        BuddyAllocatorCreateInfo::textures()
    }

    /// Creates a new `TextureAllocator`.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.heap_usage` is not [`HeapUsage::Textures`].
    /// - Panics if `create_info.strategy` is not [`AllocationStrategy::PlacedResource`].
    /// - Panics if `create_info` is otherwise invalid, see [`MultiBuddyAllocator::new`].
    pub fn new(
        device: Arc<D>,
        timeline: Arc<Timeline>,
        create_info: BuddyAllocatorCreateInfo,
    ) -> Result<Self, AllocationError> {
        assert_eq!(create_info.heap_usage, HeapUsage::Textures);
        assert_eq!(create_info.strategy, AllocationStrategy::PlacedResource);

        Ok(TextureAllocator {
            pool: MultiBuddyAllocator::new(device, timeline, create_info)?,
        })
    }

    /// Creates a texture described by `desc`. Its size and alignment are queried from the device.
    ///
    /// # Panics
    ///
    /// - Panics if `desc.usage` is not [`TextureUsage::Sampled`].
    pub fn allocate(&self, desc: &TextureDesc) -> Result<ResourceLocation<D>, AllocationError> {
        assert_eq!(
            desc.usage,
            TextureUsage::Sampled,
            "render targets must be allocated with a `RenderTargetAllocator`",
        );

        self.pool.allocate_placed(&ResourceDesc::Texture(*desc))
    }

    /// Creates a texture in its own heap, see [`MultiBuddyAllocator::allocate_stand_alone`].
    pub fn allocate_stand_alone(
        &self,
        desc: &TextureDesc,
    ) -> Result<ResourceLocation<D>, AllocationError> {
        self.pool.allocate_stand_alone(&ResourceDesc::Texture(*desc))
    }
}

front_end!(TextureAllocator);

/// Allocates color and depth/stencil attachments.
#[derive(Debug)]
pub struct RenderTargetAllocator<D: MemoryDevice> {
    pool: MultiBuddyAllocator<D>,
}

impl<D: MemoryDevice> RenderTargetAllocator<D> {
    /// Returns the default configuration: 512MiB device-local heaps of 64KiB blocks.
    #[inline]
    pub fn default_create_info() -> BuddyAllocatorCreateInfo {
        BuddyAllocatorCreateInfo::render_targets()
    }

    /// Creates a new `RenderTargetAllocator`.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.heap_usage` is not [`HeapUsage::RenderTargets`].
    /// - Panics if `create_info.strategy` is not [`AllocationStrategy::PlacedResource`].
    /// - Panics if `create_info` is otherwise invalid, see [`MultiBuddyAllocator::new`].
    pub fn new(
        device: Arc<D>,
        timeline: Arc<Timeline>,
        create_info: BuddyAllocatorCreateInfo,
    ) -> Result<Self, AllocationError> {
        assert_eq!(create_info.heap_usage, HeapUsage::RenderTargets);
        assert_eq!(create_info.strategy, AllocationStrategy::PlacedResource);

        Ok(RenderTargetAllocator {
            pool: MultiBuddyAllocator::new(device, timeline, create_info)?,
        })
    }

    /// Creates a render target described by `desc`.
    ///
    /// # Panics
    ///
    /// - Panics if `desc.usage` is [`TextureUsage::Sampled`].
    /// - Panics if `desc.usage` is [`TextureUsage::DepthStencil`] and `desc.format` is not a
    ///   depth/stencil format, or the other way around.
    pub fn allocate(&self, desc: &TextureDesc) -> Result<ResourceLocation<D>, AllocationError> {
        assert_ne!(
            desc.usage,
            TextureUsage::Sampled,
            "sampled textures must be allocated with a `TextureAllocator`",
        );
        assert_eq!(
            desc.usage == TextureUsage::DepthStencil,
            desc.format.is_depth_stencil(),
            "depth/stencil targets must have a depth/stencil format and color targets must not",
        );

        self.pool.allocate_placed(&ResourceDesc::Texture(*desc))
    }

    /// Creates a render target in its own heap, see
    /// [`MultiBuddyAllocator::allocate_stand_alone`].
    pub fn allocate_stand_alone(
        &self,
        desc: &TextureDesc,
    ) -> Result<ResourceLocation<D>, AllocationError> {
        self.pool.allocate_stand_alone(&ResourceDesc::Texture(*desc))
    }
}

front_end!(RenderTargetAllocator);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::TextureFormat,
        host::HostDevice,
        memory::{BackingOffset, LocationKind},
        M,
    };

    fn alignment(alignment: DeviceSize) -> DeviceAlignment {
        DeviceAlignment::new(alignment).unwrap()
    }

    fn small_heaps(create_info: BuddyAllocatorCreateInfo) -> BuddyAllocatorCreateInfo {
        BuddyAllocatorCreateInfo {
            max_block_size: 4 * M,
            ..create_info
        }
    }

    #[test]
    fn default_buffers_are_not_mapped() {
        let device = Arc::new(HostDevice::new());
        let allocator = DefaultBufferAllocator::new(
            device,
            Arc::new(Timeline::new()),
            small_heaps(DefaultBufferAllocator::<HostDevice>::default_create_info()),
        )
        .unwrap();

        let location = allocator.allocate(1000, alignment(256)).unwrap();
        assert!(location.mapped_ptr().is_none());
        assert_eq!(location.device_address().unwrap().get() % 256, 0);
        assert!(matches!(location.offset(), Some(BackingOffset::FromResource(_))));

        allocator.deallocate(location);
    }

    #[test]
    fn upload_slices_are_written() {
        let device = Arc::new(HostDevice::new());
        let allocator = UploadBufferAllocator::new(
            device,
            Arc::new(Timeline::new()),
            small_heaps(UploadBufferAllocator::<HostDevice>::default_create_info()),
        )
        .unwrap();

        let data = [1.0f32, 2.0, 3.0, 4.0];
        let mut location = allocator.allocate_slice(&data, alignment(256)).unwrap();
        assert_eq!(location.size(), 16);

        let bytes = unsafe { location.mapped_slice() };
        assert_eq!(bytemuck::cast_slice::<u8, f32>(bytes), data);

        location.write(4, &[9.0f32]);
        let bytes = unsafe { location.mapped_slice() };
        assert_eq!(bytemuck::cast_slice::<u8, f32>(bytes), [1.0, 9.0, 3.0, 4.0]);

        allocator.deallocate(location);
    }

    #[test]
    #[should_panic(expected = "overruns an allocation")]
    fn write_past_the_end() {
        let device = Arc::new(HostDevice::new());
        let allocator = UploadBufferAllocator::new(
            device,
            Arc::new(Timeline::new()),
            small_heaps(UploadBufferAllocator::<HostDevice>::default_create_info()),
        )
        .unwrap();

        let mut location = allocator.allocate(8, alignment(4)).unwrap();
        location.write(4, &[0u32, 0]);
    }

    #[test]
    fn textures_are_placed() {
        let device = Arc::new(HostDevice::new());
        let allocator = TextureAllocator::new(
            device.clone(),
            Arc::new(Timeline::new()),
            small_heaps(TextureAllocator::<HostDevice>::default_create_info()),
        )
        .unwrap();

        let desc = TextureDesc::new_2d(TextureFormat::R8G8B8A8Srgb, 512, 512);
        let first = allocator.allocate(&desc).unwrap();
        let second = allocator.allocate(&desc).unwrap();

        assert_eq!(first.offset(), Some(BackingOffset::FromHeap(0)));
        assert_eq!(second.offset(), Some(BackingOffset::FromHeap(M)));
        assert!(first.device_address().is_none());
        assert_eq!(device.live_resources(), 2);

        allocator.deallocate(first);
        allocator.deallocate(second);
        unsafe { allocator.clear_up_all_allocations() };
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn large_textures_go_stand_alone() {
        let device = Arc::new(HostDevice::new());
        let allocator = TextureAllocator::new(
            device,
            Arc::new(Timeline::new()),
            small_heaps(TextureAllocator::<HostDevice>::default_create_info()),
        )
        .unwrap();

        let desc = TextureDesc::new_2d(TextureFormat::R32G32B32A32Sfloat, 1024, 1024);
        assert!(matches!(
            allocator.allocate(&desc),
            Err(AllocationError::SizeExceedsHeap { .. }),
        ));

        let location = allocator.allocate_stand_alone(&desc).unwrap();
        assert_eq!(location.kind(), LocationKind::StandAlone);
        assert_eq!(allocator.statistics().stand_alone_count, 1);

        allocator.deallocate(location);
    }

    #[test]
    fn render_targets_accept_depth() {
        let device = Arc::new(HostDevice::new());
        let allocator = RenderTargetAllocator::new(
            device,
            Arc::new(Timeline::new()),
            small_heaps(RenderTargetAllocator::<HostDevice>::default_create_info()),
        )
        .unwrap();

        let depth = TextureDesc {
            usage: TextureUsage::DepthStencil,
            ..TextureDesc::new_2d(TextureFormat::D32Sfloat, 640, 480)
        };
        let location = allocator.allocate(&depth).unwrap();
        assert_eq!(location.kind(), LocationKind::SubAllocation);

        allocator.deallocate(location);
    }

    #[test]
    #[should_panic(expected = "depth/stencil format")]
    fn depth_target_with_color_format() {
        let device = Arc::new(HostDevice::new());
        let allocator =
            RenderTargetAllocator::new_default(device, Arc::new(Timeline::new())).unwrap();

        let desc = TextureDesc {
            usage: TextureUsage::DepthStencil,
            ..TextureDesc::new_2d(TextureFormat::R8G8B8A8Unorm, 64, 64)
        };
        let _ = allocator.allocate(&desc);
    }

    #[test]
    #[should_panic(expected = "depth/stencil format")]
    fn color_target_with_depth_format() {
        let device = Arc::new(HostDevice::new());
        let allocator =
            RenderTargetAllocator::new_default(device, Arc::new(Timeline::new())).unwrap();

        let desc = TextureDesc {
            usage: TextureUsage::RenderTarget,
            ..TextureDesc::new_2d(TextureFormat::D24UnormS8Uint, 64, 64)
        };
        let _ = allocator.allocate(&desc);
    }

    #[test]
    #[should_panic(expected = "`RenderTargetAllocator`")]
    fn render_target_in_texture_allocator() {
        let device = Arc::new(HostDevice::new());
        let allocator = TextureAllocator::new_default(device, Arc::new(Timeline::new())).unwrap();

        let desc = TextureDesc {
            usage: TextureUsage::RenderTarget,
            ..TextureDesc::new_2d(TextureFormat::B8G8R8A8Unorm, 64, 64)
        };
        let _ = allocator.allocate(&desc);
    }
}
