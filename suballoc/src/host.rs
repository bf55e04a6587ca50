// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! An in-process [`MemoryDevice`] that emulates heaps with host memory.
//!
//! [`HostDevice`] behaves like a device with a unified address space: every heap gets a range of
//! synthetic device addresses, and CPU-visible heaps are backed by real, zeroed host memory so
//! that mapped pointers can be written and read. It keeps count of every heap and resource that
//! is alive, which makes it useful for checking that allocators don't leak, and can be given a
//! budget to make heap creation fail.

use crate::{
    device::{
        CreatedResource, DeviceError, HeapCreateInfo, MemoryDevice, MemoryRequirements,
        ResourceDesc,
    },
    memory::{is_aligned, DeviceAlignment},
    DeviceAddress, DeviceSize, K, M,
};
use foldhash::HashMap;
use parking_lot::Mutex;
use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

/// A [`MemoryDevice`] living entirely in host memory.
#[derive(Debug)]
pub struct HostDevice {
    state: Mutex<HostState>,
    budget: Option<DeviceSize>,
}

#[derive(Debug)]
struct HostState {
    next_id: u32,
    next_address: DeviceSize,
    reserved_size: DeviceSize,
    heaps: HashMap<u32, HeapRecord>,
    resources: HashMap<u32, ResourceRecord>,
}

#[derive(Debug)]
struct HeapRecord {
    base_address: DeviceAddress,
    memory: Option<HostMemory>,
    resource_count: usize,
}

#[derive(Debug)]
struct ResourceRecord {
    heap: u32,
}

/// Zeroed host memory backing a CPU-visible heap.
#[derive(Debug)]
struct HostMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The memory is owned by the record and only freed on drop.
unsafe impl Send for HostMemory {}

impl HostMemory {
    const ALIGNMENT: usize = 256;

    fn new(size: DeviceSize) -> Result<Self, DeviceError> {
        let size = usize::try_from(size).map_err(|_| DeviceError::OutOfHostMemory)?;
        let layout = Layout::from_size_align(size.max(1), Self::ALIGNMENT)
            .map_err(|_| DeviceError::OutOfHostMemory)?;

        // SAFETY: The layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };

        NonNull::new(ptr)
            .map(|ptr| HostMemory { ptr, layout })
            .ok_or(DeviceError::OutOfHostMemory)
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: The pointer was allocated with this layout in `HostMemory::new`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A heap of a [`HostDevice`].
#[derive(Debug, PartialEq, Eq)]
pub struct HostHeap {
    id: u32,
    size: DeviceSize,
    base_address: DeviceAddress,
}

impl HostHeap {
    /// Returns the size of the heap.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the device address of the heap's first byte.
    #[inline]
    pub fn base_address(&self) -> DeviceAddress {
        self.base_address
    }
}

/// A resource of a [`HostDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostResource(u32);

impl HostDevice {
    /// The first device address handed out. Zero is never a valid address.
    const BASE_ADDRESS: DeviceSize = 1 << 32;

    /// Creates a new `HostDevice` without a memory budget.
    #[inline]
    pub fn new() -> Self {
        Self::with_budget_inner(None)
    }

    /// Creates a new `HostDevice` that fails heap creation with
    /// [`DeviceError::OutOfDeviceMemory`] once the live heaps would exceed `budget` bytes.
    #[inline]
    pub fn with_budget(budget: DeviceSize) -> Self {
        Self::with_budget_inner(Some(budget))
    }

    fn with_budget_inner(budget: Option<DeviceSize>) -> Self {
        HostDevice {
            state: Mutex::new(HostState {
                next_id: 1,
                next_address: Self::BASE_ADDRESS,
                reserved_size: 0,
                heaps: HashMap::default(),
                resources: HashMap::default(),
            }),
            budget,
        }
    }

    /// Returns the number of heaps that have not been destroyed.
    pub fn live_heaps(&self) -> usize {
        self.state.lock().heaps.len()
    }

    /// Returns the number of resources that have not been destroyed.
    pub fn live_resources(&self) -> usize {
        self.state.lock().resources.len()
    }

    /// Returns the total size of the heaps that have not been destroyed.
    pub fn reserved_size(&self) -> DeviceSize {
        self.state.lock().reserved_size
    }
}

impl Default for HostDevice {
    #[inline]
    fn default() -> Self {
        HostDevice::new()
    }
}

impl HostState {
    fn next_id(&mut self) -> Result<u32, DeviceError> {
        let id = self.next_id;
        self.next_id = id.checked_add(1).ok_or(DeviceError::TooManyObjects)?;

        Ok(id)
    }
}

unsafe impl MemoryDevice for HostDevice {
    type Heap = HostHeap;

    type Resource = HostResource;

    fn resource_requirements(&self, desc: &ResourceDesc) -> Result<MemoryRequirements, DeviceError> {
        let (size, alignment) = match desc {
            ResourceDesc::Buffer(buffer) => (buffer.size.max(1), 256),
            ResourceDesc::Texture(texture) => {
                if texture.width == 0 || texture.height == 0 || texture.depth_or_array_layers == 0
                {
                    return Err(DeviceError::Unsupported);
                }

                let alignment = if texture.sample_count > 1 {
                    4 * M
                } else {
                    64 * K
                };

                (texture.texel_data_size(), alignment)
            }
        };

        let alignment = DeviceAlignment::new(alignment).ok_or(DeviceError::Unsupported)?;
        let size = size
            .checked_next_multiple_of(alignment.as_devicesize())
            .ok_or(DeviceError::OutOfDeviceMemory)?;

        Ok(MemoryRequirements { size, alignment })
    }

    unsafe fn create_heap(&self, info: &HeapCreateInfo) -> Result<Self::Heap, DeviceError> {
        let mut state = self.state.lock();

        let reserved_size = state
            .reserved_size
            .checked_add(info.size)
            .ok_or(DeviceError::OutOfDeviceMemory)?;

        if self.budget.is_some_and(|budget| reserved_size > budget) {
            return Err(DeviceError::OutOfDeviceMemory);
        }

        // Heaps are aligned to their own size, so that block offsets translate to addresses with
        // the same alignment.
        let alignment = info
            .size
            .max(64 * K)
            .checked_next_power_of_two()
            .ok_or(DeviceError::OutOfDeviceMemory)?;
        let base_address = state
            .next_address
            .checked_next_multiple_of(alignment)
            .ok_or(DeviceError::OutOfDeviceMemory)?;
        let next_address = base_address
            .checked_add(info.size)
            .ok_or(DeviceError::OutOfDeviceMemory)?;
        let base_address = DeviceAddress::new(base_address).ok_or(DeviceError::OutOfDeviceMemory)?;

        let memory = if info.heap_type.is_cpu_visible() {
            Some(HostMemory::new(info.size)?)
        } else {
            None
        };

        let id = state.next_id()?;
        state.next_address = next_address;
        state.reserved_size = reserved_size;
        state.heaps.insert(
            id,
            HeapRecord {
                base_address,
                memory,
                resource_count: 0,
            },
        );

        log::trace!(
            "host heap {id} of {} bytes at {base_address:#x} ({:?})",
            info.size,
            info.heap_type,
        );

        Ok(HostHeap {
            id,
            size: info.size,
            base_address,
        })
    }

    unsafe fn destroy_heap(&self, heap: Self::Heap) {
        let mut state = self.state.lock();

        let Some(record) = state.heaps.remove(&heap.id) else {
            panic!("destroying host heap {} which doesn't exist", heap.id);
        };

        if record.resource_count != 0 {
            log::warn!(
                "destroying host heap {} with {} resources still placed in it",
                heap.id,
                record.resource_count,
            );
            state.resources.retain(|_, resource| resource.heap != heap.id);
        }

        state.reserved_size -= heap.size;
    }

    unsafe fn create_placed_resource(
        &self,
        heap: &Self::Heap,
        offset: DeviceSize,
        desc: &ResourceDesc,
    ) -> Result<CreatedResource<Self::Resource>, DeviceError> {
        let requirements = self.resource_requirements(desc)?;

        assert!(
            is_aligned(offset, requirements.alignment),
            "placing a resource at offset {offset}, which is not aligned to {:?}",
            requirements.alignment,
        );
        assert!(
            offset
                .checked_add(requirements.size)
                .is_some_and(|end| end <= heap.size),
            "placing a resource of {} bytes at offset {offset} overruns a heap of {} bytes",
            requirements.size,
            heap.size,
        );

        let mut state = self.state.lock();
        let id = state.next_id()?;

        let Some(record) = state.heaps.get_mut(&heap.id) else {
            panic!("placing a resource in host heap {} which doesn't exist", heap.id);
        };

        record.resource_count += 1;

        let device_address = match desc {
            ResourceDesc::Buffer(_) => record.base_address.checked_add(offset),
            ResourceDesc::Texture(_) => None,
        };
        // SAFETY: The range was checked to be inside of the heap.
        let mapped_ptr = record
            .memory
            .as_ref()
            .map(|memory| unsafe { memory.ptr.add(offset as usize) });

        state.resources.insert(id, ResourceRecord { heap: heap.id });

        Ok(CreatedResource {
            resource: HostResource(id),
            device_address,
            mapped_ptr,
        })
    }

    unsafe fn destroy_resource(&self, resource: Self::Resource) {
        let mut state = self.state.lock();

        let Some(record) = state.resources.remove(&resource.0) else {
            panic!("destroying host resource {} which doesn't exist", resource.0);
        };

        if let Some(heap) = state.heaps.get_mut(&record.heap) {
            heap.resource_count -= 1;
        }
    }
}
