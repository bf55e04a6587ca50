// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{AllocatorId, Block, InstanceId};
use crate::{device::MemoryDevice, DeviceAddress, DeviceSize};
use bytemuck::Pod;
use std::{
    fmt::{self, Debug},
    mem::size_of_val,
    ptr::{self, NonNull},
};

/// Where an allocation lives and how to address it.
///
/// Allocators hand these out and callers store them inside their own, longer-lived objects such
/// as textures or constant buffers. A location is given back to the allocator it came from with
/// `deallocate`, which consumes it. Dropping a location without deallocating it leaks its memory
/// until the allocator itself is dropped.
pub struct ResourceLocation<D: MemoryDevice> {
    pub(crate) placement: Placement<D::Resource>,
    size: DeviceSize,
    device_address: Option<DeviceAddress>,
    mapped_ptr: Option<NonNull<u8>>,
}

// SAFETY: The mapped pointer points into a heap that is owned by the allocator. The location has
// exclusive access to its range.
unsafe impl<D: MemoryDevice> Send for ResourceLocation<D> {}
unsafe impl<D: MemoryDevice> Sync for ResourceLocation<D> {}

pub(crate) enum Placement<R> {
    Undefined,
    StandAlone {
        owner: AllocatorId,
        id: u64,
        resource: R,
    },
    SubAllocation {
        owner: InstanceId,
        block: Block,
        offset: BackingOffset,
        resource: R,
    },
}

/// What kind of allocation a [`ResourceLocation`] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocationKind {
    /// The location doesn't refer to anything yet.
    Undefined,

    /// The location owns a dedicated heap and resource.
    StandAlone,

    /// The location is a block inside a heap shared with other allocations.
    SubAllocation,
}

/// The offset of a sub-allocation, relative to what it was carved out of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackingOffset {
    /// Offset from the start of the one big buffer of a manually sub-allocated heap. Views and
    /// bindings of the allocation must add this offset to the buffer.
    FromResource(DeviceSize),

    /// Offset from the start of the heap at which the allocation's own resource was placed. The
    /// resource itself starts at its first byte.
    FromHeap(DeviceSize),
}

impl<D: MemoryDevice> ResourceLocation<D> {
    /// Returns a location that doesn't refer to anything. Deallocating it does nothing.
    #[inline]
    pub const fn undefined() -> Self {
        ResourceLocation {
            placement: Placement::Undefined,
            size: 0,
            device_address: None,
            mapped_ptr: None,
        }
    }

    pub(crate) fn new(
        placement: Placement<D::Resource>,
        size: DeviceSize,
        device_address: Option<DeviceAddress>,
        mapped_ptr: Option<NonNull<u8>>,
    ) -> Self {
        ResourceLocation {
            placement,
            size,
            device_address,
            mapped_ptr,
        }
    }

    /// Returns what kind of allocation this is.
    #[inline]
    pub fn kind(&self) -> LocationKind {
        match self.placement {
            Placement::Undefined => LocationKind::Undefined,
            Placement::StandAlone { .. } => LocationKind::StandAlone,
            Placement::SubAllocation { .. } => LocationKind::SubAllocation,
        }
    }

    /// Returns the size that was requested.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the resource that actually holds the bytes: the heap's one big buffer for manual
    /// sub-allocations, or the allocation's own resource otherwise.
    #[inline]
    pub fn resource(&self) -> Option<D::Resource> {
        match self.placement {
            Placement::Undefined => None,
            Placement::StandAlone { resource, .. }
            | Placement::SubAllocation { resource, .. } => Some(resource),
        }
    }

    /// Returns the offset of a sub-allocation.
    #[inline]
    pub fn offset(&self) -> Option<BackingOffset> {
        match self.placement {
            Placement::SubAllocation { offset, .. } => Some(offset),
            _ => None,
        }
    }

    /// Returns the block backing a sub-allocation.
    #[inline]
    pub fn block(&self) -> Option<&Block> {
        match &self.placement {
            Placement::SubAllocation { block, .. } => Some(block),
            _ => None,
        }
    }

    /// Returns the ID of the allocator this location has to be given back to.
    #[inline]
    pub fn allocator_id(&self) -> Option<AllocatorId> {
        match self.placement {
            Placement::Undefined => None,
            Placement::StandAlone { owner, .. } => Some(owner),
            Placement::SubAllocation { owner, .. } => Some(owner.allocator),
        }
    }

    /// Returns the virtual address of the first byte, for binding the allocation on the device.
    #[inline]
    pub fn device_address(&self) -> Option<DeviceAddress> {
        self.device_address
    }

    /// Returns a pointer to the first byte, if the allocation lives in CPU-visible memory. The
    /// pointer stays valid until the location is deallocated.
    #[inline]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped_ptr
    }

    /// Copies `data` into the allocation, starting `offset` bytes in.
    ///
    /// The device must not be accessing the range while it is written, which is the case when
    /// every frame that used it has completed.
    ///
    /// # Panics
    ///
    /// - Panics if the allocation is not in CPU-visible memory.
    /// - Panics if the data doesn't fit inside the requested size.
    pub fn write<T: Pod>(&mut self, offset: DeviceSize, data: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let end = offset.checked_add(size_of_val(bytes) as DeviceSize);

        assert!(
            end.is_some_and(|end| end <= self.size),
            "writing {} bytes at offset {offset} overruns an allocation of {} bytes",
            bytes.len(),
            self.size,
        );

        let mapped_ptr = self
            .mapped_ptr
            .expect("the allocation is not in CPU-visible memory");

        // SAFETY: The range was checked to be inside of the allocation, which stays mapped for as
        // long as `self` is alive.
        let dst = unsafe { mapped_ptr.add(offset as usize) };
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len()) };
    }

    /// Returns the mapped bytes of the allocation.
    ///
    /// # Safety
    ///
    /// - The device must not be writing to the range for as long as the slice is alive.
    ///
    /// # Panics
    ///
    /// - Panics if the allocation is not in CPU-visible memory.
    pub unsafe fn mapped_slice(&self) -> &[u8] {
        let mapped_ptr = self
            .mapped_ptr
            .expect("the allocation is not in CPU-visible memory");

        unsafe { std::slice::from_raw_parts(mapped_ptr.as_ptr(), self.size as usize) }
    }
}

impl<D: MemoryDevice> Default for ResourceLocation<D> {
    #[inline]
    fn default() -> Self {
        ResourceLocation::undefined()
    }
}

impl<D: MemoryDevice> Debug for ResourceLocation<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLocation")
            .field("kind", &self.kind())
            .field("resource", &self.resource())
            .field("offset", &self.offset())
            .field("block", &self.block())
            .field("size", &self.size)
            .field("device_address", &self.device_address)
            .field("mapped_ptr", &self.mapped_ptr)
            .finish()
    }
}
