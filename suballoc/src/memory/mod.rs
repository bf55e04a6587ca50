// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Sub-allocation of device memory.
//!
//! Allocating device memory from the driver is expensive, and there's a low limit on the number of
//! allocations a driver accepts. The allocators in this module therefore reserve large heaps up
//! front and divide them between resources themselves.
//!
//! # Hierarchy
//!
//! ```plain
//! DefaultBufferAllocator ─┐
//! UploadBufferAllocator  ─┤
//! TextureAllocator       ─┼─> MultiBuddyAllocator ─> BuddyAllocator ─> BlockTable
//! RenderTargetAllocator  ─┘         (pool)           (one heap)        (free-lists)
//! ```
//!
//! # Strategies
//!
//! A [`BuddyAllocator`] backs its blocks in one of two ways, see [`AllocationStrategy`]:
//!
//! - With [`ManualSubAllocation`], the heap holds one big buffer and every allocation is a byte
//!   range of it. There is no device object per allocation, which makes this the right choice for
//!   many small vertex, index and constant buffers.
//! - With [`PlacedResource`], every allocation creates its own resource placed at the block's
//!   offset inside the heap. Textures need this, as each one needs its own identity and views.
//!
//! # Alignment
//!
//! The offset of a block of order *k* is always a multiple of its own size, so any alignment up to
//! the size of the granted block is satisfied for free. Larger alignments are rounded up inside
//! the block, which only works as long as the request still fits. Requests that don't are a
//! programming error and panic: in practice, keep alignments at or below the minimum block size or
//! let the size be at least the alignment, as is the case for textures.
//!
//! # Deferred frees
//!
//! Deallocating never makes the memory available right away. The block is queued with the
//! [`Timeline`] value of the frame being recorded, and `clear_up_allocations` frees it once the
//! device has signaled that value.
//!
//! [`ManualSubAllocation`]: AllocationStrategy::ManualSubAllocation
//! [`PlacedResource`]: AllocationStrategy::PlacedResource
//! [`Timeline`]: crate::sync::Timeline

pub use self::{
    block_table::{Block, BlockTable, BlockTableError},
    buddy::{AllocationStrategy, BuddyAllocator, BuddyAllocatorCreateInfo},
    layout::{DeviceAlignment, DeviceLayout, TryFromIntError},
    location::{BackingOffset, LocationKind, ResourceLocation},
    multi::{AllocatorStatistics, MultiBuddyAllocator},
    typed::{
        DefaultBufferAllocator, RenderTargetAllocator, TextureAllocator, UploadBufferAllocator,
    },
};
use crate::{device::DeviceError, DeviceSize};
use std::{
    error::Error,
    fmt::{self, Display},
    num::NonZeroU64,
    sync::atomic::{AtomicU64, Ordering},
};

pub mod block_table;
pub mod buddy;
mod layout;
mod location;
mod multi;
mod typed;

/// Error that can be returned when allocating from one of the allocators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationError {
    /// The heap has no free block large enough. A [`MultiBuddyAllocator`] handles this by creating
    /// another heap, so it's only ever returned by a lone [`BuddyAllocator`].
    OutOfHeapMemory,

    /// The request is larger than a whole heap, so no heap with this configuration can ever hold
    /// it.
    SizeExceedsHeap {
        size: DeviceSize,
        heap_size: DeviceSize,
    },

    /// Creating a heap or a resource failed.
    Device(DeviceError),
}

impl AllocationError {
    /// Returns whether the same request may succeed later.
    ///
    /// Running out of memory is transient: once the frames that still use freed blocks retire and
    /// `clear_up_allocations` runs, space becomes available again. A request larger than a heap,
    /// or a device that can't create the resource, will fail every time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OutOfHeapMemory
                | Self::Device(DeviceError::OutOfDeviceMemory | DeviceError::OutOfHostMemory),
        )
    }
}

impl Error for AllocationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfHeapMemory => f.write_str("the heap has no free block large enough"),
            Self::SizeExceedsHeap { size, heap_size } => write!(
                f,
                "the requested size of {size} bytes is larger than the heap size of {heap_size} \
                bytes",
            ),
            Self::Device(_) => f.write_str("the device failed to create the heap or resource"),
        }
    }
}

impl From<DeviceError> for AllocationError {
    #[inline]
    fn from(err: DeviceError) -> Self {
        Self::Device(err)
    }
}

/// Identifies an allocator, so that a [`ResourceLocation`] can be traced back to the allocator it
/// came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocatorId(NonZeroU64);

impl AllocatorId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        AllocatorId(NonZeroU64::new(id).expect("allocator ID counter overflowed"))
    }
}

/// Identifies one heap of one allocator. The index is the position of the heap in its pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct InstanceId {
    pub(crate) allocator: AllocatorId,
    pub(crate) index: usize,
}

/// Rounds `val` up to the next multiple of `alignment`.
#[inline(always)]
pub(crate) const fn align_up(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    align_down(val + alignment.as_devicesize() - 1, alignment)
}

/// Rounds `val` down to the previous multiple of `alignment`.
#[inline(always)]
pub(crate) const fn align_down(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    val & !(alignment.as_devicesize() - 1)
}

/// Checks whether `offset` is a multiple of `alignment`.
#[inline(always)]
pub(crate) const fn is_aligned(offset: DeviceSize, alignment: DeviceAlignment) -> bool {
    offset & (alignment.as_devicesize() - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align() {
        let alignment = DeviceAlignment::new(256).unwrap();

        assert_eq!(align_up(0, alignment), 0);
        assert_eq!(align_up(1, alignment), 256);
        assert_eq!(align_up(256, alignment), 256);
        assert_eq!(align_down(511, alignment), 256);
        assert!(is_aligned(512, alignment));
        assert!(!is_aligned(100, alignment));
    }

    #[test]
    fn retryable_errors() {
        assert!(AllocationError::OutOfHeapMemory.is_retryable());
        assert!(AllocationError::Device(DeviceError::OutOfDeviceMemory).is_retryable());
        assert!(!AllocationError::Device(DeviceError::DeviceLost).is_retryable());
        assert!(!AllocationError::SizeExceedsHeap {
            size: 1025,
            heap_size: 1024,
        }
        .is_retryable());
    }
}
