// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Buddy-system sub-allocation of GPU memory.
//!
//! Creating one driver-level allocation per buffer or texture is slow, and drivers cap the number
//! of live allocations. This crate instead reserves a few large *heaps* and carves them up with a
//! [buddy allocator]:
//!
//! - The [`BlockTable`] is the pure bookkeeping: per-order free-lists over one power-of-two
//!   address range, with splitting and coalescing.
//! - A [`BuddyAllocator`] owns one backing store plus the `BlockTable` sized to it, and turns
//!   block offsets into device addresses, mapped pointers or placed resources.
//! - A [`MultiBuddyAllocator`] is a growable pool of `BuddyAllocator`s sharing one
//!   configuration. When every instance is full it creates another one instead of failing.
//! - The typed front-ends ([`DefaultBufferAllocator`], [`UploadBufferAllocator`],
//!   [`TextureAllocator`] and [`RenderTargetAllocator`]) preconfigure a pool for one kind of GPU
//!   memory.
//! - A [`ResourceLocation`] is what callers get back and store in their own objects.
//!
//! The graphics API is reached only through the [`MemoryDevice`] trait. The [`host`] module
//! provides a complete in-process implementation, and the `vulkan` feature enables one on top of
//! `ash`.
//!
//! # Deferred frees
//!
//! The GPU reads memory long after the CPU recorded the commands that use it. Deallocating a
//! location therefore only queues its block, tagged with the [`Timeline`] value of the frame being
//! recorded. `clear_up_allocations` returns a queued block to the free-lists once the device has
//! signaled that value.
//!
//! [buddy allocator]: memory::buddy
//! [`BlockTable`]: memory::BlockTable
//! [`BuddyAllocator`]: memory::BuddyAllocator
//! [`MultiBuddyAllocator`]: memory::MultiBuddyAllocator
//! [`DefaultBufferAllocator`]: memory::DefaultBufferAllocator
//! [`UploadBufferAllocator`]: memory::UploadBufferAllocator
//! [`TextureAllocator`]: memory::TextureAllocator
//! [`RenderTargetAllocator`]: memory::RenderTargetAllocator
//! [`ResourceLocation`]: memory::ResourceLocation
//! [`MemoryDevice`]: device::MemoryDevice
//! [`Timeline`]: sync::Timeline

use std::num::NonZeroU64;

pub mod device;
pub mod host;
pub mod memory;
pub mod sync;
#[cfg(feature = "vulkan")]
pub mod vulkan;

/// Represents memory size and offset values on a device. Analogous to the Rust `usize` type on
/// the host.
pub type DeviceSize = u64;

/// A [`DeviceSize`] that is known not to be zero.
pub type NonZeroDeviceSize = NonZeroU64;

/// A virtual address of device memory, as seen by shaders.
pub type DeviceAddress = NonZeroU64;

const B: DeviceSize = 1;
const K: DeviceSize = 1024 * B;
const M: DeviceSize = 1024 * K;
