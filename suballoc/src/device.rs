// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The boundary between the allocators and a graphics API.
//!
//! Everything the allocators need from a device is expressed by the [`MemoryDevice`] trait: raw
//! heaps, resources placed inside them, and the size and alignment a resource would need. A
//! "committed" resource, as used for manual sub-allocation, is simply a heap with one buffer
//! placed at offset 0 that spans all of it.

use crate::{memory::DeviceAlignment, DeviceAddress, DeviceSize};
use std::{
    error::Error,
    fmt::{self, Debug, Display},
    ptr::NonNull,
};

/// A device that can create heaps and place resources inside them.
///
/// # Safety
///
/// - `create_heap` must return a heap of at least `info.size` bytes.
/// - `create_placed_resource` must return a resource bound to `[offset, offset + size)` of `heap`
///   and nothing else. Its device address, if any, must be the heap's base address plus `offset`
///   when the resource is a buffer.
/// - The mapped pointer returned for a resource in a CPU-visible heap must stay valid and point
///   to the resource's first byte until the resource is destroyed.
pub unsafe trait MemoryDevice: Send + Sync {
    /// A raw block of device memory. Owned by whoever created it.
    type Heap: Debug + Send + Sync;

    /// A handle to a buffer or texture object.
    type Resource: Copy + Debug + PartialEq + Eq + Send + Sync;

    /// Returns the size and alignment that a resource described by `desc` needs inside a heap.
    fn resource_requirements(&self, desc: &ResourceDesc) -> Result<MemoryRequirements, DeviceError>;

    /// Creates a new heap.
    ///
    /// # Safety
    ///
    /// - The returned heap must be destroyed using [`destroy_heap`] on the same device, after
    ///   every resource placed inside it has been destroyed.
    ///
    /// [`destroy_heap`]: Self::destroy_heap
    unsafe fn create_heap(&self, info: &HeapCreateInfo) -> Result<Self::Heap, DeviceError>;

    /// Destroys a heap.
    ///
    /// # Safety
    ///
    /// - `heap` must have been created by `self`.
    /// - No resources placed inside `heap` may still exist.
    unsafe fn destroy_heap(&self, heap: Self::Heap);

    /// Creates a resource described by `desc` at `offset` inside `heap`.
    ///
    /// # Safety
    ///
    /// - `offset` must be a multiple of the alignment returned by [`resource_requirements`] for
    ///   `desc`, and the range must fit inside `heap`.
    /// - The range must not be used by another live resource, unless the caller takes care of
    ///   aliasing itself.
    ///
    /// [`resource_requirements`]: Self::resource_requirements
    unsafe fn create_placed_resource(
        &self,
        heap: &Self::Heap,
        offset: DeviceSize,
        desc: &ResourceDesc,
    ) -> Result<CreatedResource<Self::Resource>, DeviceError>;

    /// Destroys a resource.
    ///
    /// # Safety
    ///
    /// - `resource` must have been created by `self` and must not be in use by the device.
    unsafe fn destroy_resource(&self, resource: Self::Resource);
}

/// A resource as it comes out of [`MemoryDevice::create_placed_resource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreatedResource<R> {
    /// The handle of the resource.
    pub resource: R,

    /// The virtual address of the resource's first byte, if the resource has one. Textures
    /// usually don't.
    pub device_address: Option<DeviceAddress>,

    /// A pointer to the resource's first byte, if it lives in a CPU-visible heap.
    pub mapped_ptr: Option<NonNull<u8>>,
}

/// The placement needs of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: DeviceSize,
    pub alignment: DeviceAlignment,
}

/// Parameters to create a new heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapCreateInfo {
    /// The size of the heap in bytes.
    pub size: DeviceSize,

    /// Where the heap lives and whether the CPU can see it.
    pub heap_type: HeapType,

    /// What kind of resources will be placed inside the heap.
    pub usage: HeapUsage,
}

/// Where a heap lives and whether the CPU can access it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HeapType {
    /// Device-local memory. Fastest for the GPU, invisible to the CPU.
    #[default]
    Default,

    /// CPU-visible memory the CPU writes and the GPU reads, such as constant buffers or staging
    /// buffers for texture uploads. Mapped for the whole lifetime of the heap.
    Upload,

    /// CPU-visible memory the GPU writes and the CPU reads back.
    Readback,
}

impl HeapType {
    /// Returns whether heaps of this type can be mapped.
    #[inline]
    pub const fn is_cpu_visible(self) -> bool {
        matches!(self, HeapType::Upload | HeapType::Readback)
    }
}

/// What kind of resources a heap holds. Some devices can't mix buffers, textures and render
/// targets inside the same heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HeapUsage {
    #[default]
    Buffers,
    Textures,
    RenderTargets,
}

impl HeapUsage {
    /// Returns whether a resource described by `desc` may be placed in a heap with this usage.
    pub fn accepts(self, desc: &ResourceDesc) -> bool {
        match (self, desc) {
            (HeapUsage::Buffers, ResourceDesc::Buffer(_)) => true,
            (HeapUsage::Textures, ResourceDesc::Texture(texture)) => {
                texture.usage == TextureUsage::Sampled
            }
            (HeapUsage::RenderTargets, ResourceDesc::Texture(texture)) => {
                texture.usage != TextureUsage::Sampled
            }
            _ => false,
        }
    }
}

/// Describes a resource to be created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceDesc {
    Buffer(BufferDesc),
    Texture(TextureDesc),
}

impl From<BufferDesc> for ResourceDesc {
    #[inline]
    fn from(desc: BufferDesc) -> Self {
        ResourceDesc::Buffer(desc)
    }
}

impl From<TextureDesc> for ResourceDesc {
    #[inline]
    fn from(desc: TextureDesc) -> Self {
        ResourceDesc::Texture(desc)
    }
}

/// Describes a buffer. Buffers are untyped and may be used for anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub size: DeviceSize,
}

/// Describes a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub dimension: TextureDimension,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    /// The depth for 3D textures, the number of array layers otherwise.
    pub depth_or_array_layers: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// Returns a description of a single-sampled 2D texture with one mip level.
    #[inline]
    pub const fn new_2d(format: TextureFormat, width: u32, height: u32) -> Self {
        TextureDesc {
            dimension: TextureDimension::D2,
            format,
            width,
            height,
            depth_or_array_layers: 1,
            mip_levels: 1,
            sample_count: 1,
            usage: TextureUsage::Sampled,
        }
    }

    /// Returns the number of bytes the texels of all mip levels, layers and samples occupy when
    /// tightly packed.
    pub fn texel_data_size(&self) -> DeviceSize {
        let (depth, layers) = match self.dimension {
            TextureDimension::D3 => (self.depth_or_array_layers, 1),
            TextureDimension::D1 | TextureDimension::D2 => (1, self.depth_or_array_layers),
        };
        let texel_size = self.format.block_size();

        (0..self.mip_levels.max(1))
            .map(|level| {
                let width = DeviceSize::from((self.width >> level).max(1));
                let height = DeviceSize::from((self.height >> level).max(1));
                let depth = DeviceSize::from((depth >> level).max(1));

                width * height * depth * texel_size
            })
            .sum::<DeviceSize>()
            * DeviceSize::from(layers.max(1))
            * DeviceSize::from(self.sample_count.max(1))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    D2,
    D3,
}

/// How a texture is going to be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureUsage {
    /// Read by shaders only.
    Sampled,

    /// Rendered to as a color attachment, and possibly sampled afterwards.
    RenderTarget,

    /// Used as a depth/stencil attachment.
    DepthStencil,
}

/// The texel formats the allocators know the size of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R16G16B16A16Sfloat,
    R32Sfloat,
    R32G32B32A32Sfloat,
    D32Sfloat,
    D24UnormS8Uint,
}

impl TextureFormat {
    /// Returns the size in bytes of one texel.
    pub const fn block_size(self) -> DeviceSize {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::R8G8Unorm => 2,
            TextureFormat::R8G8B8A8Unorm
            | TextureFormat::R8G8B8A8Srgb
            | TextureFormat::B8G8R8A8Unorm
            | TextureFormat::B8G8R8A8Srgb
            | TextureFormat::R32Sfloat
            | TextureFormat::D32Sfloat
            | TextureFormat::D24UnormS8Uint => 4,
            TextureFormat::R16G16B16A16Sfloat => 8,
            TextureFormat::R32G32B32A32Sfloat => 16,
        }
    }

    /// Returns whether the format has a depth or stencil aspect.
    pub const fn is_depth_stencil(self) -> bool {
        matches!(self, TextureFormat::D32Sfloat | TextureFormat::D24UnormS8Uint)
    }
}

/// Error that can be returned by a [`MemoryDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceError {
    /// There is no memory available on the host.
    OutOfHostMemory,

    /// There is no memory available on the device.
    OutOfDeviceMemory,

    /// Too many objects of the type have already been created.
    TooManyObjects,

    /// Mapping a CPU-visible heap has failed.
    MemoryMapFailed,

    /// The device can't create a resource with the given description.
    Unsupported,

    /// The logical or physical device has been lost.
    DeviceLost,
}

impl Error for DeviceError {}

impl Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfHostMemory => "a host memory allocation has failed",
            Self::OutOfDeviceMemory => "a device memory allocation has failed",
            Self::TooManyObjects => "too many objects of the type have already been created",
            Self::MemoryMapFailed => "mapping of a memory object has failed",
            Self::Unsupported => "the device doesn't support the requested resource",
            Self::DeviceLost => "the logical or physical device has been lost",
        };

        f.write_str(msg)
    }
}
