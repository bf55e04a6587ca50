// Copyright (c) 2024 The suballoc contributors
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A [`MemoryDevice`] backed by a Vulkan device, through `ash`.
//!
//! Heaps are `VkDeviceMemory` objects and resources are buffers and images bound to them at an
//! offset. CPU-visible heaps are mapped once when they are created, and stay mapped until they
//! are freed.

use crate::{
    device::{
        CreatedResource, DeviceError, HeapCreateInfo, HeapType, HeapUsage, MemoryDevice,
        MemoryRequirements, ResourceDesc, TextureDesc, TextureDimension, TextureFormat,
        TextureUsage,
    },
    memory::DeviceAlignment,
    DeviceAddress, DeviceSize,
};
use ash::vk;
use std::{
    fmt::{self, Debug},
    ptr::NonNull,
};

/// A [`MemoryDevice`] implemented on top of an [`ash::Device`].
pub struct AshDevice {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    buffer_device_address: bool,
}

impl AshDevice {
    /// Creates a new `AshDevice`.
    ///
    /// # Safety
    ///
    /// - `device` must be a valid device, and must outlive `self` and every heap and resource
    ///   created through it.
    /// - `memory_properties` must be those of the physical device `device` was created from.
    /// - If `buffer_device_address` is `true`, the `bufferDeviceAddress` feature must be enabled
    ///   on `device`.
    pub unsafe fn new(
        device: ash::Device,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        buffer_device_address: bool,
    ) -> Self {
        AshDevice {
            device,
            memory_properties,
            buffer_device_address,
        }
    }

    /// Returns the wrapped device.
    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn buffer_usage(&self) -> vk::BufferUsageFlags {
        let mut usage = vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::INDIRECT_BUFFER;

        if self.buffer_device_address {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }

        usage
    }

    unsafe fn create_buffer(&self, size: DeviceSize) -> Result<vk::Buffer, DeviceError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size.max(1))
            .usage(self.buffer_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        Ok(unsafe { self.device.create_buffer(&create_info, None) }?)
    }

    unsafe fn create_image(&self, desc: &TextureDesc) -> Result<vk::Image, DeviceError> {
        let create_info = image_create_info(desc);

        Ok(unsafe { self.device.create_image(&create_info, None) }?)
    }

    /// Returns the memory types a heap with `usage` may use, by asking for the requirements of a
    /// representative resource.
    fn memory_type_bits(&self, usage: HeapUsage) -> Result<u32, DeviceError> {
        let probe = match usage {
            HeapUsage::Buffers => return self.buffer_memory_type_bits(),
            HeapUsage::Textures => TextureDesc::new_2d(TextureFormat::R8G8B8A8Unorm, 1, 1),
            HeapUsage::RenderTargets => TextureDesc {
                usage: TextureUsage::RenderTarget,
                ..TextureDesc::new_2d(TextureFormat::R8G8B8A8Unorm, 1, 1)
            },
        };

        let image = unsafe { self.create_image(&probe) }?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        unsafe { self.device.destroy_image(image, None) };

        Ok(requirements.memory_type_bits)
    }

    fn buffer_memory_type_bits(&self) -> Result<u32, DeviceError> {
        let buffer = unsafe { self.create_buffer(1) }?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        unsafe { self.device.destroy_buffer(buffer, None) };

        Ok(requirements.memory_type_bits)
    }

    /// Picks the first memory type allowed by `memory_type_bits` whose properties suit
    /// `heap_type`, trying the preferred properties before the required ones.
    fn find_memory_type(&self, memory_type_bits: u32, heap_type: HeapType) -> Option<u32> {
        let (preferred, required) = match heap_type {
            HeapType::Default => (
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ),
            HeapType::Upload => (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
            HeapType::Readback => (
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
        };

        let memory_types = &self.memory_properties.memory_types
            [..self.memory_properties.memory_type_count as usize];
        let find = |flags: vk::MemoryPropertyFlags| {
            memory_types
                .iter()
                .enumerate()
                .find(|&(index, memory_type)| {
                    memory_type_bits & (1 << index) != 0
                        && memory_type.property_flags.contains(flags)
                })
                .map(|(index, _)| index as u32)
        };

        find(preferred).or_else(|| find(required))
    }
}

impl Debug for AshDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AshDevice")
            .field("handle", &self.device.handle())
            .field("buffer_device_address", &self.buffer_device_address)
            .finish_non_exhaustive()
    }
}

/// A `VkDeviceMemory` object, mapped if it is CPU-visible.
#[derive(Debug)]
pub struct AshHeap {
    memory: vk::DeviceMemory,
    size: DeviceSize,
    mapped_ptr: Option<NonNull<u8>>,
}

// SAFETY: The mapping is only accessed through the resources placed in the heap.
unsafe impl Send for AshHeap {}
unsafe impl Sync for AshHeap {}

impl AshHeap {
    /// Returns the memory object.
    #[inline]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }
}

/// A buffer or an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AshResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

unsafe impl MemoryDevice for AshDevice {
    type Heap = AshHeap;

    type Resource = AshResource;

    fn resource_requirements(&self, desc: &ResourceDesc) -> Result<MemoryRequirements, DeviceError> {
        let requirements = match desc {
            ResourceDesc::Buffer(buffer) => {
                let buffer = unsafe { self.create_buffer(buffer.size) }?;
                let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
                unsafe { self.device.destroy_buffer(buffer, None) };

                requirements
            }
            ResourceDesc::Texture(texture) => {
                let image = unsafe { self.create_image(texture) }?;
                let requirements = unsafe { self.device.get_image_memory_requirements(image) };
                unsafe { self.device.destroy_image(image, None) };

                requirements
            }
        };

        Ok(MemoryRequirements {
            size: requirements.size,
            alignment: DeviceAlignment::new(requirements.alignment)
                .ok_or(DeviceError::Unsupported)?,
        })
    }

    unsafe fn create_heap(&self, info: &HeapCreateInfo) -> Result<Self::Heap, DeviceError> {
        let memory_type_bits = self.memory_type_bits(info.usage)?;
        let memory_type_index = self
            .find_memory_type(memory_type_bits, info.heap_type)
            .ok_or(DeviceError::Unsupported)?;

        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(info.size)
            .memory_type_index(memory_type_index);

        if self.buffer_device_address && info.usage == HeapUsage::Buffers {
            allocate_info = allocate_info.push_next(&mut flags_info);
        }

        let memory = unsafe { self.device.allocate_memory(&allocate_info, None) }?;

        let mapped_ptr = if info.heap_type.is_cpu_visible() {
            let result = unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            };

            match result {
                Ok(ptr) => NonNull::new(ptr.cast::<u8>()),
                Err(err) => {
                    unsafe { self.device.free_memory(memory, None) };
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        Ok(AshHeap {
            memory,
            size: info.size,
            mapped_ptr,
        })
    }

    unsafe fn destroy_heap(&self, heap: Self::Heap) {
        // Freeing the memory unmaps it implicitly.
        unsafe { self.device.free_memory(heap.memory, None) };
    }

    unsafe fn create_placed_resource(
        &self,
        heap: &Self::Heap,
        offset: DeviceSize,
        desc: &ResourceDesc,
    ) -> Result<CreatedResource<Self::Resource>, DeviceError> {
        let (resource, device_address) = match desc {
            ResourceDesc::Buffer(buffer) => {
                let buffer = unsafe { self.create_buffer(buffer.size) }?;

                if let Err(err) =
                    unsafe { self.device.bind_buffer_memory(buffer, heap.memory, offset) }
                {
                    unsafe { self.device.destroy_buffer(buffer, None) };
                    return Err(err.into());
                }

                let device_address = if self.buffer_device_address {
                    let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);

                    DeviceAddress::new(unsafe { self.device.get_buffer_device_address(&info) })
                } else {
                    None
                };

                (AshResource::Buffer(buffer), device_address)
            }
            ResourceDesc::Texture(texture) => {
                let image = unsafe { self.create_image(texture) }?;

                if let Err(err) =
                    unsafe { self.device.bind_image_memory(image, heap.memory, offset) }
                {
                    unsafe { self.device.destroy_image(image, None) };
                    return Err(err.into());
                }

                (AshResource::Image(image), None)
            }
        };

        // SAFETY: The caller guarantees that the range is inside of the heap.
        let mapped_ptr = heap
            .mapped_ptr
            .map(|ptr| unsafe { ptr.add(offset as usize) });

        Ok(CreatedResource {
            resource,
            device_address,
            mapped_ptr,
        })
    }

    unsafe fn destroy_resource(&self, resource: Self::Resource) {
        match resource {
            AshResource::Buffer(buffer) => unsafe { self.device.destroy_buffer(buffer, None) },
            AshResource::Image(image) => unsafe { self.device.destroy_image(image, None) },
        }
    }
}

fn image_create_info(desc: &TextureDesc) -> vk::ImageCreateInfo<'static> {
    let (image_type, depth, array_layers) = match desc.dimension {
        TextureDimension::D1 => (vk::ImageType::TYPE_1D, 1, desc.depth_or_array_layers),
        TextureDimension::D2 => (vk::ImageType::TYPE_2D, 1, desc.depth_or_array_layers),
        TextureDimension::D3 => (vk::ImageType::TYPE_3D, desc.depth_or_array_layers, 1),
    };

    let usage = match desc.usage {
        TextureUsage::Sampled => vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        TextureUsage::RenderTarget => {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
        }
        TextureUsage::DepthStencil => {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
        }
    };

    vk::ImageCreateInfo::default()
        .image_type(image_type)
        .format(vk_format(desc.format))
        .extent(vk::Extent3D {
            width: desc.width.max(1),
            height: desc.height.max(1),
            depth: depth.max(1),
        })
        .mip_levels(desc.mip_levels.max(1))
        .array_layers(array_layers.max(1))
        .samples(vk::SampleCountFlags::from_raw(desc.sample_count.max(1)))
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
}

fn vk_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::R8G8Unorm => vk::Format::R8G8_UNORM,
        TextureFormat::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::B8G8R8A8Srgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::R16G16B16A16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::R32Sfloat => vk::Format::R32_SFLOAT,
        TextureFormat::R32G32B32A32Sfloat => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::D32Sfloat => vk::Format::D32_SFLOAT,
        TextureFormat::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
    }
}

impl From<vk::Result> for DeviceError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => DeviceError::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => DeviceError::OutOfDeviceMemory,
            vk::Result::ERROR_TOO_MANY_OBJECTS => DeviceError::TooManyObjects,
            vk::Result::ERROR_MEMORY_MAP_FAILED => DeviceError::MemoryMapFailed,
            vk::Result::ERROR_DEVICE_LOST => DeviceError::DeviceLost,
            _ => DeviceError::Unsupported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_conversion() {
        assert_eq!(
            DeviceError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            DeviceError::OutOfDeviceMemory,
        );
        assert_eq!(
            DeviceError::from(vk::Result::ERROR_FORMAT_NOT_SUPPORTED),
            DeviceError::Unsupported,
        );
    }

    #[test]
    fn image_info_of_3d_texture() {
        let desc = TextureDesc {
            dimension: TextureDimension::D3,
            depth_or_array_layers: 8,
            mip_levels: 0,
            ..TextureDesc::new_2d(TextureFormat::R16G16B16A16Sfloat, 16, 16)
        };
        let info = image_create_info(&desc);

        assert_eq!(info.image_type, vk::ImageType::TYPE_3D);
        assert_eq!(info.format, vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(info.extent.depth, 8);
        assert_eq!(info.array_layers, 1);
        assert_eq!(info.mip_levels, 1);
        assert_eq!(info.samples, vk::SampleCountFlags::TYPE_1);
    }
}
