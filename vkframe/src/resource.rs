// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Buffers and images backed by the [`MemoryAllocator`].
//!
//! Neither type frees itself on drop: the sub-allocation has to go back to the allocator that
//! made it, so both are destroyed explicitly with `destroy`, after the GPU is done with them.

use crate::{
    device::{DedicatedTo, RawDevice},
    memory::{AllocationCreateInfo, MemoryAllocator, MemoryAllocatorError, SubAllocation},
    DeviceSize, VulkanError,
};
use ash::vk;

/// Parameters to create a new `Buffer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCreateInfo {
    /// The size in bytes of the buffer.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: DeviceSize,

    /// How the buffer is going to be used.
    ///
    /// The default value is empty, which must be overridden.
    pub usage: vk::BufferUsageFlags,
}

impl Default for BufferCreateInfo {
    #[inline]
    fn default() -> Self {
        BufferCreateInfo {
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
        }
    }
}

/// A buffer bound to a range of device memory.
#[derive(Debug)]
pub struct Buffer {
    handle: vk::Buffer,
    size: DeviceSize,
    usage: vk::BufferUsageFlags,
    allocation: SubAllocation,
}

impl Buffer {
    /// Creates a buffer and binds it to memory with the given property flags.
    ///
    /// Memory that is `HOST_VISIBLE` is mapped, so that it can be written with
    /// [`write`](Self::write).
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.size` is zero.
    pub fn new(
        allocator: &mut MemoryAllocator,
        create_info: BufferCreateInfo,
        property_flags: vk::MemoryPropertyFlags,
    ) -> Result<Buffer, MemoryAllocatorError> {
        assert!(create_info.size > 0, "buffers must not be zero-sized");

        let device = allocator.device().clone();
        let handle = device.create_buffer(&create_info)?;
        let requirements = device.buffer_memory_requirements(handle);

        let allocation = allocator
            .allocate(AllocationCreateInfo {
                want_mapped: property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
                dedicated_to: Some(DedicatedTo::Buffer(handle)),
                ..AllocationCreateInfo::new(requirements, property_flags)
            })
            .inspect_err(|_| unsafe { device.destroy_buffer(handle) })?;

        if let Err(err) = device.bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        {
            unsafe { device.destroy_buffer(handle) };
            allocator.release(allocation);
            return Err(err.into());
        }

        Ok(Buffer {
            handle,
            size: create_info.size,
            usage: create_info.usage,
            allocation,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// The size the buffer was created with. The memory backing it may be larger.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    #[inline]
    pub fn allocation(&self) -> &SubAllocation {
        &self.allocation
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.allocation.mapped_ptr().is_some()
    }

    /// Copies `data` into the buffer at `offset`, through its mapping.
    ///
    /// The GPU must not be accessing the written range. Host-visible memory is always
    /// allocated `HOST_COHERENT`, so no flush is needed.
    ///
    /// # Panics
    ///
    /// - Panics if the buffer is not mapped.
    /// - Panics if the range is out of the buffer's bounds.
    pub fn write(&self, offset: DeviceSize, data: &[u8]) {
        let end = offset + data.len() as DeviceSize;
        assert!(
            end <= self.size,
            "write of {} bytes at offset {} is out of bounds of a buffer of {} bytes",
            data.len(),
            offset,
            self.size,
        );

        let mapped = unsafe { self.allocation.mapped_slice() }.expect("the buffer is not mapped");
        mapped[offset as usize..end as usize].copy_from_slice(data);
    }

    /// Destroys the buffer and returns its memory to `allocator`.
    ///
    /// The GPU must be done with the buffer.
    pub fn destroy(self, allocator: &mut MemoryAllocator) {
        unsafe { allocator.device().destroy_buffer(self.handle) };
        allocator.release(self.allocation);
    }
}

/// Parameters to create a new `Image`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageCreateInfo {
    /// The width and height of the image.
    ///
    /// The default value is `[0, 0]`, which must be overridden.
    pub extent: [u32; 2],

    /// The default value is `vk::Format::UNDEFINED`, which must be overridden.
    pub format: vk::Format,

    /// The default value is empty, which must be overridden.
    pub usage: vk::ImageUsageFlags,

    /// The default value is `1`.
    pub mip_levels: u32,

    /// The default value is `vk::SampleCountFlags::TYPE_1`.
    pub samples: vk::SampleCountFlags,

    /// The default value is `vk::ImageTiling::OPTIMAL`.
    pub tiling: vk::ImageTiling,
}

impl Default for ImageCreateInfo {
    #[inline]
    fn default() -> Self {
        ImageCreateInfo {
            extent: [0, 0],
            format: vk::Format::UNDEFINED,
            usage: vk::ImageUsageFlags::empty(),
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
        }
    }
}

/// A 2D image bound to device memory, together with a view of all of its mip levels.
#[derive(Debug)]
pub struct Image {
    handle: vk::Image,
    view: vk::ImageView,
    create_info: ImageCreateInfo,
    allocation: SubAllocation,
}

impl Image {
    /// Creates an image and its view, and binds it to memory with the given property flags.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.extent` has a zero component.
    /// - Panics if `create_info.mip_levels` is zero.
    pub fn new(
        allocator: &mut MemoryAllocator,
        create_info: ImageCreateInfo,
        property_flags: vk::MemoryPropertyFlags,
    ) -> Result<Image, MemoryAllocatorError> {
        assert!(
            create_info.extent[0] != 0 && create_info.extent[1] != 0,
            "images must not be zero-sized",
        );
        assert!(create_info.mip_levels != 0, "images must have at least one mip level");

        let device = allocator.device().clone();
        let handle = device.create_image(&create_info)?;
        let requirements = device.image_memory_requirements(handle);

        let allocation = allocator
            .allocate(AllocationCreateInfo {
                dedicated_to: Some(DedicatedTo::Image(handle)),
                ..AllocationCreateInfo::new(requirements, property_flags)
            })
            .inspect_err(|_| unsafe { device.destroy_image(handle) })?;

        let view = match bind_and_create_view(&*device, handle, &create_info, &allocation) {
            Ok(view) => view,
            Err(err) => {
                unsafe { device.destroy_image(handle) };
                allocator.release(allocation);
                return Err(err.into());
            }
        };

        Ok(Image {
            handle,
            view,
            create_info,
            allocation,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn create_info(&self) -> &ImageCreateInfo {
        &self.create_info
    }

    #[inline]
    pub fn extent(&self) -> [u32; 2] {
        self.create_info.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.create_info.format
    }

    #[inline]
    pub fn allocation(&self) -> &SubAllocation {
        &self.allocation
    }

    /// Destroys the view and the image, and returns the memory to `allocator`.
    ///
    /// The GPU must be done with the image.
    pub fn destroy(self, allocator: &mut MemoryAllocator) {
        unsafe {
            allocator.device().destroy_image_view(self.view);
            allocator.device().destroy_image(self.handle);
        }
        allocator.release(self.allocation);
    }
}

fn bind_and_create_view(
    device: &dyn RawDevice,
    image: vk::Image,
    create_info: &ImageCreateInfo,
    allocation: &SubAllocation,
) -> Result<vk::ImageView, VulkanError> {
    device.bind_image_memory(image, allocation.memory(), allocation.offset())?;
    device.create_image_view(
        image,
        create_info.format,
        format_aspect(create_info.format),
        create_info.mip_levels,
    )
}

/// Returns the aspects of an image of the given format.
pub fn format_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Returns whether the format has a depth or stencil aspect.
#[inline]
pub fn is_depth_format(format: vk::Format) -> bool {
    !format_aspect(format).contains(vk::ImageAspectFlags::COLOR)
}

/// Returns the size in bytes of one texel of an uncompressed format, or `None` for formats the
/// renderer does not know.
pub fn format_texel_size(format: vk::Format) -> Option<u32> {
    Some(match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT
        | vk::Format::X8_D24_UNORM_PACK32
        | vk::Format::D24_UNORM_S8_UINT => 4,
        vk::Format::D32_SFLOAT_S8_UINT => 5,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32_SFLOAT => 12,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::null::NullDevice, memory::MemoryAllocatorCreateInfo};

    #[test]
    fn buffer_write_through_mapping() {
        let device = NullDevice::new();
        let mut allocator = MemoryAllocator::new(device.clone(), Default::default());

        let buffer = Buffer::new(
            &mut allocator,
            BufferCreateInfo {
                size: 16,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
            },
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();

        assert!(buffer.is_mapped());
        buffer.write(4, &[1, 2, 3, 4]);
        let mapped = unsafe { buffer.allocation().mapped_slice() }.unwrap();
        assert_eq!(&mapped[..8], &[0, 0, 0, 0, 1, 2, 3, 4]);

        buffer.destroy(&mut allocator);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(allocator.allocation_count(), 0);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn buffer_write_out_of_bounds() {
        let device = NullDevice::new();
        let mut allocator = MemoryAllocator::new(device, Default::default());
        let buffer = Buffer::new(
            &mut allocator,
            BufferCreateInfo {
                size: 4,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
            },
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )
        .unwrap();

        buffer.write(2, &[0; 4]);
    }

    #[test]
    fn image_and_view_lifetime() {
        let device = NullDevice::new();
        let mut allocator = MemoryAllocator::new(
            device.clone(),
            MemoryAllocatorCreateInfo {
                page_size: 1 << 20,
                ..Default::default()
            },
        );

        let image = Image::new(
            &mut allocator,
            ImageCreateInfo {
                extent: [64, 64],
                format: vk::Format::R8G8B8A8_UNORM,
                usage: vk::ImageUsageFlags::SAMPLED,
                ..Default::default()
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();

        assert_eq!(image.allocation().size() % 4096, 0);
        assert!(image.allocation().size() >= 64 * 64 * 4);
        assert_eq!(device.live_object_count_of("image view"), 1);

        image.destroy(&mut allocator);
        assert_eq!(device.live_image_count(), 0);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn aspects() {
        assert_eq!(
            format_aspect(vk::Format::B8G8R8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            format_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        );
        assert!(is_depth_format(vk::Format::D32_SFLOAT));
        assert!(!is_depth_format(vk::Format::R8G8B8A8_UNORM));
    }
}
