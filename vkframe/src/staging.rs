// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Uploading data from the host to device-local memory.
//!
//! Data is written into a host-visible staging buffer, and a copy into the destination is
//! recorded. The staging buffer is tagged with the token of the command buffer the copy was
//! recorded into, and can be handed out again once that submission has completed.

use crate::{
    command_buffer::CommandBuffer,
    memory::{MemoryAllocator, MemoryAllocatorError},
    resource::{format_aspect, format_texel_size, Buffer, BufferCreateInfo, Image},
    sync::CompletionToken,
    DeviceSize,
};
use ash::vk;

/// A free staging buffer is only reused for requests at least this fraction of its capacity.
const MAX_REUSE_RATIO: DeviceSize = 4;

#[derive(Debug)]
struct StagingEntry {
    buffer: Buffer,
    // `None` when the entry is free.
    in_use_until: Option<CompletionToken>,
}

/// Pool of host-visible upload buffers.
///
/// A request is served by the smallest free buffer that is large enough, as long as it is no
/// more than four times larger than the request; otherwise a new buffer is created. Buffers are
/// never destroyed before [`destroy`](Self::destroy), so that steady-state uploads do not churn
/// through the allocator.
#[derive(Debug, Default)]
pub struct StagingManager {
    entries: Vec<StagingEntry>,
}

impl StagingManager {
    #[inline]
    pub fn new() -> Self {
        StagingManager::default()
    }

    /// Returns a mapped buffer of at least `size` bytes that the commands recorded into `cb`
    /// may read from.
    ///
    /// # Panics
    ///
    /// - Panics if `size` is zero.
    pub fn request(
        &mut self,
        allocator: &mut MemoryAllocator,
        size: DeviceSize,
        cb: &CommandBuffer,
    ) -> Result<&Buffer, MemoryAllocatorError> {
        assert!(size > 0, "staging requests must not be zero-sized");

        let token = cb.token();
        let best_fit = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                let capacity = entry.buffer.size();
                entry.in_use_until.is_none()
                    && capacity >= size
                    && capacity <= size.saturating_mul(MAX_REUSE_RATIO)
            })
            .min_by_key(|(_, entry)| entry.buffer.size())
            .map(|(index, _)| index);

        let index = match best_fit {
            Some(index) => index,
            None => {
                let buffer = Buffer::new(
                    allocator,
                    BufferCreateInfo {
                        size,
                        usage: vk::BufferUsageFlags::TRANSFER_SRC,
                    },
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )?;
                log::debug!(
                    "new staging buffer of {} bytes ({} total)",
                    size,
                    self.entries.len() + 1,
                );
                self.entries.push(StagingEntry {
                    buffer,
                    in_use_until: None,
                });

                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];
        entry.in_use_until = Some(token);

        Ok(&entry.buffer)
    }

    /// Frees every entry whose submission has completed. Returns the number of entries freed.
    pub fn update(&mut self) -> usize {
        let mut freed = 0;

        for entry in &mut self.entries {
            if entry
                .in_use_until
                .as_ref()
                .is_some_and(CompletionToken::is_reclaimable)
            {
                entry.in_use_until = None;
                freed += 1;
            }
        }

        if freed != 0 {
            log::trace!("{} staging buffers freed", freed);
        }

        freed
    }

    /// Uploads `data` at the start of `dst`, and makes it visible to the accesses its usage
    /// allows.
    ///
    /// # Panics
    ///
    /// - Panics if `data` is empty or larger than `dst`.
    pub fn upload_buffer(
        &mut self,
        allocator: &mut MemoryAllocator,
        cb: &CommandBuffer,
        dst: &Buffer,
        data: &[u8],
    ) -> Result<(), MemoryAllocatorError> {
        let size = data.len() as DeviceSize;
        assert!(
            size <= dst.size(),
            "uploading {} bytes into a buffer of {} bytes",
            size,
            dst.size(),
        );

        let staging = self.request(allocator, size, cb)?;
        staging.write(0, data);

        let device = cb.device();
        let handle = cb.recording_handle();
        device.cmd_copy_buffer(
            handle,
            staging.handle(),
            dst.handle(),
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            }],
        );

        let (dst_access, dst_stage) = buffer_read_access(dst.usage());
        device.cmd_pipeline_barrier(
            handle,
            vk::PipelineStageFlags::TRANSFER,
            dst_stage,
            &[vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(dst.handle())
                .offset(0)
                .size(size)],
            &[],
        );

        Ok(())
    }

    /// Uploads every mip level of `dst` from `data`, where the levels are tightly packed one
    /// after the other starting with the largest. The image is left in the
    /// `SHADER_READ_ONLY_OPTIMAL` layout. Its previous contents are discarded.
    ///
    /// # Panics
    ///
    /// - Panics if the format of `dst` has no known texel size.
    /// - Panics if the length of `data` does not match the size of the mip chain.
    pub fn upload_image(
        &mut self,
        allocator: &mut MemoryAllocator,
        cb: &CommandBuffer,
        dst: &Image,
        data: &[u8],
    ) -> Result<(), MemoryAllocatorError> {
        let info = *dst.create_info();
        let texel_size = format_texel_size(info.format)
            .unwrap_or_else(|| panic!("can't upload into an image of format {:?}", info.format))
            as DeviceSize;
        let aspect_mask = format_aspect(info.format);

        let mut regions = Vec::with_capacity(info.mip_levels as usize);
        let mut offset = 0;
        for level in 0..info.mip_levels {
            let [width, height] = info.extent.map(|dimension| (dimension >> level).max(1));
            regions.push(vk::BufferImageCopy {
                buffer_offset: offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
            });
            offset += width as DeviceSize * height as DeviceSize * texel_size;
        }
        assert_eq!(
            data.len() as DeviceSize,
            offset,
            "the data does not match the size of the mip chain",
        );

        let staging = self.request(allocator, offset, cb)?;
        staging.write(0, data);

        let device = cb.device();
        let handle = cb.recording_handle();
        let range = vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: info.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        };
        let barrier = vk::ImageMemoryBarrier::default()
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(dst.handle())
            .subresource_range(range);

        device.cmd_pipeline_barrier(
            handle,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            &[],
            &[barrier
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)],
        );
        device.cmd_copy_buffer_to_image(
            handle,
            staging.handle(),
            dst.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &regions,
        );
        device.cmd_pipeline_barrier(
            handle,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            &[],
            &[barrier
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)],
        );

        Ok(())
    }

    /// The number of staging buffers, free or not.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.in_use_until.is_none())
            .count()
    }

    /// Destroys every staging buffer. The device must be idle.
    pub fn destroy(&mut self, allocator: &mut MemoryAllocator) {
        for entry in self.entries.drain(..) {
            entry.buffer.destroy(allocator);
        }
    }
}

fn buffer_read_access(usage: vk::BufferUsageFlags) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    let mut access = vk::AccessFlags::empty();
    let mut stages = vk::PipelineStageFlags::empty();

    if usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER) {
        access |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
        stages |= vk::PipelineStageFlags::VERTEX_INPUT;
    }
    if usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) {
        access |= vk::AccessFlags::INDEX_READ;
        stages |= vk::PipelineStageFlags::VERTEX_INPUT;
    }
    if usage.intersects(vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER)
    {
        access |= vk::AccessFlags::SHADER_READ;
        stages |= vk::PipelineStageFlags::VERTEX_SHADER
            | vk::PipelineStageFlags::FRAGMENT_SHADER
            | vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    if usage.contains(vk::BufferUsageFlags::TRANSFER_SRC) {
        access |= vk::AccessFlags::TRANSFER_READ;
        stages |= vk::PipelineStageFlags::TRANSFER;
    }

    if stages.is_empty() {
        (vk::AccessFlags::MEMORY_READ, vk::PipelineStageFlags::ALL_COMMANDS)
    } else {
        (access, stages)
    }
}
