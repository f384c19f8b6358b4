// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Transient images reused from frame to frame.

use crate::{
    command_buffer::CommandBuffer,
    memory::{MemoryAllocator, MemoryAllocatorError},
    resource::{format_aspect, Image, ImageCreateInfo},
};
use ash::vk;
use parking_lot::Mutex;

/// Everything that must match for a pooled image to be handed out again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetDesc {
    pub extent: [u32; 2],
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub memory_properties: vk::MemoryPropertyFlags,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
}

impl RenderTargetDesc {
    /// A device-local, single-sampled target without mip levels.
    #[inline]
    pub fn new(extent: [u32; 2], format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        RenderTargetDesc {
            extent,
            format,
            usage,
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }
}

/// Identifies an entry of a [`RenderTargetPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetId(usize);

/// A render target handed out by [`RenderTargetPool::acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTarget {
    pub id: RenderTargetId,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub desc: RenderTargetDesc,
}

#[derive(Debug)]
struct Entry {
    name: String,
    desc: RenderTargetDesc,
    image: Image,
    layout: vk::ImageLayout,
    in_use: bool,
}

/// Number of entries of a [`RenderTargetPool`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderTargetStats {
    pub total: usize,
    pub in_use: usize,
}

/// Pool of transient images.
///
/// [`acquire`](Self::acquire) hands out a free entry whose description matches exactly, or
/// creates a new one. [`release`](Self::release) makes an entry free again without destroying
/// it. The pool tracks the layout of every image, so that [`transition`](Self::transition) only
/// records a barrier when the layout actually changes.
///
/// The pool can be shared between recording threads: all of its state is behind one lock, which
/// every method takes.
#[derive(Debug, Default)]
pub struct RenderTargetPool {
    entries: Mutex<Vec<Entry>>,
}

impl RenderTargetPool {
    #[inline]
    pub fn new() -> Self {
        RenderTargetPool::default()
    }

    /// Returns a free render target matching `desc`, creating one if there is none.
    ///
    /// A newly created target is in the `UNDEFINED` layout. A reused one is in whatever layout
    /// it was last transitioned to.
    pub fn acquire(
        &self,
        allocator: &mut MemoryAllocator,
        name: &str,
        desc: &RenderTargetDesc,
    ) -> Result<RenderTarget, MemoryAllocatorError> {
        let mut entries = self.entries.lock();

        let index = match entries
            .iter()
            .position(|entry| !entry.in_use && entry.desc == *desc)
        {
            Some(index) => index,
            None => {
                let image = Image::new(
                    allocator,
                    ImageCreateInfo {
                        extent: desc.extent,
                        format: desc.format,
                        usage: desc.usage,
                        mip_levels: desc.mip_levels,
                        samples: desc.samples,
                        ..Default::default()
                    },
                    desc.memory_properties,
                )?;
                log::debug!(
                    "new render target `{}`: {:?} {:?} x{} ({} in pool)",
                    name,
                    desc.extent,
                    desc.format,
                    desc.samples.as_raw(),
                    entries.len() + 1,
                );
                entries.push(Entry {
                    name: name.to_owned(),
                    desc: *desc,
                    image,
                    layout: vk::ImageLayout::UNDEFINED,
                    in_use: false,
                });

                entries.len() - 1
            }
        };

        let entry = &mut entries[index];
        entry.in_use = true;
        if entry.name != name {
            name.clone_into(&mut entry.name);
        }

        Ok(RenderTarget {
            id: RenderTargetId(index),
            image: entry.image.handle(),
            view: entry.image.view(),
            desc: entry.desc,
        })
    }

    /// Makes a render target free again. The image is kept for later requests.
    ///
    /// # Panics
    ///
    /// - Panics if the target is not in use.
    pub fn release(&self, id: RenderTargetId) {
        let mut entries = self.entries.lock();
        let entry = &mut entries[id.0];
        assert!(
            entry.in_use,
            "releasing render target `{}` which is not in use",
            entry.name,
        );

        entry.in_use = false;
    }

    /// Makes every render target free.
    ///
    /// Called between frames so that targets nobody asks for anymore don't keep the pool
    /// growing when the request pattern changes.
    pub fn empty_pool(&self) {
        for entry in self.entries.lock().iter_mut() {
            entry.in_use = false;
        }
    }

    /// Records a barrier moving the target to `new_layout`, unless it is already in it.
    ///
    /// Returns whether a barrier was recorded.
    ///
    /// # Panics
    ///
    /// - Panics if `cb` is not recording.
    pub fn transition(
        &self,
        cb: &CommandBuffer,
        id: RenderTargetId,
        new_layout: vk::ImageLayout,
    ) -> bool {
        let mut entries = self.entries.lock();
        let entry = &mut entries[id.0];

        if entry.layout == new_layout {
            return false;
        }

        record_transition(
            cb,
            entry.image.handle(),
            format_aspect(entry.desc.format),
            entry.desc.mip_levels,
            entry.layout,
            new_layout,
        );
        entry.layout = new_layout;

        true
    }

    /// Returns the layout the target was last transitioned to.
    pub fn layout(&self, id: RenderTargetId) -> vk::ImageLayout {
        self.entries.lock()[id.0].layout
    }

    pub fn stats(&self) -> RenderTargetStats {
        let entries = self.entries.lock();

        RenderTargetStats {
            total: entries.len(),
            in_use: entries.iter().filter(|entry| entry.in_use).count(),
        }
    }

    /// Destroys every render target. The GPU must be done with all of them.
    pub fn destroy(&self, allocator: &mut MemoryAllocator) {
        let entries = std::mem::take(&mut *self.entries.lock());

        for entry in entries {
            entry.image.destroy(allocator);
        }
    }
}

/// Records an image layout transition with the access and stage masks of [`layout_access`].
///
/// # Panics
///
/// - Panics if `cb` is not recording.
pub fn record_transition(
    cb: &CommandBuffer,
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    mip_levels: u32,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (_, src_stage) = layout_access(old_layout);
    record_transition_after(
        cb,
        src_stage,
        image,
        aspect_mask,
        mip_levels,
        old_layout,
        new_layout,
    );
}

/// Like [`record_transition`], but the barrier waits for `src_stage` rather than for the stages
/// `old_layout` is used in.
///
/// A swapchain image is transitioned after `COLOR_ATTACHMENT_OUTPUT`, the stage that waits for
/// the acquire semaphore, so that the transition can't happen before the image is acquired.
pub fn record_transition_after(
    cb: &CommandBuffer,
    src_stage: vk::PipelineStageFlags,
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    mip_levels: u32,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let handle = cb.recording_handle();
    let (src_access, _) = layout_access(old_layout);
    let (dst_access, dst_stage) = layout_access(new_layout);

    cb.device().cmd_pipeline_barrier(
        handle,
        src_stage,
        dst_stage,
        &[],
        &[vk::ImageMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            })],
    );
}

/// Returns the accesses that an image in `layout` is used for, and the stages they happen in.
pub fn layout_access(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command_buffer::CommandBufferManager,
        device::null::{NullDevice, RecordedCommand},
    };

    fn color_desc(format: vk::Format) -> RenderTargetDesc {
        RenderTargetDesc::new(
            [256, 256],
            format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        )
    }

    #[test]
    fn release_then_acquire_reuses() {
        let device = NullDevice::new();
        let mut allocator = MemoryAllocator::new(device.clone(), Default::default());
        let pool = RenderTargetPool::new();
        let desc = color_desc(vk::Format::R8G8B8A8_UNORM);

        let first = pool.acquire(&mut allocator, "color", &desc).unwrap();
        let memory_blocks = allocator.device_memory_count();
        let allocations = allocator.allocation_count();
        pool.release(first.id);

        let second = pool.acquire(&mut allocator, "color", &desc).unwrap();
        assert_eq!(first.image, second.image);
        assert_eq!(allocator.device_memory_count(), memory_blocks);
        assert_eq!(allocator.allocation_count(), allocations);

        // Still in use, so an identical request gets another image.
        let third = pool.acquire(&mut allocator, "color", &desc).unwrap();
        assert_ne!(third.image, second.image);
        assert_eq!(pool.stats(), RenderTargetStats { total: 2, in_use: 2 });

        pool.destroy(&mut allocator);
        assert_eq!(allocator.allocation_count(), 0);
    }

    #[test]
    fn different_formats_never_share() {
        let device = NullDevice::new();
        let mut allocator = MemoryAllocator::new(device.clone(), Default::default());
        let pool = RenderTargetPool::new();

        let rgba = pool
            .acquire(&mut allocator, "a", &color_desc(vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        pool.release(rgba.id);
        let bgra = pool
            .acquire(&mut allocator, "b", &color_desc(vk::Format::B8G8R8A8_UNORM))
            .unwrap();
        assert_ne!(rgba.image, bgra.image);

        let multisampled = pool
            .acquire(
                &mut allocator,
                "msaa",
                &RenderTargetDesc {
                    samples: vk::SampleCountFlags::TYPE_4,
                    ..color_desc(vk::Format::R8G8B8A8_UNORM)
                },
            )
            .unwrap();
        assert_ne!(rgba.image, multisampled.image);

        pool.empty_pool();
        assert_eq!(pool.stats(), RenderTargetStats { total: 3, in_use: 0 });
        pool.destroy(&mut allocator);
    }

    #[test]
    fn redundant_transitions_are_elided() {
        let device = NullDevice::new();
        let mut allocator = MemoryAllocator::new(device.clone(), Default::default());
        let mut manager = CommandBufferManager::new(device.clone()).unwrap();
        let pool = RenderTargetPool::new();
        let target = pool
            .acquire(&mut allocator, "color", &color_desc(vk::Format::R8G8B8A8_UNORM))
            .unwrap();

        let mut cb = manager.allocate().unwrap();
        cb.begin().unwrap();
        assert!(pool.transition(&cb, target.id, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
        assert!(!pool.transition(&cb, target.id, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
        assert!(pool.transition(&cb, target.id, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
        cb.end().unwrap();

        assert_eq!(
            device.recorded_commands(cb.handle()),
            vec![
                RecordedCommand::PipelineBarrier {
                    src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                    buffers: 0,
                    images: vec![(
                        target.image,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    )],
                },
                RecordedCommand::PipelineBarrier {
                    src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    buffers: 0,
                    images: vec![(
                        target.image,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    )],
                },
            ],
        );
        assert_eq!(
            pool.layout(target.id),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );

        cb.submit(manager.queue().handle, &[], None).unwrap();
        manager.recycle(cb);
        manager.wait_idle().unwrap();
        pool.destroy(&mut allocator);
    }

    #[test]
    fn layout_table() {
        assert_eq!(
            layout_access(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL).1,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        );
        assert_eq!(
            layout_access(vk::ImageLayout::UNDEFINED),
            (
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::TOP_OF_PIPE
            ),
        );
    }

    #[test]
    #[should_panic(expected = "which is not in use")]
    fn double_release() {
        let device = NullDevice::new();
        let mut allocator = MemoryAllocator::new(device, Default::default());
        let pool = RenderTargetPool::new();
        let target = pool
            .acquire(&mut allocator, "color", &color_desc(vk::Format::R8G8B8A8_UNORM))
            .unwrap();

        pool.release(target.id);
        pool.release(target.id);
    }
}
