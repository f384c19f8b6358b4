// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The owner of every pooled GPU object.
//!
//! A [`RenderContext`] is created once per device and passed by reference to whatever records
//! frames. It bundles the subsystems that depend on each other's lifetimes, and tears them down
//! in the reverse order of their dependencies after waiting for the device to become idle:
//!
//! 1. the secondary recording thread,
//! 2. render targets, cached pipelines, framebuffers and render passes,
//! 3. PSOs with their shader modules and layouts,
//! 4. descriptor sets,
//! 5. staging buffers,
//! 6. command buffers and their fences,
//! 7. device memory.

use crate::{
    cache::{GraphicsPipelineKey, ObjectCache},
    command_buffer::{CommandBuffer, CommandBufferManager, SecondaryRecorder, SecondaryRecording},
    descriptor_set::{DescriptorPoolCreateInfo, DescriptorSetPool},
    device::{CommandBufferInheritance, RawDevice},
    memory::{MemoryAllocator, MemoryAllocatorCreateInfo, MemoryAllocatorError},
    pipeline::{PsoId, PsoRegistry},
    render_target::{RenderTarget, RenderTargetDesc, RenderTargetPool},
    resource::{Buffer, BufferCreateInfo, Image, ImageCreateInfo},
    staging::StagingManager,
    VulkanError,
};
use ash::vk;
use std::sync::Arc;

/// Parameters to create a [`RenderContext`].
#[derive(Clone, Debug, Default)]
pub struct RenderContextCreateInfo {
    pub memory: MemoryAllocatorCreateInfo,

    pub descriptor_pool: DescriptorPoolCreateInfo,

    /// Whether to spawn the thread that records secondary command buffers.
    ///
    /// The default value is `false`.
    pub secondary_recording: bool,
}

/// What [`RenderContext::begin_frame`] reclaimed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameReclaim {
    pub command_buffers: usize,
    pub staging_buffers: usize,
    pub descriptor_sets: usize,
}

/// Owns the allocator, the pools and the caches of one device.
///
/// The fields are declared in teardown order, which is the reverse of their dependencies.
#[derive(Debug)]
pub struct RenderContext {
    recorder: Option<SecondaryRecorder>,
    render_targets: RenderTargetPool,
    cache: ObjectCache,
    psos: PsoRegistry,
    descriptor_sets: DescriptorSetPool,
    staging: StagingManager,
    command_buffers: CommandBufferManager,
    allocator: MemoryAllocator,
    device: Arc<dyn RawDevice>,
}

impl RenderContext {
    pub fn new(
        device: Arc<dyn RawDevice>,
        create_info: RenderContextCreateInfo,
    ) -> Result<Self, VulkanError> {
        let RenderContextCreateInfo {
            memory,
            descriptor_pool,
            secondary_recording,
        } = create_info;

        let recorder = if secondary_recording {
            match SecondaryRecorder::new(device.clone()) {
                Ok(recorder) => Some(recorder),
                Err(err) => {
                    log::warn!(
                        "failed to spawn the secondary recording thread, recording inline: {}",
                        err,
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(RenderContext {
            recorder,
            render_targets: RenderTargetPool::new(),
            cache: ObjectCache::new(device.clone()),
            psos: PsoRegistry::new(device.clone()),
            descriptor_sets: DescriptorSetPool::new(device.clone(), descriptor_pool)?,
            staging: StagingManager::new(),
            command_buffers: CommandBufferManager::new(device.clone())?,
            allocator: MemoryAllocator::new(device.clone(), memory),
            device,
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    #[inline]
    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    #[inline]
    pub fn allocator_mut(&mut self) -> &mut MemoryAllocator {
        &mut self.allocator
    }

    #[inline]
    pub fn command_buffers(&self) -> &CommandBufferManager {
        &self.command_buffers
    }

    #[inline]
    pub fn command_buffers_mut(&mut self) -> &mut CommandBufferManager {
        &mut self.command_buffers
    }

    #[inline]
    pub fn staging(&self) -> &StagingManager {
        &self.staging
    }

    #[inline]
    pub fn descriptor_sets(&self) -> &DescriptorSetPool {
        &self.descriptor_sets
    }

    #[inline]
    pub fn psos(&self) -> &PsoRegistry {
        &self.psos
    }

    #[inline]
    pub fn psos_mut(&mut self) -> &mut PsoRegistry {
        &mut self.psos
    }

    #[inline]
    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    #[inline]
    pub fn cache_mut(&mut self) -> &mut ObjectCache {
        &mut self.cache
    }

    #[inline]
    pub fn render_targets(&self) -> &RenderTargetPool {
        &self.render_targets
    }

    /// The secondary recording thread, if it was requested and could be spawned.
    #[inline]
    pub fn secondary_recorder(&self) -> Option<&SecondaryRecorder> {
        self.recorder.as_ref()
    }

    /// Records a secondary command buffer on the secondary recording thread and returns it,
    /// ended. Returns `None` without calling `record` if there is no such thread.
    ///
    /// The returned command buffer goes back to the manager with
    /// [`CommandBufferManager::recycle`] after it was executed.
    pub fn record_secondary(
        &mut self,
        inheritance: CommandBufferInheritance,
        record: SecondaryRecording,
    ) -> Result<Option<CommandBuffer>, VulkanError> {
        let Some(recorder) = &self.recorder else {
            return Ok(None);
        };

        let mut secondary = self.command_buffers.allocate_secondary()?;
        if let Err(err) = recorder.record(&mut secondary, inheritance, record) {
            self.command_buffers.recycle(secondary);
            return Err(err);
        }

        Ok(Some(secondary))
    }

    pub fn create_buffer(
        &mut self,
        create_info: BufferCreateInfo,
        property_flags: vk::MemoryPropertyFlags,
    ) -> Result<Buffer, MemoryAllocatorError> {
        Buffer::new(&mut self.allocator, create_info, property_flags)
    }

    /// Destroys a buffer. The GPU must be done with it.
    pub fn destroy_buffer(&mut self, buffer: Buffer) {
        buffer.destroy(&mut self.allocator);
    }

    pub fn create_image(
        &mut self,
        create_info: ImageCreateInfo,
        property_flags: vk::MemoryPropertyFlags,
    ) -> Result<Image, MemoryAllocatorError> {
        Image::new(&mut self.allocator, create_info, property_flags)
    }

    /// Destroys an image. The GPU must be done with it.
    pub fn destroy_image(&mut self, image: Image) {
        image.destroy(&mut self.allocator);
    }

    /// Records the upload of `data` into `dst` through a staging buffer.
    pub fn upload_buffer(
        &mut self,
        cb: &CommandBuffer,
        dst: &Buffer,
        data: &[u8],
    ) -> Result<(), MemoryAllocatorError> {
        self.staging
            .upload_buffer(&mut self.allocator, cb, dst, data)
    }

    /// Records the upload of a packed mip chain into `dst` through a staging buffer.
    pub fn upload_image(
        &mut self,
        cb: &CommandBuffer,
        dst: &Image,
        data: &[u8],
    ) -> Result<(), MemoryAllocatorError> {
        self.staging.upload_image(&mut self.allocator, cb, dst, data)
    }

    /// Acquires a render target from the pool. See [`RenderTargetPool::acquire`].
    pub fn acquire_render_target(
        &mut self,
        name: &str,
        desc: &RenderTargetDesc,
    ) -> Result<RenderTarget, MemoryAllocatorError> {
        self.render_targets
            .acquire(&mut self.allocator, name, desc)
    }

    /// Returns the graphics pipeline for `key`, creating it on a cache miss.
    pub fn graphics_pipeline(
        &mut self,
        key: &GraphicsPipelineKey,
    ) -> Result<vk::Pipeline, VulkanError> {
        self.cache.get_or_create_graphics_pipeline(&self.psos, key)
    }

    /// Returns the compute pipeline of `pso`, creating it on a cache miss.
    pub fn compute_pipeline(&mut self, pso: PsoId) -> Result<vk::Pipeline, VulkanError> {
        self.cache.get_or_create_compute_pipeline(&self.psos, pso)
    }

    /// Reclaims everything whose submission has completed, without blocking.
    ///
    /// Command buffers are polled first, so that the staging buffers and descriptor sets
    /// tagged with their tokens are freed in the same call.
    pub fn begin_frame(&mut self) -> Result<FrameReclaim, VulkanError> {
        let reclaim = FrameReclaim {
            command_buffers: self.command_buffers.refresh_state()?,
            staging_buffers: self.staging.update(),
            descriptor_sets: self.descriptor_sets.refresh_fences(),
        };

        log::trace!("frame reclaim: {:?}", reclaim);

        Ok(reclaim)
    }

    /// Returns every render target acquired during the frame to the pool.
    pub fn end_frame(&mut self) {
        self.render_targets.empty_pool();
    }

    /// Blocks until the device is idle, then reclaims everything.
    pub fn wait_idle(&mut self) -> Result<(), VulkanError> {
        self.command_buffers.wait_idle()?;
        self.staging.update();
        self.descriptor_sets.refresh_fences();

        Ok(())
    }

    /// Destroys everything that depends on the size of the swapchain: the render targets and
    /// every cached pipeline, framebuffer and render pass. Waits for the device to be idle
    /// first.
    pub fn invalidate_size_dependent(&mut self) -> Result<(), VulkanError> {
        self.wait_idle()?;
        self.cache.destroy();
        self.render_targets.destroy(&mut self.allocator);

        Ok(())
    }

    /// Flushes the object cache so that pipelines get recreated from new shader modules. Waits
    /// for the device to be idle first.
    pub fn flush_cache(&mut self) -> Result<(), VulkanError> {
        self.wait_idle()?;
        self.cache.destroy();

        Ok(())
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            log::error!("failed to wait for the device before teardown: {}", err);
        }

        // Stops the thread before anything it could be recording with goes away.
        self.recorder = None;
        self.cache.destroy();
        self.render_targets.destroy(&mut self.allocator);
        self.psos.destroy();
        self.staging.destroy(&mut self.allocator);

        // The descriptor pool, the command pool and the memory pages are released by the
        // fields' own `Drop` impls, in declaration order.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::null::NullDevice,
        pipeline::{BindingDesc, PsoShaders, ShaderEntry},
    };
    use std::ffi::CString;

    fn context(device: &Arc<NullDevice>) -> RenderContext {
        RenderContext::new(device.clone(), Default::default()).unwrap()
    }

    #[test]
    fn begin_frame_reclaims_after_completion() {
        let device = NullDevice::new();
        let mut context = context(&device);

        let buffer = context
            .create_buffer(
                BufferCreateInfo {
                    size: 256,
                    usage: vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                },
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();

        let mut cb = context.command_buffers_mut().allocate().unwrap();
        cb.begin().unwrap();
        context.upload_buffer(&cb, &buffer, &[7; 256]).unwrap();
        cb.end().unwrap();
        let queue = context.command_buffers().queue().handle;
        cb.submit(queue, &[], None).unwrap();
        context.command_buffers_mut().recycle(cb);

        assert_eq!(context.begin_frame().unwrap(), FrameReclaim::default());
        assert_eq!(context.staging().free_count(), 0);

        device.complete_submissions();
        let reclaim = context.begin_frame().unwrap();
        assert_eq!(reclaim.command_buffers, 1);
        assert_eq!(reclaim.staging_buffers, 1);
        assert_eq!(context.staging().free_count(), 1);

        context.destroy_buffer(buffer);
    }

    #[test]
    fn teardown_releases_every_object() {
        let device = NullDevice::new();
        {
            let mut context = context(&device);

            let module = device.create_shader_module(&[0x0723_0203]).unwrap();
            let pso = context
                .psos_mut()
                .register(
                    PsoShaders::Compute {
                        compute: ShaderEntry {
                            module,
                            entry_point: CString::new("main").unwrap(),
                        },
                    },
                    vec![BindingDesc {
                        binding: 0,
                        descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                        stages: vk::ShaderStageFlags::COMPUTE,
                    }],
                    0,
                )
                .unwrap();
            context.compute_pipeline(pso).unwrap();
            context
                .acquire_render_target(
                    "color",
                    &RenderTargetDesc::new(
                        [64, 64],
                        vk::Format::R8G8B8A8_UNORM,
                        vk::ImageUsageFlags::COLOR_ATTACHMENT,
                    ),
                )
                .unwrap();

            let mut cb = context.command_buffers_mut().allocate().unwrap();
            cb.begin().unwrap();
            cb.end().unwrap();
            let queue = context.command_buffers().queue().handle;
            cb.submit(queue, &[], None).unwrap();
            context.command_buffers_mut().recycle(cb);

            assert!(device.live_object_count() > 0);
        }

        // The submission was still pending when the context was dropped.
        assert_eq!(device.live_object_count(), 0);
        assert_eq!(device.live_memory_count(), 0);
        assert_eq!(device.live_image_count(), 0);
    }

    #[test]
    fn size_dependent_objects_are_invalidated() {
        let device = NullDevice::new();
        let mut context = context(&device);
        let desc = RenderTargetDesc::new(
            [64, 64],
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        );

        context.acquire_render_target("depth", &desc).unwrap();
        context.end_frame();
        assert_eq!(context.render_targets().stats().total, 1);

        context.invalidate_size_dependent().unwrap();
        assert_eq!(context.render_targets().stats().total, 0);
        assert!(context.cache().is_empty());
        assert_eq!(device.live_image_count(), 0);
    }
}
