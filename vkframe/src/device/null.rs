// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A device that does no GPU work.
//!
//! Handles are fabricated from a counter. Fences only become signaled when the owner of the
//! `NullDevice` says so, through [`NullDevice::signal_fence`] or
//! [`NullDevice::complete_submissions`], which makes it possible to step through the
//! asynchronous lifetime of pooled resources deterministically.

use super::{
    CommandBufferInheritance, DedicatedTo, DeviceLimits, Queue, RawDevice, SwapchainImages,
};
use crate::{
    cache::RenderPassKey,
    descriptor_set::DescriptorWrite,
    memory::{MemoryProperties, MemoryRequirements, MemoryType},
    pipeline::GraphicsPipelineState,
    resource::{format_texel_size, BufferCreateInfo, ImageCreateInfo},
    DeviceSize, VulkanError,
};
use ash::vk::{self, Handle};
use foldhash::HashMap;
use parking_lot::Mutex;
use std::{
    ffi::CStr,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// A command that was recorded into a command buffer of a [`NullDevice`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedCommand {
    PipelineBarrier {
        /// The stages the barrier waits for.
        src_stage: vk::PipelineStageFlags,
        buffers: usize,
        /// `(image, old_layout, new_layout)` for each image barrier.
        images: Vec<(vk::Image, vk::ImageLayout, vk::ImageLayout)>,
    },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    },
    EndRenderPass,
    ExecuteCommands(usize),
    BindPipeline(vk::Pipeline),
    BindDescriptorSets(Vec<vk::DescriptorSet>),
    BindVertexBuffer(vk::Buffer),
    BindIndexBuffer(vk::Buffer),
    PushConstants(usize),
    DrawIndexed(u32),
    Dispatch([u32; 3]),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
    },
}

#[derive(Debug)]
struct NullMemory {
    size: DeviceSize,
    // Backing storage, created the first time the block is mapped.
    host: Option<Box<[u8]>>,
}

#[derive(Debug, Default)]
struct NullDescriptorPool {
    max_sets: u32,
    allocated: u32,
}

#[derive(Debug)]
struct SwapchainState {
    image_count: u32,
    next_image: u32,
    out_of_date: bool,
}

#[derive(Debug, Default)]
struct State {
    memory: HashMap<u64, NullMemory>,
    allocated_bytes: DeviceSize,
    buffers: HashMap<u64, DeviceSize>,
    images: HashMap<u64, DeviceSize>,
    fences: HashMap<u64, bool>,
    pending_fences: Vec<vk::Fence>,
    descriptor_pools: HashMap<u64, NullDescriptorPool>,
    descriptor_writes: usize,
    submissions: usize,
    recorded: Vec<(vk::CommandBuffer, RecordedCommand)>,
    swapchains: HashMap<u64, SwapchainState>,
    presents: usize,
    submit_failure: Option<VulkanError>,
    // Everything else that has a matching destroy call.
    objects: HashMap<u64, &'static str>,
}

/// Headless implementation of [`RawDevice`].
#[derive(Debug)]
pub struct NullDevice {
    memory_properties: MemoryProperties,
    limits: DeviceLimits,
    memory_budget: DeviceSize,
    next_handle: AtomicU64,
    state: Mutex<State>,
}

impl NullDevice {
    /// Creates a device with an unlimited memory budget.
    pub fn new() -> Arc<Self> {
        Self::with_memory_budget(DeviceSize::MAX)
    }

    /// Creates a device whose memory allocations fail once `budget` bytes are live.
    pub fn with_memory_budget(budget: DeviceSize) -> Arc<Self> {
        let memory_properties = MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                        | vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 0,
                },
            ],
            memory_heaps: Vec::new(),
        };

        Arc::new(NullDevice {
            memory_properties,
            limits: DeviceLimits::default(),
            memory_budget: budget,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(State::default()),
        })
    }

    fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn create_object<H: Handle + Copy>(&self, kind: &'static str) -> H {
        let handle: H = self.handle();
        self.state.lock().objects.insert(handle.as_raw(), kind);
        handle
    }

    fn destroy_object<H: Handle>(&self, handle: H, kind: &'static str) {
        let removed = self.state.lock().objects.remove(&handle.as_raw());
        assert_eq!(removed, Some(kind), "destroying a {} that is not live", kind);
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: RecordedCommand) {
        self.state.lock().recorded.push((command_buffer, command));
    }

    /// Signals a fence, as if the GPU had finished the work it guards.
    pub fn signal_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.pending_fences.retain(|&pending| pending != fence);
        *state
            .fences
            .get_mut(&fence.as_raw())
            .expect("signaling a fence that is not live") = true;
    }

    /// Signals the fences of every submission made so far.
    pub fn complete_submissions(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending_fences);

        for fence in pending {
            if let Some(signaled) = state.fences.get_mut(&fence.as_raw()) {
                *signaled = true;
            }
        }
    }

    /// Returns the number of live `VkDeviceMemory` blocks.
    pub fn live_memory_count(&self) -> usize {
        self.state.lock().memory.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Returns the number of live objects that are neither memory, buffers nor images.
    pub fn live_object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn live_object_count_of(&self, kind: &str) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|&&live| live == kind)
            .count()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions
    }

    /// Returns the number of descriptor writes pushed through `update_descriptor_sets`.
    pub fn descriptor_write_count(&self) -> usize {
        self.state.lock().descriptor_writes
    }

    /// Returns the commands recorded into `command_buffer` so far, including those recorded
    /// before it was last reset.
    pub fn recorded_commands(&self, command_buffer: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .recorded
            .iter()
            .filter(|(recorded_into, _)| *recorded_into == command_buffer)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Makes the next acquire or present on `swapchain` fail with `VulkanError::OutOfDate`, as
    /// happens when the window is resized.
    pub fn invalidate_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state
            .lock()
            .swapchains
            .get_mut(&swapchain.as_raw())
            .expect("invalidating a swapchain that is not live")
            .out_of_date = true;
    }

    pub fn live_swapchain_count(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    pub fn present_count(&self) -> usize {
        self.state.lock().presents
    }

    /// Makes the next queue submission fail with `error`.
    pub fn fail_next_submission(&self, error: VulkanError) {
        self.state.lock().submit_failure = Some(error);
    }

    /// Returns every command recorded so far, into any command buffer.
    pub fn all_recorded_commands(&self) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .recorded
            .iter()
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Forgets every recorded command.
    pub fn clear_recorded_commands(&self) {
        self.state.lock().recorded.clear();
    }
}

impl RawDevice for NullDevice {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn queue(&self) -> Queue {
        Queue {
            handle: vk::Queue::from_raw(u64::MAX),
            family_index: 0,
        }
    }

    fn wait_idle(&self) -> Result<(), VulkanError> {
        self.complete_submissions();
        Ok(())
    }

    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
        _dedicated: Option<DedicatedTo>,
    ) -> Result<vk::DeviceMemory, VulkanError> {
        assert!((memory_type_index as usize) < self.memory_properties.memory_types.len());

        let memory: vk::DeviceMemory = self.handle();
        let mut state = self.state.lock();

        if self.memory_budget - state.allocated_bytes < size {
            return Err(VulkanError::OutOfDeviceMemory);
        }

        state.allocated_bytes += size;
        state
            .memory
            .insert(memory.as_raw(), NullMemory { size, host: None });

        Ok(memory)
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, VulkanError> {
        let mut state = self.state.lock();
        let block = state
            .memory
            .get_mut(&memory.as_raw())
            .ok_or(VulkanError::MemoryMapFailed)?;
        assert!(size <= block.size);

        let block_size = block.size as usize;
        let host = block
            .host
            .get_or_insert_with(|| vec![0; block_size].into_boxed_slice());

        Ok(NonNull::new(host.as_mut_ptr()).unwrap())
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        let block = state
            .memory
            .remove(&memory.as_raw())
            .expect("freeing memory that is not live");
        state.allocated_bytes -= block.size;
    }

    fn create_buffer(&self, create_info: &BufferCreateInfo) -> Result<vk::Buffer, VulkanError> {
        let buffer: vk::Buffer = self.handle();
        self.state
            .lock()
            .buffers
            .insert(buffer.as_raw(), create_info.size);

        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements {
        let size = self.state.lock().buffers[&buffer.as_raw()];

        MemoryRequirements {
            size,
            alignment: 256,
            memory_type_bits: 0b111,
            prefer_dedicated: false,
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        let state = self.state.lock();
        let size = state.buffers[&buffer.as_raw()];
        assert!(offset + size <= state.memory[&memory.as_raw()].size);

        Ok(())
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state
            .lock()
            .buffers
            .remove(&buffer.as_raw())
            .expect("destroying a buffer that is not live");
    }

    fn create_image(&self, create_info: &ImageCreateInfo) -> Result<vk::Image, VulkanError> {
        let texel_size = format_texel_size(create_info.format).unwrap_or(4) as DeviceSize;
        let [width, height] = create_info.extent;
        let mut size = 0;
        for level in 0..create_info.mip_levels {
            size += (width >> level).max(1) as DeviceSize
                * (height >> level).max(1) as DeviceSize
                * texel_size;
        }
        size *= create_info.samples.as_raw() as DeviceSize;

        let image: vk::Image = self.handle();
        self.state.lock().images.insert(image.as_raw(), size);

        Ok(image)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements {
        let size = self.state.lock().images[&image.as_raw()];

        MemoryRequirements {
            size,
            alignment: 4096,
            memory_type_bits: 0b101,
            prefer_dedicated: false,
        }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        let state = self.state.lock();
        let size = state.images[&image.as_raw()];
        assert!(offset + size <= state.memory[&memory.as_raw()].size);

        Ok(())
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.state
            .lock()
            .images
            .remove(&image.as_raw())
            .expect("destroying an image that is not live");
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect_mask: vk::ImageAspectFlags,
        _mip_levels: u32,
    ) -> Result<vk::ImageView, VulkanError> {
        Ok(self.create_object("image view"))
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.destroy_object(view, "image view");
    }

    fn create_sampler(&self, _mip_levels: u32) -> Result<vk::Sampler, VulkanError> {
        Ok(self.create_object("sampler"))
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.destroy_object(sampler, "sampler");
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, VulkanError> {
        let fence: vk::Fence = self.handle();
        self.state.lock().fences.insert(fence.as_raw(), signaled);

        Ok(fence)
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool, VulkanError> {
        Ok(self.state.lock().fences[&fence.as_raw()])
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<(), VulkanError> {
        // Nothing is actually executing, so waiting means completing the work right away.
        self.signal_fence(fence);
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), VulkanError> {
        *self
            .state
            .lock()
            .fences
            .get_mut(&fence.as_raw())
            .expect("resetting a fence that is not live") = false;

        Ok(())
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state
            .fences
            .remove(&fence.as_raw())
            .expect("destroying a fence that is not live");
        state.pending_fences.retain(|&pending| pending != fence);
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore, VulkanError> {
        Ok(self.create_object("semaphore"))
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.destroy_object(semaphore, "semaphore");
    }

    fn create_command_pool(
        &self,
        _queue_family_index: u32,
    ) -> Result<vk::CommandPool, VulkanError> {
        Ok(self.create_object("command pool"))
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.destroy_object(pool, "command pool");
    }

    fn allocate_command_buffer(
        &self,
        _pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer, VulkanError> {
        Ok(self.handle())
    }

    fn begin_command_buffer(
        &self,
        _command_buffer: vk::CommandBuffer,
        _inheritance: Option<&CommandBufferInheritance>,
    ) -> Result<(), VulkanError> {
        Ok(())
    }

    fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> Result<(), VulkanError> {
        Ok(())
    }

    fn reset_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> Result<(), VulkanError> {
        Ok(())
    }

    fn queue_submit(
        &self,
        _queue: vk::Queue,
        _command_buffer: vk::CommandBuffer,
        _wait_semaphores: &[(vk::Semaphore, vk::PipelineStageFlags)],
        _signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<(), VulkanError> {
        let mut state = self.state.lock();

        if let Some(error) = state.submit_failure.take() {
            return Err(error);
        }

        state.submissions += 1;

        if fence != vk::Fence::null() {
            assert_eq!(
                state.fences.get(&fence.as_raw()),
                Some(&false),
                "submitting with a fence that is signaled or not live",
            );
            state.pending_fences.push(fence);
        }

        Ok(())
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, VulkanError> {
        let pool: vk::DescriptorPool = self.handle();
        self.state.lock().descriptor_pools.insert(
            pool.as_raw(),
            NullDescriptorPool {
                max_sets,
                allocated: 0,
            },
        );

        Ok(pool)
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state
            .lock()
            .descriptor_pools
            .remove(&pool.as_raw())
            .expect("destroying a descriptor pool that is not live");
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, VulkanError> {
        let mut state = self.state.lock();
        let pool = state
            .descriptor_pools
            .get_mut(&pool.as_raw())
            .expect("allocating from a descriptor pool that is not live");

        if pool.allocated == pool.max_sets {
            return Err(VulkanError::OutOfPoolMemory);
        }

        pool.allocated += 1;
        drop(state);

        Ok(self.handle())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.state.lock().descriptor_writes += writes.len();
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout, VulkanError> {
        Ok(self.create_object("descriptor set layout"))
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.destroy_object(layout, "descriptor set layout");
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout, VulkanError> {
        Ok(self.create_object("pipeline layout"))
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.destroy_object(layout, "pipeline layout");
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule, VulkanError> {
        assert!(!code.is_empty());

        Ok(self.create_object("shader module"))
    }

    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.destroy_object(module, "shader module");
    }

    fn create_render_pass(&self, _key: &RenderPassKey) -> Result<vk::RenderPass, VulkanError> {
        Ok(self.create_object("render pass"))
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.destroy_object(render_pass, "render pass");
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: [u32; 2],
    ) -> Result<vk::Framebuffer, VulkanError> {
        Ok(self.create_object("framebuffer"))
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.destroy_object(framebuffer, "framebuffer");
    }

    fn create_graphics_pipeline(
        &self,
        _state: &GraphicsPipelineState<'_>,
    ) -> Result<vk::Pipeline, VulkanError> {
        Ok(self.create_object("pipeline"))
    }

    fn create_compute_pipeline(
        &self,
        _layout: vk::PipelineLayout,
        _module: vk::ShaderModule,
        _entry_point: &CStr,
    ) -> Result<vk::Pipeline, VulkanError> {
        Ok(self.create_object("pipeline"))
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.destroy_object(pipeline, "pipeline");
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.record(
            command_buffer,
            RecordedCommand::PipelineBarrier {
                src_stage,
                buffers: buffer_barriers.len(),
                images: image_barriers
                    .iter()
                    .map(|barrier| (barrier.image, barrier.old_layout, barrier.new_layout))
                    .collect(),
            },
        );
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        _extent: [u32; 2],
        _clear_values: &[vk::ClearValue],
        _contents: vk::SubpassContents,
    ) {
        self.record(
            command_buffer,
            RecordedCommand::BeginRenderPass {
                render_pass,
                framebuffer,
            },
        );
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.record(command_buffer, RecordedCommand::EndRenderPass);
    }

    fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    ) {
        self.record(
            command_buffer,
            RecordedCommand::ExecuteCommands(secondaries.len()),
        );
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(command_buffer, RecordedCommand::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.record(
            command_buffer,
            RecordedCommand::BindDescriptorSets(sets.to_vec()),
        );
    }

    fn cmd_bind_vertex_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: DeviceSize,
    ) {
        self.record(command_buffer, RecordedCommand::BindVertexBuffer(buffer));
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: DeviceSize,
        _index_type: vk::IndexType,
    ) {
        self.record(command_buffer, RecordedCommand::BindIndexBuffer(buffer));
    }

    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        self.record(command_buffer, RecordedCommand::PushConstants(data.len()));
    }

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        _instance_count: u32,
    ) {
        self.record(command_buffer, RecordedCommand::DrawIndexed(index_count));
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, group_counts: [u32; 3]) {
        self.record(command_buffer, RecordedCommand::Dispatch(group_counts));
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        _regions: &[vk::BufferCopy],
    ) {
        self.record(command_buffer, RecordedCommand::CopyBuffer { src, dst });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.record(command_buffer, RecordedCommand::CopyBufferToImage { src, dst });
    }

    fn create_swapchain(
        &self,
        extent: [u32; 2],
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<SwapchainImages, VulkanError> {
        const IMAGE_COUNT: u32 = 3;

        if old_swapchain != vk::SwapchainKHR::null() {
            assert!(self
                .state
                .lock()
                .swapchains
                .contains_key(&old_swapchain.as_raw()));
        }

        let handle: vk::SwapchainKHR = self.handle();
        let images = (0..IMAGE_COUNT).map(|_| self.handle()).collect();
        self.state.lock().swapchains.insert(
            handle.as_raw(),
            SwapchainState {
                image_count: IMAGE_COUNT,
                next_image: 0,
                out_of_date: false,
            },
        );

        Ok(SwapchainImages {
            handle,
            format: vk::Format::B8G8R8A8_SRGB,
            extent,
            images,
        })
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state
            .lock()
            .swapchains
            .remove(&swapchain.as_raw())
            .expect("destroying a swapchain that is not live");
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), VulkanError> {
        let mut state = self.state.lock();
        let swapchain = state
            .swapchains
            .get_mut(&swapchain.as_raw())
            .expect("acquiring from a swapchain that is not live");

        if swapchain.out_of_date {
            return Err(VulkanError::OutOfDate);
        }

        let index = swapchain.next_image;
        swapchain.next_image = (index + 1) % swapchain.image_count;

        Ok((index, false))
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait_semaphore: vk::Semaphore,
    ) -> Result<bool, VulkanError> {
        let mut state = self.state.lock();
        let swapchain = state
            .swapchains
            .get(&swapchain.as_raw())
            .expect("presenting to a swapchain that is not live");
        assert!(image_index < swapchain.image_count);

        if swapchain.out_of_date {
            return Err(VulkanError::OutOfDate);
        }
        state.presents += 1;

        Ok(false)
    }
}
