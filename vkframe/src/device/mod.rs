// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The boundary between the lifetime-management core and the GPU.
//!
//! Everything above this module talks to the device exclusively through [`RawDevice`]. Handles
//! are plain `ash::vk` handles: they are `Copy`, comparable and hashable, which lets the pools and
//! caches key on them directly.
//!
//! Two implementations are provided:
//!
//! - [`vulkan::VulkanDevice`] drives a real Vulkan device through `ash`.
//! - [`null::NullDevice`] fabricates handles without touching any driver. It records the commands
//!   it is given and lets the caller decide when fences signal, which is what the tests use.

use crate::{
    cache::RenderPassKey,
    descriptor_set::DescriptorWrite,
    memory::{MemoryProperties, MemoryRequirements},
    pipeline::GraphicsPipelineState,
    resource::{BufferCreateInfo, ImageCreateInfo},
    DeviceSize, VulkanError,
};
use ash::vk;
use std::{ffi::CStr, fmt::Debug, ptr::NonNull};

pub mod null;
pub mod vulkan;

/// Properties of the physical device that the core needs to make decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Linear and non-linear resources sharing a page of this size must not alias.
    pub buffer_image_granularity: DeviceSize,
    pub non_coherent_atom_size: DeviceSize,
    pub min_uniform_buffer_offset_alignment: DeviceSize,
    pub max_memory_allocation_count: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        DeviceLimits {
            buffer_image_granularity: 1024,
            non_coherent_atom_size: 64,
            min_uniform_buffer_offset_alignment: 256,
            max_memory_allocation_count: 4096,
        }
    }
}

/// A graphics queue and the family it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Queue {
    pub handle: vk::Queue,
    pub family_index: u32,
}

/// Raw access to a logical device.
///
/// Creation functions return the new handle or the [`VulkanError`] the driver reported.
/// Recording functions (`cmd_*`) write into a command buffer that is in the recording state.
///
/// # Safety
///
/// The `destroy_*`/`free_*` functions must only be called on handles created by the same device
/// that are no longer referenced by any pending GPU work. Every other handle argument must be a
/// live handle created by this device.
pub trait RawDevice: Debug + Send + Sync {
    fn memory_properties(&self) -> &MemoryProperties;

    fn limits(&self) -> DeviceLimits;

    fn queue(&self) -> Queue;

    fn wait_idle(&self) -> Result<(), VulkanError>;

    // Memory

    /// Allocates a block of device memory. `dedicated` names the resource the block is
    /// exclusively for, if any.
    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
        dedicated: Option<DedicatedTo>,
    ) -> Result<vk::DeviceMemory, VulkanError>;

    /// Maps the whole block, returning the host address of its first byte.
    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, VulkanError>;

    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    // Buffers and images

    fn create_buffer(&self, create_info: &BufferCreateInfo) -> Result<vk::Buffer, VulkanError>;

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements;

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError>;

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    fn create_image(&self, create_info: &ImageCreateInfo) -> Result<vk::Image, VulkanError>;

    fn image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements;

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError>;

    unsafe fn destroy_image(&self, image: vk::Image);

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
        mip_levels: u32,
    ) -> Result<vk::ImageView, VulkanError>;

    unsafe fn destroy_image_view(&self, view: vk::ImageView);

    fn create_sampler(&self, mip_levels: u32) -> Result<vk::Sampler, VulkanError>;

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler);

    // Synchronization

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, VulkanError>;

    /// Returns whether the fence is signaled without blocking.
    fn fence_status(&self, fence: vk::Fence) -> Result<bool, VulkanError>;

    /// Blocks until the fence is signaled or `timeout_ns` elapses.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<(), VulkanError>;

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), VulkanError>;

    unsafe fn destroy_fence(&self, fence: vk::Fence);

    fn create_semaphore(&self) -> Result<vk::Semaphore, VulkanError>;

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Command buffers

    fn create_command_pool(&self, queue_family_index: u32) -> Result<vk::CommandPool, VulkanError>;

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer, VulkanError>;

    /// Begins recording. Secondary command buffers that continue a render pass pass the
    /// inheritance information in `inheritance`.
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        inheritance: Option<&CommandBufferInheritance>,
    ) -> Result<(), VulkanError>;

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<(), VulkanError>;

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<(), VulkanError>;

    fn queue_submit(
        &self,
        queue: vk::Queue,
        command_buffer: vk::CommandBuffer,
        wait_semaphores: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<(), VulkanError>;

    // Descriptors and pipelines

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, VulkanError>;

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, VulkanError>;

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout, VulkanError>;

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout, VulkanError>;

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule, VulkanError>;

    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_render_pass(&self, key: &RenderPassKey) -> Result<vk::RenderPass, VulkanError>;

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: [u32; 2],
    ) -> Result<vk::Framebuffer, VulkanError>;

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn create_graphics_pipeline(
        &self,
        state: &GraphicsPipelineState<'_>,
    ) -> Result<vk::Pipeline, VulkanError>;

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
        entry_point: &CStr,
    ) -> Result<vk::Pipeline, VulkanError>;

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // Recording

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );

    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: [u32; 2],
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    );

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);

    fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    );

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );

    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );

    fn cmd_bind_vertex_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: DeviceSize,
    );

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: DeviceSize,
        index_type: vk::IndexType,
    );

    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    );

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
    );

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, group_counts: [u32; 3]);

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    // Presentation

    /// Creates the swapchain of the device's surface, replacing `old_swapchain` if it is not
    /// null.
    fn create_swapchain(
        &self,
        extent: [u32; 2],
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<SwapchainImages, VulkanError>;

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Acquires the next image to render to, signaling `semaphore` when it is available.
    /// Returns its index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), VulkanError>;

    /// Presents an image once `wait_semaphore` is signaled. Returns whether the swapchain is
    /// suboptimal.
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, VulkanError>;
}

/// The resource a dedicated memory allocation is made for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedicatedTo {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// What a secondary command buffer inherits from the render pass it executes in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandBufferInheritance {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub framebuffer: vk::Framebuffer,
}

/// The images of a newly created swapchain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapchainImages {
    pub handle: vk::SwapchainKHR,
    pub format: vk::Format,
    /// May differ from the requested extent if the surface imposes its own.
    pub extent: [u32; 2],
    pub images: Vec<vk::Image>,
}
