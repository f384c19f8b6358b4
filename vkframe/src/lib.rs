// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! GPU resource and command lifecycle management for a small real-time Vulkan renderer.
//!
//! # Overview
//!
//! - Every call into the GPU goes through the [`RawDevice`](crate::device::RawDevice) trait.
//!   [`VulkanDevice`](crate::device::vulkan::VulkanDevice) implements it on top of `ash`, and
//!   [`NullDevice`](crate::device::null::NullDevice) implements it headlessly so that the
//!   lifetime logic can be exercised without a GPU.
//!
//! - The [`MemoryAllocator`](crate::memory::MemoryAllocator) carves buffers and images out of
//!   large pages of device memory.
//!
//! - [`CommandBuffer`](crate::command_buffer::CommandBuffer)s each own a
//!   [`Fence`](crate::sync::Fence). The fence's *signaled counter* is the generation token that
//!   every pooled resource records when it is used by a submission. A resource whose
//!   [`CompletionToken`](crate::sync::CompletionToken) has been exceeded is no longer referenced
//!   by the GPU and can be reused.
//!
//! - Staging buffers, descriptor sets, render targets and command buffers are pooled and recycled
//!   with that rule. Render passes, framebuffers and pipelines are memoized by structural keys in
//!   the [`ObjectCache`](crate::cache::ObjectCache).
//!
//! - The [`RenderContext`](crate::context::RenderContext) owns all of the above and tears it down
//!   in reverse dependency order. The [`Renderer`](crate::renderer::Renderer) is the surface a
//!   windowing host talks to.

use std::{error::Error, fmt};

pub use ash::vk;
pub use glam;

pub mod cache;
pub mod command_buffer;
pub mod context;
pub mod descriptor_set;
pub mod device;
pub mod memory;
pub mod pipeline;
pub mod render_target;
pub mod renderer;
pub mod resource;
pub mod shader;
pub mod staging;
pub mod swapchain;
pub mod sync;

/// Represents memory size and offset values on a Vulkan device.
/// Analogous to the Rust `usize` type on the host.
pub use ash::vk::DeviceSize;

/// Error type returned by most Vulkan functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VulkanError {
    NotReady,
    Timeout,
    OutOfHostMemory,
    OutOfDeviceMemory,
    InitializationFailed,
    DeviceLost,
    MemoryMapFailed,
    LayerNotPresent,
    ExtensionNotPresent,
    FeatureNotPresent,
    IncompatibleDriver,
    TooManyObjects,
    FormatNotSupported,
    FragmentedPool,
    OutOfPoolMemory,
    SurfaceLost,
    NativeWindowInUse,
    OutOfDate,
    Unknown,
    Unnamed(vk::Result),
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::NOT_READY => VulkanError::NotReady,
            vk::Result::TIMEOUT => VulkanError::Timeout,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => VulkanError::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => VulkanError::OutOfDeviceMemory,
            vk::Result::ERROR_INITIALIZATION_FAILED => VulkanError::InitializationFailed,
            vk::Result::ERROR_DEVICE_LOST => VulkanError::DeviceLost,
            vk::Result::ERROR_MEMORY_MAP_FAILED => VulkanError::MemoryMapFailed,
            vk::Result::ERROR_LAYER_NOT_PRESENT => VulkanError::LayerNotPresent,
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => VulkanError::ExtensionNotPresent,
            vk::Result::ERROR_FEATURE_NOT_PRESENT => VulkanError::FeatureNotPresent,
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => VulkanError::IncompatibleDriver,
            vk::Result::ERROR_TOO_MANY_OBJECTS => VulkanError::TooManyObjects,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => VulkanError::FormatNotSupported,
            vk::Result::ERROR_FRAGMENTED_POOL => VulkanError::FragmentedPool,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY => VulkanError::OutOfPoolMemory,
            vk::Result::ERROR_SURFACE_LOST_KHR => VulkanError::SurfaceLost,
            vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR => VulkanError::NativeWindowInUse,
            vk::Result::ERROR_OUT_OF_DATE_KHR => VulkanError::OutOfDate,
            vk::Result::ERROR_UNKNOWN => VulkanError::Unknown,
            result => VulkanError::Unnamed(result),
        }
    }
}

impl Error for VulkanError {}

impl fmt::Display for VulkanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VulkanError::NotReady => write!(f, "A resource is not yet ready."),
            VulkanError::Timeout => write!(f, "A wait operation has not completed in the specified time."),
            VulkanError::OutOfHostMemory => write!(f, "A host memory allocation has failed."),
            VulkanError::OutOfDeviceMemory => write!(f, "A device memory allocation has failed."),
            VulkanError::InitializationFailed => write!(
                f,
                "Initialization of an object could not be completed for implementation-specific reasons.",
            ),
            VulkanError::DeviceLost => write!(f, "The logical or physical device has been lost."),
            VulkanError::MemoryMapFailed => write!(f, "Mapping of a memory object has failed."),
            VulkanError::LayerNotPresent => write!(
                f,
                "A requested layer is not present or could not be loaded.",
            ),
            VulkanError::ExtensionNotPresent => write!(f, "A requested extension is not supported."),
            VulkanError::FeatureNotPresent => write!(f, "A requested feature is not supported."),
            VulkanError::IncompatibleDriver => write!(
                f,
                "The requested version of Vulkan is not supported by the driver or is otherwise incompatible for implementation-specific reasons.",
            ),
            VulkanError::TooManyObjects => write!(
                f,
                "Too many objects of the type have already been created.",
            ),
            VulkanError::FormatNotSupported => write!(
                f,
                "A requested format is not supported on this device.",
            ),
            VulkanError::FragmentedPool => write!(
                f,
                "A pool allocation has failed due to fragmentation of the pool's memory.",
            ),
            VulkanError::OutOfPoolMemory => write!(f, "A pool memory allocation has failed."),
            VulkanError::SurfaceLost => write!(f, "A surface is no longer available."),
            VulkanError::NativeWindowInUse => write!(
                f,
                "The requested window is already in use by Vulkan or another API in a manner which prevents it from being used again.",
            ),
            VulkanError::OutOfDate => write!(
                f,
                "A surface has changed in such a way that it is no longer compatible with the swapchain.",
            ),
            VulkanError::Unknown => write!(
                f,
                "An unknown error has occurred; either the application has provided invalid input, or an implementation failure has occurred.",
            ),
            VulkanError::Unnamed(result) => write!(
                f,
                "Unnamed error, VkResult value {}",
                result.as_raw(),
            ),
        }
    }
}
