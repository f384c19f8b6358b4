// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A [`RawDevice`] that drives a Vulkan implementation through `ash`.
//!
//! Creating a [`VulkanDevice`] loads the Vulkan library, creates an instance with the extensions
//! needed to present to the given window, optionally enables the validation layer and forwards
//! its messages to the `log` facade, picks a physical device and creates a logical device with a
//! single graphics queue that can also present.

use super::{
    CommandBufferInheritance, DedicatedTo, DeviceLimits, Queue, RawDevice, SwapchainImages,
};
use crate::{
    cache::RenderPassKey,
    descriptor_set::{DescriptorWrite, WriteResource},
    memory::{MemoryProperties, MemoryRequirements},
    pipeline::GraphicsPipelineState,
    resource::{BufferCreateInfo, ImageCreateInfo},
    DeviceSize, VulkanError,
};
use ash::{
    ext::debug_utils,
    khr::{surface, swapchain},
    vk, Entry, Instance, LoadingError,
};
use log::{debug, error, info, warn};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use smallvec::SmallVec;
use std::{
    borrow::Cow,
    error::Error,
    ffi::{c_void, CStr, CString},
    fmt,
    ptr::NonNull,
    slice,
    sync::Arc,
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Parameters to create a [`VulkanDevice`].
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// The name the application reports to the driver.
    ///
    /// The default value is `"vkframe"`.
    pub application_name: String,

    /// Whether to enable the Khronos validation layer and forward its messages to the log.
    ///
    /// The default value is `true` in debug builds and `false` otherwise.
    pub validation: bool,

    /// Physical device types in order of preference. Devices of a type that is not listed are
    /// only picked if nothing else is suitable.
    ///
    /// The default value prefers discrete GPUs, then integrated, virtual and CPU devices.
    pub preferred_device_types: Vec<vk::PhysicalDeviceType>,
}

impl Default for DeviceConfig {
    #[inline]
    fn default() -> Self {
        DeviceConfig {
            application_name: "vkframe".to_owned(),
            validation: cfg!(debug_assertions),
            preferred_device_types: vec![
                vk::PhysicalDeviceType::DISCRETE_GPU,
                vk::PhysicalDeviceType::INTEGRATED_GPU,
                vk::PhysicalDeviceType::VIRTUAL_GPU,
                vk::PhysicalDeviceType::CPU,
            ],
        }
    }
}

/// Error that can happen when creating a [`VulkanDevice`].
#[derive(Debug)]
pub enum DeviceCreationError {
    /// The Vulkan library could not be loaded.
    Loading(LoadingError),
    /// The application name contains a nul byte.
    InvalidApplicationName,
    /// No physical device has a queue that can both draw and present to the window.
    NoSuitablePhysicalDevice,
    Vulkan(VulkanError),
}

impl Error for DeviceCreationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Loading(err) => Some(err),
            Self::Vulkan(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceCreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading(_) => write!(f, "failed to load the Vulkan library"),
            Self::InvalidApplicationName => {
                write!(f, "the application name contains a nul byte")
            }
            Self::NoSuitablePhysicalDevice => write!(
                f,
                "no physical device can both render and present to the window",
            ),
            Self::Vulkan(_) => write!(f, "a runtime error occurred"),
        }
    }
}

impl From<LoadingError> for DeviceCreationError {
    fn from(err: LoadingError) -> Self {
        Self::Loading(err)
    }
}

impl From<VulkanError> for DeviceCreationError {
    fn from(err: VulkanError) -> Self {
        Self::Vulkan(err)
    }
}

impl From<vk::Result> for DeviceCreationError {
    fn from(err: vk::Result) -> Self {
        Self::Vulkan(err.into())
    }
}

struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// A logical Vulkan device together with the surface it presents to.
pub struct VulkanDevice {
    // Keeps the library loaded for as long as the device lives.
    _entry: Entry,
    instance: Instance,
    debug_messenger: Option<DebugMessenger>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    swapchain_loader: swapchain::Device,
    queue: Queue,
    device_name: String,
    memory_properties: MemoryProperties,
    limits: DeviceLimits,
    fill_mode_non_solid: bool,
}

impl VulkanDevice {
    /// Creates a device that can present to the window identified by the raw handles.
    ///
    /// # Safety
    ///
    /// - The window must outlive the returned device.
    pub unsafe fn new(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        config: &DeviceConfig,
    ) -> Result<Arc<Self>, DeviceCreationError> {
        let entry = unsafe { Entry::load() }?;
        let application_name = CString::new(config.application_name.as_str())
            .map_err(|_| DeviceCreationError::InvalidApplicationName)?;

        let validation = config.validation && has_validation_layer(&entry)?;
        if config.validation && !validation {
            warn!("the validation layer was requested but is not installed");
        }

        let instance = create_instance(&entry, display, &application_name, validation)?;

        // From here on, everything that was created must be destroyed again on failure.
        let debug_messenger = if validation {
            match create_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let destroy_instance = |debug_messenger: Option<DebugMessenger>| unsafe {
            if let Some(debug_messenger) = debug_messenger {
                debug_messenger
                    .loader
                    .destroy_debug_utils_messenger(debug_messenger.messenger, None);
            }
            instance.destroy_instance(None);
        };

        let surface =
            match unsafe { ash_window::create_surface(&entry, &instance, display, window, None) } {
                Ok(surface) => surface,
                Err(err) => {
                    destroy_instance(debug_messenger);
                    return Err(err.into());
                }
            };

        let selected = select_physical_device(
            &instance,
            &surface_loader,
            surface,
            &config.preferred_device_types,
        );
        let Ok(Some((physical_device, queue_family_index))) = selected else {
            unsafe { surface_loader.destroy_surface(surface, None) };
            destroy_instance(debug_messenger);

            return Err(match selected {
                Err(err) => err.into(),
                Ok(_) => DeviceCreationError::NoSuitablePhysicalDevice,
            });
        };

        let (properties, features, memory_properties) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_features(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
            )
        };
        let device_name = properties
            .device_name_as_c_str()
            .map_or(Cow::Borrowed("unknown device"), CStr::to_string_lossy)
            .into_owned();

        info!(
            "using physical device {} ({:?}), queue family {}",
            device_name, properties.device_type, queue_family_index,
        );

        let fill_mode_non_solid = features.fill_mode_non_solid == vk::TRUE;
        let enabled_features =
            vk::PhysicalDeviceFeatures::default().fill_mode_non_solid(fill_mode_non_solid);
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);
        let extension_names = [swapchain::NAME.as_ptr()];
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_names)
            .enabled_features(&enabled_features);

        let device =
            match unsafe { instance.create_device(physical_device, &device_create_info, None) } {
                Ok(device) => device,
                Err(err) => {
                    unsafe { surface_loader.destroy_surface(surface, None) };
                    destroy_instance(debug_messenger);
                    return Err(err.into());
                }
            };

        let swapchain_loader = swapchain::Device::new(&instance, &device);
        let queue = Queue {
            handle: unsafe { device.get_device_queue(queue_family_index, 0) },
            family_index: queue_family_index,
        };
        let limits = DeviceLimits {
            buffer_image_granularity: properties.limits.buffer_image_granularity,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
            min_uniform_buffer_offset_alignment: properties
                .limits
                .min_uniform_buffer_offset_alignment,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,
        };

        Ok(Arc::new(VulkanDevice {
            _entry: entry,
            instance,
            debug_messenger,
            surface_loader,
            surface,
            physical_device,
            device,
            swapchain_loader,
            queue,
            device_name,
            memory_properties: MemoryProperties::from(&memory_properties),
            limits,
            fill_mode_non_solid,
        }))
    }

    /// Returns the name of the physical device.
    #[inline]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Returns the `ash` device, for calls that are not part of [`RawDevice`].
    #[inline]
    pub fn ash_device(&self) -> &ash::Device {
        &self.device
    }

    fn memory_requirements(
        requirements: vk::MemoryRequirements,
        dedicated: &vk::MemoryDedicatedRequirements<'_>,
    ) -> MemoryRequirements {
        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
            prefer_dedicated: dedicated.prefers_dedicated_allocation == vk::TRUE
                || dedicated.requires_dedicated_allocation == vk::TRUE,
        }
    }

    fn choose_surface_format(&self) -> Result<vk::SurfaceFormatKHR, VulkanError> {
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)
        }?;

        formats
            .iter()
            .find(|format| {
                matches!(
                    format.format,
                    vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB
                ) && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .ok_or(VulkanError::FormatNotSupported)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                error!("failed to wait for the device to become idle: {}", err);
            }

            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some(debug_messenger) = &self.debug_messenger {
                debug_messenger
                    .loader
                    .destroy_debug_utils_messenger(debug_messenger.messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

impl fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("device_name", &self.device_name)
            .field("physical_device", &self.physical_device)
            .field("handle", &self.device.handle())
            .field("queue", &self.queue)
            .field("surface", &self.surface)
            .field("validation", &self.debug_messenger.is_some())
            .finish_non_exhaustive()
    }
}

fn has_validation_layer(entry: &Entry) -> Result<bool, VulkanError> {
    let layers = unsafe { entry.enumerate_instance_layer_properties() }?;

    Ok(layers
        .iter()
        .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER)))
}

fn create_instance(
    entry: &Entry,
    display: RawDisplayHandle,
    application_name: &CStr,
    validation: bool,
) -> Result<Instance, VulkanError> {
    let application_info = vk::ApplicationInfo::default()
        .application_name(application_name)
        .application_version(0)
        .engine_name(c"vkframe")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    let mut extension_names = ash_window::enumerate_required_extensions(display)?.to_vec();
    let mut layer_names = Vec::new();

    if validation {
        extension_names.push(debug_utils::NAME.as_ptr());
        layer_names.push(VALIDATION_LAYER.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&application_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names);

    Ok(unsafe { entry.create_instance(&create_info, None) }?)
}

fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<DebugMessenger, VulkanError> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let loader = debug_utils::Instance::new(entry, instance);
    let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }?;

    Ok(DebugMessenger { loader, messenger })
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ty: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = unsafe { callback_data.as_ref() }
        .and_then(|data| unsafe { data.message_as_c_str() })
        .map_or(Cow::Borrowed("no message"), CStr::to_string_lossy);

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("{:?}: {}", ty, message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("{:?}: {}", ty, message);
    } else {
        debug!("{:?}: {}", ty, message);
    }

    vk::FALSE
}

/// Returns the physical device of the most preferred type that has a queue family that can draw
/// and present, together with that family.
fn select_physical_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    preferred_device_types: &[vk::PhysicalDeviceType],
) -> Result<Option<(vk::PhysicalDevice, u32)>, VulkanError> {
    let mut candidates = Vec::new();

    for physical_device in unsafe { instance.enumerate_physical_devices() }? {
        let extensions =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }?;
        let has_swapchain = extensions
            .iter()
            .any(|extension| extension.extension_name_as_c_str() == Ok(swapchain::NAME));

        if !has_swapchain {
            continue;
        }

        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let mut queue_family_index = None;

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            let supports_present = unsafe {
                surface_loader.get_physical_device_surface_support(physical_device, index, surface)
            }?;

            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && supports_present {
                queue_family_index = Some(index);
                break;
            }
        }

        if let Some(queue_family_index) = queue_family_index {
            let device_type =
                unsafe { instance.get_physical_device_properties(physical_device) }.device_type;
            let rank = preferred_device_types
                .iter()
                .position(|&ty| ty == device_type)
                .unwrap_or(preferred_device_types.len());

            candidates.push((rank, physical_device, queue_family_index));
        }
    }

    Ok(candidates
        .into_iter()
        .min_by_key(|&(rank, ..)| rank)
        .map(|(_, physical_device, queue_family_index)| (physical_device, queue_family_index)))
}

impl RawDevice for VulkanDevice {
    #[inline]
    fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    #[inline]
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    #[inline]
    fn queue(&self) -> Queue {
        self.queue
    }

    fn wait_idle(&self) -> Result<(), VulkanError> {
        unsafe { self.device.device_wait_idle() }?;

        Ok(())
    }

    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
        dedicated: Option<DedicatedTo>,
    ) -> Result<vk::DeviceMemory, VulkanError> {
        let mut dedicated_info = dedicated.map(|dedicated| match dedicated {
            DedicatedTo::Buffer(buffer) => vk::MemoryDedicatedAllocateInfo::default().buffer(buffer),
            DedicatedTo::Image(image) => vk::MemoryDedicatedAllocateInfo::default().image(image),
        });
        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        if let Some(dedicated_info) = dedicated_info.as_mut() {
            allocate_info = allocate_info.push_next(dedicated_info);
        }

        Ok(unsafe { self.device.allocate_memory(&allocate_info, None) }?)
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        _size: DeviceSize,
    ) -> Result<NonNull<u8>, VulkanError> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }?;

        NonNull::new(ptr.cast::<u8>()).ok_or(VulkanError::MemoryMapFailed)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn create_buffer(&self, create_info: &BufferCreateInfo) -> Result<vk::Buffer, VulkanError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(create_info.size)
            .usage(create_info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        Ok(unsafe { self.device.create_buffer(&create_info, None) }?)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements {
        let info = vk::BufferMemoryRequirementsInfo2::default().buffer(buffer);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::default().push_next(&mut dedicated);

        unsafe {
            self.device
                .get_buffer_memory_requirements2(&info, &mut requirements)
        };
        let requirements = requirements.memory_requirements;

        Self::memory_requirements(requirements, &dedicated)
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }?;

        Ok(())
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_image(&self, create_info: &ImageCreateInfo) -> Result<vk::Image, VulkanError> {
        let [width, height] = create_info.extent;
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(create_info.format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(create_info.mip_levels)
            .array_layers(1)
            .samples(create_info.samples)
            .tiling(create_info.tiling)
            .usage(create_info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        Ok(unsafe { self.device.create_image(&create_info, None) }?)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements {
        let info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::default().push_next(&mut dedicated);

        unsafe {
            self.device
                .get_image_memory_requirements2(&info, &mut requirements)
        };
        let requirements = requirements.memory_requirements;

        Self::memory_requirements(requirements, &dedicated)
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }?;

        Ok(())
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
        mip_levels: u32,
    ) -> Result<vk::ImageView, VulkanError> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });

        Ok(unsafe { self.device.create_image_view(&create_info, None) }?)
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, mip_levels: u32) -> Result<vk::Sampler, VulkanError> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .min_lod(0.0)
            .max_lod(mip_levels as f32);

        Ok(unsafe { self.device.create_sampler(&create_info, None) }?)
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, VulkanError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);

        Ok(unsafe { self.device.create_fence(&create_info, None) }?)
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool, VulkanError> {
        Ok(unsafe { self.device.get_fence_status(fence) }?)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<(), VulkanError> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }?;

        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), VulkanError> {
        unsafe { self.device.reset_fences(&[fence]) }?;

        Ok(())
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore, VulkanError> {
        let create_info = vk::SemaphoreCreateInfo::default();

        Ok(unsafe { self.device.create_semaphore(&create_info, None) }?)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_command_pool(&self, queue_family_index: u32) -> Result<vk::CommandPool, VulkanError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        Ok(unsafe { self.device.create_command_pool(&create_info, None) }?)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer, VulkanError> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        let command_buffers = unsafe { self.device.allocate_command_buffers(&allocate_info) }?;

        Ok(command_buffers[0])
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        inheritance: Option<&CommandBufferInheritance>,
    ) -> Result<(), VulkanError> {
        let inheritance_info = inheritance.map(|inheritance| {
            vk::CommandBufferInheritanceInfo::default()
                .render_pass(inheritance.render_pass)
                .subpass(inheritance.subpass)
                .framebuffer(inheritance.framebuffer)
        });

        let mut begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Some(inheritance_info) = &inheritance_info {
            begin_info = begin_info
                .flags(
                    vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                        | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
                )
                .inheritance_info(inheritance_info);
        }

        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }?;

        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<(), VulkanError> {
        unsafe { self.device.end_command_buffer(command_buffer) }?;

        Ok(())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<(), VulkanError> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }?;

        Ok(())
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        command_buffer: vk::CommandBuffer,
        wait_semaphores: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<(), VulkanError> {
        let (semaphores, stages): (SmallVec<[_; 2]>, SmallVec<[_; 2]>) =
            wait_semaphores.iter().copied().unzip();
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&semaphores)
            .wait_dst_stage_mask(&stages)
            .command_buffers(slice::from_ref(&command_buffer))
            .signal_semaphores(signal_semaphores);

        unsafe { self.device.queue_submit(queue, &[submit_info], fence) }?;

        Ok(())
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, VulkanError> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        Ok(unsafe { self.device.create_descriptor_pool(&create_info, None) }?)
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, VulkanError> {
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(slice::from_ref(&layout));
        let sets = unsafe { self.device.allocate_descriptor_sets(&allocate_info) }?;

        Ok(sets[0])
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        enum Info {
            Buffer(vk::DescriptorBufferInfo),
            Image(vk::DescriptorImageInfo),
        }

        let infos: SmallVec<[Info; 8]> = writes
            .iter()
            .map(|write| match write.resource {
                WriteResource::Buffer {
                    buffer,
                    offset,
                    range,
                } => Info::Buffer(vk::DescriptorBufferInfo {
                    buffer,
                    offset,
                    range,
                }),
                WriteResource::Image {
                    view,
                    layout,
                    sampler,
                } => Info::Image(vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                }),
            })
            .collect();

        let vk_writes: SmallVec<[vk::WriteDescriptorSet<'_>; 8]> = writes
            .iter()
            .zip(&infos)
            .map(|(write, info)| {
                let vk_write = vk::WriteDescriptorSet::default()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .descriptor_type(write.descriptor_type);

                match info {
                    Info::Buffer(info) => vk_write.buffer_info(slice::from_ref(info)),
                    Info::Image(info) => vk_write.image_info(slice::from_ref(info)),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout, VulkanError> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);

        Ok(unsafe { self.device.create_descriptor_set_layout(&create_info, None) }?)
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout, VulkanError> {
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);

        Ok(unsafe { self.device.create_pipeline_layout(&create_info, None) }?)
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule, VulkanError> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);

        Ok(unsafe { self.device.create_shader_module(&create_info, None) }?)
    }

    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_render_pass(&self, key: &RenderPassKey) -> Result<vk::RenderPass, VulkanError> {
        let multisampled = key.samples != vk::SampleCountFlags::TYPE_1;
        let mut attachments: SmallVec<[vk::AttachmentDescription; 8]> = SmallVec::new();
        let mut color_refs: SmallVec<[vk::AttachmentReference; 4]> = SmallVec::new();
        let mut resolve_refs: SmallVec<[vk::AttachmentReference; 4]> = SmallVec::new();

        // Layouts don't change inside the render pass. Transitions are recorded explicitly
        // around it.
        for &format in &key.color_formats {
            color_refs.push(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            attachments.push(vk::AttachmentDescription {
                format,
                samples: key.samples,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: if multisampled && !key.resolve_formats.is_empty() {
                    vk::AttachmentStoreOp::DONT_CARE
                } else {
                    vk::AttachmentStoreOp::STORE
                },
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ..Default::default()
            });
        }

        let depth_ref = key.depth_format.map(|format| {
            let reference = vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            };
            attachments.push(vk::AttachmentDescription {
                format,
                samples: key.samples,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            });

            reference
        });

        for &format in &key.resolve_formats {
            resolve_refs.push(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            attachments.push(vk::AttachmentDescription {
                format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::DONT_CARE,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ..Default::default()
            });
        }

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);

        if !resolve_refs.is_empty() {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }

        if let Some(depth_ref) = &depth_ref {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let dependency = external_dependency();

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(slice::from_ref(&subpass))
            .dependencies(slice::from_ref(&dependency));

        Ok(unsafe { self.device.create_render_pass(&create_info, None) }?)
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: [u32; 2],
    ) -> Result<vk::Framebuffer, VulkanError> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent[0])
            .height(extent[1])
            .layers(1);

        Ok(unsafe { self.device.create_framebuffer(&create_info, None) }?)
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_graphics_pipeline(
        &self,
        state: &GraphicsPipelineState<'_>,
    ) -> Result<vk::Pipeline, VulkanError> {
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(state.vertex_module)
                .name(state.vertex_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(state.fragment_module)
                .name(state.fragment_entry),
        ];

        let binding = vk::VertexInputBindingDescription {
            binding: 0,
            stride: state.vertex_layout.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        };
        let attributes: SmallVec<[_; 4]> = state
            .vertex_layout
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: 0,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect();
        let bindings: &[_] = if state.vertex_layout.is_empty() {
            &[]
        } else {
            slice::from_ref(&binding)
        };
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        let [width, height] = state.extent;
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(slice::from_ref(&viewport))
            .scissors(slice::from_ref(&scissor));

        let polygon_mode = if state.wireframe && self.fill_mode_non_solid {
            vk::PolygonMode::LINE
        } else {
            if state.wireframe {
                warn!("wireframe rendering is not supported by the device, filling instead");
            }

            vk::PolygonMode::FILL
        };
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(polygon_mode)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(state.samples);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(state.depth)
            .depth_write_enable(state.depth)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

        let blend_attachments: SmallVec<[_; 4]> = (0..state.color_attachment_count)
            .map(|_| vk::PipelineColorBlendAttachmentState {
                color_write_mask: vk::ColorComponentFlags::RGBA,
                ..Default::default()
            })
            .collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .layout(state.layout)
            .render_pass(state.render_pass)
            .subpass(0);

        let pipelines = unsafe {
            self.device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                slice::from_ref(&create_info),
                None,
            )
        }
        .map_err(|(_, err)| VulkanError::from(err))?;

        Ok(pipelines[0])
    }

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
        entry_point: &CStr,
    ) -> Result<vk::Pipeline, VulkanError> {
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(entry_point);
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipelines = unsafe {
            self.device.create_compute_pipelines(
                vk::PipelineCache::null(),
                slice::from_ref(&create_info),
                None,
            )
        }
        .map_err(|(_, err)| VulkanError::from(err))?;

        Ok(pipelines[0])
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                buffer_barriers,
                image_barriers,
            )
        };
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: [u32; 2],
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    ) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: extent[0],
                    height: extent[1],
                },
            })
            .clear_values(clear_values);

        unsafe {
            self.device
                .cmd_begin_render_pass(command_buffer, &begin_info, contents)
        };
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(command_buffer) };
    }

    fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    ) {
        unsafe { self.device.cmd_execute_commands(command_buffer, secondaries) };
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, bind_point, pipeline)
        };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                bind_point,
                layout,
                first_set,
                sets,
                &[],
            )
        };
    }

    fn cmd_bind_vertex_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: DeviceSize,
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(command_buffer, 0, &[buffer], &[offset])
        };
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(command_buffer, buffer, offset, index_type)
        };
    }

    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(command_buffer, layout, stages, 0, data)
        };
    }

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw_indexed(command_buffer, index_count, instance_count, 0, 0, 0)
        };
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, group_counts: [u32; 3]) {
        let [x, y, z] = group_counts;

        unsafe { self.device.cmd_dispatch(command_buffer, x, y, z) };
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(command_buffer, src, dst, dst_layout, regions)
        };
    }

    fn create_swapchain(
        &self,
        extent: [u32; 2],
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<SwapchainImages, VulkanError> {
        let capabilities = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }?;
        let surface_format = self.choose_surface_format()?;

        // A current extent of `u32::MAX` means that the swapchain decides.
        let extent = if capabilities.current_extent.width == u32::MAX {
            vk::Extent2D {
                width: extent[0].clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: extent[1].clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        } else {
            capabilities.current_extent
        };

        let mut min_image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count != 0 {
            min_image_count = min_image_count.min(capabilities.max_image_count);
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }?;
        let images = match unsafe { self.swapchain_loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(err) => {
                unsafe { self.swapchain_loader.destroy_swapchain(handle, None) };
                return Err(err.into());
            }
        };

        Ok(SwapchainImages {
            handle,
            format: surface_format.format,
            extent: [extent.width, extent.height],
            images,
        })
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), VulkanError> {
        Ok(unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, u64::MAX, semaphore, vk::Fence::null())
        }?)
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, VulkanError> {
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(slice::from_ref(&wait_semaphore))
            .swapchains(slice::from_ref(&swapchain))
            .image_indices(slice::from_ref(&image_index));

        Ok(unsafe {
            self.swapchain_loader
                .queue_present(self.queue.handle, &present_info)
        }?)
    }
}

/// The dependency between the work submitted before a render pass and its first subpass.
///
/// Attachments come from a pool and are handed to the next frame while the previous one may
/// still be rendering to them, with no layout change and so no barrier in between. The clears
/// of the render pass must wait for those writes.
fn external_dependency() -> vk::SubpassDependency {
    let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let attachment_writes =
        vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;

    vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: attachment_stages,
        dst_stage_mask: attachment_stages,
        src_access_mask: attachment_writes,
        dst_access_mask: attachment_writes
            | vk::AccessFlags::COLOR_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        dependency_flags: vk::DependencyFlags::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_pass_waits_for_previous_attachment_writes() {
        let dependency = external_dependency();

        assert_eq!(dependency.src_subpass, vk::SUBPASS_EXTERNAL);
        assert!(dependency.src_stage_mask.contains(
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ));
        assert!(dependency.src_access_mask.contains(
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ));
        // The clears happen in these stages.
        assert!(dependency.dst_stage_mask.contains(
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ));
    }
}
