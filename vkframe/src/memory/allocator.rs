// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{align_up, MemoryPage, MemoryRequirements};
use crate::{
    device::{DedicatedTo, RawDevice},
    DeviceSize, VulkanError,
};
use ash::vk;
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt::{self, Display},
    ptr::NonNull,
    sync::Arc,
};

/// Parameters to create a new `MemoryAllocator`.
#[derive(Clone, Debug)]
pub struct MemoryAllocatorCreateInfo {
    /// The size of the pages that suballocations are carved out of. Requests larger than half
    /// of this get a dedicated allocation.
    ///
    /// The default value is 64 MiB.
    pub page_size: DeviceSize,

    /// Whether to keep every page of a host-visible memory type persistently mapped.
    ///
    /// The default value is `true`.
    pub map_host_visible: bool,
}

impl Default for MemoryAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        MemoryAllocatorCreateInfo {
            page_size: 64 * 1024 * 1024,
            map_host_visible: true,
        }
    }
}

/// Parameters of a single allocation.
#[derive(Clone, Copy, Debug)]
pub struct AllocationCreateInfo {
    /// What the resource needs, as reported by the device.
    pub requirements: MemoryRequirements,

    /// Flags the memory type must have.
    pub property_flags: vk::MemoryPropertyFlags,

    /// Whether to give the resource a block of memory of its own.
    pub prefer_dedicated: bool,

    /// Whether the allocation must be accessible from the host. Adds `HOST_VISIBLE` to the
    /// required property flags.
    pub want_mapped: bool,

    /// The resource the memory is for, passed on to the driver for dedicated allocations.
    pub dedicated_to: Option<DedicatedTo>,
}

impl AllocationCreateInfo {
    /// Returns an `AllocationCreateInfo` for the given requirements and property flags.
    #[inline]
    pub fn new(requirements: MemoryRequirements, property_flags: vk::MemoryPropertyFlags) -> Self {
        AllocationCreateInfo {
            requirements,
            property_flags,
            prefer_dedicated: requirements.prefer_dedicated,
            want_mapped: false,
            dedicated_to: None,
        }
    }
}

/// A byte range of device memory backing exactly one buffer or image.
///
/// A `SubAllocation` is not `Clone`: it is handed back to the [`MemoryAllocator`] exactly once
/// through [`MemoryAllocator::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct SubAllocation {
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    offset: DeviceSize,
    size: DeviceSize,
    mapped_ptr: Option<NonNull<u8>>,
    // `None` for dedicated allocations.
    page: Option<usize>,
}

unsafe impl Send for SubAllocation {}
unsafe impl Sync for SubAllocation {}

impl SubAllocation {
    #[inline]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Offset of the range from the start of [`memory`](Self::memory).
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub fn is_dedicated(&self) -> bool {
        self.page.is_none()
    }

    /// Host address of the first byte of the range, if its memory is mapped.
    #[inline]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped_ptr
    }

    /// Returns the mapped range as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// - The GPU must not be accessing the range.
    /// - There must be no other live reference to the range.
    pub unsafe fn mapped_slice(&self) -> Option<&mut [u8]> {
        self.mapped_ptr
            .map(|ptr| std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize))
    }
}

/// Suballocating device memory allocator.
///
/// Pages are kept per memory type index. An allocation scans the pages of the matching type in
/// creation order and takes the first page that has room; if none does, a new page is created.
/// Releasing returns the range to its page, where it is coalesced with free neighbors.
///
/// The allocator is not internally synchronized: it is owned by the thread that drives frames.
#[derive(Debug)]
pub struct MemoryAllocator {
    device: Arc<dyn RawDevice>,
    create_info: MemoryAllocatorCreateInfo,
    buffer_image_granularity: DeviceSize,
    // Indexed by the page IDs stored in suballocations. Slots of freed pages are reused.
    pages: Vec<Option<MemoryPage>>,
    pages_by_type: Vec<SmallVec<[usize; 4]>>,
    dedicated_count: usize,
}

impl MemoryAllocator {
    /// Creates a new `MemoryAllocator`.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.page_size` is not a power of two.
    pub fn new(device: Arc<dyn RawDevice>, create_info: MemoryAllocatorCreateInfo) -> Self {
        assert!(
            create_info.page_size.is_power_of_two(),
            "the page size must be a power of two",
        );

        let memory_type_count = device.memory_properties().memory_types.len();
        let buffer_image_granularity = device.limits().buffer_image_granularity.max(1);

        MemoryAllocator {
            device,
            create_info,
            buffer_image_granularity,
            pages: Vec::new(),
            pages_by_type: vec![SmallVec::new(); memory_type_count],
            dedicated_count: 0,
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    /// Allocates memory for a resource.
    ///
    /// # Panics
    ///
    /// - Panics if `requirements.size` is zero.
    /// - Panics if `requirements.alignment` is not a power of two.
    ///
    /// # Errors
    ///
    /// Failing to allocate a new page or dedicated block is reported as
    /// [`MemoryAllocatorError::OutOfDeviceMemory`] or
    /// [`MemoryAllocatorError::OutOfHostMemory`]. These are not recoverable.
    pub fn allocate(
        &mut self,
        create_info: AllocationCreateInfo,
    ) -> Result<SubAllocation, MemoryAllocatorError> {
        let AllocationCreateInfo {
            requirements,
            mut property_flags,
            prefer_dedicated,
            want_mapped,
            dedicated_to,
        } = create_info;

        assert!(requirements.size > 0, "allocation requests must not be zero-sized");
        assert!(
            requirements.alignment.is_power_of_two(),
            "allocation alignment ({}) must be a power of two",
            requirements.alignment,
        );

        if want_mapped {
            property_flags |= vk::MemoryPropertyFlags::HOST_VISIBLE;
        }

        let memory_type_index = self
            .device
            .memory_properties()
            .find_memory_type_index(
                requirements.memory_type_bits,
                property_flags,
                vk::MemoryPropertyFlags::empty(),
            )
            .ok_or(MemoryAllocatorError::NoSuitableMemoryType)?;

        if prefer_dedicated || requirements.size > self.create_info.page_size / 2 {
            return self.allocate_dedicated(memory_type_index, requirements.size, dedicated_to);
        }

        // Padding everything to the buffer-image granularity means linear and non-linear
        // resources can never share a granularity page.
        let alignment = requirements.alignment.max(self.buffer_image_granularity);
        let size = align_up(requirements.size, self.buffer_image_granularity);

        for &page_id in &self.pages_by_type[memory_type_index as usize] {
            let page = self.pages[page_id].as_mut().unwrap();

            if let Some(offset) = page.allocate(size, alignment) {
                return Ok(suballocation(page, page_id, offset, size));
            }
        }

        let page_size = align_up(size + alignment, self.create_info.page_size);
        let page_id = self.create_page(memory_type_index, page_size)?;
        let page = self.pages[page_id].as_mut().unwrap();
        let offset = page
            .allocate(size, alignment)
            .expect("a fresh page is large enough for the request it was created for");

        Ok(suballocation(page, page_id, offset, size))
    }

    fn allocate_dedicated(
        &mut self,
        memory_type_index: u32,
        size: DeviceSize,
        dedicated_to: Option<DedicatedTo>,
    ) -> Result<SubAllocation, MemoryAllocatorError> {
        let memory = self
            .device
            .allocate_memory(memory_type_index, size, dedicated_to)?;
        let mapped_ptr = match self.map_if_host_visible(memory_type_index, memory, size) {
            Ok(mapped_ptr) => mapped_ptr,
            Err(err) => {
                unsafe { self.device.free_memory(memory) };
                return Err(err);
            }
        };

        self.dedicated_count += 1;
        log::debug!(
            "dedicated allocation of {} bytes in memory type {}",
            size,
            memory_type_index,
        );

        Ok(SubAllocation {
            memory,
            memory_type_index,
            offset: 0,
            size,
            mapped_ptr,
            page: None,
        })
    }

    fn create_page(
        &mut self,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<usize, MemoryAllocatorError> {
        let memory = self.device.allocate_memory(memory_type_index, size, None)?;
        let mapped_ptr = match self.map_if_host_visible(memory_type_index, memory, size) {
            Ok(mapped_ptr) => mapped_ptr,
            Err(err) => {
                unsafe { self.device.free_memory(memory) };
                return Err(err);
            }
        };
        let page = MemoryPage::new(memory, memory_type_index, size, mapped_ptr);

        let page_id = match self.pages.iter().position(Option::is_none) {
            Some(page_id) => {
                self.pages[page_id] = Some(page);
                page_id
            }
            None => {
                self.pages.push(Some(page));
                self.pages.len() - 1
            }
        };
        self.pages_by_type[memory_type_index as usize].push(page_id);

        log::debug!(
            "new memory page of {} bytes in memory type {} ({} pages live)",
            size,
            memory_type_index,
            self.page_count(),
        );

        Ok(page_id)
    }

    fn map_if_host_visible(
        &self,
        memory_type_index: u32,
        memory: vk::DeviceMemory,
        size: DeviceSize,
    ) -> Result<Option<NonNull<u8>>, MemoryAllocatorError> {
        let property_flags = self.device.memory_properties().memory_types
            [memory_type_index as usize]
            .property_flags;

        if self.create_info.map_host_visible
            && property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            let ptr = self
                .device
                .map_memory(memory, size)
                .map_err(MemoryAllocatorError::MapFailed)?;
            Ok(Some(ptr))
        } else {
            Ok(None)
        }
    }

    /// Returns a suballocation to its page, or frees its block if it is dedicated.
    ///
    /// Pages are kept alive even when they become empty, to be reused by later requests.
    ///
    /// # Panics
    ///
    /// - Panics if `allocation` was not made by this allocator.
    pub fn release(&mut self, allocation: SubAllocation) {
        match allocation.page {
            Some(page_id) => {
                let page = self
                    .pages
                    .get_mut(page_id)
                    .and_then(Option::as_mut)
                    .filter(|page| page.memory() == allocation.memory)
                    .expect("the suballocation was not made by this allocator");
                page.free(allocation.offset);
            }
            None => {
                unsafe { self.device.free_memory(allocation.memory) };
                self.dedicated_count -= 1;
            }
        }
    }

    /// Frees every page that has no live suballocations. Returns the number of pages freed.
    pub fn trim(&mut self) -> usize {
        let mut freed = 0;

        for page_ids in &mut self.pages_by_type {
            page_ids.retain(|&mut page_id| {
                let page = self.pages[page_id].as_ref().unwrap();

                if page.is_empty() {
                    unsafe { self.device.free_memory(page.memory()) };
                    self.pages[page_id] = None;
                    freed += 1;
                    false
                } else {
                    true
                }
            });
        }

        freed
    }

    /// Returns the pages of the given memory type, in creation order.
    pub fn pages(&self, memory_type_index: u32) -> impl Iterator<Item = &MemoryPage> + '_ {
        self.pages_by_type[memory_type_index as usize]
            .iter()
            .map(move |&page_id| self.pages[page_id].as_ref().unwrap())
    }

    /// Returns the number of live pages, all memory types combined.
    pub fn page_count(&self) -> usize {
        self.pages.iter().flatten().count()
    }

    /// Returns the number of live suballocations, dedicated ones included.
    pub fn allocation_count(&self) -> usize {
        self.pages
            .iter()
            .flatten()
            .map(MemoryPage::allocation_count)
            .sum::<usize>()
            + self.dedicated_count
    }

    /// Returns the number of `VkDeviceMemory` blocks the allocator holds.
    pub fn device_memory_count(&self) -> usize {
        self.page_count() + self.dedicated_count
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        if self.allocation_count() != 0 {
            log::warn!(
                "memory allocator dropped with {} live allocations",
                self.allocation_count(),
            );
        }

        for page in self.pages.drain(..).flatten() {
            unsafe { self.device.free_memory(page.memory()) };
        }
    }
}

fn suballocation(
    page: &MemoryPage,
    page_id: usize,
    offset: DeviceSize,
    size: DeviceSize,
) -> SubAllocation {
    SubAllocation {
        memory: page.memory(),
        memory_type_index: page.memory_type_index(),
        offset,
        size,
        // Offsets are within the page, and the page was mapped in full.
        mapped_ptr: page
            .mapped_ptr()
            .map(|ptr| unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset as usize)) }),
        page: Some(page_id),
    }
}

/// Error that can be returned when allocating memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryAllocatorError {
    /// The device ran out of memory while creating a page or a dedicated block.
    OutOfDeviceMemory,

    /// The host ran out of memory while creating a page or a dedicated block.
    OutOfHostMemory,

    /// No memory type allowed by the requirements has the requested property flags.
    NoSuitableMemoryType,

    /// A host-visible block could not be mapped.
    MapFailed(VulkanError),

    Vulkan(VulkanError),
}

impl Error for MemoryAllocatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MapFailed(err) | Self::Vulkan(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for MemoryAllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfDeviceMemory => "out of device memory",
            Self::OutOfHostMemory => "out of host memory",
            Self::NoSuitableMemoryType => "no memory type has the requested property flags",
            Self::MapFailed(_) => "mapping a host-visible memory block failed",
            Self::Vulkan(_) => "a runtime error occurred",
        };

        f.write_str(msg)
    }
}

impl From<VulkanError> for MemoryAllocatorError {
    fn from(err: VulkanError) -> Self {
        match err {
            VulkanError::OutOfDeviceMemory => Self::OutOfDeviceMemory,
            VulkanError::OutOfHostMemory => Self::OutOfHostMemory,
            err => Self::Vulkan(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::null::NullDevice;

    const KIB: DeviceSize = 1024;

    fn requirements(size: DeviceSize, alignment: DeviceSize) -> MemoryRequirements {
        MemoryRequirements {
            size,
            alignment,
            memory_type_bits: u32::MAX,
            prefer_dedicated: false,
        }
    }

    fn allocator(device: &Arc<NullDevice>) -> MemoryAllocator {
        MemoryAllocator::new(
            device.clone(),
            MemoryAllocatorCreateInfo {
                page_size: 64 * KIB,
                ..Default::default()
            },
        )
    }

    #[test]
    fn suballocations_share_a_page() {
        let device = NullDevice::new();
        let mut allocator = allocator(&device);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let a = allocator
            .allocate(AllocationCreateInfo::new(requirements(4 * KIB, 256), local))
            .unwrap();
        let b = allocator
            .allocate(AllocationCreateInfo::new(requirements(4 * KIB, 256), local))
            .unwrap();

        assert_eq!(a.memory(), b.memory());
        assert_ne!(a.offset(), b.offset());
        assert_eq!(allocator.page_count(), 1);
        assert_eq!(allocator.allocation_count(), 2);
        assert_eq!(device.live_memory_count(), 1);

        allocator.release(a);
        allocator.release(b);

        let page = allocator.pages(a_type(&allocator)).next().unwrap();
        assert_eq!(page.free_ranges(), &[0..page.size()]);
        assert_eq!(allocator.allocation_count(), 0);
    }

    fn a_type(allocator: &MemoryAllocator) -> u32 {
        (0..allocator.pages_by_type.len() as u32)
            .find(|&index| allocator.pages(index).next().is_some())
            .unwrap()
    }

    #[test]
    fn new_page_when_full() {
        let device = NullDevice::new();
        let mut allocator = allocator(&device);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let allocations: Vec<_> = (0..3)
            .map(|_| {
                allocator
                    .allocate(AllocationCreateInfo::new(requirements(30 * KIB, 256), local))
                    .unwrap()
            })
            .collect();

        assert_eq!(allocator.page_count(), 2);
        assert_eq!(allocations[0].memory(), allocations[1].memory());
        assert_ne!(allocations[1].memory(), allocations[2].memory());

        for allocation in allocations {
            allocator.release(allocation);
        }

        assert_eq!(allocator.trim(), 2);
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn large_requests_are_dedicated() {
        let device = NullDevice::new();
        let mut allocator = allocator(&device);

        let allocation = allocator
            .allocate(AllocationCreateInfo::new(
                requirements(40 * KIB, 256),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ))
            .unwrap();

        assert!(allocation.is_dedicated());
        assert_eq!(allocator.page_count(), 0);
        assert_eq!(allocator.device_memory_count(), 1);

        allocator.release(allocation);
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn mapped_allocations_are_host_visible() {
        let device = NullDevice::new();
        let mut allocator = allocator(&device);

        let allocation = allocator
            .allocate(AllocationCreateInfo {
                want_mapped: true,
                ..AllocationCreateInfo::new(requirements(KIB, 64), vk::MemoryPropertyFlags::empty())
            })
            .unwrap();

        let memory_type = device.memory_properties().memory_types
            [allocation.memory_type_index() as usize];
        assert!(memory_type
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE));

        let slice = unsafe { allocation.mapped_slice() }.unwrap();
        slice.fill(0xAB);
        assert_eq!(slice.len(), KIB as usize);

        allocator.release(allocation);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let device = NullDevice::with_memory_budget(64 * KIB);
        let mut allocator = allocator(&device);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let first = allocator
            .allocate(AllocationCreateInfo::new(requirements(30 * KIB, 256), local))
            .unwrap();
        let _second = allocator
            .allocate(AllocationCreateInfo::new(requirements(30 * KIB, 256), local))
            .unwrap();

        assert_eq!(
            allocator.allocate(AllocationCreateInfo::new(requirements(30 * KIB, 256), local)),
            Err(MemoryAllocatorError::OutOfDeviceMemory),
        );

        allocator.release(first);
    }

    #[test]
    fn free_and_allocated_bytes_add_up() {
        let device = NullDevice::new();
        let mut allocator = allocator(&device);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let mut live = Vec::new();

        for i in 0..200u64 {
            if i % 3 == 2 {
                allocator.release(live.remove((i as usize * 7) % live.len()));
            } else {
                let size = (i * 37) % (12 * KIB) + 1;
                let alignment = 1 << (i % 10);
                live.push(
                    allocator
                        .allocate(AllocationCreateInfo::new(requirements(size, alignment), local))
                        .unwrap(),
                );
            }

            let memory_type_index = live.first().map_or(0, SubAllocation::memory_type_index);
            for page in allocator.pages(memory_type_index) {
                assert!(page.check_invariants());
                assert_eq!(page.free_size() + page.allocated_size(), page.size());
            }
        }

        for allocation in live {
            allocator.release(allocation);
        }
    }

    #[test]
    #[should_panic(expected = "must not be zero-sized")]
    fn zero_sized_request() {
        let device = NullDevice::new();
        let mut allocator = allocator(&device);
        let _ = allocator.allocate(AllocationCreateInfo::new(
            requirements(0, 1),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ));
    }

    #[test]
    #[should_panic(expected = "must be a power of two")]
    fn unaligned_request() {
        let device = NullDevice::new();
        let mut allocator = allocator(&device);
        let _ = allocator.allocate(AllocationCreateInfo::new(
            requirements(64, 24),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ));
    }
}
