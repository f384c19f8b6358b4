// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device memory management.
//!
//! Allocating `VkDeviceMemory` is expensive and drivers cap the number of live allocations, so
//! every buffer and image is instead bound to a [`SubAllocation`]: an aligned byte range inside a
//! larger [`MemoryPage`]. Pages are grouped by memory type. Each page keeps a free-list of
//! `[begin, end)` ranges sorted by offset, and freeing a range merges it with its free neighbors
//! right away so that fragmentation does not build up over time.
//!
//! Requests that are large compared to the page size, or whose resource prefers it, get a
//! dedicated block of their own instead.

pub use self::{
    allocator::{
        AllocationCreateInfo, MemoryAllocator, MemoryAllocatorCreateInfo, MemoryAllocatorError,
        SubAllocation,
    },
    page::MemoryPage,
};
use crate::DeviceSize;
use ash::vk;

mod allocator;
mod page;

/// Memory types and heaps exposed by a physical device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
}

impl MemoryProperties {
    /// Picks the memory type to use for a resource.
    ///
    /// Among the types allowed by `memory_type_bits` that have all of the `required_flags`, a type
    /// that also has all of the `preferred_flags` wins. Returns `None` if no type has the
    /// required flags.
    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        required_flags: vk::MemoryPropertyFlags,
        preferred_flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let candidates = || {
            self.memory_types
                .iter()
                .enumerate()
                .filter(move |&(index, memory_type)| {
                    memory_type_bits & (1 << index) != 0
                        && memory_type.property_flags.contains(required_flags)
                })
        };

        candidates()
            .find(|(_, memory_type)| {
                memory_type
                    .property_flags
                    .contains(required_flags | preferred_flags)
            })
            .or_else(|| candidates().next())
            .map(|(index, _)| index as u32)
    }
}

impl From<&vk::PhysicalDeviceMemoryProperties> for MemoryProperties {
    fn from(properties: &vk::PhysicalDeviceMemoryProperties) -> Self {
        MemoryProperties {
            memory_types: properties.memory_types[..properties.memory_type_count as usize]
                .iter()
                .map(|memory_type| MemoryType {
                    property_flags: memory_type.property_flags,
                    heap_index: memory_type.heap_index,
                })
                .collect(),
            memory_heaps: properties.memory_heaps[..properties.memory_heap_count as usize]
                .iter()
                .map(|heap| MemoryHeap {
                    size: heap.size,
                    flags: heap.flags,
                })
                .collect(),
        }
    }
}

/// A type of memory that can be allocated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: DeviceSize,
    pub flags: vk::MemoryHeapFlags,
}

/// The memory requirements of a buffer or image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: DeviceSize,
    /// Always a power of two.
    pub alignment: DeviceSize,
    /// Bit `i` is set if memory type `i` can back the resource.
    pub memory_type_bits: u32,
    /// The implementation would like the resource to have a dedicated allocation.
    pub prefer_dedicated: bool,
}

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
#[inline]
pub const fn align_up(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    debug_assert!(alignment.is_power_of_two());

    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties() -> MemoryProperties {
        MemoryProperties {
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
        }
    }

    #[test]
    fn required_flags_are_honored() {
        let properties = properties();

        assert_eq!(
            properties.find_memory_type_index(
                u32::MAX,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::MemoryPropertyFlags::empty(),
            ),
            Some(1),
        );
        assert_eq!(
            properties.find_memory_type_index(
                0b001,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::MemoryPropertyFlags::empty(),
            ),
            None,
        );
    }

    #[test]
    fn preferred_flags_break_ties() {
        let properties = properties();

        assert_eq!(
            properties.find_memory_type_index(
                u32::MAX,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ),
            Some(2),
        );
        // Falls back to a type without the preferred flags.
        assert_eq!(
            properties.find_memory_type_index(
                0b010,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ),
            Some(1),
        );
    }

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 64), 320);
    }
}
