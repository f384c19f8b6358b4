// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::align_up;
use crate::DeviceSize;
use ash::vk;
use foldhash::HashMap;
use std::{ops::Range, ptr::NonNull};

/// One block of device memory that is divided into suballocations.
///
/// The free-list holds the `[begin, end)` ranges that are not allocated, sorted by their start
/// offset. Ranges never overlap and two free ranges are never adjacent: a freed range is merged
/// with its free neighbors as soon as it is returned. At all times the allocated bytes plus the
/// free bytes add up to the size of the page.
#[derive(Debug)]
pub struct MemoryPage {
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    size: DeviceSize,
    mapped_ptr: Option<NonNull<u8>>,
    free_list: Vec<Range<DeviceSize>>,
    // Live suballocations, from offset to size.
    allocations: HashMap<DeviceSize, DeviceSize>,
    allocated_size: DeviceSize,
}

// The mapped pointer is only ever offset and handed out, never dereferenced by the page itself.
unsafe impl Send for MemoryPage {}
unsafe impl Sync for MemoryPage {}

impl MemoryPage {
    /// Wraps a freshly allocated block of `size` bytes that is entirely free.
    pub fn new(
        memory: vk::DeviceMemory,
        memory_type_index: u32,
        size: DeviceSize,
        mapped_ptr: Option<NonNull<u8>>,
    ) -> Self {
        assert!(size > 0);

        MemoryPage {
            memory,
            memory_type_index,
            size,
            mapped_ptr,
            free_list: vec![0..size],
            allocations: HashMap::default(),
            allocated_size: 0,
        }
    }

    /// Carves out `size` bytes at an offset that is a multiple of `alignment`.
    ///
    /// The first free range, in offset order, whose aligned start leaves room for `size` bytes
    /// is used. Alignment padding at the front and unused space at the back stay in the
    /// free-list. Returns the offset, or `None` if no range fits.
    ///
    /// # Panics
    ///
    /// - Panics if `size` is zero.
    /// - Panics if `alignment` is not a power of two.
    pub fn allocate(&mut self, size: DeviceSize, alignment: DeviceSize) -> Option<DeviceSize> {
        assert!(size > 0, "suballocations must not be zero-sized");
        assert!(
            alignment.is_power_of_two(),
            "suballocation alignment ({}) must be a power of two",
            alignment,
        );

        let (index, offset) = self.free_list.iter().enumerate().find_map(|(index, range)| {
            let offset = align_up(range.start, alignment);

            (offset.checked_add(size)? <= range.end).then_some((index, offset))
        })?;

        let range = self.free_list.remove(index);
        let front = range.start..offset;
        let back = offset + size..range.end;

        // Insert back first so that `index` keeps pointing at where the front goes.
        if !back.is_empty() {
            self.free_list.insert(index, back);
        }
        if !front.is_empty() {
            self.free_list.insert(index, front);
        }

        self.allocations.insert(offset, size);
        self.allocated_size += size;

        Some(offset)
    }

    /// Returns the suballocation at `offset` to the free-list, merging it with adjacent free
    /// ranges.
    ///
    /// # Panics
    ///
    /// - Panics if there is no live suballocation at `offset`.
    pub fn free(&mut self, offset: DeviceSize) {
        let size = self
            .allocations
            .remove(&offset)
            .unwrap_or_else(|| panic!("no live suballocation at offset {}", offset));
        self.allocated_size -= size;

        let (Ok(index) | Err(index)) = self
            .free_list
            .binary_search_by_key(&offset, |range| range.start);
        self.free_list.insert(index, offset..offset + size);

        // Coalesce with the next range first, so that `index` is still valid for the previous.
        if index + 1 < self.free_list.len()
            && self.free_list[index].end == self.free_list[index + 1].start
        {
            let next = self.free_list.remove(index + 1);
            self.free_list[index].end = next.end;
        }

        if index > 0 && self.free_list[index - 1].end == self.free_list[index].start {
            let current = self.free_list.remove(index);
            self.free_list[index - 1].end = current.end;
        }

        debug_assert!(self.check_invariants());
    }

    #[inline]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Host address of the first byte of the page, if it is mapped.
    #[inline]
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped_ptr
    }

    /// The free ranges, sorted by offset.
    #[inline]
    pub fn free_ranges(&self) -> &[Range<DeviceSize>] {
        &self.free_list
    }

    pub fn free_size(&self) -> DeviceSize {
        self.free_list.iter().map(|range| range.end - range.start).sum()
    }

    #[inline]
    pub fn allocated_size(&self) -> DeviceSize {
        self.allocated_size
    }

    /// Returns the number of live suballocations.
    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Checks that the free-list is sorted, free of overlaps and of adjacent ranges, and that
    /// free and allocated bytes account for the whole page.
    pub fn check_invariants(&self) -> bool {
        let sorted_and_disjoint = self
            .free_list
            .windows(2)
            .all(|pair| pair[0].end < pair[1].start);
        let in_bounds = self
            .free_list
            .iter()
            .all(|range| range.start < range.end && range.end <= self.size);

        sorted_and_disjoint && in_bounds && self.free_size() + self.allocated_size == self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn page(size: DeviceSize) -> MemoryPage {
        MemoryPage::new(vk::DeviceMemory::from_raw(1), 0, size, None)
    }

    #[test]
    fn first_fit_in_offset_order() {
        let mut page = page(1024);

        assert_eq!(page.allocate(64, 1), Some(0));
        assert_eq!(page.allocate(64, 1), Some(64));
        assert_eq!(page.allocate(64, 1), Some(128));
        page.free(64);

        // The hole at 64 is the first range that fits.
        assert_eq!(page.allocate(32, 1), Some(64));
        assert_eq!(page.allocate(64, 1), Some(192));
        assert!(page.check_invariants());
    }

    #[test]
    fn alignment_padding_stays_free() {
        let mut page = page(1024);

        assert_eq!(page.allocate(10, 1), Some(0));
        assert_eq!(page.allocate(100, 256), Some(256));
        assert_eq!(page.free_ranges(), &[10..256, 356..1024]);
        assert_eq!(page.allocated_size(), 110);
        assert!(page.check_invariants());
    }

    #[test]
    fn adjacent_frees_coalesce() {
        let mut page = page(128);

        assert_eq!(page.allocate(64, 64), Some(0));
        assert_eq!(page.allocate(64, 64), Some(64));
        assert!(page.free_ranges().is_empty());

        page.free(0);
        page.free(64);

        assert_eq!(page.free_ranges(), &[0..128]);
        assert!(page.is_empty());
    }

    #[test]
    fn coalesce_with_both_neighbors() {
        let mut page = page(512);
        let offsets: Vec<_> = (0..4).map(|_| page.allocate(128, 128).unwrap()).collect();

        page.free(offsets[0]);
        page.free(offsets[2]);
        assert_eq!(page.free_ranges(), &[0..128, 256..384]);

        page.free(offsets[1]);
        assert_eq!(page.free_ranges(), &[0..384]);

        page.free(offsets[3]);
        assert_eq!(page.free_ranges(), &[0..512]);
    }

    #[test]
    fn out_of_room() {
        let mut page = page(256);

        assert_eq!(page.allocate(200, 1), Some(0));
        assert_eq!(page.allocate(100, 1), None);
        // Enough free bytes, but not once aligned.
        assert_eq!(page.allocate(40, 64), None);
        assert_eq!(page.allocate(56, 1), Some(200));
    }

    #[test]
    fn invariants_hold_for_arbitrary_sequences() {
        let mut page = page(1 << 16);
        let mut live = Vec::new();
        // Deterministic xorshift so the sequence is reproducible.
        let mut state = 0x2545_f491_u64;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for _ in 0..2000 {
            if live.is_empty() || next() % 3 != 0 {
                let size = next() % 900 + 1;
                let alignment = 1 << (next() % 9);

                if let Some(offset) = page.allocate(size, alignment) {
                    assert_eq!(offset % alignment, 0);
                    live.push(offset);
                }
            } else {
                let index = (next() % live.len() as u64) as usize;
                page.free(live.swap_remove(index));
            }

            assert!(page.check_invariants());
        }

        for offset in live {
            page.free(offset);
        }

        assert_eq!(page.free_ranges(), &[0..1 << 16]);
    }

    #[test]
    #[should_panic(expected = "must be a power of two")]
    fn non_power_of_two_alignment() {
        page(256).allocate(16, 3);
    }

    #[test]
    #[should_panic(expected = "must not be zero-sized")]
    fn zero_size() {
        page(256).allocate(0, 1);
    }

    #[test]
    #[should_panic(expected = "no live suballocation")]
    fn double_free() {
        let mut page = page(256);
        let offset = page.allocate(16, 1).unwrap();
        page.free(offset);
        page.free(offset);
    }
}
