// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Descriptor sets and their contents.
//!
//! Sets are allocated from a [`DescriptorSetPool`] and filled through a [`DescriptorWrites`]
//! batch. The batch must be flushed to the device before any bind that depends on it is
//! recorded, and a batch is flushed exactly once.

pub use self::pool::{DescriptorPoolCreateInfo, DescriptorSetPool};
use crate::{device::RawDevice, DeviceSize};
use ash::vk;
use smallvec::SmallVec;

mod pool;

/// A single descriptor to write into a set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub resource: WriteResource,
}

/// The resource a [`DescriptorWrite`] points the descriptor at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteResource {
    Buffer {
        buffer: vk::Buffer,
        offset: DeviceSize,
        range: DeviceSize,
    },
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        /// Null for descriptor types without a sampler.
        sampler: vk::Sampler,
    },
}

impl DescriptorWrite {
    pub fn uniform_buffer(
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        offset: DeviceSize,
        range: DeviceSize,
    ) -> Self {
        DescriptorWrite {
            set,
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            resource: WriteResource::Buffer {
                buffer,
                offset,
                range,
            },
        }
    }

    pub fn storage_buffer(
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        offset: DeviceSize,
        range: DeviceSize,
    ) -> Self {
        DescriptorWrite {
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            ..Self::uniform_buffer(set, binding, buffer, offset, range)
        }
    }

    /// A sampled image, in the `SHADER_READ_ONLY_OPTIMAL` layout.
    pub fn combined_image_sampler(
        set: vk::DescriptorSet,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> Self {
        DescriptorWrite {
            set,
            binding,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            resource: WriteResource::Image {
                view,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                sampler,
            },
        }
    }

    /// A storage image, in the `GENERAL` layout.
    pub fn storage_image(set: vk::DescriptorSet, binding: u32, view: vk::ImageView) -> Self {
        DescriptorWrite {
            set,
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
            resource: WriteResource::Image {
                view,
                layout: vk::ImageLayout::GENERAL,
                sampler: vk::Sampler::null(),
            },
        }
    }
}

/// A batch of descriptor writes, pushed to the device in one call.
#[derive(Debug, Default)]
pub struct DescriptorWrites {
    writes: SmallVec<[DescriptorWrite; 8]>,
    closed: bool,
}

impl DescriptorWrites {
    #[inline]
    pub fn new() -> Self {
        DescriptorWrites::default()
    }

    /// Adds a write to the batch.
    ///
    /// # Panics
    ///
    /// - Panics if the batch has already been flushed.
    pub fn push(&mut self, write: DescriptorWrite) -> &mut Self {
        assert!(!self.closed, "the descriptor write batch has already been flushed");
        self.writes.push(write);

        self
    }

    /// Pushes every write to the device and closes the batch.
    ///
    /// # Panics
    ///
    /// - Panics if the batch has already been flushed.
    pub fn flush(&mut self, device: &dyn RawDevice) {
        assert!(!self.closed, "the descriptor write batch has already been flushed");

        if !self.writes.is_empty() {
            device.update_descriptor_sets(&self.writes);
        }
        self.closed = true;
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    #[inline]
    pub fn writes(&self) -> &[DescriptorWrite] {
        &self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::null::NullDevice;
    use ash::vk::Handle;

    #[test]
    fn flushed_in_one_call() {
        let device = NullDevice::new();
        let set = vk::DescriptorSet::from_raw(7);
        let mut writes = DescriptorWrites::new();

        writes
            .push(DescriptorWrite::uniform_buffer(
                set,
                0,
                vk::Buffer::from_raw(1),
                0,
                64,
            ))
            .push(DescriptorWrite::combined_image_sampler(
                set,
                1,
                vk::ImageView::from_raw(2),
                vk::Sampler::from_raw(3),
            ));
        assert_eq!(writes.len(), 2);
        assert_eq!(
            writes.writes()[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        );

        writes.flush(&*device);
        assert!(writes.is_closed());
        assert_eq!(device.descriptor_write_count(), 2);
    }

    #[test]
    #[should_panic(expected = "already been flushed")]
    fn flush_twice() {
        let device = NullDevice::new();
        let mut writes = DescriptorWrites::new();

        writes.flush(&*device);
        writes.flush(&*device);
    }

    #[test]
    #[should_panic(expected = "already been flushed")]
    fn push_after_flush() {
        let device = NullDevice::new();
        let mut writes = DescriptorWrites::new();

        writes.flush(&*device);
        writes.push(DescriptorWrite::storage_image(
            vk::DescriptorSet::null(),
            0,
            vk::ImageView::null(),
        ));
    }
}
