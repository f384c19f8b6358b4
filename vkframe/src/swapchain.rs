// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The images that are shown on the window's surface.
//!
//! There is exactly one swapchain. Rendering to it goes like this:
//!
//! - [`Swapchain::acquire`] returns the index of the next image, and a semaphore that the caller
//!   passes in is signaled once the presentation engine is done reading from it.
//! - The frame's command buffer waits on that semaphore before writing to the image, and signals
//!   a second semaphore when it is done.
//! - [`Swapchain::present`] queues the image for presentation once that second semaphore is
//!   signaled.
//!
//! When the window is resized, acquiring or presenting returns [`VulkanError::OutOfDate`] and
//! the swapchain must be [recreated](Swapchain::recreate).

use crate::{device::RawDevice, resource::format_aspect, VulkanError};
use ash::vk;
use log::{info, warn};
use std::sync::Arc;

/// The swapchain of the device's surface, with a view for each of its images.
#[derive(Debug)]
pub struct Swapchain {
    device: Arc<dyn RawDevice>,
    handle: vk::SwapchainKHR,
    format: vk::Format,
    extent: [u32; 2],
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
}

impl Swapchain {
    /// Creates a swapchain whose images are `extent` large, unless the surface dictates
    /// otherwise.
    ///
    /// # Panics
    ///
    /// - Panics if `extent` has a zero component.
    pub fn new(device: Arc<dyn RawDevice>, extent: [u32; 2]) -> Result<Self, VulkanError> {
        let mut swapchain = Swapchain {
            device,
            handle: vk::SwapchainKHR::null(),
            format: vk::Format::UNDEFINED,
            extent: [0; 2],
            images: Vec::new(),
            views: Vec::new(),
        };
        swapchain.recreate(extent)?;

        Ok(swapchain)
    }

    /// Replaces the swapchain with one of the given extent.
    ///
    /// The caller must make sure that the GPU no longer uses any of the current images, and must
    /// drop everything that references the current views (framebuffers in particular).
    ///
    /// # Panics
    ///
    /// - Panics if `extent` has a zero component.
    pub fn recreate(&mut self, extent: [u32; 2]) -> Result<(), VulkanError> {
        assert!(
            extent[0] != 0 && extent[1] != 0,
            "a swapchain can't be created with a zero extent",
        );

        let new = self.device.create_swapchain(extent, self.handle)?;

        let mut views = Vec::with_capacity(new.images.len());
        for &image in &new.images {
            let view = self
                .device
                .create_image_view(image, new.format, format_aspect(new.format), 1)
                .inspect_err(|_| unsafe {
                    for &view in &views {
                        self.device.destroy_image_view(view);
                    }
                    self.device.destroy_swapchain(new.handle);
                })?;
            views.push(view);
        }

        self.destroy_current();

        info!(
            "created a swapchain of {} images with extent {:?} and format {:?}",
            new.images.len(),
            new.extent,
            new.format,
        );

        self.handle = new.handle;
        self.format = new.format;
        self.extent = new.extent;
        self.images = new.images;
        self.views = views;

        Ok(())
    }

    /// Acquires the next image to render to. `semaphore` is signaled when the image can be
    /// written to.
    ///
    /// Returns the index of the image and whether the swapchain should be recreated soon. An
    /// out-of-date swapchain is reported as [`VulkanError::OutOfDate`].
    pub fn acquire(&self, semaphore: vk::Semaphore) -> Result<(u32, bool), VulkanError> {
        let (index, suboptimal) = self.device.acquire_next_image(self.handle, semaphore)?;

        if suboptimal {
            warn!("acquired an image from a suboptimal swapchain");
        }

        Ok((index, suboptimal))
    }

    /// Presents the image at `index` once `wait_semaphore` is signaled. Returns whether the
    /// swapchain is suboptimal.
    ///
    /// # Panics
    ///
    /// - Panics if `index` is out of range.
    pub fn present(&self, index: u32, wait_semaphore: vk::Semaphore) -> Result<bool, VulkanError> {
        assert!(
            (index as usize) < self.images.len(),
            "image index {} is out of range for a swapchain of {} images",
            index,
            self.images.len(),
        );

        self.device
            .queue_present(self.handle, index, wait_semaphore)
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> [u32; 2] {
        self.extent
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    #[inline]
    pub fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    #[inline]
    pub fn view(&self, index: u32) -> vk::ImageView {
        self.views[index as usize]
    }

    fn destroy_current(&mut self) {
        unsafe {
            for view in self.views.drain(..) {
                self.device.destroy_image_view(view);
            }

            if self.handle != vk::SwapchainKHR::null() {
                self.device.destroy_swapchain(self.handle);
            }
        }

        self.images.clear();
        self.handle = vk::SwapchainKHR::null();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::null::NullDevice;

    #[test]
    fn views_follow_the_swapchain() {
        let device = NullDevice::new();
        let mut swapchain = Swapchain::new(device.clone(), [256, 256]).unwrap();

        assert_eq!(swapchain.extent(), [256, 256]);
        assert_eq!(swapchain.image_count(), 3);
        assert_eq!(device.live_object_count_of("image view"), 3);
        assert_eq!(device.live_swapchain_count(), 1);

        let old = swapchain.handle();
        swapchain.recreate([640, 480]).unwrap();

        assert_ne!(swapchain.handle(), old);
        assert_eq!(swapchain.extent(), [640, 480]);
        assert_eq!(device.live_object_count_of("image view"), 3);
        assert_eq!(device.live_swapchain_count(), 1);

        drop(swapchain);
        assert_eq!(device.live_object_count_of("image view"), 0);
        assert_eq!(device.live_swapchain_count(), 0);
    }

    #[test]
    fn acquire_and_present() {
        let device = NullDevice::new();
        let swapchain = Swapchain::new(device.clone(), [256, 256]).unwrap();

        let indices: Vec<_> = (0..4)
            .map(|_| swapchain.acquire(vk::Semaphore::null()).unwrap().0)
            .collect();
        assert_eq!(indices, [0, 1, 2, 0]);

        assert!(!swapchain.present(0, vk::Semaphore::null()).unwrap());
        assert_eq!(device.present_count(), 1);
    }

    #[test]
    fn out_of_date_is_reported() {
        let device = NullDevice::new();
        let mut swapchain = Swapchain::new(device.clone(), [256, 256]).unwrap();
        device.invalidate_swapchain(swapchain.handle());

        assert_eq!(
            swapchain.acquire(vk::Semaphore::null()),
            Err(VulkanError::OutOfDate),
        );

        swapchain.recreate([128, 128]).unwrap();
        assert!(swapchain.acquire(vk::Semaphore::null()).is_ok());
    }

    #[test]
    #[should_panic(expected = "zero extent")]
    fn zero_extent() {
        let _ = Swapchain::new(NullDevice::new(), [0, 256]);
    }
}
