// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{device::RawDevice, VulkanError};
use ash::vk;
use std::sync::Arc;

/// Used to provide synchronization between command buffer submissions and presentation.
///
/// Only the swapchain acquire/present ordering uses semaphores; everything inside a frame is
/// ordered by pipeline barriers.
#[derive(Debug)]
pub struct Semaphore {
    handle: vk::Semaphore,
    device: Arc<dyn RawDevice>,
}

impl Semaphore {
    pub fn new(device: Arc<dyn RawDevice>) -> Result<Semaphore, VulkanError> {
        let handle = device.create_semaphore()?;

        Ok(Semaphore { handle, device })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    #[inline]
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.handle) };
    }
}
