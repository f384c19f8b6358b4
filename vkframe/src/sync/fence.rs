// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{CompletionToken, SignalCounter};
use crate::{device::RawDevice, VulkanError};
use ash::vk;
use std::{sync::Arc, time::Duration};

/// Whether a fence has been observed to signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceState {
    NotSignaled,
    Signaled,
}

/// A fence is used to know when a command buffer submission has finished its execution.
///
/// The fence remembers whether it was already observed to be signaled, so that the device does
/// not need to be queried again. Every transition to [`FenceState::Signaled`] advances the
/// fence's [`SignalCounter`].
#[derive(Debug)]
pub struct Fence {
    handle: vk::Fence,
    device: Arc<dyn RawDevice>,
    state: FenceState,
    counter: SignalCounter,
}

impl Fence {
    /// Creates a new unsignaled `Fence`.
    pub fn new(device: Arc<dyn RawDevice>) -> Result<Fence, VulkanError> {
        let handle = device.create_fence(false)?;

        Ok(Fence {
            handle,
            device,
            state: FenceState::NotSignaled,
            counter: SignalCounter::new(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    #[inline]
    pub fn state(&self) -> FenceState {
        self.state
    }

    #[inline]
    pub fn counter(&self) -> &SignalCounter {
        &self.counter
    }

    /// The number of times the fence was observed to signal.
    #[inline]
    pub fn signaled_counter(&self) -> u64 {
        self.counter.get()
    }

    /// Returns a token for work that will be guarded by the next signal of this fence.
    #[inline]
    pub fn token(&self) -> CompletionToken {
        self.counter.token()
    }

    /// Queries the device without blocking. Returns whether the fence is signaled.
    pub fn poll(&mut self) -> Result<bool, VulkanError> {
        if self.state == FenceState::Signaled {
            return Ok(true);
        }

        if self.device.fence_status(self.handle)? {
            self.mark_signaled();
        }

        Ok(self.state == FenceState::Signaled)
    }

    /// Waits until the fence is signaled, or at least until the timeout duration has elapsed.
    ///
    /// Returns [`VulkanError::Timeout`] if the timeout was reached first. `None` waits forever.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<(), VulkanError> {
        if self.state == FenceState::Signaled {
            return Ok(());
        }

        let timeout_ns = if let Some(timeout) = timeout {
            timeout
                .as_secs()
                .saturating_mul(1_000_000_000)
                .saturating_add(timeout.subsec_nanos() as u64)
        } else {
            u64::MAX
        };

        self.device.wait_for_fence(self.handle, timeout_ns)?;
        self.mark_signaled();

        Ok(())
    }

    fn mark_signaled(&mut self) {
        self.state = FenceState::Signaled;
        self.counter.advance();
    }

    /// Resets the fence so that it can guard another submission.
    ///
    /// # Panics
    ///
    /// - Panics if the fence has not been observed to signal.
    pub fn reset(&mut self) -> Result<(), VulkanError> {
        assert_eq!(
            self.state,
            FenceState::Signaled,
            "only a signaled fence can be reset",
        );

        self.device.reset_fence(self.handle)?;
        self.state = FenceState::NotSignaled;

        Ok(())
    }
}

impl Drop for Fence {
    #[inline]
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::null::NullDevice;

    #[test]
    fn poll_advances_counter_once() {
        let device = NullDevice::new();
        let mut fence = Fence::new(device.clone()).unwrap();
        let token = fence.token();

        assert!(!fence.poll().unwrap());
        assert_eq!(fence.signaled_counter(), 0);

        device.signal_fence(fence.handle());
        assert!(fence.poll().unwrap());
        assert!(fence.poll().unwrap());
        assert_eq!(fence.signaled_counter(), 1);
        assert!(token.is_reclaimable());

        fence.reset().unwrap();
        assert_eq!(fence.state(), FenceState::NotSignaled);
        assert!(!fence.poll().unwrap());
    }

    #[test]
    fn wait_signals() {
        let device = NullDevice::new();
        let mut fence = Fence::new(device).unwrap();

        fence.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(fence.state(), FenceState::Signaled);
        assert_eq!(fence.signaled_counter(), 1);
    }

    #[test]
    #[should_panic(expected = "only a signaled fence can be reset")]
    fn reset_unsignaled() {
        let device = NullDevice::new();
        let mut fence = Fence::new(device).unwrap();
        let _ = fence.reset();
    }

    #[test]
    fn destroyed_on_drop() {
        let device = NullDevice::new();
        let fence = Fence::new(device.clone()).unwrap();
        let handle = fence.handle();
        drop(fence);

        // The fence is gone, so it can't be signaled anymore.
        let result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| device.signal_fence(handle)));
        assert!(result.is_err());
    }
}
