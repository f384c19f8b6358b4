// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{CommandBuffer, CommandBufferState};
use crate::{
    device::{Queue, RawDevice},
    sync::CompletionToken,
    VulkanError,
};
use ash::vk;
use std::{collections::VecDeque, sync::Arc};

/// Hands out command buffers and recycles them once their submission has completed.
///
/// Command buffers are moved out of the manager by [`allocate`](Self::allocate) and moved back
/// in with [`recycle`](Self::recycle) after they are submitted. In-flight command buffers are
/// kept in submission order, so the one that is reused is always the oldest that completed.
///
/// The manager owns the command pool; all of its command buffers must be back in the manager
/// and idle when it is dropped.
#[derive(Debug)]
pub struct CommandBufferManager {
    device: Arc<dyn RawDevice>,
    queue: Queue,
    pool: vk::CommandPool,
    ready: VecDeque<CommandBuffer>,
    in_flight: VecDeque<CommandBuffer>,
    ready_secondaries: VecDeque<CommandBuffer>,
    created: usize,
}

impl CommandBufferManager {
    /// Creates a manager for command buffers executing on the device's queue.
    pub fn new(device: Arc<dyn RawDevice>) -> Result<Self, VulkanError> {
        let queue = device.queue();
        let pool = device.create_command_pool(queue.family_index)?;

        Ok(CommandBufferManager {
            device,
            queue,
            pool,
            ready: VecDeque::new(),
            in_flight: VecDeque::new(),
            ready_secondaries: VecDeque::new(),
            created: 0,
        })
    }

    #[inline]
    pub fn queue(&self) -> Queue {
        self.queue
    }

    /// Returns a primary command buffer in the [`CommandBufferState::ReadyForBegin`] state.
    ///
    /// Completed in-flight command buffers are reclaimed first, without blocking. A new command
    /// buffer is only created if none has completed.
    pub fn allocate(&mut self) -> Result<CommandBuffer, VulkanError> {
        self.refresh_state()?;

        if let Some(cb) = self.ready.pop_front() {
            return Ok(cb);
        }

        self.create(vk::CommandBufferLevel::PRIMARY)
    }

    /// Returns a secondary command buffer in the [`CommandBufferState::ReadyForBegin`] state.
    pub fn allocate_secondary(&mut self) -> Result<CommandBuffer, VulkanError> {
        self.refresh_state()?;

        if let Some(cb) = self.ready_secondaries.pop_front() {
            return Ok(cb);
        }

        self.create(vk::CommandBufferLevel::SECONDARY)
    }

    fn create(&mut self, level: vk::CommandBufferLevel) -> Result<CommandBuffer, VulkanError> {
        let cb = CommandBuffer::new(self.device.clone(), self.pool, level)?;
        self.created += 1;

        log::debug!(
            "new {:?} command buffer ({} created, {} in flight)",
            level,
            self.created,
            self.in_flight.len(),
        );

        Ok(cb)
    }

    /// Takes a command buffer back.
    ///
    /// A submitted command buffer stays in flight until its submission completes. Any other
    /// command buffer must be ready to begin.
    ///
    /// # Panics
    ///
    /// - Panics if `cb` is being recorded or has been recorded but not submitted.
    pub fn recycle(&mut self, cb: CommandBuffer) {
        match cb.state() {
            CommandBufferState::Submitted => self.in_flight.push_back(cb),
            CommandBufferState::ReadyForBegin => self.push_ready(cb),
            state => panic!(
                "a command buffer in the {:?} state can't be given back to the manager",
                state,
            ),
        }
    }

    fn push_ready(&mut self, cb: CommandBuffer) {
        if cb.level() == vk::CommandBufferLevel::SECONDARY {
            self.ready_secondaries.push_back(cb);
        } else {
            self.ready.push_back(cb);
        }
    }

    /// Polls every in-flight command buffer and reclaims those whose submission completed.
    /// Never blocks. Returns the number of command buffers reclaimed.
    pub fn refresh_state(&mut self) -> Result<usize, VulkanError> {
        let mut reclaimed = 0;
        let mut index = 0;

        // Primaries are polled first so that secondaries executed in them see the new counter.
        self.in_flight
            .make_contiguous()
            .sort_by_key(|cb| cb.level() != vk::CommandBufferLevel::PRIMARY);

        while index < self.in_flight.len() {
            if self.in_flight[index].refresh_state()? {
                if let Some(cb) = self.in_flight.remove(index) {
                    self.push_ready(cb);
                }
                reclaimed += 1;
            } else {
                index += 1;
            }
        }

        if reclaimed != 0 {
            log::trace!("reclaimed {} command buffers", reclaimed);
        }

        Ok(reclaimed)
    }

    /// Blocks until the submission `token` was taken for has completed.
    ///
    /// # Panics
    ///
    /// - Panics if the token belongs to a command buffer that is neither in flight nor complete.
    pub fn wait_for(&mut self, token: &CompletionToken) -> Result<(), VulkanError> {
        if token.is_reclaimable() {
            return Ok(());
        }

        let index = self
            .in_flight
            .iter()
            .position(|cb| cb.fence().counter().ptr_eq(token.counter()))
            .expect("waiting for a submission that was never handed back to the manager");

        self.in_flight[index].wait_for_fence()?;
        if let Some(cb) = self.in_flight.remove(index) {
            self.push_ready(cb);
        }

        Ok(())
    }

    /// Waits for the device to be idle, then reclaims every in-flight command buffer.
    pub fn wait_idle(&mut self) -> Result<(), VulkanError> {
        self.device.wait_idle()?;

        // Every submission has completed, so this reclaims all of them.
        self.refresh_state()?;
        debug_assert!(self.in_flight.is_empty());

        Ok(())
    }

    /// The number of command buffers waiting for their submission to complete.
    #[inline]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// The number of command buffers ready to be handed out.
    #[inline]
    pub fn idle_count(&self) -> usize {
        self.ready.len() + self.ready_secondaries.len()
    }

    /// The number of command buffers created so far.
    #[inline]
    pub fn created_count(&self) -> usize {
        self.created
    }
}

impl Drop for CommandBufferManager {
    fn drop(&mut self) {
        if !self.in_flight.is_empty() {
            log::warn!(
                "command buffer manager dropped with {} command buffers in flight",
                self.in_flight.len(),
            );
        }

        // Destroying the pool frees the command buffers; their fences are destroyed with them.
        self.ready.clear();
        self.ready_secondaries.clear();
        self.in_flight.clear();
        unsafe { self.device.destroy_command_pool(self.pool) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::null::NullDevice;

    fn record_and_submit(manager: &mut CommandBufferManager) -> CompletionToken {
        let mut cb = manager.allocate().unwrap();
        cb.begin().unwrap();
        cb.end().unwrap();
        let token = cb.token();
        cb.submit(manager.queue().handle, &[], None).unwrap();
        manager.recycle(cb);

        token
    }

    #[test]
    fn reuses_completed_buffers() {
        let device = NullDevice::new();
        let mut manager = CommandBufferManager::new(device.clone()).unwrap();

        record_and_submit(&mut manager);
        record_and_submit(&mut manager);
        assert_eq!(manager.created_count(), 2);
        assert_eq!(manager.in_flight_count(), 2);

        device.complete_submissions();
        record_and_submit(&mut manager);
        // One of the completed buffers was reused.
        assert_eq!(manager.created_count(), 2);
        assert_eq!(manager.in_flight_count(), 1);
    }

    #[test]
    fn oldest_completed_is_reused_first() {
        let device = NullDevice::new();
        let mut manager = CommandBufferManager::new(device.clone()).unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let mut cb = manager.allocate().unwrap();
            handles.push(cb.handle());
            cb.begin().unwrap();
            cb.end().unwrap();
            cb.submit(manager.queue().handle, &[], None).unwrap();
            manager.recycle(cb);
        }

        device.complete_submissions();
        let reused: Vec<_> = (0..3).map(|_| manager.allocate().unwrap()).collect();
        assert_eq!(
            reused.iter().map(CommandBuffer::handle).collect::<Vec<_>>(),
            handles,
        );
        assert_eq!(manager.created_count(), 3);

        for cb in reused {
            manager.recycle(cb);
        }
    }

    #[test]
    fn wait_for_token() {
        let device = NullDevice::new();
        let mut manager = CommandBufferManager::new(device.clone()).unwrap();

        let first = record_and_submit(&mut manager);
        let second = record_and_submit(&mut manager);

        manager.wait_for(&first).unwrap();
        assert!(first.is_reclaimable());
        assert_eq!(manager.in_flight_count(), 1);

        // Waiting again is a no-op.
        manager.wait_for(&first).unwrap();

        manager.wait_idle().unwrap();
        assert!(second.is_reclaimable());
        assert_eq!(manager.in_flight_count(), 0);
    }

    #[test]
    fn pool_destroyed_on_drop() {
        let device = NullDevice::new();
        let manager = CommandBufferManager::new(device.clone()).unwrap();
        assert_eq!(device.live_object_count_of("command pool"), 1);

        drop(manager);
        assert_eq!(device.live_object_count_of("command pool"), 0);
    }

    #[test]
    #[should_panic(expected = "can't be given back to the manager")]
    fn recycle_recording() {
        let device = NullDevice::new();
        let mut manager = CommandBufferManager::new(device).unwrap();
        let mut cb = manager.allocate().unwrap();
        cb.begin().unwrap();
        manager.recycle(cb);
    }
}
