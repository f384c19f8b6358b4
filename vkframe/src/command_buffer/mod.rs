// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Recording and submitting command buffers, and knowing when they are done.
//!
//! A [`CommandBuffer`] goes through the following states:
//!
//! ```text
//! ReadyForBegin -> begin -> Begun <-> InsideRenderPass
//!                            |
//!                           end
//!                            v
//! ReadyForBegin <- signal - Submitted <- submit - Ended
//! ```
//!
//! The last transition happens when [`CommandBuffer::refresh_state`] finds that the fence of the
//! submission has signaled, or when [`CommandBuffer::wait_for_fence`] returns. Any other
//! transition is a programming error and panics.
//!
//! The [`CommandBufferManager`] hands out command buffers and takes them back once submitted.
//! It polls the in-flight ones without blocking, and only creates a new command buffer if none
//! has completed.

pub use self::{
    manager::CommandBufferManager,
    secondary::{SecondaryRecorder, SecondaryRecording},
};
use crate::{
    device::{CommandBufferInheritance, RawDevice},
    sync::{CompletionToken, Fence, FenceState},
    VulkanError,
};
use ash::vk;
use smallvec::SmallVec;
use std::sync::Arc;

mod manager;
mod secondary;

/// The state of a [`CommandBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    ReadyForBegin,
    Begun,
    InsideRenderPass,
    Ended,
    Submitted,
}

/// A command buffer together with the fence that guards its submission.
#[derive(Debug)]
pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
    device: Arc<dyn RawDevice>,
    state: CommandBufferState,
    fence: Fence,
    // For secondary command buffers, the submission of the primary they were executed in.
    executed_in: Option<CompletionToken>,
}

impl CommandBuffer {
    /// Allocates a command buffer from `pool`.
    pub fn new(
        device: Arc<dyn RawDevice>,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<CommandBuffer, VulkanError> {
        let handle = device.allocate_command_buffer(pool, level)?;
        let fence = Fence::new(device.clone())?;

        Ok(CommandBuffer {
            handle,
            level,
            device,
            state: CommandBufferState::ReadyForBegin,
            fence,
            executed_in: None,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    #[inline]
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    #[inline]
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Returns a token for the submission this command buffer is being recorded for.
    ///
    /// Resources used by the commands recorded so far must record this token, and may be
    /// reused once it is reclaimable.
    #[inline]
    pub fn token(&self) -> CompletionToken {
        self.fence.token()
    }

    /// Returns the handle to record commands into.
    ///
    /// # Panics
    ///
    /// - Panics if the command buffer is not recording.
    #[inline]
    pub fn recording_handle(&self) -> vk::CommandBuffer {
        assert!(
            matches!(
                self.state,
                CommandBufferState::Begun | CommandBufferState::InsideRenderPass,
            ),
            "the command buffer is not recording (state: {:?})",
            self.state,
        );

        self.handle
    }

    /// Starts recording.
    ///
    /// # Panics
    ///
    /// - Panics if the state is not [`CommandBufferState::ReadyForBegin`].
    /// - Panics if this is a secondary command buffer. Use [`begin_secondary`] instead.
    ///
    /// [`begin_secondary`]: Self::begin_secondary
    pub fn begin(&mut self) -> Result<(), VulkanError> {
        assert_eq!(
            self.level,
            vk::CommandBufferLevel::PRIMARY,
            "secondary command buffers are begun with `begin_secondary`",
        );
        self.expect_state(CommandBufferState::ReadyForBegin, "begin");

        self.device.begin_command_buffer(self.handle, None)?;
        self.state = CommandBufferState::Begun;

        Ok(())
    }

    /// Starts recording a secondary command buffer that continues a render pass.
    ///
    /// # Panics
    ///
    /// - Panics if the state is not [`CommandBufferState::ReadyForBegin`].
    /// - Panics if this is a primary command buffer.
    pub fn begin_secondary(
        &mut self,
        inheritance: &CommandBufferInheritance,
    ) -> Result<(), VulkanError> {
        assert_eq!(
            self.level,
            vk::CommandBufferLevel::SECONDARY,
            "primary command buffers are begun with `begin`",
        );
        self.expect_state(CommandBufferState::ReadyForBegin, "begin");

        self.device
            .begin_command_buffer(self.handle, Some(inheritance))?;
        self.state = CommandBufferState::InsideRenderPass;

        Ok(())
    }

    /// Finishes recording.
    ///
    /// # Panics
    ///
    /// - Panics if the command buffer is not recording, or is inside a render pass it began.
    pub fn end(&mut self) -> Result<(), VulkanError> {
        let expected = if self.level == vk::CommandBufferLevel::SECONDARY {
            CommandBufferState::InsideRenderPass
        } else {
            CommandBufferState::Begun
        };
        self.expect_state(expected, "end");

        self.device.end_command_buffer(self.handle)?;
        self.state = CommandBufferState::Ended;

        Ok(())
    }

    /// Begins a render pass.
    ///
    /// With `contents` set to `SECONDARY_COMMAND_BUFFERS`, the render pass must be filled by
    /// [`execute_secondary`](Self::execute_secondary).
    ///
    /// # Panics
    ///
    /// - Panics if the state is not [`CommandBufferState::Begun`].
    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: [u32; 2],
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    ) {
        self.expect_state(CommandBufferState::Begun, "begin a render pass");

        self.device.cmd_begin_render_pass(
            self.handle,
            render_pass,
            framebuffer,
            extent,
            clear_values,
            contents,
        );
        self.state = CommandBufferState::InsideRenderPass;
    }

    /// Ends the current render pass.
    ///
    /// # Panics
    ///
    /// - Panics if the state is not [`CommandBufferState::InsideRenderPass`].
    pub fn end_render_pass(&mut self) {
        assert_eq!(self.level, vk::CommandBufferLevel::PRIMARY);
        self.expect_state(CommandBufferState::InsideRenderPass, "end a render pass");

        self.device.cmd_end_render_pass(self.handle);
        self.state = CommandBufferState::Begun;
    }

    /// Executes recorded secondary command buffers in the current render pass.
    ///
    /// The secondaries move to [`CommandBufferState::Submitted`] and become reusable once this
    /// command buffer's submission completes.
    ///
    /// # Panics
    ///
    /// - Panics if the state is not [`CommandBufferState::InsideRenderPass`].
    /// - Panics if one of `secondaries` is not an ended secondary command buffer.
    pub fn execute_secondary(&mut self, secondaries: &mut [&mut CommandBuffer]) {
        self.expect_state(CommandBufferState::InsideRenderPass, "execute commands");

        let token = self.token();
        let handles: SmallVec<[_; 4]> = secondaries
            .iter_mut()
            .map(|secondary| {
                assert_eq!(secondary.level, vk::CommandBufferLevel::SECONDARY);
                secondary.expect_state(CommandBufferState::Ended, "be executed");
                secondary.state = CommandBufferState::Submitted;
                secondary.executed_in = Some(token.clone());

                secondary.handle
            })
            .collect();

        self.device.cmd_execute_commands(self.handle, &handles);
    }

    /// Submits the command buffer, guarded by its fence.
    ///
    /// # Panics
    ///
    /// - Panics if the state is not [`CommandBufferState::Ended`].
    /// - Panics if this is a secondary command buffer.
    pub fn submit(
        &mut self,
        queue: vk::Queue,
        wait_semaphores: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal_semaphore: Option<vk::Semaphore>,
    ) -> Result<(), VulkanError> {
        assert_eq!(
            self.level,
            vk::CommandBufferLevel::PRIMARY,
            "secondary command buffers can't be submitted",
        );
        self.expect_state(CommandBufferState::Ended, "submit");

        let signal_semaphores: SmallVec<[_; 1]> = signal_semaphore.into_iter().collect();
        self.device.queue_submit(
            queue,
            self.handle,
            wait_semaphores,
            &signal_semaphores,
            self.fence.handle(),
        )?;
        self.state = CommandBufferState::Submitted;

        Ok(())
    }

    /// Polls the fence of a submitted command buffer without blocking. If the submission has
    /// completed, the command buffer is reset and returns to
    /// [`CommandBufferState::ReadyForBegin`].
    ///
    /// Returns whether the command buffer is ready to begin.
    pub fn refresh_state(&mut self) -> Result<bool, VulkanError> {
        if self.state != CommandBufferState::Submitted {
            return Ok(self.state == CommandBufferState::ReadyForBegin);
        }

        let completed = match &self.executed_in {
            Some(token) => token.is_reclaimable(),
            None => self.fence.poll()?,
        };

        if completed {
            self.recycle()?;
        }

        Ok(completed)
    }

    /// Blocks until the submission of this command buffer has completed, then resets it.
    ///
    /// Does nothing if the command buffer is not submitted.
    ///
    /// # Panics
    ///
    /// - Panics if this is a secondary command buffer whose primary is still pending.
    pub fn wait_for_fence(&mut self) -> Result<(), VulkanError> {
        if self.state != CommandBufferState::Submitted {
            return Ok(());
        }

        if let Some(token) = &self.executed_in {
            assert!(
                token.is_reclaimable(),
                "a secondary command buffer is waited for through its primary",
            );
        } else {
            self.fence.wait(None)?;
        }

        self.recycle()
    }

    /// Throws away what was recorded so far, returning an unsubmitted command buffer to
    /// [`CommandBufferState::ReadyForBegin`]. Used when recording or submission fails halfway.
    ///
    /// # Panics
    ///
    /// - Panics if the command buffer is submitted.
    pub fn discard(&mut self) -> Result<(), VulkanError> {
        assert_ne!(
            self.state,
            CommandBufferState::Submitted,
            "can't discard a submitted command buffer",
        );

        if self.state != CommandBufferState::ReadyForBegin {
            self.device.reset_command_buffer(self.handle)?;
            self.state = CommandBufferState::ReadyForBegin;
        }

        Ok(())
    }

    fn recycle(&mut self) -> Result<(), VulkanError> {
        debug_assert_eq!(self.state, CommandBufferState::Submitted);

        if self.executed_in.take().is_none() {
            debug_assert_eq!(self.fence.state(), FenceState::Signaled);
            self.fence.reset()?;
        }

        self.device.reset_command_buffer(self.handle)?;
        self.state = CommandBufferState::ReadyForBegin;

        Ok(())
    }

    #[inline]
    #[track_caller]
    fn expect_state(&self, expected: CommandBufferState, action: &str) {
        assert_eq!(
            self.state, expected,
            "can't {} a command buffer in the {:?} state",
            action, self.state,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::null::{NullDevice, RecordedCommand};

    fn command_buffer(device: &Arc<NullDevice>, level: vk::CommandBufferLevel) -> CommandBuffer {
        let pool = device.create_command_pool(0).unwrap();
        CommandBuffer::new(device.clone(), pool, level).unwrap()
    }

    #[test]
    fn full_cycle() {
        let device = NullDevice::new();
        let mut cb = command_buffer(&device, vk::CommandBufferLevel::PRIMARY);
        let queue = device.queue().handle;

        assert_eq!(cb.state(), CommandBufferState::ReadyForBegin);
        cb.begin().unwrap();
        cb.begin_render_pass(
            vk::RenderPass::null(),
            vk::Framebuffer::null(),
            [256, 256],
            &[],
            vk::SubpassContents::INLINE,
        );
        assert_eq!(cb.state(), CommandBufferState::InsideRenderPass);
        cb.end_render_pass();
        cb.end().unwrap();

        let token = cb.token();
        cb.submit(queue, &[], None).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Submitted);

        // Not done yet.
        assert!(!cb.refresh_state().unwrap());
        assert!(!token.is_reclaimable());

        device.complete_submissions();
        assert!(cb.refresh_state().unwrap());
        assert_eq!(cb.state(), CommandBufferState::ReadyForBegin);
        assert!(token.is_reclaimable());

        // Reusable.
        cb.begin().unwrap();
        cb.end().unwrap();
        cb.submit(queue, &[], None).unwrap();
        cb.wait_for_fence().unwrap();
        assert_eq!(cb.state(), CommandBufferState::ReadyForBegin);
        assert_eq!(device.submission_count(), 2);
    }

    #[test]
    #[should_panic(expected = "can't begin a command buffer in the Begun state")]
    fn begin_twice() {
        let device = NullDevice::new();
        let mut cb = command_buffer(&device, vk::CommandBufferLevel::PRIMARY);

        cb.begin().unwrap();
        let _ = cb.begin();
    }

    #[test]
    #[should_panic(expected = "can't begin a command buffer in the Submitted state")]
    fn begin_while_submitted() {
        let device = NullDevice::new();
        let mut cb = command_buffer(&device, vk::CommandBufferLevel::PRIMARY);

        cb.begin().unwrap();
        cb.end().unwrap();
        cb.submit(device.queue().handle, &[], None).unwrap();
        let _ = cb.begin();
    }

    #[test]
    #[should_panic(expected = "can't submit a command buffer in the Begun state")]
    fn submit_unended() {
        let device = NullDevice::new();
        let mut cb = command_buffer(&device, vk::CommandBufferLevel::PRIMARY);

        cb.begin().unwrap();
        let _ = cb.submit(device.queue().handle, &[], None);
    }

    #[test]
    #[should_panic(expected = "can't end a command buffer in the InsideRenderPass state")]
    fn end_inside_render_pass() {
        let device = NullDevice::new();
        let mut cb = command_buffer(&device, vk::CommandBufferLevel::PRIMARY);

        cb.begin().unwrap();
        cb.begin_render_pass(
            vk::RenderPass::null(),
            vk::Framebuffer::null(),
            [1, 1],
            &[],
            vk::SubpassContents::INLINE,
        );
        let _ = cb.end();
    }

    #[test]
    fn failed_submission_is_discarded() {
        let device = NullDevice::new();
        let mut cb = command_buffer(&device, vk::CommandBufferLevel::PRIMARY);
        let queue = device.queue().handle;

        cb.begin().unwrap();
        cb.end().unwrap();
        device.fail_next_submission(VulkanError::DeviceLost);
        assert_eq!(cb.submit(queue, &[], None), Err(VulkanError::DeviceLost));
        assert_eq!(cb.state(), CommandBufferState::Ended);

        cb.discard().unwrap();
        assert_eq!(cb.state(), CommandBufferState::ReadyForBegin);

        cb.begin().unwrap();
        cb.end().unwrap();
        cb.submit(queue, &[], None).unwrap();
        assert_eq!(device.submission_count(), 1);
    }

    #[test]
    #[should_panic(expected = "can't discard a submitted command buffer")]
    fn discard_submitted() {
        let device = NullDevice::new();
        let mut cb = command_buffer(&device, vk::CommandBufferLevel::PRIMARY);

        cb.begin().unwrap();
        cb.end().unwrap();
        cb.submit(device.queue().handle, &[], None).unwrap();
        let _ = cb.discard();
    }

    #[test]
    #[should_panic(expected = "is not recording")]
    fn record_outside_recording() {
        let device = NullDevice::new();
        let cb = command_buffer(&device, vk::CommandBufferLevel::PRIMARY);
        cb.recording_handle();
    }

    #[test]
    fn secondary_follows_its_primary() {
        let device = NullDevice::new();
        let mut primary = command_buffer(&device, vk::CommandBufferLevel::PRIMARY);
        let mut secondary = command_buffer(&device, vk::CommandBufferLevel::SECONDARY);

        secondary
            .begin_secondary(&CommandBufferInheritance {
                render_pass: vk::RenderPass::null(),
                subpass: 0,
                framebuffer: vk::Framebuffer::null(),
            })
            .unwrap();
        secondary.end().unwrap();

        primary.begin().unwrap();
        primary.begin_render_pass(
            vk::RenderPass::null(),
            vk::Framebuffer::null(),
            [1, 1],
            &[],
            vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
        );
        primary.execute_secondary(&mut [&mut secondary]);
        primary.end_render_pass();
        primary.end().unwrap();
        primary.submit(device.queue().handle, &[], None).unwrap();

        assert!(device
            .recorded_commands(primary.handle())
            .contains(&RecordedCommand::ExecuteCommands(1)));
        assert!(!secondary.refresh_state().unwrap());

        device.complete_submissions();
        // The secondary only learns about completion through the primary's fence.
        assert!(!secondary.refresh_state().unwrap());
        assert!(primary.refresh_state().unwrap());
        assert!(secondary.refresh_state().unwrap());
    }
}
