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
    device::{CommandBufferInheritance, RawDevice},
    sync::Handoff,
    VulkanError,
};
use ash::vk;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

/// A function that records commands into a secondary command buffer on the worker thread.
pub type SecondaryRecording = Box<dyn FnOnce(&dyn RawDevice, vk::CommandBuffer) + Send>;

struct Job {
    command_buffer: vk::CommandBuffer,
    inheritance: CommandBufferInheritance,
    record: SecondaryRecording,
}

/// A worker thread that records secondary command buffers on behalf of the frame thread.
///
/// The frame thread hands one job over and waits for it to be done before going on, so there is
/// never more than one job outstanding.
pub struct SecondaryRecorder {
    device: Arc<dyn RawDevice>,
    start: Arc<Handoff<Option<Job>>>,
    // A panic while recording is carried back and resumed on the frame thread.
    done: Arc<Handoff<thread::Result<Result<(), VulkanError>>>>,
    thread: Option<JoinHandle<()>>,
}

impl SecondaryRecorder {
    /// Spawns the worker thread.
    pub fn new(device: Arc<dyn RawDevice>) -> std::io::Result<Self> {
        let start = Arc::new(Handoff::<Option<Job>>::new());
        let done = Arc::new(Handoff::new());

        let thread = {
            let device = device.clone();
            let (start, done) = (start.clone(), done.clone());

            thread::Builder::new()
                .name("vkframe-secondary".to_owned())
                .spawn(move || {
                    while let Some(job) = start.take() {
                        done.put(panic::catch_unwind(AssertUnwindSafe(|| run(&*device, job))));
                    }
                })?
        };

        Ok(SecondaryRecorder {
            device,
            start,
            done,
            thread: Some(thread),
        })
    }

    /// Records `secondary` on the worker thread with `record`, and waits until it is done.
    ///
    /// On success the command buffer is [`CommandBufferState::Ended`] and can be passed to
    /// [`CommandBuffer::execute_secondary`].
    ///
    /// # Panics
    ///
    /// - Panics if `secondary` is not a secondary command buffer ready to begin.
    /// - Panics if the worker thread is gone.
    /// - Panics with the same payload if `record` panics. The worker survives it.
    pub fn record(
        &self,
        secondary: &mut CommandBuffer,
        inheritance: CommandBufferInheritance,
        record: SecondaryRecording,
    ) -> Result<(), VulkanError> {
        assert_eq!(secondary.level(), vk::CommandBufferLevel::SECONDARY);
        assert_eq!(secondary.state(), CommandBufferState::ReadyForBegin);
        assert!(
            self.thread.as_ref().is_some_and(|thread| !thread.is_finished()),
            "the secondary recording thread is gone",
        );

        self.start.put(Some(Job {
            command_buffer: secondary.handle(),
            inheritance,
            record,
        }));
        match self.done.take() {
            Ok(result) => result?,
            Err(payload) => {
                // The handle may have been left recording.
                if let Err(err) = self.device.reset_command_buffer(secondary.handle()) {
                    log::error!("failed to reset a secondary command buffer: {}", err);
                }
                panic::resume_unwind(payload)
            }
        }

        // The worker did the begin/end calls on the handle; mirror them in the state.
        secondary.state = CommandBufferState::Ended;

        Ok(())
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }
}

fn run(device: &dyn RawDevice, job: Job) -> Result<(), VulkanError> {
    device.begin_command_buffer(job.command_buffer, Some(&job.inheritance))?;
    (job.record)(device, job.command_buffer);
    device.end_command_buffer(job.command_buffer)
}

impl Drop for SecondaryRecorder {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.start.put(None);

            if thread.join().is_err() {
                log::error!("the secondary recording thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for SecondaryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryRecorder")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command_buffer::CommandBufferManager,
        device::null::{NullDevice, RecordedCommand},
    };

    #[test]
    fn records_on_the_worker() {
        let device = NullDevice::new();
        let mut manager = CommandBufferManager::new(device.clone()).unwrap();
        let recorder = SecondaryRecorder::new(device.clone()).unwrap();

        let inheritance = CommandBufferInheritance {
            render_pass: vk::RenderPass::null(),
            subpass: 0,
            framebuffer: vk::Framebuffer::null(),
        };

        for round in 0..3u32 {
            let mut secondary = manager.allocate_secondary().unwrap();
            recorder
                .record(
                    &mut secondary,
                    inheritance,
                    Box::new(move |device: &dyn RawDevice, cb: vk::CommandBuffer| {
                        device.cmd_draw_indexed(cb, 3 * (round + 1), 1)
                    }),
                )
                .unwrap();
            assert_eq!(secondary.state(), CommandBufferState::Ended);
            assert!(device
                .recorded_commands(secondary.handle())
                .contains(&RecordedCommand::DrawIndexed(3 * (round + 1))));

            let mut primary = manager.allocate().unwrap();
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
            primary.submit(manager.queue().handle, &[], None).unwrap();
            manager.recycle(primary);
            manager.recycle(secondary);

            device.complete_submissions();
        }

        manager.wait_idle().unwrap();
        // One secondary was enough since each round completes before the next.
        assert_eq!(manager.created_count(), 2);
    }

    #[test]
    fn panic_while_recording_reaches_the_caller() {
        let device = NullDevice::new();
        let mut manager = CommandBufferManager::new(device.clone()).unwrap();
        let recorder = SecondaryRecorder::new(device.clone()).unwrap();

        let inheritance = CommandBufferInheritance {
            render_pass: vk::RenderPass::null(),
            subpass: 0,
            framebuffer: vk::Framebuffer::null(),
        };

        let mut secondary = manager.allocate_secondary().unwrap();
        let payload = panic::catch_unwind(AssertUnwindSafe(|| {
            recorder.record(
                &mut secondary,
                inheritance,
                Box::new(|_: &dyn RawDevice, _: vk::CommandBuffer| panic!("recording failed")),
            )
        }))
        .unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"recording failed"));
        assert_eq!(secondary.state(), CommandBufferState::ReadyForBegin);

        // The worker is still there for the next job.
        let mut next = manager.allocate_secondary().unwrap();
        recorder
            .record(
                &mut next,
                inheritance,
                Box::new(|device: &dyn RawDevice, cb: vk::CommandBuffer| {
                    device.cmd_draw_indexed(cb, 6, 1)
                }),
            )
            .unwrap();
        assert_eq!(next.state(), CommandBufferState::Ended);
        assert!(device
            .recorded_commands(next.handle())
            .contains(&RecordedCommand::DrawIndexed(6)));
    }
}
