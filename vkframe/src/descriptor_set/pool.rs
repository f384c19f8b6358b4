// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    command_buffer::CommandBuffer,
    device::RawDevice,
    sync::CompletionToken,
    VulkanError,
};
use ash::vk;
use foldhash::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Parameters to create a new `DescriptorSetPool`.
#[derive(Clone, Debug)]
pub struct DescriptorPoolCreateInfo {
    /// The maximum number of sets that can ever be allocated from the pool.
    ///
    /// The default value is `4096`.
    pub max_sets: u32,

    /// The number of descriptors of each type the pool holds.
    ///
    /// The default value reserves enough of every common type for `max_sets` sets.
    pub pool_sizes: Vec<(vk::DescriptorType, u32)>,
}

impl Default for DescriptorPoolCreateInfo {
    #[inline]
    fn default() -> Self {
        DescriptorPoolCreateInfo {
            max_sets: 4096,
            pool_sizes: vec![
                (vk::DescriptorType::UNIFORM_BUFFER, 4096),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4096),
                (vk::DescriptorType::STORAGE_BUFFER, 1024),
                (vk::DescriptorType::STORAGE_IMAGE, 1024),
                (vk::DescriptorType::SAMPLED_IMAGE, 1024),
                (vk::DescriptorType::SAMPLER, 256),
            ],
        }
    }
}

#[derive(Debug, Default)]
struct LayoutSets {
    free: Vec<vk::DescriptorSet>,
    // `None` until the set is bound for the first time.
    used: Vec<(vk::DescriptorSet, Option<CompletionToken>)>,
}

#[derive(Debug, Default)]
struct PoolState {
    layouts: HashMap<vk::DescriptorSetLayout, LayoutSets>,
    layout_of: HashMap<vk::DescriptorSet, vk::DescriptorSetLayout>,
}

/// Recycles descriptor sets once the GPU is done with them.
///
/// All sets come out of one underlying pool whose capacity is fixed at creation. Running out of
/// it is reported as [`VulkanError::OutOfPoolMemory`], which callers treat as fatal.
///
/// A set is tagged with the token of the command buffer its bind was recorded into. It goes back
/// to the free list of its layout once [`refresh_fences`](Self::refresh_fences) finds that token
/// reclaimable. The pool is internally synchronized.
#[derive(Debug)]
pub struct DescriptorSetPool {
    device: Arc<dyn RawDevice>,
    pool: vk::DescriptorPool,
    max_sets: u32,
    state: Mutex<PoolState>,
}

impl DescriptorSetPool {
    /// Creates a new `DescriptorSetPool`.
    pub fn new(
        device: Arc<dyn RawDevice>,
        create_info: DescriptorPoolCreateInfo,
    ) -> Result<Self, VulkanError> {
        let pool_sizes: Vec<_> = create_info
            .pool_sizes
            .iter()
            .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect();
        let pool = device.create_descriptor_pool(create_info.max_sets, &pool_sizes)?;

        Ok(DescriptorSetPool {
            device,
            pool,
            max_sets: create_info.max_sets,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Returns a set with the given layout, reusing a free one if there is any.
    ///
    /// The contents of a reused set are whatever was last written to it.
    ///
    /// The set stays used until it is bound (or [marked used](Self::mark_used)) and that
    /// submission completes. A set that ends up not being bound must be given back with
    /// [`release_unbound`](Self::release_unbound), or it holds on to pool capacity forever.
    pub fn allocate(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, VulkanError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let sets = state.layouts.entry(layout).or_default();

        let set = match sets.free.pop() {
            Some(set) => set,
            None => {
                let set = self
                    .device
                    .allocate_descriptor_set(self.pool, layout)
                    .inspect_err(|err| {
                        log::error!(
                            "descriptor pool of {} sets is exhausted: {}",
                            self.max_sets,
                            err,
                        );
                    })?;
                state.layout_of.insert(set, layout);
                log::debug!("new descriptor set ({} allocated)", state.layout_of.len());

                set
            }
        };
        sets.used.push((set, None));

        Ok(set)
    }

    /// Records binding `sets` into `cb`, and tags them with the token of `cb`'s submission.
    ///
    /// # Panics
    ///
    /// - Panics if `cb` is not recording.
    /// - Panics if one of `sets` was not allocated from this pool.
    pub fn bind(
        &self,
        cb: &CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline_layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        let handle = cb.recording_handle();
        self.mark_used(&cb.token(), sets);

        self.device
            .cmd_bind_descriptor_sets(handle, bind_point, pipeline_layout, first_set, sets);
    }

    /// Tags `sets` with `token` without recording anything. This is for sets that are bound in
    /// a secondary command buffer, which is executed by the primary command buffer that `token`
    /// belongs to.
    ///
    /// # Panics
    ///
    /// - Panics if one of `sets` was not allocated from this pool.
    pub fn mark_used(&self, token: &CompletionToken, sets: &[vk::DescriptorSet]) {
        let mut state = self.state.lock();
        let state = &mut *state;

        for set in sets {
            let layout = state
                .layout_of
                .get(set)
                .expect("the descriptor set was not allocated from this pool");
            let (_, last_use) = state
                .layouts
                .get_mut(layout)
                .and_then(|sets| sets.used.iter_mut().find(|(used, _)| used == set))
                .expect("binding a descriptor set that is free");
            *last_use = Some(token.clone());
        }
    }

    /// Gives back sets that were allocated but never bound or marked used.
    ///
    /// # Panics
    ///
    /// - Panics if one of `sets` was not allocated from this pool.
    /// - Panics if one of `sets` is free or was bound.
    pub fn release_unbound(&self, sets: &[vk::DescriptorSet]) {
        let mut state = self.state.lock();
        let state = &mut *state;

        for set in sets {
            let layout = state
                .layout_of
                .get(set)
                .expect("the descriptor set was not allocated from this pool");
            let layout_sets = state
                .layouts
                .get_mut(layout)
                .expect("the descriptor set was not allocated from this pool");
            let index = layout_sets
                .used
                .iter()
                .position(|(used, last_use)| used == set && last_use.is_none())
                .expect("releasing a descriptor set that is free or was bound");

            layout_sets.used.swap_remove(index);
            layout_sets.free.push(*set);
        }
    }

    /// Moves every used set whose last submission has completed back to its free list.
    /// Returns the number of sets freed.
    pub fn refresh_fences(&self) -> usize {
        let mut state = self.state.lock();
        let mut freed = 0;

        for sets in state.layouts.values_mut() {
            let LayoutSets { free, used } = sets;

            used.retain(|(set, last_use)| {
                if last_use.as_ref().is_some_and(CompletionToken::is_reclaimable) {
                    free.push(*set);
                    freed += 1;
                    false
                } else {
                    true
                }
            });
        }

        if freed != 0 {
            log::trace!("{} descriptor sets freed", freed);
        }

        freed
    }

    /// Returns the number of free sets with the given layout.
    pub fn free_count(&self, layout: vk::DescriptorSetLayout) -> usize {
        self.state
            .lock()
            .layouts
            .get(&layout)
            .map_or(0, |sets| sets.free.len())
    }

    /// Returns the number of used sets with the given layout.
    pub fn used_count(&self, layout: vk::DescriptorSetLayout) -> usize {
        self.state
            .lock()
            .layouts
            .get(&layout)
            .map_or(0, |sets| sets.used.len())
    }

    /// Returns whether `set` is in the free list of its layout.
    pub fn is_free(&self, set: vk::DescriptorSet) -> bool {
        let state = self.state.lock();

        state
            .layout_of
            .get(&set)
            .and_then(|layout| state.layouts.get(layout))
            .is_some_and(|sets| sets.free.contains(&set))
    }

    /// Returns the number of sets allocated from the underlying pool.
    pub fn allocated_count(&self) -> usize {
        self.state.lock().layout_of.len()
    }
}

impl Drop for DescriptorSetPool {
    #[inline]
    fn drop(&mut self) {
        // Destroying the pool frees every set allocated from it.
        unsafe { self.device.destroy_descriptor_pool(self.pool) };
    }
}
