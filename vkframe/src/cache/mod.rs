// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Memoization of render passes, framebuffers and pipelines.
//!
//! Each object is looked up by a structural key and created on a miss. Keys compare by value,
//! except that a pipeline key names its program by [`PsoId`]: replacing the shaders of a PSO does
//! not invalidate the pipelines created from it. The whole cache has to be
//! [`destroy`](ObjectCache::destroy)ed (after an idle-wait) before shaders are reloaded, and when
//! the swapchain is resized.

use crate::{
    device::RawDevice,
    pipeline::{GraphicsPipelineState, Pso, PsoId, PsoRegistry, VertexLayout},
    VulkanError,
};
use ash::vk;
use foldhash::HashMap;
use smallvec::SmallVec;
use std::sync::Arc;

/// The structural description of a render pass with a single subpass.
///
/// Attachments are ordered: color attachments, then the depth attachment if there is one, then
/// one resolve attachment per color attachment if the pass is multisampled. Every attachment
/// starts and ends in its attachment-optimal layout; transitions are recorded outside the pass.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub extent: [u32; 2],
    pub color_formats: SmallVec<[vk::Format; 4]>,
    pub depth_format: Option<vk::Format>,
    pub samples: vk::SampleCountFlags,
    /// Either empty, or one format per color attachment.
    pub resolve_formats: SmallVec<[vk::Format; 4]>,
}

impl RenderPassKey {
    /// Returns the number of attachments of the render pass.
    #[inline]
    pub fn attachment_count(&self) -> usize {
        self.color_formats.len() + self.depth_format.is_some() as usize + self.resolve_formats.len()
    }
}

/// Identifies a framebuffer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub render_pass: vk::RenderPass,
    /// In the order of the render pass attachments.
    pub attachments: SmallVec<[vk::ImageView; 8]>,
    pub extent: [u32; 2],
}

/// Identifies a graphics pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineKey {
    pub pso: PsoId,
    pub vertex_layout: VertexLayout,
    pub extent: [u32; 2],
    pub render_pass: vk::RenderPass,
    pub wireframe: bool,
}

/// Number of objects of each kind in an [`ObjectCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub render_passes: usize,
    pub framebuffers: usize,
    pub graphics_pipelines: usize,
    pub compute_pipelines: usize,
}

/// Memoizes render passes, framebuffers and pipelines.
///
/// The cache is owned by the thread that records frames and is not synchronized.
#[derive(Debug)]
pub struct ObjectCache {
    device: Arc<dyn RawDevice>,
    render_passes: HashMap<RenderPassKey, vk::RenderPass>,
    // Reverse lookup, to know the attachments of a pass a pipeline is created for.
    render_pass_keys: HashMap<vk::RenderPass, RenderPassKey>,
    framebuffers: HashMap<FramebufferKey, vk::Framebuffer>,
    graphics_pipelines: HashMap<GraphicsPipelineKey, vk::Pipeline>,
    compute_pipelines: HashMap<PsoId, vk::Pipeline>,
}

impl ObjectCache {
    pub fn new(device: Arc<dyn RawDevice>) -> Self {
        ObjectCache {
            device,
            render_passes: HashMap::default(),
            render_pass_keys: HashMap::default(),
            framebuffers: HashMap::default(),
            graphics_pipelines: HashMap::default(),
            compute_pipelines: HashMap::default(),
        }
    }

    /// Returns the render pass matching `key`, creating it on a miss.
    ///
    /// # Panics
    ///
    /// - Panics if `key.resolve_formats` is neither empty nor as long as `key.color_formats`.
    /// - Panics if `key` has resolve attachments but is not multisampled.
    pub fn get_or_create_render_pass(
        &mut self,
        key: &RenderPassKey,
    ) -> Result<vk::RenderPass, VulkanError> {
        if let Some(&render_pass) = self.render_passes.get(key) {
            return Ok(render_pass);
        }

        assert!(
            key.resolve_formats.is_empty() || key.resolve_formats.len() == key.color_formats.len(),
            "a render pass resolves either none or all of its color attachments",
        );
        assert!(
            key.resolve_formats.is_empty() || key.samples != vk::SampleCountFlags::TYPE_1,
            "only multisampled render passes have resolve attachments",
        );

        let render_pass = self.device.create_render_pass(key)?;
        log::debug!("render pass cache miss: {:?}", key);

        self.render_passes.insert(key.clone(), render_pass);
        self.render_pass_keys.insert(render_pass, key.clone());

        Ok(render_pass)
    }

    /// Returns the framebuffer matching `key`, creating it on a miss.
    ///
    /// # Panics
    ///
    /// - Panics if `key.render_pass` was not created by this cache.
    /// - Panics if the number of attachments does not match the render pass.
    pub fn get_or_create_framebuffer(
        &mut self,
        key: &FramebufferKey,
    ) -> Result<vk::Framebuffer, VulkanError> {
        if let Some(&framebuffer) = self.framebuffers.get(key) {
            return Ok(framebuffer);
        }

        let render_pass_key = self.render_pass_key(key.render_pass);
        assert_eq!(
            key.attachments.len(),
            render_pass_key.attachment_count(),
            "the framebuffer does not have as many attachments as its render pass",
        );

        let framebuffer =
            self.device
                .create_framebuffer(key.render_pass, &key.attachments, key.extent)?;
        log::debug!(
            "framebuffer cache miss: {} attachments, {:?}",
            key.attachments.len(),
            key.extent,
        );
        self.framebuffers.insert(key.clone(), framebuffer);

        Ok(framebuffer)
    }

    /// Returns the graphics pipeline matching `key`, creating it on a miss.
    ///
    /// # Panics
    ///
    /// - Panics if `key.pso` is not a graphics PSO of `registry`.
    /// - Panics if `key.render_pass` was not created by this cache.
    pub fn get_or_create_graphics_pipeline(
        &mut self,
        registry: &PsoRegistry,
        key: &GraphicsPipelineKey,
    ) -> Result<vk::Pipeline, VulkanError> {
        if let Some(&pipeline) = self.graphics_pipelines.get(key) {
            return Ok(pipeline);
        }

        let Pso::Graphics {
            vertex,
            fragment,
            layout,
        } = registry.get(key.pso)
        else {
            panic!("{:?} is not a graphics PSO", key.pso);
        };
        let render_pass_key = self.render_pass_key(key.render_pass);

        let pipeline = self
            .device
            .create_graphics_pipeline(&GraphicsPipelineState {
                layout: layout.pipeline_layout,
                vertex_module: vertex.module,
                vertex_entry: &vertex.entry_point,
                fragment_module: fragment.module,
                fragment_entry: &fragment.entry_point,
                vertex_layout: &key.vertex_layout,
                extent: key.extent,
                render_pass: key.render_pass,
                samples: render_pass_key.samples,
                color_attachment_count: render_pass_key.color_formats.len() as u32,
                depth: render_pass_key.depth_format.is_some(),
                wireframe: key.wireframe,
            })?;
        log::debug!(
            "graphics pipeline cache miss: {:?}, {:?}, wireframe: {}",
            key.pso,
            key.extent,
            key.wireframe,
        );
        self.graphics_pipelines.insert(key.clone(), pipeline);

        Ok(pipeline)
    }

    /// Returns the compute pipeline of `pso`, creating it on a miss.
    ///
    /// # Panics
    ///
    /// - Panics if `pso` is not a compute PSO of `registry`.
    pub fn get_or_create_compute_pipeline(
        &mut self,
        registry: &PsoRegistry,
        pso: PsoId,
    ) -> Result<vk::Pipeline, VulkanError> {
        if let Some(&pipeline) = self.compute_pipelines.get(&pso) {
            return Ok(pipeline);
        }

        let Pso::Compute { compute, layout } = registry.get(pso) else {
            panic!("{:?} is not a compute PSO", pso);
        };

        let pipeline = self.device.create_compute_pipeline(
            layout.pipeline_layout,
            compute.module,
            &compute.entry_point,
        )?;
        log::debug!("compute pipeline cache miss: {:?}", pso);
        self.compute_pipelines.insert(pso, pipeline);

        Ok(pipeline)
    }

    fn render_pass_key(&self, render_pass: vk::RenderPass) -> &RenderPassKey {
        self.render_pass_keys
            .get(&render_pass)
            .expect("the render pass was not created by this cache")
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            render_passes: self.render_passes.len(),
            framebuffers: self.framebuffers.len(),
            graphics_pipelines: self.graphics_pipelines.len(),
            compute_pipelines: self.compute_pipelines.len(),
        }
    }

    /// Returns the total number of cached objects.
    pub fn len(&self) -> usize {
        self.render_passes.len()
            + self.framebuffers.len()
            + self.graphics_pipelines.len()
            + self.compute_pipelines.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroys every cached object: pipelines first, then framebuffers, then render passes.
    ///
    /// The GPU must not be using any of them.
    pub fn destroy(&mut self) {
        if !self.is_empty() {
            log::debug!("flushing object cache: {:?}", self.stats());
        }

        unsafe {
            for (_, pipeline) in self.graphics_pipelines.drain() {
                self.device.destroy_pipeline(pipeline);
            }
            for (_, pipeline) in self.compute_pipelines.drain() {
                self.device.destroy_pipeline(pipeline);
            }
            for (_, framebuffer) in self.framebuffers.drain() {
                self.device.destroy_framebuffer(framebuffer);
            }
            for (_, render_pass) in self.render_passes.drain() {
                self.device.destroy_render_pass(render_pass);
            }
        }

        self.render_pass_keys.clear();
    }
}

impl Drop for ObjectCache {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::null::NullDevice,
        pipeline::{PsoShaders, ShaderEntry, VertexAttribute},
    };
    use ash::vk::Handle;
    use smallvec::smallvec;
    use std::ffi::CString;

    fn key(samples: vk::SampleCountFlags) -> RenderPassKey {
        RenderPassKey {
            extent: [256, 256],
            color_formats: smallvec![vk::Format::R8G8B8A8_UNORM],
            depth_format: Some(vk::Format::D32_SFLOAT),
            samples,
            resolve_formats: SmallVec::new(),
        }
    }

    #[test]
    fn render_pass_idempotence() {
        let device = NullDevice::new();
        let mut cache = ObjectCache::new(device.clone());

        let first = cache
            .get_or_create_render_pass(&key(vk::SampleCountFlags::TYPE_1))
            .unwrap();
        let second = cache
            .get_or_create_render_pass(&key(vk::SampleCountFlags::TYPE_1))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(device.live_object_count_of("render pass"), 1);

        let multisampled = cache
            .get_or_create_render_pass(&RenderPassKey {
                resolve_formats: smallvec![vk::Format::R8G8B8A8_UNORM],
                ..key(vk::SampleCountFlags::TYPE_4)
            })
            .unwrap();
        let multisampled_unresolved = cache
            .get_or_create_render_pass(&key(vk::SampleCountFlags::TYPE_4))
            .unwrap();
        assert_ne!(first, multisampled);
        assert_ne!(multisampled, multisampled_unresolved);
        assert_eq!(cache.stats().render_passes, 3);
    }

    #[test]
    fn pipelines_and_framebuffers_are_memoized() {
        let device = NullDevice::new();
        let mut registry = PsoRegistry::new(device.clone());
        let mut cache = ObjectCache::new(device.clone());

        let pso = registry
            .register(
                PsoShaders::Graphics {
                    vertex: ShaderEntry {
                        module: device.create_shader_module(&[1]).unwrap(),
                        entry_point: CString::new("main").unwrap(),
                    },
                    fragment: ShaderEntry {
                        module: device.create_shader_module(&[1]).unwrap(),
                        entry_point: CString::new("main").unwrap(),
                    },
                },
                Vec::new(),
                64,
            )
            .unwrap();
        let render_pass = cache
            .get_or_create_render_pass(&key(vk::SampleCountFlags::TYPE_1))
            .unwrap();

        let pipeline_key = GraphicsPipelineKey {
            pso,
            vertex_layout: VertexLayout {
                stride: 12,
                attributes: smallvec![VertexAttribute {
                    location: 0,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 0,
                }],
            },
            extent: [256, 256],
            render_pass,
            wireframe: false,
        };
        let solid = cache
            .get_or_create_graphics_pipeline(&registry, &pipeline_key)
            .unwrap();
        assert_eq!(
            cache
                .get_or_create_graphics_pipeline(&registry, &pipeline_key.clone())
                .unwrap(),
            solid,
        );
        let wireframe = cache
            .get_or_create_graphics_pipeline(
                &registry,
                &GraphicsPipelineKey {
                    wireframe: true,
                    ..pipeline_key
                },
            )
            .unwrap();
        assert_ne!(solid, wireframe);

        let framebuffer_key = FramebufferKey {
            render_pass,
            attachments: smallvec![vk::ImageView::from_raw(1), vk::ImageView::from_raw(2)],
            extent: [256, 256],
        };
        let framebuffer = cache.get_or_create_framebuffer(&framebuffer_key).unwrap();
        assert_eq!(
            cache.get_or_create_framebuffer(&framebuffer_key).unwrap(),
            framebuffer,
        );

        assert_eq!(
            cache.stats(),
            CacheStats {
                render_passes: 1,
                framebuffers: 1,
                graphics_pipelines: 2,
                compute_pipelines: 0,
            },
        );

        cache.destroy();
        assert!(cache.is_empty());
        assert_eq!(device.live_object_count_of("pipeline"), 0);
        assert_eq!(device.live_object_count_of("framebuffer"), 0);
        assert_eq!(device.live_object_count_of("render pass"), 0);
    }

    #[test]
    #[should_panic(expected = "is not a compute PSO")]
    fn compute_pipeline_of_graphics_pso() {
        let device = NullDevice::new();
        let mut registry = PsoRegistry::new(device.clone());
        let mut cache = ObjectCache::new(device.clone());
        let pso = registry
            .register(
                PsoShaders::Graphics {
                    vertex: ShaderEntry {
                        module: device.create_shader_module(&[1]).unwrap(),
                        entry_point: CString::new("main").unwrap(),
                    },
                    fragment: ShaderEntry {
                        module: device.create_shader_module(&[1]).unwrap(),
                        entry_point: CString::new("main").unwrap(),
                    },
                },
                Vec::new(),
                0,
            )
            .unwrap();

        let _ = cache.get_or_create_compute_pipeline(&registry, pso);
    }

    #[test]
    #[should_panic(expected = "does not have as many attachments")]
    fn framebuffer_attachment_mismatch() {
        let device = NullDevice::new();
        let mut cache = ObjectCache::new(device);
        let render_pass = cache
            .get_or_create_render_pass(&key(vk::SampleCountFlags::TYPE_1))
            .unwrap();

        let _ = cache.get_or_create_framebuffer(&FramebufferKey {
            render_pass,
            attachments: smallvec![vk::ImageView::null()],
            extent: [256, 256],
        });
    }
}
