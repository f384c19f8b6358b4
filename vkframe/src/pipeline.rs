// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Pipeline state objects.
//!
//! A [`Pso`] is the logical program: its shader stages and the table of bindings the shaders
//! read. It is either [`Pso::Graphics`] or [`Pso::Compute`]. The concrete `VkPipeline`s are
//! created lazily by the [`ObjectCache`](crate::cache::ObjectCache), since a graphics pipeline
//! also depends on the vertex layout, the render pass and the extent it is used with.
//!
//! PSOs live in the [`PsoRegistry`] and are referred to by [`PsoId`]. Ids stay valid for the
//! life of the registry, even when the shaders of a PSO are replaced.

use crate::{device::RawDevice, VulkanError};
use ash::vk;
use smallvec::SmallVec;
use std::{
    ffi::{CStr, CString},
    sync::Arc,
};

/// Identifies a PSO in a [`PsoRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PsoId(u32);

impl PsoId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One attribute of a vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    /// Offset in bytes from the start of the vertex.
    pub offset: u32,
}

/// The layout of the single, per-vertex vertex buffer of a graphics pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: SmallVec<[VertexAttribute; 4]>,
}

impl VertexLayout {
    /// Returns whether the layout has no vertex input at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// A binding of the descriptor set a PSO reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingDesc {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

/// A compiled shader stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderEntry {
    pub module: vk::ShaderModule,
    pub entry_point: CString,
}

/// The layout objects shared by every pipeline created for a PSO.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PsoLayout {
    pub bindings: Vec<BindingDesc>,
    /// Size in bytes of the push constant range, starting at offset 0. Zero if there is none.
    pub push_constant_size: u32,
    pub push_constant_stages: vk::ShaderStageFlags,
    pub set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
}

/// A pipeline state object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pso {
    Graphics {
        vertex: ShaderEntry,
        fragment: ShaderEntry,
        layout: PsoLayout,
    },
    Compute {
        compute: ShaderEntry,
        layout: PsoLayout,
    },
}

impl Pso {
    #[inline]
    pub fn layout(&self) -> &PsoLayout {
        match self {
            Pso::Graphics { layout, .. } | Pso::Compute { layout, .. } => layout,
        }
    }

    #[inline]
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self {
            Pso::Graphics { .. } => vk::PipelineBindPoint::GRAPHICS,
            Pso::Compute { .. } => vk::PipelineBindPoint::COMPUTE,
        }
    }

    fn shaders(&self) -> SmallVec<[&ShaderEntry; 2]> {
        match self {
            Pso::Graphics {
                vertex, fragment, ..
            } => SmallVec::from_buf([vertex, fragment]),
            Pso::Compute { compute, .. } => SmallVec::from_iter([compute]),
        }
    }
}

/// The shader stages of a PSO, without their layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PsoShaders {
    Graphics {
        vertex: ShaderEntry,
        fragment: ShaderEntry,
    },
    Compute {
        compute: ShaderEntry,
    },
}

/// Everything needed to create a graphics `VkPipeline`.
#[derive(Clone, Copy, Debug)]
pub struct GraphicsPipelineState<'a> {
    pub layout: vk::PipelineLayout,
    pub vertex_module: vk::ShaderModule,
    pub vertex_entry: &'a CStr,
    pub fragment_module: vk::ShaderModule,
    pub fragment_entry: &'a CStr,
    pub vertex_layout: &'a VertexLayout,
    pub extent: [u32; 2],
    pub render_pass: vk::RenderPass,
    pub samples: vk::SampleCountFlags,
    pub color_attachment_count: u32,
    pub depth: bool,
    pub wireframe: bool,
}

/// Owns every PSO, together with its shader modules and layout objects.
#[derive(Debug)]
pub struct PsoRegistry {
    device: Arc<dyn RawDevice>,
    psos: Vec<Pso>,
}

impl PsoRegistry {
    #[inline]
    pub fn new(device: Arc<dyn RawDevice>) -> Self {
        PsoRegistry {
            device,
            psos: Vec::new(),
        }
    }

    /// Registers a PSO. The registry takes ownership of the shader modules.
    ///
    /// # Panics
    ///
    /// - Panics if two bindings have the same binding number.
    pub fn register(
        &mut self,
        shaders: PsoShaders,
        bindings: Vec<BindingDesc>,
        push_constant_size: u32,
    ) -> Result<PsoId, VulkanError> {
        for (index, binding) in bindings.iter().enumerate() {
            assert!(
                bindings[..index]
                    .iter()
                    .all(|other| other.binding != binding.binding),
                "binding {} is described twice",
                binding.binding,
            );
        }

        let push_constant_stages = match &shaders {
            PsoShaders::Graphics { .. } => {
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
            }
            PsoShaders::Compute { .. } => vk::ShaderStageFlags::COMPUTE,
        };

        let bindings_vk: SmallVec<[_; 8]> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(binding.stages)
            })
            .collect();
        let set_layout = self.device.create_descriptor_set_layout(&bindings_vk)?;

        let push_constant_ranges: SmallVec<[_; 1]> = (push_constant_size != 0)
            .then_some(vk::PushConstantRange {
                stage_flags: push_constant_stages,
                offset: 0,
                size: push_constant_size,
            })
            .into_iter()
            .collect();
        let pipeline_layout = match self
            .device
            .create_pipeline_layout(&[set_layout], &push_constant_ranges)
        {
            Ok(pipeline_layout) => pipeline_layout,
            Err(err) => {
                unsafe { self.device.destroy_descriptor_set_layout(set_layout) };
                return Err(err);
            }
        };

        let layout = PsoLayout {
            bindings,
            push_constant_size,
            push_constant_stages,
            set_layout,
            pipeline_layout,
        };
        let pso = match shaders {
            PsoShaders::Graphics { vertex, fragment } => Pso::Graphics {
                vertex,
                fragment,
                layout,
            },
            PsoShaders::Compute { compute } => Pso::Compute { compute, layout },
        };

        let id = PsoId(self.psos.len() as u32);
        self.psos.push(pso);

        Ok(id)
    }

    /// Returns the PSO with the given id.
    ///
    /// # Panics
    ///
    /// - Panics if `id` was not returned by this registry.
    #[inline]
    pub fn get(&self, id: PsoId) -> &Pso {
        &self.psos[id.index()]
    }

    /// Replaces the shader modules of a PSO, destroying the old ones. The layout is kept.
    ///
    /// No pipeline created from the old modules may still be alive or in use by the GPU: flush
    /// the [`ObjectCache`](crate::cache::ObjectCache) after an idle-wait first.
    ///
    /// # Panics
    ///
    /// - Panics if `shaders` is not of the same kind as the PSO.
    pub fn replace_shaders(&mut self, id: PsoId, shaders: PsoShaders) {
        let pso = &mut self.psos[id.index()];
        let old = match (&mut *pso, shaders) {
            (
                Pso::Graphics {
                    vertex, fragment, ..
                },
                PsoShaders::Graphics {
                    vertex: new_vertex,
                    fragment: new_fragment,
                },
            ) => [
                Some(std::mem::replace(vertex, new_vertex)),
                Some(std::mem::replace(fragment, new_fragment)),
            ],
            (Pso::Compute { compute, .. }, PsoShaders::Compute { compute: new_compute }) => {
                [Some(std::mem::replace(compute, new_compute)), None]
            }
            _ => panic!("the replacement shaders are not of the same kind as the PSO"),
        };

        for shader in old.into_iter().flatten() {
            unsafe { self.device.destroy_shader_module(shader.module) };
        }
    }

    /// The ids of every registered PSO.
    pub fn ids(&self) -> impl Iterator<Item = PsoId> {
        (0..self.psos.len() as u32).map(PsoId)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.psos.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.psos.is_empty()
    }

    /// Destroys every PSO. The device must be idle and the object cache flushed.
    pub fn destroy(&mut self) {
        for pso in self.psos.drain(..) {
            unsafe {
                for shader in pso.shaders() {
                    self.device.destroy_shader_module(shader.module);
                }
                self.device
                    .destroy_pipeline_layout(pso.layout().pipeline_layout);
                self.device
                    .destroy_descriptor_set_layout(pso.layout().set_layout);
            }
        }
    }
}

impl Drop for PsoRegistry {
    fn drop(&mut self) {
        self.destroy();
    }
}
