// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The surface a windowing host talks to.
//!
//! The host creates a [`Renderer`] for its window, fills a [`FrameControls`] from its input
//! every frame and calls [`Renderer::render_frame`], forwards size changes to
//! [`Renderer::resize`], and drops the renderer (or calls [`Renderer::shutdown`]) when it exits.
//!
//! The scene is a list of indexed meshes, each sampling one texture. Meshes come from the
//! outside as vertex and index arrays; the renderer only owns their GPU side.

use crate::{
    cache::{FramebufferKey, GraphicsPipelineKey, RenderPassKey},
    command_buffer::CommandBuffer,
    context::{RenderContext, RenderContextCreateInfo},
    descriptor_set::{DescriptorWrite, DescriptorWrites},
    device::{
        vulkan::{DeviceConfig, DeviceCreationError, VulkanDevice},
        CommandBufferInheritance, RawDevice,
    },
    memory::MemoryAllocatorError,
    pipeline::{BindingDesc, PsoId, PsoShaders, ShaderEntry, VertexAttribute, VertexLayout},
    render_target::{record_transition, record_transition_after, RenderTargetDesc},
    resource::{Buffer, BufferCreateInfo, Image, ImageCreateInfo},
    shader::{ShaderCompiler, ShaderError, ShaderStage},
    swapchain::Swapchain,
    sync::{CompletionToken, Semaphore},
    VulkanError,
};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use foldhash::HashMap;
use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};
use log::{debug, info, warn};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use smallvec::{smallvec, SmallVec};
use std::{
    error::Error,
    ffi::CString,
    fmt::{self, Display},
    path::PathBuf,
    sync::Arc,
};

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;
const FALLBACK_TEXTURE: usize = 0;
// Covers the mip chain of a 32768 texel wide texture.
const SAMPLER_MIP_LEVELS: u32 = 16;

/// Where the mesh shaders come from.
#[derive(Clone, Debug)]
pub enum ShaderSource {
    /// `mesh.vert` and `mesh.frag` in `dir`, compiled with `compiler`. Hot reloading recompiles
    /// them.
    Glsl { compiler: ShaderCompiler, dir: PathBuf },

    /// Precompiled SPIR-V words.
    SpirV {
        vertex: Vec<u32>,
        fragment: Vec<u32>,
    },
}

impl Default for ShaderSource {
    fn default() -> Self {
        ShaderSource::Glsl {
            compiler: ShaderCompiler::new(
                "glslangValidator",
                std::env::temp_dir().join("vkframe-shader-cache"),
            ),
            dir: PathBuf::from("shaders"),
        }
    }
}

/// Parameters to create a [`Renderer`].
#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub device: DeviceConfig,

    pub context: RenderContextCreateInfo,

    pub shaders: ShaderSource,

    /// The sample count used when [`FrameControls::msaa`] is on.
    ///
    /// The default value is `TYPE_4`.
    pub msaa_samples: vk::SampleCountFlags,

    /// How many frames the CPU may record ahead of the GPU.
    ///
    /// The default value is `2`.
    pub frames_in_flight: usize,

    /// The default value is a dark grey.
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    #[inline]
    fn default() -> Self {
        RendererConfig {
            device: DeviceConfig::default(),
            context: RenderContextCreateInfo::default(),
            shaders: ShaderSource::default(),
            msaa_samples: vk::SampleCountFlags::TYPE_4,
            frames_in_flight: 2,
            clear_color: [0.1, 0.1, 0.12, 1.0],
        }
    }
}

/// What the fragment shader outputs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ViewMode {
    #[default]
    Lit,
    Normals,
    TexCoords,
    /// Lit, rasterized as lines where the device supports it.
    Wireframe,
}

impl ViewMode {
    /// Cycles to the next mode.
    pub fn next(self) -> Self {
        match self {
            ViewMode::Lit => ViewMode::Normals,
            ViewMode::Normals => ViewMode::TexCoords,
            ViewMode::TexCoords => ViewMode::Wireframe,
            ViewMode::Wireframe => ViewMode::Lit,
        }
    }

    fn shader_index(self) -> u32 {
        match self {
            ViewMode::Lit | ViewMode::Wireframe => 0,
            ViewMode::Normals => 1,
            ViewMode::TexCoords => 2,
        }
    }
}

/// The per-frame input of the host.
///
/// The camera deltas are applied once by [`Renderer::render_frame`]; the host resets them
/// before filling in the next frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameControls {
    pub view_mode: ViewMode,
    pub msaa: bool,
    /// Movement along the camera's right, up and forward axes.
    pub camera_step: Vec3,
    /// Yaw and pitch deltas in radians.
    pub camera_rotation: Vec2,
}

/// A first-person camera looking down its forward axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    /// Vertical field of view in radians.
    pub fov_y: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Camera {
            position: Vec3::new(0.0, 0.0, 3.0),
            yaw: 0.0,
            pitch: 0.0,
            fov_y: 60f32.to_radians(),
        }
    }
}

impl Camera {
    const MAX_PITCH: f32 = 1.5;

    /// The unit vector the camera looks along. Yaw 0 looks down -Z.
    pub fn forward(&self) -> Vec3 {
        Vec3::new(
            self.yaw.sin() * self.pitch.cos(),
            self.pitch.sin(),
            -self.yaw.cos() * self.pitch.cos(),
        )
    }

    /// Rotates, then moves along the rotated axes.
    pub fn apply(&mut self, step: Vec3, rotation: Vec2) {
        self.yaw += rotation.x;
        self.pitch = (self.pitch + rotation.y).clamp(-Self::MAX_PITCH, Self::MAX_PITCH);

        let forward = self.forward();
        let right = forward.cross(Vec3::Y).normalize();
        self.position += right * step.x + Vec3::Y * step.y + forward * step.z;
    }

    /// Projection times view, with Vulkan's downward Y and a `[0, 1]` depth range.
    pub fn view_projection(&self, aspect_ratio: f32) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov_y, aspect_ratio, 0.1, 100.0);
        projection.y_axis.y *= -1.0;

        projection * Mat4::look_to_rh(self.position, self.forward(), Vec3::Y)
    }
}

/// The vertex format of every mesh.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub fn layout() -> VertexLayout {
        VertexLayout {
            stride: size_of::<Vertex>() as u32,
            attributes: smallvec![
                VertexAttribute {
                    location: 0,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 12,
                },
                VertexAttribute {
                    location: 2,
                    format: vk::Format::R32G32_SFLOAT,
                    offset: 24,
                },
            ],
        }
    }
}

/// A mesh handed over by the mesh loader.
#[derive(Clone, Copy, Debug)]
pub struct MeshData<'a> {
    pub vertices: &'a [Vertex],
    pub indices: &'a [u32],
    /// The name of the texture the mesh samples. Meshes without one, or naming a texture that
    /// was never added, sample plain white.
    pub material: Option<&'a str>,
    pub transform: Mat4,
}

/// An RGBA8 texture with its whole mip chain packed level after level.
#[derive(Clone, Copy, Debug)]
pub struct TextureData<'a> {
    pub extent: [u32; 2],
    pub mip_levels: u32,
    pub pixels: &'a [u8],
}

/// Identifies a mesh of a [`Renderer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshId(usize);

// Must match the push constant block of the mesh shaders.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct MeshPushConstants {
    mvp: Mat4,
    // The columns of the normal matrix, padded to vec4.
    normal_matrix: [Vec4; 3],
    view_mode: u32,
    _pad: [u32; 3],
}

impl MeshPushConstants {
    fn new(view_projection: Mat4, model: Mat4, view_mode: ViewMode) -> Self {
        let normal = Mat3::from_mat4(model).inverse().transpose();

        MeshPushConstants {
            mvp: view_projection * model,
            normal_matrix: [
                normal.x_axis.extend(0.0),
                normal.y_axis.extend(0.0),
                normal.z_axis.extend(0.0),
            ],
            view_mode: view_mode.shader_index(),
            _pad: [0; 3],
        }
    }
}

#[derive(Debug)]
struct Mesh {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    index_count: u32,
    texture: usize,
    transform: Mat4,
}

#[derive(Clone, Copy, Debug)]
struct Draw {
    set: vk::DescriptorSet,
    vertex_buffer: vk::Buffer,
    index_buffer: vk::Buffer,
    index_count: u32,
    push_constants: MeshPushConstants,
}

impl Draw {
    fn record(
        &self,
        device: &dyn RawDevice,
        command_buffer: vk::CommandBuffer,
        pipeline_layout: vk::PipelineLayout,
        push_constant_stages: vk::ShaderStageFlags,
    ) {
        device.cmd_bind_vertex_buffer(command_buffer, self.vertex_buffer, 0);
        device.cmd_bind_index_buffer(command_buffer, self.index_buffer, 0, vk::IndexType::UINT32);
        device.cmd_push_constants(
            command_buffer,
            pipeline_layout,
            push_constant_stages,
            bytemuck::bytes_of(&self.push_constants),
        );
        device.cmd_draw_indexed(command_buffer, self.index_count, 1);
    }
}

#[derive(Debug)]
struct FrameSync {
    image_available: Semaphore,
    render_finished: Semaphore,
    submitted: Option<CompletionToken>,
}

/// Renders a scene of textured meshes to a window.
///
/// Fields are declared in teardown order.
#[derive(Debug)]
pub struct Renderer {
    frames: Vec<FrameSync>,
    meshes: Vec<Mesh>,
    textures: Vec<Image>,
    texture_names: HashMap<String, usize>,
    sampler: vk::Sampler,
    mesh_pso: PsoId,
    camera: Camera,
    swapchain: Swapchain,
    context: RenderContext,
    device: Arc<dyn RawDevice>,
    config: RendererConfig,
    extent: [u32; 2],
    frame_index: usize,
    frame_count: u64,
    recreate_swapchain: bool,
}

impl Renderer {
    /// Creates a Vulkan device for the window and a renderer on top of it.
    ///
    /// # Safety
    ///
    /// - `display` and `window` must be valid handles, and the window must outlive the
    ///   renderer.
    pub unsafe fn init(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        width: u32,
        height: u32,
        config: RendererConfig,
    ) -> Result<Self, RendererError> {
        let device = unsafe { VulkanDevice::new(display, window, &config.device) }?;
        info!("rendering with {}", device.device_name());

        Renderer::with_device(device, [width, height], config)
    }

    /// Creates a renderer on top of an existing device.
    ///
    /// # Panics
    ///
    /// - Panics if `config.frames_in_flight` is zero.
    pub fn with_device(
        device: Arc<dyn RawDevice>,
        extent: [u32; 2],
        config: RendererConfig,
    ) -> Result<Self, RendererError> {
        assert!(
            config.frames_in_flight != 0,
            "at least one frame must be allowed in flight",
        );

        let mut context = RenderContext::new(device.clone(), config.context.clone())?;

        let shaders = load_shaders(&config.shaders, &*device)?;
        let mesh_pso = match context.psos_mut().register(
            shaders.clone(),
            vec![BindingDesc {
                binding: 0,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                stages: vk::ShaderStageFlags::FRAGMENT,
            }],
            size_of::<MeshPushConstants>() as u32,
        ) {
            Ok(id) => id,
            Err(err) => {
                destroy_shaders(&*device, shaders);
                return Err(err.into());
            }
        };

        // A minimized window has no swapchain size; start with a placeholder and recreate it
        // once the window is restored.
        let swapchain_extent = if extent.contains(&0) {
            [1, 1]
        } else {
            extent
        };
        let swapchain = Swapchain::new(device.clone(), swapchain_extent)?;

        let frames = (0..config.frames_in_flight)
            .map(|_| -> Result<_, VulkanError> {
                Ok(FrameSync {
                    image_available: Semaphore::new(device.clone())?,
                    render_finished: Semaphore::new(device.clone())?,
                    submitted: None,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let sampler = device.create_sampler(SAMPLER_MIP_LEVELS)?;

        let mut renderer = Renderer {
            frames,
            meshes: Vec::new(),
            textures: Vec::new(),
            texture_names: HashMap::default(),
            sampler,
            mesh_pso,
            camera: Camera::default(),
            swapchain,
            context,
            device,
            config,
            extent,
            frame_index: 0,
            frame_count: 0,
            recreate_swapchain: extent.contains(&0),
        };

        let white = [0xff; 4];
        let fallback = renderer.create_texture(&TextureData {
            extent: [1, 1],
            mip_levels: 1,
            pixels: &white,
        })?;
        debug_assert_eq!(fallback, FALLBACK_TEXTURE);

        Ok(renderer)
    }

    /// Uploads a texture that meshes can refer to by `name`. A texture added under a name that
    /// is already taken shadows the previous one for meshes added afterwards.
    ///
    /// # Panics
    ///
    /// - Panics if `texture.pixels` is not exactly the size of the mip chain.
    pub fn add_texture(
        &mut self,
        name: &str,
        texture: &TextureData<'_>,
    ) -> Result<(), RendererError> {
        let index = self.create_texture(texture)?;

        if self.texture_names.insert(name.to_owned(), index).is_some() {
            warn!("texture `{}` was added twice", name);
        }

        Ok(())
    }

    /// Uploads a mesh and adds it to the scene.
    ///
    /// # Panics
    ///
    /// - Panics if `mesh` has no vertices or no indices.
    pub fn add_mesh(&mut self, mesh: &MeshData<'_>) -> Result<MeshId, RendererError> {
        assert!(
            !mesh.vertices.is_empty() && !mesh.indices.is_empty(),
            "a mesh needs at least one vertex and one index",
        );

        let texture = match mesh.material {
            Some(name) => self.texture_names.get(name).copied().unwrap_or_else(|| {
                warn!("mesh material `{}` has no texture, using white", name);
                FALLBACK_TEXTURE
            }),
            None => FALLBACK_TEXTURE,
        };

        let vertex_data: &[u8] = bytemuck::cast_slice(mesh.vertices);
        let index_data: &[u8] = bytemuck::cast_slice(mesh.indices);

        let vertex_buffer = self.context.create_buffer(
            BufferCreateInfo {
                size: vertex_data.len() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let index_buffer = match self.context.create_buffer(
            BufferCreateInfo {
                size: index_data.len() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                self.context.destroy_buffer(vertex_buffer);
                return Err(err.into());
            }
        };

        let uploaded = self.upload(|context, cb| {
            context.upload_buffer(cb, &vertex_buffer, vertex_data)?;
            context.upload_buffer(cb, &index_buffer, index_data)
        });
        if let Err(err) = uploaded {
            self.context.destroy_buffer(vertex_buffer);
            self.context.destroy_buffer(index_buffer);
            return Err(err);
        }

        debug!(
            "added a mesh of {} vertices and {} indices",
            mesh.vertices.len(),
            mesh.indices.len(),
        );

        self.meshes.push(Mesh {
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
            texture,
            transform: mesh.transform,
        });

        Ok(MeshId(self.meshes.len() - 1))
    }

    /// # Panics
    ///
    /// - Panics if `id` was not returned by this renderer.
    pub fn set_mesh_transform(&mut self, id: MeshId, transform: Mat4) {
        self.meshes[id.0].transform = transform;
    }

    #[inline]
    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    #[inline]
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    #[inline]
    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    #[inline]
    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    #[inline]
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// The number of frames that were presented.
    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Renders and presents one frame.
    ///
    /// Nothing is rendered while the window is minimized, or when the swapchain turns out to be
    /// out of date; in the latter case it is recreated at the start of the next call.
    pub fn render_frame(&mut self, controls: &FrameControls) -> Result<(), RendererError> {
        self.camera
            .apply(controls.camera_step, controls.camera_rotation);

        if self.extent.contains(&0) {
            return Ok(());
        }

        if self.recreate_swapchain {
            self.recreate()?;
        }

        let frame_index = self.frame_index;

        if let Some(token) = self.frames[frame_index].submitted.take() {
            self.context.command_buffers_mut().wait_for(&token)?;
        }

        self.context.begin_frame()?;

        let image_available = self.frames[frame_index].image_available.handle();
        let render_finished = self.frames[frame_index].render_finished.handle();

        let image_index = match self.swapchain.acquire(image_available) {
            Ok((index, suboptimal)) => {
                self.recreate_swapchain |= suboptimal;
                index
            }
            Err(VulkanError::OutOfDate) => {
                self.recreate_swapchain = true;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut cb = self.context.command_buffers_mut().allocate()?;
        cb.begin()?;
        self.record_frame(&mut cb, image_index, controls)?;
        cb.end()?;

        let queue = self.context.command_buffers().queue().handle;
        cb.submit(
            queue,
            &[(
                image_available,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )],
            Some(render_finished),
        )?;
        self.frames[frame_index].submitted = Some(cb.token());
        self.context.command_buffers_mut().recycle(cb);

        match self.swapchain.present(image_index, render_finished) {
            Ok(suboptimal) => self.recreate_swapchain |= suboptimal,
            Err(VulkanError::OutOfDate) => self.recreate_swapchain = true,
            Err(err) => return Err(err.into()),
        }

        self.context.end_frame();
        self.frame_index = (frame_index + 1) % self.frames.len();
        self.frame_count += 1;

        Ok(())
    }

    /// Adapts to a new window size. A zero size means the window is minimized, and frames are
    /// skipped until the next non-zero size.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), RendererError> {
        self.extent = [width, height];

        if width == 0 || height == 0 {
            return Ok(());
        }

        self.recreate()
    }

    /// Recompiles the mesh shaders and swaps them in.
    ///
    /// A failed compilation is returned before anything is touched, so the current shaders stay
    /// in use and the caller may fix the source and try again.
    pub fn reload_shaders(&mut self) -> Result<(), RendererError> {
        let shaders = load_shaders(&self.config.shaders, &*self.device)?;

        if let Err(err) = self.context.flush_cache() {
            destroy_shaders(&*self.device, shaders);
            return Err(err.into());
        }
        self.context.psos_mut().replace_shaders(self.mesh_pso, shaders);

        info!("reloaded the mesh shaders");

        Ok(())
    }

    /// Waits for the GPU to finish, then destroys everything.
    pub fn shutdown(self) {
        drop(self);
    }

    fn recreate(&mut self) -> Result<(), RendererError> {
        self.context.invalidate_size_dependent()?;
        self.swapchain.recreate(self.extent)?;
        self.recreate_swapchain = false;

        Ok(())
    }

    fn record_frame(
        &mut self,
        cb: &mut CommandBuffer,
        image_index: u32,
        controls: &FrameControls,
    ) -> Result<(), RendererError> {
        let extent = self.swapchain.extent();
        let format = self.swapchain.format();
        let samples = if controls.msaa {
            self.config.msaa_samples
        } else {
            vk::SampleCountFlags::TYPE_1
        };

        let depth = self.context.acquire_render_target(
            "depth",
            &RenderTargetDesc {
                samples,
                ..RenderTargetDesc::new(
                    extent,
                    DEPTH_FORMAT,
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                )
            },
        )?;
        self.context.render_targets().transition(
            cb,
            depth.id,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        );

        let msaa_color = if controls.msaa {
            let target = self.context.acquire_render_target(
                "msaa color",
                &RenderTargetDesc {
                    samples,
                    ..RenderTargetDesc::new(
                        extent,
                        format,
                        vk::ImageUsageFlags::COLOR_ATTACHMENT
                            | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                    )
                },
            )?;
            self.context.render_targets().transition(
                cb,
                target.id,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            );

            Some(target)
        } else {
            None
        };

        let swapchain_image = self.swapchain.image(image_index);
        let swapchain_view = self.swapchain.view(image_index);
        // Chained to the acquire semaphore, which is waited for at this stage.
        record_transition_after(
            cb,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            swapchain_image,
            vk::ImageAspectFlags::COLOR,
            1,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );

        let render_pass = self
            .context
            .cache_mut()
            .get_or_create_render_pass(&RenderPassKey {
                extent,
                color_formats: smallvec![format],
                depth_format: Some(DEPTH_FORMAT),
                samples,
                resolve_formats: if controls.msaa {
                    smallvec![format]
                } else {
                    SmallVec::new()
                },
            })?;

        // Colors, depth, then resolves.
        let attachments = match &msaa_color {
            Some(color) => smallvec![color.view, depth.view, swapchain_view],
            None => smallvec![swapchain_view, depth.view],
        };
        let framebuffer = self
            .context
            .cache_mut()
            .get_or_create_framebuffer(&FramebufferKey {
                render_pass,
                attachments,
                extent,
            })?;

        let pipeline = self.context.graphics_pipeline(&GraphicsPipelineKey {
            pso: self.mesh_pso,
            vertex_layout: Vertex::layout(),
            extent,
            render_pass,
            wireframe: controls.view_mode == ViewMode::Wireframe,
        })?;

        let layout = self.context.psos().get(self.mesh_pso).layout();
        let (set_layout, pipeline_layout, push_constant_stages) = (
            layout.set_layout,
            layout.pipeline_layout,
            layout.push_constant_stages,
        );

        // Every set is written before the first one is bound.
        let view_projection = self
            .camera
            .view_projection(extent[0] as f32 / extent[1] as f32);
        let mut writes = DescriptorWrites::new();
        let mut draws = Vec::with_capacity(self.meshes.len());

        for mesh in &self.meshes {
            let set = self.context.descriptor_sets().allocate(set_layout)?;
            writes.push(DescriptorWrite::combined_image_sampler(
                set,
                0,
                self.textures[mesh.texture].view(),
                self.sampler,
            ));
            draws.push(Draw {
                set,
                vertex_buffer: mesh.vertex_buffer.handle(),
                index_buffer: mesh.index_buffer.handle(),
                index_count: mesh.index_count,
                push_constants: MeshPushConstants::new(
                    view_projection,
                    mesh.transform,
                    controls.view_mode,
                ),
            });
        }

        if !writes.is_empty() {
            writes.flush(&*self.device);
        }

        let [r, g, b, a] = self.config.clear_color;
        let color_clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [r, g, b, a],
            },
        };
        let depth_clear = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        };
        let clear_values = [color_clear, depth_clear, color_clear];
        let clear_values = if controls.msaa {
            &clear_values[..]
        } else {
            &clear_values[..2]
        };

        if self.context.secondary_recorder().is_some() {
            cb.begin_render_pass(
                render_pass,
                framebuffer,
                extent,
                clear_values,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            );

            let sets: SmallVec<[_; 16]> = draws.iter().map(|draw| draw.set).collect();
            self.context.descriptor_sets().mark_used(&cb.token(), &sets);

            let secondary = self.context.record_secondary(
                CommandBufferInheritance {
                    render_pass,
                    subpass: 0,
                    framebuffer,
                },
                Box::new(move |device: &dyn RawDevice, handle: vk::CommandBuffer| {
                    device.cmd_bind_pipeline(handle, vk::PipelineBindPoint::GRAPHICS, pipeline);

                    for draw in &draws {
                        device.cmd_bind_descriptor_sets(
                            handle,
                            vk::PipelineBindPoint::GRAPHICS,
                            pipeline_layout,
                            0,
                            &[draw.set],
                        );
                        draw.record(device, handle, pipeline_layout, push_constant_stages);
                    }
                }),
            )?;

            if let Some(mut secondary) = secondary {
                cb.execute_secondary(&mut [&mut secondary]);
                self.context.command_buffers_mut().recycle(secondary);
            }
        } else {
            cb.begin_render_pass(
                render_pass,
                framebuffer,
                extent,
                clear_values,
                vk::SubpassContents::INLINE,
            );

            let handle = cb.recording_handle();
            self.device
                .cmd_bind_pipeline(handle, vk::PipelineBindPoint::GRAPHICS, pipeline);

            for draw in &draws {
                self.context.descriptor_sets().bind(
                    cb,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline_layout,
                    0,
                    &[draw.set],
                );
                draw.record(&*self.device, handle, pipeline_layout, push_constant_stages);
            }
        }

        cb.end_render_pass();

        record_transition(
            cb,
            swapchain_image,
            vk::ImageAspectFlags::COLOR,
            1,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        Ok(())
    }

    fn create_texture(&mut self, texture: &TextureData<'_>) -> Result<usize, RendererError> {
        let image = self.context.create_image(
            ImageCreateInfo {
                extent: texture.extent,
                format: TEXTURE_FORMAT,
                usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
                mip_levels: texture.mip_levels,
                ..Default::default()
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let uploaded = self.upload(|context, cb| context.upload_image(cb, &image, texture.pixels));
        if let Err(err) = uploaded {
            self.context.destroy_image(image);
            return Err(err);
        }

        self.textures.push(image);

        Ok(self.textures.len() - 1)
    }

    // Uploads are ordered before the frames that use them by the queue's submission order.
    //
    // The command buffer goes back to the manager even if recording or submitting fails.
    fn upload(
        &mut self,
        record: impl FnOnce(&mut RenderContext, &CommandBuffer) -> Result<(), MemoryAllocatorError>,
    ) -> Result<(), RendererError> {
        let mut cb = self.context.command_buffers_mut().allocate()?;
        let queue = self.context.command_buffers().queue().handle;

        let result = record_and_submit(&mut self.context, &mut cb, queue, record);

        if result.is_err() {
            if let Err(err) = cb.discard() {
                warn!("failed to reset an abandoned upload: {}", err);
                return result;
            }
        }
        self.context.command_buffers_mut().recycle(cb);

        result
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.context.wait_idle() {
            log::error!("failed to wait for the device to be idle: {}", err);
        }

        for mesh in self.meshes.drain(..) {
            self.context.destroy_buffer(mesh.vertex_buffer);
            self.context.destroy_buffer(mesh.index_buffer);
        }

        for image in self.textures.drain(..) {
            self.context.destroy_image(image);
        }

        unsafe { self.device.destroy_sampler(self.sampler) };

        // Framebuffers reference the swapchain's views, which are destroyed before the context.
        if let Err(err) = self.context.invalidate_size_dependent() {
            log::error!("failed to flush the object cache: {}", err);
        }
    }
}

fn record_and_submit(
    context: &mut RenderContext,
    cb: &mut CommandBuffer,
    queue: vk::Queue,
    record: impl FnOnce(&mut RenderContext, &CommandBuffer) -> Result<(), MemoryAllocatorError>,
) -> Result<(), RendererError> {
    cb.begin()?;
    record(context, cb)?;
    cb.end()?;
    cb.submit(queue, &[], None)?;

    Ok(())
}

fn load_shaders(
    source: &ShaderSource,
    device: &dyn RawDevice,
) -> Result<PsoShaders, RendererError> {
    let (vertex, fragment) = match source {
        ShaderSource::Glsl { compiler, dir } => {
            let vertex = compiler.compile(&dir.join("mesh.vert"), "main", ShaderStage::Vertex)?;
            let fragment =
                compiler.compile(&dir.join("mesh.frag"), "main", ShaderStage::Fragment)?;

            (vertex.spirv, fragment.spirv)
        }
        ShaderSource::SpirV { vertex, fragment } => (vertex.clone(), fragment.clone()),
    };

    let vertex = device.create_shader_module(&vertex)?;
    let fragment = match device.create_shader_module(&fragment) {
        Ok(module) => module,
        Err(err) => {
            unsafe { device.destroy_shader_module(vertex) };
            return Err(err.into());
        }
    };

    Ok(PsoShaders::Graphics {
        vertex: ShaderEntry {
            module: vertex,
            entry_point: CString::from(c"main"),
        },
        fragment: ShaderEntry {
            module: fragment,
            entry_point: CString::from(c"main"),
        },
    })
}

fn destroy_shaders(device: &dyn RawDevice, shaders: PsoShaders) {
    let modules: SmallVec<[_; 2]> = match shaders {
        PsoShaders::Graphics { vertex, fragment } => smallvec![vertex.module, fragment.module],
        PsoShaders::Compute { compute } => smallvec![compute.module],
    };

    for module in modules {
        unsafe { device.destroy_shader_module(module) };
    }
}

/// Error that can be returned by the [`Renderer`].
#[derive(Debug)]
pub enum RendererError {
    DeviceCreation(DeviceCreationError),
    Vulkan(VulkanError),
    Memory(MemoryAllocatorError),
    /// A shader failed to compile or load. [`ShaderError::is_recoverable`] tells whether fixing
    /// the source and trying again can help.
    Shader(ShaderError),
}

impl Error for RendererError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::DeviceCreation(err) => Some(err),
            Self::Vulkan(err) => Some(err),
            Self::Memory(err) => Some(err),
            Self::Shader(err) => Some(err),
        }
    }
}

impl Display for RendererError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceCreation(_) => write!(f, "creating the device failed"),
            Self::Vulkan(_) => write!(f, "a runtime error occurred"),
            Self::Memory(_) => write!(f, "allocating memory failed"),
            Self::Shader(_) => write!(f, "loading a shader failed"),
        }
    }
}

impl From<DeviceCreationError> for RendererError {
    fn from(err: DeviceCreationError) -> Self {
        Self::DeviceCreation(err)
    }
}

impl From<VulkanError> for RendererError {
    fn from(err: VulkanError) -> Self {
        Self::Vulkan(err)
    }
}

impl From<MemoryAllocatorError> for RendererError {
    fn from(err: MemoryAllocatorError) -> Self {
        Self::Memory(err)
    }
}

impl From<ShaderError> for RendererError {
    fn from(err: ShaderError) -> Self {
        Self::Shader(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::null::{NullDevice, RecordedCommand};

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn config() -> RendererConfig {
        RendererConfig {
            shaders: ShaderSource::SpirV {
                vertex: vec![SPIRV_MAGIC],
                fragment: vec![SPIRV_MAGIC],
            },
            ..Default::default()
        }
    }

    fn quad() -> ([Vertex; 4], [u32; 6]) {
        let vertex = |x: f32, y: f32| Vertex {
            position: [x, y, 0.0],
            normal: [0.0, 0.0, 1.0],
            tex_coord: [x.max(0.0), y.max(0.0)],
        };

        (
            [vertex(-1.0, -1.0), vertex(1.0, -1.0), vertex(1.0, 1.0), vertex(-1.0, 1.0)],
            [0, 1, 2, 2, 3, 0],
        )
    }

    fn renderer_with_quad(device: &Arc<NullDevice>) -> Renderer {
        let mut renderer = Renderer::with_device(device.clone(), [256, 256], config()).unwrap();
        let (vertices, indices) = quad();
        renderer
            .add_mesh(&MeshData {
                vertices: &vertices,
                indices: &indices,
                material: None,
                transform: Mat4::IDENTITY,
            })
            .unwrap();

        renderer
    }

    #[test]
    fn push_constants_fill_the_guaranteed_range() {
        assert_eq!(size_of::<MeshPushConstants>(), 128);
    }

    #[test]
    fn frames_are_presented() {
        let device = NullDevice::new();
        let mut renderer = renderer_with_quad(&device);

        for _ in 0..5 {
            renderer.render_frame(&FrameControls::default()).unwrap();
        }

        assert_eq!(renderer.frame_count(), 5);
        assert_eq!(device.present_count(), 5);
    }

    #[test]
    fn descriptor_sets_are_recycled_across_frames() {
        let device = NullDevice::new();
        let mut renderer = renderer_with_quad(&device);

        for _ in 0..8 {
            renderer.render_frame(&FrameControls::default()).unwrap();
            device.complete_submissions();
        }

        // One set per draw, reclaimed at the start of the next frame.
        assert_eq!(renderer.context().descriptor_sets().allocated_count(), 1);
    }

    #[test]
    fn toggling_msaa_does_not_grow_the_pool() {
        let device = NullDevice::new();
        let mut renderer = renderer_with_quad(&device);
        let mut controls = FrameControls::default();

        for frame in 0..6 {
            controls.msaa = frame % 2 == 0;
            renderer.render_frame(&controls).unwrap();
        }

        let stats = renderer.context().render_targets().stats();
        // A depth target per sample count, plus the multisampled color target.
        assert_eq!(stats.total, 3);
        assert_eq!(stats.in_use, 0);
        assert_eq!(renderer.context().cache().stats().render_passes, 2);
    }

    #[test]
    fn out_of_date_swapchain_is_recreated() {
        let device = NullDevice::new();
        let mut renderer = renderer_with_quad(&device);
        let old = renderer.swapchain().handle();

        device.invalidate_swapchain(old);
        renderer.render_frame(&FrameControls::default()).unwrap();
        assert_eq!(device.present_count(), 0);

        renderer.render_frame(&FrameControls::default()).unwrap();
        assert_ne!(renderer.swapchain().handle(), old);
        assert_eq!(device.present_count(), 1);
    }

    #[test]
    fn minimized_window_skips_frames() {
        let device = NullDevice::new();
        let mut renderer = renderer_with_quad(&device);

        renderer.resize(0, 0).unwrap();
        renderer.render_frame(&FrameControls::default()).unwrap();
        assert_eq!(device.present_count(), 0);

        renderer.resize(640, 480).unwrap();
        renderer.render_frame(&FrameControls::default()).unwrap();
        assert_eq!(renderer.swapchain().extent(), [640, 480]);
        assert_eq!(device.present_count(), 1);
    }

    #[test]
    fn resize_flushes_size_dependent_objects() {
        let device = NullDevice::new();
        let mut renderer = renderer_with_quad(&device);
        renderer.render_frame(&FrameControls::default()).unwrap();
        assert!(!renderer.context().cache().is_empty());

        renderer.resize(320, 200).unwrap();

        assert!(renderer.context().cache().is_empty());
        assert_eq!(renderer.context().render_targets().stats().total, 0);
    }

    #[test]
    fn reloading_shaders_replaces_the_modules() {
        let device = NullDevice::new();
        let mut renderer = renderer_with_quad(&device);
        renderer.render_frame(&FrameControls::default()).unwrap();

        renderer.reload_shaders().unwrap();

        assert!(renderer.context().cache().is_empty());
        assert_eq!(device.live_object_count_of("shader module"), 2);

        renderer.render_frame(&FrameControls::default()).unwrap();
        assert_eq!(device.present_count(), 2);
    }

    #[test]
    fn secondary_recording_draws_the_scene() {
        let device = NullDevice::new();
        let mut config = config();
        config.context.secondary_recording = true;
        let mut renderer = Renderer::with_device(device.clone(), [256, 256], config).unwrap();
        let (vertices, indices) = quad();
        renderer
            .add_mesh(&MeshData {
                vertices: &vertices,
                indices: &indices,
                material: None,
                transform: Mat4::IDENTITY,
            })
            .unwrap();

        for _ in 0..3 {
            renderer.render_frame(&FrameControls::default()).unwrap();
            device.complete_submissions();
        }

        assert_eq!(device.present_count(), 3);
        assert_eq!(renderer.context().descriptor_sets().allocated_count(), 1);
    }

    #[test]
    fn swapchain_transition_waits_for_the_acquire() {
        let device = NullDevice::new();
        let mut renderer = renderer_with_quad(&device);
        device.clear_recorded_commands();

        renderer.render_frame(&FrameControls::default()).unwrap();

        let swapchain = renderer.swapchain();
        let images: Vec<_> = (0..swapchain.image_count())
            .map(|index| swapchain.image(index))
            .collect();
        let stages: Vec<_> = device
            .all_recorded_commands()
            .into_iter()
            .filter_map(|command| match command {
                RecordedCommand::PipelineBarrier {
                    src_stage,
                    images: barriers,
                    ..
                } if barriers.iter().any(|&(image, old_layout, _)| {
                    images.contains(&image) && old_layout == vk::ImageLayout::UNDEFINED
                }) =>
                {
                    Some(src_stage)
                }
                _ => None,
            })
            .collect();

        assert_eq!(stages, [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT]);
    }

    #[test]
    fn unknown_material_falls_back_to_white() {
        let device = NullDevice::new();
        let mut renderer = Renderer::with_device(device.clone(), [256, 256], config()).unwrap();
        let pixels = [0u8; 4 * 4 * 4];
        renderer
            .add_texture(
                "checker",
                &TextureData {
                    extent: [4, 4],
                    mip_levels: 1,
                    pixels: &pixels,
                },
            )
            .unwrap();
        let (vertices, indices) = quad();

        for (material, texture) in [(Some("checker"), 1), (Some("missing"), 0), (None, 0)] {
            let id = renderer
                .add_mesh(&MeshData {
                    vertices: &vertices,
                    indices: &indices,
                    material,
                    transform: Mat4::IDENTITY,
                })
                .unwrap();
            assert_eq!(renderer.meshes[id.0].texture, texture);
        }
    }

    #[test]
    fn failed_upload_gives_everything_back() {
        let device = NullDevice::new();
        let mut renderer = Renderer::with_device(device.clone(), [256, 256], config()).unwrap();
        renderer.context.wait_idle().unwrap();

        let buffers = device.live_buffer_count() - renderer.context().staging().len();
        let idle = renderer.context().command_buffers().idle_count();
        let (vertices, indices) = quad();
        let mesh = MeshData {
            vertices: &vertices,
            indices: &indices,
            material: None,
            transform: Mat4::IDENTITY,
        };

        device.fail_next_submission(VulkanError::DeviceLost);
        let err = renderer.add_mesh(&mesh).unwrap_err();
        assert!(matches!(err, RendererError::Vulkan(VulkanError::DeviceLost)));

        assert_eq!(renderer.mesh_count(), 0);
        assert_eq!(
            device.live_buffer_count() - renderer.context().staging().len(),
            buffers,
        );
        assert_eq!(renderer.context().command_buffers().idle_count(), idle);
        assert_eq!(renderer.context().command_buffers().in_flight_count(), 0);

        renderer.add_mesh(&mesh).unwrap();
        assert_eq!(renderer.mesh_count(), 1);
    }

    #[test]
    fn camera_moves_along_its_axes() {
        let mut camera = Camera {
            position: Vec3::ZERO,
            ..Default::default()
        };

        camera.apply(Vec3::new(0.0, 0.0, 1.0), Vec2::ZERO);
        assert!(camera.position.abs_diff_eq(Vec3::new(0.0, 0.0, -1.0), 1e-6));

        camera.apply(Vec3::new(1.0, 0.0, 0.0), Vec2::ZERO);
        assert!(camera.position.abs_diff_eq(Vec3::new(1.0, 0.0, -1.0), 1e-6));

        camera.apply(Vec3::ZERO, Vec2::new(0.0, 10.0));
        assert_eq!(camera.pitch, Camera::MAX_PITCH);
    }

    #[test]
    fn shutdown_releases_every_object() {
        let device = NullDevice::new();
        let mut renderer = renderer_with_quad(&device);
        let mut controls = FrameControls {
            msaa: true,
            ..Default::default()
        };

        for view_mode in [ViewMode::Lit, ViewMode::Wireframe] {
            controls.view_mode = view_mode;
            renderer.render_frame(&controls).unwrap();
        }

        renderer.shutdown();

        assert_eq!(device.live_object_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_image_count(), 0);
        assert_eq!(device.live_memory_count(), 0);
        assert_eq!(device.live_swapchain_count(), 0);
    }
}
