// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use vkframe::{
    context::{RenderContext, RenderContextCreateInfo},
    device::null::NullDevice,
    glam::Mat4,
    render_target::RenderTargetDesc,
    renderer::{
        FrameControls, MeshData, Renderer, RendererConfig, ShaderSource, Vertex, ViewMode,
    },
    swapchain::Swapchain,
    vk,
};

fn color_target(format: vk::Format) -> RenderTargetDesc {
    RenderTargetDesc::new(
        [256, 256],
        format,
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
    )
}

#[test]
fn released_render_target_is_reused_without_new_memory() {
    let device = NullDevice::new();
    let swapchain = Swapchain::new(device.clone(), [256, 256]).unwrap();
    let mut context =
        RenderContext::new(device.clone(), RenderContextCreateInfo::default()).unwrap();
    assert_eq!(swapchain.extent(), [256, 256]);

    let desc = color_target(vk::Format::R8G8B8A8_UNORM);
    let first = context.acquire_render_target("color", &desc).unwrap();
    context.render_targets().release(first.id);

    let memory_blocks = context.allocator().device_memory_count();
    let allocations = context.allocator().allocation_count();
    let live_memory = device.live_memory_count();

    let second = context.acquire_render_target("color", &desc).unwrap();

    assert_eq!(second.image, first.image);
    assert_eq!(context.allocator().device_memory_count(), memory_blocks);
    assert_eq!(context.allocator().allocation_count(), allocations);
    assert_eq!(device.live_memory_count(), live_memory);
}

#[test]
fn differing_formats_never_share_storage() {
    let device = NullDevice::new();
    let mut context =
        RenderContext::new(device.clone(), RenderContextCreateInfo::default()).unwrap();

    let rgba = context
        .acquire_render_target("a", &color_target(vk::Format::R8G8B8A8_UNORM))
        .unwrap();
    context.render_targets().release(rgba.id);
    let bgra = context
        .acquire_render_target("b", &color_target(vk::Format::B8G8R8A8_UNORM))
        .unwrap();

    assert_ne!(rgba.image, bgra.image);
    assert_ne!(rgba.view, bgra.view);
    assert_eq!(context.render_targets().stats().total, 2);
}

#[test]
fn headless_frames_with_resizes_and_reloads() {
    let device = NullDevice::new();
    let mut renderer = Renderer::with_device(
        device.clone(),
        [256, 256],
        RendererConfig {
            shaders: ShaderSource::SpirV {
                vertex: vec![0x0723_0203],
                fragment: vec![0x0723_0203],
            },
            ..Default::default()
        },
    )
    .unwrap();

    let vertices = [
        Vertex {
            position: [0.0, -0.5, 0.0],
            normal: [0.0, 0.0, 1.0],
            tex_coord: [0.5, 0.0],
        },
        Vertex {
            position: [0.5, 0.5, 0.0],
            normal: [0.0, 0.0, 1.0],
            tex_coord: [1.0, 1.0],
        },
        Vertex {
            position: [-0.5, 0.5, 0.0],
            normal: [0.0, 0.0, 1.0],
            tex_coord: [0.0, 1.0],
        },
    ];
    let mesh = renderer
        .add_mesh(&MeshData {
            vertices: &vertices,
            indices: &[0, 1, 2],
            material: None,
            transform: Mat4::IDENTITY,
        })
        .unwrap();

    let mut controls = FrameControls::default();
    let mut presented = 0;

    for frame in 0..24u32 {
        controls.view_mode = match frame % 4 {
            0 => ViewMode::Lit,
            1 => ViewMode::Normals,
            2 => ViewMode::TexCoords,
            _ => ViewMode::Wireframe,
        };
        controls.msaa = frame % 3 == 0;
        renderer.set_mesh_transform(mesh, Mat4::from_rotation_y(frame as f32 * 0.1));

        match frame {
            8 => renderer.resize(512, 384).unwrap(),
            16 => renderer.reload_shaders().unwrap(),
            _ => {}
        }

        renderer.render_frame(&controls).unwrap();
        presented += 1;

        if frame % 2 == 0 {
            device.complete_submissions();
        }
    }

    assert_eq!(device.present_count(), presented);
    assert_eq!(renderer.swapchain().extent(), [512, 384]);

    renderer.shutdown();

    assert_eq!(device.live_object_count(), 0);
    assert_eq!(device.live_buffer_count(), 0);
    assert_eq!(device.live_image_count(), 0);
    assert_eq!(device.live_memory_count(), 0);
    assert_eq!(device.live_swapchain_count(), 0);
}
