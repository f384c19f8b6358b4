// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

// A small scene viewer.
//
// - WASD moves the camera, Q and E move it down and up, the arrow keys turn it.
// - Tab cycles through the view modes (lit, normals, texture coordinates, wireframe).
// - M toggles multisampling.
// - R recompiles the shaders in `VKFRAME_SHADER_DIR` (default: the `shaders` directory next to
//   this crate's manifest). `VKFRAME_GLSLANG` names the compiler (default: `glslangValidator`).
//
// When a shader fails to compile, the diagnostics are printed and you can fix the source and
// retry, or abort.

use glam::{Mat4, Vec2, Vec3};
use log::{error, info};
use std::{
    collections::HashSet,
    env,
    error::Error,
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};
use vkframe::{
    renderer::{
        FrameControls, MeshData, MeshId, Renderer, RendererConfig, RendererError, ShaderSource,
        TextureData,
    },
    shader::ShaderCompiler,
};
use winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    raw_window_handle::{HasDisplayHandle, HasWindowHandle},
    window::{Window, WindowId},
};

mod scene;

const MOVE_SPEED: f32 = 3.0;
const TURN_SPEED: f32 = 1.5;

fn main() -> Result<(), impl Error> {
    env_logger::init();

    let event_loop = EventLoop::new().unwrap();
    let mut app = App::new(config_from_env());

    event_loop.run_app(&mut app)
}

fn config_from_env() -> RendererConfig {
    let shader_dir = env::var_os("VKFRAME_SHADER_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("shaders"));
    let compiler = env::var_os("VKFRAME_GLSLANG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("glslangValidator"));

    RendererConfig {
        shaders: ShaderSource::Glsl {
            compiler: ShaderCompiler::new(compiler, env::temp_dir().join("vkframe-shader-cache")),
            dir: shader_dir,
        },
        ..Default::default()
    }
}

struct App {
    config: RendererConfig,
    controls: FrameControls,
    held: HashSet<KeyCode>,
    rcx: Option<WindowContext>,
}

struct WindowContext {
    // The renderer must go before the window it presents to.
    renderer: Renderer,
    window: Arc<Window>,
    spinning: MeshId,
    start: Instant,
    last_frame: Instant,
}

impl App {
    fn new(config: RendererConfig) -> Self {
        App {
            config,
            controls: FrameControls::default(),
            held: HashSet::new(),
            rcx: None,
        }
    }

    fn create_renderer(&self, window: &Window) -> Result<Renderer, Box<dyn Error>> {
        let display = window.display_handle()?.as_raw();
        let handle = window.window_handle()?.as_raw();
        let size = window.inner_size();

        let renderer = retry_on_compile_error(|| unsafe {
            Renderer::init(display, handle, size.width, size.height, self.config.clone())
        })?;

        Ok(renderer)
    }

    fn key_pressed(&mut self, event_loop: &ActiveEventLoop, key: KeyCode) {
        match key {
            KeyCode::Escape => event_loop.exit(),
            KeyCode::Tab => {
                self.controls.view_mode = self.controls.view_mode.next();
                info!("view mode: {:?}", self.controls.view_mode);
            }
            KeyCode::KeyM => {
                self.controls.msaa = !self.controls.msaa;
                info!("multisampling: {}", self.controls.msaa);
            }
            KeyCode::KeyR => {
                let Some(rcx) = &mut self.rcx else { return };

                if let Err(err) = retry_on_compile_error(|| rcx.renderer.reload_shaders()) {
                    error!("{}", err);
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }

    fn axis(&self, negative: KeyCode, positive: KeyCode) -> f32 {
        self.held.contains(&positive) as i32 as f32 - self.held.contains(&negative) as i32 as f32
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.rcx.is_some() {
            return;
        }

        let attributes = Window::default_attributes().with_title("vkframe");
        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(err) => {
                error!("failed to create a window: {}", err);
                event_loop.exit();
                return;
            }
        };

        let mut renderer = match self.create_renderer(&window) {
            Ok(renderer) => renderer,
            Err(err) => {
                error!("failed to initialize the renderer: {}", err);
                event_loop.exit();
                return;
            }
        };

        match populate(&mut renderer) {
            Ok(spinning) => {
                let now = Instant::now();
                self.rcx = Some(WindowContext {
                    renderer,
                    window,
                    spinning,
                    start: now,
                    last_frame: now,
                });
            }
            Err(err) => {
                error!("failed to upload the scene: {}", err);
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                let Some(rcx) = &mut self.rcx else { return };

                if let Err(err) = rcx.renderer.resize(size.width, size.height) {
                    error!("failed to resize: {}", err);
                    event_loop.exit();
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key),
                        state,
                        repeat,
                        ..
                    },
                ..
            } => match state {
                ElementState::Pressed => {
                    self.held.insert(key);

                    if !repeat {
                        self.key_pressed(event_loop, key);
                    }
                }
                ElementState::Released => {
                    self.held.remove(&key);
                }
            },
            WindowEvent::RedrawRequested => {
                let step = Vec3::new(
                    self.axis(KeyCode::KeyA, KeyCode::KeyD),
                    self.axis(KeyCode::KeyQ, KeyCode::KeyE),
                    self.axis(KeyCode::KeyS, KeyCode::KeyW),
                );
                let rotation = Vec2::new(
                    self.axis(KeyCode::ArrowLeft, KeyCode::ArrowRight),
                    self.axis(KeyCode::ArrowDown, KeyCode::ArrowUp),
                );

                let Some(rcx) = &mut self.rcx else { return };

                let now = Instant::now();
                let delta = (now - rcx.last_frame).as_secs_f32();
                rcx.last_frame = now;

                self.controls.camera_step = step * MOVE_SPEED * delta;
                self.controls.camera_rotation = rotation * TURN_SPEED * delta;

                let angle = (now - rcx.start).as_secs_f32() * 0.8;
                rcx.renderer.set_mesh_transform(
                    rcx.spinning,
                    Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0)) * Mat4::from_rotation_y(angle),
                );

                if let Err(err) = rcx.renderer.render_frame(&self.controls) {
                    error!("failed to render a frame: {}", err);
                    event_loop.exit();
                }

                self.controls.camera_step = Vec3::ZERO;
                self.controls.camera_rotation = Vec2::ZERO;
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(rcx) = &self.rcx {
            rcx.window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(rcx) = self.rcx.take() {
            info!("rendered {} frames", rcx.renderer.frame_count());
            rcx.renderer.shutdown();
        }
    }
}

/// Uploads the textures and meshes of the scene. Returns the mesh that spins.
fn populate(renderer: &mut Renderer) -> Result<MeshId, RendererError> {
    let (pixels, mip_levels) = scene::checkerboard(256, 8, [40, 40, 48, 255], [200, 200, 210, 255]);
    renderer.add_texture(
        "checker",
        &TextureData {
            extent: [256, 256],
            mip_levels,
            pixels: &pixels,
        },
    )?;

    let (pixels, mip_levels) = scene::checkerboard(64, 4, [200, 90, 40, 255], [240, 180, 60, 255]);
    renderer.add_texture(
        "orange",
        &TextureData {
            extent: [64, 64],
            mip_levels,
            pixels: &pixels,
        },
    )?;

    let ground = scene::ground(10.0, 8.0);
    renderer.add_mesh(&MeshData {
        vertices: &ground.vertices,
        indices: &ground.indices,
        material: Some("checker"),
        transform: Mat4::IDENTITY,
    })?;

    let sphere = scene::sphere(0.75, 24, 48);
    renderer.add_mesh(&MeshData {
        vertices: &sphere.vertices,
        indices: &sphere.indices,
        material: Some("orange"),
        transform: Mat4::from_translation(Vec3::new(2.0, 0.75, -1.0)),
    })?;

    let cube = scene::cube(0.5);
    renderer.add_mesh(&MeshData {
        vertices: &cube.vertices,
        indices: &cube.indices,
        material: None,
        transform: Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0)),
    })
}

/// Runs `attempt` until it succeeds, fails with something else than a compile error, or the
/// user chooses to abort.
fn retry_on_compile_error<T>(
    mut attempt: impl FnMut() -> Result<T, RendererError>,
) -> Result<T, RendererError> {
    loop {
        match attempt() {
            Err(RendererError::Shader(err)) if err.is_recoverable() => {
                eprintln!("{}", err);

                if !ask_retry() {
                    return Err(RendererError::Shader(err));
                }
            }
            result => return result,
        }
    }
}

fn ask_retry() -> bool {
    let mut stderr = io::stderr();
    let _ = write!(stderr, "fix the shader, then [r]etry or [a]bort: ");
    let _ = stderr.flush();

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => false,
        Ok(_) => line.trim().eq_ignore_ascii_case("r") || line.trim().eq_ignore_ascii_case("retry"),
    }
}
