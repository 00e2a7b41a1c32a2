//! SDL2 Window Display Module
//! Creates an SDL2 window with an OpenGL 3.3 core context and runs the
//! render loop: swap in captured frames, follow the head, draw the quad.

use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use sdl2::event::{Event, WindowEvent};
use sdl2::keyboard::Keycode;
use sdl2::video::{GLContext, GLProfile, SwapInterval, Window};
use sdl2::EventPump;
use tracing::{info, instrument, warn};

use super::camera::{choose_pose, live_state, AutoRotation, Camera, Pose};
use super::renderer::QuadRenderer;
use crate::glasses::OrientationHandle;
use crate::pipeline::FrameShuttle;
use crate::DisplayConfig;

/// SDL2 Window Display
/// Owns the window, its GL context and the quad renderer. Must stay on the
/// thread that created it.
pub struct Sdl2Display {
    renderer: Option<QuadRenderer>,
    gl: glow::Context,
    _gl_context: GLContext,
    window: Window,
    event_pump: EventPump,
    _sdl: sdl2::Sdl,
    camera: Camera,
    frame_interval: Duration,
}

impl Sdl2Display {
    #[instrument(skip(config))]
    pub fn new(config: &DisplayConfig) -> Result<Self> {
        let sdl = sdl2::init().map_err(|e| eyre!(e))?;
        let video_subsystem = sdl.video().map_err(|e| eyre!(e))?;

        let gl_attr = video_subsystem.gl_attr();
        gl_attr.set_context_profile(GLProfile::Core);
        gl_attr.set_context_version(3, 3);
        gl_attr.set_depth_size(24);
        gl_attr.set_double_buffer(true);

        let mut window_builder = video_subsystem.window("Visor", config.width, config.height);
        window_builder.opengl().position_centered().resizable();
        if config.fullscreen {
            window_builder.fullscreen_desktop();
        }
        let window = window_builder.build()?;

        let gl_context = window.gl_create_context().map_err(|e| eyre!(e))?;
        window.gl_make_current(&gl_context).map_err(|e| eyre!(e))?;
        if let Err(e) = video_subsystem.gl_set_swap_interval(SwapInterval::VSync) {
            warn!("vsync unavailable: {}", e);
        }

        // SAFETY: the context created above is current on this thread.
        let gl = unsafe {
            glow::Context::from_loader_function(|s| video_subsystem.gl_get_proc_address(s) as *const _)
        };
        let renderer = QuadRenderer::new(&gl)?;
        let event_pump = sdl.event_pump().map_err(|e| eyre!(e))?;

        let (w, h) = window.drawable_size();
        info!("Window {}x{}{}", w, h, if config.fullscreen { " (fullscreen)" } else { "" });

        Ok(Self {
            renderer: Some(renderer),
            gl,
            _gl_context: gl_context,
            window,
            event_pump,
            _sdl: sdl,
            camera: Camera::new(config),
            frame_interval: Duration::from_secs(1) / config.target_fps.max(1),
        })
    }

    /// Render until the window is closed or Escape/Q is pressed.
    ///
    /// `orientation` is `None` when no glasses are in use; the quad then
    /// auto-rotates.
    pub fn run(&mut self, shuttle: &FrameShuttle, orientation: Option<&OrientationHandle>) -> Result<()> {
        let renderer = self
            .renderer
            .as_mut()
            .ok_or_else(|| eyre!("renderer already destroyed"))?;
        let mut auto = AutoRotation::default();
        let mut was_hidden = false;

        'running: loop {
            let frame_start = Instant::now();

            for event in self.event_pump.poll_iter() {
                match event {
                    Event::Quit { .. }
                    | Event::KeyDown {
                        keycode: Some(Keycode::Escape | Keycode::Q),
                        ..
                    } => {
                        info!("Quit event received");
                        break 'running;
                    }
                    Event::Window {
                        win_event: WindowEvent::SizeChanged(w, h),
                        ..
                    } => info!("Window resized to {}x{}", w, h),
                    _ => {}
                }
            }

            if let Some(front) = shuttle.consumer_try_swap() {
                renderer.upload(&self.gl, &front.surface, front.dims_changed);
                metrics::counter!("visor_frames_presented").increment(1);
            }

            let state = live_state(orientation);
            let pose = choose_pose(state.as_ref(), &mut auto);
            let hidden = pose == Pose::Hidden;
            if hidden != was_hidden {
                info!("{}", if hidden { "Waiting for head-tracking calibration" } else { "Head tracking active" });
                was_hidden = hidden;
            }

            let (w, h) = self.window.drawable_size();
            let viewport_aspect = if h == 0 { 1.0 } else { w as f32 / h as f32 };
            let mvp = self.camera.mvp(pose, viewport_aspect, renderer.frame_aspect());
            renderer.draw(&self.gl, (w, h), &mvp, !hidden);
            self.window.gl_swap_window();

            // Covers drivers that ignore the swap interval.
            if let Some(rest) = self.frame_interval.checked_sub(frame_start.elapsed()) {
                std::thread::sleep(rest);
            }
        }

        Ok(())
    }
}

impl Drop for Sdl2Display {
    fn drop(&mut self) {
        if let Some(renderer) = self.renderer.take() {
            renderer.destroy(&self.gl);
        }
    }
}
