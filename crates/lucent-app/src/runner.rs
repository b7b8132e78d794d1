//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lucent_gpu::GpuContextBuilder;
use lucent_render::{Renderer, RendererConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::RenderApp;
use crate::context::AppContext;

/// Application configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Prefer FIFO presentation.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Lucent".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: true,
            validation: cfg!(debug_assertions),
            frames_in_flight: RendererConfig::default().frames_in_flight,
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    #[must_use]
    pub const fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    #[must_use]
    pub const fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    #[must_use]
    pub const fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames_in_flight = frames_in_flight;
        self
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|fps| *fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Run a `RenderApp` with the given configuration.
///
/// Initializes logging from `RUST_LOG` (default `info`), creates the window,
/// GPU context and renderer, and runs the event loop until the window closes.
pub fn run_app<A: RenderApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };
    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Implements winit's `ApplicationHandler` on top of a `RenderApp`.
struct AppRunner<A: RenderApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

struct AppState<A: RenderApp> {
    app: A,
    ctx: AppContext,
    target_frame_time: Option<Duration>,
}

impl<A: RenderApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = &mut self.state else {
            return;
        };
        if state.app.on_event(&event) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(state) = self.state.take() {
                    state.shutdown();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = state.render_frame() {
                    error!("Render error: {e:#}");
                    self.failure = Some(e);
                    if let Some(state) = self.state.take() {
                        state.shutdown();
                    }
                    event_loop.exit();
                }
            }
            WindowEvent::Resized(size) => {
                state.ctx.surface.notify_resized(size.width, size.height);
                state.app.on_resize(&mut state.ctx, size.width, size.height);
            }
            _ => {}
        }
    }

    fn device_event(&mut self, _event_loop: &ActiveEventLoop, device_id: DeviceId, event: DeviceEvent) {
        if let Some(state) = &mut self.state {
            state.app.on_device_event(device_id, &event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: RenderApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let size = window.inner_size();
        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .vsync(self.config.vsync)
            .build(window.as_ref(), size.width.max(1), size.height.max(1))?;
        info!("GPU: {}", gpu.capabilities().summary());

        let renderer = Renderer::new(
            gpu,
            RendererConfig::default().with_frames_in_flight(self.config.frames_in_flight),
        )?;
        let mut ctx = AppContext::new(window, renderer);
        let app = A::init(&mut ctx)?;

        Ok(AppState {
            app,
            ctx,
            target_frame_time: self.config.target_frame_time(),
        })
    }
}

impl<A: RenderApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();
        let dt = frame_start
            .duration_since(self.ctx.last_frame_time)
            .as_secs_f32();
        self.ctx.last_frame_time = frame_start;

        self.app.update(&mut self.ctx, dt);
        self.app.render(&mut self.ctx)?;
        self.ctx.frame_count += 1;

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }
        Ok(())
    }

    fn shutdown(mut self) {
        info!("Shutting down after {} frames", self.ctx.frame_count);
        if let Err(e) = self.ctx.renderer.wait_idle() {
            error!("Failed to wait idle: {e}");
        }
        self.app.cleanup(&mut self.ctx);
        // Handles, then the renderer, then the window.
        drop(self.app);
        drop(self.ctx);
        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_pacing_follows_target_fps() {
        let config = AppConfig::new("test").with_target_fps(50);
        assert_eq!(config.target_frame_time(), Some(Duration::from_millis(20)));
        assert_eq!(AppConfig::default().target_frame_time(), None);
        assert_eq!(AppConfig::default().with_target_fps(0).target_frame_time(), None);
    }

    #[test]
    fn defaults_match_the_renderer() {
        let config = AppConfig::default();
        assert_eq!(config.frames_in_flight, RendererConfig::default().frames_in_flight);
        assert_eq!(config.with_frames_in_flight(3).frames_in_flight, 3);
    }
}
