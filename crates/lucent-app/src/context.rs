//! Application context.

use std::sync::Arc;
use std::time::Instant;

use lucent_gpu::{vk, GpuContext};
use lucent_render::{Renderer, SurfaceNotifier};
use winit::window::Window;

/// Application context shared across all app methods.
pub struct AppContext {
    /// The renderer presenting to the window. Dropped before the window.
    pub renderer: Renderer<GpuContext>,
    /// The window handle.
    pub window: Arc<Window>,
    /// Total frames started.
    pub frame_count: u64,
    pub(crate) surface: SurfaceNotifier,
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    pub(crate) fn new(window: Arc<Window>, renderer: Renderer<GpuContext>) -> Self {
        let surface = renderer.surface_notifier();
        Self {
            renderer,
            window,
            frame_count: 0,
            surface,
            last_frame_time: Instant::now(),
        }
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.renderer.swapchain_info().extent
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }
}
