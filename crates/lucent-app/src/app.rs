//! `RenderApp` trait definition.

use crate::context::AppContext;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};

/// Trait for Lucent applications.
///
/// The runner creates the window, the GPU context and the renderer, and calls
/// these methods from the event loop. Render passes, pipelines and commands
/// are created through [`AppContext::renderer`] and kept alive by their
/// handles.
pub trait RenderApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the window and renderer have been created.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before rendering. `dt` is the time since the last
    /// frame in seconds.
    fn update(&mut self, ctx: &mut AppContext, dt: f32);

    /// Render a frame.
    ///
    /// Start a frame on a render pass, draw commands into it and present it.
    /// A skipped frame (out-of-date or minimised surface) is not an error.
    fn render(&mut self, ctx: &mut AppContext) -> anyhow::Result<()>;

    /// Handle window resize.
    ///
    /// The renderer rebuilds the swapchain on its own at the next frame. Use
    /// this to update size-dependent state such as the camera aspect.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) {}

    /// Handle window events. Return `true` to stop further processing.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Handle raw device input.
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Cleanup before shutdown.
    ///
    /// The device is idle. Dropped handles are destroyed when the renderer
    /// goes away right after this call.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
