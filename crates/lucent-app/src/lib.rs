//! Windowed application runner for the Lucent renderer.
//!
//! This crate handles the boilerplate around a [`Renderer`]:
//! - Window creation and the winit event loop
//! - GPU context and renderer initialization
//! - Forwarding window resizes to the renderer
//! - Frame pacing and orderly shutdown
//!
//! # Example
//!
//! ```no_run
//! use lucent_app::{run_app, AppConfig, AppContext, RenderApp};
//! use lucent_render::{
//!     ColorVertex, Command, CommandHandle, Mesh, PipelineHandle, PipelineSettings,
//!     RenderPassHandle, RenderPassSettings, ShaderStage,
//! };
//! use lucent_gpu::vk;
//!
//! struct Triangle {
//!     pass: RenderPassHandle,
//!     pipeline: PipelineHandle,
//!     command: CommandHandle,
//! }
//!
//! impl RenderApp for Triangle {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         let pass = ctx.renderer.create_render_pass(RenderPassSettings::default())?;
//!         let shaders = vec![
//!             ShaderStage::from_spirv_bytes(vk::ShaderStageFlags::VERTEX, &std::fs::read("tri.vert.spv")?)?,
//!             ShaderStage::from_spirv_bytes(vk::ShaderStageFlags::FRAGMENT, &std::fs::read("tri.frag.spv")?)?,
//!         ];
//!         let pipeline = ctx
//!             .renderer
//!             .create_pipeline(PipelineSettings::new(shaders).for_vertex::<ColorVertex>(), &pass)?;
//!         let mesh = Mesh::new(&[ColorVertex::default(); 3])?;
//!         let command = ctx.renderer.add_command(Command::new().with_mesh(mesh))?;
//!         Ok(Self { pass, pipeline, command })
//!     }
//!
//!     fn update(&mut self, _ctx: &mut AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, ctx: &mut AppContext) -> anyhow::Result<()> {
//!         if ctx.renderer.start_frame(&self.pass)?.is_started() {
//!             ctx.renderer.draw(&self.command, &self.pipeline)?;
//!             ctx.renderer.present_frame()?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<Triangle>(AppConfig::new("Triangle"))
//! }
//! ```

mod app;
mod context;
mod runner;

pub use app::RenderApp;
pub use context::AppContext;
pub use runner::{run_app, AppConfig};

// Re-export commonly used types for convenience
pub use lucent_gpu::{GpuContext, GpuContextBuilder};
pub use lucent_render::{Camera, Renderer};
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
