//! Rendering layer for the Lucent renderer.
//!
//! This crate provides:
//! - Reference-counted handles to render passes, pipelines and commands
//! - Render passes with their framebuffers and pipelines
//! - Dirty-tracked commands that re-record only when their meshes change
//! - Meshes with uniform buffers, sampled images and push constants
//! - The [`Renderer`] frame loop and its swapchain recreation cascade
//! - Camera and view management

pub mod camera;
pub mod command;
pub mod error;
pub mod handle;
pub mod mesh;
pub mod pipeline;
pub mod render_pass;
pub mod renderer;
pub mod settings;
pub mod shader;
pub mod uniform;
pub mod vertex;

pub use camera::{Camera, Transform};
pub use command::Command;
pub use error::{RenderError, Result};
pub use handle::{CommandHandle, CommandId, PipelineHandle, PipelineId, RenderPassHandle, RenderPassId};
pub use mesh::Mesh;
pub use pipeline::Pipeline;
pub use render_pass::RenderPass;
pub use renderer::{FrameStatus, Renderer, SurfaceNotifier};
pub use settings::{PipelineSettings, RenderPassSettings, RendererConfig};
pub use shader::ShaderStage;
pub use uniform::{PushConstant, UniformBuffer, UniformImage};
pub use vertex::{ColorVertex, TexturedVertex, Vertex, VertexAttribute, VertexLayout};
