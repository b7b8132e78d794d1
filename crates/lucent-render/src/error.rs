//! Renderer error types.

use crate::handle::{CommandId, PipelineId, RenderPassId};
use lucent_gpu::GpuError;
use thiserror::Error;

/// Errors returned by the client draw API.
#[derive(Error, Debug)]
pub enum RenderError {
    /// A device operation failed.
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error("Unknown render pass {0}")]
    UnknownRenderPass(RenderPassId),

    #[error("Unknown pipeline {0}")]
    UnknownPipeline(PipelineId),

    #[error("Unknown command {0}")]
    UnknownCommand(CommandId),

    /// An image index beyond the current presentable image count.
    #[error("Image index {index} out of range for {count} images")]
    ImageIndexOutOfRange { index: u32, count: usize },

    /// A draw used a pipeline created for another render pass.
    #[error("Pipeline {pipeline} does not belong to the active render pass {render_pass}")]
    PipelineNotInActivePass {
        pipeline: PipelineId,
        render_pass: RenderPassId,
    },

    /// A command was drawn twice in one frame.
    #[error("Command {0} was already drawn this frame")]
    CommandAlreadyDrawn(CommandId),

    #[error("A frame is already in progress")]
    FrameAlreadyStarted,

    #[error("No frame in progress")]
    NoActiveFrame,

    /// Settings, shaders or mesh data that cannot be turned into GPU objects.
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

/// Result type for renderer operations.
pub type Result<T> = std::result::Result<T, RenderError>;
