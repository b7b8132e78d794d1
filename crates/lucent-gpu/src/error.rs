//! GPU error types.

use crate::memory::AllocationId;
use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// The selected GPU has no queue family that can both render and present.
    #[error("No queue family supports graphics and presentation")]
    NoSuitableQueueFamily,

    /// No memory type satisfies both the resource and the requested properties.
    #[error("No memory type in {type_bits:#b} satisfies {properties:?}")]
    NoSuitableMemoryType {
        /// Memory types the resource accepts.
        type_bits: u32,
        /// Property flags that were requested.
        properties: vk::MemoryPropertyFlags,
    },

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The allocation table has no live entry for this id.
    #[error("Unknown allocation {0}")]
    AllocationNotFound(AllocationId),

    /// Host access was requested for device-only memory.
    #[error("Allocation {0} is not host visible")]
    NotHostVisible(AllocationId),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// A fence or acquire wait ran into its timeout.
    #[error("Timed out waiting for the GPU")]
    Timeout,

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
