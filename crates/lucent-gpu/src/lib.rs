//! Vulkan device layer for the Lucent renderer.
//!
//! This crate provides:
//! - The [`GpuDevice`] contract and its ash implementation, [`GpuContext`]
//! - Vulkan instance, device, surface and swapchain management
//! - GPU capability detection
//! - The allocation table and device-resident buffers and images
//! - Command pools and one-shot transfer submission
//! - The frame synchronization ring

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod image;
pub mod instance;
pub mod memory;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod pipeline;
pub mod resources;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::{DeviceBuffer, Residency};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{begin_secondary, execute_single_time_commands, CommandPool};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{merge_bindings, DescriptorPool};
pub use device::{
    AcquireOutcome, DescriptorBinding, DescriptorResource, DescriptorWrite, GpuDevice,
    GraphicsPipelineDesc, ImageBarrier, ImageDesc, Inheritance, MemoryTarget, PresentOutcome,
    RenderPassDesc, SamplerDesc, Submission, SwapchainInfo,
};
pub use error::{GpuError, Result};
pub use image::{mip_level_count, texel_size, DeviceImage, ImageProperties, SampledImage};
pub use memory::{find_memory_type, Allocation, AllocationId, AllocationTable};
#[cfg(any(test, feature = "mock"))]
pub use mock::{FenceState, MockCommand, MockDevice, MockEvent};
pub use resources::ResourceContext;
pub use sync::{FrameSlot, FrameSyncRing};

pub use ash::vk;
