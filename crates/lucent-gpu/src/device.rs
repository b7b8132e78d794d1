//! The device contract the renderer core is written against.
//!
//! [`GpuDevice`] lists every primitive the core needs from the graphics API.
//! The core never calls Vulkan directly; it only orchestrates these calls.
//! [`crate::GpuContext`] implements the contract with ash, and
//! `MockDevice` (feature `mock`) implements it in memory for tests.
//!
//! All handles passed back into a device must have been created by that same
//! device and not yet destroyed.

use crate::error::Result;
use ash::vk;
use std::ptr::NonNull;

/// Current state of the presentation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainInfo {
    /// Format of the presentable images.
    pub format: vk::Format,
    /// Extent of the presentable images.
    pub extent: vk::Extent2D,
    /// Number of presentable images.
    pub image_count: u32,
}

/// Result of acquiring a presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired; `suboptimal` asks for recreation after this frame.
    Acquired { image_index: u32, suboptimal: bool },
    /// The surface changed; nothing was acquired.
    OutOfDate,
}

/// Result of queueing a presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    /// Whether the swapchain should be rebuilt.
    pub const fn needs_recreation(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

/// Resource a dedicated memory block is allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTarget {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// Description of a 2D image.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
}

/// Sampler parameters.
#[derive(Debug, Clone, Copy)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_lod: 0.0,
        }
    }
}

/// Layout transition recorded as an image memory barrier.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
}

/// Render pass state a secondary command buffer is recorded against.
#[derive(Debug, Clone, Copy)]
pub struct Inheritance {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
}

/// One queue submission.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: vk::Fence,
}

/// Attachments of a single-subpass render pass.
///
/// With `samples > 1` the color attachment is multisampled and resolved into
/// the presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
    pub samples: vk::SampleCountFlags,
}

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Resource written into a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    UniformBuffer {
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    },
    CombinedImageSampler {
        view: vk::ImageView,
        sampler: vk::Sampler,
    },
}

/// A single descriptor write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub resource: DescriptorResource,
}

/// Fixed-function state and shaders of a graphics pipeline.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    pub stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub samples: vk::SampleCountFlags,
    pub sample_shading: Option<f32>,
}

/// Primitive operations of the graphics API.
pub trait GpuDevice {
    // Device

    /// Memory types and heaps of the physical device.
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    /// Highest color and depth sample count the device supports.
    fn max_sample_count(&self) -> vk::SampleCountFlags;

    /// Depth format used for depth attachments.
    fn depth_format(&self) -> vk::Format;

    /// Whether `format` supports linear filtering as a blit source.
    fn supports_linear_blit(&self, format: vk::Format) -> bool;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&self) -> Result<()>;

    // Memory

    /// Allocate one dedicated block of `memory_type_index` for `target`.
    fn allocate_memory(
        &self,
        target: MemoryTarget,
        requirements: vk::MemoryRequirements,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory>;

    fn free_memory(&self, memory: vk::DeviceMemory) -> Result<()>;

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()>;

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()>;

    /// Map host-visible memory. The pointer is valid until `unmap_memory`.
    fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<u8>>;

    fn unmap_memory(&self, memory: vk::DeviceMemory);

    // Buffers and images

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<vk::Buffer>;

    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image>;

    fn destroy_image(&self, image: vk::Image);

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
    ) -> Result<vk::ImageView>;

    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler>;

    fn destroy_sampler(&self, sampler: vk::Sampler);

    // Synchronization

    fn create_semaphore(&self) -> Result<vk::Semaphore>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;

    fn destroy_fence(&self, fence: vk::Fence);

    /// Wait until every fence is signaled. Returns [`crate::GpuError::Timeout`]
    /// when `timeout_ns` elapses first.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<()>;

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()>;

    // Command buffers

    /// Create a resettable pool on the graphics queue family.
    fn create_command_pool(&self) -> Result<vk::CommandPool>;

    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Begin recording. Secondary buffers pass the render pass they continue.
    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
        inheritance: Option<Inheritance>,
    ) -> Result<()>;

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    // Recording

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    );

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);

    fn cmd_execute_commands(&self, cmd: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]);

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);

    /// Set a full-extent viewport and scissor.
    fn cmd_set_viewport_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D);

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer);

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    );

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );

    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32);

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32);

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    );

    /// Copy tightly packed texels into mip level 0 of an image in
    /// `TRANSFER_DST_OPTIMAL`.
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
        extent: vk::Extent2D,
    );

    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, barrier: &ImageBarrier);

    /// Blit within one image, from a `TRANSFER_SRC` level into a `TRANSFER_DST` level.
    fn cmd_blit_image(&self, cmd: vk::CommandBuffer, image: vk::Image, region: &vk::ImageBlit);

    // Queues

    fn queue_submit(&self, submission: &Submission<'_>) -> Result<()>;

    fn queue_wait_idle(&self) -> Result<()>;

    // Presentation

    fn swapchain_info(&self) -> SwapchainInfo;

    /// Views of the presentable images, indexed by image index.
    fn swapchain_image_views(&self) -> Vec<vk::ImageView>;

    /// Rebuild the presentation surface at `extent`.
    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> Result<SwapchainInfo>;

    fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireOutcome>;

    fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<PresentOutcome>;

    // Render passes and pipelines

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass>;

    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule>;

    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout>;

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout>;

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<vk::Pipeline>;

    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // Descriptors

    /// Create a pool whose sets can be freed individually.
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>>;

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> Result<()>;

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);
}
