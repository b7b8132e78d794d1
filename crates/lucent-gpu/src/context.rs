//! GPU context management.
//!
//! [`GpuContext`] owns the Vulkan instance, device, queue, surface and
//! swapchain, and implements [`GpuDevice`] on top of them.

use crate::capabilities::GpuCapabilities;
use crate::device::{
    AcquireOutcome, DescriptorBinding, DescriptorResource, DescriptorWrite, GpuDevice,
    GraphicsPipelineDesc, ImageBarrier, ImageDesc, Inheritance, MemoryTarget, PresentOutcome,
    RenderPassDesc, SamplerDesc, Submission, SwapchainInfo,
};
use crate::descriptors::descriptor_type;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device, DebugMessenger};
use crate::pipeline;
use crate::surface::SurfaceContext;
use crate::swapchain::{calculate_extent, Swapchain};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::ffi::CStr;
use std::ptr::NonNull;

const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    /// Present when validation is on and `VK_EXT_debug_utils` was available.
    debug_messenger: Option<DebugMessenger>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    capabilities: GpuCapabilities,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    depth_format: vk::Format,

    /// `None` only after shutdown.
    allocator: Mutex<Option<Allocator>>,
    /// Live dedicated blocks, keyed by their memory handle.
    allocations: Mutex<HashMap<vk::DeviceMemory, Allocation>>,

    queue_family: u32,
    queue: vk::Queue,

    surface: SurfaceContext,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: Swapchain,
    vsync: bool,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the graphics and present queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Get the graphics and present queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    fn with_allocator<T>(&self, f: impl FnOnce(&mut Allocator) -> Result<T>) -> Result<T> {
        let mut guard = self.allocator.lock();
        let allocator = guard
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?;
        f(allocator)
    }

    fn format_features(&self, format: vk::Format) -> vk::FormatFeatureFlags {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
        .optimal_tiling_features
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.swapchain.destroy(&self.device, &self.swapchain_loader);

            let leaked = self.allocations.get_mut().len();
            if leaked > 0 {
                tracing::warn!("{leaked} device memory blocks still allocated at shutdown");
            }
            if let Some(mut allocator) = self.allocator.get_mut().take() {
                for (_, allocation) in self.allocations.get_mut().drain() {
                    let _ = allocator.free(allocation);
                }
                // Shutdown allocator BEFORE destroying device
                drop(allocator);
            }

            self.device.destroy_device(None);
            self.surface.destroy();
            if let Some(messenger) = self.debug_messenger.take() {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    vsync: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Lucent".to_string(),
            enable_validation: cfg!(debug_assertions),
            vsync: true,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Prefer FIFO presentation over mailbox.
    pub fn vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Build the GPU context presenting to `window` at `width` x `height`.
    pub fn build<W>(self, window: &W, width: u32, height: u32) -> Result<GpuContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();

        // Load Vulkan entry point
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let (instance, debug_utils) =
            unsafe { create_instance(&entry, &self.app_name, self.enable_validation, display) }?;
        let debug_messenger = if debug_utils {
            match unsafe { DebugMessenger::new(&entry, &instance) } {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    tracing::warn!("Failed to create debug messenger: {e}");
                    None
                }
            }
        } else {
            None
        };

        let surface = unsafe { SurfaceContext::from_window(&entry, &instance, window) }?;

        let selected = unsafe { select_physical_device(&instance, &surface) }?;
        let physical_device = selected.physical_device;
        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let device = unsafe {
            create_device(
                &instance,
                physical_device,
                selected.queue_family,
                &capabilities,
            )
        }?;
        let queue = unsafe { device.get_device_queue(selected.queue_family, 0) };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let depth_format = DEPTH_FORMAT_CANDIDATES
            .into_iter()
            .find(|&format| {
                unsafe { instance.get_physical_device_format_properties(physical_device, format) }
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            })
            .ok_or(GpuError::NoSuitableDevice)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);
        let swapchain = unsafe {
            create_swapchain(
                &device,
                &swapchain_loader,
                &surface,
                physical_device,
                self.vsync,
                vk::Extent2D { width, height },
                None,
            )
        }?;

        Ok(GpuContext {
            entry,
            instance,
            debug_messenger,
            physical_device,
            device,
            capabilities,
            memory_properties,
            depth_format,
            allocator: Mutex::new(Some(allocator)),
            allocations: Mutex::new(HashMap::new()),
            queue_family: selected.queue_family,
            queue,
            surface,
            swapchain_loader,
            swapchain,
            vsync: self.vsync,
        })
    }
}

/// Required device extensions.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::swapchain::NAME]
}

/// Create the logical device with a single graphics and present queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    capabilities: &GpuCapabilities,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extension_names: Vec<*const std::ffi::c_char> = required_device_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let features = vk::PhysicalDeviceFeatures::default()
        .sample_rate_shading(capabilities.supports_sample_rate_shading);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }?;
    Ok(device)
}

/// Build a swapchain sized to the surface, falling back to `desired` when the
/// surface leaves the extent open.
///
/// # Safety
/// All handles must be valid.
unsafe fn create_swapchain(
    device: &ash::Device,
    swapchain_loader: &ash::khr::swapchain::Device,
    surface: &SurfaceContext,
    physical_device: vk::PhysicalDevice,
    vsync: bool,
    desired: vk::Extent2D,
    old: Option<vk::SwapchainKHR>,
) -> Result<Swapchain> {
    let surface_caps = unsafe { surface.capabilities(physical_device) }?;
    let extent = calculate_extent(&surface_caps.capabilities, desired.width, desired.height);
    unsafe {
        Swapchain::new(
            device,
            swapchain_loader,
            surface.surface,
            &surface_caps.capabilities,
            surface_caps.recommended_format()?,
            surface_caps.recommended_present_mode(vsync),
            extent,
            old,
        )
    }
}

/// Memory location gpu-allocator should search for the given property flags.
fn memory_location(properties: vk::MemoryPropertyFlags) -> MemoryLocation {
    if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        MemoryLocation::CpuToGpu
    } else if properties.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
        MemoryLocation::GpuOnly
    } else {
        MemoryLocation::Unknown
    }
}

fn subresource_range(aspect: vk::ImageAspectFlags, base_mip: u32, levels: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(base_mip)
        .level_count(levels)
        .base_array_layer(0)
        .layer_count(1)
}

impl GpuDevice for GpuContext {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn max_sample_count(&self) -> vk::SampleCountFlags {
        self.capabilities.max_sample_count
    }

    fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    fn supports_linear_blit(&self, format: vk::Format) -> bool {
        self.format_features(format)
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    fn allocate_memory(
        &self,
        target: MemoryTarget,
        requirements: vk::MemoryRequirements,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory> {
        let properties = self.memory_properties.memory_types[memory_type_index as usize].property_flags;
        let (allocation_scheme, linear) = match target {
            MemoryTarget::Buffer(buffer) => (AllocationScheme::DedicatedBuffer(buffer), true),
            MemoryTarget::Image(image) => (AllocationScheme::DedicatedImage(image), false),
        };
        let requirements = vk::MemoryRequirements {
            memory_type_bits: 1 << memory_type_index,
            ..requirements
        };

        let allocation = self.with_allocator(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: "lucent",
                    requirements,
                    location: memory_location(properties),
                    linear,
                    allocation_scheme,
                })
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        })?;

        // SAFETY: dedicated allocations own their whole block.
        let memory = unsafe { allocation.memory() };
        self.allocations.lock().insert(memory, allocation);
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) -> Result<()> {
        let allocation = self
            .allocations
            .lock()
            .remove(&memory)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown device memory {memory:?}")))?;
        self.with_allocator(|allocator| {
            allocator
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        })
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }?;
        Ok(())
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }?;
        Ok(())
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<u8>> {
        // gpu-allocator keeps host-visible blocks persistently mapped.
        self.allocations
            .lock()
            .get(&memory)
            .and_then(Allocation::mapped_ptr)
            .map(NonNull::cast)
            .ok_or_else(|| GpuError::InvalidState(format!("device memory {memory:?} is not mapped")))
    }

    fn unmap_memory(&self, _memory: vk::DeviceMemory) {}

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }?;
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_info, None) }?;
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
    ) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(subresource_range(aspect, 0, mip_levels));
        let view = unsafe { self.device.create_image_view(&view_info, None) }?;
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.filter)
            .min_filter(desc.filter)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .min_lod(0.0)
            .max_lod(desc.max_lod)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);
        let sampler = unsafe { self.device.create_sampler(&sampler_info, None) }?;
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore =
            unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }?;
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence =
            unsafe { self.device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }?;
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<()> {
        match unsafe { self.device.wait_for_fences(fences, true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        unsafe { self.device.reset_fences(fences) }?;
        Ok(())
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }?;
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }?;
        Ok(buffers)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, buffers) };
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }?;
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
        inheritance: Option<Inheritance>,
    ) -> Result<()> {
        let inheritance_info = inheritance.map(|inheritance| {
            vk::CommandBufferInheritanceInfo::default()
                .render_pass(inheritance.render_pass)
                .subpass(0)
                .framebuffer(inheritance.framebuffer)
        });
        let mut begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        if let Some(info) = inheritance_info.as_ref() {
            begin_info = begin_info.inheritance_info(info);
        }
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }?;
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd) }?;
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    ) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);
        unsafe { self.device.cmd_begin_render_pass(cmd, &begin_info, contents) };
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) };
    }

    fn cmd_execute_commands(&self, cmd: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        if !secondaries.is_empty() {
            unsafe { self.device.cmd_execute_commands(cmd, secondaries) };
        }
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
        };
    }

    fn cmd_set_viewport_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        unsafe { self.device.cmd_bind_vertex_buffers(cmd, 0, &[buffer], &[0]) };
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    ) {
        unsafe { self.device.cmd_bind_index_buffer(cmd, buffer, 0, index_type) };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                sets,
                &[],
            );
        }
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe { self.device.cmd_push_constants(cmd, layout, stages, offset, data) };
    }

    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32) {
        unsafe { self.device.cmd_draw(cmd, vertex_count, 1, 0, 0) };
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32) {
        unsafe { self.device.cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0) };
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        let region = vk::BufferCopy::default().size(size);
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &[region]) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
        extent: vk::Extent2D,
    ) {
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                src,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, barrier: &ImageBarrier) {
        let image_barrier = vk::ImageMemoryBarrier::default()
            .image(barrier.image)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(subresource_range(
                barrier.aspect,
                barrier.base_mip_level,
                barrier.level_count,
            ));
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier],
            );
        }
    }

    fn cmd_blit_image(&self, cmd: vk::CommandBuffer, image: vk::Image, region: &vk::ImageBlit) {
        unsafe {
            self.device.cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(region),
                vk::Filter::LINEAR,
            );
        }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn queue_submit(&self, submission: &Submission<'_>) -> Result<()> {
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal_semaphores);
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], submission.fence)
        }?;
        Ok(())
    }

    fn queue_wait_idle(&self) -> Result<()> {
        unsafe { self.device.queue_wait_idle(self.queue) }?;
        Ok(())
    }

    fn swapchain_info(&self) -> SwapchainInfo {
        self.swapchain.info()
    }

    fn swapchain_image_views(&self) -> Vec<vk::ImageView> {
        self.swapchain.image_views.clone()
    }

    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> Result<SwapchainInfo> {
        self.wait_idle()?;

        let swapchain = unsafe {
            create_swapchain(
                &self.device,
                &self.swapchain_loader,
                &self.surface,
                self.physical_device,
                self.vsync,
                extent,
                Some(self.swapchain.swapchain),
            )
        }?;
        let old = std::mem::replace(&mut self.swapchain, swapchain);
        unsafe { old.destroy(&self.device, &self.swapchain_loader) };

        Ok(self.swapchain.info())
    }

    fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireOutcome> {
        unsafe {
            self.swapchain
                .acquire_next_image(&self.swapchain_loader, semaphore, timeout_ns)
        }
    }

    fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<PresentOutcome> {
        unsafe {
            self.swapchain.present(
                &self.swapchain_loader,
                self.queue,
                image_index,
                &[wait_semaphore],
            )
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass> {
        unsafe { pipeline::create_render_pass(&self.device, desc) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_info, None) }?;
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let module_info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { self.device.create_shader_module(&module_info, None) }?;
        Ok(module)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<_> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }?;
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&layout_info, None) }?;
        Ok(layout)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<vk::Pipeline> {
        unsafe { pipeline::create_graphics_pipeline(&self.device, desc) }
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None) }?;
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }?;
        Ok(sets)
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> Result<()> {
        if sets.is_empty() {
            return Ok(());
        }
        unsafe { self.device.free_descriptor_sets(pool, sets) }?;
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        // Infos must outlive the write structs that point at them.
        let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::UniformBuffer { buffer, range } => {
                    [vk::DescriptorBufferInfo::default().buffer(buffer).offset(0).range(range)]
                }
                DescriptorResource::CombinedImageSampler { .. } => {
                    [vk::DescriptorBufferInfo::default()]
                }
            })
            .collect();
        let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::CombinedImageSampler { view, sampler } => {
                    [vk::DescriptorImageInfo::default()
                        .image_view(view)
                        .sampler(sampler)
                        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]
                }
                DescriptorResource::UniformBuffer { .. } => [vk::DescriptorImageInfo::default()],
            })
            .collect();

        let vk_writes: Vec<_> = writes
            .iter()
            .enumerate()
            .map(|(i, write)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .dst_array_element(0)
                    .descriptor_type(descriptor_type(&write.resource));
                match write.resource {
                    DescriptorResource::UniformBuffer { .. } => base.buffer_info(&buffer_infos[i]),
                    DescriptorResource::CombinedImageSampler { .. } => {
                        base.image_info(&image_infos[i])
                    }
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }
}
