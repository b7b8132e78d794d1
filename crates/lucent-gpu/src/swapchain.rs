//! Swapchain management.

use crate::device::{AcquireOutcome, PresentOutcome, SwapchainInfo};
use crate::error::{GpuError, Result};
use ash::vk;

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a new swapchain.
    ///
    /// # Safety
    /// All handles must be valid.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        surface_capabilities: &vk::SurfaceCapabilitiesKHR,
        surface_format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        extent: vk::Extent2D,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        let image_count = select_image_count(surface_capabilities);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or_default());

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }?;

        let image_views: Vec<_> = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );

                unsafe { device.create_image_view(&view_info, None) }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        tracing::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            images.len(),
            surface_format.format,
            present_mode
        );

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            extent,
        })
    }

    pub fn info(&self) -> SwapchainInfo {
        SwapchainInfo {
            format: self.format,
            extent: self.extent,
            image_count: self.images.len() as u32,
        }
    }

    /// Acquire the next image.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn acquire_next_image(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireOutcome> {
        let result = unsafe {
            swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(GpuError::Timeout),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present an image.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn present(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { swapchain_loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Destroy the swapchain.
    ///
    /// # Safety
    /// All handles must be valid and swapchain must not be in use.
    pub unsafe fn destroy(
        &self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        for &view in &self.image_views {
            unsafe { device.destroy_image_view(view, None) };
        }
        unsafe { swapchain_loader.destroy_swapchain(self.swapchain, None) };
    }
}

/// One more image than the minimum, clamped to the maximum if there is one.
pub const fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        image_count
    }
}

/// Select the best surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".to_string()))
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync && available.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        // FIFO is always supported
        vk::PresentModeKHR::FIFO
    }
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width == u32::MAX {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    } else {
        capabilities.current_extent
    }
}
