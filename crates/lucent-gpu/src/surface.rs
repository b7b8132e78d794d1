//! Surface management for windowed rendering.
//!
//! Hides the raw-window-handle plumbing from application code.

use crate::error::{GpuError, Result};
use crate::swapchain::{select_present_mode, select_surface_format};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A Vulkan surface for a window.
pub struct SurfaceContext {
    /// The Vulkan surface handle.
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader.
    pub surface_loader: ash::khr::surface::Instance,
}

impl SurfaceContext {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The instance must be valid and outlive the surface. The window must
    /// outlive the surface.
    pub unsafe fn from_window<W>(entry: &ash::Entry, instance: &ash::Instance, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let surface_loader = ash::khr::surface::Instance::new(entry, instance);

        Ok(Self {
            surface,
            surface_loader,
        })
    }

    /// Whether `queue_family` of `physical_device` can present to this surface.
    ///
    /// # Safety
    /// The physical device must belong to the surface's instance.
    pub unsafe fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> bool {
        unsafe {
            self.surface_loader.get_physical_device_surface_support(
                physical_device,
                queue_family,
                self.surface,
            )
        }
        .unwrap_or(false)
    }

    /// Query surface capabilities.
    ///
    /// # Safety
    /// The physical device must belong to the surface's instance.
    pub unsafe fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceCapabilities> {
        unsafe {
            let capabilities = self
                .surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)?;

            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)?;

            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)?;

            Ok(SurfaceCapabilities {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// The surface must not be in use.
    pub unsafe fn destroy(&self) {
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
    }
}

/// Surface capabilities query result.
pub struct SurfaceCapabilities {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceCapabilities {
    /// Get the recommended surface format.
    pub fn recommended_format(&self) -> Result<vk::SurfaceFormatKHR> {
        select_surface_format(&self.formats)
    }

    /// Get the recommended present mode.
    pub fn recommended_present_mode(&self, vsync: bool) -> vk::PresentModeKHR {
        select_present_mode(&self.present_modes, vsync)
    }
}
