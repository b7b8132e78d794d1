//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,
    /// Whether the device is a discrete GPU
    pub discrete: bool,

    /// Highest sample count usable for both color and depth attachments
    pub max_sample_count: vk::SampleCountFlags,
    /// Per-sample shading support
    pub supports_sample_rate_shading: bool,
    /// Anisotropic filtering support
    pub supports_sampler_anisotropy: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum number of live device memory allocations
    pub max_memory_allocation_count: u32,

    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            discrete: properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU,
            max_sample_count: highest_sample_count(
                properties.limits.framebuffer_color_sample_counts
                    & properties.limits.framebuffer_depth_sample_counts,
            ),
            supports_sample_rate_shading: features.sample_rate_shading == vk::TRUE,
            supports_sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            device_local_memory_mb,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,
            available_extensions,
        }
    }

    /// Check if the GPU meets minimum requirements for the renderer.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        if api_major < 1 || (api_major == 1 && api_minor < 1) {
            return false;
        }

        self.available_extensions
            .contains(ash::khr::swapchain::NAME.to_str().unwrap_or_default())
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - up to {:?} MSAA",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.max_sample_count,
        )
    }
}

/// Highest single sample count contained in `counts`.
pub fn highest_sample_count(counts: vk::SampleCountFlags) -> vk::SampleCountFlags {
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|count| counts.contains(*count))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn highest_sample_count_picks_largest_bit() {
        assert_eq!(
            highest_sample_count(
                vk::SampleCountFlags::TYPE_1
                    | vk::SampleCountFlags::TYPE_2
                    | vk::SampleCountFlags::TYPE_8
            ),
            vk::SampleCountFlags::TYPE_8
        );
        assert_eq!(
            highest_sample_count(vk::SampleCountFlags::empty()),
            vk::SampleCountFlags::TYPE_1
        );
    }
}
