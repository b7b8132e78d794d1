//! Vulkan instance creation and physical device selection.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::surface::SurfaceContext;
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance with the surface extensions `display` needs.
///
/// With validation on, `VK_EXT_debug_utils` is enabled when the loader offers
/// it. The returned flag tells whether it was.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    display: RawDisplayHandle,
) -> Result<(ash::Instance, bool)> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Lucent")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    let mut extension_names = ash_window::enumerate_required_extensions(display)
        .map_err(|e| GpuError::ExtensionNotSupported(e.to_string()))?
        .to_vec();
    #[cfg(target_os = "macos")]
    extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    let available_layers = unsafe { entry.enumerate_instance_layer_properties() }?;
    for layer in &layers {
        let found = available_layers.iter().any(|props| {
            props.layer_name_as_c_str().is_ok_and(|name| name == *layer)
        });
        if !found {
            tracing::warn!("Validation layer {:?} not available", layer);
        }
    }

    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    let debug_utils = enable_validation && {
        let available = unsafe { entry.enumerate_instance_extension_properties(None) }?;
        available
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(ash::ext::debug_utils::NAME))
    };
    if debug_utils {
        extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
    } else if enable_validation {
        tracing::warn!("VK_EXT_debug_utils not available, validation messages are not logged");
    }

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None) }?;

    Ok((instance, debug_utils))
}

/// Forwards validation layer messages to `tracing`.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// # Safety
    /// The instance must have been created with `VK_EXT_debug_utils` enabled.
    pub unsafe fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }?;
        Ok(Self { loader, messenger })
    }

    /// # Safety
    /// Must be called once, before the instance is destroyed.
    pub unsafe fn destroy(&self) {
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
        }
    }
}

/// `tracing` level a validation message is logged at.
fn message_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> tracing::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::Level::ERROR
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::Level::WARN
    } else {
        tracing::Level::DEBUG
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: Vulkan passes valid callback data for the duration of the call.
    let message = unsafe { callback_data.as_ref() }
        .and_then(|data| unsafe { data.message_as_c_str() })
        .map_or_else(|| "<no message>".into(), CStr::to_string_lossy);

    match message_level(severity) {
        tracing::Level::ERROR => tracing::error!(target: "vulkan", "[{message_type:?}] {message}"),
        tracing::Level::WARN => tracing::warn!(target: "vulkan", "[{message_type:?}] {message}"),
        _ => tracing::debug!(target: "vulkan", "[{message_type:?}] {message}"),
    }
    vk::FALSE
}

/// A physical device together with the queue family used for rendering and
/// presentation.
#[derive(Debug, Clone, Copy)]
pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
}

/// Select the best physical device that can render to `surface`.
///
/// # Safety
/// The instance and surface must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface: &SurfaceContext,
) -> Result<SelectedDevice> {
    let devices = unsafe { instance.enumerate_physical_devices() }?;

    if devices.is_empty() {
        return Err(GpuError::NoSuitableDevice);
    }

    let mut best: Option<(i32, SelectedDevice)> = None;
    let mut any_meets_requirements = false;

    for device in devices {
        let capabilities = unsafe { GpuCapabilities::query(instance, device) };
        if !capabilities.meets_requirements() {
            continue;
        }
        any_meets_requirements = true;

        let Some(queue_family) = (unsafe { find_queue_family(instance, device, surface) }) else {
            continue;
        };

        let score = score_physical_device(&capabilities);
        if best.map_or(true, |(best_score, _)| score > best_score) {
            best = Some((
                score,
                SelectedDevice {
                    physical_device: device,
                    queue_family,
                },
            ));
        }
    }

    match best {
        Some((_, selected)) => Ok(selected),
        None if any_meets_requirements => Err(GpuError::NoSuitableQueueFamily),
        None => Err(GpuError::NoSuitableDevice),
    }
}

/// First queue family that supports graphics and can present to `surface`.
unsafe fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: &SurfaceContext,
) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    families
        .iter()
        .enumerate()
        .filter(|(_, family)| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(i, _)| i as u32)
        .find(|&i| unsafe { surface.supports_present(physical_device, i) })
}

/// Score a physical device for selection.
fn score_physical_device(capabilities: &GpuCapabilities) -> i32 {
    let mut score = if capabilities.discrete { 1000 } else { 100 };

    // +1 per GB of VRAM
    score += i32::try_from(capabilities.device_local_memory_mb / 1024).unwrap_or(0);

    if capabilities.supports_sample_rate_shading {
        score += 10;
    }

    score
}
