//! Vulkan bootstrap: instance, surface, device selection, allocator.
//!
//! The renderer targets Vulkan 1.3 for dynamic rendering and asks for the
//! descriptor-indexing, buffer-device-address and draw-indirect-count
//! features the GPU-driven pipeline depends on. A GPU missing any of them is
//! rejected during device selection.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::error::{RenderError, RenderResult};

const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Everything created once at startup and shared by the rest of the renderer.
pub struct DeviceContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue_family: u32,
    pub queue: vk::Queue,
    pub swapchain_loader: ash::khr::swapchain::Device,
    pub allocator: Arc<Mutex<Allocator>>,
}

impl DeviceContext {
    pub fn new(
        window: &(impl HasDisplayHandle + HasWindowHandle),
        validation: bool,
    ) -> RenderResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RenderError::InitializationFailed(format!("failed to load Vulkan: {e}")))?;

        let display_handle = window
            .display_handle()
            .map_err(|e| RenderError::SurfaceCreationFailed(e.to_string()))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| RenderError::SurfaceCreationFailed(e.to_string()))?
            .as_raw();

        let (instance, debug_utils) =
            create_instance(&entry, display_handle, validation)?;

        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .map_err(|e| RenderError::SurfaceCreationFailed(format!("{e:?}")))?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        let (physical_device, queue_family) =
            select_physical_device(&instance, &surface_loader, surface)?;
        let device = create_logical_device(&instance, physical_device, queue_family)?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| {
            RenderError::InitializationFailed(format!("failed to create memory allocator: {e}"))
        })?;

        Ok(Self {
            entry,
            instance,
            debug_utils,
            surface,
            surface_loader,
            physical_device,
            device,
            queue_family,
            queue,
            swapchain_loader,
            allocator: Arc::new(Mutex::new(allocator)),
        })
    }

    pub fn surface_capabilities(&self) -> RenderResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }
        .map_err(RenderError::from)
    }

    /// Pick the surface format the swapchain and display transform will use.
    /// Prefers 8-bit UNORM BGRA/RGBA, falls back to whatever is first.
    pub fn surface_format(&self) -> RenderResult<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)
        }?;
        if formats.is_empty() {
            return Err(RenderError::InitializationFailed(
                "surface reports no formats".to_string(),
            ));
        }
        Ok(formats
            .iter()
            .copied()
            .find(|f| {
                matches!(
                    f.format,
                    vk::Format::B8G8R8A8_UNORM | vk::Format::R8G8B8A8_UNORM
                ) && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .unwrap_or(formats[0]))
    }

    pub fn wait_idle(&self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("device_wait_idle failed: {e:?}");
        }
    }

    /// Tear down everything this context owns. Must run last, after all
    /// resources allocated from the device are gone. The allocator drops
    /// before the device because freeing its heaps needs a live device.
    pub fn destroy(self) {
        if Arc::strong_count(&self.allocator) > 1 {
            log::warn!("allocator still shared at device teardown");
        }
        drop(self.allocator);
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((debug_utils, messenger)) = self.debug_utils {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn create_instance(
    entry: &ash::Entry,
    display_handle: raw_window_handle::RawDisplayHandle,
    validation: bool,
) -> RenderResult<(
    ash::Instance,
    Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
)> {
    let validation_available = validation && check_validation_layer_support(entry);
    if validation && !validation_available {
        log::warn!("validation layers requested but not available");
    }

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"gpu-driven-engine")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"gpu-driven-engine")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    let mut extensions = ash_window::enumerate_required_extensions(display_handle)
        .map_err(|e| RenderError::InitializationFailed(format!("{e:?}")))?
        .to_vec();
    if validation_available {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    let layer_names: Vec<*const i8> = if validation_available {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        RenderError::InitializationFailed(format!("failed to create Vulkan instance: {e:?}"))
    })?;

    let debug_utils = if validation_available {
        let loader = ash::ext::debug_utils::Instance::new(entry, &instance);
        let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        let messenger = unsafe { loader.create_debug_utils_messenger(&messenger_info, None) }
            .map_err(|e| {
                RenderError::InitializationFailed(format!(
                    "failed to create debug messenger: {e:?}"
                ))
            })?;
        Some((loader, messenger))
    } else {
        None
    };

    Ok((instance, debug_utils))
}

fn check_validation_layer_support(entry: &ash::Entry) -> bool {
    let available = match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(layers) => layers,
        Err(_) => return false,
    };
    available.iter().any(|layer| {
        (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER_NAME
    })
}

/// Select a GPU with a graphics+present queue family and every feature the
/// culling pipeline needs. Prefers discrete GPUs.
fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> RenderResult<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        RenderError::InitializationFailed(format!("failed to enumerate physical devices: {e:?}"))
    })?;
    if devices.is_empty() {
        return Err(RenderError::InitializationFailed(
            "no Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(vk::PhysicalDevice, u32)> = None;
    let mut best_score = 0;

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let device_name =
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy();

        if properties.api_version < REQUIRED_API_VERSION {
            log::info!("skipping {device_name}: Vulkan 1.3 not supported");
            continue;
        }
        if !supports_required_features(instance, device) {
            log::info!("skipping {device_name}: missing required features");
            continue;
        }
        let Some(queue_family) = find_queue_family(instance, surface_loader, surface, device)
        else {
            log::info!("skipping {device_name}: no graphics+present queue family");
            continue;
        };

        let mut score = 1;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }

        log::info!(
            "found GPU: {device_name} (type: {:?}, score: {score})",
            properties.device_type
        );
        if score > best_score {
            best_score = score;
            best = Some((device, queue_family));
        }
    }

    best.ok_or_else(|| RenderError::InitializationFailed("no suitable GPU found".to_string()))
}

fn supports_required_features(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut features12)
        .push_next(&mut features13);
    unsafe { instance.get_physical_device_features2(device, &mut features) };

    features12.buffer_device_address == vk::TRUE
        && features12.draw_indirect_count == vk::TRUE
        && features12.descriptor_indexing == vk::TRUE
        && features12.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
        && features12.descriptor_binding_partially_bound == vk::TRUE
        && features12.runtime_descriptor_array == vk::TRUE
        && features13.dynamic_rendering == vk::TRUE
}

fn find_queue_family(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        let graphics = family
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
        let present = unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        };
        (graphics && present).then_some(index)
    })
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> RenderResult<ash::Device> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&queue_priorities)];

    let device_extensions = [ash::khr::swapchain::NAME.as_ptr()];

    let features = vk::PhysicalDeviceFeatures::default().multi_draw_indirect(true);

    let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .draw_indirect_count(true)
        .descriptor_indexing(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_update_unused_while_pending(true)
        .runtime_descriptor_array(true)
        .shader_sampled_image_array_non_uniform_indexing(true);

    let mut features13 = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .enabled_features(&features)
        .push_next(&mut features12)
        .push_next(&mut features13);

    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        RenderError::DeviceCreationFailed(format!("failed to create logical device: {e:?}"))
    })
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() {
        String::from("(no message)")
    } else {
        let data = *callback_data;
        if data.p_message.is_null() {
            String::from("(null message)")
        } else {
            CStr::from_ptr(data.p_message).to_string_lossy().into_owned()
        }
    };

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "General",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "Validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "Performance",
        _ => "Unknown",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan {type_str}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan {type_str}] {message}");
        }
        _ => {
            log::debug!("[Vulkan {type_str}] {message}");
        }
    }

    vk::FALSE
}
