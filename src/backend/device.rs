// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation, validation layers behind an explicit flag
// - Presentation surface (when a window is attached)
// - Physical device selection (first device that qualifies)
// - Logical device + queues tagged by capability
// - Memory allocator setup

use super::error::{RenderError, RenderResult, VkResultExt};
use super::surface::{self, Surface, WindowHandles};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device features the engine knows how to request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub sampler_anisotropy: bool,
    pub dynamic_rendering: bool,
    pub synchronization2: bool,
}

impl DeviceFeatures {
    /// What the frame loop needs: inline attachments, barrier2, and
    /// anisotropic sampling for the texture path.
    pub const fn renderer() -> Self {
        Self {
            sampler_anisotropy: true,
            dynamic_rendering: true,
            synchronization2: true,
        }
    }

    /// Names of features requested here but absent from `supported`.
    pub fn missing_from(&self, supported: &Self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.sampler_anisotropy && !supported.sampler_anisotropy {
            missing.push("samplerAnisotropy");
        }
        if self.dynamic_rendering && !supported.dynamic_rendering {
            missing.push("dynamicRendering");
        }
        if self.synchronization2 && !supported.synchronization2 {
            missing.push("synchronization2");
        }
        missing
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueCapability {
    Graphics,
    Present,
    Transfer,
}

/// Queue family indices chosen for one physical device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    /// `None` when running headless.
    pub present: Option<u32>,
    /// A transfer-only family, if the device has one.
    pub transfer: Option<u32>,
}

impl QueueFamilies {
    /// Pick queue families, preferring one family that can do both graphics
    /// and present. `present_support` is only consulted when presenting.
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        presenting: bool,
        mut present_support: impl FnMut(u32) -> RenderResult<bool>,
    ) -> RenderResult<Option<Self>> {
        let graphics_families: Vec<u32> = families
            .iter()
            .enumerate()
            .filter(|(_, f)| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(i, _)| i as u32)
            .collect();

        let Some(&first_graphics) = graphics_families.first() else {
            return Ok(None);
        };

        let transfer = families
            .iter()
            .enumerate()
            .find(|(_, f)| {
                f.queue_count > 0
                    && f.queue_flags.contains(vk::QueueFlags::TRANSFER)
                    && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|(i, _)| i as u32);

        if !presenting {
            return Ok(Some(Self {
                graphics: first_graphics,
                present: None,
                transfer,
            }));
        }

        for &family in &graphics_families {
            if present_support(family)? {
                return Ok(Some(Self {
                    graphics: family,
                    present: Some(family),
                    transfer,
                }));
            }
        }

        for family in 0..families.len() as u32 {
            if present_support(family)? {
                return Ok(Some(Self {
                    graphics: first_graphics,
                    present: Some(family),
                    transfer,
                }));
            }
        }

        Ok(None)
    }

    /// Distinct family indices, for queue creation and concurrent sharing.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        for family in [self.present, self.transfer].into_iter().flatten() {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Everything `VulkanDevice::new` needs to know up front.
pub struct DeviceDesc<'a> {
    pub app_name: &'a str,
    pub enable_validation: bool,
    /// Extensions beyond the swapchain extension (added automatically when
    /// presenting).
    pub required_extensions: Vec<&'static CStr>,
    pub required_features: DeviceFeatures,
    /// `None` creates a headless device with no present queue.
    pub window: Option<WindowHandles>,
}

impl<'a> DeviceDesc<'a> {
    pub fn headless(app_name: &'a str, enable_validation: bool) -> Self {
        Self {
            app_name,
            enable_validation,
            required_extensions: Vec::new(),
            required_features: DeviceFeatures::renderer(),
            window: None,
        }
    }
}

struct DebugMessenger {
    loader: DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// Vulkan device wrapper: instance, surface, physical/logical device, queues
/// and the memory allocator.
pub struct VulkanDevice {
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: Option<Surface>,
    pub instance: ash::Instance,
    pub entry: Entry,

    pub queue_families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: Option<vk::Queue>,
    transfer_queue: Option<vk::Queue>,

    debug_messenger: Option<DebugMessenger>,
    validation_errors: Box<AtomicU32>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub enabled_features: DeviceFeatures,
}

impl VulkanDevice {
    /// Create the whole device context. Any failure here is fatal.
    pub fn new(desc: &DeviceDesc) -> RenderResult<Self> {
        log::info!("Creating Vulkan device: {}", desc.app_name);

        let entry = unsafe { Entry::load() }?;

        let enable_validation = desc.enable_validation && validation_layer_available(&entry);
        let instance = create_instance(&entry, desc, enable_validation)?;

        let validation_errors = Box::new(AtomicU32::new(0));
        let debug_messenger = if enable_validation {
            Some(setup_debug_messenger(&entry, &instance, &validation_errors)?)
        } else {
            None
        };

        let surface = desc
            .window
            .map(|handles| Surface::new(&entry, &instance, handles))
            .transpose()?;

        let mut required_extensions = desc.required_extensions.clone();
        if surface.is_some() && !required_extensions.contains(&khr::Swapchain::name()) {
            required_extensions.push(khr::Swapchain::name());
        }

        let (physical_device, queue_families) = pick_physical_device(
            &instance,
            surface.as_ref(),
            &required_extensions,
            &desc.required_features,
        )?;

        let device = create_logical_device(
            &instance,
            physical_device,
            &queue_families,
            &required_extensions,
            &desc.required_features,
        )?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = queue_families
            .present
            .map(|family| unsafe { device.get_device_queue(family, 0) });
        let transfer_queue = queue_families
            .transfer
            .map(|family| unsafe { device.get_device_queue(family, 0) });

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::debug!("Queue families: {:?}", queue_families);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RenderError::from_allocation("creating allocator", e))?;

        Ok(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            surface,
            instance,
            entry,
            queue_families,
            graphics_queue,
            present_queue,
            transfer_queue,
            debug_messenger,
            validation_errors,
            properties,
            enabled_features: desc.required_features,
        })
    }

    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Queue for a capability. Transfer falls back to graphics when the
    /// device has no dedicated transfer family.
    pub fn queue(&self, capability: QueueCapability) -> Option<vk::Queue> {
        match capability {
            QueueCapability::Graphics => Some(self.graphics_queue),
            QueueCapability::Present => self.present_queue,
            QueueCapability::Transfer => self.transfer_queue.or(Some(self.graphics_queue)),
        }
    }

    pub fn queue_family(&self, capability: QueueCapability) -> Option<u32> {
        match capability {
            QueueCapability::Graphics => Some(self.queue_families.graphics),
            QueueCapability::Present => self.queue_families.present,
            QueueCapability::Transfer => self
                .queue_families
                .transfer
                .or(Some(self.queue_families.graphics)),
        }
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Whether the validation layer is active for this device.
    pub fn validation_enabled(&self) -> bool {
        self.debug_messenger.is_some()
    }

    /// Number of error-severity messages the validation layer reported.
    pub fn validation_error_count(&self) -> u32 {
        self.validation_errors.load(Ordering::Relaxed)
    }

    /// Sample counts usable for both color and depth attachments.
    pub fn usable_sample_counts(&self) -> vk::SampleCountFlags {
        let limits = &self.properties.limits;
        limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts
    }

    /// Whether `format` can be the source and destination of linear-filtered
    /// blits in optimal tiling, which mip generation needs.
    pub fn supports_linear_blit(&self, format: vk::Format) -> bool {
        let properties = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        };
        properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    }

    /// Only call once every submission is known complete (slot fences
    /// waited with a bound); otherwise this can block forever.
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }.context("waiting for device idle")
    }

    /// Bounded fence wait. A timeout is reported as device loss: the caller
    /// tears the context down instead of retrying.
    pub fn wait_for_fences(&self, fences: &[vk::Fence], timeout: Duration) -> RenderResult<()> {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(fences, true, nanos) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RenderError::DeviceLost(format!(
                "fence wait exceeded {timeout:?}"
            ))),
            Err(result) => Err(RenderError::from_vk("waiting for fences", result)),
        }
    }
}

impl Drop for VulkanDevice {
    /// Owners wait on their own fences (bounded) before releasing their
    /// objects; nothing here blocks on the GPU.
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        unsafe {
            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                surface.destroy();
            }
            if let Some(debug) = self.debug_messenger.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

const SAMPLE_COUNTS: [vk::SampleCountFlags; 7] = [
    vk::SampleCountFlags::TYPE_64,
    vk::SampleCountFlags::TYPE_32,
    vk::SampleCountFlags::TYPE_16,
    vk::SampleCountFlags::TYPE_8,
    vk::SampleCountFlags::TYPE_4,
    vk::SampleCountFlags::TYPE_2,
    vk::SampleCountFlags::TYPE_1,
];

/// Largest count in `supported` that is at most `requested`. A request
/// below 2 means no multisampling.
pub fn choose_sample_count(requested: u32, supported: vk::SampleCountFlags) -> vk::SampleCountFlags {
    SAMPLE_COUNTS
        .into_iter()
        .find(|&count| supported.contains(count) && count.as_raw() <= requested)
        .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

fn validation_layer_available(entry: &Entry) -> bool {
    let available = entry
        .enumerate_instance_layer_properties()
        .map(|layers| {
            layers.iter().any(|layer| {
                (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER
            })
        })
        .unwrap_or(false);
    if !available {
        log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
    }
    available
}

fn create_instance(
    entry: &Entry,
    desc: &DeviceDesc,
    enable_validation: bool,
) -> RenderResult<ash::Instance> {
    let app_name = CString::new(desc.app_name)
        .map_err(|_| RenderError::InvalidRequest("application name contains NUL".into()))?;
    let engine_name = c"frame-renderer";

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions: Vec<*const std::ffi::c_char> = Vec::new();
    if let Some(window) = desc.window {
        extensions.extend(
            surface::required_instance_extensions(window.display)?
                .iter()
                .map(|name| name.as_ptr()),
        );
    }
    if enable_validation {
        extensions.push(DebugUtils::name().as_ptr());
    }

    let layer_names = if enable_validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    unsafe { entry.create_instance(&create_info, None) }.context("creating Vulkan instance")
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
    error_counter: &AtomicU32,
) -> RenderResult<DebugMessenger> {
    let loader = DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .user_data(error_counter as *const AtomicU32 as *mut std::ffi::c_void);

    let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
        .context("creating debug messenger")?;

    Ok(DebugMessenger { loader, messenger })
}

fn query_features(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> DeviceFeatures {
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut features13);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
    let core = features2.features;

    DeviceFeatures {
        sampler_anisotropy: core.sampler_anisotropy == vk::TRUE,
        dynamic_rendering: features13.dynamic_rendering == vk::TRUE,
        synchronization2: features13.synchronization2 == vk::TRUE,
    }
}

fn missing_extensions(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    required: &[&CStr],
) -> RenderResult<Vec<String>> {
    let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .context("enumerating device extensions")?;
    let available: Vec<&CStr> = available
        .iter()
        .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
        .collect();

    Ok(required
        .iter()
        .filter(|name| !available.contains(name))
        .map(|name| name.to_string_lossy().into_owned())
        .collect())
}

/// First physical device with the queues, extensions and features we need.
fn pick_physical_device(
    instance: &ash::Instance,
    surface: Option<&Surface>,
    required_extensions: &[&CStr],
    required_features: &DeviceFeatures,
) -> RenderResult<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .context("enumerating physical devices")?;

    if devices.is_empty() {
        return Err(RenderError::NoSuitableDevice("no Vulkan-capable GPU found".into()));
    }

    let mut rejections = Vec::new();

    for physical_device in devices {
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        if props.api_version < vk::API_VERSION_1_3 {
            rejections.push(format!("{name}: Vulkan 1.3 not supported"));
            continue;
        }

        let missing = missing_extensions(instance, physical_device, required_extensions)?;
        if !missing.is_empty() {
            rejections.push(format!("{name}: missing extensions {}", missing.join(", ")));
            continue;
        }

        let supported = query_features(instance, physical_device);
        let missing = required_features.missing_from(&supported);
        if !missing.is_empty() {
            rejections.push(format!("{name}: missing features {}", missing.join(", ")));
            continue;
        }

        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let found = QueueFamilies::find(&families, surface.is_some(), |family| match surface {
            Some(surface) => surface.supports_queue_family(physical_device, family),
            None => Ok(false),
        })?;

        match found {
            Some(families) => {
                log::debug!("Accepted physical device {}", name);
                return Ok((physical_device, families));
            }
            None => rejections.push(format!("{name}: no graphics/present queue family")),
        }
    }

    Err(RenderError::NoSuitableDevice(rejections.join("; ")))
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilies,
    required_extensions: &[&CStr],
    required_features: &DeviceFeatures,
) -> RenderResult<ash::Device> {
    let queue_priorities = [1.0];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
                .build()
        })
        .collect();

    let extensions: Vec<*const std::ffi::c_char> =
        required_extensions.iter().map(|name| name.as_ptr()).collect();

    let core_features = vk::PhysicalDeviceFeatures::builder()
        .sampler_anisotropy(required_features.sampler_anisotropy);
    let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
        .dynamic_rendering(required_features.dynamic_rendering)
        .synchronization2(required_features.synchronization2);

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&core_features)
        .push_next(&mut features13);

    unsafe { instance.create_device(physical_device, &create_info, None) }
        .map_err(|result| RenderError::DeviceCreation(format!("vkCreateDevice returned {result}")))
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*p_callback_data).p_message).to_string_lossy()
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            if let Some(counter) = (p_user_data as *const AtomicU32).as_ref() {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            log::error!("[Vulkan] {}", message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message);
        }
        _ => {
            log::debug!("[Vulkan] {}", message);
        }
    }

    vk::FALSE
}
