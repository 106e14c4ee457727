// Swapchain - Window presentation
//
// Negotiates image count, format, present mode and extent with the surface,
// and owns the per-image views. Anything derived from the extent is rebuilt
// together with the swapchain by the owner.

use super::error::{RenderError, RenderResult, VkResultExt};
use super::surface::SurfaceSupport;
use super::VulkanDevice;
use ash::extensions::khr;
use ash::vk;

/// What the application asks for; the surface decides what it gets.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainRequest {
    pub width: u32,
    pub height: u32,
    pub preferred_image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    pub fn needs_recreation(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecreateOutcome {
    Recreated,
    /// Zero-area drawable (minimized). Try again on a later frame.
    Deferred,
}

/// clamp(preferred, min, max); a max of 0 means no upper bound.
pub fn choose_image_count(preferred: u32, caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = preferred.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    desired: vk::SurfaceFormatKHR,
) -> RenderResult<vk::SurfaceFormatKHR> {
    match formats {
        [] => Err(RenderError::InvalidRequest("surface reports no formats".into())),
        // A lone UNDEFINED entry means the surface takes anything.
        [only] if only.format == vk::Format::UNDEFINED => Ok(desired),
        _ => Ok(formats
            .iter()
            .copied()
            .find(|f| f.format == desired.format && f.color_space == desired.color_space)
            .unwrap_or(formats[0])),
    }
}

/// FIFO is the only mode every implementation has to support.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], desired: vk::PresentModeKHR) -> vk::PresentModeKHR {
    if modes.contains(&desired) {
        desired
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Build a swapchain for the device's surface. Returns `Ok(None)` when
    /// the drawable currently has zero area.
    pub fn new(
        device: &VulkanDevice,
        request: &SwapchainRequest,
        old: Option<&Swapchain>,
    ) -> RenderResult<Option<Self>> {
        let surface = device
            .surface
            .as_ref()
            .ok_or_else(|| RenderError::InvalidRequest("device was created without a surface".into()))?;
        let SurfaceSupport {
            capabilities,
            formats,
            present_modes,
        } = surface.support(device.physical_device)?;

        let extent = choose_extent(&capabilities, request.width, request.height);
        if extent.width == 0 || extent.height == 0 {
            log::debug!("Drawable has zero area, not creating swapchain");
            return Ok(None);
        }

        let surface_format = choose_surface_format(&formats, request.surface_format)?;
        let present_mode = choose_present_mode(&present_modes, request.present_mode);
        let image_count = choose_image_count(request.preferred_image_count, &capabilities);

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            image_count,
            surface_format.format,
            present_mode
        );

        let graphics = device.queue_families.graphics;
        let present = device.queue_families.present.unwrap_or(graphics);
        let family_indices = [graphics, present];

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |s| s.swapchain));

        create_info = if graphics != present {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain_loader = khr::Swapchain::new(&device.instance, &device.device);
        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("creating swapchain")?;

        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(result) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(RenderError::from_vk("getting swapchain images", result));
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            match unsafe { device.device.create_image_view(&create_info, None) } {
                Ok(view) => image_views.push(view),
                Err(result) => {
                    unsafe {
                        for view in image_views {
                            device.device.destroy_image_view(view, None);
                        }
                        swapchain_loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(RenderError::from_vk("creating swapchain image view", result));
                }
            }
        }

        log::info!("Created swapchain with {} images", images.len());

        Ok(Some(Self {
            swapchain,
            swapchain_loader,
            images,
            image_views,
            surface_format,
            present_mode,
            extent,
        }))
    }

    /// Replace this swapchain in place. Waits for the device to go idle
    /// first, so nothing in flight still references the old images.
    pub fn recreate(&mut self, device: &VulkanDevice, request: &SwapchainRequest) -> RenderResult<RecreateOutcome> {
        device.wait_idle()?;

        match Self::new(device, request, Some(self))? {
            Some(new) => {
                let old = std::mem::replace(self, new);
                old.destroy(&device.device);
                Ok(RecreateOutcome::Recreated)
            }
            None => Ok(RecreateOutcome::Deferred),
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> RenderResult<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, u64::MAX, signal, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(result) => Err(RenderError::from_vk("acquiring swapchain image", result)),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> RenderResult<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(result) => Err(RenderError::from_vk("presenting", result)),
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
