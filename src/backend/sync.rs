// Synchronization primitives
//
// Binary semaphores for the GPU-GPU chain (acquire -> render -> present)
// and one fence per frame slot for CPU-GPU completion. Timeline semaphores
// are not used anywhere.

use super::error::{RenderError, RenderResult, VkResultExt};
use super::VulkanDevice;
use ash::vk;
use std::time::Duration;

/// Per-slot synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> RenderResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on a fresh slot returns at once.
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let image_available = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .context("creating image-available semaphore")?;
        let in_flight_fence = match unsafe { device.device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(result) => {
                unsafe { device.device.destroy_semaphore(image_available, None) };
                return Err(RenderError::from_vk("creating in-flight fence", result));
            }
        };

        Ok(Self {
            image_available,
            in_flight_fence,
        })
    }

    /// Block until the slot's previous submission has completed.
    pub fn wait(&self, device: &VulkanDevice, timeout: Duration) -> RenderResult<()> {
        device.wait_for_fences(&[self.in_flight_fence], timeout)
    }

    pub fn is_signaled(&self, device: &VulkanDevice) -> RenderResult<bool> {
        unsafe { device.device.get_fence_status(self.in_flight_fence) }
            .context("querying fence status")
    }

    /// Only call right before a submit that signals this fence again,
    /// otherwise the next wait never returns.
    pub fn reset(&self, device: &VulkanDevice) -> RenderResult<()> {
        unsafe { device.device.reset_fences(&[self.in_flight_fence]) }.context("resetting fence")
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Render-finished semaphores, one per swapchain image. Present has no
/// fence, so a semaphore it waits on is only known to be free again once
/// the same image is acquired again.
pub fn create_semaphores(device: &VulkanDevice, count: usize) -> RenderResult<Vec<vk::Semaphore>> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    let mut semaphores = Vec::with_capacity(count);
    for _ in 0..count {
        match unsafe { device.device.create_semaphore(&semaphore_info, None) } {
            Ok(semaphore) => semaphores.push(semaphore),
            Err(result) => {
                destroy_semaphores(&device.device, &semaphores);
                return Err(RenderError::from_vk("creating render-finished semaphore", result));
            }
        }
    }
    Ok(semaphores)
}

pub fn destroy_semaphores(device: &ash::Device, semaphores: &[vk::Semaphore]) {
    for &semaphore in semaphores {
        unsafe { device.destroy_semaphore(semaphore, None) };
    }
}
