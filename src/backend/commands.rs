// Command pools, one-shot submissions and image layout transitions

use super::error::{RenderResult, VkResultExt};
use super::VulkanDevice;
use ash::vk;
use std::time::Duration;

pub struct CommandPool {
    pub pool: vk::CommandPool,
    pub queue_family: u32,
}

impl CommandPool {
    pub fn new(
        device: &VulkanDevice,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> RenderResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(flags);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("creating command pool")?;
        Ok(Self { pool, queue_family })
    }

    pub fn allocate(&self, device: &VulkanDevice, count: u32) -> RenderResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("allocating command buffers")
    }

    /// Also frees every command buffer allocated from the pool.
    pub fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// Record a throwaway command buffer, submit it and block until it has
/// executed. The command buffer and fence are released on every path.
pub fn submit_one_shot<F>(
    device: &VulkanDevice,
    pool: &CommandPool,
    queue: vk::Queue,
    timeout: Duration,
    record: F,
) -> RenderResult<()>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer),
{
    let cmd = pool.allocate(device, 1)?[0];
    let fence = match unsafe {
        device
            .device
            .create_fence(&vk::FenceCreateInfo::builder(), None)
    } {
        Ok(fence) => fence,
        Err(result) => {
            unsafe { device.device.free_command_buffers(pool.pool, &[cmd]) };
            return Err(super::RenderError::from_vk("creating upload fence", result));
        }
    };

    let result = (|| {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.device.begin_command_buffer(cmd, &begin_info) }
            .context("beginning one-shot command buffer")?;

        record(&device.device, cmd);

        unsafe { device.device.end_command_buffer(cmd) }
            .context("ending one-shot command buffer")?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        unsafe {
            device
                .device
                .queue_submit(queue, &[submit_info.build()], fence)
        }
        .context("submitting one-shot command buffer")?;

        device.wait_for_fences(&[fence], timeout)
    })();

    unsafe {
        device.device.destroy_fence(fence, None);
        device.device.free_command_buffers(pool.pool, &[cmd]);
    }

    result
}

/// One image layout transition, expressed as a synchronization2 barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageTransition {
    /// Freshly acquired swapchain image -> color attachment. The source
    /// stage matches the stage the acquire semaphore is waited at, so the
    /// transition is ordered after the presentation engine releases the
    /// image.
    pub const fn acquired_to_color_attachment() -> Self {
        Self {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            dst_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    pub const fn color_attachment_to_present() -> Self {
        Self {
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            dst_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            dst_access: vk::AccessFlags2::NONE,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    /// Depth contents are discarded every frame.
    pub const fn depth_attachment() -> Self {
        Self {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::from_raw(
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
            ),
            src_access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_stage: vk::PipelineStageFlags2::from_raw(
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
            ),
            dst_access: vk::AccessFlags2::from_raw(
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
            ),
            aspect: vk::ImageAspectFlags::DEPTH,
        }
    }

    /// Multisampled color target, resolved into the swapchain image each
    /// frame. Contents are discarded, but the previous frame's writes to the
    /// same image must land first.
    pub const fn multisampled_color_attachment() -> Self {
        Self {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            dst_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            dst_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    pub const fn undefined_to_transfer_dst() -> Self {
        Self {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: vk::PipelineStageFlags2::TRANSFER,
            dst_access: vk::AccessFlags2::TRANSFER_WRITE,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    pub const fn transfer_dst_to_shader_read() -> Self {
        Self {
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
            dst_access: vk::AccessFlags2::SHADER_READ,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    /// Mip level `n - 1` after it was written, before it is blitted into `n`.
    pub const fn transfer_dst_to_transfer_src() -> Self {
        Self {
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_stage: vk::PipelineStageFlags2::TRANSFER,
            dst_access: vk::AccessFlags2::TRANSFER_READ,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    pub const fn transfer_src_to_shader_read() -> Self {
        Self {
            old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            src_access: vk::AccessFlags2::TRANSFER_READ,
            dst_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
            dst_access: vk::AccessFlags2::SHADER_READ,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    /// Transition every mip level.
    pub fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
        self.record_levels(device, cmd, image, 0, vk::REMAINING_MIP_LEVELS);
    }

    /// Transition a single mip level.
    pub fn record_level(&self, device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image, level: u32) {
        self.record_levels(device, cmd, image, level, 1);
    }

    fn record_levels(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        base_mip_level: u32,
        level_count: u32,
    ) {
        let barrier = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level,
                level_count,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();

        let barriers = [barrier];
        let dependency_info = vk::DependencyInfo::builder().image_memory_barriers(&barriers);
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }
}
