// Buffer and image resources
//
// Every resource pairs a handle with a gpu-allocator allocation (memory +
// byte offset). Device-local resources are only ever filled through a
// transient staging buffer and a one-shot copy; they are never mapped.
//
// Buffer copies run on the transfer queue. Image uploads run on the graphics
// queue: mip blits and the final transition into fragment-shader reads are
// graphics-only work.

use super::commands::{submit_one_shot, CommandPool, ImageTransition};
use super::device::QueueCapability;
use super::error::{RenderError, RenderResult, VkResultExt};
use super::VulkanDevice;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::time::Duration;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Where a resource's memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Host-visible + coherent, persistently mapped. Staging and uniforms.
    HostVisible,
    /// Device-local, filled via staging uploads only.
    DeviceLocal,
    /// Host-visible, preferably cached, for copying results back.
    Readback,
}

impl MemoryUsage {
    fn location(self) -> MemoryLocation {
        match self {
            Self::HostVisible => MemoryLocation::CpuToGpu,
            Self::DeviceLocal => MemoryLocation::GpuOnly,
            Self::Readback => MemoryLocation::GpuToCpu,
        }
    }

    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::DeviceLocal)
    }
}

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub memory_usage: MemoryUsage,
}

impl GpuBuffer {
    /// Byte offset of this buffer inside its memory block.
    pub fn offset(&self) -> vk::DeviceSize {
        self.allocation.as_ref().map_or(0, |a| a.offset())
    }

    pub fn mapped_slice(&self) -> Option<&[u8]> {
        self.allocation
            .as_ref()?
            .mapped_slice()
            .map(|bytes| &bytes[..self.size as usize])
    }

    /// Copy `data` to the start of a host-visible buffer. The caller must
    /// know no in-flight GPU work reads this buffer.
    pub fn write_mapped(&mut self, data: &[u8]) -> RenderResult<()> {
        if !self.memory_usage.is_host_visible() {
            return Err(RenderError::InvalidRequest("buffer is device-local; use upload".into()));
        }
        let size = self.size as usize;
        if data.len() > size {
            return Err(RenderError::InvalidRequest(format!(
                "write of {} bytes into {}-byte buffer",
                data.len(),
                size
            )));
        }
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| RenderError::InvalidRequest("buffer is not mapped".into()))?;
        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Number of levels in a full mip chain down to 1x1.
pub fn mip_level_count(extent: vk::Extent2D) -> u32 {
    let largest = extent.width.max(extent.height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Shape of a 2D image the allocator creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
}

impl ImageDesc {
    /// Sampled texture with a full mip chain, generated at upload.
    pub fn texture(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: mip_level_count(extent),
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    pub fn depth(extent: vk::Extent2D, samples: vk::SampleCountFlags) -> Self {
        Self {
            extent,
            format: DEPTH_FORMAT,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
            mip_levels: 1,
            samples,
        }
    }

    /// Multisampled color target that only lives for one rendering pass
    /// before it is resolved.
    pub fn transient_color(extent: vk::Extent2D, format: vk::Format, samples: vk::SampleCountFlags) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: 1,
            samples,
        }
    }
}

pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
}

impl GpuImage {
    pub fn offset(&self) -> vk::DeviceSize {
        self.allocation.as_ref().map_or(0, |a| a.offset())
    }
}

/// Bytes per texel for the formats the engine uploads.
pub fn texel_size(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8G8B8A8_SRGB
        | vk::Format::R8G8B8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::D32_SFLOAT => Some(4),
        vk::Format::R8_UNORM => Some(1),
        _ => None,
    }
}

struct UploadQueue {
    pool: CommandPool,
    queue: vk::Queue,
}

/// Creates buffers/images and owns the transient pools used for uploads.
pub struct ResourceAllocator {
    transfer: UploadQueue,
    graphics: UploadQueue,
    /// Families that touch buffers. More than one means concurrent sharing,
    /// so a copy on the transfer queue needs no ownership transfer.
    buffer_families: Vec<u32>,
    upload_timeout: Duration,
}

impl ResourceAllocator {
    pub fn new(device: &VulkanDevice, upload_timeout: Duration) -> RenderResult<Self> {
        let graphics_family = device.queue_families.graphics;
        let transfer_family = device
            .queue_family(QueueCapability::Transfer)
            .unwrap_or(graphics_family);
        let transfer_queue = device
            .queue(QueueCapability::Transfer)
            .unwrap_or_else(|| device.graphics_queue());

        let transfer_pool = CommandPool::new(device, transfer_family, vk::CommandPoolCreateFlags::TRANSIENT)?;
        let graphics_pool = match CommandPool::new(device, graphics_family, vk::CommandPoolCreateFlags::TRANSIENT) {
            Ok(pool) => pool,
            Err(e) => {
                transfer_pool.destroy(&device.device);
                return Err(e);
            }
        };

        let buffer_families = if transfer_family == graphics_family {
            vec![graphics_family]
        } else {
            log::debug!("Buffer uploads on dedicated transfer family {}", transfer_family);
            vec![graphics_family, transfer_family]
        };

        Ok(Self {
            transfer: UploadQueue {
                pool: transfer_pool,
                queue: transfer_queue,
            },
            graphics: UploadQueue {
                pool: graphics_pool,
                queue: device.graphics_queue(),
            },
            buffer_families,
            upload_timeout,
        })
    }

    pub fn create_buffer(
        &self,
        device: &VulkanDevice,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_usage: MemoryUsage,
    ) -> RenderResult<GpuBuffer> {
        if size == 0 {
            return Err(RenderError::InvalidRequest(format!("buffer '{name}' has zero size")));
        }

        let buffer_info = vk::BufferCreateInfo::builder().size(size).usage(usage);
        let buffer_info = if self.buffer_families.len() > 1 {
            buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&self.buffer_families)
        } else {
            buffer_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("creating buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: memory_usage.location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(RenderError::from_allocation("allocating buffer memory", e));
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(result) = bound {
            let _ = device.allocator().lock().free(allocation);
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(RenderError::from_vk("binding buffer memory", result));
        }

        log::trace!("Created buffer '{}' ({} bytes, {:?})", name, size, memory_usage);

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
            memory_usage,
        })
    }

    /// Device-local buffer filled with `data` through a staging upload.
    pub fn create_buffer_with_data(
        &self,
        device: &VulkanDevice,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> RenderResult<GpuBuffer> {
        let mut buffer = self.create_buffer(
            device,
            name,
            data.len() as vk::DeviceSize,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::DeviceLocal,
        )?;
        if let Err(e) = self.upload(device, &buffer, data) {
            self.destroy_buffer(device, &mut buffer);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Copy `data` into the start of `dst` through a staging buffer. The
    /// staging buffer is released before this returns, on success or
    /// failure.
    pub fn upload(&self, device: &VulkanDevice, dst: &GpuBuffer, data: &[u8]) -> RenderResult<()> {
        if data.len() as vk::DeviceSize > dst.size {
            return Err(RenderError::InvalidRequest(format!(
                "upload of {} bytes into {}-byte buffer",
                data.len(),
                dst.size
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let mut staging = self.create_buffer(
            device,
            "staging",
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryUsage::HostVisible,
        )?;

        let result = staging.write_mapped(data).and_then(|()| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: data.len() as vk::DeviceSize,
            };
            self.submit_transfer(device, |d, cmd| unsafe {
                d.cmd_copy_buffer(cmd, staging.buffer, dst.buffer, &[region]);
            })
        });

        self.destroy_buffer(device, &mut staging);
        result
    }

    /// Debug copy-back of a buffer created with `TRANSFER_SRC` usage.
    pub fn read_back(&self, device: &VulkanDevice, src: &GpuBuffer) -> RenderResult<Vec<u8>> {
        let mut readback = self.create_buffer(
            device,
            "readback",
            src.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::Readback,
        )?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size,
        };
        let result = self
            .submit_transfer(device, |d, cmd| unsafe {
                d.cmd_copy_buffer(cmd, src.buffer, readback.buffer, &[region]);
            })
            .and_then(|()| {
                readback
                    .mapped_slice()
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| RenderError::InvalidRequest("readback buffer is not mapped".into()))
            });

        self.destroy_buffer(device, &mut readback);
        result
    }

    pub fn create_image(&self, device: &VulkanDevice, name: &str, desc: &ImageDesc) -> RenderResult<GpuImage> {
        let extent = desc.extent;
        if extent.width == 0 || extent.height == 0 {
            return Err(RenderError::InvalidRequest(format!("image '{name}' has zero area")));
        }
        if desc.mip_levels == 0 || desc.mip_levels > mip_level_count(extent) {
            return Err(RenderError::InvalidRequest(format!(
                "image '{name}' asks for {} mip levels",
                desc.mip_levels
            )));
        }

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(desc.samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("creating image")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(RenderError::from_allocation("allocating image memory", e));
            }
        };

        let view = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .context("binding image memory")
        .and_then(|()| {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(desc.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: desc.aspect,
                    base_mip_level: 0,
                    level_count: desc.mip_levels,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            unsafe { device.device.create_image_view(&view_info, None) }.context("creating image view")
        });

        match view {
            Ok(view) => Ok(GpuImage {
                image,
                view,
                allocation: Some(allocation),
                format: desc.format,
                extent,
                mip_levels: desc.mip_levels,
                samples: desc.samples,
            }),
            Err(e) => {
                let _ = device.allocator().lock().free(allocation);
                unsafe { device.device.destroy_image(image, None) };
                Err(e)
            }
        }
    }

    /// Depth attachment sized to the swapchain; recreated with it.
    pub fn create_depth_image(
        &self,
        device: &VulkanDevice,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
    ) -> RenderResult<GpuImage> {
        self.create_image(device, "depth", &ImageDesc::depth(extent, samples))
    }

    /// Fill level 0 of a sampled image with tightly packed texels, generate
    /// the remaining mip levels by blitting, and leave every level in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    pub fn upload_image(&self, device: &VulkanDevice, dst: &GpuImage, pixels: &[u8]) -> RenderResult<()> {
        let texel = texel_size(dst.format).ok_or_else(|| {
            RenderError::InvalidRequest(format!("no upload path for {:?}", dst.format))
        })?;
        let expected = texel * u64::from(dst.extent.width) * u64::from(dst.extent.height);
        if pixels.len() as u64 != expected {
            return Err(RenderError::InvalidRequest(format!(
                "image upload expects {expected} bytes, got {}",
                pixels.len()
            )));
        }
        if dst.mip_levels > 1 && !device.supports_linear_blit(dst.format) {
            return Err(RenderError::InvalidRequest(format!(
                "{:?} does not support linear blits for mip generation",
                dst.format
            )));
        }

        let mut staging = self.create_buffer(
            device,
            "image staging",
            expected,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryUsage::HostVisible,
        )?;

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: color_layer(0),
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: dst.extent.width,
                height: dst.extent.height,
                depth: 1,
            },
        };

        let result = staging.write_mapped(pixels).and_then(|()| {
            submit_one_shot(
                device,
                &self.graphics.pool,
                self.graphics.queue,
                self.upload_timeout,
                |d, cmd| {
                    ImageTransition::undefined_to_transfer_dst().record(d, cmd, dst.image);
                    unsafe {
                        d.cmd_copy_buffer_to_image(
                            cmd,
                            staging.buffer,
                            dst.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                        );
                    }
                    record_mip_chain(d, cmd, dst);
                },
            )
        });

        self.destroy_buffer(device, &mut staging);
        result
    }

    /// Release the handle and its memory, leaving a null buffer behind.
    pub fn destroy_buffer(&self, device: &VulkanDevice, buffer: &mut GpuBuffer) {
        unsafe { device.device.destroy_buffer(buffer.buffer, None) };
        buffer.buffer = vk::Buffer::null();
        if let Some(allocation) = buffer.allocation.take() {
            if let Err(e) = device.allocator().lock().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
    }

    pub fn destroy_image(&self, device: &VulkanDevice, image: &mut GpuImage) {
        unsafe {
            device.device.destroy_image_view(image.view, None);
            device.device.destroy_image(image.image, None);
        }
        image.view = vk::ImageView::null();
        image.image = vk::Image::null();
        if let Some(allocation) = image.allocation.take() {
            if let Err(e) = device.allocator().lock().free(allocation) {
                log::error!("Failed to free image memory: {}", e);
            }
        }
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        self.transfer.pool.destroy(&device.device);
        self.graphics.pool.destroy(&device.device);
    }

    fn submit_transfer<F>(&self, device: &VulkanDevice, record: F) -> RenderResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        submit_one_shot(
            device,
            &self.transfer.pool,
            self.transfer.queue,
            self.upload_timeout,
            record,
        )
    }
}

fn color_layer(mip_level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Extent of each mip level, largest first.
fn mip_extents(extent: vk::Extent2D, levels: u32) -> Vec<(i32, i32)> {
    let mut width = extent.width as i32;
    let mut height = extent.height as i32;
    let mut extents = Vec::with_capacity(levels as usize);
    for _ in 0..levels {
        extents.push((width, height));
        width = (width / 2).max(1);
        height = (height / 2).max(1);
    }
    extents
}

/// Level 0 holds the image in TRANSFER_DST_OPTIMAL. Each later level is
/// blitted from the one above it; every level ends in SHADER_READ_ONLY.
fn record_mip_chain(d: &ash::Device, cmd: vk::CommandBuffer, image: &GpuImage) {
    let extents = mip_extents(image.extent, image.mip_levels);

    for (level, pair) in (1..).zip(extents.windows(2)) {
        let ((src_w, src_h), (dst_w, dst_h)) = (pair[0], pair[1]);
        let source = level - 1;

        ImageTransition::transfer_dst_to_transfer_src().record_level(d, cmd, image.image, source);
        let blit = vk::ImageBlit {
            src_subresource: color_layer(source),
            src_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: src_w,
                    y: src_h,
                    z: 1,
                },
            ],
            dst_subresource: color_layer(level),
            dst_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: dst_w,
                    y: dst_h,
                    z: 1,
                },
            ],
        };
        unsafe {
            d.cmd_blit_image(
                cmd,
                image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
        }
        ImageTransition::transfer_src_to_shader_read().record_level(d, cmd, image.image, source);
    }

    ImageTransition::transfer_dst_to_shader_read().record_level(d, cmd, image.image, image.mip_levels - 1);
}
