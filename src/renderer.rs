// Renderer - the Vulkan side of the frame loop
//
// `RenderContext` owns every GPU object and implements `FrameBackend`;
// `Renderer` pairs it with the scheduler and is what the application sees.
//
// Teardown is explicit: `RenderContext::drop` destroys children in reverse
// creation order, then the `device` field drops and takes the device down.

use crate::backend::buffer::{ImageDesc, MemoryUsage, DEPTH_FORMAT};
use crate::backend::commands::{CommandPool, ImageTransition};
use crate::backend::descriptor::create_sampler;
use crate::backend::error::VkResultExt;
use crate::backend::sync::{create_semaphores, destroy_semaphores};
use crate::backend::{
    choose_sample_count, AcquireOutcome, AttachmentFormats, BlendState, DescriptorAllocator, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, DeviceDesc, DeviceFeatures, FrameSync, GpuBuffer, GpuImage,
    GraphicsPipeline, PipelineBuilder, PresentOutcome, QueueCapability, RecreateOutcome, RenderError,
    RenderResult, ResourceAllocator, ShaderBinary, Swapchain, SwapchainRequest, VulkanDevice,
    WindowHandles,
};
use crate::config::{Config, ShaderConfig};
use crate::frame::{FrameBackend, FrameScheduler, FrameStats, FrameStatus};
use crate::scene::{DrawConstants, Mesh, SceneData, TextureData, UniformBufferObject, Vertex};
use crate::watch::ShaderWatcher;
use ash::vk;
use std::mem::size_of;
use std::time::Duration;

const TEXTURE_SIZE: u32 = 256;
const TEXTURE_CELLS: u32 = 8;

/// Attachments one frame renders into. With multisampling on, drawing goes
/// to `multisampled` and is resolved into the swapchain image.
#[derive(Clone, Copy, Debug)]
pub struct RenderTargets {
    pub color_image: vk::Image,
    pub color_view: vk::ImageView,
    pub multisampled: Option<(vk::Image, vk::ImageView)>,
    pub depth_image: vk::Image,
    pub depth_view: vk::ImageView,
    pub extent: vk::Extent2D,
}

/// Resources owned by one frame in flight.
struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    uniform_buffer: GpuBuffer,
    descriptor_set: vk::DescriptorSet,
    sync: FrameSync,
}

pub struct RenderContext {
    slots: Vec<FrameSlot>,
    command_pool: CommandPool,
    descriptors: DescriptorAllocator,
    set_layout: DescriptorSetLayout,
    pipeline: GraphicsPipeline,
    shaders: ShaderConfig,
    shader_watcher: Option<ShaderWatcher>,
    sampler: vk::Sampler,
    texture: GpuImage,
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    index_count: u32,
    samples: vk::SampleCountFlags,
    color_msaa: Option<GpuImage>,
    depth: GpuImage,
    render_finished: Vec<vk::Semaphore>,
    swapchain: Swapchain,
    swapchain_request: SwapchainRequest,
    present_queue: vk::Queue,
    fence_timeout: Duration,
    resources: ResourceAllocator,
    device: VulkanDevice,
}

impl RenderContext {
    pub fn new(device: VulkanDevice, config: &Config, width: u32, height: u32) -> RenderResult<Self> {
        let frames_in_flight = config.graphics.max_frames_in_flight;
        let present_queue = device
            .queue(QueueCapability::Present)
            .ok_or_else(|| RenderError::InvalidRequest("device has no present queue".into()))?;

        let swapchain_request = SwapchainRequest {
            width,
            height,
            preferred_image_count: config.graphics.preferred_image_count,
            surface_format: config.surface_format(),
            present_mode: config.present_mode(),
        };
        let swapchain = Swapchain::new(&device, &swapchain_request, None)?
            .ok_or_else(|| RenderError::InvalidRequest("window has zero area at startup".into()))?;
        if frames_in_flight > swapchain.image_count() {
            log::warn!(
                "{} frames in flight but only {} swapchain images",
                frames_in_flight,
                swapchain.image_count()
            );
        }
        let render_finished = create_semaphores(&device, swapchain.image_count())?;

        let samples = choose_sample_count(config.graphics.msaa_samples, device.usable_sample_counts());
        log::info!("MSAA: {:?} (requested {})", samples, config.graphics.msaa_samples);

        let resources = ResourceAllocator::new(&device, config.fence_timeout())?;
        let depth = resources.create_depth_image(&device, swapchain.extent, samples)?;
        let color_msaa = create_color_target(&resources, &device, &swapchain, samples)?;

        let mesh = match &config.scene.model {
            Some(path) => Mesh::load_obj(path)?,
            None => Mesh::quad(),
        };
        let vertex_buffer = resources.create_buffer_with_data(
            &device,
            "mesh vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            bytemuck::cast_slice(&mesh.vertices),
        )?;
        let index_buffer = resources.create_buffer_with_data(
            &device,
            "mesh indices",
            vk::BufferUsageFlags::INDEX_BUFFER,
            bytemuck::cast_slice(&mesh.indices),
        )?;

        let texture_data = match &config.scene.texture {
            Some(path) => TextureData::load(path)?,
            None => TextureData::checkerboard(TEXTURE_SIZE, TEXTURE_CELLS),
        };
        let mut texture_desc = ImageDesc::texture(texture_data.extent, vk::Format::R8G8B8A8_SRGB);
        if !device.supports_linear_blit(texture_desc.format) {
            log::warn!("{:?} cannot be blitted linearly; texture has no mipmaps", texture_desc.format);
            texture_desc.mip_levels = 1;
        }
        let texture = resources.create_image(&device, "texture", &texture_desc)?;
        resources.upload_image(&device, &texture, &texture_data.pixels)?;
        let sampler = create_sampler(&device, texture.mip_levels)?;

        let set_layout = DescriptorSetLayoutBuilder::new()
            .binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
            .binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT)
            .build(&device)?;

        let frames = frames_in_flight as u32;
        let mut descriptors = DescriptorAllocator::new(
            &device,
            &[
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: frames,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: frames,
                },
            ],
            frames,
        )?;
        let descriptor_sets = descriptors.allocate_sets(&device, &set_layout, frames)?;

        let pipeline = build_pipeline(
            &device,
            &config.shaders,
            &set_layout,
            attachment_formats(swapchain.surface_format.format, samples),
        )?;

        let command_pool = CommandPool::new(
            &device,
            device.queue_families.graphics,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        let command_buffers = command_pool.allocate(&device, frames)?;

        let ubo_size = size_of::<UniformBufferObject>() as vk::DeviceSize;
        let mut slots = Vec::with_capacity(frames_in_flight);
        for (command_buffer, descriptor_set) in command_buffers.into_iter().zip(descriptor_sets) {
            let uniform_buffer = resources.create_buffer(
                &device,
                "frame uniforms",
                ubo_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryUsage::HostVisible,
            )?;
            // Written once here; the GPU never reads a set during setup.
            DescriptorAllocator::bind_uniform_buffer(&device, descriptor_set, 0, uniform_buffer.buffer, ubo_size);
            DescriptorAllocator::bind_combined_image_sampler(&device, descriptor_set, 1, texture.view, sampler);

            slots.push(FrameSlot {
                command_buffer,
                uniform_buffer,
                descriptor_set,
                sync: FrameSync::new(&device)?,
            });
        }

        let shader_watcher = if config.debug.hot_reload_shaders {
            match ShaderWatcher::new(&[config.shaders.vertex.clone(), config.shaders.fragment.clone()]) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Shader hot reload disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        log::info!(
            "Render context ready: {} frames in flight, {} swapchain images",
            frames_in_flight,
            swapchain.image_count()
        );

        Ok(Self {
            slots,
            command_pool,
            descriptors,
            set_layout,
            pipeline,
            shaders: config.shaders.clone(),
            shader_watcher,
            sampler,
            texture,
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
            samples,
            color_msaa,
            depth,
            render_finished,
            swapchain,
            swapchain_request,
            present_queue,
            fence_timeout: config.fence_timeout(),
            resources,
            device,
        })
    }

    pub fn device(&self) -> &VulkanDevice {
        &self.device
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// Rebuild the pipeline if a watched shader changed. A broken shader
    /// keeps the previous pipeline in place.
    pub fn poll_shader_reload(&mut self) -> RenderResult<()> {
        let changed = self.shader_watcher.as_ref().is_some_and(|w| w.poll_changed());
        if changed {
            self.reload_pipeline()?;
        }
        Ok(())
    }

    pub fn reload_pipeline(&mut self) -> RenderResult<()> {
        self.wait_for_all_slots()?;
        match build_pipeline(
            &self.device,
            &self.shaders,
            &self.set_layout,
            attachment_formats(self.swapchain.surface_format.format, self.samples),
        ) {
            Ok(pipeline) => {
                let old = std::mem::replace(&mut self.pipeline, pipeline);
                old.destroy(&self.device.device);
                log::info!("Shaders reloaded");
                Ok(())
            }
            Err(e) if matches!(e, RenderError::Shader(_) | RenderError::PipelineCreation(_)) => {
                log::warn!("Shader reload failed, keeping previous pipeline: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Bounded wait on every slot fence. Once this returns, no frame
    /// submission is still executing.
    fn wait_for_all_slots(&self) -> RenderResult<()> {
        let fences: Vec<vk::Fence> = self.slots.iter().map(|s| s.sync.in_flight_fence).collect();
        if fences.is_empty() {
            return Ok(());
        }
        self.device.wait_for_fences(&fences, self.fence_timeout)
    }

    fn targets(&self, image_index: u32) -> RenderTargets {
        RenderTargets {
            color_image: self.swapchain.images[image_index as usize],
            color_view: self.swapchain.image_views[image_index as usize],
            multisampled: self.color_msaa.as_ref().map(|image| (image.image, image.view)),
            depth_image: self.depth.image,
            depth_view: self.depth.view,
            extent: self.swapchain.extent,
        }
    }
}

fn attachment_formats(color: vk::Format, samples: vk::SampleCountFlags) -> AttachmentFormats {
    AttachmentFormats {
        color,
        depth: Some(DEPTH_FORMAT),
        samples,
    }
}

fn create_color_target(
    resources: &ResourceAllocator,
    device: &VulkanDevice,
    swapchain: &Swapchain,
    samples: vk::SampleCountFlags,
) -> RenderResult<Option<GpuImage>> {
    if samples == vk::SampleCountFlags::TYPE_1 {
        return Ok(None);
    }
    let desc = ImageDesc::transient_color(swapchain.extent, swapchain.surface_format.format, samples);
    resources.create_image(device, "msaa color", &desc).map(Some)
}

fn build_pipeline(
    device: &VulkanDevice,
    shaders: &ShaderConfig,
    set_layout: &DescriptorSetLayout,
    formats: AttachmentFormats,
) -> RenderResult<GraphicsPipeline> {
    let stages = [
        ShaderBinary::load(&shaders.vertex, vk::ShaderStageFlags::VERTEX, &shaders.vertex_entry)?,
        ShaderBinary::load(&shaders.fragment, vk::ShaderStageFlags::FRAGMENT, &shaders.fragment_entry)?,
    ];
    PipelineBuilder::new(
        &stages,
        Vertex::layout(),
        BlendState::Opaque,
        formats,
    )
    .set_layouts(&[set_layout.layout])
    .push_constants(vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX,
        offset: 0,
        size: size_of::<DrawConstants>() as u32,
    })
    .build(device)
}

impl FrameBackend for RenderContext {
    type Scene = SceneData;

    fn wait_for_slot(&mut self, slot: usize, timeout: Duration) -> RenderResult<()> {
        self.slots[slot].sync.wait(&self.device, timeout)
    }

    fn acquire_image(&mut self, slot: usize) -> RenderResult<AcquireOutcome> {
        self.swapchain
            .acquire_next_image(self.slots[slot].sync.image_available)
    }

    fn update_uniforms(&mut self, slot: usize, scene: &SceneData) -> RenderResult<()> {
        let ubo = scene.uniforms(self.swapchain.extent);
        self.slots[slot]
            .uniform_buffer
            .write_mapped(bytemuck::bytes_of(&ubo))
    }

    fn record(&mut self, slot: usize, image_index: u32, scene: &SceneData) -> RenderResult<()> {
        let d = &self.device.device;
        let cmd = self.slots[slot].command_buffer;
        let targets = self.targets(image_index);

        unsafe {
            d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("resetting frame command buffer")?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            d.begin_command_buffer(cmd, &begin_info)
                .context("beginning frame command buffer")?;
        }

        ImageTransition::acquired_to_color_attachment().record(d, cmd, targets.color_image);
        if let Some((image, _)) = targets.multisampled {
            ImageTransition::multisampled_color_attachment().record(d, cmd, image);
        }
        ImageTransition::depth_attachment().record(d, cmd, targets.depth_image);

        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: scene.clear_color,
                },
            });
        let color_attachment = match targets.multisampled {
            Some((_, view)) => color_attachment
                .image_view(view)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .resolve_mode(vk::ResolveModeFlags::AVERAGE)
                .resolve_image_view(targets.color_view)
                .resolve_image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            None => color_attachment
                .image_view(targets.color_view)
                .store_op(vk::AttachmentStoreOp::STORE),
        };
        let color_attachments = [color_attachment.build()];
        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(targets.depth_view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let render_area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: targets.extent,
        };
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: targets.extent.width as f32,
            height: targets.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            d.cmd_begin_rendering(cmd, &rendering_info);
            d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
            d.cmd_set_viewport(cmd, 0, &[viewport]);
            d.cmd_set_scissor(cmd, 0, &[render_area]);
            d.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            d.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT32);
            d.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[self.slots[slot].descriptor_set],
                &[],
            );
            d.cmd_push_constants(
                cmd,
                self.pipeline.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&scene.draw_constants()),
            );
            d.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
            d.cmd_end_rendering(cmd);
        }

        ImageTransition::color_attachment_to_present().record(d, cmd, targets.color_image);

        unsafe { d.end_command_buffer(cmd) }.context("ending frame command buffer")
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> RenderResult<()> {
        let slot = &self.slots[slot];
        let wait_semaphores = [slot.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [slot.command_buffer];
        let signal_semaphores = [self.render_finished[image_index as usize]];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        slot.sync.reset(&self.device)?;
        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue(),
                &[submit_info.build()],
                slot.sync.in_flight_fence,
            )
        }
        .context("submitting frame")
    }

    /// An empty submission that waits on the acquire semaphore and signals
    /// the slot fence, so both are back in their between-frames state.
    fn abandon_frame(&mut self, slot: usize) -> RenderResult<()> {
        let sync = &self.slots[slot].sync;
        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);

        sync.reset(&self.device)?;
        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue(),
                &[submit_info.build()],
                sync.in_flight_fence,
            )
        }
        .context("submitting abandoned frame")
    }

    fn present(&mut self, _slot: usize, image_index: u32) -> RenderResult<PresentOutcome> {
        self.swapchain.present(
            self.present_queue,
            image_index,
            &[self.render_finished[image_index as usize]],
        )
    }

    fn set_drawable_size(&mut self, width: u32, height: u32) {
        self.swapchain_request.width = width;
        self.swapchain_request.height = height;
    }

    fn recreate_swapchain(&mut self) -> RenderResult<RecreateOutcome> {
        self.wait_for_all_slots()?;
        let outcome = self.swapchain.recreate(&self.device, &self.swapchain_request)?;
        if outcome == RecreateOutcome::Deferred {
            return Ok(outcome);
        }

        // Device is idle: the old attachments and semaphores are unused.
        let depth = self
            .resources
            .create_depth_image(&self.device, self.swapchain.extent, self.samples)?;
        let mut old_depth = std::mem::replace(&mut self.depth, depth);
        self.resources.destroy_image(&self.device, &mut old_depth);

        let color_msaa = create_color_target(&self.resources, &self.device, &self.swapchain, self.samples)?;
        if let Some(mut old) = std::mem::replace(&mut self.color_msaa, color_msaa) {
            self.resources.destroy_image(&self.device, &mut old);
        }

        let render_finished = create_semaphores(&self.device, self.swapchain.image_count())?;
        let old_semaphores = std::mem::replace(&mut self.render_finished, render_finished);
        destroy_semaphores(&self.device.device, &old_semaphores);

        if self.pipeline.formats.color != self.swapchain.surface_format.format {
            self.reload_pipeline()?;
        }

        log::info!(
            "Swapchain recreated: {}x{}",
            self.swapchain.extent.width,
            self.swapchain.extent.height
        );
        Ok(outcome)
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.wait_for_all_slots()?;
        self.device.wait_idle()
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        log::info!("Cleaning up render resources...");

        // A hung GPU is reported, not waited on forever.
        match self.wait_for_all_slots() {
            Ok(()) => {
                if let Err(e) = self.device.wait_idle() {
                    log::error!("Device did not go idle before teardown: {}", e);
                }
            }
            Err(e) => log::error!("Frames still in flight at teardown: {}", e),
        }

        let d = &self.device.device;
        for mut slot in self.slots.drain(..) {
            slot.sync.destroy(d);
            self.resources.destroy_buffer(&self.device, &mut slot.uniform_buffer);
        }
        self.command_pool.destroy(d);
        self.descriptors.destroy(d);
        self.pipeline.destroy(d);
        self.set_layout.destroy(d);
        unsafe { d.destroy_sampler(self.sampler, None) };

        self.resources.destroy_image(&self.device, &mut self.texture);
        self.resources.destroy_image(&self.device, &mut self.depth);
        if let Some(mut color) = self.color_msaa.take() {
            self.resources.destroy_image(&self.device, &mut color);
        }
        self.resources.destroy_buffer(&self.device, &mut self.vertex_buffer);
        self.resources.destroy_buffer(&self.device, &mut self.index_buffer);

        destroy_semaphores(d, &self.render_finished);
        self.swapchain.destroy(d);
        self.resources.destroy(&self.device);

        log::info!("Render resources destroyed");
    }
}

/// What the application drives: the scheduler plus its Vulkan backend.
pub struct Renderer {
    frames: FrameScheduler<RenderContext>,
}

impl Renderer {
    pub fn initialize(config: &Config, window: WindowHandles, width: u32, height: u32) -> RenderResult<Self> {
        let device = VulkanDevice::new(&DeviceDesc {
            app_name: &config.window.title,
            enable_validation: config.debug.validation_layers,
            required_extensions: Vec::new(),
            required_features: DeviceFeatures::renderer(),
            window: Some(window),
        })?;

        let context = RenderContext::new(device, config, width, height)?;
        let frames = FrameScheduler::new(
            context,
            config.graphics.max_frames_in_flight,
            config.fence_timeout(),
        )?;
        Ok(Self { frames })
    }

    pub fn render_frame(&mut self, scene: &SceneData) -> RenderResult<FrameStatus> {
        self.frames.backend_mut().poll_shader_reload()?;
        self.frames.render_frame(scene)
    }

    pub fn notify_resized(&mut self, width: u32, height: u32) {
        self.frames.notify_resized(width, height);
    }

    pub fn stats(&self) -> FrameStats {
        self.frames.stats()
    }

    pub fn validation_error_count(&self) -> u32 {
        self.frames.backend().device().validation_error_count()
    }

    /// Wait for in-flight work, then destroy everything in order.
    pub fn wait_idle_and_shutdown(mut self) -> RenderResult<()> {
        let result = self.frames.shutdown();
        drop(self.frames.into_backend());
        result
    }
}
