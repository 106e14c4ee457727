// Graphics pipeline creation
//
// Pipelines are built against attachment formats (dynamic rendering), not a
// render pass, so they survive swapchain recreation as long as the formats
// stay the same. Viewport and scissor are dynamic state set at record time.

use super::error::{RenderError, RenderResult};
use super::shader::{create_shader_module, ShaderBinary};
use super::VulkanDevice;
use ash::vk;

/// Interleaved single-binding vertex layout.
#[derive(Clone, Debug, Default)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexLayout {
    pub fn new(stride: u32) -> Self {
        Self {
            stride,
            attributes: Vec::new(),
        }
    }

    pub fn attribute(mut self, location: u32, format: vk::Format, offset: u32) -> Self {
        self.attributes.push(vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset,
        });
        self
    }

    fn bindings(&self) -> Vec<vk::VertexInputBindingDescription> {
        if self.stride == 0 {
            return Vec::new();
        }
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlendState {
    #[default]
    Opaque,
    AlphaBlend,
}

impl BlendState {
    pub fn attachment_state(self) -> vk::PipelineColorBlendAttachmentState {
        match self {
            Self::Opaque => vk::PipelineColorBlendAttachmentState {
                blend_enable: vk::FALSE,
                color_write_mask: vk::ColorComponentFlags::RGBA,
                ..Default::default()
            },
            Self::AlphaBlend => vk::PipelineColorBlendAttachmentState {
                blend_enable: vk::TRUE,
                src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
                dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
                color_blend_op: vk::BlendOp::ADD,
                src_alpha_blend_factor: vk::BlendFactor::ONE,
                dst_alpha_blend_factor: vk::BlendFactor::ZERO,
                alpha_blend_op: vk::BlendOp::ADD,
                color_write_mask: vk::ColorComponentFlags::RGBA,
            },
        }
    }
}

/// Formats of the attachments the pipeline renders into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentFormats {
    pub color: vk::Format,
    pub depth: Option<vk::Format>,
    /// Sample count shared by every attachment. Above one, the color
    /// attachment is resolved into a single-sampled image.
    pub samples: vk::SampleCountFlags,
}

pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub formats: AttachmentFormats,
}

impl GraphicsPipeline {
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

pub struct PipelineBuilder<'a> {
    shader_stages: &'a [ShaderBinary],
    vertex_layout: VertexLayout,
    blend_state: BlendState,
    attachment_formats: AttachmentFormats,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(
        shader_stages: &'a [ShaderBinary],
        vertex_layout: VertexLayout,
        blend_state: BlendState,
        attachment_formats: AttachmentFormats,
    ) -> Self {
        Self {
            shader_stages,
            vertex_layout,
            blend_state,
            attachment_formats,
            set_layouts: Vec::new(),
            push_constant_ranges: Vec::new(),
        }
    }

    pub fn set_layouts(mut self, layouts: &[vk::DescriptorSetLayout]) -> Self {
        self.set_layouts = layouts.to_vec();
        self
    }

    pub fn push_constants(mut self, range: vk::PushConstantRange) -> Self {
        self.push_constant_ranges.push(range);
        self
    }

    /// Checks that need no device: one vertex and one fragment stage and a
    /// usable color format and sample count.
    pub fn validate(&self) -> RenderResult<()> {
        let count = |stage| self.shader_stages.iter().filter(|s| s.stage == stage).count();
        if count(vk::ShaderStageFlags::VERTEX) != 1 {
            return Err(RenderError::PipelineCreation("exactly one vertex stage is required".into()));
        }
        if count(vk::ShaderStageFlags::FRAGMENT) != 1 {
            return Err(RenderError::PipelineCreation("exactly one fragment stage is required".into()));
        }
        if self.attachment_formats.color == vk::Format::UNDEFINED {
            return Err(RenderError::PipelineCreation("color attachment format is undefined".into()));
        }
        let samples = self.attachment_formats.samples.as_raw();
        if !samples.is_power_of_two() {
            return Err(RenderError::PipelineCreation(format!(
                "sample count {:?} is not a single count",
                self.attachment_formats.samples
            )));
        }
        Ok(())
    }

    pub fn build(&self, device: &VulkanDevice) -> RenderResult<GraphicsPipeline> {
        self.validate()?;

        let mut modules = Vec::with_capacity(self.shader_stages.len());
        for binary in self.shader_stages {
            match create_shader_module(device, binary) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    destroy_modules(device, &modules);
                    return Err(e);
                }
            }
        }

        let result = self.build_with_modules(device, &modules);
        destroy_modules(device, &modules);
        result
    }

    fn build_with_modules(
        &self,
        device: &VulkanDevice,
        modules: &[vk::ShaderModule],
    ) -> RenderResult<GraphicsPipeline> {
        let stages: Vec<_> = self
            .shader_stages
            .iter()
            .zip(modules)
            .map(|(binary, &module)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(binary.stage)
                    .module(module)
                    .name(&binary.entry_point)
                    .build()
            })
            .collect();

        let bindings = self.vertex_layout.bindings();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&self.vertex_layout.attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Counts only; the rectangles come from cmd_set_viewport/scissor.
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(self.attachment_formats.samples);

        let depth_enabled = self.attachment_formats.depth.is_some();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(depth_enabled)
            .depth_write_enable(depth_enabled)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments = [self.blend_state.attachment_state()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&self.set_layouts)
            .push_constant_ranges(&self.push_constant_ranges);
        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .map_err(|result| rejected("pipeline layout", result))?;

        let color_formats = [self.attachment_formats.color];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(self.attachment_formats.depth.unwrap_or(vk::Format::UNDEFINED));

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        match pipelines {
            Ok(pipelines) => {
                log::debug!(
                    "Built pipeline ({:?}, color {:?}, depth {:?}, {:?})",
                    self.blend_state,
                    self.attachment_formats.color,
                    self.attachment_formats.depth,
                    self.attachment_formats.samples
                );
                Ok(GraphicsPipeline {
                    pipeline: pipelines[0],
                    layout,
                    formats: self.attachment_formats,
                })
            }
            Err((_, result)) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                Err(rejected("pipeline", result))
            }
        }
    }
}

fn rejected(what: &str, result: vk::Result) -> RenderError {
    RenderError::PipelineCreation(format!("driver rejected {what}: {result}"))
}

fn destroy_modules(device: &VulkanDevice, modules: &[vk::ShaderModule]) {
    for &module in modules {
        unsafe { device.device.destroy_shader_module(module, None) };
    }
}
