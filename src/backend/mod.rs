// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. Every object here is destroyed explicitly by
// its owner, in dependency order, before the device goes away.

pub mod buffer;
pub mod commands;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::{GpuBuffer, GpuImage, ImageDesc, MemoryUsage, ResourceAllocator};
pub use descriptor::{DescriptorAllocator, DescriptorSetLayout, DescriptorSetLayoutBuilder};
pub use device::{choose_sample_count, DeviceDesc, DeviceFeatures, QueueCapability, QueueFamilies, VulkanDevice};
pub use error::{RenderError, RenderResult};
pub use pipeline::{AttachmentFormats, BlendState, GraphicsPipeline, PipelineBuilder, VertexLayout};
pub use shader::ShaderBinary;
pub use surface::WindowHandles;
pub use swapchain::{AcquireOutcome, PresentOutcome, RecreateOutcome, Swapchain, SwapchainRequest};
pub use sync::FrameSync;
