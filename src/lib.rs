// Frame renderer
//
// A Vulkan 1.3 frame loop: device and surface setup, swapchain management,
// staged resource uploads, dynamic-rendering pipelines, a fixed descriptor
// pool and an F-frames-in-flight scheduler.

pub mod backend;
pub mod config;
pub mod frame;
pub mod renderer;
pub mod scene;
pub mod watch;

pub use backend::{RenderError, RenderResult};
pub use config::Config;
pub use frame::{FrameBackend, FrameScheduler, FrameStats, FrameStatus};
pub use renderer::Renderer;
pub use scene::SceneData;
