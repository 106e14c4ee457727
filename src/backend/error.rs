// Engine error taxonomy
//
// Setup failures are fatal. Memory exhaustion gets its own kinds so the
// caller can pick a recovery policy; an exhausted descriptor pool means the
// pool was sized wrong and is fatal like any other setup error. Device loss
// ends the context. Out-of-date / suboptimal swapchains never show up here:
// the frame scheduler handles them as outcomes, not errors.

use ash::vk;
use thiserror::Error;

pub type RenderResult<T> = Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to load Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("no suitable GPU found: {0}")]
    NoSuitableDevice(String),

    #[error("logical device creation rejected: {0}")]
    DeviceCreation(String),

    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("shader error: {0}")]
    Shader(String),

    #[error("failed to load asset: {0}")]
    Asset(String),

    #[error("out of device memory while {0}")]
    OutOfDeviceMemory(String),

    #[error("out of host memory while {0}")]
    OutOfHostMemory(String),

    #[error("descriptor pool exhausted: requested {requested} sets, {remaining} remaining")]
    DescriptorPoolExhausted { requested: u32, remaining: u32 },

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("{context}: {result}")]
    Vulkan {
        context: String,
        result: vk::Result,
    },

    #[error("allocation failed: {0}")]
    Allocation(gpu_allocator::AllocationError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RenderError {
    /// Memory exhaustion: the application may free resources and retry.
    /// Everything else tears the context down.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::OutOfDeviceMemory(_) | Self::OutOfHostMemory(_))
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost(_))
    }

    /// Map a raw `vk::Result`, routing memory and device-lost codes into
    /// their dedicated kinds.
    pub fn from_vk(context: impl Into<String>, result: vk::Result) -> Self {
        let context = context.into();
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory(context),
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory(context),
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost(context),
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                Self::DescriptorPoolExhausted {
                    requested: 0,
                    remaining: 0,
                }
            }
            result => Self::Vulkan { context, result },
        }
    }

    pub(crate) fn from_allocation(context: &str, err: gpu_allocator::AllocationError) -> Self {
        match err {
            gpu_allocator::AllocationError::OutOfMemory => {
                Self::OutOfDeviceMemory(context.to_string())
            }
            err => Self::Allocation(err),
        }
    }
}

/// `anyhow::Context`-style helper for raw `VkResult`s.
pub trait VkResultExt<T> {
    fn context(self, context: &str) -> RenderResult<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn context(self, context: &str) -> RenderResult<T> {
        self.map_err(|result| RenderError::from_vk(context, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_codes_get_dedicated_kinds() {
        let err = RenderError::from_vk("creating buffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(err, RenderError::OutOfDeviceMemory(ref c) if c == "creating buffer"));

        let err = RenderError::from_vk("creating buffer", vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(matches!(err, RenderError::OutOfHostMemory(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn device_lost_is_not_recoverable() {
        let err = RenderError::from_vk("waiting for fence", vk::Result::ERROR_DEVICE_LOST);
        assert!(err.is_device_lost());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn pool_codes_map_to_exhaustion() {
        let err = RenderError::from_vk("allocating sets", vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        assert!(matches!(err, RenderError::DescriptorPoolExhausted { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn only_memory_exhaustion_is_recoverable() {
        assert!(RenderError::OutOfDeviceMemory("x".into()).is_recoverable());
        assert!(RenderError::OutOfHostMemory("x".into()).is_recoverable());

        let fatal = [
            RenderError::DescriptorPoolExhausted {
                requested: 3,
                remaining: 2,
            },
            RenderError::InvalidRequest("x".into()),
            RenderError::PipelineCreation("x".into()),
            RenderError::Asset("x".into()),
            RenderError::DeviceLost("x".into()),
        ];
        for err in fatal {
            assert!(!err.is_recoverable(), "{err} classified as recoverable");
        }
    }

    #[test]
    fn other_codes_keep_context() {
        let result: ash::prelude::VkResult<()> = Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        let err = result.context("creating instance").unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("creating instance: {}", vk::Result::ERROR_INITIALIZATION_FAILED)
        );
    }

    #[test]
    fn allocator_out_of_memory_is_device_memory() {
        let err = RenderError::from_allocation("allocating", gpu_allocator::AllocationError::OutOfMemory);
        assert!(matches!(err, RenderError::OutOfDeviceMemory(_)));
    }
}
