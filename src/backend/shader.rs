// Shader module loading
//
// SPIR-V comes from the external compiler (build.rs runs glslc). A binary
// carries its stage and entry point so the pipeline builder needs nothing
// else to wire it up.

use super::error::{RenderError, RenderResult};
use super::VulkanDevice;
use ash::vk;
use std::ffi::CString;
use std::io::Cursor;
use std::path::Path;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Clone, Debug)]
pub struct ShaderBinary {
    pub stage: vk::ShaderStageFlags,
    pub entry_point: CString,
    pub code: Vec<u32>,
}

impl ShaderBinary {
    pub fn from_bytes(stage: vk::ShaderStageFlags, entry_point: &str, bytes: &[u8]) -> RenderResult<Self> {
        // read_spv copies into u32 words, so unaligned input is fine.
        let code = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|e| RenderError::Shader(format!("invalid SPIR-V: {e}")))?;
        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(RenderError::Shader("missing SPIR-V magic number".into()));
        }
        let entry_point = CString::new(entry_point)
            .map_err(|_| RenderError::Shader(format!("entry point {entry_point:?} contains NUL")))?;
        Ok(Self {
            stage,
            entry_point,
            code,
        })
    }

    pub fn load(path: impl AsRef<Path>, stage: vk::ShaderStageFlags, entry_point: &str) -> RenderResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| RenderError::Shader(format!("reading {}: {e}", path.display())))?;
        log::debug!("Loaded {:?} shader from {} ({} bytes)", stage, path.display(), bytes.len());
        Self::from_bytes(stage, entry_point, &bytes)
    }
}

/// The module is only needed until the pipeline using it is built.
pub fn create_shader_module(device: &VulkanDevice, binary: &ShaderBinary) -> RenderResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&binary.code);
    unsafe { device.device.create_shader_module(&create_info, None) }
        .map_err(|e| RenderError::Shader(format!("creating {:?} module: {e}", binary.stage)))
}
