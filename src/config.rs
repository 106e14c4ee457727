// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Missing file or missing keys fall back to defaults. Values that would
// break the frame loop (no frames in flight, zero timeouts) are rejected.

use anyhow::{bail, Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub scene: SceneConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Renderer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub surface_format: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    pub preferred_image_count: u32,
    pub fence_timeout_ms: u64,
    /// Requested MSAA samples; capped to what the device supports. 1 disables.
    pub msaa_samples: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            surface_format: "bgra8_srgb".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_frames_in_flight: 2,
            preferred_image_count: 3,
            fence_timeout_ms: 5_000,
            msaa_samples: 4,
        }
    }
}

/// Compiled SPIR-V locations
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
    pub vertex_entry: String,
    pub fragment_entry: String,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/quad.vert.spv"),
            fragment: PathBuf::from("shaders/quad.frag.spv"),
            vertex_entry: "main".to_string(),
            fragment_entry: "main".to_string(),
        }
    }
}

/// Assets drawn by the renderer. Unset paths use the built-in quad and
/// checkerboard.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct SceneConfig {
    pub model: Option<PathBuf>,
    pub texture: Option<PathBuf>,
}

/// Debug settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    pub hot_reload_shaders: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "frame_renderer.log".to_string(),
            show_fps: true,
            hot_reload_shaders: false,
        }
    }
}

pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let frames = self.graphics.max_frames_in_flight;
        if frames == 0 || frames > MAX_FRAMES_IN_FLIGHT {
            bail!("max_frames_in_flight must be between 1 and {MAX_FRAMES_IN_FLIGHT}, got {frames}");
        }
        if self.graphics.fence_timeout_ms == 0 {
            bail!("fence_timeout_ms must be non-zero");
        }
        let samples = self.graphics.msaa_samples;
        if !samples.is_power_of_two() || samples > 64 {
            bail!("msaa_samples must be a power of two up to 64, got {samples}");
        }
        if self.graphics.preferred_image_count == 0 {
            bail!("preferred_image_count must be non-zero");
        }
        if self.window.width == 0 || self.window.height == 0 {
            bail!("window size must be non-zero, got {}x{}", self.window.width, self.window.height);
        }
        Ok(())
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.graphics.fence_timeout_ms)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        let format = match self.graphics.surface_format.to_lowercase().as_str() {
            "bgra8_srgb" => vk::Format::B8G8R8A8_SRGB,
            "bgra8_unorm" => vk::Format::B8G8R8A8_UNORM,
            "rgba8_srgb" => vk::Format::R8G8B8A8_SRGB,
            "rgba8_unorm" => vk::Format::R8G8B8A8_UNORM,
            _ => {
                log::warn!(
                    "Unknown surface format '{}', defaulting to bgra8_srgb",
                    self.graphics.surface_format
                );
                vk::Format::B8G8R8A8_SRGB
            }
        };
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.surface_format().format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(config.shaders.vertex_entry, "main");
        assert_eq!(config.graphics.msaa_samples, 4);
        assert!(config.scene.model.is_none());
        assert!(config.scene.texture.is_none());
    }

    #[test]
    fn scene_assets_and_msaa() {
        let config = Config::from_toml(
            r#"
            [graphics]
            msaa_samples = 1

            [scene]
            model = "assets/viking_room.obj"
            "#,
        )
        .unwrap();
        assert_eq!(config.graphics.msaa_samples, 1);
        assert_eq!(config.scene.model, Some(PathBuf::from("assets/viking_room.obj")));
        assert!(config.scene.texture.is_none());
    }

    #[test]
    fn rejects_odd_sample_counts() {
        for samples in [0, 3, 128] {
            let toml = format!("[graphics]\nmsaa_samples = {samples}\n");
            assert!(Config::from_toml(&toml).is_err(), "{samples} samples accepted");
        }
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [graphics]
            present_mode = "FIFO"
            max_frames_in_flight = 3

            [debug]
            hot_reload_shaders = true
            "#,
        )
        .unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.graphics.max_frames_in_flight, 3);
        assert_eq!(config.graphics.fence_timeout_ms, 5_000);
        assert!(config.debug.hot_reload_shaders);
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn rejects_bad_frame_counts() {
        for frames in [0, 4] {
            let toml = format!("[graphics]\nmax_frames_in_flight = {frames}\n");
            assert!(Config::from_toml(&toml).is_err(), "{frames} frames accepted");
        }
    }

    #[test]
    fn rejects_zero_timeout_and_size() {
        assert!(Config::from_toml("[graphics]\nfence_timeout_ms = 0\n").is_err());
        assert!(Config::from_toml("[window]\nwidth = 0\n").is_err());
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let config = Config::from_toml("[graphics]\npresent_mode = \"vsync-ish\"\n").unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn missing_file_is_default() {
        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.fence_timeout(), Duration::from_secs(5));
    }
}
