use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::{Facing, StreamSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    pub paths: PathConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Raspberry Pi camera through rpicam-apps.
    Rpicam,
    /// Moving test pattern, no hardware needed.
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub backend: BackendKind,
    /// Camera to open at startup; the preferred facing is used when unset.
    pub device_id: Option<String>,
    pub preferred_facing: Facing,
    pub width: u32,
    pub height: u32,
    pub mirror: bool,
    pub preview_interval_ms: u64,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub config_file: PathBuf,
    pub instructions_file: PathBuf,
    pub preview_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                backend: BackendKind::Rpicam,
                device_id: None,
                preferred_facing: Facing::Back,
                width: 200, // classifier input is a square 200x200 frame
                height: 200,
                mirror: true,
                preview_interval_ms: 33,
                jpeg_quality: 70,
            },
            paths: PathConfig {
                config_file: PathBuf::from("wastecam_config.toml"),
                instructions_file: PathBuf::from("wastecam_instructions.toml"),
                preview_dir: std::env::temp_dir(),
            },
        }
    }
}

impl CameraConfig {
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            width: self.width,
            height: self.height,
        }
    }

    pub fn preview_interval(&self) -> Duration {
        Duration::from_millis(self.preview_interval_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = PathBuf::from("wastecam_config.toml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            log::info!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save()?;
            Ok(default_config)
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| "Failed to parse configuration file")?;
        config.validate()?;

        log::info!("Configuration loaded from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to_file(&self.paths.config_file)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        std::fs::write(path.as_ref(), contents)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        log::info!("Configuration saved to {}", path.as_ref().display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        if camera.width == 0 || camera.height == 0 {
            return Err(anyhow::anyhow!("Invalid camera dimensions: {}x{}", camera.width, camera.height));
        }

        if camera.width > 4096 || camera.height > 4096 {
            return Err(anyhow::anyhow!("Camera dimensions too large: {}x{}", camera.width, camera.height));
        }

        if camera.preview_interval_ms == 0 {
            return Err(anyhow::anyhow!("Invalid preview interval"));
        }

        if camera.jpeg_quality > 100 {
            return Err(anyhow::anyhow!("Invalid JPEG quality: {}", camera.jpeg_quality));
        }

        if let Some(id) = &camera.device_id {
            if id.trim().is_empty() {
                return Err(anyhow::anyhow!("Camera device id must not be blank"));
            }
        }

        if self.paths.instructions_file == self.paths.config_file {
            return Err(anyhow::anyhow!("Instructions file must differ from the config file"));
        }

        Ok(())
    }
}

// Configuration builder for easier setup
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.camera.backend = backend;
        self
    }

    pub fn camera_size(mut self, width: u32, height: u32) -> Self {
        self.config.camera.width = width;
        self.config.camera.height = height;
        self
    }

    pub fn device_id(mut self, id: impl Into<String>) -> Self {
        self.config.camera.device_id = Some(id.into());
        self
    }

    pub fn preferred_facing(mut self, facing: Facing) -> Self {
        self.config.camera.preferred_facing = facing;
        self
    }

    pub fn mirror(mut self, enabled: bool) -> Self {
        self.config.camera.mirror = enabled;
        self
    }

    pub fn preview_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.camera.preview_interval_ms = interval_ms;
        self
    }

    pub fn instructions_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.paths.instructions_file = path.into();
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// Environment-specific configuration presets
impl Config {
    pub fn raspberry_pi() -> Self {
        Config::default()
    }

    pub fn development_desktop() -> Self {
        Config {
            camera: CameraConfig {
                backend: BackendKind::Synthetic,
                preferred_facing: Facing::Front,
                preview_interval_ms: 100,
                ..Config::default().camera
            },
            ..Config::default()
        }
    }
}
