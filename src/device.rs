use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::SessionError;

/// Which way a camera points, used to pick a platform default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    Back,
    External,
    Unknown,
}

/// A capture device as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Opaque, stable identifier.
    pub id: String,
    /// Display name. May be empty until access has been granted.
    pub label: String,
    pub facing: Facing,
}

impl Device {
    pub fn new(id: impl Into<String>, label: impl Into<String>, facing: Facing) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            facing,
        }
    }

    /// Label for menus, falling back to the id when the platform withheld it.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

/// Requested stream geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub width: u32,
    pub height: u32,
}

/// An open camera feed. Implementations own the underlying tracks.
#[async_trait]
pub trait CameraStream: Send + Sync {
    /// Pull the newest frame from the feed.
    async fn next_frame(&mut self) -> Result<RgbImage, SessionError>;

    /// Stop every track of the feed. Must be safe to call more than once.
    fn stop(&mut self);
}

/// Platform camera capability: enumeration plus stream acquisition.
#[async_trait]
pub trait CameraBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn enumerate(&self) -> Result<Vec<Device>, SessionError>;

    async fn open_stream(
        &self,
        device: &Device,
        settings: StreamSettings,
    ) -> Result<Box<dyn CameraStream>, SessionError>;
}

/// Enumerates capture devices through a backend.
pub struct DeviceRegistry {
    backend: Arc<dyn CameraBackend>,
    permission_granted: AtomicBool,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self {
            backend,
            permission_granted: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CameraBackend> {
        &self.backend
    }

    /// List available devices in enumeration order.
    ///
    /// The first call triggers the platform permission prompt; later calls reuse it.
    pub async fn list_devices(&self) -> Result<Vec<Device>, SessionError> {
        let first_attempt = !self.permission_granted.load(Ordering::Acquire);
        if first_attempt {
            log::info!("Requesting camera access from {} backend", self.backend.name());
        }

        let devices = self.backend.enumerate().await.map_err(|e| {
            log::warn!("Camera enumeration failed: {}", e);
            e
        })?;

        self.permission_granted.store(true, Ordering::Release);
        log::debug!("Enumerated {} camera(s)", devices.len());
        Ok(devices)
    }

    pub fn permission_granted(&self) -> bool {
        self.permission_granted.load(Ordering::Acquire)
    }

    pub async fn find(&self, id: &str) -> Result<Option<Device>, SessionError> {
        let devices = self.list_devices().await?;
        Ok(devices.into_iter().find(|d| d.id == id))
    }
}

/// Pick the first device facing the preferred way, else the first device.
pub fn default_device(devices: &[Device], preference: Facing) -> Option<&Device> {
    devices
        .iter()
        .find(|d| d.facing == preference)
        .or_else(|| devices.first())
}
