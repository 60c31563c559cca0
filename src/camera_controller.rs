use async_trait::async_trait;
use chrono::{DateTime, Local};
use image::{ImageBuffer, RgbImage};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use crate::device::{
    default_device, CameraBackend, CameraStream, Device, DeviceRegistry, Facing, StreamSettings,
};
use crate::error::SessionError;

/// An open camera feed bound to one device. Stopping happens on `close` or drop.
pub struct StreamHandle {
    device: Device,
    stream: Box<dyn CameraStream>,
    opened_at: DateTime<Local>,
}

impl StreamHandle {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn opened_at(&self) -> DateTime<Local> {
        self.opened_at
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stream.stop();
    }
}

/// Owns the single active camera stream.
pub struct CaptureSession {
    registry: DeviceRegistry,
    settings: StreamSettings,
    preferred_facing: Facing,
    current: Option<StreamHandle>,
}

impl CaptureSession {
    pub fn new(backend: Arc<dyn CameraBackend>, settings: StreamSettings, preferred_facing: Facing) -> Self {
        Self {
            registry: DeviceRegistry::new(backend),
            settings,
            preferred_facing,
            current: None,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn settings(&self) -> StreamSettings {
        self.settings
    }

    /// Open a stream on `device_id`, or on the preferred default device when `None`.
    ///
    /// Any stream that is already open is stopped before acquisition starts, even
    /// if the new acquisition then fails.
    pub async fn open(&mut self, device_id: Option<&str>) -> Result<&StreamHandle, SessionError> {
        self.close();

        let devices = self.registry.list_devices().await?;
        if devices.is_empty() {
            log::warn!("No cameras available to open");
            return Err(SessionError::NoDevicesFound);
        }

        let device = match device_id {
            Some(id) => devices
                .iter()
                .find(|d| d.id == id)
                .cloned()
                .ok_or_else(|| SessionError::unavailable(id, "not among the enumerated cameras"))?,
            None => default_device(&devices, self.preferred_facing)
                .cloned()
                .ok_or(SessionError::NoDevicesFound)?,
        };

        log::info!(
            "Opening camera {} ({}) at {}x{}",
            device.id,
            device.display_name(),
            self.settings.width,
            self.settings.height
        );

        let stream = self
            .registry
            .backend()
            .open_stream(&device, self.settings)
            .await
            .map_err(|e| {
                log::error!("Failed to open camera {}: {}", device.id, e);
                e
            })?;

        let handle = self.current.insert(StreamHandle {
            device,
            stream,
            opened_at: Local::now(),
        });
        Ok(&*handle)
    }

    /// Release the current stream. No-op when nothing is open.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.current.take() {
            handle.stream.stop();
            log::info!("Camera {} released", handle.device.id);
        }
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_device(&self) -> Option<&Device> {
        self.current.as_ref().map(|h| &h.device)
    }

    pub fn current_handle(&self) -> Option<&StreamHandle> {
        self.current.as_ref()
    }

    /// Pull the newest image from the open stream.
    pub(crate) async fn next_frame(&mut self) -> Result<RgbImage, SessionError> {
        let handle = self.current.as_mut().ok_or(SessionError::NotStreaming)?;
        handle.stream.next_frame().await
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Raspberry Pi camera backend (rpicam-apps)
// ----------------------------------------------------------------------------

/// Camera backend for Raspberry Pi cameras using the `rpicam-still` tool.
///
/// Streams run `rpicam-still` in timelapse mode, overwriting a preview JPEG that
/// is decoded on every frame pull.
pub struct RpiCameraBackend {
    preview_dir: PathBuf,
    quality: u8,
    timelapse_ms: u64,
}

impl RpiCameraBackend {
    pub fn new<P: AsRef<Path>>(preview_dir: P) -> Self {
        Self {
            preview_dir: preview_dir.as_ref().to_path_buf(),
            quality: 70, // lower quality for faster preview
            timelapse_ms: 100,
        }
    }

    /// Set JPEG quality (0-100)
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.min(100);
        self
    }

    pub fn with_timelapse_ms(mut self, timelapse_ms: u64) -> Self {
        self.timelapse_ms = timelapse_ms.max(1);
        self
    }

    fn preview_path(&self, device_id: &str) -> PathBuf {
        self.preview_dir
            .join(format!("wastecam_preview_{}.jpg", sanitize_id(device_id)))
    }
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Parse `rpicam-still --list-cameras` output.
///
/// Camera lines look like `0 : imx219 [3280x2464 10-bit RGGB] (/base/soc/i2c0mux/...)`;
/// mode lines are indented and skipped.
pub fn parse_camera_list(output: &str) -> Vec<Device> {
    output
        .lines()
        .filter_map(|line| {
            let (index, rest) = line.split_once(" : ")?;
            let index = index.trim();
            if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let sensor = rest.split_whitespace().next().unwrap_or_default();
            let facing = if rest.contains("usb") {
                Facing::External
            } else {
                Facing::Back
            };
            Some(Device::new(index, sensor, facing))
        })
        .collect()
}

#[async_trait]
impl CameraBackend for RpiCameraBackend {
    fn name(&self) -> &'static str {
        "rpicam"
    }

    async fn enumerate(&self) -> Result<Vec<Device>, SessionError> {
        let output = tokio::process::Command::new("rpicam-still")
            .arg("--list-cameras")
            .output()
            .await;

        match output {
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.contains("Permission denied") {
                    log::error!("rpicam-still could not access the camera: {}", stderr.trim());
                    return Err(SessionError::PermissionDenied);
                }
                // rpicam-still prints the list on stderr on some releases
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push('\n');
                text.push_str(&stderr);
                Ok(parse_camera_list(&text))
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(SessionError::PermissionDenied),
            Err(e) => {
                // Don't fail completely, just report no cameras
                log::warn!("rpicam-still not found: {}", e);
                Ok(Vec::new())
            }
        }
    }

    async fn open_stream(
        &self,
        device: &Device,
        settings: StreamSettings,
    ) -> Result<Box<dyn CameraStream>, SessionError> {
        let preview_path = self.preview_path(&device.id);
        if preview_path.exists() {
            let _ = tokio::fs::remove_file(&preview_path).await;
        }

        let path_arg = preview_path.to_string_lossy().into_owned();
        let args = [
            "--camera".to_string(),
            device.id.clone(),
            "-o".to_string(),
            path_arg,
            "--width".to_string(),
            settings.width.to_string(),
            "--height".to_string(),
            settings.height.to_string(),
            "--quality".to_string(),
            self.quality.to_string(),
            "--timeout".to_string(),
            "0".to_string(), // continuous mode
            "--timelapse".to_string(),
            self.timelapse_ms.to_string(),
            "--nopreview".to_string(),
        ];
        log::info!("Preview command: rpicam-still {}", args.join(" "));

        let child = Command::new("rpicam-still")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => SessionError::PermissionDenied,
                _ => SessionError::unavailable(&device.id, format!("failed to start preview: {}", e)),
            })?;

        Ok(Box::new(RpiCameraStream {
            device_id: device.id.clone(),
            settings,
            preview_path,
            process: Some(child),
            last_frame: None,
        }))
    }
}

struct RpiCameraStream {
    device_id: String,
    settings: StreamSettings,
    preview_path: PathBuf,
    process: Option<Child>,
    last_frame: Option<RgbImage>,
}

impl RpiCameraStream {
    /// Checkerboard shown until the first preview JPEG lands.
    fn loading_placeholder(&self) -> RgbImage {
        ImageBuffer::from_fn(self.settings.width, self.settings.height, |x, y| {
            if (x + y) % 50 < 25 {
                image::Rgb([50, 50, 50])
            } else {
                image::Rgb([100, 100, 100])
            }
        })
    }
}

#[async_trait]
impl CameraStream for RpiCameraStream {
    async fn next_frame(&mut self) -> Result<RgbImage, SessionError> {
        let process = self.process.as_mut().ok_or(SessionError::NotStreaming)?;
        match process.try_wait() {
            Ok(Some(status)) => {
                self.process = None;
                return Err(SessionError::unavailable(
                    &self.device_id,
                    format!("capture process exited with {}", status),
                ));
            }
            Ok(None) => {}
            Err(e) => {
                return Err(SessionError::unavailable(&self.device_id, e.to_string()));
            }
        }

        let decoded = match tokio::fs::read(&self.preview_path).await {
            Ok(bytes) => image::load_from_memory(&bytes).map(|img| img.to_rgb8()).ok(),
            Err(_) => None,
        };

        // The JPEG may be mid-write; fall back to the last good frame.
        match decoded {
            Some(frame) => {
                log::debug!("Loaded preview frame: {}x{}", frame.width(), frame.height());
                self.last_frame = Some(frame.clone());
                Ok(frame)
            }
            None => Ok(self
                .last_frame
                .clone()
                .unwrap_or_else(|| self.loading_placeholder())),
        }
    }

    fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = process.kill();
            let _ = process.wait();
            log::info!("Camera preview stopped for {}", self.device_id);
        }
        if self.preview_path.exists() {
            let _ = std::fs::remove_file(&self.preview_path);
        }
    }
}

impl Drop for RpiCameraStream {
    fn drop(&mut self) {
        self.stop();
    }
}
