use async_trait::async_trait;
use image::{ImageBuffer, RgbImage};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};

use crate::device::{CameraBackend, CameraStream, Device, Facing, StreamSettings};
use crate::error::SessionError;

/// Counters describing stream usage, shared with every stream the backend opens.
#[derive(Debug, Default)]
pub struct StreamStats {
    open: AtomicUsize,
    peak: AtomicUsize,
    opened_total: AtomicUsize,
}

impl StreamStats {
    pub fn open_streams(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open streams ever observed.
    pub fn peak_open_streams(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn streams_opened(&self) -> usize {
        self.opened_total.load(Ordering::SeqCst)
    }

    fn on_open(&self) {
        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_open, Ordering::SeqCst);
        self.opened_total.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stop(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Test-pattern cameras with injectable permission and disconnect failures.
pub struct SyntheticBackend {
    devices: Mutex<Vec<Device>>,
    permission_denied: AtomicBool,
    unavailable: Mutex<HashSet<String>>,
    disconnected: Arc<Mutex<HashSet<String>>>,
    open_delay: Mutex<Option<Duration>>,
    stats: Arc<StreamStats>,
}

impl SyntheticBackend {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: Mutex::new(devices),
            permission_denied: AtomicBool::new(false),
            unavailable: Mutex::new(HashSet::new()),
            disconnected: Arc::new(Mutex::new(HashSet::new())),
            open_delay: Mutex::new(None),
            stats: Arc::new(StreamStats::default()),
        }
    }

    /// A front and a back camera, the usual phone layout.
    pub fn with_default_devices() -> Self {
        Self::new(vec![
            Device::new("synthetic-front", "Synthetic Front Camera", Facing::Front),
            Device::new("synthetic-back", "Synthetic Rear Camera", Facing::Back),
        ])
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        if let Ok(mut guard) = self.devices.lock() {
            *guard = devices;
        }
    }

    pub fn deny_permission(&self, denied: bool) {
        self.permission_denied.store(denied, Ordering::SeqCst);
    }

    /// Make `open_stream` fail for this device.
    pub fn mark_unavailable(&self, device_id: &str) {
        if let Ok(mut guard) = self.unavailable.lock() {
            guard.insert(device_id.to_string());
        }
    }

    /// Make open streams of this device fail on their next frame pull.
    pub fn disconnect(&self, device_id: &str) {
        if let Ok(mut guard) = self.disconnected.lock() {
            guard.insert(device_id.to_string());
        }
    }

    pub fn reconnect(&self, device_id: &str) {
        if let Ok(mut guard) = self.disconnected.lock() {
            guard.remove(device_id);
        }
        if let Ok(mut guard) = self.unavailable.lock() {
            guard.remove(device_id);
        }
    }

    /// Simulate slow stream acquisition.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        if let Ok(mut guard) = self.open_delay.lock() {
            *guard = delay;
        }
    }

    fn is_marked(set: &Mutex<HashSet<String>>, device_id: &str) -> bool {
        set.lock()
            .map(|guard| guard.contains(device_id))
            .unwrap_or(false)
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::with_default_devices()
    }
}

#[async_trait]
impl CameraBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn enumerate(&self) -> Result<Vec<Device>, SessionError> {
        if self.permission_denied.load(Ordering::SeqCst) {
            return Err(SessionError::PermissionDenied);
        }
        self.devices
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| SessionError::NoDevicesFound)
    }

    async fn open_stream(
        &self,
        device: &Device,
        settings: StreamSettings,
    ) -> Result<Box<dyn CameraStream>, SessionError> {
        let delay = self.open_delay.lock().ok().and_then(|guard| *guard);
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        if self.permission_denied.load(Ordering::SeqCst) {
            return Err(SessionError::PermissionDenied);
        }
        if Self::is_marked(&self.unavailable, &device.id)
            || Self::is_marked(&self.disconnected, &device.id)
        {
            return Err(SessionError::unavailable(&device.id, "device is not connected"));
        }

        self.stats.on_open();
        log::debug!("Synthetic stream opened for {}", device.id);
        Ok(Box::new(SyntheticStream {
            device_id: device.id.clone(),
            settings,
            frame_count: 0,
            stopped: false,
            disconnected: Arc::clone(&self.disconnected),
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct SyntheticStream {
    device_id: String,
    settings: StreamSettings,
    frame_count: u32,
    stopped: bool,
    disconnected: Arc<Mutex<HashSet<String>>>,
    stats: Arc<StreamStats>,
}

impl SyntheticStream {
    /// Diagonal gradient that drifts a little every frame.
    fn test_pattern(&self) -> RgbImage {
        let (width, height) = (self.settings.width.max(1), self.settings.height.max(1));
        let shift = self.frame_count.wrapping_mul(3);
        ImageBuffer::from_fn(width, height, |x, y| {
            let r = (x * 255 / width) as u8;
            let g = (y * 255 / height) as u8;
            let b = ((x + y + shift) % 256) as u8;
            image::Rgb([r, g, b])
        })
    }
}

#[async_trait]
impl CameraStream for SyntheticStream {
    async fn next_frame(&mut self) -> Result<RgbImage, SessionError> {
        if self.stopped {
            return Err(SessionError::NotStreaming);
        }
        if SyntheticBackend::is_marked(&self.disconnected, &self.device_id) {
            return Err(SessionError::unavailable(&self.device_id, "device was disconnected"));
        }
        self.frame_count = self.frame_count.wrapping_add(1);
        Ok(self.test_pattern())
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.stats.on_stop();
            log::debug!("Synthetic stream stopped for {}", self.device_id);
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop();
    }
}
