use chrono::{DateTime, Local};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::Arc;

use crate::camera_controller::CaptureSession;
use crate::error::SessionError;

/// Identity of a frame. Every pulled frame and every snapshot gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u64);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable RGB snapshot of the camera feed.
#[derive(Debug, Clone)]
pub struct Frame {
    id: FrameId,
    device_id: String,
    image: Arc<RgbImage>,
    captured_at: DateTime<Local>,
}

impl Frame {
    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Packed RGB bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> DateTime<Local> {
        self.captured_at
    }
}

enum Mode {
    Live,
    Frozen(Frame),
}

/// The only path to the capture stream. Once frozen it stops pulling frames.
pub struct FrameSource {
    capture: CaptureSession,
    mode: Mode,
    latest: Option<Frame>,
    next_id: u64,
    mirror: bool,
}

impl FrameSource {
    pub fn new(capture: CaptureSession, mirror: bool) -> Self {
        Self {
            capture,
            mode: Mode::Live,
            latest: None,
            next_id: 1,
            mirror,
        }
    }

    pub fn capture(&self) -> &CaptureSession {
        &self.capture
    }

    pub fn capture_mut(&mut self) -> &mut CaptureSession {
        &mut self.capture
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self.mode, Mode::Frozen(_))
    }

    /// The frozen snapshot, or the most recent live frame.
    pub fn current_frame(&self) -> Option<Frame> {
        match &self.mode {
            Mode::Frozen(frame) => Some(frame.clone()),
            Mode::Live => self.latest.clone(),
        }
    }

    pub fn frozen_id(&self) -> Option<FrameId> {
        match &self.mode {
            Mode::Frozen(frame) => Some(frame.id),
            Mode::Live => None,
        }
    }

    /// One render-loop step. Pulls a new frame while live; returns `None` while frozen.
    pub async fn refresh(&mut self) -> Result<Option<Frame>, SessionError> {
        if self.is_frozen() {
            return Ok(None);
        }
        self.pull().await.map(Some)
    }

    /// Freeze on the frame currently displayed, pulling one if nothing has been shown yet.
    ///
    /// Freezing an already frozen source returns the existing snapshot.
    pub async fn freeze(&mut self) -> Result<Frame, SessionError> {
        if let Mode::Frozen(frame) = &self.mode {
            return Ok(frame.clone());
        }

        let shown = match self.latest.clone() {
            Some(frame) => frame,
            None => self.pull().await?,
        };

        let snapshot = Frame {
            id: self.mint_id(),
            ..shown
        };
        log::debug!("Frozen frame {} from {}", snapshot.id, snapshot.device_id);
        self.mode = Mode::Frozen(snapshot.clone());
        Ok(snapshot)
    }

    /// Drop the snapshot and go back to tracking the live feed.
    pub fn unfreeze(&mut self) {
        if let Mode::Frozen(frame) = std::mem::replace(&mut self.mode, Mode::Live) {
            log::debug!("Released frozen frame {}", frame.id);
        }
        // the pre-freeze frame is stale once live tracking resumes
        self.latest = None;
    }

    /// Forget all frames, e.g. after the stream was replaced or lost.
    pub fn reset(&mut self) {
        self.mode = Mode::Live;
        self.latest = None;
    }

    fn mint_id(&mut self) -> FrameId {
        let id = FrameId(self.next_id);
        self.next_id += 1;
        id
    }

    async fn pull(&mut self) -> Result<Frame, SessionError> {
        let device_id = self
            .capture
            .current_device()
            .map(|d| d.id.clone())
            .ok_or(SessionError::NotStreaming)?;
        let raw = self.capture.next_frame().await?;
        let image = self.normalize(raw);

        let frame = Frame {
            id: self.mint_id(),
            device_id,
            image: Arc::new(image),
            captured_at: Local::now(),
        };
        self.latest = Some(frame.clone());
        Ok(frame)
    }

    /// Scale to the configured stream size and mirror if requested.
    fn normalize(&self, raw: RgbImage) -> RgbImage {
        let settings = self.capture.settings();
        let sized = if raw.dimensions() != (settings.width, settings.height) {
            log::debug!(
                "Resizing frame from {}x{} to {}x{}",
                raw.width(),
                raw.height(),
                settings.width,
                settings.height
            );
            imageops::resize(&raw, settings.width, settings.height, FilterType::Triangle)
        } else {
            raw
        };

        if self.mirror {
            imageops::flip_horizontal(&sized)
        } else {
            sized
        }
    }
}
