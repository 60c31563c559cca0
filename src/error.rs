use thiserror::Error;

/// Errors surfaced by the capture/classification session.
///
/// Camera errors leave the controller uninitialized; inference errors keep the
/// frozen frame so classification can be retried without touching the camera.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("camera access was denied; check permissions or select a different camera")]
    PermissionDenied,

    #[error("camera '{device_id}' is unavailable: {reason}")]
    DeviceUnavailable { device_id: String, reason: String },

    #[error("classification failed: {0}")]
    InferenceFailure(String),

    #[error("no cameras found")]
    NoDevicesFound,

    #[error("no camera stream is open")]
    NotStreaming,
}

impl SessionError {
    pub fn unavailable(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        SessionError::DeviceUnavailable {
            device_id: device_id.into(),
            reason: reason.into(),
        }
    }

    /// Errors that require reselecting or re-opening a camera.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            SessionError::PermissionDenied
                | SessionError::DeviceUnavailable { .. }
                | SessionError::NoDevicesFound
                | SessionError::NotStreaming
        )
    }

    /// Errors where retrying `classify()` on the same frame makes sense.
    pub fn is_retryable_inference(&self) -> bool {
        matches!(self, SessionError::InferenceFailure(_))
    }
}
