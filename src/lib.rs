pub mod camera_controller;
pub mod classifier;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod history;
pub mod instructions;
pub mod label;
pub mod session;
pub mod synthetic;

pub use camera_controller::{CaptureSession, RpiCameraBackend, StreamHandle};
pub use classifier::{ClassificationResult, Classifier, Prediction, StubClassifier};
pub use config::{BackendKind, Config};
pub use device::{CameraBackend, CameraStream, Device, DeviceRegistry, Facing, StreamSettings};
pub use error::SessionError;
pub use frame::{Frame, FrameId, FrameSource};
pub use history::{HistoryEntry, HistoryLedger};
pub use instructions::InstructionResolver;
pub use label::WasteCategory;
pub use session::{Classification, ClassifyOutcome, SessionController, SessionState, SessionStatus};
pub use synthetic::SyntheticBackend;
