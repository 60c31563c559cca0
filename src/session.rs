use anyhow::anyhow;
use chrono::{DateTime, Local};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{Duration, MissedTickBehavior};

use crate::camera_controller::CaptureSession;
use crate::classifier::{select_top, ClassificationResult, Classifier};
use crate::device::Device;
use crate::error::SessionError;
use crate::frame::{Frame, FrameId, FrameSource};
use crate::history::{HistoryEntry, HistoryLedger};
use crate::instructions::InstructionResolver;
use crate::label::WasteCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Live,
    Frozen,
}

/// A classification that was applied to the session.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub frame_id: FrameId,
    pub result: ClassificationResult,
    pub entry: HistoryEntry,
    pub instructions: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifyOutcome {
    Classified(Classification),
    /// The frozen frame already has a classification pending or done.
    Ignored,
    /// The frame was released or replaced before the engine answered.
    Discarded,
}

/// What the session is showing right now.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub device: Option<Device>,
    pub stream_opened_at: Option<DateTime<Local>>,
    pub frozen_frame: Option<FrameId>,
    pub frame_captured_at: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Inference {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Uninitialized,
    Live,
    Frozen { frame_id: FrameId, inference: Inference },
}

struct Inner {
    frames: FrameSource,
    phase: Phase,
    history: HistoryLedger,
    last_result: Option<Classification>,
    instructions: InstructionResolver,
}

impl Inner {
    fn state(&self) -> SessionState {
        match self.phase {
            Phase::Uninitialized => SessionState::Uninitialized,
            Phase::Live => SessionState::Live,
            Phase::Frozen { .. } => SessionState::Frozen,
        }
    }

    fn teardown(&mut self) {
        self.frames.capture_mut().close();
        self.frames.reset();
        self.phase = Phase::Uninitialized;
    }
}

/// Live/frozen state machine over one camera stream.
///
/// The classifier runs without the state lock held. Its result is applied only
/// if the frame it was computed on is still the frozen frame.
pub struct SessionController {
    inner: Mutex<Inner>,
    classifier: Arc<dyn Classifier>,
}

impl SessionController {
    pub fn new(
        capture: CaptureSession,
        mirror: bool,
        classifier: Arc<dyn Classifier>,
        instructions: InstructionResolver,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: FrameSource::new(capture, mirror),
                phase: Phase::Uninitialized,
                history: HistoryLedger::new(),
                last_result: None,
                instructions,
            }),
            classifier,
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state()
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        let handle = inner.frames.capture().current_handle();
        SessionStatus {
            state: inner.state(),
            device: handle.map(|h| h.device().clone()),
            stream_opened_at: handle.map(|h| h.opened_at()),
            frozen_frame: inner.frames.frozen_id(),
            frame_captured_at: inner.frames.current_frame().map(|f| f.captured_at()),
        }
    }

    pub async fn devices(&self) -> Result<Vec<Device>, SessionError> {
        let inner = self.inner.lock().await;
        inner.frames.capture().registry().list_devices().await
    }

    pub async fn current_device(&self) -> Option<Device> {
        let inner = self.inner.lock().await;
        inner.frames.capture().current_device().cloned()
    }

    /// Open the first stream. Same as `switch_device`.
    pub async fn start(&self, device_id: Option<&str>) -> Result<Device, SessionError> {
        self.switch_device(device_id).await
    }

    /// Replace the current stream with one on `device_id` (or the default device).
    ///
    /// The old stream is released first and any frozen frame is dropped, so a
    /// classification still in flight will be discarded when it returns.
    pub async fn switch_device(&self, device_id: Option<&str>) -> Result<Device, SessionError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        inner.frames.reset();
        inner.phase = Phase::Uninitialized;

        let opened = inner
            .frames
            .capture_mut()
            .open(device_id)
            .await
            .map(|handle| handle.device().clone());

        match opened {
            Ok(device) => {
                inner.phase = Phase::Live;
                log::info!("Session live on {}", device.display_name());
                Ok(device)
            }
            Err(e) => {
                inner.teardown();
                log::error!("Could not switch camera: {}", e);
                Err(e)
            }
        }
    }

    /// Freeze the displayed frame and classify it once.
    ///
    /// While frozen this is a no-op unless the previous attempt failed, in which
    /// case the same frozen frame is classified again.
    pub async fn classify(&self) -> Result<ClassifyOutcome, SessionError> {
        let frame = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;

            match inner.phase {
                Phase::Uninitialized => {
                    log::warn!("Classify requested with no open camera");
                    return Err(SessionError::NotStreaming);
                }
                Phase::Frozen { inference: Inference::Failed, .. } | Phase::Live => {}
                Phase::Frozen { frame_id, .. } => {
                    log::debug!("Frame {} already classified or pending; ignoring", frame_id);
                    return Ok(ClassifyOutcome::Ignored);
                }
            }

            let frame = match inner.frames.freeze().await {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Could not capture a frame to classify: {}", e);
                    inner.teardown();
                    return Err(e);
                }
            };
            inner.phase = Phase::Frozen {
                frame_id: frame.id(),
                inference: Inference::Pending,
            };
            frame
        };

        log::info!("Classifying frame {} with {}", frame.id(), self.classifier.name());
        let predictions = if self.classifier.is_ready() {
            self.classifier.classify(&frame).await
        } else {
            Err(anyhow!("model is not ready"))
        };

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match inner.phase {
            Phase::Frozen { frame_id, .. } if frame_id == frame.id() => {}
            _ => {
                match &predictions {
                    Ok(_) => log::info!("Dropping stale classification for frame {}", frame.id()),
                    Err(e) => log::info!(
                        "Dropping stale classification for frame {} (inference failed: {:#})",
                        frame.id(),
                        e
                    ),
                }
                return Ok(ClassifyOutcome::Discarded);
            }
        }

        let selected = predictions
            .map_err(|e| SessionError::InferenceFailure(e.to_string()))
            .and_then(|p| select_top(&p));

        match selected {
            Ok(result) => {
                let entry = inner.history.append(result);
                let classification = Classification {
                    frame_id: frame.id(),
                    result,
                    instructions: inner.instructions.resolve(result.label).to_string(),
                    entry,
                };
                inner.phase = Phase::Frozen {
                    frame_id: frame.id(),
                    inference: Inference::Done,
                };
                inner.last_result = Some(classification.clone());
                log::info!(
                    "Frame {} is {} ({})",
                    frame.id(),
                    result.label,
                    classification.entry.confidence_percent()
                );
                Ok(ClassifyOutcome::Classified(classification))
            }
            Err(e) => {
                inner.phase = Phase::Frozen {
                    frame_id: frame.id(),
                    inference: Inference::Failed,
                };
                log::warn!("Classification of frame {} failed: {}", frame.id(), e);
                Err(e)
            }
        }
    }

    /// Leave the frozen frame and resume the live preview.
    pub async fn restore(&self) -> Result<(), SessionError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        match inner.phase {
            Phase::Uninitialized => {
                log::warn!("Restore requested with no open camera");
                Err(SessionError::NotStreaming)
            }
            Phase::Live => Ok(()),
            Phase::Frozen { frame_id, .. } => {
                inner.frames.unfreeze();
                inner.phase = Phase::Live;
                log::debug!("Restored live preview after frame {}", frame_id);
                Ok(())
            }
        }
    }

    /// Tear the stream down after the platform reported the camera gone.
    ///
    /// Returns the error to show the user.
    pub async fn device_lost(&self, reason: &str) -> SessionError {
        let mut guard = self.inner.lock().await;
        let device_id = guard
            .frames
            .capture()
            .current_device()
            .map(|d| d.id.clone())
            .unwrap_or_else(|| "unknown".to_string());
        guard.teardown();
        log::error!("Camera {} lost: {}", device_id, reason);
        SessionError::unavailable(device_id, reason)
    }

    /// One render-loop step: pull a live frame, or nothing while frozen.
    pub async fn tick(&self) -> Result<Option<Frame>, SessionError> {
        let mut guard = self.inner.lock().await;
        if guard.phase != Phase::Live {
            return Ok(None);
        }
        match guard.frames.refresh().await {
            Ok(frame) => Ok(frame),
            Err(e) => {
                log::error!("Live preview failed: {}", e);
                guard.teardown();
                Err(e)
            }
        }
    }

    /// Drive `tick` every `interval` until `shutdown` turns true.
    ///
    /// Preview failures are forwarded to `errors` for display.
    pub async fn run_preview(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        errors: mpsc::UnboundedSender<SessionError>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!("Preview loop started ({} ms)", interval.as_millis());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        if errors.send(e).is_err() {
                            log::warn!("Preview error receiver dropped");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Preview loop stopped");
    }

    /// Release the camera. The controller can be restarted with `start`.
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        guard.teardown();
        log::info!("Session shut down");
    }

    pub async fn current_frame(&self) -> Option<Frame> {
        self.inner.lock().await.frames.current_frame()
    }

    /// History in classification order.
    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.inner.lock().await.history.all().to_vec()
    }

    pub async fn last_result(&self) -> Option<Classification> {
        self.inner.lock().await.last_result.clone()
    }

    pub async fn instructions_for(&self, category: WasteCategory) -> String {
        self.inner.lock().await.instructions.resolve(category).to_string()
    }

    /// Override the instructions for a category and persist the change.
    pub async fn set_instructions(&self, category: WasteCategory, text: &str) -> anyhow::Result<()> {
        let mut guard = self.inner.lock().await;
        let previous = guard.instructions.set_override(category, text);
        if let Err(e) = guard.instructions.save() {
            match previous {
                Some(previous) => {
                    guard.instructions.set_override(category, previous);
                }
                None => {
                    guard.instructions.clear_override(category);
                }
            }
            log::error!("Instruction override for {} not saved: {:#}", category, e);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Prediction;
    use crate::device::{Facing, StreamSettings};
    use crate::synthetic::SyntheticBackend;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Engine that replays canned answers, optionally waiting for a signal first.
    struct ScriptedClassifier {
        responses: std::sync::Mutex<VecDeque<Result<Vec<Prediction>, String>>>,
        calls: AtomicUsize,
        ready: AtomicBool,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedClassifier {
        fn new() -> Self {
            Self {
                responses: std::sync::Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                ready: AtomicBool::new(true),
                gate: None,
            }
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new()
            }
        }

        fn push(&self, response: Result<Vec<Prediction>, String>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn push_label(&self, label: &str, confidence: f32) {
            self.push(Ok(vec![
                Prediction::new(label, confidence),
                Prediction::new("廚餘", 0.01),
            ]));
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Classifier for ScriptedClassifier {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn classify(&self, _frame: &Frame) -> anyhow::Result<Vec<Prediction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(Ok(predictions)) => Ok(predictions),
                Some(Err(message)) => Err(anyhow!(message)),
                None => Ok(vec![Prediction::new("玻璃", 0.8)]),
            }
        }
    }

    fn controller(backend: &Arc<SyntheticBackend>, classifier: &Arc<ScriptedClassifier>) -> SessionController {
        let capture = CaptureSession::new(
            backend.clone(),
            StreamSettings { width: 16, height: 12 },
            Facing::Back,
        );
        SessionController::new(capture, true, classifier.clone(), InstructionResolver::new())
    }

    fn classified(outcome: ClassifyOutcome) -> Classification {
        match outcome {
            ClassifyOutcome::Classified(c) => c,
            other => panic!("expected a classification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_goes_live() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);

        assert_eq!(session.state().await, SessionState::Uninitialized);
        let device = session.start(None).await.unwrap();
        assert_eq!(device.id, "synthetic-back");
        assert_eq!(session.state().await, SessionState::Live);
        assert!(session.tick().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_glass_scenario_records_one_entry() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let classifier = Arc::new(ScriptedClassifier::new());
        classifier.push(Ok(vec![
            Prediction::new("玻璃", 0.91),
            Prediction::new("紙類", 0.44),
        ]));
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();

        let c = classified(session.classify().await.unwrap());
        assert_eq!(c.result.label, WasteCategory::Glass);
        assert_eq!(c.result.confidence, 0.91);
        assert_eq!(c.entry.confidence_percent(), "91.00%");
        assert_eq!(c.instructions, "Instructions for 玻璃. (Edit this content as needed.)");
        assert_eq!(session.state().await, SessionState::Frozen);

        let history = session.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].label(), WasteCategory::Glass);
        assert_eq!(session.last_result().await, Some(c));
    }

    #[tokio::test]
    async fn test_classify_twice_without_restore() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();

        classified(session.classify().await.unwrap());
        assert_eq!(session.classify().await.unwrap(), ClassifyOutcome::Ignored);
        assert_eq!(classifier.calls(), 1);
        assert_eq!(session.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_classify_issues_one_inference() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let gate = Arc::new(Notify::new());
        let classifier = Arc::new(ScriptedClassifier::gated(gate.clone()));
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();

        let (first, second) = tokio::join!(session.classify(), async {
            let outcome = session.classify().await;
            gate.notify_one();
            outcome
        });

        classified(first.unwrap());
        assert_eq!(second.unwrap(), ClassifyOutcome::Ignored);
        assert_eq!(classifier.calls(), 1);
        assert_eq!(session.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_then_classify_uses_new_frame() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();
        session.tick().await.unwrap();

        let first = classified(session.classify().await.unwrap());
        let frozen = session.current_frame().await.unwrap();
        assert_eq!(frozen.id(), first.frame_id);
        // frozen preview does not advance
        assert!(session.tick().await.unwrap().is_none());

        session.restore().await.unwrap();
        assert_eq!(session.state().await, SessionState::Live);
        session.tick().await.unwrap();

        let second = classified(session.classify().await.unwrap());
        assert!(second.frame_id > first.frame_id);
        let refrozen = session.current_frame().await.unwrap();
        assert_ne!(refrozen.pixels(), frozen.pixels());
        assert_eq!(classifier.calls(), 2);
        assert_eq!(session.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_history_keeps_classification_order() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let classifier = Arc::new(ScriptedClassifier::new());
        classifier.push_label("塑料", 0.7);
        classifier.push_label("金屬", 0.6);
        classifier.push_label("布料", 0.9);
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();

        for _ in 0..3 {
            classified(session.classify().await.unwrap());
            session.restore().await.unwrap();
        }

        let labels: Vec<_> = session.history().await.iter().map(|e| e.label()).collect();
        assert_eq!(
            labels,
            vec![WasteCategory::Plastics, WasteCategory::Metal, WasteCategory::Textiles]
        );
    }

    #[tokio::test]
    async fn test_no_devices_stays_uninitialized() {
        let backend = Arc::new(SyntheticBackend::new(Vec::new()));
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);

        assert!(session.devices().await.unwrap().is_empty());
        assert_eq!(session.start(None).await, Err(SessionError::NoDevicesFound));
        assert_eq!(session.state().await, SessionState::Uninitialized);
        assert_eq!(session.classify().await, Err(SessionError::NotStreaming));
        assert_eq!(session.restore().await, Err(SessionError::NotStreaming));
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_inference_failure_keeps_frame_for_retry() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let stats = backend.stats();
        let classifier = Arc::new(ScriptedClassifier::new());
        classifier.push(Err("tensor shape mismatch".to_string()));
        classifier.push_label("紙類", 0.66);
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();

        let err = session.classify().await.unwrap_err();
        assert!(err.is_retryable_inference());
        assert_eq!(session.state().await, SessionState::Frozen);
        assert!(session.history().await.is_empty());
        let frozen = session.current_frame().await.unwrap();

        let c = classified(session.classify().await.unwrap());
        assert_eq!(c.frame_id, frozen.id());
        assert_eq!(c.result.label, WasteCategory::Paper);
        assert_eq!(session.history().await.len(), 1);
        // retry never touched the camera
        assert_eq!(stats.streams_opened(), 1);
    }

    #[tokio::test]
    async fn test_model_not_ready_is_inference_failure() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let classifier = Arc::new(ScriptedClassifier::new());
        classifier.ready.store(false, Ordering::SeqCst);
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();

        assert_eq!(
            session.classify().await,
            Err(SessionError::InferenceFailure("model is not ready".into()))
        );
        assert_eq!(session.state().await, SessionState::Frozen);
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_switching_never_leaks_streams() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let stats = backend.stats();
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);

        session.start(Some("synthetic-front")).await.unwrap();
        session.switch_device(Some("synthetic-back")).await.unwrap();
        classified(session.classify().await.unwrap());

        // switching while frozen forces live
        session.switch_device(Some("synthetic-front")).await.unwrap();
        assert_eq!(session.state().await, SessionState::Live);
        assert!(session.current_frame().await.is_none());

        assert!(session.switch_device(Some("missing")).await.is_err());
        assert_eq!(session.state().await, SessionState::Uninitialized);
        assert_eq!(stats.open_streams(), 0);

        session.switch_device(None).await.unwrap();
        assert_eq!(stats.open_streams(), 1);
        assert_eq!(stats.peak_open_streams(), 1);
    }

    #[tokio::test]
    async fn test_switch_during_inference_discards_result() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let gate = Arc::new(Notify::new());
        let classifier = Arc::new(ScriptedClassifier::gated(gate.clone()));
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();

        let (outcome, switched) = tokio::join!(session.classify(), async {
            let device = session.switch_device(Some("synthetic-front")).await;
            gate.notify_one();
            device
        });

        assert_eq!(switched.unwrap().id, "synthetic-front");
        assert_eq!(outcome.unwrap(), ClassifyOutcome::Discarded);
        assert!(session.history().await.is_empty());
        assert_eq!(session.state().await, SessionState::Live);
        assert!(session.last_result().await.is_none());
    }

    #[tokio::test]
    async fn test_restore_during_inference_discards_result() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let gate = Arc::new(Notify::new());
        let classifier = Arc::new(ScriptedClassifier::gated(gate.clone()));
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();

        let (outcome, restored) = tokio::join!(session.classify(), async {
            let restored = session.restore().await;
            gate.notify_one();
            restored
        });

        restored.unwrap();
        assert_eq!(outcome.unwrap(), ClassifyOutcome::Discarded);
        assert!(session.history().await.is_empty());
        assert_eq!(session.state().await, SessionState::Live);
    }

    #[tokio::test]
    async fn test_device_lost_during_inference_discards_result() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let stats = backend.stats();
        let gate = Arc::new(Notify::new());
        let classifier = Arc::new(ScriptedClassifier::gated(gate.clone()));
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();

        let (outcome, lost) = tokio::join!(session.classify(), async {
            let err = session.device_lost("camera unplugged").await;
            gate.notify_one();
            err
        });

        assert!(lost.is_device_error());
        assert_eq!(outcome.unwrap(), ClassifyOutcome::Discarded);
        assert!(session.history().await.is_empty());
        assert_eq!(session.state().await, SessionState::Uninitialized);
        assert_eq!(stats.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_failed_inference_on_stale_frame_is_discarded() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let gate = Arc::new(Notify::new());
        let classifier = Arc::new(ScriptedClassifier::gated(gate.clone()));
        classifier.push(Err("out of memory".to_string()));
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();

        let (outcome, restored) = tokio::join!(session.classify(), async {
            let restored = session.restore().await;
            gate.notify_one();
            restored
        });

        restored.unwrap();
        assert_eq!(outcome, Ok(ClassifyOutcome::Discarded));
        assert_eq!(session.state().await, SessionState::Live);
    }

    #[tokio::test]
    async fn test_classify_waits_for_pending_switch() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        backend.set_open_delay(Some(Duration::from_millis(20)));
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);
        session.start(Some("synthetic-back")).await.unwrap();

        let (switched, outcome) = tokio::join!(
            session.switch_device(Some("synthetic-front")),
            session.classify()
        );

        switched.unwrap();
        classified(outcome.unwrap());
        let frame = session.current_frame().await.unwrap();
        assert_eq!(frame.device_id(), "synthetic-front");
    }

    #[tokio::test]
    async fn test_disconnect_during_preview() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let stats = backend.stats();
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();

        backend.disconnect("synthetic-back");
        let err = session.tick().await.unwrap_err();
        assert!(matches!(err, SessionError::DeviceUnavailable { .. }));
        assert_eq!(session.state().await, SessionState::Uninitialized);
        assert_eq!(stats.open_streams(), 0);
        assert_eq!(session.classify().await, Err(SessionError::NotStreaming));

        session.switch_device(Some("synthetic-front")).await.unwrap();
        assert_eq!(session.state().await, SessionState::Live);
    }

    #[tokio::test]
    async fn test_device_lost_while_frozen() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let stats = backend.stats();
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();
        classified(session.classify().await.unwrap());

        let err = session.device_lost("USB cable unplugged").await;
        assert_eq!(
            err,
            SessionError::unavailable("synthetic-back", "USB cable unplugged")
        );
        assert_eq!(session.state().await, SessionState::Uninitialized);
        assert!(session.current_frame().await.is_none());
        assert_eq!(stats.open_streams(), 0);
        // history survives device loss
        assert_eq!(session.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_replugged_camera_can_be_reopened() {
        let backend = Arc::new(SyntheticBackend::new(Vec::new()));
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);
        assert_eq!(session.start(None).await, Err(SessionError::NoDevicesFound));

        backend.set_devices(vec![Device::new("usb-0", "USB Camera", Facing::External)]);
        assert_eq!(session.start(None).await.unwrap().id, "usb-0");

        backend.disconnect("usb-0");
        assert!(session.tick().await.is_err());
        assert_eq!(session.state().await, SessionState::Uninitialized);

        backend.reconnect("usb-0");
        session.switch_device(Some("usb-0")).await.unwrap();
        assert!(session.tick().await.unwrap().is_some());
        assert_eq!(session.state().await, SessionState::Live);
    }

    #[tokio::test]
    async fn test_status_reports_stream_and_frame() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);

        let idle = session.status().await;
        assert_eq!(idle.state, SessionState::Uninitialized);
        assert!(idle.device.is_none());
        assert!(idle.stream_opened_at.is_none());

        session.start(None).await.unwrap();
        let live = session.tick().await.unwrap().unwrap();
        let status = session.status().await;
        assert_eq!(status.state, SessionState::Live);
        assert_eq!(status.device.map(|d| d.id).as_deref(), Some("synthetic-back"));
        assert!(status.stream_opened_at.unwrap() <= live.captured_at());
        assert!(status.frozen_frame.is_none());
        assert_eq!(status.frame_captured_at, Some(live.captured_at()));

        let c = classified(session.classify().await.unwrap());
        let frozen = session.status().await;
        assert_eq!(frozen.state, SessionState::Frozen);
        assert_eq!(frozen.frozen_frame, Some(c.frame_id));
    }

    #[tokio::test]
    async fn test_unsaved_instruction_override_is_rolled_back() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);
        let default_text = session.instructions_for(WasteCategory::Glass).await;

        // no overrides file configured, so saving fails
        assert!(session
            .set_instructions(WasteCategory::Glass, "Rinse first")
            .await
            .is_err());
        assert_eq!(session.instructions_for(WasteCategory::Glass).await, default_text);
    }

    #[tokio::test]
    async fn test_instruction_override_is_saved() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("instructions.toml");
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let capture = CaptureSession::new(
            backend,
            StreamSettings { width: 16, height: 12 },
            Facing::Back,
        );
        let session = SessionController::new(
            capture,
            false,
            Arc::new(ScriptedClassifier::new()),
            InstructionResolver::with_overrides_file(&path).unwrap(),
        );

        session
            .set_instructions(WasteCategory::Metal, "Crush cans flat")
            .await
            .unwrap();
        assert_eq!(session.instructions_for(WasteCategory::Metal).await, "Crush cans flat");

        let reloaded = InstructionResolver::with_overrides_file(&path).unwrap();
        assert_eq!(reloaded.resolve(WasteCategory::Metal), "Crush cans flat");
    }

    #[tokio::test]
    async fn test_permission_denied_on_start() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        backend.deny_permission(true);
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);

        let err = session.start(None).await.unwrap_err();
        assert_eq!(err, SessionError::PermissionDenied);
        assert!(err.is_device_error());
        assert_eq!(session.state().await, SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_preview_loop_runs_until_shutdown() {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let stats = backend.stats();
        let classifier = Arc::new(ScriptedClassifier::new());
        let session = controller(&backend, &classifier);
        session.start(None).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();

        let driver = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let frame = session.current_frame().await;
            shutdown_tx.send(true).unwrap();
            frame
        };
        let ((), frame) = tokio::join!(
            session.run_preview(Duration::from_millis(5), shutdown_rx, error_tx),
            driver
        );

        assert!(frame.is_some());
        assert!(error_rx.try_recv().is_err());

        session.shutdown().await;
        assert_eq!(stats.open_streams(), 0);
        assert_eq!(session.state().await, SessionState::Uninitialized);
    }
}
