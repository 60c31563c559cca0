use anyhow::Result;
use async_trait::async_trait;

use crate::error::SessionError;
use crate::frame::Frame;
use crate::label::WasteCategory;

/// One scored class as reported by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_name: String,
    pub probability: f32,
}

impl Prediction {
    pub fn new(class_name: impl Into<String>, probability: f32) -> Self {
        Self {
            class_name: class_name.into(),
            probability,
        }
    }
}

/// The single label picked for a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationResult {
    pub label: WasteCategory,
    pub confidence: f32,
}

/// Image classification engine.
///
/// Implementations receive a fixed-size RGB frame and return one prediction per
/// category. Scores need not sum to 1 but must each lie in `[0, 1]`.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// False while the model is still loading.
    fn is_ready(&self) -> bool {
        true
    }

    async fn classify(&self, frame: &Frame) -> Result<Vec<Prediction>>;
}

/// Pick the highest-scoring prediction.
///
/// Equal scores go to the category listed first in `WasteCategory::all()`,
/// whatever order the engine reported them in.
pub fn select_top(predictions: &[Prediction]) -> Result<ClassificationResult, SessionError> {
    let mut best: Option<ClassificationResult> = None;
    for prediction in predictions {
        let p = prediction.probability;
        if !p.is_finite() || !(0.0..=1.0).contains(&p) {
            return Err(SessionError::InferenceFailure(format!(
                "score {} for '{}' is outside [0, 1]",
                p, prediction.class_name
            )));
        }
        let label = prediction
            .class_name
            .parse::<WasteCategory>()
            .map_err(|e| SessionError::InferenceFailure(e.to_string()))?;

        match best {
            Some(current)
                if current.confidence > p
                    || (current.confidence == p && current.label < label) => {}
            _ => {
                best = Some(ClassificationResult {
                    label,
                    confidence: p,
                })
            }
        }
    }

    best.ok_or_else(|| SessionError::InferenceFailure("model returned no predictions".into()))
}

/// Deterministic stand-in engine scoring frames by their average colour.
///
/// Used by the binary when no model is wired in, and handy in tests.
#[derive(Debug, Default)]
pub struct StubClassifier;

impl StubClassifier {
    pub fn new() -> Self {
        Self
    }

    fn mean_rgb(frame: &Frame) -> [f32; 3] {
        let mut sums = [0u64; 3];
        for pixel in frame.image().pixels() {
            for (sum, channel) in sums.iter_mut().zip(pixel.0.iter()) {
                *sum += *channel as u64;
            }
        }
        let count = (frame.width() as u64 * frame.height() as u64).max(1) as f32;
        [
            sums[0] as f32 / count / 255.0,
            sums[1] as f32 / count / 255.0,
            sums[2] as f32 / count / 255.0,
        ]
    }
}

#[async_trait]
impl Classifier for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn classify(&self, frame: &Frame) -> Result<Vec<Prediction>> {
        let [r, g, b] = Self::mean_rgb(frame);
        let categories = WasteCategory::all();
        Ok(categories
            .iter()
            .enumerate()
            .map(|(i, category)| {
                let phase = i as f32 / categories.len() as f32;
                let score = ((r * (1.0 - phase) + g * phase + b * 0.5) / 2.0).clamp(0.0, 1.0);
                Prediction::new(category.name(), score)
            })
            .collect())
    }
}
