//! Per-request classification pipeline.
//!
//! ```text
//! AudioSignal (48 000 @ 16 kHz)
//!     └─► FeatureExtractor   → [188, 40] globally normalised
//!         └─► FrameNormalizer → [184, 40]
//!             └─► ClassifierBackend::forward → 8 logits
//!                 └─► softmax → argmax → Emotion + rounded confidence
//! ```
//!
//! Every stage is synchronous and allocation-scoped to the call. Stage errors
//! are returned unwrapped; the engine wraps them as `SentioError::Prediction`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audio::AudioSignal;
use crate::error::{Result, SentioError};
use crate::features::{FeatureExtractor, FrameNormalizer};
use crate::model::{Logits, ModelHandle, NUM_CLASSES};
use crate::prediction::{Emotion, EmotionScore, Prediction, StageTimings};

/// Request outcome counters, updated lock-free from any worker thread.
#[derive(Debug)]
pub struct PipelineDiagnostics {
    pub requests: AtomicUsize,
    pub rejected: AtomicUsize,
    pub decode_failures: AtomicUsize,
    pub failures: AtomicUsize,
    pub succeeded: AtomicUsize,
}

impl Default for PipelineDiagnostics {
    fn default() -> Self {
        Self {
            requests: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            decode_failures: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
        }
    }
}

impl PipelineDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
        }
    }

    /// Count a finished request under exactly one outcome.
    pub(crate) fn record<T>(&self, outcome: &Result<T>) {
        let counter = match outcome {
            Ok(_) => &self.succeeded,
            Err(SentioError::UnsupportedFormat(_)) => &self.rejected,
            Err(e) if e.is_client_error() => &self.decode_failures,
            Err(_) => &self.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub requests: usize,
    pub rejected: usize,
    pub decode_failures: usize,
    pub failures: usize,
    pub succeeded: usize,
}

/// Numerically stable softmax.
pub fn softmax(logits: &Logits) -> [f32; NUM_CLASSES] {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut out = [0f32; NUM_CLASSES];
    let mut sum = 0f32;
    for (o, &l) in out.iter_mut().zip(logits.iter()) {
        *o = (l - max).exp();
        sum += *o;
    }
    for o in &mut out {
        *o /= sum;
    }
    out
}

/// Index of the largest value; the first one wins ties.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Round to 4 decimal places (half away from zero), clamped to `[0, 1]`.
pub fn round_confidence(p: f32) -> f64 {
    ((p as f64 * 10_000.0).round() / 10_000.0).clamp(0.0, 1.0)
}

/// Feature extraction and classification for one windowed signal.
#[derive(Debug)]
pub struct Pipeline {
    extractor: FeatureExtractor,
    normalizer: FrameNormalizer,
    model: ModelHandle,
}

impl Pipeline {
    pub fn new(extractor: FeatureExtractor, normalizer: FrameNormalizer, model: ModelHandle) -> Self {
        Self {
            extractor,
            normalizer,
            model,
        }
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// Classify an already-loaded signal. `load_ms` is carried into the
    /// timings so callers can report the decode stage alongside the rest.
    pub fn classify(&self, signal: &AudioSignal, load_ms: f64) -> Result<Prediction> {
        let started = Instant::now();

        let features = self.extractor.extract(&signal.samples)?;
        let input = self.normalizer.normalize(&features);
        let features_ms = started.elapsed().as_secs_f64() * 1000.0;

        let infer_started = Instant::now();
        let logits = self.model.forward(input.view())?;
        let inference_ms = infer_started.elapsed().as_secs_f64() * 1000.0;

        if logits.iter().any(|v| !v.is_finite()) {
            return Err(SentioError::Inference(format!(
                "non-finite logits from {} backend",
                self.model.name()
            )));
        }

        let probs = softmax(&logits);
        let best = argmax(&probs);
        let emotion = Emotion::from_index(best)
            .ok_or_else(|| SentioError::Inference(format!("class index {best} out of range")))?;

        let probabilities = Emotion::ALL
            .iter()
            .zip(probs.iter())
            .map(|(&emotion, &probability)| EmotionScore {
                emotion,
                probability,
            })
            .collect();

        debug!(
            frames = features.nrows(),
            features_ms, inference_ms, %emotion, "pipeline stages complete"
        );

        Ok(Prediction {
            emotion,
            confidence: round_confidence(probs[best]),
            probabilities,
            timings: StageTimings {
                load_ms,
                features_ms,
                inference_ms,
                total_ms: load_ms + features_ms + inference_ms,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StubClassifier;
    use approx::assert_abs_diff_eq;

    #[test]
    fn softmax_sums_to_one_and_survives_large_logits() {
        let probs = softmax(&[1000.0, 999.0, 0.0, -5.0, 3.0, 2.0, 1.0, 0.5]);
        assert_abs_diff_eq!(probs.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
        assert!(probs.iter().all(|p| p.is_finite() && *p >= 0.0));
        assert!(probs[0] > probs[1]);
    }

    #[test]
    fn uniform_logits_give_uniform_probabilities() {
        let probs = softmax(&[0.0; NUM_CLASSES]);
        for p in probs {
            assert_abs_diff_eq!(p, 0.125, epsilon = 1e-7);
        }
    }

    #[test]
    fn argmax_prefers_first_on_ties() {
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.1]), 1);
        assert_eq!(argmax(&[0.125; 8]), 0);
    }

    #[test]
    fn confidence_rounds_to_four_places() {
        assert_eq!(round_confidence(0.873_149), 0.8731);
        assert_eq!(round_confidence(0.873_16), 0.8732);
        assert_eq!(round_confidence(1.0), 1.0);
        assert_eq!(round_confidence(0.0), 0.0);
    }

    #[test]
    fn diagnostics_record_one_outcome_each() {
        let diag = PipelineDiagnostics::default();
        diag.record::<()>(&Ok(()));
        diag.record::<()>(&Err(SentioError::UnsupportedFormat("x".into())));
        diag.record::<()>(&Err(SentioError::prediction(SentioError::AudioDecode(
            "x".into(),
        ))));
        diag.record::<()>(&Err(SentioError::prediction(SentioError::Inference(
            "x".into(),
        ))));
        let snap = diag.snapshot();
        assert_eq!(
            (snap.succeeded, snap.rejected, snap.decode_failures, snap.failures),
            (1, 1, 1, 1)
        );
    }

    #[test]
    fn classify_silence_with_stub_backend() {
        let pipeline = Pipeline::new(
            FeatureExtractor::default(),
            FrameNormalizer::default(),
            ModelHandle::new(StubClassifier::favoring(Emotion::Sad.index())),
        );
        let prediction = pipeline
            .classify(&AudioSignal::new(vec![0.0; 48_000], 16_000), 0.0)
            .unwrap();
        assert_eq!(prediction.emotion, Emotion::Sad);
        assert!(prediction.confidence > 0.5 && prediction.confidence <= 1.0);
        let total: f32 = prediction.probabilities.iter().map(|s| s.probability).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-4);
    }
}
