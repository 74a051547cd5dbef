//! `SentioEngine`, the top-level prediction facade.
//!
//! ## Lifecycle
//!
//! ```text
//! SentioEngine::new(config)   → backend loaded (fatal ModelLoad on any artifact problem)
//!     └─► warm_up()           → one dummy forward pass
//!         └─► predict_*()     → any number of concurrent calls
//! ```
//!
//! ## Threading
//!
//! The engine is `Send + Sync` and every entry point takes `&self`; share it
//! behind an `Arc`. Prediction is CPU-bound and blocking, so async callers
//! should run it on `tokio::task::spawn_blocking`.

pub mod pipeline;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    audio::{AudioFormat, AudioLoader, AudioSignal, TARGET_SAMPLE_RATE, WINDOW_END_SECS, WINDOW_START_SECS},
    error::{Result, SentioError},
    features::{FeatureExtractor, FrameNormalizer, MfccConfig, TARGET_FRAMES},
    model::{CrnnClassifier, ModelHandle},
    prediction::{Emotion, Prediction},
};

use pipeline::{DiagnosticsSnapshot, Pipeline, PipelineDiagnostics};

/// Default location of the parameter artifact, relative to the working dir.
pub const DEFAULT_MODEL_PATH: &str = "models/crnn_emotion.safetensors";

/// Which execution backend runs the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Pure-Rust CRNN over a safetensors artifact.
    #[default]
    Native,
    /// ONNX Runtime over an exported graph (requires the `onnx` feature).
    Onnx,
}

impl FromStr for BackendKind {
    type Err = SentioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "onnx" => Ok(Self::Onnx),
            other => Err(SentioError::ModelLoad(format!(
                "unknown backend {other:?} (expected \"native\" or \"onnx\")"
            ))),
        }
    }
}

/// Configuration for `SentioEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Parameter artifact (`.safetensors` for native, `.onnx` for onnx).
    pub model_path: PathBuf,
    pub backend: BackendKind,
    /// Rate every clip is resampled to before feature extraction. Default: 16000.
    pub target_sample_rate: u32,
    /// Analysis window, seconds into the decoded clip. Default: 0.5 .. 3.5.
    pub window_start_secs: f64,
    pub window_end_secs: f64,
    /// Frames fed to the classifier. Default: 184.
    pub target_frames: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            backend: BackendKind::Native,
            target_sample_rate: TARGET_SAMPLE_RATE,
            window_start_secs: WINDOW_START_SECS,
            window_end_secs: WINDOW_END_SECS,
            target_frames: TARGET_FRAMES,
        }
    }
}

impl EngineConfig {
    /// Defaults with `SENTIO_MODEL_PATH` / `SENTIO_BACKEND` applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("SENTIO_MODEL_PATH") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                self.model_path = PathBuf::from(trimmed);
            }
        }
        if let Ok(raw) = std::env::var("SENTIO_BACKEND") {
            match raw.parse() {
                Ok(kind) => self.backend = kind,
                Err(e) => warn!("ignoring SENTIO_BACKEND: {e}"),
            }
        }
    }
}

/// Load the configured backend.
///
/// # Errors
/// `ModelNotFound` / `ModelLoad` from the backend; `ModelLoad` when the onnx
/// backend is requested from a build without the `onnx` feature.
pub fn load_backend(config: &EngineConfig) -> Result<ModelHandle> {
    match config.backend {
        BackendKind::Native => Ok(ModelHandle::new(CrnnClassifier::load(&config.model_path)?)),
        #[cfg(feature = "onnx")]
        BackendKind::Onnx => Ok(ModelHandle::new(crate::model::OnnxClassifier::load(
            &config.model_path,
        )?)),
        #[cfg(not(feature = "onnx"))]
        BackendKind::Onnx => Err(SentioError::ModelLoad(
            "onnx backend requested but sentio-core was built without the `onnx` feature".into(),
        )),
    }
}

/// The top-level engine handle.
pub struct SentioEngine {
    config: EngineConfig,
    loader: AudioLoader,
    pipeline: Pipeline,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl SentioEngine {
    /// Load the configured backend and build the pipeline around it.
    ///
    /// Does not warm up; call [`SentioEngine::warm_up`] before serving.
    pub fn new(config: EngineConfig) -> Result<Self> {
        info!(
            backend = ?config.backend,
            model = %config.model_path.display(),
            "loading classifier"
        );
        let model = load_backend(&config)?;
        Ok(Self::with_backend(config, model))
    }

    /// Build an engine around an already-constructed backend.
    pub fn with_backend(config: EngineConfig, model: ModelHandle) -> Self {
        let loader = AudioLoader::new(
            config.target_sample_rate,
            config.window_start_secs,
            config.window_end_secs,
        );
        let extractor = FeatureExtractor::new(MfccConfig {
            sample_rate: config.target_sample_rate,
            ..MfccConfig::default()
        });
        let normalizer = FrameNormalizer::new(config.target_frames);

        Self {
            config,
            loader,
            pipeline: Pipeline::new(extractor, normalizer, model),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        }
    }

    /// Run one dummy forward pass.
    pub fn warm_up(&self) -> Result<()> {
        info!(backend = self.backend_name(), "warming up classifier");
        self.pipeline.model().warm_up()?;
        info!("classifier ready");
        Ok(())
    }

    /// Classify an audio file on disk.
    ///
    /// # Errors
    /// - `UnsupportedFormat` for a non-`.wav`/`.mp3` path, before any I/O.
    /// - `Prediction(cause)` for any failure after the extension check.
    pub fn predict_file(&self, path: &Path) -> Result<Prediction> {
        let outcome = AudioFormat::from_path(path).and_then(|_| {
            self.run_stages(|| self.loader.load(path))
        });
        self.finish(&path.display().to_string(), outcome)
    }

    /// Classify uploaded bytes. `file_name` selects the decoder.
    pub fn predict_bytes(&self, file_name: &str, bytes: Vec<u8>) -> Result<Prediction> {
        let outcome = AudioFormat::from_path(Path::new(file_name)).and_then(|_| {
            self.run_stages(|| self.loader.load_bytes(file_name, bytes))
        });
        self.finish(file_name, outcome)
    }

    /// Classify an already-decoded mono signal at any sample rate.
    pub fn predict_samples(&self, samples: Vec<f32>, sample_rate: u32) -> Result<Prediction> {
        let outcome =
            self.run_stages(|| self.loader.window(AudioSignal::new(samples, sample_rate)));
        self.finish("<samples>", outcome)
    }

    /// The fixed, ordered label set.
    pub fn emotions() -> &'static [Emotion] {
        &Emotion::ALL
    }

    pub fn backend_name(&self) -> &'static str {
        self.pipeline.model().name()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot of request counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn run_stages<F>(&self, load: F) -> Result<Prediction>
    where
        F: FnOnce() -> Result<AudioSignal>,
    {
        let started = Instant::now();
        let signal = load().map_err(SentioError::prediction)?;
        let load_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.pipeline
            .classify(&signal, load_ms)
            .map_err(SentioError::prediction)
    }

    fn finish(&self, source: &str, outcome: Result<Prediction>) -> Result<Prediction> {
        self.diagnostics.requests.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.diagnostics.record(&outcome);
        match &outcome {
            Ok(p) => info!(
                file = source,
                emotion = %p.emotion,
                confidence = p.confidence,
                elapsed_ms = p.timings.total_ms,
                "prediction complete"
            ),
            Err(e) if e.is_client_error() => info!(file = source, error = %e, "input rejected"),
            Err(e) => warn!(file = source, error = %e, "prediction failed"),
        }
        outcome
    }
}

impl std::fmt::Debug for SentioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentioEngine")
            .field("config", &self.config)
            .field("backend", &self.backend_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StubClassifier;

    fn stub_engine(favored: Emotion) -> SentioEngine {
        SentioEngine::with_backend(
            EngineConfig::default(),
            ModelHandle::new(StubClassifier::favoring(favored.index())),
        )
    }

    #[test]
    fn backend_kind_parses() {
        assert_eq!("Native".parse::<BackendKind>().unwrap(), BackendKind::Native);
        assert_eq!(" onnx ".parse::<BackendKind>().unwrap(), BackendKind::Onnx);
        assert!("tflite".parse::<BackendKind>().is_err());
    }

    #[test]
    fn missing_artifact_fails_construction() {
        let config = EngineConfig {
            model_path: PathBuf::from("/no/such/model.safetensors"),
            ..EngineConfig::default()
        };
        let err = SentioEngine::new(config).unwrap_err();
        assert!(matches!(err, SentioError::ModelNotFound { .. }), "got {err:?}");
    }

    #[test]
    fn rejected_extension_is_not_wrapped() {
        let engine = stub_engine(Emotion::Calm);
        let err = engine.predict_file(Path::new("clip.txt")).unwrap_err();
        assert!(matches!(err, SentioError::UnsupportedFormat(_)), "got {err:?}");
        assert_eq!(engine.diagnostics_snapshot().rejected, 1);
    }

    #[test]
    fn undecodable_bytes_are_wrapped_client_errors() {
        let engine = stub_engine(Emotion::Calm);
        let err = engine
            .predict_bytes("clip.wav", b"RIFF....not really".to_vec())
            .unwrap_err();
        assert!(matches!(err, SentioError::Prediction(_)), "got {err:?}");
        assert!(err.is_client_error());
        let snap = engine.diagnostics_snapshot();
        assert_eq!((snap.requests, snap.decode_failures), (1, 1));
    }

    #[test]
    fn samples_at_any_rate_are_classified() {
        let engine = stub_engine(Emotion::Happy);
        let p = engine.predict_samples(vec![0.0; 44_100 * 2], 44_100).unwrap();
        assert_eq!(p.emotion, Emotion::Happy);
        assert_eq!(p.probabilities.len(), 8);
        assert_eq!(engine.diagnostics_snapshot().succeeded, 1);
    }

    #[test]
    fn emotions_are_the_fixed_label_set() {
        let names: Vec<&str> = SentioEngine::emotions().iter().map(|e| e.as_str()).collect();
        assert_eq!(
            names,
            ["angry", "calm", "disgust", "fearful", "happy", "neutral", "sad", "surprised"]
        );
    }

    #[test]
    fn warm_up_runs_backend_once() {
        let stub = Arc::new(StubClassifier::default());
        struct Shared(Arc<StubClassifier>);
        impl crate::model::ClassifierBackend for Shared {
            fn name(&self) -> &'static str {
                "shared-stub"
            }
            fn forward(&self, features: ndarray::ArrayView2<f32>) -> Result<crate::model::Logits> {
                self.0.forward(features)
            }
        }
        let engine = SentioEngine::with_backend(
            EngineConfig::default(),
            ModelHandle::new(Shared(Arc::clone(&stub))),
        );
        engine.warm_up().unwrap();
        assert_eq!(stub.calls(), 1);
        assert_eq!(engine.backend_name(), "shared-stub");
    }
}
