//! # sentio-core
//!
//! Speech emotion classification SDK.
//!
//! ## Architecture
//!
//! ```text
//! .wav/.mp3 → AudioLoader (decode, mono, 16 kHz, 0.5–3.5 s window)
//!                 │
//!           FeatureExtractor (MFCC 40, global mean/std)
//!                 │
//!           FrameNormalizer (184 frames)
//!                 │
//!           ClassifierBackend::forward (CRNN → 8 logits)
//!                 │
//!           softmax → argmax → {emotion, confidence}
//! ```
//!
//! Parameters are loaded once and shared read-only; every request allocates
//! and drops its own buffers.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod engine;
pub mod error;
pub mod features;
pub mod model;
pub mod prediction;

// Convenience re-exports for downstream crates
pub use engine::pipeline::DiagnosticsSnapshot;
pub use engine::{BackendKind, EngineConfig, SentioEngine};
pub use error::{Result, SentioError};
pub use model::{ClassifierBackend, CrnnClassifier, CrnnParams, ModelHandle, StubClassifier};
pub use prediction::{Emotion, Prediction, PredictionResult};

#[cfg(feature = "onnx")]
pub use model::OnnxClassifier;
