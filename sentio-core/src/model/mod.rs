//! Classifier abstraction.
//!
//! The `ClassifierBackend` trait decouples the engine from any specific
//! execution backend (native CRNN, ONNX Runtime, fixed-logit stub).
//!
//! `forward` takes `&self`: parameters are immutable once loaded, so the
//! native backend runs concurrent requests without locking. Backends whose
//! runtime context needs exclusive access (the ONNX session) hold their own
//! `parking_lot::Mutex` internally.

pub mod crnn;
pub mod layers;
pub mod stub;
pub mod weights;

#[cfg(feature = "onnx")]
pub mod onnx;

pub use crnn::CrnnClassifier;
#[cfg(feature = "onnx")]
pub use onnx::OnnxClassifier;
pub use stub::StubClassifier;
pub use weights::{expected_tensor_shapes, CrnnParams, NUM_CLASSES};

use std::sync::Arc;

use ndarray::{Array2, ArrayView2};
use tracing::debug;

use crate::error::Result;
use crate::features::{N_MFCC, TARGET_FRAMES};

/// `(frames, coefficients)` every backend consumes.
pub const INPUT_SHAPE: (usize, usize) = (TARGET_FRAMES, N_MFCC);

/// Raw classifier scores in label order.
pub type Logits = [f32; NUM_CLASSES];

/// Contract for classifier execution backends.
pub trait ClassifierBackend: Send + Sync + 'static {
    /// Short backend identifier for logs and health output.
    fn name(&self) -> &'static str;

    /// Map a normalized `(184, 40)` feature matrix to eight logits.
    ///
    /// # Errors
    /// `Inference` (or `OnnxSession`) when the input shape is wrong or the
    /// backend fails.
    fn forward(&self, features: ArrayView2<f32>) -> Result<Logits>;

    /// One dummy forward pass to populate caches before serving.
    fn warm_up(&self) -> Result<()> {
        let started = std::time::Instant::now();
        let logits = self.forward(Array2::zeros(INPUT_SHAPE).view())?;
        debug!(
            backend = self.name(),
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            ?logits,
            "warm-up pass complete"
        );
        Ok(())
    }
}

/// Thread-safe reference-counted handle to any `ClassifierBackend`.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<dyn ClassifierBackend>);

impl ModelHandle {
    pub fn new<B: ClassifierBackend>(backend: B) -> Self {
        Self(Arc::new(backend))
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    pub fn forward(&self, features: ArrayView2<f32>) -> Result<Logits> {
        self.0.forward(features)
    }

    pub fn warm_up(&self) -> Result<()> {
        self.0.warm_up()
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("backend", &self.name())
            .finish_non_exhaustive()
    }
}
