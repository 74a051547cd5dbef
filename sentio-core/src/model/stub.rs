//! `StubClassifier`: returns fixed logits without running a network.
//!
//! Lets the engine and HTTP layers be exercised end-to-end without a
//! parameter artifact.

use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::ArrayView2;
use tracing::debug;

use super::{ClassifierBackend, Logits, INPUT_SHAPE};
use crate::error::{Result, SentioError};

pub struct StubClassifier {
    logits: Logits,
    calls: AtomicU64,
}

impl StubClassifier {
    pub fn new(logits: Logits) -> Self {
        Self {
            logits,
            calls: AtomicU64::new(0),
        }
    }

    /// Stub whose argmax is `index`.
    pub fn favoring(index: usize) -> Self {
        let mut logits = [0.0; super::NUM_CLASSES];
        if let Some(slot) = logits.get_mut(index) {
            *slot = 4.0;
        }
        Self::new(logits)
    }

    /// Number of forward passes served, warm-up included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Default for StubClassifier {
    fn default() -> Self {
        Self::new([0.0; super::NUM_CLASSES])
    }
}

impl ClassifierBackend for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn forward(&self, features: ArrayView2<f32>) -> Result<Logits> {
        if features.dim() != INPUT_SHAPE {
            return Err(SentioError::Inference(format!(
                "expected input {INPUT_SHAPE:?}, got {:?}",
                features.dim()
            )));
        }
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(call, "StubClassifier::forward");
        Ok(self.logits)
    }
}
