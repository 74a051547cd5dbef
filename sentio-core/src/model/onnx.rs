//! ONNX Runtime backend for an exported CRNN graph.
//!
//! The graph takes one `[1, 1, 184, 40]` f32 input and yields `[1, 8]` logits.
//! Input and output names are read from the graph, so any export that keeps
//! that signature works.

use std::path::Path;

use ndarray::ArrayView2;
use ort::session::Session;
use ort::value::TensorRef;
use ort::{
    ep,
    session::builder::{GraphOptimizationLevel, SessionBuilder},
};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{ClassifierBackend, Logits, INPUT_SHAPE, NUM_CLASSES};
use crate::error::{Result, SentioError};

fn create_session(model_path: &Path) -> Result<Session> {
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let intra_threads = std::env::var("SENTIO_ORT_INTRA_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(logical_cores.clamp(1, 4))
        .clamp(1, 32);

    let builder = SessionBuilder::new()
        .map_err(|e| SentioError::ModelLoad(e.to_string()))?
        .with_intra_threads(intra_threads)
        .map_err(|e| SentioError::ModelLoad(e.to_string()))?
        .with_inter_threads(1)
        .map_err(|e| SentioError::ModelLoad(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| SentioError::ModelLoad(e.to_string()))?
        .with_execution_providers([ep::CPU::default().build()])
        .map_err(|e| SentioError::ModelLoad(e.to_string()))?;
    info!(intra_threads, logical_cores, "ONNX session threading configured");

    builder
        .commit_from_file(model_path)
        .map_err(|e| SentioError::ModelLoad(format!("{}: {e}", model_path.display())))
}

/// Classifier executed by ONNX Runtime on the CPU provider.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OnnxClassifier {
    /// # Errors
    /// `ModelNotFound` if the file is missing, `ModelLoad` if ONNX Runtime
    /// rejects it or the graph has no inputs/outputs.
    pub fn load(model_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            return Err(SentioError::ModelNotFound {
                path: model_path.to_path_buf(),
            });
        }
        let session = create_session(model_path)?;

        let input_name = session
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .ok_or_else(|| SentioError::ModelLoad("graph declares no inputs".into()))?;
        let output_name = session
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .ok_or_else(|| SentioError::ModelLoad("graph declares no outputs".into()))?;
        info!(
            path = %model_path.display(),
            input = %input_name,
            output = %output_name,
            "ONNX classifier loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
        })
    }
}

impl ClassifierBackend for OnnxClassifier {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn forward(&self, features: ArrayView2<f32>) -> Result<Logits> {
        if features.dim() != INPUT_SHAPE {
            return Err(SentioError::Inference(format!(
                "expected input {INPUT_SHAPE:?}, got {:?}",
                features.dim()
            )));
        }
        let contiguous = features.as_standard_layout();
        let data = contiguous
            .as_slice()
            .ok_or_else(|| SentioError::Inference("feature matrix not contiguous".into()))?;
        let (frames, coeffs) = INPUT_SHAPE;
        let input = TensorRef::from_array_view(([1_i64, 1, frames as i64, coeffs as i64], data))
            .map_err(|e| SentioError::OnnxSession(e.to_string()))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(|e| SentioError::OnnxSession(e.to_string()))?;
        let (_, raw) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| SentioError::OnnxSession(e.to_string()))?;

        if raw.len() != NUM_CLASSES {
            return Err(SentioError::OnnxSession(format!(
                "expected {NUM_CLASSES} logits, graph returned {}",
                raw.len()
            )));
        }
        let mut logits = [0f32; NUM_CLASSES];
        logits.copy_from_slice(raw);
        debug!("onnx forward complete");
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_graph_is_model_not_found() {
        let err = OnnxClassifier::load(Path::new("/no/such/crnn.onnx")).err();
        assert!(matches!(err, Some(SentioError::ModelNotFound { .. })));
    }

    #[test]
    fn garbage_graph_is_model_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crnn.onnx");
        std::fs::write(&path, b"definitely not protobuf").unwrap();
        let err = OnnxClassifier::load(&path).err();
        assert!(matches!(err, Some(SentioError::ModelLoad(_))));
    }
}
