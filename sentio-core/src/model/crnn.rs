//! Native CRNN forward pass.
//!
//! ```text
//! [184, 40] ─► 4 × ConvBlock ─► [256, 11, 2] ─► [11, 512]
//!           ─► BiLSTM(128) ─► last step [fwd ‖ bwd] (256) ─► Linear ─► 8 logits
//! ```

use std::path::Path;

use ndarray::{concatenate, ArrayView2, Axis};
use tracing::debug;

use super::layers::{to_sequence, ConvBlock, Linear, LstmDirection};
use super::weights::{CrnnParams, NUM_CLASSES};
use super::{ClassifierBackend, Logits, INPUT_SHAPE};
use crate::error::{Result, SentioError};

/// Pure-Rust classifier. Immutable after construction; `forward` takes `&self`.
#[derive(Debug, Clone)]
pub struct CrnnClassifier {
    blocks: Vec<ConvBlock>,
    lstm_forward: LstmDirection,
    lstm_backward: LstmDirection,
    head: Linear,
}

impl CrnnClassifier {
    /// Load and validate a safetensors artifact.
    pub fn load(path: &Path) -> Result<Self> {
        let params = CrnnParams::load(path)?;
        Self::from_params(&params)
    }

    pub fn from_params(params: &CrnnParams) -> Result<Self> {
        let blocks = params
            .conv
            .iter()
            .map(ConvBlock::from_params)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| SentioError::ModelLoad(format!("conv block: {e}")))?;
        Ok(Self {
            blocks,
            lstm_forward: LstmDirection::from_params(&params.lstm_forward),
            lstm_backward: LstmDirection::from_params(&params.lstm_backward),
            head: Linear::new(params.fc_weight.clone(), params.fc_bias.clone()),
        })
    }
}

impl ClassifierBackend for CrnnClassifier {
    fn name(&self) -> &'static str {
        "native"
    }

    fn forward(&self, features: ArrayView2<f32>) -> Result<Logits> {
        if features.dim() != INPUT_SHAPE {
            return Err(SentioError::Inference(format!(
                "expected input {INPUT_SHAPE:?}, got {:?}",
                features.dim()
            )));
        }

        let mut x = features.to_owned().insert_axis(Axis(0));
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        let seq = to_sequence(x)?;
        let steps = seq.nrows();

        let fwd = self.lstm_forward.run(seq.view(), false)?;
        let bwd = self.lstm_backward.run(seq.view(), true)?;
        let last = concatenate(Axis(0), &[fwd.row(steps - 1), bwd.row(steps - 1)])
            .map_err(|e| SentioError::Inference(format!("concat: {e}")))?;

        let out = self.head.forward(last.view())?;
        debug!(steps, "crnn forward complete");

        let mut logits = [0f32; NUM_CLASSES];
        for (slot, v) in logits.iter_mut().zip(out.iter()) {
            *slot = *v;
        }
        Ok(logits)
    }
}
