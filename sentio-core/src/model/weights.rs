//! Safetensors-backed CRNN parameter loading.
//!
//! Tensor names follow the classifier's `state_dict` layout:
//!
//! ```text
//! cnn.{0,4,8,12}.{weight,bias}                          conv 3×3
//! cnn.{1,5,9,13}.{weight,bias,running_mean,running_var} batch norm
//! lstm.{weight_ih,weight_hh,bias_ih,bias_hh}_l0[_reverse]
//! fc.{weight,bias}
//! ```
//!
//! Loading is strict: every expected tensor must be present with the exact
//! shape, and nothing else may be in the file (batch-norm
//! `num_batches_tracked` counters excepted).

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use ndarray::{Array1, Array2, Array4};
use safetensors::tensor::{Dtype, View};
use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::error::{Result, SentioError};

/// Channel progression through the four conv blocks.
pub const CONV_CHANNELS: [usize; 5] = [1, 32, 64, 128, 256];
/// `state_dict` index of each block's conv layer; its batch norm is `+ 1`.
pub const CONV_LAYER_INDICES: [usize; 4] = [0, 4, 8, 12];
/// LSTM input width: 256 channels × 2 remaining frequency bins.
pub const LSTM_INPUT: usize = 512;
/// Hidden units per LSTM direction.
pub const LSTM_HIDDEN: usize = 128;
/// Output classes.
pub const NUM_CLASSES: usize = 8;

const KERNEL: usize = 3;

/// Parameters of one `Conv2d → BatchNorm2d` pair, exactly as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvBlockParams {
    /// `[out, in, 3, 3]`
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
    pub bn_weight: Array1<f32>,
    pub bn_bias: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
}

/// One direction of a single-layer LSTM. Gate rows are ordered `i, f, g, o`.
#[derive(Debug, Clone, PartialEq)]
pub struct LstmParams {
    /// `[4·H, input]`
    pub weight_ih: Array2<f32>,
    /// `[4·H, H]`
    pub weight_hh: Array2<f32>,
    pub bias_ih: Array1<f32>,
    pub bias_hh: Array1<f32>,
}

/// Complete, validated CRNN parameter set.
#[derive(Debug, Clone, PartialEq)]
pub struct CrnnParams {
    pub conv: Vec<ConvBlockParams>,
    pub lstm_forward: LstmParams,
    pub lstm_backward: LstmParams,
    /// `[NUM_CLASSES, 2·H]`
    pub fc_weight: Array2<f32>,
    pub fc_bias: Array1<f32>,
}

/// Every tensor name the artifact must contain, with its shape.
pub fn expected_tensor_shapes() -> BTreeMap<String, Vec<usize>> {
    let mut shapes = BTreeMap::new();
    for (block, &idx) in CONV_LAYER_INDICES.iter().enumerate() {
        let (cin, cout) = (CONV_CHANNELS[block], CONV_CHANNELS[block + 1]);
        shapes.insert(format!("cnn.{idx}.weight"), vec![cout, cin, KERNEL, KERNEL]);
        shapes.insert(format!("cnn.{idx}.bias"), vec![cout]);
        for field in ["weight", "bias", "running_mean", "running_var"] {
            shapes.insert(format!("cnn.{}.{field}", idx + 1), vec![cout]);
        }
    }
    for suffix in ["", "_reverse"] {
        shapes.insert(
            format!("lstm.weight_ih_l0{suffix}"),
            vec![4 * LSTM_HIDDEN, LSTM_INPUT],
        );
        shapes.insert(
            format!("lstm.weight_hh_l0{suffix}"),
            vec![4 * LSTM_HIDDEN, LSTM_HIDDEN],
        );
        shapes.insert(format!("lstm.bias_ih_l0{suffix}"), vec![4 * LSTM_HIDDEN]);
        shapes.insert(format!("lstm.bias_hh_l0{suffix}"), vec![4 * LSTM_HIDDEN]);
    }
    shapes.insert("fc.weight".into(), vec![NUM_CLASSES, 2 * LSTM_HIDDEN]);
    shapes.insert("fc.bias".into(), vec![NUM_CLASSES]);
    shapes
}

fn is_ignored_tensor(name: &str) -> bool {
    CONV_LAYER_INDICES
        .iter()
        .any(|idx| name == format!("cnn.{}.num_batches_tracked", idx + 1))
}

impl CrnnParams {
    /// Read and validate a safetensors artifact.
    ///
    /// # Errors
    /// - `ModelNotFound` if `path` does not exist.
    /// - `ModelLoad` for anything structurally wrong with the file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SentioError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }
        let bytes = std::fs::read(path)
            .map_err(|e| SentioError::ModelLoad(format!("{}: {e}", path.display())))?;
        let size_mb = bytes.len() as f64 / 1_048_576.0;
        let params = Self::from_bytes(&bytes)?;
        info!(path = %path.display(), size_mb, "CRNN parameters loaded");
        Ok(params)
    }

    /// Parse an in-memory safetensors buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let st = SafeTensors::deserialize(bytes)
            .map_err(|e| SentioError::ModelLoad(format!("invalid safetensors: {e}")))?;
        let expected = expected_tensor_shapes();

        let mut unexpected: Vec<String> = st
            .names()
            .into_iter()
            .filter(|n| !expected.contains_key(n.as_str()) && !is_ignored_tensor(n))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            unexpected.sort();
            return Err(SentioError::ModelLoad(format!(
                "unexpected tensors: {}",
                unexpected.join(", ")
            )));
        }

        let present: HashSet<&str> = st.names().into_iter().map(String::as_str).collect();
        let missing: Vec<&str> = expected
            .keys()
            .map(String::as_str)
            .filter(|n| !present.contains(n))
            .collect();
        if !missing.is_empty() {
            return Err(SentioError::ModelLoad(format!(
                "missing tensors: {}",
                missing.join(", ")
            )));
        }

        let mut tensors = BTreeMap::new();
        for (name, shape) in &expected {
            let view = st
                .tensor(name)
                .map_err(|e| SentioError::ModelLoad(format!("{name}: {e}")))?;
            if view.shape() != shape.as_slice() {
                return Err(SentioError::ModelLoad(format!(
                    "{name}: expected shape {shape:?}, found {:?}",
                    view.shape()
                )));
            }
            let data = decode_f32(name, view.dtype(), view.data())?;
            tensors.insert(name.clone(), data);
        }
        debug!(tensors = tensors.len(), "artifact validated");

        let mut store = TensorStore(tensors);
        Self::from_store(&mut store)
    }

    fn from_store(store: &mut TensorStore) -> Result<Self> {
        let mut conv = Vec::with_capacity(CONV_LAYER_INDICES.len());
        for (block, &idx) in CONV_LAYER_INDICES.iter().enumerate() {
            let (cin, cout) = (CONV_CHANNELS[block], CONV_CHANNELS[block + 1]);
            let bn = idx + 1;
            conv.push(ConvBlockParams {
                weight: Array4::from_shape_vec(
                    (cout, cin, KERNEL, KERNEL),
                    store.take(&format!("cnn.{idx}.weight"))?,
                )
                .map_err(shape_err)?,
                bias: Array1::from(store.take(&format!("cnn.{idx}.bias"))?),
                bn_weight: Array1::from(store.take(&format!("cnn.{bn}.weight"))?),
                bn_bias: Array1::from(store.take(&format!("cnn.{bn}.bias"))?),
                running_mean: Array1::from(store.take(&format!("cnn.{bn}.running_mean"))?),
                running_var: Array1::from(store.take(&format!("cnn.{bn}.running_var"))?),
            });
        }

        Ok(Self {
            conv,
            lstm_forward: store.lstm("")?,
            lstm_backward: store.lstm("_reverse")?,
            fc_weight: Array2::from_shape_vec(
                (NUM_CLASSES, 2 * LSTM_HIDDEN),
                store.take("fc.weight")?,
            )
            .map_err(shape_err)?,
            fc_bias: Array1::from(store.take("fc.bias")?),
        })
    }

    /// Deterministic parameters from `f(tensor_name, flat_index)`.
    ///
    /// Running variances are forced positive. Used to synthesise fixture
    /// artifacts and for benchmarking without a trained checkpoint.
    pub fn generate<F>(mut f: F) -> Result<Self>
    where
        F: FnMut(&str, usize) -> f32,
    {
        let mut tensors = BTreeMap::new();
        for (name, shape) in expected_tensor_shapes() {
            let len: usize = shape.iter().product();
            let positive = name.ends_with("running_var");
            let data = (0..len)
                .map(|i| {
                    let v = f(&name, i);
                    if positive {
                        v.abs() + 0.5
                    } else {
                        v
                    }
                })
                .collect();
            tensors.insert(name, data);
        }
        Self::from_store(&mut TensorStore(tensors))
    }

    /// Write every tensor as little-endian F32 under its `state_dict` name.
    pub fn save_safetensors(&self, path: &Path) -> Result<()> {
        let mut tensors: Vec<(String, OwnedTensor)> = Vec::new();
        let mut push = |name: String, shape: &[usize], data: Vec<f32>| {
            tensors.push((name, OwnedTensor::from_f32(shape.to_vec(), &data)));
        };

        for (block, &idx) in CONV_LAYER_INDICES.iter().enumerate() {
            let p = &self.conv[block];
            let bn = idx + 1;
            push(format!("cnn.{idx}.weight"), p.weight.shape(), flat(p.weight.iter()));
            push(format!("cnn.{idx}.bias"), p.bias.shape(), p.bias.to_vec());
            push(format!("cnn.{bn}.weight"), p.bn_weight.shape(), p.bn_weight.to_vec());
            push(format!("cnn.{bn}.bias"), p.bn_bias.shape(), p.bn_bias.to_vec());
            push(
                format!("cnn.{bn}.running_mean"),
                p.running_mean.shape(),
                p.running_mean.to_vec(),
            );
            push(
                format!("cnn.{bn}.running_var"),
                p.running_var.shape(),
                p.running_var.to_vec(),
            );
        }
        for (suffix, lstm) in [("", &self.lstm_forward), ("_reverse", &self.lstm_backward)] {
            push(
                format!("lstm.weight_ih_l0{suffix}"),
                lstm.weight_ih.shape(),
                flat(lstm.weight_ih.iter()),
            );
            push(
                format!("lstm.weight_hh_l0{suffix}"),
                lstm.weight_hh.shape(),
                flat(lstm.weight_hh.iter()),
            );
            push(format!("lstm.bias_ih_l0{suffix}"), lstm.bias_ih.shape(), lstm.bias_ih.to_vec());
            push(format!("lstm.bias_hh_l0{suffix}"), lstm.bias_hh.shape(), lstm.bias_hh.to_vec());
        }
        push("fc.weight".into(), self.fc_weight.shape(), flat(self.fc_weight.iter()));
        push("fc.bias".into(), self.fc_bias.shape(), self.fc_bias.to_vec());

        safetensors::tensor::serialize_to_file(tensors, &None, path)
            .map_err(|e| SentioError::ModelLoad(format!("writing {}: {e}", path.display())))
    }
}

fn flat<'a>(it: impl Iterator<Item = &'a f32>) -> Vec<f32> {
    it.copied().collect()
}

fn shape_err(e: ndarray::ShapeError) -> SentioError {
    SentioError::ModelLoad(format!("tensor reshape: {e}"))
}

/// Decoded tensors awaiting assembly into typed parameters.
struct TensorStore(BTreeMap<String, Vec<f32>>);

impl TensorStore {
    fn take(&mut self, name: &str) -> Result<Vec<f32>> {
        self.0
            .remove(name)
            .ok_or_else(|| SentioError::ModelLoad(format!("missing tensor {name}")))
    }

    fn lstm(&mut self, suffix: &str) -> Result<LstmParams> {
        let gates = 4 * LSTM_HIDDEN;
        Ok(LstmParams {
            weight_ih: Array2::from_shape_vec(
                (gates, LSTM_INPUT),
                self.take(&format!("lstm.weight_ih_l0{suffix}"))?,
            )
            .map_err(shape_err)?,
            weight_hh: Array2::from_shape_vec(
                (gates, LSTM_HIDDEN),
                self.take(&format!("lstm.weight_hh_l0{suffix}"))?,
            )
            .map_err(shape_err)?,
            bias_ih: Array1::from(self.take(&format!("lstm.bias_ih_l0{suffix}"))?),
            bias_hh: Array1::from(self.take(&format!("lstm.bias_hh_l0{suffix}"))?),
        })
    }
}

/// Convert raw little-endian tensor bytes to f32.
fn decode_f32(name: &str, dtype: Dtype, raw: &[u8]) -> Result<Vec<f32>> {
    let elem_size = match dtype {
        Dtype::F32 => 4,
        Dtype::F16 | Dtype::BF16 => 2,
        other => {
            return Err(SentioError::ModelLoad(format!(
                "{name}: unsupported dtype {other:?}"
            )))
        }
    };
    if raw.len() % elem_size != 0 {
        return Err(SentioError::ModelLoad(format!(
            "{name}: {} bytes is not a multiple of {elem_size}",
            raw.len()
        )));
    }

    let data: Vec<f32> = match dtype {
        Dtype::F32 => raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::BF16 => raw
            .chunks_exact(2)
            .map(|c| f32::from_bits((u16::from_le_bytes([c[0], c[1]]) as u32) << 16))
            .collect(),
        _ => raw
            .chunks_exact(2)
            .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
    };

    if data.iter().any(|v| !v.is_finite()) {
        return Err(SentioError::ModelLoad(format!("{name}: non-finite values")));
    }
    Ok(data)
}

/// IEEE 754 half → single.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = ((bits >> 15) as u32) << 31;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let mant = (bits & 0x3ff) as u32;
    match exp {
        0 if mant == 0 => f32::from_bits(sign),
        0 => {
            // Subnormal: mant · 2^-24.
            let v = mant as f32 * f32::from_bits(0x3380_0000);
            if sign != 0 {
                -v
            } else {
                v
            }
        }
        0x1f => f32::from_bits(sign | 0x7f80_0000 | (mant << 13)),
        _ => f32::from_bits(sign | ((exp + 112) << 23) | (mant << 13)),
    }
}

/// F32 tensor staged for serialisation.
struct OwnedTensor {
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl OwnedTensor {
    fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self { shape, data }
    }
}

impl View for OwnedTensor {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}
