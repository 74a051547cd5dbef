//! Inference-only CRNN layers over `ndarray`.
//!
//! Feature maps are `[channels, time, freq]`; sequences are `[time, features]`.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, Zip};

use super::weights::{ConvBlockParams, LstmParams};
use crate::error::{Result, SentioError};

/// Batch-norm epsilon the classifier was trained with.
pub const BN_EPS: f32 = 1e-5;

fn reshape_err(e: ndarray::ShapeError) -> SentioError {
    SentioError::Inference(format!("reshape: {e}"))
}

/// `Conv2d(3×3, pad 1) → BatchNorm → ReLU → MaxPool(2×2)` with the batch norm
/// folded into the convolution at construction.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    /// `[out, in·9]`, rows scaled by the batch-norm factor.
    weight: Array2<f32>,
    bias: Array1<f32>,
    in_channels: usize,
}

impl ConvBlock {
    pub fn from_params(p: &ConvBlockParams) -> Result<Self> {
        let (cout, cin, kh, kw) = p.weight.dim();
        let scale: Array1<f32> = Zip::from(&p.bn_weight)
            .and(&p.running_var)
            .map_collect(|&g, &var| g / (var + BN_EPS).sqrt());

        let mut weight = p
            .weight
            .as_standard_layout()
            .to_owned()
            .into_shape_with_order((cout, cin * kh * kw))
            .map_err(reshape_err)?;
        for (mut row, &s) in weight.axis_iter_mut(Axis(0)).zip(scale.iter()) {
            row *= s;
        }

        let bias = Zip::from(&p.bias)
            .and(&p.running_mean)
            .and(&scale)
            .and(&p.bn_bias)
            .map_collect(|&b, &mean, &s, &beta| (b - mean) * s + beta);

        Ok(Self {
            weight,
            bias,
            in_channels: cin,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let mut x = self.conv(input)?;
        x.mapv_inplace(|v| v.max(0.0));
        Ok(max_pool_2x2(&x))
    }

    /// Same-padded 3×3 convolution via im2col.
    fn conv(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let (cin, h, w) = input.dim();
        if cin != self.in_channels {
            return Err(SentioError::Inference(format!(
                "conv expects {} input channels, got {cin}",
                self.in_channels
            )));
        }

        let mut padded = Array3::<f32>::zeros((cin, h + 2, w + 2));
        padded.slice_mut(s![.., 1..h + 1, 1..w + 1]).assign(input);

        let mut cols = Array3::<f32>::zeros((cin * 9, h, w));
        for c in 0..cin {
            for ky in 0..3 {
                for kx in 0..3 {
                    cols.index_axis_mut(Axis(0), c * 9 + ky * 3 + kx)
                        .assign(&padded.slice(s![c, ky..ky + h, kx..kx + w]));
                }
            }
        }
        let cols = cols
            .into_shape_with_order((cin * 9, h * w))
            .map_err(reshape_err)?;

        let mut out = self.weight.dot(&cols);
        out += &self.bias.view().insert_axis(Axis(1));
        out.into_shape_with_order((self.out_channels(), h, w))
            .map_err(reshape_err)
    }
}

/// 2×2 max pooling, stride 2, odd trailing rows/columns dropped.
pub fn max_pool_2x2(input: &Array3<f32>) -> Array3<f32> {
    let (c, h, w) = input.dim();
    Array3::from_shape_fn((c, h / 2, w / 2), |(ch, y, x)| {
        let (y0, x0) = (2 * y, 2 * x);
        input[[ch, y0, x0]]
            .max(input[[ch, y0, x0 + 1]])
            .max(input[[ch, y0 + 1, x0]])
            .max(input[[ch, y0 + 1, x0 + 1]])
    })
}

/// `[C, T, F]` → `[T, C·F]`, channel-major within each step.
pub fn to_sequence(features: Array3<f32>) -> Result<Array2<f32>> {
    let (c, t, f) = features.dim();
    features
        .permuted_axes([1, 0, 2])
        .as_standard_layout()
        .to_owned()
        .into_shape_with_order((t, c * f))
        .map_err(reshape_err)
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// One LSTM direction.
#[derive(Debug, Clone)]
pub struct LstmDirection {
    weight_ih: Array2<f32>,
    weight_hh: Array2<f32>,
    /// `bias_ih + bias_hh`
    bias: Array1<f32>,
    hidden: usize,
}

impl LstmDirection {
    pub fn from_params(p: &LstmParams) -> Self {
        Self {
            weight_ih: p.weight_ih.clone(),
            weight_hh: p.weight_hh.clone(),
            bias: &p.bias_ih + &p.bias_hh,
            hidden: p.weight_hh.ncols(),
        }
    }

    /// Hidden state for every step of `xs` (`[T, input]`), in time order.
    ///
    /// With `reverse` the sequence is consumed back to front, so row `T-1` of
    /// the result is the state after seeing only the last input.
    pub fn run(&self, xs: ArrayView2<f32>, reverse: bool) -> Result<Array2<f32>> {
        if xs.ncols() != self.weight_ih.ncols() {
            return Err(SentioError::Inference(format!(
                "lstm expects {} features per step, got {}",
                self.weight_ih.ncols(),
                xs.ncols()
            )));
        }
        let steps = xs.nrows();
        let hsz = self.hidden;

        let mut projected = xs.dot(&self.weight_ih.t());
        projected += &self.bias;

        let mut out = Array2::<f32>::zeros((steps, hsz));
        let mut h = Array1::<f32>::zeros(hsz);
        let mut c = Array1::<f32>::zeros(hsz);

        let order: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..steps).rev())
        } else {
            Box::new(0..steps)
        };
        for t in order {
            let gates = &projected.row(t) + &self.weight_hh.dot(&h);
            for j in 0..hsz {
                let i = sigmoid(gates[j]);
                let f = sigmoid(gates[hsz + j]);
                let g = gates[2 * hsz + j].tanh();
                let o = sigmoid(gates[3 * hsz + j]);
                c[j] = f * c[j] + i * g;
                h[j] = o * c[j].tanh();
            }
            out.row_mut(t).assign(&h);
        }
        Ok(out)
    }
}

/// Fully connected layer `y = W·x + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Self {
        Self { weight, bias }
    }

    pub fn forward(&self, x: ArrayView1<f32>) -> Result<Array1<f32>> {
        if x.len() != self.weight.ncols() {
            return Err(SentioError::Inference(format!(
                "linear expects {} inputs, got {}",
                self.weight.ncols(),
                x.len()
            )));
        }
        Ok(self.weight.dot(&x) + &self.bias)
    }
}
