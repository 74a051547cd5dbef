//! MFCC front end.
//!
//! ## Parameters (must match the features the classifier was trained on)
//!
//! | Parameter        | Value                  |
//! |------------------|------------------------|
//! | Sample rate      | 16 000 Hz              |
//! | FFT / window     | 512 samples, Hann      |
//! | Hop length       | 256                    |
//! | Centering        | 256 zeros either side  |
//! | Mel bands        | 128 (Slaney, 0–8 kHz)  |
//! | dB floor / range | 1e-10, top 80 dB       |
//! | Coefficients     | 40 (orthonormal DCT-II)|
//!
//! The matrix is normalised with ONE scalar mean and ONE scalar standard
//! deviation over every entry, not per coefficient. The classifier's weights
//! were fit against exactly this normalisation.

pub mod frames;
pub mod mel;

use std::sync::Arc;

use ndarray::{Array2, Axis};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::debug;

pub use frames::{pad_or_truncate, FrameNormalizer, TARGET_FRAMES};

use crate::error::{Result, SentioError};

/// Number of cepstral coefficients per frame.
pub const N_MFCC: usize = 40;

/// Below this standard deviation the scaling step is skipped.
pub const STD_EPSILON: f64 = 1e-8;

/// MFCC front-end configuration.
#[derive(Debug, Clone)]
pub struct MfccConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub n_mfcc: usize,
    pub fmin: f64,
    /// `None` means Nyquist.
    pub fmax: Option<f64>,
    pub amin: f32,
    pub top_db: Option<f32>,
}

impl Default for MfccConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            n_fft: 512,
            hop_length: 256,
            n_mels: 128,
            n_mfcc: N_MFCC,
            fmin: 0.0,
            fmax: None,
            amin: 1e-10,
            top_db: Some(80.0),
        }
    }
}

/// Computes globally normalised, time-major MFCC matrices.
pub struct FeatureExtractor {
    config: MfccConfig,
    window: Vec<f32>,
    /// `[n_mels, n_fft/2 + 1]`
    mel_filters: Array2<f32>,
    /// `[n_mfcc, n_mels]`
    dct: Array2<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for FeatureExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(MfccConfig::default())
    }
}

impl FeatureExtractor {
    pub fn new(config: MfccConfig) -> Self {
        let fmax = config
            .fmax
            .unwrap_or(config.sample_rate as f64 / 2.0);
        let window = mel::hann_window(config.n_fft);
        let mel_filters = mel::mel_filterbank(
            config.n_fft,
            config.sample_rate,
            config.n_mels,
            config.fmin,
            fmax,
        );
        let dct = mel::dct_ortho_matrix(config.n_mfcc, config.n_mels);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(config.n_fft);

        Self {
            config,
            window,
            mel_filters,
            dct,
            fft,
        }
    }

    pub fn config(&self) -> &MfccConfig {
        &self.config
    }

    /// Number of frames produced for a signal of `n_samples`.
    pub fn frame_count(&self, n_samples: usize) -> usize {
        1 + n_samples / self.config.hop_length
    }

    /// Full pipeline: MFCC → global normalisation → `[frames, n_mfcc]`.
    ///
    /// # Errors
    /// `SentioError::Feature` if the input contains non-finite samples.
    pub fn extract(&self, samples: &[f32]) -> Result<Array2<f32>> {
        if let Some(pos) = samples.iter().position(|s| !s.is_finite()) {
            return Err(SentioError::Feature(format!(
                "non-finite sample at index {pos}"
            )));
        }

        let mut mfcc = self.mfcc(samples);
        let (mean, std) = normalize_global(&mut mfcc);
        debug!(
            frames = mfcc.ncols(),
            coefficients = mfcc.nrows(),
            mean,
            std,
            "mfcc extracted"
        );
        Ok(mfcc.reversed_axes().as_standard_layout().to_owned())
    }

    /// Raw cepstra, coefficient-major: `[n_mfcc, frames]`.
    pub fn mfcc(&self, samples: &[f32]) -> Array2<f32> {
        let log_mel = self.log_mel_spectrogram(samples);
        self.dct.dot(&log_mel)
    }

    /// `[n_mels, frames]` power spectrogram in dB.
    fn log_mel_spectrogram(&self, samples: &[f32]) -> Array2<f32> {
        let power = self.power_spectrogram(samples);
        let mut mel = self.mel_filters.dot(&power);

        let amin = self.config.amin;
        mel.mapv_inplace(|v| 10.0 * v.max(amin).log10());
        if let Some(top_db) = self.config.top_db {
            let peak = mel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let floor = peak - top_db;
            mel.mapv_inplace(|v| v.max(floor));
        }
        mel
    }

    /// `[n_fft/2 + 1, frames]` power spectrum of the centred STFT.
    fn power_spectrogram(&self, samples: &[f32]) -> Array2<f32> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let n_freqs = n_fft / 2 + 1;
        let pad = n_fft / 2;

        let mut padded = vec![0f32; samples.len() + 2 * pad];
        padded[pad..pad + samples.len()].copy_from_slice(samples);

        let n_frames = self.frame_count(samples.len());
        let mut power = Array2::<f32>::zeros((n_freqs, n_frames));
        let mut buf = vec![Complex::new(0.0f32, 0.0); n_fft];

        for (frame, mut column) in power.axis_iter_mut(Axis(1)).enumerate() {
            let start = frame * hop;
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut buf);
            for (k, out) in column.iter_mut().enumerate() {
                *out = buf[k].norm_sqr();
            }
        }
        power
    }
}

/// Subtract the scalar mean of every entry, then divide by the scalar
/// population standard deviation unless it is below [`STD_EPSILON`].
///
/// Returns the `(mean, std)` that were applied.
pub fn normalize_global(matrix: &mut Array2<f32>) -> (f64, f64) {
    let n = matrix.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = matrix.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let var = matrix
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n as f64;
    let std = var.sqrt();

    if std < STD_EPSILON {
        matrix.mapv_inplace(|v| (v as f64 - mean) as f32);
    } else {
        matrix.mapv_inplace(|v| ((v as f64 - mean) / std) as f32);
    }
    (mean, std)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tone(freq: f32, n: usize, sr: f32) -> Vec<f32> {
        (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sr).sin())
            .collect()
    }

    /// 0.3·sin(440 Hz) + 0.1·sin(1800 Hz), 4096 samples at 16 kHz.
    fn two_tone() -> Vec<f32> {
        use std::f64::consts::PI;
        (0..4_096)
            .map(|i| {
                let t = i as f64 / 16_000.0;
                (0.3 * (2.0 * PI * 440.0 * t).sin() + 0.1 * (2.0 * PI * 1_800.0 * t).sin()) as f32
            })
            .collect()
    }

    #[test]
    fn mfcc_matches_librosa_reference_values() {
        // librosa.feature.mfcc(y, sr=16000, n_mfcc=40, n_fft=512, hop_length=256)
        // evaluated in float64; (frame, coefficient, value).
        const REFERENCE: [(usize, usize, f32); 18] = [
            (0, 0, -286.8993),
            (0, 1, 134.816),
            (0, 2, 9.86),
            (0, 5, -52.025),
            (0, 13, 9.4085),
            (0, 39, 1.4203),
            (8, 0, -621.1075),
            (8, 1, 75.3443),
            (8, 2, 3.4894),
            (8, 5, -62.6005),
            (8, 13, 9.0094),
            (8, 39, 4.7246),
            (16, 0, -216.5106),
            (16, 1, 89.1082),
            (16, 2, 13.1583),
            (16, 5, -39.0707),
            (16, 13, -6.161),
            (16, 39, 0.53),
        ];

        let fx = FeatureExtractor::default();
        let mfcc = fx.mfcc(&two_tone());
        assert_eq!(mfcc.dim(), (40, 17));
        for (frame, coeff, expected) in REFERENCE {
            let got = mfcc[[coeff, frame]];
            let tol = 0.05 + 1e-3 * expected.abs();
            assert!(
                (got - expected).abs() <= tol,
                "c{coeff} at frame {frame}: got {got}, expected {expected}"
            );
        }
    }

    #[test]
    fn three_second_window_gives_188_frames_of_40() {
        let fx = FeatureExtractor::default();
        let out = fx.extract(&tone(440.0, 48_000, 16_000.0)).unwrap();
        assert_eq!(out.dim(), (188, 40));
    }

    #[test]
    fn output_is_globally_standardised() {
        let fx = FeatureExtractor::default();
        let out = fx.extract(&tone(300.0, 48_000, 16_000.0)).unwrap();
        let n = out.len() as f64;
        let mean = out.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = out.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(var.sqrt(), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn normalisation_is_global_not_per_coefficient() {
        let fx = FeatureExtractor::default();
        let out = fx.extract(&tone(1_000.0, 48_000, 16_000.0)).unwrap();
        // c0 carries the log energy; with one shared mean its column mean is
        // far from zero, which per-coefficient normalisation would erase.
        let c0_mean = out.column(0).mean().unwrap();
        assert!(c0_mean.abs() > 0.5, "c0 mean {c0_mean} looks per-column normalised");
    }

    #[test]
    fn silence_produces_finite_features() {
        let fx = FeatureExtractor::default();
        let out = fx.extract(&vec![0.0; 48_000]).unwrap();
        assert_eq!(out.dim(), (188, 40));
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn zero_variance_matrix_skips_scaling() {
        let mut m = Array2::<f32>::from_elem((4, 3), 7.5);
        let (mean, std) = normalize_global(&mut m);
        assert_abs_diff_eq!(mean, 7.5, epsilon = 1e-12);
        assert_eq!(std, 0.0);
        assert!(m.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn empty_signal_yields_single_frame() {
        let fx = FeatureExtractor::default();
        let out = fx.extract(&[]).unwrap();
        assert_eq!(out.dim(), (1, 40));
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn non_finite_input_is_rejected() {
        let fx = FeatureExtractor::default();
        let mut samples = vec![0.0f32; 1_024];
        samples[17] = f32::NAN;
        assert!(matches!(fx.extract(&samples), Err(SentioError::Feature(_))));
    }

    #[test]
    fn extraction_is_deterministic() {
        let fx = FeatureExtractor::default();
        let signal = tone(220.0, 48_000, 16_000.0);
        assert_eq!(fx.extract(&signal).unwrap(), fx.extract(&signal).unwrap());
    }
}
