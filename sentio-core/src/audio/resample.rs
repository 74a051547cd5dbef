//! Sample-rate conversion using a rubato `SincFixedIn` resampler.
//!
//! ## Design
//!
//! Decoded files arrive at whatever rate they were recorded at (44.1 kHz and
//! 48 kHz are common). The feature front end requires 16 kHz mono f32.
//! Conversion is band-limited: a Blackman-Harris windowed sinc with its
//! cutoff at 0.95 of the lower Nyquist frequency, so content above 8 kHz in a
//! 48 kHz recording is removed instead of folding into the analysed band.
//! `RateConverter` converts a whole decoded buffer in one call: full chunks go
//! through rubato, the remainder is pushed as a partial block, and the
//! resampler is flushed until its output delay has been drained.
//!
//! When source rate == target rate, `RateConverter` is a passthrough and no
//! rubato session is created at all.
//!
//! ## Usage
//!
//! ```ignore
//! let mut rc = RateConverter::new(44_100, 16_000, 1024)?;
//! let out = rc.convert(&decoded)?; // Vec<f32> at 16 kHz
//! ```

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

use crate::error::{Result, SentioError};

/// Input frames handed to rubato per call.
pub const DEFAULT_CHUNK: usize = 1024;

/// Anti-aliasing filter used for every conversion.
fn sinc_parameters() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<SincFixedIn<f32>>,
    /// `target / source`.
    ratio: f64,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Errors
    /// Returns `SentioError::Resample` if either rate is zero or rubato fails
    /// to initialise.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 {
            return Err(SentioError::Resample(format!(
                "invalid sample rates from={source_rate} to={target_rate}"
            )));
        }

        let ratio = target_rate as f64 / source_rate as f64;

        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                ratio,
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let resampler = SincFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            sinc_parameters(),
            chunk_size,
            1, // mono
        )
        .map_err(|e| SentioError::Resample(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        debug!(
            source_rate,
            target_rate, chunk_size, max_out, "resampling enabled"
        );

        Ok(Self {
            resampler: Some(resampler),
            ratio,
            chunk_size,
            output_buf,
        })
    }

    /// Convert a complete buffer.
    ///
    /// The output holds exactly `round(len * target / source)` samples and is
    /// aligned with the input (the resampler's group delay is removed).
    pub fn convert(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        let expected = (samples.len() as f64 * self.ratio).round() as usize;
        let delay = resampler.output_delay();
        let wanted = expected + delay;
        let mut out = Vec::with_capacity(wanted + self.output_buf[0].len());

        let mut pos = 0usize;
        while samples.len() - pos >= self.chunk_size {
            let block = &samples[pos..pos + self.chunk_size];
            let (consumed, produced) = resampler
                .process_into_buffer(&[block], &mut self.output_buf, None)
                .map_err(|e| SentioError::Resample(e.to_string()))?;
            out.extend_from_slice(&self.output_buf[0][..produced]);
            pos += consumed;
        }

        if pos < samples.len() {
            let tail: &[&[f32]] = &[&samples[pos..]];
            let (_, produced) = resampler
                .process_partial_into_buffer(Some(tail), &mut self.output_buf, None)
                .map_err(|e| SentioError::Resample(e.to_string()))?;
            out.extend_from_slice(&self.output_buf[0][..produced]);
        }

        // Drain the delay line with silence.
        while out.len() < wanted {
            let (_, produced) = resampler
                .process_partial_into_buffer(None::<&[&[f32]]>, &mut self.output_buf, None)
                .map_err(|e| SentioError::Resample(e.to_string()))?;
            if produced == 0 {
                break;
            }
            out.extend_from_slice(&self.output_buf[0][..produced]);
        }

        out.drain(..delay.min(out.len()));
        out.resize(expected, 0.0);
        Ok(out)
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// One-shot conversion of `samples` from `source_rate` to `target_rate`.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    RateConverter::new(source_rate, target_rate, DEFAULT_CHUNK)?.convert(samples)
}
