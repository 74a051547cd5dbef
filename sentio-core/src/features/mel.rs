//! Filterbank, window, and DCT tables for the MFCC front end.
//!
//! Mel scale is Slaney's (linear below 1 kHz, logarithmic above) with
//! area-normalised triangles, the same construction the classifier's training
//! features used. Tables are built in f64 and stored as f32.

use ndarray::Array2;

/// Periodic Hann window of length `n`.
pub fn hann_window(n: usize) -> Vec<f32> {
    use std::f64::consts::PI;
    (0..n)
        .map(|i| (0.5 * (1.0 - (2.0 * PI * i as f64 / n as f64).cos())) as f32)
        .collect()
}

/// Mel filterbank `[n_mels, n_fft/2 + 1]`.
pub fn mel_filterbank(n_fft: usize, sr: u32, n_mels: usize, fmin: f64, fmax: f64) -> Array2<f32> {
    let n_freqs = n_fft / 2 + 1;
    let mel_min = hz_to_mel_slaney(fmin);
    let mel_max = hz_to_mel_slaney(fmax);

    let hz_pts: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64)
        .map(mel_to_hz_slaney)
        .collect();
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * (sr as f64 / 2.0) / (n_freqs - 1).max(1) as f64)
        .collect();

    let mut filters = Array2::<f32>::zeros((n_mels, n_freqs));
    for m in 0..n_mels {
        let lower = hz_pts[m];
        let center = hz_pts[m + 1];
        let upper = hz_pts[m + 2];
        let down_denom = (center - lower).max(1e-10);
        let up_denom = (upper - center).max(1e-10);
        let enorm = 2.0 / (upper - lower).max(1e-10);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / down_denom;
            let falling = (upper - freq) / up_denom;
            let w = rising.min(falling).max(0.0);
            filters[[m, k]] = (w * enorm) as f32;
        }
    }
    filters
}

/// Orthonormal DCT-II basis, first `n_out` rows of an `n_in`-point transform.
///
/// Row `k` is `s_k · cos(π k (2n + 1) / 2N)` with `s_0 = √(1/N)` and
/// `s_k = √(2/N)` otherwise.
pub fn dct_ortho_matrix(n_out: usize, n_in: usize) -> Array2<f32> {
    use std::f64::consts::PI;
    let n = n_in as f64;
    Array2::from_shape_fn((n_out, n_in), |(k, i)| {
        let scale = if k == 0 {
            (1.0 / n).sqrt()
        } else {
            (2.0 / n).sqrt()
        };
        (scale * (PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos()) as f32
    })
}

pub fn hz_to_mel_slaney(hz: f64) -> f64 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp; // 15
    let logstep = (6.4_f64).ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

pub fn mel_to_hz_slaney(mel: f64) -> f64 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp; // 15
    let logstep = (6.4_f64).ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn slaney_scale_round_trips() {
        for hz in [0.0, 250.0, 999.0, 1_000.0, 4_000.0, 8_000.0] {
            assert_abs_diff_eq!(mel_to_hz_slaney(hz_to_mel_slaney(hz)), hz, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(hz_to_mel_slaney(1_000.0), 15.0, epsilon = 1e-12);
    }

    #[test]
    fn hann_window_is_periodic() {
        let w = hann_window(512);
        assert_eq!(w.len(), 512);
        assert_eq!(w[0], 0.0);
        assert_abs_diff_eq!(w[256], 1.0, epsilon = 1e-6);
        // Periodic: w[1] == w[511].
        assert_abs_diff_eq!(w[1], w[511], epsilon = 1e-7);
    }

    #[test]
    fn filterbank_shape_and_non_negative() {
        let fb = mel_filterbank(512, 16_000, 128, 0.0, 8_000.0);
        assert_eq!(fb.dim(), (128, 257));
        assert!(fb.iter().all(|&v| v >= 0.0));
        // Every band picks up some energy.
        for row in fb.rows() {
            assert!(row.sum() > 0.0);
        }
    }

    #[test]
    fn dct_rows_are_orthonormal() {
        let d = dct_ortho_matrix(40, 128);
        for a in 0..40 {
            for b in 0..40 {
                let dot: f32 = d.row(a).dot(&d.row(b));
                let expected = if a == b { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(dot, expected, epsilon = 1e-4);
            }
        }
    }
}
