//! Fixed-length time axis for the classifier input.

use ndarray::{s, Array2};

/// Frames the classifier consumes per clip.
pub const TARGET_FRAMES: usize = 184;

/// Resizes feature matrices to a fixed number of frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameNormalizer {
    target_frames: usize,
}

impl Default for FrameNormalizer {
    fn default() -> Self {
        Self::new(TARGET_FRAMES)
    }
}

impl FrameNormalizer {
    pub fn new(target_frames: usize) -> Self {
        Self { target_frames }
    }

    pub fn target_frames(&self) -> usize {
        self.target_frames
    }

    pub fn normalize(&self, features: &Array2<f32>) -> Array2<f32> {
        pad_or_truncate(features, self.target_frames)
    }
}

/// Keep the first `target` rows of a `[frames, coeffs]` matrix, appending
/// zero rows when there are fewer.
pub fn pad_or_truncate(features: &Array2<f32>, target: usize) -> Array2<f32> {
    let (frames, coeffs) = features.dim();
    let keep = frames.min(target);
    let mut out = Array2::<f32>::zeros((target, coeffs));
    out.slice_mut(s![..keep, ..])
        .assign(&features.slice(s![..keep, ..]));
    out
}
