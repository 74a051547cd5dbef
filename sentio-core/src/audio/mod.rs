//! Audio loading: extension gate → decode → mono → 16 kHz → fixed window.
//!
//! ```text
//! clip.wav ──hound──┐
//!                   ├─► mono f32 @ native rate ─► RateConverter ─► [0.5 s, 3.5 s) window
//! clip.mp3 ─symphonia┘
//! ```
//!
//! The extension check runs before any byte of the file is read, so rejected
//! uploads never reach a decoder.

pub mod decode;
pub mod resample;
pub mod signal;

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;

use tracing::debug;

pub use signal::AudioSignal;

use crate::error::{Result, SentioError};

/// Sample rate the feature front end expects (Hz).
pub const TARGET_SAMPLE_RATE: u32 = 16_000;
/// Start of the analysed window, seconds into the decoded clip.
pub const WINDOW_START_SECS: f64 = 0.5;
/// End (exclusive) of the analysed window.
pub const WINDOW_END_SECS: f64 = 3.5;

/// Containers the loader accepts, keyed by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
}

impl AudioFormat {
    pub const EXTENSIONS: [&'static str; 2] = [".wav", ".mp3"];

    /// Classify a path or bare file name by its suffix.
    ///
    /// The match is a case-sensitive suffix test on the whole name, so
    /// `clip.WAV` is refused and a file literally named `.wav` is accepted.
    ///
    /// # Errors
    /// `SentioError::UnsupportedFormat` for any name not ending in `.wav` or
    /// `.mp3`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path.to_string_lossy();
        if name.ends_with(".wav") {
            Ok(Self::Wav)
        } else if name.ends_with(".mp3") {
            Ok(Self::Mp3)
        } else {
            Err(SentioError::UnsupportedFormat(format!(
                "{}: only .wav and .mp3 are supported",
                path.display()
            )))
        }
    }
}

/// Decodes files and cuts the fixed analysis window.
#[derive(Debug, Clone)]
pub struct AudioLoader {
    target_sample_rate: u32,
    window_start_secs: f64,
    window_end_secs: f64,
}

impl Default for AudioLoader {
    fn default() -> Self {
        Self::new(TARGET_SAMPLE_RATE, WINDOW_START_SECS, WINDOW_END_SECS)
    }
}

impl AudioLoader {
    pub fn new(target_sample_rate: u32, window_start_secs: f64, window_end_secs: f64) -> Self {
        Self {
            target_sample_rate,
            window_start_secs,
            window_end_secs,
        }
    }

    /// Window bounds in samples at the target rate: `[start, end)`.
    pub fn window_bounds(&self) -> (usize, usize) {
        let sr = self.target_sample_rate as f64;
        let start = (self.window_start_secs * sr) as usize;
        let end = (self.window_end_secs * sr) as usize;
        (start, end.max(start))
    }

    /// Number of samples in every windowed signal this loader returns.
    pub fn window_len(&self) -> usize {
        let (start, end) = self.window_bounds();
        end - start
    }

    /// Load a file from disk and return its analysis window.
    pub fn load(&self, path: &Path) -> Result<AudioSignal> {
        let format = AudioFormat::from_path(path)?;
        let file = File::open(path)?;
        let decoded = match format {
            AudioFormat::Wav => decode::decode_wav(BufReader::new(file))?,
            AudioFormat::Mp3 => decode::decode_mp3(file)?,
        };
        debug!(
            file = %path.display(),
            sample_rate = decoded.sample_rate,
            duration_secs = decoded.duration_secs(),
            "audio decoded"
        );
        self.window(decoded)
    }

    /// Load an in-memory upload. `file_name` only selects the decoder.
    pub fn load_bytes(&self, file_name: &str, bytes: Vec<u8>) -> Result<AudioSignal> {
        let format = AudioFormat::from_path(Path::new(file_name))?;
        let decoded = match format {
            AudioFormat::Wav => decode::decode_wav(Cursor::new(bytes))?,
            AudioFormat::Mp3 => decode::decode_mp3(Cursor::new(bytes))?,
        };
        self.window(decoded)
    }

    /// Resample an already-decoded mono signal and cut the window.
    pub fn window(&self, signal: AudioSignal) -> Result<AudioSignal> {
        let samples = if signal.sample_rate == self.target_sample_rate {
            signal.samples
        } else {
            resample::resample(&signal.samples, signal.sample_rate, self.target_sample_rate)?
        };
        let (start, end) = self.window_bounds();
        Ok(AudioSignal::new(
            extract_window(&samples, start, end),
            self.target_sample_rate,
        ))
    }
}

/// Copy `samples[start..end]`, zero-filling whatever lies past the signal.
pub fn extract_window(samples: &[f32], start: usize, end: usize) -> Vec<f32> {
    let len = end.saturating_sub(start);
    let mut out = Vec::with_capacity(len);
    let lo = start.min(samples.len());
    let hi = end.min(samples.len());
    out.extend_from_slice(&samples[lo..hi]);
    out.resize(len, 0.0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_gate_accepts_lowercase_suffixes() {
        assert_eq!(AudioFormat::from_path(Path::new("a.wav")).unwrap(), AudioFormat::Wav);
        assert_eq!(AudioFormat::from_path(Path::new("b.mp3")).unwrap(), AudioFormat::Mp3);
        assert_eq!(
            AudioFormat::from_path(Path::new("/tmp/x/clip.wav")).unwrap(),
            AudioFormat::Wav
        );
        assert_eq!(AudioFormat::from_path(Path::new(".wav")).unwrap(), AudioFormat::Wav);
    }

    #[test]
    fn extension_gate_rejects_everything_else() {
        for name in [
            "clip.txt",
            "clip",
            "clip.wav.txt",
            "clip.flac",
            "clip.WAV",
            "B.MP3",
            "clip.Wav",
            "clipwav",
        ] {
            assert!(
                matches!(
                    AudioFormat::from_path(Path::new(name)),
                    Err(SentioError::UnsupportedFormat(_))
                ),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn rejected_extension_never_touches_the_filesystem() {
        // The file does not exist: an IO error would mean decoding was attempted.
        let err = AudioLoader::default()
            .load(Path::new("/definitely/not/here/clip.txt"))
            .unwrap_err();
        assert!(matches!(err, SentioError::UnsupportedFormat(_)), "got {err:?}");
    }

    #[test]
    fn window_bounds_are_half_to_three_and_a_half_seconds() {
        let loader = AudioLoader::default();
        assert_eq!(loader.window_bounds(), (8_000, 56_000));
        assert_eq!(loader.window_len(), 48_000);
    }

    #[test]
    fn long_signal_is_cut_to_window() {
        let samples: Vec<f32> = (0..64_000).map(|i| i as f32).collect();
        let out = extract_window(&samples, 8_000, 56_000);
        assert_eq!(out.len(), 48_000);
        assert_eq!(out[0], 8_000.0);
        assert_eq!(out[47_999], 55_999.0);
    }

    #[test]
    fn short_signal_is_right_padded() {
        let samples = vec![1.0f32; 10_000];
        let out = extract_window(&samples, 8_000, 56_000);
        assert_eq!(out.len(), 48_000);
        assert!(out[..2_000].iter().all(|&v| v == 1.0));
        assert!(out[2_000..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn signal_shorter_than_window_start_is_all_zero() {
        let out = extract_window(&[0.3; 100], 8_000, 56_000);
        assert_eq!(out.len(), 48_000);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn window_resamples_before_cutting() {
        let loader = AudioLoader::default();
        let signal = AudioSignal::new(vec![0.0; 48_000 * 4], 48_000);
        let out = loader.window(signal).unwrap();
        assert_eq!(out.sample_rate, 16_000);
        assert_eq!(out.len(), 48_000);
    }

    #[test]
    fn empty_signal_becomes_silent_window() {
        let loader = AudioLoader::default();
        let out = loader.window(AudioSignal::new(Vec::new(), 16_000)).unwrap();
        assert_eq!(out.len(), 48_000);
        assert!(out.samples.iter().all(|&v| v == 0.0));
    }
}
