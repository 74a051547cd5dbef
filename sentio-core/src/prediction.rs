//! Wire types returned by the engine and serialised by the HTTP layer.
//!
//! | Type | JSON |
//! |------|------|
//! | `PredictionResult` | `{"emotion": "happy", "confidence": 0.8731}` |
//! | `Emotion::ALL` | `["angry", "calm", …, "surprised"]` |
//! | `Prediction` | result + `probabilities` + `timings` (camelCase) |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SentioError;
use crate::model::NUM_CLASSES;

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Emotion categories, in the classifier's output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Calm,
    Disgust,
    Fearful,
    Happy,
    Neutral,
    Sad,
    Surprised,
}

impl Emotion {
    /// Every label, index-aligned with the logits.
    pub const ALL: [Emotion; NUM_CLASSES] = [
        Emotion::Angry,
        Emotion::Calm,
        Emotion::Disgust,
        Emotion::Fearful,
        Emotion::Happy,
        Emotion::Neutral,
        Emotion::Sad,
        Emotion::Surprised,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Calm => "calm",
            Emotion::Disgust => "disgust",
            Emotion::Fearful => "fearful",
            Emotion::Happy => "happy",
            Emotion::Neutral => "neutral",
            Emotion::Sad => "sad",
            Emotion::Surprised => "surprised",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = SentioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == lower)
            .ok_or_else(|| SentioError::Other(anyhow::anyhow!("unknown emotion label {s:?}")))
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// The public response body of `POST /predict/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub emotion: Emotion,
    /// Highest softmax probability, rounded to 4 decimal places.
    pub confidence: f64,
}

/// Probability assigned to one label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionScore {
    pub emotion: Emotion,
    pub probability: f32,
}

/// Wall-clock time spent in each pipeline stage, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimings {
    pub load_ms: f64,
    pub features_ms: f64,
    pub inference_ms: f64,
    pub total_ms: f64,
}

/// Full engine output: the result plus the distribution it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub emotion: Emotion,
    pub confidence: f64,
    /// All eight labels in `Emotion::ALL` order.
    pub probabilities: Vec<EmotionScore>,
    pub timings: StageTimings,
}

impl Prediction {
    pub fn result(&self) -> PredictionResult {
        PredictionResult {
            emotion: self.emotion,
            confidence: self.confidence,
        }
    }
}

impl From<Prediction> for PredictionResult {
    fn from(p: Prediction) -> Self {
        p.result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_in_fixed_order() {
        let json = serde_json::to_value(Emotion::ALL).expect("serialize labels");
        assert_eq!(
            json,
            serde_json::json!([
                "angry", "calm", "disgust", "fearful", "happy", "neutral", "sad", "surprised"
            ])
        );
        for (i, e) in Emotion::ALL.iter().enumerate() {
            assert_eq!(e.index(), i);
            assert_eq!(Emotion::from_index(i), Some(*e));
        }
        assert_eq!(Emotion::from_index(NUM_CLASSES), None);
    }

    #[test]
    fn prediction_result_serializes_to_two_fields() {
        let result = PredictionResult {
            emotion: Emotion::Happy,
            confidence: 0.8731,
        };
        let json = serde_json::to_string(&result).expect("serialize result");
        assert_eq!(json, r#"{"emotion":"happy","confidence":0.8731}"#);
    }

    #[test]
    fn emotion_parses_case_insensitively() {
        assert_eq!("Fearful".parse::<Emotion>().unwrap(), Emotion::Fearful);
        assert_eq!(" sad ".parse::<Emotion>().unwrap(), Emotion::Sad);
        assert!("bored".parse::<Emotion>().is_err());
    }

    #[test]
    fn emotion_serde_rejects_non_lowercase_values() {
        assert!(serde_json::from_str::<Emotion>(r#""Angry""#).is_err());
    }

    #[test]
    fn detailed_prediction_uses_camel_case() {
        let prediction = Prediction {
            emotion: Emotion::Calm,
            confidence: 0.5,
            probabilities: vec![EmotionScore {
                emotion: Emotion::Calm,
                probability: 0.5,
            }],
            timings: StageTimings {
                load_ms: 1.0,
                features_ms: 2.0,
                inference_ms: 3.0,
                total_ms: 6.0,
            },
        };
        let json = serde_json::to_value(&prediction).expect("serialize prediction");
        assert_eq!(json["timings"]["inferenceMs"], 3.0);
        assert_eq!(json["probabilities"][0]["emotion"], "calm");
        assert_eq!(PredictionResult::from(prediction).emotion, Emotion::Calm);
    }
}
