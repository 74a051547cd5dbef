use thiserror::Error;

/// All errors produced by sentio-core.
#[derive(Debug, Error)]
pub enum SentioError {
    /// Extension or codec the loader does not accept. Rejected input.
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// The container was recognised but its data is corrupt or truncated.
    #[error("audio decode error: {0}")]
    AudioDecode(String),

    /// Parameter artifact unreadable or structurally mismatched. Fatal at startup.
    #[error("model load error: {0}")]
    ModelLoad(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("feature extraction error: {0}")]
    Feature(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    /// A pipeline stage failed; carries the stage's own error.
    #[error("prediction failed: {0}")]
    Prediction(#[source] Box<SentioError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SentioError {
    /// Wrap a stage failure. Already-wrapped errors are not nested twice.
    pub fn prediction(cause: SentioError) -> Self {
        match cause {
            wrapped @ SentioError::Prediction(_) => wrapped,
            other => SentioError::Prediction(Box::new(other)),
        }
    }

    /// The innermost error behind any `Prediction` wrapping.
    pub fn root_cause(&self) -> &SentioError {
        match self {
            SentioError::Prediction(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// `true` when the caller can fix the failure by sending different input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.root_cause(),
            SentioError::UnsupportedFormat(_) | SentioError::AudioDecode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SentioError>;
