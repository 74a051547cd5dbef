//! HTTP routes.
//!
//! | Route            | Handler      |
//! |------------------|--------------|
//! | `POST /predict/` | [`predict`]  |
//! | `GET /emotions/` | [`emotions`] |
//! | `GET /health`    | [`health`]   |
//!
//! Errors are returned as `{"detail": "<message>"}`.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sentio_core::{
    audio::AudioFormat, Emotion, Prediction, PredictionResult, SentioEngine, SentioError,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::state::{AppState, HealthSnapshot};

/// Multipart field carrying the uploaded clip.
pub const UPLOAD_FIELD: &str = "audio_file";

const INVALID_FORMAT: &str = "Invalid file format. Only .wav and .mp3 are supported.";

pub fn router(state: AppState) -> Router {
    let body_limit = state.settings.max_upload_bytes;
    Router::new()
        .route("/predict/", post(predict))
        .route("/emotions/", get(emotions))
        .route("/health", get(health))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self {
            status: e.status(),
            detail: e.body_text(),
        }
    }
}

impl From<SentioError> for ApiError {
    fn from(e: SentioError) -> Self {
        let cause = e.root_cause();
        match &e {
            SentioError::UnsupportedFormat(_) => Self::bad_request(INVALID_FORMAT),
            _ if e.is_client_error() => {
                Self::bad_request(format!("Could not decode audio: {cause}"))
            }
            _ => Self::internal(format!("Prediction failed: {cause}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

struct Upload {
    file_name: String,
    bytes: Vec<u8>,
}

/// First `audio_file` field of the form; other fields are skipped.
async fn read_upload(multipart: &mut Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await?.to_vec();
        return Ok(Upload { file_name, bytes });
    }
    Err(ApiError::bad_request(format!(
        "Missing multipart field `{UPLOAD_FIELD}`"
    )))
}

/// Spool the upload to a temp file carrying the clip's extension and classify
/// it. The temp file is removed when this returns, on every path.
fn classify_upload(
    engine: &SentioEngine,
    format: AudioFormat,
    bytes: &[u8],
) -> sentio_core::Result<Prediction> {
    let suffix = match format {
        AudioFormat::Wav => ".wav",
        AudioFormat::Mp3 => ".mp3",
    };
    let mut tmp = tempfile::Builder::new()
        .prefix("sentio-upload-")
        .suffix(suffix)
        .tempfile()?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    engine.predict_file(tmp.path())
}

pub async fn predict(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<PredictionResult>, ApiError> {
    let started = Instant::now();

    let upload = match read_upload(&mut multipart).await {
        Ok(upload) => upload,
        Err(e) => {
            state.rejected_uploads.fetch_add(1, Ordering::Relaxed);
            warn!(detail = %e.detail, "malformed upload");
            return Err(e);
        }
    };
    let format = match AudioFormat::from_path(Path::new(&upload.file_name)) {
        Ok(format) => format,
        Err(e) => {
            state.rejected_uploads.fetch_add(1, Ordering::Relaxed);
            info!(file = %upload.file_name, "rejected upload extension");
            return Err(e.into());
        }
    };

    let engine = Arc::clone(&state.engine);
    let bytes = upload.bytes;
    let outcome = tokio::task::spawn_blocking(move || classify_upload(&engine, format, &bytes))
        .await
        .map_err(|e| {
            error!(error = %e, "prediction worker panicked");
            ApiError::internal(format!("Prediction failed: {e}"))
        })?;

    let prediction = outcome.map_err(ApiError::from)?;
    state
        .predict_latency
        .lock()
        .record(started.elapsed().as_secs_f64() * 1000.0);
    Ok(Json(prediction.result()))
}

pub async fn emotions() -> Json<&'static [Emotion]> {
    Json(SentioEngine::emotions())
}

pub async fn health(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(state.health())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ServerSettings;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use sentio_core::{
        model::Logits, ClassifierBackend, EngineConfig, ModelHandle, StubClassifier,
    };
    use serde_json::Value;
    use std::io::Cursor;
    use tower::ServiceExt;

    const BOUNDARY: &str = "sentio-test-boundary";

    struct FailingBackend;

    impl ClassifierBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn forward(&self, _features: ndarray::ArrayView2<f32>) -> sentio_core::Result<Logits> {
            Err(SentioError::Inference("backend exploded".into()))
        }
    }

    fn state_with(model: ModelHandle, settings: ServerSettings) -> AppState {
        let engine = SentioEngine::with_backend(EngineConfig::default(), model);
        AppState::new(Arc::new(engine), settings)
    }

    fn stub_state() -> AppState {
        state_with(
            ModelHandle::new(StubClassifier::favoring(Emotion::Happy.index())),
            ServerSettings::default(),
        )
    }

    fn wav_bytes(seconds: f32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            let n = (seconds * 16_000.0) as usize;
            for i in 0..n {
                let t = i as f32 / 16_000.0;
                let v = 0.3 * (2.0 * std::f32::consts::PI * 220.0 * t).sin();
                writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn multipart_request(field: &str, file_name: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; \
             filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/predict/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(state: AppState, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router(state).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn predict_returns_emotion_and_confidence() {
        let state = stub_state();
        let req = multipart_request(UPLOAD_FIELD, "clip.wav", &wav_bytes(3.0));
        let (status, json) = send(state.clone(), req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["emotion"], "happy");
        let confidence = json["confidence"].as_f64().unwrap();
        assert!(confidence > 0.5 && confidence <= 1.0);
        assert_eq!(json.as_object().unwrap().len(), 2);
        assert_eq!(state.health().predict_latency_ms.count, 1);
    }

    #[tokio::test]
    async fn extension_match_is_case_sensitive() {
        let state = stub_state();
        let req = multipart_request(UPLOAD_FIELD, "CLIP.WAV", &wav_bytes(1.0));
        let (status, json) = send(state.clone(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["detail"], INVALID_FORMAT);
        assert_eq!(state.health().rejected_uploads, 1);

        let req = multipart_request(UPLOAD_FIELD, ".wav", &wav_bytes(1.0));
        let (status, _) = send(state, req).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn text_upload_is_rejected_with_detail() {
        let state = stub_state();
        let req = multipart_request(UPLOAD_FIELD, "notes.txt", b"hello");
        let (status, json) = send(state.clone(), req).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["detail"], INVALID_FORMAT);
        assert_eq!(state.health().rejected_uploads, 1);
        assert_eq!(state.engine.diagnostics_snapshot().requests, 0);
    }

    #[tokio::test]
    async fn missing_field_is_bad_request() {
        let req = multipart_request("file", "clip.wav", &wav_bytes(1.0));
        let (status, json) = send(stub_state(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].as_str().unwrap().contains(UPLOAD_FIELD));
    }

    #[tokio::test]
    async fn undecodable_audio_is_bad_request() {
        let req = multipart_request(UPLOAD_FIELD, "clip.wav", b"RIFF\x10\x00\x00\x00WAVEjunk");
        let (status, json) = send(stub_state(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].as_str().unwrap().starts_with("Could not decode audio"));
    }

    #[tokio::test]
    async fn backend_failure_is_internal_error() {
        let state = state_with(ModelHandle::new(FailingBackend), ServerSettings::default());
        let req = multipart_request(UPLOAD_FIELD, "clip.wav", &wav_bytes(1.0));
        let (status, json) = send(state.clone(), req).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let detail = json["detail"].as_str().unwrap();
        assert!(detail.starts_with("Prediction failed: "), "{detail}");
        assert!(detail.contains("backend exploded"));
        assert_eq!(state.engine.diagnostics_snapshot().failures, 1);
    }

    #[tokio::test]
    async fn oversized_upload_is_refused() {
        let settings = ServerSettings {
            max_upload_bytes: 1024,
            ..ServerSettings::default()
        };
        let state = state_with(ModelHandle::new(StubClassifier::default()), settings);
        let req = multipart_request(UPLOAD_FIELD, "clip.wav", &wav_bytes(1.0));
        let (status, _) = send(state, req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn emotions_lists_labels_in_order() {
        let req = Request::builder()
            .uri("/emotions/")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(stub_state(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json,
            serde_json::json!([
                "angry", "calm", "disgust", "fearful", "happy", "neutral", "sad", "surprised"
            ])
        );
    }

    #[tokio::test]
    async fn health_reports_backend_and_counters() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, json) = send(stub_state(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["backend"], "stub");
        assert_eq!(json["pipeline"]["requests"], 0);
        assert!(json["uptimeSecs"].as_i64().unwrap() >= 0);
    }

    #[tokio::test]
    async fn cors_allows_any_origin() {
        let req = Request::builder()
            .uri("/emotions/")
            .header(header::ORIGIN, "http://localhost:3000")
            .body(Body::empty())
            .unwrap();
        let resp = router(stub_state()).oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }
}
