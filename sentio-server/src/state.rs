//! Shared server state.
//!
//! `AppState` is cloned into every axum handler through the `State`
//! extractor; all fields are cheap `Arc` handles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sentio_core::{DiagnosticsSnapshot, SentioEngine};
use serde::Serialize;

use crate::settings::ServerSettings;

#[derive(Clone)]
pub struct AppState {
    /// Loaded once in `main`, shared read-only by every request.
    pub engine: Arc<SentioEngine>,
    pub settings: Arc<ServerSettings>,
    pub started_at: DateTime<Utc>,
    /// Uploads refused before reaching the engine.
    pub rejected_uploads: Arc<AtomicUsize>,
    /// Rolling end-to-end latency of `/predict/`, upload write included.
    pub predict_latency: Arc<Mutex<LatencyWindow>>,
}

impl AppState {
    pub fn new(engine: Arc<SentioEngine>, settings: ServerSettings) -> Self {
        Self {
            engine,
            settings: Arc::new(settings),
            started_at: Utc::now(),
            rejected_uploads: Arc::new(AtomicUsize::new(0)),
            predict_latency: Arc::new(Mutex::new(LatencyWindow::default())),
        }
    }

    pub fn health(&self) -> HealthSnapshot {
        let now = Utc::now();
        HealthSnapshot {
            status: "ok",
            backend: self.engine.backend_name(),
            model_path: self.engine.config().model_path.display().to_string(),
            started_at: self.started_at.to_rfc3339(),
            uptime_secs: (now - self.started_at).num_seconds().max(0),
            rejected_uploads: self.rejected_uploads.load(Ordering::Relaxed),
            pipeline: self.engine.diagnostics_snapshot(),
            predict_latency_ms: self.predict_latency.lock().snapshot(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub backend: &'static str,
    pub model_path: String,
    pub started_at: String,
    pub uptime_secs: i64,
    pub rejected_uploads: usize,
    pub pipeline: DiagnosticsSnapshot,
    pub predict_latency_ms: LatencySnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    pub count: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

/// Last `cap` samples for percentiles; count/sum/max cover the whole run.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    cap: usize,
    count: usize,
    sum_ms: f64,
    max_ms: f64,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::with_capacity(512)
    }
}

impl LatencyWindow {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
            count: 0,
            sum_ms: 0.0,
            max_ms: 0.0,
        }
    }

    pub fn record(&mut self, elapsed_ms: f64) {
        let v = if elapsed_ms.is_finite() {
            elapsed_ms.max(0.0)
        } else {
            0.0
        };
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(v);
        self.count = self.count.saturating_add(1);
        self.sum_ms += v;
        self.max_ms = self.max_ms.max(v);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        if self.samples.is_empty() {
            return LatencySnapshot {
                count: 0,
                mean_ms: 0.0,
                p50_ms: 0.0,
                p95_ms: 0.0,
                max_ms: 0.0,
            };
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let percentile = |p: f64| -> f64 {
            let n = sorted.len();
            let idx = ((n - 1) as f64 * p).round() as usize;
            sorted[idx.min(n - 1)]
        };

        LatencySnapshot {
            count: self.count,
            mean_ms: self.sum_ms / self.count as f64,
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            max_ms: self.max_ms,
        }
    }
}
