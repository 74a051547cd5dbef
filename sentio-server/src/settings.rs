//! Persistent server settings (JSON file in the app data directory).

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use sentio_core::{BackendKind, EngineConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;
const MIN_UPLOAD_BYTES: usize = 64 * 1024;
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address, `host:port`.
    pub bind: String,
    pub model_path: PathBuf,
    pub backend: BackendKind,
    /// Request body cap for uploads.
    pub max_upload_bytes: usize,
    pub warm_up: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            bind: DEFAULT_BIND.into(),
            model_path: engine.model_path,
            backend: engine.backend,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            warm_up: true,
        }
    }
}

impl ServerSettings {
    pub fn normalize(&mut self) {
        self.bind = normalize_bind(&self.bind);
        if self.model_path.as_os_str().is_empty() {
            self.model_path = EngineConfig::default().model_path;
        }
        self.max_upload_bytes = self.max_upload_bytes.clamp(MIN_UPLOAD_BYTES, MAX_UPLOAD_BYTES);
    }

    /// Env vars win over the settings file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("SENTIO_BIND") {
            self.bind = bind;
        }
        if let Ok(path) = std::env::var("SENTIO_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.model_path = PathBuf::from(path.trim());
            }
        }
        if let Ok(raw) = std::env::var("SENTIO_BACKEND") {
            match raw.parse() {
                Ok(kind) => self.backend = kind,
                Err(e) => warn!("ignoring SENTIO_BACKEND: {e}"),
            }
        }
        if let Ok(raw) = std::env::var("SENTIO_MAX_UPLOAD_BYTES") {
            match raw.trim().parse::<usize>() {
                Ok(n) => self.max_upload_bytes = n,
                Err(_) => warn!(value = %raw, "ignoring SENTIO_MAX_UPLOAD_BYTES"),
            }
        }
        self.normalize();
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address {:?}: {e}", self.bind))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            model_path: self.model_path.clone(),
            backend: self.backend,
            ..EngineConfig::default()
        }
    }
}

/// Bare ports become `0.0.0.0:<port>`; blanks fall back to the default.
pub fn normalize_bind(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT_BIND.into();
    }
    if let Ok(port) = trimmed.trim_start_matches(':').parse::<u16>() {
        return format!("0.0.0.0:{port}");
    }
    trimmed.into()
}

pub fn default_settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("SENTIO_SETTINGS") {
        return PathBuf::from(path);
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Sentio")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("sentio")
            .join("settings.json")
    }
}

/// Missing or unparsable files yield defaults.
pub fn load_settings(path: &Path) -> ServerSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<ServerSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "settings file unreadable, using defaults");
            ServerSettings::default()
        }),
        Err(_) => ServerSettings::default(),
    };
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &ServerSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("nope.json"));
        assert_eq!(settings, ServerSettings::default());
        assert_eq!(settings.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"bind": "8080", "backend": "onnx"}"#).unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.bind, "0.0.0.0:8080");
        assert_eq!(settings.backend, BackendKind::Onnx);
        assert!(settings.warm_up);
        assert_eq!(settings.model_path, EngineConfig::default().model_path);
    }

    #[test]
    fn garbage_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(load_settings(&path), ServerSettings::default());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = ServerSettings {
            bind: "127.0.0.1:9000".into(),
            model_path: PathBuf::from("/srv/models/crnn.safetensors"),
            max_upload_bytes: 1024 * 1024,
            ..ServerSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"maxUploadBytes\""));
    }

    #[test]
    fn normalize_clamps_upload_limit_and_bind() {
        let mut settings = ServerSettings {
            bind: "  ".into(),
            max_upload_bytes: 1,
            model_path: PathBuf::new(),
            ..ServerSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.bind, DEFAULT_BIND);
        assert_eq!(settings.max_upload_bytes, MIN_UPLOAD_BYTES);
        assert!(!settings.model_path.as_os_str().is_empty());
        assert!(settings.bind_addr().is_ok());
    }

    #[test]
    fn engine_config_carries_model_and_backend() {
        let settings = ServerSettings {
            model_path: PathBuf::from("m.onnx"),
            backend: BackendKind::Onnx,
            ..ServerSettings::default()
        };
        let config = settings.engine_config();
        assert_eq!(config.model_path, PathBuf::from("m.onnx"));
        assert_eq!(config.backend, BackendKind::Onnx);
        assert_eq!(config.target_frames, 184);
    }
}
