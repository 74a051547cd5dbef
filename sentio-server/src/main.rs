//! Sentio HTTP service entry point.
//!
//! ```text
//! sentio [--settings <file.json>] [--write-settings]
//! ```
//!
//! Settings come from `settings.json` (see [`settings::default_settings_path`])
//! with `SENTIO_*` environment overrides applied on top. `--write-settings`
//! persists the effective settings and exits.

#![forbid(unsafe_code)]

mod routes;
mod settings;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use sentio_core::SentioEngine;
use tracing::{info, warn};

use settings::{default_settings_path, load_settings, save_settings};
use state::AppState;

const DEFAULT_LOG_FILTER: &str = "sentio=info,sentio_core=info,tower_http=info";

struct Args {
    settings_path: PathBuf,
    write_settings: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut settings_path = None;
    let mut write_settings = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--settings" => {
                let v = it.next().context("missing value for --settings")?;
                settings_path = Some(PathBuf::from(v));
            }
            "--write-settings" => write_settings = true,
            "--help" | "-h" => {
                println!("Usage: sentio [--settings <file.json>] [--write-settings]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    Ok(Args {
        settings_path: settings_path.unwrap_or_else(default_settings_path),
        write_settings,
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = parse_args()?;

    // ── Settings ──────────────────────────────────────────────────────────
    let mut settings = load_settings(&args.settings_path);
    settings.apply_env_overrides();
    info!(
        settings_path = %args.settings_path.display(),
        bind = %settings.bind,
        model = %settings.model_path.display(),
        backend = ?settings.backend,
        max_upload_bytes = settings.max_upload_bytes,
        "settings loaded"
    );

    if args.write_settings {
        save_settings(&args.settings_path, &settings).with_context(|| {
            format!("failed to write settings to {}", args.settings_path.display())
        })?;
        info!(path = %args.settings_path.display(), "settings written");
        return Ok(());
    }

    // ── Engine ────────────────────────────────────────────────────────────
    let addr = settings.bind_addr()?;
    let engine = tokio::task::spawn_blocking({
        let config = settings.engine_config();
        let warm_up = settings.warm_up;
        move || -> sentio_core::Result<SentioEngine> {
            let engine = SentioEngine::new(config)?;
            if warm_up {
                engine.warm_up()?;
            }
            Ok(engine)
        }
    })
    .await
    .context("engine startup task failed")?
    .with_context(|| format!("failed to load classifier from {}", settings.model_path.display()))?;

    // ── HTTP ──────────────────────────────────────────────────────────────
    let state = AppState::new(Arc::new(engine), settings);
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Sentio listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Sentio stopped");
    Ok(())
}
