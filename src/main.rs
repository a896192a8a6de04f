//! # Touchstone Backend - Main Application Entry Point
//!
//! HTTP and websocket service for the two-stage touchstone gold purity test:
//! first the item is rubbed on the stone (confirmed visually and by sound),
//! then acid is applied and the acid detector reads the karat.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, `APP_` env vars)
//! - **state**: shared handles built once here and cloned into every worker
//! - **vision**: detectors, rubbing-motion analysis, acid reading, frame codec, overlay
//! - **audio**: ring buffer, preprocessing and the sliding-window rubbing classifier
//! - **confirmation**: the RUBBING → ACID → DONE stage machine
//! - **session**: one purity test in progress, plus the REST session manager
//! - **pipeline**: capture/process threads for local devices
//! - **handlers / websocket / health**: the HTTP surface
//! - **middleware / error**: request logging, metrics and JSON error responses

mod audio;
mod config;
mod confirmation;
mod error;
mod guard;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod session;
mod state;
mod vision;
mod websocket;

use crate::audio::classifier::{Classifier, DevicePreference, TimedClassifier, WaveCnnClassifier};
use crate::pipeline::source::{DeviceProvider, NoDevices, ReplayDevices};
use crate::vision::detector::{Detector, ModelRegistry, TimedDetector};
use crate::vision::remote::HttpDetector;
use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::config::AppConfig;
use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const MAX_JSON_BYTES: usize = 20 * 1024 * 1024;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting touchstone-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    // the blocking HTTP client cannot be built on the async runtime
    let detector_config = config.clone();
    let detector = tokio::task::spawn_blocking(move || build_detector(&detector_config))
        .await
        .context("Detector setup task failed")??;
    let classifier = build_classifier(&config)?;
    let devices = build_devices(&config);

    let app_state = AppState::new(config.clone(), detector, classifier, devices);
    spawn_session_cleanup(app_state.clone());

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .app_data(web::JsonConfig::default().limit(MAX_JSON_BYTES))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .service(web::scope("/api/v1").configure(handlers::routes))
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    let pipeline = Arc::clone(&app_state.pipeline);
    if let Err(e) = tokio::task::spawn_blocking(move || pipeline.stop()).await {
        error!("Pipeline shutdown failed: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter; defaults to `touchstone_backend=debug,actix_web=info`.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "touchstone_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Detector backends register here by model name; every call is bounded by
/// `models.call_timeout_ms`.
fn build_detector(config: &AppConfig) -> Result<Arc<dyn Detector>> {
    let Some(url) = config.models.detector_url() else {
        anyhow::bail!(
            "No detector backend configured; set models.detector_url (APP_MODELS__DETECTOR_URL) to the inference server"
        );
    };

    let models = config.models.detector_models();
    let backend: Arc<dyn Detector> = Arc::new(
        HttpDetector::new(url, models.clone(), config.models.call_timeout())
            .with_context(|| format!("Failed to build detector client for {}", url))?,
    );
    let registry = models
        .iter()
        .fold(ModelRegistry::new(), |registry, model| registry.with(model.clone(), Arc::clone(&backend)));

    info!(url, models = ?models, "Detector backend registered");
    Ok(Arc::new(TimedDetector::new(Arc::new(registry), config.models.call_timeout())))
}

fn build_classifier(config: &AppConfig) -> Result<Option<Arc<dyn Classifier>>> {
    let Some(path) = config.models.classifier_weights_path() else {
        warn!("No classifier weights configured; audio gating disabled");
        return Ok(None);
    };

    let preference: DevicePreference = config
        .models
        .compute_device
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let classifier = WaveCnnClassifier::from_safetensors(&path, preference)
        .with_context(|| format!("Failed to load classifier weights from {}", path.display()))?;

    info!(path = %path.display(), "Audio classifier loaded");
    Ok(Some(Arc::new(TimedClassifier::new(
        Arc::new(classifier),
        config.models.call_timeout(),
    ))))
}

fn build_devices(config: &AppConfig) -> Arc<dyn DeviceProvider> {
    match config.pipeline.replay_dir_path() {
        Some(dir) => {
            info!(dir = %dir.display(), fps = config.pipeline.replay_fps, "Using replay capture devices");
            Arc::new(ReplayDevices::new(dir, config.pipeline.replay_fps))
        }
        None => {
            info!("No capture devices configured; pipeline start will fail");
            Arc::new(NoDevices)
        }
    }
}

/// Evict REST sessions idle longer than `performance.session_max_age_seconds`.
fn spawn_session_cleanup(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            let max_idle = Duration::from_secs(state.get_config().performance.session_max_age_seconds);
            let sessions = Arc::clone(&state.sessions);
            if let Err(e) = tokio::task::spawn_blocking(move || sessions.cleanup_idle_sessions(max_idle)).await {
                error!("Session cleanup failed: {}", e);
            }
        }
    });
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
