//! # Application State
//!
//! Everything a handler or websocket actor needs, assembled once in `main`
//! and handed to every actix worker through `web::Data`.
//!
//! ## Contents:
//! - **config**: current configuration, replaceable at runtime through `PUT /config`
//! - **metrics**: request counters fed by `MetricsMiddleware`
//! - **detector / classifier**: the injected model handles
//! - **devices**: camera and microphone provider for the pipeline
//! - **sessions**: REST-created purity sessions
//! - **pipeline**: the single shared device-driven pipeline
//!
//! Cloning `AppState` clones `Arc`s only; every clone sees the same data.

use crate::audio::classifier::Classifier;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::pipeline::source::DeviceProvider;
use crate::pipeline::PipelineController;
use crate::session::manager::SessionManager;
use crate::session::SessionServices;
use crate::vision::detector::Detector;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
    pub detector: Arc<dyn Detector>,
    pub classifier: Option<Arc<dyn Classifier>>,
    pub devices: Arc<dyn DeviceProvider>,
    pub sessions: Arc<SessionManager>,
    pub pipeline: Arc<PipelineController>,
}

/// Request counters collected by the metrics middleware.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Open websocket connections.
    pub active_connections: u32,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint counters, keyed by `"METHOD /path"`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        detector: Arc<dyn Detector>,
        classifier: Option<Arc<dyn Classifier>>,
        devices: Arc<dyn DeviceProvider>,
    ) -> Self {
        let services = SessionServices {
            detector: Arc::clone(&detector),
            classifier: classifier.clone(),
        };
        let pipeline = PipelineController::new(Arc::clone(&devices), services.clone(), &config);

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            sessions: Arc::new(SessionManager::new(services)),
            pipeline: Arc::new(pipeline),
            detector,
            classifier,
            devices,
        }
    }

    /// Snapshot of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Sessions created afterwards pick up the new values; existing sessions and a
    /// running pipeline keep the values they were built with.
    pub fn update_config(&self, new_config: AppConfig) -> AppResult<()> {
        new_config
            .validate()
            .map_err(|e| AppError::ValidationError(e.to_string()))?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn session_services(&self) -> SessionServices {
        self.sessions.services().clone()
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner).error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        let metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        metric.request_count += 1;
        metric.total_duration_ms += duration_ms;
        if is_error {
            metric.error_count += 1;
        }
    }

    pub fn connection_opened(&self) {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner).active_connections += 1;
    }

    pub fn connection_closed(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_connections = metrics.active_connections.saturating_sub(1);
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.request_count as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}
