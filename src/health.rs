use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::state::{AppMetrics, AppState};
use crate::vision::detector::DetectorStatus;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let active_sessions = state.sessions.active_session_count();
    let pipeline = state.pipeline.status();

    let detectors = DetectorStatus::from_models(
        state.detector.models(),
        &config.models.stone_model,
        &config.models.gold_model,
        &config.models.acid_model,
    );

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "touchstone-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "active_sessions": active_sessions,
            "active_connections": metrics.active_connections
        },
        "memory": get_memory_info(),
        "models": {
            "detectors": detectors,
            "classifier": {
                "loaded": state.classifier.is_some(),
                "name": state.classifier.as_ref().map(|c| c.name().to_string())
            }
        },
        "pipeline": {
            "running": pipeline.running,
            "device": pipeline.device,
            "camera_index": pipeline.camera_index,
            "stage": pipeline.status.task
        },
        "system": get_system_status(&config, active_sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();
    let pipeline = state.pipeline.status();

    // counting stages locks every session
    let max_sessions = config.performance.max_concurrent_sessions;
    let sessions = {
        let state = state.clone();
        web::block(move || state.sessions.summary(max_sessions))
            .await
            .map_err(|e| AppError::Internal(format!("Blocking task failed: {}", e)))?
    };

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "active_connections": metrics.active_connections,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "sessions": sessions,
        "pipeline": {
            "frames_captured": pipeline.frames_captured,
            "frames_published": pipeline.frames_published,
            "dropped_frames": pipeline.dropped_frames,
            "dropped_results": pipeline.dropped_results
        },
        "memory": get_memory_info()
    })))
}

fn error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(config: &AppConfig, active_sessions: usize) -> serde_json::Value {
    let max_sessions = config.performance.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_sessions_and_pipeline() {
        let state = test_state(AppConfig::default());
        state.sessions.create_session(None, None, &state.get_config()).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["metrics"]["active_sessions"], 1);
        assert_eq!(body["pipeline"]["running"], false);
        assert_eq!(body["pipeline"]["stage"], "rubbing");
        assert_eq!(body["models"]["classifier"]["loaded"], false);
    }

    #[actix_web::test]
    async fn test_metrics_counts_session_stages() {
        let state = test_state(AppConfig::default());
        state.sessions.create_session(None, None, &state.get_config()).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
        assert_eq!(body["sessions"]["totalSessions"], 1);
        assert_eq!(body["sessions"]["stageCounts"]["rubbing"], 1);
        assert_eq!(body["pipeline"]["frames_captured"], 0);
    }
}
