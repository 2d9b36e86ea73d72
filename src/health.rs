use crate::config::AppConfig;
use crate::state::{AppState, ServiceMetrics};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "call-monitor-engine",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "calls": {
            "active": metrics.active_calls,
            "total": metrics.total_calls,
            "failed": metrics.failed_calls,
            "failure_rate": metrics.failure_rate()
        },
        "upstream": {
            "stream_url": config.upstream.stream_url,
            "keepalive_interval_secs": config.upstream.keepalive_interval_secs
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "calls": {
            "active": metrics.active_calls,
            "total": metrics.total_calls,
            "failed": metrics.failed_calls,
            "rejected": metrics.rejected_calls,
            "failure_rate": metrics.failure_rate(),
            "calls_per_hour": if uptime_seconds > 0 {
                metrics.total_calls as f64 * 3600.0 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "audio": {
            "decoded_chunks": metrics.decoded_chunks,
            "dropped_chunks": metrics.dropped_chunks,
            "drop_rate": metrics.drop_rate(),
            "turns_played": metrics.turns_played,
            "turns_skipped": metrics.turns_skipped
        },
        "transcript": {
            "lines_rendered": metrics.transcript_lines,
            "deferred_agent_finals": metrics.deferred_agent_finals
        },
        "memory": get_memory_info(),
        "limits": {
            "max_concurrent_calls": state.get_config().server.max_concurrent_calls
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
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

fn get_system_status(config: &AppConfig, metrics: &ServiceMetrics) -> serde_json::Value {
    let call_usage = metrics.active_calls as f64 / config.server.max_concurrent_calls.max(1) as f64;

    let status = if call_usage > 0.9 {
        "high_load"
    } else if call_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "call_usage_percent": (call_usage * 100.0).round(),
        "max_calls": config.server.max_concurrent_calls,
        "current_calls": metrics.active_calls,
        "load_warnings": if call_usage > 0.8 {
            vec!["High call usage - consider increasing server.max_concurrent_calls"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test as actix_test, App};

    #[actix_web::test]
    async fn test_health_reports_calls() {
        let state = AppState::new(AppConfig::default());
        state.try_begin_call(50);
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["calls"]["active"], 1);
        assert_eq!(body["system"]["status"], "normal");
    }

    #[test]
    fn test_load_status_thresholds() {
        let mut config = AppConfig::default();
        config.server.max_concurrent_calls = 10;
        let metrics = ServiceMetrics {
            active_calls: 10,
            ..Default::default()
        };
        let status = get_system_status(&config, &metrics);
        assert_eq!(status["status"], "high_load");
        assert_eq!(status["load_warnings"].as_array().unwrap().len(), 1);
    }
}
