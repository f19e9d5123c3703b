use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — 200 while the periodic probe-write succeeds, 503 once the
/// log directory stops taking writes. Probe-driven, so a quiesced filesystem
/// is caught even with zero webhook traffic.
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<Value>) {
    let uptime = state.started.elapsed().as_secs();
    let message_count = state.health.message_count();

    if state.health.is_writable() {
        (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": uptime,
                "message_count": message_count,
                "log_writable": true,
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": uptime,
                "message_count": message_count,
                "log_writable": false,
                "error": state.health.last_error().unwrap_or_default(),
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatlake_core::config::ChatlakeConfig;
    use chatlake_core::types::RawDelivery;
    use chatlake_lake::rawlog::WriterHealth;
    use tokio::sync::mpsc;

    fn state(health: WriterHealth) -> Arc<AppState> {
        let (tx, _rx) = mpsc::channel::<RawDelivery>(1);
        Arc::new(AppState::new(ChatlakeConfig::default(), tx, health))
    }

    #[tokio::test]
    async fn healthy_by_default() {
        let (code, body) = health_handler(State(state(WriterHealth::default()))).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.0["status"], "healthy");
        assert_eq!(body.0["log_writable"], true);
        assert_eq!(body.0["message_count"], 0);
    }

    #[tokio::test]
    async fn degraded_writer_reports_503() {
        let health = WriterHealth::default();
        health.set_unwritable("disk full");
        let (code, body) = health_handler(State(state(health))).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.0["status"], "unhealthy");
        assert_eq!(body.0["log_writable"], false);
        assert_eq!(body.0["error"], "disk full");
    }
}
