use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use chatlake_core::config::ChatlakeConfig;
use chatlake_core::types::RawDelivery;
use chatlake_lake::rawlog::WriterHealth;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: ChatlakeConfig,
    /// Queue into the background write worker. The webhook handler never
    /// touches the filesystem itself.
    pub ingest_tx: mpsc::Sender<RawDelivery>,
    pub health: WriterHealth,
    pub started: Instant,
}

impl AppState {
    pub fn new(
        config: ChatlakeConfig,
        ingest_tx: mpsc::Sender<RawDelivery>,
        health: WriterHealth,
    ) -> Self {
        Self {
            config,
            ingest_tx,
            health,
            started: Instant::now(),
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook/wechat", post(crate::http::webhook::webhook_handler))
        .route("/health", get(crate::http::health::health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
