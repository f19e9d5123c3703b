//! Webhook ingress endpoint — POST /webhook/wechat.
//!
//! Accepts any body of any content-type and any size, acknowledges within
//! the second, and hands the delivery to the background writer. The source
//! never learns about internal failures: write problems surface through the
//! health endpoint, not this response. The only 500 is a pre-enqueue
//! failure (the queue is gone).

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::app::AppState;
use chatlake_core::types::RawDelivery;

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let delivery = RawDelivery {
        received_at: Utc::now(),
        client_addr: addr.ip().to_string(),
        headers: header_pairs(&headers),
        body: body.to_vec(),
    };

    debug!(request_id = %request_id, bytes = body.len(), client = %delivery.client_addr, "delivery received");

    // try_send keeps the handler under the response deadline; a full queue
    // falls back to an awaiting task so nothing is dropped.
    if let Err(err) = state.ingest_tx.try_send(delivery) {
        match err {
            tokio::sync::mpsc::error::TrySendError::Full(delivery) => {
                warn!(request_id = %request_id, "ingest queue full; write deferred");
                let tx = state.ingest_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(delivery).await;
                });
            }
            tokio::sync::mpsc::error::TrySendError::Closed(_) => {
                error!(request_id = %request_id, "ingest worker gone; cannot enqueue");
                return Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"status": "error", "request_id": request_id})),
                ));
            }
        }
    }

    Ok(Json(json!({"status": "ok", "request_id": request_id})))
}

/// Header pairs in arrival order, values decoded lossily.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}
