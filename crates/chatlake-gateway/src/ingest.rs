//! Background half of the ingestion pipe: the write worker draining the
//! webhook queue, and the periodic probe keeping `log_writable` honest.
//!
//! Appends run under `spawn_blocking` — the day-log writer takes an advisory
//! lock and does synchronous file I/O, neither of which belongs on the event
//! loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chatlake_core::config::{HEALTH_PROBE_INTERVAL_SECS, HEALTH_PROBE_TIMEOUT_MS};
use chatlake_core::types::RawDelivery;
use chatlake_lake::rawlog::DayLogWriter;

/// Drain the webhook queue until every sender is gone. Failed appends are
/// already reflected in `WriterHealth`; the delivery itself is lost only in
/// the degraded cases the health surface reports.
pub async fn run_writer(mut rx: mpsc::Receiver<RawDelivery>, writer: Arc<DayLogWriter>) {
    info!("ingest write worker started");
    while let Some(delivery) = rx.recv().await {
        let writer = writer.clone();
        let result = tokio::task::spawn_blocking(move || writer.append(&delivery)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "delivery append failed"),
            Err(e) => error!(error = %e, "append task panicked"),
        }
    }
    info!("ingest write worker stopped");
}

/// Periodic probe-write loop. A probe that blocks past its budget counts as
/// a failure — that is exactly the quiesced-filesystem case the probe
/// exists to catch.
pub async fn run_probe(writer: Arc<DayLogWriter>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(HEALTH_PROBE_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let probe_writer = writer.clone();
                let probe = tokio::task::spawn_blocking(move || probe_writer.probe());
                match tokio::time::timeout(Duration::from_millis(HEALTH_PROBE_TIMEOUT_MS), probe).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => warn!(error = %e, "probe-write failed"),
                    Ok(Err(e)) => error!(error = %e, "probe task panicked"),
                    Err(_) => {
                        warn!("probe-write exceeded its budget");
                        writer.health().set_unwritable("probe-write timed out");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("probe loop stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn worker_appends_queued_deliveries() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = Arc::new(DayLogWriter::new(tmp.path(), Duration::from_secs(5)));
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_writer(rx, writer.clone()));

        tx.send(RawDelivery {
            received_at: "2026-01-23T02:00:00Z".parse().unwrap(),
            client_addr: "10.0.0.1".to_string(),
            headers: vec![],
            body: br#"{"msg_id":"m1"}"#.to_vec(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let day_log = tmp.path().join("2026-01-23.jsonl");
        let content = std::fs::read_to_string(day_log).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains(r#""msg_id":"m1""#));
        assert_eq!(writer.health().message_count(), 1);
    }

    #[tokio::test]
    async fn probe_loop_marks_health_and_stops_on_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = Arc::new(DayLogWriter::new(tmp.path(), Duration::from_secs(5)));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_probe(writer.clone(), shutdown.clone()));

        // First tick fires immediately; give it a moment to run.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(writer.health().is_writable());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
