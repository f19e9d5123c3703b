use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chatlake_core::config::{ChatlakeConfig, INGEST_QUEUE_DEPTH};
use chatlake_lake::rawlog::DayLogWriter;
use chatlake_lake::schema::SchemaRegistry;
use chatlake_meta::MetadataStore;

mod app;
mod http;
mod ingest;
mod jobs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatlake_gateway=info,tower_http=debug".into()),
        )
        .init();

    // load config: CHATLAKE_CONFIG path > ./chatlake.toml > defaults
    let config_path = std::env::var("CHATLAKE_CONFIG").ok();
    let config = ChatlakeConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        ChatlakeConfig::default()
    });

    let writer = Arc::new(DayLogWriter::new(
        &config.raw_log_dir,
        Duration::from_secs(config.locks.ingest_timeout_secs),
    ));
    let meta = Arc::new(MetadataStore::open(
        Path::new(&config.metadata_db_path),
        Duration::from_secs(config.locks.job_timeout_secs),
    )?);
    mirror_schemas(&meta)?;

    let shutdown = CancellationToken::new();
    let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_QUEUE_DEPTH);
    tokio::spawn(ingest::run_writer(ingest_rx, writer.clone()));
    tokio::spawn(ingest::run_probe(writer.clone(), shutdown.clone()));

    if config.jobs.enabled {
        let daily = jobs::DailyJobs::new(config.clone(), writer.clone(), meta.clone());
        tokio::spawn(daily.run_loop(shutdown.clone()));
    }

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState::new(config, ingest_tx, writer.health()));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("chatlake gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    shutdown.cancel();

    Ok(())
}

/// Mirror the built-in dataset schemas into the metadata store so external
/// tooling can discover them without linking the lake crate.
fn mirror_schemas(meta: &MetadataStore) -> anyhow::Result<()> {
    let registry = SchemaRegistry::with_builtin();
    for (name, version, schema) in registry.entries() {
        let fields: Vec<serde_json::Value> = schema
            .fields()
            .iter()
            .map(|f| {
                serde_json::json!({
                    "name": f.name(),
                    "data_type": format!("{:?}", f.data_type()),
                    "nullable": f.is_nullable(),
                })
            })
            .collect();
        let schema_json = serde_json::to_string(&serde_json::json!({ "fields": fields }))?;
        meta.mirror_schema_version(name, version, &schema_json)?;
    }
    Ok(())
}
