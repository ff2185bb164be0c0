use std::sync::Arc;

use common::action::ServiceName;
use common::auth::JwtVerifier;
use common::cache::{JsonStore, RedisCache};
use common::config::get_config;
use common::metadata::PostgrestStore;
use common::transport::{spawn_consumers, ConsumerSettings, RedisTransport, StreamNames};
use common::ws::ConnectionRegistry;
use ingestion::{ingestion_routes, IngestionPipeline, IngestionState, TaskStore};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vector_index::QdrantIndex;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()))
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .ok();

    if let Err(err) = run().await {
        error!(error = %err, "ingestion failed to start");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = get_config()?;
    let jwt_secret = config
        .jwt_secret
        .clone()
        .ok_or("JWT_SECRET is required for the ingestion API")?;

    let streams = StreamNames::new(&config.stream_prefix, &config.environment);
    let transport = RedisTransport::connect(
        &config.redis_url,
        streams,
        config.transport_max_retries,
    )
    .await?;
    let cache = RedisCache::new(transport.connection(), &config.stream_prefix);

    let store = Arc::new(PostgrestStore::new(
        &config.supabase_url,
        &config.supabase_anon_key,
        &config.service_role_key,
    ));
    let index = Arc::new(QdrantIndex::connect(
        &config.qdrant_url,
        config.qdrant_api_key.clone(),
        &config.vector_collection,
        1536,
    )?);
    vector_index::DocumentIndex::ensure_ready(index.as_ref()).await?;

    let ws = Arc::new(ConnectionRegistry::new());
    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::new(transport.clone()),
        TaskStore::new(JsonStore::new(Some(cache)), config.task_state_ttl_secs),
        index,
        store.clone(),
        ws.clone(),
    ));

    // The main stream carries stream-driven ingest requests; the callback
    // stream carries the extraction and embedding stage results.
    spawn_consumers(
        transport.clone(),
        ConsumerSettings::main(&transport, ServiceName::Ingestion, config.consume_block_ms),
        pipeline.clone(),
        config.worker_count,
    )
    .await?;
    spawn_consumers(
        transport.clone(),
        ConsumerSettings::callbacks(&transport, ServiceName::Ingestion, config.consume_block_ms),
        pipeline.clone(),
        config.worker_count,
    )
    .await?;

    let state = IngestionState {
        pipeline,
        store,
        verifier: Arc::new(JwtVerifier::new(&jwt_secret)),
        ws,
        public_base_url: config.public_base_url.clone(),
        upload_dir: config.upload_dir.clone().into(),
    };
    let app = ingestion_routes(state);

    let address = format!("0.0.0.0:{}", config.ingestion_port);
    info!(%address, "ingestion api listening");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            std::process::exit(130);
        }
    }
    Ok(())
}
