use std::sync::Arc;
use std::time::Duration;

use common::action::ServiceName;
use common::auth::JwtVerifier;
use common::cache::{JsonStore, RedisCache};
use common::config::get_config;
use common::metadata::PostgrestStore;
use common::transport::{spawn_consumers, ConsumerSettings, RedisTransport, StreamNames};
use common::ws::ConnectionRegistry;
use conversation::ConversationHandler;
use embedding::{EmbeddingHandler, OpenAiEmbedder};
use execution::{ExecutionHandler, HistoryStore};
use extraction::ExtractionHandler;
use ingestion::{ingestion_routes, IngestionPipeline, IngestionState, TaskStore};
use orchestrator::{
    chat_routes, ChatHandler, ConfigHandler, OrchestratorCallbacks, OrchestratorState,
    SessionHandler, StreamingSettings, WebSocketManager,
};
use query::{OpenAiChatProvider, QueryHandler};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vector_index::QdrantIndex;

/// Single-process deployment: every worker plus both HTTP front doors.
/// Useful for development; production runs the dedicated binaries.
#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()))
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok();

    if let Err(err) = run().await {
        error!(error = %err, "startup failed");
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
    let publisher = Arc::new(transport.clone());

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

    let block = config.consume_block_ms;
    let workers = config.worker_count;

    // Backend workers.
    let execution = Arc::new(ExecutionHandler::new(
        publisher.clone(),
        HistoryStore::new(JsonStore::new(Some(cache.clone()))),
        JsonStore::new(Some(cache.clone())),
        config.pending_ttl_secs,
    ));
    let query = Arc::new(QueryHandler::new(
        publisher.clone(),
        index.clone(),
        Arc::new(OpenAiChatProvider::new(
            &config.groq_api_key,
            &config.groq_base_url,
            Duration::from_secs(config.provider_timeout_secs),
        )),
        JsonStore::new(Some(cache.clone())),
        config.pending_ttl_secs,
    ));
    let extraction = Arc::new(ExtractionHandler::new());
    let embedding = Arc::new(EmbeddingHandler::new(Arc::new(OpenAiEmbedder::new(
        &config.openai_api_key,
        &config.openai_base_url,
    ))));
    let conversation = Arc::new(ConversationHandler::new(store.clone()));

    spawn_consumers(
        transport.clone(),
        ConsumerSettings::main(&transport, ServiceName::Execution, block),
        execution.clone(),
        workers,
    )
    .await?;
    spawn_consumers(
        transport.clone(),
        ConsumerSettings::callbacks(&transport, ServiceName::Execution, block),
        execution,
        workers,
    )
    .await?;
    spawn_consumers(
        transport.clone(),
        ConsumerSettings::main(&transport, ServiceName::Query, block),
        query.clone(),
        workers,
    )
    .await?;
    spawn_consumers(
        transport.clone(),
        ConsumerSettings::callbacks(&transport, ServiceName::Query, block),
        query,
        workers,
    )
    .await?;
    spawn_consumers(
        transport.clone(),
        ConsumerSettings::main(&transport, ServiceName::Extraction, block),
        extraction,
        workers,
    )
    .await?;
    spawn_consumers(
        transport.clone(),
        ConsumerSettings::main(&transport, ServiceName::Embedding, block),
        embedding,
        workers,
    )
    .await?;
    spawn_consumers(
        transport.clone(),
        ConsumerSettings::main(&transport, ServiceName::Conversation, block),
        conversation,
        workers,
    )
    .await?;

    // Ingestion pipeline + HTTP surface.
    let ingestion_ws = Arc::new(ConnectionRegistry::new());
    let pipeline = Arc::new(IngestionPipeline::new(
        publisher.clone(),
        TaskStore::new(
            JsonStore::new(Some(cache.clone())),
            config.task_state_ttl_secs,
        ),
        index,
        store.clone(),
        ingestion_ws.clone(),
    ));
    spawn_consumers(
        transport.clone(),
        ConsumerSettings::main(&transport, ServiceName::Ingestion, block),
        pipeline.clone(),
        workers,
    )
    .await?;
    spawn_consumers(
        transport.clone(),
        ConsumerSettings::callbacks(&transport, ServiceName::Ingestion, block),
        pipeline.clone(),
        workers,
    )
    .await?;

    let ingestion_app = ingestion_routes(IngestionState {
        pipeline,
        store: store.clone(),
        verifier: Arc::new(JwtVerifier::new(&jwt_secret)),
        ws: ingestion_ws,
        public_base_url: config.public_base_url.clone(),
        upload_dir: config.upload_dir.clone().into(),
    });

    // Orchestrator front door.
    let sessions = Arc::new(SessionHandler::new(
        Some(cache.clone()),
        Duration::from_secs(config.session_idle_timeout_secs),
    ));
    let configs = Arc::new(ConfigHandler::new(
        store,
        Some(cache),
        Duration::from_secs(config.agent_config_ttl_secs),
    ));
    let chat_ws = Arc::new(WebSocketManager::new());
    let chat = Arc::new(ChatHandler::new(
        sessions.clone(),
        configs.clone(),
        chat_ws.clone(),
        publisher.clone(),
    ));
    let callbacks = Arc::new(OrchestratorCallbacks::new(
        sessions.clone(),
        chat_ws.clone(),
        StreamingSettings {
            enabled: config.pseudo_streaming_enabled,
            chunk_size: config.pseudo_stream_chunk_size,
            delay_ms: config.pseudo_stream_chunk_delay_ms,
        },
    ));
    spawn_consumers(
        transport.clone(),
        ConsumerSettings::callbacks(&transport, ServiceName::Orchestrator, block),
        callbacks,
        workers,
    )
    .await?;
    tokio::spawn(orchestrator::session::run_session_gc(
        sessions.clone(),
        Duration::from_secs(config.session_gc_interval_secs),
    ));

    let chat_app = chat_routes(OrchestratorState {
        sessions,
        configs,
        ws: chat_ws,
        chat,
        publisher,
        public_base_url: config.public_base_url.clone(),
    });

    let chat_address = format!("0.0.0.0:{}", config.orchestrator_port);
    let ingestion_address = format!("0.0.0.0:{}", config.ingestion_port);
    info!(%chat_address, %ingestion_address, "all-in-one process listening");
    let chat_listener = tokio::net::TcpListener::bind(&chat_address).await?;
    let ingestion_listener = tokio::net::TcpListener::bind(&ingestion_address).await?;

    tokio::select! {
        result = axum::serve(chat_listener, chat_app) => {
            result?;
        }
        result = axum::serve(ingestion_listener, ingestion_app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            std::process::exit(130);
        }
    }
    Ok(())
}
