use std::sync::Arc;
use std::time::Duration;

use common::action::ServiceName;
use common::cache::{JsonStore, RedisCache};
use common::config::get_config;
use common::metadata::PostgrestStore;
use common::transport::{spawn_consumers, ConsumerSettings, RedisTransport, StreamNames};
use conversation::ConversationHandler;
use embedding::{EmbeddingHandler, OpenAiEmbedder};
use execution::{ExecutionHandler, HistoryStore};
use extraction::ExtractionHandler;
use query::{OpenAiChatProvider, QueryHandler};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vector_index::QdrantIndex;

/// Backend workers in one process: execution, query, extraction, embedding
/// and conversation consumers sharing a transport.
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
        error!(error = %err, "worker failed to start");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = get_config()?;

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

    let execution = Arc::new(ExecutionHandler::new(
        publisher.clone(),
        HistoryStore::new(JsonStore::new(Some(cache.clone()))),
        JsonStore::new(Some(cache.clone())),
        config.pending_ttl_secs,
    ));
    let query = Arc::new(QueryHandler::new(
        publisher.clone(),
        index,
        Arc::new(OpenAiChatProvider::new(
            &config.groq_api_key,
            &config.groq_base_url,
            Duration::from_secs(config.provider_timeout_secs),
        )),
        JsonStore::new(Some(cache)),
        config.pending_ttl_secs,
    ));
    let extraction = Arc::new(ExtractionHandler::new());
    let embedding = Arc::new(EmbeddingHandler::new(Arc::new(OpenAiEmbedder::new(
        &config.openai_api_key,
        &config.openai_base_url,
    ))));
    let conversation = Arc::new(ConversationHandler::new(store));

    let block = config.consume_block_ms;
    let workers = config.worker_count;

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

    info!(workers, "backend workers started");
    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    std::process::exit(130);
}
