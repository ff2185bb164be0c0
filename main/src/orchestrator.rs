use std::sync::Arc;
use std::time::Duration;

use common::action::ServiceName;
use common::cache::RedisCache;
use common::config::get_config;
use common::metadata::PostgrestStore;
use common::transport::{spawn_consumers, ConsumerSettings, RedisTransport, StreamNames};
use orchestrator::{
    chat_routes, ChatHandler, ConfigHandler, OrchestratorCallbacks, OrchestratorState,
    SessionHandler, StreamingSettings, WebSocketManager,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

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
        error!(error = %err, "orchestrator failed to start");
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

    let store = Arc::new(PostgrestStore::new(
        &config.supabase_url,
        &config.supabase_anon_key,
        &config.service_role_key,
    ));

    let sessions = Arc::new(SessionHandler::new(
        Some(cache.clone()),
        Duration::from_secs(config.session_idle_timeout_secs),
    ));
    let configs = Arc::new(ConfigHandler::new(
        store,
        Some(cache),
        Duration::from_secs(config.agent_config_ttl_secs),
    ));
    let ws = Arc::new(WebSocketManager::new());
    let chat = Arc::new(ChatHandler::new(
        sessions.clone(),
        configs.clone(),
        ws.clone(),
        Arc::new(transport.clone()),
    ));

    let callbacks = Arc::new(OrchestratorCallbacks::new(
        sessions.clone(),
        ws.clone(),
        StreamingSettings {
            enabled: config.pseudo_streaming_enabled,
            chunk_size: config.pseudo_stream_chunk_size,
            delay_ms: config.pseudo_stream_chunk_delay_ms,
        },
    ));
    spawn_consumers(
        transport.clone(),
        ConsumerSettings::callbacks(&transport, ServiceName::Orchestrator, config.consume_block_ms),
        callbacks,
        config.worker_count,
    )
    .await?;

    tokio::spawn(orchestrator::session::run_session_gc(
        sessions.clone(),
        Duration::from_secs(config.session_gc_interval_secs),
    ));

    let state = OrchestratorState {
        sessions,
        configs,
        ws,
        chat,
        publisher: Arc::new(transport),
        public_base_url: config.public_base_url.clone(),
    };
    let app = chat_routes(state);

    let address = format!("0.0.0.0:{}", config.orchestrator_port);
    info!(%address, "orchestrator listening");
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
