use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Runtime configuration shared by every binary. Resolved from an optional
/// `config` file plus environment variables, environment winning.
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub redis_url: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub service_role_key: String,
    pub qdrant_url: String,
    #[serde(default)]
    pub qdrant_api_key: Option<String>,
    pub openai_api_key: String,
    pub groq_api_key: String,
    #[serde(default = "default_groq_base_url")]
    pub groq_base_url: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    #[serde(default)]
    pub jwt_secret: Option<String>,

    #[serde(default = "default_orchestrator_port")]
    pub orchestrator_port: u16,
    #[serde(default = "default_ingestion_port")]
    pub ingestion_port: u16,
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_block_ms")]
    pub consume_block_ms: u64,
    #[serde(default = "default_max_retries")]
    pub transport_max_retries: usize,

    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    #[serde(default = "default_session_gc_interval_secs")]
    pub session_gc_interval_secs: u64,
    #[serde(default = "default_agent_config_ttl_secs")]
    pub agent_config_ttl_secs: u64,
    #[serde(default = "default_task_state_ttl_secs")]
    pub task_state_ttl_secs: u64,
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
    #[serde(default = "default_history_ttl_secs")]
    pub history_ttl_secs: u64,

    #[serde(default = "default_true")]
    pub pseudo_streaming_enabled: bool,
    #[serde(default = "default_stream_chunk_size")]
    pub pseudo_stream_chunk_size: usize,
    #[serde(default = "default_stream_delay_ms")]
    pub pseudo_stream_chunk_delay_ms: u64,

    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    #[serde(default = "default_vector_collection")]
    pub vector_collection: String,
}

fn default_groq_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_stream_prefix() -> String {
    "tessera".to_string()
}

fn default_orchestrator_port() -> u16 {
    8000
}

fn default_ingestion_port() -> u16 {
    8001
}

fn default_public_base_url() -> String {
    "ws://localhost:8000".to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_block_ms() -> u64 {
    2000
}

fn default_max_retries() -> usize {
    5
}

fn default_session_idle_timeout_secs() -> u64 {
    1800
}

fn default_session_gc_interval_secs() -> u64 {
    300
}

fn default_agent_config_ttl_secs() -> u64 {
    300
}

fn default_task_state_ttl_secs() -> u64 {
    3600
}

fn default_pending_ttl_secs() -> u64 {
    600
}

fn default_history_ttl_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_stream_chunk_size() -> usize {
    48
}

fn default_stream_delay_ms() -> u64 {
    30
}

fn default_provider_timeout_secs() -> u64 {
    60
}

fn default_upload_dir() -> String {
    std::env::temp_dir()
        .join("tessera-uploads")
        .to_string_lossy()
        .into_owned()
}

fn default_vector_collection() -> String {
    "tessera_vectors".to_string()
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_fields() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "redis_url": "redis://127.0.0.1/",
            "supabase_url": "http://localhost:54321",
            "supabase_anon_key": "anon",
            "service_role_key": "service",
            "qdrant_url": "http://localhost:6334",
            "openai_api_key": "sk-test",
            "groq_api_key": "gsk-test"
        }))
        .expect("defaults should deserialize");

        assert_eq!(config.stream_prefix, "tessera");
        assert_eq!(config.environment, "development");
        assert!(config.pseudo_streaming_enabled);
        assert_eq!(config.pseudo_stream_chunk_size, 48);
        assert_eq!(config.task_state_ttl_secs, 3600);
    }
}
