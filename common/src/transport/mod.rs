pub mod consumer;
pub mod recording;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, warn};

use crate::action::{DomainAction, ServiceName};
use crate::error::AppError;

pub use consumer::{spawn_consumers, ActionHandler, ConsumerSettings};
pub use recording::RecordingPublisher;

/// Publishing surface of the transport. Handlers depend on this seam so
/// they can run against a recording double in tests.
#[async_trait]
pub trait ActionPublisher: Send + Sync {
    async fn publish(&self, action: &DomainAction) -> Result<(), AppError>;

    async fn publish_with_callback(
        &self,
        action: DomainAction,
        callback_event: &str,
    ) -> Result<DomainAction, AppError>;

    async fn publish_reply(
        &self,
        origin: ServiceName,
        reply: &DomainAction,
    ) -> Result<(), AppError>;
}

/// Field under which the serialized action travels in a stream entry.
pub const PAYLOAD_FIELD: &str = "payload";

/// Stream naming for one deployment: `{prefix}:{env}:{service}:streams:main`
/// plus a `-callbacks` variant read by each service's callback worker.
#[derive(Debug, Clone)]
pub struct StreamNames {
    prefix: String,
    environment: String,
}

impl StreamNames {
    pub fn new(prefix: &str, environment: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            environment: environment.to_string(),
        }
    }

    pub fn main(&self, service: ServiceName) -> String {
        format!(
            "{}:{}:{}:streams:main",
            self.prefix, self.environment, service
        )
    }

    pub fn callbacks(&self, service: ServiceName) -> String {
        format!(
            "{}:{}:{}-callbacks:streams:main",
            self.prefix, self.environment, service
        )
    }

    pub fn group(&self, service: ServiceName) -> String {
        format!("{}-group", service)
    }

    pub fn callback_group(&self, service: ServiceName) -> String {
        format!("{}-callbacks-group", service)
    }
}

/// Publishes and acknowledges DomainActions over Redis streams. Cloneable;
/// the underlying connection manager multiplexes and reconnects.
#[derive(Clone)]
pub struct RedisTransport {
    conn: ConnectionManager,
    streams: StreamNames,
    max_retries: usize,
}

impl RedisTransport {
    pub async fn connect(
        redis_url: &str,
        streams: StreamNames,
        max_retries: usize,
    ) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            streams,
            max_retries,
        })
    }

    pub fn streams(&self) -> &StreamNames {
        &self.streams
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Appends the action to the destination service's main stream. The
    /// destination is derived from the action type's first dotted segment.
    pub async fn publish(&self, action: &DomainAction) -> Result<(), AppError> {
        let destination = action.destination()?;
        let stream = self.streams.main(destination);
        self.append(&stream, action).await
    }

    /// Same as [`publish`], first stamping the callback the destination
    /// handler owes a reply to.
    pub async fn publish_with_callback(
        &self,
        action: DomainAction,
        callback_event: &str,
    ) -> Result<DomainAction, AppError> {
        let action = action.with_callback(callback_event);
        self.publish(&action).await?;
        Ok(action)
    }

    /// Delivers a reply onto the origin service's callback stream.
    pub async fn publish_reply(
        &self,
        origin: ServiceName,
        reply: &DomainAction,
    ) -> Result<(), AppError> {
        let stream = self.streams.callbacks(origin);
        self.append(&stream, reply).await
    }

    async fn append(&self, stream: &str, action: &DomainAction) -> Result<(), AppError> {
        let payload = serde_json::to_string(action)?;
        let strategy = ExponentialBackoff::from_millis(50)
            .map(jitter)
            .take(self.max_retries);

        let conn = self.conn.clone();
        Retry::spawn(strategy, move || {
            let mut conn = conn.clone();
            let payload = payload.clone();
            let stream = stream.to_string();
            async move {
                let _: String = conn
                    .xadd(&stream, "*", &[(PAYLOAD_FIELD, payload.as_str())])
                    .await?;
                Ok::<(), redis::RedisError>(())
            }
        })
        .await?;

        debug!(
            action_id = %action.action_id,
            action_type = %action.action_type,
            stream,
            "published action"
        );
        Ok(())
    }

    /// Creates the consumer group, tolerating a pre-existing one.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let result: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "$").await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(err) => {
                warn!(stream, group, error = %err, "failed to create consumer group");
                Err(err.into())
            }
        }
    }

    pub async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[entry_id]).await?;
        Ok(())
    }
}

#[async_trait]
impl ActionPublisher for RedisTransport {
    async fn publish(&self, action: &DomainAction) -> Result<(), AppError> {
        RedisTransport::publish(self, action).await
    }

    async fn publish_with_callback(
        &self,
        action: DomainAction,
        callback_event: &str,
    ) -> Result<DomainAction, AppError> {
        RedisTransport::publish_with_callback(self, action, callback_event).await
    }

    async fn publish_reply(
        &self,
        origin: ServiceName,
        reply: &DomainAction,
    ) -> Result<(), AppError> {
        RedisTransport::publish_reply(self, origin, reply).await
    }
}
