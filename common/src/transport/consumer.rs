use std::sync::Arc;

use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{DomainAction, ServiceName};
use crate::error::{AppError, ErrorInfo};
use crate::transport::{RedisTransport, PAYLOAD_FIELD};

/// A service's reaction to one delivered action. Returning a reply action
/// hands it to the transport, which routes it onto the origin service's
/// callback stream.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn service(&self) -> ServiceName;

    async fn handle(&self, action: DomainAction) -> Result<Option<DomainAction>, AppError>;
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub stream: String,
    pub group: String,
    pub block_ms: u64,
    pub batch_size: usize,
}

impl ConsumerSettings {
    pub fn main(transport: &RedisTransport, service: ServiceName, block_ms: u64) -> Self {
        Self {
            stream: transport.streams().main(service),
            group: transport.streams().group(service),
            block_ms,
            batch_size: 8,
        }
    }

    pub fn callbacks(transport: &RedisTransport, service: ServiceName, block_ms: u64) -> Self {
        Self {
            stream: transport.streams().callbacks(service),
            group: transport.streams().callback_group(service),
            block_ms,
            batch_size: 8,
        }
    }
}

/// Launches `count` consumers in one group so deliveries load-balance
/// across them. Each task loops until the process exits.
pub async fn spawn_consumers(
    transport: RedisTransport,
    settings: ConsumerSettings,
    handler: Arc<dyn ActionHandler>,
    count: usize,
) -> Result<Vec<JoinHandle<()>>, AppError> {
    transport
        .ensure_group(&settings.stream, &settings.group)
        .await?;

    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
        let consumer_id = format!("{}-{}", handler.service(), Uuid::new_v4());
        let transport = transport.clone();
        let settings = settings.clone();
        let handler = Arc::clone(&handler);
        handles.push(tokio::spawn(async move {
            info!(
                stream = %settings.stream,
                group = %settings.group,
                %consumer_id,
                "consumer started"
            );
            run_consumer(transport, settings, handler, consumer_id).await;
        }));
    }
    Ok(handles)
}

async fn run_consumer(
    transport: RedisTransport,
    settings: ConsumerSettings,
    handler: Arc<dyn ActionHandler>,
    consumer_id: String,
) {
    loop {
        match read_batch(&transport, &settings, &consumer_id).await {
            Ok(entries) => {
                for (entry_id, action) in entries {
                    process_entry(&transport, &settings, handler.as_ref(), &entry_id, action)
                        .await;
                }
            }
            Err(err) => {
                error!(
                    stream = %settings.stream,
                    %consumer_id,
                    error = %err,
                    "stream read failed; backing off"
                );
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

async fn read_batch(
    transport: &RedisTransport,
    settings: &ConsumerSettings,
    consumer_id: &str,
) -> Result<Vec<(String, DomainAction)>, AppError> {
    let mut conn = transport.connection();
    let options = StreamReadOptions::default()
        .group(&settings.group, consumer_id)
        .block(settings.block_ms as usize)
        .count(settings.batch_size);

    let reply: StreamReadReply = conn
        .xread_options(&[settings.stream.as_str()], &[">"], &options)
        .await?;

    let mut entries = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            let payload: Option<String> = id.get(PAYLOAD_FIELD);
            match payload {
                Some(raw) => match serde_json::from_str::<DomainAction>(&raw) {
                    Ok(action) => entries.push((id.id.clone(), action)),
                    Err(err) => {
                        // Poison entry: nothing to reply to, ack so it does
                        // not wedge the group.
                        warn!(
                            stream = %settings.stream,
                            entry_id = %id.id,
                            error = %err,
                            "dropping undecodable stream entry"
                        );
                        transport
                            .ack(&settings.stream, &settings.group, &id.id)
                            .await
                            .ok();
                    }
                },
                None => {
                    warn!(
                        stream = %settings.stream,
                        entry_id = %id.id,
                        "stream entry missing payload field"
                    );
                    transport
                        .ack(&settings.stream, &settings.group, &id.id)
                        .await
                        .ok();
                }
            }
        }
    }
    Ok(entries)
}

async fn process_entry(
    transport: &RedisTransport,
    settings: &ConsumerSettings,
    handler: &dyn ActionHandler,
    entry_id: &str,
    action: DomainAction,
) {
    let action_id = action.action_id;
    let action_type = action.action_type.clone();
    let origin = action.origin_service;
    let callback = action.callback_action_type.clone();
    let tenant_id = action.tenant_id;
    let session_id = action.session_id.clone();
    let task_id = action.task_id.clone();

    let result = handler.handle(action).await;

    match result {
        Ok(Some(reply)) => {
            let destination = reply.destination().unwrap_or(origin);
            if let Err(err) = transport.publish_reply(destination, &reply).await {
                error!(
                    %action_id,
                    action_type = %action_type,
                    error = %err,
                    "failed to deliver reply"
                );
                // Leave unacked: the delivery will be retried by a
                // pending-claim or operator intervention.
                return;
            }
        }
        Ok(None) => {}
        Err(err) => {
            warn!(
                %action_id,
                action_type = %action_type,
                tenant_id = %tenant_id,
                session_id = session_id.as_deref().unwrap_or(""),
                task_id = task_id.as_deref().unwrap_or(""),
                error = %err,
                "handler failed"
            );
            // An action that owes a callback always gets a typed error
            // reply; the owning state machine decides what happens next.
            if let Some(callback_type) = callback {
                let error_reply = error_reply_for(
                    &callback_type,
                    handler.service(),
                    tenant_id,
                    session_id.clone(),
                    task_id.clone(),
                    &err,
                );
                if let Err(publish_err) = transport.publish_reply(origin, &error_reply).await {
                    error!(
                        %action_id,
                        error = %publish_err,
                        "failed to deliver error reply"
                    );
                    return;
                }
            }
        }
    }

    if let Err(err) = transport.ack(&settings.stream, &settings.group, entry_id).await {
        warn!(entry_id, error = %err, "failed to ack stream entry");
    } else {
        debug!(%action_id, action_type = %action_type, entry_id, "acked");
    }
}

/// Derives the error callback from a reply callback by swapping the trailing
/// segment: `orchestrator.chat.response` -> `orchestrator.chat.error`.
pub fn error_action_type(callback_type: &str) -> String {
    match callback_type.rsplit_once('.') {
        Some((head, _)) => format!("{head}.error"),
        None => format!("{callback_type}.error"),
    }
}

fn error_reply_for(
    callback_type: &str,
    replier: ServiceName,
    tenant_id: Uuid,
    session_id: Option<String>,
    task_id: Option<String>,
    err: &AppError,
) -> DomainAction {
    let info = ErrorInfo::from_error(err);
    let mut reply = DomainAction::new(
        error_action_type(callback_type),
        replier,
        tenant_id,
        serde_json::to_value(info).unwrap_or(serde_json::Value::Null),
    );
    reply.session_id = session_id;
    reply.task_id = task_id;
    reply
}
