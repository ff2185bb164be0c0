use std::sync::Mutex;

use async_trait::async_trait;

use crate::action::{DomainAction, ServiceName};
use crate::error::AppError;
use crate::transport::ActionPublisher;

/// Publisher double that records instead of sending. Used by handler tests
/// and by local dry runs without a broker.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<DomainAction>>,
    replies: Mutex<Vec<(ServiceName, DomainAction)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<DomainAction> {
        self.published.lock().expect("publisher poisoned").clone()
    }

    pub fn replies(&self) -> Vec<(ServiceName, DomainAction)> {
        self.replies.lock().expect("publisher poisoned").clone()
    }

    pub fn take_published(&self) -> Vec<DomainAction> {
        std::mem::take(&mut *self.published.lock().expect("publisher poisoned"))
    }
}

#[async_trait]
impl ActionPublisher for RecordingPublisher {
    async fn publish(&self, action: &DomainAction) -> Result<(), AppError> {
        action.destination()?;
        self.published
            .lock()
            .expect("publisher poisoned")
            .push(action.clone());
        Ok(())
    }

    async fn publish_with_callback(
        &self,
        action: DomainAction,
        callback_event: &str,
    ) -> Result<DomainAction, AppError> {
        let action = action.with_callback(callback_event);
        self.publish(&action).await?;
        Ok(action)
    }

    async fn publish_reply(
        &self,
        origin: ServiceName,
        reply: &DomainAction,
    ) -> Result<(), AppError> {
        self.replies
            .lock()
            .expect("publisher poisoned")
            .push((origin, reply.clone()));
        Ok(())
    }
}
