use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::cache::{keys, RedisCache};
use common::error::{AppError, ErrorInfo};

/// One live chat session. Owned by the orchestrator; at most one
/// outstanding `active_task_id` at any instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub session_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_task_id: Option<String>,
    pub total_tasks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub websocket_connected: bool,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorInfo>,
}

impl Session {
    pub fn new(
        tenant_id: Uuid,
        agent_id: Uuid,
        agent_name: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            tenant_id,
            agent_id,
            agent_name: agent_name.into(),
            user_id,
            session_type: "public_chat".to_string(),
            active_task_id: None,
            total_tasks: 0,
            connection_id: None,
            websocket_connected: false,
            last_activity: now,
            created_at: now,
            last_error: None,
        }
    }
}

/// Per-process session map guarded by per-session mutexes, written through
/// to Redis. The mutex is held only across field updates, never across I/O.
pub struct SessionHandler {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    cache: Option<RedisCache>,
    idle_timeout: Duration,
    ttl_secs: u64,
}

impl SessionHandler {
    pub fn new(cache: Option<RedisCache>, idle_timeout: Duration) -> Self {
        let ttl_secs = idle_timeout.as_secs().max(60) * 2;
        Self {
            sessions: RwLock::new(HashMap::new()),
            cache,
            idle_timeout,
            ttl_secs,
        }
    }

    pub async fn create(&self, session: Session) -> Result<(String, String), AppError> {
        let session_id = session.session_id.clone();
        let mut session = session;
        let first_task = Uuid::new_v4().to_string();
        session.active_task_id = Some(first_task.clone());
        session.total_tasks = 1;

        self.persist(&session).await;
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));
        info!(%session_id, "session created");
        Ok((session_id, first_task))
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        if let Some(entry) = self.sessions.read().await.get(session_id) {
            return Some(Arc::clone(entry));
        }
        // Another process may own the live copy; fall back to the cache.
        let cached: Option<Session> = match &self.cache {
            Some(cache) => cache.get(&keys::session(session_id)).await.ok().flatten(),
            None => None,
        };
        let session = cached?;
        let entry = Arc::new(Mutex::new(session));
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), Arc::clone(&entry));
        Some(entry)
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<Session, AppError> {
        let entry = self
            .get(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
        let session = entry.lock().await.clone();
        Ok(session)
    }

    /// Mints a fresh task id and makes it the session's single outstanding
    /// task. A still-pending previous task is simply superseded.
    pub async fn begin_task(&self, session_id: &str) -> Result<String, AppError> {
        let entry = self
            .get(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
        let task_id = Uuid::new_v4().to_string();
        let snapshot = {
            let mut session = entry.lock().await;
            if let Some(previous) = session.active_task_id.replace(task_id.clone()) {
                debug!(%session_id, superseded = %previous, "task superseded");
            }
            session.total_tasks += 1;
            session.last_activity = Utc::now();
            session.clone()
        };
        self.persist(&snapshot).await;
        Ok(task_id)
    }

    /// Clears the active task when the finishing task still owns it.
    /// Returns whether it matched.
    pub async fn finish_task(&self, session_id: &str, task_id: &str) -> bool {
        let Some(entry) = self.get(session_id).await else {
            return false;
        };
        let (matched, snapshot) = {
            let mut session = entry.lock().await;
            let matched = session.active_task_id.as_deref() == Some(task_id);
            if matched {
                session.active_task_id = None;
            }
            session.last_activity = Utc::now();
            (matched, session.clone())
        };
        self.persist(&snapshot).await;
        matched
    }

    pub async fn record_error(&self, session_id: &str, error: ErrorInfo) {
        if let Some(entry) = self.get(session_id).await {
            let snapshot = {
                let mut session = entry.lock().await;
                session.last_error = Some(error);
                session.clone()
            };
            self.persist(&snapshot).await;
        }
    }

    pub async fn set_connected(
        &self,
        session_id: &str,
        connection_id: Option<String>,
        connected: bool,
    ) {
        if let Some(entry) = self.get(session_id).await {
            let snapshot = {
                let mut session = entry.lock().await;
                session.connection_id = connection_id;
                session.websocket_connected = connected;
                session.last_activity = Utc::now();
                session.clone()
            };
            self.persist(&snapshot).await;
        }
    }

    pub async fn delete(&self, session_id: &str) -> Result<Session, AppError> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.delete(&keys::session(session_id)).await {
                warn!(%session_id, error = %err, "failed to delete cached session");
            }
        }
        let session = entry.lock().await.clone();
        info!(%session_id, "session deleted");
        Ok(session)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Evicts sessions idle past the timeout; both the local and the cached
    /// copies go.
    pub async fn gc_sweep(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.idle_timeout).unwrap_or(chrono::Duration::zero());
        let mut expired = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, entry) in sessions.iter() {
                let session = entry.lock().await;
                if session.last_activity < cutoff {
                    expired.push(id.clone());
                }
            }
        }
        for id in &expired {
            self.sessions.write().await.remove(id);
            if let Some(cache) = &self.cache {
                cache.delete(&keys::session(id)).await.ok();
            }
            debug!(session_id = %id, "session evicted by gc");
        }
        expired.len()
    }

    async fn persist(&self, session: &Session) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache
                .set(&keys::session(&session.session_id), session, self.ttl_secs)
                .await
            {
                warn!(session_id = %session.session_id, error = %err, "session write-through failed");
            }
        }
    }
}

/// Periodic idle-session sweep.
pub async fn run_session_gc(handler: Arc<SessionHandler>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let evicted = handler.gc_sweep().await;
        if evicted > 0 {
            info!(evicted, "session gc sweep");
        }
    }
}
