use super::session::{
    ProtocolError, SessionState, ToolInvocationError, ToolServerConfig, ToolSession,
};
use super::types::ToolDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Access to the tools of a tool server for the duration of one run.
#[async_trait]
pub trait ToolBackend: Send {
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, ProtocolError>;

    async fn invoke(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, ToolInvocationError>;

    /// Releases all resources. Must be called on every exit path.
    async fn close(&mut self);
}

/// How tool server processes are managed across calls.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    /// A fresh process for every listing and every call
    Ephemeral,
    /// Processes are kept alive and reused across calls and runs
    #[default]
    Pooled,
}

/// Spawns, uses and closes a new session for each operation.
pub struct EphemeralSessions {
    config: ToolServerConfig,
    request_timeout: Duration,
}

impl EphemeralSessions {
    pub fn new(config: ToolServerConfig, request_timeout: Duration) -> Self {
        Self {
            config,
            request_timeout,
        }
    }
}

#[async_trait]
impl ToolBackend for EphemeralSessions {
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, ProtocolError> {
        let mut session = ToolSession::start(&self.config, self.request_timeout).await?;
        let tools = session.list_tools().await;
        session.close().await;
        tools
    }

    async fn invoke(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, ToolInvocationError> {
        let mut session = ToolSession::start(&self.config, self.request_timeout).await?;
        let result = session.invoke(name, arguments).await;
        session.close().await;
        result
    }

    async fn close(&mut self) {}
}

struct PoolInner {
    config: ToolServerConfig,
    request_timeout: Duration,
    max_size: usize,
    idle: Mutex<Vec<ToolSession>>,
    permits: Arc<Semaphore>,
}

/// A bounded set of long-lived sessions shared by concurrent runs.
///
/// Each run checks out a [`PooledLease`] that owns one session exclusively
/// until it is closed.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(config: ToolServerConfig, max_size: usize, request_timeout: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                config,
                request_timeout,
                max_size,
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(max_size)),
            }),
        }
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Number of sessions waiting to be checked out.
    pub async fn idle_count(&self) -> usize {
        self.inner.idle.lock().await.len()
    }

    /// Waits for a free slot and hands out a ready session.
    pub async fn acquire(&self) -> Result<PooledLease, ProtocolError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::NotReady(SessionState::Closed))?;

        let session = self.inner.take_idle().await;
        let session = match session {
            Some(session) => {
                debug!("Reusing pooled tool session");
                session
            }
            None => self.inner.start_session().await?,
        };

        Ok(PooledLease {
            session: Some(session),
            pool: self.inner.clone(),
            tools: None,
            _permit: permit,
        })
    }

    /// Closes all idle sessions. Leases still checked out are unaffected.
    pub async fn shutdown(&self) {
        let sessions: Vec<ToolSession> = self.inner.idle.lock().await.drain(..).collect();
        for mut session in sessions {
            session.close().await;
        }
    }
}

impl PoolInner {
    async fn take_idle(&self) -> Option<ToolSession> {
        let mut idle = self.idle.lock().await;
        while let Some(mut session) = idle.pop() {
            if session.is_reusable() {
                return Some(session);
            }
            debug!("Discarding idle tool session in state {:?}", session.state());
            session.close().await;
        }
        None
    }

    async fn start_session(&self) -> Result<ToolSession, ProtocolError> {
        ToolSession::start(&self.config, self.request_timeout).await
    }
}

/// Exclusive use of one pooled session.
///
/// The first tool listing is cached so every turn of a run sees the same
/// tools. A session that failed or whose process exited is discarded and
/// replaced, never reused.
pub struct PooledLease {
    session: Option<ToolSession>,
    pool: Arc<PoolInner>,
    tools: Option<Vec<ToolDescriptor>>,
    _permit: OwnedSemaphorePermit,
}

impl PooledLease {
    async fn ready_session(&mut self) -> Result<&mut ToolSession, ProtocolError> {
        let usable = self.session.as_mut().is_some_and(ToolSession::is_reusable);
        if !usable {
            if let Some(mut stale) = self.session.take() {
                warn!("Replacing tool session in state {:?}", stale.state());
                stale.close().await;
            }
            self.session = Some(self.pool.start_session().await?);
        }
        self.session
            .as_mut()
            .ok_or(ProtocolError::NotReady(SessionState::Closed))
    }

    pub fn process_id(&self) -> Option<u32> {
        self.session.as_ref().and_then(ToolSession::process_id)
    }
}

#[async_trait]
impl ToolBackend for PooledLease {
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, ProtocolError> {
        if let Some(tools) = &self.tools {
            return Ok(tools.clone());
        }
        let tools = self.ready_session().await?.list_tools().await?;
        self.tools = Some(tools.clone());
        Ok(tools)
    }

    async fn invoke(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, ToolInvocationError> {
        self.ready_session().await?.invoke(name, arguments).await
    }

    async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if session.is_reusable() {
            self.pool.idle.lock().await.push(session);
        } else {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_names() {
        let policy: SessionPolicy = serde_json::from_str("\"ephemeral\"").unwrap();
        assert_eq!(policy, SessionPolicy::Ephemeral);
        assert_eq!(SessionPolicy::default(), SessionPolicy::Pooled);
    }

    #[tokio::test]
    async fn test_pool_size_is_at_least_one() {
        let pool = SessionPool::new(ToolServerConfig::new("unused"), 0, Duration::from_secs(1));
        assert_eq!(pool.max_size(), 1);
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn test_acquire_reports_spawn_failure() {
        let pool = SessionPool::new(
            ToolServerConfig::new("/nonexistent/airflow-tool-server"),
            2,
            Duration::from_secs(1),
        );
        let result = pool.acquire().await;
        assert!(matches!(result, Err(ProtocolError::Spawn { .. })));
        // The permit is released again
        assert_eq!(pool.inner.permits.available_permits(), 2);
    }
}
