//! Per-invocation environment shared by every component.

use crate::credential::TokenCredential;
use crate::retry::RetryConfig;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_ARM_ENDPOINT: &str = "https://management.azure.com";
pub const DEFAULT_GRAPH_ENDPOINT: &str = "https://graph.microsoft.com";
pub const DEFAULT_COMMAND_NAME: &str = "iot ops clone";

/// How long a session cache entry stays fresh.
pub const SESSION_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Process-lifetime cache with a staleness window.
#[derive(Debug)]
pub struct SessionCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, String)>>,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A value recorded less than `ttl` ago.
    pub fn get_fresh(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, v)| v.clone())
    }

    pub fn record(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.into(), (Instant::now(), value.into()));
        }
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(SESSION_CACHE_TTL)
    }
}

/// Everything a component needs to talk to Azure: endpoints, identity,
/// transport, retry and polling policy, cancellation.
pub struct Env {
    pub subscription_id: String,
    pub arm_endpoint: String,
    pub graph_endpoint: String,
    pub command_name: String,
    pub correlation_id: Uuid,
    pub retry: RetryConfig,
    pub poll_interval: Duration,
    pub cancel: CancellationToken,
    pub session: SessionCache,
    pub transport: Arc<dyn Transport>,
    pub credential: Arc<dyn TokenCredential>,
}

impl Env {
    pub fn new(
        subscription_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            arm_endpoint: DEFAULT_ARM_ENDPOINT.to_string(),
            graph_endpoint: DEFAULT_GRAPH_ENDPOINT.to_string(),
            command_name: DEFAULT_COMMAND_NAME.to_string(),
            correlation_id: Uuid::new_v4(),
            retry: RetryConfig::default(),
            poll_interval: Duration::from_secs(15),
            cancel: CancellationToken::new(),
            session: SessionCache::default(),
            transport,
            credential,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_endpoints(mut self, arm: impl Into<String>, graph: impl Into<String>) -> Self {
        self.arm_endpoint = arm.into();
        self.graph_endpoint = graph.into();
        self
    }

    /// Fail fast when the caller asked to stop.
    pub fn check_cancelled(&self) -> aioclone_common::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(aioclone_common::Error::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cache_freshness() {
        let cache = SessionCache::new(Duration::from_secs(60));
        assert_eq!(cache.get_fresh("k"), None);
        cache.record("k", "v");
        assert_eq!(cache.get_fresh("k").as_deref(), Some("v"));

        let stale = SessionCache::new(Duration::ZERO);
        stale.record("k", "v");
        assert_eq!(stale.get_fresh("k"), None);
    }
}
