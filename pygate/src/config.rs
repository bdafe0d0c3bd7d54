//! Session configuration.
//!
//! The handshake payload fields and retry parameters are conventions, not
//! protocol constants, so everything here is adjustable per deployment.

use std::sync::Arc;
use std::time::Duration;

use crate::bridge::protocol::PROTOCOL_VERSION;
use crate::channel::Endpoint;
use crate::spawn::{ExternalProcess, ScriptSpawner};

/// Bounded reconnect policy with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Automatic reconnect attempts after a failure. Zero disables retry;
    /// once exhausted the session stays Failed until an explicit restart.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based), doubling each time
    /// up to the cap.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Everything a [`crate::Session`] needs to run one bridge.
#[derive(Clone)]
pub struct BridgeConfig {
    pub endpoint: Endpoint,
    /// Shared secret the script must present in its hello. `None` disables
    /// the check.
    pub auth_token: Option<String>,
    pub protocol_version: u32,
    /// How long to wait for the script to connect after binding.
    pub connect_timeout: Duration,
    /// How long to wait for the hello frame once connected.
    pub handshake_timeout: Duration,
    /// Default per-invocation deadline.
    pub invoke_timeout: Duration,
    /// How long Draining waits for in-flight calls before forcing them out.
    pub drain_timeout: Duration,
    pub retry: RetryPolicy,
    pub spawner: Arc<dyn ScriptSpawner>,
}

impl BridgeConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            auth_token: None,
            protocol_version: PROTOCOL_VERSION,
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            invoke_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            spawner: Arc::new(ExternalProcess),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ScriptSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}
