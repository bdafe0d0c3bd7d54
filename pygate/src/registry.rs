//! Capability registry: named operations one side exposes to the other.
//!
//! Registration is rare, invocation is frequent, so the map is a `DashMap`
//! rather than a single lock. Handler faults are converted to structured
//! failures at this boundary and never reach the receiver loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;

use crate::bridge::protocol::{CallResult, Invocation, Outcome};
use crate::error::ErrorKind;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>;

/// A registered capability: arguments in, value or error message out.
pub type CapabilityHandler = Arc<dyn Fn(Vec<serde_json::Value>) -> HandlerFuture + Send + Sync>;

pub struct GatewayRegistry {
    handlers: DashMap<String, CapabilityHandler>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler under `name`, replacing any prior handler. The old
    /// mapping is gone as soon as this returns.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        let name = name.into();
        let handler: CapabilityHandler = Arc::new(move |args| Box::pin(handler(args)));
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::debug!(capability = %name, "Replaced capability handler");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Run the handler for an incoming invocation.
    ///
    /// Unknown names and handler faults (errors or panics) come back as
    /// structured failures; nothing a handler does can propagate an
    /// unstructured fault across the bridge boundary.
    pub async fn invoke_local(&self, invocation: &Invocation) -> CallResult {
        let name = invocation.target_capability.as_str();
        // Clone the Arc out so no map shard is held across the await.
        let handler = self.handlers.get(name).map(|e| Arc::clone(e.value()));

        let outcome = match handler {
            None => {
                tracing::debug!(capability = %name, "Unknown capability invoked");
                Outcome::failure(ErrorKind::UnknownCapability, name)
            }
            Some(handler) => {
                let call = std::panic::AssertUnwindSafe(handler(invocation.arguments.clone()));
                match call.catch_unwind().await {
                    Ok(Ok(value)) => Outcome::success(value),
                    Ok(Err(message)) => {
                        tracing::warn!(capability = %name, error = %message, "Handler returned error");
                        Outcome::failure(ErrorKind::HandlerError, message)
                    }
                    Err(panic) => {
                        let detail = panic_message(panic);
                        tracing::error!(capability = %name, error = %detail, "Handler panicked");
                        Outcome::failure(
                            ErrorKind::HandlerError,
                            format!("handler panicked: {detail}"),
                        )
                    }
                }
            }
        };

        CallResult {
            correlation_id: invocation.correlation_id,
            outcome,
        }
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
