//! Call dispatcher: matches outgoing invocations to their results.
//!
//! Each `invoke` registers a oneshot under a fresh correlation id and
//! suspends until the receiver loop completes it or the deadline elapses.
//! Resolution is exactly-once: whichever side removes the pending entry
//! from the map wins, the other side observes the removal and stands down.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Notify, oneshot};

use crate::bridge::protocol::{CallResult, CorrelationId, Invocation, Outcome};
use crate::error::ErrorKind;

pub struct CallDispatcher {
    next_id: AtomicU64,
    pending: DashMap<CorrelationId, oneshot::Sender<Outcome>>,
    drained: Notify,
}

impl CallDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            drained: Notify::new(),
        })
    }

    /// Allocate a correlation id and a pending record for a new call.
    ///
    /// The returned invocation still has to be sent on the channel; the
    /// handle then waits for its result. Ids are monotonic and never reused
    /// within the session.
    pub fn register(
        self: &Arc<Self>,
        capability: &str,
        arguments: Vec<serde_json::Value>,
        deadline: Duration,
    ) -> (InvocationHandle, Invocation) {
        let id = CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let invocation = Invocation {
            correlation_id: id,
            target_capability: capability.to_string(),
            arguments,
            deadline_ms: Some(deadline.as_millis() as u64),
        };

        let handle = InvocationHandle {
            id,
            rx,
            deadline,
            dispatcher: Arc::clone(self),
        };

        (handle, invocation)
    }

    /// Resolve a pending call with an incoming result.
    ///
    /// A result whose id is unknown (already timed out, cancelled, or never
    /// issued) is logged and discarded; it cannot affect any other call.
    pub fn complete(&self, result: CallResult) -> bool {
        match self.remove(&result.correlation_id) {
            Some(tx) => {
                let _ = tx.send(result.outcome);
                true
            }
            None => {
                tracing::warn!(
                    correlation_id = %result.correlation_id,
                    "Discarding result for unknown or expired call"
                );
                false
            }
        }
    }

    /// Withdraw one pending call, resolving its waiter with `Cancelled`.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        match self.remove(&id) {
            Some(tx) => {
                let _ = tx.send(Outcome::failure(
                    ErrorKind::Cancelled,
                    "cancelled by caller",
                ));
                true
            }
            None => false,
        }
    }

    /// Drop one pending record without resolving it. Used when the send
    /// itself failed and the caller gets the error directly.
    pub fn discard(&self, id: CorrelationId) -> bool {
        self.remove(&id).is_some()
    }

    /// Resolve every pending call with the same failure. Used when the
    /// session enters Failed so no caller is left waiting.
    pub fn fail_all(&self, kind: ErrorKind, message: &str) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some(tx) = self.remove(&id) {
                let _ = tx.send(Outcome::failure(kind, message));
                failed += 1;
            }
        }
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait until no calls are pending. Used by the drain phase.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn remove(&self, id: &CorrelationId) -> Option<oneshot::Sender<Outcome>> {
        let removed = self.pending.remove(id).map(|(_, tx)| tx);
        if removed.is_some() && self.pending.is_empty() {
            self.drained.notify_waiters();
        }
        removed
    }
}

/// One in-flight call. Waiting consumes the handle; exactly one outcome
/// comes back no matter how the call ends.
pub struct InvocationHandle {
    id: CorrelationId,
    rx: oneshot::Receiver<Outcome>,
    deadline: Duration,
    dispatcher: Arc<CallDispatcher>,
}

impl InvocationHandle {
    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }

    /// Suspend until the result arrives or the deadline elapses.
    ///
    /// On expiry the pending record is removed first; a real result racing
    /// the deadline either wins the removal (and is delivered) or arrives
    /// later and is discarded by the dispatcher.
    pub async fn wait(mut self) -> Outcome {
        tokio::select! {
            resolved = &mut self.rx => match resolved {
                Ok(outcome) => outcome,
                Err(_) => Outcome::failure(ErrorKind::SessionLost, "pending call dropped"),
            },
            _ = tokio::time::sleep(self.deadline) => {
                if self.dispatcher.remove(&self.id).is_some() {
                    tracing::debug!(correlation_id = %self.id, "Invocation timed out");
                    Outcome::failure(
                        ErrorKind::Timeout,
                        format!("no result within {}ms", self.deadline.as_millis()),
                    )
                } else {
                    // The resolution won the race; it is sitting in the oneshot.
                    match self.rx.await {
                        Ok(outcome) => outcome,
                        Err(_) => Outcome::failure(ErrorKind::SessionLost, "pending call dropped"),
                    }
                }
            }
        }
    }

    /// Withdraw the call before resolution, freeing the pending record.
    pub fn cancel(self) {
        self.dispatcher.cancel(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn complete_resolves_the_waiter() {
        let dispatcher = CallDispatcher::new();
        let (handle, invocation) =
            dispatcher.register("echo", vec![json!("ping")], Duration::from_secs(5));

        assert!(dispatcher.complete(CallResult {
            correlation_id: invocation.correlation_id,
            outcome: Outcome::success(json!("pong")),
        }));

        assert_eq!(handle.wait().await, Outcome::success(json!("pong")));
        assert!(dispatcher.is_idle());
    }

    #[tokio::test]
    async fn correlation_ids_are_monotonic() {
        let dispatcher = CallDispatcher::new();
        let (_h1, first) = dispatcher.register("a", vec![], Duration::from_secs(1));
        let (_h2, second) = dispatcher.register("b", vec![], Duration::from_secs(1));
        assert!(second.correlation_id.raw() > first.correlation_id.raw());
    }

    #[tokio::test]
    async fn deadline_expiry_resolves_with_timeout_exactly_once() {
        let dispatcher = CallDispatcher::new();
        let (handle, invocation) =
            dispatcher.register("slow", vec![], Duration::from_millis(50));

        let outcome = handle.wait().await;
        assert_eq!(outcome.failure_kind(), Some(ErrorKind::Timeout));
        assert!(dispatcher.is_idle());

        // A late real result is discarded, not delivered twice.
        assert!(!dispatcher.complete(CallResult {
            correlation_id: invocation.correlation_id,
            outcome: Outcome::success(json!("late")),
        }));
    }

    #[tokio::test]
    async fn stale_result_does_not_affect_other_calls() {
        let dispatcher = CallDispatcher::new();
        let (handle, invocation) =
            dispatcher.register("live", vec![], Duration::from_secs(5));

        assert!(!dispatcher.complete(CallResult {
            correlation_id: CorrelationId::new(9999),
            outcome: Outcome::success(json!("stray")),
        }));

        assert!(dispatcher.complete(CallResult {
            correlation_id: invocation.correlation_id,
            outcome: Outcome::success(json!("real")),
        }));
        assert_eq!(handle.wait().await, Outcome::success(json!("real")));
    }

    #[tokio::test]
    async fn cancel_frees_only_the_cancelled_call() {
        let dispatcher = CallDispatcher::new();
        let (cancelled, _) = dispatcher.register("one", vec![], Duration::from_secs(5));
        let (kept, kept_invocation) = dispatcher.register("two", vec![], Duration::from_secs(5));

        cancelled.cancel();
        assert_eq!(dispatcher.pending_count(), 1);

        assert!(dispatcher.complete(CallResult {
            correlation_id: kept_invocation.correlation_id,
            outcome: Outcome::success(json!("ok")),
        }));
        assert_eq!(kept.wait().await, Outcome::success(json!("ok")));
    }

    #[tokio::test]
    async fn fail_all_resolves_every_pending_call() {
        let dispatcher = CallDispatcher::new();
        let (first, _) = dispatcher.register("a", vec![], Duration::from_secs(5));
        let (second, _) = dispatcher.register("b", vec![], Duration::from_secs(5));

        assert_eq!(dispatcher.fail_all(ErrorKind::SessionLost, "gone"), 2);

        for handle in [first, second] {
            assert_eq!(
                handle.wait().await.failure_kind(),
                Some(ErrorKind::SessionLost)
            );
        }
    }

    #[tokio::test]
    async fn concurrent_invokes_each_resolve_exactly_once() {
        let dispatcher = CallDispatcher::new();
        let mut waiters = tokio::task::JoinSet::new();

        for i in 0..32u64 {
            let (handle, invocation) =
                dispatcher.register("n", vec![json!(i)], Duration::from_secs(5));
            waiters.spawn(async move { handle.wait().await });
            assert!(dispatcher.complete(CallResult {
                correlation_id: invocation.correlation_id,
                outcome: Outcome::success(json!(i)),
            }));
        }

        let mut resolutions = 0;
        while let Some(outcome) = waiters.join_next().await {
            assert!(outcome.unwrap().is_success());
            resolutions += 1;
        }
        assert_eq!(resolutions, 32);
        assert!(dispatcher.is_idle());
    }

    #[tokio::test]
    async fn wait_idle_returns_once_drained() {
        let dispatcher = CallDispatcher::new();
        let (_handle, invocation) = dispatcher.register("a", vec![], Duration::from_secs(5));

        let waiter = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.wait_idle().await })
        };

        dispatcher.complete(CallResult {
            correlation_id: invocation.correlation_id,
            outcome: Outcome::success(serde_json::Value::Null),
        });

        waiter.await.unwrap();
    }
}
