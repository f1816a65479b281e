//! Payload Registry
//!
//! Slaves execute tasks by name: the `kind` of an incoming [`TaskPayload`]
//! selects an async handler registered here. Handlers get a [`TaskScope`]
//! with their execution context, the task parameters, and an
//! [`AbortSignal`] the master can trip while they run.
//!
//! [`TaskPayload`]: super::types::TaskPayload

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

use super::types::{RESULT_INCONCLUSIVE, TaskContextData};

/// Everything a payload handler gets to see.
pub struct TaskScope {
    pub context: TaskContextData,
    pub params: serde_json::Value,
    pub abort: AbortSignal,
}

/// Type-erased payload handler resolving to the slave's result code.
pub type PayloadHandlerFn =
    Arc<dyn Fn(TaskScope) -> Pin<Box<dyn Future<Output = i32> + Send>> + Send + Sync>;

/// Abort flag shared between a running payload and whoever may cancel it.
#[derive(Clone)]
pub struct AbortSignal {
    tripped: Arc<watch::Sender<bool>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tripped, _) = watch::channel(false);
        Self {
            tripped: Arc::new(tripped),
        }
    }

    pub fn trip(&self) {
        self.tripped.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tripped.borrow()
    }

    /// Resolves once the signal is tripped. Meant for `tokio::select!` in handlers.
    pub async fn aborted(&self) {
        let mut rx = self.tripped.subscribe();
        // sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|tripped| *tripped).await;
    }
}

#[derive(Default)]
pub struct PayloadRegistry {
    handlers: DashMap<String, PayloadHandlerFn>,
}

impl PayloadRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an async handler for a payload kind.
    ///
    /// # Arguments
    /// * `kind` - Name carried in the `kind` field of incoming payloads
    /// * `handler` - Async function producing the slave's result code
    ///
    /// Result codes must be `>= 0`. Negative values are reserved for the
    /// master's own markers (`RESULT_SYNC_FAILED`, `RESULT_INCONCLUSIVE`);
    /// a handler returning one is reported as `RESULT_INCONCLUSIVE`.
    pub fn register<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(TaskScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = i32> + Send + 'static,
    {
        let handler_fn: PayloadHandlerFn = Arc::new(move |scope: TaskScope| {
            Box::pin(handler(scope)) as Pin<Box<dyn Future<Output = i32> + Send>>
        });

        self.handlers.insert(kind.to_string(), handler_fn);
        tracing::info!("Registered payload: {}", kind);
    }

    pub fn has(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Runs the handler for `kind`.
    ///
    /// # Returns
    /// * `Some(code)` - The handler's result code, negative codes mapped to `RESULT_INCONCLUSIVE`
    /// * `None` - No such payload is registered
    pub async fn execute(&self, kind: &str, scope: TaskScope) -> Option<i32> {
        let handler = self.handlers.get(kind).map(|entry| entry.value().clone())?;

        tracing::debug!(
            "Executing payload '{}' as rank {} of {}",
            kind,
            scope.context.rank,
            scope.context.slaves.len()
        );
        let code = handler(scope).await;
        if code < 0 {
            tracing::warn!(
                "Payload '{}' returned reserved code {}, reporting it as inconclusive",
                kind,
                code
            );
            return Some(RESULT_INCONCLUSIVE);
        }
        Some(code)
    }

    pub fn list(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.iter().map(|entry| entry.key().clone()).collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::NodeId;
    use std::time::Duration;

    fn scope(rank: usize) -> TaskScope {
        TaskScope {
            context: TaskContextData {
                group: 0,
                rank,
                slaves: vec![NodeId::from("a"), NodeId::from("b")],
            },
            params: serde_json::json!({ "offset": 10 }),
            abort: AbortSignal::new(),
        }
    }

    #[tokio::test]
    async fn test_execute_registered_payload() {
        let registry = PayloadRegistry::new();
        registry.register("rank_plus_offset", |scope: TaskScope| async move {
            scope.context.rank as i32 + scope.params["offset"].as_i64().unwrap_or(0) as i32
        });

        assert!(registry.has("rank_plus_offset"));
        assert_eq!(registry.execute("rank_plus_offset", scope(1)).await, Some(11));
    }

    #[tokio::test]
    async fn test_execute_unknown_payload_is_none() {
        let registry = PayloadRegistry::new();
        assert_eq!(registry.execute("missing", scope(0)).await, None);
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_negative_code_cannot_pose_as_sync_failure() {
        let registry = PayloadRegistry::new();
        registry.register("minus_one", |_scope: TaskScope| async move { -1 });
        registry.register("zero", |_scope: TaskScope| async move { 0 });

        assert_eq!(
            registry.execute("minus_one", scope(0)).await,
            Some(RESULT_INCONCLUSIVE)
        );
        assert_eq!(registry.execute("zero", scope(0)).await, Some(0));
    }

    #[tokio::test]
    async fn test_abort_signal_interrupts_handler() {
        let registry = PayloadRegistry::new();
        registry.register("forever", |scope: TaskScope| async move {
            tokio::select! {
                _ = scope.abort.aborted() => 3,
                _ = tokio::time::sleep(Duration::from_secs(60)) => 0,
            }
        });

        let scope = scope(0);
        let abort = scope.abort.clone();
        let run = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.execute("forever", scope).await })
        };

        abort.trip();

        assert_eq!(run.await.unwrap(), Some(3));
        assert!(abort.is_aborted());
    }
}
