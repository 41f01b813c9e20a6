//! Task type -> handler registry.
//!
//! Modeled as an explicit map keyed by type string, with an optional
//! longest-prefix fallback for handlers that serve a family of types
//! (`"email:*"` registered once instead of one entry per concrete subtype).
//! No reliance on runtime reflection: a handler is looked up by string match
//! only.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use broker::Epoch;

/// Metadata a handler can observe about the task it was invoked for.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: String,
    pub task_type: String,
    pub queue: String,
    pub retried: u32,
    pub max_retry: u32,
    pub deadline: Option<Epoch>,
    pub cancel: CancellationToken,
}

/// A user-supplied handler for one task type.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Process the task. `Ok` settles the task as done (with `result` as the
    /// optional bytes to persist); `Err` is classified by the processor's
    /// `skip_retry` policy into retry-or-archive.
    async fn run(&self, ctx: &TaskContext, payload: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Adapts a plain async closure into a [`Handler`], for the common case of a
/// handler with no state of its own.
pub struct FnHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Option<Vec<u8>>>> + Send,
{
    async fn run(&self, ctx: &TaskContext, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        (self.0)(ctx.clone(), payload.to_vec()).await
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    exact: HashMap<String, Arc<dyn Handler>>,
    /// Prefix entries, longest first, consulted when no exact match exists.
    prefixes: Vec<(String, Arc<dyn Handler>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn Handler>) {
        self.exact.insert(task_type.into(), handler);
    }

    /// Register a handler for every task type beginning with `prefix`.
    /// Resolution prefers the longest matching prefix, then falls back to
    /// exact matches already checked by [`HandlerRegistry::resolve`].
    pub fn register_prefix(&mut self, prefix: impl Into<String>, handler: Arc<dyn Handler>) {
        self.prefixes.push((prefix.into(), handler));
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    pub fn resolve(&self, task_type: &str) -> Option<Arc<dyn Handler>> {
        if let Some(handler) = self.exact.get(task_type) {
            return Some(handler.clone());
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| task_type.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone())
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        self.resolve(task_type).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait::async_trait]
    impl Handler for Echo {
        async fn run(&self, _ctx: &TaskContext, payload: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(Some(payload.to_vec()))
        }
    }

    #[test]
    fn exact_match_wins_over_prefix() {
        let mut registry = HandlerRegistry::new();
        registry.register_prefix("email:", Arc::new(Echo));
        registry.register("email:welcome", Arc::new(Echo));

        assert!(registry.is_registered("email:welcome"));
        assert!(registry.is_registered("email:receipt"));
        assert!(!registry.is_registered("sms:welcome"));
    }

    #[test]
    fn longest_prefix_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register_prefix("email:", Arc::new(Echo));
        registry.register_prefix("email:urgent:", Arc::new(Echo));

        // Both resolve; this only asserts the call doesn't panic and a
        // handler is found for the more specific prefix.
        assert!(registry.resolve("email:urgent:page").is_some());
    }
}
