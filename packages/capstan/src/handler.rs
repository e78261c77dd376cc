//! Topic-keyed message handlers and their registry.
//!
//! Handlers receive a claimed message plus a cancellation-aware context and
//! return success, a transient failure (retry with backoff), or a permanent
//! failure (dead-letter). Handlers MUST be idempotent with respect to the
//! message's dedup id: at-least-once delivery means redelivery after a
//! crash or lease expiry is normal.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordinationError, HandlerFailure};
use crate::workqueue::ClaimedMessage;

/// The handler-facing view of a claimed row, uniform across stores.
#[derive(Debug, Clone)]
pub struct DispatchMessage {
    /// Row id rendered to text (uuid for outbox/timers/runs, the raw
    /// producer id for inbox rows).
    pub id: String,
    pub topic: String,
    pub payload: Value,
    pub dedup_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Completed prior attempts; 0 on first delivery.
    pub attempt: i32,
}

impl DispatchMessage {
    pub(crate) fn from_claimed<Id: std::fmt::Display>(claimed: &ClaimedMessage<Id>) -> Self {
        Self {
            id: claimed.id.to_string(),
            topic: claimed.topic.clone(),
            payload: claimed.payload.clone(),
            dedup_id: claimed.dedup_id.clone(),
            correlation_id: claimed.correlation_id.clone(),
            attempt: claimed.attempt,
        }
    }
}

/// Ambient context for one handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Cancelled on shutdown or on lease loss. Handlers doing long work
    /// must observe it; whatever they wrote before cancellation must be
    /// safe to redo.
    pub cancellation: CancellationToken,
    /// Name of the queue the message was claimed from.
    pub queue: &'static str,
}

/// A message handler for one topic.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        message: DispatchMessage,
        ctx: HandlerContext,
    ) -> Result<(), HandlerFailure>;
}

/// Adapts an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(DispatchMessage, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerFailure>> + Send,
{
    FnHandler { f }
}

/// See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(DispatchMessage, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerFailure>> + Send,
{
    async fn handle(
        &self,
        message: DispatchMessage,
        ctx: HandlerContext,
    ) -> Result<(), HandlerFailure> {
        (self.f)(message, ctx).await
    }
}

/// Topic → handler map shared by all dispatcher loops.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Registers a handler for `topic`. Registering a topic twice is a
    /// wiring bug and is rejected.
    pub fn register(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), CoordinationError> {
        let topic = topic.into();
        match self.handlers.entry(topic.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CoordinationError::HandlerAlreadyRegistered { topic })
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(handler);
                Ok(())
            }
        }
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(topic).map(|entry| Arc::clone(entry.value()))
    }

    pub fn topics(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
