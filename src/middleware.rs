//! Ordered hooks around every unary call.
//!
//! Hooks run in registration order on the way down and in reverse on the
//! way up. A hook either awaits `next.run(ctx)` exactly once, or
//! short-circuits by returning a response without calling it. A hook error
//! aborts the chain and is surfaced classified.

use crate::error::{Error, ErrorKind};
use crate::registry::Binding;
use crate::types::{ChatRequest, ChatResponse};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Shared mutable state for one call, visible to every hook. The innermost
/// step fills `response` or `error` before unwinding, so hooks after
/// `next.run` observe the outcome.
#[derive(Debug)]
pub struct CallContext {
    pub binding: Binding,
    pub request: ChatRequest,
    pub request_id: String,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    pub response: Option<ChatResponse>,
    pub error: Option<ErrorKind>,
}

impl CallContext {
    pub(crate) fn new(binding: Binding, request: ChatRequest, request_id: String) -> Self {
        Self {
            binding,
            request,
            request_id,
            started_at: Instant::now(),
            ended_at: None,
            response: None,
            error: None,
        }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut CallContext, next: Next<'_>) -> Result<ChatResponse, Error>;
}

/// The innermost step of the chain (the reliability stack, in production).
#[async_trait]
pub(crate) trait Endpoint: Send + Sync {
    async fn call(&self, ctx: &mut CallContext) -> Result<ChatResponse, Error>;
}

/// Remainder of the chain from one hook's point of view.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Endpoint) -> Self {
        Self { chain, endpoint }
    }

    pub async fn run(self, ctx: &mut CallContext) -> Result<ChatResponse, Error> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(ctx, Next { chain: rest, endpoint: self.endpoint }).await
            }
            None => self.endpoint.call(ctx).await,
        }
    }
}
