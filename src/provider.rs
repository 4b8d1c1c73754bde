//! The capability each provider implements.
//!
//! Providers translate the uniform chat types to a vendor protocol and
//! nothing else: retry, rate limiting, and circuit breaking all live in the
//! orchestrator. A provider must treat `opts.cancel` as authoritative and
//! stop work promptly once it fires.

use crate::error::Error;
use crate::types::{ChatDelta, ChatRequest, ChatResponse};
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// Per-1K-token pricing used for cost accounting when the provider does not
/// report `cost_usd` itself.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PriceTable {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl PriceTable {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self { input_per_1k, output_per_1k }
    }

    /// Combined per-1K rate used by cheapest-binding selection.
    pub fn combined(&self) -> f64 {
        self.input_per_1k + self.output_per_1k
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 / 1000.0 * self.input_per_1k
            + output_tokens as f64 / 1000.0 * self.output_per_1k
    }
}

/// Options passed into every provider call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Fires on caller cancellation or when the per-attempt deadline
    /// elapses. The orchestrator guarantees it is not already triggered
    /// when the call starts.
    pub cancel: CancellationToken,
}

/// Lazy sequence of streaming frames.
pub type ChatStream = BoxStream<'static, Result<ChatDelta, Error>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Unique key within the orchestrator's provider map.
    fn id(&self) -> &str;

    async fn chat(&self, req: &ChatRequest, opts: &CallOptions) -> Result<ChatResponse, Error>;

    /// Streaming chat. Providers without a streaming path keep the default,
    /// which the orchestrator surfaces as a non-retryable client error.
    async fn stream(&self, _req: &ChatRequest, _opts: &CallOptions) -> Result<ChatStream, Error> {
        Err(Error::new(
            crate::error::ErrorKind::ClientError,
            format!("provider {:?} does not support streaming", self.id()),
        ))
    }

    /// Provider-level default pricing; per-model registry pricing wins.
    fn price(&self) -> Option<PriceTable> {
        None
    }
}
