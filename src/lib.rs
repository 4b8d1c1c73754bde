#![forbid(unsafe_code)]

//! # modelmux
//!
//! A multi-provider LLM request router. One uniform `chat` surface resolves
//! a logical model name (or an explicit provider/model pair) to a binding
//! and runs the call through token-bucket admission, circuit breaking,
//! retry with jittered exponential backoff, and a per-attempt deadline,
//! with structured events and cumulative cost accounting. Composite call
//! shapes build on the same path: ordered **fallback**, first-success
//! **race**, and a bounded-concurrency **map**.
//!
//! ## Features
//!
//! - **Selection policies** (first, round-robin, cheapest) over aliased
//!   model registrations
//! - **Per-binding token buckets** with burst and cancellable waits
//! - **Per-binding circuit breakers** with half-open probing
//! - **Retry** honoring provider retry-after hints
//! - **Middleware onion** around every unary call
//! - **Typed events** delivered non-blocking to fixed observers
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use modelmux::{
//!     CallOptions, ChatProvider, ChatRequest, ChatResponse, Error, Message,
//!     ModelEntry, Orchestrator, ProviderRegistry, SelectionPolicy, TokenUsage,
//! };
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ChatProvider for Echo {
//!     fn id(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn chat(
//!         &self,
//!         req: &ChatRequest,
//!         _opts: &CallOptions,
//!     ) -> Result<ChatResponse, Error> {
//!         Ok(ChatResponse {
//!             content: req.messages.last().unwrap().content.clone(),
//!             usage: TokenUsage { input: Some(3), output: Some(3) },
//!             cost_usd: None,
//!             provider: self.id().to_string(),
//!             model: req.model.clone(),
//!             raw: None,
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = ProviderRegistry::new(SelectionPolicy::Cheapest);
//!     registry.add(
//!         "echo",
//!         vec![ModelEntry::new("echo-1").alias("fast").price(0.001, 0.002)],
//!     );
//!
//!     let orch = Orchestrator::builder()
//!         .provider(Arc::new(Echo))
//!         .registry(registry)
//!         .build()?;
//!
//!     let response = orch
//!         .chat(ChatRequest::new("fast", vec![Message::user("hello")]))
//!         .await?;
//!     assert_eq!(response.content, "hello");
//!     assert!(orch.total_cost_usd() > 0.0);
//!     Ok(())
//! }
//! ```

mod breaker;
mod clock;
mod cost;
mod error;
mod events;
mod fallback;
mod fanout;
mod jitter;
mod limiter;
mod middleware;
mod orchestrator;
mod provider;
mod race;
mod registry;
mod retry;
mod sleeper;
mod types;

// Re-exports
pub use breaker::{BreakerConfig, CircuitState};
pub use clock::{Clock, MonotonicClock};
pub use error::{BuildError, Error, ErrorKind};
pub use events::{observer, EventRecord, EventSink};
pub use fallback::Fallback;
pub use fanout::{map, MapOptions};
pub use jitter::Jitter;
pub use limiter::RateLimit;
pub use middleware::{CallContext, Middleware, Next};
pub use orchestrator::{ChatArgs, Orchestrator, OrchestratorBuilder};
pub use provider::{CallOptions, ChatProvider, ChatStream, PriceTable};
pub use race::Race;
pub use registry::{Binding, ModelEntry, ProviderRegistry, SelectionPolicy, Spec};
pub use retry::RetryPolicy;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use types::{ChatDelta, ChatRequest, ChatResponse, Message, Role, TokenUsage};

pub mod prelude;
