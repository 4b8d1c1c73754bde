//! Convenient re-exports for common modelmux types.
pub use crate::{
    breaker::{BreakerConfig, CircuitState},
    error::{BuildError, Error, ErrorKind},
    events::{observer, EventRecord, EventSink},
    jitter::Jitter,
    limiter::RateLimit,
    middleware::{CallContext, Middleware, Next},
    orchestrator::{ChatArgs, Orchestrator, OrchestratorBuilder},
    provider::{CallOptions, ChatProvider, ChatStream, PriceTable},
    registry::{Binding, ModelEntry, ProviderRegistry, SelectionPolicy, Spec},
    retry::RetryPolicy,
    types::{ChatDelta, ChatRequest, ChatResponse, Message, Role, TokenUsage},
    MapOptions,
};
